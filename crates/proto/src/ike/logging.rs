//! Structured logging for IKE session events
//!
//! Contextual logging helpers on the `tracing` framework. SPIs are
//! hex-encoded; key material never reaches these functions.

use tracing::{debug, info, trace, warn};

/// Log an IKE Session state transition
pub fn log_ike_state_transition(spi_i: &[u8], spi_r: &[u8], old_state: &str, new_state: &str) {
    info!(
        ike_spi_i = %hex::encode(spi_i),
        ike_spi_r = %hex::encode(spi_r),
        state_from = old_state,
        state_to = new_state,
        "IKE session state transition"
    );
}

/// Log a Child Session state transition
pub fn log_child_state_transition(local_spi: u32, old_state: &str, new_state: &str) {
    debug!(
        child_spi = local_spi,
        state_from = old_state,
        state_to = new_state,
        "Child session state transition"
    );
}

/// Log an outbound request
pub fn log_request_sent(exchange: &str, message_id: u32, size_bytes: usize) {
    trace!(
        exchange = exchange,
        message_id = message_id,
        size_bytes = size_bytes,
        "IKE request sent"
    );
}

/// Log a retransmission
pub fn log_retransmit(message_id: u32, attempt: u32) {
    warn!(
        message_id = message_id,
        attempt = attempt,
        "Retransmitting unacknowledged IKE request"
    );
}

/// Log a dropped inbound message
pub fn log_message_dropped(message_id: u32, reason: &str) {
    debug!(
        message_id = message_id,
        reason = reason,
        "Inbound IKE message dropped"
    );
}

/// Log Child SA creation
pub fn log_child_sa_created(local_spi: u32, remote_spi: u32, is_transport: bool) {
    info!(
        child_spi_in = local_spi,
        child_spi_out = remote_spi,
        transport = is_transport,
        "Child SA established"
    );
}

/// Log Child SA deletion
pub fn log_child_sa_deleted(local_spi: u32, reason: &str) {
    info!(child_spi = local_spi, reason = reason, "Child SA deleted");
}

/// Log a Child SA rekey
pub fn log_child_rekey(old_spi: u32, new_spi: u32) {
    info!(
        old_child_spi = old_spi,
        new_child_spi = new_spi,
        "Child SA rekeyed"
    );
}

/// Log an IKE SA rekey
pub fn log_ike_rekey(old_spi_i: &[u8], new_spi_i: &[u8]) {
    info!(
        old_spi_i = %hex::encode(old_spi_i),
        new_spi_i = %hex::encode(new_spi_i),
        "IKE SA rekeyed"
    );
}

/// Log the result of a simultaneous-rekey tie-break
pub fn log_rekey_tie_break(local_wins: bool) {
    info!(
        local_wins = local_wins,
        "Simultaneous rekey resolved by nonce tie-break"
    );
}

/// Log NAT detection outcome
pub fn log_nat_detection(local_behind_nat: bool, remote_behind_nat: bool) {
    info!(
        local_behind_nat = local_behind_nat,
        remote_behind_nat = remote_behind_nat,
        "NAT detection completed"
    );
}

/// Log a protocol error
pub fn log_protocol_error(context: &str, error: &str) {
    warn!(context = context, error = error, "IKE protocol error");
}
