//! EAP authentication sub-state machine (RFC 3748)
//!
//! Runs inside IKE_AUTH: the IKE session feeds it the raw EAP packets it
//! receives from the peer and sends back whatever this machine produces.
//!
//! ```text
//! Created ──Request/Identity──▶ Identity ──method Request──▶ Method
//!    │                                                          │
//!    └───────────method Request (skips Identity)────────────────┤
//!                                                               ▼
//!                                          Success(msk, emsk) / Failure
//! ```
//!
//! Notification requests are echoed in any state without a transition.
//! At most one method is active; a request for a different method type
//! is answered with a legacy Nak listing the single configured method.

pub mod message;
pub mod sim_aka;

use krait_platform::{SimAppType, SimAuthProvider};
use message::{
    EapCode, EapMessage, TYPE_AKA, TYPE_AKA_PRIME, TYPE_IDENTITY, TYPE_NAK, TYPE_NOTIFICATION,
    TYPE_SIM,
};
use sim_aka::MethodStateMachine;
use std::fmt;
use std::sync::Arc;

/// Errors surfaced by the EAP machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapError {
    /// Input that is not a valid request in the current state
    InvalidRequest(String),

    /// Packet violates the EAP wire format
    InvalidSyntax(String),

    /// SIM authentication failed
    AuthFailure(String),

    /// Internal fault
    Internal(String),
}

impl fmt::Display for EapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EapError::InvalidRequest(msg) => write!(f, "Invalid EAP request: {}", msg),
            EapError::InvalidSyntax(msg) => write!(f, "Invalid EAP syntax: {}", msg),
            EapError::AuthFailure(msg) => write!(f, "EAP authentication failure: {}", msg),
            EapError::Internal(msg) => write!(f, "EAP internal error: {}", msg),
        }
    }
}

impl std::error::Error for EapError {}

/// Outcome of feeding one packet to the machine
#[derive(Debug)]
pub enum EapResult {
    /// A response packet to send to the peer
    Response(Vec<u8>),

    /// Authentication succeeded; session keys produced
    Success {
        /// Master Session Key (64 bytes)
        msk: Vec<u8>,
        /// Extended Master Session Key (64 bytes)
        emsk: Vec<u8>,
    },

    /// The peer signalled failure
    Failure,

    /// The packet could not be processed
    Error(EapError),
}

/// Configured EAP method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EapMethodType {
    /// EAP-SIM (RFC 4186)
    Sim,
    /// EAP-AKA (RFC 4187)
    Aka,
    /// EAP-AKA' (RFC 5448)
    AkaPrime,
}

impl EapMethodType {
    /// EAP type byte of this method
    pub fn type_byte(self) -> u8 {
        match self {
            EapMethodType::Sim => TYPE_SIM,
            EapMethodType::Aka => TYPE_AKA,
            EapMethodType::AkaPrime => TYPE_AKA_PRIME,
        }
    }

    /// SIM application used for this method
    pub fn app_type(self) -> SimAppType {
        match self {
            EapMethodType::Sim => SimAppType::Sim,
            EapMethodType::Aka | EapMethodType::AkaPrime => SimAppType::Usim,
        }
    }
}

/// EAP configuration consumed at session creation
#[derive(Debug, Clone)]
pub struct EapSessionConfig {
    /// Selected method
    pub method: EapMethodType,

    /// Identity override; when absent the SIM identity is used
    pub eap_identity: Option<Vec<u8>>,
}

/// Machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EapState {
    /// No packet processed yet
    Created,
    /// Identity sent, waiting for a method request
    Identity,
    /// A method exchange is running
    Method,
    /// Terminal: keys delivered
    Success,
    /// Terminal: peer reported failure
    Failure,
}

/// The EAP authenticator-facing state machine (peer side).
pub struct EapStateMachine {
    config: EapSessionConfig,
    sim: Arc<dyn SimAuthProvider>,
    state: EapState,
    method: Option<MethodStateMachine>,
}

impl EapStateMachine {
    /// Create a machine in `Created`.
    pub fn new(config: EapSessionConfig, sim: Arc<dyn SimAuthProvider>) -> Self {
        EapStateMachine {
            config,
            sim,
            state: EapState::Created,
            method: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> EapState {
        self.state
    }

    /// Consume one raw EAP packet.
    pub fn process(&mut self, packet: &[u8]) -> EapResult {
        let message = match EapMessage::decode(packet) {
            Ok(message) => message,
            Err(e) => return EapResult::Error(e),
        };

        match message.code {
            EapCode::Success => self.process_success(),
            EapCode::Failure => self.process_failure(),
            EapCode::Request => self.process_request(&message, packet),
            EapCode::Response => EapResult::Error(EapError::InvalidRequest(
                "received an EAP response from the peer".into(),
            )),
        }
    }

    fn process_success(&mut self) -> EapResult {
        let keys = self.method.as_mut().and_then(MethodStateMachine::take_keys);
        match keys {
            Some(keys) if self.state == EapState::Method => {
                self.state = EapState::Success;
                tracing::info!(method = ?self.config.method, "EAP authentication succeeded");
                EapResult::Success {
                    msk: keys.msk.clone(),
                    emsk: keys.emsk.clone(),
                }
            }
            _ => EapResult::Error(EapError::InvalidRequest(
                "EAP-Success without completed method exchange".into(),
            )),
        }
    }

    fn process_failure(&mut self) -> EapResult {
        if self.state != EapState::Method {
            return EapResult::Error(EapError::InvalidRequest(
                "EAP-Failure outside a method exchange".into(),
            ));
        }
        self.state = EapState::Failure;
        tracing::warn!(method = ?self.config.method, "EAP authentication failed");
        EapResult::Failure
    }

    fn process_request(&mut self, message: &EapMessage, packet: &[u8]) -> EapResult {
        let method_type = match message.method_type() {
            Some(t) => t,
            None => {
                return EapResult::Error(EapError::InvalidSyntax(
                    "request without a type".into(),
                ))
            }
        };

        if method_type == TYPE_NAK {
            // Nak is response-only
            return EapResult::Error(EapError::InvalidRequest(
                "Nak received as a request".into(),
            ));
        }

        if method_type == TYPE_NOTIFICATION {
            // Echoed in any state, no transition
            return EapResult::Response(
                EapMessage::response(message.identifier, TYPE_NOTIFICATION, Vec::new()).encode(),
            );
        }

        match self.state {
            EapState::Created | EapState::Identity => {
                if method_type == TYPE_IDENTITY {
                    return self.identity_response(message.identifier);
                }
                if method_type == self.config.method.type_byte() {
                    return self.enter_method(message, packet);
                }
                // Unsupported method offered: answer with a legacy Nak
                // listing the single configured type
                EapResult::Response(
                    EapMessage::response(
                        message.identifier,
                        TYPE_NAK,
                        vec![self.config.method.type_byte()],
                    )
                    .encode(),
                )
            }
            EapState::Method => {
                let method = self.method.as_mut().expect("method machine in Method state");
                if method_type != method.method_type() {
                    // A different method mid-exchange: Nak, no transition
                    return EapResult::Response(
                        EapMessage::response(
                            message.identifier,
                            TYPE_NAK,
                            vec![self.config.method.type_byte()],
                        )
                        .encode(),
                    );
                }
                match method.process(message, packet) {
                    Ok(response) => EapResult::Response(response),
                    Err(e) => EapResult::Error(e),
                }
            }
            EapState::Success | EapState::Failure => EapResult::Error(EapError::InvalidRequest(
                "request after EAP completion".into(),
            )),
        }
    }

    fn identity_response(&mut self, identifier: u8) -> EapResult {
        let identity = match self.identity() {
            Ok(identity) => identity,
            Err(e) => return EapResult::Error(e),
        };
        self.state = EapState::Identity;
        EapResult::Response(EapMessage::response(identifier, TYPE_IDENTITY, identity).encode())
    }

    fn enter_method(&mut self, message: &EapMessage, packet: &[u8]) -> EapResult {
        let identity = match self.identity() {
            Ok(identity) => identity,
            Err(e) => return EapResult::Error(e),
        };

        let mut method = MethodStateMachine::new(
            self.config.method.type_byte(),
            identity,
            self.sim.clone(),
            &mut rand::rngs::OsRng,
        );

        match method.process(message, packet) {
            Ok(response) => {
                self.state = EapState::Method;
                self.method = Some(method);
                EapResult::Response(response)
            }
            Err(e) => EapResult::Error(e),
        }
    }

    fn identity(&self) -> Result<Vec<u8>, EapError> {
        if let Some(identity) = &self.config.eap_identity {
            return Ok(identity.clone());
        }
        self.sim
            .identity(self.config.method.app_type())
            .map_err(|e| EapError::AuthFailure(e.to_string()))
    }
}

impl fmt::Debug for EapStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EapStateMachine")
            .field("state", &self.state)
            .field("method", &self.config.method)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krait_platform::{KraitResult, SimAuthResponse, SimChallenge};

    struct FakeSim;

    impl SimAuthProvider for FakeSim {
        fn identity(&self, _app_type: SimAppType) -> KraitResult<Vec<u8>> {
            Ok(b"0test@example.org".to_vec())
        }

        fn authenticate(
            &self,
            _app_type: SimAppType,
            _challenge: SimChallenge<'_>,
        ) -> KraitResult<SimAuthResponse> {
            Ok(SimAuthResponse::Gsm {
                sres: [0x11; 4],
                kc: [0x22; 8],
            })
        }
    }

    const REQUEST_IDENTITY: [u8; 5] = [0x01, 0x10, 0x00, 0x05, 0x01];
    const REQUEST_NOTIFICATION: [u8; 5] = [0x01, 0x10, 0x00, 0x05, 0x02];
    const REQUEST_NAK: [u8; 5] = [0x01, 0x10, 0x00, 0x05, 0x03];
    const RESPONSE_NOTIFICATION: [u8; 5] = [0x02, 0x10, 0x00, 0x05, 0x02];

    fn machine(method: EapMethodType) -> EapStateMachine {
        EapStateMachine::new(
            EapSessionConfig {
                method,
                eap_identity: None,
            },
            Arc::new(FakeSim),
        )
    }

    fn sim_start_request() -> Vec<u8> {
        let mut packet = vec![0x01, 0x20, 0x00, 0x00, TYPE_SIM, 10, 0, 0];
        // AT_VERSION_LIST: actual length 2, version 1
        packet.extend_from_slice(&[15, 2, 0, 2, 0, 1, 0, 0]);
        let length = (packet.len() as u16).to_be_bytes();
        packet[2] = length[0];
        packet[3] = length[1];
        packet
    }

    #[test]
    fn test_created_identity_request_advances() {
        let mut machine = machine(EapMethodType::Sim);

        let result = machine.process(&REQUEST_IDENTITY);
        assert_eq!(machine.state(), EapState::Identity);
        match result {
            EapResult::Response(packet) => {
                let message = EapMessage::decode(&packet).unwrap();
                assert_eq!(message.code, EapCode::Response);
                assert_eq!(message.method_type(), Some(TYPE_IDENTITY));
                let (_, data) = message.type_data.unwrap();
                assert_eq!(data, b"0test@example.org");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_created_notification_echoed_without_transition() {
        let mut machine = machine(EapMethodType::Sim);

        let result = machine.process(&REQUEST_NOTIFICATION);
        assert_eq!(machine.state(), EapState::Created);
        match result {
            EapResult::Response(packet) => {
                let message = EapMessage::decode(&packet).unwrap();
                assert_eq!(message.code, EapCode::Response);
                assert_eq!(message.method_type(), Some(TYPE_NOTIFICATION));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_created_nak_request_is_invalid() {
        let mut machine = machine(EapMethodType::Sim);

        let result = machine.process(&REQUEST_NAK);
        assert!(matches!(
            result,
            EapResult::Error(EapError::InvalidRequest(_))
        ));
        assert_eq!(machine.state(), EapState::Created);
    }

    #[test]
    fn test_created_non_request_is_invalid() {
        let mut machine = machine(EapMethodType::Sim);

        let result = machine.process(&RESPONSE_NOTIFICATION);
        assert!(matches!(
            result,
            EapResult::Error(EapError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_created_method_request_skips_identity() {
        let mut machine = machine(EapMethodType::Sim);

        let result = machine.process(&sim_start_request());
        assert_eq!(machine.state(), EapState::Method);
        assert!(matches!(result, EapResult::Response(_)));
    }

    #[test]
    fn test_identity_unsupported_method_naks() {
        let mut machine = machine(EapMethodType::Aka);
        machine.process(&REQUEST_IDENTITY);
        assert_eq!(machine.state(), EapState::Identity);

        // Server offers EAP-SIM, we are configured for EAP-AKA
        let result = machine.process(&sim_start_request());
        assert_eq!(machine.state(), EapState::Identity);
        match result {
            EapResult::Response(packet) => {
                let message = EapMessage::decode(&packet).unwrap();
                assert_eq!(message.method_type(), Some(TYPE_NAK));
                let (_, data) = message.type_data.unwrap();
                assert_eq!(data, vec![TYPE_AKA]);
            }
            other => panic!("expected Nak, got {:?}", other),
        }
    }

    #[test]
    fn test_method_switch_naks_without_transition() {
        let mut machine = machine(EapMethodType::Sim);
        machine.process(&sim_start_request());
        assert_eq!(machine.state(), EapState::Method);

        // Peer switches to AKA mid-method
        let mut aka = vec![0x01, 0x21, 0x00, 0x08, TYPE_AKA, 1, 0, 0];
        let length = (aka.len() as u16).to_be_bytes();
        aka[2] = length[0];
        aka[3] = length[1];

        let result = machine.process(&aka);
        assert_eq!(machine.state(), EapState::Method);
        match result {
            EapResult::Response(packet) => {
                let message = EapMessage::decode(&packet).unwrap();
                assert_eq!(message.method_type(), Some(TYPE_NAK));
            }
            other => panic!("expected Nak, got {:?}", other),
        }
    }

    #[test]
    fn test_premature_success_is_error() {
        let mut machine = machine(EapMethodType::Sim);

        let result = machine.process(&[0x03, 0x01, 0x00, 0x04]);
        assert!(matches!(
            result,
            EapResult::Error(EapError::InvalidRequest(_))
        ));
        assert_eq!(machine.state(), EapState::Created);
    }

    #[test]
    fn test_premature_failure_is_error() {
        let mut machine = machine(EapMethodType::Sim);

        let result = machine.process(&[0x04, 0x01, 0x00, 0x04]);
        assert!(matches!(
            result,
            EapResult::Error(EapError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_failure_in_method_terminates() {
        let mut machine = machine(EapMethodType::Sim);
        machine.process(&sim_start_request());
        assert_eq!(machine.state(), EapState::Method);

        let result = machine.process(&[0x04, 0x30, 0x00, 0x04]);
        assert!(matches!(result, EapResult::Failure));
        assert_eq!(machine.state(), EapState::Failure);
    }

    #[test]
    fn test_malformed_packet_is_syntax_error() {
        let mut machine = machine(EapMethodType::Sim);
        let result = machine.process(&[0x01, 0x02]);
        assert!(matches!(
            result,
            EapResult::Error(EapError::InvalidSyntax(_))
        ));
    }
}
