//! IKE Session orchestration
//!
//! The state machines live in [`ike`] and [`child`]; this module adds the
//! single-threaded event loop around them. All protocol progress - timer
//! firings, inbound datagrams, user commands - is dispatched as messages
//! on one tokio task per IKE Session, so no state is ever mutated outside
//! a handler. User callbacks run on the caller-supplied executor, never
//! on the protocol loop.

pub mod auth;
pub mod child;
pub mod ike;
pub mod queue;
pub mod retransmit;

pub use child::{ChildCryptoCtx, ChildSession, ChildSessionCallback, ChildState};
pub use ike::{classify_inbound_request, IkeExchangeSubType, IkeSessionCallback, IkeSessionCore, IkeSessionState};
pub use queue::{LocalRequest, LocalRequestKind, LocalRequestQueue};
pub use retransmit::{
    ExchangePurpose, PendingExchange, RetransmitAction, RETRANSMIT_BASE_MS,
    RETRANSMIT_MAX_ATTEMPTS, RETRANSMIT_MULTIPLIER,
};

use crate::ike::config::ChildSessionConfig;
use krait_platform::{Clock, DatagramSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Fallback wake interval when no deadline is pending (milliseconds)
const IDLE_TICK_MS: u64 = 60_000;

/// Commands posted from user threads onto the session loop.
pub enum SessionCommand {
    /// Negotiate an additional Child SA
    OpenChild {
        /// Child configuration
        config: ChildSessionConfig,
        /// Child callbacks
        callback: Arc<dyn ChildSessionCallback>,
    },
    /// Delete the child owning this local SPI
    CloseChild {
        /// Local SPI
        local_spi: u32,
    },
    /// Rekey the child owning this local SPI
    RekeyChild {
        /// Local SPI
        local_spi: u32,
    },
    /// Rekey the IKE SA
    RekeyIke,
    /// Run an empty INFORMATIONAL exchange (liveness)
    CheckLiveness,
    /// Graceful close (Delete-IKE exchange)
    Close,
    /// Force close without network traffic
    Kill,
}

/// Handle to a running IKE Session task.
///
/// Cheap to clone; dropping every handle does not stop the session - use
/// [`IkeSession::close`] or [`IkeSession::kill`].
#[derive(Clone)]
pub struct IkeSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    datagrams: mpsc::UnboundedSender<Vec<u8>>,
}

impl IkeSession {
    /// Spawn the session loop and kick off IKE_SA_INIT.
    ///
    /// Inbound datagrams are injected through the sender returned by
    /// [`IkeSession::datagram_sender`]; the transport implementation owns
    /// the receive path.
    pub fn spawn(
        mut core: IkeSessionCore,
        socket: Arc<dyn DatagramSocket>,
        remote_addr: std::net::SocketAddr,
        clock: Arc<dyn Clock>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<SessionCommand>();
        let (datagram_tx, mut datagram_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let handle = tokio::spawn(async move {
            if core.start().is_err() {
                core.kill();
            }
            flush(&mut core, socket.as_ref(), remote_addr).await;

            while !core.is_closed() {
                let now = clock.now_millis();
                let sleep_ms = core
                    .next_deadline_ms()
                    .map(|deadline| deadline.saturating_sub(now))
                    .unwrap_or(IDLE_TICK_MS)
                    .max(1);

                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(command) => apply_command(&mut core, command),
                        None => core.kill(),
                    },
                    datagram = datagram_rx.recv() => match datagram {
                        Some(datagram) => core.handle_datagram(&datagram),
                        None => core.kill(),
                    },
                    _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {
                        core.handle_tick();
                    }
                }

                flush(&mut core, socket.as_ref(), remote_addr).await;
            }
        });

        (
            IkeSession {
                commands: command_tx,
                datagrams: datagram_tx,
            },
            handle,
        )
    }

    /// Sender for injecting received datagrams into the session loop.
    pub fn datagram_sender(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.datagrams.clone()
    }

    /// Negotiate an additional Child SA.
    pub fn open_child(
        &self,
        config: ChildSessionConfig,
        callback: Arc<dyn ChildSessionCallback>,
    ) {
        let _ = self
            .commands
            .send(SessionCommand::OpenChild { config, callback });
    }

    /// Delete the child owning this local SPI.
    pub fn close_child(&self, local_spi: u32) {
        let _ = self.commands.send(SessionCommand::CloseChild { local_spi });
    }

    /// Rekey the child owning this local SPI.
    pub fn rekey_child(&self, local_spi: u32) {
        let _ = self.commands.send(SessionCommand::RekeyChild { local_spi });
    }

    /// Rekey the IKE SA.
    pub fn rekey_ike(&self) {
        let _ = self.commands.send(SessionCommand::RekeyIke);
    }

    /// Run a liveness check.
    pub fn check_liveness(&self) {
        let _ = self.commands.send(SessionCommand::CheckLiveness);
    }

    /// Close gracefully with a Delete-IKE exchange.
    pub fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }

    /// Force close without network traffic.
    pub fn kill(&self) {
        let _ = self.commands.send(SessionCommand::Kill);
    }
}

fn apply_command(core: &mut IkeSessionCore, command: SessionCommand) {
    match command {
        SessionCommand::OpenChild { config, callback } => {
            core.open_child(config, callback);
        }
        SessionCommand::CloseChild { local_spi } => core.close_child(local_spi),
        SessionCommand::RekeyChild { local_spi } => core.rekey_child(local_spi),
        SessionCommand::RekeyIke => core.rekey_ike(),
        SessionCommand::CheckLiveness => core.check_liveness(),
        SessionCommand::Close => core.close(),
        SessionCommand::Kill => core.kill(),
    }
}

async fn flush(
    core: &mut IkeSessionCore,
    socket: &dyn DatagramSocket,
    remote_addr: std::net::SocketAddr,
) {
    for datagram in core.take_outbox() {
        if let Err(e) = socket.send(remote_addr, &datagram).await {
            tracing::warn!(error = %e, "failed to send IKE datagram");
        }
    }
}
