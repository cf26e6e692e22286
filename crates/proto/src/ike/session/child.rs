//! Child Session state machine
//!
//! Tracks one Child SA through create, rekey (either side initiated) and
//! delete. The session never touches the wire itself: handlers consume
//! payload lists routed in by the owning IKE session and produce payload
//! lists for it to send, mirroring the request/response discipline of
//! CREATE_CHILD_SA and INFORMATIONAL exchanges.
//!
//! Remote-initiated rekey staggers transform installation: the inbound
//! transform of the new SA is installed when the SA is created, the
//! outbound transform only once the peer's Delete of the old SA is
//! observed, so outbound traffic never hits an SA the peer has already
//! stopped accepting.

use crate::ike::config::ChildSessionConfig;
use crate::ike::constants::{NotifyType, ProtocolId};
use crate::ike::crypto::PrfAlgorithm;
use crate::ike::logging;
use crate::ike::message::{DeletePayload, IkePayload, NoncePayload, NotifyPayload, SaPayload};
use crate::ike::proposal::{self, Proposal, TransformType};
use crate::ike::sa_record::{ChildSaKeys, ChildSaRecord};
use crate::ike::{IkeError, Result};
use krait_platform::{
    CallbackExecutor, IpsecTransformInstaller, OwnedTransform, TransformDirection,
    TransformRequest,
};
use rand::RngCore;
use std::net::IpAddr;
use std::sync::Arc;

/// Nonce size used in CREATE_CHILD_SA exchanges
const CHILD_NONCE_LEN: usize = 32;

/// Child Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Created, no SA negotiated yet
    Initial,
    /// Local create request in flight
    CreateChildLocalCreate,
    /// SA established, no procedure ongoing
    Idle,
    /// Local delete request in flight
    DeleteChildLocalDelete,
    /// Handling a peer-initiated delete
    DeleteChildRemoteDelete,
    /// Local rekey create request in flight
    RekeyChildLocalCreate,
    /// Handling a peer-initiated rekey create
    RekeyChildRemoteCreate,
    /// Local rekey: deleting the replaced SA
    RekeyChildLocalDelete,
    /// Remote rekey: awaiting the peer's delete of the old SA
    RekeyChildRemoteDelete,
    /// Terminal
    Closed,
}

impl ChildState {
    fn name(self) -> &'static str {
        match self {
            ChildState::Initial => "Initial",
            ChildState::CreateChildLocalCreate => "CreateChildLocalCreate",
            ChildState::Idle => "Idle",
            ChildState::DeleteChildLocalDelete => "DeleteChildLocalDelete",
            ChildState::DeleteChildRemoteDelete => "DeleteChildRemoteDelete",
            ChildState::RekeyChildLocalCreate => "RekeyChildLocalCreate",
            ChildState::RekeyChildRemoteCreate => "RekeyChildRemoteCreate",
            ChildState::RekeyChildLocalDelete => "RekeyChildLocalDelete",
            ChildState::RekeyChildRemoteDelete => "RekeyChildRemoteDelete",
            ChildState::Closed => "Closed",
        }
    }
}

/// User-facing Child Session callbacks, invoked on the callback executor.
pub trait ChildSessionCallback: Send + Sync {
    /// The Child SA is established and passing traffic
    fn on_opened(&self);

    /// The Child Session is closed
    fn on_closed(&self);

    /// The Child Session died of an error
    fn on_error(&self, error: IkeError);

    /// A kernel transform was installed for this child
    fn on_ipsec_transform_created(&self, transform_id: u64, direction: TransformDirection);

    /// A kernel transform was released for this child
    fn on_ipsec_transform_deleted(&self, transform_id: u64, direction: TransformDirection);
}

/// PRF context lent by the owning IKE session for key derivation.
pub struct ChildCryptoCtx<'a> {
    /// Negotiated IKE PRF
    pub prf: PrfAlgorithm,
    /// Current SK_d
    pub sk_d: &'a [u8],
}

/// Result of completing a create or rekey-create step.
#[derive(Debug)]
pub struct ChildCreateDone {
    /// Remote SPI that should now route to this session
    pub remote_spi: u32,
    /// Milliseconds until the soft-lifetime rekey should fire
    pub rekey_after_ms: u64,
}

/// In-flight local create/rekey bookkeeping
struct PendingCreate {
    local_spi: krait_platform::OwnedSpi,
    nonce_local: Vec<u8>,
    offered: Vec<Proposal>,
}

/// A peer rekey processed while our own rekey was in flight
struct SimultaneousRekey {
    remote_nonce: Vec<u8>,
    new_record: ChildSaRecord,
}

/// One Child Session.
pub struct ChildSession {
    state: ChildState,
    pub(crate) config: ChildSessionConfig,
    installer: Arc<dyn IpsecTransformInstaller>,
    callback: Arc<dyn ChildSessionCallback>,
    executor: Arc<dyn CallbackExecutor>,
    remote_addr: IpAddr,
    encap_socket: Option<u32>,

    record: Option<ChildSaRecord>,
    pending: Option<PendingCreate>,
    /// Old record kept alive through a rekey's delete phase
    retiring_record: Option<ChildSaRecord>,
    /// New record from a remote rekey, promoted after the old SA delete
    replacement_record: Option<ChildSaRecord>,
    /// Peer rekey raced against our own
    simultaneous: Option<SimultaneousRekey>,
}

impl ChildSession {
    /// Create a session in `Initial`.
    pub fn new(
        config: ChildSessionConfig,
        installer: Arc<dyn IpsecTransformInstaller>,
        callback: Arc<dyn ChildSessionCallback>,
        executor: Arc<dyn CallbackExecutor>,
        remote_addr: IpAddr,
        encap_socket: Option<u32>,
    ) -> Self {
        ChildSession {
            state: ChildState::Initial,
            config,
            installer,
            callback,
            executor,
            remote_addr,
            encap_socket,
            record: None,
            pending: None,
            retiring_record: None,
            replacement_record: None,
            simultaneous: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ChildState {
        self.state
    }

    /// Local SPI of the established SA, if any.
    pub fn local_spi(&self) -> Option<u32> {
        self.record.as_ref().map(ChildSaRecord::local_spi_value)
    }

    /// Local SPI of the create/rekey in flight, if any.
    pub fn pending_local_spi(&self) -> Option<u32> {
        self.pending.as_ref().map(|p| p.local_spi.spi())
    }

    /// Whether this session owns the given remote SPI (established,
    /// retiring or replacement record).
    pub fn owns_remote_spi(&self, remote_spi: u32) -> bool {
        self.record.as_ref().map(|r| r.remote_spi) == Some(remote_spi)
            || self.retiring_record.as_ref().map(|r| r.remote_spi) == Some(remote_spi)
            || self.replacement_record.as_ref().map(|r| r.remote_spi) == Some(remote_spi)
    }

    fn transition(&mut self, next: ChildState) {
        logging::log_child_state_transition(
            self.local_spi()
                .or_else(|| self.pending_local_spi())
                .unwrap_or(0),
            self.state.name(),
            next.name(),
        );
        self.state = next;
    }

    // ---- Create ----

    /// Build the SA-negotiation payloads for the first Child SA, carried
    /// inside IKE_AUTH (the exchange supplies nonces, so none is added).
    pub fn first_child_payloads(&mut self) -> Result<Vec<IkePayload>> {
        if self.state != ChildState::Initial {
            return Err(IkeError::InvalidState(format!(
                "cannot negotiate first child in state {:?}",
                self.state
            )));
        }

        let local_spi = self.installer.allocate_spi(self.remote_addr)?;
        let offered = self.offered_proposals(local_spi.spi());

        let mut payloads = vec![
            IkePayload::SA(SaPayload::new(offered.clone())),
            IkePayload::TSi(self.config.local_ts.clone()),
            IkePayload::TSr(self.config.remote_ts.clone()),
        ];
        self.append_notifies(&mut payloads);

        self.pending = Some(PendingCreate {
            local_spi,
            nonce_local: Vec::new(),
            offered,
        });
        self.transition(ChildState::CreateChildLocalCreate);
        Ok(payloads)
    }

    /// Build a CREATE_CHILD_SA request for an additional Child SA.
    pub fn start_create(&mut self, rng: &mut dyn RngCore) -> Result<Vec<IkePayload>> {
        if self.state != ChildState::Initial {
            return Err(IkeError::InvalidState(format!(
                "cannot create child in state {:?}",
                self.state
            )));
        }

        let local_spi = self.installer.allocate_spi(self.remote_addr)?;
        let offered = self.offered_proposals(local_spi.spi());
        let nonce = generate_nonce(rng);

        let mut payloads = vec![
            IkePayload::SA(SaPayload::new(offered.clone())),
            IkePayload::Nonce(NoncePayload::new(nonce.clone())?),
            IkePayload::TSi(self.config.local_ts.clone()),
            IkePayload::TSr(self.config.remote_ts.clone()),
        ];
        self.append_notifies(&mut payloads);

        self.pending = Some(PendingCreate {
            local_spi,
            nonce_local: nonce,
            offered,
        });
        self.transition(ChildState::CreateChildLocalCreate);
        Ok(payloads)
    }

    /// Complete a local create from the peer's response payloads.
    ///
    /// For the first child `ike_nonces` carries the IKE_SA_INIT nonces;
    /// additional children use the nonces of their own exchange.
    pub fn finish_create(
        &mut self,
        response: &[IkePayload],
        crypto: &ChildCryptoCtx<'_>,
        ike_nonces: Option<(&[u8], &[u8])>,
    ) -> Result<ChildCreateDone> {
        if self.state != ChildState::CreateChildLocalCreate {
            return Err(IkeError::InvalidState(format!(
                "create response in state {:?}",
                self.state
            )));
        }

        let pending = self
            .pending
            .take()
            .ok_or_else(|| IkeError::Internal("create response without pending state".into()))?;

        match self.build_record_from_response(response, crypto, pending, ike_nonces) {
            Ok(record) => {
                let remote_spi = record.remote_spi;
                logging::log_child_sa_created(
                    record.local_spi_value(),
                    remote_spi,
                    record.is_transport,
                );
                self.notify_transforms_created_for(&record);
                self.record = Some(record);
                self.transition(ChildState::Idle);

                let callback = self.callback.clone();
                self.executor.execute(Box::new(move || callback.on_opened()));

                Ok(ChildCreateDone {
                    remote_spi,
                    rekey_after_ms: self.config.soft_lifetime.as_millis() as u64,
                })
            }
            Err(e) => {
                self.fail_fatally(e.clone());
                Err(e)
            }
        }
    }

    // ---- Rekey ----

    /// Build a CREATE_CHILD_SA request rekeying the current SA.
    ///
    /// The previously negotiated proposal and traffic selectors are
    /// reused; a REKEY_SA notify names the SA being replaced.
    pub fn start_rekey(&mut self, rng: &mut dyn RngCore) -> Result<Vec<IkePayload>> {
        if self.state != ChildState::Idle {
            return Err(IkeError::InvalidState(format!(
                "cannot rekey child in state {:?}",
                self.state
            )));
        }
        let (old_local_spi, old_proposal, local_ts, remote_ts) = {
            let current = self
                .record
                .as_ref()
                .ok_or_else(|| IkeError::Internal("rekey without an established SA".into()))?;
            (
                current.local_spi_value(),
                current.proposal.clone(),
                current.local_ts.clone(),
                current.remote_ts.clone(),
            )
        };

        let local_spi = self.installer.allocate_spi(self.remote_addr)?;
        let offered = vec![reuse_proposal(&old_proposal, local_spi.spi())];
        let nonce = generate_nonce(rng);

        let mut payloads = vec![
            IkePayload::SA(SaPayload::new(offered.clone())),
            IkePayload::Nonce(NoncePayload::new(nonce.clone())?),
            IkePayload::TSi(local_ts),
            IkePayload::TSr(remote_ts),
            IkePayload::N(NotifyPayload::rekey_sa(old_local_spi)),
        ];
        self.append_notifies(&mut payloads);

        self.pending = Some(PendingCreate {
            local_spi,
            nonce_local: nonce,
            offered,
        });
        self.transition(ChildState::RekeyChildLocalCreate);
        Ok(payloads)
    }

    /// Complete the create half of a local rekey; returns the Delete
    /// payloads to send next.
    ///
    /// When a peer rekey raced ours, the nonce tie-break decides which
    /// new SA survives: the side with the lexicographically smaller nonce
    /// keeps its SA, and the other side deletes its own.
    pub fn finish_rekey_create(
        &mut self,
        response: &[IkePayload],
        crypto: &ChildCryptoCtx<'_>,
    ) -> Result<(ChildCreateDone, Vec<IkePayload>)> {
        if self.state != ChildState::RekeyChildLocalCreate {
            return Err(IkeError::InvalidState(format!(
                "rekey response in state {:?}",
                self.state
            )));
        }

        let pending = self
            .pending
            .take()
            .ok_or_else(|| IkeError::Internal("rekey response without pending state".into()))?;
        let local_nonce = pending.nonce_local.clone();
        let new_record = self.build_record_from_response(response, crypto, pending, None)?;

        if let Some(simultaneous) = self.simultaneous.take() {
            let local_wins = local_nonce < simultaneous.remote_nonce;
            logging::log_rekey_tie_break(local_wins);

            if !local_wins {
                // The peer's new SA survives; ours is deleted right after
                // creation and the peer will delete the old SA
                let losing_spi = new_record.local_spi_value();
                logging::log_child_sa_deleted(losing_spi, "lost simultaneous rekey");
                release_record(new_record, &self.callback, &self.executor);

                let mut surviving = simultaneous.new_record;
                let outbound = self.install_transform(
                    TransformDirection::Outbound,
                    &surviving.proposal.clone(),
                    surviving.remote_spi,
                    &surviving.keys,
                    false,
                )?;
                surviving.outbound_transform = Some(outbound);
                let remote_spi = surviving.remote_spi;
                self.notify_transforms_created_for(&surviving);
                self.retiring_record = self.record.take();
                self.record = Some(surviving);
                self.transition(ChildState::RekeyChildLocalDelete);

                return Ok((
                    ChildCreateDone {
                        remote_spi,
                        rekey_after_ms: self.config.soft_lifetime.as_millis() as u64,
                    },
                    vec![IkePayload::D(DeletePayload::child_sas(&[losing_spi]))],
                ));
            }
            // Local SA wins: the peer deletes its own new SA; continue
            // with the normal local-rekey delete of the old SA
            release_record(simultaneous.new_record, &self.callback, &self.executor);
        }

        let remote_spi = new_record.remote_spi;
        let old_spi = self
            .record
            .as_ref()
            .map(ChildSaRecord::local_spi_value)
            .unwrap_or_default();
        logging::log_child_rekey(old_spi, new_record.local_spi_value());

        self.notify_transforms_created_for(&new_record);
        self.retiring_record = self.record.take();
        self.record = Some(new_record);
        self.transition(ChildState::RekeyChildLocalDelete);

        Ok((
            ChildCreateDone {
                remote_spi,
                rekey_after_ms: self.config.soft_lifetime.as_millis() as u64,
            },
            vec![IkePayload::D(DeletePayload::child_sas(&[old_spi]))],
        ))
    }

    /// Complete the delete half of a local rekey.
    pub fn finish_rekey_delete(&mut self, response: &[IkePayload]) -> Result<u64> {
        if self.state != ChildState::RekeyChildLocalDelete {
            return Err(IkeError::InvalidState(format!(
                "rekey delete response in state {:?}",
                self.state
            )));
        }

        validate_delete_response(response, self.retiring_record.as_ref())?;

        if let Some(old) = self.retiring_record.take() {
            logging::log_child_sa_deleted(old.local_spi_value(), "rekeyed");
            release_record(old, &self.callback, &self.executor);
        }
        self.transition(ChildState::Idle);
        Ok(self.config.soft_lifetime.as_millis() as u64)
    }

    /// Abort an in-flight local rekey after a non-fatal peer error.
    ///
    /// The pending SPI reservation is released and the current SA stays
    /// active; the parent reschedules the rekey.
    pub fn abort_rekey(&mut self) {
        if self.state == ChildState::RekeyChildLocalCreate {
            self.pending = None;
            self.transition(ChildState::Idle);
        }
    }

    /// Handle a peer-initiated rekey request; returns response payloads.
    pub fn handle_rekey_request(
        &mut self,
        request: &[IkePayload],
        crypto: &ChildCryptoCtx<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<IkePayload>> {
        let simultaneous = self.state == ChildState::RekeyChildLocalCreate;
        if self.state != ChildState::Idle && !simultaneous {
            return Err(IkeError::TemporaryFailure);
        }

        let sa = request
            .iter()
            .find_map(|p| match p {
                IkePayload::SA(sa) => Some(sa),
                _ => None,
            })
            .ok_or_else(|| IkeError::InvalidSyntax("rekey request without SA".into()))?;
        let peer_nonce = request
            .iter()
            .find_map(|p| match p {
                IkePayload::Nonce(n) => Some(n.nonce.clone()),
                _ => None,
            })
            .ok_or_else(|| IkeError::InvalidSyntax("rekey request without nonce".into()))?;

        let current_proposal = self
            .record
            .as_ref()
            .map(|r| r.proposal.clone())
            .ok_or_else(|| IkeError::Internal("rekey request without an established SA".into()))?;
        let chosen = proposal::select_proposal(&sa.proposals, &[current_proposal])?.clone();
        let peer_new_spi = chosen
            .child_spi()
            .ok_or_else(|| IkeError::InvalidSyntax("rekey proposal without Child SPI".into()))?;

        let local_spi = self.installer.allocate_spi(self.remote_addr)?;
        let local_nonce = generate_nonce(rng);
        let our_proposal = reuse_proposal(&chosen, local_spi.spi());

        // Responder view: peer nonce is Ni, ours is Nr
        let keys = ChildSaKeys::derive(
            crypto.prf,
            crypto.sk_d,
            None,
            &peer_nonce,
            &local_nonce,
            chosen.cipher()?.keymat_len(),
            chosen.integrity()?.key_len(),
        )?;

        // Inbound transform now; outbound waits for the peer's delete of
        // the old SA
        let inbound = self.install_transform(
            TransformDirection::Inbound,
            &chosen,
            local_spi.spi(),
            &keys,
            false,
        )?;

        let (local_ts, remote_ts) = match self.record.as_ref() {
            Some(record) => (record.local_ts.clone(), record.remote_ts.clone()),
            None => (self.config.local_ts.clone(), self.config.remote_ts.clone()),
        };

        let new_record = ChildSaRecord {
            local_spi,
            remote_spi: peer_new_spi,
            is_local_init: false,
            is_transport: self.config.is_transport,
            proposal: chosen,
            local_ts,
            remote_ts,
            inbound_transform: Some(inbound),
            outbound_transform: None,
            keys,
        };

        let mut response = vec![
            IkePayload::SA(SaPayload::new(vec![our_proposal])),
            IkePayload::Nonce(NoncePayload::new(local_nonce)?),
            IkePayload::TSi(new_record.local_ts.clone()),
            IkePayload::TSr(new_record.remote_ts.clone()),
        ];
        self.append_notifies(&mut response);

        if simultaneous {
            // Keep the candidate aside until our own response resolves
            // the tie-break
            self.simultaneous = Some(SimultaneousRekey {
                remote_nonce: peer_nonce,
                new_record,
            });
        } else {
            if let Some(transform) = new_record.inbound_transform.as_ref() {
                let callback = self.callback.clone();
                let id = transform.id();
                self.executor.execute(Box::new(move || {
                    callback.on_ipsec_transform_created(id, TransformDirection::Inbound)
                }));
            }
            self.replacement_record = Some(new_record);
            self.transition(ChildState::RekeyChildRemoteDelete);
        }

        Ok(response)
    }

    // ---- Delete ----

    /// Build an INFORMATIONAL request deleting the current SA.
    pub fn start_delete(&mut self) -> Result<Vec<IkePayload>> {
        if self.state != ChildState::Idle {
            return Err(IkeError::InvalidState(format!(
                "cannot delete child in state {:?}",
                self.state
            )));
        }
        let local_spi = self
            .record
            .as_ref()
            .map(ChildSaRecord::local_spi_value)
            .ok_or_else(|| IkeError::Internal("delete without an established SA".into()))?;

        self.transition(ChildState::DeleteChildLocalDelete);
        Ok(vec![IkePayload::D(DeletePayload::child_sas(&[local_spi]))])
    }

    /// Complete a local delete from the peer's response.
    ///
    /// An empty informational response is accepted for the
    /// simultaneous-delete case; a delete payload that names an
    /// unexpected SPI is warned about and teardown proceeds.
    pub fn finish_delete(&mut self, response: &[IkePayload]) -> Result<()> {
        if self.state != ChildState::DeleteChildLocalDelete {
            return Err(IkeError::InvalidState(format!(
                "delete response in state {:?}",
                self.state
            )));
        }

        validate_delete_response(response, self.record.as_ref())?;

        if let Some(record) = self.record.take() {
            logging::log_child_sa_deleted(record.local_spi_value(), "local delete");
            release_record(record, &self.callback, &self.executor);
        }
        self.close();
        Ok(())
    }

    /// Handle a peer-initiated delete naming one of our SPIs; returns the
    /// response payloads.
    pub fn handle_delete_request(&mut self, remote_spi: u32) -> Result<Vec<IkePayload>> {
        match self.state {
            ChildState::Idle | ChildState::DeleteChildLocalDelete => {
                let record = self
                    .record
                    .take()
                    .ok_or(IkeError::ChildSaNotFound(remote_spi))?;
                let local_spi = record.local_spi_value();
                logging::log_child_sa_deleted(local_spi, "remote delete");
                release_record(record, &self.callback, &self.executor);

                if self.state == ChildState::Idle {
                    self.transition(ChildState::DeleteChildRemoteDelete);
                }
                self.close();
                Ok(vec![IkePayload::D(DeletePayload::child_sas(&[local_spi]))])
            }
            ChildState::RekeyChildRemoteDelete => {
                // The delete targets the old SA: promote the new one and
                // install its outbound transform
                let old = self
                    .record
                    .take()
                    .ok_or(IkeError::ChildSaNotFound(remote_spi))?;
                let old_local_spi = old.local_spi_value();
                logging::log_child_sa_deleted(old_local_spi, "rekeyed by peer");
                release_record(old, &self.callback, &self.executor);

                let mut new_record = self
                    .replacement_record
                    .take()
                    .ok_or_else(|| IkeError::Internal("remote rekey without new record".into()))?;
                let outbound = self.install_transform(
                    TransformDirection::Outbound,
                    &new_record.proposal.clone(),
                    new_record.remote_spi,
                    &new_record.keys,
                    false,
                )?;
                let callback = self.callback.clone();
                let id = outbound.id();
                self.executor.execute(Box::new(move || {
                    callback.on_ipsec_transform_created(id, TransformDirection::Outbound)
                }));
                new_record.outbound_transform = Some(outbound);

                logging::log_child_rekey(old_local_spi, new_record.local_spi_value());
                self.record = Some(new_record);
                self.transition(ChildState::Idle);
                Ok(vec![IkePayload::D(DeletePayload::child_sas(&[
                    old_local_spi,
                ]))])
            }
            ChildState::RekeyChildLocalDelete => {
                // The winner of a simultaneous rekey deletes the old SA
                // while we await the response for our own delete
                let old = self
                    .retiring_record
                    .take()
                    .ok_or(IkeError::ChildSaNotFound(remote_spi))?;
                let old_local_spi = old.local_spi_value();
                logging::log_child_sa_deleted(old_local_spi, "deleted by rekey winner");
                release_record(old, &self.callback, &self.executor);
                Ok(vec![IkePayload::D(DeletePayload::child_sas(&[
                    old_local_spi,
                ]))])
            }
            _ => Err(IkeError::TemporaryFailure),
        }
    }

    /// Force-close without emitting network traffic.
    pub fn kill(&mut self) {
        for record in [
            self.record.take(),
            self.retiring_record.take(),
            self.replacement_record.take(),
        ]
        .into_iter()
        .flatten()
        {
            release_record(record, &self.callback, &self.executor);
        }
        if let Some(simultaneous) = self.simultaneous.take() {
            release_record(simultaneous.new_record, &self.callback, &self.executor);
        }
        self.pending = None;
        self.close();
    }

    /// Tear down after an unrecoverable error.
    pub fn fail_fatally(&mut self, error: IkeError) {
        let callback = self.callback.clone();
        self.executor
            .execute(Box::new(move || callback.on_error(error)));
        self.kill();
    }

    // ---- helpers ----

    fn close(&mut self) {
        if self.state != ChildState::Closed {
            self.transition(ChildState::Closed);
            let callback = self.callback.clone();
            self.executor.execute(Box::new(move || callback.on_closed()));
        }
    }

    fn offered_proposals(&self, local_spi: u32) -> Vec<Proposal> {
        self.config
            .proposals
            .iter()
            .map(|p| reuse_proposal(p, local_spi))
            .collect()
    }

    fn append_notifies(&self, payloads: &mut Vec<IkePayload>) {
        if self.config.is_transport {
            payloads.push(IkePayload::N(NotifyPayload::new(
                NotifyType::UseTransportMode,
            )));
        }
        payloads.push(IkePayload::N(NotifyPayload::new(
            NotifyType::EspTfcPaddingNotSupported,
        )));
    }

    /// Validate a create/rekey response and build the resulting record.
    ///
    /// The pending local SPI moves into the record; its kernel
    /// reservation is released only when the record is.
    fn build_record_from_response(
        &mut self,
        response: &[IkePayload],
        crypto: &ChildCryptoCtx<'_>,
        pending: PendingCreate,
        ike_nonces: Option<(&[u8], &[u8])>,
    ) -> Result<ChildSaRecord> {
        let sa = response
            .iter()
            .find_map(|p| match p {
                IkePayload::SA(sa) => Some(sa),
                _ => None,
            })
            .ok_or_else(|| IkeError::InvalidSyntax("create response without SA".into()))?;

        let chosen = proposal::validate_response_proposal(&sa.proposals, &pending.offered)?;
        let remote_spi = chosen
            .child_spi()
            .ok_or_else(|| IkeError::InvalidSyntax("response proposal without Child SPI".into()))?;
        let chosen = chosen.clone();

        let tsi = response
            .iter()
            .find_map(|p| match p {
                IkePayload::TSi(ts) => Some(ts),
                _ => None,
            })
            .ok_or_else(|| IkeError::InvalidSyntax("create response without TSi".into()))?;
        let tsr = response
            .iter()
            .find_map(|p| match p {
                IkePayload::TSr(ts) => Some(ts),
                _ => None,
            })
            .ok_or_else(|| IkeError::InvalidSyntax("create response without TSr".into()))?;

        // The peer may narrow but never widen our offer
        if !tsi.is_subset_of(&self.config.local_ts) || !tsr.is_subset_of(&self.config.remote_ts) {
            return Err(IkeError::TsUnacceptable);
        }

        // USE_TRANSPORT_MODE presence must match the local mode
        let transport_in_response = response.iter().any(|p| {
            matches!(p, IkePayload::N(n) if n.typed() == Some(NotifyType::UseTransportMode))
        });
        if transport_in_response != self.config.is_transport {
            return Err(IkeError::InvalidSyntax(
                "USE_TRANSPORT_MODE presence does not match negotiation".into(),
            ));
        }

        // Nonces: request nonce is Ni, response nonce Nr, unless this is
        // the first child riding IKE_AUTH
        let (nonce_i, nonce_r) = match ike_nonces {
            Some((ni, nr)) => (ni.to_vec(), nr.to_vec()),
            None => {
                let response_nonce = response
                    .iter()
                    .find_map(|p| match p {
                        IkePayload::Nonce(n) => Some(n.nonce.clone()),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        IkeError::InvalidSyntax("create response without nonce".into())
                    })?;
                (pending.nonce_local.clone(), response_nonce)
            }
        };

        let keys = ChildSaKeys::derive(
            crypto.prf,
            crypto.sk_d,
            None,
            &nonce_i,
            &nonce_r,
            chosen.cipher()?.keymat_len(),
            chosen.integrity()?.key_len(),
        )?;

        let inbound = self.install_transform(
            TransformDirection::Inbound,
            &chosen,
            pending.local_spi.spi(),
            &keys,
            true,
        )?;
        let outbound = self.install_transform(
            TransformDirection::Outbound,
            &chosen,
            remote_spi,
            &keys,
            true,
        )?;

        Ok(ChildSaRecord {
            local_spi: pending.local_spi,
            remote_spi,
            is_local_init: true,
            is_transport: self.config.is_transport,
            proposal: chosen,
            local_ts: tsi.clone(),
            remote_ts: tsr.clone(),
            inbound_transform: Some(inbound),
            outbound_transform: Some(outbound),
            keys,
        })
    }

    fn install_transform(
        &self,
        direction: TransformDirection,
        proposal: &Proposal,
        spi: u32,
        keys: &ChildSaKeys,
        is_local_init: bool,
    ) -> Result<OwnedTransform> {
        let (encr_key, auth_key) = match direction {
            TransformDirection::Outbound => keys.outbound(is_local_init),
            TransformDirection::Inbound => keys.inbound(is_local_init),
        };

        let encr_transform = proposal
            .get_transform(TransformType::Encr)
            .ok_or_else(|| IkeError::InvalidSyntax("proposal without ENCR".into()))?;
        let integ_id = proposal.integrity()?.transform_id();

        Ok(self.installer.install_transform(TransformRequest {
            direction,
            spi,
            remote_addr: self.remote_addr,
            encryption_algo: encr_transform.id,
            encryption_key: encr_key,
            integrity_algo: integ_id,
            integrity_key: auth_key,
            is_transport: self.config.is_transport,
            encap_socket: self.encap_socket,
        })?)
    }

    fn notify_transforms_created_for(&self, record: &ChildSaRecord) {
        for (transform, direction) in [
            (
                record.inbound_transform.as_ref(),
                TransformDirection::Inbound,
            ),
            (
                record.outbound_transform.as_ref(),
                TransformDirection::Outbound,
            ),
        ] {
            if let Some(transform) = transform {
                let callback = self.callback.clone();
                let id = transform.id();
                self.executor.execute(Box::new(move || {
                    callback.on_ipsec_transform_created(id, direction)
                }));
            }
        }
    }
}

impl std::fmt::Debug for ChildSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSession")
            .field("state", &self.state)
            .field("local_spi", &self.local_spi())
            .finish()
    }
}

/// Release a record's transforms with callbacks, then drop it.
fn release_record(
    mut record: ChildSaRecord,
    callback: &Arc<dyn ChildSessionCallback>,
    executor: &Arc<dyn CallbackExecutor>,
) {
    for (transform, direction) in [
        (record.inbound_transform.take(), TransformDirection::Inbound),
        (
            record.outbound_transform.take(),
            TransformDirection::Outbound,
        ),
    ] {
        if let Some(transform) = transform {
            let callback = callback.clone();
            let id = transform.id();
            executor.execute(Box::new(move || {
                callback.on_ipsec_transform_deleted(id, direction)
            }));
            drop(transform);
        }
    }
    drop(record);
}

/// Check a delete response: a delete payload naming our remote SPI, or an
/// empty informational (simultaneous delete). A delete listing an
/// unexpected SPI is warned about and teardown proceeds.
fn validate_delete_response(response: &[IkePayload], record: Option<&ChildSaRecord>) -> Result<()> {
    let deletes: Vec<&DeletePayload> = response
        .iter()
        .filter_map(|p| match p {
            IkePayload::D(d) => Some(d),
            _ => None,
        })
        .collect();

    if deletes.is_empty() {
        // Simultaneous delete: the peer already considered the SA gone
        return Ok(());
    }

    for delete in deletes {
        if delete.protocol != ProtocolId::Esp {
            return Err(IkeError::InvalidSyntax(
                "delete response for a non-ESP protocol".into(),
            ));
        }
        if let Some(record) = record {
            for spi in delete.child_spis() {
                if spi != record.remote_spi {
                    logging::log_protocol_error(
                        "INFORMATIONAL",
                        "delete response names an unexpected SPI",
                    );
                }
            }
        }
    }
    Ok(())
}

fn reuse_proposal(template: &Proposal, spi: u32) -> Proposal {
    let mut proposal = template.clone();
    proposal.spi = spi.to_be_bytes().to_vec();
    proposal
}

fn generate_nonce(rng: &mut dyn RngCore) -> Vec<u8> {
    let mut nonce = vec![0u8; CHILD_NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ike::config::ChildSessionConfig;
    use crate::ike::crypto::{IkeCipher, IntegrityAlgorithm};
    use crate::ike::proposal::Transform;
    use krait_platform::{InlineExecutor, KraitResult, OwnedSpi};
    use rand::rngs::OsRng;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Mutex;

    struct FakeInstaller {
        next_spi: AtomicU32,
        next_transform: AtomicU64,
        released_spis: Arc<Mutex<Vec<u32>>>,
        released_transforms: Arc<Mutex<Vec<u64>>>,
    }

    impl FakeInstaller {
        fn new() -> Self {
            FakeInstaller {
                next_spi: AtomicU32::new(0x1000),
                next_transform: AtomicU64::new(1),
                released_spis: Arc::new(Mutex::new(Vec::new())),
                released_transforms: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl IpsecTransformInstaller for FakeInstaller {
        fn allocate_spi(&self, _remote_addr: IpAddr) -> KraitResult<OwnedSpi> {
            let spi = self.next_spi.fetch_add(1, Ordering::SeqCst);
            let released = self.released_spis.clone();
            Ok(OwnedSpi::new(
                spi,
                Box::new(move |value| released.lock().unwrap().push(value)),
            ))
        }

        fn install_transform(
            &self,
            request: TransformRequest<'_>,
        ) -> KraitResult<OwnedTransform> {
            let id = self.next_transform.fetch_add(1, Ordering::SeqCst);
            let released = self.released_transforms.clone();
            Ok(OwnedTransform::new(
                id,
                request.direction,
                Box::new(move |value| released.lock().unwrap().push(value)),
            ))
        }
    }

    #[derive(Default)]
    struct RecordingCallback {
        opened: AtomicU32,
        closed: AtomicU32,
        errors: AtomicU32,
        created: AtomicU32,
        deleted: AtomicU32,
    }

    impl ChildSessionCallback for RecordingCallback {
        fn on_opened(&self) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }
        fn on_closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _error: IkeError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_ipsec_transform_created(&self, _id: u64, _direction: TransformDirection) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        fn on_ipsec_transform_deleted(&self, _id: u64, _direction: TransformDirection) {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn esp_proposal() -> Proposal {
        Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(IkeCipher::ENCR_AES_CBC, Some(128)))
            .add_transform(Transform::integ(IntegrityAlgorithm::HmacSha1_96))
            .add_transform(Transform::esn_none())
    }

    fn config() -> ChildSessionConfig {
        ChildSessionConfig::builder()
            .add_proposal(esp_proposal())
            .build()
            .unwrap()
    }

    struct Fixture {
        session: ChildSession,
        installer: Arc<FakeInstaller>,
        callback: Arc<RecordingCallback>,
        sk_d: Vec<u8>,
    }

    fn fixture() -> Fixture {
        let installer = Arc::new(FakeInstaller::new());
        let callback = Arc::new(RecordingCallback::default());
        let session = ChildSession::new(
            config(),
            installer.clone(),
            callback.clone(),
            Arc::new(InlineExecutor),
            "192.0.2.100".parse().unwrap(),
            None,
        );
        Fixture {
            session,
            installer,
            callback,
            sk_d: vec![0x42; 20],
        }
    }

    fn crypto(sk_d: &[u8]) -> ChildCryptoCtx<'_> {
        ChildCryptoCtx {
            prf: PrfAlgorithm::HmacSha1,
            sk_d,
        }
    }

    /// Peer response mirroring a request: chosen proposal with the peer's
    /// SPI, a nonce, and echoed selectors.
    fn peer_create_response(remote_spi: u32, transport: bool) -> Vec<IkePayload> {
        let mut payloads = vec![
            IkePayload::SA(SaPayload::new(vec![reuse_proposal(
                &esp_proposal(),
                remote_spi,
            )])),
            IkePayload::Nonce(NoncePayload::new(vec![0x77; 32]).unwrap()),
            IkePayload::TSi(crate::ike::ts::TrafficSelectorsPayload::all_v4()),
            IkePayload::TSr(crate::ike::ts::TrafficSelectorsPayload::all_v4()),
        ];
        if transport {
            payloads.push(IkePayload::N(NotifyPayload::new(
                NotifyType::UseTransportMode,
            )));
        }
        payloads
    }

    fn established_fixture() -> Fixture {
        let mut fx = fixture();
        fx.session.start_create(&mut OsRng).unwrap();
        let sk_d = fx.sk_d.clone();
        fx.session
            .finish_create(&peer_create_response(0xBEEF, false), &crypto(&sk_d), None)
            .unwrap();
        fx
    }

    fn rekey_request_payloads(peer_new_spi: u32, nonce_byte: u8) -> Vec<IkePayload> {
        vec![
            IkePayload::N(NotifyPayload::rekey_sa(0x1000)),
            IkePayload::SA(SaPayload::new(vec![reuse_proposal(
                &esp_proposal(),
                peer_new_spi,
            )])),
            IkePayload::Nonce(NoncePayload::new(vec![nonce_byte; 32]).unwrap()),
            IkePayload::TSi(crate::ike::ts::TrafficSelectorsPayload::all_v4()),
            IkePayload::TSr(crate::ike::ts::TrafficSelectorsPayload::all_v4()),
        ]
    }

    #[test]
    fn test_create_flow() {
        let mut fx = fixture();

        let request = fx.session.start_create(&mut OsRng).unwrap();
        assert_eq!(fx.session.state(), ChildState::CreateChildLocalCreate);
        assert!(matches!(request[0], IkePayload::SA(_)));
        assert!(matches!(request[1], IkePayload::Nonce(_)));
        assert!(matches!(request[2], IkePayload::TSi(_)));
        assert!(matches!(request[3], IkePayload::TSr(_)));

        let sk_d = fx.sk_d.clone();
        let done = fx
            .session
            .finish_create(&peer_create_response(0xBEEF, false), &crypto(&sk_d), None)
            .unwrap();

        assert_eq!(fx.session.state(), ChildState::Idle);
        assert_eq!(done.remote_spi, 0xBEEF);
        assert!(fx.session.owns_remote_spi(0xBEEF));
        assert_eq!(fx.callback.opened.load(Ordering::SeqCst), 1);
        assert_eq!(fx.callback.created.load(Ordering::SeqCst), 2);
        // Nothing released while the SA lives
        assert!(fx.installer.released_spis.lock().unwrap().is_empty());
    }

    #[test]
    fn test_create_rejects_transport_mismatch() {
        let mut fx = fixture();
        fx.session.start_create(&mut OsRng).unwrap();

        let sk_d = fx.sk_d.clone();
        let result = fx.session.finish_create(
            &peer_create_response(0xBEEF, true), // unexpected USE_TRANSPORT_MODE
            &crypto(&sk_d),
            None,
        );
        assert!(result.is_err());
        assert_eq!(fx.session.state(), ChildState::Closed);
        assert_eq!(fx.callback.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_create_rejects_widened_selectors() {
        let mut fx = fixture();
        // Offer a narrow selector set
        fx.session.config.local_ts = crate::ike::ts::TrafficSelectorsPayload {
            selectors: vec![crate::ike::ts::TrafficSelector {
                ip_protocol: 0,
                start_port: 0,
                end_port: 65535,
                start_addr: "10.0.0.0".parse().unwrap(),
                end_addr: "10.0.0.255".parse().unwrap(),
            }],
        };
        fx.session.start_create(&mut OsRng).unwrap();

        let sk_d = fx.sk_d.clone();
        // Peer answers with all-v4, wider than offered
        let result =
            fx.session
                .finish_create(&peer_create_response(0xBEEF, false), &crypto(&sk_d), None);
        assert!(matches!(result, Err(IkeError::TsUnacceptable)));
    }

    #[test]
    fn test_local_delete_flow() {
        let mut fx = established_fixture();

        let request = fx.session.start_delete().unwrap();
        assert_eq!(fx.session.state(), ChildState::DeleteChildLocalDelete);
        match &request[0] {
            IkePayload::D(d) => assert_eq!(d.child_spis(), vec![0x1000]),
            other => panic!("expected delete payload, got {:?}", other),
        }

        let response = vec![IkePayload::D(DeletePayload::child_sas(&[0xBEEF]))];
        fx.session.finish_delete(&response).unwrap();

        assert_eq!(fx.session.state(), ChildState::Closed);
        assert_eq!(fx.callback.closed.load(Ordering::SeqCst), 1);
        assert_eq!(fx.callback.deleted.load(Ordering::SeqCst), 2);
        // Both transforms and the SPI were released exactly once
        assert_eq!(fx.installer.released_transforms.lock().unwrap().len(), 2);
        assert_eq!(
            fx.installer.released_spis.lock().unwrap().as_slice(),
            &[0x1000]
        );
    }

    #[test]
    fn test_simultaneous_delete_empty_response() {
        let mut fx = established_fixture();
        fx.session.start_delete().unwrap();
        fx.session.finish_delete(&[]).unwrap();
        assert_eq!(fx.session.state(), ChildState::Closed);
    }

    #[test]
    fn test_remote_delete() {
        let mut fx = established_fixture();

        let response = fx.session.handle_delete_request(0xBEEF).unwrap();
        match &response[0] {
            IkePayload::D(d) => assert_eq!(d.child_spis(), vec![0x1000]),
            other => panic!("expected delete payload, got {:?}", other),
        }
        assert_eq!(fx.session.state(), ChildState::Closed);
        assert_eq!(fx.callback.deleted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_local_rekey_flow() {
        let mut fx = established_fixture();

        let request = fx.session.start_rekey(&mut OsRng).unwrap();
        assert_eq!(fx.session.state(), ChildState::RekeyChildLocalCreate);
        // REKEY_SA notify names the SA being replaced
        let rekey_notify = request
            .iter()
            .find_map(|p| match p {
                IkePayload::N(n) if n.typed() == Some(NotifyType::RekeySa) => Some(n),
                _ => None,
            })
            .expect("REKEY_SA notify present");
        assert_eq!(rekey_notify.child_spi(), Some(0x1000));
        assert!(matches!(request[0], IkePayload::SA(_)));

        let sk_d = fx.sk_d.clone();
        let (done, delete) = fx
            .session
            .finish_rekey_create(&peer_create_response(0xF00D, false), &crypto(&sk_d))
            .unwrap();
        assert_eq!(done.remote_spi, 0xF00D);
        assert_eq!(fx.session.state(), ChildState::RekeyChildLocalDelete);
        match &delete[0] {
            IkePayload::D(d) => assert_eq!(d.child_spis(), vec![0x1000]),
            other => panic!("expected delete payload, got {:?}", other),
        }

        // The delete response for the old SA completes the rekey
        fx.session.finish_rekey_delete(&[]).unwrap();
        assert_eq!(fx.session.state(), ChildState::Idle);
        assert!(fx.session.owns_remote_spi(0xF00D));
        assert!(!fx.session.owns_remote_spi(0xBEEF));

        // Old inbound+outbound released, old SPI released
        assert_eq!(fx.installer.released_transforms.lock().unwrap().len(), 2);
        assert_eq!(
            fx.installer.released_spis.lock().unwrap().as_slice(),
            &[0x1000]
        );
    }

    #[test]
    fn test_remote_rekey_staggers_outbound_install() {
        let mut fx = established_fixture();

        let sk_d = fx.sk_d.clone();
        let response = fx
            .session
            .handle_rekey_request(&rekey_request_payloads(0xD00D, 0x55), &crypto(&sk_d), &mut OsRng)
            .unwrap();
        assert_eq!(fx.session.state(), ChildState::RekeyChildRemoteDelete);
        assert!(matches!(response[0], IkePayload::SA(_)));
        assert!(fx.session.owns_remote_spi(0xD00D));

        // Only the inbound transform of the new SA exists so far:
        // 2 (original) + 1 (new inbound)
        assert_eq!(fx.callback.created.load(Ordering::SeqCst), 3);

        // Peer deletes the old SA; outbound installs now
        let delete_response = fx.session.handle_delete_request(0xBEEF).unwrap();
        assert!(matches!(delete_response[0], IkePayload::D(_)));
        assert_eq!(fx.session.state(), ChildState::Idle);
        assert_eq!(fx.callback.created.load(Ordering::SeqCst), 4);
        assert!(!fx.session.owns_remote_spi(0xBEEF));
    }

    #[test]
    fn test_simultaneous_rekey_local_wins() {
        let mut fx = established_fixture();
        fx.session.start_rekey(&mut OsRng).unwrap();
        // Force a known local nonce smaller than the peer's
        fx.session.pending.as_mut().unwrap().nonce_local = vec![0x00; 32];

        let sk_d = fx.sk_d.clone();
        fx.session
            .handle_rekey_request(&rekey_request_payloads(0xD00D, 0xFF), &crypto(&sk_d), &mut OsRng)
            .unwrap();
        assert_eq!(fx.session.state(), ChildState::RekeyChildLocalCreate);

        let (done, delete) = fx
            .session
            .finish_rekey_create(&peer_create_response(0xF00D, false), &crypto(&sk_d))
            .unwrap();
        // Our new SA survives the tie-break; the old SA is deleted by us
        assert_eq!(done.remote_spi, 0xF00D);
        assert!(fx.session.owns_remote_spi(0xF00D));
        assert!(!fx.session.owns_remote_spi(0xD00D));
        match &delete[0] {
            IkePayload::D(d) => assert_eq!(d.child_spis(), vec![0x1000]),
            other => panic!("expected delete payload, got {:?}", other),
        }
    }

    #[test]
    fn test_simultaneous_rekey_local_loses() {
        let mut fx = established_fixture();
        fx.session.start_rekey(&mut OsRng).unwrap();
        fx.session.pending.as_mut().unwrap().nonce_local = vec![0xFF; 32];

        let sk_d = fx.sk_d.clone();
        fx.session
            .handle_rekey_request(&rekey_request_payloads(0xD00D, 0x00), &crypto(&sk_d), &mut OsRng)
            .unwrap();

        let (done, delete) = fx
            .session
            .finish_rekey_create(&peer_create_response(0xF00D, false), &crypto(&sk_d))
            .unwrap();

        // The peer's new SA survives; ours is deleted by us (the
        // initiator of the losing SA)
        assert_eq!(done.remote_spi, 0xD00D);
        assert!(fx.session.owns_remote_spi(0xD00D));
        assert!(!fx.session.owns_remote_spi(0xF00D));
        match &delete[0] {
            IkePayload::D(d) => assert_eq!(d.child_spis().len(), 1),
            other => panic!("expected delete payload, got {:?}", other),
        }
        assert_eq!(fx.session.state(), ChildState::RekeyChildLocalDelete);
    }

    #[test]
    fn test_kill_releases_everything_silently() {
        let mut fx = established_fixture();

        fx.session.kill();
        assert_eq!(fx.session.state(), ChildState::Closed);
        assert_eq!(fx.callback.closed.load(Ordering::SeqCst), 1);
        assert_eq!(fx.installer.released_transforms.lock().unwrap().len(), 2);
        assert_eq!(fx.installer.released_spis.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rekey_request_in_wrong_state_is_temporary_failure() {
        let mut fx = established_fixture();
        fx.session.start_delete().unwrap();

        let sk_d = fx.sk_d.clone();
        let result = fx
            .session
            .handle_rekey_request(&[], &crypto(&sk_d), &mut OsRng);
        assert!(matches!(result, Err(IkeError::TemporaryFailure)));
    }
}
