//! IKE Session state machine
//!
//! Drives one IKE SA from IKE_SA_INIT through the EAP-carrying IKE_AUTH
//! loop into the established phase, where it serializes local procedures
//! (create/delete/rekey child, rekey/delete IKE) behind the request
//! queue, routes peer-initiated requests to the owning Child Session,
//! and enforces the window-size-1 exchange discipline:
//!
//! - one in-flight locally-initiated exchange, retransmitted on backoff
//! - inbound requests matched against the expected remote message id;
//!   a duplicate of the last handled id replays the cached response
//!   byte-identically, anything else out of window is dropped
//! - responses with a non-matching id are dropped
//!
//! The core is synchronous: events go in, datagrams accumulate in the
//! outbox and deadlines are exposed for the driver loop to sleep on.

use crate::ike::config::{ChildSessionConfig, IkeSessionConfig};
use crate::ike::constants::{
    ExchangeType, IkeFlags, NotifyType, PayloadType, ProtocolId, NON_ESP_MARKER,
};
use crate::ike::crypto::DhKeyPair;
use crate::ike::eap::{EapResult, EapStateMachine};
use crate::ike::logging;
use crate::ike::message::{
    DeletePayload, IdPayload, IkeHeader, IkeMessage, IkePayload, KePayload, NoncePayload,
    NotifyPayload, SaPayload,
};
use crate::ike::nat::{self, NatDetectionResult};
use crate::ike::proposal::{self, Proposal};
use crate::ike::sa_record::IkeSaRecord;
use crate::ike::{IkeError, Result};

use super::auth;
use super::child::{ChildCryptoCtx, ChildSession, ChildSessionCallback, ChildState};
use super::queue::{LocalRequestKind, LocalRequestQueue};
use super::retransmit::{ExchangePurpose, PendingExchange, RetransmitAction};

use krait_platform::{CallbackExecutor, Clock, IpsecTransformInstaller, SimAuthProvider};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;

/// Nonce size for IKE exchanges
const IKE_NONCE_LEN: usize = 32;

/// Delay before a failed child rekey is retried (milliseconds)
const REKEY_RETRY_DELAY_MS: u64 = 30_000;

/// Watchdog for the peer's old-SA delete after a remote rekey
const REKEY_REMOTE_DELETE_WATCHDOG_MS: u64 = 180_000;

/// IKE Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkeSessionState {
    /// Nothing sent yet
    Initial,
    /// IKE_SA_INIT request in flight
    IkeInitLocal,
    /// IKE_AUTH / EAP loop in flight
    IkeAuthLocal,
    /// Established, no procedure ongoing
    Idle,
    /// CREATE_CHILD_SA for an additional child in flight
    CreateChildLocal,
    /// Local Delete-IKE in flight
    DeleteIkeLocal,
    /// Local Rekey-IKE in flight
    RekeyIkeLocal,
    /// Peer-initiated Rekey-IKE awaiting the old-SA delete
    RekeyIkeRemote,
    /// Both sides rekeying the IKE SA at once
    RekeyIkeSimul,
    /// A child procedure owns the exchange window
    ChildProcedureOngoing,
    /// Processing an inbound request
    Receiving,
    /// Terminal
    Closed,
}

impl IkeSessionState {
    fn name(self) -> &'static str {
        match self {
            IkeSessionState::Initial => "Initial",
            IkeSessionState::IkeInitLocal => "IkeInitLocal",
            IkeSessionState::IkeAuthLocal => "IkeAuthLocal",
            IkeSessionState::Idle => "Idle",
            IkeSessionState::CreateChildLocal => "CreateChildLocal",
            IkeSessionState::DeleteIkeLocal => "DeleteIkeLocal",
            IkeSessionState::RekeyIkeLocal => "RekeyIkeLocal",
            IkeSessionState::RekeyIkeRemote => "RekeyIkeRemote",
            IkeSessionState::RekeyIkeSimul => "RekeyIkeSimul",
            IkeSessionState::ChildProcedureOngoing => "ChildProcedureOngoing",
            IkeSessionState::Receiving => "Receiving",
            IkeSessionState::Closed => "Closed",
        }
    }
}

/// User-facing IKE Session callbacks, invoked on the callback executor.
pub trait IkeSessionCallback: Send + Sync {
    /// The IKE SA and first Child SA are established
    fn on_opened(&self);

    /// The session is closed
    fn on_closed(&self);

    /// The session died of an error
    fn on_error(&self, error: IkeError);
}

/// Classification of an inbound request (RFC 7296 exchange content).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkeExchangeSubType {
    /// CREATE_CHILD_SA rekeying the IKE SA
    RekeyIke,
    /// INFORMATIONAL deleting the IKE SA
    DeleteIke,
    /// CREATE_CHILD_SA creating a new child
    CreateChild,
    /// CREATE_CHILD_SA rekeying a child
    RekeyChild,
    /// INFORMATIONAL deleting one or more children
    DeleteChild,
    /// Any other INFORMATIONAL (liveness, status)
    InformationalOther,
}

/// Classify a decoded inbound request.
pub fn classify_inbound_request(message: &IkeMessage) -> IkeExchangeSubType {
    match message.header.exchange_type {
        ExchangeType::CreateChildSa => {
            let rekeys_ike = message
                .sa_payload()
                .map(|sa| {
                    sa.proposals
                        .iter()
                        .any(|p| p.protocol == ProtocolId::Ike)
                })
                .unwrap_or(false);
            if rekeys_ike {
                IkeExchangeSubType::RekeyIke
            } else if message.notify(NotifyType::RekeySa).is_some() {
                IkeExchangeSubType::RekeyChild
            } else {
                IkeExchangeSubType::CreateChild
            }
        }
        _ => {
            let mut deletes_ike = false;
            let mut deletes_child = false;
            for delete in message.delete_payloads() {
                match delete.protocol {
                    ProtocolId::Ike => deletes_ike = true,
                    ProtocolId::Esp | ProtocolId::Ah => deletes_child = true,
                    ProtocolId::None => {}
                }
            }
            if deletes_ike {
                IkeExchangeSubType::DeleteIke
            } else if deletes_child {
                IkeExchangeSubType::DeleteChild
            } else {
                IkeExchangeSubType::InformationalOther
            }
        }
    }
}

/// Timers owned by the session core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Soft-lifetime rekey for a child
    RekeyChild { child_id: u32, record_spi: u32 },
    /// Remote-rekey delete watchdog for a child
    RekeyWatchdog { child_id: u32 },
}

#[derive(Debug)]
struct TimerEntry {
    fire_at_ms: u64,
    kind: TimerKind,
}

/// Local Rekey-IKE bookkeeping
struct RekeyIkeLocal {
    dh: DhKeyPair,
    nonce_local: Vec<u8>,
    new_init_spi: [u8; 8],
    offered: Vec<Proposal>,
    /// New record, present once the create phase completed
    new_sa: Option<IkeSaRecord>,
}

/// Remote Rekey-IKE bookkeeping
struct RekeyIkeRemote {
    new_sa: IkeSaRecord,
    remote_nonce: Vec<u8>,
}

/// The IKE Session core: a synchronous event consumer.
///
/// The async driver feeds it datagrams, commands and clock ticks, sends
/// whatever lands in the outbox and sleeps until `next_deadline_ms`.
pub struct IkeSessionCore {
    config: IkeSessionConfig,
    installer: Arc<dyn IpsecTransformInstaller>,
    sim: Arc<dyn SimAuthProvider>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn CallbackExecutor>,
    callback: Arc<dyn IkeSessionCallback>,
    rng: Box<dyn RngCore + Send>,

    state: IkeSessionState,
    sa: Option<IkeSaRecord>,

    // IKE_SA_INIT / IKE_AUTH handshake context
    init_spi: [u8; 8],
    dh: Option<DhKeyPair>,
    nonce_local: Vec<u8>,
    nonce_remote: Vec<u8>,
    init_request_bytes: Vec<u8>,
    init_response_bytes: Vec<u8>,
    eap: Option<EapStateMachine>,
    msk: Option<Vec<u8>>,

    pending: Option<PendingExchange>,
    queue: LocalRequestQueue,

    children: HashMap<u32, ChildSession>,
    /// Remote SPIs registered before their child finished validating
    provisional_remote_spis: HashMap<u32, u32>,
    next_child_id: u32,

    timers: Vec<TimerEntry>,
    outbox: Vec<Vec<u8>>,
    nat: NatDetectionResult,

    rekey_local: Option<RekeyIkeLocal>,
    rekey_remote: Option<RekeyIkeRemote>,
}

impl IkeSessionCore {
    /// Create a session core with its first Child Session.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: IkeSessionConfig,
        first_child_config: ChildSessionConfig,
        first_child_callback: Arc<dyn ChildSessionCallback>,
        installer: Arc<dyn IpsecTransformInstaller>,
        sim: Arc<dyn SimAuthProvider>,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn CallbackExecutor>,
        callback: Arc<dyn IkeSessionCallback>,
        mut rng: Box<dyn RngCore + Send>,
    ) -> Self {
        let mut init_spi = [0u8; 8];
        rng.fill_bytes(&mut init_spi);

        let first_child = ChildSession::new(
            first_child_config,
            installer.clone(),
            first_child_callback,
            executor.clone(),
            config.remote_addr.ip(),
            None,
        );

        let mut children = HashMap::new();
        children.insert(0, first_child);

        IkeSessionCore {
            config,
            installer,
            sim,
            clock,
            executor,
            callback,
            rng,
            state: IkeSessionState::Initial,
            sa: None,
            init_spi,
            dh: None,
            nonce_local: Vec::new(),
            nonce_remote: Vec::new(),
            init_request_bytes: Vec::new(),
            init_response_bytes: Vec::new(),
            eap: None,
            msk: None,
            pending: None,
            queue: LocalRequestQueue::new(),
            children,
            provisional_remote_spis: HashMap::new(),
            next_child_id: 1,
            timers: Vec::new(),
            outbox: Vec::new(),
            nat: NatDetectionResult::default(),
            rekey_local: None,
            rekey_remote: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> IkeSessionState {
        self.state
    }

    /// The session reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state == IkeSessionState::Closed
    }

    /// Drain accumulated outbound datagrams.
    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    /// Earliest deadline the driver must wake us for.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        let mut deadline = self.pending.as_ref().map(|p| p.next_fire_ms);
        for timer in &self.timers {
            deadline = Some(match deadline {
                Some(d) => d.min(timer.fire_at_ms),
                None => timer.fire_at_ms,
            });
        }
        if let Some(release) = self.queue.next_release_ms() {
            deadline = Some(match deadline {
                Some(d) => d.min(release),
                None => release,
            });
        }
        deadline
    }

    fn transition(&mut self, next: IkeSessionState) {
        let responder_spi = self
            .sa
            .as_ref()
            .map(|sa| sa.responder_spi)
            .unwrap_or_default();
        logging::log_ike_state_transition(
            &self.init_spi,
            &responder_spi,
            self.state.name(),
            next.name(),
        );
        self.state = next;
    }

    // ---- Session open: IKE_SA_INIT + IKE_AUTH ----

    /// Kick off the session: build and send the IKE_SA_INIT request.
    pub fn start(&mut self) -> Result<()> {
        if self.state != IkeSessionState::Initial {
            return Err(IkeError::InvalidState(format!(
                "cannot start in state {:?}",
                self.state
            )));
        }

        let dh_group = self.config.ike_proposals[0].dh_group()?;
        let dh = DhKeyPair::generate(dh_group, &mut *self.rng)?;

        let mut nonce = vec![0u8; IKE_NONCE_LEN];
        self.rng.fill_bytes(&mut nonce);
        self.nonce_local = nonce.clone();

        let (nat_source, nat_dest) = nat::build_nat_detection_notifies(
            &self.init_spi,
            &[0u8; 8],
            self.config.local_addr,
            self.config.remote_addr,
        );

        let message = IkeMessage::new(
            IkeHeader::new(
                self.init_spi,
                [0u8; 8],
                PayloadType::SA,
                ExchangeType::IkeSaInit,
                IkeFlags::request(true),
                0,
                0,
            ),
            vec![
                IkePayload::SA(SaPayload::new(self.config.ike_proposals.clone())),
                IkePayload::Nonce(NoncePayload::new(nonce)?),
                IkePayload::KE(KePayload::new(dh_group.transform_id(), dh.public_key().to_vec())),
                IkePayload::N(nat_source),
                IkePayload::N(nat_dest),
            ],
        );

        self.dh = Some(dh);
        let bytes = message.encode();
        self.init_request_bytes = bytes.clone();
        self.send_raw(bytes.clone());
        self.pending = Some(PendingExchange::new(
            0,
            bytes,
            ExchangePurpose::IkeInit,
            self.clock.now_millis(),
        ));
        logging::log_request_sent("IKE_SA_INIT", 0, self.init_request_bytes.len());
        self.transition(IkeSessionState::IkeInitLocal);
        Ok(())
    }

    fn process_init_response(&mut self, data: &[u8]) -> Result<()> {
        let response = IkeMessage::decode(data)?;

        if let Some(error) = response.first_error_notify() {
            let error = error
                .typed()
                .and_then(IkeError::from_notify_type)
                .unwrap_or_else(|| {
                    IkeError::InvalidSyntax("unrecognized error notify in INIT response".into())
                });
            return Err(error);
        }

        let sa = response
            .sa_payload()
            .ok_or_else(|| IkeError::InvalidSyntax("INIT response without SA".into()))?;
        let chosen =
            proposal::validate_response_proposal(&sa.proposals, &self.config.ike_proposals)?
                .clone();

        let ke = response
            .ke_payload()
            .ok_or_else(|| IkeError::InvalidSyntax("INIT response without KE".into()))?;
        let nonce = response
            .nonce_payload()
            .ok_or_else(|| IkeError::InvalidSyntax("INIT response without nonce".into()))?;

        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| IkeError::Internal("INIT response without DH state".into()))?;
        if ke.dh_group != dh.group().transform_id() {
            return Err(IkeError::InvalidKe {
                expected: dh.group().transform_id(),
                received: ke.dh_group,
            });
        }
        let shared_secret = dh.compute_shared_secret(&ke.key_data)?;

        self.nonce_remote = nonce.nonce.clone();
        let responder_spi = response.header.responder_spi;

        let cipher = chosen.cipher()?;
        let integrity = chosen.integrity()?;
        let mut record = IkeSaRecord::make_ike_sa_record(
            chosen.prf()?,
            &self.nonce_local,
            &self.nonce_remote,
            &shared_secret,
            self.init_spi,
            responder_spi,
            integrity.key_len(),
            cipher.keymat_len(),
            true,
            chosen,
        )?;
        // Message id 0 went to IKE_SA_INIT
        record.allocate_local_request_message_id();

        // NAT detection from the response notifies
        let source_hashes: Vec<&[u8]> = response
            .notify_payloads()
            .filter(|n| n.typed() == Some(NotifyType::NatDetectionSourceIp))
            .map(|n| n.data.as_slice())
            .collect();
        let dest_hashes: Vec<&[u8]> = response
            .notify_payloads()
            .filter(|n| n.typed() == Some(NotifyType::NatDetectionDestinationIp))
            .map(|n| n.data.as_slice())
            .collect();
        self.nat = nat::detect_nat(
            &self.init_spi,
            &responder_spi,
            self.config.remote_addr,
            self.config.local_addr,
            &source_hashes,
            &dest_hashes,
        );
        logging::log_nat_detection(self.nat.local_behind_nat, self.nat.remote_behind_nat);

        self.init_response_bytes = data.to_vec();
        self.sa = Some(record);
        self.dh = None;

        self.send_first_auth_request()
    }

    fn send_first_auth_request(&mut self) -> Result<()> {
        let first_child = self
            .children
            .get_mut(&0)
            .ok_or_else(|| IkeError::Internal("first child session missing".into()))?;
        let child_payloads = first_child.first_child_payloads()?;

        let mut payloads = vec![IkePayload::IDi(self.config.local_identity.clone())];
        if let Some(remote_id) = &self.config.remote_identity {
            payloads.push(IkePayload::IDr(remote_id.clone()));
        }
        payloads.extend(child_payloads);

        self.encrypt_and_send_request(ExchangeType::IkeAuth, payloads, ExchangePurpose::IkeAuth)?;
        self.transition(IkeSessionState::IkeAuthLocal);
        Ok(())
    }

    fn process_auth_response(&mut self, data: &[u8]) -> Result<()> {
        let response = self.decrypt_message(data)?;

        if let Some(error) = response.first_error_notify() {
            let error = error
                .typed()
                .and_then(IkeError::from_notify_type)
                .unwrap_or_else(|| {
                    IkeError::InvalidSyntax("unrecognized error notify in AUTH response".into())
                });
            return Err(error);
        }

        if let Some(eap_packet) = response.eap_payload() {
            let eap_packet = eap_packet.to_vec();
            let eap = self.eap.get_or_insert_with(|| {
                EapStateMachine::new(self.config.eap.clone(), self.sim.clone())
            });

            match eap.process(&eap_packet) {
                EapResult::Response(reply) => {
                    self.encrypt_and_send_request(
                        ExchangeType::IkeAuth,
                        vec![IkePayload::EAP(reply)],
                        ExchangePurpose::IkeAuth,
                    )?;
                    Ok(())
                }
                EapResult::Success { msk, emsk } => {
                    drop(emsk);
                    self.msk = Some(msk);
                    self.send_final_auth_request()
                }
                EapResult::Failure => Err(IkeError::AuthenticationFailed(
                    "EAP authentication failed".into(),
                )),
                EapResult::Error(e) => {
                    Err(IkeError::AuthenticationFailed(e.to_string()))
                }
            }
        } else if response.auth_payload().is_some() {
            self.finish_auth_exchange(&response)
        } else {
            Err(IkeError::InvalidSyntax(
                "IKE_AUTH response with neither EAP nor AUTH".into(),
            ))
        }
    }

    fn send_final_auth_request(&mut self) -> Result<()> {
        let sa = self
            .sa
            .as_ref()
            .ok_or_else(|| IkeError::Internal("AUTH without IKE SA".into()))?;
        let msk = self
            .msk
            .as_ref()
            .ok_or_else(|| IkeError::Internal("final AUTH without MSK".into()))?;

        let prf = sa.proposal.prf()?;
        let octets = auth::signed_octets(
            prf,
            &self.init_request_bytes,
            &self.nonce_remote,
            sa.sk_p_local(),
            &self.config.local_identity,
        )?;
        let auth_payload = auth::compute_auth_from_msk(prf, msk, &octets)?;

        self.encrypt_and_send_request(
            ExchangeType::IkeAuth,
            vec![IkePayload::AUTH(auth_payload)],
            ExchangePurpose::IkeAuth,
        )
    }

    fn finish_auth_exchange(&mut self, response: &IkeMessage) -> Result<()> {
        let (prf, sk_p_remote, sk_d);
        {
            let sa = self
                .sa
                .as_ref()
                .ok_or_else(|| IkeError::Internal("AUTH without IKE SA".into()))?;
            prf = sa.proposal.prf()?;
            sk_p_remote = sa.sk_p_remote().to_vec();
            sk_d = sa.sk_d().to_vec();
        }

        let msk = self
            .msk
            .as_ref()
            .ok_or_else(|| {
                IkeError::AuthenticationFailed("peer AUTH before EAP completed".into())
            })?
            .clone();

        let peer_id = response
            .payloads
            .iter()
            .find_map(|p| match p {
                IkePayload::IDr(id) => Some(id.clone()),
                _ => None,
            })
            .or_else(|| self.config.remote_identity.clone())
            .unwrap_or_else(|| IdPayload::new(crate::ike::message::IdType::KeyId, Vec::new()));

        let received_auth = response
            .auth_payload()
            .ok_or_else(|| IkeError::InvalidSyntax("final AUTH response without AUTH".into()))?;
        let octets = auth::signed_octets(
            prf,
            &self.init_response_bytes,
            &self.nonce_local,
            &sk_p_remote,
            &peer_id,
        )?;
        auth::verify_auth_from_msk(prf, &msk, &octets, received_auth)?;

        // First child rides this exchange: register the remote SPI the
        // moment the SA payload parses, then validate
        if let Some(remote_spi) = response.sa_payload().and_then(|sa| {
            sa.proposals.first().and_then(Proposal::child_spi)
        }) {
            self.provisional_remote_spis.insert(remote_spi, 0);
        }

        let crypto = ChildCryptoCtx { prf, sk_d: &sk_d };
        let nonces = (self.nonce_local.clone(), self.nonce_remote.clone());
        let first_child = self
            .children
            .get_mut(&0)
            .ok_or_else(|| IkeError::Internal("first child session missing".into()))?;

        match first_child.finish_create(&response.payloads, &crypto, Some((&nonces.0, &nonces.1)))
        {
            Ok(done) => {
                self.provisional_remote_spis.remove(&done.remote_spi);
                let now = self.clock.now_millis();
                self.timers.push(TimerEntry {
                    fire_at_ms: now + done.rekey_after_ms,
                    kind: TimerKind::RekeyChild {
                        child_id: 0,
                        record_spi: self.children[&0].local_spi().unwrap_or(0),
                    },
                });

                self.transition(IkeSessionState::Idle);
                let callback = self.callback.clone();
                self.executor.execute(Box::new(move || callback.on_opened()));
                self.drain_queue();
                Ok(())
            }
            Err(e) => {
                self.provisional_remote_spis.clear();
                Err(e)
            }
        }
    }

    // ---- User commands ----

    /// Queue creation of an additional Child Session; returns its id.
    pub fn open_child(
        &mut self,
        config: ChildSessionConfig,
        callback: Arc<dyn ChildSessionCallback>,
    ) -> u32 {
        let child_id = self.next_child_id;
        self.next_child_id += 1;

        let child = ChildSession::new(
            config,
            self.installer.clone(),
            callback,
            self.executor.clone(),
            self.config.remote_addr.ip(),
            None,
        );
        self.children.insert(child_id, child);
        self.queue.enqueue(LocalRequestKind::CreateChild { child_id });
        self.drain_queue();
        child_id
    }

    /// Queue deletion of the child owning this local SPI.
    pub fn close_child(&mut self, local_spi: u32) {
        self.queue.enqueue(LocalRequestKind::DeleteChild { local_spi });
        self.drain_queue();
    }

    /// Queue a rekey of the child owning this local SPI.
    pub fn rekey_child(&mut self, local_spi: u32) {
        self.queue.enqueue(LocalRequestKind::RekeyChild {
            local_spi,
            record_spi: local_spi,
        });
        self.drain_queue();
    }

    /// Queue a rekey of the IKE SA.
    pub fn rekey_ike(&mut self) {
        self.queue.enqueue(LocalRequestKind::RekeyIke);
        self.drain_queue();
    }

    /// Queue a liveness check (empty INFORMATIONAL).
    pub fn check_liveness(&mut self) {
        self.queue.enqueue(LocalRequestKind::Info);
        self.drain_queue();
    }

    /// Close gracefully: pre-empt queued work, tear down children and
    /// delete the IKE SA with the peer.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.queue.clear();

        if self.sa.is_some() && self.state == IkeSessionState::Idle {
            self.queue.enqueue(LocalRequestKind::DeleteIke);
            self.drain_queue();
        } else {
            self.kill();
        }
    }

    /// Force-close without network traffic.
    pub fn kill(&mut self) {
        if self.is_closed() {
            return;
        }
        self.close_all(None);
    }

    // ---- Queue dispatch ----

    fn drain_queue(&mut self) {
        let now = self.clock.now_millis();
        while self.state == IkeSessionState::Idle {
            let Some(request) = self.queue.dequeue_ready(now) else {
                break;
            };
            if let Err(e) = self.dispatch_local_request(request.kind) {
                logging::log_protocol_error("local request", &e.to_string());
                if e.is_fatal() {
                    self.fail_from_response(e);
                    break;
                }
            }
        }
    }

    fn dispatch_local_request(&mut self, kind: LocalRequestKind) -> Result<()> {
        match kind {
            LocalRequestKind::CreateChild { child_id } => {
                let child = self
                    .children
                    .get_mut(&child_id)
                    .ok_or_else(|| IkeError::Internal("create for unknown child".into()))?;
                let payloads = child.start_create(&mut *self.rng)?;
                self.encrypt_and_send_request(
                    ExchangeType::CreateChildSa,
                    payloads,
                    ExchangePurpose::CreateChild { child_id },
                )?;
                self.transition(IkeSessionState::ChildProcedureOngoing);
                Ok(())
            }
            LocalRequestKind::DeleteChild { local_spi } => {
                let Some((child_id, child)) = self.child_by_local_spi(local_spi) else {
                    logging::log_message_dropped(0, "delete for unknown child");
                    return Ok(());
                };
                let payloads = child.start_delete()?;
                self.encrypt_and_send_request(
                    ExchangeType::Informational,
                    payloads,
                    ExchangePurpose::DeleteChild { child_id },
                )?;
                self.transition(IkeSessionState::ChildProcedureOngoing);
                Ok(())
            }
            LocalRequestKind::RekeyChild {
                local_spi,
                record_spi,
            } => {
                let Some((child_id, _)) = self.child_by_local_spi(local_spi) else {
                    logging::log_message_dropped(0, "rekey for unknown child");
                    return Ok(());
                };
                let rng = &mut *self.rng;
                let child = self
                    .children
                    .get_mut(&child_id)
                    .expect("child_id from child_by_local_spi exists in children map");
                // A stale timer for a rekeyed-away record is discarded
                if child.local_spi() != Some(record_spi) {
                    logging::log_message_dropped(0, "stale rekey timer discarded");
                    return Ok(());
                }
                let payloads = child.start_rekey(rng)?;
                self.encrypt_and_send_request(
                    ExchangeType::CreateChildSa,
                    payloads,
                    ExchangePurpose::RekeyChild { child_id },
                )?;
                self.transition(IkeSessionState::ChildProcedureOngoing);
                Ok(())
            }
            LocalRequestKind::RekeyIke => self.start_rekey_ike(),
            LocalRequestKind::Info => {
                self.encrypt_and_send_request(
                    ExchangeType::Informational,
                    Vec::new(),
                    ExchangePurpose::Info,
                )?;
                self.transition(IkeSessionState::ChildProcedureOngoing);
                Ok(())
            }
            LocalRequestKind::DeleteIke => {
                self.encrypt_and_send_request(
                    ExchangeType::Informational,
                    vec![IkePayload::D(DeletePayload::ike_sa())],
                    ExchangePurpose::DeleteIke,
                )?;
                self.transition(IkeSessionState::DeleteIkeLocal);
                Ok(())
            }
        }
    }

    fn start_rekey_ike(&mut self) -> Result<()> {
        let current_proposal = self
            .sa
            .as_ref()
            .map(|sa| sa.proposal.clone())
            .ok_or_else(|| IkeError::Internal("rekey without IKE SA".into()))?;

        let dh_group = current_proposal.dh_group()?;
        let dh = DhKeyPair::generate(dh_group, &mut *self.rng)?;

        let mut new_spi = [0u8; 8];
        self.rng.fill_bytes(&mut new_spi);
        let mut nonce = vec![0u8; IKE_NONCE_LEN];
        self.rng.fill_bytes(&mut nonce);

        let offered = vec![{
            let mut p = current_proposal;
            p.spi = new_spi.to_vec();
            p
        }];

        let payloads = vec![
            IkePayload::SA(SaPayload::new(offered.clone())),
            IkePayload::Nonce(NoncePayload::new(nonce.clone())?),
            IkePayload::KE(KePayload::new(dh_group.transform_id(), dh.public_key().to_vec())),
        ];
        self.encrypt_and_send_request(
            ExchangeType::CreateChildSa,
            payloads,
            ExchangePurpose::RekeyIke,
        )?;

        self.rekey_local = Some(RekeyIkeLocal {
            dh,
            nonce_local: nonce,
            new_init_spi: new_spi,
            offered,
            new_sa: None,
        });
        self.transition(IkeSessionState::RekeyIkeLocal);
        Ok(())
    }

    // ---- Inbound ----

    /// Handle one inbound datagram.
    pub fn handle_datagram(&mut self, data: &[u8]) {
        if self.is_closed() {
            return;
        }

        // Strip the non-ESP marker on the NAT-T port
        let data = if self.nat.needs_encapsulation() && data.starts_with(&NON_ESP_MARKER) {
            &data[NON_ESP_MARKER.len()..]
        } else {
            data
        };

        let header = match IkeHeader::from_bytes(data) {
            Ok(header) => header,
            Err(e) => {
                logging::log_message_dropped(0, &e.to_string());
                return;
            }
        };

        if header.flags.is_response() {
            self.handle_response(&header, data);
        } else {
            self.handle_request(&header, data);
        }
    }

    fn handle_response(&mut self, header: &IkeHeader, data: &[u8]) {
        let Some(pending) = self.pending.as_ref() else {
            logging::log_message_dropped(header.message_id, "response with nothing in flight");
            return;
        };
        if !pending.matches_response(header.message_id) {
            logging::log_message_dropped(header.message_id, "response id does not match request");
            return;
        }
        let purpose = pending.purpose;
        self.pending = None;

        let result = self.route_response(purpose, data);
        if let Err(e) = result {
            logging::log_protocol_error("response", &e.to_string());
            self.handle_response_error(purpose, e);
        } else {
            self.drain_queue();
        }
    }

    fn route_response(&mut self, purpose: ExchangePurpose, data: &[u8]) -> Result<()> {
        match purpose {
            ExchangePurpose::IkeInit => self.process_init_response(data),
            ExchangePurpose::IkeAuth => self.process_auth_response(data),
            ExchangePurpose::CreateChild { child_id } => {
                let response = self.decrypt_message(data)?;
                self.process_child_create_response(child_id, &response)
            }
            ExchangePurpose::RekeyChild { child_id } => {
                let response = self.decrypt_message(data)?;
                self.process_child_rekey_response(child_id, &response)
            }
            ExchangePurpose::RekeyChildDelete { child_id } => {
                let response = self.decrypt_message(data)?;
                let child = self
                    .children
                    .get_mut(&child_id)
                    .ok_or_else(|| IkeError::Internal("rekey delete for unknown child".into()))?;
                let rekey_after_ms = child.finish_rekey_delete(&response.payloads)?;
                let record_spi = child.local_spi().unwrap_or(0);
                let now = self.clock.now_millis();
                self.timers.push(TimerEntry {
                    fire_at_ms: now + rekey_after_ms,
                    kind: TimerKind::RekeyChild {
                        child_id,
                        record_spi,
                    },
                });
                self.transition(IkeSessionState::Idle);
                Ok(())
            }
            ExchangePurpose::DeleteChild { child_id } => {
                let response = self.decrypt_message(data)?;
                let child = self
                    .children
                    .get_mut(&child_id)
                    .ok_or_else(|| IkeError::Internal("delete for unknown child".into()))?;
                child.finish_delete(&response.payloads)?;
                self.remove_closed_children();
                self.transition(IkeSessionState::Idle);
                Ok(())
            }
            ExchangePurpose::RekeyIke => {
                let response = self.decrypt_message(data)?;
                self.process_rekey_ike_response(&response)
            }
            ExchangePurpose::RekeyIkeDelete => {
                let _ = self.decrypt_message(data)?;
                self.finish_rekey_ike_swap()
            }
            ExchangePurpose::DeleteIke => {
                let _ = self.decrypt_message(data)?;
                self.close_all(None);
                Ok(())
            }
            ExchangePurpose::Info => {
                let _ = self.decrypt_message(data)?;
                self.transition(IkeSessionState::Idle);
                Ok(())
            }
        }
    }

    fn process_child_create_response(
        &mut self,
        child_id: u32,
        response: &IkeMessage,
    ) -> Result<()> {
        if let Some(error) = response.first_error_notify() {
            let error = error
                .typed()
                .and_then(IkeError::from_notify_type)
                .unwrap_or_else(|| {
                    IkeError::InvalidSyntax("unknown error notify in create response".into())
                });
            // A failed create is reported to the user; the child closes
            if let Some(child) = self.children.get_mut(&child_id) {
                child.fail_fatally(error.clone());
            }
            self.remove_closed_children();
            self.transition(IkeSessionState::Idle);
            if matches!(error, IkeError::InvalidSyntax(_)) {
                return Err(error);
            }
            return Ok(());
        }

        // Provisional registration precedes validation
        if let Some(remote_spi) = response
            .sa_payload()
            .and_then(|sa| sa.proposals.first().and_then(Proposal::child_spi))
        {
            self.provisional_remote_spis.insert(remote_spi, child_id);
        }

        let (prf, sk_d) = self.child_crypto()?;
        let crypto = ChildCryptoCtx { prf, sk_d: &sk_d };
        let child = self
            .children
            .get_mut(&child_id)
            .ok_or_else(|| IkeError::Internal("create response for unknown child".into()))?;

        match child.finish_create(&response.payloads, &crypto, None) {
            Ok(done) => {
                self.provisional_remote_spis.remove(&done.remote_spi);
                let record_spi = self
                    .children
                    .get(&child_id)
                    .and_then(ChildSession::local_spi)
                    .unwrap_or(0);
                let now = self.clock.now_millis();
                self.timers.push(TimerEntry {
                    fire_at_ms: now + done.rekey_after_ms,
                    kind: TimerKind::RekeyChild {
                        child_id,
                        record_spi,
                    },
                });
                self.transition(IkeSessionState::Idle);
                Ok(())
            }
            Err(e) => {
                self.provisional_remote_spis
                    .retain(|_, id| *id != child_id);
                self.remove_closed_children();
                self.transition(IkeSessionState::Idle);
                Err(e)
            }
        }
    }

    fn process_child_rekey_response(
        &mut self,
        child_id: u32,
        response: &IkeMessage,
    ) -> Result<()> {
        if let Some(error) = response.first_error_notify() {
            let error_kind = error
                .typed()
                .and_then(IkeError::from_notify_type)
                .unwrap_or_else(|| {
                    IkeError::InvalidSyntax("unknown error notify in rekey response".into())
                });

            match error_kind {
                IkeError::TemporaryFailure => {
                    // Silent retry
                    self.reschedule_rekey(child_id, REKEY_RETRY_DELAY_MS);
                    self.reset_child_after_failed_rekey(child_id);
                    self.transition(IkeSessionState::Idle);
                    Ok(())
                }
                IkeError::InvalidSyntax(_) => {
                    if let Some(child) = self.children.get_mut(&child_id) {
                        child.fail_fatally(error_kind.clone());
                    }
                    self.remove_closed_children();
                    self.transition(IkeSessionState::Idle);
                    Err(error_kind)
                }
                other => {
                    // Other protocol errors: schedule a retry
                    logging::log_protocol_error("CREATE_CHILD_SA rekey", &other.to_string());
                    self.reschedule_rekey(child_id, REKEY_RETRY_DELAY_MS);
                    self.reset_child_after_failed_rekey(child_id);
                    self.transition(IkeSessionState::Idle);
                    Ok(())
                }
            }
        } else {
            // Provisional registration precedes validation
            if let Some(remote_spi) = response
                .sa_payload()
                .and_then(|sa| sa.proposals.first().and_then(Proposal::child_spi))
            {
                self.provisional_remote_spis.insert(remote_spi, child_id);
            }

            let (prf, sk_d) = self.child_crypto()?;
            let crypto = ChildCryptoCtx { prf, sk_d: &sk_d };
            let child = self
                .children
                .get_mut(&child_id)
                .ok_or_else(|| IkeError::Internal("rekey response for unknown child".into()))?;

            match child.finish_rekey_create(&response.payloads, &crypto) {
                Ok((done, delete_payloads)) => {
                    self.provisional_remote_spis.remove(&done.remote_spi);
                    self.encrypt_and_send_request(
                        ExchangeType::Informational,
                        delete_payloads,
                        ExchangePurpose::RekeyChildDelete { child_id },
                    )?;
                    Ok(())
                }
                Err(e) => {
                    self.provisional_remote_spis
                        .retain(|_, id| *id != child_id);
                    self.remove_closed_children();
                    self.transition(IkeSessionState::Idle);
                    Err(e)
                }
            }
        }
    }

    fn process_rekey_ike_response(&mut self, response: &IkeMessage) -> Result<()> {
        let mut rekey = self
            .rekey_local
            .take()
            .ok_or_else(|| IkeError::Internal("rekey IKE response without state".into()))?;

        if let Some(error) = response.first_error_notify() {
            let error_kind = error
                .typed()
                .and_then(IkeError::from_notify_type)
                .unwrap_or(IkeError::TemporaryFailure);
            if matches!(error_kind, IkeError::TemporaryFailure) {
                self.queue
                    .enqueue_delayed(LocalRequestKind::RekeyIke, self.clock.now_millis() + REKEY_RETRY_DELAY_MS);
                self.transition(IkeSessionState::Idle);
                return Ok(());
            }
            return Err(error_kind);
        }

        let sa_payload = response
            .sa_payload()
            .ok_or_else(|| IkeError::InvalidSyntax("rekey response without SA".into()))?;
        let chosen =
            proposal::validate_response_proposal(&sa_payload.proposals, &rekey.offered)?;
        if chosen.spi.len() != 8 {
            return Err(IkeError::InvalidSyntax(
                "rekey response proposal without 8-byte SPI".into(),
            ));
        }
        let mut responder_spi = [0u8; 8];
        responder_spi.copy_from_slice(&chosen.spi);

        let nonce = response
            .nonce_payload()
            .ok_or_else(|| IkeError::InvalidSyntax("rekey response without nonce".into()))?;
        let ke = response
            .ke_payload()
            .ok_or_else(|| IkeError::InvalidSyntax("rekey response without KE".into()))?;
        let shared_secret = rekey.dh.compute_shared_secret(&ke.key_data)?;

        let (old_prf, old_sk_d) = {
            let sa = self
                .sa
                .as_ref()
                .ok_or_else(|| IkeError::Internal("rekey without current SA".into()))?;
            (sa.proposal.prf()?, sa.sk_d().to_vec())
        };

        let chosen = chosen.clone();
        let cipher = chosen.cipher()?;
        let integrity = chosen.integrity()?;
        let new_sa = IkeSaRecord::make_rekeyed_ike_sa_record(
            old_prf,
            &old_sk_d,
            chosen.prf()?,
            &rekey.nonce_local,
            &nonce.nonce,
            &shared_secret,
            rekey.new_init_spi,
            responder_spi,
            integrity.key_len(),
            cipher.keymat_len(),
            true,
            chosen,
        )?;

        // Simultaneous rekey resolves on the nonce tie-break once both
        // exchanges completed
        if let Some(remote) = self.rekey_remote.take() {
            let local_wins = rekey.nonce_local < remote.remote_nonce;
            logging::log_rekey_tie_break(local_wins);
            if !local_wins {
                // Peer's new SA survives; ours is discarded and the old
                // SA delete comes from the peer
                self.rekey_remote = Some(remote);
                self.transition(IkeSessionState::RekeyIkeRemote);
                return Ok(());
            }
            // Ours survives; the peer deletes its redundant SA
        }

        rekey.new_sa = Some(new_sa);
        self.rekey_local = Some(rekey);

        // Delete the old SA, then swap
        self.encrypt_and_send_request(
            ExchangeType::Informational,
            vec![IkePayload::D(DeletePayload::ike_sa())],
            ExchangePurpose::RekeyIkeDelete,
        )
    }

    fn finish_rekey_ike_swap(&mut self) -> Result<()> {
        let rekey = self
            .rekey_local
            .take()
            .ok_or_else(|| IkeError::Internal("rekey swap without state".into()))?;
        let new_sa = rekey
            .new_sa
            .ok_or_else(|| IkeError::Internal("rekey swap without new SA".into()))?;

        logging::log_ike_rekey(&self.init_spi, &new_sa.initiator_spi);
        self.init_spi = new_sa.initiator_spi;
        self.sa = Some(new_sa);
        self.transition(IkeSessionState::Idle);
        Ok(())
    }

    fn handle_response_error(&mut self, purpose: ExchangePurpose, error: IkeError) {
        match purpose {
            ExchangePurpose::IkeInit | ExchangePurpose::IkeAuth => {
                self.fail_from_response(error);
            }
            _ => {
                if error.is_fatal() {
                    self.fail_from_response(error);
                } else {
                    self.transition(IkeSessionState::Idle);
                    self.drain_queue();
                }
            }
        }
    }

    // ---- Inbound requests ----

    fn handle_request(&mut self, header: &IkeHeader, data: &[u8]) {
        let (expected, cached_response) = match self.sa.as_ref() {
            Some(sa) => (sa.remote_request_message_id(), sa.last_response.clone()),
            None => {
                logging::log_message_dropped(header.message_id, "request before IKE SA exists");
                return;
            }
        };

        if header.message_id != expected {
            // The peer retransmitting its last request gets the cached
            // response, byte-identical; anything else is ignored
            if expected > 0 && header.message_id == expected - 1 {
                if let Some(cached) = cached_response {
                    logging::log_message_dropped(header.message_id, "duplicate request, replaying");
                    self.send_raw(cached);
                    return;
                }
            }
            logging::log_message_dropped(header.message_id, "unexpected request message id");
            return;
        }

        let previous_state = self.state;
        self.transition(IkeSessionState::Receiving);

        let message = match self.decrypt_message(data) {
            Ok(message) => message,
            Err(e) => {
                // Integrity or syntax failure on a request: leave state
                // unchanged; a forged packet must not disturb the SA
                logging::log_message_dropped(header.message_id, &e.to_string());
                self.state = previous_state;
                return;
            }
        };

        let subtype = classify_inbound_request(&message);
        let result = self.dispatch_request(previous_state, subtype, &message);

        if let Err(e) = result {
            logging::log_protocol_error("inbound request", &e.to_string());
            // Fault in a request: answer with the matching notify, then
            // close if fatal
            let notify = e
                .to_notify_type()
                .map(NotifyPayload::new)
                .map(|n| vec![IkePayload::N(n)])
                .unwrap_or_default();
            let _ = self.send_response(&message.header, notify);
            if e.is_fatal() {
                self.close_all(Some(e));
            } else {
                self.state = previous_state;
            }
        }
    }

    fn dispatch_request(
        &mut self,
        previous_state: IkeSessionState,
        subtype: IkeExchangeSubType,
        message: &IkeMessage,
    ) -> Result<()> {
        match subtype {
            IkeExchangeSubType::DeleteIke => {
                self.send_response(&message.header, Vec::new())?;
                if previous_state == IkeSessionState::RekeyIkeRemote {
                    // The old SA dies as the tail of a remote rekey
                    let remote = self
                        .rekey_remote
                        .take()
                        .ok_or_else(|| IkeError::Internal("remote rekey state missing".into()))?;
                    logging::log_ike_rekey(&self.init_spi, &remote.new_sa.initiator_spi);
                    self.init_spi = remote.new_sa.initiator_spi;
                    self.sa = Some(remote.new_sa);
                    self.transition(IkeSessionState::Idle);
                    self.drain_queue();
                } else {
                    self.close_all(None);
                }
                Ok(())
            }
            IkeExchangeSubType::DeleteChild => {
                let mut response_payloads = Vec::new();
                for delete in message.delete_payloads() {
                    for remote_spi in delete.child_spis() {
                        match self.child_by_remote_spi(remote_spi) {
                            Some((child_id, child)) => {
                                let local_spi = child.local_spi();
                                let mut payloads = child.handle_delete_request(remote_spi)?;
                                response_payloads.append(&mut payloads);
                                self.queue.cancel_for_child(child_id);
                                if let Some(local_spi) = local_spi {
                                    self.queue.cancel_for_child(local_spi);
                                }
                            }
                            None => {
                                logging::log_message_dropped(
                                    message.header.message_id,
                                    "delete for unknown child SPI",
                                );
                            }
                        }
                    }
                }
                self.send_response(&message.header, response_payloads)?;
                self.remove_closed_children();
                self.state = previous_state;
                self.drain_queue();
                Ok(())
            }
            IkeExchangeSubType::RekeyChild => {
                let rekey_spi = message
                    .notify(NotifyType::RekeySa)
                    .and_then(NotifyPayload::child_spi)
                    .ok_or_else(|| {
                        IkeError::InvalidSyntax("rekey child without REKEY_SA SPI".into())
                    })?;

                let (prf, sk_d) = self.child_crypto()?;
                let Some((child_id, _)) = self.child_by_remote_spi(rekey_spi) else {
                    return Err(IkeError::ChildSaNotFound(rekey_spi));
                };

                let crypto = ChildCryptoCtx { prf, sk_d: &sk_d };
                let child = self.children.get_mut(&child_id).expect("resolved above");
                let response =
                    child.handle_rekey_request(&message.payloads, &crypto, &mut *self.rng)?;
                self.send_response(&message.header, response)?;

                if self.children[&child_id].state() == ChildState::RekeyChildRemoteDelete {
                    let now = self.clock.now_millis();
                    self.timers.push(TimerEntry {
                        fire_at_ms: now + REKEY_REMOTE_DELETE_WATCHDOG_MS,
                        kind: TimerKind::RekeyWatchdog { child_id },
                    });
                }
                self.state = previous_state;
                Ok(())
            }
            IkeExchangeSubType::CreateChild => {
                // A mobile endpoint does not accept peer-created children
                self.send_response(
                    &message.header,
                    vec![IkePayload::N(NotifyPayload::new(NotifyType::NoAdditionalSas))],
                )?;
                self.state = previous_state;
                Ok(())
            }
            IkeExchangeSubType::RekeyIke => {
                self.handle_rekey_ike_request(previous_state, message)
            }
            IkeExchangeSubType::InformationalOther => {
                self.send_response(&message.header, Vec::new())?;
                self.state = previous_state;
                Ok(())
            }
        }
    }

    fn handle_rekey_ike_request(
        &mut self,
        previous_state: IkeSessionState,
        message: &IkeMessage,
    ) -> Result<()> {
        // A rekey colliding with any other ongoing procedure is pushed
        // back; the peer retries later
        if previous_state != IkeSessionState::Idle
            && previous_state != IkeSessionState::RekeyIkeLocal
        {
            self.send_response(
                &message.header,
                vec![IkePayload::N(NotifyPayload::new(NotifyType::TemporaryFailure))],
            )?;
            self.state = previous_state;
            return Ok(());
        }

        let sa_payload = message
            .sa_payload()
            .ok_or_else(|| IkeError::InvalidSyntax("rekey IKE without SA".into()))?;
        let chosen =
            proposal::select_proposal(&sa_payload.proposals, &self.config.ike_proposals)?;
        if chosen.spi.len() != 8 {
            return Err(IkeError::InvalidSyntax(
                "rekey IKE proposal without 8-byte SPI".into(),
            ));
        }
        let mut peer_new_spi = [0u8; 8];
        peer_new_spi.copy_from_slice(&chosen.spi);
        let chosen = chosen.clone();

        let peer_nonce = message
            .nonce_payload()
            .ok_or_else(|| IkeError::InvalidSyntax("rekey IKE without nonce".into()))?
            .nonce
            .clone();
        let ke = message
            .ke_payload()
            .ok_or_else(|| IkeError::InvalidSyntax("rekey IKE without KE".into()))?;

        let dh_group = chosen.dh_group()?;
        if ke.dh_group != dh_group.transform_id() {
            return Err(IkeError::InvalidKe {
                expected: dh_group.transform_id(),
                received: ke.dh_group,
            });
        }
        let dh = DhKeyPair::generate(dh_group, &mut *self.rng)?;
        let shared_secret = dh.compute_shared_secret(&ke.key_data)?;

        let mut our_spi = [0u8; 8];
        self.rng.fill_bytes(&mut our_spi);
        let mut our_nonce = vec![0u8; IKE_NONCE_LEN];
        self.rng.fill_bytes(&mut our_nonce);

        let (old_prf, old_sk_d) = {
            let sa = self
                .sa
                .as_ref()
                .ok_or_else(|| IkeError::Internal("rekey without current SA".into()))?;
            (sa.proposal.prf()?, sa.sk_d().to_vec())
        };

        let cipher = chosen.cipher()?;
        let integrity = chosen.integrity()?;
        let new_sa = IkeSaRecord::make_rekeyed_ike_sa_record(
            old_prf,
            &old_sk_d,
            chosen.prf()?,
            &peer_nonce,
            &our_nonce,
            &shared_secret,
            peer_new_spi,
            our_spi,
            integrity.key_len(),
            cipher.keymat_len(),
            false,
            chosen.clone(),
        )?;

        let mut response_proposal = chosen;
        response_proposal.spi = our_spi.to_vec();
        let response = vec![
            IkePayload::SA(SaPayload::new(vec![response_proposal])),
            IkePayload::Nonce(NoncePayload::new(our_nonce)?),
            IkePayload::KE(KePayload::new(dh_group.transform_id(), dh.public_key().to_vec())),
        ];
        self.send_response(&message.header, response)?;

        self.rekey_remote = Some(RekeyIkeRemote {
            new_sa,
            remote_nonce: peer_nonce,
        });

        if previous_state == IkeSessionState::RekeyIkeLocal {
            // Both sides rekeying: the tie-break fires once our own
            // response arrives
            self.transition(IkeSessionState::RekeyIkeSimul);
        } else {
            self.transition(IkeSessionState::RekeyIkeRemote);
        }
        Ok(())
    }

    // ---- Timers ----

    /// Handle clock progress: retransmissions, rekey timers, queue
    /// releases.
    pub fn handle_tick(&mut self) {
        if self.is_closed() {
            return;
        }
        let now = self.clock.now_millis();

        let mut resend = None;
        let mut gave_up = false;
        if let Some(pending) = self.pending.as_mut() {
            match pending.on_timer(now) {
                RetransmitAction::Resend => {
                    logging::log_retransmit(pending.message_id, pending.attempts);
                    resend = Some(pending.bytes.clone());
                }
                RetransmitAction::GiveUp => gave_up = true,
                RetransmitAction::NotDue => {}
            }
        }
        if gave_up {
            self.pending = None;
            self.fail_from_response(IkeError::Timeout);
            return;
        }
        if let Some(bytes) = resend {
            self.send_raw(bytes);
        }

        let due: Vec<TimerEntry> = {
            let mut due = Vec::new();
            let mut index = 0;
            while index < self.timers.len() {
                if self.timers[index].fire_at_ms <= now {
                    due.push(self.timers.remove(index));
                } else {
                    index += 1;
                }
            }
            due
        };

        for timer in due {
            match timer.kind {
                TimerKind::RekeyChild {
                    child_id,
                    record_spi,
                } => {
                    if let Some(child) = self.children.get(&child_id) {
                        if let Some(local_spi) = child.local_spi() {
                            self.queue.enqueue(LocalRequestKind::RekeyChild {
                                local_spi,
                                record_spi,
                            });
                        }
                    }
                }
                TimerKind::RekeyWatchdog { child_id } => {
                    if let Some(child) = self.children.get_mut(&child_id) {
                        if child.state() == ChildState::RekeyChildRemoteDelete {
                            logging::log_protocol_error(
                                "rekey watchdog",
                                "peer never deleted the old Child SA",
                            );
                            child.fail_fatally(IkeError::Timeout);
                        }
                    }
                    self.remove_closed_children();
                }
            }
        }

        self.drain_queue();
    }

    // ---- Shared helpers ----

    fn child_crypto(&self) -> Result<(crate::ike::crypto::PrfAlgorithm, Vec<u8>)> {
        let sa = self
            .sa
            .as_ref()
            .ok_or_else(|| IkeError::Internal("child operation without IKE SA".into()))?;
        Ok((sa.proposal.prf()?, sa.sk_d().to_vec()))
    }

    fn child_by_local_spi(&mut self, local_spi: u32) -> Option<(u32, &mut ChildSession)> {
        let id = self
            .children
            .iter()
            .find(|(id, child)| {
                child.local_spi() == Some(local_spi) || **id == local_spi
            })
            .map(|(id, _)| *id)?;
        Some((id, self.children.get_mut(&id).unwrap()))
    }

    fn child_by_remote_spi(&mut self, remote_spi: u32) -> Option<(u32, &mut ChildSession)> {
        let id = self
            .children
            .iter()
            .find(|(_, child)| child.owns_remote_spi(remote_spi))
            .map(|(id, _)| *id)
            .or_else(|| self.provisional_remote_spis.get(&remote_spi).copied())?;
        self.children.get_mut(&id).map(|child| (id, child))
    }

    fn reschedule_rekey(&mut self, child_id: u32, delay_ms: u64) {
        if let Some(local_spi) = self.children.get(&child_id).and_then(ChildSession::local_spi)
        {
            self.queue.enqueue_delayed(
                LocalRequestKind::RekeyChild {
                    local_spi,
                    record_spi: local_spi,
                },
                self.clock.now_millis() + delay_ms,
            );
        }
    }

    /// Return a child that failed a rekey-create back to Idle.
    fn reset_child_after_failed_rekey(&mut self, child_id: u32) {
        if let Some(child) = self.children.get_mut(&child_id) {
            child.abort_rekey();
        }
    }

    fn remove_closed_children(&mut self) {
        let closed: Vec<u32> = self
            .children
            .iter()
            .filter(|(id, child)| **id != 0 && child.state() == ChildState::Closed)
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            self.children.remove(&id);
            self.provisional_remote_spis.retain(|_, child| *child != id);
        }
    }

    fn encrypt_and_send_request(
        &mut self,
        exchange_type: ExchangeType,
        payloads: Vec<IkePayload>,
        purpose: ExchangePurpose,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        if self.pending.is_some() {
            return Err(IkeError::InvalidState(
                "an exchange is already in flight".into(),
            ));
        }
        let sa = self
            .sa
            .as_mut()
            .ok_or_else(|| IkeError::Internal("send before IKE SA exists".into()))?;

        let message_id = sa.allocate_local_request_message_id();
        let header = IkeHeader::new(
            sa.initiator_spi,
            sa.responder_spi,
            PayloadType::SK,
            exchange_type,
            IkeFlags::request(sa.is_local_init),
            message_id,
            0,
        );

        let message = IkeMessage::new(header, payloads);
        let cipher = sa.proposal.cipher()?;
        let integrity = sa.proposal.integrity()?;
        let bytes = message.encode_encrypted(
            cipher,
            integrity,
            sa.outbound_integrity_key(),
            sa.outbound_encryption_key(),
            &mut *self.rng,
        )?;

        logging::log_request_sent(
            match exchange_type {
                ExchangeType::IkeSaInit => "IKE_SA_INIT",
                ExchangeType::IkeAuth => "IKE_AUTH",
                ExchangeType::CreateChildSa => "CREATE_CHILD_SA",
                ExchangeType::Informational => "INFORMATIONAL",
            },
            message_id,
            bytes.len(),
        );

        self.send_raw(bytes.clone());
        self.pending = Some(PendingExchange::new(message_id, bytes, purpose, now));
        Ok(())
    }

    fn send_response(
        &mut self,
        request_header: &IkeHeader,
        payloads: Vec<IkePayload>,
    ) -> Result<()> {
        let sa = self
            .sa
            .as_mut()
            .ok_or_else(|| IkeError::Internal("response before IKE SA exists".into()))?;

        let header = IkeHeader::new(
            sa.initiator_spi,
            sa.responder_spi,
            PayloadType::SK,
            request_header.exchange_type,
            IkeFlags::response(sa.is_local_init),
            request_header.message_id,
            0,
        );

        let message = IkeMessage::new(header, payloads);
        let cipher = sa.proposal.cipher()?;
        let integrity = sa.proposal.integrity()?;
        let bytes = message.encode_encrypted(
            cipher,
            integrity,
            sa.outbound_integrity_key(),
            sa.outbound_encryption_key(),
            &mut *self.rng,
        )?;

        sa.last_response = Some(bytes.clone());
        sa.advance_remote_request_message_id();
        self.send_raw(bytes);
        Ok(())
    }

    fn decrypt_message(&mut self, data: &[u8]) -> Result<IkeMessage> {
        let sa = self
            .sa
            .as_ref()
            .ok_or_else(|| IkeError::Internal("decrypt before IKE SA exists".into()))?;
        IkeMessage::decode_encrypted(
            data,
            sa.proposal.cipher()?,
            sa.proposal.integrity()?,
            sa.inbound_integrity_key(),
            sa.inbound_decryption_key(),
        )
    }

    fn send_raw(&mut self, mut bytes: Vec<u8>) {
        if self.nat.needs_encapsulation() {
            let mut framed = Vec::with_capacity(NON_ESP_MARKER.len() + bytes.len());
            framed.extend_from_slice(&NON_ESP_MARKER);
            framed.append(&mut bytes);
            self.outbox.push(framed);
        } else {
            self.outbox.push(bytes);
        }
    }

    /// Fatal error triggered by a response (or timeout): send Delete-IKE
    /// best-effort, then close.
    fn fail_from_response(&mut self, error: IkeError) {
        if self.sa.is_some() && !matches!(self.state, IkeSessionState::Initial) {
            self.pending = None;
            let _ = self.encrypt_and_send_request(
                ExchangeType::Informational,
                vec![IkePayload::D(DeletePayload::ike_sa())],
                ExchangePurpose::DeleteIke,
            );
        }
        self.close_all(Some(error));
    }

    fn close_all(&mut self, error: Option<IkeError>) {
        for (_, child) in self.children.iter_mut() {
            child.kill();
        }
        self.children.clear();
        self.provisional_remote_spis.clear();
        self.queue.clear();
        self.timers.clear();
        self.pending = None;
        self.rekey_local = None;
        self.rekey_remote = None;
        self.eap = None;
        self.msk = None;
        self.sa = None;

        self.transition(IkeSessionState::Closed);

        let callback = self.callback.clone();
        match error {
            Some(error) => self
                .executor
                .execute(Box::new(move || callback.on_error(error))),
            None => self.executor.execute(Box::new(move || callback.on_closed())),
        }
    }
}

impl std::fmt::Debug for IkeSessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IkeSessionCore")
            .field("state", &self.state)
            .field("children", &self.children.len())
            .field("queued_requests", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ike::message::DeletePayload;

    fn informational_request(deletes: Vec<DeletePayload>) -> IkeMessage {
        IkeMessage::new(
            IkeHeader::new(
                [1; 8],
                [2; 8],
                PayloadType::SK,
                ExchangeType::Informational,
                IkeFlags::request(false),
                0,
                0,
            ),
            deletes.into_iter().map(IkePayload::D).collect(),
        )
    }

    #[test]
    fn test_classify_delete_ike() {
        let message = informational_request(vec![DeletePayload::ike_sa()]);
        assert_eq!(
            classify_inbound_request(&message),
            IkeExchangeSubType::DeleteIke
        );
    }

    #[test]
    fn test_classify_delete_child() {
        let message = informational_request(vec![DeletePayload::child_sas(&[7])]);
        assert_eq!(
            classify_inbound_request(&message),
            IkeExchangeSubType::DeleteChild
        );
    }

    #[test]
    fn test_classify_informational_other() {
        let message = informational_request(vec![]);
        assert_eq!(
            classify_inbound_request(&message),
            IkeExchangeSubType::InformationalOther
        );
    }

    #[test]
    fn test_classify_rekey_ike() {
        let proposal = Proposal::new(1, ProtocolId::Ike).with_spi(vec![0; 8]);
        let message = IkeMessage::new(
            IkeHeader::new(
                [1; 8],
                [2; 8],
                PayloadType::SK,
                ExchangeType::CreateChildSa,
                IkeFlags::request(false),
                0,
                0,
            ),
            vec![IkePayload::SA(SaPayload::new(vec![proposal]))],
        );
        assert_eq!(
            classify_inbound_request(&message),
            IkeExchangeSubType::RekeyIke
        );
    }

    #[test]
    fn test_classify_rekey_child() {
        let proposal = Proposal::new(1, ProtocolId::Esp).with_spi(vec![0; 4]);
        let message = IkeMessage::new(
            IkeHeader::new(
                [1; 8],
                [2; 8],
                PayloadType::SK,
                ExchangeType::CreateChildSa,
                IkeFlags::request(false),
                0,
                0,
            ),
            vec![
                IkePayload::N(NotifyPayload::rekey_sa(9)),
                IkePayload::SA(SaPayload::new(vec![proposal])),
            ],
        );
        assert_eq!(
            classify_inbound_request(&message),
            IkeExchangeSubType::RekeyChild
        );
    }

    #[test]
    fn test_classify_create_child() {
        let proposal = Proposal::new(1, ProtocolId::Esp).with_spi(vec![0; 4]);
        let message = IkeMessage::new(
            IkeHeader::new(
                [1; 8],
                [2; 8],
                PayloadType::SK,
                ExchangeType::CreateChildSa,
                IkeFlags::request(false),
                0,
                0,
            ),
            vec![IkePayload::SA(SaPayload::new(vec![proposal]))],
        );
        assert_eq!(
            classify_inbound_request(&message),
            IkeExchangeSubType::CreateChild
        );
    }
}
