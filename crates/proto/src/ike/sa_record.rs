//! SA keying records
//!
//! `IkeSaRecord` and `ChildSaRecord` hold SPIs, negotiated proposals and
//! derived key material, plus the message-id counters that enforce the
//! window-size-1 exchange discipline. Key derivation follows RFC 7296
//! Sections 2.13/2.14/2.17:
//!
//! ```text
//! SKEYSEED = prf(Ni | Nr, g^ir)
//! {SK_d | SK_ai | SK_ar | SK_ei | SK_er | SK_pi | SK_pr}
//!     = prf+ (SKEYSEED, Ni | Nr | SPIi | SPIr)
//!
//! KEYMAT = prf+ (SK_d, [g^ir (new) |] Ni | Nr)        (Child SAs)
//! SKEYSEED = prf(SK_d (old), g^ir (new) | Ni | Nr)    (Rekey-IKE)
//! ```
//!
//! Keys live only inside these records and are zeroized when the record
//! is dropped. They are never formatted into log output.

use super::crypto::PrfAlgorithm;
use super::proposal::Proposal;
use super::ts::TrafficSelectorsPayload;
use super::Result;
use krait_platform::{OwnedSpi, OwnedTransform};
use zeroize::Zeroize;

/// IKE SA keying record.
pub struct IkeSaRecord {
    /// Initiator SPI (8 bytes, opaque)
    pub initiator_spi: [u8; 8],

    /// Responder SPI (8 bytes)
    pub responder_spi: [u8; 8],

    /// Whether the local side initiated this SA
    pub is_local_init: bool,

    /// Negotiated IKE proposal
    pub proposal: Proposal,

    sk_d: Vec<u8>,
    sk_ai: Vec<u8>,
    sk_ar: Vec<u8>,
    sk_ei: Vec<u8>,
    sk_er: Vec<u8>,
    sk_pi: Vec<u8>,
    sk_pr: Vec<u8>,

    /// Message id of the next locally-initiated request
    local_request_message_id: u32,

    /// Message id expected on the next remote request
    remote_request_message_id: u32,

    /// Cached encoded response to the last handled remote request,
    /// replayed when the peer retransmits
    pub last_response: Option<Vec<u8>>,
}

impl IkeSaRecord {
    /// Derive the record for a fresh IKE SA (end of IKE_SA_INIT).
    ///
    /// # Arguments
    ///
    /// * `prf` - Negotiated PRF
    /// * `nonce_i` / `nonce_r` - Exchange nonces
    /// * `shared_secret` - DH shared secret `g^ir`
    /// * `initiator_spi` / `responder_spi` - Header SPIs
    /// * `integ_key_len` - Integrity key length (0 for AEAD)
    /// * `encr_keymat_len` - Cipher key material length (salt included)
    /// * `is_local_init` - Local side initiated
    /// * `proposal` - Negotiated proposal
    #[allow(clippy::too_many_arguments)]
    pub fn make_ike_sa_record(
        prf: PrfAlgorithm,
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared_secret: &[u8],
        initiator_spi: [u8; 8],
        responder_spi: [u8; 8],
        integ_key_len: usize,
        encr_keymat_len: usize,
        is_local_init: bool,
        proposal: Proposal,
    ) -> Result<Self> {
        let skeyseed = compute_skeyseed(prf, nonce_i, nonce_r, shared_secret)?;

        Self::from_skeyseed(
            prf,
            &skeyseed,
            nonce_i,
            nonce_r,
            initiator_spi,
            responder_spi,
            integ_key_len,
            encr_keymat_len,
            is_local_init,
            proposal,
        )
    }

    /// Derive the record for a rekeyed IKE SA.
    ///
    /// SKEYSEED chains from the old SA: `prf(SK_d old, g^ir new | Ni | Nr)`,
    /// computed with the old SA's PRF; the split uses the new proposal's.
    #[allow(clippy::too_many_arguments)]
    pub fn make_rekeyed_ike_sa_record(
        old_prf: PrfAlgorithm,
        old_sk_d: &[u8],
        new_prf: PrfAlgorithm,
        nonce_i: &[u8],
        nonce_r: &[u8],
        new_shared_secret: &[u8],
        initiator_spi: [u8; 8],
        responder_spi: [u8; 8],
        integ_key_len: usize,
        encr_keymat_len: usize,
        is_local_init: bool,
        proposal: Proposal,
    ) -> Result<Self> {
        let mut seed =
            Vec::with_capacity(new_shared_secret.len() + nonce_i.len() + nonce_r.len());
        seed.extend_from_slice(new_shared_secret);
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);

        let skeyseed = old_prf.compute(old_sk_d, &seed)?;

        Self::from_skeyseed(
            new_prf,
            &skeyseed,
            nonce_i,
            nonce_r,
            initiator_spi,
            responder_spi,
            integ_key_len,
            encr_keymat_len,
            is_local_init,
            proposal,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn from_skeyseed(
        prf: PrfAlgorithm,
        skeyseed: &[u8],
        nonce_i: &[u8],
        nonce_r: &[u8],
        initiator_spi: [u8; 8],
        responder_spi: [u8; 8],
        integ_key_len: usize,
        encr_keymat_len: usize,
        is_local_init: bool,
        proposal: Proposal,
    ) -> Result<Self> {
        let prf_key_len = prf.key_len();
        let total_len =
            prf_key_len + 2 * integ_key_len + 2 * encr_keymat_len + 2 * prf_key_len;

        let mut seed = Vec::with_capacity(nonce_i.len() + nonce_r.len() + 16);
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);
        seed.extend_from_slice(&initiator_spi);
        seed.extend_from_slice(&responder_spi);

        let mut keymat = prf.prf_plus(skeyseed, &seed, total_len)?;

        let mut offset = 0;
        let mut take = |len: usize| {
            let slice = keymat[offset..offset + len].to_vec();
            offset += len;
            slice
        };

        let sk_d = take(prf_key_len);
        let sk_ai = take(integ_key_len);
        let sk_ar = take(integ_key_len);
        let sk_ei = take(encr_keymat_len);
        let sk_er = take(encr_keymat_len);
        let sk_pi = take(prf_key_len);
        let sk_pr = take(prf_key_len);

        keymat.zeroize();

        Ok(IkeSaRecord {
            initiator_spi,
            responder_spi,
            is_local_init,
            proposal,
            sk_d,
            sk_ai,
            sk_ar,
            sk_ei,
            sk_er,
            sk_pi,
            sk_pr,
            local_request_message_id: 0,
            remote_request_message_id: 0,
            last_response: None,
        })
    }

    /// Key-derivation key for Child SAs and IKE rekeys
    pub fn sk_d(&self) -> &[u8] {
        &self.sk_d
    }

    /// PRF key for the local AUTH payload
    pub fn sk_p_local(&self) -> &[u8] {
        if self.is_local_init {
            &self.sk_pi
        } else {
            &self.sk_pr
        }
    }

    /// PRF key for verifying the peer's AUTH payload
    pub fn sk_p_remote(&self) -> &[u8] {
        if self.is_local_init {
            &self.sk_pr
        } else {
            &self.sk_pi
        }
    }

    /// Integrity key for outbound messages
    pub fn outbound_integrity_key(&self) -> &[u8] {
        if self.is_local_init {
            &self.sk_ai
        } else {
            &self.sk_ar
        }
    }

    /// Integrity key for inbound messages
    pub fn inbound_integrity_key(&self) -> &[u8] {
        if self.is_local_init {
            &self.sk_ar
        } else {
            &self.sk_ai
        }
    }

    /// Cipher key material for outbound messages
    pub fn outbound_encryption_key(&self) -> &[u8] {
        if self.is_local_init {
            &self.sk_ei
        } else {
            &self.sk_er
        }
    }

    /// Cipher key material for inbound messages
    pub fn inbound_decryption_key(&self) -> &[u8] {
        if self.is_local_init {
            &self.sk_er
        } else {
            &self.sk_ei
        }
    }

    /// Message id for the next locally-initiated request (not consumed)
    pub fn local_request_message_id(&self) -> u32 {
        self.local_request_message_id
    }

    /// Consume and return the next local request message id
    pub fn allocate_local_request_message_id(&mut self) -> u32 {
        let id = self.local_request_message_id;
        self.local_request_message_id += 1;
        id
    }

    /// Message id expected on the next remote request
    pub fn remote_request_message_id(&self) -> u32 {
        self.remote_request_message_id
    }

    /// Record that the current remote request was handled
    pub fn advance_remote_request_message_id(&mut self) {
        self.remote_request_message_id += 1;
    }
}

impl Drop for IkeSaRecord {
    fn drop(&mut self) {
        self.sk_d.zeroize();
        self.sk_ai.zeroize();
        self.sk_ar.zeroize();
        self.sk_ei.zeroize();
        self.sk_er.zeroize();
        self.sk_pi.zeroize();
        self.sk_pr.zeroize();
    }
}

impl std::fmt::Debug for IkeSaRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material is deliberately omitted
        f.debug_struct("IkeSaRecord")
            .field("initiator_spi", &hex::encode(self.initiator_spi))
            .field("responder_spi", &hex::encode(self.responder_spi))
            .field("is_local_init", &self.is_local_init)
            .field("local_request_message_id", &self.local_request_message_id)
            .field("remote_request_message_id", &self.remote_request_message_id)
            .finish()
    }
}

/// Directional key set for one Child SA pair.
pub struct ChildSaKeys {
    /// Initiator-to-responder encryption key material
    pub encr_i: Vec<u8>,
    /// Initiator-to-responder integrity key
    pub auth_i: Vec<u8>,
    /// Responder-to-initiator encryption key material
    pub encr_r: Vec<u8>,
    /// Responder-to-initiator integrity key
    pub auth_r: Vec<u8>,
}

impl ChildSaKeys {
    /// Expand Child SA key material from SK_d (RFC 7296 Section 2.17).
    ///
    /// With PFS the fresh DH secret prefixes the nonces in the seed.
    pub fn derive(
        prf: PrfAlgorithm,
        sk_d: &[u8],
        new_shared_secret: Option<&[u8]>,
        nonce_i: &[u8],
        nonce_r: &[u8],
        encr_keymat_len: usize,
        integ_key_len: usize,
    ) -> Result<Self> {
        let mut seed = Vec::new();
        if let Some(secret) = new_shared_secret {
            seed.extend_from_slice(secret);
        }
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);

        let total_len = 2 * encr_keymat_len + 2 * integ_key_len;
        let mut keymat = prf.prf_plus(sk_d, &seed, total_len)?;

        let mut offset = 0;
        let mut take = |len: usize| {
            let slice = keymat[offset..offset + len].to_vec();
            offset += len;
            slice
        };

        let encr_i = take(encr_keymat_len);
        let auth_i = take(integ_key_len);
        let encr_r = take(encr_keymat_len);
        let auth_r = take(integ_key_len);

        keymat.zeroize();

        Ok(ChildSaKeys {
            encr_i,
            auth_i,
            encr_r,
            auth_r,
        })
    }

    /// Outbound (encryption, integrity) keys for the given role
    pub fn outbound(&self, is_local_init: bool) -> (&[u8], &[u8]) {
        if is_local_init {
            (&self.encr_i, &self.auth_i)
        } else {
            (&self.encr_r, &self.auth_r)
        }
    }

    /// Inbound (encryption, integrity) keys for the given role
    pub fn inbound(&self, is_local_init: bool) -> (&[u8], &[u8]) {
        if is_local_init {
            (&self.encr_r, &self.auth_r)
        } else {
            (&self.encr_i, &self.auth_i)
        }
    }
}

impl Drop for ChildSaKeys {
    fn drop(&mut self) {
        self.encr_i.zeroize();
        self.auth_i.zeroize();
        self.encr_r.zeroize();
        self.auth_r.zeroize();
    }
}

impl std::fmt::Debug for ChildSaKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSaKeys").finish()
    }
}

/// Child SA keying record.
///
/// Owns the allocated local SPI and both installed transforms; dropping
/// the record is the single release path for all three.
#[derive(Debug)]
pub struct ChildSaRecord {
    /// Locally allocated inbound SPI
    pub local_spi: OwnedSpi,

    /// Peer-chosen outbound SPI
    pub remote_spi: u32,

    /// Whether the local side initiated this Child SA
    pub is_local_init: bool,

    /// Transport mode instead of tunnel mode
    pub is_transport: bool,

    /// Negotiated proposal
    pub proposal: Proposal,

    /// Local traffic selectors
    pub local_ts: TrafficSelectorsPayload,

    /// Remote traffic selectors
    pub remote_ts: TrafficSelectorsPayload,

    /// Installed inbound transform
    pub inbound_transform: Option<OwnedTransform>,

    /// Installed outbound transform
    pub outbound_transform: Option<OwnedTransform>,

    /// Derived keys (zeroized on drop)
    pub keys: ChildSaKeys,
}

impl ChildSaRecord {
    /// The local (inbound) SPI value
    pub fn local_spi_value(&self) -> u32 {
        self.local_spi.spi()
    }

    /// Both transforms are installed
    pub fn is_fully_installed(&self) -> bool {
        self.inbound_transform.is_some() && self.outbound_transform.is_some()
    }
}

/// Compute SKEYSEED for a fresh SA (RFC 7296 Section 2.14).
///
/// PRFs with a fixed key size take half the key from each nonce; the
/// variable-key HMAC PRFs use both nonces whole.
pub fn compute_skeyseed(
    prf: PrfAlgorithm,
    nonce_i: &[u8],
    nonce_r: &[u8],
    shared_secret: &[u8],
) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(nonce_i.len() + nonce_r.len());
    match prf {
        PrfAlgorithm::HmacSha1 => {
            key.extend_from_slice(nonce_i);
            key.extend_from_slice(nonce_r);
        }
        PrfAlgorithm::Aes128Xcbc => {
            let half = prf.key_len() / 2;
            key.extend_from_slice(&nonce_i[..half.min(nonce_i.len())]);
            key.extend_from_slice(&nonce_r[..half.min(nonce_r.len())]);
        }
    }
    prf.compute(&key, shared_secret)
}
