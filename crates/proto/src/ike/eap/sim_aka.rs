//! EAP-SIM / EAP-AKA / EAP-AKA' method machine (RFC 4186 / 4187 / 5448)
//!
//! Handles the Start, Challenge, Identity and Notification rounds of one
//! method, driving the SIM through the `SimAuthProvider` collaborator and
//! producing the MSK/EMSK on a successful challenge.
//!
//! Key derivation:
//!
//! ```text
//! EAP-SIM:  MK = SHA1(Identity | Kc1..Kcn | NONCE_MT | Version List | Selected Version)
//! EAP-AKA:  MK = SHA1(Identity | IK | CK)
//!           K_encr(16) | K_aut(16) | MSK(64) | EMSK(64) = FIPS186-2-PRF(MK)
//! EAP-AKA': (CK', IK') from CK/IK and the network name (TS 33.402)
//!           MK = PRF'(IK' | CK', "EAP-AKA'" | Identity)
//!           K_encr(16) | K_aut(32) | K_re(32) | MSK(64) | EMSK(64) = MK
//! ```

use super::message::{EapMessage, TYPE_AKA, TYPE_AKA_PRIME, TYPE_SIM};
use super::EapError;
use hmac::{Hmac, Mac};
use krait_platform::{SimAppType, SimAuthProvider, SimAuthResponse, SimChallenge};
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::sync::Arc;
use zeroize::Zeroize;

// Subtypes (RFC 4186 / 4187 Section 11)
const SUBTYPE_AKA_CHALLENGE: u8 = 1;
const SUBTYPE_AKA_SYNC_FAILURE: u8 = 4;
const SUBTYPE_AKA_IDENTITY: u8 = 5;
const SUBTYPE_SIM_START: u8 = 10;
const SUBTYPE_SIM_CHALLENGE: u8 = 11;
const SUBTYPE_NOTIFICATION: u8 = 12;
const SUBTYPE_REAUTH: u8 = 13;
const SUBTYPE_CLIENT_ERROR: u8 = 14;

// Attributes (RFC 4186 / 4187 Section 10, RFC 5448)
const AT_RAND: u8 = 1;
const AT_AUTN: u8 = 2;
const AT_RES: u8 = 3;
const AT_AUTS: u8 = 4;
const AT_NONCE_MT: u8 = 7;
const AT_PERMANENT_ID_REQ: u8 = 10;
const AT_MAC: u8 = 11;
const AT_NOTIFICATION: u8 = 12;
const AT_ANY_ID_REQ: u8 = 13;
const AT_IDENTITY: u8 = 14;
const AT_VERSION_LIST: u8 = 15;
const AT_SELECTED_VERSION: u8 = 16;
const AT_FULLAUTH_ID_REQ: u8 = 17;
const AT_CLIENT_ERROR_CODE: u8 = 22;
const AT_KDF_INPUT: u8 = 23;
const AT_KDF: u8 = 24;

/// Client error code: unable to process packet
const CLIENT_ERROR_UNABLE_TO_PROCESS: u16 = 0;

/// EAP-SIM protocol version 1
const SIM_VERSION_1: u16 = 1;

/// Keys produced by a completed method exchange.
pub struct EapMethodKeys {
    /// Master Session Key (64 bytes)
    pub msk: Vec<u8>,
    /// Extended Master Session Key (64 bytes)
    pub emsk: Vec<u8>,
}

impl Drop for EapMethodKeys {
    fn drop(&mut self) {
        self.msk.zeroize();
        self.emsk.zeroize();
    }
}

/// One parsed attribute: type and raw value (reserved bytes included).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Attribute {
    attr_type: u8,
    value: Vec<u8>,
}

fn parse_attributes(data: &[u8]) -> Result<Vec<Attribute>, EapError> {
    let mut attributes = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        if offset + 2 > data.len() {
            return Err(EapError::InvalidSyntax("truncated EAP attribute".into()));
        }
        let attr_type = data[offset];
        let length = data[offset + 1] as usize * 4;
        if length < 2 || offset + length > data.len() {
            return Err(EapError::InvalidSyntax(format!(
                "bad EAP attribute length: {}",
                length
            )));
        }
        attributes.push(Attribute {
            attr_type,
            value: data[offset + 2..offset + length].to_vec(),
        });
        offset += length;
    }

    Ok(attributes)
}

fn encode_attribute(attr_type: u8, value: &[u8], buf: &mut Vec<u8>) {
    debug_assert_eq!((2 + value.len()) % 4, 0);
    buf.push(attr_type);
    buf.push(((2 + value.len()) / 4) as u8);
    buf.extend_from_slice(value);
}

fn find_attribute<'a>(attributes: &'a [Attribute], attr_type: u8) -> Option<&'a [u8]> {
    attributes
        .iter()
        .find(|a| a.attr_type == attr_type)
        .map(|a| a.value.as_slice())
}

/// Method state within the challenge flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MethodPhase {
    /// Waiting for Start (SIM) or Challenge
    Created,
    /// Start answered, waiting for Challenge (SIM only)
    Started,
    /// Challenge answered; keys derived, waiting for EAP-Success
    ChallengeAnswered,
}

/// EAP-SIM/AKA/AKA' method machine.
pub struct MethodStateMachine {
    method_type: u8,
    app_type: SimAppType,
    identity: Vec<u8>,
    sim: Arc<dyn SimAuthProvider>,

    phase: MethodPhase,

    // SIM full-auth inputs kept for MK computation
    nonce_mt: [u8; 16],
    version_list: Vec<u8>,

    k_aut: Vec<u8>,
    keys: Option<EapMethodKeys>,
}

impl MethodStateMachine {
    /// Create a method machine for the given EAP method type.
    pub fn new(
        method_type: u8,
        identity: Vec<u8>,
        sim: Arc<dyn SimAuthProvider>,
        rng: &mut dyn RngCore,
    ) -> Self {
        let app_type = if method_type == TYPE_SIM {
            SimAppType::Sim
        } else {
            SimAppType::Usim
        };

        let mut nonce_mt = [0u8; 16];
        rng.fill_bytes(&mut nonce_mt);

        MethodStateMachine {
            method_type,
            app_type,
            identity,
            sim,
            phase: MethodPhase::Created,
            nonce_mt,
            version_list: Vec::new(),
            k_aut: Vec::new(),
            keys: None,
        }
    }

    /// The EAP method type this machine speaks.
    pub fn method_type(&self) -> u8 {
        self.method_type
    }

    /// Whether the challenge completed and key material is available.
    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    /// Take the derived keys after EAP-Success.
    pub fn take_keys(&mut self) -> Option<EapMethodKeys> {
        self.keys.take()
    }

    /// Process one method request; returns the encoded response packet.
    pub fn process(&mut self, request: &EapMessage, raw_packet: &[u8]) -> Result<Vec<u8>, EapError> {
        let (_, type_data) = request
            .type_data
            .as_ref()
            .ok_or_else(|| EapError::InvalidRequest("method packet without type".into()))?;

        if type_data.len() < 3 {
            return Err(EapError::InvalidSyntax("method packet without subtype".into()));
        }
        let subtype = type_data[0];
        let attributes = parse_attributes(&type_data[3..])?;

        match (self.method_type, subtype) {
            (TYPE_SIM, SUBTYPE_SIM_START) => self.process_sim_start(request, &attributes),
            (TYPE_SIM, SUBTYPE_SIM_CHALLENGE) => {
                self.process_sim_challenge(request, raw_packet, &attributes)
            }
            (TYPE_AKA, SUBTYPE_AKA_CHALLENGE) | (TYPE_AKA_PRIME, SUBTYPE_AKA_CHALLENGE) => {
                self.process_aka_challenge(request, raw_packet, &attributes)
            }
            (TYPE_AKA, SUBTYPE_AKA_IDENTITY) | (TYPE_AKA_PRIME, SUBTYPE_AKA_IDENTITY) => {
                Ok(self.identity_response(request.identifier, subtype))
            }
            (_, SUBTYPE_NOTIFICATION) => {
                // Echoed without state change
                Ok(self.build_response(request.identifier, SUBTYPE_NOTIFICATION, &[]))
            }
            (_, SUBTYPE_REAUTH) => {
                // Fast re-authentication carries no re-auth identity store here
                Ok(self.client_error(request.identifier))
            }
            (_, other) => Err(EapError::InvalidRequest(format!(
                "unexpected subtype {} for method {}",
                other, self.method_type
            ))),
        }
    }

    fn process_sim_start(
        &mut self,
        request: &EapMessage,
        attributes: &[Attribute],
    ) -> Result<Vec<u8>, EapError> {
        let version_list = find_attribute(attributes, AT_VERSION_LIST)
            .ok_or_else(|| EapError::InvalidRequest("SIM Start without AT_VERSION_LIST".into()))?;
        if version_list.len() < 4 {
            return Err(EapError::InvalidSyntax("empty AT_VERSION_LIST".into()));
        }

        // Actual length prefix, then 2-byte versions
        let actual_len = u16::from_be_bytes([version_list[0], version_list[1]]) as usize;
        if actual_len + 2 > version_list.len() || actual_len % 2 != 0 {
            return Err(EapError::InvalidSyntax("bad AT_VERSION_LIST length".into()));
        }
        let versions = &version_list[2..2 + actual_len];
        let supported = versions
            .chunks(2)
            .any(|v| u16::from_be_bytes([v[0], v[1]]) == SIM_VERSION_1);
        if !supported {
            return Ok(self.client_error(request.identifier));
        }

        // Kept whole for the MK computation
        self.version_list = versions.to_vec();
        self.phase = MethodPhase::Started;

        let mut body = Vec::new();
        let mut selected = vec![0u8; 2];
        selected.copy_from_slice(&SIM_VERSION_1.to_be_bytes());
        encode_attribute(AT_SELECTED_VERSION, &selected, &mut body);

        let mut nonce_value = vec![0u8; 2];
        nonce_value.extend_from_slice(&self.nonce_mt);
        encode_attribute(AT_NONCE_MT, &nonce_value, &mut body);

        if self.wants_identity(attributes) {
            let mut id_value = (self.identity.len() as u16).to_be_bytes().to_vec();
            id_value.extend_from_slice(&self.identity);
            pad_to_word(&mut id_value);
            encode_attribute(AT_IDENTITY, &id_value, &mut body);
        }

        Ok(self.build_response(request.identifier, SUBTYPE_SIM_START, &body))
    }

    fn process_sim_challenge(
        &mut self,
        request: &EapMessage,
        raw_packet: &[u8],
        attributes: &[Attribute],
    ) -> Result<Vec<u8>, EapError> {
        if self.phase != MethodPhase::Started {
            return Err(EapError::InvalidRequest(
                "SIM Challenge before Start".into(),
            ));
        }

        let rand_value = find_attribute(attributes, AT_RAND)
            .ok_or_else(|| EapError::InvalidRequest("SIM Challenge without AT_RAND".into()))?;
        if rand_value.len() < 2 || (rand_value.len() - 2) % 16 != 0 {
            return Err(EapError::InvalidSyntax("bad AT_RAND value".into()));
        }
        let rands: Vec<&[u8]> = rand_value[2..].chunks(16).collect();
        if rands.len() < 2 || rands.len() > 3 {
            return Err(EapError::InvalidRequest(format!(
                "SIM Challenge with {} RANDs",
                rands.len()
            )));
        }

        // Run the SIM once per RAND
        let mut kc_all = Vec::with_capacity(rands.len() * 8);
        let mut sres_all = Vec::with_capacity(rands.len() * 4);
        for rand in &rands {
            let mut rand_array = [0u8; 16];
            rand_array.copy_from_slice(rand);
            match self
                .sim
                .authenticate(self.app_type, SimChallenge::Gsm { rand: &rand_array })
            {
                Ok(SimAuthResponse::Gsm { sres, kc }) => {
                    sres_all.extend_from_slice(&sres);
                    kc_all.extend_from_slice(&kc);
                }
                Ok(_) => {
                    return Err(EapError::Internal(
                        "SIM returned a UMTS result for a GSM challenge".into(),
                    ))
                }
                Err(e) => return Err(EapError::AuthFailure(e.to_string())),
            }
        }

        // MK = SHA1(Identity | Kc* | NONCE_MT | Version List | Selected Version)
        let mut hasher = Sha1::new();
        hasher.update(&self.identity);
        hasher.update(&kc_all);
        hasher.update(self.nonce_mt);
        hasher.update(&self.version_list);
        hasher.update(SIM_VERSION_1.to_be_bytes());
        let mk = hasher.finalize();

        let keymat = fips186_2_prf(&mk, 160)?;
        self.k_aut = keymat[16..32].to_vec();
        self.keys = Some(EapMethodKeys {
            msk: keymat[32..96].to_vec(),
            emsk: keymat[96..160].to_vec(),
        });

        // Challenge MAC covers the request packet plus NONCE_MT
        if !self.verify_mac(raw_packet, &self.nonce_mt) {
            self.keys = None;
            return Ok(self.client_error(request.identifier));
        }

        self.phase = MethodPhase::ChallengeAnswered;

        // Response carries AT_MAC alone, keyed over packet | sres*
        let mut body = Vec::new();
        encode_attribute(AT_MAC, &[0u8; 18], &mut body);
        let mut response = self.build_response(request.identifier, SUBTYPE_SIM_CHALLENGE, &body);
        self.fill_mac(&mut response, &sres_all);
        Ok(response)
    }

    fn process_aka_challenge(
        &mut self,
        request: &EapMessage,
        raw_packet: &[u8],
        attributes: &[Attribute],
    ) -> Result<Vec<u8>, EapError> {
        let rand_value = find_attribute(attributes, AT_RAND)
            .ok_or_else(|| EapError::InvalidRequest("AKA Challenge without AT_RAND".into()))?;
        let autn_value = find_attribute(attributes, AT_AUTN)
            .ok_or_else(|| EapError::InvalidRequest("AKA Challenge without AT_AUTN".into()))?;
        if rand_value.len() != 18 || autn_value.len() != 18 {
            return Err(EapError::InvalidSyntax("bad AT_RAND/AT_AUTN value".into()));
        }

        let mut rand = [0u8; 16];
        rand.copy_from_slice(&rand_value[2..]);
        let mut autn = [0u8; 16];
        autn.copy_from_slice(&autn_value[2..]);

        let (res, ck, ik) = match self.sim.authenticate(
            self.app_type,
            SimChallenge::Umts {
                rand: &rand,
                autn: &autn,
            },
        ) {
            Ok(SimAuthResponse::Umts { res, ck, ik }) => (res, ck, ik),
            Ok(SimAuthResponse::UmtsSyncFailure { auts }) => {
                // Sequence resynchronization round
                let mut body = Vec::new();
                encode_attribute(AT_AUTS, &auts, &mut body);
                return Ok(self.build_response(
                    request.identifier,
                    SUBTYPE_AKA_SYNC_FAILURE,
                    &body,
                ));
            }
            Ok(_) => {
                return Err(EapError::Internal(
                    "SIM returned a GSM result for a UMTS challenge".into(),
                ))
            }
            Err(e) => return Err(EapError::AuthFailure(e.to_string())),
        };

        if self.method_type == TYPE_AKA_PRIME {
            let network_name = find_attribute(attributes, AT_KDF_INPUT)
                .ok_or_else(|| {
                    EapError::InvalidRequest("AKA' Challenge without AT_KDF_INPUT".into())
                })
                .map(|v| {
                    let actual = u16::from_be_bytes([v[0], v[1]]) as usize;
                    v[2..2 + actual.min(v.len() - 2)].to_vec()
                })?;
            if find_attribute(attributes, AT_KDF).is_none() {
                return Err(EapError::InvalidRequest("AKA' Challenge without AT_KDF".into()));
            }

            // (CK', IK') binding to the access network (TS 33.402 A.2)
            let sqn_xor_ak = &autn[..6];
            let mut s = vec![0x20u8];
            s.extend_from_slice(&network_name);
            s.extend_from_slice(&(network_name.len() as u16).to_be_bytes());
            s.extend_from_slice(sqn_xor_ak);
            s.extend_from_slice(&6u16.to_be_bytes());

            let mut key = Vec::with_capacity(32);
            key.extend_from_slice(&ck);
            key.extend_from_slice(&ik);
            let derived = hmac_sha256(&key, &s)?;
            let ck_prime = &derived[..16];
            let ik_prime = &derived[16..32];

            // MK = PRF'(IK' | CK', "EAP-AKA'" | Identity)
            let mut prf_key = Vec::with_capacity(32);
            prf_key.extend_from_slice(ik_prime);
            prf_key.extend_from_slice(ck_prime);
            let mut data = b"EAP-AKA'".to_vec();
            data.extend_from_slice(&self.identity);
            let mk = prf_prime(&prf_key, &data, 208)?;

            self.k_aut = mk[16..48].to_vec();
            self.keys = Some(EapMethodKeys {
                msk: mk[80..144].to_vec(),
                emsk: mk[144..208].to_vec(),
            });
        } else {
            // MK = SHA1(Identity | IK | CK)
            let mut hasher = Sha1::new();
            hasher.update(&self.identity);
            hasher.update(ik);
            hasher.update(ck);
            let mk = hasher.finalize();

            let keymat = fips186_2_prf(&mk, 160)?;
            self.k_aut = keymat[16..32].to_vec();
            self.keys = Some(EapMethodKeys {
                msk: keymat[32..96].to_vec(),
                emsk: keymat[96..160].to_vec(),
            });
        }

        if !self.verify_mac(raw_packet, &[]) {
            self.keys = None;
            return Ok(self.client_error(request.identifier));
        }

        self.phase = MethodPhase::ChallengeAnswered;

        // Response: AT_RES + AT_MAC (MAC over the response packet alone)
        let mut body = Vec::new();
        let mut res_value = ((res.len() * 8) as u16).to_be_bytes().to_vec();
        res_value.extend_from_slice(&res);
        pad_to_word(&mut res_value);
        encode_attribute(AT_RES, &res_value, &mut body);
        encode_attribute(AT_MAC, &[0u8; 18], &mut body);

        let mut response = self.build_response(request.identifier, SUBTYPE_AKA_CHALLENGE, &body);
        self.fill_mac(&mut response, &[]);
        Ok(response)
    }

    fn identity_response(&self, identifier: u8, subtype: u8) -> Vec<u8> {
        let mut body = Vec::new();
        let mut id_value = (self.identity.len() as u16).to_be_bytes().to_vec();
        id_value.extend_from_slice(&self.identity);
        pad_to_word(&mut id_value);
        encode_attribute(AT_IDENTITY, &id_value, &mut body);
        self.build_response(identifier, subtype, &body)
    }

    fn wants_identity(&self, attributes: &[Attribute]) -> bool {
        [AT_PERMANENT_ID_REQ, AT_FULLAUTH_ID_REQ, AT_ANY_ID_REQ]
            .iter()
            .any(|req| find_attribute(attributes, *req).is_some())
    }

    fn client_error(&self, identifier: u8) -> Vec<u8> {
        let mut body = Vec::new();
        encode_attribute(
            AT_CLIENT_ERROR_CODE,
            &CLIENT_ERROR_UNABLE_TO_PROCESS.to_be_bytes(),
            &mut body,
        );
        self.build_response(identifier, SUBTYPE_CLIENT_ERROR, &body)
    }

    fn build_response(&self, identifier: u8, subtype: u8, attributes: &[u8]) -> Vec<u8> {
        let mut type_data = Vec::with_capacity(3 + attributes.len());
        type_data.push(subtype);
        type_data.extend_from_slice(&[0u8; 2]); // Reserved
        type_data.extend_from_slice(attributes);
        EapMessage::response(identifier, self.method_type, type_data).encode()
    }

    /// Verify the AT_MAC of a received packet over `packet | extra`.
    fn verify_mac(&self, raw_packet: &[u8], extra: &[u8]) -> bool {
        let Some(mac_offset) = find_mac_value_offset(raw_packet) else {
            return false;
        };

        let mut zeroed = raw_packet.to_vec();
        zeroed[mac_offset..mac_offset + 16].fill(0);
        zeroed.extend_from_slice(extra);

        let Ok(expected) = self.compute_mac(&zeroed) else {
            return false;
        };
        expected == raw_packet[mac_offset..mac_offset + 16]
    }

    /// Fill in the AT_MAC of an outbound packet over `packet | extra`.
    fn fill_mac(&self, packet: &mut [u8], extra: &[u8]) {
        let Some(mac_offset) = find_mac_value_offset(packet) else {
            return;
        };

        let mut data = packet.to_vec();
        data[mac_offset..mac_offset + 16].fill(0);
        data.extend_from_slice(extra);

        if let Ok(mac) = self.compute_mac(&data) {
            packet[mac_offset..mac_offset + 16].copy_from_slice(&mac);
        }
    }

    fn compute_mac(&self, data: &[u8]) -> Result<Vec<u8>, EapError> {
        let full = if self.method_type == TYPE_AKA_PRIME {
            hmac_sha256(&self.k_aut, data)?
        } else {
            let mut mac = Hmac::<Sha1>::new_from_slice(&self.k_aut)
                .map_err(|_| EapError::Internal("HMAC key setup failed".into()))?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        };
        Ok(full[..16].to_vec())
    }
}

impl Drop for MethodStateMachine {
    fn drop(&mut self) {
        self.k_aut.zeroize();
    }
}

impl std::fmt::Debug for MethodStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodStateMachine")
            .field("method_type", &self.method_type)
            .field("phase", &self.phase)
            .finish()
    }
}

/// Locate the 16-byte AT_MAC value inside an encoded EAP-SIM/AKA packet.
fn find_mac_value_offset(packet: &[u8]) -> Option<usize> {
    // Header (4) + type (1) + subtype (1) + reserved (2)
    let mut offset = 8;
    while offset + 2 <= packet.len() {
        let attr_type = packet[offset];
        let length = packet[offset + 1] as usize * 4;
        if length < 4 || offset + length > packet.len() {
            return None;
        }
        if attr_type == AT_MAC && length == 20 {
            return Some(offset + 4);
        }
        offset += length;
    }
    None
}

fn pad_to_word(value: &mut Vec<u8>) {
    while (2 + value.len()) % 4 != 0 {
        value.push(0);
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, EapError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| EapError::Internal("HMAC key setup failed".into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// PRF' from RFC 5448 Section 3.4 (HMAC-SHA256 counter mode).
fn prf_prime(key: &[u8], data: &[u8], output_len: usize) -> Result<Vec<u8>, EapError> {
    let mut output = Vec::with_capacity(output_len);
    let mut t: Vec<u8> = Vec::new();
    let mut counter: u8 = 1;

    while output.len() < output_len {
        let mut input = Vec::with_capacity(t.len() + data.len() + 1);
        input.extend_from_slice(&t);
        input.extend_from_slice(data);
        input.push(counter);
        t = hmac_sha256(key, &input)?;
        output.extend_from_slice(&t);
        counter = counter.wrapping_add(1);
    }

    output.truncate(output_len);
    Ok(output)
}

/// The FIPS 186-2 change-notice PRF used by EAP-SIM and EAP-AKA
/// (RFC 4186 Section 7, RFC 4187 Section 7).
///
/// `G` is the raw SHA-1 compression function applied to the zero-padded
/// 160-bit XVAL, without length padding.
pub fn fips186_2_prf(mk: &[u8], output_len: usize) -> Result<Vec<u8>, EapError> {
    if mk.len() != 20 {
        return Err(EapError::Internal("FIPS PRF key must be 20 bytes".into()));
    }

    let mut xkey = [0u8; 20];
    xkey.copy_from_slice(mk);

    let mut output = Vec::with_capacity(output_len);
    while output.len() < output_len {
        for _ in 0..2 {
            let w = sha1_g(&xkey);
            output.extend_from_slice(&w);

            // XKEY = (1 + XKEY + w) mod 2^160
            add_mod_2_160(&mut xkey, &w);
            add_one_mod_2_160(&mut xkey);
        }
    }

    output.truncate(output_len);
    Ok(output)
}

/// Raw SHA-1 compression of a zero-padded single block.
fn sha1_g(xval: &[u8; 20]) -> [u8; 20] {
    use sha1::compress;
    use sha1::digest::generic_array::GenericArray;

    let mut state: [u32; 5] = [0x67452301, 0xEFCDAB89, 0x98BADCFE, 0x10325476, 0xC3D2E1F0];
    let mut block = [0u8; 64];
    block[..20].copy_from_slice(xval);
    compress(&mut state, &[*GenericArray::from_slice(&block)]);

    let mut out = [0u8; 20];
    for (i, word) in state.iter().enumerate() {
        out[i * 4..(i + 1) * 4].copy_from_slice(&word.to_be_bytes());
    }
    out
}

fn add_mod_2_160(acc: &mut [u8; 20], addend: &[u8; 20]) {
    let mut carry = 0u16;
    for i in (0..20).rev() {
        let sum = acc[i] as u16 + addend[i] as u16 + carry;
        acc[i] = sum as u8;
        carry = sum >> 8;
    }
}

fn add_one_mod_2_160(acc: &mut [u8; 20]) {
    for i in (0..20).rev() {
        let (value, overflow) = acc[i].overflowing_add(1);
        acc[i] = value;
        if !overflow {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krait_platform::KraitResult;
    use rand::rngs::OsRng;

    struct FakeSim;

    impl SimAuthProvider for FakeSim {
        fn identity(&self, _app_type: SimAppType) -> KraitResult<Vec<u8>> {
            Ok(b"0test@example.org".to_vec())
        }

        fn authenticate(
            &self,
            _app_type: SimAppType,
            challenge: SimChallenge<'_>,
        ) -> KraitResult<SimAuthResponse> {
            match challenge {
                SimChallenge::Gsm { .. } => Ok(SimAuthResponse::Gsm {
                    sres: [0x11; 4],
                    kc: [0x22; 8],
                }),
                SimChallenge::Umts { .. } => Ok(SimAuthResponse::Umts {
                    res: vec![0x33; 8],
                    ck: [0x44; 16],
                    ik: [0x55; 16],
                }),
            }
        }
    }

    fn machine(method_type: u8) -> MethodStateMachine {
        MethodStateMachine::new(
            method_type,
            b"0test@example.org".to_vec(),
            Arc::new(FakeSim),
            &mut OsRng,
        )
    }

    fn sim_start_request(identifier: u8) -> Vec<u8> {
        // SIM/Start with AT_VERSION_LIST (version 1) and AT_ANY_ID_REQ
        let mut body = Vec::new();
        body.push(SUBTYPE_SIM_START);
        body.extend_from_slice(&[0, 0]);
        encode_attribute(AT_VERSION_LIST, &[0, 2, 0, 1], &mut body);
        encode_attribute(AT_ANY_ID_REQ, &[0, 0], &mut body);

        let mut packet = vec![0x01, identifier, 0, 0, TYPE_SIM];
        packet.extend_from_slice(&body);
        let length = (packet.len() as u16).to_be_bytes();
        packet[2] = length[0];
        packet[3] = length[1];
        packet
    }

    #[test]
    fn test_attribute_roundtrip() {
        let mut buf = Vec::new();
        encode_attribute(AT_SELECTED_VERSION, &[0, 1], &mut buf);
        encode_attribute(AT_ANY_ID_REQ, &[0, 0], &mut buf);

        let attributes = parse_attributes(&buf).unwrap();
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[0].attr_type, AT_SELECTED_VERSION);
        assert_eq!(attributes[0].value, vec![0, 1]);
    }

    #[test]
    fn test_attribute_rejects_truncated() {
        let buf = [AT_MAC, 5, 0, 0]; // declares 20 bytes, has 4
        assert!(parse_attributes(&buf).is_err());
    }

    #[test]
    fn test_sim_start_response() {
        let mut machine = machine(TYPE_SIM);
        let raw = sim_start_request(3);
        let request = EapMessage::decode(&raw).unwrap();

        let response_bytes = machine.process(&request, &raw).unwrap();
        let response = EapMessage::decode(&response_bytes).unwrap();
        assert_eq!(response.code, super::super::message::EapCode::Response);
        assert_eq!(response.method_type(), Some(TYPE_SIM));

        let (_, type_data) = response.type_data.as_ref().unwrap();
        assert_eq!(type_data[0], SUBTYPE_SIM_START);
        let attributes = parse_attributes(&type_data[3..]).unwrap();
        assert!(find_attribute(&attributes, AT_SELECTED_VERSION).is_some());
        assert!(find_attribute(&attributes, AT_NONCE_MT).is_some());
        assert!(find_attribute(&attributes, AT_IDENTITY).is_some());
        assert_eq!(machine.phase, MethodPhase::Started);
    }

    #[test]
    fn test_sim_start_unsupported_version_yields_client_error() {
        let mut machine = machine(TYPE_SIM);
        let mut body = Vec::new();
        body.push(SUBTYPE_SIM_START);
        body.extend_from_slice(&[0, 0]);
        encode_attribute(AT_VERSION_LIST, &[0, 2, 0, 9], &mut body);

        let mut raw = vec![0x01, 1, 0, 0, TYPE_SIM];
        raw.extend_from_slice(&body);
        let length = (raw.len() as u16).to_be_bytes();
        raw[2] = length[0];
        raw[3] = length[1];

        let request = EapMessage::decode(&raw).unwrap();
        let response_bytes = machine.process(&request, &raw).unwrap();
        let response = EapMessage::decode(&response_bytes).unwrap();
        let (_, type_data) = response.type_data.as_ref().unwrap();
        assert_eq!(type_data[0], SUBTYPE_CLIENT_ERROR);
    }

    #[test]
    fn test_sim_challenge_before_start_rejected() {
        let mut machine = machine(TYPE_SIM);
        let mut body = Vec::new();
        body.push(SUBTYPE_SIM_CHALLENGE);
        body.extend_from_slice(&[0, 0]);
        let mut rand_value = vec![0u8; 2];
        rand_value.extend_from_slice(&[0xAA; 32]);
        encode_attribute(AT_RAND, &rand_value, &mut body);
        encode_attribute(AT_MAC, &[0u8; 18], &mut body);

        let mut raw = vec![0x01, 2, 0, 0, TYPE_SIM];
        raw.extend_from_slice(&body);
        let length = (raw.len() as u16).to_be_bytes();
        raw[2] = length[0];
        raw[3] = length[1];

        let request = EapMessage::decode(&raw).unwrap();
        let result = machine.process(&request, &raw);
        assert!(matches!(result, Err(EapError::InvalidRequest(_))));
    }

    #[test]
    fn test_aka_challenge_produces_res_and_keys() {
        // A wrong server MAC yields a client error, so compute what the
        // server MAC would be by first deriving the same keys
        let mut machine = machine(TYPE_AKA);

        let mut body = Vec::new();
        body.push(SUBTYPE_AKA_CHALLENGE);
        body.extend_from_slice(&[0, 0]);
        let mut rand_value = vec![0u8; 2];
        rand_value.extend_from_slice(&[0xAA; 16]);
        encode_attribute(AT_RAND, &rand_value, &mut body);
        let mut autn_value = vec![0u8; 2];
        autn_value.extend_from_slice(&[0xBB; 16]);
        encode_attribute(AT_AUTN, &autn_value, &mut body);
        encode_attribute(AT_MAC, &[0u8; 18], &mut body);

        let mut raw = vec![0x01, 5, 0, 0, TYPE_AKA];
        raw.extend_from_slice(&body);
        let length = (raw.len() as u16).to_be_bytes();
        raw[2] = length[0];
        raw[3] = length[1];

        // Derive K_aut the same way the machine will
        let mut hasher = Sha1::new();
        hasher.update(b"0test@example.org");
        hasher.update([0x55; 16]);
        hasher.update([0x44; 16]);
        let mk = hasher.finalize();
        let keymat = fips186_2_prf(&mk, 160).unwrap();
        let k_aut = &keymat[16..32];

        let mac_offset = find_mac_value_offset(&raw).unwrap();
        let mut mac = Hmac::<Sha1>::new_from_slice(k_aut).unwrap();
        mac.update(&raw);
        let computed = mac.finalize().into_bytes();
        raw[mac_offset..mac_offset + 16].copy_from_slice(&computed[..16]);

        let request = EapMessage::decode(&raw).unwrap();
        let response_bytes = machine.process(&request, &raw).unwrap();
        let response = EapMessage::decode(&response_bytes).unwrap();

        let (_, type_data) = response.type_data.as_ref().unwrap();
        assert_eq!(type_data[0], SUBTYPE_AKA_CHALLENGE);
        let attributes = parse_attributes(&type_data[3..]).unwrap();
        assert!(find_attribute(&attributes, AT_RES).is_some());
        assert!(find_attribute(&attributes, AT_MAC).is_some());

        assert!(machine.has_keys());
        let keys = machine.take_keys().unwrap();
        assert_eq!(keys.msk.len(), 64);
        assert_eq!(keys.emsk.len(), 64);
        assert_eq!(keys.msk, &keymat[32..96]);
    }

    struct SyncFailSim;

    impl SimAuthProvider for SyncFailSim {
        fn identity(&self, _app_type: SimAppType) -> KraitResult<Vec<u8>> {
            Ok(b"0test@example.org".to_vec())
        }

        fn authenticate(
            &self,
            _app_type: SimAppType,
            _challenge: SimChallenge<'_>,
        ) -> KraitResult<SimAuthResponse> {
            Ok(SimAuthResponse::UmtsSyncFailure { auts: [0x77; 14] })
        }
    }

    #[test]
    fn test_aka_sync_failure_response() {
        let mut machine = MethodStateMachine::new(
            TYPE_AKA,
            b"0test@example.org".to_vec(),
            Arc::new(SyncFailSim),
            &mut OsRng,
        );

        let mut body = Vec::new();
        body.push(SUBTYPE_AKA_CHALLENGE);
        body.extend_from_slice(&[0, 0]);
        let mut rand_value = vec![0u8; 2];
        rand_value.extend_from_slice(&[0xAA; 16]);
        encode_attribute(AT_RAND, &rand_value, &mut body);
        let mut autn_value = vec![0u8; 2];
        autn_value.extend_from_slice(&[0xBB; 16]);
        encode_attribute(AT_AUTN, &autn_value, &mut body);
        encode_attribute(AT_MAC, &[0u8; 18], &mut body);

        let mut raw = vec![0x01, 5, 0, 0, TYPE_AKA];
        raw.extend_from_slice(&body);
        let length = (raw.len() as u16).to_be_bytes();
        raw[2] = length[0];
        raw[3] = length[1];

        let request = EapMessage::decode(&raw).unwrap();
        let response_bytes = machine.process(&request, &raw).unwrap();
        let response = EapMessage::decode(&response_bytes).unwrap();
        let (_, type_data) = response.type_data.as_ref().unwrap();
        assert_eq!(type_data[0], SUBTYPE_AKA_SYNC_FAILURE);

        let attributes = parse_attributes(&type_data[3..]).unwrap();
        assert_eq!(find_attribute(&attributes, AT_AUTS).unwrap(), &[0x77; 14]);
        assert!(!machine.has_keys());
    }

    #[test]
    fn test_notification_echoed() {
        let mut machine = machine(TYPE_AKA);
        let mut raw = vec![0x01, 9, 0, 12, TYPE_AKA, SUBTYPE_NOTIFICATION, 0, 0];
        encode_attribute(AT_NOTIFICATION, &[0x80, 0x00], &mut raw);
        let length = (raw.len() as u16).to_be_bytes();
        raw[2] = length[0];
        raw[3] = length[1];

        let request = EapMessage::decode(&raw).unwrap();
        let response_bytes = machine.process(&request, &raw).unwrap();
        let response = EapMessage::decode(&response_bytes).unwrap();
        let (_, type_data) = response.type_data.as_ref().unwrap();
        assert_eq!(type_data[0], SUBTYPE_NOTIFICATION);
        assert_eq!(machine.phase, MethodPhase::Created);
    }

    #[test]
    fn test_fips_prf_properties() {
        let mk = [0x42u8; 20];
        let out = fips186_2_prf(&mk, 160).unwrap();
        assert_eq!(out.len(), 160);

        // Deterministic, and a prefix of a longer expansion
        let out2 = fips186_2_prf(&mk, 160).unwrap();
        assert_eq!(out, out2);
        let short = fips186_2_prf(&mk, 40).unwrap();
        assert_eq!(&out[..40], &short[..]);

        assert!(fips186_2_prf(&[0u8; 10], 160).is_err());
    }

    #[test]
    fn test_prf_prime_properties() {
        let key = [0x13u8; 32];
        let out = prf_prime(&key, b"EAP-AKA'ident", 208).unwrap();
        assert_eq!(out.len(), 208);

        let short = prf_prime(&key, b"EAP-AKA'ident", 32).unwrap();
        assert_eq!(&out[..32], &short[..]);
    }

    #[test]
    fn test_add_mod_2_160() {
        let mut acc = [0xFFu8; 20];
        add_one_mod_2_160(&mut acc);
        assert_eq!(acc, [0u8; 20]);

        let mut acc = [0u8; 20];
        acc[19] = 0xFF;
        let mut addend = [0u8; 20];
        addend[19] = 0x01;
        add_mod_2_160(&mut acc, &addend);
        assert_eq!(acc[18], 1);
        assert_eq!(acc[19], 0);
    }
}
