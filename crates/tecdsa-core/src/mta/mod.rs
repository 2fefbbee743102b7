//! Multiplicative-to-additive share conversion
//!
//! For an ordered signer pair (i, j), the initiator i holds `k_i` and
//! `gamma_i`, the responder j holds `gamma_j` and its weighted key share
//! `w_j`. One exchange leaves them with additive shares of two products:
//!
//! - `alpha_delta + beta_delta ≡ k_i · gamma_j (mod q)`
//! - `alpha_chi + beta_chi ≡ gamma_i · w_j (mod q)`
//!
//! 1. i encrypts `k_i` and `gamma_i` under its own Paillier key and proves
//!    both plaintexts are in range ([`initiate`]).
//! 2. j checks the proofs, scales the ciphertexts by its inputs, blinds them
//!    with random `beta'` and keeps `-beta'` ([`respond`]).
//! 3. i decrypts both results modulo q ([`finish`]).

mod paillier;
mod range_proof;

pub use paillier::{
    bn_hex, bn_to_scalar, curve_order, scalar_to_bn, MtaKeyPair, MtaPublicKey, MIN_MODULUS_BITS,
};
pub use range_proof::RangeProof;

use k256::Scalar;
use libpaillier::unknown_order::BigNumber;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, ParticipantId, Result, SessionId};

/// Step 1: initiator's encrypted inputs with range proofs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtaRequest {
    /// Owner of the Paillier key the ciphertexts are under
    pub initiator: ParticipantId,
    /// Party that will answer
    pub responder: ParticipantId,
    /// E_i(k_i)
    #[serde(with = "bn_hex")]
    pub k_ciphertext: BigNumber,
    /// Range proof for `k_ciphertext`
    pub k_proof: RangeProof,
    /// E_i(gamma_i)
    #[serde(with = "bn_hex")]
    pub gamma_ciphertext: BigNumber,
    /// Range proof for `gamma_ciphertext`
    pub gamma_proof: RangeProof,
}

/// Step 2: responder's blinded products, still under the initiator's key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtaResponse {
    /// Owner of the Paillier key
    pub initiator: ParticipantId,
    /// Party that answered
    pub responder: ParticipantId,
    /// E_i(k_i·gamma_j + beta'_delta)
    #[serde(with = "bn_hex")]
    pub delta_ciphertext: BigNumber,
    /// E_i(gamma_i·w_j + beta'_chi)
    #[serde(with = "bn_hex")]
    pub chi_ciphertext: BigNumber,
}

/// Either leg of an exchange, as relayed by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MtaPayload {
    /// Initiator → responder
    Request(MtaRequest),
    /// Responder → initiator
    Response(MtaResponse),
}

impl MtaPayload {
    /// (from, to) as carried in the payload
    pub fn route(&self) -> (&str, &str) {
        match self {
            MtaPayload::Request(r) => (&r.initiator, &r.responder),
            MtaPayload::Response(r) => (&r.responder, &r.initiator),
        }
    }
}

/// One party's additive shares from one exchange
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MtaShares {
    /// Share of the `k·gamma` cross term
    pub delta: Scalar,
    /// Share of the `gamma·w` cross term
    pub chi: Scalar,
}

/// Range proof context for one ciphertext of one pair
fn proof_context(
    session_id: &SessionId,
    initiator: &str,
    responder: &str,
    label: &str,
) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(16 + initiator.len() + responder.len() + label.len() + 2);
    ctx.extend_from_slice(session_id.as_bytes());
    ctx.extend_from_slice(initiator.as_bytes());
    ctx.push(0);
    ctx.extend_from_slice(responder.as_bytes());
    ctx.push(0);
    ctx.extend_from_slice(label.as_bytes());
    ctx
}

/// Step 1, run by the initiator
pub fn initiate(
    session_id: &SessionId,
    initiator: &str,
    responder: &str,
    own_key: &MtaKeyPair,
    responder_key: &MtaPublicKey,
    k: &Scalar,
    gamma: &Scalar,
) -> Result<MtaRequest> {
    let (k_ciphertext, k_nonce) = own_key.encrypt_scalar(k)?;
    let k_proof = RangeProof::prove(
        &proof_context(session_id, initiator, responder, "k"),
        own_key.public(),
        responder_key,
        &k_ciphertext,
        k,
        &k_nonce,
    );

    let (gamma_ciphertext, gamma_nonce) = own_key.encrypt_scalar(gamma)?;
    let gamma_proof = RangeProof::prove(
        &proof_context(session_id, initiator, responder, "gamma"),
        own_key.public(),
        responder_key,
        &gamma_ciphertext,
        gamma,
        &gamma_nonce,
    );

    debug!(initiator, responder, "MtA request prepared");

    Ok(MtaRequest {
        initiator: initiator.to_string(),
        responder: responder.to_string(),
        k_ciphertext,
        k_proof,
        gamma_ciphertext,
        gamma_proof,
    })
}

/// Check both range proofs of a request. Run by the relay and by the responder.
pub fn verify_request(
    session_id: &SessionId,
    request: &MtaRequest,
    initiator_key: &MtaPublicKey,
    responder_key: &MtaPublicKey,
) -> Result<()> {
    let k_ok = request.k_proof.verify(
        &proof_context(session_id, &request.initiator, &request.responder, "k"),
        initiator_key,
        responder_key,
        &request.k_ciphertext,
    );
    let gamma_ok = request.gamma_proof.verify(
        &proof_context(session_id, &request.initiator, &request.responder, "gamma"),
        initiator_key,
        responder_key,
        &request.gamma_ciphertext,
    );

    if k_ok && gamma_ok {
        Ok(())
    } else {
        warn!(
            initiator = %request.initiator,
            responder = %request.responder,
            "MtA range proof rejected"
        );
        Err(Error::RangeProofFailed {
            prover: request.initiator.clone(),
        })
    }
}

/// Step 2, run by the responder. Returns the response and the responder's shares.
pub fn respond(
    session_id: &SessionId,
    request: &MtaRequest,
    initiator_key: &MtaPublicKey,
    responder_key: &MtaPublicKey,
    gamma: &Scalar,
    weighted_share: &Scalar,
) -> Result<(MtaResponse, MtaShares)> {
    verify_request(session_id, request, initiator_key, responder_key)?;

    // beta' < q^5 keeps k·gamma + beta' far below N without wrapping
    let q = curve_order();
    let q2 = &q * &q;
    let q5 = &(&q2 * &q2) * &q;

    let beta_delta = BigNumber::random(&q5);
    let delta_ciphertext = initiator_key.add(
        &initiator_key.scale(&request.k_ciphertext, &scalar_to_bn(gamma)),
        &initiator_key.encrypt(&beta_delta),
    );

    let beta_chi = BigNumber::random(&q5);
    let chi_ciphertext = initiator_key.add(
        &initiator_key.scale(&request.gamma_ciphertext, &scalar_to_bn(weighted_share)),
        &initiator_key.encrypt(&beta_chi),
    );

    let shares = MtaShares {
        delta: -bn_to_scalar(&beta_delta)?,
        chi: -bn_to_scalar(&beta_chi)?,
    };

    Ok((
        MtaResponse {
            initiator: request.initiator.clone(),
            responder: request.responder.clone(),
            delta_ciphertext,
            chi_ciphertext,
        },
        shares,
    ))
}

/// Step 3, run by the initiator
pub fn finish(own_key: &MtaKeyPair, response: &MtaResponse) -> Result<MtaShares> {
    Ok(MtaShares {
        delta: own_key.decrypt_scalar(&response.delta_ciphertext)?,
        chi: own_key.decrypt_scalar(&response.chi_ciphertext)?,
    })
}

/// Two Paillier keys shared by every test in the crate; generation is slow.
#[cfg(test)]
pub(crate) fn test_keys() -> &'static (MtaKeyPair, MtaKeyPair) {
    use std::sync::OnceLock;
    static KEYS: OnceLock<(MtaKeyPair, MtaKeyPair)> = OnceLock::new();
    KEYS.get_or_init(|| {
        (
            MtaKeyPair::generate(MIN_MODULUS_BITS).expect("paillier keygen"),
            MtaKeyPair::generate(MIN_MODULUS_BITS).expect("paillier keygen"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    #[test]
    fn test_shares_sum_to_products() {
        let (alice, bob) = test_keys();
        let session = uuid::Uuid::new_v4();

        for _ in 0..3 {
            let k = Scalar::random(&mut OsRng);
            let gamma_i = Scalar::random(&mut OsRng);
            let gamma_j = Scalar::random(&mut OsRng);
            let w_j = Scalar::random(&mut OsRng);

            let request =
                initiate(&session, "device_1", "device_2", alice, bob.public(), &k, &gamma_i)
                    .unwrap();
            let (response, betas) =
                respond(&session, &request, alice.public(), bob.public(), &gamma_j, &w_j).unwrap();
            let alphas = finish(alice, &response).unwrap();

            assert_eq!(alphas.delta + betas.delta, k * gamma_j);
            assert_eq!(alphas.chi + betas.chi, gamma_i * w_j);
        }
    }

    #[test]
    fn test_request_bound_to_pair_and_session() {
        let (alice, bob) = test_keys();
        let session = uuid::Uuid::new_v4();
        let k = Scalar::random(&mut OsRng);
        let gamma = Scalar::random(&mut OsRng);
        let request =
            initiate(&session, "device_1", "device_2", alice, bob.public(), &k, &gamma).unwrap();

        verify_request(&session, &request, alice.public(), bob.public()).unwrap();

        let other_session = uuid::Uuid::new_v4();
        assert!(matches!(
            verify_request(&other_session, &request, alice.public(), bob.public()),
            Err(Error::RangeProofFailed { .. })
        ));

        let mut rerouted = request.clone();
        rerouted.responder = "device_3".into();
        assert!(verify_request(&session, &rerouted, alice.public(), bob.public()).is_err());
    }

    #[test]
    fn test_respond_refuses_tampered_request() {
        let (alice, bob) = test_keys();
        let session = uuid::Uuid::new_v4();
        let k = Scalar::random(&mut OsRng);
        let gamma = Scalar::random(&mut OsRng);
        let mut request =
            initiate(&session, "device_1", "device_2", alice, bob.public(), &k, &gamma).unwrap();

        // Swap in a ciphertext the proof was not made for
        request.k_ciphertext = alice.public().encrypt(&BigNumber::from(7u64));
        let result = respond(
            &session,
            &request,
            alice.public(),
            bob.public(),
            &Scalar::ONE,
            &Scalar::ONE,
        );
        assert!(matches!(result, Err(Error::RangeProofFailed { prover }) if prover == "device_1"));
    }

    #[test]
    fn test_payload_route_and_wire_format() {
        let (alice, bob) = test_keys();
        let session = uuid::Uuid::new_v4();
        let request = initiate(
            &session,
            "device_1",
            "device_2",
            alice,
            bob.public(),
            &Scalar::ONE,
            &Scalar::ONE,
        )
        .unwrap();
        let payload = MtaPayload::Request(request);
        assert_eq!(payload.route(), ("device_1", "device_2"));

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "request");
        let back: MtaPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
