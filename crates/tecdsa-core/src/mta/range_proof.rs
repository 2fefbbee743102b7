//! Range proof for a Paillier plaintext
//!
//! Proves that a ciphertext `c = (N+1)^m · r^N mod N²` under the prover's key
//! hides some `m < q³`, against ring-Pedersen parameters (Ñ, h1, h2) owned by
//! the verifier. The challenge is derived from a merlin transcript bound to
//! the caller's context, so a proof cannot be replayed for another pair or
//! session.

use k256::Scalar;
use libpaillier::unknown_order::BigNumber;
use merlin::Transcript;
use serde::{Deserialize, Serialize};

use super::paillier::{bn_hex, curve_order, random_unit, scalar_to_bn, MtaPublicKey};

/// Non-interactive range proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeProof {
    /// z = h1^m · h2^ρ mod Ñ
    #[serde(with = "bn_hex")]
    pub z: BigNumber,
    /// u = (N+1)^α · β^N mod N²
    #[serde(with = "bn_hex")]
    pub u: BigNumber,
    /// w = h1^α · h2^γ mod Ñ
    #[serde(with = "bn_hex")]
    pub w: BigNumber,
    /// s = r^e · β mod N
    #[serde(with = "bn_hex")]
    pub s: BigNumber,
    /// s1 = e·m + α
    #[serde(with = "bn_hex")]
    pub s1: BigNumber,
    /// s2 = e·ρ + γ
    #[serde(with = "bn_hex")]
    pub s2: BigNumber,
}

impl RangeProof {
    /// Prove knowledge of `(m, r)` behind `ciphertext`
    pub fn prove(
        context: &[u8],
        prover: &MtaPublicKey,
        verifier: &MtaPublicKey,
        ciphertext: &BigNumber,
        plaintext: &Scalar,
        nonce: &BigNumber,
    ) -> Self {
        let q = curve_order();
        let q3 = &(&q * &q) * &q;
        let n = &prover.n;
        let n_tilde = &verifier.n;

        let alpha = BigNumber::random(&q3);
        let beta = random_unit(n);
        let gamma = BigNumber::random(&(&q3 * n_tilde));
        let rho = BigNumber::random(&(&q * n_tilde));

        let m = scalar_to_bn(plaintext);
        let z = pedersen(verifier, &m, &rho);
        let u = prover.encrypt_with_nonce(&alpha, &beta);
        let w = pedersen(verifier, &alpha, &gamma);

        let e = challenge(context, prover, verifier, ciphertext, &z, &u, &w);

        let s = nonce.modpow(&e, n).modmul(&beta, n);
        let s1 = &(&e * &m) + &alpha;
        let s2 = &(&e * &rho) + &gamma;

        Self { z, u, w, s, s1, s2 }
    }

    /// Check the proof for `ciphertext` in `context`
    pub fn verify(
        &self,
        context: &[u8],
        prover: &MtaPublicKey,
        verifier: &MtaPublicKey,
        ciphertext: &BigNumber,
    ) -> bool {
        let q = curve_order();
        let q3 = &(&q * &q) * &q;
        let zero = BigNumber::zero();
        let n = &prover.n;
        let nn = prover.nn();
        let n_tilde = &verifier.n;

        if self.s1 > q3 || self.s1 < zero || self.s2 < zero {
            return false;
        }
        if !prover.is_valid_ciphertext(ciphertext) || !prover.is_valid_ciphertext(&self.u) {
            return false;
        }
        for v in [&self.z, &self.w] {
            if v <= &zero || v >= n_tilde {
                return false;
            }
        }
        if &self.s <= &zero || &self.s >= n {
            return false;
        }

        let e = challenge(context, prover, verifier, ciphertext, &self.z, &self.u, &self.w);

        // u == (N+1)^s1 · s^N · c^-e mod N²
        let c_inv = match ciphertext.invert(&nn) {
            Some(inv) => inv,
            None => return false,
        };
        let paillier_side = prover
            .encrypt_with_nonce(&self.s1, &self.s)
            .modmul(&c_inv.modpow(&e, &nn), &nn);
        if paillier_side != self.u {
            return false;
        }

        // w == h1^s1 · h2^s2 · z^-e mod Ñ
        let z_inv = match self.z.invert(n_tilde) {
            Some(inv) => inv,
            None => return false,
        };
        let pedersen_side =
            pedersen(verifier, &self.s1, &self.s2).modmul(&z_inv.modpow(&e, n_tilde), n_tilde);
        pedersen_side == self.w
    }
}

fn pedersen(params: &MtaPublicKey, a: &BigNumber, b: &BigNumber) -> BigNumber {
    let n_tilde = &params.n;
    params
        .h1
        .modpow(a, n_tilde)
        .modmul(&params.h2.modpow(b, n_tilde), n_tilde)
}

fn challenge(
    context: &[u8],
    prover: &MtaPublicKey,
    verifier: &MtaPublicKey,
    ciphertext: &BigNumber,
    z: &BigNumber,
    u: &BigNumber,
    w: &BigNumber,
) -> BigNumber {
    let mut transcript = Transcript::new(b"tecdsa-ceremony mta range proof");
    transcript.append_message(b"context", context);
    transcript.append_message(b"N", &prover.n.to_bytes());
    transcript.append_message(b"Ntilde", &verifier.n.to_bytes());
    transcript.append_message(b"h1", &verifier.h1.to_bytes());
    transcript.append_message(b"h2", &verifier.h2.to_bytes());
    transcript.append_message(b"c", &ciphertext.to_bytes());
    transcript.append_message(b"z", &z.to_bytes());
    transcript.append_message(b"u", &u.to_bytes());
    transcript.append_message(b"w", &w.to_bytes());

    let mut bytes = [0u8; 64];
    transcript.challenge_bytes(b"e", &mut bytes);
    BigNumber::from_slice(bytes) % &curve_order()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mta::test_keys;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    #[test]
    fn test_honest_proof_verifies() {
        let (prover, verifier) = test_keys();
        let m = Scalar::random(&mut OsRng);
        let (c, r) = prover.encrypt_scalar(&m).unwrap();

        let proof = RangeProof::prove(b"ctx", prover.public(), verifier.public(), &c, &m, &r);
        assert!(proof.verify(b"ctx", prover.public(), verifier.public(), &c));
    }

    #[test]
    fn test_rejects_tampered_ciphertext_and_context() {
        let (prover, verifier) = test_keys();
        let m = Scalar::random(&mut OsRng);
        let (c, r) = prover.encrypt_scalar(&m).unwrap();
        let proof = RangeProof::prove(b"ctx", prover.public(), verifier.public(), &c, &m, &r);

        let tampered = prover
            .public()
            .add(&c, &prover.public().encrypt(&BigNumber::one()));
        assert!(!proof.verify(b"ctx", prover.public(), verifier.public(), &tampered));
        assert!(!proof.verify(b"other", prover.public(), verifier.public(), &c));

        // Proof checked against the wrong verifier parameters
        assert!(!proof.verify(b"ctx", prover.public(), prover.public(), &c));

        let mut bumped = proof.clone();
        bumped.s1 = &bumped.s1 + &BigNumber::one();
        assert!(!bumped.verify(b"ctx", prover.public(), verifier.public(), &c));
    }

    #[test]
    fn test_rejects_out_of_range_response() {
        let (prover, verifier) = test_keys();
        let m = Scalar::random(&mut OsRng);
        let (c, r) = prover.encrypt_scalar(&m).unwrap();
        let mut proof = RangeProof::prove(b"ctx", prover.public(), verifier.public(), &c, &m, &r);

        let q = curve_order();
        proof.s1 = &(&(&q * &q) * &q) + &BigNumber::one();
        assert!(!proof.verify(b"ctx", prover.public(), verifier.public(), &c));
    }
}
