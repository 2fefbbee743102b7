//! Signature aggregation
//!
//! Combines the ephemeral commitments into `R`, the delta shares into
//! `delta = k·gamma`, and the signature shares into `s`, then recovers the
//! signer from the result and refuses to release anything that does not
//! verify under the group key.

use k256::{
    ecdsa::{signature::hazmat::PrehashVerifier, RecoveryId, VerifyingKey},
    elliptic_curve::{
        bigint::U256, ops::Reduce, point::AffineCoordinates, scalar::IsHigh, PrimeField,
    },
    FieldBytes, ProjectivePoint, Scalar,
};
use tracing::debug;

use crate::{Error, Point, Result, Signature};

/// How the final signature is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOptions {
    /// Normalize `s` into the lower half of the order
    pub low_s: bool,
    /// EIP-155 chain id used for `v`
    pub chain_id: Option<u64>,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            low_s: true,
            chain_id: None,
        }
    }
}

/// Aggregated nonce point and its x-coordinate reduced mod q
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoncePoint {
    /// R = Σ R_i
    pub point: ProjectivePoint,
    /// r = R.x mod q
    pub r: Scalar,
    /// Recovery id before any low-s flip
    pub recovery_id: u8,
}

/// `R = Σ R_i`; fails with `DegenerateR` when `r = 0`
pub fn combine_nonce_points<'a, I>(points: I) -> Result<NoncePoint>
where
    I: IntoIterator<Item = &'a Point>,
{
    let point = points
        .into_iter()
        .fold(ProjectivePoint::IDENTITY, |acc, p| acc + p.0);
    if point == ProjectivePoint::IDENTITY {
        return Err(Error::DegenerateR);
    }

    let affine = point.to_affine();
    let x: FieldBytes = affine.x();
    let r = <Scalar as Reduce<U256>>::reduce_bytes(&x);
    if r == Scalar::ZERO {
        return Err(Error::DegenerateR);
    }

    // x ≥ q when reduction changed the value
    let x_reduced = r.to_repr() != x;
    let y_odd: bool = affine.y_is_odd().into();
    let recovery_id = (y_odd as u8) | ((x_reduced as u8) << 1);

    Ok(NoncePoint {
        point,
        r,
        recovery_id,
    })
}

/// `delta = Σ delta_i`; a zero delta cannot be inverted
pub fn combine_deltas<'a, I>(shares: I) -> Result<Scalar>
where
    I: IntoIterator<Item = &'a Scalar>,
{
    let delta = shares.into_iter().fold(Scalar::ZERO, |acc, d| acc + d);
    if delta == Scalar::ZERO {
        return Err(Error::VerificationFailed("Aggregated delta is zero".into()));
    }
    Ok(delta)
}

/// Message hash as a scalar
pub fn message_scalar(message_hash: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(*message_hash))
}

/// Sum the signature shares, encode, and self-verify against `group_key`
pub fn aggregate<'a, I>(
    group_key: &ProjectivePoint,
    message_hash: &[u8; 32],
    nonce: &NoncePoint,
    shares: I,
    options: &AggregateOptions,
) -> Result<Signature>
where
    I: IntoIterator<Item = &'a Scalar>,
{
    let s = shares.into_iter().fold(Scalar::ZERO, |acc, sigma| acc + sigma);
    if s == Scalar::ZERO {
        return Err(Error::InvalidSignature("s = 0".into()));
    }

    // Low-s form of (s, recid), used for the self-check either way
    let high: bool = s.is_high().into();
    let (low_s, low_recid) = if high {
        (-s, nonce.recovery_id ^ 1)
    } else {
        (s, nonce.recovery_id)
    };
    let (out_s, out_recid) = if options.low_s {
        (low_s, low_recid)
    } else {
        (s, nonce.recovery_id)
    };

    self_check(group_key, message_hash, &nonce.r, &low_s, low_recid)?;

    let v = match options.chain_id {
        Some(chain_id) => out_recid as u64 + 35 + 2 * chain_id,
        None => 27 + out_recid as u64,
    };

    let mut r_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&nonce.r.to_bytes());
    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&out_s.to_bytes());

    debug!(r = %hex::encode(r_bytes), v, "Signature aggregated and verified");

    Ok(Signature {
        r: r_bytes,
        s: s_bytes,
        recovery_id: out_recid,
        v,
    })
}

/// Recover the signer and verify the prehash signature
fn self_check(
    group_key: &ProjectivePoint,
    message_hash: &[u8; 32],
    r: &Scalar,
    s: &Scalar,
    recovery_id: u8,
) -> Result<()> {
    let signature = k256::ecdsa::Signature::from_scalars(r.to_bytes(), s.to_bytes())
        .map_err(|e| Error::InvalidSignature(e.to_string()))?;
    let recid = RecoveryId::from_byte(recovery_id)
        .ok_or_else(|| Error::InvalidSignature(format!("Bad recovery id {}", recovery_id)))?;
    let expected = VerifyingKey::from_affine(group_key.to_affine())
        .map_err(|e| Error::InvalidSignature(e.to_string()))?;

    let recovered = VerifyingKey::recover_from_prehash(message_hash, &signature, recid)
        .map_err(|e| Error::InvalidSignature(format!("Recovery failed: {}", e)))?;
    if recovered != expected {
        return Err(Error::InvalidSignature(
            "Recovered key differs from the group key".into(),
        ));
    }

    expected
        .verify_prehash(message_hash, &signature)
        .map_err(|e| Error::InvalidSignature(format!("Verification failed: {}", e)))
}

/// Recover the Ethereum address that produced `signature` over `message_hash`
pub fn recover_address(message_hash: &[u8; 32], signature: &Signature) -> Result<String> {
    let recid = RecoveryId::from_byte(signature.recovery_id).ok_or_else(|| {
        Error::InvalidSignature(format!("Bad recovery id {}", signature.recovery_id))
    })?;
    let key = VerifyingKey::recover_from_prehash(message_hash, &signature.to_ecdsa()?, recid)
        .map_err(|e| Error::InvalidSignature(e.to_string()))?;
    let point = ProjectivePoint::from(*key.as_affine());
    Ok(crate::types::ethereum_address(&point))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    /// Additive shares of a plain ECDSA signature with known key and nonce
    fn split_signature(
        x: &Scalar,
        k: &Scalar,
        message_hash: &[u8; 32],
        parts: usize,
    ) -> (NoncePoint, Vec<Scalar>) {
        let nonce_shares: Vec<Scalar> = (1..parts).map(|_| Scalar::random(&mut OsRng)).collect();
        let last = nonce_shares.iter().fold(*k, |acc, s| acc - s);
        let points: Vec<Point> = nonce_shares
            .iter()
            .chain(std::iter::once(&last))
            .map(|k_i| Point(ProjectivePoint::GENERATOR * k_i))
            .collect();
        let nonce = combine_nonce_points(&points).unwrap();

        let s = k.invert().unwrap() * (message_scalar(message_hash) + nonce.r * x);
        let mut shares: Vec<Scalar> = (1..parts).map(|_| Scalar::random(&mut OsRng)).collect();
        let rest = shares.iter().fold(s, |acc, v| acc - v);
        shares.push(rest);
        (nonce, shares)
    }

    #[test]
    fn test_aggregate_recovers_group_address() {
        let x = Scalar::random(&mut OsRng);
        let group_key = ProjectivePoint::GENERATOR * x;
        let hash = [0x42u8; 32];

        for _ in 0..8 {
            let k = Scalar::random(&mut OsRng);
            let (nonce, shares) = split_signature(&x, &k, &hash, 3);
            let sig = aggregate(&group_key, &hash, &nonce, &shares, &AggregateOptions::default())
                .unwrap();

            let s = Option::<Scalar>::from(Scalar::from_repr(FieldBytes::from(sig.s))).unwrap();
            assert!(!bool::from(s.is_high()));
            assert_eq!(sig.v, 27 + sig.recovery_id as u64);
            assert_eq!(
                recover_address(&hash, &sig).unwrap(),
                crate::types::ethereum_address(&group_key)
            );
        }
    }

    #[test]
    fn test_eip155_v_and_high_s_option() {
        let x = Scalar::random(&mut OsRng);
        let group_key = ProjectivePoint::GENERATOR * x;
        let hash = [7u8; 32];
        let k = Scalar::random(&mut OsRng);
        let (nonce, shares) = split_signature(&x, &k, &hash, 2);

        let options = AggregateOptions {
            low_s: false,
            chain_id: Some(1),
        };
        let sig = aggregate(&group_key, &hash, &nonce, &shares, &options).unwrap();
        assert_eq!(sig.v, sig.recovery_id as u64 + 37);

        let low = aggregate(&group_key, &hash, &nonce, &shares, &AggregateOptions::default())
            .unwrap();
        assert_eq!(sig.r, low.r);
        if sig.s != low.s {
            assert_eq!(sig.recovery_id ^ 1, low.recovery_id);
        }
    }

    #[test]
    fn test_rejects_wrong_key_and_zero_values() {
        let x = Scalar::random(&mut OsRng);
        let hash = [1u8; 32];
        let k = Scalar::random(&mut OsRng);
        let (nonce, mut shares) = split_signature(&x, &k, &hash, 3);

        let other_key = ProjectivePoint::GENERATOR * Scalar::random(&mut OsRng);
        assert!(matches!(
            aggregate(&other_key, &hash, &nonce, &shares, &AggregateOptions::default()),
            Err(Error::InvalidSignature(_))
        ));

        // Corrupt one share
        shares[1] += Scalar::ONE;
        let group_key = ProjectivePoint::GENERATOR * x;
        assert!(aggregate(&group_key, &hash, &nonce, &shares, &AggregateOptions::default()).is_err());

        let cancel = vec![Scalar::ONE, -Scalar::ONE];
        assert!(matches!(
            aggregate(&group_key, &hash, &nonce, &cancel, &AggregateOptions::default()),
            Err(Error::InvalidSignature(_))
        ));

        let p = Point(ProjectivePoint::GENERATOR);
        let neg = Point(-ProjectivePoint::GENERATOR);
        assert!(matches!(combine_nonce_points([&p, &neg]), Err(Error::DegenerateR)));
        assert!(combine_deltas(&[Scalar::ONE, -Scalar::ONE]).is_err());
    }
}
