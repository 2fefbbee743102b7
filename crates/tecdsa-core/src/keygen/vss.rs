//! Shamir secret sharing with Feldman commitments

use k256::{elliptic_curve::Field, ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use std::collections::{BTreeMap, BTreeSet};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::{Error, Point, Result, ShareIndex};

/// Secret polynomial of degree t-1. Coefficients are zeroed on drop.
pub struct SecretPolynomial {
    coefficients: Vec<Scalar>,
}

impl SecretPolynomial {
    /// Sample t coefficients uniformly in [0, q)
    pub fn random<R: CryptoRngCore>(threshold: usize, rng: &mut R) -> Self {
        let coefficients = (0..threshold).map(|_| Scalar::random(&mut *rng)).collect();
        Self { coefficients }
    }

    /// Sample a polynomial whose constant term is `secret`
    pub fn with_secret<R: CryptoRngCore>(secret: Scalar, threshold: usize, rng: &mut R) -> Self {
        let mut poly = Self::random(threshold, rng);
        if let Some(c0) = poly.coefficients.first_mut() {
            *c0 = secret;
        }
        poly
    }

    /// Build a polynomial from fixed coefficients
    pub fn from_coefficients(coefficients: Vec<Scalar>) -> Self {
        Self { coefficients }
    }

    /// Number of coefficients (the threshold)
    pub fn threshold(&self) -> usize {
        self.coefficients.len()
    }

    /// coefficient[0]
    pub fn secret(&self) -> Scalar {
        self.coefficients.first().copied().unwrap_or(Scalar::ZERO)
    }

    /// Feldman commitments `coefficient[i]·G`
    pub fn commitments(&self) -> Vec<Point> {
        self.coefficients
            .iter()
            .map(|c| Point(ProjectivePoint::GENERATOR * c))
            .collect()
    }

    /// Evaluate at a 1-based index
    pub fn evaluate(&self, index: ShareIndex) -> Scalar {
        let x = Scalar::from(index as u64);
        let mut result = Scalar::ZERO;
        let mut x_power = Scalar::ONE;

        for coef in &self.coefficients {
            result += coef * &x_power;
            x_power *= x;
        }

        result
    }
}

impl Drop for SecretPolynomial {
    fn drop(&mut self) {
        self.coefficients.zeroize();
    }
}

/// Output of one participant's dealing: public commitments and one share per index
pub struct Dealing {
    /// `commitments[i] = coefficient[i]·G`
    pub commitments: Vec<Point>,
    /// index → share(index)
    pub shares: BTreeMap<ShareIndex, Scalar>,
}

impl Drop for Dealing {
    fn drop(&mut self) {
        for share in self.shares.values_mut() {
            share.zeroize();
        }
    }
}

/// Generate a fresh random dealing for the given participant indices
pub fn generate<R: CryptoRngCore>(
    threshold: usize,
    indices: &[ShareIndex],
    rng: &mut R,
) -> Result<Dealing> {
    check_parameters(threshold, indices)?;
    let poly = SecretPolynomial::random(threshold, rng);
    Ok(deal(&poly, indices))
}

/// Generate a dealing that re-shares an existing secret
pub fn generate_with_secret<R: CryptoRngCore>(
    secret: Scalar,
    threshold: usize,
    indices: &[ShareIndex],
    rng: &mut R,
) -> Result<Dealing> {
    check_parameters(threshold, indices)?;
    let poly = SecretPolynomial::with_secret(secret, threshold, rng);
    Ok(deal(&poly, indices))
}

/// Evaluate a polynomial at every index
pub fn deal(poly: &SecretPolynomial, indices: &[ShareIndex]) -> Dealing {
    let shares = indices.iter().map(|&j| (j, poly.evaluate(j))).collect();
    Dealing {
        commitments: poly.commitments(),
        shares,
    }
}

fn check_parameters(threshold: usize, indices: &[ShareIndex]) -> Result<()> {
    if threshold < 1 || threshold > indices.len() {
        return Err(Error::InvalidThreshold {
            threshold,
            total: indices.len(),
        });
    }
    let mut seen = BTreeSet::new();
    for &index in indices {
        if index == 0 || !seen.insert(index) {
            return Err(Error::InvalidShareIndex(index));
        }
    }
    Ok(())
}

/// Evaluate the committed polynomial "in the exponent" at `index`
pub fn commitment_at(commitments: &[Point], index: ShareIndex) -> ProjectivePoint {
    let x = Scalar::from(index as u64);
    let mut acc = ProjectivePoint::IDENTITY;
    let mut x_power = Scalar::ONE;

    for commitment in commitments {
        acc += commitment.0 * x_power;
        x_power *= x;
    }

    acc
}

/// Feldman check: `share·G == Σ commitments[i]·index^i`
pub fn verify_share(share: &Scalar, commitments: &[Point], index: ShareIndex) -> bool {
    if index == 0 || commitments.is_empty() {
        return false;
    }
    let expected = ProjectivePoint::GENERATOR * share;
    let actual = commitment_at(commitments, index);
    expected.ct_eq(&actual).into()
}

/// Public share of `index` given every dealer's commitments: `Σ_d commitment_d(index)`
pub fn public_share<'a, I>(all_commitments: I, index: ShareIndex) -> ProjectivePoint
where
    I: IntoIterator<Item = &'a Vec<Point>>,
{
    all_commitments
        .into_iter()
        .map(|c| commitment_at(c, index))
        .fold(ProjectivePoint::IDENTITY, |acc, p| acc + p)
}

/// Group public key: the sum of every dealer's `commitments[0]`
pub fn group_public_key<'a, I>(all_commitments: I) -> Result<ProjectivePoint>
where
    I: IntoIterator<Item = &'a Vec<Point>>,
{
    let mut key = ProjectivePoint::IDENTITY;
    for commitments in all_commitments {
        let c0 = commitments
            .first()
            .ok_or_else(|| Error::VerificationFailed("Empty commitments".into()))?;
        key += c0.0;
    }
    if key == ProjectivePoint::IDENTITY {
        return Err(Error::VerificationFailed("Group key is the identity".into()));
    }
    Ok(key)
}

/// Lagrange coefficient at zero for `index` over the set `indices`
pub fn lagrange_coefficient(index: ShareIndex, indices: &[ShareIndex]) -> Result<Scalar> {
    if !indices.contains(&index) {
        return Err(Error::InvalidShareIndex(index));
    }
    let i = Scalar::from(index as u64);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &other in indices {
        if other == index {
            continue;
        }
        let j = Scalar::from(other as u64);
        numerator *= j;
        denominator *= j - i;
    }

    Option::<Scalar>::from(denominator.invert())
        .map(|inv| numerator * inv)
        .ok_or(Error::InvalidShareIndex(index))
}

/// Reconstruct `f(0)` from at least t shares
pub fn interpolate(shares: &BTreeMap<ShareIndex, Scalar>) -> Result<Scalar> {
    let indices: Vec<ShareIndex> = shares.keys().copied().collect();
    let mut secret = Scalar::ZERO;
    for (&index, share) in shares {
        secret += lagrange_coefficient(index, &indices)? * share;
    }
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::OsRng, seq::SliceRandom, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    fn indices(n: u32) -> Vec<ShareIndex> {
        (1..=n).collect()
    }

    #[test]
    fn test_fixed_coefficients_interpolate_to_secret() {
        let poly = SecretPolynomial::from_coefficients(vec![
            Scalar::from(12345u64),
            Scalar::from(777u64),
            Scalar::from(42u64),
        ]);
        let dealing = deal(&poly, &indices(5));

        // f(1) = 12345 + 777 + 42
        assert_eq!(dealing.shares[&1], Scalar::from(13164u64));

        for subset in [[1u32, 2, 3], [1, 3, 5], [2, 4, 5], [3, 4, 5]] {
            let picked: BTreeMap<_, _> = subset.iter().map(|i| (*i, dealing.shares[i])).collect();
            assert_eq!(interpolate(&picked).unwrap(), Scalar::from(12345u64));
        }
    }

    #[test]
    fn test_any_t_shares_reconstruct() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        for n in 1..=6u32 {
            for t in 1..=n as usize {
                let ids = indices(n);
                let secret = Scalar::random(&mut rng);
                let dealing = generate_with_secret(secret, t, &ids, &mut rng).unwrap();
                assert_eq!(dealing.shares.len(), n as usize);
                assert_eq!(dealing.commitments.len(), t);

                let mut shuffled = ids.clone();
                shuffled.shuffle(&mut rng);
                let picked: BTreeMap<_, _> = shuffled[..t]
                    .iter()
                    .map(|i| (*i, dealing.shares[i]))
                    .collect();
                assert_eq!(interpolate(&picked).unwrap(), secret);
            }
        }
    }

    #[test]
    fn test_fewer_than_t_shares_do_not_reconstruct() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let secret = Scalar::random(&mut rng);
        let dealing = generate_with_secret(secret, 3, &indices(5), &mut rng).unwrap();
        let picked: BTreeMap<_, _> = [1u32, 4].iter().map(|i| (*i, dealing.shares[i])).collect();
        assert_ne!(interpolate(&picked).unwrap(), secret);
    }

    #[test]
    fn test_invalid_threshold() {
        let mut rng = OsRng;
        assert!(matches!(
            generate(0, &indices(3), &mut rng),
            Err(Error::InvalidThreshold { threshold: 0, total: 3 })
        ));
        assert!(matches!(
            generate(4, &indices(3), &mut rng),
            Err(Error::InvalidThreshold { threshold: 4, total: 3 })
        ));
        assert!(matches!(
            generate(2, &[0, 1, 2], &mut rng),
            Err(Error::InvalidShareIndex(0))
        ));
        assert!(matches!(
            generate(2, &[1, 2, 2], &mut rng),
            Err(Error::InvalidShareIndex(2))
        ));
    }

    #[test]
    fn test_verify_accepts_honest_shares() {
        let dealing = generate(3, &indices(5), &mut OsRng).unwrap();
        for (index, share) in &dealing.shares {
            assert!(verify_share(share, &dealing.commitments, *index));
        }
    }

    #[test]
    fn test_verify_rejects_bit_flipped_share() {
        let dealing = generate(3, &indices(5), &mut OsRng).unwrap();
        for bit in [0usize, 1, 77, 200, 255] {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&dealing.shares[&2].to_bytes());
            bytes[31 - bit / 8] ^= 1 << (bit % 8);
            let tampered = crate::types::scalar_reduce(&bytes);
            assert!(!verify_share(&tampered, &dealing.commitments, 2));
        }
        // Right share, wrong evaluation point
        assert!(!verify_share(&dealing.shares[&2], &dealing.commitments, 3));
        assert!(!verify_share(&dealing.shares[&2], &dealing.commitments, 0));
    }

    #[test]
    fn test_public_shares_and_group_key() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let ids = indices(4);
        let dealings: Vec<Dealing> = (0..4).map(|_| generate(2, &ids, &mut rng).unwrap()).collect();
        let commitments: Vec<Vec<Point>> = dealings.iter().map(|d| d.commitments.clone()).collect();

        let group_key = group_public_key(&commitments).unwrap();
        let mut aggregated = BTreeMap::new();
        for &j in &ids {
            let x_j = dealings
                .iter()
                .fold(Scalar::ZERO, |acc, d| acc + d.shares[&j]);
            assert_eq!(ProjectivePoint::GENERATOR * x_j, public_share(&commitments, j));
            aggregated.insert(j, x_j);
        }
        let secret = interpolate(&aggregated).unwrap();
        assert_eq!(ProjectivePoint::GENERATOR * secret, group_key);
    }
}
