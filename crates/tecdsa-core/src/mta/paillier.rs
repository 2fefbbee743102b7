//! Paillier keys and ciphertext arithmetic
//!
//! A device owns one [`MtaKeyPair`]. Its public half, [`MtaPublicKey`], is
//! published at enrollment and carries both the Paillier modulus used to
//! encrypt the device's own MtA inputs and the ring-Pedersen parameters
//! other devices prove ranges against.

use k256::Scalar;
use libpaillier::{unknown_order::BigNumber, DecryptionKey, EncryptionKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{types::scalar_from_bytes, Error, Result};

/// Smallest accepted Paillier modulus
pub const MIN_MODULUS_BITS: usize = 2048;

const MAX_KEYGEN_ATTEMPTS: usize = 16;

const CURVE_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe,
    0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
];

/// secp256k1 group order q
pub fn curve_order() -> BigNumber {
    BigNumber::from_slice(CURVE_ORDER)
}

/// Lift a scalar to an integer in [0, q)
pub fn scalar_to_bn(scalar: &Scalar) -> BigNumber {
    BigNumber::from_slice(scalar.to_bytes())
}

/// Reduce a non-negative integer modulo q
pub fn bn_to_scalar(value: &BigNumber) -> Result<Scalar> {
    let reduced = value % &curve_order();
    let bytes = reduced.to_bytes();
    if bytes.len() > 32 {
        return Err(Error::Crypto("Reduced value exceeds 32 bytes".into()));
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);
    scalar_from_bytes(&padded)
}

/// Uniform element of Z*_n
pub fn random_unit(n: &BigNumber) -> BigNumber {
    let one = BigNumber::one();
    loop {
        let candidate = BigNumber::random(n);
        if candidate != BigNumber::zero() && candidate.gcd(n) == one {
            return candidate;
        }
    }
}

/// Public Paillier modulus plus ring-Pedersen parameters of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtaPublicKey {
    /// Paillier modulus N, also the ring-Pedersen modulus Ñ
    #[serde(with = "bn_hex")]
    pub n: BigNumber,
    /// h1 = h2^λ mod Ñ
    #[serde(with = "bn_hex")]
    pub h1: BigNumber,
    /// h2 = τ² mod Ñ
    #[serde(with = "bn_hex")]
    pub h2: BigNumber,
}

impl MtaPublicKey {
    /// N²
    pub fn nn(&self) -> BigNumber {
        &self.n * &self.n
    }

    /// Reject undersized moduli and degenerate Pedersen bases
    pub fn validate(&self, min_bits: usize) -> Result<()> {
        let bits = self.n.bit_length();
        if bits < min_bits.max(MIN_MODULUS_BITS) {
            return Err(Error::InvalidConfig(format!(
                "Paillier modulus has {} bits, need at least {}",
                bits,
                min_bits.max(MIN_MODULUS_BITS)
            )));
        }
        if &self.n % &BigNumber::from(2u64) == BigNumber::zero() {
            return Err(Error::InvalidConfig("Paillier modulus is even".into()));
        }

        let one = BigNumber::one();
        for h in [&self.h1, &self.h2] {
            if h <= &one || h >= &self.n || h.gcd(&self.n) != one {
                return Err(Error::InvalidConfig("Invalid ring-Pedersen base".into()));
            }
        }
        if self.h1 == self.h2 {
            return Err(Error::InvalidConfig("Ring-Pedersen bases are equal".into()));
        }
        Ok(())
    }

    /// `(N+1)^m · r^N mod N²`
    pub fn encrypt_with_nonce(&self, plaintext: &BigNumber, nonce: &BigNumber) -> BigNumber {
        let nn = self.nn();
        let g_m = (&BigNumber::one() + &(plaintext * &self.n)) % &nn;
        g_m.modmul(&nonce.modpow(&self.n, &nn), &nn)
    }

    /// Encrypt under this key with a fresh nonce
    pub fn encrypt(&self, plaintext: &BigNumber) -> BigNumber {
        let nonce = random_unit(&self.n);
        self.encrypt_with_nonce(plaintext, &nonce)
    }

    /// Homomorphic addition of plaintexts
    pub fn add(&self, a: &BigNumber, b: &BigNumber) -> BigNumber {
        a.modmul(b, &self.nn())
    }

    /// Homomorphic multiplication of the plaintext by `k`
    pub fn scale(&self, ciphertext: &BigNumber, k: &BigNumber) -> BigNumber {
        ciphertext.modpow(k, &self.nn())
    }

    /// Whether `c` is a unit of Z_{N²}
    pub fn is_valid_ciphertext(&self, ciphertext: &BigNumber) -> bool {
        ciphertext > &BigNumber::zero()
            && ciphertext < &self.nn()
            && ciphertext.gcd(&self.n) == BigNumber::one()
    }
}

/// A device's Paillier decryption key with its published public key
pub struct MtaKeyPair {
    decryption: DecryptionKey,
    encryption: EncryptionKey,
    public: MtaPublicKey,
}

impl MtaKeyPair {
    /// Generate a key with a modulus of exactly `bits` bits
    pub fn generate(bits: usize) -> Result<Self> {
        if bits < MIN_MODULUS_BITS {
            return Err(Error::InvalidConfig(format!(
                "Paillier modulus of {} bits is below the {} bit minimum",
                bits, MIN_MODULUS_BITS
            )));
        }

        for attempt in 1..=MAX_KEYGEN_ATTEMPTS {
            let p = BigNumber::prime(bits / 2);
            let q = BigNumber::prime(bits / 2);
            if p == q {
                continue;
            }
            let n = &p * &q;
            if n.bit_length() != bits {
                debug!(attempt, got = n.bit_length(), "Modulus size off, retrying");
                continue;
            }

            let decryption = DecryptionKey::with_primes_unchecked(&p, &q)
                .ok_or_else(|| Error::Crypto("Paillier key construction failed".into()))?;
            let encryption = EncryptionKey::from(&decryption);

            let one = BigNumber::one();
            let phi = &(&p - &one) * &(&q - &one);
            let tau = random_unit(&n);
            let h2 = tau.modmul(&tau, &n);
            let lambda = BigNumber::random(&phi);
            let h1 = h2.modpow(&lambda, &n);

            let public = MtaPublicKey { n, h1, h2 };
            if public.validate(bits).is_err() {
                continue;
            }

            return Ok(Self {
                decryption,
                encryption,
                public,
            });
        }

        Err(Error::Crypto("Paillier key generation did not converge".into()))
    }

    /// Published half
    pub fn public(&self) -> &MtaPublicKey {
        &self.public
    }

    /// Encrypt a scalar under this key, returning the ciphertext and its nonce
    pub fn encrypt_scalar(&self, value: &Scalar) -> Result<(BigNumber, BigNumber)> {
        self.encryption
            .encrypt(value.to_bytes(), None)
            .ok_or_else(|| Error::Crypto("Paillier encryption failed".into()))
    }

    /// Decrypt and reduce modulo q
    pub fn decrypt_scalar(&self, ciphertext: &BigNumber) -> Result<Scalar> {
        if !self.public.is_valid_ciphertext(ciphertext) {
            return Err(Error::Crypto("Ciphertext outside Z*_{N^2}".into()));
        }
        let plaintext = self
            .decryption
            .decrypt(ciphertext)
            .ok_or_else(|| Error::Crypto("Paillier decryption failed".into()))?;
        bn_to_scalar(&BigNumber::from_slice(plaintext))
    }
}

/// Serde helpers for big integers as big-endian hex
pub mod bn_hex {
    use libpaillier::unknown_order::BigNumber;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigNumber, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value.to_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigNumber, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Ok(BigNumber::from_slice(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mta::test_keys;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    #[test]
    fn test_encrypt_decrypt_and_homomorphism() {
        let (a, _) = test_keys();
        let x = Scalar::random(&mut OsRng);
        let y = Scalar::random(&mut OsRng);

        let (cx, _) = a.encrypt_scalar(&x).unwrap();
        assert_eq!(a.decrypt_scalar(&cx).unwrap(), x);

        // E(x)^y · E(1) decrypts to x·y + 1
        let scaled = a.public().scale(&cx, &scalar_to_bn(&y));
        let summed = a.public().add(&scaled, &a.public().encrypt(&BigNumber::one()));
        assert_eq!(a.decrypt_scalar(&summed).unwrap(), x * y + Scalar::ONE);
    }

    #[test]
    fn test_public_key_validation() {
        let (a, b) = test_keys();
        a.public().validate(MIN_MODULUS_BITS).unwrap();

        let mut swapped = a.public().clone();
        swapped.h1 = swapped.h2.clone();
        assert!(swapped.validate(MIN_MODULUS_BITS).is_err());

        let mut foreign = a.public().clone();
        foreign.h1 = b.public().n.clone();
        assert!(foreign.validate(MIN_MODULUS_BITS).is_err());

        assert!(a.public().validate(4096).is_err());
        assert!(MtaKeyPair::generate(1024).is_err());
    }

    #[test]
    fn test_scalar_conversion_reduces() {
        let q = curve_order();
        assert_eq!(bn_to_scalar(&q).unwrap(), Scalar::ZERO);
        let q_plus_five = &q + &BigNumber::from(5u64);
        assert_eq!(bn_to_scalar(&q_plus_five).unwrap(), Scalar::from(5u64));
    }
}
