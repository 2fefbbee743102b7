//! Core types shared by participants and the coordinator

use chrono::{DateTime, Utc};
use k256::{
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
        PrimeField,
    },
    AffinePoint, FieldBytes, ProjectivePoint, Scalar,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

/// Enrolled device identifier (e.g. `device_3`)
pub type ParticipantId = String;

/// 1-based Shamir evaluation point of a participant
pub type ShareIndex = u32;

/// Identifier of a DKG ceremony
pub type CeremonyId = uuid::Uuid;

/// Identifier of a signing session
pub type SessionId = uuid::Uuid;

/// Identity the group key is generated for, usually an address label
pub type TargetId = String;

/// A curve point serialized as compressed SEC1 hex
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Point(pub ProjectivePoint);

impl Point {
    /// Compressed SEC1 encoding (33 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        point_to_bytes(&self.0)
    }

    /// Parse a compressed or uncompressed SEC1 encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        point_from_bytes(bytes).map(Point)
    }
}

impl From<ProjectivePoint> for Point {
    fn from(p: ProjectivePoint) -> Self {
        Point(p)
    }
}

impl Serialize for Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for Point {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        Point::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Compressed SEC1 encoding of a point
pub fn point_to_bytes(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// Parse a SEC1 encoded point, rejecting the identity and off-curve points
pub fn point_from_bytes(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded = k256::EncodedPoint::from_bytes(bytes)
        .map_err(|e| Error::Deserialization(format!("Invalid point encoding: {}", e)))?;
    let affine_opt = AffinePoint::from_encoded_point(&encoded);
    let affine: AffinePoint = Option::<AffinePoint>::from(affine_opt)
        .ok_or_else(|| Error::Deserialization("Point is not on secp256k1".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// Parse a canonical 32-byte big-endian scalar (must be below the curve order)
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Deserialization("Invalid scalar length".into()))?;
    Option::<Scalar>::from(Scalar::from_repr(FieldBytes::from(array)))
        .ok_or_else(|| Error::Deserialization("Scalar is not below the curve order".into()))
}

/// Interpret 32 bytes as an integer and reduce it modulo the curve order
pub fn scalar_reduce(bytes: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(*bytes))
}

/// Serde helpers for scalars as 32-byte hex strings
pub mod scalar_hex {
    use k256::Scalar;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(scalar: &Scalar, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(scalar.to_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Scalar, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        super::scalar_from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Serde helpers for 32-byte arrays as hex strings
pub mod bytes32_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Final ECDSA signature (r, s, v) over a 32-byte message hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// R component
    #[serde(with = "bytes32_hex")]
    pub r: [u8; 32],
    /// S component (low-s when the coordinator normalizes)
    #[serde(with = "bytes32_hex")]
    pub s: [u8; 32],
    /// Recovery ID (0 or 1)
    pub recovery_id: u8,
    /// Ethereum `v`: 27/28, or EIP-155 adjusted when a chain id is set
    pub v: u64,
}

impl Signature {
    /// Convert to bytes (r || s || 27 + recovery_id)
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..64].copy_from_slice(&self.s);
        bytes[64] = 27 + self.recovery_id;
        bytes
    }

    /// Convert to a k256 ECDSA signature
    pub fn to_ecdsa(&self) -> Result<k256::ecdsa::Signature> {
        k256::ecdsa::Signature::from_scalars(
            *FieldBytes::from_slice(&self.r),
            *FieldBytes::from_slice(&self.s),
        )
        .map_err(|e| Error::InvalidSignature(e.to_string()))
    }
}

/// Ethereum address (EIP-55 checksummed) of a secp256k1 public key
pub fn ethereum_address(public_key: &ProjectivePoint) -> String {
    let encoded = public_key.to_affine().to_encoded_point(false);
    let digest = Keccak256::digest(&encoded.as_bytes()[1..]);
    let lower = hex::encode(&digest[12..]);
    let checksum = hex::encode(Keccak256::digest(lower.as_bytes()));

    let mut address = String::with_capacity(42);
    address.push_str("0x");
    for (c, nibble) in lower.chars().zip(checksum.chars()) {
        if c.is_ascii_alphabetic() && nibble.to_digit(16).unwrap_or(0) >= 8 {
            address.push(c.to_ascii_uppercase());
        } else {
            address.push(c);
        }
    }
    address
}

/// Digest used to turn a message into the 32-byte hash that is signed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDigest {
    /// Keccak-256 of the raw bytes
    #[default]
    Keccak256,
    /// SHA-256 of the raw bytes
    Sha256,
    /// Keccak-256 with the EIP-191 `personal_sign` prefix
    Eip191,
}

impl MessageDigest {
    /// Hash `message`
    pub fn digest(&self, message: &[u8]) -> [u8; 32] {
        let mut out = [0u8; 32];
        match self {
            MessageDigest::Keccak256 => out.copy_from_slice(&Keccak256::digest(message)),
            MessageDigest::Sha256 => out.copy_from_slice(&sha2::Sha256::digest(message)),
            MessageDigest::Eip191 => {
                let mut hasher = Keccak256::new();
                hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
                hasher.update(message);
                out.copy_from_slice(&hasher.finalize());
            }
        }
        out
    }
}

/// Key material a participant holds for one target identity after DKG
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct GroupKeyMaterial {
    /// Owning participant
    #[zeroize(skip)]
    pub participant_id: ParticipantId,

    /// Target identity this key was generated for
    #[zeroize(skip)]
    pub target: TargetId,

    /// Ceremony that produced the current shares
    #[zeroize(skip)]
    pub ceremony_id: CeremonyId,

    /// This participant's 1-based evaluation point
    pub share_index: ShareIndex,

    /// Threshold t
    pub threshold: usize,

    /// All participants and their share indices
    #[zeroize(skip)]
    pub participants: BTreeMap<ParticipantId, ShareIndex>,

    /// Coefficient 0 of this participant's own polynomial
    #[serde(with = "scalar_hex")]
    pub secret_coefficient: Scalar,

    /// Sum of the shares received from every participant (x_i)
    #[serde(with = "scalar_hex")]
    pub secret_share: Scalar,

    /// Group public key, fixed once derived
    #[zeroize(skip)]
    pub group_public_key: Point,

    /// Public shares x_j·G of every participant
    #[zeroize(skip)]
    pub public_shares: BTreeMap<ParticipantId, Point>,

    /// When the material was first persisted
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl GroupKeyMaterial {
    /// Ethereum address of the group key
    pub fn address(&self) -> String {
        ethereum_address(&self.group_public_key.0)
    }
}

impl std::fmt::Debug for GroupKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKeyMaterial")
            .field("participant_id", &self.participant_id)
            .field("target", &self.target)
            .field("share_index", &self.share_index)
            .field("threshold", &self.threshold)
            .field("group_public_key", &hex::encode(self.group_public_key.to_bytes()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    #[test]
    fn test_point_hex_roundtrip_rejects_garbage() {
        let p = Point(ProjectivePoint::GENERATOR * Scalar::random(&mut OsRng));
        let json = serde_json::to_string(&p).unwrap();
        let back: Point = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);

        let bad: std::result::Result<Point, _> = serde_json::from_str("\"02ffff\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_scalar_rejects_non_canonical() {
        // The curve order itself is not a valid scalar encoding
        let order =
            hex::decode("fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141").unwrap();
        assert!(scalar_from_bytes(&order).is_err());
        assert!(scalar_from_bytes(&[1u8; 31]).is_err());
    }

    #[test]
    fn test_message_digests() {
        assert_eq!(
            hex::encode(MessageDigest::Keccak256.digest(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
        assert_eq!(
            hex::encode(MessageDigest::Sha256.digest(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(
            MessageDigest::Eip191.digest(b"hello"),
            MessageDigest::Keccak256.digest(b"hello")
        );
    }

    #[test]
    fn test_ethereum_address_of_generator() {
        // Private key 1
        let address = ethereum_address(&ProjectivePoint::GENERATOR);
        assert_eq!(address, "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf");
    }
}
