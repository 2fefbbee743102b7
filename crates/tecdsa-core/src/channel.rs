//! Sealed delivery of DKG shares to their recipient
//!
//! Each share is sealed to the recipient's enrolled x25519 channel key with a
//! fresh ephemeral key, so only the recipient can open it even though it is
//! relayed through the coordinator.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use k256::Scalar;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey, ReusableSecret};
use zeroize::Zeroize;

use crate::types::{bytes32_hex, scalar_from_bytes};
use crate::{CeremonyId, Error, Result};

const SEAL_CONTEXT: &str = "tecdsa-ceremony 2024 dkg share seal v1";

/// A share encrypted to one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedShare {
    /// Sender's ephemeral x25519 public key
    #[serde(with = "bytes32_hex")]
    pub ephemeral_public: [u8; 32],
    /// ChaCha20-Poly1305 nonce
    #[serde(with = "nonce_hex")]
    pub nonce: [u8; 12],
    /// Ciphertext with tag
    #[serde(with = "vec_hex")]
    pub ciphertext: Vec<u8>,
}

/// Binds a sealed share to its ceremony and direction
pub fn share_aad(ceremony_id: &CeremonyId, sender: &str, recipient: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + sender.len() + recipient.len() + 1);
    aad.extend_from_slice(ceremony_id.as_bytes());
    aad.extend_from_slice(sender.as_bytes());
    aad.push(0);
    aad.extend_from_slice(recipient.as_bytes());
    aad
}

/// Long-lived channel key of a device
pub struct ChannelSecret {
    secret: ReusableSecret,
}

impl ChannelSecret {
    /// Generate a new channel key
    pub fn random() -> Self {
        Self {
            secret: ReusableSecret::random_from_rng(OsRng),
        }
    }

    /// Public half, published at enrollment
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.secret).to_bytes()
    }

    /// Open a sealed share addressed to this key
    pub fn open(&self, sealed: &SealedShare, aad: &[u8]) -> Result<Scalar> {
        let ephemeral = PublicKey::from(sealed.ephemeral_public);
        let shared = self.secret.diffie_hellman(&ephemeral);
        let mut key = derive_key(shared.as_bytes(), &sealed.ephemeral_public, &self.public_key());

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        let mut plaintext = cipher
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad,
                },
            )
            .map_err(|_| Error::Crypto("Sealed share failed to open".into()))?;

        let share = scalar_from_bytes(&plaintext);
        plaintext.zeroize();
        share
    }
}

/// Seal a share to `recipient_public`
pub fn seal(share: &Scalar, recipient_public: &[u8; 32], aad: &[u8]) -> Result<SealedShare> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient_public));
    let mut key = derive_key(shared.as_bytes(), &ephemeral_public, recipient_public);

    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();
    let mut plaintext = [0u8; 32];
    plaintext.copy_from_slice(&share.to_bytes());
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext.as_slice(),
                aad,
            },
        )
        .map_err(|_| Error::Crypto("Failed to seal share".into()))?;
    plaintext.zeroize();

    Ok(SealedShare {
        ephemeral_public,
        nonce,
        ciphertext,
    })
}

fn derive_key(shared: &[u8; 32], ephemeral_public: &[u8; 32], recipient_public: &[u8; 32]) -> [u8; 32] {
    let mut material = [0u8; 96];
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(ephemeral_public);
    material[64..].copy_from_slice(recipient_public);
    let key = blake3::derive_key(SEAL_CONTEXT, &material);
    material.zeroize();
    key
}

mod nonce_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 12], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 12], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 12 bytes"))
    }
}

mod vec_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
