//! Device request signatures
//!
//! Every submission a device makes can be wrapped in a [`SignedRequest`]. The
//! signature covers a domain-separated encoding of the sender, the operation
//! name, the ceremony or session it targets and the JSON body. A request
//! cannot be replayed as another operation, against another ceremony or
//! session, or attributed to another device.

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{Error, ParticipantId, Result};

const REQUEST_DOMAIN: &[u8] = b"tecdsa-ceremony request v1";

/// A request body signed by the submitting device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRequest<T> {
    /// Claimed sender
    pub participant_id: ParticipantId,
    /// Operation name, e.g. `submit_dkg`
    pub operation: String,
    /// Ceremony or session ID the request targets
    pub resource: String,
    /// Request body
    pub body: T,
    /// Base64 ed25519 signature
    pub signature: String,
}

impl<T: Serialize> SignedRequest<T> {
    /// Check the signature against the sender's enrolled verifying key
    pub fn verify(
        &self,
        verifying_key: &[u8; 32],
        expected_operation: &str,
        expected_resource: &str,
    ) -> Result<()> {
        if self.operation != expected_operation {
            return Err(Error::Authorization(format!(
                "Request signed for {} used for {}",
                self.operation, expected_operation
            )));
        }
        if self.resource != expected_resource {
            return Err(Error::Authorization(format!(
                "Request signed for {} used against {}",
                self.resource, expected_resource
            )));
        }

        let key = parse_verifying_key(verifying_key)?;
        let raw = STANDARD
            .decode(&self.signature)
            .map_err(|e| Error::Authorization(format!("Malformed signature encoding: {}", e)))?;
        let signature = Signature::from_slice(&raw)
            .map_err(|e| Error::Authorization(format!("Malformed signature: {}", e)))?;

        let payload =
            signing_payload(&self.participant_id, &self.operation, &self.resource, &self.body)?;
        key.verify(&payload, &signature)
            .map_err(|_| Error::Authorization(format!("Bad signature from {}", self.participant_id)))
    }
}

/// Parse an enrolled ed25519 verifying key
pub fn parse_verifying_key(bytes: &[u8; 32]) -> Result<VerifyingKey> {
    VerifyingKey::from_bytes(bytes)
        .map_err(|e| Error::Authorization(format!("Malformed verifying key: {}", e)))
}

/// Each field is length-prefixed so no two field splits encode alike
fn signing_payload<T: Serialize>(
    participant_id: &str,
    operation: &str,
    resource: &str,
    body: &T,
) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(body)?;
    let mut payload = Vec::with_capacity(
        REQUEST_DOMAIN.len() + participant_id.len() + operation.len() + resource.len() + body.len() + 32,
    );
    payload.extend_from_slice(REQUEST_DOMAIN);
    for field in [participant_id.as_bytes(), operation.as_bytes(), resource.as_bytes(), body.as_slice()] {
        payload.extend_from_slice(&(field.len() as u64).to_le_bytes());
        payload.extend_from_slice(field);
    }
    Ok(payload)
}

/// A device's request-signing key
pub struct DeviceKey {
    signing_key: SigningKey,
}

impl DeviceKey {
    /// Generate a new key
    pub fn random() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self { signing_key }
    }

    /// Verifying key published at enrollment
    pub fn verifying_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign `body` for `operation` against `resource` on behalf of
    /// `participant_id`
    ///
    /// `resource` is the ceremony or session ID, or empty for requests that
    /// target neither.
    pub fn sign<T: Serialize>(
        &self,
        participant_id: &str,
        operation: &str,
        resource: &str,
        body: T,
    ) -> Result<SignedRequest<T>> {
        let payload = signing_payload(participant_id, operation, resource, &body)?;
        let signature = self.signing_key.sign(&payload);
        Ok(SignedRequest {
            participant_id: participant_id.to_string(),
            operation: operation.to_string(),
            resource: resource.to_string(),
            body,
            signature: STANDARD.encode(signature.to_bytes()),
        })
    }
}
