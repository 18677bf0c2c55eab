//! Mutual challenge-response handshake.
//!
//! 1. The client signs a fresh nonce and sends `(nonce, signature, key)`.
//! 2. The server verifies it, signs `client_nonce ‖ server_nonce`, and
//!    returns `(server_nonce, signature, server_key)`.
//! 3. The client verifies the server signature over the same concatenation.
//!
//! Keys are Ed25519, generated per process launch and never written out.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::protocol::b64;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 32;

/// Handshake failures. Any of them rejects the connection.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// Public key bytes did not decode.
    #[error("malformed public key")]
    MalformedKey,
    /// Signature bytes did not decode.
    #[error("malformed signature")]
    MalformedSignature,
    /// Nonce was not [`NONCE_LEN`] bytes.
    #[error("nonce must be {NONCE_LEN} bytes, got {0}")]
    BadNonce(usize),
    /// Signature did not verify.
    #[error("signature verification failed")]
    BadSignature,
}

/// Ephemeral signing identity of this process.
pub struct KeyMaterial {
    signing: SigningKey,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Fresh keypair from the OS random source.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Public half.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

/// `(nonce, signature, public_key)` as sent by either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloProof {
    /// Sender's fresh nonce.
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    /// Signature by the sender's key.
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    /// Sender's public key.
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
}

/// 32 bytes from the OS random source.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Client side of one handshake.
#[derive(Debug)]
pub struct ClientHandshake {
    nonce: [u8; NONCE_LEN],
}

impl ClientHandshake {
    /// Begin a handshake, returning the state to keep and the proof to send.
    pub fn start(keys: &KeyMaterial) -> (Self, HelloProof) {
        let nonce = random_nonce();
        let proof = HelloProof {
            nonce: nonce.to_vec(),
            signature: keys.sign(&nonce),
            public_key: keys.public_key().to_vec(),
        };
        (Self { nonce }, proof)
    }

    /// Check the server's reply.
    ///
    /// # Errors
    ///
    /// Fails unless the server signed our nonce followed by its own.
    pub fn finish(self, reply: &HelloProof) -> Result<(), HandshakeError> {
        check_nonce(&reply.nonce)?;
        let transcript = concat(&self.nonce, &reply.nonce);
        verify(&reply.public_key, &transcript, &reply.signature)
    }
}

/// Verify the client's proof and produce the server reply.
///
/// # Errors
///
/// Fails when the client nonce is malformed or its signature does not
/// verify under the supplied key. No reply is produced in that case.
pub fn server_respond(keys: &KeyMaterial, client: &HelloProof) -> Result<HelloProof, HandshakeError> {
    check_nonce(&client.nonce)?;
    verify(&client.public_key, &client.nonce, &client.signature)?;

    let server_nonce = random_nonce();
    let transcript = concat(&client.nonce, &server_nonce);
    Ok(HelloProof {
        nonce: server_nonce.to_vec(),
        signature: keys.sign(&transcript),
        public_key: keys.public_key().to_vec(),
    })
}

fn check_nonce(nonce: &[u8]) -> Result<(), HandshakeError> {
    if nonce.len() == NONCE_LEN {
        Ok(())
    } else {
        Err(HandshakeError::BadNonce(nonce.len()))
    }
}

fn concat(first: &[u8], second: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(first.len().saturating_add(second.len()));
    out.extend_from_slice(first);
    out.extend_from_slice(second);
    out
}

fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), HandshakeError> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| HandshakeError::MalformedKey)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| HandshakeError::MalformedKey)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| HandshakeError::MalformedSignature)?;
    key.verify_strict(message, &signature)
        .map_err(|_| HandshakeError::BadSignature)
}
