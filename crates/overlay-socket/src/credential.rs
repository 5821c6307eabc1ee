//! Handshake admission.
//!
//! The provider both mints the credential this node presents and judges the
//! ones peers present. Secure-unicast channels refuse handshakes without a
//! credential regardless of the provider.

use bytes::Bytes;
use overlay_protocol::{Credential, NodeId};
use sha2::{Digest, Sha256};

pub trait CredentialProvider: Send + Sync + 'static {
    /// The credential to attach to outgoing handshakes, if any.
    fn current(&self) -> Option<Credential>;

    /// Whether a peer's credential is acceptable.
    fn validate(&self, credential: &Credential) -> bool;
}

/// Presents nothing and admits everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAdmission;

impl CredentialProvider for OpenAdmission {
    fn current(&self) -> Option<Credential> {
        None
    }

    fn validate(&self, _credential: &Credential) -> bool {
        true
    }
}

/// Admits nodes that share a secret: the token is the hex SHA-256 of the
/// secret followed by the subject's node id.
#[derive(Clone)]
pub struct SharedSecretCredentials {
    secret: Vec<u8>,
    subject: NodeId,
}

impl SharedSecretCredentials {
    pub fn new(secret: impl Into<Vec<u8>>, subject: NodeId) -> Self {
        Self {
            secret: secret.into(),
            subject,
        }
    }

    fn token_for(&self, subject: &NodeId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(subject.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Debug for SharedSecretCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretCredentials")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

impl CredentialProvider for SharedSecretCredentials {
    fn current(&self) -> Option<Credential> {
        Some(Credential {
            subject: self.subject,
            token: Bytes::from(self.token_for(&self.subject)),
        })
    }

    fn validate(&self, credential: &Credential) -> bool {
        let expected = self.token_for(&credential.subject);
        constant_time_eq(expected.as_bytes(), &credential.token)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
