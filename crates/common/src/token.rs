//! Room-scoped join token signing and verification.
//!
//! A join token is an opaque credential binding a peer id to a single
//! room: `HMAC-SHA256(room_secret, peer_id)`, hex-encoded. It is minted
//! once per successful first join and presented on reconnect to
//! authenticate a returning peer. Verification recomputes the HMAC and
//! compares in constant time.
//!
//! The room secret is generated per room and never leaves it, so a token
//! from one room can never authenticate against another.

use crate::secret::{ExposeSecret, SecretBox};
use crate::types::PeerId;
use ring::{hmac, rand};

/// Required secret length in bytes.
const SECRET_LEN: usize = 32;

/// Signs and verifies join tokens under a room-scoped secret.
pub struct RoomTokenSigner {
    secret: SecretBox<Vec<u8>>,
}

impl RoomTokenSigner {
    /// Create a signer from an existing secret.
    ///
    /// # Panics
    ///
    /// Panics if the secret is shorter than 32 bytes.
    #[must_use]
    pub fn new(secret: SecretBox<Vec<u8>>) -> Self {
        assert!(
            secret.expose_secret().len() >= SECRET_LEN,
            "room secret must be at least 32 bytes"
        );
        Self { secret }
    }

    /// Create a signer with a freshly generated random secret.
    #[must_use]
    #[allow(clippy::expect_used)] // CSPRNG fill on 32 bytes is an unreachable failure
    pub fn generate() -> Self {
        let rng = rand::SystemRandom::new();
        let mut secret = vec![0u8; SECRET_LEN];
        rand::SecureRandom::fill(&rng, &mut secret).expect("CSPRNG should not fail on 32 bytes");
        Self {
            secret: SecretBox::new(Box::new(secret)),
        }
    }

    /// Mint a join token for the given peer.
    #[must_use]
    pub fn mint(&self, peer_id: &PeerId) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, self.secret.expose_secret());
        let tag = hmac::sign(&key, peer_id.as_str().as_bytes());
        hex::encode(tag.as_ref())
    }

    /// Verify a presented token against the given peer id.
    ///
    /// Comparison is constant time via `hmac::verify`.
    #[must_use]
    pub fn verify(&self, peer_id: &PeerId, token: &str) -> bool {
        let Ok(provided) = hex::decode(token) else {
            return false;
        };
        let key = hmac::Key::new(hmac::HMAC_SHA256, self.secret.expose_secret());
        hmac::verify(&key, peer_id.as_str().as_bytes(), &provided).is_ok()
    }
}
