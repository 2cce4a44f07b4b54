//! Event signing.
//!
//! Each agent owns exactly one signer; a signer never sees another
//! agent's key. The default implementation computes the canonical event
//! id and fills `sig` with an HMAC-SHA256 commitment over it — the
//! relay-facing transport adapter is where a wire-grade signature scheme
//! plugs in, behind the same trait.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use tenex_domain::event::{Event, EventDraft};

type HmacSha256 = Hmac<Sha256>;

/// Turns drafts into signed events for one principal.
pub trait EventSigner: Send + Sync {
    /// The principal's public key (hex).
    fn pubkey(&self) -> &str;

    /// Fill in `id`, `pubkey` and `sig`.
    fn sign(&self, draft: EventDraft) -> Event;
}

/// Signer holding one principal's key material.
pub struct KeypairSigner {
    pubkey: String,
    secret: Vec<u8>,
}

impl KeypairSigner {
    /// `secret_hex` is the at-rest secret from the agent store; a
    /// non-hex secret is used as raw bytes.
    pub fn new(pubkey: impl Into<String>, secret_hex: &str) -> Self {
        let secret = hex::decode(secret_hex).unwrap_or_else(|_| secret_hex.as_bytes().to_vec());
        Self {
            pubkey: pubkey.into(),
            secret,
        }
    }

    fn commitment(&self, id: &str) -> String {
        // HMAC-SHA256 accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl EventSigner for KeypairSigner {
    fn pubkey(&self) -> &str {
        &self.pubkey
    }

    fn sign(&self, draft: EventDraft) -> Event {
        let id = draft.compute_id(&self.pubkey);
        let sig = self.commitment(&id);
        Event {
            id,
            pubkey: self.pubkey.clone(),
            created_at: draft.created_at,
            kind: draft.kind,
            tags: draft.tags,
            content: draft.content,
            sig,
        }
    }
}
