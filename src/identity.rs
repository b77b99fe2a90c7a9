//! Per-context identity used for self-broadcast suppression.
//!
//! Identity is minted lazily from the clock plus random bits and cached in
//! two places: an in-memory cell for the fast path and the context's session
//! store so a reload of the same context keeps the same identity. It is never
//! shared across genuinely distinct contexts.

use chrono::Utc;
use once_cell::sync::OnceCell;
use uuid::Uuid;

use crate::host::store::SessionStore;
use crate::slot_name;

/// Sentinel identity for contexts with no session scope (detached hosts).
pub const DETACHED_IDENTITY: &str = "detached";

const IDENTITY_SLOT_SUFFIX: &str = "tid";

/// Practically unique, not cryptographically secure.
pub(crate) fn mint() -> String {
    let clock = Utc::now().timestamp_millis();
    let noise = Uuid::new_v4().simple().to_string();
    format!("{:x}-{}", clock, &noise[..8])
}

pub(crate) struct IdentityCell {
    cell: OnceCell<String>,
}

impl IdentityCell {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Resolve the context identity, creating and stashing it on first use.
    pub fn get(&self, session: Option<&SessionStore>) -> &str {
        self.cell.get_or_init(|| resolve(session))
    }
}

fn resolve(session: Option<&SessionStore>) -> String {
    let Some(session) = session else {
        return DETACHED_IDENTITY.to_owned();
    };

    let slot = slot_name(IDENTITY_SLOT_SUFFIX);
    match session.get(&slot) {
        Some(saved) if !saved.is_empty() => saved,
        _ => {
            let id = mint();
            session.set(&slot, &id);
            id
        }
    }
}
