use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};

use crate::error::{GridError, Result};

const TOKEN_BYTES: usize = 32;

/// Standing of a presented token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Live,
    /// The session reached a terminal state. The token proves identity for
    /// idempotent reporting but authorizes no mutation.
    Retired,
}

struct Entry {
    token: String,
    live: bool,
}

/// Per-session bearer tokens gating write, resize, kill and cd.
#[derive(Default)]
pub struct CapabilityAuthority {
    grants: Mutex<HashMap<String, Entry>>,
}

fn fresh_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl CapabilityAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token for `session_id`, replacing any earlier one.
    pub fn issue(&self, session_id: &str) -> String {
        let token = fresh_token();
        self.grants.lock().insert(
            session_id.to_string(),
            Entry {
                token: token.clone(),
                live: true,
            },
        );
        token
    }

    /// Fails closed. Unknown session, missing token and mismatch all map to
    /// the same `Forbidden`.
    pub fn check(&self, session_id: &str, token: Option<&str>) -> Result<Grant> {
        let grants = self.grants.lock();
        match (grants.get(session_id), token) {
            (Some(entry), Some(given)) if constant_time_eq(entry.token.as_bytes(), given.as_bytes()) => {
                Ok(if entry.live { Grant::Live } else { Grant::Retired })
            }
            _ => Err(GridError::Forbidden),
        }
    }

    /// Invalidate the token for mutation once the session is terminal.
    pub fn retire(&self, session_id: &str) {
        if let Some(entry) = self.grants.lock().get_mut(session_id) {
            entry.live = false;
        }
    }

    pub fn revoke(&self, session_id: &str) {
        self.grants.lock().remove(session_id);
    }

    pub fn revoke_all(&self) {
        self.grants.lock().clear();
    }
}
