//! Bearer token issued to the control device by `/handshake`.
//!
//! One token per leader lifetime: generated lazily on the first handshake,
//! returned unchanged on every later handshake, and forgotten when the leader
//! stops.

use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct TokenManager {
    current: Mutex<Option<String>>,
}

impl TokenManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<String>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the active token, creating it if none exists yet.
    pub fn generate(&self) -> String {
        self.slot()
            .get_or_insert_with(|| uuid::Uuid::new_v4().simple().to_string())
            .clone()
    }

    pub fn validate(&self, token: &str) -> bool {
        self.slot().as_deref() == Some(token)
    }

    pub fn clear(&self) {
        self.slot().take();
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn extract_bearer_token(header: Option<&str>) -> Option<&str> {
    header?.strip_prefix("Bearer ").filter(|t| !t.is_empty())
}
