//! Challenge/response registration sessions and identity seams.
//!
//! A client starts the handshake with a challenge carrying a freshness
//! nonce; the server answers with its own nonce and signed proof, keeping a
//! pending session keyed by the originating identity. The register step
//! consumes the session; stale sessions are swept out after
//! `max_reg_duration` so a captured challenge cannot be replayed later.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::message::Message;

/// State for one pending registration handshake.
#[derive(Debug, Clone)]
pub struct RegistrationSession {
    /// Originating identity the challenge arrived from.
    pub origin: String,
    /// Server-generated freshness nonce returned in the challenge reply.
    pub nonce: String,
    started: Instant,
}

impl RegistrationSession {
    fn new(origin: String) -> Self {
        Self {
            origin,
            nonce: Uuid::new_v4().to_string(),
            started: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Pending registration sessions, at most one per origin.
pub struct RegistrationTable {
    max_reg_duration: Duration,
    sessions: Mutex<HashMap<String, RegistrationSession>>,
}

impl RegistrationTable {
    pub fn new(max_reg_duration: Duration) -> Self {
        Self {
            max_reg_duration,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a session for `origin`, displacing any pending one.
    pub async fn open(&self, origin: &str) -> RegistrationSession {
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(origin).is_some() {
            tracing::warn!(
                "received duplicate challenge from client {} without register",
                origin
            );
        }
        let session = RegistrationSession::new(origin.to_string());
        sessions.insert(origin.to_string(), session.clone());
        session
    }

    /// Consume the pending session for `origin`. A session can be taken at
    /// most once; replay without a fresh challenge finds nothing.
    pub async fn take(&self, origin: &str) -> Option<RegistrationSession> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(origin)
    }

    /// Drop sessions older than `max_reg_duration`. Returns the drop count.
    pub async fn sweep_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.age() > self.max_reg_duration)
            .map(|(origin, _)| origin.clone())
            .collect();
        for origin in &expired {
            sessions.remove(origin);
            tracing::warn!(
                "dropped expired reg session for {}: not done in {:?}",
                origin,
                self.max_reg_duration
            );
        }
        expired.len()
    }

    pub async fn pending_count(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.len()
    }
}

/// Identity-asserter capability: signing and certificate material are
/// provided externally; the engine never designs crypto primitives.
pub trait IdentityAsserter: Send + Sync {
    fn common_name(&self) -> &str;
    fn cert_data(&self) -> &[u8];
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool>;
}

/// Verifies a register request against its pending session. Returns the
/// verified client name, or an authentication error.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        request: &Message,
        session: &RegistrationSession,
    ) -> Result<String>;
}
