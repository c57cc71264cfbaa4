//! Endpoint directory: the authoritative table of registered clients.
//!
//! Each live client holds a unique session token. Records are created on
//! successful registration, touched on every heartbeat, and removed on
//! eviction or voluntary quit. The directory is guarded by its own lock;
//! callers never hold it across I/O.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{FleetError, Result};

/// A registered client as tracked by the coordinator.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub name: String,
    pub token: String,
    /// Fully qualified transport address of the client endpoint.
    pub fqcn: String,
    pub registered_at: DateTime<Utc>,
    pub last_connect: Instant,
    pub last_connect_time: DateTime<Utc>,
}

impl ClientRecord {
    fn new(name: String, fqcn: String) -> Self {
        let now = Utc::now();
        Self {
            name,
            token: Uuid::new_v4().to_string(),
            fqcn,
            registered_at: now,
            last_connect: Instant::now(),
            last_connect_time: now,
        }
    }

    fn touch(&mut self, name: &str, fqcn: &str) {
        self.last_connect = Instant::now();
        self.last_connect_time = Utc::now();
        if self.name != name {
            self.name = name.to_string();
        }
        if self.fqcn != fqcn {
            self.fqcn = fqcn.to_string();
        }
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_connect.elapsed() > timeout
    }
}

/// Token-keyed table of live clients.
pub struct EndpointDirectory {
    project_name: String,
    max_num_clients: usize,
    clients: RwLock<HashMap<String, ClientRecord>>,
}

impl EndpointDirectory {
    pub fn new(project_name: impl Into<String>, max_num_clients: usize) -> Self {
        Self {
            project_name: project_name.into(),
            max_num_clients: max_num_clients.max(1),
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Register a client and allocate a unique session token.
    ///
    /// A live record with the same name is displaced: the old token is
    /// invalidated and the client continues under the new one.
    pub async fn register(&self, name: &str, fqcn: &str) -> Result<ClientRecord> {
        let mut clients = self.clients.write().await;

        let displaced: Vec<String> = clients
            .iter()
            .filter(|(_, c)| c.name == name)
            .map(|(token, _)| token.clone())
            .collect();
        for token in displaced {
            clients.remove(&token);
            tracing::warn!(
                "client {} re-registered; previous token {} invalidated",
                name,
                token
            );
        }

        if clients.len() >= self.max_num_clients {
            return Err(FleetError::unauthenticated(format!(
                "maximum number of clients ({}) reached",
                self.max_num_clients
            )));
        }

        let mut record = ClientRecord::new(name.to_string(), fqcn.to_string());
        while clients.contains_key(&record.token) {
            record.token = Uuid::new_v4().to_string();
        }
        clients.insert(record.token.clone(), record.clone());
        Ok(record)
    }

    /// Update the last-contact time for a live client. Returns false when
    /// the token is unknown (registration has not created the record).
    pub async fn heartbeat(&self, token: &str, name: &str, fqcn: &str) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get_mut(token) {
            Some(record) => {
                record.touch(name, fqcn);
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, token: &str) -> Option<ClientRecord> {
        let clients = self.clients.read().await;
        clients.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) -> Option<ClientRecord> {
        let mut clients = self.clients.write().await;
        clients.remove(token)
    }

    /// Tokens of clients whose last contact is older than `timeout`.
    pub async fn expired_tokens(&self, timeout: Duration) -> Vec<String> {
        let clients = self.clients.read().await;
        clients
            .values()
            .filter(|c| c.is_expired(timeout))
            .map(|c| c.token.clone())
            .collect()
    }

    pub async fn all_clients(&self) -> Vec<ClientRecord> {
        let clients = self.clients.read().await;
        clients.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        let clients = self.clients.read().await;
        clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_allocates_unique_tokens() {
        let dir = EndpointDirectory::new("test", 10);
        let a = dir.register("site-a", "client.site-a").await.unwrap();
        let b = dir.register("site-b", "client.site-b").await.unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(dir.len().await, 2);
    }

    #[tokio::test]
    async fn test_reregister_displaces_old_token() {
        let dir = EndpointDirectory::new("test", 10);
        let first = dir.register("site-a", "client.site-a").await.unwrap();
        let second = dir.register("site-a", "client.site-a").await.unwrap();
        assert_ne!(first.token, second.token);
        assert!(dir.get(&first.token).await.is_none());
        assert!(dir.get(&second.token).await.is_some());
        assert_eq!(dir.len().await, 1);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let dir = EndpointDirectory::new("test", 2);
        dir.register("a", "client.a").await.unwrap();
        dir.register("b", "client.b").await.unwrap();
        let err = dir.register("c", "client.c").await.unwrap_err();
        assert!(matches!(err, FleetError::Unauthenticated { .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_requires_registration() {
        let dir = EndpointDirectory::new("test", 10);
        assert!(!dir.heartbeat("no-such-token", "x", "client.x").await);

        let record = dir.register("site-a", "client.site-a").await.unwrap();
        assert!(dir.heartbeat(&record.token, "site-a", "client.site-a").await);
        // Heartbeat does not duplicate records.
        assert!(dir.heartbeat(&record.token, "site-a", "client.site-a").await);
        assert_eq!(dir.len().await, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_name_and_address() {
        let dir = EndpointDirectory::new("test", 10);
        let record = dir.register("site-a", "client.site-a").await.unwrap();
        dir.heartbeat(&record.token, "site-a2", "client.site-a2").await;
        let updated = dir.get(&record.token).await.unwrap();
        assert_eq!(updated.name, "site-a2");
        assert_eq!(updated.fqcn, "client.site-a2");
    }

    #[tokio::test]
    async fn test_expired_tokens() {
        let dir = EndpointDirectory::new("test", 10);
        let record = dir.register("site-a", "client.site-a").await.unwrap();
        assert!(dir.expired_tokens(Duration::from_secs(60)).await.is_empty());
        let expired = dir.expired_tokens(Duration::from_nanos(1)).await;
        assert_eq!(expired, vec![record.token]);
    }
}
