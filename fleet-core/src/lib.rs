//! Coordination control plane for federated training fleets.
//!
//! The crate provides the server-side engine that admits clients through a
//! challenge/response handshake, tracks their liveness, reconciles the job
//! sets they report against the authoritative one, and follows the external
//! overseer's primary designation through the Cold/Hot state machine,
//! resuming jobs from durable snapshots after a failover.
//!
//! Transport, job execution, persistence and identity are capability seams
//! ([`transport::Transport`], [`engine::JobEngine`],
//! [`snapshot::SnapshotStore`], [`registration::IdentityAsserter`]); the
//! engine itself never opens sockets or spawns job processes.

pub mod commands;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod message;
pub mod overseer;
pub mod reconcile;
pub mod registration;
pub mod server;
pub mod snapshot;
pub mod state;
pub mod transport;

pub use config::ServerConfig;
pub use error::{FleetError, Result};
pub use server::FederatedServer;
pub use state::{ServerState, ServerStateInfo};
