// fleet-core/src/config.rs

//! Configuration for the coordinator server.
//!
//! Config structs are serde-deserializable with defaults, support
//! environment variable overrides (FLEET_* prefix), and validate before
//! the server starts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{FleetError, Result};

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Project name reported to clients.
    pub project_name: String,
    /// Minimum number of contributing clients per round.
    pub min_num_clients: usize,
    /// Maximum number of registered clients.
    pub max_num_clients: usize,
    /// Seconds without a heartbeat before a client is considered dead.
    pub heart_beat_timeout_secs: u64,
    /// Seconds a pending registration session stays valid.
    pub max_reg_duration_secs: u64,
    /// Interval between liveness/registration sweeps.
    pub sweep_interval_secs: u64,
    /// How often sweep loops check the shutdown flag.
    pub shutdown_check_interval_ms: u64,
    /// Seconds to wait for clients to log out during graceful shutdown.
    pub shutdown_period_secs: u64,
    /// Interval between overseer state checks.
    pub state_check_interval_secs: u64,
    /// Timeout for the state-change broadcast to job sub-coordinators.
    pub state_broadcast_timeout_secs: u64,
    /// Whether challenge/response authentication is required.
    pub secure_mode: bool,
    /// Whether a standby coordinator resumes jobs from durable snapshots.
    pub ha_mode: bool,
    /// Workspace root for restored run directories.
    pub workspace_root: PathBuf,
    /// Address to advertise to the overseer.
    pub host: String,
    pub service_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            project_name: "fleet".to_string(),
            min_num_clients: 1,
            max_num_clients: 100,
            heart_beat_timeout_secs: 600,
            max_reg_duration_secs: 60,
            sweep_interval_secs: 5,
            shutdown_check_interval_ms: 200,
            shutdown_period_secs: 30,
            state_check_interval_secs: 1,
            state_broadcast_timeout_secs: 5,
            secure_mode: false,
            ha_mode: false,
            workspace_root: PathBuf::from("workspace"),
            host: "0.0.0.0".to_string(),
            service_port: 6007,
        }
    }
}

impl ServerConfig {
    /// Apply environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("FLEET_PROJECT_NAME") {
            self.project_name = val;
        }
        if let Ok(val) = std::env::var("FLEET_MAX_NUM_CLIENTS") {
            if let Ok(v) = val.parse() {
                self.max_num_clients = v;
            }
        }
        if let Ok(val) = std::env::var("FLEET_HEART_BEAT_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                self.heart_beat_timeout_secs = v;
            }
        }
        if let Ok(val) = std::env::var("FLEET_MAX_REG_DURATION_SECS") {
            if let Ok(v) = val.parse() {
                self.max_reg_duration_secs = v;
            }
        }
        if let Ok(val) = std::env::var("FLEET_SHUTDOWN_PERIOD_SECS") {
            if let Ok(v) = val.parse() {
                self.shutdown_period_secs = v;
            }
        }
        if let Ok(val) = std::env::var("FLEET_SECURE_MODE") {
            if let Ok(v) = val.parse() {
                self.secure_mode = v;
            }
        }
        if let Ok(val) = std::env::var("FLEET_HA_MODE") {
            if let Ok(v) = val.parse() {
                self.ha_mode = v;
            }
        }
        if let Ok(val) = std::env::var("FLEET_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("FLEET_HOST") {
            self.host = val;
        }
        if let Ok(val) = std::env::var("FLEET_SERVICE_PORT") {
            if let Ok(v) = val.parse() {
                self.service_port = v;
            }
        }
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.project_name.is_empty() {
            return Err(FleetError::config("project_name must not be empty"));
        }
        if self.max_num_clients == 0 {
            return Err(FleetError::config("max_num_clients must be greater than 0"));
        }
        if self.min_num_clients > self.max_num_clients {
            return Err(FleetError::config(
                "min_num_clients must not exceed max_num_clients",
            ));
        }
        if self.heart_beat_timeout_secs == 0 {
            return Err(FleetError::config(
                "heart_beat_timeout_secs must be greater than 0",
            ));
        }
        if self.max_reg_duration_secs == 0 {
            return Err(FleetError::config(
                "max_reg_duration_secs must be greater than 0",
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(FleetError::config(
                "sweep_interval_secs must be greater than 0",
            ));
        }
        if self.shutdown_check_interval_ms == 0 || self.shutdown_check_interval_ms > 1000 {
            return Err(FleetError::config(
                "shutdown_check_interval_ms must be in (0, 1000]",
            ));
        }
        if self.service_port == 0 {
            return Err(FleetError::config("service_port must be greater than 0"));
        }
        Ok(())
    }
}
