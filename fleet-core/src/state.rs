//! High-availability server state machine.
//!
//! The coordinator is either a cold standby or the hot primary. Transitions
//! are driven exclusively by the overseer poll loop: the machine computes
//! the next state from (current state, whether this instance is the
//! designated primary), and the transitional markers tell the server which
//! one-shot side effect to run (snapshot recovery, or broadcast + pause).

use serde::{Deserialize, Serialize};

/// Coordinator readiness states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Standby; not accepting job traffic.
    #[default]
    Cold,
    /// Actively running jobs.
    Hot,
    /// Transitional marker: designated primary, snapshot recovery pending.
    Cold2Hot,
    /// Transitional marker: lost primary, broadcast + pause pending.
    Hot2Cold,
}

/// Gating decision for an inbound RPC type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    Allow,
    NotInService,
    AbortRun,
}

#[derive(Debug, Clone)]
pub struct StateCheck {
    pub action: StateAction,
    pub message: String,
}

impl StateCheck {
    fn allow() -> Self {
        Self {
            action: StateAction::Allow,
            message: String::new(),
        }
    }

    fn not_in_service(message: &str) -> Self {
        Self {
            action: StateAction::NotInService,
            message: message.to_string(),
        }
    }

    fn abort_run(message: &str) -> Self {
        Self {
            action: StateAction::AbortRun,
            message: message.to_string(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.action == StateAction::Allow
    }
}

const NOT_STARTED: &str = "Server application is not started";
const STARTING: &str = "Server is starting; not ready for requests";
const STANDBY: &str = "Server is transitioning to standby";
const STANDBY_ABORT: &str = "Server is transitioning to standby; abort the run";

impl ServerState {
    /// Compute the next state given whether this instance is currently the
    /// designated primary. Transitional markers are resolved by the server
    /// immediately after their side effect runs, so mapping them to
    /// themselves keeps the table total without re-triggering effects.
    pub fn transition(self, is_primary: bool) -> ServerState {
        match (self, is_primary) {
            (ServerState::Cold, true) => ServerState::Cold2Hot,
            (ServerState::Cold, false) => ServerState::Cold,
            (ServerState::Hot, true) => ServerState::Hot,
            (ServerState::Hot, false) => ServerState::Hot2Cold,
            (ServerState::Cold2Hot, _) => ServerState::Cold2Hot,
            (ServerState::Hot2Cold, _) => ServerState::Hot2Cold,
        }
    }

    pub fn register_check(self) -> StateCheck {
        match self {
            ServerState::Hot => StateCheck::allow(),
            ServerState::Cold => StateCheck::not_in_service(NOT_STARTED),
            ServerState::Cold2Hot => StateCheck::not_in_service(STARTING),
            ServerState::Hot2Cold => StateCheck::not_in_service(STANDBY),
        }
    }

    /// Heartbeats stay permitted during transitions so clients are not
    /// evicted in the middle of a failover.
    pub fn heartbeat_check(self) -> StateCheck {
        match self {
            ServerState::Hot | ServerState::Cold2Hot | ServerState::Hot2Cold => StateCheck::allow(),
            ServerState::Cold => StateCheck::not_in_service(NOT_STARTED),
        }
    }

    pub fn get_task_check(self) -> StateCheck {
        match self {
            ServerState::Hot => StateCheck::allow(),
            ServerState::Cold => StateCheck::not_in_service(NOT_STARTED),
            ServerState::Cold2Hot => StateCheck::not_in_service(STARTING),
            ServerState::Hot2Cold => StateCheck::abort_run(STANDBY_ABORT),
        }
    }

    pub fn submit_result_check(self) -> StateCheck {
        self.get_task_check()
    }

    pub fn aux_communicate_check(self) -> StateCheck {
        match self {
            ServerState::Hot => StateCheck::allow(),
            ServerState::Cold => StateCheck::not_in_service(NOT_STARTED),
            ServerState::Cold2Hot => StateCheck::not_in_service(STARTING),
            ServerState::Hot2Cold => StateCheck::not_in_service(STANDBY),
        }
    }
}

/// Current state plus the service identity clients must echo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStateInfo {
    pub state: ServerState,
    pub host: String,
    pub service_port: u16,
    /// Session-secret identifier. Adopted from the overseer's primary-SP
    /// record on each Cold->Hot transition; empty while cold.
    pub ssid: String,
}

impl ServerStateInfo {
    pub fn cold(host: impl Into<String>, service_port: u16) -> Self {
        Self {
            state: ServerState::Cold,
            host: host.into(),
            service_port,
            ssid: String::new(),
        }
    }

    /// Address as registered with the overseer.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.service_port)
    }

    pub fn become_hot(&mut self, ssid: String) {
        self.state = ServerState::Hot;
        self.ssid = ssid;
    }

    pub fn become_cold(&mut self) {
        self.state = ServerState::Cold;
        self.ssid.clear();
    }
}
