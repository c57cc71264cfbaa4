//! Message envelope types for the coordination control plane.
//!
//! The transport fabric delivers opaque request/reply messages between
//! named endpoints. This module defines the typed envelope the engine
//! speaks: a fixed header plus a tagged payload union, with a JSON escape
//! hatch only where the content is genuinely open-ended (app commands).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::state::ServerStateInfo;

/// Well-known command names routed by the dispatcher.
pub mod commands {
    pub const ABORT: &str = "abort";
    pub const BYE: &str = "bye";
    pub const GET_RUN_INFO: &str = "get_run_info";
    pub const GET_TASK: &str = "get_task";
    pub const SUBMIT_UPDATE: &str = "submit_update";
    pub const HANDLE_DEAD_JOB: &str = "handle_dead_job";
    pub const SHOW_STATS: &str = "show_stats";
    pub const GET_ERRORS: &str = "get_errors";
    pub const RESET_ERRORS: &str = "reset_errors";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SERVER_STATE: &str = "server_state";
    pub const APP_COMMAND: &str = "app_command";
}

/// Task name returned when the run has not started yet; the client should
/// retry after the indicated wait time.
pub const TASK_TRY_AGAIN: &str = "__try_again";

/// Task name ordering the client to abort its current run.
pub const TASK_ABORT: &str = "__abort_run";

/// Reply sent when a command has no meaningful result body.
pub const NO_OP_REPLY: &str = "__no_op_reply";

/// Channels in the hierarchical transport namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    ServerMain,
    ServerCommand,
    AuxCommunication,
    ServerParentListener,
}

/// Reply status codes visible to remote clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnCode {
    Ok,
    Unauthenticated,
    CommError,
    InvalidRequest,
    BadRequestData,
    ExecutionException,
    ServiceUnavailable,
}

/// Fixed message header. Open-ended metadata goes in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    pub origin: String,
    pub destination: String,
    pub channel: Channel,
    pub topic: String,
    pub token: Option<String>,
    pub ssid: Option<String>,
    pub job_id: Option<String>,
    pub client_name: Option<String>,
    pub return_code: Option<ReturnCode>,
    pub error: Option<String>,
    pub msg_root_id: Option<String>,
    pub msg_root_ttl: Option<u64>,
    pub extra: HashMap<String, String>,
}

/// Client kind presented at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    #[default]
    Regular,
    Admin,
}

/// Failure codes a client may attach to a job-failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    UnsafeComponent,
    ConfigError,
    RuntimeError,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
    /// Freshness nonce generated by the client.
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeReply {
    /// Freshness nonce generated by the server for this session.
    pub nonce: String,
    /// Server signature over the client nonce.
    pub signature: Vec<u8>,
    /// Server identity common name.
    pub common_name: String,
    /// Server certificate material.
    pub cert: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client_name: String,
    pub client_type: ClientType,
    /// Client signature over the server nonce from the challenge reply.
    pub proof: Vec<u8>,
    /// Client certificate material.
    pub cert: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReply {
    pub token: String,
    pub token_signature: Vec<u8>,
    pub ssid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Job IDs the client believes it is running.
    pub job_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatReply {
    /// Jobs the client must abort because the server does not know them.
    pub abort_jobs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailureReport {
    pub job_id: String,
    pub code: FailureCode,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortRequest {
    /// Whether the coordinator should move to cold standby after aborting.
    pub turn_to_cold: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReply {
    pub task_name: String,
    pub task_id: String,
    /// Suggested wait (seconds) before retrying, for the try-again sentinel.
    pub wait_time: Option<f64>,
    pub data: serde_json::Value,
}

impl TaskReply {
    /// Sentinel telling the client to retry later.
    pub fn try_again(wait_time: f64) -> Self {
        Self {
            task_name: TASK_TRY_AGAIN.to_string(),
            task_id: String::new(),
            wait_time: Some(wait_time),
            data: serde_json::Value::Null,
        }
    }

    pub fn is_try_again(&self) -> bool {
        self.task_name == TASK_TRY_AGAIN
    }

    /// Sentinel ordering the client to abort its current run.
    pub fn abort_run() -> Self {
        Self {
            task_name: TASK_ABORT.to_string(),
            task_id: String::new(),
            wait_time: None,
            data: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_name: String,
    pub task_id: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadJobReport {
    pub client_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRequest {
    pub topic: String,
    pub data: serde_json::Value,
}

/// Tagged payload union carried by every message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    None,
    Challenge(ChallengeRequest),
    ChallengeReply(ChallengeReply),
    Register(RegisterRequest),
    RegisterReply(RegisterReply),
    Heartbeat(HeartbeatRequest),
    HeartbeatReply(HeartbeatReply),
    JobFailure(JobFailureReport),
    Abort(AbortRequest),
    Task(TaskReply),
    Submission(TaskSubmission),
    DeadJob(DeadJobReport),
    StateUpdate(ServerStateInfo),
    App(AppRequest),
    Text(String),
    /// Escape hatch for genuinely open-ended content (app command results).
    Json(serde_json::Value),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

impl Message {
    pub fn new(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    /// Build a request addressed to a command topic.
    pub fn request(channel: Channel, topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            header: Header {
                channel,
                topic: topic.into(),
                ..Default::default()
            },
            payload,
        }
    }

    pub fn return_code(&self) -> ReturnCode {
        self.header.return_code.unwrap_or(ReturnCode::Ok)
    }

    pub fn is_ok(&self) -> bool {
        self.return_code() == ReturnCode::Ok
    }
}

/// Build a reply message with a status code and optional error string.
pub fn make_reply(rc: ReturnCode, error: impl Into<String>, payload: Payload) -> Message {
    let error = error.into();
    Message {
        header: Header {
            return_code: Some(rc),
            error: if error.is_empty() { None } else { Some(error) },
            ..Default::default()
        },
        payload,
    }
}

/// Build a successful reply carrying a payload.
pub fn ok_reply(payload: Payload) -> Message {
    make_reply(ReturnCode::Ok, "", payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_reply_codes() {
        let reply = make_reply(ReturnCode::Unauthenticated, "no registration session", Payload::None);
        assert_eq!(reply.return_code(), ReturnCode::Unauthenticated);
        assert_eq!(reply.header.error.as_deref(), Some("no registration session"));
        assert!(!reply.is_ok());

        let reply = ok_reply(Payload::Text("done".to_string()));
        assert!(reply.is_ok());
        assert!(reply.header.error.is_none());
    }

    #[test]
    fn test_try_again_sentinel() {
        let task = TaskReply::try_again(1.0);
        assert!(task.is_try_again());
        assert_eq!(task.wait_time, Some(1.0));
        assert!(task.task_id.is_empty());
    }

    #[test]
    fn test_payload_roundtrip_tagging() {
        let payload = Payload::Heartbeat(HeartbeatRequest {
            job_ids: vec!["job-1".to_string()],
        });
        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(encoded.contains("heartbeat"));
        let decoded: Payload = serde_json::from_str(&encoded).unwrap();
        match decoded {
            Payload::Heartbeat(hb) => assert_eq!(hb.job_ids, vec!["job-1".to_string()]),
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
