//! Command dispatch for the server-command channel.
//!
//! Every command is a named handler in a registry. The dispatcher owns the
//! cross-cutting checks so individual handlers stay small: client identity
//! for client-originated commands, ssid echo, and per-command state gating.
//! App commands get their own topic-keyed registry with a `*` fallback.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::directory::ClientRecord;
use crate::engine::{JobEngine, JobRunner};
use crate::error::{FleetError, Result};
use crate::message::{make_reply, ok_reply, Message, Payload, ReturnCode, TaskReply};
use crate::state::{ServerState, ServerStateInfo, StateAction, StateCheck};

/// Result of a command handler, plus optional message-root propagation for
/// streaming replies.
#[derive(Debug, Default)]
pub struct CommandOutcome {
    pub payload: Payload,
    pub msg_root_id: Option<String>,
    pub msg_root_ttl: Option<u64>,
}

impl From<Payload> for CommandOutcome {
    fn from(payload: Payload) -> Self {
        Self {
            payload,
            msg_root_id: None,
            msg_root_ttl: None,
        }
    }
}

/// Handler for application-defined commands, keyed by topic.
#[async_trait]
pub trait AppCommandHandler: Send + Sync {
    async fn handle(&self, topic: &str, data: serde_json::Value) -> Result<serde_json::Value>;
}

/// Topic-keyed registry of app-command handlers. The `*` topic is the
/// fallback consulted when no exact handler exists.
#[derive(Default)]
pub struct AppCommandRegistry {
    handlers: std::sync::RwLock<HashMap<String, Arc<dyn AppCommandHandler>>>,
}

impl AppCommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, topic: &str, handler: Arc<dyn AppCommandHandler>) -> Result<()> {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handlers.contains_key(topic) {
            return Err(FleetError::invalid_request(format!(
                "app command {} already registered",
                topic
            )));
        }
        handlers.insert(topic.to_string(), handler);
        Ok(())
    }

    pub fn find(&self, topic: &str) -> Option<Arc<dyn AppCommandHandler>> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers
            .get(topic)
            .or_else(|| handlers.get("*"))
            .cloned()
    }
}

/// Shared server context handed to every handler invocation.
pub struct CommandContext {
    pub engine: Arc<dyn JobEngine>,
    pub runner: Option<Arc<dyn JobRunner>>,
    pub state: Arc<RwLock<ServerStateInfo>>,
    /// Resolved client record; set only when the request carried a valid
    /// session token.
    pub client: Option<ClientRecord>,
    pub aux: Option<Arc<dyn AuxDispatcher>>,
    pub app_commands: Arc<AppCommandRegistry>,
}

/// One named command on the server-command channel.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Client-originated commands require a resolved client record and a
    /// matching ssid before they run.
    fn client_originated(&self) -> bool {
        false
    }

    /// Per-command state gate; None means the command runs in any state.
    fn state_check(&self, _state: ServerState) -> Option<StateCheck> {
        None
    }

    async fn process(&self, payload: Payload, ctx: &CommandContext) -> Result<Option<CommandOutcome>>;
}

/// Map an internal error onto the reply status visible to the requester.
pub fn return_code_for(err: &FleetError) -> ReturnCode {
    match err {
        FleetError::Unauthenticated { .. } => ReturnCode::Unauthenticated,
        FleetError::NotReady { .. } => ReturnCode::CommError,
        FleetError::InvalidRequest { .. } => ReturnCode::InvalidRequest,
        FleetError::BadRequestData { .. } => ReturnCode::BadRequestData,
        FleetError::ServiceUnavailable => ReturnCode::ServiceUnavailable,
        FleetError::Execution { .. }
        | FleetError::Config { .. }
        | FleetError::Snapshot { .. }
        | FleetError::Transport { .. } => ReturnCode::ExecutionException,
    }
}

/// Name-keyed registry of server commands.
pub struct ServerCommands {
    handlers: HashMap<&'static str, Box<dyn CommandHandler>>,
}

impl ServerCommands {
    pub fn new(handlers: Vec<Box<dyn CommandHandler>>) -> Self {
        let mut map: HashMap<&'static str, Box<dyn CommandHandler>> = HashMap::new();
        for handler in handlers {
            map.insert(handler.name(), handler);
        }
        Self { handlers: map }
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Dispatch one request on the server-command channel and build the
    /// reply. Never returns an error: failures are encoded in the reply.
    pub async fn execute(&self, request: &Message, ctx: &CommandContext) -> Message {
        let topic = request.header.topic.as_str();
        let handler = match self.handlers.get(topic) {
            Some(handler) => handler,
            None => {
                tracing::warn!("received unknown command {}", topic);
                return make_reply(
                    ReturnCode::InvalidRequest,
                    format!("unknown command: {}", topic),
                    Payload::None,
                );
            }
        };

        if handler.client_originated() {
            if ctx.client.is_none() {
                return make_reply(
                    ReturnCode::Unauthenticated,
                    "Request from client: missing client token",
                    Payload::None,
                );
            }
            let state = ctx.state.read().await;
            if !state.ssid.is_empty() && request.header.ssid.as_deref() != Some(state.ssid.as_str())
            {
                return make_reply(
                    ReturnCode::Unauthenticated,
                    "invalid client SSID",
                    Payload::None,
                );
            }
        }

        let current = ctx.state.read().await.state;
        if let Some(check) = handler.state_check(current) {
            match check.action {
                StateAction::Allow => {}
                StateAction::NotInService => {
                    return make_reply(ReturnCode::CommError, check.message, Payload::None);
                }
                StateAction::AbortRun => {
                    tracing::warn!("command {} while {:?}: {}", topic, current, check.message);
                    return ok_reply(Payload::Task(TaskReply::abort_run()));
                }
            }
        }

        match handler.process(request.payload.clone(), ctx).await {
            Ok(Some(outcome)) => {
                let mut reply = ok_reply(outcome.payload);
                reply.header.msg_root_id = outcome.msg_root_id;
                reply.header.msg_root_ttl = outcome.msg_root_ttl;
                reply
            }
            Ok(None) => make_reply(
                ReturnCode::ExecutionException,
                "No process results",
                Payload::None,
            ),
            Err(err) => {
                tracing::error!("command {} failed: {}", topic, err);
                make_reply(return_code_for(&err), err.sanitized_message(), Payload::None)
            }
        }
    }
}

/// Routes auxiliary-channel messages into the active run.
#[async_trait]
pub trait AuxDispatcher: Send + Sync {
    async fn dispatch(&self, topic: &str, request: Message) -> Result<Message>;
}

/// Handle one auxiliary-channel request: state gate, ssid echo, then the
/// run's own dispatcher.
pub async fn aux_communicate(request: &Message, ctx: &CommandContext) -> Message {
    let state = ctx.state.read().await.clone();
    let check = state.state.aux_communicate_check();
    if !check.is_allowed() {
        return make_reply(ReturnCode::CommError, check.message, Payload::None);
    }
    if !state.ssid.is_empty() && request.header.ssid.as_deref() != Some(state.ssid.as_str()) {
        return make_reply(
            ReturnCode::Unauthenticated,
            "invalid client SSID",
            Payload::None,
        );
    }
    let dispatcher = match &ctx.aux {
        Some(dispatcher) => dispatcher,
        None => {
            return make_reply(
                ReturnCode::ServiceUnavailable,
                "no auxiliary message dispatcher",
                Payload::None,
            );
        }
    };
    match dispatcher.dispatch(&request.header.topic, request.clone()).await {
        Ok(reply) => reply,
        Err(err) => make_reply(return_code_for(&err), err.sanitized_message(), Payload::None),
    }
}
