//! Built-in server commands.
//!
//! Each command is one [`CommandHandler`] implementation; the dispatcher in
//! [`crate::dispatch`] owns the identity, ssid and state checks, so handlers
//! only decode their payload and act on the engine or runner.

use std::time::Duration;

use async_trait::async_trait;

use crate::dispatch::{CommandContext, CommandHandler, CommandOutcome};
use crate::engine::RunnerStatus;
use crate::error::{FleetError, Result};
use crate::message::{commands, Payload, TaskReply, NO_OP_REPLY};
use crate::state::{ServerState, StateCheck};

/// Upper bound on how long an abort waits for the runner to stop.
const ABORT_WAIT: Duration = Duration::from_secs(30);
const ABORT_POLL: Duration = Duration::from_secs(1);

/// All built-in commands, ready for registry construction.
pub fn builtin_commands() -> Vec<Box<dyn CommandHandler>> {
    vec![
        Box::new(AbortCommand),
        Box::new(GetTaskCommand),
        Box::new(SubmitUpdateCommand),
        Box::new(HandleDeadJobCommand),
        Box::new(ShowStatsCommand),
        Box::new(GetErrorsCommand),
        Box::new(ResetErrorsCommand),
        Box::new(HeartbeatCommand),
        Box::new(ByeCommand),
        Box::new(GetRunInfoCommand),
        Box::new(ServerStateCommand),
        Box::new(AppCommand),
    ]
}

/// Abort the active run, optionally as part of a switch to cold standby.
pub struct AbortCommand;

#[async_trait]
impl CommandHandler for AbortCommand {
    fn name(&self) -> &'static str {
        commands::ABORT
    }

    async fn process(&self, payload: Payload, ctx: &CommandContext) -> Result<Option<CommandOutcome>> {
        let turn_to_cold = match payload {
            Payload::Abort(req) => req.turn_to_cold,
            Payload::None => false,
            other => return Err(unexpected_payload(self.name(), &other)),
        };
        if let Some(runner) = &ctx.runner {
            runner.abort(turn_to_cold).await;
            let deadline = tokio::time::Instant::now() + ABORT_WAIT;
            while runner.status() != RunnerStatus::Stopped {
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!("runner did not stop within {:?} after abort", ABORT_WAIT);
                    break;
                }
                tokio::time::sleep(ABORT_POLL).await;
            }
        }
        Ok(Some(Payload::Text("Aborted the run".to_string()).into()))
    }
}

/// Hand the next task to a polling client.
pub struct GetTaskCommand;

#[async_trait]
impl CommandHandler for GetTaskCommand {
    fn name(&self) -> &'static str {
        commands::GET_TASK
    }

    fn client_originated(&self) -> bool {
        true
    }

    fn state_check(&self, state: ServerState) -> Option<StateCheck> {
        Some(state.get_task_check())
    }

    async fn process(&self, _payload: Payload, ctx: &CommandContext) -> Result<Option<CommandOutcome>> {
        // Dispatcher guarantees the client is resolved for this command.
        let client = ctx
            .client
            .as_ref()
            .ok_or_else(|| FleetError::unauthenticated("Request from client: missing client token"))?;
        let task = match &ctx.runner {
            Some(runner) => runner.process_task_request(client).await?,
            None => TaskReply::try_again(1.0),
        };
        Ok(Some(Payload::Task(task).into()))
    }
}

/// Accept a completed task result from a client.
pub struct SubmitUpdateCommand;

#[async_trait]
impl CommandHandler for SubmitUpdateCommand {
    fn name(&self) -> &'static str {
        commands::SUBMIT_UPDATE
    }

    fn client_originated(&self) -> bool {
        true
    }

    fn state_check(&self, state: ServerState) -> Option<StateCheck> {
        Some(state.submit_result_check())
    }

    async fn process(&self, payload: Payload, ctx: &CommandContext) -> Result<Option<CommandOutcome>> {
        let submission = match payload {
            Payload::Submission(submission) => submission,
            other => return Err(unexpected_payload(self.name(), &other)),
        };
        let client = ctx
            .client
            .as_ref()
            .ok_or_else(|| FleetError::unauthenticated("Request from client: missing client token"))?;
        match &ctx.runner {
            Some(runner) => runner.process_submission(client, submission).await?,
            None => tracing::warn!(
                "dropped submission for task {} from {}: no active run",
                submission.task_name,
                client.name
            ),
        }
        Ok(Some(Payload::Text(String::new()).into()))
    }
}

/// A client's job process died; let the run react.
pub struct HandleDeadJobCommand;

#[async_trait]
impl CommandHandler for HandleDeadJobCommand {
    fn name(&self) -> &'static str {
        commands::HANDLE_DEAD_JOB
    }

    async fn process(&self, payload: Payload, ctx: &CommandContext) -> Result<Option<CommandOutcome>> {
        let report = match payload {
            Payload::DeadJob(report) => report,
            other => return Err(unexpected_payload(self.name(), &other)),
        };
        tracing::warn!(
            "received dead job report for client {}: {}",
            report.client_name,
            report.reason
        );
        if let Some(runner) = &ctx.runner {
            runner.handle_dead_job(&report.client_name).await?;
        }
        Ok(Some(Payload::Text(String::new()).into()))
    }
}

pub struct ShowStatsCommand;

#[async_trait]
impl CommandHandler for ShowStatsCommand {
    fn name(&self) -> &'static str {
        commands::SHOW_STATS
    }

    async fn process(&self, _payload: Payload, ctx: &CommandContext) -> Result<Option<CommandOutcome>> {
        let stats = ctx.engine.run_stats().await;
        Ok(Some(Payload::Json(stats).into()))
    }
}

pub struct GetErrorsCommand;

#[async_trait]
impl CommandHandler for GetErrorsCommand {
    fn name(&self) -> &'static str {
        commands::GET_ERRORS
    }

    async fn process(&self, _payload: Payload, ctx: &CommandContext) -> Result<Option<CommandOutcome>> {
        let payload = match ctx.engine.errors().await {
            Some(errors) => Payload::Json(errors),
            None => Payload::Text("No Error".to_string()),
        };
        Ok(Some(payload.into()))
    }
}

pub struct ResetErrorsCommand;

#[async_trait]
impl CommandHandler for ResetErrorsCommand {
    fn name(&self) -> &'static str {
        commands::RESET_ERRORS
    }

    async fn process(&self, _payload: Payload, ctx: &CommandContext) -> Result<Option<CommandOutcome>> {
        ctx.engine.reset_errors().await;
        Ok(Some(Payload::None.into()))
    }
}

/// Liveness probe on the command channel; the reply itself is the answer.
pub struct HeartbeatCommand;

#[async_trait]
impl CommandHandler for HeartbeatCommand {
    fn name(&self) -> &'static str {
        commands::HEARTBEAT
    }

    async fn process(&self, _payload: Payload, _ctx: &CommandContext) -> Result<Option<CommandOutcome>> {
        Ok(Some(Payload::None.into()))
    }
}

pub struct ByeCommand;

#[async_trait]
impl CommandHandler for ByeCommand {
    fn name(&self) -> &'static str {
        commands::BYE
    }

    async fn process(&self, _payload: Payload, _ctx: &CommandContext) -> Result<Option<CommandOutcome>> {
        Ok(Some(Payload::None.into()))
    }
}

pub struct GetRunInfoCommand;

#[async_trait]
impl CommandHandler for GetRunInfoCommand {
    fn name(&self) -> &'static str {
        commands::GET_RUN_INFO
    }

    async fn process(&self, _payload: Payload, ctx: &CommandContext) -> Result<Option<CommandOutcome>> {
        let payload = match ctx.engine.run_info().await {
            Some(info) => Payload::Json(info),
            None => Payload::Text(NO_OP_REPLY.to_string()),
        };
        Ok(Some(payload.into()))
    }
}

/// Install a state update pushed down from the parent coordinator.
pub struct ServerStateCommand;

#[async_trait]
impl CommandHandler for ServerStateCommand {
    fn name(&self) -> &'static str {
        commands::SERVER_STATE
    }

    async fn process(&self, payload: Payload, ctx: &CommandContext) -> Result<Option<CommandOutcome>> {
        let update = match payload {
            Payload::StateUpdate(update) => update,
            other => return Err(unexpected_payload(self.name(), &other)),
        };
        tracing::info!(
            "installing pushed server state {:?} (ssid {})",
            update.state,
            update.ssid
        );
        {
            let mut state = ctx.state.write().await;
            *state = update;
        }
        Ok(Some(Payload::Text("Success".to_string()).into()))
    }
}

/// Route an application-defined command through the app registry.
pub struct AppCommand;

#[async_trait]
impl CommandHandler for AppCommand {
    fn name(&self) -> &'static str {
        commands::APP_COMMAND
    }

    async fn process(&self, payload: Payload, ctx: &CommandContext) -> Result<Option<CommandOutcome>> {
        let request = match payload {
            Payload::App(request) => request,
            other => return Err(unexpected_payload(self.name(), &other)),
        };
        if request.topic.is_empty() {
            return Err(FleetError::bad_request_data("topic is missing"));
        }
        let handler = match ctx.app_commands.find(&request.topic) {
            Some(handler) => handler,
            None => {
                return Err(FleetError::bad_request_data(format!(
                    "no handler for app command {}",
                    request.topic
                )));
            }
        };
        let result = handler
            .handle(&request.topic, request.data)
            .await
            .map_err(|e| FleetError::execution(e.sanitized_message()))?;
        if !result.is_object() {
            return Err(FleetError::execution(format!(
                "app command {} returned a non-object result",
                request.topic
            )));
        }
        Ok(Some(Payload::Json(result).into()))
    }
}

fn unexpected_payload(command: &str, payload: &Payload) -> FleetError {
    FleetError::bad_request_data(format!(
        "unexpected payload for {}: {:?}",
        command,
        std::mem::discriminant(payload)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use tokio::sync::RwLock;

    use crate::directory::{ClientRecord, EndpointDirectory};
    use crate::dispatch::{AppCommandHandler, AppCommandRegistry, ServerCommands};
    use crate::engine::{InMemoryJobEngine, JobRunner};
    use crate::error::Result;
    use crate::message::{AbortRequest, AppRequest, Channel, Message, ReturnCode, TaskSubmission};
    use crate::state::ServerStateInfo;

    struct StubRunner {
        aborted: AtomicBool,
        cold: AtomicBool,
    }

    impl StubRunner {
        fn new() -> Self {
            Self {
                aborted: AtomicBool::new(false),
                cold: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl JobRunner for StubRunner {
        async fn process_task_request(&self, _client: &ClientRecord) -> Result<crate::message::TaskReply> {
            Ok(crate::message::TaskReply {
                task_name: "train".to_string(),
                task_id: "t-1".to_string(),
                wait_time: None,
                data: serde_json::json!({"round": 1}),
            })
        }

        async fn process_submission(
            &self,
            _client: &ClientRecord,
            _submission: TaskSubmission,
        ) -> Result<()> {
            Ok(())
        }

        async fn handle_dead_job(&self, _client_name: &str) -> Result<()> {
            Ok(())
        }

        async fn abort(&self, turn_to_cold: bool) {
            self.aborted.store(true, Ordering::SeqCst);
            self.cold.store(turn_to_cold, Ordering::SeqCst);
        }

        fn status(&self) -> RunnerStatus {
            if self.aborted.load(Ordering::SeqCst) {
                RunnerStatus::Stopped
            } else {
                RunnerStatus::Started
            }
        }
    }

    async fn hot_ctx(runner: Option<Arc<StubRunner>>) -> (CommandContext, ClientRecord) {
        let dir = EndpointDirectory::new("test", 10);
        let client = dir.register("site-a", "client.site-a").await.unwrap();
        let mut info = ServerStateInfo::cold("127.0.0.1", 6007);
        info.become_hot("ssid-1".to_string());
        let ctx = CommandContext {
            engine: Arc::new(InMemoryJobEngine::new()),
            runner: runner.map(|r| r as Arc<dyn JobRunner>),
            state: Arc::new(RwLock::new(info)),
            client: Some(client.clone()),
            aux: None,
            app_commands: Arc::new(AppCommandRegistry::new()),
        };
        (ctx, client)
    }

    fn request(topic: &str, payload: Payload) -> Message {
        let mut msg = Message::request(Channel::ServerCommand, topic, payload);
        msg.header.ssid = Some("ssid-1".to_string());
        msg
    }

    #[tokio::test]
    async fn test_abort_stops_runner_and_replies() {
        let runner = Arc::new(StubRunner::new());
        let (ctx, _) = hot_ctx(Some(runner.clone())).await;
        let commands = ServerCommands::new(builtin_commands());

        let reply = commands
            .execute(
                &request(commands::ABORT, Payload::Abort(AbortRequest { turn_to_cold: true })),
                &ctx,
            )
            .await;
        assert!(reply.is_ok());
        match reply.payload {
            Payload::Text(text) => assert_eq!(text, "Aborted the run"),
            other => panic!("unexpected payload: {:?}", other),
        }
        assert!(runner.aborted.load(Ordering::SeqCst));
        assert!(runner.cold.load(Ordering::SeqCst));
    }

    struct StuckRunner;

    #[async_trait]
    impl JobRunner for StuckRunner {
        async fn process_task_request(&self, _client: &ClientRecord) -> Result<crate::message::TaskReply> {
            Ok(crate::message::TaskReply::try_again(1.0))
        }

        async fn process_submission(
            &self,
            _client: &ClientRecord,
            _submission: TaskSubmission,
        ) -> Result<()> {
            Ok(())
        }

        async fn handle_dead_job(&self, _client_name: &str) -> Result<()> {
            Ok(())
        }

        async fn abort(&self, _turn_to_cold: bool) {}

        fn status(&self) -> RunnerStatus {
            RunnerStatus::Started
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_gives_up_after_wait_bound() {
        let dir = EndpointDirectory::new("test", 10);
        let client = dir.register("site-a", "client.site-a").await.unwrap();
        let mut info = ServerStateInfo::cold("127.0.0.1", 6007);
        info.become_hot("ssid-1".to_string());
        let ctx = CommandContext {
            engine: Arc::new(InMemoryJobEngine::new()),
            runner: Some(Arc::new(StuckRunner) as Arc<dyn JobRunner>),
            state: Arc::new(RwLock::new(info)),
            client: Some(client),
            aux: None,
            app_commands: Arc::new(AppCommandRegistry::new()),
        };
        let commands = ServerCommands::new(builtin_commands());

        let started = tokio::time::Instant::now();
        let reply = commands
            .execute(
                &request(commands::ABORT, Payload::Abort(AbortRequest { turn_to_cold: false })),
                &ctx,
            )
            .await;
        assert!(reply.is_ok());
        match reply.payload {
            Payload::Text(text) => assert_eq!(text, "Aborted the run"),
            other => panic!("unexpected payload: {:?}", other),
        }
        let waited = started.elapsed();
        assert!(waited >= ABORT_WAIT);
        assert!(waited < ABORT_WAIT + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_get_task_without_runner_is_try_again() {
        let (ctx, _) = hot_ctx(None).await;
        let commands = ServerCommands::new(builtin_commands());

        let reply = commands
            .execute(&request(commands::GET_TASK, Payload::None), &ctx)
            .await;
        assert!(reply.is_ok());
        match reply.payload {
            Payload::Task(task) => {
                assert!(task.is_try_again());
                assert_eq!(task.wait_time, Some(1.0));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_task_with_runner() {
        let (ctx, _) = hot_ctx(Some(Arc::new(StubRunner::new()))).await;
        let commands = ServerCommands::new(builtin_commands());

        let reply = commands
            .execute(&request(commands::GET_TASK, Payload::None), &ctx)
            .await;
        match reply.payload {
            Payload::Task(task) => assert_eq!(task.task_name, "train"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_task_while_standby_orders_abort() {
        let (ctx, _) = hot_ctx(Some(Arc::new(StubRunner::new()))).await;
        {
            let mut state = ctx.state.write().await;
            state.state = ServerState::Hot2Cold;
        }
        let commands = ServerCommands::new(builtin_commands());

        let reply = commands
            .execute(&request(commands::GET_TASK, Payload::None), &ctx)
            .await;
        assert!(reply.is_ok());
        match reply.payload {
            Payload::Task(task) => assert_eq!(task.task_name, crate::message::TASK_ABORT),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_errors_fallback() {
        let (ctx, _) = hot_ctx(None).await;
        let commands = ServerCommands::new(builtin_commands());

        let reply = commands
            .execute(&request(commands::GET_ERRORS, Payload::None), &ctx)
            .await;
        match reply.payload {
            Payload::Text(text) => assert_eq!(text, "No Error"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_state_command_installs_update() {
        let (ctx, _) = hot_ctx(None).await;
        let commands = ServerCommands::new(builtin_commands());

        let mut update = ServerStateInfo::cold("10.0.0.2", 7007);
        update.become_hot("ssid-9".to_string());
        let reply = commands
            .execute(
                &request(commands::SERVER_STATE, Payload::StateUpdate(update)),
                &ctx,
            )
            .await;
        assert!(reply.is_ok());
        let state = ctx.state.read().await;
        assert_eq!(state.ssid, "ssid-9");
        assert_eq!(state.host, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_app_command_routing() {
        struct Stats;
        #[async_trait]
        impl AppCommandHandler for Stats {
            async fn handle(
                &self,
                _topic: &str,
                _data: serde_json::Value,
            ) -> Result<serde_json::Value> {
                Ok(serde_json::json!({"count": 3}))
            }
        }

        let (ctx, _) = hot_ctx(None).await;
        ctx.app_commands.register("stats", Arc::new(Stats)).unwrap();
        let commands = ServerCommands::new(builtin_commands());

        let reply = commands
            .execute(
                &request(
                    commands::APP_COMMAND,
                    Payload::App(AppRequest {
                        topic: "stats".to_string(),
                        data: serde_json::Value::Null,
                    }),
                ),
                &ctx,
            )
            .await;
        match reply.payload {
            Payload::Json(value) => assert_eq!(value["count"], 3),
            other => panic!("unexpected payload: {:?}", other),
        }

        // Unregistered topic finds no handler at all.
        let reply = commands
            .execute(
                &request(
                    commands::APP_COMMAND,
                    Payload::App(AppRequest {
                        topic: "unknown".to_string(),
                        data: serde_json::Value::Null,
                    }),
                ),
                &ctx,
            )
            .await;
        assert_eq!(reply.return_code(), ReturnCode::BadRequestData);

        // Missing topic is a data error.
        let reply = commands
            .execute(
                &request(
                    commands::APP_COMMAND,
                    Payload::App(AppRequest {
                        topic: String::new(),
                        data: serde_json::Value::Null,
                    }),
                ),
                &ctx,
            )
            .await;
        assert_eq!(reply.return_code(), ReturnCode::BadRequestData);
    }
}
