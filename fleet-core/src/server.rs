//! The federated coordination server.
//!
//! Owns the endpoint directory, registration table, HA state and command
//! registry, and runs the background loops: the liveness/registration sweep
//! and the overseer poll that drives Cold/Hot transitions. All inbound
//! traffic funnels through the typed entry points here; replies encode
//! failures as status codes, never transport errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::commands::builtin_commands;
use crate::config::ServerConfig;
use crate::directory::{ClientRecord, EndpointDirectory};
use crate::dispatch::{
    aux_communicate, AppCommandRegistry, AuxDispatcher, CommandContext, ServerCommands,
};
use crate::engine::{JobEngine, JobProcessInfo, JobRunner};
use crate::error::Result;
use crate::message::{
    make_reply, ok_reply, ChallengeReply, Channel, HeartbeatReply, Message, Payload, RegisterReply,
    ReturnCode, commands as command_names, FailureCode,
};
use crate::overseer::Overseer;
use crate::reconcile::reconcile;
use crate::registration::{Authenticator, IdentityAsserter, RegistrationTable};
use crate::snapshot::{SnapshotStore, Workspace};
use crate::state::{ServerState, ServerStateInfo, StateAction};
use crate::transport::Transport;

pub struct FederatedServer {
    config: ServerConfig,
    directory: Arc<EndpointDirectory>,
    registrations: Arc<RegistrationTable>,
    state: Arc<RwLock<ServerStateInfo>>,
    engine: Arc<dyn JobEngine>,
    runner: RwLock<Option<Arc<dyn JobRunner>>>,
    commands: ServerCommands,
    app_commands: Arc<AppCommandRegistry>,
    overseer: Arc<dyn Overseer>,
    snapshots: Arc<dyn SnapshotStore>,
    transport: Arc<dyn Transport>,
    identity: Option<Arc<dyn IdentityAsserter>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    aux: Option<Arc<dyn AuxDispatcher>>,
    workspace: Workspace,
    /// Token the server uses for messages it originates itself.
    server_token: String,
    server_token_signature: Vec<u8>,
    /// Guards against overlapping overseer state checks.
    checking_server_state: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FederatedServer {
    pub fn new(
        config: ServerConfig,
        engine: Arc<dyn JobEngine>,
        overseer: Arc<dyn Overseer>,
        snapshots: Arc<dyn SnapshotStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let directory = Arc::new(EndpointDirectory::new(
            config.project_name.clone(),
            config.max_num_clients,
        ));
        let registrations = Arc::new(RegistrationTable::new(Duration::from_secs(
            config.max_reg_duration_secs,
        )));
        let state = Arc::new(RwLock::new(ServerStateInfo::cold(
            config.host.clone(),
            config.service_port,
        )));
        let workspace = Workspace::new(config.workspace_root.clone());
        Ok(Self {
            config,
            directory,
            registrations,
            state,
            engine,
            runner: RwLock::new(None),
            commands: ServerCommands::new(builtin_commands()),
            app_commands: Arc::new(AppCommandRegistry::new()),
            overseer,
            snapshots,
            transport,
            identity: None,
            authenticator: None,
            aux: None,
            workspace,
            server_token: uuid::Uuid::new_v4().to_string(),
            server_token_signature: Vec::new(),
            checking_server_state: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityAsserter>) -> Self {
        match identity.sign(self.server_token.as_bytes()) {
            Ok(signature) => self.server_token_signature = signature,
            Err(err) => tracing::error!("failed to sign server token: {}", err),
        }
        self.identity = Some(identity);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_aux_dispatcher(mut self, aux: Arc<dyn AuxDispatcher>) -> Self {
        self.aux = Some(aux);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<EndpointDirectory> {
        &self.directory
    }

    pub fn app_commands(&self) -> &Arc<AppCommandRegistry> {
        &self.app_commands
    }

    pub async fn server_state(&self) -> ServerStateInfo {
        self.state.read().await.clone()
    }

    /// Token identifying messages the server originates itself.
    pub fn server_token(&self) -> &str {
        &self.server_token
    }

    /// Signature over the server token, when an identity is installed.
    pub fn server_token_signature(&self) -> &[u8] {
        &self.server_token_signature
    }

    pub async fn set_runner(&self, runner: Arc<dyn JobRunner>) {
        let mut slot = self.runner.write().await;
        *slot = Some(runner);
    }

    pub async fn clear_runner(&self) {
        let mut slot = self.runner.write().await;
        *slot = None;
    }

    /// First leg of the registration handshake: open a session and prove
    /// the server's identity over the client's nonce.
    pub async fn client_challenge(&self, request: &Message) -> Message {
        let check = self.state.read().await.state.register_check();
        if !check.is_allowed() {
            return make_reply(ReturnCode::CommError, check.message, Payload::None);
        }
        if !self.config.secure_mode {
            return make_reply(
                ReturnCode::Unauthenticated,
                "server is not in secure mode",
                Payload::None,
            );
        }
        let identity = match &self.identity {
            Some(identity) => identity,
            None => {
                return make_reply(
                    ReturnCode::Unauthenticated,
                    "server is not in secure mode",
                    Payload::None,
                );
            }
        };
        let challenge = match &request.payload {
            Payload::Challenge(challenge) => challenge,
            _ => {
                return make_reply(
                    ReturnCode::BadRequestData,
                    "missing challenge data",
                    Payload::None,
                );
            }
        };
        let origin = request.header.origin.as_str();
        if origin.is_empty() {
            return make_reply(ReturnCode::BadRequestData, "missing origin", Payload::None);
        }

        let session = self.registrations.open(origin).await;
        let signature = match identity.sign(challenge.nonce.as_bytes()) {
            Ok(signature) => signature,
            Err(err) => {
                tracing::error!("failed to sign challenge nonce: {}", err);
                return make_reply(
                    ReturnCode::ExecutionException,
                    err.sanitized_message(),
                    Payload::None,
                );
            }
        };
        ok_reply(Payload::ChallengeReply(ChallengeReply {
            nonce: session.nonce,
            signature,
            common_name: identity.common_name().to_string(),
            cert: identity.cert_data().to_vec(),
        }))
    }

    /// Second leg: consume the pending session, verify the client, and
    /// admit it into the directory under a fresh token.
    pub async fn register_client(&self, request: &Message) -> Message {
        let check = self.state.read().await.state.register_check();
        if !check.is_allowed() {
            return make_reply(ReturnCode::CommError, check.message, Payload::None);
        }
        let register = match &request.payload {
            Payload::Register(register) => register,
            _ => {
                return make_reply(
                    ReturnCode::BadRequestData,
                    "missing registration data",
                    Payload::None,
                );
            }
        };
        let origin = request.header.origin.as_str();

        let client_name = if self.config.secure_mode {
            let session = match self.registrations.take(origin).await {
                Some(session) => session,
                None => {
                    return make_reply(
                        ReturnCode::Unauthenticated,
                        "no registration session",
                        Payload::None,
                    );
                }
            };
            let authenticator = match &self.authenticator {
                Some(authenticator) => authenticator,
                None => {
                    return make_reply(
                        ReturnCode::Unauthenticated,
                        "server is not in secure mode",
                        Payload::None,
                    );
                }
            };
            match authenticator.authenticate(request, &session).await {
                Ok(name) => name,
                Err(err) => {
                    tracing::warn!("client authentication failed for {}: {}", origin, err);
                    return make_reply(
                        ReturnCode::Unauthenticated,
                        err.sanitized_message(),
                        Payload::None,
                    );
                }
            }
        } else {
            register.client_name.clone()
        };

        let record = match self.directory.register(&client_name, origin).await {
            Ok(record) => record,
            Err(err) => {
                return make_reply(
                    ReturnCode::Unauthenticated,
                    err.sanitized_message(),
                    Payload::None,
                );
            }
        };
        tracing::info!(
            "registered client {} with token {} (total {})",
            record.name,
            record.token,
            self.directory.len().await
        );

        let token_signature = match &self.identity {
            Some(identity) => match identity.sign(record.token.as_bytes()) {
                Ok(signature) => signature,
                Err(err) => {
                    tracing::error!("failed to sign token for client {}: {}", record.name, err);
                    self.directory.remove(&record.token).await;
                    return make_reply(
                        ReturnCode::ExecutionException,
                        err.sanitized_message(),
                        Payload::None,
                    );
                }
            },
            None => Vec::new(),
        };
        let ssid = self.state.read().await.ssid.clone();
        ok_reply(Payload::RegisterReply(RegisterReply {
            token: record.token,
            token_signature,
            ssid,
        }))
    }

    /// Voluntary logout. Running jobs the client participated in get a
    /// dead-client notification so they can rebalance.
    pub async fn quit_client(&self, request: &Message) -> Message {
        if let Some(token) = request.header.token.as_deref() {
            if let Some(record) = self.directory.remove(token).await {
                tracing::info!("client {} logged out", record.name);
                self.notify_dead_client(&record, "Client logged out").await;
            }
        }
        ok_reply(Payload::Text("Removed client".to_string()))
    }

    /// Heartbeat: refresh liveness and reconcile the client's job set
    /// against the authoritative one.
    pub async fn client_heartbeat(&self, request: &Message) -> Message {
        let state = self.state.read().await.clone();
        let check = state.state.heartbeat_check();
        if check.action != StateAction::Allow {
            return make_reply(ReturnCode::CommError, check.message, Payload::None);
        }
        if !state.ssid.is_empty() && request.header.ssid.as_deref() != Some(state.ssid.as_str()) {
            return make_reply(
                ReturnCode::Unauthenticated,
                "invalid client SSID",
                Payload::None,
            );
        }

        let token = match request.header.token.as_deref() {
            Some(token) => token,
            None => {
                return make_reply(
                    ReturnCode::Unauthenticated,
                    "Request from client: missing client token",
                    Payload::None,
                );
            }
        };
        let client_name = request.header.client_name.as_deref().unwrap_or_default();

        if !self
            .directory
            .heartbeat(token, client_name, &request.header.origin)
            .await
        {
            // Unknown token: tell the client to go through registration.
            let mut reply = ok_reply(Payload::HeartbeatReply(HeartbeatReply::default()));
            reply
                .header
                .extra
                .insert("do_register".to_string(), "true".to_string());
            return reply;
        }

        let job_ids = match &request.payload {
            Payload::Heartbeat(hb) => hb.job_ids.clone(),
            _ => Vec::new(),
        };
        let abort_jobs = self.sync_client_jobs(token, client_name, &job_ids).await;
        ok_reply(Payload::HeartbeatReply(HeartbeatReply { abort_jobs }))
    }

    /// A client reports that one of its job processes failed. Only a
    /// fatal component failure stops the whole run.
    pub async fn process_job_failure(&self, request: &Message) -> Message {
        let report = match &request.payload {
            Payload::JobFailure(report) => report,
            _ => {
                return make_reply(
                    ReturnCode::BadRequestData,
                    "missing job failure data",
                    Payload::None,
                );
            }
        };
        let client = request.header.client_name.as_deref().unwrap_or("?");
        match report.code {
            FailureCode::UnsafeComponent => {
                tracing::warn!(
                    "aborting job {} after fatal failure from {}: {}",
                    report.job_id,
                    client,
                    report.reason
                );
                if let Err(err) = self.engine.stop_run(&report.job_id).await {
                    tracing::error!("failed to stop job {}: {}", report.job_id, err);
                }
            }
            _ => {
                tracing::error!(
                    "job {} failure reported by {} ({:?}): {}",
                    report.job_id,
                    client,
                    report.code,
                    report.reason
                );
            }
        }
        ok_reply(Payload::Text(String::new()))
    }

    /// Dispatch one request on the server-command channel.
    pub async fn process_command(&self, request: &Message) -> Message {
        let ctx = self.command_context(request).await;
        self.commands.execute(request, &ctx).await
    }

    /// Route one auxiliary-channel request into the active run.
    pub async fn process_aux(&self, request: &Message) -> Message {
        let ctx = self.command_context(request).await;
        aux_communicate(request, &ctx).await
    }

    async fn command_context(&self, request: &Message) -> CommandContext {
        let client = match request.header.token.as_deref() {
            Some(token) => self.directory.get(token).await,
            None => None,
        };
        CommandContext {
            engine: self.engine.clone(),
            runner: self.runner.read().await.clone(),
            state: self.state.clone(),
            client,
            aux: self.aux.clone(),
            app_commands: self.app_commands.clone(),
        }
    }

    /// Jobs this client must abort; notifies runs about jobs the client
    /// should have reported but did not. The abort set is diffed against
    /// the full authoritative job set; the participant filter applies only
    /// to the orphan notification.
    async fn sync_client_jobs(&self, token: &str, client_name: &str, job_ids: &[String]) -> Vec<String> {
        let server_jobs = self.engine.running_jobs().await;
        let result = reconcile(job_ids, &server_jobs);
        for job_id in &result.to_abort {
            tracing::info!(
                "ordering client {} to abort unknown job {}",
                client_name,
                job_id
            );
        }
        for job_id in &result.orphaned {
            let participated = match self.engine.job_info(job_id).await {
                Some(info) => participates(&info, token, client_name),
                None => false,
            };
            if !participated {
                continue;
            }
            if let Err(err) = self
                .engine
                .notify_dead_job(job_id, client_name, "missing job on client")
                .await
            {
                tracing::error!("failed to notify job {} of dead client: {}", job_id, err);
            }
        }
        result.to_abort
    }

    /// Tell every running job the client participated in that the client
    /// is gone. One notification per job.
    async fn notify_dead_client(&self, record: &ClientRecord, reason: &str) {
        for job_id in self.engine.running_jobs().await {
            let participated = match self.engine.job_info(&job_id).await {
                Some(info) => participates(&info, &record.token, &record.name),
                None => false,
            };
            if participated {
                if let Err(err) = self
                    .engine
                    .notify_dead_job(&job_id, &record.name, reason)
                    .await
                {
                    tracing::error!("failed to notify job {} of dead client: {}", job_id, err);
                }
            }
        }
    }

    /// One liveness/registration sweep: evict silent clients, drop stale
    /// registration sessions.
    pub async fn sweep_once(&self) {
        let timeout = Duration::from_secs(self.config.heart_beat_timeout_secs);
        for token in self.directory.expired_tokens(timeout).await {
            if let Some(record) = self.directory.remove(&token).await {
                tracing::warn!(
                    "Removed dead client {}: no heartbeat for {:?}",
                    record.name,
                    timeout
                );
                self.notify_dead_client(&record, "Removed dead client").await;
            }
        }
        self.registrations.sweep_expired().await;
    }

    /// Poll the overseer once and resolve any resulting state transition.
    /// Re-entrant calls are skipped while a transition is in progress.
    pub async fn check_server_state(&self) -> Result<()> {
        if self
            .checking_server_state
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.check_server_state_inner().await;
        self.checking_server_state.store(false, Ordering::SeqCst);
        result
    }

    async fn check_server_state_inner(&self) -> Result<()> {
        if self.overseer.is_shutdown() {
            tracing::info!("overseer ordered shutdown");
            let _ = self.shutdown_tx.send(true);
            return Ok(());
        }
        let primary = self.overseer.primary_sp().await?;
        let (current, address) = {
            let state = self.state.read().await;
            (state.state, state.address())
        };
        let is_primary = primary
            .as_ref()
            .map(|p| p.address == address)
            .unwrap_or(false);

        match current.transition(is_primary) {
            ServerState::Cold2Hot => {
                let ssid = match primary {
                    Some(p) if is_primary => p.ssid,
                    // designation withdrawn mid-promotion: stand back down
                    _ => {
                        let mut state = self.state.write().await;
                        state.become_cold();
                        return Ok(());
                    }
                };
                tracing::info!("promoted to hot primary (ssid {})", ssid);
                if let Err(err) = self.turn_to_hot(ssid).await {
                    let mut state = self.state.write().await;
                    state.become_cold();
                    return Err(err);
                }
            }
            ServerState::Hot2Cold => {
                tracing::info!("demoted to cold standby");
                self.turn_to_cold().await;
            }
            next => {
                let mut state = self.state.write().await;
                state.state = next;
            }
        }
        Ok(())
    }

    /// Cold->Hot: recover jobs, then open for traffic under the new ssid.
    async fn turn_to_hot(&self, ssid: String) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.state = ServerState::Cold2Hot;
        }
        if self.config.ha_mode {
            self.restore_snapshot().await?;
        } else {
            self.snapshots.delete()?;
            self.engine.update_unfinished_jobs().await?;
        }
        let mut state = self.state.write().await;
        state.become_hot(ssid);
        Ok(())
    }

    async fn restore_snapshot(&self) -> Result<()> {
        let mut restored = Vec::new();
        if let Some(snapshot) = self.snapshots.retrieve()? {
            for (job_id, run) in &snapshot.run_snapshots {
                if run.completed {
                    continue;
                }
                self.workspace.restore_archive(job_id, &run.workspace)?;
                self.engine
                    .restore_running_job(job_id, &run.participants, run)
                    .await?;
                tracing::info!("restored running job {} from snapshot", job_id);
                restored.push(job_id.clone());
            }
        }
        self.engine.update_abnormal_finished_jobs(&restored).await
    }

    /// Hot->Cold: tell the per-job sub-coordinators, pause job activity,
    /// then drop the ssid.
    async fn turn_to_cold(&self) {
        {
            let mut state = self.state.write().await;
            state.state = ServerState::Hot2Cold;
        }
        let targets: Vec<String> = self
            .engine
            .running_jobs()
            .await
            .iter()
            .map(|job_id| format!("server.{}", job_id))
            .collect();
        if !targets.is_empty() {
            let update = {
                let state = self.state.read().await;
                let mut info = state.clone();
                info.become_cold();
                info
            };
            let mut request = Message::request(
                Channel::ServerCommand,
                command_names::SERVER_STATE,
                Payload::StateUpdate(update),
            );
            request.header.token = Some(self.server_token.clone());
            let replies = self
                .transport
                .broadcast_request(
                    Channel::ServerCommand,
                    command_names::SERVER_STATE,
                    request,
                    &targets,
                    Duration::from_secs(self.config.state_broadcast_timeout_secs),
                    true,
                )
                .await;
            for reply in replies {
                if let Some(error) = reply.error {
                    tracing::debug!("state broadcast to {} failed: {}", reply.target, error);
                }
            }
        }
        self.engine.pause_server_jobs().await;
        let mut state = self.state.write().await;
        state.become_cold();
    }

    /// Start the background loops. Handles finish once shutdown is signaled.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Self::sweep_loop(self.clone())),
            tokio::spawn(Self::overseer_loop(self)),
        ]
    }

    async fn sweep_loop(server: Arc<Self>) {
        let interval = Duration::from_secs(server.config.sweep_interval_secs);
        loop {
            if server.sleep_checking_shutdown(interval).await {
                break;
            }
            server.sweep_once().await;
        }
        tracing::debug!("sweep loop stopped");
    }

    async fn overseer_loop(server: Arc<Self>) {
        let interval = Duration::from_secs(server.config.state_check_interval_secs);
        loop {
            if server.sleep_checking_shutdown(interval).await {
                break;
            }
            if let Err(err) = server.check_server_state().await {
                tracing::error!("overseer state check failed: {}", err);
            }
        }
        tracing::debug!("overseer loop stopped");
    }

    /// Sleep for `total`, waking early on shutdown. Returns true once the
    /// shutdown flag is set.
    async fn sleep_checking_shutdown(&self, total: Duration) -> bool {
        let step = Duration::from_millis(self.config.shutdown_check_interval_ms);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            if *self.shutdown_rx.borrow() {
                return true;
            }
            let chunk = step.min(total - elapsed);
            tokio::time::sleep(chunk).await;
            elapsed += chunk;
        }
        *self.shutdown_rx.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Graceful shutdown: signal the loops, then give clients up to the
    /// shutdown period to log out.
    pub async fn fl_shutdown(&self) {
        tracing::info!("shutting down coordination server");
        self.signal_shutdown();
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.shutdown_period_secs);
        let step = Duration::from_millis(self.config.shutdown_check_interval_ms);
        while !self.directory.is_empty().await {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "{} clients still registered at end of shutdown period",
                    self.directory.len().await
                );
                break;
            }
            tokio::time::sleep(step).await;
        }
    }
}

fn participates(info: &JobProcessInfo, token: &str, client_name: &str) -> bool {
    if info.participants.contains_key(token) {
        return true;
    }
    // Restored jobs track participants by name until tokens are reissued.
    info.participants.values().any(|p| p.name == client_name)
}
