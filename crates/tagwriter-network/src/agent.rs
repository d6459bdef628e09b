//! Polling agent.
//!
//! The agent runs next to the reader. Every poll interval it claims the
//! oldest pending command, runs a write session with the command's payload
//! and reports the outcome back:
//!
//! ```text
//! ┌────────┐ claim  ┌─────────┐ write ┌─────────────┐
//! │ Agent  │───────►│ Backend │       │ Coordinator │
//! │        │◄───────│  queue  │       │   + hub     │
//! │        │command └─────────┘       └─────────────┘
//! │        │──────────────────────────────►│
//! │        │◄ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─│ SessionEvent ──► stage
//! │        │◄──────────────────────────────│ WriteResult
//! │        │ report ┌─────────┐
//! │        │───────►│ Backend │
//! └────────┘        └─────────┘
//! ```
//!
//! Every stage of the session is forwarded to the source while the write
//! runs, so the backend can republish it to its realtime clients.
//!
//! A report that still fails after [`AgentConfig::report_attempts`] tries is
//! kept, and delivered before anything new is claimed. A backend answering
//! that the command already has its result counts as delivered.
//!
//! [`Agent::poll_once`] is one claim-write-report cycle; [`Agent::run`]
//! repeats it on a fixed interval. The same agent serves a backend with the
//! reader attached through [`LocalCommandSource`].

#![allow(async_fn_in_trait)]

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use reqwest::StatusCode;
use tagwriter_core::constants::{
    AGENT_SECRET_HEADER, DEFAULT_AGENT_POLL_INTERVAL_MS, DEFAULT_REPORT_ATTEMPTS,
    DEFAULT_REPORT_BACKOFF_MS, DEFAULT_WRITE_TIMEOUT_MS, MAX_REPORT_BACKOFF_MS,
};
use tagwriter_core::{CommandId, SharedSecret, TagPayload};
use tagwriter_session::{SessionEvent, WriteCoordinator, WriteResult};
use tagwriter_storage::{Command, CommandQueue, CommandResult, SqliteCommandQueue, StorageError};
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fanout::FanoutHub;

/// Upper bound of one HTTP call to the backend.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Queue error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

impl AgentError {
    /// The command already holds a terminal result.
    pub fn is_already_recorded(&self) -> bool {
        matches!(
            self,
            Self::Status { status: 409, .. }
                | Self::Storage(StorageError::InvalidTransition { .. })
        )
    }

    /// The backend does not know the command.
    pub fn is_unknown_command(&self) -> bool {
        matches!(
            self,
            Self::Status { status: 404, .. } | Self::Storage(StorageError::NotFound { .. })
        )
    }
}

/// Where the agent claims commands and reports results.
pub trait CommandSource: Send + Sync {
    /// Claim the oldest pending command, if any.
    async fn claim(&self) -> Result<Option<Command>, AgentError>;

    /// Report the outcome of a claimed command.
    async fn report(&self, id: CommandId, result: &CommandResult) -> Result<(), AgentError>;

    /// Forward one stage of the write session running for `id`.
    async fn progress(&self, id: CommandId, event: &SessionEvent) -> Result<(), AgentError>;
}

/// Backend reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCommandSource {
    client: reqwest::Client,
    base_url: String,
    secret: SharedSecret,
}

impl HttpCommandSource {
    /// # Errors
    /// Fails if `base_url` is not an http(s) URL or the client cannot be
    /// built.
    pub fn new(base_url: &str, secret: SharedSecret) -> Result<Self, AgentError> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(AgentError::InvalidUrl(base_url.to_string()));
        }

        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            secret,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST to `/api/agent/commands/{path}` with the agent secret.
    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/api/agent/commands/{}", self.base_url, path))
            .header(AGENT_SECRET_HEADER, self.secret.expose())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AgentError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl CommandSource for HttpCommandSource {
    async fn claim(&self) -> Result<Option<Command>, AgentError> {
        let response = Self::check(self.post("claim").send().await?).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    async fn report(&self, id: CommandId, result: &CommandResult) -> Result<(), AgentError> {
        let path = format!("{}/result", id);
        Self::check(self.post(&path).json(result).send().await?).await?;
        Ok(())
    }

    async fn progress(&self, id: CommandId, event: &SessionEvent) -> Result<(), AgentError> {
        let path = format!("{}/stage", id);
        Self::check(self.post(&path).json(event).send().await?).await?;
        Ok(())
    }
}

/// Queue of the backend the agent runs in, for a backend with the reader
/// attached.
///
/// Claims and results are published to realtime clients the same way the
/// agent endpoints publish them. Stages need no forwarding: the fan-out
/// already follows the shared coordinator.
#[derive(Debug, Clone)]
pub struct LocalCommandSource {
    queue: SqliteCommandQueue,
    fanout: FanoutHub,
}

impl LocalCommandSource {
    pub fn new(queue: SqliteCommandQueue, fanout: FanoutHub) -> Self {
        Self { queue, fanout }
    }
}

impl CommandSource for LocalCommandSource {
    async fn claim(&self) -> Result<Option<Command>, AgentError> {
        let claimed = self.queue.claim_next().await?;
        if let Some(command) = &claimed {
            self.fanout.publish_command(command);
        }
        Ok(claimed)
    }

    async fn report(&self, id: CommandId, result: &CommandResult) -> Result<(), AgentError> {
        let command = self.queue.report_result(id, result).await?;
        self.fanout.publish_command(&command);
        Ok(())
    }

    async fn progress(&self, _id: CommandId, _event: &SessionEvent) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Delay between two claim attempts.
    pub poll_interval: Duration,

    /// Tag wait of every write session.
    pub write_timeout: Duration,

    /// Tries per result report within one poll cycle. At least 1.
    pub report_attempts: u32,

    /// Delay before the second report attempt, doubled for each further one.
    pub report_backoff: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_AGENT_POLL_INTERVAL_MS),
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            report_attempts: DEFAULT_REPORT_ATTEMPTS,
            report_backoff: Duration::from_millis(DEFAULT_REPORT_BACKOFF_MS),
        }
    }
}

impl AgentConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_report_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.report_attempts = attempts.max(1);
        self.report_backoff = backoff;
        self
    }
}

/// Polling agent.
#[derive(Debug)]
pub struct Agent<S> {
    source: S,
    coordinator: WriteCoordinator,
    config: AgentConfig,

    /// Results whose report failed, oldest first.
    unreported: Mutex<Vec<(CommandId, CommandResult)>>,
}

impl<S: CommandSource> Agent<S> {
    pub fn new(source: S, coordinator: WriteCoordinator, config: AgentConfig) -> Self {
        Self {
            source,
            coordinator,
            config,
            unreported: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Number of results written to a tag but not yet accepted by the
    /// source.
    pub fn unreported_count(&self) -> usize {
        lock(&self.unreported).len()
    }

    /// Claim one command, write it and report the result.
    ///
    /// Returns the id of the handled command, or `None` if nothing was
    /// claimed: the queue was empty or the writer was busy with another
    /// session.
    ///
    /// # Errors
    /// Fails without claiming while an earlier result is still unreported.
    /// A result whose report fails is kept for the next call.
    pub async fn poll_once(&self) -> Result<Option<CommandId>, AgentError> {
        self.flush_unreported().await?;

        if self.coordinator.is_busy() {
            debug!("Writer busy, not claiming");
            return Ok(None);
        }

        let Some(command) = self.source.claim().await? else {
            return Ok(None);
        };

        info!(id = %command.id, subject_ref = %command.subject_ref, "Command claimed");

        let result = match TagPayload::new(&command.payload) {
            Ok(payload) => to_command_result(self.write_forwarding(command.id, &payload).await),
            Err(e) => CommandResult::failure(e.to_string()),
        };

        if let Err(e) = self.deliver(command.id, &result).await {
            if e.is_unknown_command() {
                error!(id = %command.id, error = %e, "Backend lost the command, dropping its result");
            } else {
                error!(id = %command.id, error = %e, "Result not delivered, keeping it");
                lock(&self.unreported).push((command.id, result));
            }
            return Err(e);
        }

        info!(
            id = %command.id,
            success = result.success,
            uid = ?result.uid,
            "Command result reported"
        );

        Ok(Some(command.id))
    }

    /// Poll until `shutdown` fires.
    ///
    /// A failed cycle is logged and the next one runs on schedule.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "Agent polling started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A running write is not interrupted by shutdown; it ends by
            // itself within the write timeout.
            match self.poll_once().await {
                Ok(Some(id)) => debug!(id = %id, "Poll cycle handled a command"),
                Ok(None) => {}
                Err(AgentError::Status { status, body }) if status == 401 || status == 403 => {
                    error!(status, body = %body, "Backend rejected the agent secret");
                }
                Err(e) => warn!(error = %e, "Poll cycle failed"),
            }
        }

        if let Err(e) = self.flush_unreported().await {
            error!(
                unreported = self.unreported_count(),
                error = %e,
                "Stopping with undelivered results"
            );
        }

        info!("Agent polling stopped");
    }

    /// Run the write session and forward each of its stages to the source.
    async fn write_forwarding(&self, id: CommandId, payload: &TagPayload) -> WriteResult {
        let mut events = self.coordinator.subscribe();
        let written = CancellationToken::new();

        let write = async {
            let result = self
                .coordinator
                .write(payload, self.config.write_timeout)
                .await;
            written.cancel();
            result
        };

        let forward = async {
            loop {
                let received = tokio::select! {
                    biased;
                    received = events.recv() => received,
                    _ = written.cancelled() => break,
                };

                match received {
                    Ok(event) => self.forward_stage(id, payload, &event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Agent fell behind session events");
                    }
                    Err(RecvError::Closed) => return,
                }
            }

            // Stages published before the write returned.
            loop {
                match events.try_recv() {
                    Ok(event) => self.forward_stage(id, payload, &event).await,
                    Err(TryRecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
        };

        let (result, ()) = tokio::join!(write, forward);
        result
    }

    async fn forward_stage(&self, id: CommandId, payload: &TagPayload, event: &SessionEvent) {
        // A session some other caller runs on the shared coordinator.
        if event.payload != payload.as_str() {
            return;
        }

        if let Err(e) = self.source.progress(id, event).await {
            warn!(id = %id, stage = %event.stage, error = %e, "Failed to forward write stage");
        }
    }

    /// Report `result`, retrying with a doubling delay.
    async fn deliver(&self, id: CommandId, result: &CommandResult) -> Result<(), AgentError> {
        let max_backoff = Duration::from_millis(MAX_REPORT_BACKOFF_MS);
        let mut backoff = self.config.report_backoff;
        let mut attempt = 1;

        loop {
            match self.report_once(id, result).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.config.report_attempts || e.is_unknown_command() => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(id = %id, attempt, error = %e, "Result report failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                    attempt += 1;
                }
            }
        }
    }

    async fn report_once(&self, id: CommandId, result: &CommandResult) -> Result<(), AgentError> {
        match self.source.report(id, result).await {
            Err(e) if e.is_already_recorded() => {
                warn!(id = %id, error = %e, "Result already recorded by the backend");
                Ok(())
            }
            other => other,
        }
    }

    /// Try each kept result once, stopping at the first failure.
    async fn flush_unreported(&self) -> Result<(), AgentError> {
        let pending = std::mem::take(&mut *lock(&self.unreported));
        let mut kept = Vec::new();
        let mut failure = None;

        for (id, result) in pending {
            if failure.is_some() {
                kept.push((id, result));
                continue;
            }

            match self.report_once(id, &result).await {
                Ok(()) => info!(id = %id, success = result.success, "Kept command result reported"),
                Err(e) if e.is_unknown_command() => {
                    error!(id = %id, error = %e, "Backend lost the command, dropping its result");
                }
                Err(e) => {
                    kept.push((id, result));
                    failure = Some(e);
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(e) => {
                let mut unreported = lock(&self.unreported);
                kept.append(&mut unreported);
                *unreported = kept;
                Err(e)
            }
        }
    }
}

fn to_command_result(result: WriteResult) -> CommandResult {
    match (result.success, result.uid) {
        (true, Some(uid)) => CommandResult::success(uid),
        (_, _) => CommandResult::failure(
            result
                .error_message
                .unwrap_or_else(|| "write failed".to_string()),
        ),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
