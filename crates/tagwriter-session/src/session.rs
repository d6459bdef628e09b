//! Write session state.
//!
//! A [`WriteSession`] tracks one write from request to result. Its stage only
//! moves forward:
//!
//! ```text
//! idle → waiting → card-detected → writing → verifying → success
//!   └───────┴────────────┴────────────┴──────────┴──────→ failed
//! ```
//!
//! The session itself does no I/O; the
//! [`WriteCoordinator`](crate::WriteCoordinator) drives it and publishes a
//! [`SessionEvent`] for every transition.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use tagwriter_core::WriteStage;
//! use tagwriter_session::WriteSession;
//!
//! let mut session = WriteSession::new("https://vet.example/pet/7", Duration::from_secs(60));
//! assert_eq!(session.stage(), WriteStage::Idle);
//!
//! session.transition_to(WriteStage::Waiting).unwrap();
//! assert!(session.transition_to(WriteStage::Success).is_err());
//! ```

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tagwriter_core::{Error, Result, WriteStage};

/// Record of a single stage change.
#[derive(Debug, Clone)]
pub struct StageTransition {
    pub from: WriteStage,
    pub to: WriteStage,
    pub timestamp: Instant,
}

impl StageTransition {
    fn new(from: WriteStage, to: WriteStage) -> Self {
        Self {
            from,
            to,
            timestamp: Instant::now(),
        }
    }
}

/// The live write session.
///
/// Serializes to the snapshot sent to newly connected realtime clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteSession {
    /// Payload being written (the profile URL).
    pub payload: String,

    stage: WriteStage,

    /// Wall-clock start, for display.
    pub started_at: DateTime<Utc>,

    /// How long the session waits for a tag.
    pub timeout_ms: u64,

    /// Reader the session bound to on the first tap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reader: Option<String>,

    /// UID of the tag being written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Failure message once failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip)]
    history: Vec<StageTransition>,
}

impl WriteSession {
    /// Create a session in the `idle` stage.
    pub fn new(payload: impl Into<String>, timeout: Duration) -> Self {
        Self {
            payload: payload.into(),
            stage: WriteStage::Idle,
            started_at: Utc::now(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            reader: None,
            uid: None,
            message: None,
            history: Vec::with_capacity(6),
        }
    }

    /// Current stage.
    pub fn stage(&self) -> WriteStage {
        self.stage
    }

    /// Returns `true` once the session reached `success` or `failed`.
    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Transitions taken so far, oldest first.
    pub fn history(&self) -> &[StageTransition] {
        &self.history
    }

    /// Time spent in the current stage.
    pub fn time_in_current_stage(&self) -> Duration {
        self.history
            .last()
            .map(|transition| transition.timestamp.elapsed())
            .unwrap_or_default()
    }

    /// Move to `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the stage would move
    /// backwards or skip ahead; the session is left unchanged.
    pub fn transition_to(&mut self, stage: WriteStage) -> Result<StageTransition> {
        if !self.stage.can_transition_to(stage) {
            return Err(Error::InvalidStateTransition {
                from: self.stage.to_string(),
                to: stage.to_string(),
            });
        }

        let transition = StageTransition::new(self.stage, stage);
        self.stage = stage;
        self.history.push(transition.clone());
        Ok(transition)
    }

    /// Bind the session to the reader that reported the first tap.
    pub fn bind(&mut self, reader: impl Into<String>, uid: impl Into<String>) {
        self.reader = Some(reader.into());
        self.uid = Some(uid.into());
    }

    /// Build the event announcing the current stage.
    pub fn event(&self) -> SessionEvent {
        SessionEvent {
            stage: self.stage,
            payload: self.payload.clone(),
            reader: self.reader.clone(),
            uid: self.uid.clone().filter(|_| self.stage.is_terminal()),
            message: self.message.clone(),
        }
    }
}

/// Published on every stage transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub stage: WriteStage,
    pub payload: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader: Option<String>,

    /// Tag UID, on terminal stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Failure message, on `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> WriteSession {
        WriteSession::new("https://vet.example/pet/1", Duration::from_secs(5))
    }

    #[test]
    fn test_new_session() {
        let session = session();
        assert_eq!(session.stage(), WriteStage::Idle);
        assert_eq!(session.timeout_ms, 5000);
        assert!(session.history().is_empty());
        assert!(!session.is_finished());
    }

    #[test]
    fn test_full_success_path() {
        let mut session = session();
        for stage in [
            WriteStage::Waiting,
            WriteStage::CardDetected,
            WriteStage::Writing,
            WriteStage::Verifying,
            WriteStage::Success,
        ] {
            session.transition_to(stage).unwrap();
        }

        assert!(session.is_finished());
        let stages: Vec<_> = session.history().iter().map(|t| t.to).collect();
        assert_eq!(stages.len(), 5);
        assert_eq!(session.history()[0].from, WriteStage::Idle);
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let mut session = session();
        session.transition_to(WriteStage::Waiting).unwrap();

        let result = session.transition_to(WriteStage::Writing);
        assert!(matches!(result, Err(Error::InvalidStateTransition { .. })));
        assert_eq!(session.stage(), WriteStage::Waiting);
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn test_terminal_is_final() {
        let mut session = session();
        session.transition_to(WriteStage::Failed).unwrap();
        assert!(session.transition_to(WriteStage::Waiting).is_err());
        assert!(session.transition_to(WriteStage::Failed).is_err());
    }

    #[test]
    fn test_event_carries_uid_only_when_terminal() {
        let mut session = session();
        session.transition_to(WriteStage::Waiting).unwrap();
        session.transition_to(WriteStage::CardDetected).unwrap();
        session.bind("R1", "04ABCDEF");

        let event = session.event();
        assert_eq!(event.stage, WriteStage::CardDetected);
        assert_eq!(event.reader.as_deref(), Some("R1"));
        assert!(event.uid.is_none());

        session.transition_to(WriteStage::Writing).unwrap();
        session.transition_to(WriteStage::Verifying).unwrap();
        session.transition_to(WriteStage::Success).unwrap();
        assert_eq!(session.event().uid.as_deref(), Some("04ABCDEF"));
    }

    #[test]
    fn test_snapshot_serialization() {
        let mut session = session();
        session.transition_to(WriteStage::Waiting).unwrap();

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["stage"], "waiting");
        assert_eq!(json["payload"], "https://vet.example/pet/1");
        assert_eq!(json["timeout_ms"], 5000);
        assert!(json.get("reader").is_none());
        assert!(json.get("history").is_none());
    }
}
