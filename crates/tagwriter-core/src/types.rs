use crate::{
    Result,
    constants::{MAX_PAYLOAD_LENGTH, MAX_SUBJECT_REF_LENGTH},
    error::Error,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// URL payload destined for a tag.
///
/// The bytes handed to the driver are exactly the UTF-8 bytes of the string;
/// NDEF framing is the driver's concern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagPayload(String);

impl TagPayload {
    /// Create a new payload with validation.
    ///
    /// The payload is trimmed before validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidPayload` if the payload is empty, longer than
    /// [`MAX_PAYLOAD_LENGTH`] bytes, or contains control characters.
    pub fn new(payload: &str) -> Result<Self> {
        let payload = payload.trim();

        if payload.is_empty() {
            return Err(Error::InvalidPayload("payload cannot be empty".to_string()));
        }

        let len = payload.len();
        if len > MAX_PAYLOAD_LENGTH {
            return Err(Error::InvalidPayload(format!(
                "payload must be at most {MAX_PAYLOAD_LENGTH} bytes, got {len}"
            )));
        }

        if payload.chars().any(char::is_control) {
            return Err(Error::InvalidPayload(
                "payload cannot contain control characters".to_string(),
            ));
        }

        Ok(TagPayload(payload.to_string()))
    }

    /// Get the payload as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the raw bytes written to the tag.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TagPayload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TagPayload {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TagPayload::new(s)
    }
}

impl TryFrom<String> for TagPayload {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        TagPayload::new(&value)
    }
}

impl From<TagPayload> for String {
    fn from(value: TagPayload) -> Self {
        value.0
    }
}

/// Opaque subject reference (the pet a tag belongs to).
///
/// Passed through untouched; only its length is bounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectRef(String);

impl SubjectRef {
    /// # Errors
    /// Returns `Error::InvalidPayload` if the reference is empty or longer than
    /// [`MAX_SUBJECT_REF_LENGTH`] characters.
    pub fn new(reference: &str) -> Result<Self> {
        let len = reference.chars().count();
        if len == 0 || len > MAX_SUBJECT_REF_LENGTH {
            return Err(Error::InvalidPayload(format!(
                "subject reference must be 1-{MAX_SUBJECT_REF_LENGTH} chars, got {len}"
            )));
        }
        Ok(SubjectRef(reference.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SubjectRef {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        SubjectRef::new(&value)
    }
}

impl From<SubjectRef> for String {
    fn from(value: SubjectRef) -> Self {
        value.0
    }
}

/// Command identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        CommandId(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CommandId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(CommandId)
            .map_err(|_| Error::InvalidCommandId(s.to_string()))
    }
}

/// Stage of a write session.
///
/// Stages only move forward: `Idle → Waiting → CardDetected → Writing →
/// Verifying → Success`, with `Failed` reachable from every non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteStage {
    Idle,
    Waiting,
    CardDetected,
    Writing,
    Verifying,
    Success,
    Failed,
}

impl WriteStage {
    /// Check if the session may move from this stage to `target`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tagwriter_core::WriteStage;
    ///
    /// assert!(WriteStage::Waiting.can_transition_to(WriteStage::CardDetected));
    /// assert!(WriteStage::Writing.can_transition_to(WriteStage::Failed));
    /// assert!(!WriteStage::Writing.can_transition_to(WriteStage::Waiting));
    /// assert!(!WriteStage::Success.can_transition_to(WriteStage::Failed));
    /// ```
    pub fn can_transition_to(&self, target: WriteStage) -> bool {
        matches!(
            (self, target),
            (WriteStage::Idle, WriteStage::Waiting)
                | (WriteStage::Waiting, WriteStage::CardDetected)
                | (WriteStage::CardDetected, WriteStage::Writing)
                | (WriteStage::Writing, WriteStage::Verifying)
                | (WriteStage::Verifying, WriteStage::Success)
                | (
                    WriteStage::Idle
                        | WriteStage::Waiting
                        | WriteStage::CardDetected
                        | WriteStage::Writing
                        | WriteStage::Verifying,
                    WriteStage::Failed
                )
        )
    }

    /// Returns `true` for `Success` and `Failed`.
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, WriteStage::Success | WriteStage::Failed)
    }

    /// Wire name of the stage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WriteStage::Idle => "idle",
            WriteStage::Waiting => "waiting",
            WriteStage::CardDetected => "card-detected",
            WriteStage::Writing => "writing",
            WriteStage::Verifying => "verifying",
            WriteStage::Success => "success",
            WriteStage::Failed => "failed",
        }
    }
}

impl fmt::Display for WriteStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a queued command.
///
/// Transitions are one-directional: `Pending → InProgress → {Done, Failed}`.
/// `Pending → Failed` is reserved for expiry of commands nobody claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl CommandStatus {
    /// Check if a command may move from this status to `target`.
    pub fn can_transition_to(&self, target: CommandStatus) -> bool {
        matches!(
            (self, target),
            (CommandStatus::Pending, CommandStatus::InProgress | CommandStatus::Failed)
                | (CommandStatus::InProgress, CommandStatus::Done | CommandStatus::Failed)
        )
    }

    /// Returns `true` for `Done` and `Failed`.
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Done | CommandStatus::Failed)
    }

    /// Storage representation of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::InProgress => "in_progress",
            CommandStatus::Done => "done",
            CommandStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "in_progress" => Ok(CommandStatus::InProgress),
            "done" => Ok(CommandStatus::Done),
            "failed" => Ok(CommandStatus::Failed),
            other => Err(Error::InvalidCommandStatus(other.to_string())),
        }
    }
}

/// Pre-shared secret guarding the agent endpoints.
///
/// # Security
/// Comparison is constant-time to prevent timing attacks against the
/// callback endpoint. The secret is never printed by `Debug`.
#[derive(Clone)]
pub struct SharedSecret(String);

impl SharedSecret {
    /// Minimum secret length in bytes.
    pub const MIN_LENGTH: usize = 16;

    /// # Errors
    /// Returns `Error::Config` if the secret is shorter than [`Self::MIN_LENGTH`].
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.len() < Self::MIN_LENGTH {
            return Err(Error::Config(format!(
                "agent secret must be at least {} bytes",
                Self::MIN_LENGTH
            )));
        }
        Ok(SharedSecret(secret))
    }

    /// Compare a presented secret in constant time.
    #[must_use]
    pub fn verify(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    /// Expose the secret for outbound requests.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("SharedSecret(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_payload_trims_and_validates() {
        let payload = TagPayload::new("  https://vet.example/pet/1  ").unwrap();
        assert_eq!(payload.as_str(), "https://vet.example/pet/1");
        assert_eq!(payload.as_bytes(), b"https://vet.example/pet/1");
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("https://x/\npet")]
    fn test_payload_rejects_invalid(#[case] input: &str) {
        assert!(TagPayload::new(input).is_err());
    }

    #[test]
    fn test_payload_rejects_oversized() {
        let long = format!("https://x/{}", "a".repeat(MAX_PAYLOAD_LENGTH));
        assert!(matches!(TagPayload::new(&long), Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn test_payload_deserialize_validates() {
        let ok: TagPayload = serde_json::from_str("\"https://x/pet/1\"").unwrap();
        assert_eq!(ok.as_str(), "https://x/pet/1");
        assert!(serde_json::from_str::<TagPayload>("\"\"").is_err());
    }

    #[test]
    fn test_subject_ref_bounds() {
        assert!(SubjectRef::new("pet-42").is_ok());
        assert!(SubjectRef::new("").is_err());
        assert!(SubjectRef::new(&"x".repeat(MAX_SUBJECT_REF_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_command_id_parse() {
        let id = CommandId::new();
        let parsed: CommandId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<CommandId>().is_err());
    }

    #[rstest]
    #[case(WriteStage::Idle, WriteStage::Waiting, true)]
    #[case(WriteStage::Waiting, WriteStage::CardDetected, true)]
    #[case(WriteStage::CardDetected, WriteStage::Writing, true)]
    #[case(WriteStage::Writing, WriteStage::Verifying, true)]
    #[case(WriteStage::Verifying, WriteStage::Success, true)]
    #[case(WriteStage::Waiting, WriteStage::Failed, true)]
    #[case(WriteStage::Waiting, WriteStage::Writing, false)]
    #[case(WriteStage::Verifying, WriteStage::Waiting, false)]
    #[case(WriteStage::Failed, WriteStage::Success, false)]
    #[case(WriteStage::Success, WriteStage::Failed, false)]
    fn test_write_stage_transitions(
        #[case] from: WriteStage,
        #[case] to: WriteStage,
        #[case] expected: bool,
    ) {
        assert_eq!(from.can_transition_to(to), expected);
    }

    #[test]
    fn test_write_stage_wire_names() {
        assert_eq!(
            serde_json::to_string(&WriteStage::CardDetected).unwrap(),
            "\"card-detected\""
        );
        assert_eq!(WriteStage::CardDetected.to_string(), "card-detected");
    }

    #[rstest]
    #[case(CommandStatus::Pending, CommandStatus::InProgress, true)]
    #[case(CommandStatus::Pending, CommandStatus::Failed, true)]
    #[case(CommandStatus::InProgress, CommandStatus::Done, true)]
    #[case(CommandStatus::InProgress, CommandStatus::Failed, true)]
    #[case(CommandStatus::InProgress, CommandStatus::Pending, false)]
    #[case(CommandStatus::Done, CommandStatus::Failed, false)]
    #[case(CommandStatus::Failed, CommandStatus::Pending, false)]
    #[case(CommandStatus::Pending, CommandStatus::Done, false)]
    fn test_command_status_transitions(
        #[case] from: CommandStatus,
        #[case] to: CommandStatus,
        #[case] expected: bool,
    ) {
        assert_eq!(from.can_transition_to(to), expected);
    }

    #[test]
    fn test_command_status_parse() {
        for status in [
            CommandStatus::Pending,
            CommandStatus::InProgress,
            CommandStatus::Done,
            CommandStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<CommandStatus>().unwrap(), status);
        }
        assert!("claimed".parse::<CommandStatus>().is_err());
    }

    #[test]
    fn test_shared_secret_verify() {
        let secret = SharedSecret::new("0123456789abcdef-agent").unwrap();
        assert!(secret.verify("0123456789abcdef-agent"));
        assert!(!secret.verify("0123456789abcdef-agenT"));
        assert!(!secret.verify(""));
        assert_eq!(format!("{:?}", secret), "SharedSecret(***)");
    }

    #[test]
    fn test_shared_secret_min_length() {
        assert!(matches!(SharedSecret::new("short"), Err(Error::Config(_))));
    }
}
