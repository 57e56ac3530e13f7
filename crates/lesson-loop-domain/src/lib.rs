#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LessonError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("store corruption: {0}")]
    StoreCorruption(String),
    #[error("store write failed: {0}")]
    StoreWrite(String),
}

/// Monotonically increasing run counter. Allocated by the store so that
/// identifiers stay dense across process restarts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub u64);

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MistakeKind {
    MissingRequiredTool,
    WrongSequence,
    TooEarlyAnswer,
    IgnoredToolOutput,
}

impl MistakeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingRequiredTool => "missing_required_tool",
            Self::WrongSequence => "wrong_sequence",
            Self::TooEarlyAnswer => "too_early_answer",
            Self::IgnoredToolOutput => "ignored_tool_output",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "missing_required_tool" => Some(Self::MissingRequiredTool),
            "wrong_sequence" => Some(Self::WrongSequence),
            "too_early_answer" => Some(Self::TooEarlyAnswer),
            "ignored_tool_output" => Some(Self::IgnoredToolOutput),
            _ => None,
        }
    }
}

impl Display for MistakeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tool invocation inside a trace. Insertion order in
/// [`ExecutionTrace::tool_calls`] is call order; `step_index` is 0-based and
/// MUST match the call's position.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToolCall {
    pub tool: String,
    pub step_index: usize,
}

/// Record of one completed agent run, produced by the external planning
/// engine at end-of-run and never mutated afterwards. `success` is derived
/// by the evaluator, never stored here.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExecutionTrace {
    pub task: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub final_answer: String,
}

impl ExecutionTrace {
    #[must_use]
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            tool_calls: Vec::new(),
            final_answer: String::new(),
        }
    }

    #[must_use]
    pub fn with_tool_calls(mut self, tools: &[&str]) -> Self {
        self.tool_calls = tools
            .iter()
            .enumerate()
            .map(|(step_index, tool)| ToolCall {
                tool: (*tool).to_string(),
                step_index,
            })
            .collect();
        self
    }

    #[must_use]
    pub fn with_final_answer(mut self, answer: impl Into<String>) -> Self {
        self.final_answer = answer.into();
        self
    }
}

/// One detected procedural defect within a trace. `detail` is deterministic
/// for a given trace and forms part of the pattern identity; `step_index` is
/// absent for whole-trace findings.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MistakeFinding {
    pub kind: MistakeKind,
    pub detail: String,
    pub step_index: Option<usize>,
}

/// Identity of a recurring mistake: `(kind, detail)` with the detail
/// normalized (trimmed, lowercased) so textually-identical mistakes collapse
/// to one key regardless of which run produced them.
///
/// Serialized as the string `"kind:detail"`, which doubles as the map key in
/// the persisted store document.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(into = "String", try_from = "String")]
pub struct PatternKey {
    kind: MistakeKind,
    detail: String,
}

impl PatternKey {
    #[must_use]
    pub fn new(kind: MistakeKind, detail: &str) -> Self {
        Self {
            kind,
            detail: detail.trim().to_ascii_lowercase(),
        }
    }

    #[must_use]
    pub fn from_finding(finding: &MistakeFinding) -> Self {
        Self::new(finding.kind, &finding.detail)
    }

    #[must_use]
    pub fn kind(&self) -> MistakeKind {
        self.kind
    }

    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl Display for PatternKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.detail)
    }
}

impl From<PatternKey> for String {
    fn from(key: PatternKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for PatternKey {
    type Error = LessonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (kind_raw, detail) = value
            .split_once(':')
            .ok_or_else(|| LessonError::Validation(format!("invalid pattern key '{value}'")))?;
        let kind = MistakeKind::parse(kind_raw).ok_or_else(|| {
            LessonError::Validation(format!("unknown mistake kind '{kind_raw}'"))
        })?;
        Ok(Self::new(kind, detail))
    }
}

/// Persistent aggregate per [`PatternKey`]. `occurrence_count` only ever
/// increases, by exactly 1 per run in which the pattern appears.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PatternRecord {
    pub occurrence_count: u64,
    pub last_seen_run_id: RunId,
}

/// Standing guidance synthesized from a recurring pattern. Created exactly
/// once per pattern key and never deleted; `active` defaults true and is
/// reserved for future deactivation policy.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Constraint {
    pub id: Ulid,
    pub source_pattern_key: PatternKey,
    pub text: String,
    pub occurrences_at_creation: u64,
    pub created_at_run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub active: bool,
}

/// One entry of the bounded run history. Kept for inspection and debugging;
/// pattern counting never replays history.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryEntry {
    pub run_id: RunId,
    pub trace: ExecutionTrace,
    pub findings: Vec<MistakeFinding>,
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LessonError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LessonError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LessonError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Parses an RFC3339 timestamp.
///
/// # Errors
/// Returns [`LessonError::Validation`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, LessonError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LessonError::Validation(format!("invalid RFC3339 timestamp: {err}")))
}
