use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScrollcapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Message,
    AuxiliaryNote,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::AuxiliaryNote => write!(f, "auxiliary_note"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" | "human" | "prompt" => Some(Self::User),
            "assistant" | "model" | "gemini" | "claude" | "bot" | "ai" => Some(Self::Assistant),
            _ => None,
        }
    }

    /// The speaker of the turn that follows one by `self`.
    pub fn other(self) -> Self {
        match self {
            Self::User => Self::Assistant,
            Self::Assistant => Self::User,
        }
    }
}

/// How a message's role was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribution {
    /// From page structure or a role attribute/class.
    Known(Role),
    /// From positional alternation only; not trustworthy.
    Inferred(Role),
    /// Structure and declared role disagree. The structural role is used.
    Disputed { structural: Role, declared: Role },
}

impl Attribution {
    pub fn role(&self) -> Role {
        match *self {
            Self::Known(role) | Self::Inferred(role) => role,
            Self::Disputed { structural, .. } => structural,
        }
    }

    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

/// A block as read from one frame, before deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub kind: BlockKind,
    pub role: Option<Attribution>,
    pub text: String,
    /// Index, within the same frame, of the message this note annotates.
    pub parent: Option<usize>,
}

impl RawBlock {
    pub fn message(text: impl Into<String>, role: Option<Attribution>) -> Self {
        Self {
            kind: BlockKind::Message,
            role,
            text: text.into(),
            parent: None,
        }
    }

    pub fn note(text: impl Into<String>, parent: Option<usize>) -> Self {
        Self {
            kind: BlockKind::AuxiliaryNote,
            role: None,
            text: text.into(),
            parent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Block {
    pub sequence: u64,
    pub kind: BlockKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Attribution>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_sequence: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Markdown,
    Json,
    Text,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Json => "json",
            Self::Text => "txt",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Markdown => "text/markdown",
            Self::Json => "application/json",
            Self::Text => "text/plain",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = ScrollcapError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "md" | "markdown" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            "txt" | "text" => Ok(Self::Text),
            _ => Err(ScrollcapError::RenderFormatUnsupported(input.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    ReachedEnd,
    Stalled,
    Cancelled,
    IterationCap,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReachedEnd => write!(f, "reached end"),
            Self::Stalled => write!(f, "no new blocks near end"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::IterationCap => write!(f, "iteration cap"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureStats {
    pub iterations: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub frame_errors: u64,
    pub expansion_clicks: u64,
    pub expansion_failures: u64,
    pub forced_jumps: u64,
    pub progress: f64,
    pub termination: Option<Termination>,
}

/// A finished, read-only capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureReport {
    pub source: String,
    pub captured_at: DateTime<Utc>,
    pub stats: CaptureStats,
    pub blocks: Vec<Block>,
    #[serde(skip_serializing)]
    pub warnings: Vec<String>,
}

impl CaptureReport {
    /// Blocks in capture order. Available whether or not rendering succeeds.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn message_count(&self) -> usize {
        self.count_kind(BlockKind::Message)
    }

    pub fn note_count(&self) -> usize {
        self.count_kind(BlockKind::AuxiliaryNote)
    }

    fn count_kind(&self, kind: BlockKind) -> usize {
        self.blocks.iter().filter(|block| block.kind == kind).count()
    }

    pub fn is_partial(&self) -> bool {
        matches!(
            self.stats.termination,
            Some(Termination::Cancelled | Termination::IterationCap)
        )
    }
}
