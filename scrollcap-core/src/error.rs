use std::path::PathBuf;

use thiserror::Error;

use crate::host::{HostError, NodeId};

#[derive(Debug, Error)]
pub enum ScrollcapError {
    #[error("scroll container not found in {source_name}")]
    ContainerNotFound { source_name: String },

    #[error("a capture is already running against this page")]
    AlreadyRunning,

    #[error("unsupported output format: {0}")]
    RenderFormatUnsupported(String),

    #[error("invalid noise pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("cannot determine home directory")]
    HomeDirectoryNotFound,

    #[error("snapshot file is empty: {path}")]
    EmptySnapshotFile { path: PathBuf },

    #[error("snapshot file is not valid UTF-8: {path}")]
    NonUtf8SnapshotFile { path: PathBuf },

    #[error("invalid snapshot json in {path}: {source}")]
    InvalidSnapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ScrollcapError>;

/// Problems contained inside one iteration of the capture loop.
#[derive(Debug, Error)]
pub enum FrameIssue {
    #[error("extraction failed in iteration {iteration}: {source}")]
    ExtractionFrame {
        iteration: u64,
        #[source]
        source: HostError,
    },

    #[error("expand control {control} had no visible effect in iteration {iteration}")]
    ExpansionActionFailed { iteration: u64, control: NodeId },
}
