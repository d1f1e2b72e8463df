pub mod aggregate;
pub mod config;
pub mod driver;
pub mod error;
pub mod extract;
pub mod host;
pub mod model;
pub mod render;
pub mod service;
pub mod snapshot;

pub use aggregate::{Aggregator, BlockKey};
pub use config::{CaptureConfig, LayoutRules, Matcher, OutputSettings};
pub use driver::{RunFlag, ScrollDriver};
pub use error::{FrameIssue, Result, ScrollcapError};
pub use extract::{RuleLocator, TurnAnatomy, TurnLocator, extract};
pub use host::{ElementInfo, HostDocument, HostError, HostResult, NodeId, Rect, ScrollMetrics};
pub use model::{
    Attribution, Block, BlockKind, CaptureReport, CaptureStats, OutputFormat, RawBlock, Role,
    Termination,
};
pub use render::{render, render_named};
pub use service::{
    capture_snapshot, default_file_name, load_snapshot, report_to_raw_json, save_output,
    write_output,
};
pub use snapshot::{Snapshot, SnapshotDocument};
