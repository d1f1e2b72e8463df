//! Capabilities the capture loop needs from a live page.
//!
//! A real browser, a headless driver, or [`crate::snapshot::SnapshotDocument`]
//! can stand behind this trait. Every call is async so that hosts reached over
//! a remote protocol fit without blocking; the loop itself never runs two calls
//! at once.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("node {0} is no longer attached")]
    Detached(NodeId),

    #[error("host capability unavailable: {0}")]
    Unavailable(String),
}

pub type HostResult<T> = std::result::Result<T, HostError>;

/// Tag, classes and attributes of one element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementInfo {
    pub tag: String,
    pub classes: Vec<String>,
    pub attributes: BTreeMap<String, String>,
}

impl ElementInfo {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }
}

/// Bounding box relative to the top of the viewport.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub top: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollMetrics {
    pub offset: f64,
    pub max_offset: f64,
    pub viewport_height: f64,
}

impl ScrollMetrics {
    /// Fraction of the scrollable extent already covered, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.max_offset <= 0.0 {
            return 1.0;
        }
        (self.offset / self.max_offset).clamp(0.0, 1.0)
    }
}

/// Outcome of a bounded wait for the page to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Mutated,
    TimedOut,
}

#[allow(async_fn_in_trait)]
pub trait HostDocument {
    /// The document root; universal capture scans from here.
    async fn root(&self) -> NodeId;

    /// Currently attached children, in document order.
    async fn children(&self, node: NodeId) -> HostResult<Vec<NodeId>>;

    async fn parent(&self, node: NodeId) -> HostResult<Option<NodeId>>;

    async fn element(&self, node: NodeId) -> HostResult<ElementInfo>;

    /// Text as rendered (CSS-hidden content excluded). `None` when the host
    /// cannot compute layout text and callers should fall back to
    /// [`HostDocument::text_content`].
    async fn rendered_text(&self, node: NodeId) -> HostResult<Option<String>>;

    async fn text_content(&self, node: NodeId) -> HostResult<String>;

    async fn bounding_rect(&self, node: NodeId) -> HostResult<Rect>;

    async fn scroll_metrics(&self, container: NodeId) -> HostResult<ScrollMetrics>;

    async fn set_scroll_offset(&mut self, container: NodeId, offset: f64) -> HostResult<()>;

    async fn click(&mut self, node: NodeId) -> HostResult<()>;

    /// Suspends until the page mutates or `timeout` elapses, whichever is first.
    async fn settle(&mut self, timeout: Duration) -> Settle;
}
