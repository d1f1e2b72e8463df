//! A recorded page that can be replayed through the capture loop.
//!
//! The container's children are laid out top to bottom by height and only the
//! ones inside the viewport (plus overscan) are attached, the way a
//! virtualized chat list behaves.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::config::LayoutRules;
use crate::host::{
    ElementInfo, HostDocument, HostError, HostResult, NodeId, Rect, ScrollMetrics, Settle,
};

const LINE_HEIGHT: f64 = 24.0;
const MIN_TURN_HEIGHT: f64 = 48.0;
const EXPANDED_ATTRIBUTE: &str = "aria-expanded";

fn default_tag() -> String {
    "div".to_string()
}

fn default_viewport_height() -> f64 {
    800.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: f64,
    #[serde(default)]
    pub overscan: f64,
    #[serde(default)]
    pub layout: LayoutRules,
    pub container: SnapshotNode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotNode {
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub text: Option<String>,
    /// Layout height; only read for direct children of the container.
    #[serde(default)]
    pub height: Option<f64>,
    /// Present in the DOM but not rendered.
    #[serde(default)]
    pub hidden: bool,
    /// Children other than buttons stay unrendered until expanded.
    #[serde(default)]
    pub collapsed: bool,
    #[serde(default)]
    pub children: Vec<SnapshotNode>,
}

#[derive(Debug, Clone)]
struct ArenaNode {
    parent: Option<usize>,
    element: ElementInfo,
    text: Option<String>,
    hidden: bool,
    collapsed: bool,
    /// Recorded layout height, kept out of the element's attributes.
    height: Option<f64>,
    children: Vec<usize>,
    /// Index of the container child this node belongs to.
    lane: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Lane {
    node: usize,
    top: f64,
    height: f64,
}

#[derive(Debug, Clone)]
pub struct SnapshotDocument {
    source: String,
    layout: LayoutRules,
    nodes: Vec<ArenaNode>,
    lanes: Vec<Lane>,
    container: usize,
    viewport_height: f64,
    overscan: f64,
    offset: f64,
    dirty: bool,
    container_detached: bool,
}

const ROOT: usize = 0;

impl SnapshotDocument {
    pub fn new(snapshot: Snapshot) -> Self {
        let mut nodes = vec![ArenaNode {
            parent: None,
            element: ElementInfo {
                tag: "body".to_string(),
                ..ElementInfo::default()
            },
            text: None,
            hidden: false,
            collapsed: false,
            height: None,
            children: Vec::new(),
            lane: None,
        }];

        let container = push_tree(&mut nodes, snapshot.container, ROOT, None);
        nodes[ROOT].children.push(container);

        let mut lanes = Vec::new();
        let mut top = 0.0;
        let lane_roots = nodes[container].children.clone();
        for (lane_idx, &node) in lane_roots.iter().enumerate() {
            assign_lane(&mut nodes, node, lane_idx);
            let height = nodes[node]
                .height
                .unwrap_or_else(|| estimate_height(&nodes, node));
            lanes.push(Lane { node, top, height });
            top += height;
        }

        Self {
            source: snapshot.source.unwrap_or_else(|| "snapshot".to_string()),
            layout: snapshot.layout,
            nodes,
            lanes,
            container,
            viewport_height: snapshot.viewport_height.max(1.0),
            overscan: snapshot.overscan.max(0.0),
            offset: 0.0,
            dirty: false,
            container_detached: false,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn layout(&self) -> &LayoutRules {
        &self.layout
    }

    pub fn container_id(&self) -> NodeId {
        NodeId(self.container as u64)
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Drops the container from the page, as a navigation away would.
    pub fn detach_container(&mut self) {
        self.container_detached = true;
        self.dirty = true;
    }

    fn total_height(&self) -> f64 {
        self.lanes.iter().map(|lane| lane.height).sum()
    }

    fn max_offset(&self) -> f64 {
        (self.total_height() - self.viewport_height).max(0.0)
    }

    fn lane_visible(&self, lane: &Lane) -> bool {
        let window_top = self.offset - self.overscan;
        let window_bottom = self.offset + self.viewport_height + self.overscan;
        lane.top < window_bottom && lane.top + lane.height > window_top
    }

    fn visible_lanes(&self) -> Vec<usize> {
        self.lanes
            .iter()
            .filter(|lane| self.lane_visible(lane))
            .map(|lane| lane.node)
            .collect()
    }

    fn index(&self, node: NodeId) -> HostResult<usize> {
        let idx = usize::try_from(node.0).map_err(|_| HostError::Detached(node))?;
        if idx >= self.nodes.len() || !self.is_attached(idx) {
            return Err(HostError::Detached(node));
        }
        Ok(idx)
    }

    fn is_attached(&self, idx: usize) -> bool {
        if idx == ROOT {
            return true;
        }
        if self.container_detached {
            return false;
        }
        match self.nodes[idx].lane {
            None => true,
            Some(lane) => self.lane_visible(&self.lanes[lane]),
        }
    }

    fn rendered_children(&self, idx: usize, rendered: bool) -> Vec<usize> {
        if idx == self.container {
            return self.visible_lanes();
        }
        if idx == ROOT && self.container_detached {
            return Vec::new();
        }

        let node = &self.nodes[idx];
        node.children
            .iter()
            .copied()
            .filter(|&child| {
                let child_node = &self.nodes[child];
                if node.collapsed && !child_node.element.tag.eq_ignore_ascii_case("button") {
                    return false;
                }
                !(rendered && child_node.hidden)
            })
            .collect()
    }

    fn collect_text(&self, idx: usize, rendered: bool) -> String {
        if rendered && self.nodes[idx].hidden {
            return String::new();
        }

        let mut chunks = Vec::new();
        let mut stack = vec![idx];
        while let Some(current) = stack.pop() {
            if let Some(text) = self.nodes[current].text.as_deref()
                && !text.trim().is_empty()
            {
                chunks.push(text.trim().to_string());
            }
            let mut children = self.rendered_children(current, rendered);
            children.reverse();
            stack.extend(children);
        }

        chunks.join("\n")
    }

    fn lane_rect(&self, idx: usize) -> Rect {
        match self.nodes[idx].lane {
            Some(lane) => {
                let lane = self.lanes[lane];
                Rect {
                    top: lane.top - self.offset,
                    height: lane.height,
                }
            }
            None => Rect {
                top: 0.0,
                height: self.viewport_height,
            },
        }
    }
}

fn push_tree(
    nodes: &mut Vec<ArenaNode>,
    snapshot: SnapshotNode,
    parent: usize,
    lane: Option<usize>,
) -> usize {
    let idx = nodes.len();
    nodes.push(ArenaNode {
        parent: Some(parent),
        element: ElementInfo {
            tag: snapshot.tag,
            classes: snapshot.classes,
            attributes: snapshot.attributes,
        },
        text: snapshot.text,
        hidden: snapshot.hidden,
        collapsed: snapshot.collapsed,
        height: snapshot.height,
        children: Vec::new(),
        lane,
    });

    for child in snapshot.children {
        let child_idx = push_tree(nodes, child, idx, lane);
        nodes[idx].children.push(child_idx);
    }

    idx
}

fn assign_lane(nodes: &mut [ArenaNode], node: usize, lane: usize) {
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        nodes[current].lane = Some(lane);
        stack.extend(nodes[current].children.iter().copied());
    }
}

fn estimate_height(nodes: &[ArenaNode], node: usize) -> f64 {
    let mut lines = 0usize;
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        if let Some(text) = nodes[current].text.as_deref() {
            lines += text.lines().count().max(1);
        }
        stack.extend(nodes[current].children.iter().copied());
    }
    #[allow(clippy::cast_precision_loss)]
    let height = lines as f64 * LINE_HEIGHT;
    height.max(MIN_TURN_HEIGHT)
}

impl HostDocument for SnapshotDocument {
    async fn root(&self) -> NodeId {
        NodeId(ROOT as u64)
    }

    async fn children(&self, node: NodeId) -> HostResult<Vec<NodeId>> {
        let idx = self.index(node)?;
        Ok(self
            .rendered_children(idx, false)
            .into_iter()
            .map(|child| NodeId(child as u64))
            .collect())
    }

    async fn parent(&self, node: NodeId) -> HostResult<Option<NodeId>> {
        let idx = self.index(node)?;
        Ok(self.nodes[idx].parent.map(|parent| NodeId(parent as u64)))
    }

    async fn element(&self, node: NodeId) -> HostResult<ElementInfo> {
        let idx = self.index(node)?;
        Ok(self.nodes[idx].element.clone())
    }

    async fn rendered_text(&self, node: NodeId) -> HostResult<Option<String>> {
        let idx = self.index(node)?;
        Ok(Some(self.collect_text(idx, true)))
    }

    async fn text_content(&self, node: NodeId) -> HostResult<String> {
        let idx = self.index(node)?;
        Ok(self.collect_text(idx, false))
    }

    async fn bounding_rect(&self, node: NodeId) -> HostResult<Rect> {
        let idx = self.index(node)?;
        Ok(self.lane_rect(idx))
    }

    async fn scroll_metrics(&self, container: NodeId) -> HostResult<ScrollMetrics> {
        let idx = self.index(container)?;
        if idx != self.container {
            return Err(HostError::Unavailable(format!("{container} is not scrollable")));
        }
        Ok(ScrollMetrics {
            offset: self.offset,
            max_offset: self.max_offset(),
            viewport_height: self.viewport_height,
        })
    }

    async fn set_scroll_offset(&mut self, container: NodeId, offset: f64) -> HostResult<()> {
        let idx = self.index(container)?;
        if idx != self.container {
            return Err(HostError::Unavailable(format!("{container} is not scrollable")));
        }
        let clamped = offset.clamp(0.0, self.max_offset());
        if (clamped - self.offset).abs() > f64::EPSILON {
            self.offset = clamped;
            self.dirty = true;
        }
        Ok(())
    }

    async fn click(&mut self, node: NodeId) -> HostResult<()> {
        let idx = self.index(node)?;

        let mut current = Some(idx);
        while let Some(candidate) = current {
            if self.nodes[candidate].collapsed {
                self.nodes[candidate].collapsed = false;
                if let Some(value) = self.nodes[idx].element.attributes.get_mut(EXPANDED_ATTRIBUTE)
                {
                    *value = "true".to_string();
                }
                self.dirty = true;
                break;
            }
            current = self.nodes[candidate].parent;
        }

        Ok(())
    }

    async fn settle(&mut self, _timeout: Duration) -> Settle {
        // Nothing renders in the background; yield once in place of waiting.
        tokio::task::yield_now().await;
        if std::mem::take(&mut self.dirty) {
            Settle::Mutated
        } else {
            Settle::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::host::{HostDocument, HostError, Settle};
    use crate::snapshot::{Snapshot, SnapshotDocument};

    fn document(value: serde_json::Value) -> SnapshotDocument {
        let snapshot: Snapshot = serde_json::from_value(value).expect("snapshot");
        SnapshotDocument::new(snapshot)
    }

    fn three_turns() -> SnapshotDocument {
        document(json!({
            "viewport_height": 400,
            "container": {
                "tag": "main",
                "children": [
                    {"tag": "turn", "height": 300, "text": "first turn"},
                    {"tag": "turn", "height": 300, "text": "second turn"},
                    {"tag": "turn", "height": 300, "text": "third turn"}
                ]
            }
        }))
    }

    #[tokio::test]
    async fn only_turns_in_the_window_are_attached() {
        let mut doc = three_turns();
        let container = doc.container_id();

        let visible = doc.children(container).await.expect("children");
        assert_eq!(visible.len(), 2);

        doc.set_scroll_offset(container, 400.0).await.expect("scroll");
        let visible_after = doc.children(container).await.expect("children");
        assert_eq!(visible_after.len(), 2);
        assert_eq!(visible_after[0], visible[1]);

        let err = doc.element(visible[0]).await.expect_err("detached");
        assert_eq!(err, HostError::Detached(visible[0]));
    }

    #[tokio::test]
    async fn scroll_offset_is_clamped_to_extent() {
        let mut doc = three_turns();
        let container = doc.container_id();
        doc.set_scroll_offset(container, 10_000.0).await.expect("scroll");

        let metrics = doc.scroll_metrics(container).await.expect("metrics");
        assert_eq!(metrics.max_offset, 500.0);
        assert_eq!(metrics.offset, 500.0);
        assert_eq!(doc.settle(Duration::from_millis(10)).await, Settle::Mutated);
        assert_eq!(doc.settle(Duration::from_millis(10)).await, Settle::TimedOut);
    }

    #[tokio::test]
    async fn hidden_text_is_excluded_from_rendered_text_only() {
        let doc = document(json!({
            "container": {
                "children": [
                    {"children": [
                        {"text": "visible answer"},
                        {"text": "copy to clipboard", "hidden": true}
                    ]}
                ]
            }
        }));
        let turn = doc.children(doc.container_id()).await.expect("children")[0];

        assert_eq!(
            doc.rendered_text(turn).await.expect("rendered"),
            Some("visible answer".to_string())
        );
        assert_eq!(
            doc.text_content(turn).await.expect("content"),
            "visible answer\ncopy to clipboard"
        );
    }

    #[tokio::test]
    async fn click_expands_collapsed_section() {
        let mut doc = document(json!({
            "container": {
                "children": [
                    {"children": [
                        {"tag": "thought", "collapsed": true, "children": [
                            {"tag": "button", "attributes": {"aria-expanded": "false"}, "text": "Thoughts"},
                            {"text": "reasoning about the question"}
                        ]}
                    ]}
                ]
            }
        }));
        let turn = doc.children(doc.container_id()).await.expect("children")[0];
        let thought = doc.children(turn).await.expect("children")[0];
        let button = doc.children(thought).await.expect("children")[0];

        assert_eq!(
            doc.rendered_text(thought).await.expect("text"),
            Some("Thoughts".to_string())
        );

        doc.click(button).await.expect("click");
        assert_eq!(
            doc.element(button).await.expect("element").attribute("aria-expanded"),
            Some("true")
        );
        assert_eq!(
            doc.rendered_text(thought).await.expect("text"),
            Some("Thoughts\nreasoning about the question".to_string())
        );
    }

    #[tokio::test]
    async fn layout_height_is_not_an_attribute() {
        let doc = three_turns();
        let turn = doc.children(doc.container_id()).await.expect("children")[0];

        let element = doc.element(turn).await.expect("element");
        assert!(element.attributes.is_empty());
        assert_eq!(doc.bounding_rect(turn).await.expect("rect").height, 300.0);
    }

    #[tokio::test]
    async fn detached_container_rejects_access() {
        let mut doc = three_turns();
        let container = doc.container_id();
        doc.detach_container();
        assert!(matches!(
            doc.children(container).await,
            Err(HostError::Detached(_))
        ));
        assert!(doc.children(doc.root().await).await.expect("root").is_empty());
    }
}
