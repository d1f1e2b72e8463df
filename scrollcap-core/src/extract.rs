use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::{CaptureConfig, LayoutRules, Matcher};
use crate::error::{Result, ScrollcapError};
use crate::host::{HostDocument, HostError, HostResult, NodeId};
use crate::model::{Attribution, RawBlock, Role};

static BLANK_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n(?:[ \t]*\n){2,}").expect("valid regex"));

/// The parts of one turn that matter for extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnAnatomy {
    pub auxiliary: Option<NodeId>,
    pub primary: Option<NodeId>,
    pub declared_role: Option<Role>,
}

/// Finds containers, turns and expand controls on a page.
///
/// This is the piece that breaks whenever a vendor changes its markup, so it
/// is injected rather than built into the extractor.
#[allow(async_fn_in_trait)]
pub trait TurnLocator {
    async fn container<H: HostDocument>(&self, host: &H) -> HostResult<Option<NodeId>>;

    /// Turns currently attached under `container`, in document order.
    async fn turns<H: HostDocument>(&self, host: &H, container: NodeId)
    -> HostResult<Vec<NodeId>>;

    async fn anatomy<H: HostDocument>(
        &self,
        host: &H,
        container: NodeId,
        turn: NodeId,
    ) -> HostResult<TurnAnatomy>;

    /// Expand controls that are still collapsed.
    async fn collapsed_controls<H: HostDocument>(
        &self,
        host: &H,
        container: NodeId,
    ) -> HostResult<Vec<NodeId>>;

    /// Strips UI chrome from auxiliary text.
    fn clean_auxiliary(&self, text: &str) -> String {
        normalize_text(text)
    }
}

/// Locator driven by [`LayoutRules`].
#[derive(Debug, Clone)]
pub struct RuleLocator {
    rules: LayoutRules,
    noise: Vec<Regex>,
}

impl RuleLocator {
    pub fn new(rules: LayoutRules) -> Result<Self> {
        rules.validate()?;
        let noise = rules
            .noise_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ScrollcapError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules, noise })
    }

    pub fn rules(&self) -> &LayoutRules {
        &self.rules
    }

    async fn declared_role<H: HostDocument>(
        &self,
        host: &H,
        container: NodeId,
        turn: NodeId,
    ) -> HostResult<Option<Role>> {
        if self.rules.role_attribute.is_none()
            && self.rules.user_classes.is_empty()
            && self.rules.assistant_classes.is_empty()
        {
            return Ok(None);
        }

        let mut current = Some(turn);
        while let Some(node) = current {
            if node == container {
                break;
            }

            let element = host.element(node).await?;
            if let Some(name) = self.rules.role_attribute.as_deref()
                && let Some(role) = element.attribute(name).and_then(Role::parse)
            {
                return Ok(Some(role));
            }
            if self.rules.user_classes.iter().any(|c| element.has_class(c)) {
                return Ok(Some(Role::User));
            }
            if self.rules.assistant_classes.iter().any(|c| element.has_class(c)) {
                return Ok(Some(Role::Assistant));
            }

            current = host.parent(node).await?;
        }

        Ok(None)
    }
}

impl TurnLocator for RuleLocator {
    async fn container<H: HostDocument>(&self, host: &H) -> HostResult<Option<NodeId>> {
        let root = host.root().await;
        match &self.rules.container {
            None => Ok(Some(root)),
            Some(matcher) => find_first(host, root, matcher, true).await,
        }
    }

    async fn turns<H: HostDocument>(
        &self,
        host: &H,
        container: NodeId,
    ) -> HostResult<Vec<NodeId>> {
        match &self.rules.turn {
            None => host.children(container).await,
            Some(matcher) => find_all(host, container, matcher).await,
        }
    }

    async fn anatomy<H: HostDocument>(
        &self,
        host: &H,
        container: NodeId,
        turn: NodeId,
    ) -> HostResult<TurnAnatomy> {
        let auxiliary = match &self.rules.auxiliary {
            Some(matcher) => find_first(host, turn, matcher, false).await?,
            None => None,
        };
        let primary = match &self.rules.primary {
            Some(matcher) => find_first(host, turn, matcher, false).await?,
            None => None,
        };
        let declared_role = self.declared_role(host, container, turn).await?;

        Ok(TurnAnatomy {
            auxiliary,
            primary,
            declared_role,
        })
    }

    async fn collapsed_controls<H: HostDocument>(
        &self,
        host: &H,
        container: NodeId,
    ) -> HostResult<Vec<NodeId>> {
        match &self.rules.expand_control {
            None => Ok(Vec::new()),
            Some(matcher) => find_all(host, container, matcher).await,
        }
    }

    fn clean_auxiliary(&self, text: &str) -> String {
        let mut cleaned = text.to_string();
        for pattern in &self.noise {
            cleaned = pattern.replace_all(&cleaned, "").into_owned();
        }
        normalize_text(&cleaned)
    }
}

/// First node matching `matcher` in document order below `start`.
async fn find_first<H: HostDocument>(
    host: &H,
    start: NodeId,
    matcher: &Matcher,
    include_start: bool,
) -> HostResult<Option<NodeId>> {
    if include_start && matcher.matches(&host.element(start).await?) {
        return Ok(Some(start));
    }

    let mut stack = host.children(start).await?;
    stack.reverse();
    while let Some(node) = stack.pop() {
        if matcher.matches(&host.element(node).await?) {
            return Ok(Some(node));
        }
        let mut children = host.children(node).await?;
        children.reverse();
        stack.extend(children);
    }

    Ok(None)
}

/// All outermost nodes matching `matcher` below `start`, in document order.
async fn find_all<H: HostDocument>(
    host: &H,
    start: NodeId,
    matcher: &Matcher,
) -> HostResult<Vec<NodeId>> {
    let mut found = Vec::new();
    let mut stack = host.children(start).await?;
    stack.reverse();
    while let Some(node) = stack.pop() {
        if matcher.matches(&host.element(node).await?) {
            found.push(node);
            continue;
        }
        let mut children = host.children(node).await?;
        children.reverse();
        stack.extend(children);
    }
    Ok(found)
}

/// Trims, unifies line endings and collapses runs of blank lines to one.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n");
    BLANK_RUN_RE
        .replace_all(&unified, "\n\n")
        .trim()
        .to_string()
}

async fn visible_text<H: HostDocument>(host: &H, node: NodeId) -> HostResult<String> {
    let text = match host.rendered_text(node).await? {
        Some(text) => text,
        None => host.text_content(node).await?,
    };
    Ok(normalize_text(&text))
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Reads every qualifying turn currently attached under `container`.
///
/// Read-only with respect to the page. A container that has been detached
/// yields an empty frame; a turn that detaches mid-frame is skipped.
pub async fn extract<H, L>(
    host: &H,
    locator: &L,
    container: NodeId,
    config: &CaptureConfig,
) -> HostResult<Vec<RawBlock>>
where
    H: HostDocument,
    L: TurnLocator,
{
    let turns = match locator.turns(host, container).await {
        Ok(turns) => turns,
        Err(HostError::Detached(node)) => {
            debug!(%node, "container detached; empty frame");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err),
    };

    let mut frame = Vec::new();
    let mut ordinal = 0usize;
    for turn in turns {
        match extract_turn(host, locator, container, turn, ordinal, frame.len(), config).await {
            Ok(Some(blocks)) => {
                ordinal += 1;
                frame.extend(blocks);
            }
            Ok(None) => {}
            Err(HostError::Detached(node)) => {
                debug!(%node, "turn detached mid-frame; skipping");
            }
            Err(err) => return Err(err),
        }
    }

    Ok(frame)
}

/// Blocks for one turn, or `None` when the turn is presentation filler.
async fn extract_turn<H, L>(
    host: &H,
    locator: &L,
    container: NodeId,
    turn: NodeId,
    ordinal: usize,
    base: usize,
    config: &CaptureConfig,
) -> HostResult<Option<Vec<RawBlock>>>
where
    H: HostDocument,
    L: TurnLocator,
{
    let text = visible_text(host, turn).await?;
    if char_len(&text) < config.min_turn_chars {
        return Ok(None);
    }

    let anatomy = locator.anatomy(host, container, turn).await?;
    let mut blocks = Vec::new();

    if let Some(auxiliary) = anatomy.auxiliary {
        let auxiliary_text = visible_text(host, auxiliary).await?;
        let primary_text = match anatomy.primary {
            Some(primary) => visible_text(host, primary).await?,
            None if auxiliary_text.is_empty() => text.clone(),
            None => normalize_text(&text.replacen(auxiliary_text.as_str(), "", 1)),
        };

        let mut message_index = None;
        if char_len(&primary_text) >= config.min_message_chars {
            let role = structural_attribution(turn, anatomy.declared_role);
            message_index = Some(base + blocks.len());
            blocks.push(RawBlock::message(primary_text, Some(role)));
        }

        let note = locator.clean_auxiliary(&auxiliary_text);
        if char_len(&note) >= config.min_note_chars {
            blocks.push(RawBlock::note(note, message_index));
        }
    } else {
        let body = match anatomy.primary {
            Some(primary) => visible_text(host, primary).await?,
            None => text,
        };
        if char_len(&body) >= config.min_message_chars {
            let role = match anatomy.declared_role {
                Some(role) => Attribution::Known(role),
                None => Attribution::Inferred(alternating_role(ordinal)),
            };
            blocks.push(RawBlock::message(body, Some(role)));
        }
    }

    Ok(Some(blocks))
}

/// Only model turns carry an auxiliary section.
fn structural_attribution(turn: NodeId, declared: Option<Role>) -> Attribution {
    match declared {
        Some(Role::User) => {
            warn!(%turn, "turn has an auxiliary section but declares a user role");
            Attribution::Disputed {
                structural: Role::Assistant,
                declared: Role::User,
            }
        }
        _ => Attribution::Known(Role::Assistant),
    }
}

/// Frame-local guess. `Aggregator::offer_frame` re-anchors it to the
/// conversation.
fn alternating_role(ordinal: usize) -> Role {
    if ordinal % 2 == 0 {
        Role::User
    } else {
        Role::Assistant
    }
}
