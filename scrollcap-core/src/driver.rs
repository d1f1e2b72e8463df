use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregator;
use crate::config::CaptureConfig;
use crate::error::{FrameIssue, Result, ScrollcapError};
use crate::extract::{TurnLocator, extract};
use crate::host::{HostDocument, NodeId, ScrollMetrics};
use crate::model::{CaptureReport, CaptureStats, Termination};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Positioning,
    Scanning,
    Advancing,
    Draining,
    Done,
}

/// Marks a page as being captured. Clones share the same flag, so every
/// driver pointed at one page should be built with the same `RunFlag`.
#[derive(Debug, Clone, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn try_acquire(&self) -> Option<RunGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(Arc::clone(&self.0)))
    }
}

#[derive(Debug)]
pub struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Mutable state of one capture run.
#[derive(Debug)]
struct CaptureSession {
    aggregator: Aggregator,
    cursor: f64,
    stable_iterations: u32,
    stuck_iterations: u32,
    failed_controls: HashSet<NodeId>,
    stats: CaptureStats,
    warnings: Vec<String>,
}

impl CaptureSession {
    fn new(config: &CaptureConfig) -> Self {
        Self {
            aggregator: Aggregator::new(config.key_prefix_len),
            cursor: 0.0,
            stable_iterations: 0,
            stuck_iterations: 0,
            failed_controls: HashSet::new(),
            stats: CaptureStats::default(),
            warnings: Vec::new(),
        }
    }

    fn record(&mut self, issue: &FrameIssue) {
        self.warnings.push(issue.to_string());
    }

    fn finish(mut self, source: &str, progress: f64) -> CaptureReport {
        self.stats.progress = progress;
        CaptureReport {
            source: source.to_string(),
            captured_at: Utc::now(),
            stats: self.stats,
            blocks: self.aggregator.into_blocks(),
            warnings: self.warnings,
        }
    }
}

/// Scrolls a virtualized container from top to bottom, capturing every turn
/// that gets rendered along the way.
#[derive(Debug, Clone)]
pub struct ScrollDriver {
    config: CaptureConfig,
    source: String,
    running: RunFlag,
}

impl ScrollDriver {
    pub fn new(config: CaptureConfig, source: impl Into<String>) -> Self {
        Self {
            config,
            source: source.into(),
            running: RunFlag::new(),
        }
    }

    #[must_use]
    pub fn with_run_flag(mut self, running: RunFlag) -> Self {
        self.running = running;
        self
    }

    /// Runs one capture to completion.
    ///
    /// Only a missing container or a concurrent run are errors. Cancellation
    /// returns the blocks captured by the iterations that already ran.
    pub async fn run<H, L>(
        &self,
        host: &mut H,
        locator: &L,
        cancel: &CancellationToken,
    ) -> Result<CaptureReport>
    where
        H: HostDocument,
        L: TurnLocator,
    {
        let Some(_guard) = self.running.try_acquire() else {
            return Err(ScrollcapError::AlreadyRunning);
        };

        let mut session = CaptureSession::new(&self.config);
        let mut state = DriverState::Positioning;
        let mut container = None;
        let mut metrics = ScrollMetrics::default();

        info!(source = %self.source, "starting capture");

        loop {
            state = match state {
                DriverState::Positioning => {
                    let found = self.position(host, locator).await?;
                    container = Some(found);
                    DriverState::Scanning
                }
                DriverState::Scanning => {
                    let Some(container) = container else {
                        break;
                    };

                    if cancel.is_cancelled() {
                        info!(
                            iterations = session.stats.iterations,
                            "capture cancelled; keeping partial results"
                        );
                        session.stats.termination = Some(Termination::Cancelled);
                        DriverState::Draining
                    } else {
                        self.scan(host, locator, container, &mut session).await;
                        if let Ok(latest) = host.scroll_metrics(container).await {
                            metrics = latest;
                        }
                        session.cursor = metrics.offset;

                        match self.termination(&session, &metrics) {
                            Some(reason) => {
                                debug!(%reason, "capture loop draining");
                                session.stats.termination = Some(reason);
                                DriverState::Draining
                            }
                            None => DriverState::Advancing,
                        }
                    }
                }
                DriverState::Advancing => {
                    let Some(container) = container else {
                        break;
                    };
                    self.advance(host, locator, container, &mut session).await;
                    DriverState::Scanning
                }
                DriverState::Draining => {
                    if let Some(container) = container
                        && session.stats.termination != Some(Termination::Cancelled)
                    {
                        host.settle(self.config.drain_settle()).await;
                        self.scan(host, locator, container, &mut session).await;
                        if let Ok(latest) = host.scroll_metrics(container).await {
                            metrics = latest;
                        }
                    }
                    DriverState::Done
                }
                DriverState::Done => break,
            };
        }

        let report = session.finish(&self.source, metrics.progress());
        info!(
            source = %report.source,
            blocks = report.blocks.len(),
            iterations = report.stats.iterations,
            frame_errors = report.stats.frame_errors,
            "capture finished"
        );
        Ok(report)
    }

    async fn position<H, L>(&self, host: &mut H, locator: &L) -> Result<NodeId>
    where
        H: HostDocument,
        L: TurnLocator,
    {
        let container = match locator.container(&*host).await {
            Ok(Some(container)) => container,
            Ok(None) => return Err(self.container_not_found()),
            Err(err) => {
                warn!(error = %err, "container lookup failed");
                return Err(self.container_not_found());
            }
        };

        if let Err(err) = host.set_scroll_offset(container, 0.0).await {
            warn!(error = %err, "could not reset scroll offset");
        }
        host.settle(self.config.initial_settle()).await;
        Ok(container)
    }

    fn container_not_found(&self) -> ScrollcapError {
        ScrollcapError::ContainerNotFound {
            source_name: self.source.clone(),
        }
    }

    async fn scan<H, L>(
        &self,
        host: &mut H,
        locator: &L,
        container: NodeId,
        session: &mut CaptureSession,
    ) where
        H: HostDocument,
        L: TurnLocator,
    {
        session.stats.iterations += 1;
        let iteration = session.stats.iterations;

        self.expand(host, locator, container, session).await;

        match extract(&*host, locator, container, &self.config).await {
            Ok(frame) => {
                let outcome = session.aggregator.offer_frame(&frame);
                session.stats.accepted += outcome.accepted as u64;
                session.stats.duplicates += outcome.duplicates as u64;
                if outcome.accepted > 0 {
                    session.stable_iterations = 0;
                } else {
                    session.stable_iterations += 1;
                }
                debug!(
                    iteration,
                    cursor = session.cursor,
                    accepted = outcome.accepted,
                    duplicates = outcome.duplicates,
                    stable = session.stable_iterations,
                    total = session.aggregator.len(),
                    "frame captured"
                );
            }
            Err(source) => {
                let issue = FrameIssue::ExtractionFrame { iteration, source };
                warn!(%issue, "frame skipped");
                session.stats.frame_errors += 1;
                session.stable_iterations += 1;
                session.record(&issue);
            }
        }
    }

    /// Clicks collapsed expand controls so auxiliary sections render.
    async fn expand<H, L>(
        &self,
        host: &mut H,
        locator: &L,
        container: NodeId,
        session: &mut CaptureSession,
    ) where
        H: HostDocument,
        L: TurnLocator,
    {
        let controls = match locator.collapsed_controls(&*host, container).await {
            Ok(controls) => controls,
            Err(err) => {
                debug!(error = %err, "expand controls unavailable");
                return;
            }
        };

        let mut clicked = Vec::new();
        for control in controls {
            if session.failed_controls.contains(&control) {
                continue;
            }
            match host.click(control).await {
                Ok(()) => clicked.push(control),
                Err(err) => debug!(%control, error = %err, "expand click failed"),
            }
        }
        if clicked.is_empty() {
            return;
        }

        session.stats.expansion_clicks += clicked.len() as u64;
        host.settle(self.config.expand_settle()).await;

        let still_collapsed = locator
            .collapsed_controls(&*host, container)
            .await
            .unwrap_or_default();
        for control in clicked {
            if still_collapsed.contains(&control) {
                let issue = FrameIssue::ExpansionActionFailed {
                    iteration: session.stats.iterations,
                    control,
                };
                debug!(%issue, "auxiliary section stays collapsed");
                session.stats.expansion_failures += 1;
                session.failed_controls.insert(control);
                session.record(&issue);
            }
        }
    }

    async fn advance<H, L>(
        &self,
        host: &mut H,
        locator: &L,
        container: NodeId,
        session: &mut CaptureSession,
    ) where
        H: HostDocument,
        L: TurnLocator,
    {
        let before = match host.scroll_metrics(container).await {
            Ok(metrics) => metrics,
            Err(err) => {
                warn!(error = %err, "scroll metrics unavailable");
                session.stuck_iterations += 1;
                return;
            }
        };

        let step = self.next_step(&*host, locator, container, &before).await;
        let target = (before.offset + step).min(before.max_offset);
        if let Err(err) = host.set_scroll_offset(container, target).await {
            warn!(error = %err, target, "scroll failed");
        }
        host.settle(self.config.scroll_settle()).await;

        let after = host.scroll_metrics(container).await.unwrap_or(before);
        if after.offset - before.offset < self.config.stuck_epsilon {
            session.stuck_iterations += 1;
        } else {
            session.stuck_iterations = 0;
        }
        session.cursor = after.offset;

        if session.stuck_iterations >= self.config.stuck_limit {
            let jump = after.offset + self.config.stuck_jump;
            warn!(
                offset = after.offset,
                jump,
                stuck = session.stuck_iterations,
                "scroll stalled; forcing a jump"
            );
            if let Err(err) = host.set_scroll_offset(container, jump).await {
                warn!(error = %err, "forced jump failed");
            }
            host.settle(self.config.scroll_settle()).await;
            session.stats.forced_jumps += 1;
            session.stuck_iterations = 0;
            if let Ok(latest) = host.scroll_metrics(container).await {
                session.cursor = latest.offset;
            }
        }
    }

    /// Default step, or a larger one when a single oversized turn fills the
    /// view.
    async fn next_step<H, L>(
        &self,
        host: &H,
        locator: &L,
        container: NodeId,
        metrics: &ScrollMetrics,
    ) -> f64
    where
        H: HostDocument,
        L: TurnLocator,
    {
        let base = self.config.base_step;
        let turns = match locator.turns(host, container).await {
            Ok(turns) => turns,
            Err(_) => return base,
        };
        if turns.is_empty() || turns.len() > self.config.sparse_turns {
            return base;
        }

        let mut tallest: f64 = 0.0;
        for turn in turns {
            if let Ok(rect) = host.bounding_rect(turn).await {
                tallest = tallest.max(rect.height);
            }
        }

        if tallest > metrics.viewport_height * self.config.oversize_ratio {
            let step = (tallest * self.config.oversize_step_factor).clamp(base, self.config.max_jump);
            debug!(tallest, step, "oversized turn; enlarging step");
            step
        } else {
            base
        }
    }

    fn termination(&self, session: &CaptureSession, metrics: &ScrollMetrics) -> Option<Termination> {
        if metrics.offset >= metrics.max_offset - self.config.end_tolerance {
            return Some(Termination::ReachedEnd);
        }
        if session.stable_iterations >= self.config.stale_limit
            && metrics.progress() > self.config.high_progress
        {
            return Some(Termination::Stalled);
        }
        if session.stats.iterations >= self.config.max_iterations {
            warn!(
                iterations = session.stats.iterations,
                "iteration cap reached before the end of the container"
            );
            return Some(Termination::IterationCap);
        }
        None
    }
}
