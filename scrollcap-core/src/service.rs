use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{CaptureConfig, OutputSettings};
use crate::driver::ScrollDriver;
use crate::error::{Result, ScrollcapError};
use crate::extract::RuleLocator;
use crate::model::{Block, CaptureReport, OutputFormat};
use crate::snapshot::{Snapshot, SnapshotDocument};

fn read_snapshot_raw(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|source| ScrollcapError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if bytes.is_empty() {
        return Err(ScrollcapError::EmptySnapshotFile {
            path: path.to_path_buf(),
        });
    }

    String::from_utf8(bytes).map_err(|_| ScrollcapError::NonUtf8SnapshotFile {
        path: path.to_path_buf(),
    })
}

pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let raw = read_snapshot_raw(path)?;
    serde_json::from_str(&raw).map_err(|source| ScrollcapError::InvalidSnapshot {
        path: path.to_path_buf(),
        source,
    })
}

/// Replays a recorded page through the capture loop using the layout rules
/// the snapshot carries. `source` overrides the snapshot's own name.
pub async fn capture_snapshot(
    snapshot: Snapshot,
    config: &CaptureConfig,
    source: Option<&str>,
    cancel: &CancellationToken,
) -> Result<CaptureReport> {
    config.validate()?;

    let mut document = SnapshotDocument::new(snapshot);
    let locator = RuleLocator::new(document.layout().clone())?;
    let source = source.unwrap_or(document.source()).to_string();

    let driver = ScrollDriver::new(config.clone(), source);
    driver.run(&mut document, &locator, cancel).await
}

#[derive(Serialize)]
struct RawBlocks<'a> {
    source: &'a str,
    blocks: &'a [Block],
}

/// Captured blocks as plain JSON, independent of any output format.
pub fn report_to_raw_json(report: &CaptureReport) -> Result<String> {
    let raw = RawBlocks {
        source: &report.source,
        blocks: report.blocks(),
    };
    let mut output = serde_json::to_string_pretty(&raw)
        .map_err(|err| ScrollcapError::Serialization(err.to_string()))?;
    output.push('\n');
    Ok(output)
}

/// `<source>-<YYYY-MM-DD>.<ext>`, with the source reduced to a safe slug.
pub fn default_file_name(report: &CaptureReport, format: OutputFormat) -> String {
    let mut slug = String::new();
    for ch in report.source.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "conversation" } else { slug };

    format!(
        "{slug}-{}.{}",
        report.captured_at.format("%Y-%m-%d"),
        format.extension()
    )
}

pub fn write_output(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| ScrollcapError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::write(path, contents).map_err(|source| ScrollcapError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes a rendered archive under the output directory with its default
/// file name and returns the path written.
pub fn save_output(
    settings: &OutputSettings,
    report: &CaptureReport,
    format: OutputFormat,
    contents: &str,
) -> Result<PathBuf> {
    let path = settings
        .output_dir
        .join(default_file_name(report, format));
    write_output(&path, contents)?;
    info!(path = %path.display(), mime = format.mime_type(), "archive saved");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    use crate::config::{CaptureConfig, OutputSettings};
    use crate::error::ScrollcapError;
    use crate::model::{BlockKind, CaptureReport, CaptureStats, OutputFormat, Termination};
    use crate::service::{
        capture_snapshot, default_file_name, load_snapshot, report_to_raw_json, save_output,
    };
    use crate::snapshot::Snapshot;

    fn snapshot_json() -> Value {
        json!({
            "source": "AI Studio",
            "viewport_height": 400,
            "layout": {
                "container": {"tag": "chat-list"},
                "turn": {"tag": "chat-turn"},
                "auxiliary": {"tag": "thought-chunk"},
                "primary": {"class": "turn-content"},
                "role_attribute": "data-role",
                "noise_patterns": ["(?m)^Thoughts$", "chevron_right"]
            },
            "container": {"tag": "chat-list", "children": [
                {"tag": "chat-turn", "height": 250, "attributes": {"data-role": "user"},
                 "children": [{"classes": ["turn-content"], "text": "How does a virtualized list pick rows?"}]},
                {"tag": "chat-turn", "height": 350, "attributes": {"data-role": "model"},
                 "children": [
                    {"tag": "thought-chunk", "children": [
                        {"text": "Thoughts"},
                        {"text": "chevron_right"},
                        {"text": "The user wants the windowing rule explained."}
                    ]},
                    {"classes": ["turn-content"], "text": "It renders rows that intersect the viewport."}
                 ]},
                {"tag": "chat-turn", "height": 300, "attributes": {"data-role": "user"},
                 "children": [{"classes": ["turn-content"], "text": "And the rows outside of it?"}]}
            ]}
        })
    }

    fn snapshot() -> Snapshot {
        serde_json::from_value(snapshot_json()).expect("snapshot")
    }

    fn report(source: &str) -> CaptureReport {
        CaptureReport {
            source: source.to_string(),
            captured_at: Utc
                .with_ymd_and_hms(2026, 5, 9, 23, 59, 0)
                .single()
                .expect("timestamp"),
            stats: CaptureStats::default(),
            blocks: Vec::new(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn load_snapshot_reports_empty_and_invalid_files() {
        let temp = tempdir().expect("tempdir");

        let empty = temp.path().join("empty.json");
        fs::write(&empty, "").expect("write");
        assert!(matches!(
            load_snapshot(&empty),
            Err(ScrollcapError::EmptySnapshotFile { .. })
        ));

        let binary = temp.path().join("binary.json");
        fs::write(&binary, [0xff, 0xfe, 0x00]).expect("write");
        assert!(matches!(
            load_snapshot(&binary),
            Err(ScrollcapError::NonUtf8SnapshotFile { .. })
        ));

        let invalid = temp.path().join("invalid.json");
        fs::write(&invalid, "{\"container\": 3}").expect("write");
        assert!(matches!(
            load_snapshot(&invalid),
            Err(ScrollcapError::InvalidSnapshot { .. })
        ));

        assert!(matches!(
            load_snapshot(&temp.path().join("missing.json")),
            Err(ScrollcapError::Io { .. })
        ));
    }

    #[test]
    fn load_snapshot_reads_layout_rules() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("page.json");
        fs::write(&path, snapshot_json().to_string()).expect("write");

        let snapshot = load_snapshot(&path).expect("load");
        assert_eq!(snapshot.source.as_deref(), Some("AI Studio"));
        assert_eq!(snapshot.layout.role_attribute.as_deref(), Some("data-role"));
        assert_eq!(snapshot.container.children.len(), 3);
    }

    #[tokio::test]
    async fn capture_snapshot_uses_embedded_layout() {
        let report = capture_snapshot(
            snapshot(),
            &CaptureConfig::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .expect("capture");

        assert_eq!(report.source, "AI Studio");
        assert_eq!(report.stats.termination, Some(Termination::ReachedEnd));

        let kinds: Vec<BlockKind> = report.blocks().iter().map(|block| block.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BlockKind::Message,
                BlockKind::Message,
                BlockKind::AuxiliaryNote,
                BlockKind::Message
            ]
        );

        assert_eq!(
            report.blocks()[1].text,
            "It renders rows that intersect the viewport."
        );
        let note = &report.blocks()[2];
        assert_eq!(note.text, "The user wants the windowing rule explained.");
        assert_eq!(note.linked_sequence, Some(1));
    }

    #[tokio::test]
    async fn capture_snapshot_honors_source_override_and_config() {
        let report = capture_snapshot(
            snapshot(),
            &CaptureConfig::default(),
            Some("gemini"),
            &CancellationToken::new(),
        )
        .await
        .expect("capture");
        assert_eq!(report.source, "gemini");

        let config = CaptureConfig {
            base_step: 0.0,
            ..CaptureConfig::default()
        };
        let err = capture_snapshot(snapshot(), &config, None, &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, ScrollcapError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn cancelled_capture_is_partial() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = capture_snapshot(snapshot(), &CaptureConfig::default(), None, &cancel)
            .await
            .expect("capture");
        assert_eq!(report.stats.termination, Some(Termination::Cancelled));
        assert!(report.is_partial());
        assert!(report.blocks().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancellation_from_another_task_is_observed() {
        let turns: Vec<Value> = (0..400)
            .map(|idx| {
                json!({
                    "tag": "chat-turn",
                    "height": 100,
                    "text": format!("Turn number {idx} in a very long conversation.")
                })
            })
            .collect();
        let snapshot: Snapshot = serde_json::from_value(json!({
            "viewport_height": 400,
            "layout": {"container": {"tag": "chat-list"}, "turn": {"tag": "chat-turn"}},
            "container": {"tag": "chat-list", "children": turns}
        }))
        .expect("snapshot");

        let cancel = CancellationToken::new();
        let stopper = tokio::spawn({
            let cancel = cancel.clone();
            async move { cancel.cancel() }
        });

        let report = capture_snapshot(snapshot, &CaptureConfig::default(), None, &cancel)
            .await
            .expect("capture");
        stopper.await.expect("stopper task");

        assert_eq!(report.stats.termination, Some(Termination::Cancelled));
        assert!(report.blocks().len() < 400);
    }

    #[test]
    fn raw_json_lists_blocks() {
        let raw = report_to_raw_json(&report("aistudio")).expect("json");
        let value: Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(value["source"], "aistudio");
        assert_eq!(value["blocks"], json!([]));
    }

    #[test]
    fn default_file_name_uses_slug_and_date() {
        assert_eq!(
            default_file_name(&report("AI Studio"), OutputFormat::Markdown),
            "ai-studio-2026-05-09.md"
        );
        assert_eq!(
            default_file_name(&report("  "), OutputFormat::Text),
            "conversation-2026-05-09.txt"
        );
        assert_eq!(
            default_file_name(&report("gemini/app"), OutputFormat::Json),
            "gemini-app-2026-05-09.json"
        );
    }

    #[test]
    fn save_output_writes_into_output_dir() {
        let temp = tempdir().expect("tempdir");
        let settings = OutputSettings {
            output_dir: temp.path().join("archives"),
        };

        let path = save_output(&settings, &report("claude"), OutputFormat::Json, "{}\n")
            .expect("save");
        assert_eq!(path, temp.path().join("archives/claude-2026-05-09.json"));
        assert_eq!(fs::read_to_string(path).expect("read"), "{}\n");
    }
}
