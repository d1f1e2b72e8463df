use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

const SNAPSHOT: &str = r#"{
  "source": "AI Studio",
  "viewport_height": 400,
  "layout": {
    "container": {"tag": "ms-chat-session"},
    "turn": {"tag": "ms-chat-turn"},
    "auxiliary": {"tag": "ms-thought-chunk"},
    "primary": {"class": "turn-content"},
    "expand_control": {"tag": "button", "attribute": "aria-expanded", "value": "false"},
    "role_attribute": "data-turn-role",
    "noise_patterns": ["(?m)^Thoughts$", "chevron_right"]
  },
  "container": {"tag": "ms-chat-session", "children": [
    {"tag": "ms-chat-turn", "height": 300, "attributes": {"data-turn-role": "user"},
     "children": [{"classes": ["turn-content"], "text": "How does a virtualized list pick rows?"}]},
    {"tag": "ms-chat-turn", "height": 450, "attributes": {"data-turn-role": "model"},
     "children": [
       {"tag": "ms-thought-chunk", "collapsed": true, "children": [
         {"tag": "button", "attributes": {"aria-expanded": "false"}, "text": "Thoughts"},
         {"text": "chevron_right"},
         {"text": "The user wants the windowing rule explained plainly."}
       ]},
       {"classes": ["turn-content"], "text": "It renders only rows that intersect the viewport."}
     ]},
    {"tag": "ms-chat-turn", "height": 300, "attributes": {"data-turn-role": "user"},
     "children": [{"classes": ["turn-content"], "text": "What happens to rows outside of it?"}]},
    {"tag": "ms-chat-turn", "height": 300, "attributes": {"data-turn-role": "model"},
     "children": [{"classes": ["turn-content"], "text": "They are unmounted until scrolled back into view."}]}
  ]}
}"#;

fn setup_snapshot(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("page.json");
    fs::write(&path, contents).expect("write snapshot");
    (temp, path)
}

fn scrollcap(snapshot: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("scrollcap"));
    cmd.env_remove("RUST_LOG").arg(snapshot);
    cmd
}

#[test]
fn default_outputs_markdown() {
    let (_temp, path) = setup_snapshot(SNAPSHOT);

    scrollcap(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("# Conversation Archive"))
        .stdout(predicate::str::contains("- Source: AI Studio"))
        .stdout(predicate::str::contains("## 1. User\n\nHow does a virtualized list pick rows?"))
        .stdout(predicate::str::contains("## 2. Assistant"))
        .stdout(predicate::str::contains(
            "> The user wants the windowing rule explained plainly.",
        ))
        .stdout(predicate::str::contains("chevron_right").not())
        .stdout(predicate::str::contains("## 5. Assistant"))
        .stderr(predicate::str::contains(
            "captured 5 blocks (4 messages, 1 auxiliary notes)",
        ));
}

#[test]
fn json_format_outputs_blocks_and_stats() {
    let (_temp, path) = setup_snapshot(SNAPSHOT);

    scrollcap(&path)
        .args(["--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"auxiliary_notes\": 1"))
        .stdout(predicate::str::contains("\"kind\": \"auxiliary_note\""))
        .stdout(predicate::str::contains("\"linked_sequence\": 1"))
        .stdout(predicate::str::contains("\"termination\": \"reached_end\""));
}

#[test]
fn text_format_uses_plain_sections() {
    let (_temp, path) = setup_snapshot(SNAPSHOT);

    scrollcap(&path)
        .args(["--format", "txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[1] USER"))
        .stdout(predicate::str::contains("    THOUGHTS (3)"))
        .stdout(predicate::str::contains("-".repeat(50)))
        .stdout(predicate::str::contains("## ").not());
}

#[test]
fn source_flag_overrides_snapshot_name() {
    let (_temp, path) = setup_snapshot(SNAPSHOT);

    scrollcap(&path)
        .args(["--source", "gemini"])
        .assert()
        .success()
        .stdout(predicate::str::contains("- Source: gemini"));
}

#[test]
fn output_flag_writes_file() {
    let (temp, path) = setup_snapshot(SNAPSHOT);
    let output = temp.path().join("out/archive.md");

    scrollcap(&path)
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("wrote"));

    let written = fs::read_to_string(&output).expect("read archive");
    assert!(written.contains("## 1. User"));
}

#[test]
fn save_writes_dated_file_into_out_dir() {
    let (temp, path) = setup_snapshot(SNAPSHOT);
    let out_dir = temp.path().join("archives");

    scrollcap(&path)
        .args(["--format", "json", "--save", "--out-dir"])
        .arg(&out_dir)
        .assert()
        .success()
        .stderr(predicate::str::contains("application/json"));

    let entries: Vec<String> = fs::read_dir(&out_dir)
        .expect("read out dir")
        .map(|entry| {
            entry
                .expect("entry")
                .file_name()
                .to_string_lossy()
                .to_string()
        })
        .collect();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].starts_with("ai-studio-"));
    assert!(entries[0].ends_with(".json"));
}

#[test]
fn save_uses_output_dir_env() {
    let (temp, path) = setup_snapshot(SNAPSHOT);
    let out_dir = temp.path().join("from-env");

    scrollcap(&path)
        .env("SCROLLCAP_OUTPUT_DIR", &out_dir)
        .args(["--format", "txt", "--save"])
        .assert()
        .success();

    let saved = fs::read_dir(&out_dir).expect("read out dir").count();
    assert_eq!(saved, 1);
}

#[test]
fn unsupported_format_falls_back_to_json() {
    let (_temp, path) = setup_snapshot(SNAPSHOT);

    scrollcap(&path)
        .args(["--format", "pdf"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unsupported output format: pdf"))
        .stdout(predicate::str::contains("\"blocks\""))
        .stdout(predicate::str::contains(
            "It renders only rows that intersect the viewport.",
        ));
}

#[test]
fn missing_container_is_an_error() {
    let (_temp, path) = setup_snapshot(
        r#"{"source": "claude", "layout": {"container": {"tag": "chat-list"}},
            "container": {"tag": "main", "children": []}}"#,
    );

    scrollcap(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "error: scroll container not found in claude",
        ));
}

#[test]
fn empty_snapshot_file_is_an_error() {
    let (_temp, path) = setup_snapshot("");

    scrollcap(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("snapshot file is empty"));
}

#[test]
fn config_file_is_validated() {
    let (temp, path) = setup_snapshot(SNAPSHOT);
    let config = temp.path().join("config.json");
    fs::write(&config, r#"{"key_prefix_len": 0}"#).expect("write config");

    scrollcap(&path)
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid config"));
}
