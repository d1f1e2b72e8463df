use std::collections::HashMap;

use chrono::SecondsFormat;
use serde::Serialize;

use crate::error::{Result, ScrollcapError};
use crate::model::{
    Attribution, Block, BlockKind, CaptureReport, CaptureStats, OutputFormat, Role,
};

const RULE_WIDTH: usize = 50;
const NOTE_TITLE: &str = "Thoughts";

enum Section<'a> {
    Message {
        block: &'a Block,
        notes: Vec<&'a Block>,
    },
    Note(&'a Block),
}

pub fn render(report: &CaptureReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Markdown => Ok(render_markdown(report)),
        OutputFormat::Json => render_json(report),
        OutputFormat::Text => Ok(render_text(report)),
    }
}

/// Renders by format name; unknown names leave `report` untouched for a
/// fallback.
pub fn render_named(report: &CaptureReport, format: &str) -> Result<String> {
    render(report, format.parse()?)
}

/// Messages in sequence order, each carrying the notes linked to it. Notes
/// without a captured parent stay in place as their own section.
fn sections(blocks: &[Block]) -> Vec<Section<'_>> {
    let mut sections = Vec::new();
    let mut message_slots = HashMap::new();

    for block in blocks {
        match block.kind {
            BlockKind::Message => {
                message_slots.insert(block.sequence, sections.len());
                sections.push(Section::Message {
                    block,
                    notes: Vec::new(),
                });
            }
            BlockKind::AuxiliaryNote => {
                let slot = block
                    .linked_sequence
                    .and_then(|sequence| message_slots.get(&sequence).copied());
                match slot.and_then(|slot| sections.get_mut(slot)) {
                    Some(Section::Message { notes, .. }) => notes.push(block),
                    _ => sections.push(Section::Note(block)),
                }
            }
        }
    }

    sections
}

fn role_title(role: Option<Attribution>) -> String {
    let Some(attribution) = role else {
        return "Message".to_string();
    };

    let name = match attribution.role() {
        Role::User => "User",
        Role::Assistant => "Assistant",
    };
    match attribution {
        Attribution::Known(_) => name.to_string(),
        Attribution::Inferred(_) => format!("{name} (inferred)"),
        Attribution::Disputed { .. } => format!("{name} (disputed)"),
    }
}

fn number(block: &Block) -> u64 {
    block.sequence + 1
}

fn push_totals(output: &mut String, report: &CaptureReport, prefix: &str) {
    output.push_str(&format!("{prefix}Source: {}\n", report.source));
    output.push_str(&format!(
        "{prefix}Captured: {}\n",
        report.captured_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    output.push_str(&format!(
        "{prefix}Blocks: {} ({} messages, {} auxiliary notes)\n",
        report.blocks.len(),
        report.message_count(),
        report.note_count()
    ));
    if let Some(termination) = report.stats.termination {
        output.push_str(&format!("{prefix}Finished: {termination}\n"));
    }
    if report.is_partial() {
        output.push_str(&format!("{prefix}Partial capture: yes\n"));
    }
}

fn render_markdown(report: &CaptureReport) -> String {
    let mut output = String::new();
    output.push_str("# Conversation Archive\n\n");
    push_totals(&mut output, report, "- ");
    output.push('\n');

    if report.blocks.is_empty() {
        output.push_str("_No messages captured._\n");
        return output;
    }

    for section in sections(&report.blocks) {
        match section {
            Section::Message { block, notes } => {
                output.push_str(&format!(
                    "## {}. {}\n\n",
                    number(block),
                    role_title(block.role)
                ));
                output.push_str(block.text.trim());
                output.push_str("\n\n");
                for note in notes {
                    push_markdown_note(&mut output, note);
                }
            }
            Section::Note(block) => {
                output.push_str(&format!("## {}. {NOTE_TITLE}\n\n", number(block)));
                output.push_str(&quote(block.text.trim()));
                output.push_str("\n\n");
            }
        }
    }

    output
}

fn push_markdown_note(output: &mut String, note: &Block) {
    output.push_str(&format!("> **{NOTE_TITLE}** ({})\n>\n", number(note)));
    output.push_str(&quote(note.text.trim()));
    output.push_str("\n\n");
}

fn quote(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                ">".to_string()
            } else {
                format!("> {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Serialize)]
struct JsonTotals {
    blocks: usize,
    messages: usize,
    auxiliary_notes: usize,
}

#[derive(Serialize)]
struct JsonArchive<'a> {
    source: &'a str,
    captured_at: String,
    partial: bool,
    totals: JsonTotals,
    stats: &'a CaptureStats,
    blocks: &'a [Block],
}

fn render_json(report: &CaptureReport) -> Result<String> {
    let archive = JsonArchive {
        source: &report.source,
        captured_at: report.captured_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        partial: report.is_partial(),
        totals: JsonTotals {
            blocks: report.blocks.len(),
            messages: report.message_count(),
            auxiliary_notes: report.note_count(),
        },
        stats: &report.stats,
        blocks: &report.blocks,
    };

    let mut output = serde_json::to_string_pretty(&archive)
        .map_err(|err| ScrollcapError::Serialization(err.to_string()))?;
    output.push('\n');
    Ok(output)
}

fn render_text(report: &CaptureReport) -> String {
    let mut output = String::new();
    output.push_str("Conversation Archive\n");
    push_totals(&mut output, report, "");
    output.push_str(&"=".repeat(RULE_WIDTH));
    output.push_str("\n\n");

    if report.blocks.is_empty() {
        output.push_str("No messages captured.\n");
        return output;
    }

    let sections = sections(&report.blocks);
    let last = sections.len() - 1;
    for (idx, section) in sections.into_iter().enumerate() {
        match section {
            Section::Message { block, notes } => {
                output.push_str(&format!(
                    "[{}] {}\n\n",
                    number(block),
                    role_title(block.role).to_uppercase()
                ));
                output.push_str(block.text.trim());
                output.push_str("\n\n");
                for note in notes {
                    output.push_str(&format!(
                        "    {} ({})\n\n",
                        NOTE_TITLE.to_uppercase(),
                        number(note)
                    ));
                    output.push_str(&indent(note.text.trim()));
                    output.push_str("\n\n");
                }
            }
            Section::Note(block) => {
                output.push_str(&format!(
                    "[{}] {}\n\n",
                    number(block),
                    NOTE_TITLE.to_uppercase()
                ));
                output.push_str(block.text.trim());
                output.push_str("\n\n");
            }
        }

        if idx < last {
            output.push_str(&"-".repeat(RULE_WIDTH));
            output.push_str("\n\n");
        }
    }

    output
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("    {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
