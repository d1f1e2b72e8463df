use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dirs::{download_dir, home_dir};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScrollcapError};
use crate::host::ElementInfo;

/// Tunables for one capture run. Every field has a default, so a config file
/// only needs the values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Characters of text that form a block's identity key. Two distinct
    /// blocks sharing this many leading characters collapse into one.
    pub key_prefix_len: usize,
    pub min_turn_chars: usize,
    pub min_message_chars: usize,
    pub min_note_chars: usize,

    pub base_step: f64,
    /// Rendered turn count at or below which a frame counts as sparse.
    pub sparse_turns: usize,
    /// A turn taller than this many viewport heights dominates the view.
    pub oversize_ratio: f64,
    pub oversize_step_factor: f64,
    pub max_jump: f64,

    pub stuck_epsilon: f64,
    pub stuck_limit: u32,
    pub stuck_jump: f64,

    pub end_tolerance: f64,
    pub stale_limit: u32,
    pub high_progress: f64,
    pub max_iterations: u64,

    pub initial_settle_ms: u64,
    pub scroll_settle_ms: u64,
    pub expand_settle_ms: u64,
    pub drain_settle_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            key_prefix_len: 100,
            min_turn_chars: 20,
            min_message_chars: 10,
            min_note_chars: 20,
            base_step: 400.0,
            sparse_turns: 2,
            oversize_ratio: 1.5,
            oversize_step_factor: 0.8,
            max_jump: 8000.0,
            stuck_epsilon: 10.0,
            stuck_limit: 6,
            stuck_jump: 5000.0,
            end_tolerance: 10.0,
            stale_limit: 15,
            high_progress: 0.9,
            max_iterations: 10_000,
            initial_settle_ms: 1000,
            scroll_settle_ms: 300,
            expand_settle_ms: 100,
            drain_settle_ms: 500,
        }
    }
}

impl CaptureConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| ScrollcapError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str::<Self>(&raw)
            .map_err(|err| ScrollcapError::InvalidConfig(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix_len == 0 {
            return Err(ScrollcapError::InvalidConfig(
                "key_prefix_len must be at least 1".to_string(),
            ));
        }
        if self.base_step <= 0.0 || self.max_jump < self.base_step {
            return Err(ScrollcapError::InvalidConfig(
                "base_step must be positive and not exceed max_jump".to_string(),
            ));
        }
        if self.stuck_jump <= self.stuck_epsilon {
            return Err(ScrollcapError::InvalidConfig(
                "stuck_jump must exceed stuck_epsilon".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.high_progress) {
            return Err(ScrollcapError::InvalidConfig(
                "high_progress must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.stuck_limit == 0 || self.stale_limit == 0 || self.max_iterations == 0 {
            return Err(ScrollcapError::InvalidConfig(
                "stuck_limit, stale_limit and max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn initial_settle(&self) -> Duration {
        Duration::from_millis(self.initial_settle_ms)
    }

    pub fn scroll_settle(&self) -> Duration {
        Duration::from_millis(self.scroll_settle_ms)
    }

    pub fn expand_settle(&self) -> Duration {
        Duration::from_millis(self.expand_settle_ms)
    }

    pub fn drain_settle(&self) -> Duration {
        Duration::from_millis(self.drain_settle_ms)
    }
}

/// Matches an element when every field that is set agrees with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Matcher {
    pub tag: Option<String>,
    pub class: Option<String>,
    pub attribute: Option<String>,
    pub value: Option<String>,
}

impl Matcher {
    pub fn tag(tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            ..Self::default()
        }
    }

    pub fn attribute(name: &str, value: &str) -> Self {
        Self {
            attribute: Some(name.to_string()),
            value: Some(value.to_string()),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attribute = Some(name.to_string());
        self.value = Some(value.to_string());
        self
    }

    pub fn matches(&self, element: &ElementInfo) -> bool {
        if let Some(tag) = self.tag.as_deref()
            && !element.tag.eq_ignore_ascii_case(tag)
        {
            return false;
        }

        if let Some(class) = self.class.as_deref()
            && !element.has_class(class)
        {
            return false;
        }

        if let Some(name) = self.attribute.as_deref() {
            let Some(actual) = element.attribute(name) else {
                return false;
            };
            if self.value.as_deref().is_some_and(|expected| expected != actual) {
                return false;
            }
        }

        true
    }

    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.class.is_none() && self.attribute.is_none()
    }
}

/// Where turns live on a page and how to read them.
///
/// This is data for the default locator, not a built-in table of vendor
/// selectors: a snapshot or config file supplies the rules for its page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutRules {
    /// `None` scans the whole document.
    pub container: Option<Matcher>,
    /// `None` treats each direct child of the container as a turn.
    pub turn: Option<Matcher>,
    pub auxiliary: Option<Matcher>,
    pub primary: Option<Matcher>,
    /// A control that is still collapsed and expands an auxiliary section.
    pub expand_control: Option<Matcher>,
    pub role_attribute: Option<String>,
    pub user_classes: Vec<String>,
    pub assistant_classes: Vec<String>,
    /// Regexes removed from auxiliary text (UI labels, icon names).
    pub noise_patterns: Vec<String>,
}

impl LayoutRules {
    pub fn validate(&self) -> Result<()> {
        let named = [
            ("container", &self.container),
            ("turn", &self.turn),
            ("auxiliary", &self.auxiliary),
            ("primary", &self.primary),
            ("expand_control", &self.expand_control),
        ];
        for (name, matcher) in named {
            if matcher.as_ref().is_some_and(Matcher::is_empty) {
                return Err(ScrollcapError::InvalidConfig(format!(
                    "layout matcher `{name}` must set tag, class or attribute"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSettings {
    pub output_dir: PathBuf,
}

impl OutputSettings {
    pub fn from_env_or_home() -> Result<Self> {
        // Precedence:
        // 1) SCROLLCAP_OUTPUT_DIR
        // 2) platform downloads directory
        // 3) home directory
        if let Some(dir) = env::var_os("SCROLLCAP_OUTPUT_DIR").filter(|path| !path.is_empty()) {
            return Ok(Self {
                output_dir: PathBuf::from(dir),
            });
        }

        let output_dir = download_dir()
            .or_else(home_dir)
            .ok_or(ScrollcapError::HomeDirectoryNotFound)?;
        Ok(Self { output_dir })
    }
}
