//! Marker table: prose patterns that signal a tool is running.
//!
//! The server announces tool use in free text (e.g. "🔍 Searching the web
//! for: cats"), so detection is heuristic. The table is versioned so that
//! pattern changes can be tested and rolled out independently of the
//! tracker's state machine.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Bumped whenever a default rule is added, removed or reworded.
pub const MARKER_TABLE_VERSION: u32 = 1;

/// Glyphs the server prefixes tool announcements with.
pub const MARKER_GLYPHS: &[&str] = &["🔍", "🎵", "🎶", "🎨", "🌤", "📅", "🧠", "✅", "❌"];

#[derive(Debug, Clone)]
pub struct MarkerRule {
    pattern: Regex,
    pub tool_name: String,
    pub action_label: String,
    pub is_completion: bool,
}

impl MarkerRule {
    pub fn new(
        pattern: &str,
        tool_name: impl Into<String>,
        action_label: impl Into<String>,
        is_completion: bool,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            tool_name: tool_name.into(),
            action_label: action_label.into(),
            is_completion,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

/// The first rule that matched a fragment, with its named captures.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerMatch {
    pub tool_name: String,
    pub action_label: String,
    pub is_completion: bool,
    pub details: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct MarkerTable {
    version: u32,
    rules: Vec<MarkerRule>,
}

// (pattern, tool, action, is_completion)
const DEFAULT_RULES: &[(&str, &str, &str, bool)] = &[
    (
        r"🔍\s*Searching the web for:?\s*(?P<query>[^\n]*)",
        "web_search",
        "Searching the web",
        false,
    ),
    (
        r"✅\s*(?:Web search|Search) complete",
        "web_search",
        "Search complete",
        true,
    ),
    (
        r"🎵\s*(?:Finding|Searching for) (?:music|songs)(?: for)?:?\s*(?P<query>[^\n]*)",
        "music_recommendation",
        "Finding music",
        false,
    ),
    (
        r"🎶\s*Here (?:are|is) (?:some |your )?(?:songs|tracks|music|recommendations)",
        "music_recommendation",
        "Music ready",
        true,
    ),
    (
        r"🎨\s*(?:Generating|Creating) (?:an? )?image(?: of)?:?\s*(?P<prompt>[^\n]*)",
        "image_generation",
        "Generating image",
        false,
    ),
    (
        r"🌤\x{FE0F}?\s*Checking (?:the )?weather(?: for| in)?:?\s*(?P<location>[^\n]*)",
        "weather",
        "Checking the weather",
        false,
    ),
    (
        r"📅\s*(?:Checking|Looking at) (?:your )?calendar",
        "calendar",
        "Checking your calendar",
        false,
    ),
    (
        r"🧠\s*(?:Remembering|Recalling|Saving to memory)",
        "memory",
        "Updating memory",
        false,
    ),
];

static DEFAULT_TABLE: Lazy<MarkerTable> = Lazy::new(|| {
    let rules = DEFAULT_RULES
        .iter()
        .filter_map(|(pattern, tool, action, completion)| {
            match MarkerRule::new(pattern, *tool, *action, *completion) {
                Ok(rule) => Some(rule),
                Err(err) => {
                    log::error!("Invalid built-in marker pattern for {tool}: {err}");
                    None
                }
            }
        })
        .collect();
    MarkerTable::new(MARKER_TABLE_VERSION, rules)
});

impl MarkerTable {
    pub fn new(version: u32, rules: Vec<MarkerRule>) -> Self {
        Self { version, rules }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn rules(&self) -> &[MarkerRule] {
        &self.rules
    }

    /// Only the first matching rule counts, in table order.
    pub fn first_match(&self, fragment: &str) -> Option<MarkerMatch> {
        self.rules.iter().find_map(|rule| {
            let captures = rule.pattern.captures(fragment)?;
            let details = rule
                .pattern
                .capture_names()
                .flatten()
                .filter_map(|name| {
                    let value = captures.name(name)?.as_str().trim();
                    (!value.is_empty()).then(|| (name.to_string(), value.to_string()))
                })
                .collect();
            Some(MarkerMatch {
                tool_name: rule.tool_name.clone(),
                action_label: rule.action_label.clone(),
                is_completion: rule.is_completion,
                details,
            })
        })
    }
}

impl Default for MarkerTable {
    fn default() -> Self {
        DEFAULT_TABLE.clone()
    }
}

pub fn contains_marker_glyph(text: &str) -> bool {
    MARKER_GLYPHS.iter().any(|glyph| text.contains(glyph))
}
