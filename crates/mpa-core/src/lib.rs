//! Core domain model for MPA: flows, canonical analysis results, stored records.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mpa-core";

/// Placeholder written into any summary/item field the remote payload lacks.
pub const NOT_SPECIFIED: &str = "Not specified";

/// Which analysis the remote service was asked for. Both flows share the
/// polling machinery and differ only in how results are extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    Plan,
    Competitor,
}

impl Flow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flow::Plan => "plan",
            Flow::Competitor => "competitor",
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plan" | "marketing" | "marketing-plan" => Ok(Flow::Plan),
            "competitor" | "competitors" | "competitor-stack" => Ok(Flow::Competitor),
            other => Err(format!("unknown flow `{other}` (expected plan or competitor)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub name: String,
    pub industry: String,
    pub target: String,
    pub description: String,
}

impl Summary {
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            industry: NOT_SPECIFIED.to_string(),
            target: NOT_SPECIFIED.to_string(),
            description: NOT_SPECIFIED.to_string(),
        }
    }
}

/// One program (plan flow) or competitor (competitor flow).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub name: String,
    pub target: String,
    pub objective: String,
    pub kpi: String,
    #[serde(default)]
    pub scenarios: Vec<JsonValue>,
    #[serde(default)]
    pub placeholder: bool,
}

impl ResultItem {
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: NOT_SPECIFIED.to_string(),
            objective: NOT_SPECIFIED.to_string(),
            kpi: NOT_SPECIFIED.to_string(),
            scenarios: Vec::new(),
            placeholder: true,
        }
    }
}

/// Display-ready result of a completed job. `summary` is always present and
/// `items` always holds at least one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResult {
    pub flow: Flow,
    pub summary: Summary,
    pub items: Vec<ResultItem>,
    pub correlation_id: Option<String>,
    /// Raw `program_<N>_details`-style subtrees, kept verbatim.
    #[serde(default)]
    pub enrichments: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub synthesized_items: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Persisted form of a canonical result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    pub normalized_key: String,
    pub flow: Flow,
    pub version_no: u32,
    pub content_hash: String,
    pub session_id: Option<Uuid>,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn result(&self) -> Result<CanonicalResult, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Canonical storage key for a domain-ish input: lower-cased, scheme, path,
/// query, fragment, leading `www.` and trailing dots stripped. Runs to a
/// fixed point, so the function is idempotent for every input.
pub fn normalize_domain_key(input: &str) -> String {
    let mut current = input.to_lowercase();
    loop {
        let next = normalize_domain_key_pass(&current);
        if next == current {
            return next;
        }
        current = next;
    }
}

fn normalize_domain_key_pass(input: &str) -> String {
    let mut s = input.trim();
    while let Some(idx) = s.find("://") {
        s = &s[idx + 3..];
    }
    if let Some(idx) = s.find(['/', '?', '#']) {
        s = &s[..idx];
    }
    let mut s = s.trim();
    while let Some(rest) = s.strip_prefix("www.") {
        s = rest.trim_start();
    }
    s.trim_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string()
}

/// Capitalized first label of the normalized key: `https://www.acme.io` -> `Acme`.
pub fn display_name_from_key(key: &str) -> String {
    let normalized = normalize_domain_key(key);
    let label = normalized.split('.').next().unwrap_or_default();
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => {
            let mut s = String::new();
            s.extend(first.to_uppercase());
            s.push_str(chars.as_str());
            s
        }
        None => NOT_SPECIFIED.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Request,
    Response,
    Diagnostic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub category: LogCategory,
    pub level: LogLevel,
    pub message: String,
    pub repeat: u32,
}

/// Bounded, drop-oldest log buffer shared between the poller and readers.
/// Identical consecutive entries inside `dedup_window` collapse into one
/// entry with a repeat counter.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    dedup_window: Duration,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(500, Duration::from_secs(2))
    }
}

impl LogBuffer {
    pub fn new(capacity: usize, dedup_window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            dedup_window,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, category: LogCategory, level: LogLevel, message: impl Into<String>) {
        self.push_at(Utc::now(), category, level, message);
    }

    pub fn push_at(
        &self,
        at: DateTime<Utc>,
        category: LogCategory,
        level: LogLevel,
        message: impl Into<String>,
    ) {
        let message = message.into();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(last) = entries.back_mut() {
            let within_window = at
                .signed_duration_since(last.last_seen)
                .to_std()
                .map(|gap| gap <= self.dedup_window)
                .unwrap_or(true);
            if within_window
                && last.category == category
                && last.level == level
                && last.message == message
            {
                last.repeat = last.repeat.saturating_add(1);
                last.last_seen = at;
                return;
            }
        }

        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            at,
            last_seen: at,
            category,
            level,
            message,
            repeat: 1,
        });
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn by_category(&self, category: LogCategory) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
