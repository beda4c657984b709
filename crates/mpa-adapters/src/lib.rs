//! Response classification and result normalization for the analysis flows.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use mpa_core::{
    display_name_from_key, CanonicalResult, Flow, ResultItem, Summary, ValidationError,
    NOT_SPECIFIED,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "mpa-adapters";

const BUILTIN_ERROR_PHRASES: &str = include_str!("../rules/error_phrases.yaml");

/// Where the generated content may live inside a status response, in lookup order.
pub const CONTENT_PATHS: &[&[&str]] = &[
    &["response", "data", "content"],
    &["content"],
    &["response", "data", "json_response"],
    &["json_response"],
    &["data", "content"],
    &["response", "content"],
];

pub const STATUS_PATHS: &[&[&str]] = &[&["status"], &["response", "status"], &["data", "status"]];

pub const SUCCESS_STATUSES: &[&str] = &["succeeded", "success", "completed", "complete", "done"];

pub const CORRELATION_ID_PATHS: &[&[&str]] = &[
    &["conversation_id"],
    &["response", "conversation_id"],
    &["metadata", "conversation_id"],
    &["response", "metadata", "request_id"],
    &["request_id"],
];

/// Key shape `<prefix><N><suffix>` whose value enriches `items[N-1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentPattern {
    pub prefix: &'static str,
    pub suffix: &'static str,
}

impl EnrichmentPattern {
    /// 1-based index encoded in `key`, if the key matches.
    pub fn index_of(&self, key: &str) -> Option<usize> {
        let digits = key.strip_prefix(self.prefix)?.strip_suffix(self.suffix)?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

pub const PROGRAM_DETAILS: EnrichmentPattern = EnrichmentPattern {
    prefix: "program_",
    suffix: "_details",
};

pub const COMPETITOR_DETAILS: EnrichmentPattern = EnrichmentPattern {
    prefix: "competitor_",
    suffix: "_details",
};

#[derive(Debug, Clone, Copy)]
pub struct SummaryFieldKeys {
    pub name: &'static [&'static str],
    pub industry: &'static [&'static str],
    pub target: &'static [&'static str],
    pub description: &'static [&'static str],
}

#[derive(Debug, Clone, Copy)]
pub struct ItemFieldKeys {
    pub name: &'static [&'static str],
    pub target: &'static [&'static str],
    pub objective: &'static [&'static str],
    pub kpi: &'static [&'static str],
}

/// Everything that differs between flows: where things live and what they
/// may be called.
#[derive(Debug, Clone, Copy)]
pub struct ShapeRules {
    pub flow: Flow,
    pub summary_keys: &'static [&'static str],
    pub items_keys: &'static [&'static str],
    pub summary_fields: SummaryFieldKeys,
    pub item_fields: ItemFieldKeys,
    pub placeholder_item_name: &'static str,
    pub enrichment_patterns: &'static [EnrichmentPattern],
}

const SUMMARY_FIELDS: SummaryFieldKeys = SummaryFieldKeys {
    name: &["name", "company_name", "company"],
    industry: &["industry", "sector", "vertical"],
    target: &["target", "target_audience", "audience", "target_market"],
    description: &["description", "overview", "summary", "value_proposition"],
};

pub const PLAN_RULES: ShapeRules = ShapeRules {
    flow: Flow::Plan,
    summary_keys: &["company_summary", "summary", "company_overview", "business_summary"],
    items_keys: &["programs_list", "programs", "marketing_programs", "program_list"],
    summary_fields: SUMMARY_FIELDS,
    item_fields: ItemFieldKeys {
        name: &["program_name", "name", "title"],
        target: &["target", "target_audience", "audience"],
        objective: &["objective", "goal", "objectives"],
        kpi: &["kpi", "kpis", "success_metrics", "metrics"],
    },
    placeholder_item_name: "Marketing Program",
    enrichment_patterns: &[PROGRAM_DETAILS],
};

pub const COMPETITOR_RULES: ShapeRules = ShapeRules {
    flow: Flow::Competitor,
    summary_keys: &["target_company", "company_summary", "company_overview", "summary"],
    items_keys: &["competitors", "competitor_list", "competitors_list", "competitive_landscape"],
    summary_fields: SUMMARY_FIELDS,
    item_fields: ItemFieldKeys {
        name: &["competitor_name", "name", "company", "company_name"],
        target: &["website", "domain", "url", "target_audience"],
        objective: &["positioning", "value_proposition", "description"],
        kpi: &["tech_stack", "stack", "technologies", "key_metrics"],
    },
    placeholder_item_name: "Competitor",
    enrichment_patterns: &[COMPETITOR_DETAILS, PROGRAM_DETAILS],
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ErrorPhrasesFile {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    phrases: Vec<String>,
}

/// Substrings that mark generated content as a failed analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorPhrases {
    phrases: Vec<String>,
}

impl ErrorPhrases {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: ErrorPhrasesFile = serde_yaml::from_str(text).context("parsing error phrase rules")?;
        Ok(Self::new(file.phrases))
    }

    pub fn builtin() -> Self {
        Self::from_yaml_str(BUILTIN_ERROR_PHRASES).unwrap_or_default()
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// `MPA_ERROR_PHRASES_PATH` when set, the built-in list otherwise.
    pub fn from_env() -> Result<Self> {
        match std::env::var("MPA_ERROR_PHRASES_PATH") {
            Ok(path) if !path.trim().is_empty() => Self::from_path(path.trim()),
            _ => Ok(Self::builtin()),
        }
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// First phrase found in `text`, compared case-insensitively.
    pub fn find_in(&self, text: &str) -> Option<&str> {
        let lower = text.to_lowercase();
        self.phrases
            .iter()
            .find(|p| lower.contains(p.as_str()))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub complete: bool,
    pub embedded_error: bool,
    pub minimum_shape: bool,
    pub remote_status: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("no content found at any known path")]
    MissingContent,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeContext {
    /// Key the job was started with (the domain); used for the name fallback.
    pub lookup_key: String,
}

impl NormalizeContext {
    pub fn new(lookup_key: impl Into<String>) -> Self {
        Self {
            lookup_key: lookup_key.into(),
        }
    }
}

/// Classifier + normalizer pair for one flow.
pub trait FlowAdapter: Send + Sync {
    fn flow(&self) -> Flow;

    fn contains_embedded_error(&self, resp: &JsonValue) -> bool;

    fn has_minimum_shape(&self, resp: &JsonValue) -> bool;

    fn remote_status(&self, resp: &JsonValue) -> Option<String>;

    fn is_complete(&self, resp: &JsonValue) -> bool {
        self.classify(resp).complete
    }

    fn classify(&self, resp: &JsonValue) -> Classification {
        let embedded_error = self.contains_embedded_error(resp);
        let minimum_shape = self.has_minimum_shape(resp);
        let remote_status = self.remote_status(resp);
        let succeeded = remote_status.as_deref().is_some_and(is_success_status);
        Classification {
            complete: !embedded_error && succeeded && minimum_shape,
            embedded_error,
            minimum_shape,
            remote_status,
        }
    }

    fn normalize(
        &self,
        raw: &JsonValue,
        ctx: &NormalizeContext,
    ) -> Result<CanonicalResult, NormalizeError>;

    fn validate(&self, result: &CanonicalResult) -> Vec<ValidationError>;
}

pub fn is_success_status(status: &str) -> bool {
    let status = status.trim();
    SUCCESS_STATUSES.iter().any(|s| s.eq_ignore_ascii_case(status))
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// Objects pass through; strings holding a JSON object are parsed.
fn object_or_embedded(value: &JsonValue) -> Option<Map<String, JsonValue>> {
    match value {
        JsonValue::Object(map) => Some(map.clone()),
        JsonValue::String(text) => match serde_json::from_str::<JsonValue>(text.trim()) {
            Ok(JsonValue::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

pub fn resolve_content(raw: &JsonValue) -> Option<Map<String, JsonValue>> {
    CONTENT_PATHS
        .iter()
        .filter_map(|path| json_at(raw, path))
        .find_map(object_or_embedded)
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                JsonValue::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => return None,
    };
    if text.is_empty() || text.eq_ignore_ascii_case(NOT_SPECIFIED) {
        None
    } else {
        Some(text)
    }
}

/// First present, non-empty, non-placeholder value among `keys`.
fn first_text(sources: &[&Map<String, JsonValue>], keys: &[&str]) -> Option<String> {
    sources
        .iter()
        .find_map(|source| keys.iter().find_map(|k| source.get(*k).and_then(scalar_text)))
}

fn non_empty_collection(value: &JsonValue) -> bool {
    match value {
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct JsonFlowAdapter {
    rules: ShapeRules,
    phrases: Arc<ErrorPhrases>,
}

impl JsonFlowAdapter {
    pub fn new(rules: ShapeRules, phrases: Arc<ErrorPhrases>) -> Self {
        Self { rules, phrases }
    }

    pub fn rules(&self) -> &ShapeRules {
        &self.rules
    }

    fn enrichment_index(&self, key: &str) -> Option<usize> {
        self.rules
            .enrichment_patterns
            .iter()
            .find_map(|p| p.index_of(key))
    }

    fn shape_in(&self, obj: &Map<String, JsonValue>) -> bool {
        let summary_shaped = self
            .rules
            .summary_keys
            .iter()
            .any(|k| obj.get(*k).and_then(object_or_embedded).is_some());
        let has_items = self
            .rules
            .items_keys
            .iter()
            .any(|k| obj.get(*k).is_some_and(non_empty_collection));
        let has_details = obj.keys().any(|k| self.enrichment_index(k).is_some());
        summary_shaped || has_items || has_details
    }

    fn build_summary(&self, content: &Map<String, JsonValue>, ctx: &NormalizeContext) -> Summary {
        let summary_obj = self
            .rules
            .summary_keys
            .iter()
            .find_map(|k| content.get(*k).and_then(object_or_embedded));
        let mut sources: Vec<&Map<String, JsonValue>> = Vec::with_capacity(2);
        if let Some(obj) = &summary_obj {
            sources.push(obj);
        }
        sources.push(content);

        let keys = &self.rules.summary_fields;
        let pick = |field_keys: &[&str]| {
            first_text(&sources, field_keys).unwrap_or_else(|| NOT_SPECIFIED.to_string())
        };
        Summary {
            name: first_text(&sources, keys.name)
                .unwrap_or_else(|| display_name_from_key(&ctx.lookup_key)),
            industry: pick(keys.industry),
            target: pick(keys.target),
            description: pick(keys.description),
        }
    }

    fn build_item(&self, entry: &JsonValue, fallback_name: String) -> Option<ResultItem> {
        let keys = &self.rules.item_fields;
        let obj = match entry {
            JsonValue::String(name) if !name.trim().is_empty() => {
                let mut item = ResultItem::placeholder(name.trim());
                item.placeholder = false;
                return Some(item);
            }
            other => object_or_embedded(other)?,
        };
        let sources = [&obj];
        let pick = |field_keys: &[&str]| {
            first_text(&sources, field_keys).unwrap_or_else(|| NOT_SPECIFIED.to_string())
        };
        Some(ResultItem {
            name: first_text(&sources, keys.name).unwrap_or(fallback_name),
            target: pick(keys.target),
            objective: pick(keys.objective),
            kpi: pick(keys.kpi),
            scenarios: obj
                .get("scenarios")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default(),
            placeholder: false,
        })
    }

    fn build_items(&self, content: &Map<String, JsonValue>) -> Vec<ResultItem> {
        let Some(source) = self
            .rules
            .items_keys
            .iter()
            .filter_map(|k| content.get(*k))
            .find(|v| non_empty_collection(v))
        else {
            return Vec::new();
        };

        let placeholder = self.rules.placeholder_item_name;
        match source {
            JsonValue::Array(entries) => entries
                .iter()
                .enumerate()
                .filter_map(|(i, entry)| self.build_item(entry, format!("{placeholder} {}", i + 1)))
                .collect(),
            JsonValue::Object(entries) => entries
                .iter()
                .filter_map(|(key, entry)| self.build_item(entry, key.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn apply_enrichments(
        &self,
        raw: &Map<String, JsonValue>,
        content: &Map<String, JsonValue>,
        items: &mut [ResultItem],
    ) -> BTreeMap<String, JsonValue> {
        let mut enrichments = BTreeMap::new();
        // Content keys win over same-named top-level keys.
        for (key, value) in raw.iter().chain(content.iter()) {
            if let Some(index) = self.enrichment_index(key) {
                enrichments.insert(key.clone(), (index, value.clone()));
            }
        }

        let mut kept = BTreeMap::new();
        for (key, (index, value)) in enrichments {
            if let Some(item) = index.checked_sub(1).and_then(|i| items.get_mut(i)) {
                if let Some(details) = object_or_embedded(&value) {
                    if let Some(scenarios) = details.get("scenarios").and_then(JsonValue::as_array) {
                        item.scenarios = scenarios.clone();
                    }
                    let name_keys: &[&str] = &["program_name", "competitor_name", "name"];
                    if let Some(name) = first_text(&[&details], name_keys) {
                        item.name = name;
                    }
                }
            }
            kept.insert(key, value);
        }
        kept
    }
}

impl FlowAdapter for JsonFlowAdapter {
    fn flow(&self) -> Flow {
        self.rules.flow
    }

    fn contains_embedded_error(&self, resp: &JsonValue) -> bool {
        let text = match resp {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.phrases.find_in(&text).is_some()
    }

    fn has_minimum_shape(&self, resp: &JsonValue) -> bool {
        if self.remote_status(resp).as_deref().is_some_and(is_success_status) {
            return true;
        }
        if resp.as_object().is_some_and(|obj| self.shape_in(obj)) {
            return true;
        }
        resolve_content(resp).is_some_and(|content| self.shape_in(&content))
    }

    fn remote_status(&self, resp: &JsonValue) -> Option<String> {
        STATUS_PATHS
            .iter()
            .filter_map(|path| json_at(resp, path))
            .find_map(|v| v.as_str().map(|s| s.trim().to_string()))
    }

    fn normalize(
        &self,
        raw: &JsonValue,
        ctx: &NormalizeContext,
    ) -> Result<CanonicalResult, NormalizeError> {
        let Some(raw_obj) = raw.as_object() else {
            return Err(NormalizeError::MalformedPayload(format!(
                "expected a JSON object, found {}",
                json_type_name(raw)
            )));
        };
        let content = resolve_content(raw).ok_or(NormalizeError::MissingContent)?;

        let summary = self.build_summary(&content, ctx);
        let mut items = self.build_items(&content);
        let synthesized_items = items.is_empty();
        if synthesized_items {
            items.push(ResultItem::placeholder(self.rules.placeholder_item_name));
        }
        let enrichments = self.apply_enrichments(raw_obj, &content, &mut items);

        let correlation_id = CORRELATION_ID_PATHS
            .iter()
            .filter_map(|path| json_at(raw, path))
            .find_map(scalar_text);

        Ok(CanonicalResult {
            flow: self.rules.flow,
            summary,
            items,
            correlation_id,
            enrichments,
            synthesized_items,
        })
    }

    fn validate(&self, result: &CanonicalResult) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if result.summary.target == NOT_SPECIFIED {
            errors.push(ValidationError::new(
                "summary.target",
                "target audience is missing from the analysis",
            ));
        }
        if result.summary.industry == NOT_SPECIFIED {
            errors.push(ValidationError::new(
                "summary.industry",
                "industry is missing from the analysis",
            ));
        }
        if result.synthesized_items {
            errors.push(ValidationError::new(
                "items",
                format!(
                    "no {} entries in the analysis; a placeholder was added",
                    self.rules.flow
                ),
            ));
        }
        errors
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

pub fn rules_for_flow(flow: Flow) -> ShapeRules {
    match flow {
        Flow::Plan => PLAN_RULES,
        Flow::Competitor => COMPETITOR_RULES,
    }
}

pub fn plan_adapter() -> JsonFlowAdapter {
    JsonFlowAdapter::new(PLAN_RULES, Arc::new(ErrorPhrases::builtin()))
}

pub fn competitor_adapter() -> JsonFlowAdapter {
    JsonFlowAdapter::new(COMPETITOR_RULES, Arc::new(ErrorPhrases::builtin()))
}

pub fn adapter_for_flow(flow: Flow) -> Box<dyn FlowAdapter> {
    adapter_for_flow_with_phrases(flow, Arc::new(ErrorPhrases::builtin()))
}

pub fn adapter_for_flow_with_phrases(flow: Flow, phrases: Arc<ErrorPhrases>) -> Box<dyn FlowAdapter> {
    Box::new(JsonFlowAdapter::new(rules_for_flow(flow), phrases))
}
