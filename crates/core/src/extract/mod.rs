//! Field extraction and normalization
//!
//! Turns a URL-encoded beacon payload into typed fields plus the open map of
//! tenant-defined client parameters. Extraction is a pure function of the
//! payload: it never fails as a whole, and a field that cannot be decoded or
//! coerced is reported in [`ExtractedPayload::invalid_fields`] instead of
//! dropping the event.

mod catalog;

use std::collections::{BTreeMap, HashMap};

use beacon_schemas::{FieldKind, FieldValue, MatchType};
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;

use crate::fingerprint::FINGERPRINT_INPUTS;

pub use catalog::{
    field_spec, FieldDefault, FieldSpec, AUDIO_HASH, CANVAS_HASH, FIELD_CATALOG, FONT_LIST,
    WEBGL_RENDERER, WEBGL_SIGNATURE,
};

/// Client-parameter keys that carry an email candidate, in priority order
pub const EMAIL_PARAMETER_KEYS: &[&str] = &["email", "em", "user_email"];

/// Client-parameter keys that carry a phone candidate, in priority order
pub const PHONE_PARAMETER_KEYS: &[&str] = &["phone", "ph", "mobile"];

/// Extractor settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    /// Keys starting with this prefix are collected into the client-parameter map
    pub client_param_prefix: String,
    /// Payloads longer than this are cut at the nearest preceding pair boundary
    pub max_payload_bytes: usize,
    /// Text values are truncated to this many characters. Fingerprint inputs
    /// are exempt and only bounded by `max_payload_bytes`.
    pub max_text_chars: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            client_param_prefix: "cp_".to_string(),
            max_payload_bytes: 64 * 1024,
            max_text_chars: 2048,
        }
    }
}

/// Result of extracting one payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedPayload {
    /// Fields present in the payload, keyed by catalog key
    pub fields: BTreeMap<&'static str, FieldValue>,
    /// Tenant-defined parameters, prefix stripped
    pub client_parameters: BTreeMap<String, String>,
    /// Known fields whose value could not be coerced to the declared type
    pub invalid_fields: Vec<&'static str>,
    /// Whether the payload exceeded the size bound and was cut
    pub truncated: bool,
}

impl ExtractedPayload {
    /// Value of a field, or its declared default when absent
    pub fn get(&self, key: &str) -> FieldValue {
        match self.fields.get(key) {
            Some(value) => value.clone(),
            None => field_spec(key)
                .map(|spec| spec.default.value())
                .unwrap_or(FieldValue::Null),
        }
    }

    /// Text value of a field when present and non-blank
    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(FieldValue::as_text)
            .filter(|s| !s.trim().is_empty())
    }

    /// Typed attributes as a JSON object, only fields present in the payload
    pub fn attributes_json(&self) -> serde_json::Value {
        let map = self
            .fields
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }

    /// First non-blank match candidate found in the client parameters
    ///
    /// Email keys take precedence over phone keys. The returned value is
    /// trimmed and lowercased; full canonicalization happens in the resolver.
    pub fn match_candidate(&self) -> Option<(MatchType, String)> {
        let lookup = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| self.client_parameters.get(*key))
                .map(|value| value.trim())
                .find(|value| !value.is_empty())
                .map(str::to_lowercase)
        };

        lookup(EMAIL_PARAMETER_KEYS)
            .map(|email| (MatchType::Email, email))
            .or_else(|| lookup(PHONE_PARAMETER_KEYS).map(|phone| (MatchType::Phone, phone)))
    }
}

/// Payload extractor backed by the field catalog
#[derive(Debug, Clone)]
pub struct Extractor {
    config: ExtractorConfig,
    index: HashMap<&'static str, &'static FieldSpec>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(ExtractorConfig::default())
    }
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let index = FIELD_CATALOG.iter().map(|spec| (spec.key, spec)).collect();
        Self { config, index }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extract typed fields and client parameters from a payload
    ///
    /// For repeated keys the first occurrence wins.
    pub fn extract(&self, raw_payload: &str) -> ExtractedPayload {
        let mut out = ExtractedPayload::default();

        let payload = bound_payload(raw_payload, self.config.max_payload_bytes);
        out.truncated = payload.len() < raw_payload.len();

        for segment in payload.split('&').filter(|s| !s.is_empty()) {
            let (raw_key, raw_value) = segment.split_once('=').unwrap_or((segment, ""));
            let key = decode_component(raw_key);
            let value = decode_component(raw_value);

            if let Some(param) = key.strip_prefix(self.config.client_param_prefix.as_str()) {
                if !param.is_empty() {
                    out.client_parameters
                        .entry(param.to_string())
                        .or_insert_with(|| sanitize_text(&value, self.config.max_text_chars));
                }
                continue;
            }

            let Some(spec) = self.index.get(key.as_str()) else {
                continue;
            };
            if out.fields.contains_key(spec.key) {
                continue;
            }

            let max_chars = if FINGERPRINT_INPUTS.contains(&spec.key) {
                usize::MAX
            } else {
                self.config.max_text_chars
            };
            match coerce(spec.kind, &value, max_chars) {
                Some(typed) => {
                    out.fields.insert(spec.key, typed);
                }
                None => {
                    out.fields.insert(spec.key, FieldValue::Null);
                    out.invalid_fields.push(spec.key);
                }
            }
        }

        out
    }
}

/// Cut an oversized payload at the last `&` within the byte bound
fn bound_payload(payload: &str, max_bytes: usize) -> &str {
    if payload.len() <= max_bytes {
        return payload;
    }
    let mut end = max_bytes;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    let head = &payload[..end];
    if payload.as_bytes()[end] == b'&' {
        return head;
    }
    match head.rfind('&') {
        Some(pos) => &head[..pos],
        None => head,
    }
}

/// Decode one key or value (`+` is a space, `%XX` escapes)
///
/// Escapes that do not form valid UTF-8 fall back to the raw text of the
/// component so a single bad value never aborts the record.
fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match percent_decode_str(&spaced).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

/// Coerce a decoded value to a declared kind; `None` means invalid
///
/// Empty values are valid and become null.
fn coerce(kind: FieldKind, value: &str, max_text_chars: usize) -> Option<FieldValue> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Some(match kind {
            FieldKind::Text => FieldValue::Text(String::new()),
            _ => FieldValue::Null,
        });
    }

    match kind {
        FieldKind::Int => trimmed.parse::<i64>().ok().map(FieldValue::Int),
        FieldKind::Bool => parse_bool(trimmed).map(FieldValue::Bool),
        FieldKind::Decimal => trimmed
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(FieldValue::Decimal),
        FieldKind::Timestamp => parse_timestamp(trimmed).map(FieldValue::Timestamp),
        FieldKind::Text => Some(FieldValue::Text(sanitize_text(value, max_text_chars))),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "t" | "y" => Some(true),
        "0" | "false" | "no" | "off" | "f" | "n" => Some(false),
        _ => None,
    }
}

/// Epoch milliseconds or RFC 3339
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if value.bytes().all(|b| b.is_ascii_digit()) {
        let millis = value.parse::<i64>().ok()?;
        return DateTime::from_timestamp_millis(millis);
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Strip control characters and bound the length
///
/// Control characters never survive into text fields, which is what lets
/// the fingerprint hasher use one as its delimiter.
pub fn sanitize_text(value: &str, max_chars: usize) -> String {
    value
        .chars()
        .filter(|c| !c.is_control())
        .take(max_chars)
        .collect()
}
