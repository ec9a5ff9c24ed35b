/// Result Protocol - Wire Contract Between Driver and Host
///
/// **Contract:**
/// The grading driver writes a single JSON document to `result.json` in the
/// submission's working directory:
///
/// ```json
/// {"status": "success", "score": 100, "max_score": 100, "message": "...",
///  "output": "...", "debug_info": "..."}
/// ```
///
/// `status`, `score`, `max_score` and `message` are required, `output` and
/// `debug_info` optional. Instructor test code sets exactly these keys, so they
/// must never be renamed.
///
/// **Decoding Rules:**
/// - Missing file: `status=error`, message "no result produced", raw process output attached
/// - Malformed document: salvage whichever fields can still be read, default the rest
/// - Missing fields: status → error, score → 0, message → "field missing"
/// - `max_score` is fixed at 100 internally: missing, non-positive or non-finite
///   maxima become 100, so test code that leaves it out still scores
/// - Out-of-range scores: clamped into `[0, max_score]`
/// - Escaped unicode artifacts (`<U+00E9>`, `\u00e9`): re-decoded on a best-effort basis
///
/// Decoding never fails; the worst case is an error result describing what went wrong.

use crate::types::{clamp_score, ExecutionResult, ExecutionStatus, INTERNAL_MAX_SCORE};
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::Path;

pub const RESULT_FILE_NAME: &str = "result.json";
pub const TRANSCRIPT_FILE_NAME: &str = "transcript.txt";

pub const FIELD_MISSING: &str = "field missing";
pub const NO_RESULT_MESSAGE: &str = "no result produced";
pub const MALFORMED_MESSAGE: &str = "result document could not be parsed";
pub const UNDECODED_NOTE: &str = "[note: some escaped characters could not be decoded]";

/// Keep raw documents attached to diagnostics short
const RAW_DOCUMENT_PREVIEW_CHARS: usize = 2000;

#[derive(Serialize)]
struct WireResult<'a> {
    status: &'a str,
    score: f64,
    max_score: f64,
    message: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    output: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    debug_info: &'a str,
}

/// Serialize a result in the wire format.
///
/// Non-finite numbers are not representable in JSON and are written as 0.
pub fn encode(result: &ExecutionResult) -> Result<String> {
    let finite = |x: f64| if x.is_finite() { x } else { 0.0 };
    let wire = WireResult {
        status: result.status.as_str(),
        score: finite(result.score),
        max_score: finite(result.max_score),
        message: &result.message,
        output: &result.output,
        debug_info: &result.debug_info,
    };
    serde_json::to_string_pretty(&wire).context("Failed to serialize result document")
}

/// What was found at the result location after the process ended
#[derive(Debug)]
pub enum ResultFile {
    Missing,
    Unreadable(String),
    Decoded(ExecutionResult),
}

pub fn read_result_file(path: &Path) -> ResultFile {
    match fs::read(path) {
        Ok(bytes) => ResultFile::Decoded(decode(&String::from_utf8_lossy(&bytes))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => ResultFile::Missing,
        Err(e) => ResultFile::Unreadable(format!("{}: {}", path.display(), e)),
    }
}

/// Result for a run that ended without writing a result document
pub fn no_result(stdout: &str, stderr: &str) -> ExecutionResult {
    let mut output = String::from(stdout.trim_end());
    if !stderr.trim().is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(stderr.trim_end());
    }
    ExecutionResult::error(NO_RESULT_MESSAGE).with_output(repair_text(&output))
}

/// Decode a result document, tolerating anything the driver might have left behind
pub fn decode(text: &str) -> ExecutionResult {
    if let Some(map) = parse_document(text) {
        return Fields::from_map(&map).into_result();
    }

    let fields = Fields::salvage(text);
    if fields.is_empty() {
        tracing::warn!(length = text.len(), "Result document unreadable");
        return ExecutionResult::error(MALFORMED_MESSAGE).with_debug_info(preview(text));
    }

    tracing::warn!("Result document malformed; using salvaged fields");
    let mut result = fields.into_result();
    if result.debug_info.is_empty() {
        result.debug_info = format!("{}\n---\n{}", MALFORMED_MESSAGE, preview(text));
    }
    result
}

fn parse_document(text: &str) -> Option<Map<String, Value>> {
    let text = text.trim_start_matches('\u{feff}').trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        return Some(map);
    }

    // Stray prints around the document
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Fields {
    status: Option<String>,
    score: Option<f64>,
    max_score: Option<f64>,
    message: Option<String>,
    output: Option<String>,
    debug_info: Option<String>,
}

impl Fields {
    fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            status: map.get("status").and_then(value_as_text),
            score: map.get("score").and_then(value_as_number),
            max_score: map.get("max_score").and_then(value_as_number),
            message: map.get("message").and_then(value_as_text),
            output: map.get("output").and_then(value_as_text),
            debug_info: map.get("debug_info").and_then(value_as_text),
        }
    }

    /// Field-by-field recovery from a document that is not valid JSON
    fn salvage(text: &str) -> Self {
        Self {
            status: salvage_string(text, "status"),
            score: salvage_number(text, "score"),
            max_score: salvage_number(text, "max_score"),
            message: salvage_string(text, "message"),
            output: salvage_string(text, "output"),
            debug_info: salvage_string(text, "debug_info"),
        }
    }

    fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.score.is_none()
            && self.max_score.is_none()
            && self.message.is_none()
            && self.output.is_none()
            && self.debug_info.is_none()
    }

    fn into_result(self) -> ExecutionResult {
        let status = self
            .status
            .as_deref()
            .map(ExecutionStatus::from_wire)
            .unwrap_or(ExecutionStatus::Error);

        let max_score = match self.max_score {
            Some(max) if max.is_finite() && max > 0.0 => max,
            _ => INTERNAL_MAX_SCORE,
        };
        let score = clamp_score(self.score.unwrap_or(0.0), max_score);

        ExecutionResult {
            status,
            score,
            max_score,
            message: repair_text(&self.message.unwrap_or_else(|| FIELD_MISSING.to_string())),
            output: repair_text(&self.output.unwrap_or_default()),
            debug_info: repair_text(&self.debug_info.unwrap_or_default()),
        }
    }
}

fn value_as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Array(items) => items.first().and_then(value_as_number),
        _ => None,
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_as_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

fn salvage_string(text: &str, key: &str) -> Option<String> {
    let pattern = format!(r#""{}"\s*:\s*\[?\s*"((?:[^"\\]|\\.)*)""#, regex::escape(key));
    let re = Regex::new(&pattern).ok()?;
    let raw = re.captures(text)?.get(1)?.as_str();
    serde_json::from_str::<String>(&format!("\"{}\"", raw))
        .ok()
        .or_else(|| Some(raw.to_string()))
}

fn salvage_number(text: &str, key: &str) -> Option<f64> {
    let pattern = format!(
        r#""{}"\s*:\s*\[?\s*"?([-+]?(?:[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?|NaN|Inf|-Inf))"?"#,
        regex::escape(key)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)?.get(1)?.as_str().parse::<f64>().ok()
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(RAW_DOCUMENT_PREVIEW_CHARS).collect();
    if text.chars().count() > RAW_DOCUMENT_PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}

static R_UNICODE_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<U\+([0-9A-Fa-f]{4,6})>").expect("valid regex"));

static JSON_UNICODE_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\u([dD][89abAB][0-9a-fA-F]{2})\\u([dD][c-fC-F][0-9a-fA-F]{2})|\\u([0-9a-fA-F]{4})")
        .expect("valid regex")
});

/// Re-decode escaped unicode left behind by encoding mismatches.
///
/// `<U+XXXX>` comes from R printing under a non-UTF-8 locale; literal `\uXXXX`
/// comes from double-escaped serialization. Sequences that do not name a valid
/// scalar value are left untouched and a note is appended.
pub fn repair_text(text: &str) -> String {
    if !text.contains("<U+") && !text.contains("\\u") {
        return text.to_string();
    }

    let mut undecoded = false;

    let pass = R_UNICODE_ESCAPE.replace_all(text, |caps: &regex::Captures| {
        match u32::from_str_radix(&caps[1], 16).ok().and_then(char::from_u32) {
            Some(c) => c.to_string(),
            None => {
                undecoded = true;
                caps[0].to_string()
            }
        }
    });

    let pass = JSON_UNICODE_ESCAPE.replace_all(&pass, |caps: &regex::Captures| {
        let decoded = if let (Some(high), Some(low)) = (caps.get(1), caps.get(2)) {
            let high = u32::from_str_radix(high.as_str(), 16).unwrap_or(0);
            let low = u32::from_str_radix(low.as_str(), 16).unwrap_or(0);
            char::from_u32(0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00))
        } else {
            caps.get(3)
                .and_then(|m| u32::from_str_radix(m.as_str(), 16).ok())
                .and_then(char::from_u32)
        };
        match decoded {
            Some(c) => c.to_string(),
            None => {
                undecoded = true;
                caps[0].to_string()
            }
        }
    });

    let mut repaired = pass.into_owned();
    if undecoded {
        repaired.push('\n');
        repaired.push_str(UNDECODED_NOTE);
    }
    repaired
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let original = ExecutionResult::success(87.5, "3 of 4 cases passed")
            .with_output("case 1 ok\ncase 2 ok")
            .with_debug_info("trace");

        let decoded = decode(&encode(&original).unwrap());

        assert_eq!(decoded.status, original.status);
        assert_eq!(decoded.score, original.score);
        assert_eq!(decoded.max_score, original.max_score);
        assert_eq!(decoded.message, original.message);
        assert_eq!(decoded.output, original.output);
        assert_eq!(decoded.debug_info, original.debug_info);
    }

    #[test]
    fn test_round_trip_error_and_timeout() {
        for original in [
            ExecutionResult::error("Error in student code: boom"),
            ExecutionResult::timeout(std::time::Duration::from_secs(10)),
        ] {
            let decoded = decode(&encode(&original).unwrap());
            assert_eq!(decoded.status, original.status);
            assert_eq!(decoded.score, original.score);
            assert_eq!(decoded.max_score, original.max_score);
            assert_eq!(decoded.message, original.message);
        }
    }

    #[test]
    fn test_missing_fields_defaulted() {
        let result = decode(r#"{"score": 40}"#);

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.max_score, INTERNAL_MAX_SCORE);
        assert_eq!(result.score, 40.0);
        assert_eq!(result.message, FIELD_MISSING);
        assert!(result.output.is_empty());
    }

    #[test]
    fn test_out_of_range_scores_clamped() {
        let result = decode(
            r#"{"status": "success", "score": 250, "max_score": 100, "message": "too good"}"#,
        );
        assert_eq!(result.score, 100.0);

        let result = decode(
            r#"{"status": "success", "score": -12, "max_score": 100, "message": "negative"}"#,
        );
        assert_eq!(result.score, 0.0);

        let result = decode(
            r#"{"status": "success", "score": "NaN", "max_score": "Inf", "message": "bad"}"#,
        );
        assert_eq!(result.score, 0.0);
        assert_eq!(result.max_score, INTERNAL_MAX_SCORE);
    }

    #[test]
    fn test_missing_max_score_uses_internal_scale() {
        let result = decode(r#"{"status": "success", "score": 100, "message": "all passed"}"#);

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.max_score, INTERNAL_MAX_SCORE);
        assert_eq!(result.score, 100.0);
        assert_eq!(result.ratio(), 1.0);

        let result = decode(r#"{"status": "success", "score": 30, "max_score": 0, "message": "m"}"#);
        assert_eq!(result.max_score, INTERNAL_MAX_SCORE);
        assert_eq!(result.score, 30.0);
    }

    #[test]
    fn test_boxed_values_from_r() {
        let result = decode(
            r#"{"status": ["success"], "score": [75], "max_score": [100], "message": ["line one", "line two"]}"#,
        );

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.score, 75.0);
        assert_eq!(result.max_score, INTERNAL_MAX_SCORE);
        assert_eq!(result.message, "line one\nline two");
    }

    #[test]
    fn test_document_surrounded_by_noise() {
        let text = "Loading required package: dplyr\n{\"status\": \"success\", \"score\": 100, \"max_score\": 100, \"message\": \"ok\"}\n";
        let result = decode(text);

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.score, 100.0);
    }

    #[test]
    fn test_truncated_document_salvaged() {
        let text = r#"{"status": "success", "score": 50, "max_score": 100, "message": "half way", "output": "cut off he"#;
        let result = decode(text);

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.score, 50.0);
        assert_eq!(result.max_score, 100.0);
        assert_eq!(result.message, "half way");
        assert!(result.debug_info.contains(MALFORMED_MESSAGE));
    }

    #[test]
    fn test_garbage_document() {
        let result = decode("Segmentation fault (core dumped)");

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.message, MALFORMED_MESSAGE);
        assert!(result.debug_info.contains("Segmentation fault"));
    }

    #[test]
    fn test_unknown_status_is_error() {
        let result = decode(r#"{"status": "passed", "score": 100, "max_score": 100, "message": "m"}"#);
        assert_eq!(result.status, ExecutionStatus::Error);
    }

    #[test]
    fn test_repair_r_unicode_escapes() {
        assert_eq!(repair_text("caf<U+00E9>"), "café");
        assert_eq!(repair_text("<U+6D4B><U+8BD5>"), "测试");
    }

    #[test]
    fn test_repair_json_unicode_escapes() {
        assert_eq!(repair_text(r"caf\u00e9"), "café");
        assert_eq!(repair_text(r"\ud83d\ude00"), "😀");
    }

    #[test]
    fn test_repair_leaves_invalid_sequences_with_note() {
        let repaired = repair_text(r"lone \ud800 surrogate");
        assert!(repaired.starts_with(r"lone \ud800 surrogate"));
        assert!(repaired.ends_with(UNDECODED_NOTE));
    }

    #[test]
    fn test_repair_plain_text_untouched() {
        assert_eq!(repair_text("plain text"), "plain text");
    }

    #[test]
    fn test_read_result_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = read_result_file(&dir.path().join(RESULT_FILE_NAME));
        assert!(matches!(outcome, ResultFile::Missing));
    }

    #[test]
    fn test_read_result_file_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESULT_FILE_NAME);
        let mut bytes = br#"{"status": "success", "score": 100, "max_score": 100, "message": "ok "#.to_vec();
        bytes.push(0xff);
        bytes.extend_from_slice(br#""}"#);
        fs::write(&path, bytes).unwrap();

        match read_result_file(&path) {
            ResultFile::Decoded(result) => {
                assert_eq!(result.status, ExecutionStatus::Success);
                assert!(result.message.starts_with("ok"));
            }
            other => panic!("expected decoded result, got {:?}", other),
        }
    }

    #[test]
    fn test_no_result_keeps_process_output() {
        let result = no_result("partial stdout\n", "Error: boom\n");

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.message, NO_RESULT_MESSAGE);
        assert_eq!(result.output, "partial stdout\nError: boom");
    }
}
