//! Response recovery parser
//!
//! Models wrap JSON in Markdown, pad it with prose, cut it off mid-string
//! or slip into Python-style quoting. The parser runs an ordered list of
//! strategies over the raw response and stops at the first that yields an
//! extraction object:
//!
//! 1. strip Markdown code fences
//! 2. strict parse
//! 3. largest `{...}` span
//! 4. heuristic repair (trailing commas, unterminated strings, single quotes)
//! 5. `entities` / `relationships` arrays parsed on their own
//! 6. first balanced `{...}` block found by a brace-depth scan

use regex::Regex;
use serde_json::{Map, Value};
use vg_core::ParseStrategy;

/// Strategies tried after fence stripping
pub const STRATEGY_COUNT: usize = 6;

/// Characters of raw response kept for diagnostics
pub const SAMPLE_CHARS: usize = 500;

/// A successfully parsed model response
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    /// Always a JSON object
    pub value: Value,
    pub strategy: ParseStrategy,
}

/// Every strategy failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no recovery strategy produced an extraction object after {attempts} attempts")]
pub struct ParseFailure {
    pub attempts: usize,
    /// Leading part of the raw response
    pub sample: String,
}

impl From<ParseFailure> for vg_core::VgError {
    fn from(failure: ParseFailure) -> Self {
        vg_core::VgError::ParseError {
            attempts: failure.attempts,
            sample: failure.sample,
        }
    }
}

/// Multi-strategy parser for model output
pub struct RecoveryParser {
    fence: Regex,
    object_span: Regex,
    trailing_comma: Regex,
    single_quoted_key: Regex,
    single_quoted_value: Regex,
    entities_open: Regex,
    relationships_open: Regex,
    entities_lazy: Regex,
    relationships_lazy: Regex,
}

impl RecoveryParser {
    pub fn new() -> Self {
        let compile = |pattern: &str| Regex::new(pattern).expect("static pattern compiles");
        Self {
            fence: compile(r"(?s)```[ \t]*(?:json|JSON)?[ \t]*\r?\n?(.*?)```"),
            object_span: compile(r"(?s)\{.*\}"),
            trailing_comma: compile(r",(\s*[}\]])"),
            single_quoted_key: compile(r"'([^']*)':"),
            single_quoted_value: compile(r":\s*'([^']*)'"),
            entities_open: compile(r#""entities"\s*:\s*\["#),
            relationships_open: compile(r#""relationships"\s*:\s*\["#),
            entities_lazy: compile(r#"(?s)"entities"\s*:\s*\[(.*?)\]"#),
            relationships_lazy: compile(r#"(?s)"relationships"\s*:\s*\[(.*?)\]"#),
        }
    }

    /// Parse a raw model response
    pub fn parse(&self, raw: &str) -> Result<ParsedResponse, ParseFailure> {
        let text = self.strip_code_fences(raw.trim());

        if let Some(value) = parse_object(text) {
            return Ok(ParsedResponse {
                value,
                strategy: ParseStrategy::Direct,
            });
        }

        if let Some(value) = self.largest_object_span(text) {
            return Ok(recovered(value, ParseStrategy::ObjectSpan));
        }

        if let Some(value) = self.repair(text) {
            return Ok(recovered(value, ParseStrategy::Repaired));
        }

        if let Some(value) = self.array_fragments(text) {
            return Ok(recovered(value, ParseStrategy::ArrayFragments));
        }

        if let Some(value) = balanced_scan(text) {
            return Ok(recovered(value, ParseStrategy::BalancedScan));
        }

        tracing::warn!(
            attempts = STRATEGY_COUNT,
            "could not parse model response with any recovery strategy"
        );
        tracing::debug!(preview = %truncate_chars(raw, SAMPLE_CHARS), "unparseable response");

        Err(ParseFailure {
            attempts: STRATEGY_COUNT,
            sample: truncate_chars(raw, SAMPLE_CHARS),
        })
    }

    /// Strategy 1: keep the first fenced block that holds an object
    fn strip_code_fences<'a>(&self, text: &'a str) -> &'a str {
        if !text.contains("```") {
            return text;
        }
        self.fence
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
            .find(|block| block.starts_with('{'))
            .unwrap_or(text)
    }

    /// Strategy 3: first `{` to last `}`
    fn largest_object_span(&self, text: &str) -> Option<Value> {
        let span = self.object_span.find(text)?;
        parse_object(span.as_str()).filter(has_extraction_keys)
    }

    /// Strategy 4: repair common malformations, parse only if anything changed
    fn repair(&self, text: &str) -> Option<Value> {
        let fixed = self.fix_common_issues(text);
        if fixed == text {
            return None;
        }
        parse_object(&fixed)
            .or_else(|| {
                self.object_span
                    .find(&fixed)
                    .and_then(|m| parse_object(m.as_str()))
            })
            .filter(has_extraction_keys)
    }

    pub(crate) fn fix_common_issues(&self, text: &str) -> String {
        let text = self.trailing_comma.replace_all(text, "$1");

        let closed: Vec<String> = text
            .split('\n')
            .map(|line| {
                let trimmed = line.trim_end();
                let unterminated = line.contains("\":")
                    && line.matches('"').count() % 2 == 1
                    && !trimmed.ends_with('"')
                    && !trimmed.ends_with("\",");
                if unterminated {
                    format!("{trimmed}\"")
                } else {
                    line.to_string()
                }
            })
            .collect();
        let text = closed.join("\n");

        let text = self.single_quoted_key.replace_all(&text, "\"$1\":");
        self.single_quoted_value
            .replace_all(&text, ": \"$1\"")
            .into_owned()
    }

    /// Strategy 5: parse the two arrays independently
    fn array_fragments(&self, text: &str) -> Option<Value> {
        let entities = self.extract_array(text, &self.entities_open, &self.entities_lazy);
        let relationships =
            self.extract_array(text, &self.relationships_open, &self.relationships_lazy);

        if entities.is_none() && relationships.is_none() {
            return None;
        }

        let mut object = Map::new();
        object.insert(
            "entities".to_string(),
            Value::Array(entities.unwrap_or_default()),
        );
        object.insert(
            "relationships".to_string(),
            Value::Array(relationships.unwrap_or_default()),
        );
        Some(Value::Object(object))
    }

    fn extract_array(&self, text: &str, open: &Regex, lazy: &Regex) -> Option<Vec<Value>> {
        // Bracket-balanced body first, then the shortest `[...]`
        if let Some(m) = open.find(text) {
            let start = m.end() - 1;
            if let Some(end) = matching_close(text, start, b'[', b']') {
                if let Ok(Value::Array(items)) = serde_json::from_str(&text[start..=end]) {
                    return Some(items);
                }
            }
        }

        let body = lazy.captures(text)?.get(1)?.as_str();
        match serde_json::from_str(&format!("[{body}]")) {
            Ok(Value::Array(items)) => Some(items),
            _ => None,
        }
    }
}

impl Default for RecoveryParser {
    fn default() -> Self {
        Self::new()
    }
}

fn recovered(value: Value, strategy: ParseStrategy) -> ParsedResponse {
    tracing::debug!(%strategy, "recovered malformed model response");
    ParsedResponse { value, strategy }
}

fn parse_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn has_extraction_keys(value: &Value) -> bool {
    value.get("entities").is_some() || value.get("relationships").is_some()
}

/// Strategy 6: walk the text tracking depth and string state; return the
/// first balanced block that parses as an extraction object
fn balanced_scan(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &byte) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' if !in_string && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Some(value) = parse_object(&text[s..=i]) {
                            if has_extraction_keys(&value) {
                                return Some(value);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    None
}

/// Index of the bracket closing the one at `open_at`, skipping string contents
fn matching_close(text: &str, open_at: usize, open: u8, close: u8) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &byte) in bytes.iter().enumerate().skip(open_at) {
        if escaped {
            escaped = false;
            continue;
        }
        if byte == b'\\' && in_string {
            escaped = true;
        } else if byte == b'"' {
            in_string = !in_string;
        } else if !in_string && byte == open {
            depth += 1;
        } else if !in_string && byte == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }

    None
}

/// Truncate on a char boundary
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entity_names(value: &Value) -> Vec<String> {
        value["entities"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|e| e["name"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_plain_json() {
        let parser = RecoveryParser::new();
        let parsed = parser
            .parse(r#"{"entities": [{"name": "CAR-T Therapy", "type": "treatment"}], "relationships": []}"#)
            .unwrap();
        assert_eq!(parsed.strategy, ParseStrategy::Direct);
        assert_eq!(entity_names(&parsed.value), vec!["CAR-T Therapy"]);
    }

    #[test]
    fn test_markdown_fence_is_stripped() {
        let parser = RecoveryParser::new();
        let raw = "```json\n{\"entities\": [{\"name\": \"Lymphoma\", \"type\": \"condition\"}]}\n```";
        let parsed = parser.parse(raw).unwrap();
        assert_eq!(parsed.strategy, ParseStrategy::Direct);
        assert_eq!(entity_names(&parsed.value), vec!["Lymphoma"]);
    }

    #[test]
    fn test_fence_after_prose() {
        let parser = RecoveryParser::new();
        let raw = "Here you go:\n```\n{\"relationships\": []}\n```\nAnything else?";
        let parsed = parser.parse(raw).unwrap();
        assert_eq!(parsed.strategy, ParseStrategy::Direct);
        assert!(parsed.value["relationships"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_object_span_in_prose() {
        let parser = RecoveryParser::new();
        let raw = "Here is the extraction:\n{\"entities\": [{\"name\": \"Gridfinity\", \"type\": \"project\"}], \"relationships\": []}\nHope this helps!";
        let parsed = parser.parse(raw).unwrap();
        assert_eq!(parsed.strategy, ParseStrategy::ObjectSpan);
        assert_eq!(entity_names(&parsed.value), vec!["Gridfinity"]);
    }

    #[test]
    fn test_trailing_commas_repaired() {
        let parser = RecoveryParser::new();
        let raw = r#"{"entities": [{"name": "Fusion 360", "type": "technology"},], "relationships": [],}"#;
        let parsed = parser.parse(raw).unwrap();
        assert_eq!(parsed.strategy, ParseStrategy::Repaired);
        assert_eq!(entity_names(&parsed.value), vec!["Fusion 360"]);
    }

    #[test]
    fn test_single_quotes_repaired() {
        let parser = RecoveryParser::new();
        let raw = "{'entities': [{'name': 'Parametric Design', 'type': 'concept'}], 'relationships': []}";
        let parsed = parser.parse(raw).unwrap();
        assert_eq!(parsed.strategy, ParseStrategy::Repaired);
        assert_eq!(entity_names(&parsed.value), vec!["Parametric Design"]);
    }

    #[test]
    fn test_unterminated_string_closed_at_line_end() {
        let parser = RecoveryParser::new();
        let raw = "{\"entities\": [{\"name\": \"T Cells\", \"type\": \"concept\", \"properties\": {\"description\": \"modified immune cel\n}}], \"relationships\": []}";
        let parsed = parser.parse(raw).unwrap();
        assert_eq!(parsed.strategy, ParseStrategy::Repaired);
        assert_eq!(
            parsed.value["entities"][0]["properties"]["description"],
            "modified immune cel"
        );
    }

    #[test]
    fn test_array_fragment_in_prose() {
        let parser = RecoveryParser::new();
        let raw = "I found these: \"entities\": [{\"name\": \"Mortgage\", \"type\": \"concept\"}] and then ran out of room \"relationships\": [{\"source\": \"Mortgage\", \"target\"";
        let parsed = parser.parse(raw).unwrap();
        assert_eq!(parsed.strategy, ParseStrategy::ArrayFragments);
        assert_eq!(entity_names(&parsed.value), vec!["Mortgage"]);
        assert_eq!(parsed.value["relationships"], Value::Array(vec![]));
    }

    #[test]
    fn test_balanced_block_among_chatter() {
        let parser = RecoveryParser::new();
        let raw = "Draft: \"entities\": [ oops \"relationships\": [ oops\nFinal: {\"entities\": [{\"name\": \"Principal Residence\", \"type\": \"concept\"}], \"relationships\": []} (see {appendix})";
        let parsed = parser.parse(raw).unwrap();
        assert_eq!(parsed.strategy, ParseStrategy::BalancedScan);
        assert_eq!(entity_names(&parsed.value), vec!["Principal Residence"]);
    }

    #[test]
    fn test_balanced_scan_ignores_braces_in_strings() {
        let value = balanced_scan(
            r#"noise {"entities": [{"name": "a } b", "type": "x"}]} more {"#,
        )
        .unwrap();
        assert_eq!(value["entities"][0]["name"], "a } b");
    }

    #[test]
    fn test_unparseable_reports_failure() {
        let parser = RecoveryParser::new();
        let raw = "I'm sorry, I can't extract anything from this text.".repeat(20);
        let failure = parser.parse(&raw).unwrap_err();
        assert_eq!(failure.attempts, STRATEGY_COUNT);
        assert_eq!(failure.sample.chars().count(), SAMPLE_CHARS);
    }

    #[test]
    fn test_non_object_json_is_rejected() {
        let parser = RecoveryParser::new();
        assert!(parser.parse("[1, 2, 3]").is_err());
    }

    #[test]
    fn test_matching_close_skips_strings() {
        let text = r#"["a]", ["b"]] tail"#;
        assert_eq!(matching_close(text, 0, b'[', b']'), Some(12));
    }

    proptest! {
        #[test]
        fn parse_never_panics(raw in "\\PC{0,200}") {
            let parser = RecoveryParser::new();
            let _ = parser.parse(&raw);
        }

        #[test]
        fn prose_wrapped_objects_survive(prefix in "[a-zA-Z ]{0,40}", suffix in "[a-zA-Z .!]{0,40}") {
            let parser = RecoveryParser::new();
            let raw = format!("{prefix}{{\"entities\": [{{\"name\": \"X\"}}]}}{suffix}");
            let parsed = parser.parse(&raw).unwrap();
            prop_assert_eq!(entity_names(&parsed.value), vec!["X".to_string()]);
        }
    }
}
