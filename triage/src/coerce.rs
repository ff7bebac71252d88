//! Field-level coercion rules for permissive LLM output.
//!
//! Validators in this crate run in two stages: a permissive `Raw*` serde
//! shape where every field is an optional `serde_json::Value`, then a
//! `coerce` step that maps each raw field through one of the rules below.
//! Every rule is total: it returns an in-range value for any input.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Explicit priority code anywhere in the text, e.g. "P1" or "p 0 - blocker".
static PRIORITY_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bp\s*([0-3])\b").expect("PRIORITY_CODE regex should compile"));

/// First signed integer in a string, e.g. "4 - major" or "severity: 5/5".
static LEADING_INT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+").expect("LEADING_INT regex should compile"));

/// Lowercase and drop everything that is not a letter or digit.
///
/// `"Create_Bug-WorkItem"`, `"create bug work item"` and `"CreateBugWorkItem"`
/// all normalize to `"createbugworkitem"`.
pub fn normalize_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Case-insensitive match of a value against `(token, variant)` pairs.
///
/// Tokens are compared after [`normalize_token`]; non-string values and
/// unmatched strings yield `None`.
pub fn fold_enum<T: Copy>(value: Option<&Value>, table: &[(&str, T)]) -> Option<T> {
    let raw = value?.as_str()?;
    let needle = normalize_token(raw);
    table
        .iter()
        .find(|(token, _)| normalize_token(token) == needle)
        .map(|(_, variant)| *variant)
}

/// Extract a trimmed string. Numbers and booleans are rendered; null, arrays
/// and objects give `None`. Empty strings give `None`.
pub fn string_field(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Flatten one list item into a string.
///
/// Objects are reduced to their `name`, `description`, `text`, `title` or
/// `value` field (first non-empty wins) and otherwise stringified.
pub fn flatten_item(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Object(map) => ["name", "description", "text", "title", "value"]
            .iter()
            .find_map(|key| string_field(map.get(*key)))
            .or_else(|| Some(value.to_string())),
        other => Some(other.to_string()),
    }
}

/// Coerce a value into a list of strings.
///
/// A bare string becomes a one-element list; list items are flattened with
/// [`flatten_item`]; anything else is an empty list. Duplicates are dropped
/// while keeping first-seen order.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    let items: Vec<String> = match value {
        Some(Value::Array(items)) => items.iter().filter_map(flatten_item).collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    };
    dedupe(items)
}

/// Remove duplicates, keeping the first occurrence.
pub fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Read a number from a JSON number or a numeric-looking string.
pub fn number_field(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

/// Coerce a confidence into `[0, 1]`.
///
/// Values in `(1, 100]` are read as percentages. Anything unreadable is `0.0`.
pub fn confidence(value: Option<&Value>) -> f64 {
    match number_field(value) {
        Some(n) if n > 1.0 && n <= 100.0 => n / 100.0,
        Some(n) => n.clamp(0.0, 1.0),
        None => 0.0,
    }
}

/// Coerce a severity into `1..=5`.
///
/// Numbers are rounded and clamped; strings contribute their first integer
/// ("4 - major"); anything else defaults to 3.
pub fn severity(value: Option<&Value>) -> u8 {
    const DEFAULT_SEVERITY: i64 = 3;

    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64),
        Some(Value::String(s)) => LEADING_INT
            .find(s)
            .and_then(|m| m.as_str().parse::<i64>().ok()),
        _ => None,
    };

    parsed.unwrap_or(DEFAULT_SEVERITY).clamp(1, 5) as u8
}

/// Priority bucket inferred from free text. Returns the numeric level `0..=3`.
///
/// Explicit codes ("P1") win, then synonyms: critical/urgent/blocker → 0,
/// high → 1, low/minor → 3, everything else → 2. Bare numbers `0..=3` are
/// taken as the level.
pub fn priority_level(value: Option<&Value>) -> u8 {
    const DEFAULT_LEVEL: u8 = 2;

    let text = match value {
        Some(Value::Number(n)) => {
            return match n.as_u64() {
                Some(level @ 0..=3) => level as u8,
                _ => DEFAULT_LEVEL,
            };
        }
        Some(Value::String(s)) => s.to_lowercase(),
        _ => return DEFAULT_LEVEL,
    };

    if let Some(level) = PRIORITY_CODE
        .captures(&text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
    {
        return level;
    }

    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let mentions = |candidates: &[&str]| words.iter().any(|w| candidates.contains(w));

    if mentions(&["critical", "urgent", "blocker", "asap", "emergency", "highest"]) {
        0
    } else if mentions(&["high", "important", "major"]) {
        1
    } else if mentions(&["low", "lowest", "minor", "trivial"]) {
        3
    } else {
        DEFAULT_LEVEL
    }
}

/// Keep only object entries, dropping nulls. Non-objects become empty.
pub fn sparse_map(value: Option<&Value>) -> serde_json::Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => serde_json::Map::new(),
    }
}

/// Read a boolean from a JSON bool or a "true"/"yes" string.
pub fn bool_field(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "1"),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Size {
        Small,
        Large,
    }

    const SIZES: &[(&str, Size)] = &[("Small", Size::Small), ("Large", Size::Large)];

    #[test]
    fn fold_enum_ignores_case_and_separators() {
        assert_eq!(fold_enum(Some(&json!("SMALL")), SIZES), Some(Size::Small));
        assert_eq!(fold_enum(Some(&json!(" large ")), SIZES), Some(Size::Large));
        assert_eq!(fold_enum(Some(&json!("medium")), SIZES), None);
        assert_eq!(fold_enum(Some(&json!(3)), SIZES), None);
        assert_eq!(fold_enum(None, SIZES), None);
    }

    #[test]
    fn priority_synonyms() {
        assert_eq!(priority_level(Some(&json!("critical"))), 0);
        assert_eq!(priority_level(Some(&json!("URGENT!!"))), 0);
        assert_eq!(priority_level(Some(&json!("High"))), 1);
        assert_eq!(priority_level(Some(&json!("low"))), 3);
        assert_eq!(priority_level(Some(&json!("medium"))), 2);
        assert_eq!(priority_level(Some(&json!("whenever"))), 2);
    }

    #[test]
    fn priority_codes_and_numbers() {
        assert_eq!(priority_level(Some(&json!("P1"))), 1);
        assert_eq!(priority_level(Some(&json!("p0 - drop everything"))), 0);
        assert_eq!(priority_level(Some(&json!(3))), 3);
        assert_eq!(priority_level(Some(&json!(9))), 2);
        assert_eq!(priority_level(None), 2);
        assert_eq!(priority_level(Some(&json!(null))), 2);
    }

    #[test]
    fn severity_clamps_and_defaults() {
        assert_eq!(severity(Some(&json!(0))), 1);
        assert_eq!(severity(Some(&json!(-4))), 1);
        assert_eq!(severity(Some(&json!(9))), 5);
        assert_eq!(severity(Some(&json!(3.6))), 4);
        assert_eq!(severity(Some(&json!("4 - major"))), 4);
        assert_eq!(severity(Some(&json!("12"))), 5);
        assert_eq!(severity(Some(&json!("very bad"))), 3);
        assert_eq!(severity(Some(&json!([1]))), 3);
        assert_eq!(severity(None), 3);
    }

    #[test]
    fn confidence_reads_percentages_and_clamps() {
        assert_eq!(confidence(Some(&json!(0.7))), 0.7);
        assert_eq!(confidence(Some(&json!(85))), 0.85);
        assert_eq!(confidence(Some(&json!("0.4"))), 0.4);
        assert_eq!(confidence(Some(&json!(-1))), 0.0);
        assert_eq!(confidence(Some(&json!(250))), 1.0);
        assert_eq!(confidence(Some(&json!("sure"))), 0.0);
    }

    #[test]
    fn flatten_item_prefers_named_fields() {
        assert_eq!(flatten_item(&json!({"name": "x"})), Some("x".into()));
        assert_eq!(
            flatten_item(&json!({"description": "works offline"})),
            Some("works offline".into())
        );
        assert_eq!(flatten_item(&json!({"text": "t", "id": 3})), Some("t".into()));
        assert_eq!(flatten_item(&json!({"id": 3})), Some(r#"{"id":3}"#.into()));
        assert_eq!(flatten_item(&json!(7)), Some("7".into()));
        assert_eq!(flatten_item(&json!("  ")), None);
        assert_eq!(flatten_item(&json!(null)), None);
    }

    #[test]
    fn string_list_accepts_scalars_and_dedupes() {
        assert_eq!(string_list(Some(&json!("one"))), vec!["one"]);
        assert_eq!(
            string_list(Some(&json!(["a", {"name": "b"}, "a", null]))),
            vec!["a", "b"]
        );
        assert!(string_list(Some(&json!({"a": 1}))).is_empty());
        assert!(string_list(None).is_empty());
    }

    #[test]
    fn sparse_map_drops_nulls() {
        let map = sparse_map(Some(&json!({"browser": "Safari 17", "os": null})));
        assert_eq!(map.len(), 1);
        assert!(sparse_map(Some(&json!(["x"]))).is_empty());
    }

    #[test]
    fn bool_field_reads_common_spellings() {
        assert!(bool_field(Some(&json!(true))));
        assert!(bool_field(Some(&json!("Yes"))));
        assert!(!bool_field(Some(&json!("no"))));
        assert!(!bool_field(None));
    }
}
