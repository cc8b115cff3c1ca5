//! Strict and tolerant parsing of oracle output.
//!
//! [`parse_structured`] only strips lossless wrapping (surrounding prose, code
//! fences). [`repair`] additionally patches the two structural faults the oracle
//! produces most often, doubled quoting (`{""name"": ""value""}`) and trailing
//! commas, and accepts the result only if it deserializes into the expected
//! schema and is not an empty object.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Parse `text` as `T`, tolerating only code fences and text around the JSON object.
pub fn parse_structured<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let first_error = match decode::<T>(text.trim()) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };
    match extract_object(text) {
        Some(candidate) if candidate != text.trim() => decode::<T>(candidate),
        _ => Err(first_error),
    }
}

/// Best-effort structural repair. Returns `None` unless a repaired candidate
/// deserializes into `T`.
pub fn repair<T: DeserializeOwned>(text: &str) -> Option<T> {
    let base = extract_object(text).unwrap_or_else(|| text.trim());
    let collapsed = collapse_doubled_quotes(base);
    let candidates = [
        strip_trailing_commas(base),
        collapsed.clone(),
        strip_trailing_commas(&collapsed),
    ];
    candidates.iter().find_map(|candidate| decode::<T>(candidate).ok())
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    match &value {
        Value::Object(map) if map.is_empty() => return Err("empty JSON object".to_string()),
        Value::Object(_) => {}
        _ => return Err("expected a JSON object".to_string()),
    }
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// The slice from the first `{` to the last `}`, if any.
fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Collapse `""` to `"` unless it is a genuine empty string, i.e. it sits
/// between a value-opening token (`:`, `[`, `,`) and a value-closing token
/// (`,`, `}`, `]`).
pub fn collapse_doubled_quotes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '"' && chars.get(i + 1) == Some(&'"') {
            let before = chars[..i].iter().rev().find(|c| !c.is_whitespace());
            let after = chars[i + 2..].iter().find(|c| !c.is_whitespace());
            let empty_string = matches!(before, Some(':') | Some('[') | Some(','))
                && matches!(after, Some(',') | Some('}') | Some(']'));
            if empty_string {
                out.push_str("\"\"");
            } else {
                out.push('"');
            }
            i += 2;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Remove commas that directly precede `}` or `]`, ignoring string contents.
pub fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}
