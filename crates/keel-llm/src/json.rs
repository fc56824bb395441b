//! Tolerant JSON extraction from model output.
//!
//! Models wrap JSON in markdown fences, preamble text, or trailing prose.
//! `extract_json` finds the first complete object and parses it.

use serde_json::Value;

use crate::provider::ProviderError;

/// Extract a JSON object from raw model output.
///
/// Accepts, in order of preference: a ```json fenced block, a bare fenced
/// block, or the first `{...}` span balanced at the top level.
pub fn extract_json(content: &str) -> Result<Value, ProviderError> {
    let trimmed = content.trim();

    if let Some(block) = fenced_block(trimmed, "```json") {
        return parse(block);
    }
    if let Some(block) = fenced_block(trimmed, "```") {
        return parse(block);
    }
    if let Some(span) = balanced_object(trimmed) {
        return parse(span);
    }

    Err(ProviderError::Parse(format!(
        "no JSON object found in response ({} chars)",
        content.len()
    )))
}

fn parse(s: &str) -> Result<Value, ProviderError> {
    serde_json::from_str(s.trim())
        .map_err(|e| ProviderError::Parse(format!("invalid JSON: {}", e)))
}

fn fenced_block<'a>(content: &'a str, fence: &str) -> Option<&'a str> {
    let start = content.find(fence)? + fence.len();
    let end = content[start..].find("```")?;
    Some(&content[start..start + end])
}

/// First top-level balanced `{...}` span, string-literal aware.
fn balanced_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let bytes = content.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_object() {
        let v = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn json_fence() {
        let v = extract_json("Here you go:\n```json\n{\"a\": 1}\n```\nDone.").unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn plain_fence() {
        let v = extract_json("```\n{\"b\": true}\n```").unwrap();
        assert_eq!(v, json!({"b": true}));
    }

    #[test]
    fn object_with_surrounding_prose() {
        let v = extract_json("Sure! {\"answer\": \"yes {brace} inside\"} hope that helps").unwrap();
        assert_eq!(v["answer"], "yes {brace} inside");
    }

    #[test]
    fn nested_objects_balance() {
        let v = extract_json(r#"{"outer": {"inner": 2}} trailing"#).unwrap();
        assert_eq!(v["outer"]["inner"], 2);
    }

    #[test]
    fn no_json_is_an_error() {
        assert!(extract_json("I couldn't decide.").is_err());
    }
}
