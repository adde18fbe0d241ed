//! Extraction of `{code, explanation}` from raw model output.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::errors::PipelineError;

/// Source text and prose produced by the model for one instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedSource {
    pub code: String,
    pub explanation: String,
}

/// Parse the model's raw reply into a [`GeneratedSource`].
///
/// The reply should be a bare JSON object. Replies wrapped in markdown fences
/// or prose are accepted as long as one balanced object can be cut out of them.
pub fn parse_response(raw: &str) -> Result<GeneratedSource, PipelineError> {
    let object = parse_object(raw)?;

    let code = match object.get("code") {
        None | Some(Value::Null) => {
            return Err(PipelineError::MissingKey {
                key: "code",
                raw: raw.to_string(),
            });
        }
        Some(Value::String(code)) => code,
        Some(_) => {
            return Err(PipelineError::InvalidField {
                key: "code",
                raw: raw.to_string(),
            });
        }
    };

    let explanation = match object.get("explanation") {
        None | Some(Value::Null) => {
            warn!("model output has no explanation, defaulting to empty");
            String::new()
        }
        Some(Value::String(text)) => text.clone(),
        Some(_) => {
            return Err(PipelineError::InvalidField {
                key: "explanation",
                raw: raw.to_string(),
            });
        }
    };

    Ok(GeneratedSource {
        code: normalize_code(code),
        explanation,
    })
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, PipelineError> {
    let direct = serde_json::from_str::<Value>(raw.trim());
    if let Ok(Value::Object(object)) = direct {
        return Ok(object);
    }

    if let Some(candidate) = extract_json_object(raw)
        && let Ok(Value::Object(object)) = serde_json::from_str::<Value>(candidate)
    {
        return Ok(object);
    }

    let reason = match direct {
        Ok(_) => "top-level value is not an object".to_string(),
        Err(e) => e.to_string(),
    };
    Err(PipelineError::InvalidJson {
        raw: raw.to_string(),
        reason,
    })
}

/// Cut the first balanced `{...}` object out of `text`.
///
/// Braces inside JSON string literals are ignored, so source code carried in
/// a string value (`'}'`, `"{"`) does not end the object early.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Repair encoding artifacts in generated source text.
///
/// Strips leading byte-order marks, resolves textual escape sequences when the
/// model double-escaped its output (literal `\n` and no real line breaks), and
/// drops carriage returns at line ends. Applying it twice gives the same
/// result as once.
pub fn normalize_code(code: &str) -> String {
    let code = code.trim_start_matches('\u{feff}');

    let code = if !code.contains('\n') && code.contains("\\n") {
        let unescaped = unescape(code);
        // Only keep the rewrite if it actually produced line structure;
        // otherwise the backslashes were part of the program text.
        if unescaped.contains('\n') {
            unescaped
        } else {
            code.to_string()
        }
    } else {
        code.to_string()
    };

    code.split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join("\n")
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}
