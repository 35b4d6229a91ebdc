//! `{{token}}` expansion against the results of earlier nodes.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use flowrun_core::types::{value_to_text, ExecutionResult, NodeStatus};

const TOKEN_PATTERN: &str = r"\{\{\s*(.+?)\s*\}\}";

fn token_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(TOKEN_PATTERN).ok())
        .as_ref()
}

/// Everything a template can reference from one node's point of view.
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    /// Results recorded so far in this run.
    pub results: HashMap<String, ExecutionResult>,
    /// Direct predecessors of the host node, in positional order.
    pub predecessors: Vec<String>,
    /// Label → node id.
    pub aliases: HashMap<String, String>,
    /// The host node's resolved input text (`{{input}}`).
    pub input: String,
}

/// Expanded text plus any dependency warnings raised while expanding it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub text: String,
    pub warnings: Vec<String>,
}

impl VariableScope {
    /// Map a token base to a node id: positional index, then id, then label.
    fn lookup<'a>(&'a self, base: &'a str) -> Option<&'a str> {
        if let Ok(index) = base.parse::<usize>() {
            return index
                .checked_sub(1)
                .and_then(|i| self.predecessors.get(i))
                .map(String::as_str);
        }
        if self.results.contains_key(base) {
            return Some(base);
        }
        self.aliases.get(base).map(String::as_str)
    }
}

/// Expand every `{{token}}` in `text` in a single pass.
///
/// Unresolvable tokens (unknown, not yet run, skipped) are left verbatim and
/// reported as warnings. Tokens that point at a failed node expand to an empty
/// string, also with a warning.
pub fn resolve(text: &str, scope: &VariableScope) -> Resolved {
    let mut warnings = Vec::new();
    let Some(pattern) = token_pattern() else {
        return Resolved {
            text: text.to_string(),
            warnings: vec!["token pattern failed to compile; text left unexpanded".into()],
        };
    };

    let expanded = pattern.replace_all(text, |caps: &Captures<'_>| {
        let raw = &caps[0];
        let token = &caps[1];

        if token == "input" {
            return scope.input.clone();
        }

        let (base, path) = match token.split_once('.') {
            Some((base, path)) => (base, Some(path)),
            None => (token, None),
        };

        let Some(result) = scope.lookup(base).and_then(|id| scope.results.get(id)) else {
            warnings.push(format!("unresolved reference {raw}: no such node"));
            return raw.to_string();
        };

        match result.status {
            NodeStatus::Success => match path {
                Some(path) => field_text(result, path),
                None => result.output_text(),
            },
            NodeStatus::Error => {
                warnings.push(format!(
                    "reference {raw} points at failed node {}; substituted empty text",
                    result.node_id
                ));
                String::new()
            }
            status => {
                warnings.push(format!(
                    "unresolved reference {raw}: node {} is {status}",
                    result.node_id
                ));
                raw.to_string()
            }
        }
    });

    Resolved {
        text: expanded.into_owned(),
        warnings,
    }
}

/// Text for `{{node.path}}`; falls back to the whole output when the field is absent.
fn field_text(result: &ExecutionResult, path: &str) -> String {
    if let Some(fields) = &result.fields {
        let key = path.replace('.', "/");
        if let Some(value) = fields.get(&key).or_else(|| fields.get(path)) {
            return value_to_text(value);
        }
    }

    let parsed;
    let root = match &result.output {
        serde_json::Value::String(s) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(v) if v.is_object() => {
                parsed = v;
                &parsed
            }
            _ => return result.output_text(),
        },
        other => other,
    };

    let mut current = root;
    for segment in path.split(|c| c == '.' || c == '/') {
        let next = match current {
            serde_json::Value::Object(map) => map.get(segment),
            serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return result.output_text(),
        }
    }
    value_to_text(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn done(id: &str, output: serde_json::Value) -> ExecutionResult {
        let mut r = ExecutionResult::pending(id);
        r.status = NodeStatus::Success;
        r.output = output;
        r
    }

    fn scope(results: Vec<ExecutionResult>, predecessors: &[&str]) -> VariableScope {
        VariableScope {
            results: results.into_iter().map(|r| (r.node_id.clone(), r)).collect(),
            predecessors: predecessors.iter().map(|s| s.to_string()).collect(),
            aliases: HashMap::new(),
            input: "the input".into(),
        }
    }

    #[test]
    fn text_without_tokens_is_unchanged() {
        let s = scope(vec![], &[]);
        let text = "plain {text} with { braces } and }} stray";
        let out = resolve(text, &s);
        assert_eq!(out.text, text);
        assert!(out.warnings.is_empty());
        assert_eq!(resolve(&out.text, &s).text, text);
    }

    #[test]
    fn bare_and_dotted_tokens() {
        let s = scope(
            vec![
                done("writer", json!("draft")),
                done("meta", json!({"topic": "rust", "author": {"name": "Ana"}})),
            ],
            &[],
        );
        let out = resolve("{{writer}} on {{ meta.topic }} by {{meta.author.name}}", &s);
        assert_eq!(out.text, "draft on rust by Ana");
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn every_occurrence_replaced_once() {
        let s = scope(vec![done("a", json!("{{a}}"))], &[]);
        let out = resolve("{{a}}-{{a}}", &s);
        // Substituted text is not rescanned.
        assert_eq!(out.text, "{{a}}-{{a}}");
        let s = scope(vec![done("a", json!("x"))], &[]);
        assert_eq!(resolve("{{a}}{{a}}{{a}}", &s).text, "xxx");
    }

    #[test]
    fn positional_tokens_follow_edge_order() {
        let s = scope(
            vec![done("zeta", json!("first")), done("alpha", json!({"k": 2}))],
            &["zeta", "alpha"],
        );
        assert_eq!(resolve("{{1}} / {{2.k}}", &s).text, "first / 2");
        let out = resolve("{{3}}", &s);
        assert_eq!(out.text, "{{3}}");
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn alias_lookup() {
        let mut s = scope(vec![done("n42", json!("hello"))], &[]);
        s.aliases.insert("Greeter".into(), "n42".into());
        assert_eq!(resolve("{{Greeter}}", &s).text, "hello");
    }

    #[test]
    fn missing_field_falls_back_to_whole_output() {
        let s = scope(vec![done("a", json!({"x": 1}))], &[]);
        assert_eq!(resolve("{{a.y}}", &s).text, r#"{"x":1}"#);
        let s = scope(vec![done("t", json!("just text"))], &[]);
        assert_eq!(resolve("{{t.field}}", &s).text, "just text");
    }

    #[test]
    fn json_text_output_is_navigable() {
        let s = scope(vec![done("m", json!(r#"{"score": 9}"#))], &[]);
        assert_eq!(resolve("{{m.score}}", &s).text, "9");
    }

    #[test]
    fn fields_view_takes_slash_paths() {
        let mut r = done("csv", json!({"name": {"first": "Ada"}}));
        let mut fields = serde_json::Map::new();
        fields.insert("name/first".into(), json!("Ada"));
        r.fields = Some(fields);
        let s = scope(vec![r], &[]);
        assert_eq!(resolve("{{csv.name.first}}", &s).text, "Ada");
    }

    #[test]
    fn unresolved_tokens_stay_and_warn() {
        let mut skipped = ExecutionResult::pending("later");
        skipped.status = NodeStatus::Skipped;
        let s = scope(vec![skipped], &[]);
        let out = resolve("a {{later}} b {{ghost}}", &s);
        assert_eq!(out.text, "a {{later}} b {{ghost}}");
        assert_eq!(out.warnings.len(), 2);
        assert!(out.warnings[0].contains("skipped"));
    }

    #[test]
    fn failed_reference_becomes_empty() {
        let mut failed = ExecutionResult::pending("bad");
        failed.status = NodeStatus::Error;
        failed.error = Some("boom".into());
        let s = scope(vec![failed], &[]);
        let out = resolve("[{{bad}}][{{bad.field}}]", &s);
        assert_eq!(out.text, "[][]");
        assert_eq!(out.warnings.len(), 2);
    }

    #[test]
    fn input_token() {
        let s = scope(vec![], &[]);
        assert_eq!(resolve("<{{input}}>", &s).text, "<the input>");
    }
}
