//! Conversion between the flat field-list notation and schema trees.
//!
//! The flat notation is a comma-separated list of slash-delimited paths
//! (`id,name/first,name/last`). The tree form is a JSON-Schema object whose
//! non-terminal segments are `object` containers and whose terminal segments
//! are `string` leaves. Property order is insertion order.

use serde_json::{json, Map, Value};

use flowrun_core::types::value_to_text;

fn leaf() -> Value {
    json!({ "type": "string" })
}

fn container(properties: Map<String, Value>) -> Value {
    json!({ "type": "object", "properties": Value::Object(properties) })
}

fn is_container(schema: &Value) -> bool {
    schema.get("type").and_then(Value::as_str) == Some("object")
        || schema.get("properties").is_some()
}

fn properties(schema: &Value) -> Option<&Map<String, Value>> {
    schema.get("properties").and_then(Value::as_object)
}

/// Build a schema tree from a flat field list.
pub fn fields_to_schema(flat: &str) -> Value {
    let mut root = Map::new();
    for entry in flat.split(',') {
        let segments: Vec<&str> = entry
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if !segments.is_empty() {
            insert_path(&mut root, &segments);
        }
    }
    container(root)
}

fn insert_path(props: &mut Map<String, Value>, segments: &[&str]) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };

    if rest.is_empty() {
        // An existing container keeps its children.
        props.entry(head.to_string()).or_insert_with(leaf);
        return;
    }

    let child = props
        .entry(head.to_string())
        .or_insert_with(|| container(Map::new()));
    if !is_container(child) {
        *child = container(Map::new());
    }
    if let Some(obj) = child.as_object_mut() {
        let nested = obj
            .entry("properties")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(nested) = nested.as_object_mut() {
            insert_path(nested, rest);
        }
    }
}

/// Flatten a schema tree back to the comma-joined field list.
pub fn schema_to_fields(schema: &Value) -> String {
    let mut paths = Vec::new();
    collect_leaf_paths(schema, "", &mut paths);
    paths.join(",")
}

/// Slash-joined paths of every leaf, depth-first in property order.
pub fn leaf_paths(schema: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_leaf_paths(schema, "", &mut paths);
    paths
}

fn collect_leaf_paths(schema: &Value, prefix: &str, out: &mut Vec<String>) {
    let Some(props) = properties(schema) else {
        return;
    };
    for (name, child) in props {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        if is_container(child) {
            collect_leaf_paths(child, &path, out);
        } else {
            out.push(path);
        }
    }
}

/// Render a heading-per-property outline; depth N uses heading level N + 2.
pub fn schema_to_outline(schema: &Value) -> String {
    let mut sections = Vec::new();
    if let Some(title) = schema.get("title").and_then(Value::as_str) {
        sections.push(format!("# {title}"));
    }
    outline_level(schema, 0, &mut sections);
    sections.join("\n\n")
}

fn outline_level(schema: &Value, depth: usize, out: &mut Vec<String>) {
    let Some(props) = properties(schema) else {
        return;
    };
    for (name, child) in props {
        out.push(format!("{} {}", "#".repeat(depth + 2), name));
        if let Some(desc) = child.get("description").and_then(Value::as_str) {
            out.push(desc.to_string());
        }
        if is_container(child) {
            outline_level(child, depth + 1, out);
        }
    }
}

/// Pick the values at every schema leaf out of `value`, keyed by slash path.
///
/// Leaves missing from `value` are left out.
pub fn flatten_fields(value: &Value, schema: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    for path in leaf_paths(schema) {
        let mut current = Some(value);
        for segment in path.split('/') {
            current = current.and_then(|v| v.get(segment));
        }
        if let Some(found) = current {
            out.insert(path, found.clone());
        }
    }
    out
}

/// `path: value, path: value` rendering of a flattened view.
pub fn render_projection(fields: &Map<String, Value>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}: {}", k, value_to_text(v)))
        .collect::<Vec<_>>()
        .join(", ")
}
