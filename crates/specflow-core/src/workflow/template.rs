//! Template resolver: `{{path}}` placeholders plus `#each` / `#if` blocks.
//!
//! ```text
//! Implement {{task.title}} ({{taskIndex}}/{{taskCount}}).
//! {{#each review.issues}}
//! - [{{this.severity}}] {{this.description}} (#{{@index}})
//! {{/each}}
//! {{#if review.hasActionableIssues}}Fix the issues above.{{else}}Nothing to fix.{{/if}}
//! ```
//!
//! Resolved values never reintroduce template syntax: any `{{` inside a
//! resolved value is emitted as `\{{`, and `\{{` is always literal text.
//! A `{` at either edge of a value is emitted as `\{`, so a value can not
//! pair up with a neighbouring value or template text to open a placeholder.
//! Placeholders that do not resolve are left verbatim.

use serde_json::Value;

use crate::workflow::expression;

/// Path segments that are never traversed.
pub const RESERVED_SEGMENTS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Anything a dot-path can be resolved against.
pub trait Scope {
    /// Resolve a dot-separated path, e.g. `review.issues.0.severity`.
    fn lookup(&self, path: &str) -> Option<Value>;
}

impl Scope for Value {
    fn lookup(&self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        let (first, rest) = segments.split_first()?;
        if RESERVED_SEGMENTS.contains(first) {
            return None;
        }
        let root = self.as_object()?.get(*first)?;
        lookup_segments(root, rest)
    }
}

impl Scope for serde_json::Map<String, Value> {
    fn lookup(&self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        let (first, rest) = segments.split_first()?;
        if RESERVED_SEGMENTS.contains(first) {
            return None;
        }
        lookup_segments(self.get(*first)?, rest)
    }
}

/// Walk `segments` from `root`. Numeric segments index arrays; `length`
/// yields the size of arrays, strings and objects without such a key.
pub fn lookup_segments(root: &Value, segments: &[&str]) -> Option<Value> {
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() || RESERVED_SEGMENTS.contains(segment) {
            return None;
        }
        let next = match current {
            Value::Object(map) => match map.get(*segment) {
                Some(v) => Some(v),
                None if *segment == "length" && i == segments.len() - 1 => {
                    return Some(Value::from(map.len()));
                }
                None => None,
            },
            Value::Array(items) => {
                if *segment == "length" {
                    if i == segments.len() - 1 {
                        return Some(Value::from(items.len()));
                    }
                    return None;
                }
                segment.parse::<usize>().ok().and_then(|idx| items.get(idx))
            }
            Value::String(s) if *segment == "length" && i == segments.len() - 1 => {
                return Some(Value::from(s.chars().count()));
            }
            _ => None,
        };
        current = next?;
    }
    Some(current.clone())
}

/// Resolve a dot-path against a scope.
pub fn resolve(path: &str, scope: &dyn Scope) -> Option<Value> {
    scope.lookup(path.trim())
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Placeholder { path: String, raw: String },
    Each { path: String, body: Vec<Node> },
    If {
        condition: String,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

enum Frame {
    Each { path: String, body: Vec<Node> },
    If {
        condition: String,
        then: Vec<Node>,
        otherwise: Vec<Node>,
        in_else: bool,
    },
}

impl Frame {
    fn push(&mut self, node: Node) {
        match self {
            Frame::Each { body, .. } => body.push(node),
            Frame::If {
                then,
                otherwise,
                in_else,
                ..
            } => {
                if *in_else {
                    otherwise.push(node)
                } else {
                    then.push(node)
                }
            }
        }
    }

    fn close(self) -> Node {
        match self {
            Frame::Each { path, body } => Node::Each { path, body },
            Frame::If {
                condition,
                then,
                otherwise,
                ..
            } => Node::If {
                condition,
                then,
                otherwise,
            },
        }
    }
}

fn push_node(stack: &mut [Frame], root: &mut Vec<Node>, node: Node) {
    match stack.last_mut() {
        Some(frame) => frame.push(node),
        None => root.push(node),
    }
}

/// Parse leniently: stray closing tags stay as text, unclosed blocks close
/// at the end of the template.
fn parse(template: &str) -> Vec<Node> {
    let mut root = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let escaped = open > 0 && rest.as_bytes()[open - 1] == b'\\';
        if escaped {
            text.push_str(&rest[..open + 2]);
            rest = &rest[open + 2..];
            continue;
        }

        let Some(close_rel) = rest[open + 2..].find("}}") else {
            break;
        };
        text.push_str(&rest[..open]);
        let raw = &rest[open..open + 2 + close_rel + 2];
        let inner = rest[open + 2..open + 2 + close_rel].trim();
        rest = &rest[open + 2 + close_rel + 2..];

        if !text.is_empty() {
            push_node(&mut stack, &mut root, Node::Text(std::mem::take(&mut text)));
        }

        if let Some(path) = inner.strip_prefix("#each ") {
            stack.push(Frame::Each {
                path: path.trim().to_string(),
                body: Vec::new(),
            });
        } else if let Some(condition) = inner.strip_prefix("#if ") {
            stack.push(Frame::If {
                condition: condition.trim().to_string(),
                then: Vec::new(),
                otherwise: Vec::new(),
                in_else: false,
            });
        } else if inner == "else" && matches!(stack.last(), Some(Frame::If { .. })) {
            if let Some(Frame::If { in_else, .. }) = stack.last_mut() {
                *in_else = true;
            }
        } else if inner == "/each" && matches!(stack.last(), Some(Frame::Each { .. }))
            || inner == "/if" && matches!(stack.last(), Some(Frame::If { .. }))
        {
            if let Some(frame) = stack.pop() {
                push_node(&mut stack, &mut root, frame.close());
            }
        } else if inner.starts_with('#') || inner.starts_with('/') || inner == "else" {
            tracing::debug!("[Template] Unmatched block tag '{}' kept as text", raw);
            push_node(&mut stack, &mut root, Node::Text(raw.to_string()));
        } else {
            push_node(
                &mut stack,
                &mut root,
                Node::Placeholder {
                    path: inner.to_string(),
                    raw: raw.to_string(),
                },
            );
        }
    }

    text.push_str(rest);
    if !text.is_empty() {
        push_node(&mut stack, &mut root, Node::Text(text));
    }
    while let Some(frame) = stack.pop() {
        tracing::debug!("[Template] Unclosed block closed at end of template");
        push_node(&mut stack, &mut root, frame.close());
    }
    root
}

/// Scope for the body of an `#each` iteration.
struct EachFrame<'a> {
    parent: &'a dyn Scope,
    item: &'a Value,
    index: usize,
}

impl Scope for EachFrame<'_> {
    fn lookup(&self, path: &str) -> Option<Value> {
        if path == "@index" {
            return Some(Value::from(self.index));
        }
        if path == "this" {
            return Some(self.item.clone());
        }
        if let Some(field_path) = path.strip_prefix("this.") {
            let segments: Vec<&str> = field_path.split('.').collect();
            return lookup_segments(self.item, &segments);
        }
        self.parent.lookup(path)
    }
}

/// Text form of a resolved value, with template syntax escaped.
pub fn stringify(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        other => other.to_string(),
    };
    escape(&text)
}

/// Neutralize `{{` so data can never open a placeholder, alone or next to
/// whatever is rendered around it.
pub fn escape(text: &str) -> String {
    let mut escaped = text.replace("{{", "\\{{");
    if escaped.starts_with('{') {
        escaped.insert(0, '\\');
    }
    if escaped.ends_with('{') && !escaped.ends_with("\\{") && !escaped.ends_with("{{") {
        escaped.insert(escaped.len() - 1, '\\');
    }
    escaped
}

fn render_nodes(nodes: &[Node], scope: &dyn Scope, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Placeholder { path, raw } => match resolve(path, scope) {
                Some(value) => out.push_str(&stringify(&value)),
                None => {
                    tracing::debug!("[Template] Unresolved placeholder {}", raw);
                    out.push_str(raw);
                }
            },
            Node::Each { path, body } => {
                if let Some(Value::Array(items)) = resolve(path, scope) {
                    for (index, item) in items.iter().enumerate() {
                        let frame = EachFrame {
                            parent: scope,
                            item,
                            index,
                        };
                        render_nodes(body, &frame, out);
                    }
                }
            }
            Node::If {
                condition,
                then,
                otherwise,
            } => {
                let truthy = match expression::evaluate_truthy(condition, scope) {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!("[Template] Invalid #if condition '{}': {}", condition, e);
                        false
                    }
                };
                render_nodes(if truthy { then } else { otherwise }, scope, out);
            }
        }
    }
}

/// Render a template against a scope.
pub fn render(template: &str, scope: &dyn Scope) -> String {
    let nodes = parse(template);
    let mut out = String::with_capacity(template.len());
    render_nodes(&nodes, scope, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_placeholders() {
        let ctx = json!({
            "specPath": "docs/spec.md",
            "task": { "id": "T1", "title": "Add login" },
            "count": 3,
        });
        assert_eq!(
            render("Spec: {{specPath}}, task {{ task.id }} - {{task.title}} x{{count}}", &ctx),
            "Spec: docs/spec.md, task T1 - Add login x3"
        );
    }

    #[test]
    fn test_structured_values_are_serialized() {
        let ctx = json!({ "files": ["a.rs", "b.rs"] });
        let out = render("{{files}}", &ctx);
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed, json!(["a.rs", "b.rs"]));
    }

    #[test]
    fn test_unresolved_placeholder_is_kept() {
        let ctx = json!({});
        assert_eq!(render("Hello {{ missing.value }}!", &ctx), "Hello {{ missing.value }}!");
    }

    #[test]
    fn test_reserved_segments_are_refused() {
        let ctx = json!({ "obj": { "constructor": "x", "prototype": { "a": 1 } }, "__proto__": 1 });
        assert_eq!(resolve("obj.constructor", &ctx), None);
        assert_eq!(resolve("obj.prototype.a", &ctx), None);
        assert_eq!(resolve("__proto__", &ctx), None);
    }

    #[test]
    fn test_each_block_with_index_and_fields() {
        let ctx = json!({
            "review": { "issues": [
                { "severity": "critical", "description": "SQL injection" },
                { "severity": "minor", "description": "Typo" }
            ]}
        });
        let out = render(
            "{{#each review.issues}}{{@index}}:{{this.severity}}:{{this.description}};{{/each}}",
            &ctx,
        );
        assert_eq!(out, "0:critical:SQL injection;1:minor:Typo;");
    }

    #[test]
    fn test_each_over_scalars_uses_this() {
        let ctx = json!({ "names": ["a", "b"] });
        assert_eq!(render("{{#each names}}[{{this}}]{{/each}}", &ctx), "[a][b]");
    }

    #[test]
    fn test_if_else_block() {
        let ctx = json!({ "review": { "hasActionableIssues": false }, "items": [] });
        assert_eq!(
            render("{{#if review.hasActionableIssues}}fix{{else}}done{{/if}}", &ctx),
            "done"
        );
        assert_eq!(render("{{#if items}}some{{/if}}", &ctx), "");
    }

    #[test]
    fn test_injection_through_values_is_escaped() {
        let ctx = json!({ "title": "{{secret}}", "secret": "leaked" });
        let once = render("Title: {{title}}", &ctx);
        assert_eq!(once, "Title: \\{{secret}}");
        assert_eq!(render(&once, &ctx), once);
    }

    #[test]
    fn test_render_is_idempotent_once_resolved() {
        let ctx = json!({
            "a": "plain",
            "b": { "nested": "{{a}}" },
            "list": ["x", "{{y}}"]
        });
        let template = "{{a}} {{b}} {{#each list}}{{this}},{{/each}}";
        let once = render(template, &ctx);
        assert_eq!(render(&once, &ctx), once);
    }

    #[test]
    fn test_adjacent_values_cannot_form_a_placeholder() {
        let ctx = json!({ "a": "{", "b": "{secret}}", "secret": "LEAKED" });
        let once = render("{{a}}{{b}}", &ctx);
        assert_eq!(once, "\\{\\{secret}}");
        assert_eq!(render(&once, &ctx), once);

        let once = render("{{a}}{secret}}", &ctx);
        assert!(!once.contains("LEAKED"));
        assert_eq!(render(&once, &ctx), once);

        let ctx = json!({ "open": "x{", "tail": "{{secret}}", "secret": "LEAKED" });
        let once = render("{{open}}{{tail}} and {{open}}{{open}}", &ctx);
        assert_eq!(render(&once, &ctx), once);
        assert!(!render(&once, &ctx).contains("LEAKED"));
    }

    #[test]
    fn test_escape_edges() {
        assert_eq!(escape("{"), "\\{");
        assert_eq!(escape("{{"), "\\{{");
        assert_eq!(escape("a{"), "a\\{");
        assert_eq!(escape("{a"), "\\{a");
        assert_eq!(escape("a{b"), "a{b");
    }

    #[test]
    fn test_stray_closing_tag_is_text() {
        let ctx = json!({});
        assert_eq!(render("a {{/if}} b", &ctx), "a {{/if}} b");
    }

    #[test]
    fn test_length_lookup() {
        let ctx = json!({ "tasks": [1, 2, 3], "name": "abc" });
        assert_eq!(resolve("tasks.length", &ctx), Some(json!(3)));
        assert_eq!(resolve("name.length", &ctx), Some(json!(3)));
        assert_eq!(resolve("tasks.1", &ctx), Some(json!(2)));
    }
}
