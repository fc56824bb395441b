//! Minimal prompt template engine.
//!
//! Supports `{{identifier}}` substitution and `{{#each name}}...{{/each}}`
//! iteration over string lists. Deliberately nothing else: no expressions, no
//! filters, no nested lookups. Prompts are data, not programs.

use std::collections::BTreeMap;

use tracing::warn;

/// A parsed template, ready to render repeatedly.
#[derive(Debug, Clone)]
pub struct TextTemplate {
    nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Var(String),
    Each { name: String, body: Vec<Node> },
}

/// Values available to a render call.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    vars: BTreeMap<String, String>,
    lists: BTreeMap<String, Vec<String>>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn set_list(mut self, name: impl Into<String>, items: Vec<String>) -> Self {
        self.lists.insert(name.into(), items);
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TemplateError {
    #[error("unterminated tag at offset {0}")]
    Unterminated(usize),
    #[error("unclosed each block: {0}")]
    UnclosedEach(String),
    #[error("unexpected close tag")]
    UnexpectedClose,
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl TextTemplate {
    /// Parse at construction time so render can never fail.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut stack: Vec<(Option<String>, Vec<Node>)> = vec![(None, Vec::new())];
        let mut rest = source;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                stack
                    .last_mut()
                    .unwrap()
                    .1
                    .push(Node::Text(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + open))?;
            let tag = after[..close].trim();

            if let Some(name) = tag.strip_prefix("#each ") {
                let name = valid_ident(name.trim())?;
                stack.push((Some(name), Vec::new()));
            } else if tag == "/each" {
                let (name, body) = stack.pop().ok_or(TemplateError::UnexpectedClose)?;
                let name = name.ok_or(TemplateError::UnexpectedClose)?;
                stack
                    .last_mut()
                    .ok_or(TemplateError::UnexpectedClose)?
                    .1
                    .push(Node::Each { name, body });
            } else {
                let name = valid_ident(tag)?;
                stack.last_mut().unwrap().1.push(Node::Var(name));
            }

            offset += open + 2 + close + 2;
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            stack.last_mut().unwrap().1.push(Node::Text(rest.to_string()));
        }

        if stack.len() != 1 {
            let (name, _) = stack.pop().unwrap();
            return Err(TemplateError::UnclosedEach(name.unwrap_or_default()));
        }

        Ok(Self {
            nodes: stack.pop().unwrap().1,
        })
    }

    pub fn render(&self, ctx: &TemplateContext) -> String {
        let mut out = String::new();
        render_nodes(&self.nodes, ctx, None, &mut out);
        out
    }
}

fn render_nodes(nodes: &[Node], ctx: &TemplateContext, item: Option<&str>, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Var(name) => {
                // `this` refers to the current each-item.
                if name == "this" {
                    if let Some(value) = item {
                        out.push_str(value);
                        continue;
                    }
                }
                match ctx.vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        warn!(identifier = %name, "template identifier missing, rendering empty");
                    }
                }
            }
            Node::Each { name, body } => {
                if let Some(items) = ctx.lists.get(name) {
                    for entry in items {
                        render_nodes(body, ctx, Some(entry), out);
                    }
                }
            }
        }
    }
}

fn valid_ident(s: &str) -> Result<String, TemplateError> {
    let ok = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' );
    if ok {
        Ok(s.to_string())
    } else {
        Err(TemplateError::InvalidIdentifier(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_variables() {
        let t = TextTemplate::parse("Hello {{name}}, intent: {{intent}}").unwrap();
        let ctx = TemplateContext::new().set("name", "Ada").set("intent", "billing");
        assert_eq!(t.render(&ctx), "Hello Ada, intent: billing");
    }

    #[test]
    fn missing_variable_renders_empty() {
        let t = TextTemplate::parse("a {{missing}} b").unwrap();
        assert_eq!(t.render(&TemplateContext::new()), "a  b");
    }

    #[test]
    fn each_blocks_iterate() {
        let t = TextTemplate::parse("rules:\n{{#each rules}}- {{this}}\n{{/each}}").unwrap();
        let ctx = TemplateContext::new()
            .set_list("rules", vec!["one".to_string(), "two".to_string()]);
        assert_eq!(t.render(&ctx), "rules:\n- one\n- two\n");
    }

    #[test]
    fn rejects_expressions() {
        assert!(matches!(
            TextTemplate::parse("{{a + b}}"),
            Err(TemplateError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            TextTemplate::parse("{{fn()}}"),
            Err(TemplateError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn rejects_unbalanced_blocks() {
        assert!(matches!(
            TextTemplate::parse("{{#each xs}}body"),
            Err(TemplateError::UnclosedEach(_))
        ));
        assert!(matches!(
            TextTemplate::parse("{{/each}}"),
            Err(TemplateError::UnexpectedClose)
        ));
    }
}
