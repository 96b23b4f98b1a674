//! Template parsing and rendering.
//!
//! A template is plain text interleaved with `{{ expression }}` output
//! blocks and `{% tag %}` control blocks. Parsing produces a part tree that
//! can be rendered repeatedly against different contexts.

use serde_json::Value;

use crate::ast::Expr;
use crate::error::TemplateError;
use crate::eval::{is_truthy, value_to_string, Evaluator, RenderContext};
use crate::parser::parse_expr;

/// One node of the parsed template tree.
#[derive(Debug, Clone)]
enum TplNode {
    Text(String),
    Output(Expr),
    If {
        arms: Vec<(Expr, Vec<TplNode>)>,
        otherwise: Vec<TplNode>,
    },
    For {
        var: String,
        iter: Expr,
        body: Vec<TplNode>,
    },
}

/// A parsed template.
#[derive(Debug, Clone)]
pub struct Template {
    nodes: Vec<TplNode>,
}

impl Template {
    /// Parse `source` into a template tree.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let segments = scan(source)?;
        let mut builder = TreeBuilder { segments, pos: 0 };
        let (nodes, stop) = builder.parse_nodes(&[])?;
        if let Some((word, _, offset)) = stop {
            return Err(TemplateError::syntax(
                offset,
                format!("unexpected '{{% {word} %}}'"),
            ));
        }
        Ok(Self { nodes })
    }

    /// Render against `ctx`, producing the output text.
    pub fn render(&self, ctx: &RenderContext<'_>) -> Result<String, TemplateError> {
        let mut ev = Evaluator::new(ctx);
        let mut out = String::new();
        render_nodes(&self.nodes, &mut ev, &mut out)?;
        Ok(out)
    }

    /// `true` when the source contained no expressions or tags at all.
    pub fn is_literal(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| matches!(n, TplNode::Text(_)))
    }
}

fn render_nodes(
    nodes: &[TplNode],
    ev: &mut Evaluator<'_>,
    out: &mut String,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            TplNode::Text(text) => out.push_str(text),
            TplNode::Output(expr) => {
                let value = ev.eval(expr)?;
                out.push_str(&value_to_string(&value));
            }
            TplNode::If { arms, otherwise } => {
                let mut taken = false;
                for (cond, body) in arms {
                    if is_truthy(&ev.eval(cond)?) {
                        render_nodes(body, ev, out)?;
                        taken = true;
                        break;
                    }
                }
                if !taken {
                    render_nodes(otherwise, ev, out)?;
                }
            }
            TplNode::For { var, iter, body } => {
                let items = match ev.eval(iter)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(TemplateError::Type(format!(
                            "for-loop target must be a list, got {}",
                            match other {
                                Value::Null => "null",
                                Value::Bool(_) => "bool",
                                Value::Number(_) => "number",
                                Value::String(_) => "string",
                                Value::Object(_) => "dict",
                                Value::Array(_) => unreachable!(),
                            }
                        )))
                    }
                };
                for item in items {
                    ev.push_local(var.clone(), item);
                    let result = render_nodes(body, ev, out);
                    ev.pop_local();
                    result?;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Source scanning
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Segment {
    Text(String),
    /// Expression inside `{{ }}`, with the offset of the opening brace.
    Output(String, usize),
    /// Tag content inside `{% %}`, with the offset of the opening brace.
    Tag(String, usize),
}

fn scan(src: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = src;
    let mut offset = 0;

    loop {
        let open = match (rest.find("{{"), rest.find("{%")) {
            (None, None) => {
                if !rest.is_empty() {
                    segments.push(Segment::Text(rest.to_string()));
                }
                break;
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (Some(a), Some(b)) => a.min(b),
        };

        if open > 0 {
            segments.push(Segment::Text(rest[..open].to_string()));
        }

        let is_output = rest[open..].starts_with("{{");
        let close_marker = if is_output { "}}" } else { "%}" };
        let inner_start = open + 2;
        let close = rest[inner_start..].find(close_marker).ok_or_else(|| {
            TemplateError::syntax(offset + open, "unclosed template block")
        })?;

        let content = rest[inner_start..inner_start + close].trim().to_string();
        if is_output {
            segments.push(Segment::Output(content, offset + open));
        } else {
            segments.push(Segment::Tag(content, offset + open));
        }

        let consumed = inner_start + close + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    Ok(segments)
}

// ---------------------------------------------------------------------------
// Tree building
// ---------------------------------------------------------------------------

struct TreeBuilder {
    segments: Vec<Segment>,
    pos: usize,
}

type StopTag = (String, String, usize);

impl TreeBuilder {
    /// Parse nodes until one of `stop` tags (or end of input). Returns the
    /// nodes plus the stop tag that terminated them, if any.
    fn parse_nodes(
        &mut self,
        stop: &[&str],
    ) -> Result<(Vec<TplNode>, Option<StopTag>), TemplateError> {
        let mut nodes = Vec::new();

        while self.pos < self.segments.len() {
            let seg = &self.segments[self.pos];
            match seg {
                Segment::Text(text) => {
                    nodes.push(TplNode::Text(text.clone()));
                    self.pos += 1;
                }
                Segment::Output(expr_src, offset) => {
                    let offset = *offset;
                    let expr = parse_expr(expr_src).map_err(|e| reoffset(e, offset))?;
                    nodes.push(TplNode::Output(expr));
                    self.pos += 1;
                }
                Segment::Tag(content, offset) => {
                    let offset = *offset;
                    let (word, rest) = split_tag(content);
                    if stop.contains(&word.as_str()) {
                        self.pos += 1;
                        return Ok((nodes, Some((word, rest, offset))));
                    }
                    self.pos += 1;
                    match word.as_str() {
                        "if" => nodes.push(self.parse_if(&rest, offset)?),
                        "for" => nodes.push(self.parse_for(&rest, offset)?),
                        other => {
                            return Err(TemplateError::syntax(
                                offset,
                                format!("unknown tag '{other}'"),
                            ))
                        }
                    }
                }
            }
        }

        Ok((nodes, None))
    }

    fn parse_if(&mut self, cond_src: &str, offset: usize) -> Result<TplNode, TemplateError> {
        let mut arms = Vec::new();
        let mut otherwise = Vec::new();
        let mut cond = parse_expr(cond_src).map_err(|e| reoffset(e, offset))?;

        loop {
            let (body, stop) = self.parse_nodes(&["elif", "else", "endif"])?;
            match stop {
                Some((word, rest, tag_offset)) => match word.as_str() {
                    "elif" => {
                        arms.push((cond, body));
                        cond = parse_expr(&rest).map_err(|e| reoffset(e, tag_offset))?;
                    }
                    "else" => {
                        arms.push((cond, body));
                        let (else_body, stop2) = self.parse_nodes(&["endif"])?;
                        if stop2.is_none() {
                            return Err(TemplateError::syntax(offset, "unclosed 'if' block"));
                        }
                        otherwise = else_body;
                        break;
                    }
                    "endif" => {
                        arms.push((cond, body));
                        break;
                    }
                    _ => unreachable!(),
                },
                None => return Err(TemplateError::syntax(offset, "unclosed 'if' block")),
            }
        }

        Ok(TplNode::If { arms, otherwise })
    }

    fn parse_for(&mut self, header: &str, offset: usize) -> Result<TplNode, TemplateError> {
        let (var, iter_src) = header.split_once(" in ").ok_or_else(|| {
            TemplateError::syntax(offset, "expected '{% for NAME in EXPR %}'")
        })?;
        let var = var.trim();
        if var.is_empty()
            || !var
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_')
        {
            return Err(TemplateError::syntax(
                offset,
                format!("bad loop variable '{var}'"),
            ));
        }
        let iter = parse_expr(iter_src).map_err(|e| reoffset(e, offset))?;

        let (body, stop) = self.parse_nodes(&["endfor"])?;
        if stop.is_none() {
            return Err(TemplateError::syntax(offset, "unclosed 'for' block"));
        }

        Ok(TplNode::For {
            var: var.to_string(),
            iter,
            body,
        })
    }
}

fn split_tag(content: &str) -> (String, String) {
    match content.split_once(char::is_whitespace) {
        Some((word, rest)) => (word.to_string(), rest.trim().to_string()),
        None => (content.to_string(), String::new()),
    }
}

fn reoffset(err: TemplateError, base: usize) -> TemplateError {
    match err {
        TemplateError::Syntax { offset, message } => TemplateError::Syntax {
            offset: base + offset,
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::NullProbe;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn render(src: &str, vars: &[(&str, Value)]) -> Result<String, TemplateError> {
        let map: BTreeMap<String, Value> =
            vars.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let ctx = RenderContext::new(&map, &NullProbe);
        Template::parse(src)?.render(&ctx)
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(render("no templates here", &[]).unwrap(), "no templates here");
    }

    #[test]
    fn substitution() {
        assert_eq!(
            render("deploy.sh {{ ENV }}", &[("ENV", json!("prod"))]).unwrap(),
            "deploy.sh prod"
        );
    }

    #[test]
    fn substitution_with_default() {
        assert_eq!(
            render("region={{ REGION | default('eu-west-1') }}", &[]).unwrap(),
            "region=eu-west-1"
        );
    }

    #[test]
    fn conditional_blocks() {
        let src = "{% if ENV == 'prod' %}careful{% else %}relax{% endif %}";
        assert_eq!(render(src, &[("ENV", json!("prod"))]).unwrap(), "careful");
        assert_eq!(render(src, &[("ENV", json!("dev"))]).unwrap(), "relax");
    }

    #[test]
    fn elif_chain() {
        let src = "{% if N == 1 %}one{% elif N == 2 %}two{% else %}many{% endif %}";
        assert_eq!(render(src, &[("N", json!(1))]).unwrap(), "one");
        assert_eq!(render(src, &[("N", json!(2))]).unwrap(), "two");
        assert_eq!(render(src, &[("N", json!(9))]).unwrap(), "many");
    }

    #[test]
    fn for_loop() {
        let src = "{% for h in HOSTS %}ping {{ h }}; {% endfor %}";
        assert_eq!(
            render(src, &[("HOSTS", json!(["a", "b"]))]).unwrap(),
            "ping a; ping b; "
        );
    }

    #[test]
    fn nested_blocks() {
        let src =
            "{% for n in NS %}{% if n > 1 %}{{ n }}!{% endif %}{% endfor %}";
        assert_eq!(render(src, &[("NS", json!([1, 2, 3]))]).unwrap(), "2!3!");
    }

    #[test]
    fn undefined_variable_errors() {
        assert!(matches!(
            render("{{ NOPE }}", &[]),
            Err(TemplateError::Undefined(_))
        ));
    }

    #[test]
    fn unclosed_block_is_syntax_error() {
        assert!(matches!(
            Template::parse("{% if x %}oops"),
            Err(TemplateError::Syntax { .. })
        ));
        assert!(matches!(
            Template::parse("{{ x"),
            Err(TemplateError::Syntax { .. })
        ));
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(Template::parse("{% frobnicate %}").is_err());
    }

    #[test]
    fn is_literal_detection() {
        assert!(Template::parse("plain").unwrap().is_literal());
        assert!(!Template::parse("{{ x }}").unwrap().is_literal());
    }
}
