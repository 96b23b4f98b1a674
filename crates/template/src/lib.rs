//! `template` crate — the `{{ … }}` / `{% … %}` template engine used for
//! runbook fields and `when` conditions.
//!
//! The surface is a small Jinja-flavoured subset:
//! - substitution: `{{ NAME }}`, dotted and indexed access (`{{ cfg.host }}`,
//!   `{{ hosts[0] }}`)
//! - filters: `default`, `upper`, `lower`, `join`, `length`, `trim`
//! - conditionals: `{% if … %} … {% elif … %} … {% else %} … {% endif %}`
//! - loops: `{% for x in xs %} … {% endfor %}`
//! - runtime predicates: `has_succeeded("id")`, `has_failed("id")`,
//!   `has_run("id")`, `is_skipped("id")` — resolved through a [`StatusProbe`]
//!   supplied by the caller.
//!
//! Values are `serde_json::Value` throughout; typed post-render coercion for
//! declared parameter types lives in [`coerce`].

pub mod ast;
pub mod coerce;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod template;

pub use coerce::{coerce, is_falsy_literal, VarType};
pub use error::{CoerceError, TemplateError};
pub use eval::{NullProbe, RenderContext, StatusProbe};
pub use template::Template;

/// Parse and render `source` in one step.
///
/// Convenience for one-shot fields; callers rendering the same template
/// repeatedly should hold on to a parsed [`Template`].
pub fn render_str(
    source: &str,
    ctx: &eval::RenderContext<'_>,
) -> Result<String, TemplateError> {
    Template::parse(source)?.render(ctx)
}
