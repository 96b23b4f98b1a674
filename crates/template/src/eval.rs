//! Expression evaluation against a render context.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::ast::{BinOp, Expr};
use crate::error::TemplateError;

/// Runtime node-status predicates available to templates.
///
/// The engine implements this over its in-flight run state; contexts that
/// have no run state (variable validation, field pre-rendering) use
/// [`NullProbe`].
pub trait StatusProbe: Send + Sync {
    fn has_succeeded(&self, node_id: &str) -> bool;
    fn has_failed(&self, node_id: &str) -> bool;
    fn has_run(&self, node_id: &str) -> bool;
    fn is_skipped(&self, node_id: &str) -> bool;
}

/// A probe that answers `false` to everything.
pub struct NullProbe;

impl StatusProbe for NullProbe {
    fn has_succeeded(&self, _node_id: &str) -> bool {
        false
    }
    fn has_failed(&self, _node_id: &str) -> bool {
        false
    }
    fn has_run(&self, _node_id: &str) -> bool {
        false
    }
    fn is_skipped(&self, _node_id: &str) -> bool {
        false
    }
}

/// Everything a render needs: the frozen variable map plus the status probe.
pub struct RenderContext<'a> {
    vars: &'a BTreeMap<String, Value>,
    probe: &'a dyn StatusProbe,
}

impl<'a> RenderContext<'a> {
    pub fn new(vars: &'a BTreeMap<String, Value>, probe: &'a dyn StatusProbe) -> Self {
        Self { vars, probe }
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn probe(&self) -> &dyn StatusProbe {
        self.probe
    }
}

/// Evaluator with a scope stack for loop variables.
pub struct Evaluator<'a> {
    ctx: &'a RenderContext<'a>,
    locals: Vec<(String, Value)>,
}

impl<'a> Evaluator<'a> {
    pub fn new(ctx: &'a RenderContext<'a>) -> Self {
        Self {
            ctx,
            locals: Vec::new(),
        }
    }

    pub fn push_local(&mut self, name: String, value: Value) {
        self.locals.push((name, value));
    }

    pub fn pop_local(&mut self) {
        self.locals.pop();
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        for (n, v) in self.locals.iter().rev() {
            if n == name {
                return Some(v.clone());
            }
        }
        self.ctx.var(name).cloned()
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value, TemplateError> {
        match expr {
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Int(v) => Ok(Value::from(*v)),
            Expr::Float(v) => Ok(Value::from(*v)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Var(name) => self
                .lookup(name)
                .ok_or_else(|| TemplateError::Undefined(name.clone())),
            Expr::Attr(base, name) => {
                let base = self.eval(base)?;
                match base {
                    Value::Object(map) => map.get(name).cloned().ok_or_else(|| {
                        TemplateError::Type(format!("no field '{name}' in object"))
                    }),
                    other => Err(TemplateError::Type(format!(
                        "cannot access '.{name}' on {}",
                        kind_name(&other)
                    ))),
                }
            }
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                match (&base, &index) {
                    (Value::Array(items), Value::Number(n)) => {
                        let i = n.as_i64().ok_or_else(|| {
                            TemplateError::Type("index must be an integer".into())
                        })?;
                        let len = items.len() as i64;
                        let i = if i < 0 { i + len } else { i };
                        if i < 0 || i >= len {
                            return Err(TemplateError::Type(format!(
                                "index {i} out of range for list of {len}"
                            )));
                        }
                        Ok(items[i as usize].clone())
                    }
                    (Value::Object(map), Value::String(key)) => {
                        map.get(key).cloned().ok_or_else(|| {
                            TemplateError::Type(format!("no key '{key}' in dict"))
                        })
                    }
                    _ => Err(TemplateError::Type(format!(
                        "cannot index {} with {}",
                        kind_name(&base),
                        kind_name(&index)
                    ))),
                }
            }
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::Array(out))
            }
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&self.eval(inner)?))),
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::from(-i))
                    } else if let Some(f) = n.as_f64() {
                        Ok(Value::from(-f))
                    } else {
                        Err(TemplateError::Type("cannot negate number".into()))
                    }
                }
                other => Err(TemplateError::Type(format!(
                    "cannot negate {}",
                    kind_name(&other)
                ))),
            },
            Expr::Bin(op, lhs, rhs) => self.eval_bin(*op, lhs, rhs),
            Expr::Filter(inner, name, args) => self.eval_filter(inner, name, args),
            Expr::Call(name, args) => self.eval_call(name, args),
        }
    }

    fn eval_bin(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value, TemplateError> {
        // Short-circuit logic first.
        match op {
            BinOp::And => {
                let l = self.eval(lhs)?;
                if !is_truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                let r = self.eval(rhs)?;
                return Ok(Value::Bool(is_truthy(&r)));
            }
            BinOp::Or => {
                let l = self.eval(lhs)?;
                if is_truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                let r = self.eval(rhs)?;
                return Ok(Value::Bool(is_truthy(&r)));
            }
            _ => {}
        }

        let l = self.eval(lhs)?;
        let r = self.eval(rhs)?;
        match op {
            BinOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
            BinOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let ord = compare(&l, &r)?;
                let pass = match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Gt => ord.is_gt(),
                    BinOp::Ge => ord.is_ge(),
                    _ => unreachable!(),
                };
                Ok(Value::Bool(pass))
            }
            BinOp::In => match (&l, &r) {
                (needle, Value::Array(items)) => {
                    Ok(Value::Bool(items.iter().any(|v| values_equal(v, needle))))
                }
                (Value::String(needle), Value::String(hay)) => {
                    Ok(Value::Bool(hay.contains(needle.as_str())))
                }
                (Value::String(key), Value::Object(map)) => {
                    Ok(Value::Bool(map.contains_key(key)))
                }
                _ => Err(TemplateError::Type(format!(
                    "'in' not supported between {} and {}",
                    kind_name(&l),
                    kind_name(&r)
                ))),
            },
            BinOp::Add => match (&l, &r) {
                (Value::String(a), Value::String(b)) => {
                    Ok(Value::String(format!("{a}{b}")))
                }
                _ => arith(op, &l, &r),
            },
            BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => arith(op, &l, &r),
            BinOp::And | BinOp::Or => unreachable!(),
        }
    }

    fn eval_filter(
        &mut self,
        inner: &Expr,
        name: &str,
        args: &[Expr],
    ) -> Result<Value, TemplateError> {
        // `default` must see through an undefined inner variable.
        if name == "default" {
            let fallback = args
                .first()
                .ok_or_else(|| TemplateError::Type("default() requires an argument".into()))?;
            return match self.eval(inner) {
                Ok(Value::Null) | Err(TemplateError::Undefined(_)) => self.eval(fallback),
                other => other,
            };
        }

        let value = self.eval(inner)?;
        match name {
            "upper" => match value {
                Value::String(s) => Ok(Value::String(s.to_uppercase())),
                other => Err(TemplateError::Type(format!(
                    "upper expects a string, got {}",
                    kind_name(&other)
                ))),
            },
            "lower" => match value {
                Value::String(s) => Ok(Value::String(s.to_lowercase())),
                other => Err(TemplateError::Type(format!(
                    "lower expects a string, got {}",
                    kind_name(&other)
                ))),
            },
            "trim" => match value {
                Value::String(s) => Ok(Value::String(s.trim().to_string())),
                other => Err(TemplateError::Type(format!(
                    "trim expects a string, got {}",
                    kind_name(&other)
                ))),
            },
            "join" => {
                let sep = match args.first() {
                    Some(arg) => match self.eval(arg)? {
                        Value::String(s) => s,
                        other => {
                            return Err(TemplateError::Type(format!(
                                "join separator must be a string, got {}",
                                kind_name(&other)
                            )))
                        }
                    },
                    None => String::new(),
                };
                match value {
                    Value::Array(items) => {
                        let parts: Vec<String> =
                            items.iter().map(value_to_string).collect();
                        Ok(Value::String(parts.join(&sep)))
                    }
                    other => Err(TemplateError::Type(format!(
                        "join expects a list, got {}",
                        kind_name(&other)
                    ))),
                }
            }
            "length" => {
                let len = match &value {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    other => {
                        return Err(TemplateError::Type(format!(
                            "length not defined for {}",
                            kind_name(other)
                        )))
                    }
                };
                Ok(Value::from(len as i64))
            }
            other => Err(TemplateError::UnknownFilter(other.to_string())),
        }
    }

    fn eval_call(&mut self, name: &str, args: &[Expr]) -> Result<Value, TemplateError> {
        let node_arg = |this: &mut Self| -> Result<String, TemplateError> {
            let arg = args.first().ok_or_else(|| {
                TemplateError::Type(format!("{name}() requires a node id argument"))
            })?;
            match this.eval(arg)? {
                Value::String(s) => Ok(s),
                other => Err(TemplateError::Type(format!(
                    "{name}() expects a string node id, got {}",
                    kind_name(&other)
                ))),
            }
        };

        match name {
            "has_succeeded" => {
                let id = node_arg(self)?;
                Ok(Value::Bool(self.ctx.probe().has_succeeded(&id)))
            }
            "has_failed" => {
                let id = node_arg(self)?;
                Ok(Value::Bool(self.ctx.probe().has_failed(&id)))
            }
            "has_run" => {
                let id = node_arg(self)?;
                Ok(Value::Bool(self.ctx.probe().has_run(&id)))
            }
            "is_skipped" => {
                let id = node_arg(self)?;
                Ok(Value::Bool(self.ctx.probe().is_skipped(&id)))
            }
            other => Err(TemplateError::UnknownFunction(other.to_string())),
        }
    }
}

/// Jinja-style truthiness: empty collections, empty strings, zero and null
/// are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Render a value into template output text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        return x.as_f64() == y.as_f64();
    }
    a == b
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, TemplateError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y)
                .ok_or_else(|| TemplateError::Type("numbers not comparable".into()))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(TemplateError::Type(format!(
            "cannot compare {} with {}",
            kind_name(a),
            kind_name(b)
        ))),
    }
}

fn arith(op: BinOp, l: &Value, r: &Value) -> Result<Value, TemplateError> {
    let (Value::Number(x), Value::Number(y)) = (l, r) else {
        return Err(TemplateError::Type(format!(
            "arithmetic needs numbers, got {} and {}",
            kind_name(l),
            kind_name(r)
        )));
    };

    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        let out = match op {
            BinOp::Add => a.checked_add(b),
            BinOp::Sub => a.checked_sub(b),
            BinOp::Mul => a.checked_mul(b),
            BinOp::Div => {
                if b == 0 {
                    return Err(TemplateError::Type("division by zero".into()));
                }
                a.checked_div(b)
            }
            BinOp::Rem => {
                if b == 0 {
                    return Err(TemplateError::Type("division by zero".into()));
                }
                a.checked_rem(b)
            }
            _ => unreachable!(),
        };
        return out
            .map(Value::from)
            .ok_or_else(|| TemplateError::Type("integer overflow".into()));
    }

    let (a, b) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
    let out = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Rem => a % b,
        _ => unreachable!(),
    };
    Ok(Value::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expr;
    use serde_json::json;

    fn eval_with(vars: &BTreeMap<String, Value>, src: &str) -> Result<Value, TemplateError> {
        let ctx = RenderContext::new(vars, &NullProbe);
        let mut ev = Evaluator::new(&ctx);
        ev.eval(&parse_expr(src)?)
    }

    #[test]
    fn variable_lookup_and_undefined() {
        let mut vars = BTreeMap::new();
        vars.insert("ENV".to_string(), json!("prod"));
        assert_eq!(eval_with(&vars, "ENV").unwrap(), json!("prod"));
        assert!(matches!(
            eval_with(&vars, "MISSING"),
            Err(TemplateError::Undefined(_))
        ));
    }

    #[test]
    fn default_filter_covers_undefined() {
        let vars = BTreeMap::new();
        assert_eq!(
            eval_with(&vars, "MISSING | default('x')").unwrap(),
            json!("x")
        );
    }

    #[test]
    fn default_filter_keeps_present_value() {
        let mut vars = BTreeMap::new();
        vars.insert("V".to_string(), json!("set"));
        assert_eq!(eval_with(&vars, "V | default('x')").unwrap(), json!("set"));
    }

    #[test]
    fn filters() {
        let mut vars = BTreeMap::new();
        vars.insert("s".to_string(), json!("  Hello  "));
        vars.insert("xs".to_string(), json!(["a", "b", "c"]));
        assert_eq!(eval_with(&vars, "s | trim | upper").unwrap(), json!("HELLO"));
        assert_eq!(eval_with(&vars, "xs | join(',')").unwrap(), json!("a,b,c"));
        assert_eq!(eval_with(&vars, "xs | length").unwrap(), json!(3));
    }

    #[test]
    fn numeric_comparison_across_int_float() {
        let vars = BTreeMap::new();
        assert_eq!(eval_with(&vars, "1 == 1.0").unwrap(), json!(true));
        assert_eq!(eval_with(&vars, "2 > 1.5").unwrap(), json!(true));
    }

    #[test]
    fn membership() {
        let mut vars = BTreeMap::new();
        vars.insert("xs".to_string(), json!([1, 2, 3]));
        assert_eq!(eval_with(&vars, "2 in xs").unwrap(), json!(true));
        assert_eq!(eval_with(&vars, "'el' in 'hello'").unwrap(), json!(true));
    }

    #[test]
    fn probe_functions() {
        struct FixedProbe;
        impl StatusProbe for FixedProbe {
            fn has_succeeded(&self, id: &str) -> bool {
                id == "build"
            }
            fn has_failed(&self, id: &str) -> bool {
                id == "deploy"
            }
            fn has_run(&self, _: &str) -> bool {
                true
            }
            fn is_skipped(&self, _: &str) -> bool {
                false
            }
        }
        let vars = BTreeMap::new();
        let ctx = RenderContext::new(&vars, &FixedProbe);
        let mut ev = Evaluator::new(&ctx);
        let e = parse_expr("has_succeeded('build') and has_failed('deploy')").unwrap();
        assert_eq!(ev.eval(&e).unwrap(), json!(true));
        let e = parse_expr("has_succeeded('deploy')").unwrap();
        assert_eq!(ev.eval(&e).unwrap(), json!(false));
    }

    #[test]
    fn short_circuit_avoids_undefined_rhs() {
        let vars = BTreeMap::new();
        assert_eq!(eval_with(&vars, "false and MISSING").unwrap(), json!(false));
        assert_eq!(eval_with(&vars, "true or MISSING").unwrap(), json!(true));
    }
}
