//! `{{ }}` templating over JEXL expressions.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered transforms. Two entry
//! points share one syntax: [`Templater::render`] substitutes every
//! placeholder into a string, [`Templater::evaluate`] returns the native
//! value when a field is a single expression.
//!
//! Context data is always passed as the evaluation context object, never
//! spliced into expression text.

use jexl_eval::error::EvaluationError;
use serde_json::{json, Map, Value};

/// Distinct undefined roots bound to null before an expression is rejected.
const MAX_UNDEFINED_ROOTS: usize = 32;

/// Malformed template syntax. Undefined lookups are never an error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated '{{{{' at byte {position}")]
    Unterminated { position: usize },

    #[error("empty expression in template")]
    EmptyExpression,

    #[error("invalid expression '{expr}': {message}")]
    Eval { expr: String, message: String },
}

/// One piece of a parsed template.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = template;
    let mut offset = 0;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Text(&rest[..open]));
        }
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or(TemplateError::Unterminated {
            position: offset + open,
        })?;
        let expr = after[..close].trim();
        if expr.is_empty() {
            return Err(TemplateError::EmptyExpression);
        }
        segments.push(Segment::Expr(expr));

        let consumed = open + 2 + close + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

/// JEXL-backed template engine with the standard transforms registered.
///
/// Holds no mutable state; one instance is shared by every branch of every
/// run.
pub struct Templater {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl Templater {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::Array(items)) => {
                        let needle = args.get(1).cloned().unwrap_or(Value::Null);
                        items.contains(&needle)
                    }
                    Some(Value::String(subject)) => {
                        let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                        subject.contains(search)
                    }
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("match", |args: &[Value]| {
                // Substring match, not regex.
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let pattern = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(pattern)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len))
            })
            .with_transform("json", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(val.to_string()))
            })
            .with_transform("default", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                if val.is_null() {
                    Ok(args.get(1).cloned().unwrap_or(Value::Null))
                } else {
                    Ok(val)
                }
            });

        Self { evaluator }
    }

    /// Evaluate a bare JEXL expression to its native value.
    ///
    /// Undefined root identifiers read as null: each one is bound to null in
    /// a copy of the context and the expression is evaluated again.
    pub fn eval(&self, expr: &str, ctx: &Value) -> Result<Value, TemplateError> {
        let mut seeded: Option<Value> = None;
        for _ in 0..=MAX_UNDEFINED_ROOTS {
            let scope = seeded.as_ref().unwrap_or(ctx);
            match self.evaluator.eval_in_context(expr, scope) {
                Ok(value) => return Ok(normalize_numbers(value)),
                Err(EvaluationError::UndefinedIdentifier(name)) => {
                    let scope = seeded.get_or_insert_with(|| ctx.clone());
                    let Some(fields) = scope
                        .as_object_mut()
                        .filter(|fields| !fields.contains_key(&name))
                    else {
                        return Err(eval_error(expr, format!("undefined identifier '{name}'")));
                    };
                    fields.insert(name, Value::Null);
                }
                Err(e) => return Err(eval_error(expr, e.to_string())),
            }
        }
        Err(eval_error(expr, "too many undefined identifiers".to_string()))
    }

    /// Substitute every `{{ expr }}` in `template`.
    ///
    /// Null renders empty, strings render raw, anything else as compact JSON.
    pub fn render(&self, template: &str, ctx: &Value) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        for segment in parse(template)? {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(expr) => out.push_str(&stringify(&self.eval(expr, ctx)?)),
            }
        }
        Ok(out)
    }

    /// Evaluate a field to its native value.
    ///
    /// A field that is exactly one `{{ expr }}`, or contains no placeholder
    /// at all, is evaluated as an expression. Mixed text is rendered.
    pub fn evaluate(&self, expr: &str, ctx: &Value) -> Result<Value, TemplateError> {
        let segments = parse(expr.trim())?;
        match segments.as_slice() {
            [Segment::Expr(inner)] => self.eval(inner, ctx),
            [Segment::Text(bare)] => self.eval(bare, ctx),
            [] => Err(TemplateError::EmptyExpression),
            _ => self.render(expr, ctx).map(Value::String),
        }
    }

    /// Guard evaluation with JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expr: &str, ctx: &Value) -> Result<bool, TemplateError> {
        self.evaluate(expr, ctx).map(|v| truthy(&v))
    }

    /// Render a structured value: whole-placeholder strings keep the native
    /// type, mixed strings are rendered, strings without placeholders and
    /// non-string scalars pass through.
    pub fn render_value(&self, value: &Value, ctx: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => {
                if !s.contains("{{") {
                    return Ok(value.clone());
                }
                match parse(s.trim())?.as_slice() {
                    [Segment::Expr(inner)] => self.eval(inner, ctx),
                    _ => self.render(s, ctx).map(Value::String),
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (key, field) in fields {
                    out.insert(key.clone(), self.render_value(field, ctx)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

impl Default for Templater {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Templater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Templater").finish_non_exhaustive()
    }
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JEXL arithmetic yields floats; integral results are turned back into
/// integers so `1 + 1` renders as `2`.
fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => json!(f as i64),
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, normalize_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

fn eval_error(expr: &str, message: String) -> TemplateError {
    TemplateError::Eval {
        expr: expr.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Value {
        json!({
            "name": "Ada",
            "count": 3,
            "tags": ["a", "b"],
            "user": { "email": "ada@example.com", "admin": true },
            "steps": { "par.b": { "ok": true } },
            "empty": ""
        })
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let t = Templater::new();
        assert_eq!(
            t.render("Hello {{ name }}, you have {{ count }} items", &ctx()).unwrap(),
            "Hello Ada, you have 3 items"
        );
    }

    #[test]
    fn test_render_undefined_is_empty() {
        let t = Templater::new();
        assert_eq!(t.render("[{{ missing }}]", &ctx()).unwrap(), "[]");
        assert_eq!(t.render("[{{ user.missing.deeper }}]", &ctx()).unwrap(), "[]");
    }

    #[test]
    fn test_undefined_roots_read_as_null() {
        let t = Templater::new();
        assert_eq!(t.evaluate("{{ skipped.x }}", &ctx()).unwrap(), Value::Null);
        assert_eq!(
            t.render("{{ skipped.x }}|{{ other }}|{{ name }}", &ctx()).unwrap(),
            "||Ada"
        );
        assert!(t.evaluate_bool("skipped == null", &ctx()).unwrap());
        assert!(!t.evaluate_bool("skipped.ok", &ctx()).unwrap());
    }

    #[test]
    fn test_render_structures_as_json() {
        let t = Templater::new();
        assert_eq!(t.render("{{ tags }}", &ctx()).unwrap(), r#"["a","b"]"#);
        assert_eq!(t.render("{{ user.admin }}", &ctx()).unwrap(), "true");
    }

    #[test]
    fn test_render_arithmetic_integral() {
        let t = Templater::new();
        assert_eq!(t.render("{{ count + 1 }}", &ctx()).unwrap(), "4");
        assert_eq!(t.render("{{ count / 2 }}", &ctx()).unwrap(), "1.5");
    }

    #[test]
    fn test_render_plain_text_untouched() {
        let t = Templater::new();
        assert_eq!(t.render("no placeholders", &ctx()).unwrap(), "no placeholders");
        assert_eq!(t.render("", &ctx()).unwrap(), "");
    }

    #[test]
    fn test_unterminated_placeholder() {
        let t = Templater::new();
        let err = t.render("abc {{ name", &ctx()).unwrap_err();
        assert_eq!(err, TemplateError::Unterminated { position: 4 });
    }

    #[test]
    fn test_empty_expression() {
        let t = Templater::new();
        assert_eq!(
            t.render("{{   }}", &ctx()).unwrap_err(),
            TemplateError::EmptyExpression
        );
    }

    #[test]
    fn test_malformed_expression_is_error() {
        let t = Templater::new();
        let err = t.evaluate("{{ name == }}", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::Eval { .. }));
    }

    #[test]
    fn test_evaluate_native_values() {
        let t = Templater::new();
        assert_eq!(t.evaluate("{{ tags }}", &ctx()).unwrap(), json!(["a", "b"]));
        assert_eq!(t.evaluate("tags", &ctx()).unwrap(), json!(["a", "b"]));
        assert_eq!(t.evaluate("{{ missing }}", &ctx()).unwrap(), Value::Null);
        assert_eq!(
            t.evaluate("Hi {{ name }}", &ctx()).unwrap(),
            json!("Hi Ada")
        );
    }

    #[test]
    fn test_evaluate_bool_truthiness() {
        let t = Templater::new();
        assert!(t.evaluate_bool("{{ user.admin }}", &ctx()).unwrap());
        assert!(t.evaluate_bool("count > 2", &ctx()).unwrap());
        assert!(!t.evaluate_bool("empty", &ctx()).unwrap());
        assert!(!t.evaluate_bool("missing", &ctx()).unwrap());
        assert!(t.evaluate_bool("steps['par.b'].ok", &ctx()).unwrap());
    }

    #[test]
    fn test_render_value_recursive() {
        let t = Templater::new();
        let input = json!({
            "to": "{{ user.email }}",
            "labels": "{{ tags }}",
            "subject": "Welcome {{ name }}",
            "retries": 2,
            "nested": [{ "n": "{{ count }}" }, "literal"]
        });
        assert_eq!(
            t.render_value(&input, &ctx()).unwrap(),
            json!({
                "to": "ada@example.com",
                "labels": ["a", "b"],
                "subject": "Welcome Ada",
                "retries": 2,
                "nested": [{ "n": 3 }, "literal"]
            })
        );
    }

    #[test]
    fn test_transforms() {
        let t = Templater::new();
        assert_eq!(t.render("{{ name|upper }}", &ctx()).unwrap(), "ADA");
        assert_eq!(t.evaluate("tags|length", &ctx()).unwrap(), json!(2));
        assert_eq!(t.evaluate("missing|default('x')", &ctx()).unwrap(), json!("x"));
        assert_eq!(t.evaluate("name|default('x')", &ctx()).unwrap(), json!("Ada"));
        assert_eq!(t.evaluate("tags|json", &ctx()).unwrap(), json!(r#"["a","b"]"#));
        assert!(t.evaluate_bool("tags|contains('b')", &ctx()).unwrap());
        assert!(t.evaluate_bool("user.email|endsWith('.com')", &ctx()).unwrap());
    }

    #[test]
    fn test_templater_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Templater>();
    }
}
