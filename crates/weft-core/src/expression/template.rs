//! `{{ expression }}` interpolation for URLs, headers and text nodes.

use serde_json::Value;

use super::{Bindings, ExpressionError, ExpressionEvaluator};

/// Replace every `{{ expr }}` in `template` with the evaluated value.
///
/// Strings are inserted verbatim; other values are inserted as JSON.
pub fn render_template(
    evaluator: &ExpressionEvaluator,
    template: &str,
    bindings: &dyn Bindings,
) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(ExpressionError::Syntax {
                position: offset + start,
                message: "unterminated '{{' in template".to_string(),
            });
        };
        let value = evaluator.evaluate(after[..end].trim(), bindings)?;
        out.push_str(&value_to_string(&value));

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_renders_placeholders() {
        let eval = ExpressionEvaluator::new();
        let ctx = json!({ "input": { "id": 42, "name": "bob" } });
        let out = render_template(
            &eval,
            "https://api/users/{{ input.id }}?q={{input.name}}",
            &ctx,
        )
        .unwrap();
        assert_eq!(out, "https://api/users/42?q=bob");
    }

    #[test]
    fn test_text_without_placeholders_is_unchanged() {
        let eval = ExpressionEvaluator::new();
        assert_eq!(
            render_template(&eval, "plain text", &json!({})).unwrap(),
            "plain text"
        );
    }

    #[test]
    fn test_unresolved_placeholder_is_an_error() {
        let eval = ExpressionEvaluator::new();
        let err = render_template(&eval, "x={{ input.nope }}", &json!({ "input": {} }))
            .unwrap_err();
        assert!(matches!(err, ExpressionError::UnresolvedIdentifier(_)));
    }

    #[test]
    fn test_unterminated_placeholder() {
        let eval = ExpressionEvaluator::new();
        assert!(render_template(&eval, "x={{ input", &json!({})).is_err());
    }
}
