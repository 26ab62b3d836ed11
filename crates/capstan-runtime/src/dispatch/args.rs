//! Argument validation against declared parameters.

use serde_json::{Map, Value};

use crate::manifest::{ActionSpec, ParameterSpec, ParameterType};

/// Check `args` against `action`'s parameters, returning every problem.
///
/// An empty result means the handler may be called.
#[must_use]
pub fn check_arguments(action: &ActionSpec, args: &Map<String, Value>) -> Vec<String> {
    let mut problems = Vec::new();

    for name in args.keys() {
        if action.parameter(name).is_none() {
            problems.push(format!("unexpected argument '{name}'"));
        }
    }

    for param in &action.parameters {
        match args.get(&param.name) {
            None if param.required => {
                problems.push(format!("missing required argument '{}'", param.name));
            },
            None => {},
            Some(value) => check_value(param, value, &mut problems),
        }
    }

    problems
}

fn check_value(param: &ParameterSpec, value: &Value, problems: &mut Vec<String>) {
    let name = &param.name;
    if !type_matches(param.kind, value) {
        problems.push(format!(
            "argument '{name}' must be {}, got {}",
            describe(param.kind),
            json_type(value)
        ));
        return;
    }

    // Numbers are bounded by value, strings and arrays by length.
    let (measure, what) = match (param.kind, value) {
        (ParameterType::String, Value::String(s)) => (len_f64(s.chars().count()), "length"),
        (ParameterType::Array, Value::Array(a)) => (len_f64(a.len()), "length"),
        (ParameterType::Integer | ParameterType::Number, Value::Number(n)) => {
            (n.as_f64().unwrap_or(f64::NAN), "value")
        },
        _ => return,
    };
    if let Some(min) = param.min
        && measure < min
    {
        problems.push(format!("argument '{name}' {what} {measure} is below the minimum {min}"));
    }
    if let Some(max) = param.max
        && measure > max
    {
        problems.push(format!("argument '{name}' {what} {measure} is above the maximum {max}"));
    }

    if let (Some(choices), Value::String(s)) = (&param.choices, value)
        && !choices.contains(s)
    {
        problems.push(format!(
            "argument '{name}' must be one of [{}], got '{s}'",
            choices.join(", ")
        ));
    }
}

fn type_matches(kind: ParameterType, value: &Value) -> bool {
    match kind {
        ParameterType::String => value.is_string(),
        ParameterType::Integer => is_whole_number(value),
        ParameterType::Number => value.is_number(),
        ParameterType::Boolean => value.is_boolean(),
        ParameterType::Array => value.is_array(),
        ParameterType::Object => value.is_object(),
        ParameterType::Any => true,
    }
}

#[allow(clippy::float_cmp)]
fn is_whole_number(value: &Value) -> bool {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => true,
        Value::Number(n) => n.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0),
        _ => false,
    }
}

#[allow(clippy::cast_precision_loss)]
fn len_f64(len: usize) -> f64 {
    len as f64
}

fn describe(kind: ParameterType) -> &'static str {
    match kind {
        ParameterType::String => "a string",
        ParameterType::Integer => "an integer",
        ParameterType::Number => "a number",
        ParameterType::Boolean => "a boolean",
        ParameterType::Array => "an array",
        ParameterType::Object => "an object",
        ParameterType::Any => "any value",
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::manifest::Manifest;

    fn action() -> ActionSpec {
        let m = Manifest::parse(
            r#"
id = "a"
name = "A"
version = "1.0.0"
entry_point = "x"

[[actions]]
name = "run"
parameters = [
  { name = "text", type = "string", min = 1, max = 5 },
  { name = "count", type = "integer", required = false, min = 0, max = 10 },
  { name = "ratio", type = "number", required = false },
  { name = "mode", type = "string", required = false, choices = ["fast", "slow"] },
  { name = "items", type = "array", required = false, max = 2 },
  { name = "extra", type = "any", required = false },
]
"#,
        )
        .unwrap();
        m.actions[0].clone()
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_valid_arguments() {
        let a = action();
        assert!(check_arguments(&a, &args(json!({"text": "hi"}))).is_empty());
        assert!(
            check_arguments(
                &a,
                &args(json!({
                    "text": "hello",
                    "count": 3.0,
                    "ratio": 0.5,
                    "mode": "slow",
                    "items": [1, 2],
                    "extra": null,
                }))
            )
            .is_empty()
        );
    }

    #[test]
    fn test_reports_every_problem() {
        let problems = check_arguments(
            &action(),
            &args(json!({
                "count": 1.5,
                "ratio": "high",
                "mode": "medium",
                "items": [1, 2, 3],
                "bogus": true,
            })),
        );
        assert_eq!(
            problems,
            vec![
                "unexpected argument 'bogus'",
                "missing required argument 'text'",
                "argument 'count' must be an integer, got number",
                "argument 'ratio' must be a number, got string",
                "argument 'mode' must be one of [fast, slow], got 'medium'",
                "argument 'items' length 3 is above the maximum 2",
            ]
        );
    }

    #[test]
    fn test_bounds() {
        let a = action();
        let problems = check_arguments(&a, &args(json!({"text": "", "count": -1})));
        assert_eq!(
            problems,
            vec![
                "argument 'text' length 0 is below the minimum 1",
                "argument 'count' value -1 is below the minimum 0",
            ]
        );
        let problems = check_arguments(&a, &args(json!({"text": "ééééé"})));
        assert!(problems.is_empty(), "length counts characters: {problems:?}");
    }
}
