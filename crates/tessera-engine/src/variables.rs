use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use tessera_core::error::{Result, TesseraError};
use tessera_core::workflow::{VariableDefinition, VariableType};

/// Check a variable declaration itself: pattern compiles, default obeys the rules.
pub fn check_definition(var: &VariableDefinition) -> Result<()> {
    if var.name.trim().is_empty() {
        return Err(TesseraError::Validation("variable with empty name".into()));
    }
    if let Some(pattern) = &var.validation.pattern {
        Regex::new(pattern).map_err(|e| {
            TesseraError::Validation(format!("variable {}: invalid pattern: {}", var.name, e))
        })?;
    }
    if let Some(default) = &var.default {
        let problems = check_value(var, default);
        if !problems.is_empty() {
            return Err(TesseraError::Validation(format!(
                "variable {}: default value invalid: {}",
                var.name,
                problems.join("; ")
            )));
        }
    }
    Ok(())
}

/// Apply defaults and validate inputs against the declarations.
///
/// Undeclared inputs pass through untouched. All problems are reported in
/// one `Validation` error.
pub fn validate_inputs(
    declared: &[VariableDefinition],
    mut input: HashMap<String, Value>,
) -> Result<HashMap<String, Value>> {
    let mut problems = Vec::new();

    for var in declared {
        let present = input.get(&var.name).is_some_and(|v| !v.is_null());
        if !present {
            if let Some(default) = &var.default {
                input.insert(var.name.clone(), default.clone());
                continue;
            }
            if var.required {
                problems.push(format!("{}: required", var.name));
            }
            continue;
        }
        if let Some(value) = input.get(&var.name) {
            problems.extend(
                check_value(var, value)
                    .into_iter()
                    .map(|p| format!("{}: {}", var.name, p)),
            );
        }
    }

    if problems.is_empty() {
        Ok(input)
    } else {
        Err(TesseraError::Validation(problems.join("; ")))
    }
}

fn type_matches(expected: VariableType, value: &Value) -> bool {
    match expected {
        VariableType::Any => true,
        VariableType::String => value.is_string(),
        VariableType::Number => value.is_number(),
        VariableType::Integer => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        VariableType::Boolean => value.is_boolean(),
        VariableType::Object => value.is_object(),
        VariableType::Array => value.is_array(),
    }
}

fn check_value(var: &VariableDefinition, value: &Value) -> Vec<String> {
    let mut problems = Vec::new();
    let rules = &var.validation;

    if !type_matches(var.var_type, value) {
        problems.push(format!("expected {}, got {}", var.var_type, value));
        return problems;
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = rules.min {
            if n < min {
                problems.push(format!("{} is below minimum {}", n, min));
            }
        }
        if let Some(max) = rules.max {
            if n > max {
                problems.push(format!("{} is above maximum {}", n, max));
            }
        }
    }

    let length = match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    };
    if let Some(len) = length {
        if let Some(min) = rules.min_length {
            if len < min {
                problems.push(format!("length {} is below {}", len, min));
            }
        }
        if let Some(max) = rules.max_length {
            if len > max {
                problems.push(format!("length {} is above {}", len, max));
            }
        }
    }

    if let (Some(pattern), Some(s)) = (&rules.pattern, value.as_str()) {
        match Regex::new(pattern) {
            Ok(re) if !re.is_match(s) => {
                problems.push(format!("`{}` does not match /{}/", s, pattern))
            }
            Ok(_) => {}
            Err(e) => problems.push(format!("invalid pattern: {}", e)),
        }
    }

    if !rules.one_of.is_empty() && !rules.one_of.contains(value) {
        problems.push(format!("{} is not one of the allowed values", value));
    }

    problems
}
