use serde_json::Value;

use super::{ParameterType, PluginParameter};

/// Checks `values` against the declared parameters. Every violation is
/// collected; nothing short-circuits on the first problem.
pub fn validate_parameters(
    declared: &[PluginParameter],
    values: &Value,
) -> std::result::Result<(), Vec<String>> {
    let mut errors: Vec<String> = Vec::new();

    let Some(values) = values.as_object() else {
        if !declared.is_empty() {
            errors.push(format!("plugin parameters must be an object, got {values}"));
        }
        return if errors.is_empty() { Ok(()) } else { Err(errors) };
    };

    for param in declared {
        let Some(value) = values.get(&param.name) else {
            errors.push(format!("missing parameter '{}'", param.name));
            continue;
        };
        if let Err(msg) = validate_parameter_value(param, value) {
            errors.push(msg);
        }
    }

    // Undeclared keys are ignored: clients may send extra metadata.

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_parameter_value(param: &PluginParameter, value: &Value) -> std::result::Result<(), String> {
    if param.ty == ParameterType::User {
        return Ok(());
    }

    if param.length > 1 {
        let Some(items) = value.as_array() else {
            return Err(format!(
                "expected array of length {} for parameter '{}', got {}",
                param.length, param.name, value
            ));
        };
        if items.len() != param.length {
            return Err(format!(
                "expected array of length {} for parameter '{}', got length {}",
                param.length,
                param.name,
                items.len()
            ));
        }
        if let Some((i, bad)) = items
            .iter()
            .enumerate()
            .find(|(_, item)| !scalar_matches(param.ty, item))
        {
            return Err(format!(
                "invalid element {i} of parameter '{}': expected {:?}, got {}",
                param.name, param.ty, bad
            ));
        }
        return Ok(());
    }

    if value.is_array() || value.is_object() {
        return Err(format!(
            "expected primitive value for parameter '{}', got {}",
            param.name, value
        ));
    }

    if scalar_matches(param.ty, value) {
        Ok(())
    } else {
        Err(format!(
            "invalid type for parameter '{}': expected {:?}, got {}",
            param.name, param.ty, value
        ))
    }
}

fn scalar_matches(ty: ParameterType, value: &Value) -> bool {
    match ty {
        ParameterType::Int => value.is_i64() || value.is_u64(),
        // JSON clients drop the fraction of whole floats, so integers pass too.
        ParameterType::Float => value.is_number(),
        ParameterType::Bool => value.is_boolean(),
        ParameterType::String => value.is_string(),
        ParameterType::User => true,
    }
}
