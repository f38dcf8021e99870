use serde_json::Value;

use super::{EstimateError, EstimationResult};

/// Conventional top-level keys carrying the estimated age, in lookup order.
pub const AGE_KEYS: [&str; 3] = ["predicted_age", "age", "estimated_age"];

/// Interpret an estimation service response body.
///
/// Accepted shapes:
/// - `{"predicted_age": 23}` (or `age` / `estimated_age`)
/// - `{"faces": [{"age": 23, ...}, ...]}`, first face wins
///
/// Fractional ages are floored so a borderline estimate never rounds up into
/// a grant. `"success": false`, missing keys, negative or non-numeric ages
/// are errors.
pub fn parse_estimation_response(body: &Value) -> Result<EstimationResult, EstimateError> {
    let object = body
        .as_object()
        .ok_or_else(|| EstimateError::Malformed("response is not a JSON object".to_string()))?;

    if object.get("success").and_then(Value::as_bool) == Some(false) {
        let message = object
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("service reported failure");
        return Err(EstimateError::Malformed(message.to_string()));
    }

    for key in AGE_KEYS {
        match object.get(key) {
            Some(Value::Null) | None => continue,
            Some(value) => return age_from_value(key, value),
        }
    }

    if let Some(faces) = object.get("faces") {
        let faces = faces
            .as_array()
            .ok_or_else(|| EstimateError::Malformed("faces is not an array".to_string()))?;
        let first = faces
            .first()
            .ok_or_else(|| EstimateError::Malformed("no face detected".to_string()))?;
        let age = first
            .get("age")
            .filter(|v| !v.is_null())
            .ok_or_else(|| EstimateError::Malformed("face entry has no age".to_string()))?;
        return age_from_value("faces[0].age", age);
    }

    Err(EstimateError::Malformed(format!(
        "no age field (expected one of {})",
        AGE_KEYS.join(", ")
    )))
}

fn age_from_value(key: &str, value: &Value) -> Result<EstimationResult, EstimateError> {
    let malformed = || EstimateError::Malformed(format!("{key} is not a non-negative age"));
    let estimated_age = if let Some(age) = value.as_u64() {
        u32::try_from(age).map_err(|_| malformed())?
    } else if let Some(age) = value.as_f64() {
        if !age.is_finite() || age < 0.0 || age > u32::MAX as f64 {
            return Err(malformed());
        }
        age.floor() as u32
    } else {
        return Err(malformed());
    };
    Ok(EstimationResult { estimated_age })
}
