//! Validation System - Rule/Policy Separation
//!
//! Rules produce structured violations.
//! Policy: any error-severity violation rejects the specification before it
//! is hashed; warnings are recorded and logged only.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl ValidationViolation {
    fn error(rule: &str, message: &str, expected: &str, actual: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            severity: ViolationSeverity::Error,
            message: message.to_string(),
            expected: Some(expected.to_string()),
            actual: Some(actual.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Warning)
    }

    /// One line per error, `rule: message (expected .., got ..)`.
    pub fn error_summary(&self) -> String {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Error)
            .map(|v| match (&v.expected, &v.actual) {
                (Some(e), Some(a)) => format!("{}: {} (expected {}, got {})", v.rule, v.message, e, a),
                _ => format!("{}: {}", v.rule, v.message),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, spec: &Value) -> Vec<ValidationViolation>;
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// --- Concrete Rules ---

pub struct ObjectRootRule;

impl ValidationRule for ObjectRootRule {
    fn name(&self) -> &'static str { "object_root" }

    fn validate(&self, spec: &Value) -> Vec<ValidationViolation> {
        if spec.is_object() {
            return vec![];
        }
        vec![ValidationViolation::error(
            self.name(),
            "Specification must be a mapping",
            "object",
            kind_of(spec),
        )]
    }
}

pub struct ShotIdRule;

impl ValidationRule for ShotIdRule {
    fn name(&self) -> &'static str { "shot_id" }

    fn validate(&self, spec: &Value) -> Vec<ValidationViolation> {
        let Some(map) = spec.as_object() else {
            return vec![];
        };
        match map.get("shot_id") {
            None => vec![ValidationViolation::error(
                self.name(),
                "Missing logical identifier",
                "non-empty string",
                "absent",
            )],
            Some(Value::String(id)) if id.is_empty() || id.trim() != id => {
                vec![ValidationViolation::error(
                    self.name(),
                    "Identifier must be non-empty without surrounding whitespace",
                    "non-empty string",
                    format!("{:?}", id),
                )]
            }
            Some(Value::String(_)) => vec![],
            Some(other) => vec![ValidationViolation::error(
                self.name(),
                "Identifier must be a string",
                "string",
                kind_of(other),
            )],
        }
    }
}

pub struct OutputDimensionsRule;

impl ValidationRule for OutputDimensionsRule {
    fn name(&self) -> &'static str { "output_dimensions" }

    fn validate(&self, spec: &Value) -> Vec<ValidationViolation> {
        let Some(output) = spec.get("output") else {
            return vec![];
        };
        let Some(output) = output.as_object() else {
            return vec![ValidationViolation::error(
                self.name(),
                "Output block must be a mapping",
                "object",
                kind_of(output),
            )];
        };

        let mut violations = vec![];
        for field in ["width", "height"] {
            let Some(value) = output.get(field) else {
                continue;
            };
            let positive = value
                .as_f64()
                .map(|f| f >= 1.0 && f.fract() == 0.0)
                .unwrap_or(false);
            if !positive {
                violations.push(ValidationViolation::error(
                    self.name(),
                    &format!("Output {} must be a positive integer", field),
                    "integer >= 1",
                    value.to_string(),
                ));
            }
        }
        violations
    }
}

pub struct PaletteRule;

impl PaletteRule {
    fn is_hex_color(s: &str) -> bool {
        s.len() == 7
            && s.starts_with('#')
            && s[1..].bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl ValidationRule for PaletteRule {
    fn name(&self) -> &'static str { "color_palette" }

    fn validate(&self, spec: &Value) -> Vec<ValidationViolation> {
        let Some(palette) = spec.pointer("/color/palette") else {
            return vec![];
        };
        let Some(entries) = palette.as_array() else {
            return vec![ValidationViolation::error(
                self.name(),
                "Palette must be a list of colors",
                "array",
                kind_of(palette),
            )];
        };

        let mut violations = vec![];
        for entry in entries {
            match entry.as_str() {
                None => violations.push(ValidationViolation::error(
                    self.name(),
                    "Palette entries must be strings",
                    "string",
                    kind_of(entry),
                )),
                Some(s) if !Self::is_hex_color(s) => violations.push(ValidationViolation {
                    rule: self.name().to_string(),
                    severity: ViolationSeverity::Warning,
                    message: "Palette entry is not a #rrggbb color".to_string(),
                    expected: Some("#rrggbb".to_string()),
                    actual: Some(s.to_string()),
                }),
                Some(_) => {}
            }
        }
        violations
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(ObjectRootRule),
                Box::new(ShotIdRule),
                Box::new(OutputDimensionsRule),
                Box::new(PaletteRule),
            ],
        }
    }

    pub fn validate(&self, spec: &Value) -> ValidationResult {
        let violations: Vec<_> = self
            .rules
            .iter()
            .flat_map(|rule| rule.validate(spec))
            .collect();

        let valid = !violations.iter().any(|v| v.severity == ViolationSeverity::Error);
        ValidationResult { valid, violations }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_minimal_spec() {
        let result = Validator::new().validate(&json!({"shot_id": "sku-1"}));
        assert!(result.valid);
        assert!(result.violations.is_empty());
    }

    #[test]
    fn rejects_non_object_root() {
        let result = Validator::new().validate(&json!([1, 2]));
        assert!(!result.valid);
        assert_eq!(result.violations[0].rule, "object_root");
    }

    #[test]
    fn rejects_missing_or_blank_shot_id() {
        let v = Validator::new();
        assert!(!v.validate(&json!({"camera": {}})).valid);
        assert!(!v.validate(&json!({"shot_id": " x"})).valid);
        assert!(!v.validate(&json!({"shot_id": 7})).valid);
    }

    #[test]
    fn rejects_bad_output_dimensions() {
        let result = Validator::new()
            .validate(&json!({"shot_id": "a", "output": {"width": 0, "height": 10.5}}));
        assert!(!result.valid);
        assert_eq!(result.violations.len(), 2);
        assert!(result.error_summary().contains("output_dimensions"));
    }

    #[test]
    fn palette_warning_does_not_block() {
        let result = Validator::new()
            .validate(&json!({"shot_id": "a", "color": {"palette": ["#ffffff", "red"]}}));
        assert!(result.valid);
        assert_eq!(result.warnings().count(), 1);
    }
}
