//! Shot specifications - immutable, validated, normalized parameter trees.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};
use crate::hashing::{canonical_json, content_hash, normalize, ContentHash};
use crate::validation::Validator;

/// Field excluded from hashed content; it labels the shot, it does not
/// describe the image.
pub const SHOT_ID_FIELD: &str = "shot_id";

/// A validated shot specification.
///
/// Construction validates, normalizes numbers and computes the content hash
/// exactly once. Values are never mutated afterwards; deriving a new spec
/// goes through [`ShotSpecification::from_value`] again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ShotSpecification {
    shot_id: String,
    fields: Map<String, Value>,
    hash: ContentHash,
}

impl ShotSpecification {
    pub fn from_value(value: Value) -> Result<Self> {
        let result = Validator::new().validate(&value);
        if !result.valid {
            return Err(CoreError::InvalidSpecification(result.error_summary()));
        }
        for warning in result.warnings() {
            tracing::debug!(rule = %warning.rule, message = %warning.message, "specification warning");
        }

        let Value::Object(fields) = normalize(&value) else {
            return Err(CoreError::InvalidSpecification("object_root: not a mapping".into()));
        };
        let shot_id = match fields.get(SHOT_ID_FIELD) {
            Some(Value::String(id)) => id.clone(),
            _ => return Err(CoreError::InvalidSpecification("shot_id: missing".into())),
        };
        let hash = hash_fields(&fields)?;
        Ok(Self { shot_id, fields, hash })
    }

    /// Accepts anything serializable; serialization failures are
    /// reported as [`CoreError::InvalidSpecification`].
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| CoreError::InvalidSpecification(format!("not serializable: {}", e)))?;
        Self::from_value(value)
    }

    pub fn shot_id(&self) -> &str {
        &self.shot_id
    }

    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, pointer: &str) -> Option<&Value> {
        let mut parts = pointer.split('.');
        let first = self.fields.get(parts.next()?)?;
        parts.try_fold(first, |node, key| node.get(key))
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Canonical bytes of the hashed content (everything but `shot_id`).
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(canonical_json(&content_view(&self.fields))?.into_bytes())
    }
}

fn content_view(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .filter(|(k, _)| k.as_str() != SHOT_ID_FIELD)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn hash_fields(fields: &Map<String, Value>) -> Result<ContentHash> {
    let canonical = canonical_json(&content_view(fields))?;
    Ok(content_hash(canonical.as_bytes()))
}

/// Canonical serialization of any candidate specification value.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>> {
    ShotSpecification::from_value(value.clone())?.canonical_bytes()
}

/// Content hash of a candidate specification value.
pub fn hash(value: &Value) -> Result<ContentHash> {
    Ok(ShotSpecification::from_value(value.clone())?.hash)
}

impl TryFrom<Value> for ShotSpecification {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl From<ShotSpecification> for Value {
    fn from(spec: ShotSpecification) -> Self {
        Value::Object(spec.fields)
    }
}
