//! Typed structural patches over shot specifications.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};
use crate::spec::{ShotSpecification, SHOT_ID_FIELD};

/// A path into a specification tree. Displayed dotted (`camera.fov`) but
/// serialized as a segment array, so keys containing `.` survive a round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(key.to_string());
        Self(segments)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for FieldPath {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            return Self(vec![]);
        }
        Self(s.split('.').map(str::to_string).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    Set,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub path: FieldPath,
    pub op: PatchOpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOp {
    pub fn set(path: impl Into<FieldPath>, value: Value) -> Self {
        Self { path: path.into(), op: PatchOpKind::Set, value: Some(value) }
    }

    pub fn remove(path: impl Into<FieldPath>) -> Self {
        Self { path: path.into(), op: PatchOpKind::Remove, value: None }
    }
}

/// How tolerant patch application is of paths that do not exist yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchMode {
    /// Missing intermediate objects are created; removing an absent path is a no-op.
    #[default]
    Lenient,
    /// Every targeted path must already exist.
    Strict,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
}

impl Patch {
    pub fn new(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }

    /// Flattens a nested merge document into leaf operations.
    ///
    /// `{"camera": {"fov": 60}}` becomes `set camera.fov = 60`; `null` leaves
    /// become removals; arrays are set whole. An empty object names no
    /// field and produces no operation; replacing a whole subtree takes an
    /// explicit [`PatchOp::set`].
    pub fn from_merge(doc: &Value) -> Result<Self> {
        let Value::Object(map) = doc else {
            return Err(CoreError::PatchConflict("merge document must be a mapping".into()));
        };
        let mut ops = vec![];
        flatten(&FieldPath::default(), map, &mut ops);
        Ok(Self { ops })
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Applies every operation to a copy of `base`. Nothing is returned on
    /// conflict, so callers never see a half-patched tree.
    pub fn apply(&self, base: &ShotSpecification, mode: PatchMode) -> Result<ShotSpecification> {
        let mut root = base.fields().clone();
        for op in &self.ops {
            apply_op(&mut root, op, mode)?;
        }
        ShotSpecification::from_value(Value::Object(root))
            .map_err(|e| CoreError::PatchConflict(format!("patched specification is invalid: {}", e)))
    }
}

fn flatten(prefix: &FieldPath, map: &Map<String, Value>, ops: &mut Vec<PatchOp>) {
    for (key, value) in map {
        let path = prefix.child(key);
        match value {
            Value::Object(child) => flatten(&path, child, ops),
            Value::Null => ops.push(PatchOp::remove(path)),
            other => ops.push(PatchOp::set(path, other.clone())),
        }
    }
}

fn apply_op(root: &mut Map<String, Value>, op: &PatchOp, mode: PatchMode) -> Result<()> {
    let Some((leaf, parents)) = op.path.segments().split_last() else {
        return Err(CoreError::PatchConflict("empty path".into()));
    };
    if op.path.segments()[0] == SHOT_ID_FIELD {
        return Err(CoreError::PatchConflict(format!("{} is immutable", SHOT_ID_FIELD)));
    }

    let create = op.op == PatchOpKind::Set && mode == PatchMode::Lenient;
    let mut node = root;
    for (depth, key) in parents.iter().enumerate() {
        if !node.contains_key(key) {
            if !create {
                if op.op == PatchOpKind::Remove && mode == PatchMode::Lenient {
                    return Ok(());
                }
                return Err(CoreError::PatchConflict(format!(
                    "path {} does not exist",
                    FieldPath::new(parents[..=depth].to_vec())
                )));
            }
            node.insert(key.clone(), Value::Object(Map::new()));
        }
        node = match node.get_mut(key) {
            Some(Value::Object(child)) => child,
            _ => {
                return Err(CoreError::PatchConflict(format!(
                    "path {} is not a mapping",
                    FieldPath::new(parents[..=depth].to_vec())
                )))
            }
        };
    }

    match op.op {
        PatchOpKind::Set => {
            if mode == PatchMode::Strict && !node.contains_key(leaf) {
                return Err(CoreError::PatchConflict(format!("path {} does not exist", op.path)));
            }
            let value = op
                .value
                .clone()
                .ok_or_else(|| CoreError::PatchConflict(format!("set {} without a value", op.path)))?;
            node.insert(leaf.clone(), value);
        }
        PatchOpKind::Remove => {
            if node.remove(leaf).is_none() && mode == PatchMode::Strict {
                return Err(CoreError::PatchConflict(format!("path {} does not exist", op.path)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> ShotSpecification {
        ShotSpecification::from_value(json!({
            "shot_id": "sku-1",
            "camera": {"fov": 45, "position": {"x": 0, "y": 0}},
            "lens": {"aperture": 2.8}
        }))
        .unwrap()
    }

    #[test]
    fn merge_document_flattens_to_leaves() {
        let patch = Patch::from_merge(&json!({"camera": {"fov": 60, "position": {"x": null}}})).unwrap();
        assert_eq!(
            patch.ops,
            vec![PatchOp::set("camera.fov", json!(60)), PatchOp::remove("camera.position.x")]
        );
    }

    #[test]
    fn set_leaves_siblings_untouched() {
        let patch = Patch::from_merge(&json!({"camera": {"fov": 60}})).unwrap();
        let next = patch.apply(&base(), PatchMode::Lenient).unwrap();
        assert_eq!(next.get("camera.fov"), Some(&json!(60)));
        assert_eq!(next.get("camera.position.y"), Some(&json!(0)));
        assert_eq!(next.get("lens.aperture"), Some(&json!(2.8)));
    }

    #[test]
    fn lenient_creates_missing_parents() {
        let patch = Patch::new(vec![PatchOp::set("lighting.key.intensity", json!(0.7))]);
        let next = patch.apply(&base(), PatchMode::Lenient).unwrap();
        assert_eq!(next.get("lighting.key.intensity"), Some(&json!(0.7)));
    }

    #[test]
    fn strict_rejects_missing_path() {
        let patch = Patch::new(vec![PatchOp::set("camera.roll", json!(3))]);
        let err = patch.apply(&base(), PatchMode::Strict).unwrap_err();
        assert!(matches!(err, CoreError::PatchConflict(_)));
        assert!(patch.apply(&base(), PatchMode::Lenient).is_ok());
    }

    #[test]
    fn traversal_through_scalar_conflicts() {
        let patch = Patch::new(vec![PatchOp::set("camera.fov.x", json!(1))]);
        let err = patch.apply(&base(), PatchMode::Lenient).unwrap_err();
        assert!(err.to_string().contains("camera.fov is not a mapping"));
    }

    #[test]
    fn shot_id_is_immutable() {
        let patch = Patch::new(vec![PatchOp::set("shot_id", json!("other"))]);
        assert!(matches!(
            patch.apply(&base(), PatchMode::Lenient),
            Err(CoreError::PatchConflict(_))
        ));
    }

    #[test]
    fn remove_absent_is_noop_only_when_lenient() {
        let patch = Patch::new(vec![PatchOp::remove("background.hex")]);
        assert_eq!(patch.apply(&base(), PatchMode::Lenient).unwrap().hash(), base().hash());
        assert!(patch.apply(&base(), PatchMode::Strict).is_err());
    }

    #[test]
    fn empty_merge_object_leaves_subtree_untouched() {
        let patch = Patch::from_merge(&json!({"camera": {}, "lens": {"aperture": 4.0}})).unwrap();
        assert_eq!(patch.ops, vec![PatchOp::set("lens.aperture", json!(4.0))]);

        let next = patch.apply(&base(), PatchMode::Lenient).unwrap();
        assert_eq!(next.get("camera.fov"), Some(&json!(45)));
        assert_eq!(next.get("camera.position.x"), Some(&json!(0)));
        assert_eq!(next.get("lens.aperture"), Some(&json!(4)));
    }

    #[test]
    fn typed_set_can_replace_subtree() {
        let patch = Patch::new(vec![PatchOp::set("camera", json!({}))]);
        let next = patch.apply(&base(), PatchMode::Lenient).unwrap();
        assert_eq!(next.get("camera"), Some(&json!({})));
    }

    #[test]
    fn ops_serialize_with_segment_paths() {
        let encoded = serde_json::to_value(Patch::new(vec![PatchOp::set("camera.fov", json!(60))])).unwrap();
        assert_eq!(encoded, json!([{"path": ["camera", "fov"], "op": "set", "value": 60}]));
    }

    #[test]
    fn dotted_keys_survive_serde() {
        let path = FieldPath::new(vec!["meta".into(), "v1.2".into()]);
        let decoded: FieldPath = serde_json::from_value(serde_json::to_value(&path).unwrap()).unwrap();
        assert_eq!(decoded, path);
        assert_eq!(decoded.segments().len(), 2);
    }
}
