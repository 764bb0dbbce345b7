//! Structural diff between two specifications.
//!
//! Output order is depth-first with keys visited lexicographically at each
//! level, so the same pair of specs always diffs identically.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::patch::{FieldPath, Patch, PatchOp};
use crate::spec::ShotSpecification;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: FieldPath,
    /// Absent when the path only exists on the `to` side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    /// Absent when the path only exists on the `from` side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

pub fn diff_specs(from: &ShotSpecification, to: &ShotSpecification) -> Vec<DiffEntry> {
    let mut entries = vec![];
    if from.hash() != to.hash() {
        walk(&FieldPath::default(), from.fields(), to.fields(), &mut entries);
    }
    entries
}

fn walk(prefix: &FieldPath, old: &Map<String, Value>, new: &Map<String, Value>, out: &mut Vec<DiffEntry>) {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for key in keys {
        let path = prefix.child(key);
        match (old.get(key), new.get(key)) {
            (Some(Value::Object(a)), Some(Value::Object(b))) => walk(&path, a, b, out),
            (a, b) if a == b => {}
            (a, b) => out.push(DiffEntry {
                path,
                old_value: a.cloned(),
                new_value: b.cloned(),
            }),
        }
    }
}

/// The patch that turns the `to` side of `entries` back into the `from` side.
pub fn inverse_patch(entries: &[DiffEntry]) -> Patch {
    let ops = entries
        .iter()
        .map(|entry| match &entry.old_value {
            Some(old) => PatchOp::set(entry.path.clone(), old.clone()),
            None => PatchOp::remove(entry.path.clone()),
        })
        .collect();
    Patch::new(ops)
}
