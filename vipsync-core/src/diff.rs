//! Symmetric structural diff between observed and desired models.
//!
//! Both sides are serialized to JSON and walked together. Objects are
//! compared key by key; anything else (numbers, strings, lists) is compared
//! as a whole, so a reordered or extended member list shows up as a single
//! change at the list's path.

use std::fmt;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// A single differing value.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    /// Object keys leading to the value; empty for the whole model.
    pub path: Vec<String>,
    pub state: Value,
    pub plan: Value,
}

impl FieldChange {
    pub fn path_label(&self) -> String {
        if self.path.is_empty() {
            "$".to_string()
        } else {
            self.path.join(".")
        }
    }
}

/// All differences between a node's state and plan. Empty iff converged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub changes: Vec<FieldChange>,
}

impl Diff {
    /// Compare an observed model (`None` when absent) with the plan.
    pub fn between<S: Serialize, P: Serialize>(state: &Option<S>, plan: &P) -> Result<Self> {
        let state = serde_json::to_value(state)?;
        let plan = serde_json::to_value(plan)?;
        let mut changes = Vec::new();
        walk(&mut Vec::new(), &state, &plan, &mut changes);
        Ok(Self { changes })
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Whether any change sits at or below the top-level `field`.
    pub fn touches(&self, field: &str) -> bool {
        self.changes
            .iter()
            .any(|change| change.path.first().is_some_and(|first| first == field))
    }
}

fn walk(path: &mut Vec<String>, state: &Value, plan: &Value, changes: &mut Vec<FieldChange>) {
    match (state, plan) {
        (Value::Object(state), Value::Object(plan)) => walk_objects(path, state, plan, changes),
        _ if state != plan => changes.push(FieldChange {
            path: path.clone(),
            state: state.clone(),
            plan: plan.clone(),
        }),
        _ => {}
    }
}

fn walk_objects(
    path: &mut Vec<String>,
    state: &Map<String, Value>,
    plan: &Map<String, Value>,
    changes: &mut Vec<FieldChange>,
) {
    let mut keys: Vec<&String> = state.keys().chain(plan.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        let missing = Value::Null;
        path.push(key.clone());
        walk(
            path,
            state.get(key).unwrap_or(&missing),
            plan.get(key).unwrap_or(&missing),
            changes,
        );
        path.pop();
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, change) in self.changes.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {} -> {}", change.path_label(), change.state, change.plan)?;
        }
        Ok(())
    }
}

/// Serialized as `{path: [state, plan]}`.
impl Serialize for Diff {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.changes.len()))?;
        for change in &self.changes {
            map.serialize_entry(&change.path_label(), &(&change.state, &change.plan))?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Pool {
        name: String,
        monitor: String,
        members: Vec<String>,
    }

    fn pool(monitor: &str, members: &[&str]) -> Pool {
        Pool {
            name: "pwr_80".into(),
            monitor: monitor.into(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn test_equal_models_have_empty_diff() {
        let diff = Diff::between(&Some(pool("tcp", &["a:80"])), &pool("tcp", &["a:80"])).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_absent_state_is_a_root_change() {
        let diff = Diff::between(&None::<Pool>, &pool("tcp", &[])).unwrap();
        assert_eq!(diff.changes.len(), 1);
        assert!(diff.changes[0].path.is_empty());
        assert_eq!(diff.changes[0].state, Value::Null);
    }

    #[test]
    fn test_member_change_is_reported_once_at_list_path() {
        let diff = Diff::between(
            &Some(pool("tcp", &["a:80"])),
            &pool("tcp", &["a:80", "b:80"]),
        )
        .unwrap();
        assert_eq!(diff.changes.len(), 1);
        assert!(diff.touches("members"));
        assert!(!diff.touches("monitor"));
        assert_eq!(diff.to_string(), r#"members: ["a:80"] -> ["a:80","b:80"]"#);
    }

    #[test]
    fn test_nested_objects_are_walked_by_key() {
        let state = json!({"dns": {"fqdn": "api.example.net", "ips": {"A": ["10.0.0.1"]}}});
        let plan = json!({"dns": {"fqdn": "api.example.net", "ips": {"A": ["10.0.0.2"]}}});
        let diff = Diff::between(&Some(state), &plan).unwrap();
        assert_eq!(diff.changes.len(), 1);
        assert_eq!(diff.changes[0].path_label(), "dns.ips.A");
        assert_eq!(
            serde_json::to_value(&diff).unwrap(),
            json!({"dns.ips.A": [["10.0.0.1"], ["10.0.0.2"]]})
        );
    }
}
