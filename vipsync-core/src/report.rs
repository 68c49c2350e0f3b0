//! Outcome and inspection trees.
//!
//! Every tree operation returns a recursive record that serializes to the
//! nested shape downstream tooling consumes:
//!
//! ```text
//! {"Entrypoint": {"patched": true, "siblings": {"api-lab": {"VirtualServerA10": {...}}}}}
//! ```

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;

/// Which tree operation produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Patch,
    Delete,
}

impl Action {
    /// Outcome key in the serialized report.
    pub fn key(self) -> &'static str {
        match self {
            Action::Patch => "patched",
            Action::Delete => "deleted",
        }
    }
}

/// Result of `global_patch` / `global_delete` on one node and its siblings.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub kind: &'static str,
    pub action: Action,
    pub ok: bool,
    pub siblings: Vec<(String, Outcome)>,
}

impl Outcome {
    pub fn new(kind: &'static str, action: Action, ok: bool, siblings: Vec<(String, Outcome)>) -> Self {
        Self {
            kind,
            action,
            ok,
            siblings,
        }
    }

    pub fn patched(kind: &'static str, ok: bool, siblings: Vec<(String, Outcome)>) -> Self {
        Self::new(kind, Action::Patch, ok, siblings)
    }

    pub fn deleted(kind: &'static str, ok: bool, siblings: Vec<(String, Outcome)>) -> Self {
        Self::new(kind, Action::Delete, ok, siblings)
    }

    /// True only if this node and every node below it succeeded.
    pub fn is_success(&self) -> bool {
        self.ok && self.siblings.iter().all(|(_, sibling)| sibling.is_success())
    }

    /// Paths (`Kind/name/...`) of every node that did not succeed.
    pub fn failures(&self) -> Vec<String> {
        let mut failed = Vec::new();
        self.collect_failures(self.kind.to_string(), &mut failed);
        failed
    }

    fn collect_failures(&self, path: String, failed: &mut Vec<String>) {
        if !self.ok {
            failed.push(path.clone());
        }
        for (name, sibling) in &self.siblings {
            sibling.collect_failures(format!("{}/{}", path, name), failed);
        }
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.kind, &OutcomeBody(self))?;
        map.end()
    }
}

struct OutcomeBody<'a>(&'a Outcome);

impl Serialize for OutcomeBody<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(self.0.action.key(), &self.0.ok)?;
        map.serialize_entry("siblings", &Named(&self.0.siblings))?;
        map.end()
    }
}

/// Serializes `(name, value)` pairs as a map, keeping their order.
struct Named<'a, T>(&'a [(String, T)]);

impl<T: Serialize> Serialize for Named<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Which read-only view an inspection tree shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Plan,
    State,
    Diff,
}

impl View {
    pub fn key(self) -> &'static str {
        match self {
            View::Plan => "plan",
            View::State => "state",
            View::Diff => "diff",
        }
    }
}

/// Read-only plan/state/diff tree of a node and its siblings.
#[derive(Debug, Clone, PartialEq)]
pub struct Inspection {
    pub kind: &'static str,
    pub view: View,
    pub body: Value,
    pub is_valid: Option<bool>,
    pub siblings: Vec<(String, Inspection)>,
}

impl Serialize for Inspection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.kind, &InspectionBody(self))?;
        map.end()
    }
}

struct InspectionBody<'a>(&'a Inspection);

impl Serialize for InspectionBody<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let inspection = self.0;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(inspection.view.key(), &inspection.body)?;
        if let Some(valid) = inspection.is_valid {
            map.serialize_entry("is_valid", &valid)?;
        }
        map.serialize_entry("siblings", &Named(&inspection.siblings))?;
        map.end()
    }
}

/// What a balancer currently serves for one entrypoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VipSummary {
    pub name: String,
    pub address: String,
    pub ports: Vec<PortSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortSummary {
    pub port_number: u16,
    pub pool: Option<PoolSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSummary {
    pub name: String,
    pub members: Vec<MemberSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberSummary {
    pub name: String,
    pub address: Option<String>,
    pub port: u16,
}
