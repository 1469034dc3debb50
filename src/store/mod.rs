use crate::model::{resource_id, MutationCommand, MutationKind, ResourceKind};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Consumer of mutation commands. Operations are idempotent per id.
pub trait StateStore {
    fn apply(&mut self, command: &MutationCommand);
}

/// In-memory keyed collections, one per resource kind, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct ClientCaches {
    collections: HashMap<ResourceKind, Vec<Value>>,
}

impl ClientCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a whole collection, as after a list fetch by the API client.
    pub fn load(&mut self, kind: ResourceKind, records: Vec<Value>) {
        self.collections.insert(kind, records);
    }

    pub fn clear(&mut self) {
        self.collections.clear();
    }

    pub fn list(&self, kind: &ResourceKind) -> &[Value] {
        self.collections
            .get(kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn get(&self, kind: &ResourceKind, id: &str) -> Option<&Value> {
        self.list(kind)
            .iter()
            .find(|record| resource_id(record).as_deref() == Some(id))
    }

    pub fn volume_name(&self, volume_id: &str) -> Option<String> {
        self.get(&ResourceKind::Volumes, volume_id)
            .and_then(record_name)
    }

    /// Name for a consistency group: the first cached volume in it, else the
    /// group itself.
    pub fn consistency_group_name(&self, group_id: &str) -> Option<String> {
        self.list(&ResourceKind::Volumes)
            .iter()
            .find(|v| v.get("consistencyGroupId").and_then(Value::as_str) == Some(group_id))
            .and_then(record_name)
            .or_else(|| {
                self.get(&ResourceKind::ConsistencyGroups, group_id)
                    .and_then(record_name)
            })
    }

    pub fn sizes(&self) -> BTreeMap<String, usize> {
        self.collections
            .iter()
            .map(|(kind, records)| (kind.tag().to_string(), records.len()))
            .collect()
    }
}

impl StateStore for ClientCaches {
    fn apply(&mut self, command: &MutationCommand) {
        let records = self
            .collections
            .entry(command.resource_type.clone())
            .or_default();
        let position = command.id.as_deref().and_then(|id| {
            records
                .iter()
                .position(|record| resource_id(record).as_deref() == Some(id))
        });

        match (command.kind, position) {
            (MutationKind::Append | MutationKind::Replace, Some(index)) => {
                records[index] = command.payload.clone();
            }
            (MutationKind::Append | MutationKind::Replace, None) => {
                records.push(command.payload.clone());
            }
            (MutationKind::Remove, Some(index)) => {
                records.remove(index);
            }
            (MutationKind::Remove, None) => {}
        }
    }
}

fn record_name(record: &Value) -> Option<String> {
    record
        .get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}
