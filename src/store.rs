//! In-memory, multi-table, single-writer transactional state store
//! (component B, §4.2).
//!
//! Grounded on the hashicorp/go-memdb table layout of the source state
//! store: two tables, `definition` (PK `name`) and `instance` (PK `id`),
//! with all mutation routed through the Raft Apply path (see `raft.rs`) and
//! reads served from read-transactions that never observe a torn state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::errors::{OpenStateError, Result};
use crate::fsm::{EventDescriptor, Fsm};

/// Opaque metadata attached to a Definition.
pub type Attributes = HashMap<String, String>;

/// The FSM blueprint embedded in a Definition: initial state + events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineBlueprint {
    pub initial: String,
    pub events: Vec<EventDescriptor>,
}

/// Immutable blueprint of a workflow. Never mutated in place (I1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    #[serde(default)]
    pub attributes: Attributes,
    pub machine: MachineBlueprint,
}

/// A live execution of a Definition.
///
/// Holds the Definition's name rather than an embedded Definition to avoid
/// the JSON-cycle hazard named in the design notes; callers resolve the
/// full Definition through the store when building a response.
pub struct Instance {
    pub id: String,
    pub definition_name: String,
    pub machine: Fsm,
}

/// Wire shape of an Instance for HTTP responses and snapshots — embeds the
/// live FSM's serialized form rather than a definition reference.
#[derive(Serialize, Deserialize)]
struct InstanceRow {
    id: String,
    definition_name: String,
    machine: InstanceMachineRow,
}

#[derive(Serialize, Deserialize)]
struct InstanceMachineRow {
    current: String,
    transitions: Vec<TransitionRow>,
    callbacks: HashMap<String, crate::callback::CallbackDescriptor>,
}

#[derive(Serialize, Deserialize)]
struct TransitionRow {
    event: String,
    src: String,
    dst: String,
}

impl Instance {
    fn to_row(&self) -> InstanceRow {
        // Round-trip through Fsm's own Serialize impl to reuse its wire shape.
        let value = serde_json::to_value(&self.machine).expect("fsm serializes");
        let machine: InstanceMachineRow =
            serde_json::from_value(value).expect("fsm wire shape matches InstanceMachineRow");
        InstanceRow {
            id: self.id.clone(),
            definition_name: self.definition_name.clone(),
            machine,
        }
    }

    fn from_row(row: InstanceRow) -> Result<Self> {
        let wire = serde_json::json!({
            "current": row.machine.current,
            "transitions": row.machine.transitions.into_iter().map(|t| serde_json::json!({
                "event": t.event, "src": t.src, "dst": t.dst,
            })).collect::<Vec<_>>(),
            "callbacks": row.machine.callbacks,
        });
        let machine: Fsm = serde_json::from_value(wire)
            .map_err(|e| OpenStateError::Decode(e.to_string()))?;
        Ok(Instance {
            id: row.id,
            definition_name: row.definition_name,
            machine,
        })
    }
}

impl Serialize for Instance {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_row().serialize(serializer)
    }
}

/// The transactional state store. All writes happen on the Raft Apply path
/// (single writer, per §4.2); reads may run concurrently via the `RwLock`.
pub struct StateStore {
    definitions: RwLock<HashMap<String, Arc<Definition>>>,
    instances: RwLock<HashMap<String, Arc<Instance>>>,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore {
            definitions: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Begin a write transaction. The returned `WriteTxn` aborts (no-op) on
    /// drop unless `commit()` is called explicitly.
    pub fn write_txn(&self) -> WriteTxn<'_> {
        WriteTxn {
            store: self,
            pending_definitions: Vec::new(),
            pending_instances: Vec::new(),
            committed: false,
        }
    }

    pub fn get_definition_by_name(&self, name: &str) -> Option<Arc<Definition>> {
        self.definitions.read().unwrap().get(name).cloned()
    }

    pub fn get_instance_by_id(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.read().unwrap().get(id).cloned()
    }

    pub fn get_definitions(&self) -> Vec<Arc<Definition>> {
        self.definitions.read().unwrap().values().cloned().collect()
    }

    pub fn get_instances(&self) -> Vec<Arc<Instance>> {
        self.instances.read().unwrap().values().cloned().collect()
    }

    /// Instances whose id begins with `"{task_name}-"`, per the `ps` filter
    /// in §4.6.
    pub fn get_instances_for_task(&self, task_name: &str) -> Vec<Arc<Instance>> {
        let prefix = format!("{}-", task_name);
        self.instances
            .read()
            .unwrap()
            .values()
            .filter(|i| i.id.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Two concatenated JSON arrays: definitions, then instances (§4.3).
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let defs: Vec<Arc<Definition>> = self.get_definitions();
        let insts: Vec<Arc<Instance>> = self.get_instances();

        let mut out = serde_json::to_vec(&defs).map_err(|e| OpenStateError::Decode(e.to_string()))?;
        let insts_json =
            serde_json::to_vec(&insts).map_err(|e| OpenStateError::Decode(e.to_string()))?;
        out.extend_from_slice(&insts_json);
        Ok(out)
    }

    /// Restore tears down existing state and re-inserts every element of
    /// both sections. Two independent JSON decodes against one byte slice —
    /// the spec names this as a known limitation (no length prefix) rather
    /// than something to fix here.
    pub fn restore(&self, data: &[u8]) -> Result<()> {
        let mut deser = serde_json::Deserializer::from_slice(data).into_iter::<serde_json::Value>();

        let defs_value = deser
            .next()
            .ok_or_else(|| OpenStateError::Decode("snapshot missing definitions array".into()))?
            .map_err(|e| OpenStateError::Decode(e.to_string()))?;
        let defs: Vec<Definition> =
            serde_json::from_value(defs_value).map_err(|e| OpenStateError::Decode(e.to_string()))?;

        let insts_value = deser
            .next()
            .ok_or_else(|| OpenStateError::Decode("snapshot missing instances array".into()))?
            .map_err(|e| OpenStateError::Decode(e.to_string()))?;
        let rows: Vec<InstanceRow> =
            serde_json::from_value(insts_value).map_err(|e| OpenStateError::Decode(e.to_string()))?;

        let mut new_definitions = HashMap::new();
        for d in defs {
            new_definitions.insert(d.name.clone(), Arc::new(d));
        }

        let mut new_instances = HashMap::new();
        for row in rows {
            let instance = Instance::from_row(row)?;
            new_instances.insert(instance.id.clone(), Arc::new(instance));
        }

        *self.definitions.write().unwrap() = new_definitions;
        *self.instances.write().unwrap() = new_instances;
        Ok(())
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A single write transaction against the store. Commit is explicit; abort
/// is default-on-drop (per §4.2's transaction discipline).
pub struct WriteTxn<'a> {
    store: &'a StateStore,
    pending_definitions: Vec<Definition>,
    pending_instances: Vec<Instance>,
    committed: bool,
}

impl<'a> WriteTxn<'a> {
    /// Stage a Definition insert. Fails with `AlreadyExists` immediately if
    /// the name collides with an already-committed row or with another
    /// pending insert staged earlier in this same txn.
    pub fn insert_definition(&mut self, definition: Definition) -> Result<()> {
        if self.store.definitions.read().unwrap().contains_key(&definition.name)
            || self.pending_definitions.iter().any(|d| d.name == definition.name)
        {
            return Err(OpenStateError::AlreadyExists {
                kind: "definition",
                key: definition.name,
            });
        }
        self.pending_definitions.push(definition);
        Ok(())
    }

    /// Stage an Instance insert. Fails with `AlreadyExists` on id collision,
    /// whether against an already-committed row or another pending insert
    /// staged earlier in this same txn.
    pub fn insert_instance(&mut self, instance: Instance) -> Result<()> {
        if self.store.instances.read().unwrap().contains_key(&instance.id)
            || self.pending_instances.iter().any(|i| i.id == instance.id)
        {
            return Err(OpenStateError::AlreadyExists {
                kind: "instance",
                key: instance.id,
            });
        }
        self.pending_instances.push(instance);
        Ok(())
    }

    /// Commit all staged inserts atomically under a single write lock each.
    pub fn commit(mut self) {
        if !self.pending_definitions.is_empty() {
            let mut guard = self.store.definitions.write().unwrap();
            for d in self.pending_definitions.drain(..) {
                guard.insert(d.name.clone(), Arc::new(d));
            }
        }
        if !self.pending_instances.is_empty() {
            let mut guard = self.store.instances.write().unwrap();
            for i in self.pending_instances.drain(..) {
                guard.insert(i.id.clone(), Arc::new(i));
            }
        }
        self.committed = true;
    }
}

impl<'a> Drop for WriteTxn<'a> {
    fn drop(&mut self) {
        // Abort-on-drop: pending inserts that were never committed are
        // simply discarded with the txn.
        if !self.committed {
            self.pending_definitions.clear();
            self.pending_instances.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::EventDescriptor;

    fn traffic_definition() -> Definition {
        Definition {
            name: "traffic".into(),
            attributes: Attributes::new(),
            machine: MachineBlueprint {
                initial: "green".into(),
                events: vec![
                    EventDescriptor {
                        name: "turn_yellow".into(),
                        destination: "yellow".into(),
                        sources: vec!["green".into()],
                        callback: None,
                    },
                    EventDescriptor {
                        name: "turn_red".into(),
                        destination: "red".into(),
                        sources: vec!["yellow".into()],
                        callback: None,
                    },
                ],
            },
        }
    }

    #[test]
    fn insert_and_get_definition() {
        let store = StateStore::new();
        let mut txn = store.write_txn();
        txn.insert_definition(traffic_definition()).unwrap();
        txn.commit();

        let got = store.get_definition_by_name("traffic").unwrap();
        assert_eq!(got.machine.initial, "green");
    }

    #[test]
    fn colliding_definition_name_fails_and_does_not_mutate() {
        let store = StateStore::new();
        let mut txn = store.write_txn();
        txn.insert_definition(traffic_definition()).unwrap();
        txn.commit();

        let mut txn2 = store.write_txn();
        let err = txn2.insert_definition(traffic_definition()).unwrap_err();
        assert!(matches!(err, OpenStateError::AlreadyExists { .. }));
        assert_eq!(store.get_definitions().len(), 1);
    }

    #[test]
    fn aborted_txn_does_not_mutate_store() {
        let store = StateStore::new();
        {
            let mut txn = store.write_txn();
            txn.insert_definition(traffic_definition()).unwrap();
            // txn dropped without commit()
        }
        assert!(store.get_definition_by_name("traffic").is_none());
    }

    #[test]
    fn instance_prefix_filter() {
        let store = StateStore::new();
        let def = traffic_definition();
        let fsm1 = Fsm::new(&def.machine.initial, &def.machine.events).unwrap();
        let fsm2 = Fsm::new(&def.machine.initial, &def.machine.events).unwrap();

        let mut txn = store.write_txn();
        txn.insert_definition(def).unwrap();
        txn.insert_instance(Instance {
            id: "traffic-1".into(),
            definition_name: "traffic".into(),
            machine: fsm1,
        })
        .unwrap();
        txn.insert_instance(Instance {
            id: "traffic-2".into(),
            definition_name: "traffic".into(),
            machine: fsm2,
        })
        .unwrap();
        txn.commit();

        let instances = store.get_instances_for_task("traffic");
        assert_eq!(instances.len(), 2);
        assert!(instances.iter().all(|i| i.id.starts_with("traffic-")));
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let store = StateStore::new();
        let def = traffic_definition();
        let fsm = Fsm::new(&def.machine.initial, &def.machine.events).unwrap();

        let mut txn = store.write_txn();
        txn.insert_definition(def).unwrap();
        txn.insert_instance(Instance {
            id: "traffic-1".into(),
            definition_name: "traffic".into(),
            machine: fsm,
        })
        .unwrap();
        txn.commit();

        let snapshot = store.snapshot().unwrap();

        let restored = StateStore::new();
        restored.restore(&snapshot).unwrap();

        assert_eq!(restored.get_definitions().len(), 1);
        assert_eq!(restored.get_instances().len(), 1);
        let instance = restored.get_instance_by_id("traffic-1").unwrap();
        assert_eq!(instance.machine.state(), "green");
    }
}
