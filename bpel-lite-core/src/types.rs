use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Index of an activity node in the compiled model arena.
pub type ActId = u32;

/// Index of a continuation in the per-instance arena.
pub type ContId = u32;

/// Index of a declared variable.
pub type VarId = u32;

/// Index of a declared correlation set.
pub type CsetId = u32;

/// Index of a declared partner link.
pub type LinkId = u32;

/// Identifier of one pending message/alarm wait. Unique per instance.
pub type WaitId = u64;

/// Message-exchange identifier for a two-way invoke. Unique per instance.
pub type MexId = u64;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Variable and message payloads are opaque JSON values.
pub type Value = serde_json::Value;

/// Concrete key values of one correlation set, ordered as its declared
/// property names.
pub type CorrelationKey = Vec<String>;

pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

// ─── Messages ─────────────────────────────────────────────────

/// An engine-level message. Properties carry the simple values correlation
/// keys are computed from; the payload is never interpreted by the engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub properties: BTreeMap<String, String>,
    pub payload: Value,
}

impl Message {
    pub fn new(payload: Value) -> Self {
        Self {
            properties: BTreeMap::new(),
            payload,
        }
    }

    pub fn with_property(mut self, name: &str, value: &str) -> Self {
        self.properties.insert(name.to_string(), value.to_string());
        self
    }
}

// ─── Faults & completions ─────────────────────────────────────

/// A process-level fault: name, optional data, and the activity path from
/// the process root to the raising activity at the time of the fault.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultInfo {
    pub name: String,
    pub data: Option<Value>,
    pub activity_path: Vec<String>,
}

impl FaultInfo {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data: None,
            activity_path: Vec::new(),
        }
    }

    pub fn with_data(name: &str, data: Value) -> Self {
        Self {
            name: name.to_string(),
            data: Some(data),
            activity_path: Vec::new(),
        }
    }
}

/// How one continuation finished, reported upward to its parent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Completion {
    Normal,
    Fault(FaultInfo),
    /// A scope finished running its compensation handler.
    Compensated,
}

// ─── Correlation-set instances ────────────────────────────────

/// Runtime state of one declared correlation set within one instance.
/// Once initialized the key is immutable for the instance's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSetInstance {
    pub values: Option<CorrelationKey>,
}

impl CorrelationSetInstance {
    pub fn is_initialized(&self) -> bool {
        self.values.is_some()
    }
}

// ─── Continuations ────────────────────────────────────────────

/// What a parked continuation is blocked on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WaitState {
    /// Runnable; not parked.
    Ready,
    /// Receive parked on a registered correlation wait.
    Msg { wait_id: WaitId },
    /// Pick parked on its armed alternatives (ids live in the pick state).
    PickArms,
    /// Two-way invoke parked on its reply.
    Reply { mex_id: MexId },
    /// Structured activity waiting for child completions.
    Children,
    /// Scope running its compensation handler.
    Compensating,
}

/// One completed, still-compensable scope retained in the compensation log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompensableScope {
    pub scope: ActId,
    pub name: Option<String>,
}

/// Which stage a scope continuation is in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScopePhase {
    Body,
    /// Fault handler running; the original fault is kept for reporting.
    Handling { fault: FaultInfo },
    /// Compensation handler running (spawned from the compensation log).
    Compensation,
}

/// Kind-specific transient execution state of one continuation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ContState {
    /// Elementary activities carry no extra state.
    Leaf,
    Sequence {
        next: usize,
    },
    Flow {
        remaining: usize,
        first_fault: Option<FaultInfo>,
        cancelling: bool,
    },
    While {
        iterations: u32,
    },
    Pick {
        /// Wait id per on-message arm, index-aligned with the declaration.
        arms: Vec<WaitId>,
        alarm: Option<WaitId>,
        alarm_deadline_ms: Option<u64>,
        chosen: bool,
    },
    If,
    Scope {
        phase: ScopePhase,
    },
    Compensate {
        /// Scopes still to compensate, most-recently-completed first.
        queue: Vec<CompensableScope>,
    },
}

/// The live, suspendable execution state of one in-progress activity
/// instantiation. Continuations form a tree isomorphic to the executing
/// portion of the activity tree; parents own children by id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    pub cont_id: ContId,
    pub activity: ActId,
    pub parent: Option<ContId>,
    pub children: Vec<ContId>,
    pub state: ContState,
    pub wait: WaitState,
}

// ─── Instance state ───────────────────────────────────────────

/// Top-level lifecycle of a process instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InstanceLifecycle {
    Running,
    Completed { at: Timestamp },
    Faulted { fault: FaultInfo, at: Timestamp },
    Terminated { at: Timestamp },
}

impl InstanceLifecycle {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceLifecycle::Running)
    }
}

/// All mutable state of one running process instance. Exclusively owned by
/// its instance; fully serializable so a suspended instance can be
/// checkpointed and later resumed bit-for-bit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance_id: Uuid,
    pub process_name: String,
    pub model_version: [u8; 32],
    pub variables: BTreeMap<VarId, Value>,
    pub correlations: BTreeMap<CsetId, CorrelationSetInstance>,
    conts: Vec<Option<Continuation>>,
    pub root_cont: ContId,
    /// Continuation running the process-level fault handler, if any.
    pub root_handler: Option<ContId>,
    /// Fault that escaped the root activity, kept for the terminal report.
    pub root_fault: Option<FaultInfo>,
    /// Completed compensable scopes in completion order (oldest first).
    pub compensation_log: Vec<CompensableScope>,
    pub state: InstanceLifecycle,
    next_wait_id: WaitId,
    next_mex_id: MexId,
    pub created_at: Timestamp,
}

impl InstanceState {
    pub fn new(instance_id: Uuid, process_name: &str, model_version: [u8; 32]) -> Self {
        Self {
            instance_id,
            process_name: process_name.to_string(),
            model_version,
            variables: BTreeMap::new(),
            correlations: BTreeMap::new(),
            conts: Vec::new(),
            root_cont: 0,
            root_handler: None,
            root_fault: None,
            compensation_log: Vec::new(),
            state: InstanceLifecycle::Running,
            next_wait_id: 0,
            next_mex_id: 0,
            created_at: now_ms(),
        }
    }

    /// Allocate a continuation for `activity` under `parent`.
    pub fn alloc_cont(
        &mut self,
        activity: ActId,
        parent: Option<ContId>,
        state: ContState,
    ) -> ContId {
        let cont_id = self.conts.len() as ContId;
        self.conts.push(Some(Continuation {
            cont_id,
            activity,
            parent,
            children: Vec::new(),
            state,
            wait: WaitState::Ready,
        }));
        if let Some(p) = parent {
            if let Some(Some(pc)) = self.conts.get_mut(p as usize) {
                pc.children.push(cont_id);
            }
        }
        cont_id
    }

    pub fn cont(&self, id: ContId) -> Option<&Continuation> {
        self.conts.get(id as usize).and_then(|c| c.as_ref())
    }

    pub fn cont_mut(&mut self, id: ContId) -> Option<&mut Continuation> {
        self.conts.get_mut(id as usize).and_then(|c| c.as_mut())
    }

    /// Remove a continuation, detaching it from its parent's child list.
    pub fn remove_cont(&mut self, id: ContId) {
        let parent = self.cont(id).and_then(|c| c.parent);
        if let Some(p) = parent {
            if let Some(pc) = self.cont_mut(p) {
                pc.children.retain(|&c| c != id);
            }
        }
        if let Some(slot) = self.conts.get_mut(id as usize) {
            *slot = None;
        }
    }

    pub fn live_conts(&self) -> impl Iterator<Item = &Continuation> {
        self.conts.iter().filter_map(|c| c.as_ref())
    }

    pub fn fresh_wait_id(&mut self) -> WaitId {
        let id = self.next_wait_id;
        self.next_wait_id += 1;
        id
    }

    pub fn fresh_mex_id(&mut self) -> MexId {
        let id = self.next_mex_id;
        self.next_mex_id += 1;
        id
    }
}
