//! Fault names, handler lookup, and the compensation-log stack discipline.

use crate::model::{ActivityKind, ProcessModel};
use crate::types::*;

// ─── Standard fault names ─────────────────────────────────────

pub const FAULT_CORRELATION_VIOLATION: &str = "bpel:correlationViolation";
pub const FAULT_UNINITIALIZED_VARIABLE: &str = "bpel:uninitializedVariable";
pub const FAULT_INVALID_REPLY: &str = "bpel:invalidReply";
pub const FAULT_INVOKE_FAILURE: &str = "bpel:invokeFailure";

// ─── Fault reporting ──────────────────────────────────────────

/// Activity path from the process root down to `cont_id`, using element
/// names where declared and kind names otherwise.
pub fn activity_path(model: &ProcessModel, inst: &InstanceState, cont_id: ContId) -> Vec<String> {
    let mut path = Vec::new();
    let mut cursor = Some(cont_id);
    while let Some(id) = cursor {
        let Some(cont) = inst.cont(id) else { break };
        if let Some(node) = model.activity(cont.activity) {
            path.push(node.path_label());
        }
        cursor = cont.parent;
    }
    path.reverse();
    path
}

/// Stamp a fault with the raising continuation's activity path, unless a
/// path was already recorded closer to the source.
pub fn at(
    model: &ProcessModel,
    inst: &InstanceState,
    cont_id: ContId,
    mut fault: FaultInfo,
) -> FaultInfo {
    if fault.activity_path.is_empty() {
        fault.activity_path = activity_path(model, inst, cont_id);
    }
    fault
}

/// The fault-handler table of a scope activity, if it is one.
pub fn scope_fault_handler(
    model: &ProcessModel,
    scope_act: ActId,
    fault_name: &str,
) -> Option<ActId> {
    match model.activity(scope_act).map(|n| &n.kind) {
        Some(ActivityKind::Scope { fault_handlers, .. }) => fault_handlers.handler_for(fault_name),
        _ => None,
    }
}

/// The compensation handler of a scope activity, if declared.
pub fn scope_compensation_handler(model: &ProcessModel, scope_act: ActId) -> Option<ActId> {
    match model.activity(scope_act).map(|n| &n.kind) {
        Some(ActivityKind::Scope {
            compensation_handler,
            ..
        }) => *compensation_handler,
        _ => None,
    }
}

// ─── Compensation log ─────────────────────────────────────────

/// Record a normally-completed compensable scope. Entries accumulate in
/// completion order; compensation consumes them from the back.
pub fn push_compensable(inst: &mut InstanceState, model: &ProcessModel, scope_act: ActId) {
    let name = model
        .activity(scope_act)
        .and_then(|n| n.name.clone());
    inst.compensation_log.push(CompensableScope {
        scope: scope_act,
        name,
    });
}

/// Remove and return the scopes to compensate, most-recently-completed
/// first. A targeted compensate takes the named scope's most recent
/// completion; an untargeted one drains the log. Taking a scope also drops
/// every logged scope nested within it — those belong to the taken scope's
/// own compensation context.
pub fn take_for_compensation(
    inst: &mut InstanceState,
    model: &ProcessModel,
    target: Option<&str>,
) -> Vec<CompensableScope> {
    let mut taken = Vec::new();
    match target {
        Some(name) => {
            if let Some(pos) = inst
                .compensation_log
                .iter()
                .rposition(|e| e.name.as_deref() == Some(name))
            {
                let entry = inst.compensation_log.remove(pos);
                inst.compensation_log
                    .retain(|e| !model.contains(entry.scope, e.scope));
                taken.push(entry);
            }
        }
        None => {
            while let Some(entry) = inst.compensation_log.pop() {
                inst.compensation_log
                    .retain(|e| !model.contains(entry.scope, e.scope));
                taken.push(entry);
            }
        }
    }
    taken
}
