//! Compiled process model: the immutable, shared graph an instance executes.
//!
//! Built once (by the external compiler collaborator or the `ModelBuilder`),
//! versioned by content hash, then referenced read-only by any number of
//! concurrent instances. Activities live in an index-addressed arena so the
//! runtime continuation tree can reference them by handle and serialize
//! cleanly.

use crate::faults;
use crate::types::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ─── Declarations ─────────────────────────────────────────────

/// A named reference to an external service role used by invoke/receive/reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartnerLinkDecl {
    pub name: String,
    /// Base address template with `(partName)` placeholders, when the
    /// binding uses URL replacement for outbound construction.
    pub address_template: Option<String>,
    /// Declared part names for the address template.
    pub parts: Vec<String>,
}

/// A named tuple of message property names forming a correlation key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSetDecl {
    pub name: String,
    pub properties: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
}

/// Reference to a correlation set on a receive-style activity.
/// `initiate` means the inbound message establishes the key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrelationUse {
    pub cset: CsetId,
    pub initiate: bool,
}

// ─── Conditions ───────────────────────────────────────────────

/// Compiled boolean predicate over instance variables, evaluated by while/if
/// guards. Evaluating a predicate over an uninitialized variable is a fault.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Const(bool),
    VarTruthy(VarId),
    VarEquals(VarId, Value),
}

impl Condition {
    pub fn eval(&self, variables: &BTreeMap<VarId, Value>) -> Result<bool, FaultInfo> {
        match self {
            Condition::Const(b) => Ok(*b),
            Condition::VarTruthy(var) => {
                let v = variables
                    .get(var)
                    .ok_or_else(|| FaultInfo::named(faults::FAULT_UNINITIALIZED_VARIABLE))?;
                Ok(is_truthy(v))
            }
            Condition::VarEquals(var, expected) => {
                let v = variables
                    .get(var)
                    .ok_or_else(|| FaultInfo::named(faults::FAULT_UNINITIALIZED_VARIABLE))?;
                Ok(v == expected)
            }
        }
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ─── Activity kinds ───────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IfBranch {
    pub condition: Condition,
    pub body: ActId,
}

/// One receive-style alternative of a pick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OnMessage {
    pub partner_link: LinkId,
    pub operation: String,
    pub variable: Option<VarId>,
    pub correlations: Vec<CorrelationUse>,
    pub body: ActId,
}

/// The timer alternative of a pick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OnAlarm {
    pub duration_ms: u64,
    pub body: ActId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultHandlerTable {
    /// Exact fault-name catches, consulted in declared order.
    pub catch: Vec<(String, ActId)>,
    pub catch_all: Option<ActId>,
}

impl FaultHandlerTable {
    pub fn handler_for(&self, fault_name: &str) -> Option<ActId> {
        self.catch
            .iter()
            .find(|(name, _)| name == fault_name)
            .map(|(_, h)| *h)
            .or(self.catch_all)
    }

    pub fn is_empty(&self) -> bool {
        self.catch.is_empty() && self.catch_all.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssignCopy {
    pub from: CopySource,
    pub to: VarId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CopySource {
    Literal(Value),
    Variable(VarId),
}

/// Tagged variant over every activity kind the interpreter dispatches on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ActivityKind {
    Empty,
    Sequence {
        children: Vec<ActId>,
    },
    Flow {
        children: Vec<ActId>,
    },
    While {
        condition: Condition,
        body: ActId,
    },
    If {
        branches: Vec<IfBranch>,
        else_branch: Option<ActId>,
    },
    Pick {
        on_message: Vec<OnMessage>,
        on_alarm: Option<OnAlarm>,
        create_instance: bool,
    },
    Receive {
        partner_link: LinkId,
        operation: String,
        variable: Option<VarId>,
        correlations: Vec<CorrelationUse>,
        create_instance: bool,
    },
    /// Compiled reply attributes: partner link, operation, variable,
    /// fault qualifier, message-exchange id, and the correlation sets to
    /// initiate/assert on the way out.
    Reply {
        partner_link: LinkId,
        operation: String,
        variable: Option<VarId>,
        fault_name: Option<String>,
        message_exchange: String,
        init_correlations: Vec<CsetId>,
        assert_correlations: Vec<CsetId>,
    },
    Invoke {
        partner_link: LinkId,
        operation: String,
        input_variable: Option<VarId>,
        output_variable: Option<VarId>,
        two_way: bool,
    },
    Assign {
        copies: Vec<AssignCopy>,
    },
    Throw {
        fault_name: String,
        fault_data: Option<Value>,
    },
    Compensate {
        /// Named scope to compensate; `None` compensates every eligible
        /// scope in reverse completion order.
        target_scope: Option<String>,
    },
    Scope {
        body: ActId,
        variables: Vec<VarId>,
        correlation_sets: Vec<CsetId>,
        fault_handlers: FaultHandlerTable,
        compensation_handler: Option<ActId>,
    },
}

impl ActivityKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ActivityKind::Empty => "empty",
            ActivityKind::Sequence { .. } => "sequence",
            ActivityKind::Flow { .. } => "flow",
            ActivityKind::While { .. } => "while",
            ActivityKind::If { .. } => "if",
            ActivityKind::Pick { .. } => "pick",
            ActivityKind::Receive { .. } => "receive",
            ActivityKind::Reply { .. } => "reply",
            ActivityKind::Invoke { .. } => "invoke",
            ActivityKind::Assign { .. } => "assign",
            ActivityKind::Throw { .. } => "throw",
            ActivityKind::Compensate { .. } => "compensate",
            ActivityKind::Scope { .. } => "scope",
        }
    }

    /// Every activity id this node structurally owns, in declared order.
    pub fn child_ids(&self) -> Vec<ActId> {
        match self {
            ActivityKind::Empty
            | ActivityKind::Receive { .. }
            | ActivityKind::Reply { .. }
            | ActivityKind::Invoke { .. }
            | ActivityKind::Assign { .. }
            | ActivityKind::Throw { .. }
            | ActivityKind::Compensate { .. } => Vec::new(),
            ActivityKind::Sequence { children } | ActivityKind::Flow { children } => {
                children.clone()
            }
            ActivityKind::While { body, .. } => vec![*body],
            ActivityKind::If {
                branches,
                else_branch,
            } => {
                let mut ids: Vec<ActId> = branches.iter().map(|b| b.body).collect();
                ids.extend(else_branch.iter().copied());
                ids
            }
            ActivityKind::Pick {
                on_message,
                on_alarm,
                ..
            } => {
                let mut ids: Vec<ActId> = on_message.iter().map(|m| m.body).collect();
                ids.extend(on_alarm.iter().map(|a| a.body));
                ids
            }
            ActivityKind::Scope {
                body,
                fault_handlers,
                compensation_handler,
                ..
            } => {
                let mut ids = vec![*body];
                ids.extend(fault_handlers.catch.iter().map(|(_, h)| *h));
                ids.extend(fault_handlers.catch_all.iter().copied());
                ids.extend(compensation_handler.iter().copied());
                ids
            }
        }
    }
}

/// One node of the compiled activity arena.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityNode {
    /// Optional element name, used in fault activity paths.
    pub name: Option<String>,
    pub kind: ActivityKind,
}

impl ActivityNode {
    pub fn path_label(&self) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => self.kind.kind_name().to_string(),
        }
    }
}

// ─── Process model ────────────────────────────────────────────

/// Immutable compiled representation of one process definition. Safe for
/// concurrent read by unlimited instances; never mutated after compilation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessModel {
    pub name: String,
    /// SHA-256 of the canonical serialized model — the version key.
    pub model_version: [u8; 32],
    pub activities: Vec<ActivityNode>,
    pub root: ActId,
    pub partner_links: Vec<PartnerLinkDecl>,
    pub correlation_sets: Vec<CorrelationSetDecl>,
    pub variables: Vec<VariableDecl>,
    /// Process-level fault handlers, consulted when a fault escapes the root.
    pub fault_handlers: FaultHandlerTable,
}

impl ProcessModel {
    pub fn activity(&self, id: ActId) -> Option<&ActivityNode> {
        self.activities.get(id as usize)
    }

    pub fn partner_link(&self, id: LinkId) -> Option<&PartnerLinkDecl> {
        self.partner_links.get(id as usize)
    }

    pub fn correlation_set(&self, id: CsetId) -> Option<&CorrelationSetDecl> {
        self.correlation_sets.get(id as usize)
    }

    pub fn variable(&self, id: VarId) -> Option<&VariableDecl> {
        self.variables.get(id as usize)
    }

    /// True if `descendant` lies inside the subtree rooted at `ancestor`.
    pub fn contains(&self, ancestor: ActId, descendant: ActId) -> bool {
        if ancestor == descendant {
            return true;
        }
        let mut stack = match self.activity(ancestor) {
            Some(node) => node.kind.child_ids(),
            None => return false,
        };
        while let Some(id) = stack.pop() {
            if id == descendant {
                return true;
            }
            if let Some(node) = self.activity(id) {
                stack.extend(node.kind.child_ids());
            }
        }
        false
    }

    /// (partner link, operation) pairs of every start activity: receives and
    /// pick arms marked `create_instance`.
    pub fn start_operations(&self) -> Vec<(LinkId, String)> {
        let mut ops = Vec::new();
        for node in &self.activities {
            match &node.kind {
                ActivityKind::Receive {
                    partner_link,
                    operation,
                    create_instance: true,
                    ..
                } => ops.push((*partner_link, operation.clone())),
                ActivityKind::Pick {
                    on_message,
                    create_instance: true,
                    ..
                } => {
                    for arm in on_message {
                        ops.push((arm.partner_link, arm.operation.clone()));
                    }
                }
                _ => {}
            }
        }
        ops
    }

    /// Find a scope activity by its element name.
    pub fn scope_by_name(&self, name: &str) -> Option<ActId> {
        self.activities.iter().enumerate().find_map(|(i, node)| {
            if matches!(node.kind, ActivityKind::Scope { .. }) && node.name.as_deref() == Some(name)
            {
                Some(i as ActId)
            } else {
                None
            }
        })
    }
}

/// Content hash over the canonical JSON serialization with a zeroed version
/// field, so compiling the same source twice yields the same version.
pub fn compute_version(model: &ProcessModel) -> [u8; 32] {
    let mut unversioned = model.clone();
    unversioned.model_version = [0u8; 32];
    let bytes = serde_json::to_vec(&unversioned).expect("model serialization is infallible");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

// ─── Builder ──────────────────────────────────────────────────

/// Programmatic model assembly with correct arena wiring. The external
/// compiler collaborator produces the same structure from source text.
#[derive(Debug, Default)]
pub struct ModelBuilder {
    name: String,
    activities: Vec<ActivityNode>,
    partner_links: Vec<PartnerLinkDecl>,
    correlation_sets: Vec<CorrelationSetDecl>,
    variables: Vec<VariableDecl>,
    fault_handlers: FaultHandlerTable,
}

impl ModelBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn partner_link(&mut self, name: &str) -> LinkId {
        self.partner_links.push(PartnerLinkDecl {
            name: name.to_string(),
            address_template: None,
            parts: Vec::new(),
        });
        (self.partner_links.len() - 1) as LinkId
    }

    pub fn partner_link_with_address(
        &mut self,
        name: &str,
        template: &str,
        parts: &[&str],
    ) -> LinkId {
        self.partner_links.push(PartnerLinkDecl {
            name: name.to_string(),
            address_template: Some(template.to_string()),
            parts: parts.iter().map(|p| p.to_string()).collect(),
        });
        (self.partner_links.len() - 1) as LinkId
    }

    pub fn correlation_set(&mut self, name: &str, properties: &[&str]) -> CsetId {
        self.correlation_sets.push(CorrelationSetDecl {
            name: name.to_string(),
            properties: properties.iter().map(|p| p.to_string()).collect(),
        });
        (self.correlation_sets.len() - 1) as CsetId
    }

    pub fn variable(&mut self, name: &str) -> VarId {
        self.variables.push(VariableDecl {
            name: name.to_string(),
        });
        (self.variables.len() - 1) as VarId
    }

    pub fn activity(&mut self, kind: ActivityKind) -> ActId {
        self.activities.push(ActivityNode { name: None, kind });
        (self.activities.len() - 1) as ActId
    }

    pub fn named(&mut self, name: &str, kind: ActivityKind) -> ActId {
        self.activities.push(ActivityNode {
            name: Some(name.to_string()),
            kind,
        });
        (self.activities.len() - 1) as ActId
    }

    pub fn process_fault_handlers(&mut self, table: FaultHandlerTable) {
        self.fault_handlers = table;
    }

    pub fn build(self, root: ActId) -> ProcessModel {
        let mut model = ProcessModel {
            name: self.name,
            model_version: [0u8; 32],
            activities: self.activities,
            root,
            partner_links: self.partner_links,
            correlation_sets: self.correlation_sets,
            variables: self.variables,
            fault_handlers: self.fault_handlers,
        };
        model.model_version = compute_version(&model);
        model
    }
}
