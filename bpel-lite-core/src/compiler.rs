//! Compiler collaborator interface and deploy-time model validation.
//!
//! The textual front-end lives outside this crate; the engine consumes only
//! the compiled [`ProcessModel`]. Validation runs at deploy time and rejects
//! structurally broken models before any instance can run.

use crate::model::{ActivityKind, Condition, CorrelationUse, ProcessModel};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

/// A structured parse error from the compiler collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParseIssue {
    pub location: String,
    pub severity: Severity,
    pub message: String,
}

/// The compiler collaborator: source text in, compiled model or issues out.
pub trait ProcessCompiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<ProcessModel, Vec<ParseIssue>>;
}

/// A deploy-time finding against a compiled model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub activity: Option<ActId>,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.activity {
            Some(act) => write!(f, "{:?} at activity {}: {}", self.severity, act, self.message),
            None => write!(f, "{:?}: {}", self.severity, self.message),
        }
    }
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(|i| i.severity == Severity::Error)
}

fn error(activity: Option<ActId>, message: String) -> ValidationIssue {
    ValidationIssue {
        severity: Severity::Error,
        activity,
        message,
    }
}

fn warning(activity: Option<ActId>, message: String) -> ValidationIssue {
    ValidationIssue {
        severity: Severity::Warning,
        activity,
        message,
    }
}

/// Validate a compiled model. Deployment must be rejected on any
/// Error-severity issue.
pub fn validate_model(model: &ProcessModel) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let act_count = model.activities.len() as u32;

    if model.root >= act_count {
        issues.push(error(None, format!("root activity {} out of bounds", model.root)));
        return issues;
    }

    // Tree shape: every referenced child exists and has exactly one parent.
    let mut parent: HashMap<ActId, ActId> = HashMap::new();
    for (i, node) in model.activities.iter().enumerate() {
        let act = i as ActId;
        for child in node.kind.child_ids() {
            if child >= act_count {
                issues.push(error(Some(act), format!("child activity {child} out of bounds")));
                continue;
            }
            if let Some(prior) = parent.insert(child, act) {
                issues.push(error(
                    Some(child),
                    format!("activity owned by both {prior} and {act}"),
                ));
            }
        }
    }

    for (i, node) in model.activities.iter().enumerate() {
        let act = i as ActId;
        match &node.kind {
            ActivityKind::Pick { on_message, .. } => {
                if on_message.is_empty() {
                    issues.push(error(Some(act), "pick with no alternatives".to_string()));
                }
                for arm in on_message {
                    check_partner_link(model, act, arm.partner_link, &mut issues);
                    check_correlations(model, act, &arm.correlations, &mut issues);
                    check_variable(model, act, arm.variable, &mut issues);
                }
            }
            ActivityKind::Receive {
                partner_link,
                variable,
                correlations,
                ..
            } => {
                check_partner_link(model, act, *partner_link, &mut issues);
                check_correlations(model, act, correlations, &mut issues);
                check_variable(model, act, *variable, &mut issues);
            }
            ActivityKind::Reply {
                partner_link,
                variable,
                init_correlations,
                assert_correlations,
                ..
            } => {
                check_partner_link(model, act, *partner_link, &mut issues);
                check_variable(model, act, *variable, &mut issues);
                for &cset in init_correlations.iter().chain(assert_correlations) {
                    check_cset(model, act, cset, &mut issues);
                }
                for &cset in init_correlations {
                    if assert_correlations.contains(&cset) {
                        issues.push(warning(
                            Some(act),
                            format!(
                                "correlation set {cset} listed for both initiate and assert on reply"
                            ),
                        ));
                    }
                }
            }
            ActivityKind::Invoke {
                partner_link,
                input_variable,
                output_variable,
                ..
            } => {
                check_partner_link(model, act, *partner_link, &mut issues);
                check_variable(model, act, *input_variable, &mut issues);
                check_variable(model, act, *output_variable, &mut issues);
            }
            ActivityKind::Assign { copies } => {
                for copy in copies {
                    check_variable(model, act, Some(copy.to), &mut issues);
                    if let crate::model::CopySource::Variable(v) = &copy.from {
                        check_variable(model, act, Some(*v), &mut issues);
                    }
                }
            }
            ActivityKind::While { condition, .. } => {
                check_condition(model, act, condition, &mut issues);
            }
            ActivityKind::If { branches, .. } => {
                if branches.is_empty() {
                    issues.push(error(Some(act), "if with no branches".to_string()));
                }
                for branch in branches {
                    check_condition(model, act, &branch.condition, &mut issues);
                }
            }
            ActivityKind::Compensate { target_scope } => {
                if let Some(name) = target_scope {
                    if model.scope_by_name(name).is_none() {
                        issues.push(error(
                            Some(act),
                            format!("compensate targets unknown scope `{name}`"),
                        ));
                    }
                }
            }
            ActivityKind::Scope { fault_handlers, .. } => {
                let mut seen = HashSet::new();
                for (name, _) in &fault_handlers.catch {
                    if !seen.insert(name.as_str()) {
                        issues.push(error(
                            Some(act),
                            format!("duplicate catch for fault `{name}`"),
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    check_correlation_conflicts(model, &parent, &mut issues);
    issues
}

fn check_partner_link(
    model: &ProcessModel,
    act: ActId,
    link: LinkId,
    issues: &mut Vec<ValidationIssue>,
) {
    if model.partner_link(link).is_none() {
        issues.push(error(Some(act), format!("undeclared partner link {link}")));
    }
}

fn check_cset(model: &ProcessModel, act: ActId, cset: CsetId, issues: &mut Vec<ValidationIssue>) {
    if model.correlation_set(cset).is_none() {
        issues.push(error(Some(act), format!("undeclared correlation set {cset}")));
    }
}

fn check_correlations(
    model: &ProcessModel,
    act: ActId,
    correlations: &[CorrelationUse],
    issues: &mut Vec<ValidationIssue>,
) {
    for cu in correlations {
        check_cset(model, act, cu.cset, issues);
    }
}

fn check_variable(
    model: &ProcessModel,
    act: ActId,
    var: Option<VarId>,
    issues: &mut Vec<ValidationIssue>,
) {
    if let Some(v) = var {
        if model.variable(v).is_none() {
            issues.push(error(Some(act), format!("undeclared variable {v}")));
        }
    }
}

fn check_condition(
    model: &ProcessModel,
    act: ActId,
    condition: &Condition,
    issues: &mut Vec<ValidationIssue>,
) {
    match condition {
        Condition::Const(_) => {}
        Condition::VarTruthy(v) | Condition::VarEquals(v, _) => {
            check_variable(model, act, Some(*v), issues)
        }
    }
}

/// One statically-armable receive point: a receive activity or a pick arm.
struct ReceivePoint {
    act: ActId,
    partner_link: LinkId,
    operation: String,
    csets: Vec<CsetId>,
}

/// Two receives on the same (partner link, operation, correlation sets) that
/// could be armed at the same time cannot be told apart by the router; the
/// conflict is rejected here instead of surfacing as a runtime race.
fn check_correlation_conflicts(
    model: &ProcessModel,
    parent: &HashMap<ActId, ActId>,
    issues: &mut Vec<ValidationIssue>,
) {
    let mut points: Vec<ReceivePoint> = Vec::new();
    for (i, node) in model.activities.iter().enumerate() {
        let act = i as ActId;
        match &node.kind {
            ActivityKind::Receive {
                partner_link,
                operation,
                correlations,
                ..
            } => points.push(ReceivePoint {
                act,
                partner_link: *partner_link,
                operation: operation.clone(),
                csets: sorted_csets(correlations),
            }),
            ActivityKind::Pick { on_message, .. } => {
                // Arms of one pick are armed together by construction.
                for (a, arm_a) in on_message.iter().enumerate() {
                    for arm_b in &on_message[a + 1..] {
                        if arm_a.partner_link == arm_b.partner_link
                            && arm_a.operation == arm_b.operation
                            && sorted_csets(&arm_a.correlations)
                                == sorted_csets(&arm_b.correlations)
                        {
                            issues.push(error(
                                Some(act),
                                format!(
                                    "pick arms both match operation `{}` with identical correlation sets",
                                    arm_a.operation
                                ),
                            ));
                        }
                    }
                }
                for arm in on_message {
                    points.push(ReceivePoint {
                        act,
                        partner_link: arm.partner_link,
                        operation: arm.operation.clone(),
                        csets: sorted_csets(&arm.correlations),
                    });
                }
            }
            _ => {}
        }
    }

    for (a, pa) in points.iter().enumerate() {
        for pb in &points[a + 1..] {
            if pa.act == pb.act {
                continue;
            }
            if pa.partner_link != pb.partner_link
                || pa.operation != pb.operation
                || pa.csets != pb.csets
            {
                continue;
            }
            // Simultaneously armable iff their nearest common ancestor runs
            // branches concurrently.
            if let Some(nca) = nearest_common_ancestor(parent, pa.act, pb.act) {
                if matches!(
                    model.activity(nca).map(|n| &n.kind),
                    Some(ActivityKind::Flow { .. })
                ) {
                    issues.push(error(
                        Some(pb.act),
                        format!(
                            "receive for operation `{}` conflicts with activity {} armed concurrently under flow {}",
                            pb.operation, pa.act, nca
                        ),
                    ));
                }
            }
        }
    }
}

fn sorted_csets(correlations: &[CorrelationUse]) -> Vec<CsetId> {
    let mut ids: Vec<CsetId> = correlations.iter().map(|c| c.cset).collect();
    ids.sort_unstable();
    ids
}

fn nearest_common_ancestor(
    parent: &HashMap<ActId, ActId>,
    a: ActId,
    b: ActId,
) -> Option<ActId> {
    let mut seen = HashSet::new();
    let mut cursor = Some(a);
    while let Some(id) = cursor {
        seen.insert(id);
        cursor = parent.get(&id).copied();
    }
    let mut cursor = Some(b);
    while let Some(id) = cursor {
        if seen.contains(&id) {
            return Some(id);
        }
        cursor = parent.get(&id).copied();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivityKind, ModelBuilder, OnMessage};

    fn receive(pl: LinkId, op: &str, csets: &[(CsetId, bool)]) -> ActivityKind {
        ActivityKind::Receive {
            partner_link: pl,
            operation: op.to_string(),
            variable: None,
            correlations: csets
                .iter()
                .map(|&(cset, initiate)| CorrelationUse { cset, initiate })
                .collect(),
            create_instance: false,
        }
    }

    #[test]
    fn well_formed_model_validates_clean() {
        let mut b = ModelBuilder::new("ok");
        let pl = b.partner_link("client");
        let cset = b.correlation_set("order", &["orderId"]);
        let r1 = b.activity(receive(pl, "place", &[(cset, true)]));
        let r2 = b.activity(receive(pl, "confirm", &[(cset, false)]));
        let root = b.activity(ActivityKind::Sequence {
            children: vec![r1, r2],
        });
        let model = b.build(root);
        let issues = validate_model(&model);
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn pick_with_no_alternatives_is_rejected() {
        let mut b = ModelBuilder::new("bad");
        let root = b.activity(ActivityKind::Pick {
            on_message: vec![],
            on_alarm: None,
            create_instance: false,
        });
        let model = b.build(root);
        let issues = validate_model(&model);
        assert!(has_errors(&issues));
        assert!(issues.iter().any(|i| i.message.contains("no alternatives")));
    }

    #[test]
    fn undeclared_references_are_rejected() {
        let mut b = ModelBuilder::new("bad");
        let root = b.activity(receive(9, "op", &[(7, true)]));
        let model = b.build(root);
        let issues = validate_model(&model);
        assert!(issues.iter().any(|i| i.message.contains("partner link")));
        assert!(issues.iter().any(|i| i.message.contains("correlation set")));
    }

    #[test]
    fn concurrent_identical_receives_are_a_conflict() {
        let mut b = ModelBuilder::new("conflict");
        let pl = b.partner_link("client");
        let cset = b.correlation_set("order", &["orderId"]);
        let r1 = b.activity(receive(pl, "confirm", &[(cset, false)]));
        let r2 = b.activity(receive(pl, "confirm", &[(cset, false)]));
        let root = b.activity(ActivityKind::Flow {
            children: vec![r1, r2],
        });
        let model = b.build(root);
        let issues = validate_model(&model);
        assert!(has_errors(&issues));
        assert!(issues.iter().any(|i| i.message.contains("conflicts")));
    }

    #[test]
    fn sequential_identical_receives_are_fine() {
        let mut b = ModelBuilder::new("sequential");
        let pl = b.partner_link("client");
        let cset = b.correlation_set("order", &["orderId"]);
        let r1 = b.activity(receive(pl, "confirm", &[(cset, false)]));
        let r2 = b.activity(receive(pl, "confirm", &[(cset, false)]));
        let root = b.activity(ActivityKind::Sequence {
            children: vec![r1, r2],
        });
        let model = b.build(root);
        assert!(!has_errors(&validate_model(&model)));
    }

    #[test]
    fn identical_pick_arms_are_a_conflict() {
        let mut b = ModelBuilder::new("pick-conflict");
        let pl = b.partner_link("client");
        let body1 = b.activity(ActivityKind::Empty);
        let body2 = b.activity(ActivityKind::Empty);
        let root = b.activity(ActivityKind::Pick {
            on_message: vec![
                OnMessage {
                    partner_link: pl,
                    operation: "go".to_string(),
                    variable: None,
                    correlations: vec![],
                    body: body1,
                },
                OnMessage {
                    partner_link: pl,
                    operation: "go".to_string(),
                    variable: None,
                    correlations: vec![],
                    body: body2,
                },
            ],
            on_alarm: None,
            create_instance: false,
        });
        let model = b.build(root);
        let issues = validate_model(&model);
        assert!(has_errors(&issues));
    }

    #[test]
    fn compensate_unknown_scope_is_rejected() {
        let mut b = ModelBuilder::new("bad-comp");
        let root = b.activity(ActivityKind::Compensate {
            target_scope: Some("missing".to_string()),
        });
        let model = b.build(root);
        let issues = validate_model(&model);
        assert!(has_errors(&issues));
        assert!(issues.iter().any(|i| i.message.contains("unknown scope")));
    }

    #[test]
    fn shared_child_ownership_is_rejected() {
        let mut b = ModelBuilder::new("dag");
        let shared = b.activity(ActivityKind::Empty);
        let s1 = b.activity(ActivityKind::Sequence {
            children: vec![shared],
        });
        let s2 = b.activity(ActivityKind::Sequence {
            children: vec![shared],
        });
        let root = b.activity(ActivityKind::Flow {
            children: vec![s1, s2],
        });
        let model = b.build(root);
        let issues = validate_model(&model);
        assert!(issues.iter().any(|i| i.message.contains("owned by both")));
    }
}
