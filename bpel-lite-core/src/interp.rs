//! The activity interpreter: advances one continuation at a time.
//!
//! `advance` dispatches on the continuation's activity kind and the incoming
//! event, mutates instance state under the caller's per-instance lock, and
//! returns the effects the engine must apply (spawn children, register
//! waits, arm timers, send messages, report completions). The interpreter
//! itself never touches the router, binding, store, or clock beyond reading
//! `now_ms` for alarm deadlines.

use crate::binding::{replace_url_template, simple_text, OutboundMessage, UrlReplacementError};
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::faults;
use crate::model::{ActivityKind, CorrelationUse, OnMessage, ProcessModel};
use crate::router::{build_constraints, CorrelationConstraint};
use crate::types::*;
use std::collections::BTreeMap;
use tracing::debug;

// ─── Events & effects ─────────────────────────────────────────

/// Outcome of a two-way invoke, delivered by the binding layer.
#[derive(Clone, Debug)]
pub enum InvokeResult {
    Reply(Message),
    Fault(FaultInfo),
}

/// One unit of work delivered to a continuation.
#[derive(Clone, Debug)]
pub enum ContEvent {
    Start,
    ChildCompleted {
        child: ContId,
        completion: Completion,
    },
    /// A child subtree was forcibly terminated (flow sibling cancellation).
    ChildCancelled {
        child: ContId,
    },
    MessageDelivered {
        wait_id: WaitId,
        message: Message,
    },
    InvokeResolved {
        mex_id: MexId,
        result: InvokeResult,
    },
    TimerFired {
        wait_id: WaitId,
    },
}

/// Side effects of one `advance` step, applied by the engine in order.
#[derive(Clone, Debug)]
pub enum Effect {
    /// A child continuation was allocated; the engine queues its Start.
    SpawnedChild { child: ContId },
    /// The continuation finished; the engine removes it and notifies the
    /// parent (or finalizes the instance at the root).
    Completed {
        cont: ContId,
        completion: Completion,
    },
    /// Register a pending receive with the correlation router.
    Register {
        cont: ContId,
        wait_id: WaitId,
        partner_link: String,
        operation: String,
        constraints: Vec<CorrelationConstraint>,
    },
    Unregister {
        wait_id: WaitId,
    },
    ArmTimer {
        cont: ContId,
        wait_id: WaitId,
        deadline_ms: u64,
    },
    CancelTimer {
        wait_id: WaitId,
    },
    /// Hand an outbound message to the binding. `mex_id` is set for a
    /// two-way invoke expecting a correlated reply.
    SendOutbound {
        cont: ContId,
        mex_id: Option<MexId>,
        out: OutboundMessage,
    },
    /// Forcibly terminate the subtree rooted at `child`, then deliver
    /// `ChildCancelled` to `notify`.
    CancelSubtree {
        child: ContId,
        notify: ContId,
    },
    Audit(RuntimeEvent),
}

// ─── Interpreter ──────────────────────────────────────────────

pub struct Interpreter<'a> {
    model: &'a ProcessModel,
}

impl<'a> Interpreter<'a> {
    pub fn new(model: &'a ProcessModel) -> Self {
        Self { model }
    }

    /// Advance one continuation by one event.
    pub fn advance(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        event: ContEvent,
    ) -> Result<Vec<Effect>, EngineError> {
        let Some(cont) = inst.cont(cont_id) else {
            // Late event for a completed or cancelled continuation.
            debug!(cont_id, "event for dead continuation ignored");
            return Ok(Vec::new());
        };
        let act_id = cont.activity;
        let node = self
            .model
            .activity(act_id)
            .ok_or(EngineError::MissingActivity(act_id))?
            .clone();

        match node.kind {
            ActivityKind::Empty => self.on_leaf_start(inst, cont_id, event, |_| Ok(Vec::new())),

            ActivityKind::Assign { copies } => {
                self.on_leaf_start(inst, cont_id, event, |inst| {
                    let mut effects = Vec::new();
                    for copy in &copies {
                        let value = match &copy.from {
                            crate::model::CopySource::Literal(v) => v.clone(),
                            crate::model::CopySource::Variable(var) => inst
                                .variables
                                .get(var)
                                .cloned()
                                .ok_or_else(|| {
                                    FaultInfo::named(faults::FAULT_UNINITIALIZED_VARIABLE)
                                })?,
                        };
                        inst.variables.insert(copy.to, value);
                        effects.push(Effect::Audit(RuntimeEvent::VariableWritten {
                            var: copy.to,
                        }));
                    }
                    Ok(effects)
                })
            }

            ActivityKind::Throw {
                fault_name,
                fault_data,
            } => match event {
                ContEvent::Start => {
                    let fault = FaultInfo {
                        name: fault_name,
                        data: fault_data,
                        activity_path: Vec::new(),
                    };
                    Ok(self.raise(inst, cont_id, fault))
                }
                _ => Ok(self.ignore(cont_id, &event)),
            },

            ActivityKind::Sequence { children } => {
                self.advance_sequence(inst, cont_id, &children, event)
            }
            ActivityKind::Flow { children } => self.advance_flow(inst, cont_id, &children, event),
            ActivityKind::While { condition, body } => {
                self.advance_while(inst, cont_id, &condition, body, event)
            }
            ActivityKind::If {
                branches,
                else_branch,
            } => self.advance_if(inst, cont_id, &branches, else_branch, event),
            ActivityKind::Pick {
                on_message,
                on_alarm,
                ..
            } => self.advance_pick(inst, cont_id, &on_message, &on_alarm, event),
            ActivityKind::Receive {
                partner_link,
                operation,
                variable,
                correlations,
                ..
            } => self.advance_receive(
                inst,
                cont_id,
                partner_link,
                &operation,
                variable,
                &correlations,
                event,
            ),
            ActivityKind::Reply {
                partner_link,
                operation,
                variable,
                fault_name,
                message_exchange,
                init_correlations,
                assert_correlations,
            } => match event {
                ContEvent::Start => self.run_reply(
                    inst,
                    cont_id,
                    partner_link,
                    &operation,
                    variable,
                    fault_name,
                    &message_exchange,
                    &init_correlations,
                    &assert_correlations,
                ),
                _ => Ok(self.ignore(cont_id, &event)),
            },
            ActivityKind::Invoke {
                partner_link,
                operation,
                input_variable,
                output_variable,
                two_way,
            } => self.advance_invoke(
                inst,
                cont_id,
                partner_link,
                &operation,
                input_variable,
                output_variable,
                two_way,
                event,
            ),
            ActivityKind::Compensate { target_scope } => {
                self.advance_compensate(inst, cont_id, target_scope.as_deref(), event)
            }
            ActivityKind::Scope {
                body,
                compensation_handler,
                fault_handlers,
                ..
            } => self.advance_scope(
                inst,
                cont_id,
                act_id,
                body,
                &fault_handlers,
                compensation_handler,
                event,
            ),
        }
    }

    // ── Helpers ──

    fn spawn(
        &self,
        inst: &mut InstanceState,
        parent: ContId,
        activity: ActId,
        effects: &mut Vec<Effect>,
    ) -> Result<ContId, EngineError> {
        let kind = &self
            .model
            .activity(activity)
            .ok_or(EngineError::MissingActivity(activity))?
            .kind;
        let state = initial_state(kind);
        self.spawn_with_state(inst, parent, activity, state, effects)
    }

    fn spawn_with_state(
        &self,
        inst: &mut InstanceState,
        parent: ContId,
        activity: ActId,
        state: ContState,
        effects: &mut Vec<Effect>,
    ) -> Result<ContId, EngineError> {
        let child = inst.alloc_cont(activity, Some(parent), state);
        effects.push(Effect::SpawnedChild { child });
        Ok(child)
    }

    /// Raise a fault at a continuation: stamp the activity path, audit, and
    /// complete faulted.
    fn raise(&self, inst: &InstanceState, cont_id: ContId, fault: FaultInfo) -> Vec<Effect> {
        let fault = faults::at(self.model, inst, cont_id, fault);
        vec![
            Effect::Audit(RuntimeEvent::FaultRaised {
                fault: fault.clone(),
            }),
            Effect::Completed {
                cont: cont_id,
                completion: Completion::Fault(fault),
            },
        ]
    }

    fn ignore(&self, cont_id: ContId, event: &ContEvent) -> Vec<Effect> {
        debug!(cont_id, ?event, "unexpected event ignored");
        Vec::new()
    }

    /// Leaf activities only react to Start; `run` produces their effects and
    /// they complete normally unless it faults.
    fn on_leaf_start(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        event: ContEvent,
        run: impl FnOnce(&mut InstanceState) -> Result<Vec<Effect>, FaultInfo>,
    ) -> Result<Vec<Effect>, EngineError> {
        match event {
            ContEvent::Start => match run(inst) {
                Ok(mut effects) => {
                    effects.push(Effect::Completed {
                        cont: cont_id,
                        completion: Completion::Normal,
                    });
                    Ok(effects)
                }
                Err(fault) => Ok(self.raise(inst, cont_id, fault)),
            },
            _ => Ok(self.ignore(cont_id, &event)),
        }
    }

    /// Initiate or assert correlation sets from an inbound message. Once a
    /// key is set it is immutable; a differing value is a violation.
    fn apply_correlations(
        &self,
        inst: &mut InstanceState,
        uses: &[CorrelationUse],
        message: &Message,
        effects: &mut Vec<Effect>,
    ) -> Result<(), FaultInfo> {
        for cu in uses {
            let decl = self
                .model
                .correlation_set(cu.cset)
                .ok_or_else(|| FaultInfo::named(faults::FAULT_CORRELATION_VIOLATION))?;
            let key = crate::router::message_key(&decl.properties, &message.properties)
                .ok_or_else(|| {
                    FaultInfo::with_data(
                        faults::FAULT_CORRELATION_VIOLATION,
                        Value::String(format!(
                            "message lacks properties of correlation set `{}`",
                            decl.name
                        )),
                    )
                })?;
            let slot = inst.correlations.entry(cu.cset).or_default();
            match &slot.values {
                Some(existing) if *existing == key => {}
                Some(_) => {
                    return Err(FaultInfo::with_data(
                        faults::FAULT_CORRELATION_VIOLATION,
                        Value::String(format!(
                            "correlation set `{}` already initialized with a different key",
                            decl.name
                        )),
                    ));
                }
                None => {
                    if !cu.initiate {
                        return Err(FaultInfo::named(faults::FAULT_CORRELATION_VIOLATION));
                    }
                    slot.values = Some(key.clone());
                    effects.push(Effect::Audit(RuntimeEvent::CorrelationInitiated {
                        cset: cu.cset,
                        key,
                    }));
                }
            }
        }
        Ok(())
    }

    /// Build the endpoint URL for a partner link carrying an address
    /// template, taking part values from the outbound payload.
    fn endpoint_for(
        &self,
        link: LinkId,
        payload: &Value,
    ) -> Result<Option<String>, UrlReplacementError> {
        let Some(decl) = self.model.partner_links.get(link as usize) else {
            return Ok(None);
        };
        let Some(template) = &decl.address_template else {
            return Ok(None);
        };
        let mut values = BTreeMap::new();
        for part in &decl.parts {
            let value = payload
                .as_object()
                .and_then(|o| o.get(part))
                .cloned()
                .unwrap_or(Value::Null);
            values.insert(part.clone(), value);
        }
        replace_url_template(template, &decl.parts, &values).map(Some)
    }

    fn partner_link_name(&self, link: LinkId) -> Result<String, EngineError> {
        self.model
            .partner_link(link)
            .map(|p| p.name.clone())
            .ok_or(EngineError::MissingPartnerLink(link))
    }

    // ── Sequence ──

    fn advance_sequence(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        children: &[ActId],
        event: ContEvent,
    ) -> Result<Vec<Effect>, EngineError> {
        match event {
            ContEvent::Start => {
                if children.is_empty() {
                    return Ok(vec![Effect::Completed {
                        cont: cont_id,
                        completion: Completion::Normal,
                    }]);
                }
                let mut effects = Vec::new();
                self.spawn(inst, cont_id, children[0], &mut effects)?;
                if let Some(c) = inst.cont_mut(cont_id) {
                    c.state = ContState::Sequence { next: 1 };
                    c.wait = WaitState::Children;
                }
                Ok(effects)
            }
            ContEvent::ChildCompleted { completion, .. } => match completion {
                Completion::Normal | Completion::Compensated => {
                    let next = match inst.cont(cont_id).map(|c| &c.state) {
                        Some(ContState::Sequence { next }) => *next,
                        _ => children.len(),
                    };
                    if next < children.len() {
                        let mut effects = Vec::new();
                        self.spawn(inst, cont_id, children[next], &mut effects)?;
                        if let Some(c) = inst.cont_mut(cont_id) {
                            c.state = ContState::Sequence { next: next + 1 };
                        }
                        Ok(effects)
                    } else {
                        Ok(vec![Effect::Completed {
                            cont: cont_id,
                            completion: Completion::Normal,
                        }])
                    }
                }
                // A child fault aborts remaining siblings (none are running)
                // and propagates immediately.
                Completion::Fault(f) => Ok(vec![Effect::Completed {
                    cont: cont_id,
                    completion: Completion::Fault(f),
                }]),
            },
            _ => Ok(self.ignore(cont_id, &event)),
        }
    }

    // ── Flow ──

    fn advance_flow(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        children: &[ActId],
        event: ContEvent,
    ) -> Result<Vec<Effect>, EngineError> {
        match event {
            ContEvent::Start => {
                if children.is_empty() {
                    return Ok(vec![Effect::Completed {
                        cont: cont_id,
                        completion: Completion::Normal,
                    }]);
                }
                let mut effects = Vec::new();
                for &child_act in children {
                    self.spawn(inst, cont_id, child_act, &mut effects)?;
                }
                if let Some(c) = inst.cont_mut(cont_id) {
                    c.state = ContState::Flow {
                        remaining: children.len(),
                        first_fault: None,
                        cancelling: false,
                    };
                    c.wait = WaitState::Children;
                }
                Ok(effects)
            }
            ContEvent::ChildCompleted { ref completion, .. } => {
                let (mut remaining, mut first_fault, mut cancelling) =
                    match inst.cont(cont_id).map(|c| c.state.clone()) {
                        Some(ContState::Flow {
                            remaining,
                            first_fault,
                            cancelling,
                        }) => (remaining, first_fault, cancelling),
                        _ => return Ok(self.ignore(cont_id, &event)),
                    };
                remaining = remaining.saturating_sub(1);
                let mut effects = Vec::new();
                if let Completion::Fault(f) = completion {
                    // The first fault encountered is the one propagated.
                    if first_fault.is_none() {
                        first_fault = Some(f.clone());
                    }
                    if !cancelling {
                        cancelling = true;
                        let running: Vec<ContId> = inst
                            .cont(cont_id)
                            .map(|c| c.children.clone())
                            .unwrap_or_default();
                        for child in running {
                            effects.push(Effect::CancelSubtree {
                                child,
                                notify: cont_id,
                            });
                        }
                    }
                }
                self.finish_flow(inst, cont_id, remaining, first_fault, cancelling, effects)
            }
            ContEvent::ChildCancelled { .. } => {
                let (remaining, first_fault, cancelling) =
                    match inst.cont(cont_id).map(|c| c.state.clone()) {
                        Some(ContState::Flow {
                            remaining,
                            first_fault,
                            cancelling,
                        }) => (remaining.saturating_sub(1), first_fault, cancelling),
                        _ => return Ok(self.ignore(cont_id, &event)),
                    };
                self.finish_flow(inst, cont_id, remaining, first_fault, cancelling, Vec::new())
            }
            _ => Ok(self.ignore(cont_id, &event)),
        }
    }

    fn finish_flow(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        remaining: usize,
        first_fault: Option<FaultInfo>,
        cancelling: bool,
        mut effects: Vec<Effect>,
    ) -> Result<Vec<Effect>, EngineError> {
        if remaining == 0 {
            let completion = match first_fault {
                Some(f) => Completion::Fault(f),
                None => Completion::Normal,
            };
            effects.push(Effect::Completed {
                cont: cont_id,
                completion,
            });
        } else if let Some(c) = inst.cont_mut(cont_id) {
            c.state = ContState::Flow {
                remaining,
                first_fault,
                cancelling,
            };
        }
        Ok(effects)
    }

    // ── While ──

    fn advance_while(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        condition: &crate::model::Condition,
        body: ActId,
        event: ContEvent,
    ) -> Result<Vec<Effect>, EngineError> {
        let iterate = |interp: &Self,
                       inst: &mut InstanceState,
                       iterations: u32|
         -> Result<Vec<Effect>, EngineError> {
            match condition.eval(&inst.variables) {
                Err(fault) => Ok(interp.raise(inst, cont_id, fault)),
                Ok(false) => Ok(vec![Effect::Completed {
                    cont: cont_id,
                    completion: Completion::Normal,
                }]),
                Ok(true) => {
                    let mut effects = Vec::new();
                    interp.spawn(inst, cont_id, body, &mut effects)?;
                    if let Some(c) = inst.cont_mut(cont_id) {
                        c.state = ContState::While {
                            iterations: iterations + 1,
                        };
                        c.wait = WaitState::Children;
                    }
                    Ok(effects)
                }
            }
        };

        match event {
            ContEvent::Start => iterate(self, inst, 0),
            ContEvent::ChildCompleted { completion, .. } => match completion {
                Completion::Normal | Completion::Compensated => {
                    let iterations = match inst.cont(cont_id).map(|c| &c.state) {
                        Some(ContState::While { iterations }) => *iterations,
                        _ => 0,
                    };
                    iterate(self, inst, iterations)
                }
                // A body fault propagates without further iteration.
                Completion::Fault(f) => Ok(vec![Effect::Completed {
                    cont: cont_id,
                    completion: Completion::Fault(f),
                }]),
            },
            _ => Ok(self.ignore(cont_id, &event)),
        }
    }

    // ── If ──

    fn advance_if(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        branches: &[crate::model::IfBranch],
        else_branch: Option<ActId>,
        event: ContEvent,
    ) -> Result<Vec<Effect>, EngineError> {
        match event {
            ContEvent::Start => {
                for branch in branches {
                    match branch.condition.eval(&inst.variables) {
                        Err(fault) => return Ok(self.raise(inst, cont_id, fault)),
                        Ok(true) => {
                            let mut effects = Vec::new();
                            self.spawn(inst, cont_id, branch.body, &mut effects)?;
                            if let Some(c) = inst.cont_mut(cont_id) {
                                c.wait = WaitState::Children;
                            }
                            return Ok(effects);
                        }
                        Ok(false) => {}
                    }
                }
                if let Some(body) = else_branch {
                    let mut effects = Vec::new();
                    self.spawn(inst, cont_id, body, &mut effects)?;
                    if let Some(c) = inst.cont_mut(cont_id) {
                        c.wait = WaitState::Children;
                    }
                    Ok(effects)
                } else {
                    Ok(vec![Effect::Completed {
                        cont: cont_id,
                        completion: Completion::Normal,
                    }])
                }
            }
            ContEvent::ChildCompleted { completion, .. } => Ok(vec![Effect::Completed {
                cont: cont_id,
                completion: match completion {
                    Completion::Compensated => Completion::Normal,
                    other => other,
                },
            }]),
            _ => Ok(self.ignore(cont_id, &event)),
        }
    }

    // ── Receive ──

    #[allow(clippy::too_many_arguments)]
    fn advance_receive(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        partner_link: LinkId,
        operation: &str,
        variable: Option<VarId>,
        correlations: &[CorrelationUse],
        event: ContEvent,
    ) -> Result<Vec<Effect>, EngineError> {
        match event {
            ContEvent::Start => {
                let constraints = match build_constraints(self.model, inst, correlations) {
                    Ok(c) => c,
                    Err(fault) => return Ok(self.raise(inst, cont_id, fault)),
                };
                let wait_id = inst.fresh_wait_id();
                if let Some(c) = inst.cont_mut(cont_id) {
                    c.wait = WaitState::Msg { wait_id };
                }
                Ok(vec![Effect::Register {
                    cont: cont_id,
                    wait_id,
                    partner_link: self.partner_link_name(partner_link)?,
                    operation: operation.to_string(),
                    constraints,
                }])
            }
            ContEvent::MessageDelivered { wait_id, message } => {
                let expected = match inst.cont(cont_id).map(|c| &c.wait) {
                    Some(WaitState::Msg { wait_id }) => *wait_id,
                    _ => return Ok(Vec::new()),
                };
                if expected != wait_id {
                    return Ok(Vec::new());
                }
                let mut effects = Vec::new();
                if let Err(fault) =
                    self.apply_correlations(inst, correlations, &message, &mut effects)
                {
                    let mut out = self.raise(inst, cont_id, fault);
                    effects.append(&mut out);
                    return Ok(effects);
                }
                if let Some(var) = variable {
                    inst.variables.insert(var, message.payload.clone());
                    effects.push(Effect::Audit(RuntimeEvent::VariableWritten { var }));
                }
                if let Some(c) = inst.cont_mut(cont_id) {
                    c.wait = WaitState::Ready;
                }
                effects.push(Effect::Completed {
                    cont: cont_id,
                    completion: Completion::Normal,
                });
                Ok(effects)
            }
            _ => Ok(self.ignore(cont_id, &event)),
        }
    }

    // ── Pick ──

    fn advance_pick(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        on_message: &[OnMessage],
        on_alarm: &Option<crate::model::OnAlarm>,
        event: ContEvent,
    ) -> Result<Vec<Effect>, EngineError> {
        match event {
            ContEvent::Start => {
                let mut effects = Vec::new();
                let mut arms = Vec::with_capacity(on_message.len());
                for arm in on_message {
                    let constraints = match build_constraints(self.model, inst, &arm.correlations)
                    {
                        Ok(c) => c,
                        Err(fault) => return Ok(self.raise(inst, cont_id, fault)),
                    };
                    let wait_id = inst.fresh_wait_id();
                    arms.push(wait_id);
                    effects.push(Effect::Register {
                        cont: cont_id,
                        wait_id,
                        partner_link: self.partner_link_name(arm.partner_link)?,
                        operation: arm.operation.clone(),
                        constraints,
                    });
                }
                let mut alarm = None;
                let mut alarm_deadline_ms = None;
                if let Some(a) = on_alarm {
                    let wait_id = inst.fresh_wait_id();
                    let deadline = now_ms() as u64 + a.duration_ms;
                    alarm = Some(wait_id);
                    alarm_deadline_ms = Some(deadline);
                    effects.push(Effect::ArmTimer {
                        cont: cont_id,
                        wait_id,
                        deadline_ms: deadline,
                    });
                }
                if let Some(c) = inst.cont_mut(cont_id) {
                    c.state = ContState::Pick {
                        arms,
                        alarm,
                        alarm_deadline_ms,
                        chosen: false,
                    };
                    c.wait = WaitState::PickArms;
                }
                Ok(effects)
            }
            ContEvent::MessageDelivered { wait_id, ref message } => {
                let (arms, alarm, chosen) = match inst.cont(cont_id).map(|c| c.state.clone()) {
                    Some(ContState::Pick {
                        arms,
                        alarm,
                        chosen,
                        ..
                    }) => (arms, alarm, chosen),
                    _ => return Ok(self.ignore(cont_id, &event)),
                };
                let Some(index) = arms.iter().position(|&w| w == wait_id) else {
                    return Ok(Vec::new());
                };
                if chosen {
                    return Ok(vec![Effect::Audit(RuntimeEvent::SignalIgnored {
                        description: format!("late message for resolved pick wait {wait_id}"),
                    })]);
                }
                // First match wins: disarm every other alternative.
                let mut effects = self.disarm_pick(cont_id, &arms, alarm, Some(wait_id));
                let arm = &on_message[index];
                if let Err(fault) =
                    self.apply_correlations(inst, &arm.correlations, message, &mut effects)
                {
                    let mut out = self.raise(inst, cont_id, fault);
                    effects.append(&mut out);
                    return Ok(effects);
                }
                if let Some(var) = arm.variable {
                    inst.variables.insert(var, message.payload.clone());
                    effects.push(Effect::Audit(RuntimeEvent::VariableWritten { var }));
                }
                self.choose_pick_branch(inst, cont_id, arm.body, effects)
            }
            ContEvent::TimerFired { wait_id } => {
                let (arms, alarm, chosen) = match inst.cont(cont_id).map(|c| c.state.clone()) {
                    Some(ContState::Pick {
                        arms,
                        alarm,
                        chosen,
                        ..
                    }) => (arms, alarm, chosen),
                    _ => return Ok(self.ignore(cont_id, &event)),
                };
                if alarm != Some(wait_id) || chosen {
                    return Ok(Vec::new());
                }
                let effects = self.disarm_pick(cont_id, &arms, None, None);
                let body = on_alarm
                    .as_ref()
                    .map(|a| a.body)
                    .ok_or(EngineError::MissingContinuation(cont_id))?;
                self.choose_pick_branch(inst, cont_id, body, effects)
            }
            ContEvent::ChildCompleted { completion, .. } => Ok(vec![Effect::Completed {
                cont: cont_id,
                completion: match completion {
                    Completion::Compensated => Completion::Normal,
                    other => other,
                },
            }]),
            _ => Ok(self.ignore(cont_id, &event)),
        }
    }

    fn disarm_pick(
        &self,
        cont_id: ContId,
        arms: &[WaitId],
        alarm: Option<WaitId>,
        winner: Option<WaitId>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        for &w in arms {
            if Some(w) != winner {
                effects.push(Effect::Unregister { wait_id: w });
                effects.push(Effect::Audit(RuntimeEvent::PickArmDisarmed {
                    cont_id,
                    wait_id: w,
                }));
            }
        }
        if let Some(a) = alarm {
            effects.push(Effect::CancelTimer { wait_id: a });
            effects.push(Effect::Audit(RuntimeEvent::PickArmDisarmed {
                cont_id,
                wait_id: a,
            }));
        }
        effects
    }

    fn choose_pick_branch(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        body: ActId,
        mut effects: Vec<Effect>,
    ) -> Result<Vec<Effect>, EngineError> {
        self.spawn(inst, cont_id, body, &mut effects)?;
        if let Some(c) = inst.cont_mut(cont_id) {
            if let ContState::Pick { chosen, .. } = &mut c.state {
                *chosen = true;
            }
            c.wait = WaitState::Children;
        }
        Ok(effects)
    }

    // ── Invoke ──

    #[allow(clippy::too_many_arguments)]
    fn advance_invoke(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        partner_link: LinkId,
        operation: &str,
        input_variable: Option<VarId>,
        output_variable: Option<VarId>,
        two_way: bool,
        event: ContEvent,
    ) -> Result<Vec<Effect>, EngineError> {
        match event {
            ContEvent::Start => {
                let payload = match input_variable {
                    Some(var) => match inst.variables.get(&var) {
                        Some(v) => v.clone(),
                        None => {
                            return Ok(self.raise(
                                inst,
                                cont_id,
                                FaultInfo::named(faults::FAULT_UNINITIALIZED_VARIABLE),
                            ))
                        }
                    },
                    None => Value::Null,
                };
                let endpoint_url = match self.endpoint_for(partner_link, &payload) {
                    Ok(url) => url,
                    Err(e) => {
                        return Ok(self.raise(
                            inst,
                            cont_id,
                            FaultInfo::with_data(
                                faults::FAULT_INVOKE_FAILURE,
                                Value::String(e.to_string()),
                            ),
                        ))
                    }
                };
                let pl_name = self.partner_link_name(partner_link)?;
                let mex_id = two_way.then(|| inst.fresh_mex_id());
                let out = OutboundMessage {
                    partner_link: pl_name.clone(),
                    operation: operation.to_string(),
                    endpoint_url,
                    fault_name: None,
                    message_exchange: mex_id.map(|m| m.to_string()).unwrap_or_default(),
                    message: Message::new(payload),
                };
                let mut effects = vec![
                    Effect::Audit(RuntimeEvent::InvokeSent {
                        cont_id,
                        mex_id,
                        partner_link: pl_name,
                        operation: operation.to_string(),
                    }),
                    Effect::SendOutbound {
                        cont: cont_id,
                        mex_id,
                        out,
                    },
                ];
                match mex_id {
                    Some(mex) => {
                        // Suspend until the correlated reply arrives.
                        if let Some(c) = inst.cont_mut(cont_id) {
                            c.wait = WaitState::Reply { mex_id: mex };
                        }
                    }
                    None => effects.push(Effect::Completed {
                        cont: cont_id,
                        completion: Completion::Normal,
                    }),
                }
                Ok(effects)
            }
            ContEvent::InvokeResolved { mex_id, result } => {
                let expected = match inst.cont(cont_id).map(|c| &c.wait) {
                    Some(WaitState::Reply { mex_id }) => *mex_id,
                    _ => return Ok(Vec::new()),
                };
                if expected != mex_id {
                    return Ok(Vec::new());
                }
                match result {
                    InvokeResult::Reply(message) => {
                        let mut effects = Vec::new();
                        if let Some(var) = output_variable {
                            inst.variables.insert(var, message.payload);
                            effects.push(Effect::Audit(RuntimeEvent::VariableWritten { var }));
                        }
                        if let Some(c) = inst.cont_mut(cont_id) {
                            c.wait = WaitState::Ready;
                        }
                        effects.push(Effect::Completed {
                            cont: cont_id,
                            completion: Completion::Normal,
                        });
                        Ok(effects)
                    }
                    InvokeResult::Fault(fault) => Ok(self.raise(inst, cont_id, fault)),
                }
            }
            _ => Ok(self.ignore(cont_id, &event)),
        }
    }

    // ── Reply ──

    #[allow(clippy::too_many_arguments)]
    fn run_reply(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        partner_link: LinkId,
        operation: &str,
        variable: Option<VarId>,
        fault_name: Option<String>,
        message_exchange: &str,
        init_correlations: &[CsetId],
        assert_correlations: &[CsetId],
    ) -> Result<Vec<Effect>, EngineError> {
        let payload = match variable {
            Some(var) => match inst.variables.get(&var) {
                Some(v) => v.clone(),
                None => {
                    return Ok(self.raise(
                        inst,
                        cont_id,
                        FaultInfo::named(faults::FAULT_UNINITIALIZED_VARIABLE),
                    ))
                }
            },
            None => Value::Null,
        };

        let mut effects = Vec::new();
        let mut properties = BTreeMap::new();

        // Initiating sets draw their key from the outgoing payload.
        for &cset in init_correlations {
            match self.init_correlation_from_payload(inst, cset, &payload, &mut effects) {
                Ok(key_props) => properties.extend(key_props),
                Err(fault) => {
                    let mut out = self.raise(inst, cont_id, fault);
                    effects.append(&mut out);
                    return Ok(effects);
                }
            }
        }
        // Asserted sets must already be initialized.
        for &cset in assert_correlations {
            let Some(decl) = self.model.correlation_set(cset) else {
                let f = FaultInfo::named(faults::FAULT_CORRELATION_VIOLATION);
                let mut out = self.raise(inst, cont_id, f);
                effects.append(&mut out);
                return Ok(effects);
            };
            match inst.correlations.get(&cset).and_then(|c| c.values.clone()) {
                Some(values) => {
                    for (p, v) in decl.properties.iter().zip(values) {
                        properties.insert(p.clone(), v);
                    }
                }
                None => {
                    let f = FaultInfo::with_data(
                        faults::FAULT_CORRELATION_VIOLATION,
                        Value::String(format!(
                            "correlation set `{}` not initialized at reply",
                            decl.name
                        )),
                    );
                    let mut out = self.raise(inst, cont_id, f);
                    effects.append(&mut out);
                    return Ok(effects);
                }
            }
        }

        let endpoint_url = match self.endpoint_for(partner_link, &payload) {
            Ok(url) => url,
            Err(e) => {
                let f = FaultInfo::with_data(
                    faults::FAULT_INVALID_REPLY,
                    Value::String(e.to_string()),
                );
                let mut out = self.raise(inst, cont_id, f);
                effects.append(&mut out);
                return Ok(effects);
            }
        };

        let pl_name = self.partner_link_name(partner_link)?;
        let out = OutboundMessage {
            partner_link: pl_name.clone(),
            operation: operation.to_string(),
            endpoint_url,
            fault_name: fault_name.clone(),
            message_exchange: message_exchange.to_string(),
            message: Message {
                properties,
                payload,
            },
        };
        effects.push(Effect::Audit(RuntimeEvent::ReplySent {
            cont_id,
            partner_link: pl_name,
            operation: operation.to_string(),
            fault: fault_name,
        }));
        effects.push(Effect::SendOutbound {
            cont: cont_id,
            mex_id: None,
            out,
        });
        effects.push(Effect::Completed {
            cont: cont_id,
            completion: Completion::Normal,
        });
        Ok(effects)
    }

    /// Initialize a correlation set from an outgoing payload object whose
    /// fields carry the set's property values. Returns the property pairs
    /// for the outbound message.
    fn init_correlation_from_payload(
        &self,
        inst: &mut InstanceState,
        cset: CsetId,
        payload: &Value,
        effects: &mut Vec<Effect>,
    ) -> Result<BTreeMap<String, String>, FaultInfo> {
        let decl = self
            .model
            .correlation_set(cset)
            .ok_or_else(|| FaultInfo::named(faults::FAULT_CORRELATION_VIOLATION))?;
        let mut key = Vec::with_capacity(decl.properties.len());
        let mut pairs = BTreeMap::new();
        for prop in &decl.properties {
            let value = payload
                .as_object()
                .and_then(|o| o.get(prop))
                .cloned()
                .unwrap_or(Value::Null);
            let text = simple_text(prop, &value).map_err(|e| {
                FaultInfo::with_data(
                    faults::FAULT_CORRELATION_VIOLATION,
                    Value::String(e.to_string()),
                )
            })?;
            pairs.insert(prop.clone(), text.clone());
            key.push(text);
        }
        let slot = inst.correlations.entry(cset).or_default();
        match &slot.values {
            Some(existing) if *existing == key => {}
            Some(_) => {
                return Err(FaultInfo::with_data(
                    faults::FAULT_CORRELATION_VIOLATION,
                    Value::String(format!(
                        "correlation set `{}` already initialized with a different key",
                        decl.name
                    )),
                ))
            }
            None => {
                slot.values = Some(key.clone());
                effects.push(Effect::Audit(RuntimeEvent::CorrelationInitiated {
                    cset,
                    key,
                }));
            }
        }
        Ok(pairs)
    }

    // ── Compensate ──

    fn advance_compensate(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        target: Option<&str>,
        event: ContEvent,
    ) -> Result<Vec<Effect>, EngineError> {
        match event {
            ContEvent::Start => {
                let queue = faults::take_for_compensation(inst, self.model, target);
                if queue.is_empty() {
                    return Ok(vec![Effect::Completed {
                        cont: cont_id,
                        completion: Completion::Normal,
                    }]);
                }
                let mut effects = Vec::new();
                let first = queue[0].clone();
                if let Some(c) = inst.cont_mut(cont_id) {
                    c.state = ContState::Compensate { queue };
                    c.wait = WaitState::Children;
                }
                self.start_scope_compensation(inst, cont_id, &first, &mut effects)?;
                Ok(effects)
            }
            ContEvent::ChildCompleted { ref completion, .. } => match completion {
                Completion::Compensated | Completion::Normal => {
                    let mut queue = match inst.cont(cont_id).map(|c| c.state.clone()) {
                        Some(ContState::Compensate { queue }) => queue,
                        _ => return Ok(self.ignore(cont_id, &event)),
                    };
                    let mut effects = Vec::new();
                    if !queue.is_empty() {
                        let done = queue.remove(0);
                        effects.push(Effect::Audit(RuntimeEvent::CompensationCompleted {
                            scope: done.scope,
                        }));
                    }
                    if let Some(next) = queue.first().cloned() {
                        if let Some(c) = inst.cont_mut(cont_id) {
                            c.state = ContState::Compensate { queue };
                        }
                        self.start_scope_compensation(inst, cont_id, &next, &mut effects)?;
                    } else {
                        if let Some(c) = inst.cont_mut(cont_id) {
                            c.state = ContState::Compensate { queue };
                        }
                        effects.push(Effect::Completed {
                            cont: cont_id,
                            completion: Completion::Normal,
                        });
                    }
                    Ok(effects)
                }
                // A faulting compensation handler propagates as an ordinary
                // fault from the compensating context.
                Completion::Fault(f) => Ok(vec![Effect::Completed {
                    cont: cont_id,
                    completion: Completion::Fault(f.clone()),
                }]),
            },
            _ => Ok(self.ignore(cont_id, &event)),
        }
    }

    fn start_scope_compensation(
        &self,
        inst: &mut InstanceState,
        parent: ContId,
        entry: &CompensableScope,
        effects: &mut Vec<Effect>,
    ) -> Result<(), EngineError> {
        effects.push(Effect::Audit(RuntimeEvent::CompensationStarted {
            scope: entry.scope,
        }));
        self.spawn_with_state(
            inst,
            parent,
            entry.scope,
            ContState::Scope {
                phase: ScopePhase::Compensation,
            },
            effects,
        )?;
        Ok(())
    }

    // ── Scope ──

    #[allow(clippy::too_many_arguments)]
    fn advance_scope(
        &self,
        inst: &mut InstanceState,
        cont_id: ContId,
        act_id: ActId,
        body: ActId,
        fault_handlers: &crate::model::FaultHandlerTable,
        compensation_handler: Option<ActId>,
        event: ContEvent,
    ) -> Result<Vec<Effect>, EngineError> {
        let phase = match inst.cont(cont_id).map(|c| c.state.clone()) {
            Some(ContState::Scope { phase }) => phase,
            _ => ScopePhase::Body,
        };
        match event {
            ContEvent::Start => match phase {
                ScopePhase::Compensation => {
                    let Some(handler) = compensation_handler else {
                        return Ok(vec![Effect::Completed {
                            cont: cont_id,
                            completion: Completion::Compensated,
                        }]);
                    };
                    let mut effects = Vec::new();
                    self.spawn(inst, cont_id, handler, &mut effects)?;
                    if let Some(c) = inst.cont_mut(cont_id) {
                        c.wait = WaitState::Compensating;
                    }
                    Ok(effects)
                }
                _ => {
                    let mut effects = Vec::new();
                    self.spawn(inst, cont_id, body, &mut effects)?;
                    if let Some(c) = inst.cont_mut(cont_id) {
                        c.wait = WaitState::Children;
                    }
                    Ok(effects)
                }
            },
            ContEvent::ChildCompleted { completion, .. } => match phase {
                ScopePhase::Body => match completion {
                    Completion::Normal | Completion::Compensated => {
                        let mut effects = Vec::new();
                        if compensation_handler.is_some() {
                            // Stay compensable instead of discarding state.
                            faults::push_compensable(inst, self.model, act_id);
                            effects.push(Effect::Audit(RuntimeEvent::ScopeCompensable {
                                scope: act_id,
                            }));
                        }
                        effects.push(Effect::Completed {
                            cont: cont_id,
                            completion: Completion::Normal,
                        });
                        Ok(effects)
                    }
                    Completion::Fault(fault) => {
                        match fault_handlers.handler_for(&fault.name) {
                            Some(handler) => {
                                let mut effects = vec![Effect::Audit(RuntimeEvent::FaultHandled {
                                    scope: act_id,
                                    fault_name: fault.name.clone(),
                                })];
                                if let Some(c) = inst.cont_mut(cont_id) {
                                    c.state = ContState::Scope {
                                        phase: ScopePhase::Handling { fault },
                                    };
                                }
                                self.spawn(inst, cont_id, handler, &mut effects)?;
                                Ok(effects)
                            }
                            // No handler: re-bubble to the enclosing scope.
                            None => Ok(vec![Effect::Completed {
                                cont: cont_id,
                                completion: Completion::Fault(fault),
                            }]),
                        }
                    }
                },
                ScopePhase::Handling { .. } => match completion {
                    // Handler finished: the fault is recovered locally.
                    Completion::Normal | Completion::Compensated => Ok(vec![Effect::Completed {
                        cont: cont_id,
                        completion: Completion::Normal,
                    }]),
                    Completion::Fault(f) => Ok(vec![Effect::Completed {
                        cont: cont_id,
                        completion: Completion::Fault(f),
                    }]),
                },
                ScopePhase::Compensation => match completion {
                    Completion::Normal | Completion::Compensated => Ok(vec![Effect::Completed {
                        cont: cont_id,
                        completion: Completion::Compensated,
                    }]),
                    Completion::Fault(f) => Ok(vec![Effect::Completed {
                        cont: cont_id,
                        completion: Completion::Fault(f),
                    }]),
                },
            },
            _ => Ok(self.ignore(cont_id, &event)),
        }
    }
}

/// Initial kind-specific state for a freshly spawned continuation.
pub(crate) fn initial_state(kind: &ActivityKind) -> ContState {
    match kind {
        ActivityKind::Sequence { .. } => ContState::Sequence { next: 0 },
        ActivityKind::Flow { .. } => ContState::Flow {
            remaining: 0,
            first_fault: None,
            cancelling: false,
        },
        ActivityKind::While { .. } => ContState::While { iterations: 0 },
        ActivityKind::Pick { .. } => ContState::Pick {
            arms: Vec::new(),
            alarm: None,
            alarm_deadline_ms: None,
            chosen: false,
        },
        ActivityKind::If { .. } => ContState::If,
        ActivityKind::Scope { .. } => ContState::Scope {
            phase: ScopePhase::Body,
        },
        ActivityKind::Compensate { .. } => ContState::Compensate { queue: Vec::new() },
        _ => ContState::Leaf,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivityKind, AssignCopy, Condition, CopySource, ModelBuilder};
    use serde_json::json;
    use uuid::Uuid;

    fn instance(model: &ProcessModel) -> InstanceState {
        InstanceState::new(Uuid::now_v7(), &model.name, model.model_version)
    }

    fn root_cont(inst: &mut InstanceState, model: &ProcessModel) -> ContId {
        let id = inst.alloc_cont(model.root, None, initial_state(
            &model.activity(model.root).unwrap().kind,
        ));
        inst.root_cont = id;
        id
    }

    fn completion_of(effects: &[Effect]) -> Option<&Completion> {
        effects.iter().find_map(|e| match e {
            Effect::Completed { completion, .. } => Some(completion),
            _ => None,
        })
    }

    fn spawned(effects: &[Effect]) -> Vec<ContId> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::SpawnedChild { child } => Some(*child),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_sequence_completes_immediately() {
        let mut b = ModelBuilder::new("t");
        let root = b.activity(ActivityKind::Sequence { children: vec![] });
        let model = b.build(root);
        let mut inst = instance(&model);
        let root_id = root_cont(&mut inst, &model);

        let effects = Interpreter::new(&model)
            .advance(&mut inst, root_id, ContEvent::Start)
            .unwrap();
        assert_eq!(completion_of(&effects), Some(&Completion::Normal));
    }

    #[test]
    fn sequence_spawns_children_in_declared_order() {
        let mut b = ModelBuilder::new("t");
        let a = b.named("a", ActivityKind::Empty);
        let c = b.named("b", ActivityKind::Empty);
        let root = b.activity(ActivityKind::Sequence {
            children: vec![a, c],
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        let effects = interp.advance(&mut inst, root_id, ContEvent::Start).unwrap();
        let first = spawned(&effects)[0];
        assert_eq!(inst.cont(first).unwrap().activity, a);

        // First child completes; the second spawns.
        inst.remove_cont(first);
        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::ChildCompleted {
                    child: first,
                    completion: Completion::Normal,
                },
            )
            .unwrap();
        let second = spawned(&effects)[0];
        assert_eq!(inst.cont(second).unwrap().activity, c);

        // Second completes; the sequence completes normally.
        inst.remove_cont(second);
        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::ChildCompleted {
                    child: second,
                    completion: Completion::Normal,
                },
            )
            .unwrap();
        assert_eq!(completion_of(&effects), Some(&Completion::Normal));
    }

    #[test]
    fn sequence_child_fault_propagates_without_spawning_more() {
        let mut b = ModelBuilder::new("t");
        let a = b.activity(ActivityKind::Empty);
        let c = b.activity(ActivityKind::Empty);
        let root = b.activity(ActivityKind::Sequence {
            children: vec![a, c],
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        let effects = interp.advance(&mut inst, root_id, ContEvent::Start).unwrap();
        let first = spawned(&effects)[0];
        inst.remove_cont(first);

        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::ChildCompleted {
                    child: first,
                    completion: Completion::Fault(FaultInfo::named("boom")),
                },
            )
            .unwrap();
        assert!(spawned(&effects).is_empty(), "sibling must never start");
        assert!(matches!(
            completion_of(&effects),
            Some(Completion::Fault(f)) if f.name == "boom"
        ));
    }

    #[test]
    fn flow_joins_only_after_every_child() {
        let mut b = ModelBuilder::new("t");
        let a = b.activity(ActivityKind::Empty);
        let c = b.activity(ActivityKind::Empty);
        let root = b.activity(ActivityKind::Flow {
            children: vec![a, c],
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        let effects = interp.advance(&mut inst, root_id, ContEvent::Start).unwrap();
        let kids = spawned(&effects);
        assert_eq!(kids.len(), 2, "all flow children spawn at entry");

        inst.remove_cont(kids[0]);
        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::ChildCompleted {
                    child: kids[0],
                    completion: Completion::Normal,
                },
            )
            .unwrap();
        assert!(completion_of(&effects).is_none(), "one child still running");

        inst.remove_cont(kids[1]);
        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::ChildCompleted {
                    child: kids[1],
                    completion: Completion::Normal,
                },
            )
            .unwrap();
        assert_eq!(completion_of(&effects), Some(&Completion::Normal));
    }

    #[test]
    fn flow_first_fault_wins_and_siblings_are_cancelled() {
        let mut b = ModelBuilder::new("t");
        let a = b.activity(ActivityKind::Empty);
        let c = b.activity(ActivityKind::Empty);
        let root = b.activity(ActivityKind::Flow {
            children: vec![a, c],
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        let effects = interp.advance(&mut inst, root_id, ContEvent::Start).unwrap();
        let kids = spawned(&effects);

        inst.remove_cont(kids[0]);
        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::ChildCompleted {
                    child: kids[0],
                    completion: Completion::Fault(FaultInfo::named("first")),
                },
            )
            .unwrap();
        assert!(
            effects
                .iter()
                .any(|e| matches!(e, Effect::CancelSubtree { child, .. } if *child == kids[1])),
            "running sibling gets a cancellation signal"
        );
        assert!(completion_of(&effects).is_none());

        // The sibling reports cancelled; the flow completes with the first
        // fault, not anything later.
        inst.remove_cont(kids[1]);
        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::ChildCancelled { child: kids[1] },
            )
            .unwrap();
        assert!(matches!(
            completion_of(&effects),
            Some(Completion::Fault(f)) if f.name == "first"
        ));
    }

    #[test]
    fn while_guard_is_evaluated_before_each_spawn() {
        let mut b = ModelBuilder::new("t");
        let flag = b.variable("keep_going");
        let body = b.activity(ActivityKind::Assign {
            copies: vec![AssignCopy {
                from: CopySource::Literal(json!(false)),
                to: flag,
            }],
        });
        let root = b.activity(ActivityKind::While {
            condition: Condition::VarTruthy(flag),
            body,
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        inst.variables.insert(flag, json!(true));
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        // Guard true: body spawns.
        let effects = interp.advance(&mut inst, root_id, ContEvent::Start).unwrap();
        let child = spawned(&effects)[0];

        // Body runs (flips the flag) and completes.
        let effects = interp.advance(&mut inst, child, ContEvent::Start).unwrap();
        assert_eq!(completion_of(&effects), Some(&Completion::Normal));
        inst.remove_cont(child);

        // Guard now false: loop completes without another iteration.
        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::ChildCompleted {
                    child,
                    completion: Completion::Normal,
                },
            )
            .unwrap();
        assert!(spawned(&effects).is_empty());
        assert_eq!(completion_of(&effects), Some(&Completion::Normal));
    }

    #[test]
    fn if_takes_first_true_branch_only() {
        let mut b = ModelBuilder::new("t");
        let first = b.named("first", ActivityKind::Empty);
        let second = b.named("second", ActivityKind::Empty);
        let root = b.activity(ActivityKind::If {
            branches: vec![
                crate::model::IfBranch {
                    condition: Condition::Const(true),
                    body: first,
                },
                crate::model::IfBranch {
                    condition: Condition::Const(true),
                    body: second,
                },
            ],
            else_branch: None,
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        let root_id = root_cont(&mut inst, &model);

        let effects = Interpreter::new(&model)
            .advance(&mut inst, root_id, ContEvent::Start)
            .unwrap();
        let kids = spawned(&effects);
        assert_eq!(kids.len(), 1);
        assert_eq!(inst.cont(kids[0]).unwrap().activity, first);
    }

    #[test]
    fn throw_completes_with_the_declared_fault_and_path() {
        let mut b = ModelBuilder::new("t");
        let t = b.named("fail-here", ActivityKind::Throw {
            fault_name: "app:oops".to_string(),
            fault_data: Some(json!({"reason": "nope"})),
        });
        let root = b.named("main", ActivityKind::Sequence { children: vec![t] });
        let model = b.build(root);
        let mut inst = instance(&model);
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        let effects = interp.advance(&mut inst, root_id, ContEvent::Start).unwrap();
        let child = spawned(&effects)[0];
        let effects = interp.advance(&mut inst, child, ContEvent::Start).unwrap();
        match completion_of(&effects) {
            Some(Completion::Fault(f)) => {
                assert_eq!(f.name, "app:oops");
                assert_eq!(f.activity_path, vec!["main", "fail-here"]);
            }
            other => panic!("expected fault completion, got {other:?}"),
        }
    }

    #[test]
    fn pick_message_win_disarms_alarm_and_other_arms() {
        let mut b = ModelBuilder::new("t");
        let pl = b.partner_link("client");
        let cset = b.correlation_set("order", &["orderId"]);
        let v = b.variable("msg");
        let body_a = b.activity(ActivityKind::Empty);
        let body_b = b.activity(ActivityKind::Empty);
        let body_t = b.activity(ActivityKind::Empty);
        let root = b.activity(ActivityKind::Pick {
            on_message: vec![
                OnMessage {
                    partner_link: pl,
                    operation: "accept".to_string(),
                    variable: Some(v),
                    correlations: vec![CorrelationUse {
                        cset,
                        initiate: true,
                    }],
                    body: body_a,
                },
                OnMessage {
                    partner_link: pl,
                    operation: "rejectOrder".to_string(),
                    variable: None,
                    correlations: vec![],
                    body: body_b,
                },
            ],
            on_alarm: Some(crate::model::OnAlarm {
                duration_ms: 60_000,
                body: body_t,
            }),
            create_instance: false,
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        let effects = interp.advance(&mut inst, root_id, ContEvent::Start).unwrap();
        let registered: Vec<WaitId> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Register { wait_id, .. } => Some(*wait_id),
                _ => None,
            })
            .collect();
        assert_eq!(registered.len(), 2);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ArmTimer { .. })));

        let msg = Message::new(json!({"ok": true})).with_property("orderId", "42");
        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::MessageDelivered {
                    wait_id: registered[0],
                    message: msg,
                },
            )
            .unwrap();
        // Loser arm unregistered, alarm cancelled, winner body spawned.
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Unregister { wait_id } if *wait_id == registered[1])));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CancelTimer { .. })));
        let kids = spawned(&effects);
        assert_eq!(kids.len(), 1);
        assert_eq!(inst.cont(kids[0]).unwrap().activity, body_a);
        // Correlation initialized from the winning message.
        assert_eq!(
            inst.correlations.get(&cset).unwrap().values,
            Some(vec!["42".to_string()])
        );
        assert_eq!(inst.variables.get(&v), Some(&json!({"ok": true})));
    }

    #[test]
    fn pick_timer_win_disarms_message_arms() {
        let mut b = ModelBuilder::new("t");
        let pl = b.partner_link("client");
        let body_m = b.activity(ActivityKind::Empty);
        let body_t = b.activity(ActivityKind::Empty);
        let root = b.activity(ActivityKind::Pick {
            on_message: vec![OnMessage {
                partner_link: pl,
                operation: "confirm".to_string(),
                variable: None,
                correlations: vec![],
                body: body_m,
            }],
            on_alarm: Some(crate::model::OnAlarm {
                duration_ms: 10,
                body: body_t,
            }),
            create_instance: false,
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        let effects = interp.advance(&mut inst, root_id, ContEvent::Start).unwrap();
        let alarm_id = effects
            .iter()
            .find_map(|e| match e {
                Effect::ArmTimer { wait_id, .. } => Some(*wait_id),
                _ => None,
            })
            .unwrap();
        let msg_wait = effects
            .iter()
            .find_map(|e| match e {
                Effect::Register { wait_id, .. } => Some(*wait_id),
                _ => None,
            })
            .unwrap();

        let effects = interp
            .advance(&mut inst, root_id, ContEvent::TimerFired { wait_id: alarm_id })
            .unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Unregister { wait_id } if *wait_id == msg_wait)));
        let kids = spawned(&effects);
        assert_eq!(inst.cont(kids[0]).unwrap().activity, body_t);

        // A late message for the resolved pick is discarded, not an error.
        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::MessageDelivered {
                    wait_id: msg_wait,
                    message: Message::new(Value::Null),
                },
            )
            .unwrap();
        assert!(spawned(&effects).is_empty());
    }

    #[test]
    fn receive_reinitiation_with_different_key_faults() {
        let mut b = ModelBuilder::new("t");
        let pl = b.partner_link("client");
        let cset = b.correlation_set("order", &["orderId"]);
        let root = b.activity(ActivityKind::Receive {
            partner_link: pl,
            operation: "update".to_string(),
            variable: None,
            correlations: vec![CorrelationUse {
                cset,
                initiate: true,
            }],
            create_instance: false,
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        inst.correlations.insert(
            cset,
            CorrelationSetInstance {
                values: Some(vec!["already".to_string()]),
            },
        );
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        let effects = interp.advance(&mut inst, root_id, ContEvent::Start).unwrap();
        let wait_id = effects
            .iter()
            .find_map(|e| match e {
                Effect::Register { wait_id, .. } => Some(*wait_id),
                _ => None,
            })
            .unwrap();

        let msg = Message::new(Value::Null).with_property("orderId", "different");
        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::MessageDelivered { wait_id, message: msg },
            )
            .unwrap();
        assert!(matches!(
            completion_of(&effects),
            Some(Completion::Fault(f)) if f.name == faults::FAULT_CORRELATION_VIOLATION
        ));
    }

    #[test]
    fn two_way_invoke_parks_until_reply() {
        let mut b = ModelBuilder::new("t");
        let pl = b.partner_link("supplier");
        let input = b.variable("req");
        let output = b.variable("resp");
        let root = b.activity(ActivityKind::Invoke {
            partner_link: pl,
            operation: "quote".to_string(),
            input_variable: Some(input),
            output_variable: Some(output),
            two_way: true,
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        inst.variables.insert(input, json!({"sku": "x1"}));
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        let effects = interp.advance(&mut inst, root_id, ContEvent::Start).unwrap();
        let mex = effects
            .iter()
            .find_map(|e| match e {
                Effect::SendOutbound { mex_id, .. } => *mex_id,
                _ => None,
            })
            .unwrap();
        assert!(completion_of(&effects).is_none(), "suspended, not complete");
        assert_eq!(
            inst.cont(root_id).unwrap().wait,
            WaitState::Reply { mex_id: mex }
        );

        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::InvokeResolved {
                    mex_id: mex,
                    result: InvokeResult::Reply(Message::new(json!({"price": 10}))),
                },
            )
            .unwrap();
        assert_eq!(completion_of(&effects), Some(&Completion::Normal));
        assert_eq!(inst.variables.get(&output), Some(&json!({"price": 10})));
    }

    #[test]
    fn reply_faults_when_asserted_correlation_is_uninitialized() {
        let mut b = ModelBuilder::new("t");
        let pl = b.partner_link("client");
        let cset = b.correlation_set("order", &["orderId"]);
        let v = b.variable("resp");
        let root = b.activity(ActivityKind::Reply {
            partner_link: pl,
            operation: "confirm".to_string(),
            variable: Some(v),
            fault_name: None,
            message_exchange: "mex-1".to_string(),
            init_correlations: vec![],
            assert_correlations: vec![cset],
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        inst.variables.insert(v, json!({"ok": true}));
        let root_id = root_cont(&mut inst, &model);

        let effects = Interpreter::new(&model)
            .advance(&mut inst, root_id, ContEvent::Start)
            .unwrap();
        assert!(matches!(
            completion_of(&effects),
            Some(Completion::Fault(f)) if f.name == faults::FAULT_CORRELATION_VIOLATION
        ));
    }

    #[test]
    fn reply_builds_endpoint_from_address_template() {
        let mut b = ModelBuilder::new("t");
        let pl = b.partner_link_with_address(
            "client",
            "o1/A(part1)B(part2)/(part3)",
            &["part1", "part2", "part3"],
        );
        let v = b.variable("resp");
        let root = b.activity(ActivityKind::Reply {
            partner_link: pl,
            operation: "confirm".to_string(),
            variable: Some(v),
            fault_name: None,
            message_exchange: String::new(),
            init_correlations: vec![],
            assert_correlations: vec![],
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        inst.variables.insert(
            v,
            json!({"part1": "tutu", "part2": "titi", "part3": "toto"}),
        );
        let root_id = root_cont(&mut inst, &model);

        let effects = Interpreter::new(&model)
            .advance(&mut inst, root_id, ContEvent::Start)
            .unwrap();
        let out = effects
            .iter()
            .find_map(|e| match e {
                Effect::SendOutbound { out, .. } => Some(out.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(out.endpoint_url.as_deref(), Some("o1/AtutuBtiti/toto"));
        assert_eq!(completion_of(&effects), Some(&Completion::Normal));
    }

    #[test]
    fn reply_faults_on_structured_template_part() {
        let mut b = ModelBuilder::new("t");
        let pl = b.partner_link_with_address("client", "(part1)", &["part1"]);
        let v = b.variable("resp");
        let root = b.activity(ActivityKind::Reply {
            partner_link: pl,
            operation: "confirm".to_string(),
            variable: Some(v),
            fault_name: None,
            message_exchange: String::new(),
            init_correlations: vec![],
            assert_correlations: vec![],
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        inst.variables.insert(v, json!({"part1": {"kid": 1}}));
        let root_id = root_cont(&mut inst, &model);

        let effects = Interpreter::new(&model)
            .advance(&mut inst, root_id, ContEvent::Start)
            .unwrap();
        assert!(matches!(
            completion_of(&effects),
            Some(Completion::Fault(f)) if f.name == faults::FAULT_INVALID_REPLY
        ));
    }

    #[test]
    fn scope_completion_records_compensable_entry() {
        let mut b = ModelBuilder::new("t");
        let body = b.activity(ActivityKind::Empty);
        let handler = b.activity(ActivityKind::Empty);
        let scope = b.named(
            "s1",
            ActivityKind::Scope {
                body,
                variables: vec![],
                correlation_sets: vec![],
                fault_handlers: Default::default(),
                compensation_handler: Some(handler),
            },
        );
        let model = b.build(scope);
        let mut inst = instance(&model);
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        let effects = interp.advance(&mut inst, root_id, ContEvent::Start).unwrap();
        let child = spawned(&effects)[0];
        inst.remove_cont(child);
        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::ChildCompleted {
                    child,
                    completion: Completion::Normal,
                },
            )
            .unwrap();
        assert_eq!(completion_of(&effects), Some(&Completion::Normal));
        assert_eq!(inst.compensation_log.len(), 1);
        assert_eq!(inst.compensation_log[0].scope, scope);
    }

    #[test]
    fn scope_fault_handler_matches_exact_name_first() {
        let mut b = ModelBuilder::new("t");
        let thrower = b.activity(ActivityKind::Throw {
            fault_name: "app:known".to_string(),
            fault_data: None,
        });
        let exact = b.named("exact-handler", ActivityKind::Empty);
        let catch_all = b.named("default-handler", ActivityKind::Empty);
        let scope = b.activity(ActivityKind::Scope {
            body: thrower,
            variables: vec![],
            correlation_sets: vec![],
            fault_handlers: crate::model::FaultHandlerTable {
                catch: vec![("app:known".to_string(), exact)],
                catch_all: Some(catch_all),
            },
            compensation_handler: None,
        });
        let model = b.build(scope);
        let mut inst = instance(&model);
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        let effects = interp.advance(&mut inst, root_id, ContEvent::Start).unwrap();
        let body_cont = spawned(&effects)[0];
        let effects = interp.advance(&mut inst, body_cont, ContEvent::Start).unwrap();
        let fault = match completion_of(&effects) {
            Some(Completion::Fault(f)) => f.clone(),
            other => panic!("expected fault, got {other:?}"),
        };
        inst.remove_cont(body_cont);

        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::ChildCompleted {
                    child: body_cont,
                    completion: Completion::Fault(fault),
                },
            )
            .unwrap();
        let handler_cont = spawned(&effects)[0];
        assert_eq!(inst.cont(handler_cont).unwrap().activity, exact);

        // Handler completes: the scope recovers and completes normally.
        inst.remove_cont(handler_cont);
        let effects = interp
            .advance(
                &mut inst,
                root_id,
                ContEvent::ChildCompleted {
                    child: handler_cont,
                    completion: Completion::Normal,
                },
            )
            .unwrap();
        assert_eq!(completion_of(&effects), Some(&Completion::Normal));
    }

    #[test]
    fn compensate_runs_handlers_in_reverse_completion_order() {
        let mut b = ModelBuilder::new("t");
        let b1 = b.activity(ActivityKind::Empty);
        let b2 = b.activity(ActivityKind::Empty);
        let h1 = b.named("undo-s1", ActivityKind::Empty);
        let h2 = b.named("undo-s2", ActivityKind::Empty);
        let s1 = b.named(
            "s1",
            ActivityKind::Scope {
                body: b1,
                variables: vec![],
                correlation_sets: vec![],
                fault_handlers: Default::default(),
                compensation_handler: Some(h1),
            },
        );
        let s2 = b.named(
            "s2",
            ActivityKind::Scope {
                body: b2,
                variables: vec![],
                correlation_sets: vec![],
                fault_handlers: Default::default(),
                compensation_handler: Some(h2),
            },
        );
        let comp = b.activity(ActivityKind::Compensate { target_scope: None });
        let root = b.activity(ActivityKind::Sequence {
            children: vec![s1, s2, comp],
        });
        let model = b.build(root);
        let mut inst = instance(&model);
        let root_id = root_cont(&mut inst, &model);
        let interp = Interpreter::new(&model);

        // Pretend s1 then s2 completed.
        faults::push_compensable(&mut inst, &model, s1);
        faults::push_compensable(&mut inst, &model, s2);

        let comp_cont = inst.alloc_cont(comp, Some(root_id), initial_state(
            &model.activity(comp).unwrap().kind,
        ));
        let effects = interp.advance(&mut inst, comp_cont, ContEvent::Start).unwrap();
        // s2 compensates first.
        let scope_cont = spawned(&effects)[0];
        assert_eq!(inst.cont(scope_cont).unwrap().activity, s2);

        // Scope in compensation phase spawns its handler.
        let effects = interp.advance(&mut inst, scope_cont, ContEvent::Start).unwrap();
        let handler_cont = spawned(&effects)[0];
        assert_eq!(inst.cont(handler_cont).unwrap().activity, h2);
        inst.remove_cont(handler_cont);
        let effects = interp
            .advance(
                &mut inst,
                scope_cont,
                ContEvent::ChildCompleted {
                    child: handler_cont,
                    completion: Completion::Normal,
                },
            )
            .unwrap();
        assert_eq!(completion_of(&effects), Some(&Completion::Compensated));
        inst.remove_cont(scope_cont);

        // Compensate moves on to s1.
        let effects = interp
            .advance(
                &mut inst,
                comp_cont,
                ContEvent::ChildCompleted {
                    child: scope_cont,
                    completion: Completion::Compensated,
                },
            )
            .unwrap();
        let next_scope = spawned(&effects)[0];
        assert_eq!(inst.cont(next_scope).unwrap().activity, s1);
        assert!(inst.compensation_log.is_empty());
    }
}
