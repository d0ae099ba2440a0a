//! Scheduler and management API.
//!
//! The engine owns the deployed models, the live instances, the correlation
//! router, and the timer tasks. Each instance is guarded by its own
//! `tokio::sync::Mutex`, which enforces single-continuation-at-a-time
//! execution: concurrency within an instance is about outstanding suspended
//! activities, never parallel mutation of instance state. Every
//! run-to-quiescence checkpoint goes through the store, so a suspended
//! instance can be resumed after a restart.

use crate::binding::{DeliveryResult, MessageBinding};
use crate::compiler::{has_errors, validate_model};
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::faults;
use crate::interp::{initial_state, ContEvent, Effect, Interpreter, InvokeResult};
use crate::model::{ActivityKind, ProcessModel};
use crate::router::{build_constraints, CorrelationRouter, RouteKey, Waiter};
use crate::store::ProcessStore;
use crate::types::*;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An inbound message addressed by partner link and operation.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub partner_link: String,
    pub operation: String,
    pub message: Message,
}

/// What the router did with an inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum RouteOutcome {
    /// Matched a waiting continuation of an existing instance.
    Delivered { instance_id: Uuid },
    /// Matched a start activity; a fresh instance was created.
    Started { instance_id: Uuid },
    /// No waiter and no start activity: delivery failure, instance state
    /// unaffected.
    Rejected,
}

/// Management-API view of one instance.
#[derive(Clone, Debug)]
pub struct InstanceReport {
    pub instance_id: Uuid,
    pub process_name: String,
    pub state: InstanceLifecycle,
}

#[derive(Clone)]
struct InstanceHandle {
    state: Arc<AsyncMutex<InstanceState>>,
    model: Arc<ProcessModel>,
}

struct EngineInner {
    models: RwLock<HashMap<String, Arc<ProcessModel>>>,
    instances: Mutex<HashMap<Uuid, InstanceHandle>>,
    router: CorrelationRouter,
    binding: Arc<dyn MessageBinding>,
    store: Arc<dyn ProcessStore>,
    timers: Mutex<HashMap<(Uuid, WaitId), JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(binding: Arc<dyn MessageBinding>, store: Arc<dyn ProcessStore>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                models: RwLock::new(HashMap::new()),
                instances: Mutex::new(HashMap::new()),
                router: CorrelationRouter::new(),
                binding,
                store,
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ── Management API ──

    /// Validate and register a compiled model. Rejected on any
    /// Error-severity validation issue.
    pub async fn deploy(&self, model: ProcessModel) -> Result<[u8; 32], EngineError> {
        let issues = validate_model(&model);
        if has_errors(&issues) {
            return Err(EngineError::Validation(issues));
        }
        for issue in &issues {
            warn!(process = %model.name, %issue, "deployment warning");
        }
        let version = model.model_version;
        self.inner
            .store
            .store_model(version, &model)
            .await
            .map_err(EngineError::Store)?;
        self.inner
            .models
            .write()
            .unwrap()
            .insert(model.name.clone(), Arc::new(model));
        Ok(version)
    }

    /// Explicitly start an instance of a deployed process, optionally
    /// delivering an initial message to its start activity.
    pub async fn start(
        &self,
        process: &str,
        initial: Option<InboundMessage>,
    ) -> Result<Uuid, EngineError> {
        let model = self.model_for(process)?;
        let instance_id = self.start_instance(model).await?;
        if let Some(msg) = initial {
            let key = RouteKey::new(&msg.partner_link, &msg.operation);
            match self
                .inner
                .router
                .match_for_instance(&key, &msg.message.properties, instance_id)
            {
                Some(w) => self.deliver(w, msg.message).await?,
                None => warn!(%instance_id, "initial message matched no wait of the new instance"),
            }
        }
        Ok(instance_id)
    }

    /// Forcibly terminate an instance. Default compensation runs only when
    /// explicitly requested.
    pub async fn terminate(
        &self,
        instance_id: Uuid,
        compensate: bool,
    ) -> Result<(), EngineError> {
        let handle = self.handle_for(instance_id)?;
        let mut inst = handle.state.lock().await;
        if inst.state.is_terminal() {
            return Err(EngineError::NotRunning(instance_id));
        }

        let live: Vec<ContId> = inst.live_conts().map(|c| c.cont_id).collect();
        for id in live {
            self.cleanup_cont_waits(&inst, id);
        }
        let root = inst.root_cont;
        self.cancel_subtree(&mut inst, root);
        if let Some(h) = inst.root_handler {
            self.cancel_subtree(&mut inst, h);
        }

        if compensate {
            let entries = faults::take_for_compensation(&mut inst, &handle.model, None);
            for entry in entries {
                self.audit(
                    instance_id,
                    RuntimeEvent::CompensationStarted { scope: entry.scope },
                )
                .await?;
                let cont = inst.alloc_cont(
                    entry.scope,
                    None,
                    ContState::Scope {
                        phase: ScopePhase::Compensation,
                    },
                );
                self.run_queue(&mut inst, &handle.model, vec![(cont, ContEvent::Start)])
                    .await?;
                self.audit(
                    instance_id,
                    RuntimeEvent::CompensationCompleted { scope: entry.scope },
                )
                .await?;
                // Anything a handler left suspended dies with the instance.
                if let Some(c) = inst.cont(cont).map(|c| c.cont_id) {
                    self.cancel_subtree(&mut inst, c);
                }
            }
        }

        inst.state = InstanceLifecycle::Terminated { at: now_ms() };
        self.audit(instance_id, RuntimeEvent::InstanceTerminated { at: now_ms() })
            .await?;
        self.inner
            .store
            .save_instance(&inst)
            .await
            .map_err(EngineError::Store)?;
        drop(inst);
        self.inner.router.unregister_instance(instance_id);
        self.cancel_instance_timers(instance_id);
        self.inner.instances.lock().unwrap().remove(&instance_id);
        info!(%instance_id, "instance terminated");
        Ok(())
    }

    pub async fn instance_status(&self, id: Uuid) -> Result<InstanceReport, EngineError> {
        if let Ok(handle) = self.handle_for(id) {
            let inst = handle.state.lock().await;
            return Ok(InstanceReport {
                instance_id: id,
                process_name: inst.process_name.clone(),
                state: inst.state.clone(),
            });
        }
        match self
            .inner
            .store
            .load_instance(id)
            .await
            .map_err(EngineError::Store)?
        {
            Some(inst) => Ok(InstanceReport {
                instance_id: id,
                process_name: inst.process_name.clone(),
                state: inst.state.clone(),
            }),
            None => Err(EngineError::UnknownInstance(id)),
        }
    }

    /// Load a checkpointed instance from the store, re-register its pending
    /// waits, re-arm its timers, and make it live again.
    pub async fn resume(&self, instance_id: Uuid) -> Result<(), EngineError> {
        if self.handle_for(instance_id).is_ok() {
            return Ok(());
        }
        let inst = self
            .inner
            .store
            .load_instance(instance_id)
            .await
            .map_err(EngineError::Store)?
            .ok_or(EngineError::UnknownInstance(instance_id))?;
        if inst.state.is_terminal() {
            return Err(EngineError::NotRunning(instance_id));
        }
        let model = self.model_for_version(&inst.process_name, inst.model_version).await?;

        for cont in inst.live_conts() {
            let Some(node) = model.activity(cont.activity) else {
                continue;
            };
            match (&cont.wait, &node.kind) {
                (
                    WaitState::Msg { wait_id },
                    ActivityKind::Receive {
                        partner_link,
                        operation,
                        correlations,
                        ..
                    },
                ) => {
                    let constraints = match build_constraints(&model, &inst, correlations) {
                        Ok(c) => c,
                        Err(fault) => {
                            warn!(%instance_id, fault = %fault.name, "wait not re-registered");
                            continue;
                        }
                    };
                    let pl = model
                        .partner_link(*partner_link)
                        .map(|p| p.name.clone())
                        .unwrap_or_default();
                    let _ = self.inner.router.register(
                        RouteKey::new(&pl, operation),
                        Waiter {
                            instance_id,
                            cont_id: cont.cont_id,
                            wait_id: *wait_id,
                            constraints,
                        },
                    );
                }
                (
                    WaitState::PickArms,
                    ActivityKind::Pick {
                        on_message,
                        ..
                    },
                ) => {
                    if let ContState::Pick {
                        arms,
                        alarm,
                        alarm_deadline_ms,
                        chosen: false,
                    } = &cont.state
                    {
                        for (arm, wait_id) in on_message.iter().zip(arms) {
                            let constraints =
                                match build_constraints(&model, &inst, &arm.correlations) {
                                    Ok(c) => c,
                                    Err(_) => continue,
                                };
                            let pl = model
                                .partner_link(arm.partner_link)
                                .map(|p| p.name.clone())
                                .unwrap_or_default();
                            let _ = self.inner.router.register(
                                RouteKey::new(&pl, &arm.operation),
                                Waiter {
                                    instance_id,
                                    cont_id: cont.cont_id,
                                    wait_id: *wait_id,
                                    constraints,
                                },
                            );
                        }
                        if let (Some(wait_id), Some(deadline)) = (alarm, alarm_deadline_ms) {
                            self.spawn_timer(instance_id, cont.cont_id, *wait_id, *deadline);
                        }
                    }
                }
                _ => {}
            }
        }

        let handle = InstanceHandle {
            state: Arc::new(AsyncMutex::new(inst)),
            model,
        };
        self.inner
            .instances
            .lock()
            .unwrap()
            .insert(instance_id, handle);
        info!(%instance_id, "instance resumed from checkpoint");
        Ok(())
    }

    // ── Inbound traffic ──

    /// Route an inbound message: match a pending wait, or create a fresh
    /// instance when a deployed start activity covers the operation, or
    /// reject.
    pub async fn on_message(
        &self,
        partner_link: &str,
        operation: &str,
        message: Message,
    ) -> Result<RouteOutcome, EngineError> {
        let key = RouteKey::new(partner_link, operation);
        if let Some(w) = self.inner.router.match_and_take(&key, &message.properties) {
            let instance_id = w.instance_id;
            self.deliver(w, message).await?;
            return Ok(RouteOutcome::Delivered { instance_id });
        }

        let starter: Option<Arc<ProcessModel>> = {
            let models = self.inner.models.read().unwrap();
            models
                .values()
                .find(|m| {
                    m.start_operations().iter().any(|(link, op)| {
                        op == operation
                            && m.partner_link(*link)
                                .map(|p| p.name == partner_link)
                                .unwrap_or(false)
                    })
                })
                .cloned()
        };
        let Some(model) = starter else {
            warn!(
                partner_link,
                operation, "undeliverable message: no waiter and no start activity"
            );
            return Ok(RouteOutcome::Rejected);
        };

        let instance_id = self.start_instance(model).await?;
        match self
            .inner
            .router
            .match_for_instance(&key, &message.properties, instance_id)
        {
            Some(w) => {
                self.deliver(w, message).await?;
                Ok(RouteOutcome::Started { instance_id })
            }
            None => {
                warn!(%instance_id, "start activity did not accept the creating message");
                Ok(RouteOutcome::Rejected)
            }
        }
    }

    /// Deliver the outcome of a two-way invoke. A late result for a wait
    /// that no longer exists is discarded, not an error.
    pub async fn on_invoke_result(
        &self,
        instance_id: Uuid,
        mex_id: MexId,
        result: InvokeResult,
    ) -> Result<(), EngineError> {
        let handle = self.handle_for(instance_id)?;
        let cont = {
            let inst = handle.state.lock().await;
            let found = inst
                .live_conts()
                .find(|c| c.wait == WaitState::Reply { mex_id })
                .map(|c| c.cont_id);
            found
        };
        match cont {
            Some(cont_id) => {
                self.run(
                    handle,
                    vec![(cont_id, ContEvent::InvokeResolved { mex_id, result })],
                )
                .await
            }
            None => {
                debug!(%instance_id, mex_id, "late invoke result discarded");
                self.audit(
                    instance_id,
                    RuntimeEvent::SignalIgnored {
                        description: format!("late invoke result for exchange {mex_id}"),
                    },
                )
                .await
            }
        }
    }

    // ── Internals ──

    fn model_for(&self, process: &str) -> Result<Arc<ProcessModel>, EngineError> {
        self.inner
            .models
            .read()
            .unwrap()
            .get(process)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProcess(process.to_string()))
    }

    async fn model_for_version(
        &self,
        process: &str,
        version: [u8; 32],
    ) -> Result<Arc<ProcessModel>, EngineError> {
        if let Ok(model) = self.model_for(process) {
            if model.model_version == version {
                return Ok(model);
            }
        }
        let model = self
            .inner
            .store
            .load_model(version)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(|| EngineError::UnknownProcess(process.to_string()))?;
        let arc = Arc::new(model);
        self.inner
            .models
            .write()
            .unwrap()
            .insert(process.to_string(), arc.clone());
        Ok(arc)
    }

    fn handle_for(&self, instance_id: Uuid) -> Result<InstanceHandle, EngineError> {
        self.inner
            .instances
            .lock()
            .unwrap()
            .get(&instance_id)
            .cloned()
            .ok_or(EngineError::UnknownInstance(instance_id))
    }

    async fn start_instance(&self, model: Arc<ProcessModel>) -> Result<Uuid, EngineError> {
        let instance_id = Uuid::now_v7();
        let mut inst = InstanceState::new(instance_id, &model.name, model.model_version);
        let root_kind = &model
            .activity(model.root)
            .ok_or(EngineError::MissingActivity(model.root))?
            .kind;
        let root = inst.alloc_cont(model.root, None, initial_state(root_kind));
        inst.root_cont = root;

        let handle = InstanceHandle {
            state: Arc::new(AsyncMutex::new(inst)),
            model: model.clone(),
        };
        self.inner
            .instances
            .lock()
            .unwrap()
            .insert(instance_id, handle.clone());
        self.audit(
            instance_id,
            RuntimeEvent::InstanceStarted {
                instance_id,
                model_version: model.model_version,
            },
        )
        .await?;
        info!(%instance_id, process = %model.name, "instance started");
        self.run(handle, vec![(root, ContEvent::Start)]).await?;
        Ok(instance_id)
    }

    async fn deliver(&self, waiter: Waiter, message: Message) -> Result<(), EngineError> {
        let handle = self.handle_for(waiter.instance_id)?;
        self.audit(
            waiter.instance_id,
            RuntimeEvent::MessageMatched {
                cont_id: waiter.cont_id,
                wait_id: waiter.wait_id,
            },
        )
        .await?;
        self.run(
            handle,
            vec![(
                waiter.cont_id,
                ContEvent::MessageDelivered {
                    wait_id: waiter.wait_id,
                    message,
                },
            )],
        )
        .await
    }

    /// Lock the instance, drain the work queue to quiescence, checkpoint,
    /// and tear down if a terminal state was reached.
    async fn run(
        &self,
        handle: InstanceHandle,
        initial: Vec<(ContId, ContEvent)>,
    ) -> Result<(), EngineError> {
        let mut inst = handle.state.lock().await;
        self.run_queue(&mut inst, &handle.model, initial).await?;
        self.inner
            .store
            .save_instance(&inst)
            .await
            .map_err(EngineError::Store)?;
        let terminal = inst.state.is_terminal();
        let instance_id = inst.instance_id;
        drop(inst);
        if terminal {
            self.inner.router.unregister_instance(instance_id);
            self.cancel_instance_timers(instance_id);
            self.inner.instances.lock().unwrap().remove(&instance_id);
        }
        Ok(())
    }

    async fn run_queue(
        &self,
        inst: &mut InstanceState,
        model: &ProcessModel,
        initial: Vec<(ContId, ContEvent)>,
    ) -> Result<(), EngineError> {
        let interp = Interpreter::new(model);
        let mut queue: VecDeque<(ContId, ContEvent)> = initial.into();
        while let Some((cont_id, event)) = queue.pop_front() {
            if inst.state.is_terminal() {
                break;
            }
            let effects = interp.advance(inst, cont_id, event)?;
            self.apply_effects(inst, model, effects, &mut queue).await?;
        }
        Ok(())
    }

    async fn apply_effects(
        &self,
        inst: &mut InstanceState,
        model: &ProcessModel,
        effects: Vec<Effect>,
        queue: &mut VecDeque<(ContId, ContEvent)>,
    ) -> Result<(), EngineError> {
        let mut failed_sends: HashSet<ContId> = HashSet::new();
        for effect in effects {
            match effect {
                Effect::SpawnedChild { child } => {
                    let (activity, parent) = inst
                        .cont(child)
                        .map(|c| (c.activity, c.parent))
                        .unwrap_or((0, None));
                    self.audit(
                        inst.instance_id,
                        RuntimeEvent::ContinuationSpawned {
                            cont_id: child,
                            activity,
                            parent,
                        },
                    )
                    .await?;
                    queue.push_back((child, ContEvent::Start));
                }
                Effect::Completed { cont, completion } => {
                    if failed_sends.contains(&cont) {
                        continue;
                    }
                    self.handle_completion(inst, model, cont, completion, queue)
                        .await?;
                }
                Effect::Register {
                    cont,
                    wait_id,
                    partner_link,
                    operation,
                    constraints,
                } => {
                    let waiter = Waiter {
                        instance_id: inst.instance_id,
                        cont_id: cont,
                        wait_id,
                        constraints,
                    };
                    match self
                        .inner
                        .router
                        .register(RouteKey::new(&partner_link, &operation), waiter)
                    {
                        Ok(()) => {
                            self.audit(
                                inst.instance_id,
                                RuntimeEvent::WaitRegistered {
                                    cont_id: cont,
                                    wait_id,
                                    partner_link,
                                    operation,
                                },
                            )
                            .await?;
                        }
                        Err(fault) => {
                            let fault = faults::at(model, inst, cont, fault);
                            self.audit(
                                inst.instance_id,
                                RuntimeEvent::FaultRaised {
                                    fault: fault.clone(),
                                },
                            )
                            .await?;
                            self.cleanup_cont_waits(inst, cont);
                            self.handle_completion(
                                inst,
                                model,
                                cont,
                                Completion::Fault(fault),
                                queue,
                            )
                            .await?;
                        }
                    }
                }
                Effect::Unregister { wait_id } => self.inner.router.unregister(wait_id),
                Effect::ArmTimer {
                    cont,
                    wait_id,
                    deadline_ms,
                } => {
                    self.audit(
                        inst.instance_id,
                        RuntimeEvent::TimerArmed {
                            wait_id,
                            deadline_ms,
                        },
                    )
                    .await?;
                    self.spawn_timer(inst.instance_id, cont, wait_id, deadline_ms);
                }
                Effect::CancelTimer { wait_id } => {
                    self.cancel_timer(inst.instance_id, wait_id)
                }
                Effect::SendOutbound { cont, mex_id, out } => {
                    let failure = match self.inner.binding.send(out).await {
                        Ok(DeliveryResult::Delivered) => None,
                        Ok(DeliveryResult::Rejected { reason }) => Some(reason),
                        Err(e) => Some(e.to_string()),
                    };
                    if let Some(reason) = failure {
                        failed_sends.insert(cont);
                        let fault = faults::at(
                            model,
                            inst,
                            cont,
                            FaultInfo::with_data(
                                faults::FAULT_INVOKE_FAILURE,
                                Value::String(reason),
                            ),
                        );
                        self.audit(
                            inst.instance_id,
                            RuntimeEvent::FaultRaised {
                                fault: fault.clone(),
                            },
                        )
                        .await?;
                        self.handle_completion(
                            inst,
                            model,
                            cont,
                            Completion::Fault(fault),
                            queue,
                        )
                        .await?;
                    }
                    let _ = mex_id;
                }
                Effect::CancelSubtree { child, notify } => {
                    self.cancel_subtree(inst, child);
                    queue.push_back((notify, ContEvent::ChildCancelled { child }));
                }
                Effect::Audit(event) => self.audit(inst.instance_id, event).await?,
            }
        }
        Ok(())
    }

    /// A continuation finished: remove it and report upward, or finalize
    /// the instance when the root (or the process-level fault handler)
    /// completed.
    async fn handle_completion(
        &self,
        inst: &mut InstanceState,
        model: &ProcessModel,
        cont: ContId,
        completion: Completion,
        queue: &mut VecDeque<(ContId, ContEvent)>,
    ) -> Result<(), EngineError> {
        self.cleanup_cont_waits(inst, cont);
        let parent = inst.cont(cont).and_then(|c| c.parent);
        inst.remove_cont(cont);
        match parent {
            Some(p) if inst.cont(p).is_some() => {
                queue.push_back((
                    p,
                    ContEvent::ChildCompleted {
                        child: cont,
                        completion,
                    },
                ));
            }
            Some(_) => {} // parent already gone
            None => {
                if cont == inst.root_cont {
                    self.finish_root(inst, model, completion, queue).await?;
                } else if Some(cont) == inst.root_handler {
                    let original = inst
                        .root_fault
                        .clone()
                        .unwrap_or_else(|| FaultInfo::named("bpel:unknownFault"));
                    let fault = match completion {
                        Completion::Fault(f) => f,
                        _ => original,
                    };
                    self.finalize_faulted(inst, fault).await?;
                }
            }
        }
        Ok(())
    }

    async fn finish_root(
        &self,
        inst: &mut InstanceState,
        model: &ProcessModel,
        completion: Completion,
        queue: &mut VecDeque<(ContId, ContEvent)>,
    ) -> Result<(), EngineError> {
        match completion {
            Completion::Normal | Completion::Compensated => {
                // A successfully completed instance discards its log.
                inst.compensation_log.clear();
                inst.state = InstanceLifecycle::Completed { at: now_ms() };
                self.audit(
                    inst.instance_id,
                    RuntimeEvent::InstanceCompleted { at: now_ms() },
                )
                .await?;
                info!(instance_id = %inst.instance_id, "instance completed");
            }
            Completion::Fault(fault) => match model.fault_handlers.handler_for(&fault.name) {
                Some(handler) => {
                    self.audit(
                        inst.instance_id,
                        RuntimeEvent::FaultHandled {
                            scope: model.root,
                            fault_name: fault.name.clone(),
                        },
                    )
                    .await?;
                    inst.root_fault = Some(fault);
                    let kind = &model
                        .activity(handler)
                        .ok_or(EngineError::MissingActivity(handler))?
                        .kind;
                    let cont = inst.alloc_cont(handler, None, initial_state(kind));
                    inst.root_handler = Some(cont);
                    self.audit(
                        inst.instance_id,
                        RuntimeEvent::ContinuationSpawned {
                            cont_id: cont,
                            activity: handler,
                            parent: None,
                        },
                    )
                    .await?;
                    queue.push_back((cont, ContEvent::Start));
                }
                None => self.finalize_faulted(inst, fault).await?,
            },
        }
        Ok(())
    }

    async fn finalize_faulted(
        &self,
        inst: &mut InstanceState,
        fault: FaultInfo,
    ) -> Result<(), EngineError> {
        warn!(
            instance_id = %inst.instance_id,
            fault = %fault.name,
            path = ?fault.activity_path,
            "instance terminated by unhandled fault"
        );
        inst.state = InstanceLifecycle::Faulted {
            fault: fault.clone(),
            at: now_ms(),
        };
        self.audit(
            inst.instance_id,
            RuntimeEvent::InstanceFaulted {
                fault,
                at: now_ms(),
            },
        )
        .await
    }

    /// Release whatever the continuation is parked on.
    fn cleanup_cont_waits(&self, inst: &InstanceState, cont: ContId) {
        let Some(c) = inst.cont(cont) else { return };
        match &c.wait {
            WaitState::Msg { wait_id } => self.inner.router.unregister(*wait_id),
            WaitState::PickArms => {
                if let ContState::Pick { arms, alarm, .. } = &c.state {
                    for w in arms {
                        self.inner.router.unregister(*w);
                    }
                    if let Some(a) = alarm {
                        self.cancel_timer(inst.instance_id, *a);
                    }
                }
            }
            _ => {}
        }
    }

    /// Forced termination of a continuation subtree: release waits, drop
    /// the continuations. Suspended work simply never resumes; running
    /// steps cannot be interrupted mid-step under the instance lock.
    fn cancel_subtree(&self, inst: &mut InstanceState, root: ContId) {
        let mut stack = vec![root];
        let mut doomed = Vec::new();
        while let Some(id) = stack.pop() {
            if let Some(c) = inst.cont(id) {
                stack.extend(c.children.iter().copied());
                doomed.push(id);
            }
        }
        for id in doomed {
            self.cleanup_cont_waits(inst, id);
            inst.remove_cont(id);
        }
    }

    fn spawn_timer(&self, instance_id: Uuid, cont: ContId, wait_id: WaitId, deadline_ms: u64) {
        let engine = self.clone();
        let delay = deadline_ms.saturating_sub(now_ms() as u64);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if let Err(e) = engine.fire_timer(instance_id, cont, wait_id).await {
                warn!(error = %e, "timer delivery failed");
            }
        });
        self.inner
            .timers
            .lock()
            .unwrap()
            .insert((instance_id, wait_id), handle);
    }

    async fn fire_timer(
        &self,
        instance_id: Uuid,
        cont: ContId,
        wait_id: WaitId,
    ) -> Result<(), EngineError> {
        self.inner
            .timers
            .lock()
            .unwrap()
            .remove(&(instance_id, wait_id));
        let Ok(handle) = self.handle_for(instance_id) else {
            // Instance finished before the timer fired.
            return Ok(());
        };
        self.audit(instance_id, RuntimeEvent::TimerFired { wait_id })
            .await?;
        self.run(handle, vec![(cont, ContEvent::TimerFired { wait_id })])
            .await
    }

    fn cancel_timer(&self, instance_id: Uuid, wait_id: WaitId) {
        if let Some(handle) = self
            .inner
            .timers
            .lock()
            .unwrap()
            .remove(&(instance_id, wait_id))
        {
            handle.abort();
        }
    }

    fn cancel_instance_timers(&self, instance_id: Uuid) {
        let mut timers = self.inner.timers.lock().unwrap();
        timers.retain(|(id, _), handle| {
            if *id == instance_id {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    async fn audit(&self, instance_id: Uuid, event: RuntimeEvent) -> Result<(), EngineError> {
        debug!(%instance_id, ?event, "runtime event");
        self.inner
            .store
            .append_event(instance_id, &event)
            .await
            .map_err(EngineError::Store)?;
        Ok(())
    }
}
