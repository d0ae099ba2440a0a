//! Correlation router: maps inbound messages to the waiting continuation of
//! the correct instance, or reports that a fresh instance should be started.
//!
//! The waiter table is the only structure shared across instances. It is
//! bucketed by (partner link, operation) under one mutex; registration and
//! matching race across unrelated instances, so a match is committed (the
//! waiter removed) before delivery — at-most-once per logical message.

use crate::faults;
use crate::model::{CorrelationUse, ProcessModel};
use crate::types::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct RouteKey {
    pub partner_link: String,
    pub operation: String,
}

impl RouteKey {
    pub fn new(partner_link: &str, operation: &str) -> Self {
        Self {
            partner_link: partner_link.to_string(),
            operation: operation.to_string(),
        }
    }
}

/// One correlation-set requirement of a registered wait. `key == None`
/// means the set is uninitialized and the first matching message will
/// initialize it.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelationConstraint {
    pub cset: CsetId,
    pub properties: Vec<String>,
    pub key: Option<CorrelationKey>,
}

#[derive(Clone, Debug)]
pub struct Waiter {
    pub instance_id: Uuid,
    pub cont_id: ContId,
    pub wait_id: WaitId,
    pub constraints: Vec<CorrelationConstraint>,
}

#[derive(Default)]
pub struct CorrelationRouter {
    buckets: Mutex<HashMap<RouteKey, Vec<Waiter>>>,
}

impl CorrelationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending wait. Two simultaneously-armed waits with
    /// identical (partner link, operation, key) triples are a correlation
    /// conflict, faulted here rather than resolved by arbitrary pick.
    pub fn register(&self, key: RouteKey, waiter: Waiter) -> Result<(), FaultInfo> {
        let mut buckets = self.buckets.lock().unwrap();
        let entry = buckets.entry(key).or_default();
        if entry
            .iter()
            .any(|w| constraint_keys(&w.constraints) == constraint_keys(&waiter.constraints))
        {
            return Err(FaultInfo::with_data(
                faults::FAULT_CORRELATION_VIOLATION,
                Value::String("conflicting receive for the same correlation key".into()),
            ));
        }
        entry.push(waiter);
        Ok(())
    }

    pub fn unregister(&self, wait_id: WaitId) {
        let mut buckets = self.buckets.lock().unwrap();
        for entry in buckets.values_mut() {
            entry.retain(|w| w.wait_id != wait_id);
        }
    }

    pub fn unregister_instance(&self, instance_id: Uuid) {
        let mut buckets = self.buckets.lock().unwrap();
        for entry in buckets.values_mut() {
            entry.retain(|w| w.instance_id != instance_id);
        }
    }

    /// Find and remove the first waiter matching the message properties.
    pub fn match_and_take(
        &self,
        key: &RouteKey,
        properties: &BTreeMap<String, String>,
    ) -> Option<Waiter> {
        self.take_where(key, properties, |_| true)
    }

    /// As [`match_and_take`], restricted to one instance's waits. Used to
    /// deliver a management-API initial message to the instance it started.
    pub fn match_for_instance(
        &self,
        key: &RouteKey,
        properties: &BTreeMap<String, String>,
        instance_id: Uuid,
    ) -> Option<Waiter> {
        self.take_where(key, properties, |w| w.instance_id == instance_id)
    }

    fn take_where(
        &self,
        key: &RouteKey,
        properties: &BTreeMap<String, String>,
        pred: impl Fn(&Waiter) -> bool,
    ) -> Option<Waiter> {
        let mut buckets = self.buckets.lock().unwrap();
        let entry = buckets.get_mut(key)?;
        let pos = entry
            .iter()
            .position(|w| pred(w) && waiter_matches(w, properties))?;
        Some(entry.remove(pos))
    }
}

fn constraint_keys(constraints: &[CorrelationConstraint]) -> Vec<(CsetId, &Option<CorrelationKey>)> {
    constraints.iter().map(|c| (c.cset, &c.key)).collect()
}

fn waiter_matches(waiter: &Waiter, properties: &BTreeMap<String, String>) -> bool {
    waiter.constraints.iter().all(|c| {
        match (&c.key, message_key(&c.properties, properties)) {
            // Uninitialized set: any message carrying the properties matches
            // and will initialize it.
            (None, Some(_)) => true,
            (Some(expected), Some(actual)) => *expected == actual,
            (_, None) => false,
        }
    })
}

/// Key values of a correlation set computed from a message's properties.
/// `None` if any declared property is absent.
pub fn message_key(
    properties: &[String],
    msg_properties: &BTreeMap<String, String>,
) -> Option<CorrelationKey> {
    properties
        .iter()
        .map(|p| msg_properties.get(p).cloned())
        .collect()
}

/// Build the registration constraints for a receive-style activity from its
/// declared correlation uses and the instance's current correlation state.
/// Asserting (non-initiating) a set that is not yet initialized is a
/// correlation violation at registration time.
pub fn build_constraints(
    model: &ProcessModel,
    inst: &InstanceState,
    correlations: &[CorrelationUse],
) -> Result<Vec<CorrelationConstraint>, FaultInfo> {
    let mut constraints = Vec::with_capacity(correlations.len());
    for cu in correlations {
        let decl = model
            .correlation_set(cu.cset)
            .ok_or_else(|| FaultInfo::named(faults::FAULT_CORRELATION_VIOLATION))?;
        let current = inst
            .correlations
            .get(&cu.cset)
            .and_then(|c| c.values.clone());
        let key = match (cu.initiate, current) {
            (_, Some(values)) => Some(values),
            (true, None) => None,
            (false, None) => {
                return Err(FaultInfo::with_data(
                    faults::FAULT_CORRELATION_VIOLATION,
                    Value::String(format!("correlation set `{}` not initialized", decl.name)),
                ));
            }
        };
        constraints.push(CorrelationConstraint {
            cset: cu.cset,
            properties: decl.properties.clone(),
            key,
        });
    }
    Ok(constraints)
}
