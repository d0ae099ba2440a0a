//! BPEL-Lite engine core.
//!
//! A business-process orchestration engine: an immutable compiled process
//! model (activities, scopes, variables, partner links, correlation sets),
//! an interpreter that drives long-lived resumable instances over it, a
//! correlation router that matches inbound messages to waiting instances,
//! and fault/compensation semantics with strict reverse-completion ordering.
//!
//! Collaborators are traits: the textual compiler ([`compiler::ProcessCompiler`]),
//! the transport binding ([`binding::MessageBinding`]), and persistence
//! ([`store::ProcessStore`]). The engine itself owns scheduling, per-instance
//! mutual exclusion, timers, and checkpointing.

pub mod binding;
pub mod compiler;
pub mod engine;
pub mod error;
pub mod events;
pub mod faults;
pub mod interp;
pub mod model;
pub mod router;
pub mod store;
pub mod store_memory;
pub mod types;

pub use binding::{DeliveryResult, MessageBinding, OutboundMessage};
pub use compiler::{ParseIssue, ProcessCompiler, Severity, ValidationIssue};
pub use engine::{Engine, InboundMessage, InstanceReport, RouteOutcome};
pub use error::EngineError;
pub use events::RuntimeEvent;
pub use model::{ActivityKind, ModelBuilder, ProcessModel};
pub use store::ProcessStore;
pub use store_memory::MemoryStore;
pub use types::{Completion, FaultInfo, InstanceLifecycle, InstanceState, Message};
