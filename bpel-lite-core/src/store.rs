use crate::events::RuntimeEvent;
use crate::model::ProcessModel;
use crate::types::InstanceState;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence trait for all engine state.
///
/// The engine operates exclusively through this trait, enabling pluggable
/// backends. `save_instance`/`load_instance` are the checkpoint/load
/// contract: a saved instance carries its full continuation tree and
/// variable state, and a loaded one resumes event-by-event equivalently.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Instances ──

    async fn save_instance(&self, instance: &InstanceState) -> Result<()>;
    async fn load_instance(&self, id: Uuid) -> Result<Option<InstanceState>>;
    async fn list_instances(&self) -> Result<Vec<Uuid>>;
    async fn delete_instance(&self, id: Uuid) -> Result<()>;

    // ── Model store (version-keyed) ──

    async fn store_model(&self, version: [u8; 32], model: &ProcessModel) -> Result<()>;
    async fn load_model(&self, version: [u8; 32]) -> Result<Option<ProcessModel>>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64>;
    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>>;
}
