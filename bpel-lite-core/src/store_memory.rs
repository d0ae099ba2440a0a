use crate::events::RuntimeEvent;
use crate::model::ProcessModel;
use crate::store::ProcessStore;
use crate::types::InstanceState;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    /// Instances are held serialized so every checkpoint round-trips
    /// through serde, the same path a durable backend would take.
    instances: HashMap<Uuid, String>,
    models: HashMap<[u8; 32], String>,
    events: HashMap<Uuid, Vec<RuntimeEvent>>,
}

/// In-memory reference store. Backs the test suite.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn save_instance(&self, instance: &InstanceState) -> Result<()> {
        let json = serde_json::to_string(instance).context("serialize instance")?;
        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(instance.instance_id, json);
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<InstanceState>> {
        let inner = self.inner.lock().unwrap();
        match inner.instances.get(&id) {
            Some(json) => Ok(Some(
                serde_json::from_str(json).context("deserialize instance")?,
            )),
            None => Ok(None),
        }
    }

    async fn list_instances(&self) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.instances.keys().copied().collect())
    }

    async fn delete_instance(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.instances.remove(&id);
        Ok(())
    }

    async fn store_model(&self, version: [u8; 32], model: &ProcessModel) -> Result<()> {
        let json = serde_json::to_string(model).context("serialize model")?;
        let mut inner = self.inner.lock().unwrap();
        inner.models.insert(version, json);
        Ok(())
    }

    async fn load_model(&self, version: [u8; 32]) -> Result<Option<ProcessModel>> {
        let inner = self.inner.lock().unwrap();
        match inner.models.get(&version) {
            Some(json) => Ok(Some(serde_json::from_str(json).context("deserialize model")?)),
            None => Ok(None),
        }
    }

    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let log = inner.events.entry(instance_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64)
    }

    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>> {
        let inner = self.inner.lock().unwrap();
        let log = inner.events.get(&instance_id).cloned().unwrap_or_default();
        Ok(log
            .into_iter()
            .enumerate()
            .map(|(i, e)| ((i + 1) as u64, e))
            .filter(|(seq, _)| *seq >= from_seq)
            .collect())
    }
}
