//! VNF resource store.
//!
//! The hosting cluster persists the custom resource; the control plane talks
//! to it through this trait. The in-memory implementation backs tests and
//! single-process deployments and reproduces the semantics the reconciler
//! depends on: generation bumps on spec changes, a status subresource, and
//! finalizer-gated deletion.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use mano_core::types::VnfResource;
use mano_core::{ManoError, Result};

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(VnfResource),
    Modified {
        old: Box<VnfResource>,
        new: Box<VnfResource>,
    },
    Deleted(VnfResource),
}

impl WatchEvent {
    pub fn key(&self) -> String {
        match self {
            WatchEvent::Added(vnf) | WatchEvent::Deleted(vnf) => vnf.key(),
            WatchEvent::Modified { new, .. } => new.key(),
        }
    }
}

#[async_trait]
pub trait VnfStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<VnfResource>>;
    async fn list(&self) -> Result<Vec<VnfResource>>;
    async fn create(&self, vnf: VnfResource) -> Result<VnfResource>;
    /// Replace the spec; the store bumps the generation when it changed.
    async fn update_spec(&self, vnf: &VnfResource) -> Result<VnfResource>;
    /// Metadata-only write (finalizers). Removing the last finalizer of a
    /// resource with a deletion timestamp destroys it.
    async fn update_metadata(&self, vnf: &VnfResource) -> Result<VnfResource>;
    /// Status-subresource write; spec and metadata are untouched.
    async fn update_status(&self, vnf: &VnfResource) -> Result<VnfResource>;
    /// Request deletion: destroys immediately when no finalizer holds the
    /// resource, otherwise stamps the deletion timestamp.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

pub struct InMemoryVnfStore {
    objects: RwLock<HashMap<String, VnfResource>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryVnfStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            objects: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl InMemoryVnfStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn emit(&self, event: WatchEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }
}

#[async_trait]
impl VnfStore for InMemoryVnfStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<VnfResource>> {
        let objects = self.objects.read().await;
        Ok(objects.get(&Self::key(namespace, name)).cloned())
    }

    async fn list(&self) -> Result<Vec<VnfResource>> {
        let objects = self.objects.read().await;
        Ok(objects.values().cloned().collect())
    }

    async fn create(&self, mut vnf: VnfResource) -> Result<VnfResource> {
        let mut objects = self.objects.write().await;
        let key = vnf.key();
        if objects.contains_key(&key) {
            return Err(ManoError::conflict("vnf", &key));
        }
        vnf.metadata.generation = vnf.metadata.generation.max(1);
        if vnf.metadata.creation_timestamp.is_none() {
            vnf.metadata.creation_timestamp = Some(Utc::now());
        }
        objects.insert(key, vnf.clone());
        drop(objects);
        self.emit(WatchEvent::Added(vnf.clone()));
        Ok(vnf)
    }

    async fn update_spec(&self, vnf: &VnfResource) -> Result<VnfResource> {
        let mut objects = self.objects.write().await;
        let key = vnf.key();
        let existing = objects
            .get_mut(&key)
            .ok_or_else(|| ManoError::not_found("vnf", &key))?;
        let old = existing.clone();
        if existing.spec != vnf.spec {
            existing.spec = vnf.spec.clone();
            existing.metadata.generation += 1;
        }
        let new = existing.clone();
        drop(objects);
        self.emit(WatchEvent::Modified {
            old: Box::new(old),
            new: Box::new(new.clone()),
        });
        Ok(new)
    }

    async fn update_metadata(&self, vnf: &VnfResource) -> Result<VnfResource> {
        let mut objects = self.objects.write().await;
        let key = vnf.key();
        let existing = objects
            .get_mut(&key)
            .ok_or_else(|| ManoError::not_found("vnf", &key))?;
        let old = existing.clone();
        existing.metadata.finalizers = vnf.metadata.finalizers.clone();

        if existing.metadata.deletion_timestamp.is_some()
            && existing.metadata.finalizers.is_empty()
        {
            let gone = existing.clone();
            objects.remove(&key);
            drop(objects);
            self.emit(WatchEvent::Deleted(gone.clone()));
            return Ok(gone);
        }

        let new = existing.clone();
        drop(objects);
        self.emit(WatchEvent::Modified {
            old: Box::new(old),
            new: Box::new(new.clone()),
        });
        Ok(new)
    }

    async fn update_status(&self, vnf: &VnfResource) -> Result<VnfResource> {
        let mut objects = self.objects.write().await;
        let key = vnf.key();
        let existing = objects
            .get_mut(&key)
            .ok_or_else(|| ManoError::not_found("vnf", &key))?;
        if vnf.status.observed_generation > existing.metadata.generation {
            return Err(ManoError::Internal(format!(
                "observed generation {} ahead of generation {} for {}",
                vnf.status.observed_generation, existing.metadata.generation, key
            )));
        }
        let old = existing.clone();
        existing.status = vnf.status.clone();
        let new = existing.clone();
        drop(objects);
        self.emit(WatchEvent::Modified {
            old: Box::new(old),
            new: Box::new(new.clone()),
        });
        Ok(new)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut objects = self.objects.write().await;
        let key = Self::key(namespace, name);
        let existing = objects
            .get_mut(&key)
            .ok_or_else(|| ManoError::not_found("vnf", &key))?;

        if existing.metadata.finalizers.is_empty() {
            let gone = existing.clone();
            objects.remove(&key);
            drop(objects);
            self.emit(WatchEvent::Deleted(gone));
            return Ok(());
        }

        if existing.metadata.deletion_timestamp.is_none() {
            let old = existing.clone();
            existing.metadata.deletion_timestamp = Some(Utc::now());
            let new = existing.clone();
            drop(objects);
            self.emit(WatchEvent::Modified {
                old: Box::new(old),
                new: Box::new(new.clone()),
            });
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
