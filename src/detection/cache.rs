// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Process-wide model cache
//!
//! Each model id owns one [`OnceCell`], so concurrent loads of the same model
//! wait on the in-flight initialization instead of loading it twice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::OnceCell;
use tracing::info;

use super::error::DetectorError;
use super::onnx::OnnxSession;

type Slot<T> = Arc<OnceCell<Arc<T>>>;

pub struct ModelCache<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
}

impl<T> Default for ModelCache<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl ModelCache<OnnxSession> {
    /// Cache shared by every detector in the process
    pub fn global() -> Arc<ModelCache<OnnxSession>> {
        static GLOBAL: OnceLock<Arc<ModelCache<OnnxSession>>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(ModelCache::default()))
            .clone()
    }
}

impl<T> ModelCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &str) -> Slot<T> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(id.to_string()).or_default().clone()
    }

    /// Return the cached value for `id`, running `init` if nobody has yet.
    /// A failed init leaves the slot empty so a later call can retry.
    pub async fn get_or_try_init<F, Fut>(&self, id: &str, init: F) -> Result<Arc<T>, DetectorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DetectorError>>,
    {
        let slot = self.slot(id);
        let value = slot
            .get_or_try_init(|| async { init().await.map(Arc::new) })
            .await?;
        Ok(value.clone())
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(id).and_then(|slot| slot.get().cloned())
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Drop the cached value; returns whether one was loaded
    pub fn release(&self, id: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let released = slots
            .remove(id)
            .map(|slot| slot.initialized())
            .unwrap_or(false);
        if released {
            info!("Released model {}", id);
        }
        released
    }

    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.clear();
    }

    pub fn loaded_count(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.values().filter(|slot| slot.initialized()).count()
    }
}
