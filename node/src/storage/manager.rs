//! Storage pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;

use super::Storage;
use crate::config::Config;
use crate::error::{NodeError, NodeResult};
use crate::event::{EventBus, NodeEvent};
use crate::lock::CustomLock;
use crate::task::TaskGroup;

/// A health-tracked pool of storages.
#[derive(Debug)]
pub struct StorageManager {
    /// Every storage, in declaration order.
    storages: Vec<Arc<Storage>>,

    selector: Mutex<Selector>,

    /// Whether at least one storage was online at the last refresh.
    any_online: AtomicBool,

    /// Held while no storage is online.
    online_gate: CustomLock,

    events: EventBus,
}

#[derive(Debug)]
struct Selector {
    cursor: usize,
    current_weights: Vec<i32>,
}

impl StorageManager {
    pub fn new(storages: Vec<Arc<Storage>>, events: EventBus) -> Self {
        let len = storages.len();

        Self {
            storages,
            selector: Mutex::new(Selector {
                cursor: 0,
                current_weights: vec![0; len],
            }),
            any_online: AtomicBool::new(false),
            online_gate: CustomLock::new(true),
            events,
        }
    }

    pub async fn from_config(config: &Config, events: EventBus) -> NodeResult<Self> {
        let mut storages = Vec::with_capacity(config.storages.len());

        for (index, storage_config) in config.storages.iter().enumerate() {
            let storage =
                Storage::from_config(index, storage_config, config.sync.list_concurrent).await?;
            tracing::info!(
                "Configured {} storage {} with weight {}",
                storage.kind(),
                storage.id(),
                storage.weight()
            );
            storages.push(Arc::new(storage));
        }

        Ok(Self::new(storages, events))
    }

    /// Probes every storage and starts tracking their health.
    pub async fn setup(self: &Arc<Self>, group: &TaskGroup) {
        let mut events = self.events.subscribe();

        let manager = self.clone();
        group.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(NodeEvent::StorageStatus { .. }) => manager.refresh(),
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => manager.refresh(),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        join_all(
            self.storages
                .iter()
                .map(|storage| storage.setup(group, &self.events)),
        )
        .await;

        self.refresh();
    }

    pub fn storages(&self) -> &[Arc<Storage>] {
        &self.storages
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Storage>> {
        self.storages.iter().find(|storage| storage.id() == id)
    }

    /// Returns the storages that are currently online.
    pub fn online_storages(&self) -> Vec<Arc<Storage>> {
        self.storages
            .iter()
            .filter(|storage| storage.is_online())
            .cloned()
            .collect()
    }

    pub fn is_any_online(&self) -> bool {
        self.storages.iter().any(|storage| storage.is_online())
    }

    /// Waits until at least one storage is online.
    pub async fn wait_online(&self) {
        self.online_gate.wait().await
    }

    /// Recomputes the online set and publishes transitions.
    pub fn refresh(&self) {
        let online = self.is_any_online();
        let was_online = self.any_online.swap(online, Ordering::SeqCst);

        if online == was_online {
            return;
        }

        if online {
            tracing::info!("Storage is available again");
            self.online_gate.release();
            self.events.emit(NodeEvent::StorageEnable);
        } else {
            tracing::warn!("All storages are offline");
            self.online_gate.acquire();
            self.events.emit(NodeEvent::StorageDisable);
        }
    }

    /// Picks a storage by weighted round-robin.
    ///
    /// The storage under the cursor is picked until it has been picked
    /// `weight` times, then the cursor moves on. A storage whose turn has
    /// just ended is used if no other storage can be picked. Storages
    /// with a negative weight are only used when nothing else is online.
    pub fn get_weight_storage(&self) -> NodeResult<Arc<Storage>> {
        let len = self.storages.len();
        if len == 0 {
            return Err(NodeError::NoOnlineStorage);
        }

        let mut selector = self
            .selector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut rotating = None;
        let mut fallback = None;

        for _ in 0..len {
            let index = selector.cursor;
            let storage = &self.storages[index];

            if storage.is_online() {
                let weight = storage.weight();

                if weight < 0 {
                    fallback.get_or_insert(index);
                } else if selector.current_weights[index] < weight {
                    selector.current_weights[index] += 1;
                    return Ok(storage.clone());
                } else {
                    selector.current_weights[index] = 0;
                    rotating = Some(index);
                }
            }

            selector.cursor = (index + 1) % len;
        }

        rotating
            .or(fallback)
            .map(|index| self.storages[index].clone())
            .ok_or(NodeError::NoOnlineStorage)
    }
}
