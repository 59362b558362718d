//! Model loader cache
//!
//! Process-wide cache of loaded engines keyed by `(engine kind, variant)`.
//! The first acquire of a key spawns the load as a task owned by the cache;
//! every acquire of that key, including the first, follows the load through a
//! watch channel. A caller that gives up (a superseded worker) only drops its
//! receiver, the load itself keeps running, so a variant is loaded once no
//! matter how many jobs ask for it. Different keys load in parallel. A failed
//! load clears the slot and the next acquire retries.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify};

use crate::engine::{
    Diarizer, EngineError, EngineKey, EngineLoader, LoadProgress, LoadedEngine, Transcriber,
};
use crate::metrics::Metrics;

/// What followers of an in-flight load observe
#[derive(Clone)]
enum LoadState {
    Loading(f64),
    Ready(Result<LoadedEngine, EngineError>),
}

enum Slot {
    Loaded(LoadedEngine),
    Loading(watch::Receiver<LoadState>),
}

type Slots = DashMap<EngineKey, Slot>;

pub struct ModelCache {
    loader: Arc<dyn EngineLoader>,
    slots: Arc<Slots>,
    load_finished: Arc<Notify>,
    metrics: Metrics,
}

/// Clears a slot left in `Loading` when the load task ends, even by panic
struct LoadingSlot {
    slots: Arc<Slots>,
    key: EngineKey,
    finished: Arc<Notify>,
}

impl Drop for LoadingSlot {
    fn drop(&mut self) {
        self.slots
            .remove_if(&self.key, |_, slot| matches!(slot, Slot::Loading(_)));
        self.finished.notify_waiters();
    }
}

impl ModelCache {
    pub fn new(loader: Arc<dyn EngineLoader>, metrics: Metrics) -> Self {
        Self {
            loader,
            slots: Arc::new(DashMap::new()),
            load_finished: Arc::new(Notify::new()),
            metrics,
        }
    }

    /// Cached engine for `key`, loading it first if needed.
    ///
    /// `progress` sees the load fraction whether this call started the load or
    /// joined one already in flight. Dropping the returned future does not
    /// cancel the load.
    pub async fn acquire(
        &self,
        key: &EngineKey,
        progress: LoadProgress<'_>,
    ) -> Result<LoadedEngine, EngineError> {
        let (mut state, sender) = match self.slots.entry(key.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Loaded(engine) => {
                    let engine = engine.clone();
                    drop(entry);
                    debug!("Model cache hit for {}", key);
                    self.metrics
                        .record_model_cache_hit(key.kind.as_str(), &key.variant)
                        .await;
                    return Ok(engine);
                }
                Slot::Loading(rx) => {
                    debug!("Joining in-flight load of {}", key);
                    (rx.clone(), None)
                }
            },
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(LoadState::Loading(0.0));
                entry.insert(Slot::Loading(rx.clone()));
                (rx, Some(tx))
            }
        };
        if let Some(tx) = sender {
            self.spawn_load(key.clone(), tx);
        }

        loop {
            let current = state.borrow_and_update().clone();
            match current {
                LoadState::Loading(fraction) => progress(fraction),
                LoadState::Ready(result) => return result,
            }
            if state.changed().await.is_err() {
                // Sender gone: either the final value is there or the task died
                return match state.borrow().clone() {
                    LoadState::Ready(result) => result,
                    LoadState::Loading(_) => Err(EngineError::ModelUnavailable(format!(
                        "load of {} was aborted",
                        key
                    ))),
                };
            }
        }
    }

    fn spawn_load(&self, key: EngineKey, tx: watch::Sender<LoadState>) {
        let loader = self.loader.clone();
        let metrics = self.metrics.clone();
        let slot = LoadingSlot {
            slots: self.slots.clone(),
            key: key.clone(),
            finished: self.load_finished.clone(),
        };
        tokio::spawn(async move {
            info!("Loading {}", key);
            let started = Instant::now();
            let report = |fraction: f64| {
                tx.send_replace(LoadState::Loading(fraction));
            };
            let result = loader.load(&key, &report).await;
            let elapsed = started.elapsed().as_secs_f64();
            // The slot settles before followers wake, so a retry after a
            // failure starts a new load instead of joining this one
            match &result {
                Ok(engine) => {
                    info!("Loaded {} in {:.2}s", key, elapsed);
                    slot.slots.insert(key.clone(), Slot::Loaded(engine.clone()));
                    metrics
                        .record_model_load(key.kind.as_str(), &key.variant, elapsed, "loaded")
                        .await;
                }
                Err(e) => {
                    warn!("Failed to load {}: {}", key, e);
                    slot.slots
                        .remove_if(&key, |_, slot| matches!(slot, Slot::Loading(_)));
                    metrics
                        .record_model_load(key.kind.as_str(), &key.variant, elapsed, "failed")
                        .await;
                }
            }
            tx.send_replace(LoadState::Ready(result));
            drop(slot);
        });
    }

    pub async fn acquire_transcriber(
        &self,
        variant: &str,
        progress: LoadProgress<'_>,
    ) -> Result<Arc<dyn Transcriber>, EngineError> {
        match self.acquire(&EngineKey::transcriber(variant), progress).await? {
            LoadedEngine::Transcriber(engine) => Ok(engine),
            LoadedEngine::Diarizer(_) => Err(EngineError::ModelUnavailable(format!(
                "{} is not a transcription model",
                variant
            ))),
        }
    }

    pub async fn acquire_diarizer(
        &self,
        variant: &str,
        progress: LoadProgress<'_>,
    ) -> Result<Arc<dyn Diarizer>, EngineError> {
        match self.acquire(&EngineKey::diarizer(variant), progress).await? {
            LoadedEngine::Diarizer(engine) => Ok(engine),
            LoadedEngine::Transcriber(_) => Err(EngineError::ModelUnavailable(format!(
                "{} is not a diarization model",
                variant
            ))),
        }
    }

    /// Whether a load for `key` is in flight right now
    pub fn is_loading(&self, key: &EngineKey) -> bool {
        self.slots
            .get(key)
            .map(|slot| matches!(*slot, Slot::Loading(_)))
            .unwrap_or(false)
    }

    pub fn is_loaded(&self, key: &EngineKey) -> bool {
        self.slots
            .get(key)
            .map(|slot| matches!(*slot, Slot::Loaded(_)))
            .unwrap_or(false)
    }

    /// Resolve once no load for `key` is in flight (successful or not)
    pub async fn wait_until_loaded(&self, key: &EngineKey) {
        loop {
            let finished = self.load_finished.notified();
            if !self.is_loading(key) {
                return;
            }
            finished.await;
        }
    }

    /// Drop a cached engine; jobs already holding it keep their instance.
    /// In-flight loads are left alone.
    pub fn evict(&self, key: &EngineKey) -> bool {
        let removed = self
            .slots
            .remove_if(key, |_, slot| matches!(slot, Slot::Loaded(_)))
            .is_some();
        if removed {
            info!("Evicted {} from model cache", key);
        }
        removed
    }

    pub fn loaded_keys(&self) -> Vec<EngineKey> {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Loaded(_)))
            .map(|entry| entry.key().clone())
            .collect()
    }
}
