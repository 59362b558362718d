//! Deterministic engines for tests

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::engine::{
    AudioRef, Diarizer, EngineError, EngineEvent, EngineKey, EngineKind, EngineLoader,
    EventSender, LoadProgress, LoadedEngine, RawSegment, TranscribeRequest, Transcriber,
};

/// One-shot barrier: everything waiting on it proceeds once it is opened
#[derive(Default)]
pub struct Gate {
    open: AtomicBool,
    notify: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.open.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// `count` one-second segments "segment 0", "segment 1", ...
pub fn numbered_segments(count: usize) -> Vec<RawSegment> {
    (0..count)
        .map(|i| RawSegment {
            start: i as f64,
            end: i as f64 + 1.0,
            text: format!("segment {}", i),
            speaker: None,
        })
        .collect()
}

/// Transcriber returning a fixed script
pub struct ScriptedTranscriber {
    segments: Vec<RawSegment>,
    progress: Vec<f64>,
    progress_interval: Option<Duration>,
    checkpoint: Mutex<Option<(f64, Vec<u8>)>>,
    gate: Mutex<Option<Arc<Gate>>>,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    requests: Mutex<Vec<TranscribeRequest>>,
}

impl ScriptedTranscriber {
    pub fn new(segments: Vec<RawSegment>) -> Self {
        Self {
            segments,
            progress: vec![0.25, 0.5, 0.75, 1.0],
            progress_interval: None,
            checkpoint: Mutex::new(None),
            gate: Mutex::new(None),
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Progress values reported before returning, in order
    pub fn with_progress(mut self, progress: Vec<f64>) -> Self {
        self.progress = progress;
        self
    }

    /// Sleep between progress events instead of just yielding
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    /// Emit one engine checkpoint, after the progress events of the next run
    pub fn checkpoint_once(&self, offset: f64, blob: Vec<u8>) {
        *self.checkpoint.lock().unwrap() = Some((offset, blob));
    }

    /// Hold every run after its progress events until the gate opens
    pub fn hold_on(&self, gate: Arc<Gate>) {
        *self.gate.lock().unwrap() = Some(gate);
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.open();
        }
    }

    /// Fail the next `count` runs with an inference failure
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TranscribeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(
        &self,
        request: &TranscribeRequest,
        events: EventSender,
    ) -> Result<Vec<RawSegment>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        for value in &self.progress {
            let _ = events.send(EngineEvent::Progress(*value));
            match self.progress_interval {
                Some(interval) => tokio::time::sleep(interval).await,
                None => tokio::task::yield_now().await,
            }
        }
        let checkpoint = self.checkpoint.lock().unwrap().take();
        if let Some((offset, blob)) = checkpoint {
            let _ = events.send(EngineEvent::Checkpoint { offset, blob });
            tokio::task::yield_now().await;
        }

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }

        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(EngineError::InferenceFailure("scripted failure".to_string()));
        }

        let from = request.resume_from.unwrap_or(f64::NEG_INFINITY);
        Ok(self
            .segments
            .iter()
            .filter(|s| s.start >= from)
            .cloned()
            .collect())
    }
}

/// Diarizer cycling through three voices.
///
/// Like a real diarizer it numbers speakers by first appearance within one
/// pass, so the same voice can get a different label in a pass that starts
/// elsewhere.
#[derive(Default)]
pub struct ScriptedDiarizer {
    calls: AtomicUsize,
}

impl ScriptedDiarizer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Diarizer for ScriptedDiarizer {
    async fn diarize(
        &self,
        _audio: &AudioRef,
        segments: &[RawSegment],
        events: EventSender,
    ) -> Result<Vec<Option<String>>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = events.send(EngineEvent::Progress(0.5));
        let mut order: Vec<u64> = Vec::new();
        Ok(segments
            .iter()
            .map(|s| {
                let voice = (s.start as u64) % 3;
                let index = match order.iter().position(|v| *v == voice) {
                    Some(index) => index,
                    None => {
                        order.push(voice);
                        order.len() - 1
                    }
                };
                Some(format!("SPEAKER_{:02}", index))
            })
            .collect())
    }
}

/// Loader handing out the scripted engines and counting loads per key
pub struct FakeLoader {
    pub transcriber: Arc<ScriptedTranscriber>,
    pub diarizer: Arc<ScriptedDiarizer>,
    loads: DashMap<EngineKey, usize>,
    gates: DashMap<String, Arc<Gate>>,
    unavailable: Mutex<Vec<String>>,
    pause: Mutex<Option<Duration>>,
}

impl FakeLoader {
    pub fn new(transcriber: ScriptedTranscriber) -> Self {
        Self {
            transcriber: Arc::new(transcriber),
            diarizer: Arc::new(ScriptedDiarizer::default()),
            loads: DashMap::new(),
            gates: DashMap::new(),
            unavailable: Mutex::new(Vec::new()),
            pause: Mutex::new(None),
        }
    }

    /// Sleep between the load progress reports, like a loader streaming weights
    pub fn pause_while_loading(&self, pause: Duration) {
        *self.pause.lock().unwrap() = Some(pause);
    }

    /// Hold loads of `variant` until the gate opens
    pub fn hold_variant(&self, variant: &str, gate: Arc<Gate>) {
        self.gates.insert(variant.to_string(), gate);
    }

    pub fn release(&self, variant: &str) {
        if let Some((_, gate)) = self.gates.remove(variant) {
            gate.open();
        }
    }

    pub fn set_unavailable(&self, variant: &str) {
        self.unavailable.lock().unwrap().push(variant.to_string());
    }

    pub fn set_available(&self, variant: &str) {
        self.unavailable.lock().unwrap().retain(|v| v != variant);
    }

    pub fn load_count(&self, key: &EngineKey) -> usize {
        self.loads.get(key).map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl EngineLoader for FakeLoader {
    async fn load(
        &self,
        key: &EngineKey,
        progress: LoadProgress<'_>,
    ) -> Result<LoadedEngine, EngineError> {
        *self.loads.entry(key.clone()).or_insert(0) += 1;
        progress(0.0);

        let gate = self.gates.get(&key.variant).map(|g| g.clone());
        if let Some(gate) = gate {
            gate.wait().await;
        }

        if self.unavailable.lock().unwrap().contains(&key.variant) {
            return Err(EngineError::ModelUnavailable(format!(
                "variant {} is not installed",
                key.variant
            )));
        }
        progress(0.5);
        let pause = *self.pause.lock().unwrap();
        if let Some(pause) = pause {
            tokio::time::sleep(pause).await;
        }
        progress(1.0);

        Ok(match key.kind {
            EngineKind::Transcriber => LoadedEngine::Transcriber(self.transcriber.clone()),
            EngineKind::Diarizer => LoadedEngine::Diarizer(self.diarizer.clone()),
        })
    }
}
