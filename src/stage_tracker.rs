//! Stage tracker
//!
//! Maps raw engine callbacks onto the canonical `(stage, progress, message)`
//! triple shown to clients. Overall progress is split in fixed bands:
//!
//! | stage              | band        |
//! |--------------------|-------------|
//! | loading model      | 0.00 - 0.15 |
//! | transcribing       | 0.15 - 0.85 |
//! | diarizing          | 0.85 - 0.95 |
//! | creating segments  | 0.95 - 1.00 |
//!
//! The mapping itself is pure. [`StageTracker`] adds the per-attempt clamp that
//! keeps the displayed value from going backwards when an engine restarts
//! internally or repeats a callback.

use chrono::{DateTime, Duration, Utc};

use crate::job::{JobStatus, Stage};

pub const LOAD_BAND: (f64, f64) = (0.0, 0.15);
pub const TRANSCRIBE_BAND: (f64, f64) = (0.15, 0.85);
pub const DIARIZE_BAND: (f64, f64) = (0.85, 0.95);
pub const SEGMENT_BAND: (f64, f64) = (0.95, 1.0);

/// Raw progress signal coming out of a worker
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerEvent {
    /// Fraction of model weights loaded
    ModelLoad(f64),
    /// Fraction of audio processed by the speech-to-text engine
    Transcription(f64),
    /// Fraction of diarization done
    Diarization(f64),
    /// Segments persisted so far out of the total
    SegmentsPersisted { done: u32, total: u32 },
    /// Final bookkeeping after the last segment
    Finalizing,
}

/// Canonical triple plus the status it implies
#[derive(Debug, Clone, PartialEq)]
pub struct StageUpdate {
    pub status: JobStatus,
    pub stage: Stage,
    pub progress: f64,
    pub message: String,
}

fn fraction(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn scale(band: (f64, f64), value: f64) -> f64 {
    band.0 + (band.1 - band.0) * fraction(value)
}

/// Pure mapping of one event, without any clamping against history
pub fn map_event(event: TrackerEvent) -> StageUpdate {
    match event {
        TrackerEvent::ModelLoad(value) => StageUpdate {
            status: JobStatus::ModelLoading,
            stage: Stage::LoadingModel,
            progress: scale(LOAD_BAND, value),
            message: "loading model".to_string(),
        },
        TrackerEvent::Transcription(value) => StageUpdate {
            status: JobStatus::Processing,
            stage: Stage::Transcribing,
            progress: scale(TRANSCRIBE_BAND, value),
            message: format!(
                "transcribing audio — {}% complete",
                (fraction(value) * 100.0).round() as u32
            ),
        },
        TrackerEvent::Diarization(value) => StageUpdate {
            status: JobStatus::Processing,
            stage: Stage::Diarizing,
            progress: scale(DIARIZE_BAND, value),
            message: "identifying speakers".to_string(),
        },
        TrackerEvent::SegmentsPersisted { done, total } => {
            let value = if total == 0 {
                1.0
            } else {
                f64::from(done) / f64::from(total)
            };
            StageUpdate {
                status: JobStatus::Processing,
                stage: Stage::CreatingSegments,
                progress: scale(SEGMENT_BAND, value),
                message: format!("saving segments ({}/{})", done, total),
            }
        }
        TrackerEvent::Finalizing => StageUpdate {
            status: JobStatus::Processing,
            stage: Stage::Finalizing,
            progress: SEGMENT_BAND.1,
            message: "finalizing transcript".to_string(),
        },
    }
}

/// Per-attempt tracker; one instance lives exactly as long as one resume token
#[derive(Debug, Clone)]
pub struct StageTracker {
    high_water: f64,
}

impl StageTracker {
    pub fn new() -> Self {
        Self { high_water: 0.0 }
    }

    /// Start from a persisted value, used when resuming
    pub fn starting_at(progress: f64) -> Self {
        Self {
            high_water: fraction(progress),
        }
    }

    pub fn high_water(&self) -> f64 {
        self.high_water
    }

    /// Map an event and clamp it to the highest value seen so far
    pub fn observe(&mut self, event: TrackerEvent) -> StageUpdate {
        let mut update = map_event(event);
        if update.progress < self.high_water {
            update.progress = self.high_water;
        } else {
            self.high_water = update.progress;
        }
        update
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Advisory stall check, evaluated at read time.
///
/// Terminal and pending jobs are never stalled; an active job with no recorded
/// progress falls back to its last update time.
pub fn is_stalled(
    status: JobStatus,
    last_progress_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    if !status.is_active() {
        return false;
    }
    let last = last_progress_at.unwrap_or(updated_at);
    now.signed_duration_since(last) > threshold
}
