//! Command-line engines
//!
//! Runs WhisperX (or a wrapper script with the same arguments) as a child
//! process and a separate diarization command. Progress is parsed from the
//! `Progress: NN.NN%...` lines WhisperX prints with `--print_progress True`.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use crate::engine::{
    AudioRef, Diarizer, EngineError, EngineEvent, EngineKey, EngineKind, EngineLoader,
    EventSender, LoadProgress, LoadedEngine, RawSegment, TranscribeRequest, Transcriber,
};
use crate::file_utils;

/// Paths and options for the command-line engines
#[derive(Debug, Clone)]
pub struct CommandEngineConfig {
    /// WhisperX executable or wrapper script
    pub whisper_command: String,
    /// Directory holding one sub-directory per model variant
    pub models_dir: String,
    /// Scratch space for per-run output folders
    pub work_dir: PathBuf,
    /// Diarization executable; diarization is unavailable when unset
    pub diarize_command: Option<String>,
    /// HuggingFace token forwarded to the diarization command
    pub hf_token: Option<String>,
    /// Device for inference ("cuda" or "cpu")
    pub device: String,
    pub device_index: String,
}

/// Extract the fraction from a `Progress: 42.50%...` line
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let rest = line.trim().strip_prefix("Progress:")?;
    let number = rest.trim().split('%').next()?;
    let percent: f64 = number.trim().parse().ok()?;
    Some((percent / 100.0).clamp(0.0, 1.0))
}

#[derive(Debug, Deserialize)]
struct WhisperxOutput {
    #[serde(default)]
    segments: Vec<RawSegment>,
}

/// Run a child process, streaming stdout lines to `on_line`; returns stdout
/// lines not consumed as progress plus the exit status check
async fn run_command<F>(mut command: Command, mut on_line: F) -> Result<String, EngineError>
where
    F: FnMut(&str) -> bool + Send,
{
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| EngineError::InferenceFailure(format!("Failed to run command: {}", e)))?;

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        })
    });

    let mut remaining = String::new();
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if !on_line(&line) {
                remaining.push_str(&line);
                remaining.push('\n');
            }
        }
    }

    let status = child.wait().await?;
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if !status.success() {
        return Err(EngineError::InferenceFailure(format!(
            "command exited with {}: {}",
            status,
            stderr.trim()
        )));
    }
    Ok(remaining)
}

/// WhisperX speech-to-text engine bound to one model variant
pub struct WhisperxTranscriber {
    config: CommandEngineConfig,
    variant: String,
}

impl WhisperxTranscriber {
    fn build_command(&self, request: &TranscribeRequest, output_dir: &Path) -> Command {
        let mut command = Command::new(&self.config.whisper_command);
        command
            .arg(&request.audio.path)
            .arg("--model")
            .arg(&self.variant)
            .arg("--model_dir")
            .arg(format!("{}/{}", self.config.models_dir, self.variant))
            .arg("--output_dir")
            .arg(output_dir)
            .arg("--output_format")
            .arg("json")
            .arg("--print_progress")
            .arg("True")
            .arg("--device")
            .arg(&self.config.device)
            .arg("--device_index")
            .arg(&self.config.device_index);

        if !request.config.language.is_empty() {
            command.arg("--language").arg(&request.config.language);
        }
        if !request.config.prompt.is_empty() {
            command.arg("--initial_prompt").arg(&request.config.prompt);
        }

        // Chunk windows and resume offsets are both expressed as clip bounds
        let start = match (request.audio.start, request.resume_from) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if start.is_some() || request.audio.end.is_some() {
            let start = start.unwrap_or(0.0);
            let clip = match request.audio.end {
                Some(end) => format!("{},{}", start, end),
                None => format!("{}", start),
            };
            command.arg("--clip_timestamps").arg(clip);
        }
        command
    }
}

#[async_trait]
impl Transcriber for WhisperxTranscriber {
    async fn transcribe(
        &self,
        request: &TranscribeRequest,
        events: EventSender,
    ) -> Result<Vec<RawSegment>, EngineError> {
        let output_dir = self
            .config
            .work_dir
            .join(format!("{}-{}", request.file_id, Uuid::new_v4()));
        file_utils::ensure_dir(&output_dir)?;

        let command = self.build_command(request, &output_dir);
        info!(
            "Running {} for {} with model {}",
            self.config.whisper_command, request.file_id, self.variant
        );

        let result = run_command(command, |line| match parse_progress_line(line) {
            Some(fraction) => {
                let _ = events.send(EngineEvent::Progress(fraction));
                true
            }
            None => false,
        })
        .await;

        let segments = result.and_then(|_| {
            // WhisperX names the output after the input file stem
            let stem = request
                .audio
                .path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("audio");
            let output_path = output_dir.join(format!("{}.json", stem));
            let output: WhisperxOutput = file_utils::read_json(&output_path)?.ok_or_else(|| {
                EngineError::InferenceFailure(format!(
                    "output file {} was not produced",
                    output_path.display()
                ))
            })?;
            Ok(output.segments)
        });
        file_utils::cleanup_folder(&output_dir);

        let resume_from = request.resume_from.unwrap_or(f64::NEG_INFINITY);
        let segments: Vec<RawSegment> = segments?
            .into_iter()
            .filter(|s| s.start >= resume_from)
            .collect();
        let _ = events.send(EngineEvent::Progress(1.0));
        debug!("{} produced {} segments", request.file_id, segments.len());
        Ok(segments)
    }
}

/// External diarization command: reads the audio and a segments file, prints a
/// JSON array with one label (or null) per segment
pub struct CommandDiarizer {
    config: CommandEngineConfig,
    command: String,
    variant: String,
}

#[async_trait]
impl Diarizer for CommandDiarizer {
    async fn diarize(
        &self,
        audio: &AudioRef,
        segments: &[RawSegment],
        events: EventSender,
    ) -> Result<Vec<Option<String>>, EngineError> {
        file_utils::ensure_dir(&self.config.work_dir)?;
        let segments_path = self
            .config
            .work_dir
            .join(format!("diarize-{}.json", Uuid::new_v4()));
        file_utils::write_json_atomic(&segments_path, &segments)?;

        let mut command = Command::new(&self.command);
        command
            .arg("--audio")
            .arg(&audio.path)
            .arg("--segments")
            .arg(&segments_path)
            .arg("--model")
            .arg(&self.variant)
            .arg("--device")
            .arg(&self.config.device);
        if let Some(token) = self.config.hf_token.as_deref().filter(|t| !t.is_empty()) {
            command.arg("--hf_token").arg(token);
        }

        let _ = events.send(EngineEvent::Progress(0.0));
        let output = run_command(command, |line| match parse_progress_line(line) {
            Some(fraction) => {
                let _ = events.send(EngineEvent::Progress(fraction));
                true
            }
            None => false,
        })
        .await;
        if let Err(e) = file_utils::remove_file_if_exists(&segments_path) {
            warn!("Failed to remove {}: {}", segments_path.display(), e);
        }

        let labels: Vec<Option<String>> = serde_json::from_str(output?.trim()).map_err(|e| {
            EngineError::InferenceFailure(format!("invalid diarization output: {}", e))
        })?;
        if labels.len() != segments.len() {
            return Err(EngineError::InferenceFailure(format!(
                "diarization returned {} labels for {} segments",
                labels.len(),
                segments.len()
            )));
        }
        let _ = events.send(EngineEvent::Progress(1.0));
        Ok(labels)
    }
}

/// Loader producing command-line engines.
///
/// Loading only validates that the executable and model directory exist; the
/// real model load happens inside each child process.
pub struct CommandEngineLoader {
    config: CommandEngineConfig,
}

impl CommandEngineLoader {
    pub fn new(config: CommandEngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineLoader for CommandEngineLoader {
    async fn load(
        &self,
        key: &EngineKey,
        progress: LoadProgress<'_>,
    ) -> Result<LoadedEngine, EngineError> {
        progress(0.0);
        let engine = match key.kind {
            EngineKind::Transcriber => {
                if !Path::new(&self.config.whisper_command).exists() {
                    return Err(EngineError::ModelUnavailable(format!(
                        "transcription command not found: {}",
                        self.config.whisper_command
                    )));
                }
                let model_dir = Path::new(&self.config.models_dir).join(&key.variant);
                if !model_dir.is_dir() {
                    return Err(EngineError::ModelUnavailable(format!(
                        "model directory not found: {}",
                        model_dir.display()
                    )));
                }
                LoadedEngine::Transcriber(Arc::new(WhisperxTranscriber {
                    config: self.config.clone(),
                    variant: key.variant.clone(),
                }))
            }
            EngineKind::Diarizer => {
                let command = self
                    .config
                    .diarize_command
                    .clone()
                    .filter(|c| Path::new(c).exists())
                    .ok_or_else(|| {
                        EngineError::ModelUnavailable(
                            "no diarization command configured".to_string(),
                        )
                    })?;
                LoadedEngine::Diarizer(Arc::new(CommandDiarizer {
                    config: self.config.clone(),
                    command,
                    variant: key.variant.clone(),
                }))
            }
        };
        progress(1.0);
        Ok(engine)
    }
}
