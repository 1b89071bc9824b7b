//! Sidecar render-worker backend.
//!
//! The diffusion pipeline lives in an external worker process spawned from a
//! configurable command. Killing the process is what `release` means here:
//! the OS reclaims every byte of device and host memory, which makes release
//! trivially idempotent and leak-proof.
//!
//! Callers are serialized by the lifecycle gate, so a single in-flight
//! request per worker is an invariant, not a limitation.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use base64::{engine::general_purpose, Engine as _};

use crate::error::GenerateError;
use crate::ipc::{WorkerCommand, WorkerPayload, WorkerReply, WorkerRequest};
use crate::pipeline::{DiffusionBackend, LoadedPipeline, RenderParams, RenderedImage};
use crate::strategy::{DeviceKind, OffloadStrategy};
use crate::{log_debug, log_info, log_warn};

pub struct WorkerBackend {
    worker_cmd: String,
    cache_dir: Option<PathBuf>,
    proc: Mutex<Option<WorkerProc>>,
    next_id: AtomicU64,
}

struct WorkerProc {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerBackend {
    pub fn new(worker_cmd: impl Into<String>, cache_dir: Option<PathBuf>) -> Self {
        WorkerBackend {
            worker_cmd: worker_cmd.into(),
            cache_dir,
            proc: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn spawn_worker(&self) -> Result<WorkerProc, GenerateError> {
        let mut parts = self.worker_cmd.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            GenerateError::ResourceUnavailable("worker command is empty".to_string())
        })?;

        log_info!("Spawning render worker: {}", self.worker_cmd);

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Worker logs go to our stderr
            .spawn()
            .map_err(|e| {
                GenerateError::ResourceUnavailable(format!(
                    "cannot spawn render worker '{}': {e}",
                    self.worker_cmd
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            GenerateError::ExecutionFailure("worker stdin not available".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            GenerateError::ExecutionFailure("worker stdout not available".to_string())
        })?;

        Ok(WorkerProc {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Send one command and block until the matching reply arrives.
    fn send_and_wait(
        &self,
        proc: &mut WorkerProc,
        command: WorkerCommand,
    ) -> Result<WorkerPayload, GenerateError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = WorkerRequest { id, command };
        let json = serde_json::to_string(&request)
            .map_err(|e| GenerateError::ExecutionFailure(format!("serialize error: {e}")))?;

        writeln!(proc.stdin, "{json}")
            .and_then(|_| proc.stdin.flush())
            .map_err(|e| GenerateError::ExecutionFailure(format!("worker stdin closed: {e}")))?;

        let mut line = String::new();
        loop {
            line.clear();
            let n = proc.stdout.read_line(&mut line).map_err(|e| {
                GenerateError::ExecutionFailure(format!("worker stdout read failed: {e}"))
            })?;
            if n == 0 {
                return Err(GenerateError::ExecutionFailure(
                    "render worker exited unexpectedly".to_string(),
                ));
            }
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<WorkerReply>(&line) {
                Ok(reply) if reply.id == id => return Ok(reply.payload),
                Ok(reply) => {
                    // Stale reply from a request whose caller gave up; skip.
                    log_debug!("Discarding stale worker reply id={}", reply.id);
                }
                Err(e) => {
                    log_warn!("Unparseable worker output ({e}): {}", line.trim());
                }
            }
        }
    }

    fn kill_worker(&self, proc: &mut Option<WorkerProc>) {
        if let Some(ref mut wp) = proc {
            // Offer a graceful shutdown, then make sure.
            let request = WorkerRequest {
                id: 0,
                command: WorkerCommand::Shutdown,
            };
            if let Ok(json) = serde_json::to_string(&request) {
                let _ = writeln!(wp.stdin, "{json}");
                let _ = wp.stdin.flush();
            }
            let _ = wp.child.kill();
            let _ = wp.child.wait(); // Reap
            log_info!("Render worker stopped, device memory reclaimed");
        }
        *proc = None;
    }
}

impl DiffusionBackend for WorkerBackend {
    fn construct(
        &self,
        model_id: &str,
        strategy: &OffloadStrategy,
    ) -> Result<LoadedPipeline, GenerateError> {
        let mut guard = self.proc.lock().unwrap_or_else(|p| p.into_inner());

        // A fresh process per pipeline: construct after release always starts
        // from a clean address space.
        self.kill_worker(&mut guard);
        let mut proc = self.spawn_worker()?;

        let started = Instant::now();
        let command = WorkerCommand::LoadPipeline {
            model_id: model_id.to_string(),
            device: match strategy.device {
                DeviceKind::Cuda => "cuda".to_string(),
                DeviceKind::Cpu => "cpu".to_string(),
            },
            tier: strategy.tier.as_str().to_string(),
            reduced_precision: strategy.reduced_precision,
            attention_slicing: strategy.attention_slicing,
            sequential_offload: strategy.sequential_offload,
            cache_dir: self
                .cache_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        };

        let payload = match self.send_and_wait(&mut proc, command) {
            Ok(p) => p,
            Err(e) => {
                let mut doomed = Some(proc);
                self.kill_worker(&mut doomed);
                return Err(e);
            }
        };

        match payload {
            WorkerPayload::PipelineLoaded {
                model_id: loaded_id,
                load_seconds,
            } => {
                log_info!(
                    "Pipeline {loaded_id} loaded in {load_seconds:.1}s worker-side, {:.1}s total ({} tier)",
                    started.elapsed().as_secs_f64(),
                    strategy.tier.as_str()
                );
                *guard = Some(proc);
                Ok(LoadedPipeline {
                    model_id: loaded_id,
                    strategy: strategy.clone(),
                })
            }
            WorkerPayload::Error { message } => {
                let mut doomed = Some(proc);
                self.kill_worker(&mut doomed);
                Err(classify_worker_error(&message))
            }
            other => {
                let mut doomed = Some(proc);
                self.kill_worker(&mut doomed);
                Err(GenerateError::ExecutionFailure(format!(
                    "unexpected reply to LoadPipeline: {other:?}"
                )))
            }
        }
    }

    fn render(
        &self,
        _pipeline: &LoadedPipeline,
        params: &RenderParams,
    ) -> Result<RenderedImage, GenerateError> {
        let mut guard = self.proc.lock().unwrap_or_else(|p| p.into_inner());
        let proc = guard.as_mut().ok_or_else(|| {
            GenerateError::ExecutionFailure("render worker is not running".to_string())
        })?;

        let command = WorkerCommand::Render {
            prompt: params.prompt.clone(),
            steps: params.steps,
            guidance: params.guidance,
            width: params.width,
            height: params.height,
            seed: params.seed,
        };

        match self.send_and_wait(proc, command)? {
            WorkerPayload::RenderComplete {
                image_b64,
                render_seconds,
            } => {
                let png_bytes = general_purpose::STANDARD.decode(image_b64).map_err(|e| {
                    GenerateError::ExecutionFailure(format!("worker sent invalid image data: {e}"))
                })?;
                log_debug!(
                    "Worker rendered {}x{} in {render_seconds:.1}s ({} bytes)",
                    params.width,
                    params.height,
                    png_bytes.len()
                );
                Ok(RenderedImage { png_bytes })
            }
            WorkerPayload::Error { message } => Err(classify_worker_error(&message)),
            other => Err(GenerateError::ExecutionFailure(format!(
                "unexpected reply to Render: {other:?}"
            ))),
        }
    }

    fn release(&self, pipeline: LoadedPipeline) {
        let mut guard = self.proc.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_some() {
            log_info!("Releasing pipeline {}", pipeline.model_id);
        }
        self.kill_worker(&mut guard);
    }
}

impl Drop for WorkerBackend {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.proc.lock() {
            self.kill_worker(&mut guard);
        }
    }
}

/// Map a worker error string onto the error taxonomy.
pub(crate) fn classify_worker_error(message: &str) -> GenerateError {
    let lower = message.to_lowercase();

    let memory = ["out of memory", "cuda error", "oom", "allocation failed"];
    if memory.iter().any(|m| lower.contains(m)) {
        return GenerateError::ResourceExhausted(message.to_string());
    }

    let unavailable = [
        "not found",
        "no such file",
        "download",
        "checksum",
        "unauthorized",
        "connection",
        "network",
    ];
    if unavailable.iter().any(|m| lower.contains(m)) {
        return GenerateError::ResourceUnavailable(message.to_string());
    }

    // Parameters are validated before the worker sees them, but the worker
    // may still reject a combination we let through.
    if lower.contains("invalid") {
        return GenerateError::InvalidRequest(message.to_string());
    }

    GenerateError::ExecutionFailure(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_messages_classify_as_exhausted() {
        assert!(matches!(
            classify_worker_error("CUDA out of memory. Tried to allocate 2.50 GiB"),
            GenerateError::ResourceExhausted(_)
        ));
        assert!(matches!(
            classify_worker_error("cuda error: device-side assert"),
            GenerateError::ResourceExhausted(_)
        ));
    }

    #[test]
    fn weight_fetch_messages_classify_as_unavailable() {
        assert!(matches!(
            classify_worker_error("model repo not found: black-forest-labs/FLUX.9"),
            GenerateError::ResourceUnavailable(_)
        ));
        assert!(matches!(
            classify_worker_error("download interrupted: connection reset"),
            GenerateError::ResourceUnavailable(_)
        ));
        assert!(matches!(
            classify_worker_error("checksum mismatch for transformer shard 3"),
            GenerateError::ResourceUnavailable(_)
        ));
    }

    #[test]
    fn opaque_messages_classify_as_execution_failure() {
        assert!(matches!(
            classify_worker_error("tensor shape mismatch in attention block"),
            GenerateError::ExecutionFailure(_)
        ));
    }

    #[test]
    fn worker_side_validation_classifies_as_invalid_request() {
        assert!(matches!(
            classify_worker_error("invalid height: must be divisible by the VAE scale factor"),
            GenerateError::InvalidRequest(_)
        ));
    }

    #[test]
    fn spawn_failure_is_resource_unavailable() {
        let backend = WorkerBackend::new("definitely-not-a-real-binary-4d7f1", None);
        let err = backend
            .construct("black-forest-labs/FLUX.2-dev", &crate::strategy::cpu_fallback())
            .unwrap_err();
        assert!(matches!(err, GenerateError::ResourceUnavailable(_)));
    }

    #[test]
    fn render_without_running_worker_fails_cleanly() {
        let backend = WorkerBackend::new("true", None);
        let pipeline = LoadedPipeline {
            model_id: "m".to_string(),
            strategy: crate::strategy::cpu_fallback(),
        };
        let params = RenderParams {
            prompt: "p".to_string(),
            steps: 1,
            guidance: 1.0,
            width: 256,
            height: 256,
            seed: 0,
        };
        assert!(matches!(
            backend.render(&pipeline, &params),
            Err(GenerateError::ExecutionFailure(_))
        ));
    }
}
