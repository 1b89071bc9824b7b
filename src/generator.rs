//! Pipeline lifecycle management: lazy loading, single-flight rendering, and
//! idle eviction.
//!
//! All load-state mutation funnels through one exclusivity gate. Status
//! queries never take the gate; they read a snapshot guarded by its own
//! short-lived lock. Remaining-time math uses the monotonic clock, so wall
//! clock adjustments cannot skew eviction.
//!
//! Gate waits are unbounded: concurrent generate calls queue on the mutex
//! and execute strictly serially.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::artifact::{save_artifact, SidecarRecord};
use crate::config::{model_defaults, resolve_model_preset, Config};
use crate::error::GenerateError;
use crate::models::{GenerateRequest, GenerationOutcome, GeneratorStatus};
use crate::pipeline::{DiffusionBackend, LoadedPipeline, RenderParams};
use crate::strategy::{cpu_fallback, select, OffloadStrategy, TierThresholds};
use crate::vram;
use crate::{log_info, log_warn};

/// VRAM probe, injectable so tests can count device accesses.
pub type ProbeFn = Arc<dyn Fn() -> Option<f64> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    /// Model constructed on the first generation request.
    pub model_id: String,
    /// Inactivity window before eviction. Zero disables eviction.
    pub idle_timeout: Duration,
    /// Whether to run the background eviction timer at all. CLI-style
    /// front-ends disable it since the process exits after each invocation.
    pub auto_unload: bool,
    pub output_dir: std::path::PathBuf,
    pub default_steps: u32,
    pub default_guidance: f32,
    pub thresholds: TierThresholds,
}

impl GeneratorOptions {
    pub fn from_config(config: &Config, auto_unload: bool) -> Self {
        GeneratorOptions {
            model_id: config.model_id.clone(),
            idle_timeout: Duration::from_secs(config.unload_timeout_secs),
            auto_unload,
            output_dir: config.output_dir.clone(),
            default_steps: config.default_steps,
            default_guidance: config.default_guidance,
            thresholds: config.thresholds,
        }
    }
}

enum TimerMsg {
    Rearm(Instant),
    Disarm,
}

/// Everything behind the exclusivity gate.
struct Slot {
    pipeline: Option<LoadedPipeline>,
    /// Model the next load will construct. Updated by switch_model.
    target_model: String,
}

/// Readable without the gate.
struct Snapshot {
    loaded: bool,
    model: Option<String>,
    next_model: String,
    strategy: Option<OffloadStrategy>,
    timeout: Duration,
    last_access_unix: Option<u64>,
    /// Monotonic base for the eviction deadline. Refreshed on successful
    /// access and on nonzero set_timeout.
    deadline_base: Option<Instant>,
    timer_armed: bool,
}

struct Inner {
    backend: Arc<dyn DiffusionBackend>,
    probe: ProbeFn,
    options: GeneratorOptions,
    gate: Mutex<Slot>,
    snapshot: Mutex<Snapshot>,
    timer_tx: Option<Sender<TimerMsg>>,
}

#[derive(Clone)]
pub struct FluxGenerator {
    inner: Arc<Inner>,
}

impl FluxGenerator {
    pub fn new(backend: Arc<dyn DiffusionBackend>, options: GeneratorOptions) -> Self {
        Self::with_probe(backend, options, Arc::new(vram::probe_total_vram_gb))
    }

    pub fn with_probe(
        backend: Arc<dyn DiffusionBackend>,
        options: GeneratorOptions,
        probe: ProbeFn,
    ) -> Self {
        let (timer_tx, timer_rx) = if options.auto_unload {
            let (tx, rx) = unbounded();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let inner = Arc::new(Inner {
            backend,
            probe,
            gate: Mutex::new(Slot {
                pipeline: None,
                target_model: options.model_id.clone(),
            }),
            snapshot: Mutex::new(Snapshot {
                loaded: false,
                model: None,
                next_model: options.model_id.clone(),
                strategy: None,
                timeout: options.idle_timeout,
                last_access_unix: None,
                deadline_base: None,
                timer_armed: false,
            }),
            timer_tx,
            options,
        });

        if let Some(rx) = timer_rx {
            let weak = Arc::downgrade(&inner);
            std::thread::Builder::new()
                .name("flux-evictor".to_string())
                .spawn(move || eviction_loop(weak, rx))
                .expect("failed to spawn eviction timer thread");
        }

        FluxGenerator { inner }
    }

    /// Generate one image. Validates before any device access, then holds
    /// the gate across ensure-loaded and render.
    pub fn generate(&self, request: GenerateRequest) -> Result<GenerationOutcome, GenerateError> {
        request.validate()?;

        let inner = &self.inner;
        let mut slot = inner.gate.lock().unwrap_or_else(|p| p.into_inner());

        inner.ensure_loaded(&mut slot)?;
        let pipeline = slot
            .pipeline
            .as_ref()
            .expect("pipeline present after ensure_loaded");
        let model_id = pipeline.model_id.clone();

        // Per-model smart defaults, falling back to the configured globals.
        let (model_steps, model_guidance) = model_defaults(&model_id)
            .unwrap_or((inner.options.default_steps, inner.options.default_guidance));
        let steps = request.steps.unwrap_or(model_steps);
        let guidance = request.guidance.unwrap_or(model_guidance);
        let seed = request
            .seed
            .unwrap_or_else(|| u64::from(rand::random::<u32>()));

        let params = RenderParams {
            prompt: request.prompt.clone(),
            steps,
            guidance,
            width: request.width,
            height: request.height,
            seed,
        };

        log_info!(
            "Generating {}x{} image with seed={seed}, steps={steps}, guidance={guidance}",
            params.width,
            params.height
        );

        let started = Instant::now();
        let rendered = match inner.backend.render(pipeline, &params) {
            Ok(img) => img,
            Err(e) if e.is_memory_pressure() => {
                // The pipeline may be corrupted by the allocation failure;
                // release so the next call reloads cleanly.
                log_warn!("Render exhausted device memory; releasing pipeline: {e}");
                inner.release_locked(&mut slot);
                return Err(e);
            }
            Err(e) => {
                // Non-memory failure: the loaded pipeline is presumed intact.
                return Err(e);
            }
        };
        let duration_seconds = started.elapsed().as_secs_f64();

        let record = SidecarRecord {
            prompt: request.prompt.clone(),
            seed,
            steps,
            guidance,
            width: request.width,
            height: request.height,
            model: model_id.clone(),
            duration_seconds,
            timestamp: chrono::Local::now().to_rfc3339(),
        };
        let (image_path, sidecar_path) = save_artifact(
            &rendered.png_bytes,
            request.output.as_deref(),
            &inner.options.output_dir,
            &record,
        )?;

        inner.touch();

        log_info!(
            "Image generated in {duration_seconds:.2}s: {}",
            image_path.display()
        );

        Ok(GenerationOutcome {
            image_path,
            sidecar_path,
            seed,
            steps,
            guidance,
            width: request.width,
            height: request.height,
            model: model_id,
            duration_seconds,
        })
    }

    /// Construct the pipeline now instead of on the first generate.
    pub fn load(&self) -> Result<(), GenerateError> {
        let inner = &self.inner;
        let mut slot = inner.gate.lock().unwrap_or_else(|p| p.into_inner());
        inner.ensure_loaded(&mut slot)?;
        inner.touch();
        Ok(())
    }

    /// Release the pipeline immediately. A no-op when nothing is loaded.
    pub fn unload(&self) {
        let inner = &self.inner;
        let mut slot = inner.gate.lock().unwrap_or_else(|p| p.into_inner());
        inner.release_locked(&mut slot);
    }

    /// Change the idle timeout. Takes effect immediately: while loaded, a
    /// nonzero timeout arms a new deadline measured from now; zero disarms
    /// eviction until changed back.
    pub fn set_timeout(&self, seconds: u64) -> u64 {
        let inner = &self.inner;
        let _slot = inner.gate.lock().unwrap_or_else(|p| p.into_inner());

        let mut snap = inner.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        let previous = snap.timeout.as_secs();
        snap.timeout = Duration::from_secs(seconds);

        if seconds == 0 {
            snap.timer_armed = false;
            snap.deadline_base = None;
            if let Some(ref tx) = inner.timer_tx {
                let _ = tx.send(TimerMsg::Disarm);
            }
            log_info!("Idle eviction disabled");
        } else if snap.loaded {
            let now = Instant::now();
            snap.deadline_base = Some(now);
            if let Some(ref tx) = inner.timer_tx {
                let _ = tx.send(TimerMsg::Rearm(now + snap.timeout));
                snap.timer_armed = true;
            }
            log_info!("Idle timeout set to {seconds}s (deadline re-measured from now)");
        } else {
            log_info!("Idle timeout set to {seconds}s");
        }

        previous
    }

    /// Select a different model. The current pipeline is released now; the
    /// new one is constructed lazily on the next generation request, so
    /// switching twice before generating costs nothing.
    pub fn switch_model(&self, model: &str) {
        let resolved = resolve_model_preset(model);
        let inner = &self.inner;
        let mut slot = inner.gate.lock().unwrap_or_else(|p| p.into_inner());

        // Selecting the model that is already resident is a no-op.
        let already_loaded = slot
            .pipeline
            .as_ref()
            .is_some_and(|p| p.model_id == resolved);

        if slot.target_model != resolved {
            log_info!("Switching model {} -> {resolved}", slot.target_model);
        }
        slot.target_model = resolved.clone();
        if !already_loaded {
            inner.release_locked(&mut slot);
        }

        let mut snap = inner.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        snap.next_model = resolved;
    }

    /// Consistent point-in-time view. Never blocks on the gate, so it stays
    /// responsive during a multi-minute render.
    pub fn status(&self) -> GeneratorStatus {
        let inner = &self.inner;
        let snap = inner.snapshot.lock().unwrap_or_else(|p| p.into_inner());

        let seconds_until_unload = match (snap.loaded, snap.timer_armed, snap.deadline_base) {
            (true, true, Some(base)) if snap.timeout > Duration::ZERO => {
                let deadline = base + snap.timeout;
                Some(
                    deadline
                        .saturating_duration_since(Instant::now())
                        .as_secs_f64(),
                )
            }
            _ => None,
        };

        let mut status = GeneratorStatus {
            loaded: snap.loaded,
            model: snap.model.clone(),
            next_model: snap.next_model.clone(),
            strategy: snap.strategy.clone(),
            timeout_seconds: snap.timeout.as_secs(),
            seconds_until_unload,
            last_access_unix: snap.last_access_unix,
            vram_used_gb: None,
            vram_total_gb: None,
        };
        drop(snap);

        // The usage query shells out; do it after the snapshot lock is gone.
        if let Some((used, total)) = vram::query_vram_usage_gb() {
            status.vram_used_gb = Some(used);
            status.vram_total_gb = Some(total);
        }

        status
    }
}

impl Inner {
    /// Construct the pipeline for the current target model if nothing is
    /// loaded. Caller holds the gate.
    fn ensure_loaded(&self, slot: &mut Slot) -> Result<(), GenerateError> {
        if slot.pipeline.is_some() {
            return Ok(());
        }

        let strategy = match (self.probe)() {
            Some(budget_gb) => {
                let strategy = select(budget_gb, &self.options.thresholds);
                log_info!(
                    "Detected {budget_gb:.1}GB VRAM -> {} tier",
                    strategy.tier.as_str()
                );
                strategy
            }
            None => {
                log_warn!("No compatible accelerator; falling back to CPU (very slow)");
                cpu_fallback()
            }
        };

        log_info!("Loading pipeline: {}", slot.target_model);
        let pipeline = self.backend.construct(&slot.target_model, &strategy)?;

        let mut snap = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        snap.loaded = true;
        snap.model = Some(pipeline.model_id.clone());
        snap.strategy = Some(pipeline.strategy.clone());
        drop(snap);

        slot.pipeline = Some(pipeline);
        Ok(())
    }

    /// Release the pipeline and disarm the timer. Caller holds the gate.
    /// Idempotent.
    fn release_locked(&self, slot: &mut Slot) {
        if let Some(pipeline) = slot.pipeline.take() {
            log_info!("Unloading pipeline {}", pipeline.model_id);
            self.backend.release(pipeline);
        }

        let mut snap = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        snap.loaded = false;
        snap.model = None;
        snap.strategy = None;
        snap.last_access_unix = None;
        snap.deadline_base = None;
        snap.timer_armed = false;
        drop(snap);

        if let Some(ref tx) = self.timer_tx {
            let _ = tx.send(TimerMsg::Disarm);
        }
    }

    /// Refresh the last-access timestamp and rearm the eviction deadline.
    /// Caller holds the gate. Idempotent.
    fn touch(&self) {
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs());

        let mut snap = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        snap.last_access_unix = now_unix;

        if snap.timeout > Duration::ZERO {
            let now = Instant::now();
            snap.deadline_base = Some(now);
            if let Some(ref tx) = self.timer_tx {
                let _ = tx.send(TimerMsg::Rearm(now + snap.timeout));
                snap.timer_armed = true;
            }
        }
    }

    /// Called by the timer thread when a deadline elapses. Re-checks "still
    /// idle past deadline" under the gate, so a firing made stale by a
    /// just-finished render is a no-op.
    fn evict_if_idle(&self) {
        let mut slot = self.gate.lock().unwrap_or_else(|p| p.into_inner());

        let expired = {
            let snap = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
            match (snap.loaded, snap.deadline_base) {
                (true, Some(base)) if snap.timeout > Duration::ZERO => {
                    Instant::now() >= base + snap.timeout
                }
                _ => false,
            }
        };

        if expired {
            log_info!("Idle timeout reached; evicting pipeline");
            self.release_locked(&mut slot);
        }
    }
}

fn eviction_loop(inner: Weak<Inner>, rx: Receiver<TimerMsg>) {
    let mut deadline: Option<Instant> = None;
    loop {
        let msg = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    deadline = None;
                    match inner.upgrade() {
                        Some(strong) => strong.evict_if_idle(),
                        None => return,
                    }
                    continue;
                }
                match rx.recv_timeout(d - now) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match rx.recv() {
                Ok(msg) => msg,
                Err(_) => return,
            },
        };

        match msg {
            TimerMsg::Rearm(d) => deadline = Some(d),
            TimerMsg::Disarm => deadline = None,
        }
    }
}
