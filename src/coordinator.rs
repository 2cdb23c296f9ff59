// coordinator.rs: Owns the capture session. At most one live stream, one
// continuous-capture timer and one analysis in flight at a time.
//
// Every public operation reports failure through a sentinel return value
// plus `analysis_error`; nothing here panics or returns an error to the UI.
// Session state is published as a `SessionSnapshot` after each change.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ai::models::is_vision_model;
use crate::ai::registry::{ProvidersConfig, StaticRegistry};
use crate::ai::{ChatMessage, ProviderRegistry};
use crate::capture::frame::{parse_data_url, sample_frame, CaptureOptions, SampleParams};
use crate::capture::{
    CaptureError, DesktopSource, DesktopSourceKind, HostEnvironment, MediaStream,
    SourcesRequest, StreamAcquirer, StreamRequest, SystemAcquirer,
};
use crate::settings::{
    config_path, AnalysisMode, CaptureSource, SettingsError, SettingsPatch, SettingsStore,
    VisionSettings,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a visual assistant. Describe what you see in \
this image concisely in 2-3 sentences. Mention which application or content is visible, any \
readable text, what the user appears to be doing, and anything else notable.";

const USER_PROMPT: &str = "What do you see?";

pub const NO_STREAM_ERROR: &str = "No active capture stream";
pub const NO_SOURCES_ERROR: &str = "No screen or window sources available";
pub const NO_PROVIDER_ERROR: &str = "No vision provider configured";
pub const NO_MODEL_ERROR: &str = "No vision model configured";

/// A successful analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Unix time in milliseconds
    pub timestamp: u64,
    pub description: String,
}

/// What a continuous tick does when the previous analysis is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Skip the tick. No queueing; the next tick tries again.
    #[default]
    Drop,
    /// Run the analysis inside the timer task, so later ticks wait for it.
    Wait,
}

/// Everything a UI needs to render the vision panel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub capture_source: CaptureSource,
    pub analysis_mode: AnalysisMode,
    pub is_capturing: bool,
    pub is_analyzing: bool,
    pub is_continuous_active: bool,
    pub preview_image_data_url: Option<String>,
    pub last_analysis_result: Option<AnalysisResult>,
    pub analysis_error: Option<String>,
    pub selected_desktop_source_id: Option<String>,
    pub available_desktop_sources: Vec<DesktopSource>,
    pub is_loading_desktop_sources: bool,
}

#[derive(Default)]
struct SessionState {
    is_capturing: bool,
    is_analyzing: bool,
    continuous_active: bool,
    /// A timer tick owns the capture-and-analyze cycle, from frame grab to
    /// provider response.
    tick_in_flight: bool,
    preview_image_data_url: Option<String>,
    last_analysis_result: Option<AnalysisResult>,
    analysis_error: Option<String>,
    available_desktop_sources: Vec<DesktopSource>,
    is_loading_desktop_sources: bool,
    overlap_policy: OverlapPolicy,
}

struct Shared {
    settings: Arc<SettingsStore>,
    acquirer: Arc<dyn StreamAcquirer>,
    host: HostEnvironment,
    providers: Arc<dyn ProviderRegistry>,
    stream: TokioMutex<Option<Box<dyn MediaStream>>>,
    state: Mutex<SessionState>,
    timer: Mutex<Option<JoinHandle<()>>>,
    snapshots: watch::Sender<SessionSnapshot>,
}

/// Handle to one capture session. Clones share the session.
#[derive(Clone)]
pub struct CaptureCoordinator {
    shared: Arc<Shared>,
}

/// Keeps `is_analyzing` honest: cleared on every exit, including a dropped
/// future.
struct AnalyzingGuard<'a> {
    coordinator: &'a CaptureCoordinator,
}

impl Drop for AnalyzingGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.update(|s| s.is_analyzing = false);
    }
}

/// Releases the tick slot when a tick-driven cycle ends, however it ends.
struct TickGuard {
    coordinator: CaptureCoordinator,
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        lock(&self.coordinator.shared.state).tick_in_flight = false;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// User-facing text for a failed `start_capture`.
fn start_error_message(source: CaptureSource, error: &CaptureError) -> String {
    match (source, error) {
        (CaptureSource::Camera, CaptureError::NotFound(_)) => "No camera found".into(),
        (CaptureSource::Camera, CaptureError::PermissionDenied(_)) => {
            "Camera access was denied".into()
        }
        (CaptureSource::Camera, CaptureError::Unsupported(_)) => {
            "Camera is not supported in this environment".into()
        }
        (CaptureSource::Camera, e) => format!("Failed to start camera: {e}"),
        (_, CaptureError::PermissionDenied(_)) => "Screen capture was denied".into(),
        (_, CaptureError::Unsupported(_)) => {
            "Screen capture is not supported in this environment".into()
        }
        (_, e) => format!("Failed to start screen capture: {e}"),
    }
}

impl CaptureCoordinator {
    pub fn new(
        settings: Arc<SettingsStore>,
        acquirer: Arc<dyn StreamAcquirer>,
        host: HostEnvironment,
        providers: Arc<dyn ProviderRegistry>,
    ) -> Self {
        let initial = SessionSnapshot::default();
        let (snapshots, _) = watch::channel(initial);
        let coordinator = Self {
            shared: Arc::new(Shared {
                settings,
                acquirer,
                host,
                providers,
                stream: TokioMutex::new(None),
                state: Mutex::new(SessionState::default()),
                timer: Mutex::new(None),
                snapshots,
            }),
        };
        coordinator.publish();
        log::info!(
            "Capture coordinator ready (host={:?})",
            coordinator.shared.host
        );
        coordinator
    }

    /// Settings and providers from the user's config directory, with the
    /// capture backends compiled into this build.
    pub fn from_system_config() -> Result<Self, SettingsError> {
        let settings = Arc::new(SettingsStore::open_default()?);
        let providers = ProvidersConfig::load_or_default(&config_path("providers.toml")?)?;
        Ok(Self::new(
            settings,
            Arc::new(SystemAcquirer::new()),
            crate::capture::default_host(),
            Arc::new(StaticRegistry::from_config(&providers)),
        ))
    }

    // ── State plumbing ──────────────────────────────────────────────────

    fn update<F: FnOnce(&mut SessionState)>(&self, f: F) {
        {
            let mut state = lock(&self.shared.state);
            f(&mut state);
        }
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.shared.snapshots.send_replace(snapshot);
    }

    fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("Vision: {}", message);
        self.update(|s| s.analysis_error = Some(message));
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let settings = self.shared.settings.get();
        let state = lock(&self.shared.state);
        SessionSnapshot {
            capture_source: settings.capture_source,
            analysis_mode: settings.analysis_mode,
            is_capturing: state.is_capturing,
            is_analyzing: state.is_analyzing,
            is_continuous_active: state.continuous_active,
            preview_image_data_url: state.preview_image_data_url.clone(),
            last_analysis_result: state.last_analysis_result.clone(),
            analysis_error: state.analysis_error.clone(),
            selected_desktop_source_id: settings.selected_desktop_source().map(str::to_string),
            available_desktop_sources: state.available_desktop_sources.clone(),
            is_loading_desktop_sources: state.is_loading_desktop_sources,
        }
    }

    /// Receive a fresh snapshot after every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshots.subscribe()
    }

    pub fn is_capturing(&self) -> bool {
        lock(&self.shared.state).is_capturing
    }

    pub fn is_analyzing(&self) -> bool {
        lock(&self.shared.state).is_analyzing
    }

    pub fn is_continuous_active(&self) -> bool {
        lock(&self.shared.state).continuous_active
    }

    pub fn preview_image(&self) -> Option<String> {
        lock(&self.shared.state).preview_image_data_url.clone()
    }

    pub fn last_analysis_result(&self) -> Option<AnalysisResult> {
        lock(&self.shared.state).last_analysis_result.clone()
    }

    pub fn analysis_error(&self) -> Option<String> {
        lock(&self.shared.state).analysis_error.clone()
    }

    pub fn available_desktop_sources(&self) -> Vec<DesktopSource> {
        lock(&self.shared.state).available_desktop_sources.clone()
    }

    pub fn host(&self) -> &HostEnvironment {
        &self.shared.host
    }

    pub fn overlap_policy(&self) -> OverlapPolicy {
        lock(&self.shared.state).overlap_policy
    }

    /// Takes effect the next time continuous capture starts.
    pub fn set_overlap_policy(&self, policy: OverlapPolicy) {
        self.update(|s| s.overlap_policy = policy);
    }

    // ── Settings ────────────────────────────────────────────────────────

    pub fn settings(&self) -> VisionSettings {
        self.shared.settings.get()
    }

    pub fn update_settings(&self, patch: SettingsPatch) -> Result<VisionSettings, SettingsError> {
        let previous_interval = self.shared.settings.get().capture_interval;
        let updated = self.shared.settings.update(patch)?;
        if updated.analysis_mode != AnalysisMode::Continuous {
            self.stop_timer();
        } else if updated.capture_interval != previous_interval && self.is_continuous_active() {
            log::info!(
                "Capture interval changed {}ms -> {}ms, restarting timer",
                previous_interval,
                updated.capture_interval
            );
            self.start_continuous_capture();
        }
        self.publish();
        Ok(updated)
    }

    pub fn set_capture_source(&self, source: CaptureSource) -> Result<VisionSettings, SettingsError> {
        self.update_settings(SettingsPatch {
            capture_source: Some(source),
            ..Default::default()
        })
    }

    pub fn set_analysis_mode(&self, mode: AnalysisMode) -> Result<VisionSettings, SettingsError> {
        self.update_settings(SettingsPatch {
            analysis_mode: Some(mode),
            ..Default::default()
        })
    }

    /// Pick a desktop source by id; an empty id clears the selection.
    pub fn select_desktop_source(&self, id: &str) -> Result<VisionSettings, SettingsError> {
        self.update_settings(SettingsPatch {
            desktop_source_id: Some(id.to_string()),
            ..Default::default()
        })
    }

    // ── Capture ─────────────────────────────────────────────────────────

    /// Open a stream for the configured source, replacing any existing one.
    pub async fn start_capture(&self) -> bool {
        self.update(|s| s.analysis_error = None);
        let resume_continuous = self.is_continuous_active();
        self.stop_capture().await;

        let settings = self.shared.settings.get();
        let source = settings.capture_source;
        let (max_width, max_height) = (settings.max_width, settings.max_height);

        let request = match (source, self.shared.host.is_desktop_shell()) {
            (CaptureSource::Camera, _) => StreamRequest::Camera {
                max_width,
                max_height,
            },
            (_, true) => match self.resolve_desktop_source(source, &settings).await {
                Ok(id) => StreamRequest::DesktopSource {
                    id,
                    max_width,
                    max_height,
                },
                Err(message) => {
                    self.fail(message);
                    return false;
                }
            },
            (_, false) => StreamRequest::Display {
                source,
                max_width,
                max_height,
            },
        };

        log::info!("Starting {} capture: {:?}", source.as_str(), request);
        let stream = match self.shared.acquirer.acquire(&request).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Capture start failed: {}", e);
                if let (StreamRequest::DesktopSource { .. }, CaptureError::NotFound(_)) = (&request, &e) {
                    self.forget_desktop_source();
                }
                self.fail(start_error_message(source, &e));
                return false;
            }
        };

        {
            let mut guard = self.shared.stream.lock().await;
            if let Some(mut previous) = guard.take() {
                // Another start won the race; only the newest stream survives.
                previous.stop();
            }
            log::info!("Capture started on {}", stream.label());
            *guard = Some(stream);
        }
        self.update(|s| s.is_capturing = true);

        if resume_continuous {
            self.start_continuous_capture();
        }
        true
    }

    /// The persisted selection, or the first directory entry of the wanted
    /// kind (falling back to any kind), which then becomes the selection.
    async fn resolve_desktop_source(
        &self,
        source: CaptureSource,
        settings: &VisionSettings,
    ) -> Result<String, String> {
        if let Some(id) = settings.selected_desktop_source() {
            return Ok(id.to_string());
        }

        self.fetch_desktop_sources().await;
        let sources = self.available_desktop_sources();
        let wanted = DesktopSourceKind::from_source(source);
        let chosen = sources
            .iter()
            .find(|s| Some(s.kind) == wanted)
            .or_else(|| sources.first())
            .ok_or_else(|| NO_SOURCES_ERROR.to_string())?;

        log::info!("Auto-selected desktop source {} ({})", chosen.id, chosen.name);
        if let Err(e) = self.select_desktop_source(&chosen.id) {
            log::warn!("Could not persist desktop source selection: {}", e);
        }
        Ok(chosen.id.clone())
    }

    fn forget_desktop_source(&self) {
        log::info!("Selected desktop source is gone, clearing selection");
        if let Err(e) = self.select_desktop_source("") {
            log::warn!("Could not clear desktop source selection: {}", e);
        }
    }

    /// Stop every track, release the stream, clear the preview. Idempotent.
    pub async fn stop_capture(&self) {
        self.stop_timer();
        let previous = self.shared.stream.lock().await.take();
        if let Some(mut stream) = previous {
            stream.stop();
            log::info!("Capture stopped ({})", stream.label());
        }
        self.update(|s| {
            s.is_capturing = false;
            s.preview_image_data_url = None;
        });
    }

    /// Sample one frame from the live stream as a JPEG data URL.
    pub async fn capture_frame(&self, options: Option<CaptureOptions>) -> Option<String> {
        self.update(|s| s.analysis_error = None);
        let settings = self.shared.settings.get();
        let params = SampleParams {
            max_width: settings.max_width,
            max_height: settings.max_height,
            quality: settings.quality,
        }
        .with_overrides(&options.unwrap_or_default());

        let grabbed = {
            let mut guard = self.shared.stream.lock().await;
            match guard.as_mut() {
                Some(stream) => Some(stream.grab_frame().await),
                None => None,
            }
        };
        let Some(grabbed) = grabbed else {
            self.fail(NO_STREAM_ERROR);
            return None;
        };

        let encoded = match grabbed {
            Ok(image) => tokio::task::spawn_blocking(move || sample_frame(image, params))
                .await
                .unwrap_or_else(|e| Err(CaptureError::Failed(format!("encode task failed: {e}")))),
            Err(e) => Err(e),
        };

        match encoded {
            Ok(frame) => {
                log::debug!("Captured frame {}x{}", frame.width, frame.height);
                let data_url = frame.data_url;
                let preview = data_url.clone();
                // A stop that landed while encoding keeps the preview cleared.
                self.update(|s| {
                    if s.is_capturing {
                        s.preview_image_data_url = Some(preview);
                    }
                });
                Some(data_url)
            }
            Err(e) => {
                self.fail(format!("Failed to capture frame: {e}"));
                None
            }
        }
    }

    // ── Analysis ────────────────────────────────────────────────────────

    /// Describe an image with the configured provider and model.
    pub async fn analyze_image(
        &self,
        image_data_url: &str,
        prompt: Option<&str>,
    ) -> Option<AnalysisResult> {
        self.update(|s| s.analysis_error = None);
        let settings = self.shared.settings.get();

        let Some(provider_id) = settings.active_provider() else {
            self.fail(NO_PROVIDER_ERROR);
            return None;
        };
        let Some(model) = settings.effective_model() else {
            self.fail(NO_MODEL_ERROR);
            return None;
        };
        let Some(provider) = self.shared.providers.resolve(provider_id) else {
            self.fail(format!("Vision provider '{provider_id}' is not available"));
            return None;
        };
        if image_data_url.is_empty() {
            self.fail("No image to analyze");
            return None;
        }
        // Remote URLs pass through; inline images must at least decode.
        if image_data_url.starts_with("data:") && parse_data_url(image_data_url).is_none() {
            self.fail("Image is not a valid base64 data URL");
            return None;
        }

        if !is_vision_model(model) {
            log::warn!("Model '{}' does not look image-capable; sending anyway", model);
        }

        self.update(|s| s.is_analyzing = true);
        let _analyzing = AnalyzingGuard { coordinator: self };

        let system_prompt = prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let messages = [
            ChatMessage::system(system_prompt),
            ChatMessage::user_with_image(USER_PROMPT, image_data_url),
        ];

        log::info!("Analyzing frame with {} ({})", provider.name(), model);
        match provider.generate_text(model, &messages).await {
            Ok(text) => {
                if text.is_empty() {
                    log::warn!("{} returned an empty description", provider.name());
                }
                let result = AnalysisResult {
                    timestamp: now_ms(),
                    description: text,
                };
                let stored = result.clone();
                self.update(|s| s.last_analysis_result = Some(stored));
                Some(result)
            }
            Err(e) => {
                log::error!("Vision analysis failed: {}", e);
                self.fail(format!("Analysis failed: {e}"));
                None
            }
        }
    }

    /// `capture_frame` then `analyze_image`.
    pub async fn capture_and_analyze(&self, prompt: Option<&str>) -> Option<AnalysisResult> {
        let image = self.capture_frame(None).await?;
        self.analyze_image(&image, prompt).await
    }

    // ── Continuous capture ──────────────────────────────────────────────

    /// Start polling every `capture_interval` ms. No-op outside continuous
    /// mode or without a live stream. Replaces any running timer.
    pub fn start_continuous_capture(&self) {
        let settings = self.shared.settings.get();
        if settings.analysis_mode != AnalysisMode::Continuous {
            log::debug!("Continuous capture ignored: mode is on-demand");
            return;
        }
        if !self.is_capturing() {
            log::debug!("Continuous capture ignored: no active capture stream");
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.fail("Continuous capture needs a running async runtime");
            return;
        };

        self.stop_timer();
        let period = Duration::from_millis(settings.capture_interval);
        let policy = self.overlap_policy();
        let weak = Arc::downgrade(&self.shared);
        let handle = runtime.spawn(run_timer(weak, period, policy));

        *lock(&self.shared.timer) = Some(handle);
        self.update(|s| s.continuous_active = true);
        log::info!(
            "Continuous capture started (every {}ms, {:?} on overlap)",
            settings.capture_interval,
            policy
        );
    }

    pub fn stop_continuous_capture(&self) {
        if self.shared.settings.get().analysis_mode != AnalysisMode::Continuous {
            return;
        }
        self.stop_timer();
    }

    fn stop_timer(&self) {
        let handle = lock(&self.shared.timer).take();
        if let Some(handle) = handle {
            handle.abort();
            log::info!("Continuous capture stopped");
        }
        let was_active = {
            let mut state = lock(&self.shared.state);
            std::mem::replace(&mut state.continuous_active, false)
        };
        if was_active {
            self.publish();
        }
    }

    /// Claim the tick slot. Fails while not capturing, while an analysis is
    /// outstanding, or while an earlier tick is still grabbing or analyzing.
    fn begin_tick(&self) -> Option<TickGuard> {
        let mut state = lock(&self.shared.state);
        if !state.is_capturing || state.is_analyzing || state.tick_in_flight {
            return None;
        }
        state.tick_in_flight = true;
        Some(TickGuard {
            coordinator: self.clone(),
        })
    }

    // ── Desktop sources ─────────────────────────────────────────────────

    /// Refresh the desktop-source list. Failures clear the list and are only
    /// logged.
    pub async fn fetch_desktop_sources(&self) {
        let Some(directory) = self.shared.host.directory().cloned() else {
            log::debug!("No desktop-source directory in this host");
            return;
        };

        self.update(|s| s.is_loading_desktop_sources = true);
        let result = directory.get_desktop_sources(&SourcesRequest::default()).await;
        self.update(|s| {
            s.is_loading_desktop_sources = false;
            match result {
                Ok(raw) => {
                    s.available_desktop_sources = raw.into_iter().map(DesktopSource::from).collect();
                    log::debug!("Fetched {} desktop sources", s.available_desktop_sources.len());
                }
                Err(e) => {
                    log::error!("Failed to fetch desktop sources: {}", e);
                    s.available_desktop_sources.clear();
                }
            }
        });
    }

    // ── Reset ───────────────────────────────────────────────────────────

    /// Stop everything, restore default settings, clear results.
    pub async fn reset_state(&self) {
        self.stop_continuous_capture();
        self.stop_capture().await;
        if let Err(e) = self.shared.settings.reset_all() {
            log::error!("Failed to persist default vision settings: {}", e);
        }
        self.update(|s| {
            s.last_analysis_result = None;
            s.analysis_error = None;
            s.preview_image_data_url = None;
        });
        log::info!("Vision state reset");
    }
}

async fn run_timer(weak: Weak<Shared>, period: Duration, policy: OverlapPolicy) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(match policy {
        OverlapPolicy::Drop => MissedTickBehavior::Skip,
        OverlapPolicy::Wait => MissedTickBehavior::Delay,
    });

    loop {
        ticker.tick().await;
        let Some(shared) = weak.upgrade() else {
            break;
        };
        let coordinator = CaptureCoordinator { shared };
        let Some(tick) = coordinator.begin_tick() else {
            log::debug!("Continuous tick dropped (not capturing or still busy)");
            continue;
        };

        match policy {
            OverlapPolicy::Drop => {
                tokio::spawn(async move {
                    let _tick = tick;
                    coordinator.capture_and_analyze(None).await;
                });
            }
            OverlapPolicy::Wait => {
                coordinator.capture_and_analyze(None).await;
                drop(tick);
            }
        }
    }
}
