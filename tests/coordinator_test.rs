//! Integration tests for CaptureCoordinator using mock acquirers, directories
//! and providers. Fully deterministic apart from the continuous-capture tests,
//! which use short real intervals. No screen, camera or network access.
//!
//! Run: cargo test --test coordinator_test

use async_trait::async_trait;
use glimpse_lib::ai::registry::StaticRegistry;
use glimpse_lib::ai::{AiError, ChatMessage, ContentPart, Role, VisionProvider};
use glimpse_lib::capture::frame::{parse_data_url, CaptureOptions};
use glimpse_lib::capture::{
    CaptureError, DesktopSourceDirectory, DesktopSourceKind, HostEnvironment, MediaStream,
    RawDesktopSource, SourcesRequest, StreamAcquirer, StreamRequest,
};
use glimpse_lib::coordinator::{NO_MODEL_ERROR, NO_PROVIDER_ERROR, NO_SOURCES_ERROR, NO_STREAM_ERROR};
use glimpse_lib::settings::SettingsPatch;
use glimpse_lib::{
    AnalysisMode, CaptureCoordinator, CaptureSource, OverlapPolicy, SettingsStore, VisionSettings,
};
use image::{GenericImageView, RgbaImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Mock implementations
// ---------------------------------------------------------------------------

struct MockStream {
    live: Arc<AtomicUsize>,
    grabs: Arc<AtomicUsize>,
    size: (u32, u32),
    grab_delay: Duration,
    stopped: bool,
}

#[async_trait]
impl MediaStream for MockStream {
    fn label(&self) -> &str {
        "mock"
    }

    async fn grab_frame(&mut self) -> Result<RgbaImage, CaptureError> {
        if self.stopped {
            return Err(CaptureError::Failed("stopped".into()));
        }
        self.grabs.fetch_add(1, Ordering::SeqCst);
        if !self.grab_delay.is_zero() {
            tokio::time::sleep(self.grab_delay).await;
        }
        Ok(RgbaImage::new(self.size.0, self.size.1))
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone, Copy)]
enum AcquireOutcome {
    Frames(u32, u32),
    Denied,
    NotFound,
}

struct MockAcquirer {
    outcome: Mutex<AcquireOutcome>,
    requests: Mutex<Vec<StreamRequest>>,
    live: Arc<AtomicUsize>,
    grabs: Arc<AtomicUsize>,
    grab_delay: Duration,
}

impl MockAcquirer {
    fn new(outcome: AcquireOutcome) -> Arc<Self> {
        Self::with_grab_delay(outcome, Duration::ZERO)
    }

    /// Streams from this acquirer take `grab_delay` to produce each frame.
    fn with_grab_delay(outcome: AcquireOutcome, grab_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(outcome),
            requests: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            grabs: Arc::new(AtomicUsize::new(0)),
            grab_delay,
        })
    }

    fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn grabs(&self) -> usize {
        self.grabs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamAcquirer for MockAcquirer {
    async fn acquire(&self, request: &StreamRequest) -> Result<Box<dyn MediaStream>, CaptureError> {
        self.requests.lock().unwrap().push(request.clone());
        let outcome = *self.outcome.lock().unwrap();
        match outcome {
            AcquireOutcome::Frames(w, h) => {
                self.live.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(MockStream {
                    live: Arc::clone(&self.live),
                    grabs: Arc::clone(&self.grabs),
                    size: (w, h),
                    grab_delay: self.grab_delay,
                    stopped: false,
                }))
            }
            AcquireOutcome::Denied => Err(CaptureError::PermissionDenied("NotAllowedError".into())),
            AcquireOutcome::NotFound => Err(CaptureError::NotFound("no device".into())),
        }
    }
}

struct MockDirectory {
    response: Mutex<Result<Vec<RawDesktopSource>, String>>,
    calls: AtomicUsize,
    last_request: Mutex<Option<SourcesRequest>>,
}

impl MockDirectory {
    fn with_ids(ids: &[&str]) -> Arc<Self> {
        let sources = ids
            .iter()
            .map(|id| RawDesktopSource {
                id: id.to_string(),
                name: format!("Source {id}"),
                thumbnail: "data:image/jpeg;base64,AAAA".into(),
                display_id: String::new(),
                app_icon: None,
            })
            .collect();
        Arc::new(Self {
            response: Mutex::new(Ok(sources)),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    fn fail_next(&self) {
        *self.response.lock().unwrap() = Err("ipc channel closed".into());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DesktopSourceDirectory for MockDirectory {
    async fn get_desktop_sources(
        &self,
        request: &SourcesRequest,
    ) -> Result<Vec<RawDesktopSource>, CaptureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        self.response
            .lock()
            .unwrap()
            .clone()
            .map_err(CaptureError::Failed)
    }
}

struct MockProvider {
    reply: Result<String, String>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen: Mutex<Vec<(String, Vec<ChatMessage>)>>,
}

impl MockProvider {
    fn replying(text: &str) -> Arc<Self> {
        Self::build(Ok(text.to_string()), Duration::ZERO)
    }

    fn failing(message: &str) -> Arc<Self> {
        Self::build(Err(message.to_string()), Duration::ZERO)
    }

    fn slow(text: &str, delay: Duration) -> Arc<Self> {
        Self::build(Ok(text.to_string()), delay)
    }

    fn build(reply: Result<String, String>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply,
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionProvider for MockProvider {
    async fn generate_text(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.reply.clone().map_err(AiError::ConnectionError)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn configured(source: CaptureSource) -> VisionSettings {
    VisionSettings {
        active_provider: "mock".into(),
        active_model: "gpt-4o".into(),
        capture_source: source,
        ..Default::default()
    }
}

fn coordinator(
    settings: VisionSettings,
    acquirer: Arc<MockAcquirer>,
    host: HostEnvironment,
    provider: Arc<MockProvider>,
) -> CaptureCoordinator {
    let mut registry = StaticRegistry::new();
    registry.insert("mock", provider);
    CaptureCoordinator::new(
        Arc::new(SettingsStore::in_memory(settings)),
        acquirer,
        host,
        Arc::new(registry),
    )
}

fn browser(settings: VisionSettings, acquirer: Arc<MockAcquirer>, provider: Arc<MockProvider>) -> CaptureCoordinator {
    coordinator(settings, acquirer, HostEnvironment::Browser, provider)
}

// ---------------------------------------------------------------------------
// Capture lifecycle
// ---------------------------------------------------------------------------

/// Two consecutive starts leave exactly one live stream, the second one.
#[tokio::test]
async fn start_twice_keeps_a_single_stream() {
    for source in [CaptureSource::Screen, CaptureSource::Window, CaptureSource::Camera] {
        let acquirer = MockAcquirer::new(AcquireOutcome::Frames(640, 480));
        let c = browser(configured(source), Arc::clone(&acquirer), MockProvider::replying("ok"));

        assert!(c.start_capture().await);
        assert!(c.start_capture().await);

        assert_eq!(acquirer.requests().len(), 2);
        assert_eq!(acquirer.live(), 1, "{source:?} left two streams open");
        assert!(c.is_capturing());
    }
}

#[tokio::test]
async fn browser_screen_uses_display_request() {
    let acquirer = MockAcquirer::new(AcquireOutcome::Frames(640, 480));
    let c = browser(configured(CaptureSource::Window), Arc::clone(&acquirer), MockProvider::replying("ok"));

    assert!(c.start_capture().await);
    assert_eq!(
        acquirer.requests(),
        vec![StreamRequest::Display {
            source: CaptureSource::Window,
            max_width: 1280,
            max_height: 720,
        }]
    );
}

/// After stop, frame capture fails with the no-stream error instead of panicking.
#[tokio::test]
async fn capture_frame_after_stop_reports_no_stream() {
    let acquirer = MockAcquirer::new(AcquireOutcome::Frames(640, 480));
    let c = browser(configured(CaptureSource::Screen), Arc::clone(&acquirer), MockProvider::replying("ok"));

    assert!(c.start_capture().await);
    assert!(c.capture_frame(None).await.is_some());
    c.stop_capture().await;

    assert_eq!(acquirer.live(), 0);
    assert!(!c.is_capturing());
    assert!(c.preview_image().is_none());
    assert!(c.capture_frame(None).await.is_none());
    assert_eq!(c.analysis_error().as_deref(), Some(NO_STREAM_ERROR));
}

#[tokio::test]
async fn stop_capture_is_idempotent() {
    let acquirer = MockAcquirer::new(AcquireOutcome::Frames(640, 480));
    let c = browser(configured(CaptureSource::Screen), acquirer, MockProvider::replying("ok"));

    c.stop_capture().await;
    c.stop_capture().await;
    assert!(!c.is_capturing());
    assert!(c.analysis_error().is_none());
}

/// Frames are shrunk into the bounding box with the aspect ratio preserved.
#[tokio::test]
async fn captured_frames_fit_the_configured_bounds() {
    let acquirer = MockAcquirer::new(AcquireOutcome::Frames(3000, 1000));
    let c = browser(configured(CaptureSource::Screen), acquirer, MockProvider::replying("ok"));
    assert!(c.start_capture().await);

    let url = c.capture_frame(None).await.expect("frame");
    let (_, bytes) = parse_data_url(&url).expect("data url");
    let (w, h) = image::load_from_memory(&bytes).unwrap().dimensions();
    assert!(w <= 1280 && h <= 720);
    assert_eq!((w, h), (1280, 427));
    assert_eq!(c.preview_image().as_deref(), Some(url.as_str()));

    let url = c
        .capture_frame(Some(CaptureOptions {
            max_width: Some(300),
            max_height: Some(300),
            quality: Some(0.5),
        }))
        .await
        .expect("frame");
    let (_, bytes) = parse_data_url(&url).unwrap();
    assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (300, 100));
}

#[tokio::test]
async fn small_frames_are_never_upscaled() {
    let acquirer = MockAcquirer::new(AcquireOutcome::Frames(320, 200));
    let c = browser(configured(CaptureSource::Camera), acquirer, MockProvider::replying("ok"));
    assert!(c.start_capture().await);

    let url = c.capture_frame(None).await.unwrap();
    let (_, bytes) = parse_data_url(&url).unwrap();
    assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (320, 200));
}

// ---------------------------------------------------------------------------
// Start failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn camera_permission_denied() {
    let acquirer = MockAcquirer::new(AcquireOutcome::Denied);
    let c = browser(configured(CaptureSource::Camera), acquirer, MockProvider::replying("ok"));

    assert!(!c.start_capture().await);
    assert!(!c.is_capturing());
    let error = c.analysis_error().unwrap();
    assert!(error.contains("denied"), "{error}");
    assert!(error.contains("Camera"), "{error}");
}

#[tokio::test]
async fn camera_not_found() {
    let acquirer = MockAcquirer::new(AcquireOutcome::NotFound);
    let c = browser(configured(CaptureSource::Camera), acquirer, MockProvider::replying("ok"));

    assert!(!c.start_capture().await);
    assert_eq!(c.analysis_error().as_deref(), Some("No camera found"));
}

#[tokio::test]
async fn screen_denial_has_its_own_message() {
    let acquirer = MockAcquirer::new(AcquireOutcome::Denied);
    let c = browser(configured(CaptureSource::Screen), acquirer, MockProvider::replying("ok"));

    assert!(!c.start_capture().await);
    assert_eq!(c.analysis_error().as_deref(), Some("Screen capture was denied"));
}

/// A new start clears the error left by a previous failure.
#[tokio::test]
async fn successful_start_clears_previous_error() {
    let acquirer = MockAcquirer::new(AcquireOutcome::Denied);
    let c = browser(configured(CaptureSource::Screen), Arc::clone(&acquirer), MockProvider::replying("ok"));
    assert!(!c.start_capture().await);
    assert!(c.analysis_error().is_some());

    *acquirer.outcome.lock().unwrap() = AcquireOutcome::Frames(100, 100);
    assert!(c.start_capture().await);
    assert!(c.analysis_error().is_none());
}

// ---------------------------------------------------------------------------
// Desktop shell
// ---------------------------------------------------------------------------

#[tokio::test]
async fn desktop_shell_with_no_sources_fails() {
    let acquirer = MockAcquirer::new(AcquireOutcome::Frames(640, 480));
    let directory = MockDirectory::with_ids(&[]);
    let c = coordinator(
        configured(CaptureSource::Screen),
        Arc::clone(&acquirer),
        HostEnvironment::DesktopShell(directory.clone()),
        MockProvider::replying("ok"),
    );

    assert!(!c.start_capture().await);
    assert_eq!(c.analysis_error().as_deref(), Some(NO_SOURCES_ERROR));
    assert_eq!(directory.calls(), 1);
    assert!(acquirer.requests().is_empty());
    assert!(!c.is_capturing());
}

#[tokio::test]
async fn desktop_shell_auto_selects_first_source_of_requested_type() {
    let acquirer = MockAcquirer::new(AcquireOutcome::Frames(640, 480));
    let directory = MockDirectory::with_ids(&["window:11:0", "screen:1:0", "screen:2:0"]);
    let c = coordinator(
        configured(CaptureSource::Screen),
        Arc::clone(&acquirer),
        HostEnvironment::DesktopShell(directory.clone()),
        MockProvider::replying("ok"),
    );

    assert!(c.start_capture().await);
    assert_eq!(
        acquirer.requests(),
        vec![StreamRequest::DesktopSource {
            id: "screen:1:0".into(),
            max_width: 1280,
            max_height: 720,
        }]
    );
    assert_eq!(c.settings().desktop_source_id, "screen:1:0");

    let request = directory.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(request, SourcesRequest::default());

    // The persisted selection is reused without another directory fetch.
    assert!(c.start_capture().await);
    assert_eq!(directory.calls(), 1);
}

#[tokio::test]
async fn desktop_shell_falls_back_to_any_source_type() {
    let acquirer = MockAcquirer::new(AcquireOutcome::Frames(640, 480));
    let directory = MockDirectory::with_ids(&["screen:1:0"]);
    let c = coordinator(
        configured(CaptureSource::Window),
        Arc::clone(&acquirer),
        HostEnvironment::DesktopShell(directory),
        MockProvider::replying("ok"),
    );

    assert!(c.start_capture().await);
    assert_eq!(c.settings().desktop_source_id, "screen:1:0");
}

#[tokio::test]
async fn stale_desktop_selection_is_cleared() {
    let acquirer = MockAcquirer::new(AcquireOutcome::NotFound);
    let directory = MockDirectory::with_ids(&["screen:1:0"]);
    let settings = VisionSettings {
        desktop_source_id: "window:99:0".into(),
        ..configured(CaptureSource::Window)
    };
    let c = coordinator(
        settings,
        acquirer,
        HostEnvironment::DesktopShell(directory),
        MockProvider::replying("ok"),
    );

    assert!(!c.start_capture().await);
    assert!(c
        .analysis_error()
        .unwrap()
        .starts_with("Failed to start screen capture"));
    assert!(c.settings().desktop_source_id.is_empty());
}

#[tokio::test]
async fn fetch_classifies_sources_and_failure_clears_silently() {
    let directory = MockDirectory::with_ids(&["screen:0:0", "window:5:0"]);
    let c = coordinator(
        configured(CaptureSource::Screen),
        MockAcquirer::new(AcquireOutcome::Frames(1, 1)),
        HostEnvironment::DesktopShell(directory.clone()),
        MockProvider::replying("ok"),
    );

    c.fetch_desktop_sources().await;
    let kinds: Vec<DesktopSourceKind> = c.available_desktop_sources().iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![DesktopSourceKind::Screen, DesktopSourceKind::Window]);
    assert!(!c.snapshot().is_loading_desktop_sources);

    directory.fail_next();
    c.fetch_desktop_sources().await;
    assert!(c.available_desktop_sources().is_empty());
    assert!(c.analysis_error().is_none());
    assert!(!c.snapshot().is_loading_desktop_sources);
}

#[tokio::test]
async fn fetch_is_a_no_op_in_the_browser() {
    let c = browser(
        configured(CaptureSource::Screen),
        MockAcquirer::new(AcquireOutcome::Frames(1, 1)),
        MockProvider::replying("ok"),
    );
    c.fetch_desktop_sources().await;
    assert!(c.available_desktop_sources().is_empty());
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Frame capture happens first; the provider check then fails.
#[tokio::test]
async fn capture_and_analyze_without_provider_still_takes_a_frame() {
    let acquirer = MockAcquirer::new(AcquireOutcome::Frames(640, 480));
    let provider = MockProvider::replying("ok");
    let settings = VisionSettings {
        active_provider: String::new(),
        ..configured(CaptureSource::Screen)
    };
    let c = browser(settings, Arc::clone(&acquirer), provider.clone());

    assert!(c.start_capture().await);
    assert!(c.capture_and_analyze(None).await.is_none());
    assert_eq!(c.analysis_error().as_deref(), Some(NO_PROVIDER_ERROR));
    assert_eq!(acquirer.grabs(), 1);
    assert!(c.preview_image().is_some());
    assert_eq!(provider.calls(), 0);
    assert!(!c.is_analyzing());
}

#[tokio::test]
async fn missing_model_is_a_configuration_error() {
    let settings = VisionSettings {
        active_model: String::new(),
        ..configured(CaptureSource::Screen)
    };
    let provider = MockProvider::replying("ok");
    let c = browser(settings, MockAcquirer::new(AcquireOutcome::Frames(1, 1)), provider.clone());

    assert!(c.analyze_image("data:image/jpeg;base64,AAAA", None).await.is_none());
    assert_eq!(c.analysis_error().as_deref(), Some(NO_MODEL_ERROR));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn unknown_provider_id_is_reported() {
    let settings = VisionSettings {
        active_provider: "anthropic".into(),
        ..configured(CaptureSource::Screen)
    };
    let c = browser(settings, MockAcquirer::new(AcquireOutcome::Frames(1, 1)), MockProvider::replying("ok"));

    assert!(c.analyze_image("data:image/jpeg;base64,AAAA", None).await.is_none());
    assert!(c.analysis_error().unwrap().contains("anthropic"));
}

#[tokio::test]
async fn malformed_data_url_is_rejected_before_the_request() {
    let provider = MockProvider::replying("ok");
    let c = browser(configured(CaptureSource::Screen), MockAcquirer::new(AcquireOutcome::Frames(1, 1)), provider.clone());

    assert!(c.analyze_image("data:image/jpeg,not-base64", None).await.is_none());
    assert!(c.analyze_image("", None).await.is_none());
    assert!(c.analysis_error().is_some());
    assert_eq!(provider.calls(), 0);
    assert!(!c.is_analyzing());
}

#[tokio::test]
async fn analysis_sends_system_prompt_and_image() {
    let provider = MockProvider::replying("A terminal.");
    let settings = VisionSettings {
        custom_model_name: "llava:13b".into(),
        ..configured(CaptureSource::Screen)
    };
    let c = browser(settings, MockAcquirer::new(AcquireOutcome::Frames(1, 1)), provider.clone());

    let result = c
        .analyze_image("data:image/jpeg;base64,AAAA", Some("Read the error message."))
        .await
        .unwrap();
    assert_eq!(result.description, "A terminal.");
    assert!(result.timestamp > 0);

    let seen = provider.seen.lock().unwrap();
    let (model, messages) = &seen[0];
    assert_eq!(model, "llava:13b");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(messages[0].text(), "Read the error message.");
    assert_eq!(messages[1].role, Role::User);
    assert!(messages[1]
        .content
        .contains(&ContentPart::ImageUrl("data:image/jpeg;base64,AAAA".into())));
}

#[tokio::test]
async fn provider_failure_records_error_and_resets_flag() {
    let c = browser(
        configured(CaptureSource::Screen),
        MockAcquirer::new(AcquireOutcome::Frames(1, 1)),
        MockProvider::failing("HTTP 500"),
    );

    assert!(c.analyze_image("data:image/jpeg;base64,AAAA", None).await.is_none());
    assert!(!c.is_analyzing());
    let error = c.analysis_error().unwrap();
    assert!(error.starts_with("Analysis failed"), "{error}");
    assert!(error.contains("HTTP 500"), "{error}");
    assert!(c.last_analysis_result().is_none());
}

#[tokio::test]
async fn empty_description_is_still_a_result() {
    let c = browser(
        configured(CaptureSource::Screen),
        MockAcquirer::new(AcquireOutcome::Frames(1, 1)),
        MockProvider::replying(""),
    );
    let result = c.analyze_image("data:image/jpeg;base64,AAAA", None).await.unwrap();
    assert_eq!(result.description, "");
    assert!(c.analysis_error().is_none());
}

/// Stop keeps the last result but clears the preview.
#[tokio::test]
async fn stop_keeps_result_and_clears_preview() {
    let c = browser(
        configured(CaptureSource::Screen),
        MockAcquirer::new(AcquireOutcome::Frames(800, 600)),
        MockProvider::replying("A code editor is open."),
    );

    assert!(c.start_capture().await);
    let result = c.capture_and_analyze(None).await.unwrap();
    assert_eq!(result.description, "A code editor is open.");
    assert!(c.preview_image().is_some());

    c.stop_capture().await;
    assert!(c.preview_image().is_none());
    assert_eq!(
        c.last_analysis_result().map(|r| r.description).as_deref(),
        Some("A code editor is open.")
    );
}

#[tokio::test]
async fn reset_restores_defaults_and_clears_results() {
    let settings = VisionSettings {
        analysis_mode: AnalysisMode::Continuous,
        capture_interval: 30000,
        quality: 0.9,
        max_width: 640,
        desktop_source_id: "screen:1:0".into(),
        ..configured(CaptureSource::Camera)
    };
    let c = browser(
        settings,
        MockAcquirer::new(AcquireOutcome::Frames(800, 600)),
        MockProvider::replying("A code editor is open."),
    );

    assert!(c.start_capture().await);
    c.start_continuous_capture();
    assert!(c.capture_and_analyze(None).await.is_some());
    c.capture_frame(None).await;
    c.stop_capture().await;
    c.capture_frame(None).await; // leaves the no-stream error behind
    assert!(c.analysis_error().is_some());

    c.reset_state().await;
    assert_eq!(c.settings(), VisionSettings::default());
    assert!(c.last_analysis_result().is_none());
    assert!(c.analysis_error().is_none());
    assert!(c.preview_image().is_none());
    assert!(!c.is_capturing());
    assert!(!c.is_continuous_active());
}

// ---------------------------------------------------------------------------
// Continuous capture
// ---------------------------------------------------------------------------

fn continuous(interval_ms: u64) -> VisionSettings {
    VisionSettings {
        analysis_mode: AnalysisMode::Continuous,
        // In-memory settings skip interval validation, which keeps these fast.
        capture_interval: interval_ms,
        ..configured(CaptureSource::Screen)
    }
}

#[tokio::test]
async fn continuous_is_a_no_op_in_on_demand_mode() {
    let c = browser(
        configured(CaptureSource::Screen),
        MockAcquirer::new(AcquireOutcome::Frames(64, 36)),
        MockProvider::replying("ok"),
    );
    c.start_continuous_capture();
    assert!(!c.is_continuous_active());
}

/// Ticks that land during an in-flight analysis are dropped, not queued.
#[tokio::test]
async fn ticks_during_analysis_are_dropped() {
    let provider = MockProvider::slow("busy screen", Duration::from_millis(300));
    let c = browser(
        continuous(40),
        MockAcquirer::new(AcquireOutcome::Frames(64, 36)),
        provider.clone(),
    );
    assert!(c.start_capture().await);
    c.start_continuous_capture();
    assert!(c.is_continuous_active());

    // Analyses start near 40ms, 360ms and 680ms; stop well before the next.
    tokio::time::sleep(Duration::from_millis(900)).await;
    c.stop_continuous_capture();
    assert!(!c.is_continuous_active());

    // ~22 ticks fired; only ticks that found the session idle issued requests.
    let calls = provider.calls();
    assert!(calls >= 1, "expected at least one request");
    assert!(calls <= 4, "ticks were queued: {calls} requests");
    assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);

    let after_stop = provider.calls();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(provider.calls(), after_stop, "timer kept firing after stop");
}

/// A slow frame grab still counts as busy: ticks landing before the
/// analysis flag is set must not start a second cycle.
#[tokio::test]
async fn slow_frame_grabs_do_not_stack_ticks() {
    let provider = MockProvider::slow("busy screen", Duration::from_millis(400));
    let acquirer =
        MockAcquirer::with_grab_delay(AcquireOutcome::Frames(64, 36), Duration::from_millis(150));
    let c = browser(continuous(50), Arc::clone(&acquirer), provider.clone());
    assert!(c.start_capture().await);
    c.start_continuous_capture();

    // One cycle takes ~550ms: cycles start near 50ms and 650ms.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    c.stop_continuous_capture();

    assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(provider.calls() <= 3, "{} requests", provider.calls());
    assert!(acquirer.grabs() <= 3, "{} grabs", acquirer.grabs());
    assert!(provider.calls() >= 1);
}

#[tokio::test]
async fn changing_interval_restarts_a_running_timer() {
    let provider = MockProvider::replying("ok");
    let c = browser(
        continuous(60000),
        MockAcquirer::new(AcquireOutcome::Frames(64, 36)),
        provider.clone(),
    );
    assert!(c.start_capture().await);
    c.start_continuous_capture();

    c.update_settings(SettingsPatch {
        capture_interval: Some(2000),
        ..Default::default()
    })
    .unwrap();
    assert!(c.is_continuous_active());

    // The old 60s timer would not have fired yet.
    tokio::time::sleep(Duration::from_millis(2400)).await;
    c.stop_continuous_capture();
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn changing_interval_does_not_start_an_idle_timer() {
    let c = browser(
        continuous(60000),
        MockAcquirer::new(AcquireOutcome::Frames(64, 36)),
        MockProvider::replying("ok"),
    );
    assert!(c.start_capture().await);
    c.update_settings(SettingsPatch {
        capture_interval: Some(2000),
        ..Default::default()
    })
    .unwrap();
    assert!(!c.is_continuous_active());
}

#[tokio::test]
async fn wait_policy_serializes_ticks() {
    let provider = MockProvider::slow("busy screen", Duration::from_millis(200));
    let c = browser(
        continuous(40),
        MockAcquirer::new(AcquireOutcome::Frames(64, 36)),
        provider.clone(),
    );
    c.set_overlap_policy(OverlapPolicy::Wait);
    assert!(c.start_capture().await);
    c.start_continuous_capture();

    tokio::time::sleep(Duration::from_millis(700)).await;
    c.stop_capture().await;

    assert!(provider.calls() >= 1);
    assert!(provider.calls() <= 5);
    assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(!c.is_continuous_active());
}

#[tokio::test]
async fn continuous_needs_a_live_stream() {
    let provider = MockProvider::replying("ok");
    let acquirer = MockAcquirer::new(AcquireOutcome::Frames(64, 36));
    let c = browser(continuous(20), Arc::clone(&acquirer), provider.clone());

    c.start_continuous_capture();
    assert!(!c.is_continuous_active());
    let snapshot = c.snapshot();
    assert!(!snapshot.is_capturing && !snapshot.is_continuous_active);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(acquirer.grabs(), 0);
    assert_eq!(provider.calls(), 0);
    assert!(c.analysis_error().is_none());
}

#[tokio::test]
async fn switching_to_on_demand_stops_the_timer() {
    let c = browser(
        continuous(5000),
        MockAcquirer::new(AcquireOutcome::Frames(64, 36)),
        MockProvider::replying("ok"),
    );
    assert!(c.start_capture().await);
    c.start_continuous_capture();
    assert!(c.is_continuous_active());

    c.set_analysis_mode(AnalysisMode::OnDemand).unwrap();
    assert!(!c.is_continuous_active());
}

#[tokio::test]
async fn restarting_capture_keeps_continuous_polling() {
    let c = browser(
        continuous(5000),
        MockAcquirer::new(AcquireOutcome::Frames(64, 36)),
        MockProvider::replying("ok"),
    );
    assert!(c.start_capture().await);
    c.start_continuous_capture();
    assert!(c.start_capture().await);
    assert!(c.is_continuous_active());

    c.stop_capture().await;
    assert!(!c.is_continuous_active());
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribers_see_session_changes() {
    let c = browser(
        configured(CaptureSource::Screen),
        MockAcquirer::new(AcquireOutcome::Frames(64, 36)),
        MockProvider::replying("A chart."),
    );
    let mut rx = c.subscribe();
    assert!(!rx.borrow_and_update().is_capturing);

    assert!(c.start_capture().await);
    assert!(rx.has_changed().unwrap());
    assert!(rx.borrow_and_update().is_capturing);

    c.capture_and_analyze(None).await.unwrap();
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(
        snapshot.last_analysis_result.map(|r| r.description).as_deref(),
        Some("A chart.")
    );
    assert!(snapshot.preview_image_data_url.is_some());
    assert!(!snapshot.is_analyzing);
}
