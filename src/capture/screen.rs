// screen.rs: Screen and window streams backed by `xcap`, plus the
// desktop-source directory (screens and windows with thumbnails).
//
// xcap handles are not guaranteed to be `Send`, so every call runs on a
// blocking task and only ids cross the await points.

use async_trait::async_trait;
use image::RgbaImage;
use xcap::{Monitor, Window};

use super::frame::{sample_frame, SampleParams};
use super::{
    os_error, CaptureError, DesktopSourceDirectory, MediaStream, RawDesktopSource,
    SourcesRequest, StreamAcquirer, StreamRequest, SCREEN_ID_PREFIX, WINDOW_ID_PREFIX,
};
use crate::settings::CaptureSource;

/// Thumbnails don't need the full frame quality.
const THUMBNAIL_QUALITY: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Monitor(u32),
    Window(u32),
}

impl Target {
    fn source_id(self) -> String {
        match self {
            Self::Monitor(id) => format!("{SCREEN_ID_PREFIX}{id}:0"),
            Self::Window(id) => format!("{WINDOW_ID_PREFIX}{id}:0"),
        }
    }

    /// Parse `screen:<id>:0` / `window:<id>:0`.
    fn parse(source_id: &str) -> Option<Self> {
        let (rest, make): (&str, fn(u32) -> Self) =
            if let Some(rest) = source_id.strip_prefix(SCREEN_ID_PREFIX) {
                (rest, Self::Monitor)
            } else if let Some(rest) = source_id.strip_prefix(WINDOW_ID_PREFIX) {
                (rest, Self::Window)
            } else {
                return None;
            };
        let raw_id = rest.split(':').next()?;
        raw_id.parse().ok().map(make)
    }
}

fn capture_target(target: Target) -> Result<RgbaImage, CaptureError> {
    match target {
        Target::Monitor(id) => {
            let monitors = Monitor::all().map_err(|e| os_error(format!("enumerate monitors: {e}")))?;
            let monitor = monitors
                .into_iter()
                .find(|m| m.id() == id)
                .ok_or_else(|| CaptureError::NotFound(format!("screen {id} is gone")))?;
            monitor
                .capture_image()
                .map_err(|e| os_error(format!("capture screen: {e}")))
        }
        Target::Window(id) => {
            let windows = Window::all().map_err(|e| os_error(format!("enumerate windows: {e}")))?;
            let window = windows
                .into_iter()
                .find(|w| w.id() == id)
                .ok_or_else(|| CaptureError::NotFound(format!("window {id} is gone")))?;
            window
                .capture_image()
                .map_err(|e| os_error(format!("capture window: {e}")))
        }
    }
}

/// What the platform would pick without a directory: the primary monitor,
/// or the first visible titled window.
fn default_target(source: CaptureSource) -> Result<Target, CaptureError> {
    match source {
        CaptureSource::Window => {
            let windows = Window::all().map_err(|e| os_error(format!("enumerate windows: {e}")))?;
            windows
                .into_iter()
                .find(|w| !w.is_minimized() && !w.title().is_empty())
                .map(|w| Target::Window(w.id()))
                .ok_or_else(|| CaptureError::NotFound("no capturable windows".into()))
        }
        _ => {
            let monitors = Monitor::all().map_err(|e| os_error(format!("enumerate monitors: {e}")))?;
            let first = monitors.first().map(|m| m.id());
            monitors
                .iter()
                .find(|m| m.is_primary())
                .map(|m| m.id())
                .or(first)
                .map(Target::Monitor)
                .ok_or_else(|| CaptureError::NotFound("no monitors found".into()))
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, CaptureError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CaptureError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CaptureError::Failed(format!("capture task failed: {e}")))?
}

/// A live screen or window stream. Each frame re-resolves the target so a
/// closed window surfaces as `NotFound` instead of a stale image.
pub struct ScreenStream {
    target: Target,
    label: String,
    stopped: bool,
}

#[async_trait]
impl MediaStream for ScreenStream {
    fn label(&self) -> &str {
        &self.label
    }

    async fn grab_frame(&mut self) -> Result<RgbaImage, CaptureError> {
        if self.stopped {
            return Err(CaptureError::Failed("stream has been stopped".into()));
        }
        let target = self.target;
        blocking(move || capture_target(target)).await
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            log::debug!("Stopped {}", self.label);
        }
    }
}

/// Opens xcap-backed streams for display and desktop-source requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScreenAcquirer;

impl ScreenAcquirer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StreamAcquirer for ScreenAcquirer {
    async fn acquire(&self, request: &StreamRequest) -> Result<Box<dyn MediaStream>, CaptureError> {
        let target = match request {
            StreamRequest::Display { source, .. } => {
                let source = *source;
                blocking(move || default_target(source)).await?
            }
            StreamRequest::DesktopSource { id, .. } => Target::parse(id)
                .ok_or_else(|| CaptureError::NotFound(format!("unknown desktop source '{id}'")))?,
            StreamRequest::Camera { .. } => {
                return Err(CaptureError::Unsupported(
                    "screen backend cannot open cameras".into(),
                ))
            }
        };

        // Probe one frame so permission problems surface at start, not on
        // the first analysis.
        blocking(move || capture_target(target).map(|_| ())).await?;

        let label = target.source_id();
        log::info!("Opened screen stream on {}", label);
        Ok(Box::new(ScreenStream {
            target,
            label,
            stopped: false,
        }))
    }
}

/// Lists monitors and visible windows, with JPEG thumbnails.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScreenDirectory;

impl ScreenDirectory {
    pub fn new() -> Self {
        Self
    }
}

fn thumbnail(image: RgbaImage, request: &SourcesRequest) -> String {
    let params = SampleParams {
        max_width: request.thumbnail_size.width,
        max_height: request.thumbnail_size.height,
        quality: THUMBNAIL_QUALITY,
    };
    match sample_frame(image, params) {
        Ok(frame) => frame.data_url,
        Err(e) => {
            log::debug!("Thumbnail encode failed: {}", e);
            String::new()
        }
    }
}

fn list_sources(request: &SourcesRequest) -> Result<Vec<RawDesktopSource>, CaptureError> {
    let wants = |kind: &str| request.types.iter().any(|t| t == kind);
    let mut sources = Vec::new();

    if wants("screen") {
        let monitors = Monitor::all().map_err(|e| os_error(format!("enumerate monitors: {e}")))?;
        for (index, monitor) in monitors.iter().enumerate() {
            let thumb = match monitor.capture_image() {
                Ok(img) => thumbnail(img, request),
                Err(e) => {
                    log::debug!("Thumbnail for monitor {} failed: {}", monitor.id(), e);
                    String::new()
                }
            };
            let name = if monitors.len() == 1 {
                "Entire Screen".to_string()
            } else {
                format!("Screen {}", index + 1)
            };
            sources.push(RawDesktopSource {
                id: Target::Monitor(monitor.id()).source_id(),
                name,
                thumbnail: thumb,
                display_id: monitor.id().to_string(),
                app_icon: None,
            });
        }
    }

    if wants("window") {
        let windows = Window::all().map_err(|e| os_error(format!("enumerate windows: {e}")))?;
        for window in windows
            .iter()
            .filter(|w| !w.is_minimized() && !w.title().is_empty())
        {
            let thumb = match window.capture_image() {
                Ok(img) => thumbnail(img, request),
                Err(e) => {
                    log::debug!("Thumbnail for window {} failed: {}", window.id(), e);
                    String::new()
                }
            };
            sources.push(RawDesktopSource {
                id: Target::Window(window.id()).source_id(),
                name: format!("{} - {}", window.app_name(), window.title()),
                thumbnail: thumb,
                display_id: String::new(),
                app_icon: None,
            });
        }
    }

    Ok(sources)
}

#[async_trait]
impl DesktopSourceDirectory for ScreenDirectory {
    async fn get_desktop_sources(
        &self,
        request: &SourcesRequest,
    ) -> Result<Vec<RawDesktopSource>, CaptureError> {
        let request = request.clone();
        let sources = blocking(move || list_sources(&request)).await?;
        log::debug!("Directory listed {} desktop sources", sources.len());
        Ok(sources)
    }
}
