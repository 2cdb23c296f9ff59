/// The `capture` module obtains live video streams and samples frames from
/// them. Screen and window capture go through `xcap` (feature `desktop`),
/// cameras through `nokhwa` (feature `camera`).
use async_trait::async_trait;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::settings::CaptureSource;

pub mod frame;

#[cfg(feature = "camera")]
pub mod camera;
#[cfg(feature = "desktop")]
pub mod screen;

/// Thumbnail size requested from the desktop-source directory.
pub const THUMBNAIL_WIDTH: u32 = 320;
pub const THUMBNAIL_HEIGHT: u32 = 180;

/// Prefix that marks a desktop source id as a whole screen.
pub const SCREEN_ID_PREFIX: &str = "screen:";
pub const WINDOW_ID_PREFIX: &str = "window:";

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Failed(String),
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Sort an OS error message into a denial or a generic failure.
#[cfg_attr(not(any(feature = "desktop", feature = "camera")), allow(dead_code))]
pub(crate) fn os_error(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if ["permission", "denied", "not authorized", "notallowed"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::Failed(message)
    }
}

/// What to open a stream on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequest {
    /// Platform display capture; the platform decides which surface.
    Display {
        source: CaptureSource,
        max_width: u32,
        max_height: u32,
    },
    /// A specific screen or window from the desktop-source directory.
    DesktopSource {
        id: String,
        max_width: u32,
        max_height: u32,
    },
    /// The user-facing camera.
    Camera { max_width: u32, max_height: u32 },
}

/// A live, exclusively owned video stream.
#[async_trait]
pub trait MediaStream: Send {
    /// Human-readable description for logs.
    fn label(&self) -> &str;

    /// Grab the current frame.
    async fn grab_frame(&mut self) -> Result<RgbaImage, CaptureError>;

    /// Stop every track. Further `grab_frame` calls fail.
    fn stop(&mut self);
}

/// Opens streams. One implementation is chosen per host at startup.
#[async_trait]
pub trait StreamAcquirer: Send + Sync {
    async fn acquire(&self, request: &StreamRequest) -> Result<Box<dyn MediaStream>, CaptureError>;
}

/// Request sent to the desktop-source directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcesRequest {
    pub types: Vec<String>,
    pub thumbnail_size: ThumbnailSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

impl Default for SourcesRequest {
    fn default() -> Self {
        Self {
            types: vec!["screen".into(), "window".into()],
            thumbnail_size: ThumbnailSize {
                width: THUMBNAIL_WIDTH,
                height: THUMBNAIL_HEIGHT,
            },
        }
    }
}

/// One entry of the directory response, as the host reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDesktopSource {
    pub id: String,
    pub name: String,
    /// Data URL
    pub thumbnail: String,
    #[serde(default)]
    pub display_id: String,
    #[serde(default, rename = "appIcon")]
    pub app_icon: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesktopSourceKind {
    Screen,
    Window,
}

impl DesktopSourceKind {
    pub fn from_source(source: CaptureSource) -> Option<Self> {
        match source {
            CaptureSource::Screen => Some(Self::Screen),
            CaptureSource::Window => Some(Self::Window),
            CaptureSource::Camera => None,
        }
    }
}

/// A classified directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesktopSource {
    pub id: String,
    pub name: String,
    pub thumbnail: String,
    #[serde(rename = "type")]
    pub kind: DesktopSourceKind,
}

impl From<RawDesktopSource> for DesktopSource {
    fn from(raw: RawDesktopSource) -> Self {
        let kind = classify_source_id(&raw.id);
        Self {
            id: raw.id,
            name: raw.name,
            thumbnail: raw.thumbnail,
            kind,
        }
    }
}

/// `screen:` ids are screens, everything else is a window.
pub fn classify_source_id(id: &str) -> DesktopSourceKind {
    if id.starts_with(SCREEN_ID_PREFIX) {
        DesktopSourceKind::Screen
    } else {
        DesktopSourceKind::Window
    }
}

/// Host service listing capturable screens and windows.
#[async_trait]
pub trait DesktopSourceDirectory: Send + Sync {
    async fn get_desktop_sources(
        &self,
        request: &SourcesRequest,
    ) -> Result<Vec<RawDesktopSource>, CaptureError>;
}

/// Which host the coordinator runs in. Chosen once at construction.
#[derive(Clone)]
pub enum HostEnvironment {
    /// Only platform display capture; no source enumeration.
    Browser,
    /// Screens and windows are picked from a directory by id.
    DesktopShell(Arc<dyn DesktopSourceDirectory>),
}

impl HostEnvironment {
    pub fn directory(&self) -> Option<&Arc<dyn DesktopSourceDirectory>> {
        match self {
            Self::Browser => None,
            Self::DesktopShell(dir) => Some(dir),
        }
    }

    pub fn is_desktop_shell(&self) -> bool {
        matches!(self, Self::DesktopShell(_))
    }
}

impl std::fmt::Debug for HostEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Browser => f.write_str("Browser"),
            Self::DesktopShell(_) => f.write_str("DesktopShell"),
        }
    }
}

/// Routes requests to whichever capture backends were compiled in.
#[derive(Default)]
pub struct SystemAcquirer {
    #[cfg(feature = "desktop")]
    screen: screen::ScreenAcquirer,
    #[cfg(feature = "camera")]
    camera: camera::CameraAcquirer,
}

impl SystemAcquirer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamAcquirer for SystemAcquirer {
    async fn acquire(&self, request: &StreamRequest) -> Result<Box<dyn MediaStream>, CaptureError> {
        match request {
            StreamRequest::Display { .. } | StreamRequest::DesktopSource { .. } => {
                #[cfg(feature = "desktop")]
                {
                    self.screen.acquire(request).await
                }
                #[cfg(not(feature = "desktop"))]
                {
                    Err(CaptureError::Unsupported(
                        "built without screen capture support".into(),
                    ))
                }
            }
            StreamRequest::Camera { .. } => {
                #[cfg(feature = "camera")]
                {
                    self.camera.acquire(request).await
                }
                #[cfg(not(feature = "camera"))]
                {
                    Err(CaptureError::Unsupported(
                        "built without camera support".into(),
                    ))
                }
            }
        }
    }
}

/// The host this build can offer: a desktop shell when screen enumeration is
/// compiled in, otherwise browser-like display capture.
pub fn default_host() -> HostEnvironment {
    #[cfg(feature = "desktop")]
    {
        HostEnvironment::DesktopShell(Arc::new(screen::ScreenDirectory::new()))
    }
    #[cfg(not(feature = "desktop"))]
    {
        HostEnvironment::Browser
    }
}
