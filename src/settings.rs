// settings.rs: Persisted vision settings (`settings/vision/*`).
//
// Stored as TOML in the user's config directory. Every key can be reset to
// its default on its own, or all at once.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Polling intervals the continuous mode accepts.
pub const CAPTURE_INTERVALS_MS: [u64; 5] = [2000, 5000, 10000, 30000, 60000];

pub const DEFAULT_CAPTURE_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_QUALITY: f32 = 0.7;
pub const DEFAULT_MAX_WIDTH: u32 = 1280;
pub const DEFAULT_MAX_HEIGHT: u32 = 720;

/// Where a frame is grabbed from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    #[default]
    Screen,
    Camera,
    Window,
}

impl CaptureSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Screen => "screen",
            Self::Camera => "camera",
            Self::Window => "window",
        }
    }
}

/// Whether analysis is triggered manually or by a repeating timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisMode {
    #[default]
    OnDemand,
    Continuous,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("no config directory available")]
    NoConfigDir,
}

/// One persisted key. Each maps to `settings/vision/<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    ActiveProvider,
    ActiveModel,
    CustomModelName,
    CaptureSource,
    AnalysisMode,
    CaptureInterval,
    Quality,
    MaxWidth,
    MaxHeight,
    DesktopSourceId,
}

impl SettingKey {
    pub const ALL: [SettingKey; 10] = [
        Self::ActiveProvider,
        Self::ActiveModel,
        Self::CustomModelName,
        Self::CaptureSource,
        Self::AnalysisMode,
        Self::CaptureInterval,
        Self::Quality,
        Self::MaxWidth,
        Self::MaxHeight,
        Self::DesktopSourceId,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActiveProvider => "settings/vision/active-provider",
            Self::ActiveModel => "settings/vision/active-model",
            Self::CustomModelName => "settings/vision/custom-model-name",
            Self::CaptureSource => "settings/vision/capture-source",
            Self::AnalysisMode => "settings/vision/analysis-mode",
            Self::CaptureInterval => "settings/vision/capture-interval",
            Self::Quality => "settings/vision/quality",
            Self::MaxWidth => "settings/vision/max-width",
            Self::MaxHeight => "settings/vision/max-height",
            Self::DesktopSourceId => "settings/vision/desktop-source-id",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VisionSettings {
    pub active_provider: String,
    pub active_model: String,
    pub custom_model_name: String,
    pub capture_source: CaptureSource,
    pub analysis_mode: AnalysisMode,
    pub capture_interval: u64,
    pub quality: f32,
    pub max_width: u32,
    pub max_height: u32,
    pub desktop_source_id: String,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            active_provider: String::new(),
            active_model: String::new(),
            custom_model_name: String::new(),
            capture_source: CaptureSource::Screen,
            analysis_mode: AnalysisMode::OnDemand,
            capture_interval: DEFAULT_CAPTURE_INTERVAL_MS,
            quality: DEFAULT_QUALITY,
            max_width: DEFAULT_MAX_WIDTH,
            max_height: DEFAULT_MAX_HEIGHT,
            desktop_source_id: String::new(),
        }
    }
}

impl VisionSettings {
    /// The model to send requests to: the custom override wins when set.
    pub fn effective_model(&self) -> Option<&str> {
        let custom = self.custom_model_name.trim();
        if !custom.is_empty() {
            return Some(custom);
        }
        let model = self.active_model.trim();
        (!model.is_empty()).then_some(model)
    }

    pub fn active_provider(&self) -> Option<&str> {
        let id = self.active_provider.trim();
        (!id.is_empty()).then_some(id)
    }

    pub fn selected_desktop_source(&self) -> Option<&str> {
        (!self.desktop_source_id.is_empty()).then_some(self.desktop_source_id.as_str())
    }

    /// Restore one key to its default.
    pub fn reset_key(&mut self, key: SettingKey) {
        let d = Self::default();
        match key {
            SettingKey::ActiveProvider => self.active_provider = d.active_provider,
            SettingKey::ActiveModel => self.active_model = d.active_model,
            SettingKey::CustomModelName => self.custom_model_name = d.custom_model_name,
            SettingKey::CaptureSource => self.capture_source = d.capture_source,
            SettingKey::AnalysisMode => self.analysis_mode = d.analysis_mode,
            SettingKey::CaptureInterval => self.capture_interval = d.capture_interval,
            SettingKey::Quality => self.quality = d.quality,
            SettingKey::MaxWidth => self.max_width = d.max_width,
            SettingKey::MaxHeight => self.max_height = d.max_height,
            SettingKey::DesktopSourceId => self.desktop_source_id = d.desktop_source_id,
        }
    }

    /// Replace out-of-range values loaded from disk with defaults.
    fn sanitize(mut self) -> Self {
        if !CAPTURE_INTERVALS_MS.contains(&self.capture_interval) {
            log::warn!(
                "Ignoring unsupported capture interval {}ms, using {}ms",
                self.capture_interval,
                DEFAULT_CAPTURE_INTERVAL_MS
            );
            self.capture_interval = DEFAULT_CAPTURE_INTERVAL_MS;
        }
        if !(0.0..=1.0).contains(&self.quality) {
            log::warn!("Ignoring out-of-range quality {}", self.quality);
            self.quality = DEFAULT_QUALITY;
        }
        if self.max_width == 0 {
            self.max_width = DEFAULT_MAX_WIDTH;
        }
        if self.max_height == 0 {
            self.max_height = DEFAULT_MAX_HEIGHT;
        }
        self
    }
}

/// Partial update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub active_provider: Option<String>,
    pub active_model: Option<String>,
    pub custom_model_name: Option<String>,
    pub capture_source: Option<CaptureSource>,
    pub analysis_mode: Option<AnalysisMode>,
    pub capture_interval: Option<u64>,
    pub quality: Option<f32>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub desktop_source_id: Option<String>,
}

pub fn apply_patch(
    settings: &VisionSettings,
    patch: SettingsPatch,
) -> Result<VisionSettings, SettingsError> {
    if let Some(interval) = patch.capture_interval {
        if !CAPTURE_INTERVALS_MS.contains(&interval) {
            return Err(SettingsError::InvalidValue {
                key: SettingKey::CaptureInterval.as_str(),
                value: interval.to_string(),
            });
        }
    }
    if let Some(quality) = patch.quality {
        if !(0.0..=1.0).contains(&quality) {
            return Err(SettingsError::InvalidValue {
                key: SettingKey::Quality.as_str(),
                value: quality.to_string(),
            });
        }
    }
    for (key, value) in [
        (SettingKey::MaxWidth, patch.max_width),
        (SettingKey::MaxHeight, patch.max_height),
    ] {
        if value == Some(0) {
            return Err(SettingsError::InvalidValue {
                key: key.as_str(),
                value: "0".into(),
            });
        }
    }

    Ok(VisionSettings {
        active_provider: patch
            .active_provider
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| settings.active_provider.clone()),
        active_model: patch
            .active_model
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| settings.active_model.clone()),
        custom_model_name: patch
            .custom_model_name
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| settings.custom_model_name.clone()),
        capture_source: patch.capture_source.unwrap_or(settings.capture_source),
        analysis_mode: patch.analysis_mode.unwrap_or(settings.analysis_mode),
        capture_interval: patch.capture_interval.unwrap_or(settings.capture_interval),
        quality: patch.quality.unwrap_or(settings.quality),
        max_width: patch.max_width.unwrap_or(settings.max_width),
        max_height: patch.max_height.unwrap_or(settings.max_height),
        desktop_source_id: patch
            .desktop_source_id
            .unwrap_or_else(|| settings.desktop_source_id.clone()),
    })
}

/// `{config_dir}/glimpse/<file>`
pub fn config_path(file: &str) -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join("glimpse").join(file))
}

pub fn load_or_default(path: &Path) -> Result<VisionSettings, SettingsError> {
    if !path.exists() {
        return Ok(VisionSettings::default());
    }
    let content = fs::read_to_string(path)?;
    let settings: VisionSettings = toml::from_str(&content)?;
    Ok(settings.sanitize())
}

pub fn save(path: &Path, settings: &VisionSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(settings)?;
    fs::write(path, content)?;
    log::debug!("Vision settings saved to {}", path.display());
    Ok(())
}

/// Process-wide settings with write-through persistence.
///
/// Fields are independent; there is no transactional grouping beyond a
/// single `update`.
pub struct SettingsStore {
    path: Option<PathBuf>,
    settings: Mutex<VisionSettings>,
}

impl SettingsStore {
    /// A store that never touches the disk.
    pub fn in_memory(settings: VisionSettings) -> Self {
        Self {
            path: None,
            settings: Mutex::new(settings),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let settings = load_or_default(&path)?;
        log::info!("Vision settings loaded from {}", path.display());
        Ok(Self {
            path: Some(path),
            settings: Mutex::new(settings),
        })
    }

    /// Open `{config_dir}/glimpse/vision.toml`.
    pub fn open_default() -> Result<Self, SettingsError> {
        Self::open(config_path("vision.toml")?)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self) -> VisionSettings {
        self.lock().clone()
    }

    pub fn update(&self, patch: SettingsPatch) -> Result<VisionSettings, SettingsError> {
        let mut guard = self.lock();
        let updated = apply_patch(&guard, patch)?;
        self.persist(&updated)?;
        *guard = updated.clone();
        Ok(updated)
    }

    pub fn reset(&self, key: SettingKey) -> Result<VisionSettings, SettingsError> {
        let mut guard = self.lock();
        let mut updated = guard.clone();
        updated.reset_key(key);
        self.persist(&updated)?;
        *guard = updated.clone();
        Ok(updated)
    }

    pub fn reset_all(&self) -> Result<VisionSettings, SettingsError> {
        let mut guard = self.lock();
        let defaults = VisionSettings::default();
        *guard = defaults.clone();
        self.persist(&defaults)?;
        Ok(defaults)
    }

    fn persist(&self, settings: &VisionSettings) -> Result<(), SettingsError> {
        match &self.path {
            Some(path) => save(path, settings),
            None => Ok(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VisionSettings> {
        // Settings stay usable even if a writer panicked mid-update.
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }
}
