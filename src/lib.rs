pub mod ai;
pub mod capture;
pub mod coordinator;
pub mod settings;

#[cfg(feature = "tauri")]
pub mod bridge;

pub use coordinator::{AnalysisResult, CaptureCoordinator, OverlapPolicy, SessionSnapshot};
pub use settings::{AnalysisMode, CaptureSource, SettingsStore, VisionSettings};

/// Install the `env_logger` backend. `RUST_LOG` overrides the default
/// `info` filter. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
