// bridge.rs: Tauri plugin serving the desktop-source directory and display
// queries to a web frontend (`plugin:glimpse|<command>`).
//
// Only `get_desktop_sources` feeds the vision feature; the display and
// cursor queries are for other parts of the host app.

use serde::Serialize;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{AppHandle, Runtime};

use crate::capture::screen::ScreenDirectory;
use crate::capture::{DesktopSourceDirectory, RawDesktopSource, SourcesRequest, ThumbnailSize};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    pub name: Option<String>,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub scale_factor: f64,
}

impl From<&tauri::Monitor> for DisplayInfo {
    fn from(monitor: &tauri::Monitor) -> Self {
        let position = monitor.position();
        let size = monitor.size();
        Self {
            name: monitor.name().cloned(),
            x: position.x,
            y: position.y,
            width: size.width,
            height: size.height,
            scale_factor: monitor.scale_factor(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

#[tauri::command]
async fn get_desktop_sources(
    types: Vec<String>,
    thumbnail_size: ThumbnailSize,
) -> Result<Vec<RawDesktopSource>, String> {
    let request = SourcesRequest {
        types,
        thumbnail_size,
    };
    ScreenDirectory::new()
        .get_desktop_sources(&request)
        .await
        .map_err(|e| {
            log::error!("get_desktop_sources failed: {}", e);
            e.to_string()
        })
}

#[tauri::command]
fn get_all_displays<R: Runtime>(app: AppHandle<R>) -> Result<Vec<DisplayInfo>, String> {
    let monitors = app.available_monitors().map_err(|e| e.to_string())?;
    Ok(monitors.iter().map(DisplayInfo::from).collect())
}

#[tauri::command]
fn get_primary_display<R: Runtime>(app: AppHandle<R>) -> Result<Option<DisplayInfo>, String> {
    let monitor = app.primary_monitor().map_err(|e| e.to_string())?;
    Ok(monitor.as_ref().map(DisplayInfo::from))
}

#[tauri::command]
fn get_cursor_position<R: Runtime>(app: AppHandle<R>) -> Result<CursorPosition, String> {
    let position = app.cursor_position().map_err(|e| e.to_string())?;
    Ok(CursorPosition {
        x: position.x,
        y: position.y,
    })
}

/// Register with `tauri::Builder::plugin(glimpse_lib::bridge::init())`.
pub fn init<R: Runtime>() -> TauriPlugin<R> {
    Builder::new("glimpse")
        .invoke_handler(tauri::generate_handler![
            get_desktop_sources,
            get_all_displays,
            get_primary_display,
            get_cursor_position
        ])
        .build()
}
