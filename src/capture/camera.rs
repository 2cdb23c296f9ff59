// camera.rs: Camera capture using `nokhwa`.
//
// `nokhwa::Camera` is `!Send`, so each stream owns a dedicated thread that
// holds the camera and answers frame requests over a channel.

use async_trait::async_trait;
use image::{DynamicImage, RgbImage, RgbaImage};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution,
};
use nokhwa::Camera;
use std::sync::mpsc;
use tokio::sync::oneshot;

use super::{os_error, CaptureError, MediaStream, StreamAcquirer, StreamRequest};

/// Frame rate asked for alongside the target size.
const TARGET_FRAME_RATE: u32 = 30;

enum Command {
    Frame(oneshot::Sender<Result<RgbaImage, CaptureError>>),
    Stop,
}

/// The format closest to the configured frame bounds.
fn target_format(max_width: u32, max_height: u32) -> CameraFormat {
    CameraFormat::new(
        Resolution::new(max_width.max(1), max_height.max(1)),
        FrameFormat::MJPEG,
        TARGET_FRAME_RATE,
    )
}

fn open_with(index: u32, format: RequestedFormatType) -> Result<Camera, nokhwa::NokhwaError> {
    let requested = RequestedFormat::new::<RgbFormat>(format);
    let mut camera = Camera::new(CameraIndex::Index(index), requested)?;
    camera.open_stream()?;
    Ok(camera)
}

fn open_camera(index: u32, max_width: u32, max_height: u32) -> Result<Camera, CaptureError> {
    let backend = nokhwa::native_api_backend().unwrap_or(ApiBackend::Auto);
    let devices = nokhwa::query(backend).map_err(|e| os_error(format!("query cameras: {e}")))?;
    if devices.is_empty() {
        return Err(CaptureError::NotFound("no camera devices".into()));
    }

    let preferred = RequestedFormatType::Closest(target_format(max_width, max_height));
    match open_with(index, preferred) {
        Ok(camera) => Ok(camera),
        Err(e) => {
            log::warn!(
                "Camera {} rejected {}x{} ({}), falling back to its fastest format",
                index,
                max_width,
                max_height,
                e
            );
            open_with(index, RequestedFormatType::AbsoluteHighestFrameRate)
                .map_err(|e| os_error(format!("open camera {index}: {e}")))
        }
    }
}

fn read_frame(camera: &mut Camera) -> Result<RgbaImage, CaptureError> {
    let buffer = camera
        .frame()
        .map_err(|e| CaptureError::Failed(format!("camera frame: {e}")))?;
    let decoded = buffer
        .decode_image::<RgbFormat>()
        .map_err(|e| CaptureError::Failed(format!("decode camera frame: {e}")))?;
    let (w, h) = (decoded.width(), decoded.height());
    // nokhwa links its own `image` version; go through raw bytes.
    let rgb = RgbImage::from_raw(w, h, decoded.into_raw())
        .ok_or_else(|| CaptureError::Failed("camera frame has the wrong size".into()))?;
    Ok(DynamicImage::ImageRgb8(rgb).to_rgba8())
}

fn camera_thread(
    index: u32,
    (max_width, max_height): (u32, u32),
    commands: mpsc::Receiver<Command>,
    ready: oneshot::Sender<Result<(), CaptureError>>,
) {
    let mut camera = match open_camera(index, max_width, max_height) {
        Ok(camera) => {
            let _ = ready.send(Ok(()));
            camera
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let format = camera.camera_format();
    log::info!(
        "Camera {} streaming at {}x{}",
        index,
        format.resolution().width_x,
        format.resolution().height_y
    );

    while let Ok(command) = commands.recv() {
        match command {
            Command::Frame(reply) => {
                let _ = reply.send(read_frame(&mut camera));
            }
            Command::Stop => break,
        }
    }

    if let Err(e) = camera.stop_stream() {
        log::warn!("Error stopping camera stream: {}", e);
    }
    log::info!("Camera {} stopped", index);
}

pub struct CameraStream {
    commands: Option<mpsc::Sender<Command>>,
    label: String,
}

#[async_trait]
impl MediaStream for CameraStream {
    fn label(&self) -> &str {
        &self.label
    }

    async fn grab_frame(&mut self) -> Result<RgbaImage, CaptureError> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| CaptureError::Failed("stream has been stopped".into()))?;
        let (tx, rx) = oneshot::channel();
        commands
            .send(Command::Frame(tx))
            .map_err(|_| CaptureError::Failed("camera thread exited".into()))?;
        rx.await
            .map_err(|_| CaptureError::Failed("camera thread exited".into()))?
    }

    fn stop(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Stop);
        }
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens a camera at the format closest to the requested size. Frames are
/// still downscaled by the sampler if the device delivers more.
#[derive(Debug, Default, Clone, Copy)]
pub struct CameraAcquirer {
    device_index: u32,
}

impl CameraAcquirer {
    pub fn new(device_index: u32) -> Self {
        Self { device_index }
    }
}

#[async_trait]
impl StreamAcquirer for CameraAcquirer {
    async fn acquire(&self, request: &StreamRequest) -> Result<Box<dyn MediaStream>, CaptureError> {
        let StreamRequest::Camera {
            max_width,
            max_height,
        } = request
        else {
            return Err(CaptureError::Unsupported(
                "camera backend only opens cameras".into(),
            ));
        };

        let index = self.device_index;
        let size = (*max_width, *max_height);
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name(format!("camera-{index}"))
            .spawn(move || camera_thread(index, size, command_rx, ready_tx))
            .map_err(|e| CaptureError::Failed(format!("spawn camera thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| CaptureError::Failed("camera thread exited".into()))??;

        log::info!(
            "Opened camera {} (requested up to {}x{})",
            index,
            max_width,
            max_height
        );
        Ok(Box::new(CameraStream {
            commands: Some(command_tx),
            label: format!("camera:{index}"),
        }))
    }
}
