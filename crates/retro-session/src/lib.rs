use std::time::{SystemTime, UNIX_EPOCH};

use retro_core::{
    is_image_mime, run_transform_with_telemetry, CoreError, ImagePayload, RetroStyle, TelemetryEvent, TelemetryEventType,
    TelemetrySink, TransformBackend, TransformRequest,
};
use retro_image::{probe_dimensions, DimensionState, Dimensions, ExportError, ExportedImage, ResizeError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("upload an image first")]
    NoSourceImage,
    #[error("failed to read upload: {0}")]
    Read(#[from] std::io::Error),
    #[error("uploaded file is not a readable image: {0}")]
    Decode(ExportError),
    #[error("export failed: {0}")]
    Export(ExportError),
    #[error(transparent)]
    Resize(#[from] ResizeError),
}

/// Handed out by [`Session::begin_upload`]; only the most recent one can complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    id: u64,
    mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Loaded(Dimensions),
    Discarded,
}

/// An in-flight remote transform. Carries everything the backend call needs so
/// the call can run wherever the host likes before being fed back.
#[derive(Debug, Clone)]
pub struct GenerationTicket {
    id: u64,
    upload_epoch: u64,
    request: TransformRequest,
}

impl GenerationTicket {
    pub fn request(&self) -> &TransformRequest {
        &self.request
    }
}

#[derive(Debug)]
pub enum GenerationOutcome {
    Applied,
    Failed(CoreError),
    /// A newer generation or upload started after this ticket was issued.
    Discarded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub has_source: bool,
    pub has_processed: bool,
    pub source_mime_type: Option<String>,
    pub style: RetroStyle,
    pub width: u32,
    pub height: u32,
    pub aspect_locked: bool,
    pub processing: bool,
    pub error: Option<String>,
}

/// Everything the editor knows between user actions.
pub struct Session {
    source: Option<ImagePayload>,
    processed: Option<ImagePayload>,
    style: RetroStyle,
    dimensions: DimensionState,
    processing: bool,
    error: Option<String>,
    upload_epoch: u64,
    last_upload_id: u64,
    pending_upload: Option<u64>,
    last_generation_id: u64,
    pending_generation: Option<u64>,
    telemetry: Option<Box<dyn TelemetrySink>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            source: None,
            processed: None,
            style: RetroStyle::default(),
            dimensions: DimensionState::default(),
            processing: false,
            error: None,
            upload_epoch: 0,
            last_upload_id: 0,
            pending_upload: None,
            last_generation_id: 0,
            pending_generation: None,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, sink: Option<Box<dyn TelemetrySink>>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn source(&self) -> Option<&ImagePayload> {
        self.source.as_ref()
    }

    pub fn processed(&self) -> Option<&ImagePayload> {
        self.processed.as_ref()
    }

    pub fn style(&self) -> RetroStyle {
        self.style
    }

    pub fn dimensions(&self) -> &DimensionState {
        &self.dimensions
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            has_source: self.source.is_some(),
            has_processed: self.processed.is_some(),
            source_mime_type: self.source.as_ref().map(|s| s.mime_type.clone()),
            style: self.style,
            width: self.dimensions.width(),
            height: self.dimensions.height(),
            aspect_locked: self.dimensions.is_locked(),
            processing: self.processing,
            error: self.error.clone(),
        }
    }

    pub fn begin_upload(&mut self, mime_type: &str) -> Result<UploadTicket, SessionError> {
        if !is_image_mime(mime_type) {
            let err = CoreError::InvalidUpload(mime_type.to_string());
            self.error = Some(err.to_string());
            self.emit(TelemetryEventType::UploadRejected, Some(mime_type.to_string()));
            return Err(err.into());
        }
        self.last_upload_id += 1;
        self.pending_upload = Some(self.last_upload_id);
        Ok(UploadTicket {
            id: self.last_upload_id,
            mime_type: mime_type.trim().to_string(),
        })
    }

    pub fn complete_upload(
        &mut self,
        ticket: UploadTicket,
        read: std::io::Result<Vec<u8>>,
    ) -> Result<UploadOutcome, SessionError> {
        if self.pending_upload != Some(ticket.id) {
            log::warn!("discarding stale upload #{}", ticket.id);
            return Ok(UploadOutcome::Discarded);
        }
        self.pending_upload = None;
        let bytes = match read {
            Ok(bytes) => bytes,
            Err(err) => {
                let err = SessionError::Read(err);
                self.error = Some(err.to_string());
                return Err(err);
            }
        };
        let size = match probe_dimensions(&bytes) {
            Ok(size) => size,
            Err(err) => {
                let err = SessionError::Decode(err);
                self.error = Some(err.to_string());
                self.emit(TelemetryEventType::UploadRejected, Some(err.to_string()));
                return Err(err);
            }
        };

        self.source = Some(ImagePayload::new(ticket.mime_type, bytes));
        self.processed = None;
        self.error = None;
        self.dimensions.reset_for_image(size.width, size.height);
        self.upload_epoch += 1;
        self.pending_generation = None;
        self.processing = false;
        log::debug!("loaded upload #{} at {}x{}", ticket.id, size.width, size.height);
        self.emit(
            TelemetryEventType::UploadAccepted,
            Some(format!("{}x{}", size.width, size.height)),
        );
        Ok(UploadOutcome::Loaded(size))
    }

    /// Starts and completes an upload in one step.
    pub fn upload(&mut self, mime_type: &str, bytes: Vec<u8>) -> Result<UploadOutcome, SessionError> {
        let ticket = self.begin_upload(mime_type)?;
        self.complete_upload(ticket, Ok(bytes))
    }

    pub fn select_style(&mut self, style: RetroStyle) {
        self.style = style;
    }

    pub fn set_width(&mut self, width: f64) {
        self.dimensions.set_width(width);
    }

    pub fn set_height(&mut self, height: f64) {
        self.dimensions.set_height(height);
    }

    pub fn apply_scale(&mut self, factor: f64) -> Result<(), SessionError> {
        Ok(self.dimensions.apply_scale(factor)?)
    }

    pub fn toggle_lock(&mut self) {
        self.dimensions.toggle_lock();
    }

    /// Issues a new generation ticket; any earlier ticket becomes stale.
    pub fn begin_generate(&mut self) -> Result<GenerationTicket, SessionError> {
        let source = self.source.as_ref().ok_or(SessionError::NoSourceImage)?;
        if let Some(previous) = self.pending_generation {
            log::debug!("generation #{} superseded", previous);
        }
        self.last_generation_id += 1;
        self.pending_generation = Some(self.last_generation_id);
        self.processing = true;
        self.error = None;
        Ok(GenerationTicket {
            id: self.last_generation_id,
            upload_epoch: self.upload_epoch,
            request: TransformRequest::from_payload(source, self.style),
        })
    }

    pub fn complete_generate(
        &mut self,
        ticket: GenerationTicket,
        result: Result<ImagePayload, CoreError>,
    ) -> GenerationOutcome {
        if self.pending_generation != Some(ticket.id) || self.upload_epoch != ticket.upload_epoch {
            log::warn!("discarding stale generation #{}", ticket.id);
            return GenerationOutcome::Discarded;
        }
        self.pending_generation = None;
        self.processing = false;
        match result {
            Ok(payload) => {
                self.processed = Some(payload);
                GenerationOutcome::Applied
            }
            Err(err) => {
                log::warn!("generation #{} failed: {}", ticket.id, err);
                self.error = Some(format!("Image processing failed, please try again. {}", err));
                GenerationOutcome::Failed(err)
            }
        }
    }

    /// Runs a whole generation against `backend` on the calling thread.
    pub fn generate(&mut self, backend: &dyn TransformBackend) -> Result<GenerationOutcome, SessionError> {
        let ticket = self.begin_generate()?;
        let result = run_transform_with_telemetry(backend, ticket.request(), self.telemetry.as_deref());
        Ok(self.complete_generate(ticket, result))
    }

    pub fn reset(&mut self) {
        self.source = None;
        self.processed = None;
        self.error = None;
        self.processing = false;
        self.pending_upload = None;
        self.pending_generation = None;
        self.upload_epoch += 1;
    }

    /// The processed image when there is one, otherwise the original.
    pub fn download_target(&self) -> Option<&ImagePayload> {
        self.processed.as_ref().or(self.source.as_ref())
    }

    pub fn export(&mut self, timestamp_ms: u128) -> Result<ExportedImage, SessionError> {
        let Some(target) = self.download_target() else {
            self.error = Some(SessionError::NoSourceImage.to_string());
            return Err(SessionError::NoSourceImage);
        };
        match retro_image::export(target, self.dimensions.dimensions(), self.style, timestamp_ms) {
            Ok(exported) => {
                self.emit(TelemetryEventType::ExportSuccess, Some(exported.file_name.clone()));
                Ok(exported)
            }
            Err(err) => {
                let err = SessionError::Export(err);
                self.error = Some(err.to_string());
                self.emit(TelemetryEventType::ExportError, Some(err.to_string()));
                Err(err)
            }
        }
    }

    pub fn export_now(&mut self) -> Result<ExportedImage, SessionError> {
        self.export(now_millis())
    }

    fn emit(&self, event_type: TelemetryEventType, detail: Option<String>) {
        if let Some(sink) = self.telemetry.as_deref() {
            sink.emit(TelemetryEvent {
                event_type,
                style: self.style,
                duration_ms: None,
                detail,
            });
        }
    }
}

pub fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
