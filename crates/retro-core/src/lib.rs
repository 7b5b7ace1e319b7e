use std::fmt::{Display, Formatter};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Appended to every style instruction sent to the remote model.
pub const COMPOSITION_SUFFIX: &str =
    "Ensure the output maintains the composition of the original image but applies the requested style heavily.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetroStyle {
    #[default]
    Nokia,
    BwCcd,
    Gameboy,
    Crt,
}

impl RetroStyle {
    pub fn id(self) -> &'static str {
        match self {
            Self::Nokia => "NOKIA",
            Self::BwCcd => "BW_CCD",
            Self::Gameboy => "GAMEBOY",
            Self::Crt => "CRT",
        }
    }

    /// Lower-cased identifier used in exported file names.
    pub fn file_label(self) -> &'static str {
        match self {
            Self::Nokia => "nokia",
            Self::BwCcd => "bw_ccd",
            Self::Gameboy => "gameboy",
            Self::Crt => "crt",
        }
    }

    pub fn all() -> [RetroStyle; 4] {
        [RetroStyle::Nokia, RetroStyle::BwCcd, RetroStyle::Gameboy, RetroStyle::Crt]
    }

    pub fn from_id(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "NOKIA" => Some(Self::Nokia),
            "BW_CCD" | "CCD" => Some(Self::BwCcd),
            "GAMEBOY" => Some(Self::Gameboy),
            "CRT" => Some(Self::Crt),
            _ => None,
        }
    }

    pub fn config(self) -> &'static StyleConfig {
        match self {
            Self::Nokia => &STYLES[0],
            Self::BwCcd => &STYLES[1],
            Self::Gameboy => &STYLES[2],
            Self::Crt => &STYLES[3],
        }
    }

    pub fn smoothing(self) -> SmoothingPolicy {
        self.config().smoothing
    }
}

impl Display for RetroStyle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SmoothingQuality {
    Low,
    High,
}

/// How the export step interpolates when it scales the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum SmoothingPolicy {
    Disabled,
    Enabled { quality: SmoothingQuality },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleConfig {
    pub id: RetroStyle,
    pub name: &'static str,
    pub description: &'static str,
    pub instruction: &'static str,
    pub smoothing: SmoothingPolicy,
}

impl StyleConfig {
    pub fn is_pixel_art(&self) -> bool {
        self.smoothing == SmoothingPolicy::Disabled
    }

    pub fn prompt(&self) -> String {
        format!("{} {}", self.instruction, COMPOSITION_SUFFIX)
    }
}

pub static STYLES: [StyleConfig; 4] = [
    StyleConfig {
        id: RetroStyle::Nokia,
        name: "Nokia 3310",
        description: "Classic monochrome green screen with dithered shading, straight out of a millennium-era phone.",
        instruction: "Transform this image into a retro Nokia 3310 pixel art style. Use a monochromatic palette (dark pixels on a greenish-grey background). Apply dithering for shading. Extremely low resolution, distinct pixel grid, early 2000s mobile phone aesthetic.",
        smoothing: SmoothingPolicy::Disabled,
    },
    StyleConfig {
        id: RetroStyle::BwCcd,
        name: "B&W CCD",
        description: "Noisy, high-contrast black and white from an early digital camera sensor.",
        instruction: "Transform this image into a gritty, black and white photo taken with an early 2000s low-quality CCD sensor digital camera. Add heavy digital noise, crushed blacks, blooming highlights, and visible compression artifacts. Make it look like a cursed image from the early internet.",
        smoothing: SmoothingPolicy::Enabled {
            quality: SmoothingQuality::Low,
        },
    },
    StyleConfig {
        id: RetroStyle::Gameboy,
        name: "Handheld 8-bit",
        description: "The four-shade green palette of a 90s handheld console.",
        instruction: "Transform this image into a Game Boy pixel art style. Use the strict 4-color green scale palette (from dark olive to bright lime). Pixelated edges, retro handheld gaming console aesthetic.",
        smoothing: SmoothingPolicy::Disabled,
    },
    StyleConfig {
        id: RetroStyle::Crt,
        name: "CRT Glitch",
        description: "Scanlines, noise and colour fringing from an old television set.",
        instruction: "Transform this image into a 1990s TV screen capture. Add scanlines, RGB shift (chromatic aberration), slightly curved screen distortion, and VHS tape static noise. Saturated colors.",
        smoothing: SmoothingPolicy::Enabled {
            quality: SmoothingQuality::High,
        },
    },
];

pub fn is_image_mime(mime_type: &str) -> bool {
    mime_type.trim().to_ascii_lowercase().starts_with("image/")
}

/// An encoded image together with its MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImagePayload {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformRequest {
    pub image_bytes: Vec<u8>,
    pub mime_type: String,
    pub style: RetroStyle,
}

impl TransformRequest {
    pub fn from_payload(payload: &ImagePayload, style: RetroStyle) -> Self {
        Self {
            image_bytes: payload.bytes.clone(),
            mime_type: payload.mime_type.clone(),
            style,
        }
    }
}

pub trait TransformBackend: Send + Sync {
    fn generate(&self, request: &TransformRequest) -> Result<ImagePayload, CoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelemetryEventType {
    UploadAccepted,
    UploadRejected,
    TransformStart,
    TransformSuccess,
    TransformError,
    ExportSuccess,
    ExportError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub style: RetroStyle,
    pub duration_ms: Option<u64>,
    pub detail: Option<String>,
}

impl TelemetryEvent {
    pub fn new(event_type: TelemetryEventType, style: RetroStyle) -> Self {
        Self {
            event_type,
            style,
            duration_ms: None,
            detail: None,
        }
    }
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("please upload a valid image file (received type '{0}')")]
    InvalidUpload(String),
    #[error("missing input image bytes")]
    MissingInput,
    #[error("the model returned no image data, please try again")]
    EmptyResponse,
    #[error("remote model error ({status}): {message}")]
    Remote { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidUpload,
    MissingInput,
    EmptyResponse,
    RemoteError,
    NetworkError,
    BackendError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUpload(_) => ErrorCode::InvalidUpload,
            Self::MissingInput => ErrorCode::MissingInput,
            Self::EmptyResponse => ErrorCode::EmptyResponse,
            Self::Remote { .. } => ErrorCode::RemoteError,
            Self::Network(_) => ErrorCode::NetworkError,
            Self::Backend(_) => ErrorCode::BackendError,
        }
    }

    pub fn as_error_info(&self) -> ErrorInfo {
        let message = match self {
            Self::Backend(message) => message.clone(),
            other => other.to_string(),
        };
        ErrorInfo {
            code: self.code(),
            message,
        }
    }
}

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub model: String,
    pub api_base: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Empty string fields and a zero timeout in `overrides` fall back to the defaults.
pub fn resolve_runtime_config(overrides: RuntimeConfig) -> RuntimeConfig {
    let mut cfg = RuntimeConfig::default();
    if !overrides.model.trim().is_empty() {
        cfg.model = overrides.model.trim().to_string();
    }
    if !overrides.api_base.trim().is_empty() {
        cfg.api_base = overrides.api_base.trim().trim_end_matches('/').to_string();
    }
    if !overrides.api_key_env.trim().is_empty() {
        cfg.api_key_env = overrides.api_key_env.trim().to_string();
    }
    if overrides.timeout_secs > 0 {
        cfg.timeout_secs = overrides.timeout_secs;
    }
    cfg
}

pub fn run_transform(backend: &dyn TransformBackend, request: &TransformRequest) -> Result<ImagePayload, CoreError> {
    run_transform_with_telemetry(backend, request, None)
}

pub fn run_transform_with_telemetry(
    backend: &dyn TransformBackend,
    request: &TransformRequest,
    telemetry: Option<&dyn TelemetrySink>,
) -> Result<ImagePayload, CoreError> {
    if request.image_bytes.is_empty() {
        return Err(CoreError::MissingInput);
    }
    if !is_image_mime(&request.mime_type) {
        return Err(CoreError::InvalidUpload(request.mime_type.clone()));
    }
    let start = Instant::now();
    if let Some(sink) = telemetry {
        sink.emit(TelemetryEvent::new(TelemetryEventType::TransformStart, request.style));
    }
    match backend.generate(request) {
        Ok(payload) if payload.bytes.is_empty() => {
            let err = CoreError::EmptyResponse;
            emit_transform_error(telemetry, request.style, start, &err);
            Err(err)
        }
        Ok(payload) => {
            if let Some(sink) = telemetry {
                sink.emit(TelemetryEvent {
                    event_type: TelemetryEventType::TransformSuccess,
                    style: request.style,
                    duration_ms: Some(start.elapsed().as_millis() as u64),
                    detail: Some(format!("mime={},bytes={}", payload.mime_type, payload.bytes.len())),
                });
            }
            Ok(payload)
        }
        Err(err) => {
            emit_transform_error(telemetry, request.style, start, &err);
            Err(err)
        }
    }
}

fn emit_transform_error(telemetry: Option<&dyn TelemetrySink>, style: RetroStyle, start: Instant, err: &CoreError) {
    if let Some(sink) = telemetry {
        sink.emit(TelemetryEvent {
            event_type: TelemetryEventType::TransformError,
            style,
            duration_ms: Some(start.elapsed().as_millis() as u64),
            detail: Some(err.to_string()),
        });
    }
}
