use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use image::{DynamicImage, GenericImageView, ImageBuffer, ImageFormat, Rgb};
use retro_core::{CoreError, ImagePayload, RetroStyle, TransformBackend, TransformRequest};
use retro_image::{probe_dimensions, Dimensions, MAX_DIMENSION};
use retro_session::{GenerationOutcome, Session, UploadOutcome};

const DARK: Rgb<u8> = Rgb([10, 10, 10]);
const LIGHT: Rgb<u8> = Rgb([240, 240, 240]);

fn build_checker_png(width: u32, height: u32) -> Result<Vec<u8>> {
    let img = ImageBuffer::from_fn(width, height, |x, y| if (x + y) % 2 == 0 { LIGHT } else { DARK });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img).write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}

/// Plays the remote model: answers every request with a fixed checkerboard.
struct CheckerBackend {
    calls: AtomicUsize,
    reply: Vec<u8>,
}

impl CheckerBackend {
    fn new(width: u32, height: u32) -> Result<Self> {
        Ok(Self {
            calls: AtomicUsize::new(0),
            reply: build_checker_png(width, height)?,
        })
    }
}

impl TransformBackend for CheckerBackend {
    fn generate(&self, request: &TransformRequest) -> Result<ImagePayload, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(!request.image_bytes.is_empty());
        assert_eq!(request.mime_type, "image/png");
        Ok(ImagePayload::new("image/png", self.reply.clone()))
    }
}

#[test]
fn every_style_round_trips_upload_transform_export() -> Result<()> {
    let backend = CheckerBackend::new(16, 8)?;
    let source = build_checker_png(64, 32)?;

    for style in RetroStyle::all() {
        let mut session = Session::new();
        session.select_style(style);
        let outcome = session.upload("image/png", source.clone())?;
        assert!(matches!(outcome, UploadOutcome::Loaded(size) if size.width == 64 && size.height == 32));

        session.set_width(128.0);
        assert_eq!(session.dimensions().height(), 64);

        assert!(matches!(session.generate(&backend)?, GenerationOutcome::Applied));
        assert!(session.processed().is_some());
        assert!(session.source().is_some_and(|s| s.bytes == source));

        let exported = session.export(1_700_000_000_000)?;
        assert_eq!(
            exported.file_name,
            format!("retro-lens-{}-1700000000000.png", style.file_label())
        );
        let decoded = image::load_from_memory(&exported.png)?;
        assert_eq!(decoded.dimensions(), (128, 64));

        if style.config().is_pixel_art() {
            for (_, _, pixel) in decoded.to_rgb8().enumerate_pixels() {
                assert!(*pixel == DARK || *pixel == LIGHT, "{style} blended a pixel: {pixel:?}");
            }
        }
    }

    assert_eq!(backend.calls.load(Ordering::SeqCst), RetroStyle::all().len());
    Ok(())
}

#[test]
fn original_is_exported_when_nothing_was_generated() -> Result<()> {
    let mut session = Session::new();
    session.select_style(RetroStyle::Crt);
    session.upload("image/png", build_checker_png(40, 30)?)?;
    session.apply_scale(0.5)?;

    let exported = session.export(42)?;
    assert_eq!(exported.file_name, "retro-lens-crt-42.png");
    assert_eq!((exported.width, exported.height), (20, 15));
    Ok(())
}

#[test]
fn oversized_upload_exports_at_the_cap_with_its_ratio() -> Result<()> {
    let mut source = Vec::new();
    DynamicImage::new_rgb8(5000, 1250).write_to(&mut std::io::Cursor::new(&mut source), ImageFormat::Png)?;

    let mut session = Session::new();
    session.select_style(RetroStyle::Nokia);
    session.upload("image/png", source)?;
    assert_eq!(session.dimensions().dimensions(), Dimensions::new(MAX_DIMENSION, 1024));
    assert_eq!(session.dimensions().original_aspect(), Some(4.0));

    session.set_height(2000.0);
    assert_eq!(session.dimensions().dimensions(), Dimensions::new(MAX_DIMENSION, 1024));

    let exported = session.export(7)?;
    let size = probe_dimensions(&exported.png)?;
    assert!(size.is_within_bounds());
    assert_eq!(size, Dimensions::new(MAX_DIMENSION, 1024));
    Ok(())
}

#[test]
fn snapshot_reports_editor_state_as_json() -> Result<()> {
    let mut session = Session::new();
    session.select_style(RetroStyle::Gameboy);
    session.upload("image/png", build_checker_png(30, 10)?)?;
    session.toggle_lock();
    session.set_height(50.0);

    let json = serde_json::to_value(session.snapshot())?;
    assert_eq!(json["style"], "GAMEBOY");
    assert_eq!(json["width"], 30);
    assert_eq!(json["height"], 50);
    assert_eq!(json["aspectLocked"], false);
    assert_eq!(json["hasSource"], true);
    assert_eq!(json["hasProcessed"], false);
    Ok(())
}
