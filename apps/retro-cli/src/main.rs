use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use retro_core::{resolve_runtime_config, RetroStyle, RuntimeConfig, TransformBackend, STYLES};
use retro_image::{
    estimate_rgba_bytes, export_file_name, mime_type_for_path, probe_dimensions, sniff_mime_type, ExportedImage,
};
use retro_remote::GeminiBackend;
use retro_session::{GenerationOutcome, Session};
use retro_telemetry::sink_from_env;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "retro-lens", version, about = "Retro-style image transforms with sized PNG export")]
struct Cli {
    #[command(subcommand)]
    command: TopLevelCommand,
}

#[derive(Subcommand, Debug)]
enum TopLevelCommand {
    /// List the available styles.
    Styles,
    /// Print size and type information for an image.
    Inspect(InspectArgs),
    /// Resize and export an image locally, without the remote model.
    Render(RenderArgs),
    /// Send images to the remote model and export the results.
    Transform(TransformArgs),
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[arg(long, short = 'i')]
    input: PathBuf,
}

#[derive(Args, Debug)]
struct SizingArgs {
    #[arg(long, short = 's', default_value = "nokia")]
    style: String,
    /// Output width in pixels; with the aspect lock on, height follows.
    #[arg(long, short = 'W')]
    width: Option<f64>,
    /// Output height in pixels; with the aspect lock on, width follows.
    #[arg(long, short = 'H')]
    height: Option<f64>,
    /// Scale factor applied after width/height (presets: 0.25, 0.5, 1, 2).
    #[arg(long, short = 'x')]
    scale: Option<f64>,
    /// Turn the aspect-ratio lock off before applying sizes.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    unlock: bool,
    /// Defaults to the user's download directory.
    #[arg(long, short = 'o')]
    output_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[arg(long, short = 'i')]
    input: PathBuf,
    #[command(flatten)]
    sizing: SizingArgs,
}

#[derive(Args, Debug)]
struct TransformArgs {
    /// An image file, or a directory of images.
    #[arg(long, short = 'i')]
    input: PathBuf,
    /// Recurse when the input is a directory.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    recursive: bool,
    /// If set, abort the whole run on the first input error.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    strict: bool,
    /// Export the original image when the remote transform fails.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    keep_original_on_error: bool,
    #[command(flatten)]
    sizing: SizingArgs,
    #[arg(long, short = 'm', env = "RETRO_LENS_MODEL", default_value = "")]
    model: String,
    #[arg(long, env = "RETRO_LENS_API_BASE", default_value = "")]
    api_base: String,
    #[arg(long, default_value = "")]
    api_key_env: String,
    #[arg(long, default_value_t = 0)]
    timeout_secs: u64,
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    profile: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        TopLevelCommand::Styles => {
            println!("{}", serde_json::to_string_pretty(&STYLES)?);
        }
        TopLevelCommand::Inspect(args) => {
            let bytes = std::fs::read(&args.input).with_context(|| format!("failed to read {}", args.input.display()))?;
            let size = probe_dimensions(&bytes)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "input": args.input,
                    "mimeType": detect_mime_type(&args.input, &bytes),
                    "width": size.width,
                    "height": size.height,
                    "aspectRatio": size.width as f64 / size.height.max(1) as f64,
                    "decodedBytes": estimate_rgba_bytes(size),
                    "fileBytes": bytes.len(),
                }))?
            );
        }
        TopLevelCommand::Render(args) => {
            let style = parse_style(&args.sizing.style)?;
            let output_dir = resolve_output_dir(args.sizing.output_dir.clone())?;
            let mut session = Session::new().with_telemetry(sink_from_env());
            session.select_style(style);
            load_input(&mut session, &args.input)?;
            apply_sizing(&mut session, &args.sizing)?;
            let mut exported = session.export_now()?;
            let path = write_export(&output_dir, &mut exported)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "input": args.input,
                    "output": path,
                    "export": exported,
                }))?
            );
        }
        TopLevelCommand::Transform(args) => run_transform_command(args)?,
    }

    Ok(())
}

fn run_transform_command(args: TransformArgs) -> Result<()> {
    let total_start = Instant::now();
    let style = parse_style(&args.sizing.style)?;
    let inputs = resolve_inputs(&args.input, args.recursive)?;
    if inputs.is_empty() {
        return Err(anyhow!("no input images matched"));
    }
    let output_dir = resolve_output_dir(args.sizing.output_dir.clone())?;
    let runtime_cfg = resolve_runtime_config(RuntimeConfig {
        model: args.model.clone(),
        api_base: args.api_base.clone(),
        api_key_env: args.api_key_env.clone(),
        timeout_secs: args.timeout_secs,
    });
    let backend = GeminiBackend::from_env(&runtime_cfg)?;
    log::debug!("using {}", backend.endpoint());

    let bulk_mode = inputs.len() > 1;
    let mut results = Vec::with_capacity(inputs.len());
    let mut total_remote_ms: u128 = 0;

    for input_path in inputs {
        let mut session = Session::new().with_telemetry(sink_from_env());
        session.select_style(style);
        match transform_one(
            &mut session,
            &backend,
            &input_path,
            &args.sizing,
            &output_dir,
            args.keep_original_on_error,
        ) {
            Ok(report) => {
                total_remote_ms += report.remote_ms;
                results.push(serde_json::json!({
                    "input": input_path,
                    "output": report.output,
                    "export": report.exported,
                    "transformed": report.transformed,
                    "warning": report.warning,
                    "timingsMs": if args.profile { Some(serde_json::json!({ "remote": report.remote_ms })) } else { None },
                }));
            }
            Err(err) => {
                if bulk_mode && !args.strict {
                    results.push(serde_json::json!({
                        "input": input_path,
                        "error": format!("{:#}", err),
                    }));
                    continue;
                }
                return Err(err.context(format!("failed to transform {}", input_path.display())));
            }
        }
    }

    let timings = serde_json::json!({
        "remote": total_remote_ms,
        "files": results.len(),
        "total": total_start.elapsed().as_millis(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "model": runtime_cfg.model,
            "style": style,
            "results": results,
            "timingsMs": if args.profile { Some(timings) } else { None }
        }))?
    );
    Ok(())
}

struct TransformReport {
    output: PathBuf,
    exported: ExportedImage,
    transformed: bool,
    warning: Option<String>,
    remote_ms: u128,
}

fn transform_one(
    session: &mut Session,
    backend: &dyn TransformBackend,
    input_path: &Path,
    sizing: &SizingArgs,
    output_dir: &Path,
    keep_original_on_error: bool,
) -> Result<TransformReport> {
    load_input(session, input_path)?;
    let remote_start = Instant::now();
    let outcome = session.generate(backend)?;
    let remote_ms = remote_start.elapsed().as_millis();
    let warning = match outcome {
        GenerationOutcome::Applied => None,
        GenerationOutcome::Failed(err) => {
            let message = session.error().unwrap_or("transform failed").to_string();
            if !keep_original_on_error {
                return Err(anyhow::Error::new(err).context(message));
            }
            log::warn!("{}: {}; exporting the original", input_path.display(), err);
            session.clear_error();
            Some(message)
        }
        GenerationOutcome::Discarded => return Err(anyhow!("generation result was superseded")),
    };
    apply_sizing(session, sizing)?;
    let mut exported = session.export_now()?;
    let output = write_export(output_dir, &mut exported)?;
    Ok(TransformReport {
        output,
        exported,
        transformed: warning.is_none(),
        warning,
        remote_ms,
    })
}

fn load_input(session: &mut Session, input_path: &Path) -> Result<()> {
    let bytes = std::fs::read(input_path);
    let mime_type = mime_type_for_path(input_path)
        .or_else(|| bytes.as_deref().ok().and_then(sniff_mime_type))
        .unwrap_or("application/octet-stream");
    let ticket = session.begin_upload(mime_type)?;
    session
        .complete_upload(ticket, bytes)
        .with_context(|| format!("failed to load {}", input_path.display()))?;
    Ok(())
}

fn apply_sizing(session: &mut Session, sizing: &SizingArgs) -> Result<()> {
    if sizing.unlock {
        session.toggle_lock();
    }
    if let Some(width) = sizing.width {
        session.set_width(width);
    }
    if let Some(height) = sizing.height {
        session.set_height(height);
    }
    if let Some(scale) = sizing.scale {
        session.apply_scale(scale)?;
    }
    Ok(())
}

fn detect_mime_type(path: &Path, bytes: &[u8]) -> Option<&'static str> {
    mime_type_for_path(path).or_else(|| sniff_mime_type(bytes))
}

fn resolve_inputs(input: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    if !input.exists() {
        return Err(anyhow!("input not found: {}", input.display()));
    }
    if !input.is_dir() {
        return Ok(vec![input.to_path_buf()]);
    }
    let walker = if recursive {
        WalkDir::new(input)
    } else {
        WalkDir::new(input).max_depth(1)
    };
    let mut out: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| mime_type_for_path(path).is_some())
        .collect();
    out.sort();
    Ok(out)
}

fn resolve_output_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    match dirs::download_dir() {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("resolving current directory"),
    }
}

/// Writes the PNG, moving the export's timestamp (and file name) forward while
/// a file with that name already exists.
fn write_export(output_dir: &Path, exported: &mut ExportedImage) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir).with_context(|| format!("creating {}", output_dir.display()))?;
    let mut path = output_dir.join(&exported.file_name);
    while path.exists() {
        exported.timestamp_ms += 1;
        exported.file_name = export_file_name(exported.style, exported.timestamp_ms);
        path = output_dir.join(&exported.file_name);
    }
    std::fs::write(&path, &exported.png).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn parse_style(raw: &str) -> Result<RetroStyle> {
    RetroStyle::from_id(raw).ok_or_else(|| {
        anyhow!(
            "unknown style '{}'; expected one of: {}",
            raw,
            RetroStyle::all().map(|s| s.file_label()).join(", ")
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_aliases_parse() {
        assert_eq!(parse_style("gameboy").expect("style"), RetroStyle::Gameboy);
        assert_eq!(parse_style("bw-ccd").expect("style"), RetroStyle::BwCcd);
        let err = parse_style("sepia").expect_err("unknown style");
        assert!(err.to_string().contains("nokia, bw_ccd, gameboy, crt"));
    }

    #[test]
    fn directory_inputs_keep_only_images_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("nested")).expect("nested dir");
        for name in ["b.png", "a.JPG", "notes.txt", "nested/c.webp"] {
            std::fs::write(dir.path().join(name), b"x").expect("write file");
        }
        let flat = resolve_inputs(dir.path(), false).expect("flat");
        let names: Vec<_> = flat
            .iter()
            .map(|p| p.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string())
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.png"]);
        assert_eq!(resolve_inputs(dir.path(), true).expect("recursive").len(), 3);
    }

    #[test]
    fn colliding_export_names_are_bumped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exported = ExportedImage {
            file_name: "retro-lens-crt-1.png".to_string(),
            png: vec![1, 2, 3],
            width: 1,
            height: 1,
            style: RetroStyle::Crt,
            timestamp_ms: 1,
        };
        let mut first = exported.clone();
        let mut second = exported.clone();
        let mut third = exported;
        let first_path = write_export(dir.path(), &mut first).expect("first write");
        let second_path = write_export(dir.path(), &mut second).expect("second write");
        let third_path = write_export(dir.path(), &mut third).expect("third write");
        assert_eq!(first_path, dir.path().join("retro-lens-crt-1.png"));
        assert_eq!(first.file_name, "retro-lens-crt-1.png");
        assert_eq!(second_path, dir.path().join("retro-lens-crt-2.png"));
        assert_eq!((second.file_name.as_str(), second.timestamp_ms), ("retro-lens-crt-2.png", 2));
        assert_eq!(third.file_name, "retro-lens-crt-3.png");
        assert!(third_path.exists());

        let report = serde_json::to_value(&second).expect("serialize export");
        assert_eq!(report["fileName"], "retro-lens-crt-2.png");
    }

    struct FailingBackend;

    impl TransformBackend for FailingBackend {
        fn generate(&self, _request: &retro_core::TransformRequest) -> Result<retro_core::ImagePayload, retro_core::CoreError> {
            Err(retro_core::CoreError::Remote {
                status: 503,
                message: "UNAVAILABLE".to_string(),
            })
        }
    }

    fn write_sample_png(path: &Path, width: u32, height: u32) {
        image::DynamicImage::new_rgb8(width, height)
            .save_with_format(path, image::ImageFormat::Png)
            .expect("write sample png");
    }

    fn crt_sizing(output_dir: &Path) -> SizingArgs {
        SizingArgs {
            style: "crt".to_string(),
            width: None,
            height: None,
            scale: Some(0.5),
            unlock: false,
            output_dir: Some(output_dir.to_path_buf()),
        }
    }

    #[test]
    fn failed_transform_errors_unless_keeping_original() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("photo.png");
        write_sample_png(&input, 40, 20);
        let out_dir = dir.path().join("out");
        let sizing = crt_sizing(&out_dir);

        let mut session = Session::new();
        session.select_style(RetroStyle::Crt);
        let err = transform_one(&mut session, &FailingBackend, &input, &sizing, &out_dir, false)
            .err()
            .expect("remote failure");
        assert!(format!("{:#}", err).contains("UNAVAILABLE"));
        assert!(!out_dir.exists());

        let mut session = Session::new();
        session.select_style(RetroStyle::Crt);
        let report = transform_one(&mut session, &FailingBackend, &input, &sizing, &out_dir, true)
            .expect("original kept");
        assert!(!report.transformed);
        assert!(report.warning.is_some());
        assert_eq!((report.exported.width, report.exported.height), (20, 10));
        assert!(report.output.exists());
    }

    #[test]
    fn unknown_extension_is_sniffed_from_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("upload.bin");
        write_sample_png(&input, 12, 6);
        let mut session = Session::new();
        load_input(&mut session, &input).expect("load");
        assert_eq!(session.source().map(|s| s.mime_type.as_str()), Some("image/png"));
        assert_eq!(session.dimensions().width(), 12);

        let missing = dir.path().join("missing.bin");
        assert!(load_input(&mut Session::new(), &missing).is_err());
    }

    #[test]
    fn sizing_flags_follow_ui_order() {
        let mut session = Session::new();
        let sizing = SizingArgs {
            style: "crt".to_string(),
            width: Some(400.0),
            height: None,
            scale: Some(0.5),
            unlock: false,
            output_dir: None,
        };
        let mut png = Vec::new();
        image::DynamicImage::new_rgb8(800, 600)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .expect("png");
        session.upload("image/png", png).expect("upload");
        apply_sizing(&mut session, &sizing).expect("sizing");
        assert_eq!(session.dimensions().width(), 200);
        assert_eq!(session.dimensions().height(), 150);
    }
}
