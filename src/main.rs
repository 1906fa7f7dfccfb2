use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use dialoguer::{Confirm, Input, Select};
use image::Rgb;
use nalgebra::Point2;

use dart_sentinel::calibrate::CalibrationEngine;
use dart_sentinel::capture::{FrameSource, ImageSequenceSource};
use dart_sentinel::checkerboard::PatternSize;
use dart_sentinel::classifier::{self, classify_file};
use dart_sentinel::classifier_http::HttpPresenceClassifier;
use dart_sentinel::config::DEFAULT_SETTINGS_FILE;
use dart_sentinel::engine::{ChangeDetectionEngine, EngineEvent, SaveChoice, SaveConfirmer};
use dart_sentinel::perimeter::{crop_to_perimeter, detect_outer_boundary, draw_perimeter};
use dart_sentinel::rectify::{CanonicalSquare, Rectifier};
use dart_sentinel::scoring::{render_overlay, sector_and_multiplier};
use dart_sentinel::store::{CalibrationStore, JsonCalibrationStore};

const CATEGORIES: [&str; 3] = ["1Dart", "2Darts", "3Darts"];
const PERIMETER_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

fn cli() -> Command {
    Command::new("dart-sentinel")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Dartboard camera calibration and dart change detection")
        .subcommand_required(true)
        .arg(
            Arg::new("settings")
                .long("settings")
                .value_name("PATH")
                .help("Settings document")
                .default_value(DEFAULT_SETTINGS_FILE)
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Debug logging (RUST_LOG overrides)")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("calibrate")
                .about("Solve lens intrinsics and distortion from checkerboard photos")
                .arg(Arg::new("images").long("images").value_name("DIR").required(true))
                .arg(
                    Arg::new("rows")
                        .long("rows")
                        .help("Interior corner rows")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("7"),
                )
                .arg(
                    Arg::new("cols")
                        .long("cols")
                        .help("Interior corner columns")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("10"),
                )
                .arg(
                    Arg::new("camera")
                        .long("camera")
                        .value_name("NAME")
                        .help("Store as a per-camera override instead of the global calibration"),
                ),
        )
        .subcommand(
            Command::new("points")
                .about("Store a camera's four source points, clockwise from top-left")
                .arg(Arg::new("camera").long("camera").value_name("NAME").required(true))
                .arg(point_args().num_args(4)),
        )
        .subcommand(
            Command::new("reference")
                .about("Store the canonical destination square")
                .arg(
                    Arg::new("square")
                        .long("square")
                        .help("Two points (top-left, opposite corner) expanded to a square")
                        .action(ArgAction::SetTrue),
                )
                .arg(point_args().num_args(2..=4)),
        )
        .subcommand(Command::new("clear-points").about("Forget every source point and the canonical square"))
        .subcommand(
            Command::new("rectify")
                .about("Undistort and warp a still frame into canonical space")
                .allow_negative_numbers(true)
                .arg(Arg::new("camera").long("camera").value_name("NAME").required(true))
                .arg(Arg::new("input").long("input").value_name("IMG").required(true))
                .arg(Arg::new("output").long("output").value_name("IMG").required(true))
                .arg(
                    Arg::new("overlay")
                        .long("overlay")
                        .help("Draw sector lines, numbers and the detected perimeter")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("crop")
                        .long("crop")
                        .help("Crop to the detected perimeter")
                        .action(ArgAction::SetTrue),
                )
                .arg(offset_arg("offset-x"))
                .arg(offset_arg("offset-y")),
        )
        .subcommand(
            Command::new("score")
                .about("Sector and multiplier of a canonical point")
                .allow_negative_numbers(true)
                .arg(Arg::new("x").required(true).value_parser(clap::value_parser!(f64)))
                .arg(Arg::new("y").required(true).value_parser(clap::value_parser!(f64)))
                .arg(
                    Arg::new("size")
                        .long("size")
                        .help("Board size in pixels (defaults to PolarGraphBaseSize)")
                        .value_parser(clap::value_parser!(u32)),
                ),
        )
        .subcommand(
            Command::new("watch")
                .about("Run change detection over replayed frame directories")
                .arg(
                    Arg::new("source")
                        .long("source")
                        .value_name("NAME=DIR")
                        .required(true)
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("cycles")
                        .long("cycles")
                        .help("Stop after this many cycles instead of waiting for Ctrl+C")
                        .value_parser(clap::value_parser!(u32)),
                ),
        )
        .subcommand(
            Command::new("classify")
                .about("Ask the presence classifier about one image")
                .arg(Arg::new("image").long("image").value_name("IMG").required(true))
                .arg(
                    Arg::new("endpoint")
                        .long("endpoint")
                        .value_name("URL")
                        .help("Overrides Classifier.Endpoint"),
                ),
        )
}

fn point_args() -> Arg {
    Arg::new("points")
        .value_name("X,Y")
        .required(true)
        .value_parser(parse_point)
}

fn offset_arg(name: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_parser(clap::value_parser!(i32))
        .default_value("0")
}

fn parse_point(s: &str) -> std::result::Result<Point2<f64>, String> {
    let (x, y) = s.split_once(',').ok_or_else(|| format!("expected X,Y, got '{s}'"))?;
    let x: f64 = x.trim().parse().map_err(|e| format!("bad X in '{s}': {e}"))?;
    let y: f64 = y.trim().parse().map_err(|e| format!("bad Y in '{s}': {e}"))?;
    Ok(Point2::new(x, y))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let default_filter = if matches.get_flag("verbose") { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let settings_path = PathBuf::from(
        matches
            .get_one::<String>("settings")
            .map(String::as_str)
            .unwrap_or(DEFAULT_SETTINGS_FILE),
    );
    let store = Arc::new(
        JsonCalibrationStore::open(&settings_path)
            .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?,
    );

    match matches.subcommand() {
        Some(("calibrate", sub)) => calibrate(store, sub),
        Some(("points", sub)) => {
            let camera = required(sub, "camera")?;
            let corners = CanonicalSquare::from_picks(&points(sub), false)?.corners();
            store.save_source_points(camera, &corners)?;
            println!("Stored source points for {camera}: {}", format_points(&corners));
            Ok(())
        }
        Some(("reference", sub)) => {
            let corners = CanonicalSquare::from_picks(&points(sub), sub.get_flag("square"))?.corners();
            store.save_canonical_points(&corners)?;
            println!("Stored canonical square: {}", format_points(&corners));
            Ok(())
        }
        Some(("clear-points", _)) => {
            store.clear_points()?;
            println!("Cleared all correspondence points");
            Ok(())
        }
        Some(("rectify", sub)) => rectify(store.as_ref(), sub),
        Some(("score", sub)) => {
            let x = *sub.get_one::<f64>("x").context("missing x")?;
            let y = *sub.get_one::<f64>("y").context("missing y")?;
            let size = sub.get_one::<u32>("size").copied().unwrap_or_else(|| store.canvas_size());
            let score = sector_and_multiplier(Point2::new(x, y), size);
            println!("({x}, {y}) on a {size}px board: {score}");
            Ok(())
        }
        Some(("watch", sub)) => watch(store, sub).await,
        Some(("classify", sub)) => {
            let image = PathBuf::from(required(sub, "image")?);
            let mut settings = store.snapshot().classifier;
            if let Some(endpoint) = sub.get_one::<String>("endpoint") {
                settings.endpoint = Some(endpoint.clone());
            }
            let endpoint = settings
                .endpoint
                .clone()
                .context("No classifier endpoint configured (Classifier.Endpoint or --endpoint)")?;
            let classifier = HttpPresenceClassifier::new(&endpoint, settings.timeout_secs, settings.max_retries)?;
            let presence = classify_file(&classifier, &image).await?;
            println!("{}: {presence}", image.display());
            Ok(())
        }
        _ => Err(anyhow!("unknown command")),
    }
}

fn required<'a>(sub: &'a ArgMatches, name: &str) -> Result<&'a str> {
    sub.get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("missing --{name}"))
}

fn points(sub: &ArgMatches) -> Vec<Point2<f64>> {
    sub.get_many::<Point2<f64>>("points")
        .map(|v| v.copied().collect())
        .unwrap_or_default()
}

fn format_points(points: &[Point2<f64>]) -> String {
    points
        .iter()
        .map(|p| format!("({:.1}, {:.1})", p.x, p.y))
        .collect::<Vec<_>>()
        .join(" ")
}

fn calibrate(store: Arc<JsonCalibrationStore>, sub: &ArgMatches) -> Result<()> {
    let dir = Path::new(required(sub, "images")?);
    let rows = sub.get_one::<usize>("rows").copied().unwrap_or(7);
    let cols = sub.get_one::<usize>("cols").copied().unwrap_or(10);

    let mut engine = CalibrationEngine::new(store);
    if let Some(camera) = sub.get_one::<String>("camera") {
        engine = engine.for_camera(camera.clone());
    }
    let report = engine
        .calibrate(dir, PatternSize::new(rows, cols))
        .context("Calibration failed; add more checkerboard images and retry")?;

    let k = report.lens.intrinsics;
    println!("Image size: {}x{}", report.image_size.0, report.image_size.1);
    println!("Camera matrix:");
    for row in k.to_rows() {
        println!("  [{:>10.3} {:>10.3} {:>10.3}]", row[0], row[1], row[2]);
    }
    println!("Distortion: {:?}", report.lens.distortion.coefficients());
    println!("RMS reprojection error: {:.4}px", report.rms_error);
    for (path, err) in report.used_images.iter().zip(&report.per_view_errors) {
        println!("  {:<40} {err:.4}px", path.display());
    }
    for (path, reason) in &report.skipped_images {
        println!("  skipped {}: {reason}", path.display());
    }
    Ok(())
}

fn rectify(store: &JsonCalibrationStore, sub: &ArgMatches) -> Result<()> {
    let camera = required(sub, "camera")?;
    let input = required(sub, "input")?;
    let output = required(sub, "output")?;
    let offset = (
        sub.get_one::<i32>("offset-x").copied().unwrap_or(0),
        sub.get_one::<i32>("offset-y").copied().unwrap_or(0),
    );

    let profile = store.camera_profile(camera)?;
    let canonical = store.canonical_points()?;
    let rectifier = Rectifier::from_profile(&profile, canonical.as_ref(), store.canvas_size())?;
    let frame = image::open(input)
        .with_context(|| format!("Failed to read {input}"))?
        .to_rgb8();
    let mut out = rectifier.rectify(&frame)?;

    match detect_outer_boundary(&out) {
        Ok(ellipse) => {
            println!(
                "Perimeter: centre ({:.1}, {:.1}), axes ({:.1}, {:.1}), angle {:.1}°",
                ellipse.center.x,
                ellipse.center.y,
                ellipse.semi_axes.x,
                ellipse.semi_axes.y,
                ellipse.angle.to_degrees()
            );
            if sub.get_flag("overlay") {
                draw_perimeter(&mut out, &ellipse, PERIMETER_COLOR);
            }
            if sub.get_flag("crop") {
                out = crop_to_perimeter(&out, &ellipse);
            }
        }
        Err(e) => log::warn!("{e}; continuing without boundary"),
    }
    if sub.get_flag("overlay") {
        out = render_overlay(&out, offset);
    }
    out.save(output).with_context(|| format!("Failed to write {output}"))?;
    println!("Wrote {output}");
    Ok(())
}

/// Asks on the terminal whether to keep the current frames.
struct TerminalConfirmer;

impl SaveConfirmer for TerminalConfirmer {
    fn confirm(&self, overall: f64, suggested_category: &str) -> SaveChoice {
        let prompt = format!("All cameras detected a difference of {overall:.2}%. Save the current images?");
        match Confirm::new().with_prompt(prompt).default(true).interact() {
            Ok(true) => {}
            Ok(false) => return SaveChoice::Skip,
            Err(e) => {
                log::warn!("save prompt failed: {e}");
                return SaveChoice::Skip;
            }
        }
        let name = Input::<String>::new()
            .with_prompt("Image name")
            .default("throw".to_string())
            .interact_text()
            .unwrap_or_else(|_| "throw".to_string());
        let default = CATEGORIES.iter().position(|c| *c == suggested_category).unwrap_or(0);
        let idx = Select::new()
            .with_prompt("Category")
            .items(&CATEGORIES[..])
            .default(default)
            .interact()
            .unwrap_or(default);
        SaveChoice::Save {
            name,
            category: CATEGORIES[idx].to_string(),
        }
    }
}

async fn watch(store: Arc<JsonCalibrationStore>, sub: &ArgMatches) -> Result<()> {
    let (engine, mut events) = ChangeDetectionEngine::new(store.detection(), Arc::new(TerminalConfirmer));
    let mut engine = match classifier::from_settings(&store.snapshot().classifier)? {
        Some(c) => engine.with_classifier(Arc::new(c)),
        None => engine,
    };

    for source in sub.get_many::<String>("source").into_iter().flatten() {
        let (name, dir) = source
            .split_once('=')
            .with_context(|| format!("expected NAME=DIR, got '{source}'"))?;
        let source = ImageSequenceSource::open(name, Path::new(dir)).map(|s| Box::new(s) as Box<dyn FrameSource>);
        engine.admit(name, source, store.as_ref());
    }
    if engine.camera_labels().is_empty() {
        return Err(anyhow!("no usable camera among the given sources"));
    }

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    println!("Watching {} camera(s). Press Ctrl+C to stop.", engine.camera_labels().len());
    match sub.get_one::<u32>("cycles") {
        Some(&cycles) => {
            if let Err(e) = engine.set_baseline().await {
                log::warn!("initial baseline incomplete: {e}");
            }
            for _ in 0..cycles {
                engine.evaluate_cycle().await;
            }
        }
        None => {
            let stop = engine.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stop.stop();
                }
            });
            engine.run().await.context("Capture loop failed")?;
        }
    }

    drop(engine);
    printer.await.ok();
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::Sample { camera, difference } => log::debug!("{camera}: {difference:.2}%"),
        EngineEvent::Decision(decision) => println!("Decision: {decision}"),
        EngineEvent::BaselineUpdated { camera, kind, path } => match path {
            Some(p) => println!("{camera}: {kind:?} baseline -> {}", p.display()),
            None => println!("{camera}: {kind:?} baseline updated in memory only"),
        },
        EngineEvent::SaveCounter(n) => println!("Save counter: {n}"),
        EngineEvent::Saved { camera, path } => println!("{camera}: saved {}", path.display()),
        EngineEvent::Presence { camera, presence } => println!("{camera}: {presence}"),
        EngineEvent::CameraDropped { camera, reason } => println!("{camera} unavailable: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn parses_points() {
        assert_eq!(parse_point("12.5, -3").unwrap(), Point2::new(12.5, -3.0));
        assert!(parse_point("12.5").is_err());
        assert!(parse_point("a,b").is_err());
    }

    #[test]
    fn reference_accepts_two_point_square() {
        let m = cli()
            .try_get_matches_from(["dart-sentinel", "reference", "--square", "10,20", "110,60"])
            .unwrap();
        let (_, sub) = m.subcommand().unwrap();
        let corners = CanonicalSquare::from_picks(&points(sub), sub.get_flag("square"))
            .unwrap()
            .corners();
        assert_eq!(corners[2], Point2::new(110.0, 120.0));
    }

    #[test]
    fn rectify_accepts_negative_offsets() {
        let m = cli()
            .try_get_matches_from([
                "dart-sentinel", "rectify", "--camera", "Camera1", "--input", "a.png", "--output", "b.png",
                "--offset-x", "-4",
            ])
            .unwrap();
        let (_, sub) = m.subcommand().unwrap();
        assert_eq!(sub.get_one::<i32>("offset-x"), Some(&-4));
        assert_eq!(sub.get_one::<i32>("offset-y"), Some(&0));
    }
}
