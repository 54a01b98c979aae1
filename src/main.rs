//! reelplay CLI: requests a run of frames from a timeline and reports what was decoded.

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reelplay::cli::Args;
use reelplay::decode::{DecoderBackend, DecoderRegistry};
use reelplay::entities::TransitionKind;
use reelplay::{EngineConfig, Frame, Player, RationalTime, TimeRange, Timeline};

const FRAME_TIMEOUT: Duration = Duration::from_secs(30);

fn init_logging(args: &Args) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt.clone().unwrap_or_else(|| PathBuf::from("reelplay.log"));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn describe(frame: &Frame) -> String {
    if frame.is_empty() {
        return format!("{}: empty", frame.time);
    }
    let layers: Vec<String> = frame
        .layers
        .iter()
        .map(|layer| {
            let size = layer
                .image
                .as_ref()
                .or(layer.image_b.as_ref())
                .map(|img| format!("{}x{}", img.width, img.height))
                .unwrap_or_default();
            match layer.transition {
                TransitionKind::Dissolve => format!("{} dissolve {:.3}", size, layer.transition_value),
                TransitionKind::None => size,
            }
        })
        .collect();
    format!("{}: {} layer(s) [{}]", frame.time, frame.layers.len(), layers.join(", "))
}

fn probe_media(timeline: &Timeline, backend: &dyn DecoderBackend) -> Result<()> {
    for (path, usage) in timeline.media_usage() {
        match backend.probe(&path) {
            Ok(info) => {
                let video = info
                    .video
                    .map(|v| format!("{}x{} @ {} fps, {} frames", v.width, v.height, v.rate, v.range.duration.value))
                    .unwrap_or_else(|| "no video".into());
                let audio = info
                    .audio
                    .map(|a| format!("{} Hz x{}", a.sample_rate, a.channels))
                    .unwrap_or_else(|| "no audio".into());
                println!("{}: {}; {}; used in {} range(s)", path.display(), video, audio, usage.len());
            }
            Err(e) => println!("{}: {}", path.display(), e),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("reelplay {}", Args::backend_info().replace('\n', ", "));
    debug!("Command-line args: {:?}", args);

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };
    debug!("Engine config: {:?}", config);

    let timeline = Timeline::load(&args.timeline)
        .with_context(|| format!("Failed to load timeline: {}", args.timeline.display()))?;
    let backend = Arc::new(DecoderRegistry::with_defaults(&config));
    info!("Decoder backends: {:?}", backend.names());

    if args.probe {
        return probe_media(&timeline, backend.as_ref());
    }

    let rate = timeline.rate;
    let first = args
        .start
        .map(|f| RationalTime::new(f, rate))
        .unwrap_or_else(|| timeline.global_start_time());
    let step = args.step.max(1);
    let span = RationalTime::new((args.count * step) as f64, rate);
    let interval = RationalTime::new(step as f64, rate);

    let player = Player::new(timeline, backend, &config)?;
    player.set_active_ranges(vec![TimeRange::new(first, span)]);

    let started = Instant::now();
    let requests: Vec<_> = (0..args.count)
        .map(|i| {
            let time = first + RationalTime::new((i * step) as f64, rate);
            let frame = player.request_frame(time);
            let audio = args.audio.then(|| player.request_audio(TimeRange::new(time, interval)));
            (time, frame, audio)
        })
        .collect();

    let mut decoded = 0usize;
    for (time, mut frame, audio) in requests {
        match frame.wait_timeout(FRAME_TIMEOUT) {
            Ok(Some(frame)) => {
                if !frame.is_empty() {
                    decoded += 1;
                }
                println!("{}", describe(&frame));
            }
            Ok(None) => println!("{}: cancelled", time),
            Err(_) => {
                warn!("Frame {} not delivered within {:?}", time, FRAME_TIMEOUT);
                println!("{}: timed out", time);
            }
        }
        if let Some(mut audio) = audio {
            if let Ok(Some(audio)) = audio.wait_timeout(FRAME_TIMEOUT) {
                let samples: usize = audio.layers.iter().map(|l| l.audio.sample_count()).sum();
                println!("  audio: {} layer(s), {} samples", audio.layers.len(), samples);
            }
        }
    }

    let stats = player.stats();
    println!(
        "{} of {} frames decoded in {:.2?} ({} readers opened, {} live)",
        decoded,
        args.count,
        started.elapsed(),
        stats.readers_opened,
        stats.live_readers
    );
    info!("Player stats: {:?}", stats);
    Ok(())
}
