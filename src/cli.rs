use clap::Parser;
use std::path::PathBuf;

#[cfg(feature = "ffmpeg")]
const VIDEO_BACKEND: &str = "playa-ffmpeg 8.0 (static)";
#[cfg(not(feature = "ffmpeg"))]
const VIDEO_BACKEND: &str = "none (image sequences only)";

/// Timeline playback engine: decodes composited frames of an editorial timeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Timeline JSON document
    #[arg(value_name = "TIMELINE")]
    pub timeline: PathBuf,

    /// Engine configuration JSON (REELPLAY_* environment variables still apply)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// First frame to request, in timeline frames (default: timeline start)
    #[arg(long = "start", value_name = "N")]
    pub start: Option<f64>,

    /// Number of frames to request
    #[arg(short = 'n', long = "count", value_name = "N", default_value_t = 48)]
    pub count: usize,

    /// Frame step between requests
    #[arg(long = "step", value_name = "N", default_value_t = 1)]
    pub step: usize,

    /// Also request audio for every frame interval
    #[arg(short = 'a', long = "audio")]
    pub audio: bool,

    /// Print probe results for every media file and exit
    #[arg(long = "probe")]
    pub probe: bool,

    /// Enable debug logging to file (default: reelplay.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

impl Args {
    pub fn backend_info() -> String {
        format!(
            "{}\nVideo:  {}\nTarget: {}-{}",
            env!("CARGO_PKG_VERSION"),
            VIDEO_BACKEND,
            std::env::consts::ARCH,
            std::env::consts::OS
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let args = Args::try_parse_from(["reelplay", "cut.json"]).unwrap();
        assert_eq!(args.timeline, PathBuf::from("cut.json"));
        assert_eq!(args.count, 48);
        assert_eq!(args.step, 1);
        assert!(args.log_file.is_none());
    }

    #[test]
    fn test_parse_flags() {
        let args =
            Args::try_parse_from(["reelplay", "cut.json", "--start", "90", "-n", "10", "-vv", "-l", "-a"]).unwrap();
        assert_eq!(args.start, Some(90.0));
        assert_eq!(args.count, 10);
        assert_eq!(args.verbosity, 2);
        assert_eq!(args.log_file, Some(None));
        assert!(args.audio);
        assert!(Args::try_parse_from(["reelplay"]).is_err());
    }
}
