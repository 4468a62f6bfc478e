//! CLI entry point: parses options, opens the capture, and drives the
//! orchestrator. Out of scope for this crate's core contract (spec.md §1),
//! but specified in full by SPEC_FULL.md §6 as the ambient outer surface.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use rtspcap::capture::Capture;
use rtspcap::orchestrator::{self, Config, Orchestrator};

/// RTSP/RTP stream reconstructor: pulls media streams out of a packet
/// capture containing RTSP signaling and RTP.
#[derive(Parser)]
#[command(name = "rtspcap", version, about)]
struct Cli {
    /// Path to the capture file (pcap or pcapng) with RTSP and RTP data.
    input: PathBuf,

    /// Prefix for the name of generated files: `<prefix><n>.<format>`.
    #[arg(short, long, default_value = "stream")]
    prefix: String,

    /// Output directory. Defaults to the capture file's basename.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Use codec-internal threading to speed up decode/encode.
    #[arg(long)]
    fast: bool,

    /// Enable debug-level logging.
    #[arg(short, long)]
    verbose: bool,

    /// Output container format (see `ffmpeg -formats`).
    #[arg(short, long, default_value = "mp4")]
    format: String,

    /// Default video codec to fall back on if native re-encoding fails.
    #[arg(long = "default-vcodec", default_value = "h264")]
    default_vcodec: String,

    /// Default audio codec to fall back on if native re-encoding fails.
    #[arg(long = "default-acodec", default_value = "aac")]
    default_acodec: String,

    /// Always use the default video codec, never the native one.
    #[arg(long = "force-vcodec")]
    force_vcodec: bool,

    /// Always use the default audio codec, never the native one.
    #[arg(long = "force-acodec")]
    force_acodec: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let output_dir = cli
        .output_dir
        .unwrap_or_else(|| orchestrator::default_output_dir(&cli.input));

    let config = Config {
        output_dir,
        prefix: cli.prefix,
        format: cli.format,
        default_video_codec: cli.default_vcodec,
        default_audio_codec: cli.default_acodec,
        force_vcodec: cli.force_vcodec,
        force_acodec: cli.force_acodec,
        fast: cli.fast,
    };
    let mut orchestrator = Orchestrator::new(config)?;

    let capture = Capture::open(&cli.input)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", cli.input.display(), e))?;
    orchestrator.run(&capture)?;
    Ok(())
}
