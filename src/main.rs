use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use iq_recorder::inspect::{self, Container};
use iq_recorder::{input, OutputType, RecorderConfig, Session, TerminateHandle};

/// Record I/Q sample streams to raw, Linrad and RIFF/RF64 files
#[derive(Parser, Debug)]
#[command(name = "iq-recorder")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record a stream
    Record(RecordArgs),

    /// Print sample count and I/Q ranges of a recording
    Inspect {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Tuners in a raw recording (headerless files only)
        #[arg(long, default_value = "1", value_parser = clap::value_parser!(u8).range(1..=2))]
        channels: u8,
    },

    /// Print the records of a gains file
    Gains {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// TOML config file; flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Streaming time in seconds (0 records until interrupted or end of input)
    #[arg(short = 'x', long = "time", value_name = "SECONDS")]
    streaming_time: Option<u32>,

    /// Store a time marker every N seconds (WAV only)
    #[arg(short, long, value_name = "SECONDS")]
    marker_interval: Option<u32>,

    /// Output filename template; '-' for stdout, '|name' for a named pipe
    #[arg(short, long, value_name = "TEMPLATE")]
    output: Option<String>,

    /// Largest sample gap filled with zeros
    #[arg(short, long, value_name = "SAMPLES")]
    zero_fill: Option<u32>,

    /// Blocks buffer capacity
    #[arg(short = 'j', long, value_name = "BLOCKS")]
    blocks: Option<usize>,

    /// Samples buffer capacity, in 16-bit values
    #[arg(short = 'k', long, value_name = "SHORTS")]
    samples: Option<usize>,

    /// Raw output (no header)
    #[arg(short = 'R', long, conflicts_with_all = ["linrad", "wav"])]
    raw: bool,

    /// Linrad output
    #[arg(short = 'L', long, conflicts_with = "wav")]
    linrad: bool,

    /// WAV output (RF64 when needed)
    #[arg(short = 'W', long)]
    wav: bool,

    /// Write gain changes next to the output file
    #[arg(short = 'G', long)]
    gains_file: bool,

    /// Center frequency in Hz; 'A,B' sets both tuners
    #[arg(short, long, value_name = "HZ[,HZ]")]
    frequency: Option<String>,

    /// Device sample rate in Hz
    #[arg(short = 'r', long, value_name = "HZ")]
    sample_rate: Option<f64>,

    /// Device decimation
    #[arg(short, long)]
    decimation: Option<u32>,

    /// Record both tuners
    #[arg(long)]
    dual_tuner: bool,

    /// Internal decimation of the device in dual tuner mode (1-4)
    #[arg(long, value_name = "FACTOR")]
    internal_decimation: Option<u32>,

    /// Replay a raw recording instead of generating a test signal
    #[arg(long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Samples per device callback
    #[arg(long, value_name = "SAMPLES")]
    block_size: Option<u32>,

    /// Deliver samples as fast as possible instead of at the sample rate
    #[arg(long)]
    no_realtime: bool,
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("iq_recorder=debug")
        } else {
            EnvFilter::new("iq_recorder=info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn parse_frequencies(value: &str) -> anyhow::Result<(f64, Option<f64>)> {
    let mut parts = value.split(',');
    let parse = |s: &str| s.trim().parse::<f64>().with_context(|| format!("invalid frequency '{s}'"));
    let a = parse(parts.next().unwrap_or_default())?;
    let b = parts.next().map(parse).transpose()?;
    if parts.next().is_some() {
        bail!("at most two frequencies may be given");
    }
    Ok((a, b))
}

fn build_config(args: &RecordArgs) -> anyhow::Result<RecorderConfig> {
    let mut config = match &args.config {
        Some(path) => RecorderConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => RecorderConfig::default(),
    };

    if let Some(v) = args.streaming_time {
        config.stream.streaming_time_secs = v;
    }
    if let Some(v) = args.marker_interval {
        config.stream.marker_interval_secs = v;
    }
    if let Some(v) = args.zero_fill {
        config.stream.zero_fill_max_samples = v;
    }
    if args.dual_tuner {
        config.stream.dual_tuner = true;
    }
    if let Some(v) = args.internal_decimation {
        config.stream.internal_decimation = v;
    }
    if let Some(v) = args.blocks {
        config.buffers.blocks = v;
    }
    if let Some(v) = args.samples {
        config.buffers.samples = v;
    }

    if args.raw {
        config.output.output_type = OutputType::Raw;
    } else if args.linrad {
        config.output.output_type = OutputType::Linrad;
    } else if args.wav {
        config.output.output_type = OutputType::Wav;
    }
    if let Some(v) = &args.output {
        config.output.filename = Some(v.clone());
    }
    if args.gains_file {
        config.output.gains_file = true;
    }

    if let Some(v) = &args.frequency {
        let (a, b) = parse_frequencies(v)?;
        config.source.frequency_a = a;
        config.source.frequency_b = b;
    }
    if let Some(v) = args.sample_rate {
        config.source.sample_rate = v;
    }
    if let Some(v) = args.decimation {
        config.source.decimation = v;
    }
    if let Some(v) = &args.input {
        config.source.input = Some(v.clone());
    }
    if let Some(v) = args.block_size {
        config.source.block_size = v;
    }
    if args.no_realtime {
        config.source.realtime = false;
    }

    config.validate()?;
    Ok(config)
}

/// Blocks SIGINT and SIGTERM in every thread and turns them into a
/// terminate request from a dedicated thread. Must run before any other
/// thread is spawned so the mask is inherited.
#[cfg(unix)]
fn install_signal_handler(handle: TerminateHandle) -> anyhow::Result<()> {
    use nix::sys::signal::{SigSet, Signal};

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().context("blocking signals")?;

    std::thread::Builder::new()
        .name("signal-wait".to_string())
        .spawn(move || loop {
            match mask.wait() {
                Ok(signal) => {
                    info!(?signal, "terminate requested");
                    handle.terminate();
                }
                Err(e) => {
                    warn!("waiting for signals failed: {e}");
                    return;
                }
            }
        })
        .context("spawning signal thread")?;
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handler(_handle: TerminateHandle) -> anyhow::Result<()> {
    Ok(())
}

fn record(args: &RecordArgs) -> anyhow::Result<()> {
    let config = build_config(args)?;
    let source = input::from_config(&config)?;
    let session = Session::new(config)?;
    install_signal_handler(session.terminate_handle())?;

    let report = session.run(source)?;
    if let Some(path) = &report.output {
        info!(path = %path.display(), "recording complete");
    }
    Ok(())
}

fn print_recording(file: &Path, channels: u8) -> anyhow::Result<()> {
    let summary = inspect::inspect_recording(file, usize::from(channels))
        .with_context(|| format!("inspecting {}", file.display()))?;
    let container = match summary.container {
        Container::Raw => "raw",
        Container::Linrad => "Linrad",
        Container::Wav => "WAV",
        Container::Rf64 => "RF64",
    };
    println!("container = {container}");
    if let Some(rate) = summary.sample_rate {
        println!("sample rate = {rate}");
    }
    println!("tuners = {}", summary.tuners);
    println!("samples = {}", summary.frames);
    for (levels, name) in summary.levels.iter().zip(["A", "B"]) {
        if summary.frames == 0 {
            break;
        }
        println!("tuner {name} I range = [{},{}]", levels.imin, levels.imax);
        println!("tuner {name} Q range = [{},{}]", levels.qmin, levels.qmax);
    }
    Ok(())
}

fn print_gains(file: &Path) -> anyhow::Result<()> {
    let records = inspect::read_gains(file).with_context(|| format!("reading {}", file.display()))?;
    for record in &records {
        println!(
            "sample={} tuner={} gain={:.2} gr={} lna_gr={}",
            record.sample_num, record.tuner, record.current_gain, record.gain_reduction_db, record.lna_gain_reduction_db
        );
    }
    println!("{} gain changes", records.len());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Record(args) => record(args),
        Commands::Inspect { file, channels } => print_recording(file, *channels),
        Commands::Gains { file } => print_gains(file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frequencies() {
        assert_eq!(parse_frequencies("14074000").unwrap(), (14_074_000.0, None));
        assert_eq!(parse_frequencies("7e6, 14e6").unwrap(), (7e6, Some(14e6)));
        assert!(parse_frequencies("1,2,3").is_err());
        assert!(parse_frequencies("abc").is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from(["iq-recorder", "record", "-W", "-x", "5", "-m", "1", "-f", "7e6,8e6", "--dual-tuner"]);
        let Commands::Record(args) = cli.command else {
            panic!("expected record");
        };
        let config = build_config(&args).unwrap();
        assert_eq!(config.output.output_type, OutputType::Wav);
        assert_eq!(config.stream.streaming_time_secs, 5);
        assert_eq!(config.stream.marker_interval_secs, 1);
        assert_eq!(config.source.frequency_b(), 8e6);
        assert!(config.stream.dual_tuner);
    }

    #[test]
    fn test_container_flags_exclusive() {
        assert!(Cli::try_parse_from(["iq-recorder", "record", "-R", "-W"]).is_err());
    }
}
