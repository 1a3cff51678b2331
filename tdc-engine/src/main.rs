use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use ndarray::Array1;
use ndarray_npy::write_npy;
use tracing::info;

use tdc_engine::codec::{self, StreamHeader, StreamWriter};
use tdc_engine::headers::{DeviceClass, FeatureFlags, FileFormat};
use tdc_engine::simulation::{SimParams, SimType, SyntheticSource, TimestampGenerator};
use tdc_engine::source::EventSource;
use tdc_engine::tdc_tools::coincidence::{counter_label, COINC_COUNTERS};
use tdc_engine::{Engine, EngineConfig};

fn format_arg(matches: &ArgMatches, name: &str, default: FileFormat) -> Result<FileFormat> {
    match matches.value_of(name) {
        Some(s) => Ok(s.parse::<FileFormat>()?),
        None => Ok(default),
    }
}

fn number_arg<T: std::str::FromStr>(matches: &ArgMatches, name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match matches.value_of(name) {
        Some(s) => s
            .parse::<T>()
            .with_context(|| format!("invalid value {} for --{}", s, name)),
        None => Ok(default),
    }
}

fn convert(matches: &ArgMatches) -> Result<()> {
    let input = PathBuf::from(matches.value_of("INPUT").unwrap_or_default());
    let output = PathBuf::from(matches.value_of("OUTPUT").unwrap_or_default());
    let from = format_arg(matches, "from", FileFormat::None)?;
    let to = format_arg(matches, "to", FileFormat::Binary)?;

    let mut reader = codec::open(&input, from)
        .with_context(|| format!("could not open {}", input.display()))?;
    let header = match reader.header() {
        Some(header) => *header,
        None => StreamHeader::new(to, FeatureFlags::default(), DeviceClass::default()),
    };
    let writer = StreamWriter::create(&output, to, header)
        .with_context(|| format!("could not create {}", output.display()))?;

    let mut events = 0;
    while let Some(batch) = reader.next_batch() {
        events += batch.len();
        writer.submit_wait(Arc::new(batch));
    }
    let written = writer.stop();
    info!("converted {} events, {} records written", events, written);
    if reader.skipped_records() > 0 {
        eprintln!("{} records could not be decoded", reader.skipped_records());
    }
    Ok(())
}

fn export_npy<P: AsRef<Path>>(dir: &Path, name: P, array: &Array1<f64>) -> Result<()> {
    let path = dir.join(name);
    write_npy(&path, array).with_context(|| format!("could not write {}", path.display()))
}

fn replay(matches: &ArgMatches) -> Result<()> {
    let input = PathBuf::from(matches.value_of("INPUT").unwrap_or_default());
    let hint = format_arg(matches, "format", FileFormat::None)?;
    let out_dir = PathBuf::from(matches.value_of("out-dir").unwrap_or("."));

    let config: EngineConfig = match matches.value_of("config") {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("could not read {}", path))?;
            serde_json::from_str(&text).with_context(|| format!("invalid configuration {}", path))?
        }
        None => EngineConfig::default(),
    };
    let engine = Engine::with_config(&config)?;

    let start = Instant::now();
    let events = engine
        .read_timestamps(&input, hint)
        .with_context(|| format!("could not replay {}", input.display()))?;
    eprintln!("replayed {} events in {:?}", events, start.elapsed());
    fs::create_dir_all(&out_dir)?;

    let coincidences = engine.coinc_counters();
    for idx in 0..COINC_COUNTERS {
        if coincidences.counters[idx] > 0 {
            println!("{:>10}: {}", counter_label(idx).unwrap_or_default(), coincidences.counters[idx]);
        }
    }

    if engine.histograms().is_enabled() {
        for (start, stop) in engine.histograms().histograms() {
            let hist = engine.histograms().read(start, stop, false)?;
            let bins: Array1<f64> = hist.bins.iter().map(|&b| b as f64).collect();
            export_npy(&out_dir, format!("hist_{}_{}.npy", start, stop), &bins)?;
            println!(
                "histogram {} -> {}: {} counts, {} overflow",
                start, stop, hist.counts, hist.overflow
            );
        }
    }

    if engine.hg2().is_enabled() {
        let raw = engine.hg2().raw()?;
        println!(
            "hg2: {} idler events, {} coincidences",
            raw.idler_events, raw.coinc_events
        );
        export_npy(&out_dir, "hg2_g2.npy", &Array1::from(engine.hg2().calc_g2(false)?))?;
        let tau: Array1<f64> = engine.hg2().params().delays().iter().map(|&t| t as f64).collect();
        export_npy(&out_dir, "hg2_tau.npy", &tau)?;
        let tcp = engine.hg2().calc_tcp(false)?;
        let path = out_dir.join("hg2_tcp.npy");
        write_npy(&path, &tcp).with_context(|| format!("could not write {}", path.display()))?;
    }
    Ok(())
}

fn generate(matches: &ArgMatches) -> Result<()> {
    let output = PathBuf::from(matches.value_of("OUTPUT").unwrap_or_default());
    let format = format_arg(matches, "format", FileFormat::Binary)?;
    let count: usize = number_arg(matches, "count", 1_000_000)?;
    let mask: u32 = number_arg(matches, "channels", 0b1111)?;
    let seed: Option<u64> = match matches.value_of("seed") {
        Some(_) => Some(number_arg(matches, "seed", 0)?),
        None => None,
    };
    let sim_type = match matches.value_of("type").unwrap_or("flat") {
        "flat" => SimType::Flat,
        "normal" => SimType::Normal,
        other => bail!("unknown distribution {}", other),
    };
    let defaults = SimParams::default();
    let params = SimParams {
        sim_type,
        center: number_arg(matches, "center", defaults.center)?,
        width: number_arg(matches, "width", defaults.width)?,
    };

    let channels: Vec<u8> = (1..=32u8).filter(|ch| mask & (1 << (ch - 1)) != 0).collect();
    let generator = TimestampGenerator::new(params, channels, 0, seed)?;
    let mut source = SyntheticSource::new(generator, count, codec::REPLAY_BATCH);

    let header = StreamHeader::new(format, FeatureFlags::default(), DeviceClass::Simulated);
    let writer = StreamWriter::create(&output, format, header)
        .with_context(|| format!("could not create {}", output.display()))?;
    while let Some(batch) = source.next_batch() {
        writer.submit_wait(Arc::new(batch));
    }
    let written = writer.stop();
    eprintln!("{} records written to {}", written, output.display());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let format_help = "ascii, binary, compressed or raw";
    let matches = App::new("tdc")
        .about("Replay, convert and generate TDC timestamp streams")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("convert")
                .about("Converts a timestamp file into another format")
                .arg(Arg::with_name("INPUT").required(true))
                .arg(Arg::with_name("OUTPUT").required(true))
                .arg(
                    Arg::with_name("from")
                        .long("from")
                        .takes_value(true)
                        .help("Input format, for files without header"),
                )
                .arg(
                    Arg::with_name("to")
                        .long("to")
                        .takes_value(true)
                        .help(format_help),
                ),
        )
        .subcommand(
            SubCommand::with_name("replay")
                .about("Runs a timestamp file through the engine and exports the results")
                .arg(Arg::with_name("INPUT").required(true))
                .arg(
                    Arg::with_name("format")
                        .long("format")
                        .takes_value(true)
                        .help("Input format, for files without header"),
                )
                .arg(
                    Arg::with_name("config")
                        .long("config")
                        .short("c")
                        .takes_value(true)
                        .help("Engine configuration as JSON"),
                )
                .arg(
                    Arg::with_name("out-dir")
                        .long("out-dir")
                        .short("o")
                        .takes_value(true)
                        .help("Directory for the .npy exports"),
                ),
        )
        .subcommand(
            SubCommand::with_name("generate")
                .about("Writes synthetic timestamps to a file")
                .arg(Arg::with_name("OUTPUT").required(true))
                .arg(Arg::with_name("format").long("format").takes_value(true).help(format_help))
                .arg(Arg::with_name("count").long("count").short("n").takes_value(true))
                .arg(
                    Arg::with_name("type")
                        .long("type")
                        .takes_value(true)
                        .possible_values(&["flat", "normal"]),
                )
                .arg(Arg::with_name("center").long("center").takes_value(true).help("ps"))
                .arg(Arg::with_name("width").long("width").takes_value(true).help("ps"))
                .arg(
                    Arg::with_name("channels")
                        .long("channels")
                        .takes_value(true)
                        .help("Channel mask, bit 0 is channel 1"),
                )
                .arg(Arg::with_name("seed").long("seed").takes_value(true)),
        )
        .get_matches();

    match matches.subcommand() {
        ("convert", Some(m)) => convert(m),
        ("replay", Some(m)) => replay(m),
        ("generate", Some(m)) => generate(m),
        _ => Ok(()),
    }
}
