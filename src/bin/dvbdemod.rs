use std::{
    fs::File,
    io::{stderr, stdin, stdout, BufWriter, Read},
    path::PathBuf,
    thread,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use dvbdemod::{
    iq::SampleFormat,
    settings::{CodeRate, LdpcMode, Modulation, SamplerKind, Settings, Standard, UdpOutput},
    sink::WriterSink,
    Demodulator, Event, Report, Sample,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Demodulate a DVB-S or DVB-S2 IQ recording into an MPEG transport stream.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// JSON settings file, applied before any of the flags below.
    #[arg(long, value_name = "path")]
    settings: Option<PathBuf>,

    #[arg(value_enum, short, long)]
    standard: Option<StandardArg>,

    /// Symbols per second.
    #[arg(short = 'r', long)]
    symbol_rate: Option<u32>,

    #[arg(value_enum, short, long)]
    modulation: Option<ModulationArg>,

    /// Inner code rate, e.g. 1/2 or 3/4.
    #[arg(short, long, value_parser = parse_rate)]
    code_rate: Option<CodeRate>,

    #[arg(value_enum, long)]
    sampler: Option<SamplerArg>,

    #[arg(long)]
    viterbi: bool,

    #[arg(long)]
    fast_lock: bool,

    /// Bit flip budget of the in-process LDPC decoder.
    #[arg(long)]
    max_bitflips: Option<usize>,

    /// External soft-decision LDPC decoder.
    #[arg(long, value_name = "path")]
    ldpc_tool: Option<PathBuf>,

    #[arg(long, default_value_t = 25)]
    ldpc_trials: u32,

    #[arg(long, default_value_t = 2)]
    ldpc_helpers: usize,

    /// Input sample rate in samples per second.
    #[arg(short = 'R', long)]
    sample_rate: f64,

    /// Frequency of the signal relative to the center of the recording, in Hz.
    #[arg(short = 'f', long, default_value_t = 0.0, allow_negative_numbers = true)]
    frequency_offset: f64,

    #[arg(value_enum, short = 'F', long, default_value_t = FormatArg::Cf32)]
    format: FormatArg,

    /// Re-transmit the stream to this UDP address:port.
    #[arg(long, value_name = "addr:port")]
    udp: Option<String>,

    /// Output transport stream, stdout if omitted.
    #[arg(short, long, value_name = "path")]
    output: Option<PathBuf>,

    /// Log measurement reports.
    #[arg(short, long)]
    verbose: bool,

    /// Input IQ file, stdin if omitted.
    input: Option<PathBuf>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum StandardArg {
    DvbS,
    DvbS2,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum ModulationArg {
    Bpsk,
    Qpsk,
    Psk8,
    Apsk16,
    Apsk32,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum SamplerArg {
    Nearest,
    Linear,
    Rrc,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum FormatArg {
    Cf32,
    Cs16,
    Cu8,
}

fn parse_rate(s: &str) -> Result<CodeRate, String> {
    let rate = match s {
        "1/2" => CodeRate::Fec12,
        "2/3" => CodeRate::Fec23,
        "3/4" => CodeRate::Fec34,
        "5/6" => CodeRate::Fec56,
        "7/8" => CodeRate::Fec78,
        "4/5" => CodeRate::Fec45,
        "8/9" => CodeRate::Fec89,
        "9/10" => CodeRate::Fec910,
        "1/4" => CodeRate::Fec14,
        "1/3" => CodeRate::Fec13,
        "2/5" => CodeRate::Fec25,
        "3/5" => CodeRate::Fec35,
        _ => return Err(format!("unknown code rate {s}")),
    };
    Ok(rate)
}

fn settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.settings {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {path:?}"))?;
            serde_json::from_reader(file).with_context(|| format!("parsing {path:?}"))?
        }
        None => Settings::default(),
    };
    if let Some(standard) = cli.standard {
        settings.standard = match standard {
            StandardArg::DvbS => Standard::DvbS,
            StandardArg::DvbS2 => Standard::DvbS2,
        };
    }
    if let Some(rate) = cli.symbol_rate {
        settings.symbol_rate = rate;
    }
    if let Some(modulation) = cli.modulation {
        settings.modulation = match modulation {
            ModulationArg::Bpsk => Modulation::Bpsk,
            ModulationArg::Qpsk => Modulation::Qpsk,
            ModulationArg::Psk8 => Modulation::Psk8,
            ModulationArg::Apsk16 => Modulation::Apsk16,
            ModulationArg::Apsk32 => Modulation::Apsk32,
        };
    }
    if let Some(rate) = cli.code_rate {
        settings.code_rate = rate;
    }
    if let Some(sampler) = cli.sampler {
        settings.sampler = match sampler {
            SamplerArg::Nearest => SamplerKind::Nearest,
            SamplerArg::Linear => SamplerKind::Linear,
            SamplerArg::Rrc => SamplerKind::Rrc,
        };
    }
    settings.viterbi |= cli.viterbi;
    settings.fast_lock |= cli.fast_lock;
    if let Some(tool) = &cli.ldpc_tool {
        settings.ldpc = LdpcMode::Soft {
            tool: tool.clone(),
            max_trials: cli.ldpc_trials,
            helpers: cli.ldpc_helpers,
        };
    } else if let Some(max_bitflips) = cli.max_bitflips {
        settings.ldpc = LdpcMode::BitFlip { max_bitflips };
    }
    if let Some(udp) = &cli.udp {
        let Some((address, port)) = udp.rsplit_once(':') else {
            bail!("UDP output must be address:port, got {udp}");
        };
        settings.udp = UdpOutput::builder()
            .enabled(true)
            .address(address)
            .port(port.parse().with_context(|| format!("UDP port {port}"))?)
            .build();
    }
    Ok(settings)
}

fn log_event(event: &Event) {
    match event {
        Event::Modcod(m) => info!(
            modcod = m.modcod,
            modulation = ?m.modulation,
            rate = ?m.code_rate,
            short = m.short_frames,
            pilots = m.pilots,
            "MODCOD"
        ),
        Event::Report(Report::Lock { source, locked }) => info!(?source, locked, "lock"),
        Event::Report(Report::Fec { source, counters }) if !counters.integrity.ok() => {
            debug!(?source, ?counters, "FEC")
        }
        Event::Report(report) => debug!(?report),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .without_time()
        .with_env_filter(
            EnvFilter::try_from_env("DVBDEMOD_LOG")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let settings = settings(&cli)?;
    let format = match cli.format {
        FormatArg::Cf32 => SampleFormat::Cf32,
        FormatArg::Cs16 => SampleFormat::Cs16,
        FormatArg::Cu8 => SampleFormat::Cu8,
    };

    let mut demod = Demodulator::new(cli.sample_rate);
    demod
        .apply_channel_settings(cli.sample_rate, cli.frequency_offset)
        .context("channel settings")?;
    demod
        .apply_settings(settings, false)
        .context("demodulator settings")?;
    match &cli.output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {path:?}"))?;
            demod.add_sink(Box::new(WriterSink::new(BufWriter::new(file))));
        }
        None => demod.add_sink(Box::new(WriterSink::new(BufWriter::new(stdout())))),
    }

    let events = demod.subscribe();
    let logger = thread::Builder::new()
        .name("events".into())
        .spawn(move || {
            for event in events {
                log_event(&event);
            }
        })
        .context("spawning event logger")?;

    let mut reader: Box<dyn Read> = match &cli.input {
        Some(path) => Box::new(File::open(path).with_context(|| format!("opening {path:?}"))?),
        None => Box::new(stdin()),
    };
    info!(format = ?format, rate = cli.sample_rate, "demodulating");

    let mut buf = vec![0u8; 1 << 16];
    let mut filled = 0;
    let mut samples: Vec<Sample> = Vec::with_capacity(buf.len() / format.sample_len());
    loop {
        let n = reader.read(&mut buf[filled..]).context("reading input")?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled < format.sample_len() {
            continue;
        }
        samples.clear();
        let used = format.decode(&buf[..filled], &mut samples)?;
        buf.copy_within(used..filled, 0);
        filled -= used;
        demod.feed(&samples);
    }
    if filled > 0 {
        warn!(bytes = filled, "ignoring trailing partial sample");
    }
    demod.flush();
    drop(demod);

    if logger.join().is_err() {
        bail!("event logger panicked");
    }
    Ok(())
}
