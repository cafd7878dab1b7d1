use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use guitar_trainer::analysis::{map_frequency, RhythmAnalyzer, RhythmParams};
use guitar_trainer::audio::load_samples;
use guitar_trainer::calibration::CalibrationEvent;
use guitar_trainer::engine::{
    CpalBackend, FixtureInputProvider, InputProvider, NullOutputProvider, OutputProvider,
};
use guitar_trainer::{init_logging, AppConfig, PracticeSettings, SessionManager};
use serde::Serialize;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::StreamExt;

#[derive(Parser, Debug)]
#[command(name = "practice_cli", about = "Guitar practice engine harness")]
struct Cli {
    /// JSON configuration file (defaults to assets/practice_config.json)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Replay a WAV file instead of opening the microphone
    #[arg(long)]
    input_wav: Option<PathBuf>,
    /// Discard output instead of opening the speaker
    #[arg(long)]
    silent: bool,
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print tuner readings as JSON lines
    Tune {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Print the note name for a frequency
    Note {
        frequency: f32,
        #[arg(long, default_value_t = 440.0)]
        reference: f32,
    },
    /// Run the metronome and print beat events
    Metronome {
        #[arg(long, default_value_t = 120)]
        bpm: u32,
        #[arg(long, default_value = "4/4")]
        signature: String,
        #[arg(long, default_value_t = 8)]
        beats: usize,
    },
    /// Record a take over the metronome and print the report
    Session {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        #[arg(long)]
        bpm: Option<u32>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Score an existing recording
    Analyze {
        recording: PathBuf,
        #[arg(long, default_value_t = 120)]
        bpm: u32,
        #[arg(long, default_value_t = 0.0)]
        margin: f64,
        #[arg(long, default_value_t = 0)]
        latency_offset: u32,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Tap-along latency calibration; press Enter on every click
    Calibrate,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let Cli {
        config,
        input_wav,
        silent,
        verbose,
        command,
    } = Cli::parse();
    init_logging(verbose);

    let config = config
        .as_ref()
        .map(AppConfig::load_from_file)
        .unwrap_or_else(AppConfig::load);
    let devices = Devices { input_wav, silent };

    match command {
        Commands::Note {
            frequency,
            reference,
        } => run_note(frequency, reference),
        Commands::Analyze {
            recording,
            bpm,
            margin,
            latency_offset,
            output,
        } => run_analyze(&config, &recording, bpm, margin, latency_offset, output),
        Commands::Tune { seconds } => {
            let manager = devices.session_manager(config)?;
            runtime()?.block_on(run_tune(&manager, seconds))
        }
        Commands::Metronome {
            bpm,
            signature,
            beats,
        } => {
            let manager = devices.session_manager(config)?;
            runtime()?.block_on(run_metronome(&manager, bpm, signature, beats))
        }
        Commands::Session {
            seconds,
            bpm,
            output,
        } => {
            let manager = devices.session_manager(config)?;
            runtime()?.block_on(run_session(&manager, seconds, bpm, output))
        }
        Commands::Calibrate => run_calibrate(Arc::new(devices.session_manager(config)?)),
    }
}

struct Devices {
    input_wav: Option<PathBuf>,
    silent: bool,
}

impl Devices {
    fn session_manager(&self, config: AppConfig) -> Result<SessionManager> {
        let input = input_provider(self.input_wav.as_deref())?;
        let output: Arc<dyn OutputProvider> = if self.silent {
            Arc::new(NullOutputProvider::new())
        } else {
            Arc::new(CpalBackend::new())
        };
        Ok(SessionManager::new(input, output, config))
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

fn input_provider(wav: Option<&Path>) -> Result<Arc<dyn InputProvider>> {
    match wav {
        Some(path) => {
            let (samples, spec) =
                load_samples(path).with_context(|| format!("loading {}", path.display()))?;
            Ok(Arc::new(FixtureInputProvider::new(samples, spec.sample_rate)))
        }
        None => Ok(Arc::new(CpalBackend::new())),
    }
}

fn run_note(frequency: f32, reference: f32) -> Result<ExitCode> {
    let Some(reading) = map_frequency(frequency, reference) else {
        bail!("{} Hz has no note", frequency);
    };
    println!("{}", serde_json::to_string(&NotePayload {
        frequency_hz: frequency,
        note: reading.note,
        octave: reading.octave,
        cents: reading.cents,
    })?);
    Ok(ExitCode::from(0))
}

async fn run_tune(manager: &SessionManager, seconds: u64) -> Result<ExitCode> {
    manager.start_monitoring()?;
    let mut readings = WatchStream::new(manager.subscribe_tuner());
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            reading = readings.next() => match reading {
                Some(reading) => println!("{}", serde_json::to_string(&reading)?),
                None => break,
            },
        }
    }

    manager.stop_monitoring();
    Ok(ExitCode::from(0))
}

async fn run_metronome(
    manager: &SessionManager,
    bpm: u32,
    signature: String,
    beats: usize,
) -> Result<ExitCode> {
    let settings = PracticeSettings {
        bpm,
        time_signature: signature,
        ..manager.settings()
    };
    manager.apply_settings(&settings)?;

    let mut events = BroadcastStream::new(manager.subscribe_beats()).take(beats);
    manager.metronome().start()?;
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(err) => eprintln!("lagged: {err}"),
        }
    }
    manager.metronome().stop();
    Ok(ExitCode::from(0))
}

async fn run_session(
    manager: &SessionManager,
    seconds: u64,
    bpm: Option<u32>,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    let mut settings = manager.settings();
    if let Some(bpm) = bpm {
        settings.bpm = bpm;
    }

    let recording = manager.start_session(&settings)?;
    eprintln!("Recording to {} for {} s", recording.display(), seconds);
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    let report = manager.stop_session()?;

    emit_json(&report, output)?;
    Ok(ExitCode::from(0))
}

fn run_analyze(
    config: &AppConfig,
    recording: &Path,
    bpm: u32,
    margin: f64,
    latency_offset: u32,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    let analyzer = RhythmAnalyzer::new(config.onset_detection.clone());
    let params = RhythmParams {
        target_bpm: bpm,
        rhythm_margin: margin,
        latency_offset_ms: latency_offset,
        click_times_seconds: Vec::new(),
    };
    let result = analyzer.analyze_file(recording, &params);
    emit_json(&result, output)?;
    Ok(ExitCode::from(0))
}

fn run_calibrate(manager: Arc<SessionManager>) -> Result<ExitCode> {
    let mut events = manager.calibrator().subscribe();
    eprintln!("Press Enter on every click");

    // Both threads end with the process
    let tapper = Arc::clone(&manager);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if line.is_err() {
                break;
            }
            // Taps outside the listening window are ignored
            let _ = tapper.calibrator().tap();
        }
    });
    std::thread::spawn(move || {
        while let Ok(event) = events.blocking_recv() {
            if let CalibrationEvent::Click { index, .. } = event {
                eprintln!("click {}", index + 1);
            }
        }
    });

    match manager.calibrate() {
        Ok(offset_ms) => {
            println!("{}", serde_json::to_string(&CalibrationPayload { offset_ms })?);
            Ok(ExitCode::from(0))
        }
        Err(err) => {
            eprintln!("Calibration failed: {err}");
            Ok(ExitCode::from(2))
        }
    }
}

fn emit_json<T: Serialize>(value: &T, output_path: Option<PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    if let Some(path) = output_path {
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    } else {
        println!("{json}");
    }
    Ok(())
}

#[derive(Serialize)]
struct NotePayload {
    frequency_hz: f32,
    note: &'static str,
    octave: i32,
    cents: i32,
}

#[derive(Serialize)]
struct CalibrationPayload {
    offset_ms: u32,
}
