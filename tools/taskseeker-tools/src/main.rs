use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskseeker_core::{data_dir::data_dir, settings, Settings};
use taskseeker_engine::{Collaborators, Dispatcher, EngineConfig, TerminalEvent};
use taskseeker_observability::{panic_log, safe_eprintln};
use taskseeker_platform::{png_codec, selection, ClipboardSelection, TesseractOcr};
use taskseeker_providers::{api_key, ChatClient};

mod console_sink;

use console_sink::{ConsoleSink, SinkReport};

const PUMP_SLICE: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "taskseeker", version, about = "Ask a language model about selected or captured text")]
struct Cli {
    /// Data directory (overrides TASKSEEKER_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send TEXT as a query and print the streamed answer
    Ask {
        text: String,
        /// Copy the final answer to the clipboard
        #[arg(long)]
        copy: bool,
        /// Wait for the whole answer instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },
    /// Recognize text in a PNG screenshot, then query it
    Ocr {
        png: PathBuf,
        #[arg(long)]
        copy: bool,
    },
    /// Query the current text selection
    Selection {
        #[arg(long)]
        copy: bool,
    },
    /// Inspect or change settings and the API key
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /// Print settings.json and the effective engine config
    Show,
    /// Store the model API key in the OS keyring
    SetKey { key: String },
    /// Remove the stored API key
    ClearKey,
    /// Report where the API key would come from
    KeyStatus,
    /// Send a tiny request to verify endpoint and key
    Check,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let dir = match cli.data_dir {
        Some(d) => d,
        None => data_dir()?,
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir failed: {}", dir.display()))?;
    panic_log::install_best_effort(dir.clone());
    let settings = settings::load_settings_or_recover(&dir);

    match cli.command {
        Commands::Ask {
            text,
            copy,
            no_stream,
        } => {
            let mut cfg = EngineConfig::from_settings(&settings);
            if no_stream {
                cfg.stream_responses = false;
            }
            run_session(&dir, &settings, cfg, copy, |d| d.on_query_trigger(&text))
        }
        Commands::Ocr { png, copy } => {
            let bytes =
                std::fs::read(&png).with_context(|| format!("read {} failed", png.display()))?;
            let image = png_codec::decode_png(&bytes)?;
            let cfg = EngineConfig::from_settings(&settings);
            run_session(&dir, &settings, cfg, copy, move |d| d.on_capture_ready(image))
        }
        Commands::Selection { copy } => {
            let cfg = EngineConfig::from_settings(&settings);
            run_session(&dir, &settings, cfg, copy, |d| d.on_selection_hotkey())
        }
        Commands::Settings { action } => run_settings(&dir, &settings, action),
    }
}

/// Ctrl-C sets the flag; the pump loop turns it into a user cancel.
fn spawn_interrupt_listener(flag: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new()
        .name("taskseeker-ctrl-c".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    safe_eprintln!("ctrl-c listener disabled: {e}");
                    return;
                }
            };
            loop {
                if rt.block_on(tokio::signal::ctrl_c()).is_err() {
                    return;
                }
                flag.store(true, Ordering::SeqCst);
            }
        });
    if let Err(e) = spawned {
        safe_eprintln!("ctrl-c listener disabled: {e}");
    }
}

fn run_session(
    dir: &Path,
    settings: &Settings,
    cfg: EngineConfig,
    copy: bool,
    start: impl FnOnce(&mut Dispatcher),
) -> Result<ExitCode> {
    let client = ChatClient::from_settings(dir, settings)?;
    let collab = Collaborators {
        recognizer: Arc::new(TesseractOcr::from_settings(dir, settings)),
        query: Arc::new(client),
        selection: Arc::new(ClipboardSelection),
    };
    let (sink, report) = ConsoleSink::new(std::io::stdout());
    let mut dispatcher = Dispatcher::new(dir, cfg, Box::new(sink), collab);

    let interrupted = Arc::new(AtomicBool::new(false));
    spawn_interrupt_listener(interrupted.clone());

    start(&mut dispatcher);
    while !dispatcher.run_until_idle(PUMP_SLICE) {
        if interrupted.swap(false, Ordering::SeqCst) {
            dispatcher.on_user_cancel();
        }
    }

    let failed = report.errored()
        || matches!(
            dispatcher.last_terminal(),
            Some((_, TerminalEvent::Failed { .. }))
        );
    dispatcher.shutdown();

    if copy {
        copy_answer(&report);
    }
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn copy_answer(report: &SinkReport) {
    let Some(answer) = report.answer() else {
        safe_eprintln!("nothing to copy");
        return;
    };
    if let Err(e) = selection::copy_to_clipboard(&answer) {
        safe_eprintln!("copy failed: {e}");
    }
}

fn run_settings(dir: &Path, settings: &Settings, action: SettingsAction) -> Result<ExitCode> {
    match action {
        SettingsAction::Show => {
            println!(
                "{}",
                serde_json::to_string_pretty(settings).context("serialize settings failed")?
            );
            println!("data_dir: {}", dir.display());
            println!("engine: {:?}", EngineConfig::from_settings(settings));
        }
        SettingsAction::SetKey { key } => {
            api_key::set_api_key(&key)?;
            println!("api key stored");
        }
        SettingsAction::ClearKey => {
            api_key::clear_api_key()?;
            println!("api key cleared");
        }
        SettingsAction::KeyStatus => {
            let st = api_key::api_key_status();
            println!(
                "{}",
                serde_json::to_string_pretty(&st).context("serialize key status failed")?
            );
        }
        SettingsAction::Check => {
            let client = ChatClient::from_settings(dir, settings)?;
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("create tokio runtime failed")?;
            match rt.block_on(client.validate()) {
                Ok(()) => println!("ok: {} at {}", client.config().model, client.config().base_url),
                Err(e) => {
                    safe_eprintln!("check failed: {e}");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
