//! PineTerm - interactive UART terminal
//!
//! Runs on a single-threaded runtime: the receive pipeline, script playback
//! and operator input interleave cooperatively.

use clap::{Args, Parser, Subcommand};
use pineterm_core::cli::{self, print_exit_codes, CliResult, ExitCodes, OperatorCommand};
use pineterm_core::config::{self, AppConfig, ConfigError};
use pineterm_core::core::codec::{CodecType, LineEnding};
use pineterm_core::core::logger::LogAggregator;
use pineterm_core::core::script::{Script, ScriptFormatError};
use pineterm_core::core::sequencer::{CommandSequencer, ScriptError};
use pineterm_core::core::session::{OpenOutcome, Session, SessionEvent, SessionState};
use pineterm_core::core::transport::{
    list_ports, ChannelError, LoopbackDevice, SerialFlowControl, SerialParity, SerialProvider,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// PineTerm CLI
#[derive(Parser, Debug)]
#[command(
    name = "pineterm",
    version,
    about = "Interactive UART terminal with packet reassembly and scripted sends",
    long_about = None
)]
struct Cli {
    /// Verbose diagnostics
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write diagnostics to a daily log file in the data directory
    #[arg(long, global = true)]
    log_file: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, env = "PINETERM_CONFIG")]
    config: Option<PathBuf>,

    /// Persist the effective settings to the config file
    #[arg(long, global = true)]
    save_config: bool,

    #[command(flatten)]
    link: LinkArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Clone, Default)]
struct LinkArgs {
    /// Serial port name (e.g., COM3, /dev/ttyUSB0)
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Baud rate (1-10000000)
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// Data bits (5-8)
    #[arg(long, global = true)]
    data_bits: Option<u8>,

    /// Stop bits (1, 2)
    #[arg(long, global = true)]
    stop_bits: Option<u8>,

    /// Parity (none, odd, even)
    #[arg(long, global = true)]
    parity: Option<SerialParity>,

    /// Flow control (none, hw, sw)
    #[arg(long, global = true)]
    flow: Option<SerialFlowControl>,

    /// Line ending for sends (none, cr, lf, crlf)
    #[arg(long, global = true)]
    line_ending: Option<LineEnding>,

    /// Packet timing threshold in milliseconds
    #[arg(long, global = true)]
    threshold_ms: Option<u64>,

    /// Forward every read as its own packet
    #[arg(long, global = true)]
    no_timing: bool,

    /// Log view (hex, text)
    #[arg(long, global = true)]
    view: Option<CodecType>,

    /// Use an in-process echo device instead of a serial port
    #[arg(long, global = true)]
    loopback: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,
    },

    /// Connect, run a JSON script, print the traffic and exit
    RunScript {
        /// Script file
        script: PathBuf,

        /// Keep listening this long after the last command (ms)
        #[arg(long, default_value = "500")]
        wait_ms: u64,

        /// Export the log into this directory afterwards
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Interactive terminal (default)
    Interactive,

    /// Print the exit code table
    ExitCodes,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli);
    tracing::debug!("Starting PineTerm v{}", pineterm_core::VERSION);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            return ExitCode::from(ExitCodes::INTERNAL_ERROR);
        }
    };

    let result = runtime.block_on(run(cli)).unwrap_or_else(classify);
    match (&result, result.message()) {
        (CliResult::Success(_), Some(msg)) => println!("{msg}"),
        (CliResult::Error(..), Some(msg)) => eprintln!("Error: {msg}"),
        _ => {}
    }
    result.to_exit_code()
}

fn init_tracing(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter).with(stderr);

    if cli.log_file {
        if let Err(e) = config::init_directories() {
            eprintln!("Failed to create data directories: {e}");
        }
        if let Some(dir) = config::log_dir() {
            let appender = tracing_appender::rolling::daily(dir, "pineterm.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            return Some(guard);
        }
    }

    registry.init();
    None
}

/// Map a failure to the most specific exit code
fn classify(err: anyhow::Error) -> CliResult {
    let err = match err.downcast::<ChannelError>() {
        Ok(e) => return e.into(),
        Err(err) => err,
    };
    let err = match err.downcast::<ScriptFormatError>() {
        Ok(e) => return e.into(),
        Err(err) => err,
    };
    let err = match err.downcast::<ScriptError>() {
        Ok(e) => return e.into(),
        Err(err) => err,
    };
    let err = match err.downcast::<ConfigError>() {
        Ok(e) => return e.into(),
        Err(err) => err,
    };
    match err.downcast::<std::io::Error>() {
        Ok(e) => e.into(),
        Err(err) => CliResult::error(ExitCodes::ERROR, format!("{err:#}")),
    }
}

async fn run(cli: Cli) -> anyhow::Result<CliResult> {
    match &cli.command {
        Some(Commands::ListPorts { detailed }) => list(*detailed),
        Some(Commands::ExitCodes) => {
            print_exit_codes();
            Ok(CliResult::success())
        }
        Some(Commands::RunScript {
            script,
            wait_ms,
            export,
        }) => {
            let config = load_config(&cli)?;
            run_script(&cli, &config, script, Duration::from_millis(*wait_ms), export.as_deref()).await
        }
        Some(Commands::Interactive) | None => {
            let config = load_config(&cli)?;
            interactive(&cli, config).await
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load().unwrap_or_else(|e| {
            tracing::warn!("Using default settings: {}", e);
            AppConfig::default()
        }),
    };

    let args = &cli.link;
    if let Some(port) = &args.port {
        config.link.port = Some(port.clone());
    }
    if let Some(baud) = args.baud {
        config.link.baud_rate = baud;
    }
    if let Some(bits) = args.data_bits {
        config.link.data_bits = bits;
    }
    if let Some(bits) = args.stop_bits {
        config.link.stop_bits = bits;
    }
    if let Some(parity) = args.parity {
        config.link.parity = parity;
    }
    if let Some(flow) = args.flow {
        config.link.flow_control = flow;
    }
    if let Some(ending) = args.line_ending {
        config.send.line_ending = ending;
    }
    if let Some(ms) = args.threshold_ms {
        config.receive.threshold_ms = ms;
    }
    if args.no_timing {
        config.receive.timing_enabled = false;
    }
    if let Some(view) = args.view {
        config.display.view = view;
    }
    config.validate()?;

    if cli.save_config {
        match &cli.config {
            Some(path) => config.save_to(path)?,
            None => {
                let path = config.save()?;
                tracing::info!("Saved settings to {}", path.display());
            }
        }
    }
    Ok(config)
}

fn list(detailed: bool) -> anyhow::Result<CliResult> {
    let ports = list_ports()?;
    if ports.is_empty() {
        return Ok(CliResult::success_with_message("No serial ports found."));
    }
    for port in &ports {
        if detailed {
            println!("  {} [{:?}]", port.port_name, port.port_type);
        } else {
            println!("{}", port.port_name);
        }
    }
    Ok(CliResult::success())
}

fn build_session(args: &LinkArgs, config: &AppConfig) -> Session {
    let log = LogAggregator::new(config.display.max_lines);
    let session = if args.loopback {
        tracing::info!("Using loopback echo device");
        Session::with_log(LoopbackDevice::echo().provider(), log)
    } else {
        Session::with_log(SerialProvider::with_chooser(Arc::new(choose_port)), log)
    };
    session.set_receive_settings(config.receive);
    session.set_line_ending(config.send.line_ending);
    session
}

/// Picks the only attached port; several ports need an explicit `--port`
fn choose_port(ports: &[serialport::SerialPortInfo]) -> Option<String> {
    match ports {
        [only] => Some(only.port_name.clone()),
        _ => {
            println!("Several ports found, pass --port:");
            for port in ports {
                println!("  {}", port.port_name);
            }
            None
        }
    }
}

fn print_batch(batch: &pineterm_core::LogBatch, view: CodecType) {
    for entry in batch.iter() {
        println!("{}", entry.to_export_line(view));
    }
}

async fn run_script(
    cli: &Cli,
    config: &AppConfig,
    path: &Path,
    wait: Duration,
    export: Option<&Path>,
) -> anyhow::Result<CliResult> {
    let script = Script::load(path)?;
    let session = build_session(&cli.link, config);
    let view = config.display.view;

    if session.open(config.link.clone()).await? == OpenOutcome::Cancelled {
        return Ok(CliResult::error(ExitCodes::CANCELLED, "No port selected"));
    }

    let mut batches = session.log().subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match batches.recv().await {
                Ok(batch) => print_batch(&batch, view),
                Err(RecvError::Lagged(n)) => tracing::warn!("Skipped {} log batches", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let sequencer = CommandSequencer::new();
    let outcome = sequencer
        .run(&script, session.writer().as_ref(), session.line_ending())
        .await;
    if outcome.is_ok() && session.is_connected() {
        tokio::time::sleep(wait).await;
    }
    session.close(false).await;
    session.log().flush();
    tokio::task::yield_now().await;
    printer.abort();

    if let Some(dir) = export {
        let written = session.log().export_to_dir(view, dir)?;
        println!("Exported {}", written.display());
    }

    let report = outcome?;
    let stats = session.stats();
    Ok(CliResult::success_with_message(format!(
        "{} writes ({:?}), RX {} bytes, TX {} bytes",
        report.writes, report.outcome, stats.rx_bytes, stats.tx_bytes
    )))
}

/// Operator-side state of the interactive terminal
struct Terminal {
    session: Session,
    sequencer: CommandSequencer,
    script: Option<Script>,
    config: AppConfig,
}

enum Flow {
    Continue,
    Quit,
}

impl Terminal {
    async fn open(&self) {
        match self.session.open(self.config.link.clone()).await {
            Ok(OpenOutcome::Connected) => {}
            Ok(OpenOutcome::Cancelled) => println!("No port selected"),
            Err(ChannelError::AlreadyConnected) => println!("Already connected"),
            // Already reported through SessionEvent::Error
            Err(_) => {}
        }
    }

    async fn handle(&mut self, line: &str) -> Flow {
        let command = match cli::parse_command(line) {
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                return Flow::Continue;
            }
        };

        match command {
            OperatorCommand::Send(text) => {
                if let Err(e) = self.session.send_text(&text).await {
                    println!("Failed to send: {e}");
                }
            }
            OperatorCommand::Hex(text) => {
                if let Err(e) = self.session.send_hex(&text).await {
                    println!("Failed to send: {e}");
                }
            }
            OperatorCommand::Open => self.open().await,
            OperatorCommand::Close => {
                self.sequencer.stop();
                self.session.close(false).await;
            }
            OperatorCommand::Load(path) => match Script::load(&path) {
                Ok(script) => {
                    println!("Loaded {} command(s)", script.len());
                    self.script = Some(script);
                }
                Err(e) => {
                    println!("{e}");
                    self.script = None;
                }
            },
            OperatorCommand::Run => self.run_script(),
            OperatorCommand::Stop => self.sequencer.stop(),
            OperatorCommand::View(view) => {
                self.config.display.view = view;
                println!("View: {view}");
            }
            OperatorCommand::Export(dir) => {
                let dir = dir.unwrap_or_else(|| self.config.export_dir());
                match self.session.log().export_to_dir(self.config.display.view, &dir) {
                    Ok(path) => println!("Exported {}", path.display()),
                    Err(e) => println!("Export failed: {e}"),
                }
            }
            OperatorCommand::Clear => {
                self.session.log().clear();
                println!("Log cleared");
            }
            OperatorCommand::Timing {
                enabled,
                threshold_ms,
            } => {
                let mut settings = self.session.receive_settings();
                settings.timing_enabled = enabled;
                if let Some(ms) = threshold_ms {
                    settings.threshold_ms = ms;
                }
                self.session.set_receive_settings(settings);
                self.config.receive = settings;
                println!(
                    "Timing {} ({} ms)",
                    if enabled { "on" } else { "off" },
                    settings.threshold().as_millis()
                );
            }
            OperatorCommand::MaxLines(lines) => {
                self.session.log().set_max_lines(lines);
                self.config.display.max_lines = lines;
            }
            OperatorCommand::Ending(ending) => {
                self.session.set_line_ending(ending);
                self.config.send.line_ending = ending;
            }
            OperatorCommand::Show => {
                for entry in self.session.log().display() {
                    println!("{}", entry.to_export_line(self.config.display.view));
                }
            }
            OperatorCommand::Stats => self.print_stats(),
            OperatorCommand::Help => println!("{}", cli::HELP),
            OperatorCommand::Quit => return Flow::Quit,
        }
        Flow::Continue
    }

    fn run_script(&self) {
        let Some(script) = self.script.clone() else {
            println!("Please select a valid JSON file first");
            return;
        };
        let Some(writer) = self.session.writer() else {
            println!("Please connect to UART first");
            return;
        };
        if self.sequencer.is_running() {
            println!("A script is already running");
            return;
        }

        let sequencer = self.sequencer.clone();
        let ending = self.session.line_ending();
        tokio::spawn(async move {
            // Outcome arrives as SessionEvent::ScriptFinished
            let _ = sequencer.run(&script, Some(&writer), ending).await;
        });
    }

    fn print_stats(&self) {
        let stats = self.session.stats();
        let log = self.session.log();
        println!(
            "{} | RX {} bytes | TX {} bytes | log {} entries ({} shown, cap {})",
            self.session.state(),
            stats.rx_bytes,
            stats.tx_bytes,
            log.export_len(),
            log.display_len(),
            log.max_lines()
        );
        if let Some(link) = self.session.link_config() {
            println!("Link: {link}");
        }
        if let Some(progress) = self.sequencer.progress() {
            println!(
                "Script: command {} repeat {}",
                progress.command + 1,
                progress.repeat + 1
            );
        }
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state @ (SessionState::Connected | SessionState::Disconnected)) => {
            println!("-- {state}");
        }
        SessionEvent::Stalled(true) => println!("-- No data received for a while; the link may be stalled"),
        SessionEvent::Warning(Some(msg)) => println!("-- Warning: {msg}"),
        SessionEvent::Error(msg) => println!("-- {msg}"),
        SessionEvent::ScriptStarted { commands } => println!("-- Script started ({commands} commands)"),
        SessionEvent::ScriptFinished(Ok(report)) => {
            println!("-- Script finished: {} writes ({:?})", report.writes, report.outcome);
        }
        SessionEvent::ScriptFinished(Err(msg)) => println!("-- Script failed: {msg}"),
        _ => {}
    }
}

async fn interactive(cli: &Cli, config: AppConfig) -> anyhow::Result<CliResult> {
    let session = build_session(&cli.link, &config);
    let mut events = session.subscribe();
    let mut batches = session.log().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let mut terminal = Terminal {
        session: session.clone(),
        sequencer: CommandSequencer::new(),
        script: None,
        config,
    };

    println!("PineTerm {} - :help for commands", pineterm_core::VERSION);
    if cli.link.loopback || terminal.config.link.port.is_some() {
        terminal.open().await;
    }

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Flow::Quit = terminal.handle(&line).await {
                        break;
                    }
                }
                None => break,
            },

            batch = batches.recv() => match batch {
                Ok(batch) if terminal.config.display.auto_scroll => {
                    print_batch(&batch, terminal.config.display.view);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => tracing::warn!("Skipped {} log batches", n),
                Err(RecvError::Closed) => break,
            },

            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },

            _ = tokio::signal::ctrl_c() => break,
        }
    }

    terminal.sequencer.stop();
    session.close(false).await;
    Ok(CliResult::success())
}
