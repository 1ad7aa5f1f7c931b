use clap::{Args, Parser, Subcommand};
use procctl::config::{self, DaemonConfig};
use procctl::pidfile::PidFile;
use procctl::process::{self, ExitStatus, Spawner};
use procctl::queue::{CaughtSignal, SignalJournal};
use procctl::send::{send, Target};
use procctl::signal_name::parse_signal;
use procctl::{Dispatcher, HandlerResult, Pid, Signal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;

/// Spawn and reap child processes, send signals by PID or PID file, and run
/// a listener that dispatches signals to ordinary thread context.
#[derive(Parser, Debug)]
#[command(name = "procctl", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "procctl.toml", global = true)]
    config: PathBuf,

    /// Extra logging (spawns, sends, dispatch cycles)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn a program with verbatim arguments and exit with its status
    Run {
        program: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run a command line through the configured shell
    Exec { line: String },
    /// Send a signal to a process
    Send(SendArgs),
    /// Write the PID file and log every configured signal until TERM or INT
    Listen,
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Signal name or number (USR1, SIGHUP, 15)
    signal: String,

    #[command(flatten)]
    target: TargetArgs,
}

#[derive(Args, Debug)]
#[group(required = false, multiple = false)]
struct TargetArgs {
    /// Target PID
    #[arg(long)]
    pid: Option<i32>,

    /// PID file to read the target from (default: the configured pid file)
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command, &config) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "procctl failed");
            ExitCode::FAILURE
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn run(command: Command, config: &DaemonConfig) -> Result<ExitCode, BoxError> {
    match command {
        Command::Run { program, args } => {
            let mut child = Spawner::new(program).args(args).spawn()?;
            Ok(exit_code(child.wait()?))
        }
        Command::Exec { line } => Ok(exit_code(process::execute_with(&config.shell.path, &line)?)),
        Command::Send(args) => {
            let signal = parse_signal(&args.signal)?;
            match (args.target.pid, args.target.pid_file) {
                (Some(pid), _) => send(signal, Target::Pid(Pid::from_raw(pid)))?,
                (None, Some(path)) => send(signal, Target::PidFile(&path))?,
                (None, None) => send(signal, Target::PidFile(&config.pid_file.path))?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Listen => {
            listen(config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Process exit status for the CLI: the child's code, or 128 + signal
/// number for a signal-terminated child, as shells report it.
fn exit_code(status: ExitStatus) -> ExitCode {
    let code = match status {
        ExitStatus::Exited(code) => code,
        ExitStatus::Signaled(signal) => 128 + signal as i32,
    };
    ExitCode::from(code.clamp(0, 255) as u8)
}

fn listen(config: &DaemonConfig) -> Result<(), BoxError> {
    let mut signals = config
        .dispatch
        .signals
        .iter()
        .map(|name| parse_signal(name))
        .collect::<Result<Vec<_>, _>>()?;
    for required in [Signal::SIGTERM, Signal::SIGINT] {
        if !signals.contains(&required) {
            signals.push(required);
        }
    }

    let mut journal = config
        .journal
        .path
        .as_ref()
        .map(SignalJournal::open)
        .transpose()?;

    let (stop_tx, stop_rx) = mpsc::channel();
    let handler = move |signal: Signal| -> HandlerResult {
        let caught = CaughtSignal::now(signal);
        tracing::info!(signal = signal.as_str(), at = %caught.at, "caught signal");
        if let Some(journal) = journal.as_mut() {
            journal.record(&caught)?;
        }
        if matches!(signal, Signal::SIGTERM | Signal::SIGINT) {
            stop_tx.send(signal)?;
        }
        Ok(())
    };

    let dispatcher = Dispatcher::builder(signals)
        .on_drop(config.dispatch.on_drop)
        .thread_name(config.dispatch.thread_name.as_str())
        .spawn(handler)?;
    // Only advertise the PID once signals are routed.
    let pid_file = PidFile::create(&config.pid_file.path)?;
    tracing::info!(
        pid = %process::current_pid(),
        pid_file = %pid_file.path().display(),
        "listening for signals"
    );

    let stop = stop_rx.recv()?;
    tracing::info!(signal = stop.as_str(), "shutting down");
    drop(dispatcher);
    drop(pid_file);
    Ok(())
}
