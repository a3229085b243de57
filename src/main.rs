use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use app_manager::backend::HomebrewBackend;
use app_manager::{
    ActivityKind, AppIdentity, Config, Coordinator, Downloader, ErrorReporter, LogReporter,
    OperationFailure, OperationPhase, RequestOutcome, SourceKind, StateEvent,
};

/// Install, update and remove apps from the Fairground catalog and Homebrew casks.
#[derive(Parser, Debug)]
#[command(name = "app-manager", version)]
struct Cli {
    /// Config file (defaults to ~/.config/app-manager/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a catalog
    Catalog {
        #[arg(value_enum, default_value_t = SourceArg::Native)]
        source: SourceArg,
    },
    /// Show the install state of an app
    Status {
        id: String,
        #[arg(long)]
        cask: bool,
    },
    Install(Target),
    Update(Target),
    /// Move an installed app to the trash (or uninstall the cask)
    Trash(Target),
    Launch(Target),
    /// Show an installed app in Finder
    Reveal(Target),
    /// Remove the private Homebrew toolchain
    BrewUninstall,
}

#[derive(Args, Debug)]
struct Target {
    /// Bundle identifier or cask token
    id: String,
    /// Look the app up in the cask catalog
    #[arg(long)]
    cask: bool,
    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SourceArg {
    Native,
    Cask,
}

impl From<SourceArg> for SourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Native => SourceKind::Native,
            SourceArg::Cask => SourceKind::Cask,
        }
    }
}

fn source_of(cask: bool) -> SourceKind {
    if cask { SourceKind::Cask } else { SourceKind::Native }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("Load config from {}", config_path.display()))?;
    debug!("Using config {:?}", config);

    match cli.command {
        Command::BrewUninstall => {
            let downloader =
                Downloader::new(config.download.timeout(), &config.download.user_agent);
            HomebrewBackend::new(&config.homebrew, config.caskroom(), downloader)
                .uninstall_toolchain()?;
            println!("Removed {}", config.homebrew.root.display());
            Ok(())
        }
        Command::Catalog { source } => {
            let coordinator = Coordinator::from_config(&config, Arc::new(LogReporter))?;
            let entries = coordinator.catalog(source.into())?;
            for entry in entries.iter() {
                println!("{}\t{}\t{}", entry.identity, entry.version, entry.name);
            }
            Ok(())
        }
        Command::Status { id, cask } => {
            let coordinator = Coordinator::from_config(&config, Arc::new(LogReporter))?;
            let source = source_of(cask);
            // Outdated needs the catalog's version; resolve without it if the fetch fails.
            if let Err(e) = coordinator.catalog(source) {
                debug!("Catalog unavailable: {}", e);
            }
            let state = coordinator.install_state_in(&AppIdentity::new(id.clone()), source);
            println!("{} ({}): {}", id, source, state);
            Ok(())
        }
        Command::Install(t) => run_activity(&config, t, ActivityKind::Install),
        Command::Update(t) => run_activity(&config, t, ActivityKind::Update),
        Command::Trash(t) => run_activity(&config, t, ActivityKind::Trash),
        Command::Launch(t) => run_activity(&config, t, ActivityKind::Launch),
        Command::Reveal(t) => run_activity(&config, t, ActivityKind::Reveal),
    }
}

/// Keeps the last failure so the exit status can carry it.
#[derive(Default)]
struct LastFailure(Mutex<Option<OperationFailure>>);

impl ErrorReporter for LastFailure {
    fn report_error(&self, failure: &OperationFailure) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(failure.clone());
    }
}

fn run_activity(config: &Config, target: Target, activity: ActivityKind) -> Result<()> {
    let failures = Arc::new(LastFailure::default());
    let coordinator = Coordinator::from_config(config, failures.clone())?;
    let source = source_of(target.cask);
    let identity = AppIdentity::new(target.id);

    coordinator.catalog(source)?;
    let entry = coordinator
        .catalog_store()
        .find_in(source, &identity)
        .ok_or_else(|| anyhow!("{} is not in the {} catalog", identity, source))?;

    let events = coordinator.subscribe();
    let gated = !target.yes && activity.changes_install_state();
    match coordinator.request_operation(&entry, activity, gated)? {
        RequestOutcome::Pending => {
            if !ask(&format!("{} {} {}?", activity, entry.name, entry.version))? {
                coordinator.cancel_operation(&identity);
                println!("Nothing done");
                return Ok(());
            }
            if !coordinator.confirm_operation(&identity, activity) {
                bail!("{} of {} could not be started", activity, identity);
            }
        }
        RequestOutcome::Started => {}
        RequestOutcome::Cancelled => bail!("{} of {} was already running", activity, identity),
    }

    let phase = loop {
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(StateEvent::Operation {
                identity: id,
                phase,
                ..
            }) if id == identity && phase.is_terminal() => break phase,
            Ok(StateEvent::InstallState {
                identity: id,
                state,
                ..
            }) if id == identity => println!("{}: {}", id, state),
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                if let Some(op) = coordinator.current_operation(&identity) {
                    if op.progress.total() > 0 {
                        eprint!("\r{:>5.1}%", op.progress.fraction() * 100.0);
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => bail!("event stream closed"),
        }
    };
    eprintln!();

    match phase {
        OperationPhase::Completed => {
            println!("{} of {} completed", activity, identity);
            Ok(())
        }
        OperationPhase::Cancelled => bail!("{} of {} was cancelled", activity, identity),
        _ => {
            let failure = failures.0.lock().unwrap_or_else(|e| e.into_inner()).take();
            match failure {
                Some(f) => Err(f.error).with_context(|| format!("{} of {}", activity, identity)),
                None => bail!("{} of {} failed", activity, identity),
            }
        }
    }
}

fn ask(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
