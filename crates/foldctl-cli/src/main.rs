mod commands;
mod top;

use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use foldctl_client::{Aggregator, RunIntent, SessionOptions};
use foldctl_core::PeerAddress;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "foldctl",
    version,
    about = "Control and observe folding compute clients over their live state stream"
)]
struct Args {
    /// [host][:port][/group]; "." is localhost. Comma-separated hosts are
    /// accepted by units, info, fold, finish, pause, and top.
    #[arg(short = 'a', long, default_value = ".")]
    address: String,

    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Transport connect timeout in seconds
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,

    /// Overall timeout in seconds for one-shot commands
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show a table of all units by machine and group
    Units,
    /// Show host and client info
    Info,
    /// Start folding in the specified group or all groups
    Fold,
    /// Finish current work units and pause
    Finish {
        #[arg(long)]
        force: bool,
    },
    /// Pause folding in the specified group or all groups
    Pause,
    /// Live updating units table; q quits, space forces a redraw
    Top,
    /// Show a json snapshot of client state
    State,
    /// Show the json value at a dot-separated key path in client state
    Get { keypath: String },
    /// Show a json array of group names
    Groups,
    /// Show every incoming message; control-c to exit
    Watch,
    /// Show the client log; control-c to exit
    Log,
    /// Get or set a config value
    Config {
        key: String,
        value: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Create the group named in the address if it does not exist
    CreateGroup,
    /// Dump all paused units in the specified group or all groups
    DumpAll {
        #[arg(long)]
        force: bool,
    },
    /// Run until the specified group or all groups are paused
    WaitUntilPaused,
    /// Link the client to an account by token
    LinkAccount {
        token: Option<String>,
        machine_name: Option<String>,
    },
    /// Unlink the client from its account
    UnlinkAccount,
    /// Restart the account/node connection
    RestartAccount,
    /// Enable all unclaimed gpus in the specified group
    EnableAllGpus,
}

impl Command {
    fn multi_peer(&self) -> bool {
        matches!(
            self,
            Command::Units
                | Command::Info
                | Command::Fold
                | Command::Finish { .. }
                | Command::Pause
                | Command::Top
        )
    }

    fn long_lived(&self) -> bool {
        matches!(self, Command::Top | Command::Watch | Command::Log)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let command = args.command.unwrap_or(Command::Units);
    let peers = if command.multi_peer() {
        PeerAddress::parse_list(&args.address)?
    } else {
        if args.address.contains(',') {
            bail!("command takes a single peer address");
        }
        vec![PeerAddress::parse(&args.address)?]
    };

    let opts = SessionOptions {
        connect_timeout: Duration::from_secs(args.connect_timeout),
        reconnect: command.long_lived(),
        ..SessionOptions::default()
    };
    let overall = Duration::from_secs(args.timeout);
    let aggregator = Aggregator::new(peers, opts);

    let outcome = run_command(&aggregator, command, overall).await;
    aggregator.close().await;
    outcome
}

async fn run_command(aggregator: &Aggregator, command: Command, overall: Duration) -> Result<()> {
    match command {
        Command::Units => commands::units(aggregator, overall).await,
        Command::Info => commands::info(aggregator, overall).await,
        Command::Fold => commands::run_state(aggregator, RunIntent::Fold, false, overall).await,
        Command::Finish { force } => {
            commands::run_state(aggregator, RunIntent::Finish, force, overall).await
        }
        Command::Pause => commands::run_state(aggregator, RunIntent::Pause, false, overall).await,
        Command::Top => top::run(aggregator).await,
        Command::State => commands::state(aggregator, overall).await,
        Command::Get { keypath } => commands::get(aggregator, &keypath, overall).await,
        Command::Groups => commands::groups(aggregator, overall).await,
        Command::Watch => commands::watch(aggregator, overall).await,
        Command::Log => commands::log(aggregator, overall).await,
        Command::Config { key, value, force } => {
            commands::config(aggregator, &key, value.as_deref(), force, overall).await
        }
        Command::CreateGroup => commands::create_group(aggregator, overall).await,
        Command::DumpAll { force } => commands::dump_all(aggregator, force, overall).await,
        Command::WaitUntilPaused => commands::wait_until_paused(aggregator, overall).await,
        Command::LinkAccount {
            token,
            machine_name,
        } => {
            commands::link_account(
                aggregator,
                token.as_deref(),
                machine_name.as_deref(),
                overall,
            )
            .await
        }
        Command::UnlinkAccount => commands::unlink_account(aggregator, overall).await,
        Command::RestartAccount => commands::restart_account(aggregator, overall).await,
        Command::EnableAllGpus => commands::enable_all_gpus(aggregator, overall).await,
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FOLDCTL_LOG") {
        level
    } else {
        "warn".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
