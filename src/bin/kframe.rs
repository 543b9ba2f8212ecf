//! K-Frame control CLI binary.
//!
//! # Commands
//!
//! - `monitor` - Connect and print session events until interrupted
//! - `macro` - Recall a macro and report its acknowledgement
//! - `aux` - Route a source to an AUX bus
//! - `suite` - Select a suite
//! - `suites` - List known suites
//! - `config` - Print the effective configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kframe::{
    Config, ConnectionEvent, ConnectionState, KFrameClient, Suite, VERSION,
};
use tokio::sync::broadcast::{self, error::RecvError};

/// How long `macro` waits for the device's acknowledgement.
const ACK_WAIT: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "kframe")]
#[command(version = VERSION)]
#[command(about = "K-Frame control client - macros, AUX routing and suites over UDP", long_about = None)]
struct Cli {
    /// Device address (overrides config file and KFRAME_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Config file (default: <config dir>/kframe/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Suite selected after every handshake
    #[arg(long, global = true)]
    suite: Option<Suite>,

    /// Heartbeat interval in milliseconds
    #[arg(long, global = true)]
    keepalive_ms: Option<u64>,

    /// Reconnection attempts before giving up
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON logs and events
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print session events until Ctrl-C
    Monitor,

    /// Recall a macro (1-999)
    Macro {
        /// Macro number
        number: u32,
    },

    /// Route a source to an AUX bus
    Aux {
        /// AUX bus (1-96)
        aux: u32,

        /// Source (1-850)
        source: u32,
    },

    /// Select a suite (e.g. suite2b)
    Suite {
        /// Suite id
        suite: Suite,
    },

    /// List known suites
    Suites,

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let config = load_config(&cli)?;
    let json = cli.json;

    match cli.command {
        Commands::Suites => {
            cmd_suites();
            Ok(())
        },
        Commands::Config => cmd_config(&config),
        command => {
            config.validate()?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run(command, config, json))
        },
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = cli
        .config
        .clone()
        .or_else(|| Config::default_path().filter(|p| p.exists()));

    let mut config = match path {
        Some(path) => Config::from_file(path.clone())
            .with_context(|| format!("Loading {}", path.display()))?,
        None => Config::default(),
    }
    .with_env_overrides();

    if let Some(host) = &cli.host {
        config.device.host.clone_from(host);
    }
    if let Some(suite) = cli.suite {
        config.device.suite = suite;
    }
    if let Some(ms) = cli.keepalive_ms {
        config.session.keepalive_interval_ms = ms;
    }
    if let Some(retries) = cli.max_retries {
        config.session.max_retries = retries;
    }
    Ok(config)
}

async fn run(command: Commands, config: Config, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Monitor => cmd_monitor(&config, json).await,
        Commands::Macro { number } => {
            let client = connect(&config).await?;
            let mut events = client.subscribe();
            let id = client.send_macro(number).await?;
            println!("Macro {number} sent (id {id})");

            match tokio::time::timeout(ACK_WAIT, wait_for_ack(&mut events, id)).await {
                Ok(true) => println!("Acknowledged"),
                _ => println!("No acknowledgement within {ACK_WAIT:?}"),
            }
            client.shutdown().await?;
            Ok(())
        },
        Commands::Aux { aux, source } => {
            let client = connect(&config).await?;
            client.send_aux_route(aux, source).await?;
            println!("Routed source {source} to AUX {aux}");
            client.shutdown().await?;
            Ok(())
        },
        Commands::Suite { suite } => {
            let client = connect(&config).await?;
            client.send_suite_switch(suite).await?;
            // Let the delayed second packet go out before shutting down.
            tokio::time::sleep(kframe::protocol::SUITE_FOLLOW_UP_DELAY * 2).await;
            println!("Selected {}", suite.label());
            client.shutdown().await?;
            Ok(())
        },
        Commands::Suites | Commands::Config => Ok(()),
    }
}

/// Spawn a client and wait for the handshake to complete.
async fn connect(config: &Config) -> anyhow::Result<KFrameClient> {
    let connection = config.connection();
    let deadline = connection.handshake_timeout() + Duration::from_secs(1);

    let (client, _task) = KFrameClient::spawn(connection);
    client.connect().await?;
    client
        .wait_for_state(ConnectionState::Connected, deadline)
        .await
        .with_context(|| format!("No session with {}", config.device.host))?;
    Ok(client)
}

async fn wait_for_ack(events: &mut broadcast::Receiver<ConnectionEvent>, id: u8) -> bool {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::MacroAcknowledged(acked)) if acked == id => return true,
            Ok(_) | Err(RecvError::Lagged(_)) => {},
            Err(RecvError::Closed) => return false,
        }
    }
}

async fn cmd_monitor(config: &Config, json: bool) -> anyhow::Result<()> {
    let (client, _task) = KFrameClient::spawn(config.connection());
    let mut events = client.subscribe();
    client.connect().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event, json)?;
                    if event == ConnectionEvent::StateChanged(ConnectionState::Disconnected) {
                        client.shutdown().await?;
                        anyhow::bail!("Gave up on {}", config.device.host);
                    }
                },
                Err(RecvError::Lagged(n)) => tracing::warn!("Dropped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let stats = client.stats().await?;
    client.shutdown().await?;
    if json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        println!(
            "Sent {} datagrams, received {}, {} heartbeats, {} macro ACKs",
            stats.datagrams_sent,
            stats.datagrams_received,
            stats.heartbeats_sent,
            stats.macros_acknowledged
        );
    }
    Ok(())
}

fn print_event(event: &ConnectionEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        ConnectionEvent::StateChanged(state) => println!("state: {state}"),
        ConnectionEvent::CommandCompleted(result) => match &result.error {
            None => println!("{}: ok", result.command),
            Some(error) => println!("{}: failed ({error})", result.command),
        },
        ConnectionEvent::MacroAcknowledged(id) => println!("macro ack: id {id}"),
        ConnectionEvent::Error(error) => println!("error: {error}"),
    }
    Ok(())
}

fn cmd_suites() {
    println!("Available Suites ({}):", Suite::ALL.len());
    println!();
    for suite in Suite::ALL {
        println!("  {:<10} {}", suite.id(), suite.label());
    }
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
