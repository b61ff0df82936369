use std::{error::Error, net::IpAddr, path::PathBuf, process};

use clap::{command, Parser, Subcommand, ValueHint};
use log::{debug, error, info, LevelFilter};
use veil::Redact;

use chime::{
    client::Client,
    config::Config,
    error::ErrorKind,
    server::{self, AppState},
    settings::{ConnectionProfile, SettingsStore},
    signal,
    token::TokenStore,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// API token given on the command line, kept out of the debug dump.
#[derive(Clone, PartialEq, Eq, Redact)]
#[redact(all)]
struct ApiToken(String);

impl From<String> for ApiToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Run the playback daemon
    Serve {
        /// Configuration file
        #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, env = "CHIME_CONFIG")]
        config: Option<PathBuf>,

        /// Address to listen on
        ///
        /// [default: 0.0.0.0]
        #[arg(long, env = "CHIME_LISTEN")]
        listen: Option<IpAddr>,

        /// Port to listen on
        ///
        /// [default: 8080]
        #[arg(short, long, env = "CHIME_PORT")]
        port: Option<u16>,

        /// Directory holding the announcement files
        ///
        /// [default: audio]
        #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
        audio_dir: Option<PathBuf>,

        /// Credential file
        ///
        /// [default: token]
        #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
        token_file: Option<PathBuf>,
    },

    /// Generate a new credential and print it once
    ///
    /// Any previously issued credential stops working immediately. Copy the
    /// printed value into the controller's settings.
    IssueToken {
        /// Configuration file to take the credential path from
        #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, env = "CHIME_CONFIG")]
        config: Option<PathBuf>,

        /// Credential file
        ///
        /// [default: token]
        #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
        token_file: Option<PathBuf>,
    },

    /// Show or change the controller's connection settings
    Configure {
        /// Settings file
        #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value = "settings.json", env = "CHIME_SETTINGS")]
        settings: PathBuf,

        /// Host name or IP address of the speaker
        #[arg(short, long, value_hint = ValueHint::Hostname)]
        address: Option<String>,

        /// Port of the speaker
        #[arg(short, long)]
        port: Option<u16>,

        /// API token as printed by `issue-token`
        #[arg(short, long, env = "CHIME_TOKEN", hide_env_values = true)]
        token: Option<ApiToken>,
    },

    /// Ask the speaker to play an announcement
    Announce {
        /// Settings file
        #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value = "settings.json", env = "CHIME_SETTINGS")]
        settings: PathBuf,

        /// Audio file name, for example `dog-arrived.mp3`
        audio: String,
    },
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if args.quiet || args.verbose > 0 {
        let level = match args.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("chime", level);
    }

    logger.init();
}

/// Loads the daemon configuration, falling back to defaults without a file.
fn load_config(path: Option<PathBuf>) -> chime::error::Result<Config> {
    match path {
        Some(path) => {
            info!("reading configuration from {}", path.display());
            Config::from_file(path)
        }
        None => Ok(Config::default()),
    }
}

/// Runs the daemon until a shutdown signal arrives.
async fn serve(config: Config) -> Result<(), Box<dyn Error>> {
    config.validate()?;

    let state = match AppState::from_config(&config) {
        Ok(state) => state,
        Err(e) => {
            if e.kind == ErrorKind::FailedPrecondition {
                info!("run `chime issue-token` to create a credential first");
            }
            return Err(e.into());
        }
    };

    let listener = tokio::net::TcpListener::bind(config.socket_addr()).await?;
    let mut signals = signal::Handler::new()?;

    server::serve(listener, server::router(state), async move {
        let signal = signals.recv().await;
        info!("received {signal}, shutting down gracefully");
    })
    .await?;

    Ok(())
}

/// Issues a new credential and prints it for the operator.
fn issue_token(config: &Config) -> Result<(), Box<dyn Error>> {
    let store = TokenStore::new(&config.token_file);
    if store.exists() {
        info!("replacing existing credential; controllers using it must be updated");
    }

    let credential = store.issue()?;

    println!("Generated API token: {}", credential.expose());
    println!("Save this token securely - it is needed in the controller settings.");
    println!("The token is stored in: {}", store.path().display());

    Ok(())
}

/// Updates the saved connection profile with the given values.
fn configure(
    store: &SettingsStore,
    address: Option<String>,
    port: Option<u16>,
    token: Option<ApiToken>,
) -> Result<(), Box<dyn Error>> {
    let mut profile = store.get();
    let changed = address.is_some() || port.is_some() || token.is_some();

    if let Some(address) = address {
        profile.address = address;
    }
    if let Some(port) = port {
        profile.port = port;
    }
    if let Some(ApiToken(token)) = token {
        profile.credential = token;
    }

    if changed {
        store.save(&profile)?;
        info!("settings saved to {}", store.path().display());
    }

    print_profile(&profile);
    Ok(())
}

fn print_profile(profile: &ConnectionProfile) {
    let address = if profile.address.is_empty() {
        "(not set)"
    } else {
        &profile.address
    };
    let token = if profile.credential.is_empty() {
        "(not set)"
    } else {
        "(set)"
    };

    println!("Speaker address: {address}");
    println!("Speaker port:    {}", profile.port);
    println!("API token:       {token}");
}

/// Dispatches one announcement and reports the outcome.
async fn announce(store: SettingsStore, audio: &str) -> Result<(), Box<dyn Error>> {
    let client = Client::new(store)?;
    let outcome = client.dispatch(audio).await;

    if outcome.is_delivered() {
        println!("{outcome}");
        Ok(())
    } else {
        Err(outcome.to_string().into())
    }
}

/// Main application entry.
///
/// # Errors
///
/// Returns an error when the selected command fails: for the daemon, only
/// when it cannot start; for the client, when the announcement did not play.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    match args.command {
        Command::Serve {
            config,
            listen,
            port,
            audio_dir,
            token_file,
        } => {
            let mut config = load_config(config)?;
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(audio_dir) = audio_dir {
                config.audio_dir = audio_dir;
            }
            if let Some(token_file) = token_file {
                config.token_file = token_file;
            }

            serve(config).await
        }

        Command::IssueToken { config, token_file } => {
            let mut config = load_config(config)?;
            if let Some(token_file) = token_file {
                config.token_file = token_file;
            }

            issue_token(&config)
        }

        Command::Configure {
            settings,
            address,
            port,
            token,
        } => configure(&SettingsStore::new(settings), address, port, token),

        Command::Announce { settings, audio } => {
            announce(SettingsStore::new(settings), &audio).await
        }
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and runs the selected command.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();
    let host = sysinfo::System::host_name().unwrap_or_else(|| String::from("unknown host"));

    info!("starting {name}/{version}; {BUILD_PROFILE}; {host}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
