use anyhow::Result;
use clap::Parser;
use lmconnect::{
    ConfigurationPlan, ConsoleInput, DeviceSelector, KeyboardInputHandler, LmConnectConfig,
    LmConnectError, ScriptedInput, SelectionInput, SessionController, SessionOutcome, SimulatedSdk,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "lmconnect")]
#[command(about = "Launch monitor session demo: discover, connect, configure and collect shots")]
#[command(version)]
#[command(long_about = "Authorizes with the launch monitor SDK, lets the operator pick one of the \
discovered launch monitors, applies the configured settings and logs every shot until the target \
number of shots has been received. Shot videos are saved under the per-user application directory.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "lmconnect.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without connecting")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Override the number of shots to collect
    #[arg(long, value_name = "COUNT", help = "Final shots to collect before disconnecting")]
    shots: Option<u32>,

    /// Answer the device menu non-interactively
    #[arg(long, value_name = "CHOICE", help = "Menu choice to use instead of prompting (1-based, last entry is None)")]
    select: Option<String>,

    /// Exit without waiting for a key press
    #[arg(long, help = "Exit immediately instead of waiting for a key press")]
    no_wait: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting lmconnect v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = match LmConnectConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Some(shots) = args.shots {
        config.session.target_shots = shots;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    if args.validate_config {
        println!("✓ Configuration is valid");
        return Ok(());
    }

    let credentials = match config.credentials.resolve() {
        Ok(credentials) => credentials,
        Err(e) => {
            error!("{}", e);
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    };

    let cancellation_token = CancellationToken::new();
    spawn_signal_handler(cancellation_token.clone());

    let sdk = Arc::new(SimulatedSdk::new(config.simulator.clone()));
    let plan = ConfigurationPlan::from_config(&config.device);
    let mut controller =
        SessionController::new(config, sdk).with_cancellation_token(cancellation_token.clone());

    let result = match args.select.clone() {
        Some(choice) => {
            let mut selector = DeviceSelector::new(ScriptedInput::new([choice]));
            run_session(&mut controller, &credentials, &mut selector, &plan).await
        }
        None => {
            let mut selector = DeviceSelector::new(ConsoleInput::new());
            run_session(&mut controller, &credentials, &mut selector, &plan).await
        }
    };

    let exit_code = match result {
        Ok(outcome) => {
            info!("Session ended: {}", outcome);
            outcome.exit_code()
        }
        Err(LmConnectError::Authorization { message }) => {
            error!("Authorization failed: {}", message);
            1
        }
        Err(e) => {
            error!("Session error: {}", e);
            1
        }
    };

    if !args.no_wait && !cancellation_token.is_cancelled() {
        println!("Press any key to exit");
        let keyboard = KeyboardInputHandler::with_cancellation_token(cancellation_token.clone());
        if let Err(e) = keyboard.wait_for_any_key().await {
            warn!("Could not wait for a key press: {}", e);
        }
    }

    info!("lmconnect exited with code: {}", exit_code);
    std::process::exit(exit_code);
}

async fn run_session<I: SelectionInput>(
    controller: &mut SessionController,
    credentials: &lmconnect::Credentials,
    selector: &mut DeviceSelector<I>,
    plan: &ConfigurationPlan,
) -> lmconnect::Result<SessionOutcome> {
    let outcome = controller.run(credentials, selector, plan).await;
    // Covers errors raised outside the controller's own teardown paths
    controller.teardown().await;
    outcome
}

/// Cancel the session on Ctrl+C
fn spawn_signal_handler(cancellation_token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, ending session");
                cancellation_token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Shot dumps are logged at info, so that is the default
    let log_level = if args.debug {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lmconnect={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("pretty") => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some("compact") | None => fmt::layer()
            .compact()
            .with_target(args.verbose || args.debug)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# lmconnect configuration file");
    println!("# Every key is optional; environment variables such as");
    println!("# LMCONNECT_SESSION__TARGET_SHOTS override file values.");
    println!("# Credentials may also come from LMCONNECT_ACCOUNT_ID and LMCONNECT_ACCOUNT_KEY.");
    println!();
    println!("{}", toml::to_string_pretty(&LmConnectConfig::default())?);
    Ok(())
}
