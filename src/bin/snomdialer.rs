use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use snomdialer::{
    app::{AppBuilder, Command, PhoneBridge},
    callback::ActionRules,
    config::Config,
    keyevent::DialRequest,
    net_tool, version,
};
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    author,
    version = version::get_short_version(),
    about = "Remote dialer and Action URL bridge for Snom desk phones",
    long_about = version::get_version_info()
)]
struct Cli {
    #[clap(
        long,
        global = true,
        default_value = "snomdialer.toml",
        help = "Path to the configuration file (TOML format)"
    )]
    conf: String,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the callback server and provision the phone's Action URLs
    Serve,
    /// Let the phone dial a number
    Dial { number: String },
    /// Send a key-event program, e.g. "9;1;ENTER,,1000;*,1000,2000"
    Keyevent {
        /// Treat the parameter as a plain number keyed in digit by digit
        #[clap(long)]
        digits: bool,
        sequence: String,
    },
    /// Hang up the active call, optionally selecting a line first
    Hangup { line: Option<String> },
    /// Release every call on the phone
    #[command(name = "hangup_all", alias = "hangup-all")]
    HangupAll,
    /// Check that the phone answers with the configured credentials
    TestConnection,
    /// Push the Action URLs to the phone once and print the result
    Provision,
    /// Validate configuration and exit
    CheckConfig,
}

impl Commands {
    /// Phone control subcommands, mapped through the batch command surface.
    fn phone_command(&self) -> Option<snomdialer::Result<Command>> {
        let command = match self {
            Commands::Dial { number } => Command::parse("dial", Some(number.as_str())),
            Commands::Keyevent {
                digits: true,
                sequence,
            } => Ok(Command::KeyEvent(DialRequest::immediate(sequence.as_str()))),
            Commands::Keyevent { sequence, .. } => {
                Command::parse("keyevent", Some(sequence.as_str()))
            }
            Commands::Hangup { line } => Command::parse("hangup", line.as_deref()),
            Commands::HangupAll => Command::parse("hangup_all", None),
            _ => return None,
        };
        Some(command)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    dotenv().ok();
    let cli = Cli::parse();

    if !Path::new(&cli.conf).exists() {
        Config::template().save(&cli.conf)?;
        eprintln!(
            "Couldn't find config, so a template was written to {}. \
             Please fill in your configuration and start again.",
            cli.conf
        );
        std::process::exit(1);
    }
    let config = Config::load(&cli.conf)?;

    let mut env_filter = EnvFilter::from_default_env();
    if let Some(Ok(level)) = config
        .log_level
        .as_ref()
        .map(|level| level.parse::<LevelFilter>())
    {
        env_filter = env_filter.add_directive(level.into());
    }

    let mut guard_holder = None;
    if let Some(ref log_file) = config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| anyhow::anyhow!("{}: {}", e, log_file))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        guard_holder = Some(guard);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;
    }
    let _ = guard_holder; // keep the guard alive

    if let Some(command) = cli.command.phone_command() {
        return run_command(&config, command).await;
    }

    match cli.command {
        Commands::Serve => serve(config, &cli.conf).await,
        Commands::TestConnection => {
            let bridge = PhoneBridge::new(&config.phone)?;
            match bridge.test_connection().await {
                Ok(()) => {
                    println!("Phone at {} is reachable.", config.phone.host);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("Connection test failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Provision => {
            let bridge = PhoneBridge::new(&config.phone)?;
            let host = net_tool::advertise_host(
                config.callback.advertise_host.as_deref(),
                &config.phone.host,
            )
            .await?;
            let base = format!("http://{}:{}", host, config.callback.port);
            let report = bridge.provision(&base).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_complete() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::CheckConfig => check_config(&config),
        Commands::Dial { .. }
        | Commands::Keyevent { .. }
        | Commands::Hangup { .. }
        | Commands::HangupAll => Ok(()),
    }
}

async fn run_command(config: &Config, command: snomdialer::Result<Command>) -> Result<()> {
    let command = match command {
        Ok(command) => command,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(2);
        }
    };
    let bridge = PhoneBridge::new(&config.phone)?;
    if let Err(e) = bridge.execute(&command).await {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    let mut issues = Vec::new();
    if config.phone.host.trim().is_empty() {
        issues.push("phone.host: must not be empty".to_string());
    }
    if let Err(e) = config.callback.bind_addr.parse::<IpAddr>() {
        issues.push(format!("callback.bind_addr: {}", e));
    }
    for name in config.actions.keys() {
        if let Err(e) = name.parse::<snomdialer::event::PhoneEvent>() {
            issues.push(format!("actions.{}: {}", name, e));
        }
    }
    if issues.is_empty() {
        let rules = ActionRules::from_config(&config.actions);
        println!(
            "Configuration is valid; {} action rule(s), profile {}.",
            rules.len(),
            config.phone.profile.version
        );
        return Ok(());
    }
    eprintln!("Configuration validation failed:");
    for issue in issues {
        eprintln!("- {}", issue);
    }
    std::process::exit(1);
}

#[cfg(unix)]
async fn reload_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("failed to install SIGHUP handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn reload_signal() {
    std::future::pending::<()>().await;
}

async fn serve(config: Config, config_path: &str) -> Result<()> {
    info!("{}", version::get_version_info());
    let app = AppBuilder::new(config)
        .with_config_path(config_path)
        .start()
        .await?;

    info!(
        addr = %app.local_addr(),
        port = app.binding.bound_port,
        callback = app.callback_base.as_deref().unwrap_or("-"),
        "snomdialer ready"
    );
    if let Some(ref report) = app.report {
        if !report.is_complete() {
            warn!("some action urls could not be provisioned, see above");
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received CTRL+C, shutting down");
                break;
            }
            _ = reload_signal() => {
                match Config::load(config_path) {
                    Ok(config) => app.reload_rules(&config),
                    Err(e) => warn!("failed to reload config: {}", e),
                }
            }
        }
    }

    app.stop().await?;
    Ok(())
}
