use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use netbridge::{Config, Role};

mod command;

#[derive(Debug, clap::Parser)]
#[command(name = "netbridge", version)]
#[command(about = "Expose services across network boundaries through a WebSocket tunnel.", long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,

    #[command(subcommand)]
    command: command::Command,
}

fn init_logger(config: &Config, verbosity: &Verbosity) {
    use tracing::level_filters::LevelFilter;

    let default_level = config
        .log
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    let mut env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("NETBRIDGE_LOG")
        .from_env_lossy();

    if verbosity.is_present() {
        let level_filter = match verbosity.log_level_filter() {
            clap_verbosity_flag::LevelFilter::Off => LevelFilter::OFF,
            clap_verbosity_flag::LevelFilter::Error => LevelFilter::ERROR,
            clap_verbosity_flag::LevelFilter::Warn => LevelFilter::WARN,
            clap_verbosity_flag::LevelFilter::Info => LevelFilter::INFO,
            clap_verbosity_flag::LevelFilter::Debug => LevelFilter::DEBUG,
            clap_verbosity_flag::LevelFilter::Trace => LevelFilter::TRACE,
        };
        env_filter = env_filter.add_directive(level_filter.into());
    }

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    match &config.log.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .expect("failed to open the configured log file");
            let writer = std::sync::Arc::new(file);
            if config.log.json {
                builder.json().with_writer(writer).init();
            } else {
                builder.with_ansi(false).with_writer(writer).init();
            }
        }
        None => {
            if config.log.json {
                builder.json().init();
            } else {
                builder.init();
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (role, common) = match &cli.command {
        command::Command::Server(args) => (Role::Server, &args.config),
        command::Command::Client(args) => (Role::Client, &args.config),
    };
    let config = Config::load(common.to_overrides(role)?)?;
    init_logger(&config, &cli.verbose);

    match &cli.command {
        command::Command::Server(_) => command::server::execute(config).await?,
        command::Command::Client(_) => command::client::execute(config).await?,
    }

    Ok(())
}
