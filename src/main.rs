use clap::Parser;
use color_eyre::Result;
use serial_fanout::{
    cli::{self, Commands, Examples},
    config::Config,
    logging, settings, source,
    supervisor::{self, Plan, StopReason, Supervisor},
    virtual_port::PtyFactory,
};
use tracing::{debug, error, info};

fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Examples(Examples::Config) => {
            println!("{}", Config::example().serialize_pretty()?);
        }
        Commands::Examples(Examples::Settings) => {
            print!("{}", settings::example());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        return handle_command(command);
    }

    let mut config = if let Some(config_path) = &cli.config {
        Config::new_from_path(config_path)?
    } else {
        Config::default()
    };

    if let Some(settings) = cli.settings {
        config.settings.path = settings;
    }
    if let Some(source) = cli.source {
        config.source.path = source;
    }

    logging::init(
        config.log_level(),
        config.log_dir.clone().map(|dir| (config.log_level(), dir)),
    )
    .await;

    match &cli.config {
        Some(config_path) => debug!(?config_path, "Config from path"),
        None => debug!("Default config"),
    }

    let resolution = settings::resolve(
        &config.settings.path,
        &config.settings.key,
        config.settings.fallback,
    );

    let factory = PtyFactory {
        remove_on_drop: config.endpoints.remove_on_shutdown,
    };

    let shutdown = async {
        if let Err(e) = supervisor::shutdown_signal().await {
            error!(?e, "Could not listen for signals, only the source going away will stop us");
            futures::future::pending::<()>().await;
        }
    };

    let supervisor = Supervisor::new(Plan::from(&config));
    let outcome = supervisor
        .run(&resolution, source::open(&config.source), &factory, shutdown)
        .await;

    logging::shutdown();

    let outcome = outcome?;

    if let StopReason::SourceLost(why) = &outcome.reason {
        return Err(color_eyre::eyre::eyre!("Source lost: {why}"));
    }

    info!(reason = ?outcome.reason, "Stopped");

    Ok(())
}
