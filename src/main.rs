mod cli;

use ai_connect::config::AppConfig;
use ai_connect::transport::HttpTransport;
use ai_connect::AiClient;
use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "ai_connect=debug",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("AI_CONNECT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Build a client for the configured platform.
fn create_client(config: &AppConfig) -> Result<AiClient> {
    let api_key = config.api_key()?;
    let options = config.client_options();
    let mut client = AiClient::with_transport(HttpTransport::with_options(&options), options);

    client
        .begin_with_endpoint(
            &config.ai.platform,
            &api_key,
            &config.ai.model,
            config.ai.endpoint.as_deref().unwrap_or_default(),
        )
        .with_context(|| format!("Failed to set up platform '{}'", config.ai.platform))?;

    if let Some(pem) = config.root_ca_pem()? {
        client.set_root_ca(Some(&pem));
    }
    Ok(client)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Auto-generate config file on first run
    let config_path = AppConfig::config_path()?;
    if !config_path.exists() {
        let path = AppConfig::save_default()?;
        eprintln!("[Config] Created default config: {}", path.display());
        eprintln!("[Config] Edit it to set your platform, model and api_key.");
    }

    let mut config = AppConfig::load()?;
    cli.apply_to_config(&mut config);
    tracing::debug!(
        platform = %config.ai.platform,
        model = %config.ai.model,
        endpoint = config.ai.endpoint.as_deref().unwrap_or("(default)"),
        "configuration loaded"
    );

    let mut client = create_client(&config)?;
    cli.apply_to_client(&mut client, config.ai.system_role.as_deref());

    match &cli.command {
        Commands::Chat { message } => cli::run_chat(&mut client, message),
        Commands::Stream { message } => cli::run_stream(&mut client, message),
        Commands::Tools(args) => cli::run_tools(&mut client, args),
    }
}
