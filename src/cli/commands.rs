use anyhow::Result;
use tracing::info;

use crate::server;

use super::config::{check_config, expand_path, load_config};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run { config } => {
            run_proxy(config).await?;
        }
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
    }

    Ok(())
}

/// Run the proxy until Ctrl+C
async fn run_proxy(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;

    info!("Loading proxy configuration from: {}", config_path);
    let proxy_config = load_config(&config_path)?;

    server::run_server(proxy_config).await?;

    Ok(())
}
