use anyhow::Result;
use clap::Parser;
use quota_proxy::cli::config::open_log_file;
use quota_proxy::cli::{execute_command, Cli};
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    // Display version information
    info!("quota-proxy v{}", env!("CARGO_PKG_VERSION"));

    execute_command(&cli).await
}

/// Initialize logging; RUST_LOG takes precedence over --log-level
fn init_logging(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match cli.log_file {
        Some(ref path) => {
            let file = open_log_file(path)?;
            builder.with_writer(Mutex::new(file)).with_ansi(false).init();
        }
        None => builder.init(),
    }

    Ok(())
}
