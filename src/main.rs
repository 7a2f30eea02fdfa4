mod cli;
mod commands;

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, CrdAction, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Err(e) = dispatch(cli).await {
        tracing::error!(error = %e, "fatal error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate(),
            CrdAction::Install => commands::crd::install().await,
        },
        Commands::Check => commands::check::run().await,
        Commands::List => commands::list::run(cli.namespace.as_deref()).await,
        Commands::Reconcile {
            metrics_bind_address,
            health_probe_bind_address,
            leader_elect,
        } => {
            let defaults = loadtest_operator::config::load_defaults(std::path::Path::new(&cli.defaults_file))?;
            let opts = commands::reconcile::Options {
                namespace: cli.namespace,
                defaults,
                metrics_bind_address: parse_bind_address(&metrics_bind_address)?,
                health_probe_bind_address: parse_bind_address(&health_probe_bind_address)?,
                leader_elect,
            };
            commands::reconcile::run(opts).await
        }
        Commands::Cleanup {
            metrics_bind_address,
            health_probe_bind_address,
            leader_elect,
        } => {
            let opts = commands::cleanup::Options {
                namespace: cli.namespace,
                metrics_bind_address: parse_bind_address(&metrics_bind_address)?,
                health_probe_bind_address: parse_bind_address(&health_probe_bind_address)?,
                leader_elect,
            };
            commands::cleanup::run(opts).await
        }
    }
}

/// Accepts either a full `host:port` address or a bare `:port` shorthand,
/// binding the latter to all interfaces.
fn parse_bind_address(raw: &str) -> anyhow::Result<SocketAddr> {
    let candidate = if let Some(port) = raw.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        raw.to_string()
    };
    candidate
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address '{raw}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind_address_shorthand() {
        let addr = parse_bind_address(":8080").unwrap();
        assert_eq!(addr.port(), 8080);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
    }

    #[test]
    fn test_parse_bind_address_full() {
        let addr = parse_bind_address("127.0.0.1:9090").unwrap();
        assert_eq!(addr.port(), 9090);
    }

    #[test]
    fn test_parse_bind_address_invalid() {
        assert!(parse_bind_address("not-an-address").is_err());
    }
}
