//! `keel-agentd`: the per-node peer agent binary (§4.C, §6). Runs the
//! `keel_core::fabric::peer` HTTP service that the controller's agent
//! fabric dials to dispatch, stop, abort, and poll phases.

use clap::Parser;

use keel_core::fabric::PeerState;
use keel_core::fabric::peer::run_peer;
use keel_core::token::TokenConfig;

#[derive(Parser)]
#[command(name = "keel-agentd", about = "Peer agent for a cluster-lifecycle operation controller")]
struct Cli {
    /// Address to bind the peer agent's HTTP listener to.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to bind the peer agent's HTTP listener to.
    #[arg(long, default_value_t = 7777)]
    port: u16,

    /// This node's address as reachable by the controller, reported on
    /// `GET /status` and recorded by the controller when it dials in.
    #[arg(long)]
    advertise_ip: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let token_config = TokenConfig::from_env()?;
    let state = PeerState::new(token_config, cli.advertise_ip);

    run_peer(state, &cli.bind, cli.port).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_required_advertise_ip() {
        let cli = Cli::parse_from(["keel-agentd", "--advertise-ip", "10.0.0.5"]);
        assert_eq!(cli.advertise_ip, "10.0.0.5");
        assert_eq!(cli.bind, "0.0.0.0");
        assert_eq!(cli.port, 7777);
    }

    #[test]
    fn cli_parses_custom_bind_and_port() {
        let cli = Cli::parse_from([
            "keel-agentd",
            "--advertise-ip",
            "10.0.0.5",
            "--bind",
            "127.0.0.1",
            "--port",
            "9000",
        ]);
        assert_eq!(cli.bind, "127.0.0.1");
        assert_eq!(cli.port, 9000);
    }

    #[test]
    fn cli_requires_advertise_ip() {
        let result = Cli::try_parse_from(["keel-agentd"]);
        assert!(result.is_err());
    }
}
