mod chain;
mod config;
mod genesis;
mod service;
mod validator;

use config::NodeConfig;
use service::CoinjectNode;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::parse_args();

    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(if config.verbose { "debug".parse()? } else { "info".parse()? })).init();

    let mut node = CoinjectNode::new(config).await?;
    node.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c");
        }
        _ = node.wait_for_shutdown() => {}
    }

    Ok(())
}
