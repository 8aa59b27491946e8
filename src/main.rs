use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use vendabot::bot;
use vendabot::channels::TelegramChannel;
use vendabot::config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("VENDABOT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(Path::new(&config_path))?;
    config.validate()?;

    let transport = Arc::new(TelegramChannel::new(config.telegram.token.clone()));
    let (purchase_bot, _flow) = bot::build(&config, transport.clone())?;

    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let mut listener = tokio::spawn({
        let transport = Arc::clone(&transport);
        async move { transport.listen(tx).await }
    });
    let mut runner = tokio::spawn(purchase_bot.run(rx));

    tracing::info!("vendabot is up");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
        result = &mut listener => {
            match result {
                Ok(Err(e)) => tracing::error!("update listener stopped: {e}"),
                Ok(Ok(())) => tracing::warn!("update listener ended"),
                Err(e) => tracing::error!("update listener panicked: {e}"),
            }
        }
        _ = &mut runner => {
            tracing::warn!("event loop ended");
        }
    }

    listener.abort();
    runner.abort();
    Ok(())
}
