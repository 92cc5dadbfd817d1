use clap::Parser;

use pixel_chat::{ChatServer, Cli};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    log::info!("Starting pixel-chat on {}", config.bind_addr);

    ChatServer::new(config).run().await?;
    Ok(())
}
