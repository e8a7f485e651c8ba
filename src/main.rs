// src/main.rs
// Small demo: send one order through the configured broker and read it back

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use amq_messenger::config::{self, CONFIG_FILE_NAME};
use amq_messenger::env::EnvConfig;
use amq_messenger::{logging, BrokerMessenger, Message, Messenger, Properties};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let mut args = std::env::args().skip(1);
    if let Some(command) = args.next() {
        if command == "init-config" {
            let path = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            config::create_default_config_file(&path)?;
            println!("Configuration file created at: {}", path.display());
            return Ok(());
        }
        warn!("Unknown command '{}', running the demo", command);
    }

    let env_config = EnvConfig::load().context("Failed to read MESSENGER_* settings")?;

    // A config file, when present, supplies the URI and the connection defaults
    let (broker_uri, properties) = match config::load_config() {
        Ok(file) => {
            info!("Using configuration file for broker {}", file.connection.uri);
            let properties = file.to_properties();
            (file.connection.uri, properties)
        }
        Err(reason) => {
            info!("No configuration file ({}), using environment settings", reason);
            (env_config.broker_uri.clone(), env_config.connection_properties())
        }
    };

    let messenger = BrokerMessenger::for_address(&broker_uri)?;
    messenger.connect(&broker_uri, &properties).await?;

    let outcome = run_demo(&messenger, &env_config.queue).await;
    messenger.shutdown().await?;
    outcome
}

async fn run_demo(messenger: &BrokerMessenger, queue: &str) -> Result<()> {
    let sender = messenger.create_sender(queue, &Properties::new()).await?;
    let receiver = messenger.create_receiver(queue, &Properties::new()).await?;

    let order = Message::new(r#"{"order_id":42,"sku":"A-17","quantity":3}"#)
        .with_header("message_type", "order_created");
    messenger.send_message(sender, &order).await?;
    info!("Published order to {}", queue);

    let received = messenger
        .receive_message_timeout(receiver, std::time::Duration::from_secs(5))
        .await?;
    info!(
        message_type = received.header("message_type").unwrap_or("-"),
        payload = received.payload_str().unwrap_or("<binary>"),
        "Received order"
    );

    messenger.close_sender(sender).await?;
    messenger.close_receiver(receiver).await?;
    Ok(())
}
