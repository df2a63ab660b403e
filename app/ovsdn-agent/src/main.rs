use std::{error::Error, process::exit};

use kube::Client;
use log::{error, info, LevelFilter};

use crate::config::NodeConfig;

mod cniserver;
mod config;
mod master;
mod node;
mod watchers;

#[tokio::main()]
async fn main() -> Result<(), Box<dyn Error>> {
    configure_logger();

    let args = std::env::args().collect::<Vec<String>>();
    let mode = match args.get(1) {
        Some(val) => val.as_str(),
        None => {
            error!("Missing deployment mode (should be master or node)!");
            exit(1)
        }
    };

    let client = create_client().await;

    match mode {
        "master" => {
            info!("Starting agent in master mode...");
            master::main_master(client).await
        }
        "node" => {
            info!("Starting agent in node mode...");
            let config = get_node_config();
            node::main_node(client, config).await
        }
        _ => {
            error!("Unsupported deployment mode!");
            exit(1)
        }
    };

    info!("Exiting...");

    Ok(())
}

async fn create_client() -> Client {
    match Client::try_default().await {
        Ok(client) => client,
        Err(error) => {
            error!("Couldn't create the client! {error:?}");
            exit(6)
        }
    }
}

fn get_node_config() -> NodeConfig {
    match NodeConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!("Couldn't retrieve node configuration! {error:?}");
            exit(7)
        }
    }
}

fn configure_logger() {
    env_logger::builder()
        .default_format()
        .format_module_path(false)
        .filter_level(LevelFilter::Info)
        .init()
}
