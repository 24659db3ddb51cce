//! RMI Server binary - runs the device-side command server

use log::info;
use rmi::{config, Server, ServerExit};
use std::path::Path;

#[tokio::main]
async fn main() -> rmi::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 3 {
        eprintln!("Command line error: too many options.");
        std::process::exit(1);
    }
    let port = if args.len() > 1 {
        match args[args.len() - 1].parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => {
                eprintln!("Command line error: invalid port.");
                std::process::exit(1);
            }
        }
    } else {
        rmi::DEFAULT_PORT
    };

    let credentials = config::load_credentials(Path::new(config::DEFAULT_CONFIG_PATH))?;
    let server = Server::new(port, credentials);

    match server.run().await? {
        ServerExit::Shutdown => {
            info!("server shut down");
            Ok(())
        }
        ServerExit::Restart => {
            info!("restarting in place");
            // exec only returns on failure
            Err(rmi::server::restart_process().into())
        }
    }
}
