//! RMI - remote management protocol core
//!
//! A length-prefixed bidirectional command protocol spoken over TCP
//! between a single-client server running on a target device and one or
//! more controller clients. The server authenticates, dispatches
//! commands (key injection, app launching, file transfer, screen
//! capture) and emits idle heartbeats; the client owns its socket in a
//! background worker and exposes thread-safe snapshots to a UI.
//!
//! # Example - Server
//!
//! ```rust,no_run
//! use rmi::{config, Server, ServerExit};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> rmi::Result<()> {
//!     let credentials = config::load_credentials(Path::new(config::DEFAULT_CONFIG_PATH))?;
//!     let server = Server::new(rmi::DEFAULT_PORT, credentials);
//!     match server.run().await? {
//!         ServerExit::Shutdown => Ok(()),
//!         ServerExit::Restart => Err(rmi::server::restart_process().into()),
//!     }
//! }
//! ```
//!
//! # Example - Client
//!
//! ```rust,no_run
//! use rmi::{ClientConfig, ClientStatus, RmiClient};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut client = RmiClient::new();
//!     client
//!         .connect(ClientConfig {
//!             host: "192.168.1.16".to_string(),
//!             port: rmi::DEFAULT_PORT,
//!             username: "l16".to_string(),
//!             password: "l16".to_string(),
//!         })
//!         .await;
//!
//!     // The worker authenticates in the background; poll the snapshots.
//!     while client.status() == ClientStatus::Connecting {
//!         tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//!     }
//!     client.send_version();
//!     client.request_file_list("/data/local/tmp");
//!     client.disconnect().await;
//! }
//! ```

pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod input;
pub mod protocol;
pub mod server;
pub mod types;

// Re-export commonly used types
pub use client::RmiClient;
pub use config::Credentials;
pub use error::{Result, RmiError};
pub use protocol::{DEFAULT_PORT, SERVER_VERSION};
pub use server::{Server, ServerExit};
pub use types::{ClientConfig, ClientStatus, FileEntry};
