//! RMI Client binary - command line controller for a remote device

use rmi::{ClientConfig, ClientStatus, RmiClient, RmiError};
use std::time::Duration;

/// How long commands may take end to end before the CLI gives up
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

struct Options {
    user: String,
    pass: String,
    args: Vec<String>,
}

/// Pull `--user`/`--pass` out of the argument list
fn parse_options(args: Vec<String>) -> Options {
    let mut user = "l16".to_string();
    let mut pass = "l16".to_string();
    let mut rest = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--user" | "-u" => {
                if let Some(value) = iter.next() {
                    user = value;
                }
            }
            "--pass" | "-p" => {
                if let Some(value) = iter.next() {
                    pass = value;
                }
            }
            _ => rest.push(arg),
        }
    }
    Options { user, pass, args: rest }
}

#[tokio::main]
async fn main() -> rmi::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = parse_options(std::env::args().skip(1).collect());
    let Some(command) = options.args.first().cloned() else {
        print_usage();
        return Ok(());
    };

    run_command(&command, &options).await
}

async fn run_command(command: &str, options: &Options) -> rmi::Result<()> {
    let args = &options.args;
    match command {
        "version" => {
            let mut client = connect(options, get_addr(args, 1)).await?;
            let before = client.version_info().revision;
            client.send_version();
            wait_for(&client, || client.version_info().revision != before).await?;
            let info = client.version_info();
            match info.version {
                Some(version) if info.error.is_empty() => {
                    println!("Server version: {}", version)
                }
                _ => println!("Version request failed: {}", info.error),
            }
            client.disconnect().await;
        }

        "screencap" => {
            let mut client = connect(options, get_addr(args, 2)).await?;
            let before = client.screencap_revision();
            client.send_screencap();
            wait_for(&client, || {
                client.screencap_revision() != before || !client.last_error().is_empty()
            })
            .await?;
            if client.screencap_revision() == before {
                println!("Screencap failed: {}", client.last_error());
            } else if let Some(output) = args.get(2) {
                let (png, _) = client.screencap_png().ok_or_else(|| {
                    RmiError::Decode("screencap store is empty".to_string())
                })?;
                std::fs::write(output, png)?;
                println!("Screencap saved to: {}", output);
            } else {
                let path = client.save_last_screencap()?;
                println!("Screencap saved to: {}", path.display());
            }
            client.disconnect().await;
        }

        "list" => {
            let Some(path) = args.get(1) else {
                println!("Usage: rmi-client list <path> [server_addr]");
                return Ok(());
            };
            let mut client = connect(options, get_addr(args, 2)).await?;
            client.request_file_list(path);
            wait_for(&client, || client.file_list(path).is_some()).await?;
            let listing = client.file_list(path).unwrap_or_default();
            if !listing.error.is_empty() {
                println!("List failed: {}", listing.error);
            } else {
                println!("{:<6} {:<40} {}", "Type", "Name", "Size");
                println!("{}", "-".repeat(60));
                for entry in listing.entries {
                    if entry.is_dir {
                        println!("{:<6} {:<40}", "dir", entry.name);
                    } else {
                        println!("{:<6} {:<40} {}", "file", entry.name, entry.size);
                    }
                }
            }
            client.disconnect().await;
        }

        "download" => {
            let (Some(remote), Some(local)) = (args.get(1), args.get(2)) else {
                println!("Usage: rmi-client download <remote_path> <local_path> [server_addr]");
                return Ok(());
            };
            let mut client = connect(options, get_addr(args, 3)).await?;
            client.request_download(remote);
            wait_for(&client, || {
                client
                    .download_progress(remote)
                    .is_some_and(|progress| !progress.in_progress)
            })
            .await?;
            let result = client.take_download_data(remote).ok_or_else(|| {
                RmiError::Decode("download store is empty".to_string())
            })?;
            if !result.error.is_empty() {
                println!("Download failed: {}", result.error);
            } else {
                std::fs::write(local, &result.data)?;
                println!("Downloaded {} bytes to {}", result.data.len(), local);
            }
            client.disconnect().await;
        }

        "upload" | "upload-restart" => {
            let (Some(local), Some(remote)) = (args.get(1), args.get(2)) else {
                println!("Usage: rmi-client {} <local_path> <remote_path> [server_addr]", command);
                return Ok(());
            };
            let mut client = connect(options, get_addr(args, 3)).await?;
            if command == "upload-restart" {
                client.send_upload_and_restart(local, remote);
                wait_for(&client, || {
                    client.status() != ClientStatus::Connected || !client.last_error().is_empty()
                })
                .await?;
                match client.status() {
                    ClientStatus::Disconnected => println!("Uploaded and restarted the server"),
                    _ => println!("Upload failed: {}", client.last_error()),
                }
            } else {
                client.send_upload(local, remote);
                fence(&client).await?;
                match client.last_error().as_str() {
                    "" => println!("Uploaded {} to {}", local, remote),
                    error => println!("Upload failed: {}", error),
                }
            }
            client.disconnect().await;
        }

        "press" | "press-input" => {
            let Some(keycode) = args.get(1).and_then(|arg| arg.parse::<i32>().ok()) else {
                println!("Usage: rmi-client {} <keycode> [server_addr]", command);
                return Ok(());
            };
            let mut client = connect(options, get_addr(args, 2)).await?;
            if command == "press" {
                client.send_press(keycode);
            } else {
                client.send_press_input(keycode);
            }
            fence(&client).await?;
            match client.last_error().as_str() {
                "" => println!("Sent keycode {}", keycode),
                error => println!("Key press failed: {}", error),
            }
            client.disconnect().await;
        }

        "open" => {
            let Some(target) = args.get(1) else {
                println!("Usage: rmi-client open <target> [server_addr]");
                return Ok(());
            };
            let mut client = connect(options, get_addr(args, 2)).await?;
            client.send_open(target);
            fence(&client).await?;
            match client.last_error().as_str() {
                "" => println!("Opened {}", target),
                error => println!("Open failed: {}", error),
            }
            client.disconnect().await;
        }

        "delete" => {
            let Some(path) = args.get(1) else {
                println!("Usage: rmi-client delete <path> [server_addr]");
                return Ok(());
            };
            let mut client = connect(options, get_addr(args, 2)).await?;
            client.request_delete(path);
            fence(&client).await?;
            match client.last_error().as_str() {
                "" => println!("Deleted {}", path),
                error => println!("Delete failed: {}", error),
            }
            client.disconnect().await;
        }

        "quit" | "restart" => {
            let mut client = connect(options, get_addr(args, 1)).await?;
            if command == "quit" {
                client.send_quit();
            } else {
                client.send_restart();
            }
            wait_for(&client, || {
                client.status() != ClientStatus::Connected || !client.last_error().is_empty()
            })
            .await?;
            match client.status() {
                ClientStatus::Disconnected => println!("Server acknowledged {}", command),
                _ => println!("{} failed: {}", command, client.last_error()),
            }
            client.disconnect().await;
        }

        _ => print_usage(),
    }
    Ok(())
}

/// Connect and wait for the worker to finish authenticating
async fn connect(options: &Options, addr: String) -> rmi::Result<RmiClient> {
    let (host, port) = parse_addr(&addr)?;
    let mut client = RmiClient::new();
    client
        .connect(ClientConfig {
            host,
            port,
            username: options.user.clone(),
            password: options.pass.clone(),
        })
        .await;
    wait_for(&client, || client.status() != ClientStatus::Connecting).await?;
    if client.status() != ClientStatus::Connected {
        return Err(RmiError::Protocol(client.last_error()));
    }
    Ok(client)
}

/// Requests are served strictly in order, so a completed `VERSION`
/// round-trip proves every previously queued command finished too
async fn fence(client: &RmiClient) -> rmi::Result<()> {
    let before = client.version_info().revision;
    client.send_version();
    wait_for(client, || client.version_info().revision != before).await
}

async fn wait_for(client: &RmiClient, mut done: impl FnMut() -> bool) -> rmi::Result<()> {
    let deadline = tokio::time::Instant::now() + COMMAND_TIMEOUT;
    while !done() {
        if client.status() == ClientStatus::Error {
            return Err(RmiError::Protocol(client.last_error()));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RmiError::Timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

fn get_addr(args: &[String], index: usize) -> String {
    args.get(index)
        .cloned()
        .unwrap_or_else(|| format!("127.0.0.1:{}", rmi::DEFAULT_PORT))
}

fn parse_addr(addr: &str) -> rmi::Result<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| RmiError::Protocol(format!("Invalid port in {}", addr)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), rmi::DEFAULT_PORT)),
    }
}

fn print_usage() {
    println!("RMI Client - remote device controller");
    println!();
    println!("Usage: rmi-client [--user <name>] [--pass <password>] <command> [args...]");
    println!();
    println!("Commands:");
    println!("  version [server_addr]                         Query the server build version");
    println!("  screencap [output.png] [server_addr]          Capture the screen");
    println!("  list <path> [server_addr]                     List a remote directory");
    println!("  download <remote> <local> [server_addr]       Fetch a remote file");
    println!("  upload <local> <remote> [server_addr]         Push a local file");
    println!("  upload-restart <local> <remote> [server_addr] Replace the server binary and restart it");
    println!("  press <keycode> [server_addr]                 Inject a key event (evdev)");
    println!("  press-input <keycode> [server_addr]           Inject a key event (input command)");
    println!("  open <target> [server_addr]                   Launch an app");
    println!("  delete <path> [server_addr]                   Recursively delete a remote path");
    println!("  quit [server_addr]                            Shut the server down");
    println!("  restart [server_addr]                         Ask the server to re-exec itself");
    println!();
    println!("Default server address: 127.0.0.1:{}", rmi::DEFAULT_PORT);
    println!("Default credentials: l16/l16");
}
