//! Server credential config
//!
//! Credentials live in a plain-text file on the device. Three layouts are
//! accepted: `username=USER` / `password=PASS` pairs, a single `USER:PASS`
//! (or whitespace-separated) line, or the username on the first line and
//! the password on the second. Blank lines and `#` comments are skipped.

use crate::error::{Result, RmiError};
use log::{info, warn};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Default location of the credential file on the device
pub const DEFAULT_CONFIG_PATH: &str = "/data/local/tmp/rmi.config";

pub const DEFAULT_USERNAME: &str = "l16";
pub const DEFAULT_PASSWORD: &str = "l16";

/// Longest accepted username or password, in bytes
const MAX_FIELD_LEN: usize = 128;

/// Credentials the server authenticates clients against; compared as
/// opaque bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// True when the offered pair matches byte-for-byte
    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.username.as_bytes() == username.as_bytes()
            && self.password.as_bytes() == password.as_bytes()
    }
}

/// Load credentials from `path`.
///
/// A missing file is replaced with a default config (and the defaults are
/// returned); any other malformed or incomplete config is fatal.
pub fn load_credentials(path: &Path) -> Result<Credentials> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            write_default_config(path)?;
            info!("Created default config: {}", path.display());
            return Ok(Credentials {
                username: DEFAULT_USERNAME.to_string(),
                password: DEFAULT_PASSWORD.to_string(),
            });
        }
        Err(err) => {
            return Err(RmiError::Config(format!(
                "Unable to read {}: {}",
                path.display(),
                err
            )))
        }
    };

    let mut username = String::new();
    let mut password = String::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(value) = line.strip_prefix("username=") {
            username = checked_field(value.trim())?;
            continue;
        }
        if let Some(value) = line.strip_prefix("password=") {
            password = checked_field(value.trim())?;
            continue;
        }

        if username.is_empty() && password.is_empty() {
            let split = line
                .find(':')
                .or_else(|| line.find(|c: char| c == ' ' || c == '\t'));
            if let Some(at) = split {
                username = checked_field(line[..at].trim())?;
                password = checked_field(line[at + 1..].trim())?;
            } else {
                username = checked_field(line)?;
            }
            continue;
        }

        if password.is_empty() {
            password = checked_field(line)?;
        }
    }

    if username.is_empty() || password.is_empty() {
        warn!("Config missing username/password: {}", path.display());
        return Err(RmiError::Config(
            "Config missing username/password".to_string(),
        ));
    }
    Ok(Credentials { username, password })
}

fn checked_field(value: &str) -> Result<String> {
    if value.is_empty() || value.len() >= MAX_FIELD_LEN {
        return Err(RmiError::Config("Config field empty or too long".to_string()));
    }
    Ok(value.to_string())
}

fn write_default_config(path: &Path) -> Result<()> {
    let contents = format!(
        "username={}\npassword={}\n",
        DEFAULT_USERNAME, DEFAULT_PASSWORD
    );
    fs::write(path, contents).map_err(|err| {
        RmiError::Config(format!(
            "Failed to create default config {}: {}",
            path.display(),
            err
        ))
    })?;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o666));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn load_from(contents: &str) -> Result<Credentials> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rmi.config");
        fs::write(&path, contents).unwrap();
        load_credentials(&path)
    }

    #[test]
    fn key_value_format() {
        let creds = load_from("username=alice\npassword=secret\n").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn key_value_format_is_order_independent() {
        let creds = load_from("password=secret\nusername=alice\n").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn colon_separated_line() {
        let creds = load_from("alice:secret\n").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn whitespace_separated_line() {
        let creds = load_from("alice\tsecret\n").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn two_line_format() {
        let creds = load_from("alice\nsecret\n").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let creds = load_from("# credentials\n\nusername=alice\n# more\npassword=secret\n").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn missing_password_is_fatal() {
        assert!(load_from("username=alice\n").is_err());
    }

    #[test]
    fn empty_field_is_fatal() {
        assert!(load_from("username=\npassword=secret\n").is_err());
    }

    #[test]
    fn missing_file_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rmi.config");
        let creds = load_credentials(&path).unwrap();
        assert_eq!(creds.username, DEFAULT_USERNAME);
        assert_eq!(creds.password, DEFAULT_PASSWORD);
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("username=l16"));
        // The defaults must load back on the next startup.
        let reloaded = load_credentials(&path).unwrap();
        assert_eq!(reloaded, creds);
    }

    #[test]
    fn credentials_match_exact_bytes() {
        let creds = Credentials {
            username: "u16".into(),
            password: "p16".into(),
        };
        assert!(creds.matches("u16", "p16"));
        assert!(!creds.matches("u16", "P16"));
        assert!(!creds.matches("", ""));
    }
}
