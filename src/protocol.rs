//! Wire protocol shared by the server and the client
//!
//! Every frame on the wire is a 4-byte big-endian length prefix followed by
//! that many payload bytes. Command payloads are ASCII verbs with optional
//! whitespace-separated arguments; responses are `OK`, `ERR <message>`,
//! `VERSION <n>`, or a command-specific payload. A frame whose payload is
//! the literal text `HEARTBEAT` may show up at any time from either peer.

use crate::error::{Result, RmiError};
use crate::types::FileEntry;

/// Size of the length prefix in front of every frame
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default server port
pub const DEFAULT_PORT: u16 = 1234;

/// Idle interval after which either peer emits a `HEARTBEAT` frame
pub const HEARTBEAT_INTERVAL_MS: u64 = 5000;

/// Build counter reported by the `VERSION` command
pub const SERVER_VERSION: u32 = 42;

pub const CMD_AUTH: &str = "AUTH";
pub const CMD_QUIT: &str = "QUIT";
pub const CMD_RESTART: &str = "RESTART";
pub const CMD_VERSION: &str = "VERSION";
pub const CMD_PRESS: &str = "PRESS";
pub const CMD_PRESS_INPUT: &str = "PRESS_INPUT";
pub const CMD_OPEN: &str = "OPEN";
pub const CMD_UPLOAD: &str = "UPLOAD";
pub const CMD_LIST: &str = "LIST";
pub const CMD_DOWNLOAD: &str = "DOWNLOAD";
pub const CMD_DELETE: &str = "DELETE";
pub const CMD_SCREENCAP: &str = "SCREENCAP";
pub const CMD_HEARTBEAT: &str = "HEARTBEAT";

pub const RESP_OK: &str = "OK";
pub const RESP_ERR_PREFIX: &str = "ERR";
pub const RESP_VERSION_PREFIX: &str = "VERSION ";

/// Read a big-endian u32 from the first four bytes of `data`
pub fn read_be32(data: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*data)
}

/// Write `value` as big-endian into a 4-byte header
pub fn write_be32(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Frame a payload: 4-byte big-endian length then the payload bytes.
///
/// Returns `None` when the payload does not fit in a u32 length prefix.
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    let length = u32::try_from(payload.len()).ok()?;
    let mut framed = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    framed.extend_from_slice(&write_be32(length));
    framed.extend_from_slice(payload);
    Some(framed)
}

/// True when the payload is byte-for-byte equal to `text`
pub fn payload_equals(payload: &[u8], text: &str) -> bool {
    payload == text.as_bytes()
}

/// True when the payload begins with the bytes of `text`
pub fn payload_starts_with(payload: &[u8], text: &str) -> bool {
    payload.len() >= text.len() && &payload[..text.len()] == text.as_bytes()
}

/// Render a payload for error messages; non-UTF8 bytes are replaced
pub fn payload_to_string(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

/// Split a command payload into tokens on SPACE/TAB, dropping empty tokens
pub fn tokenize(command: &str) -> Vec<&str> {
    command
        .split([' ', '\t'])
        .filter(|token| !token.is_empty())
        .collect()
}

/// Parse a `VERSION <n>` response payload.
///
/// The payload must start with the literal prefix `VERSION ` and the
/// remainder must be a non-negative decimal integer consumed in full.
/// An `ERR ...` payload is surfaced verbatim.
pub fn parse_version_payload(payload: &[u8]) -> Result<i64> {
    if payload_starts_with(payload, RESP_ERR_PREFIX) {
        return Err(RmiError::Protocol(payload_to_string(payload)));
    }
    let text = payload_to_string(payload);
    let number_text = text.strip_prefix(RESP_VERSION_PREFIX).ok_or_else(|| {
        RmiError::Decode(format!("Unexpected VERSION response: {}", text))
    })?;
    if number_text.is_empty() {
        return Err(RmiError::Decode(format!("Unexpected VERSION response: {}", text)));
    }
    match number_text.parse::<i64>() {
        Ok(version) if version >= 0 => Ok(version),
        _ => Err(RmiError::Decode(format!("Invalid version number: {}", number_text))),
    }
}

/// Render one listing entry as its wire line.
///
/// Directories are `D\t<name>\n`, files are `F\t<name>\t<size>\n`. Names
/// that are empty or contain TAB or newline cannot be encoded and yield
/// `None`; the server skips such entries.
pub fn format_list_entry(entry: &FileEntry) -> Option<String> {
    if entry.name.is_empty() || entry.name.contains(['\t', '\n']) {
        return None;
    }
    if entry.is_dir {
        Some(format!("D\t{}\n", entry.name))
    } else {
        Some(format!("F\t{}\t{}\n", entry.name, entry.size))
    }
}

/// Parse a `LIST` response payload into entries.
///
/// Empty lines and entries with empty names are skipped; structurally
/// malformed lines (missing tabs, unknown type tag, bad size) fail the
/// whole payload. An `ERR ...` payload is surfaced verbatim.
pub fn parse_file_list(payload: &[u8]) -> Result<Vec<FileEntry>> {
    if payload_starts_with(payload, RESP_ERR_PREFIX) {
        return Err(RmiError::Protocol(payload_to_string(payload)));
    }
    let text = payload_to_string(payload);
    let mut entries = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        if line.len() < 2 || line.as_bytes()[1] != b'\t' {
            return Err(RmiError::Decode("Malformed list entry".into()));
        }
        match line.as_bytes()[0] {
            b'D' => {
                let name = &line[2..];
                if name.is_empty() {
                    continue;
                }
                entries.push(FileEntry {
                    name: name.to_string(),
                    is_dir: true,
                    size: 0,
                });
            }
            b'F' => {
                let rest = &line[2..];
                let tab = rest
                    .find('\t')
                    .ok_or_else(|| RmiError::Decode("Malformed file entry".into()))?;
                let name = &rest[..tab];
                let size = rest[tab + 1..]
                    .parse::<u64>()
                    .map_err(|_| RmiError::Decode("Invalid file size".into()))?;
                if name.is_empty() {
                    continue;
                }
                entries.push(FileEntry {
                    name: name.to_string(),
                    is_dir: false,
                    size,
                });
            }
            _ => return Err(RmiError::Decode("Unknown list entry type".into())),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_frame_prefixes_big_endian_length() {
        let framed = encode_frame(b"VERSION").unwrap();
        assert_eq!(framed.len(), FRAME_HEADER_SIZE + 7);
        assert_eq!(&framed[..4], &[0x00, 0x00, 0x00, 0x07]);
        assert_eq!(&framed[4..], b"VERSION");
    }

    #[test]
    fn encode_frame_accepts_empty_payload() {
        let framed = encode_frame(b"").unwrap();
        assert_eq!(framed, vec![0, 0, 0, 0]);
    }

    #[test]
    fn payload_compare_helpers() {
        assert!(payload_equals(b"OK", "OK"));
        assert!(!payload_equals(b"OK extra", "OK"));
        assert!(payload_starts_with(b"ERR auth failed", "ERR"));
        assert!(!payload_starts_with(b"ER", "ERR"));
    }

    #[test]
    fn tokenize_splits_on_space_and_tab() {
        assert_eq!(tokenize("AUTH u16 p16"), vec!["AUTH", "u16", "p16"]);
        assert_eq!(tokenize("PRESS\t24"), vec!["PRESS", "24"]);
        assert_eq!(tokenize("LIST  \t /tmp"), vec!["LIST", "/tmp"]);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn version_payload_parses_decimal() {
        assert_eq!(parse_version_payload(b"VERSION 42").unwrap(), 42);
    }

    #[test]
    fn version_payload_accepts_leading_zeros() {
        assert_eq!(parse_version_payload(b"VERSION 007").unwrap(), 7);
    }

    #[test]
    fn version_payload_rejects_trailing_garbage() {
        assert!(parse_version_payload(b"VERSION 42x").is_err());
        assert!(parse_version_payload(b"VERSION ").is_err());
        assert!(parse_version_payload(b"VERSION 1 2").is_err());
    }

    #[test]
    fn version_payload_rejects_negative() {
        assert!(parse_version_payload(b"VERSION -1").is_err());
    }

    #[test]
    fn version_payload_surfaces_err() {
        let err = parse_version_payload(b"ERR version").unwrap_err();
        assert!(matches!(err, RmiError::Protocol(_)));
    }

    #[test]
    fn file_list_parses_directories_and_files() {
        let entries = parse_file_list(b"D\tbin\nF\thello.txt\t5\n").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "bin");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].name, "hello.txt");
        assert!(!entries[1].is_dir);
        assert_eq!(entries[1].size, 5);
    }

    #[test]
    fn file_list_accepts_empty_payload() {
        assert!(parse_file_list(b"").unwrap().is_empty());
    }

    #[test]
    fn file_list_rejects_malformed_lines() {
        assert!(parse_file_list(b"Dbin\n").is_err());
        assert!(parse_file_list(b"X\tname\n").is_err());
        assert!(parse_file_list(b"F\tname\n").is_err());
        assert!(parse_file_list(b"F\tname\tbig\n").is_err());
    }

    #[test]
    fn file_list_skips_empty_names() {
        let entries = parse_file_list(b"D\t\nF\t\t5\nF\thello.txt\t5\n").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "hello.txt");
    }

    #[test]
    fn file_list_round_trips_through_formatter() {
        let payload = b"D\tbin\nF\thello.txt\t5\nF\tempty\t0\n";
        let entries = parse_file_list(payload).unwrap();
        let rebuilt: String = entries
            .iter()
            .filter_map(format_list_entry)
            .collect();
        assert_eq!(rebuilt.as_bytes(), payload);
    }

    #[test]
    fn format_skips_unencodable_names() {
        let entry = FileEntry {
            name: "with\ttab".into(),
            is_dir: false,
            size: 1,
        };
        assert!(format_list_entry(&entry).is_none());
        let entry = FileEntry {
            name: String::new(),
            is_dir: true,
            size: 0,
        };
        assert!(format_list_entry(&entry).is_none());
    }
}
