//! Handshake file
//!
//! The peer process launches the gateway, then polls a path it chose (passed
//! through `_PYFLUSS_CONN_INFO_PATH`) until the gateway's ports appear there.
//!
//! ## Format
//!
//! ```text
//! +---------------------------+---------------------------+
//! | listener port (i32, BE)   | callback port (i32, BE)   |
//! +---------------------------+---------------------------+
//! ```
//!
//! The record is written to a temp file in the target directory and renamed
//! onto the published path, so a reader never observes a short file.

use bytes::{Buf, BufMut};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable naming the handshake path
pub const HANDSHAKE_PATH_ENV: &str = "_PYFLUSS_CONN_INFO_PATH";

/// Encoded size of a [`HandshakeRecord`]
pub const HANDSHAKE_RECORD_LEN: usize = 8;

/// Ports published to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRecord {
    pub listener_port: u16,
    pub callback_port: u16,
}

/// Error type for handshake operations
#[derive(Debug)]
pub enum HandshakeError {
    /// Temp file could not be created next to the target
    TempFile { dir: PathBuf, source: io::Error },
    /// Writing or syncing the temp file failed
    Write(io::Error),
    /// Atomic rename onto the published path failed
    Rename { path: PathBuf, source: io::Error },
    /// Reading a published record failed
    Read(io::Error),
    /// Published file has the wrong size
    InvalidLength(usize),
    /// A port field is outside 1..=65535
    InvalidPort(i32),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::TempFile { dir, source } => {
                write!(f, "Cannot create temp file in {}: {}", dir.display(), source)
            }
            HandshakeError::Write(e) => write!(f, "Cannot write handshake record: {}", e),
            HandshakeError::Rename { path, source } => write!(
                f,
                "Unable to write connection information to handshake file {}: {}",
                path.display(),
                source
            ),
            HandshakeError::Read(e) => write!(f, "Cannot read handshake file: {}", e),
            HandshakeError::InvalidLength(len) => write!(
                f,
                "Handshake file has {} bytes, expected {}",
                len, HANDSHAKE_RECORD_LEN
            ),
            HandshakeError::InvalidPort(port) => write!(f, "Invalid port in handshake: {}", port),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandshakeError::TempFile { source, .. } | HandshakeError::Rename { source, .. } => {
                Some(source)
            }
            HandshakeError::Write(e) | HandshakeError::Read(e) => Some(e),
            _ => None,
        }
    }
}

impl HandshakeRecord {
    pub fn new(listener_port: u16, callback_port: u16) -> Self {
        HandshakeRecord {
            listener_port,
            callback_port,
        }
    }

    /// Encode as two big-endian i32s
    pub fn encode(&self) -> [u8; HANDSHAKE_RECORD_LEN] {
        let mut out = [0u8; HANDSHAKE_RECORD_LEN];
        let mut buf = &mut out[..];
        buf.put_i32(i32::from(self.listener_port));
        buf.put_i32(i32::from(self.callback_port));
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() != HANDSHAKE_RECORD_LEN {
            return Err(HandshakeError::InvalidLength(bytes.len()));
        }
        let mut buf = bytes;
        let listener_port = Self::port_from_i32(buf.get_i32())?;
        let callback_port = Self::port_from_i32(buf.get_i32())?;
        Ok(HandshakeRecord {
            listener_port,
            callback_port,
        })
    }

    fn port_from_i32(raw: i32) -> Result<u16, HandshakeError> {
        match u16::try_from(raw) {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(HandshakeError::InvalidPort(raw)),
        }
    }
}

/// Atomically publish `record` at `path`
pub fn publish(path: &Path, record: &HandshakeRecord) -> Result<(), HandshakeError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix("connection")
        .suffix(".info")
        .tempfile_in(&dir)
        .map_err(|source| HandshakeError::TempFile {
            dir: dir.clone(),
            source,
        })?;

    tmp.write_all(&record.encode())
        .and_then(|_| tmp.flush())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(HandshakeError::Write)?;

    // Same directory, so the rename stays on one filesystem
    tmp.persist(path).map_err(|e| HandshakeError::Rename {
        path: path.to_path_buf(),
        source: e.error,
    })?;

    info!(
        "Published handshake to {} (port={}, callback_port={})",
        path.display(),
        record.listener_port,
        record.callback_port
    );
    Ok(())
}

/// Read a record published by [`publish`]
pub fn read(path: &Path) -> Result<HandshakeRecord, HandshakeError> {
    let bytes = std::fs::read(path).map_err(HandshakeError::Read)?;
    HandshakeRecord::decode(&bytes)
}

/// Handshake path from the environment, if set
pub fn path_from_env() -> Option<PathBuf> {
    std::env::var_os(HANDSHAKE_PATH_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_ports() {
        let record = HandshakeRecord::new(25333, 25334);
        assert_eq!(
            record.encode(),
            [0x00, 0x00, 0x63, 0xF5, 0x00, 0x00, 0x63, 0xF6]
        );
    }

    #[test]
    fn test_publish_writes_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("conn.info");

        publish(&target, &HandshakeRecord::new(25333, 25334)).unwrap();

        let bytes = std::fs::read(&target).unwrap();
        assert_eq!(bytes, vec![0x00, 0x00, 0x63, 0xF5, 0x00, 0x00, 0x63, 0xF6]);
        assert_eq!(read(&target).unwrap(), HandshakeRecord::new(25333, 25334));
    }

    #[test]
    fn test_publish_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("conn.info");

        publish(&target, &HandshakeRecord::new(40000, 40001)).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("conn.info")]);
    }

    #[test]
    fn test_publish_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("conn.info");
        std::fs::write(&target, b"stale").unwrap();

        publish(&target, &HandshakeRecord::new(1, 2)).unwrap();
        assert_eq!(read(&target).unwrap(), HandshakeRecord::new(1, 2));
    }

    #[test]
    fn test_publish_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("conn.info");

        let err = publish(&target, &HandshakeRecord::new(1, 2)).unwrap_err();
        assert!(matches!(err, HandshakeError::TempFile { .. }));
    }

    #[test]
    fn test_decode_rejects_short_and_zero() {
        assert!(matches!(
            HandshakeRecord::decode(&[0, 0, 0, 1]),
            Err(HandshakeError::InvalidLength(4))
        ));
        assert!(matches!(
            HandshakeRecord::decode(&[0, 0, 0, 0, 0, 0, 0, 1]),
            Err(HandshakeError::InvalidPort(0))
        ));
        assert!(matches!(
            HandshakeRecord::decode(&[0, 1, 0, 0, 0, 0, 0, 1]),
            Err(HandshakeError::InvalidPort(65536))
        ));
    }

    #[test]
    fn test_concurrent_reader_never_sees_partial_record() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("conn.info");
        let reader_target = target.clone();

        let reader = std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
            loop {
                if let Ok(bytes) = std::fs::read(&reader_target) {
                    return bytes.len();
                }
                assert!(std::time::Instant::now() < deadline, "handshake never appeared");
                std::thread::yield_now();
            }
        });

        publish(&target, &HandshakeRecord::new(30000, 30001)).unwrap();
        assert_eq!(reader.join().unwrap(), HANDSHAKE_RECORD_LEN);
    }
}
