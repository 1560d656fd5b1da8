//! The open segment: an append-only, length-prefixed log of validated
//! candidates.
//!
//! Frame layout:
//!
//! ```text
//! [u32 LE payload_len][payload][4-byte SHA-256 prefix of payload]
//! ```
//!
//! Payload layout (little-endian):
//!
//! ```text
//! tag u8 (1 = sample, 2 = gap) | flags u8 | ts_micros i64 |
//! queue_length u32 | lane_count u16 | status_code u16        (sample only)
//! ```
//!
//! On open, the longest valid prefix is kept and anything after it (a torn
//! write or a checksum failure) is truncated away.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::DateTime;
use eq_common::{Candidate, Observation};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::Result;

const TAG_SAMPLE: u8 = 1;
const TAG_GAP: u8 = 2;

const FLAG_LANES: u8 = 0b01;
const FLAG_STATUS: u8 = 0b10;

const SAMPLE_PAYLOAD_LEN: usize = 18;
const GAP_PAYLOAD_LEN: usize = 10;

/// Upper bound on a payload; anything larger is framing garbage.
const MAX_PAYLOAD_LEN: usize = 64;

const LEN_PREFIX: usize = 4;
const CHECKSUM_LEN: usize = 4;

/// Why the scan stopped before the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TailDefect {
    /// The last frame was cut short.
    Torn,
    /// A frame's checksum did not match its payload.
    ChecksumMismatch,
    /// A frame declared an impossible length or undecodable payload.
    Malformed,
}

/// Result of scanning a log's bytes.
#[derive(Debug, Clone, Default)]
pub struct LogScan {
    pub entries: Vec<Candidate>,
    pub valid_len: u64,
    pub file_len: u64,
    pub defect: Option<TailDefect>,
}

impl LogScan {
    pub fn discarded_bytes(&self) -> u64 {
        self.file_len - self.valid_len
    }
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(payload);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

fn encode_payload(entry: &Candidate) -> Vec<u8> {
    match entry {
        Candidate::Sample(obs) => {
            let mut flags = 0u8;
            if obs.lane_count.is_some() {
                flags |= FLAG_LANES;
            }
            if obs.status_code.is_some() {
                flags |= FLAG_STATUS;
            }
            let mut buf = Vec::with_capacity(SAMPLE_PAYLOAD_LEN);
            buf.push(TAG_SAMPLE);
            buf.push(flags);
            buf.extend_from_slice(&obs.timestamp.timestamp_micros().to_le_bytes());
            buf.extend_from_slice(&obs.queue_length.to_le_bytes());
            buf.extend_from_slice(&obs.lane_count.unwrap_or(0).to_le_bytes());
            buf.extend_from_slice(&obs.status_code.unwrap_or(0).to_le_bytes());
            buf
        }
        Candidate::Gap(ts) => {
            let mut buf = Vec::with_capacity(GAP_PAYLOAD_LEN);
            buf.push(TAG_GAP);
            buf.push(0);
            buf.extend_from_slice(&ts.timestamp_micros().to_le_bytes());
            buf
        }
    }
}

fn decode_payload(payload: &[u8]) -> Option<Candidate> {
    let (&tag, rest) = payload.split_first()?;
    let (&flags, rest) = rest.split_first()?;
    let micros = i64::from_le_bytes(rest.get(0..8)?.try_into().ok()?);
    let timestamp = DateTime::from_timestamp_micros(micros)?;

    match tag {
        TAG_GAP if payload.len() == GAP_PAYLOAD_LEN => Some(Candidate::Gap(timestamp)),
        TAG_SAMPLE if payload.len() == SAMPLE_PAYLOAD_LEN => {
            let queue_length = u32::from_le_bytes(rest.get(8..12)?.try_into().ok()?);
            let lanes = u16::from_le_bytes(rest.get(12..14)?.try_into().ok()?);
            let status = u16::from_le_bytes(rest.get(14..16)?.try_into().ok()?);
            Some(Candidate::Sample(Observation {
                timestamp,
                queue_length,
                lane_count: (flags & FLAG_LANES != 0).then_some(lanes),
                status_code: (flags & FLAG_STATUS != 0).then_some(status),
            }))
        }
        _ => None,
    }
}

/// Encode one entry as a complete frame.
pub fn encode_frame(entry: &Candidate) -> Vec<u8> {
    let payload = encode_payload(entry);
    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len() + CHECKSUM_LEN);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&checksum(&payload));
    frame
}

/// Scan `bytes` and return every entry in the longest valid prefix.
pub fn scan_frames(bytes: &[u8]) -> LogScan {
    let mut scan = LogScan {
        file_len: bytes.len() as u64,
        ..Default::default()
    };
    let mut offset = 0usize;

    while offset < bytes.len() {
        let Some(len_bytes) = bytes.get(offset..offset + LEN_PREFIX) else {
            scan.defect = Some(TailDefect::Torn);
            break;
        };
        let mut len_buf = [0u8; LEN_PREFIX];
        len_buf.copy_from_slice(len_bytes);
        let payload_len = u32::from_le_bytes(len_buf) as usize;
        if payload_len == 0 || payload_len > MAX_PAYLOAD_LEN {
            scan.defect = Some(TailDefect::Malformed);
            break;
        }

        let payload_start = offset + LEN_PREFIX;
        let frame_end = payload_start + payload_len + CHECKSUM_LEN;
        if frame_end > bytes.len() {
            scan.defect = Some(TailDefect::Torn);
            break;
        }

        let payload = &bytes[payload_start..payload_start + payload_len];
        let stored = &bytes[payload_start + payload_len..frame_end];
        if stored != checksum(payload) {
            scan.defect = Some(TailDefect::ChecksumMismatch);
            break;
        }

        match decode_payload(payload) {
            Some(entry) => scan.entries.push(entry),
            None => {
                scan.defect = Some(TailDefect::Malformed);
                break;
            }
        }
        offset = frame_end;
    }

    scan.valid_len = offset as u64;
    scan
}

/// Read and scan a log file without modifying it.
pub fn read_log(path: &Path) -> Result<LogScan> {
    if !path.exists() {
        return Ok(LogScan::default());
    }
    let bytes = std::fs::read(path)?;
    Ok(scan_frames(&bytes))
}

/// The append target for new observations.
#[derive(Debug)]
pub struct OpenLog {
    path: PathBuf,
    file: File,
    len: u64,
}

impl OpenLog {
    /// Open (or create) the log, truncating any invalid tail.
    pub fn open(path: &Path) -> Result<(Self, LogScan)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let scan = scan_frames(&bytes);

        if let Some(defect) = scan.defect {
            warn!(
                path = %path.display(),
                ?defect,
                valid_len = scan.valid_len,
                discarded = scan.discarded_bytes(),
                "truncating invalid open-log tail"
            );
            file.set_len(scan.valid_len)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::Start(scan.valid_len))?;

        let log = OpenLog {
            path: path.to_path_buf(),
            file,
            len: scan.valid_len,
        };
        Ok((log, scan))
    }

    /// Append one entry durably. Returns the frame size in bytes.
    pub fn append(&mut self, entry: &Candidate) -> Result<u64> {
        let frame = encode_frame(entry);
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.len += frame.len() as u64;
        Ok(frame.len() as u64)
    }

    /// Drop every frame; used once the entries are sealed into a segment.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_data()?;
        self.len = 0;
        Ok(())
    }

    /// Replace the log with exactly `entries`.
    ///
    /// The new frames go to a temporary file that is synced and renamed over
    /// the log, so a crash leaves either the old log or the new one.
    pub fn rewrite(&mut self, entries: &[Candidate]) -> Result<()> {
        let temp = self.path.with_extension("log.tmp");
        let bytes: Vec<u8> = entries.iter().flat_map(encode_frame).collect();
        {
            let mut file = File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        self.file = file;
        self.len = bytes.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Size of one encoded frame for `entry`.
pub fn frame_len(entry: &Candidate) -> u64 {
    let payload = match entry {
        Candidate::Sample(_) => SAMPLE_PAYLOAD_LEN,
        Candidate::Gap(_) => GAP_PAYLOAD_LEN,
    };
    (LEN_PREFIX + payload + CHECKSUM_LEN) as u64
}
