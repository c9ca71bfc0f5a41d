//! The error taxonomy from spec §7.
//!
//! Transient transport errors are absorbed silently by the transmitter/receiver
//! (the caller only sees `tracing` output for those); the rest are delivered to
//! whichever API surfaced them — an FTP completion callback, a file-load call,
//! or a config-time API return.

use thiserror::Error;

/// Every error the core can produce.
///
/// None of these are fatal: each is scoped to the subsystem that raised it, and
/// recovering from one never requires restarting the whole [`Coordinator`](crate::coordinator::Coordinator).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatrixError {
    // -- transient transport --
    /// The host's `sendCanFrame` returned busy; the core will retry next tick.
    #[error("send busy")]
    SendBusy,
    /// A byte stream (codec or frame payload) ended before a field was fully read.
    #[error("truncated stream")]
    Truncated,
    /// A multi-frame message's trailing CRC-16 didn't match its payload.
    #[error("CRC mismatch")]
    CrcMismatch,
    /// Frames arrived out of order; reassembled in place, not a terminal failure.
    #[error("frames reordered")]
    Reordered,

    // -- protocol --
    /// The FTP server rejected a request (bad access code, nonexistent file, ...).
    #[error("FTP client error")]
    FtpClientError,
    /// The FTP server already has a different client mid-transaction.
    #[error("FTP server busy")]
    FtpServerBusy,
    /// No response arrived within the 1000 ms FTP timeout.
    #[error("FTP transaction timed out")]
    FtpTransactionTimedOut,
    /// The named file does not exist.
    #[error("file not found")]
    FileNotFound,
    /// The reassembled file's CRC didn't match the advertised checksum.
    #[error("file checksum error")]
    FileChecksumError,
    /// The flash file system has no room for the requested allocation.
    #[error("FTP disk full")]
    FtpDiskFull,

    // -- state corruption (self-healing) --
    /// Malformed equation bytecode; the time-logic engine reloads from file.
    #[error("bytecode error")]
    BytecodeError,
    /// Malformed pattern file; the sequencer reloads from file.
    #[error("pattern file error")]
    PatternFileError,

    // -- configuration --
    /// `fileNameToVolumeIndex` returned a volume outside `flashVolumes`.
    #[error("invalid volume")]
    InvalidVolume,
    /// A file name failed validation (too long, empty, ...).
    #[error("invalid file name")]
    InvalidFileName,
    /// The requested capability isn't supported by this application build.
    #[error("operation not supported")]
    NoAppSupport,
}

pub type Result<T> = std::result::Result<T, MatrixError>;
