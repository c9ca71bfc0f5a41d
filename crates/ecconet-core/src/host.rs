//! The host capability surface (spec §6), and the value types shared across
//! FTP client/server (DESIGN NOTES §9: "unify into one `FileMetadata`").
//!
//! DESIGN NOTES §9 asks that void*-style callbacks and function-pointer
//! tables become "a capability abstraction — a trait / interface over the
//! host surface"; `HostInterface` is that trait. `crates/ecconet-test`
//! supplies the loopback/in-memory implementation used by this crate's own
//! integration tests.

use crate::error::Result;
use crate::token::Token;

/// Whether a non-blocking host operation completed or asked to be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    Busy,
}

/// A region of the host's flash address space (spec §6's `flashVolumes`).
///
/// DESIGN NOTES §9: replaces `(uint8_t*)dataLocation` pointer arithmetic with
/// an explicit handle the host trait services reads/writes against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashSlice {
    pub volume: u8,
    pub offset: u32,
    pub len: u32,
}

/// One metadata shape shared by the FTP server, FTP client, and file-info
/// replies (DESIGN NOTES §9: "unify into one `FileMetadata` used by all
/// components", replacing three separate header shapes in the original).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub data_size: u32,
    pub data_checksum: u16,
    /// Device uptime in ms at write time; spec's Non-goals exclude wall-clock time.
    pub timestamp_ms: u32,
    pub volume: u8,
    pub location: FlashSlice,
}

/// One of the four base/size flash volumes (spec §6: "volume 0 MUST be
/// memory-mapped readable").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashVolume {
    pub base: u32,
    pub size: u32,
}

/// What the FTP server should do with a file-read request it was offered a
/// chance to serve out of RAM (spec §6's `ftpServerReadHandler`).
///
/// `Served(n)` means the hook wrote `n` bytes into the caller's buffer itself
/// (the RAM copy); `NotMine` means the server should fall through to
/// [`HostInterface::read_file_segment`] (flash).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadHandlerOutcome {
    Served(usize),
    NotMine,
}

/// The capability surface the core requires from its embedding application
/// (spec §6). All operations are non-blocking: flash operations return a
/// `Result` synchronously (spec's flash is assumed to serialize its own
/// accesses, §5), and `send_can_frame` reports busy instead of blocking.
pub trait HostInterface {
    /// Enqueue one outbound CAN frame. Non-blocking: `SendStatus::Busy` means
    /// the core will retry the same frame on the next `clock()` tick.
    fn send_can_frame(&mut self, id: u32, data: &[u8]) -> SendStatus;

    fn flash_read(&mut self, volume: u8, address: u32, buf: &mut [u8]) -> Result<()>;
    fn flash_write(&mut self, volume: u8, address: u32, data: &[u8]) -> Result<()>;
    fn flash_erase(&mut self, volume: u8, address: u32, size: u32) -> Result<()>;

    /// Map a file name to the volume index that owns it.
    fn file_name_to_volume_index(&self, name: &str) -> Result<u8>;

    /// Look up a file by name in the host's flash file system. The file
    /// system's own headers/CRC/compaction are out of core scope (spec §1);
    /// this is the directory-level surface the core consumes.
    fn file_info(&self, name: &str) -> Result<FileMetadata>;

    /// Look up the `index`-th file on `volume` (spec §4.8 `FileIndexedInfo`).
    fn indexed_file_info(&self, volume: u8, index: u16) -> Result<FileMetadata>;

    /// Read one up-to-`SEGMENT_SIZE`-byte segment of an already-looked-up file.
    fn read_file_segment(&mut self, file: &FileMetadata, segment_index: u16, buf: &mut [u8]) -> Result<usize>;

    /// Allocate a new file for writing; returns its metadata (with a fresh
    /// [`FlashSlice`] location) once the file system has room.
    fn begin_file_write(&mut self, name: &str, size: u32, data_checksum: u16, timestamp_ms: u32) -> Result<FileMetadata>;

    /// Write one segment into a file previously returned by [`begin_file_write`](Self::begin_file_write).
    fn write_file_segment(&mut self, file: &FileMetadata, segment_index: u16, data: &[u8]) -> Result<()>;

    /// Delete a file by name.
    fn delete_file(&mut self, name: &str) -> Result<()>;

    /// The node's 128-bit globally-unique identifier.
    fn get_guid(&self) -> [u32; 4];

    /// Deliver a token the core has decided the host cares about.
    fn token_callback(&mut self, token: Token);

    /// Optional hook letting the host serve one read segment out of RAM instead
    /// of flash. Called by the FTP server before it falls through to
    /// [`read_file_segment`](Self::read_file_segment); returning
    /// `Ok(ReadHandlerOutcome::Served(n))` writes `n` bytes into `buf` and skips
    /// the flash read entirely.
    fn ftp_server_read_handler(
        &mut self,
        requester: u8,
        file: &FileMetadata,
        segment_index: u16,
        buf: &mut [u8],
    ) -> Result<ReadHandlerOutcome> {
        let _ = (requester, file, segment_index, buf);
        Ok(ReadHandlerOutcome::NotMine)
    }

    /// The host's flash volume table (spec §6: up to 4 volumes, volume 0
    /// memory-mapped readable).
    fn flash_volumes(&self) -> [FlashVolume; 4];
}
