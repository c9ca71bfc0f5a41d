use std::process::Output;

pub use assert_cmd::Command;

use ecconet_core::error::{MatrixError, Result};
use ecconet_core::host::{FileMetadata, FlashSlice, FlashVolume, HostInterface, SendStatus};
use ecconet_core::token::Token;

pub trait CommandExt {
    /// Same as [Command::output] except with hooks to print stdout/stderr in failed tests
    fn captured_output(&mut self) -> std::io::Result<Output>;
}

impl CommandExt for Command {
    fn captured_output(&mut self) -> std::io::Result<Output> {
        let output = self.output()?;

        // libtest injects magic in print! macros to capture output in tests
        print!("{}", String::from_utf8_lossy(&output.stdout));
        eprint!("{}", String::from_utf8_lossy(&output.stderr));

        Ok(output)
    }
}

/// Get a temporary file with the given contents
pub fn tempfile<S: AsRef<str>>(contents: S) -> eyre::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    std::io::Write::write_all(&mut file, contents.as_ref().as_bytes())?;
    Ok(file)
}

/// Get a command to run the given tool binary.
///
/// Uses `CARGO_BIN_EXE_<name>` which cargo sets at compile time for
/// integration tests in the same crate as the binary.
///
/// # Example
/// ```ignore
/// use ecconet_test::{tool, CommandExt};
///
/// let output = tool!("matrixdump")
///     .arg("decode")
///     .captured_output()
///     .unwrap();
/// ```
#[macro_export]
macro_rules! tool {
    ($name:literal) => {{
        let mut cmd = $crate::Command::new(env!(concat!("CARGO_BIN_EXE_", $name)));
        cmd
    }};
}

const FLASH_VOLUME_SIZE: u32 = 64 * 1024;

/// An in-memory [`HostInterface`] for driving a [`Coordinator`](ecconet_core::coordinator::Coordinator)
/// in tests without real CAN hardware or flash. Frames a node sends accumulate
/// in `sent`; tests drain them with [`LoopbackHost::take_sent`] and feed them
/// to peers via `Coordinator::on_can_frame`, the same shape the FTP server's
/// own `FakeHost` test double uses internally.
pub struct LoopbackHost {
    guid: [u32; 4],
    sent: Vec<(u32, Vec<u8>)>,
    flash: [Vec<u8>; 4],
    files: Vec<(FileMetadata, Vec<u8>)>,
    tokens: Vec<Token>,
    busy_for: usize,
}

impl LoopbackHost {
    #[must_use]
    pub fn new(guid: [u32; 4]) -> Self {
        Self {
            guid,
            sent: Vec::new(),
            flash: std::array::from_fn(|_| vec![0u8; FLASH_VOLUME_SIZE as usize]),
            files: Vec::new(),
            tokens: Vec::new(),
            busy_for: 0,
        }
    }

    /// Seed a readable file directly, bypassing `begin_file_write` (handy for
    /// preloading `product.inf` before a test starts FTP traffic).
    pub fn seed_file(&mut self, name: &str, data: Vec<u8>, timestamp_ms: u32) {
        let checksum = ecconet_core::crc::crc16(&data);
        let meta = FileMetadata {
            name: name.to_string(),
            data_size: data.len() as u32,
            data_checksum: checksum,
            timestamp_ms,
            volume: 0,
            location: FlashSlice { volume: 0, offset: 0, len: data.len() as u32 },
        };
        self.files.push((meta, data));
    }

    /// Drain every CAN frame queued since the last drain.
    pub fn take_sent(&mut self) -> Vec<(u32, Vec<u8>)> {
        std::mem::take(&mut self.sent)
    }

    /// Make the next `n` `send_can_frame` calls report `Busy` (spec §6).
    pub fn set_busy_for(&mut self, n: usize) {
        self.busy_for = n;
    }

    /// Tokens delivered via `token_callback` since the fixture was built.
    #[must_use]
    pub fn delivered_tokens(&self) -> &[Token] {
        &self.tokens
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.files.iter().position(|(m, _)| m.name == name)
    }
}

impl HostInterface for LoopbackHost {
    fn send_can_frame(&mut self, id: u32, data: &[u8]) -> SendStatus {
        if self.busy_for > 0 {
            self.busy_for -= 1;
            return SendStatus::Busy;
        }
        self.sent.push((id, data.to_vec()));
        SendStatus::Ok
    }

    fn flash_read(&mut self, volume: u8, address: u32, buf: &mut [u8]) -> Result<()> {
        let vol = self.flash.get(volume as usize).ok_or(MatrixError::InvalidVolume)?;
        let start = address as usize;
        let end = start.checked_add(buf.len()).ok_or(MatrixError::Truncated)?;
        let slice = vol.get(start..end).ok_or(MatrixError::Truncated)?;
        buf.copy_from_slice(slice);
        Ok(())
    }

    fn flash_write(&mut self, volume: u8, address: u32, data: &[u8]) -> Result<()> {
        let vol = self.flash.get_mut(volume as usize).ok_or(MatrixError::InvalidVolume)?;
        let start = address as usize;
        let end = start.checked_add(data.len()).ok_or(MatrixError::Truncated)?;
        let slice = vol.get_mut(start..end).ok_or(MatrixError::Truncated)?;
        slice.copy_from_slice(data);
        Ok(())
    }

    fn flash_erase(&mut self, volume: u8, address: u32, size: u32) -> Result<()> {
        let vol = self.flash.get_mut(volume as usize).ok_or(MatrixError::InvalidVolume)?;
        let start = address as usize;
        let end = start.checked_add(size as usize).ok_or(MatrixError::Truncated)?;
        let slice = vol.get_mut(start..end).ok_or(MatrixError::Truncated)?;
        slice.fill(0xFF);
        Ok(())
    }

    fn file_name_to_volume_index(&self, _name: &str) -> Result<u8> {
        Ok(0)
    }

    fn file_info(&self, name: &str) -> Result<FileMetadata> {
        self.find(name).map(|i| self.files[i].0.clone()).ok_or(MatrixError::FileNotFound)
    }

    fn indexed_file_info(&self, _volume: u8, index: u16) -> Result<FileMetadata> {
        self.files.get(index as usize).map(|(m, _)| m.clone()).ok_or(MatrixError::FileNotFound)
    }

    fn read_file_segment(&mut self, file: &FileMetadata, segment_index: u16, buf: &mut [u8]) -> Result<usize> {
        let i = self.find(&file.name).ok_or(MatrixError::FileNotFound)?;
        let data = &self.files[i].1;
        let start = segment_index as usize * ecconet_core::ftp::SEGMENT_SIZE;
        if start >= data.len() {
            return Ok(0);
        }
        let end = (start + ecconet_core::ftp::SEGMENT_SIZE).min(data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&data[start..end]);
        Ok(n)
    }

    fn begin_file_write(&mut self, name: &str, size: u32, data_checksum: u16, timestamp_ms: u32) -> Result<FileMetadata> {
        let meta = FileMetadata {
            name: name.to_string(),
            data_size: size,
            data_checksum,
            timestamp_ms,
            volume: 0,
            location: FlashSlice { volume: 0, offset: 0, len: size },
        };
        if let Some(i) = self.find(name) {
            self.files[i] = (meta.clone(), vec![0u8; size as usize]);
        } else {
            self.files.push((meta.clone(), vec![0u8; size as usize]));
        }
        Ok(meta)
    }

    fn write_file_segment(&mut self, file: &FileMetadata, segment_index: u16, data: &[u8]) -> Result<()> {
        let i = self.find(&file.name).ok_or(MatrixError::FileNotFound)?;
        let buf = &mut self.files[i].1;
        let start = segment_index as usize * ecconet_core::ftp::SEGMENT_SIZE;
        let end = start.checked_add(data.len()).ok_or(MatrixError::Truncated)?;
        if end > buf.len() {
            return Err(MatrixError::Truncated);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn delete_file(&mut self, name: &str) -> Result<()> {
        let i = self.find(name).ok_or(MatrixError::FileNotFound)?;
        self.files.remove(i);
        Ok(())
    }

    fn get_guid(&self) -> [u32; 4] {
        self.guid
    }

    fn token_callback(&mut self, token: Token) {
        self.tokens.push(token);
    }

    fn flash_volumes(&self) -> [FlashVolume; 4] {
        std::array::from_fn(|i| FlashVolume { base: i as u32 * FLASH_VOLUME_SIZE, size: FLASH_VOLUME_SIZE })
    }
}

/// Relay every frame `from` sent since the last drain to `to` (spec §5: a
/// shared broadcast bus). Tests wire up a small mesh of [`LoopbackHost`]s and
/// [`Coordinator`](ecconet_core::coordinator::Coordinator)s with this instead
/// of a real CAN transceiver.
pub fn relay(from: &mut LoopbackHost, to: &mut ecconet_core::coordinator::Coordinator, now_ms: u64) {
    for (id, data) in from.take_sent() {
        to.on_can_frame(id, &data, now_ms);
    }
}
