//! FTP server state machine (spec §4.8).

use super::{RequestKind, SEGMENT_SIZE, TIMEOUT_MS, access_code, is_public, read_metadata, write_metadata};
use crate::error::{MatrixError, Result};
use crate::host::{FileMetadata, HostInterface, ReadHandlerOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Serving {
        client: u8,
        last_active_ms: u64,
        current_file: Option<FileMetadata>,
    },
}

/// Single-client-at-a-time FTP server (spec §4.8).
pub struct FtpServer {
    state: State,
}

impl Default for FtpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FtpServer {
    #[must_use]
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    #[must_use]
    pub fn is_busy_for(&self, requester: u8) -> bool {
        matches!(&self.state, State::Serving { client, .. } if *client != requester)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Age out an inactive transaction after 1 s.
    pub fn tick(&mut self, now_ms: u64) {
        if let State::Serving { last_active_ms, .. } = self.state {
            if now_ms.saturating_sub(last_active_ms) > TIMEOUT_MS {
                self.state = State::Idle;
            }
        }
    }

    fn touch(&mut self, client: u8, now_ms: u64, current_file: Option<FileMetadata>) {
        self.state = State::Serving {
            client,
            last_active_ms: now_ms,
            current_file,
        };
    }

    fn current_file(&self) -> Option<&FileMetadata> {
        match &self.state {
            State::Serving { current_file, .. } => current_file.as_ref(),
            State::Idle => None,
        }
    }

    /// Handle one inbound FTP request. `Ok(None)` means no reply is due
    /// (`FileTransferComplete`); `Err` is logged by the caller, never retried.
    pub fn handle_request(
        &mut self,
        host: &mut impl HostInterface,
        requester: u8,
        kind: RequestKind,
        body: &[u8],
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>> {
        if self.is_busy_for(requester) {
            return Err(MatrixError::FtpServerBusy);
        }

        match kind {
            RequestKind::FileIndexedInfo => {
                let volume = *body.first().ok_or(MatrixError::Truncated)?;
                let index = u16::from_be_bytes(body.get(1..3).ok_or(MatrixError::Truncated)?.try_into().unwrap());
                let code = u32::from_be_bytes(body.get(3..7).ok_or(MatrixError::Truncated)?.try_into().unwrap());
                self.check_access(host, code)?;
                let meta = host.indexed_file_info(volume, index)?;
                self.touch(requester, now_ms, Some(meta.clone()));
                let mut out = Vec::new();
                write_metadata(&mut out, &meta);
                Ok(Some(out))
            }
            RequestKind::FileInfo | RequestKind::FileReadStart => {
                let name_len = *body.first().ok_or(MatrixError::Truncated)? as usize;
                let name = std::str::from_utf8(body.get(1..1 + name_len).ok_or(MatrixError::Truncated)?)
                    .map_err(|_| MatrixError::InvalidFileName)?
                    .to_string();
                let code_offset = 1 + name_len;
                if !is_public(&name) {
                    let code = u32::from_be_bytes(
                        body.get(code_offset..code_offset + 4).ok_or(MatrixError::Truncated)?.try_into().unwrap(),
                    );
                    self.check_access(host, code)?;
                }
                let meta = host.file_info(&name)?;
                self.touch(requester, now_ms, Some(meta.clone()));
                let mut out = Vec::new();
                write_metadata(&mut out, &meta);
                if is_public(&name) {
                    for word in host.get_guid() {
                        out.extend_from_slice(&word.to_be_bytes());
                    }
                }
                Ok(Some(out))
            }
            RequestKind::FileReadSegment => {
                let segment_index = u16::from_be_bytes(body.get(0..2).ok_or(MatrixError::Truncated)?.try_into().unwrap());
                let code = u32::from_be_bytes(body.get(2..6).ok_or(MatrixError::Truncated)?.try_into().unwrap());
                let file = self.current_file().cloned().ok_or(MatrixError::FtpClientError)?;
                if !is_public(&file.name) {
                    self.check_access(host, code)?;
                }
                let mut buf = vec![0u8; SEGMENT_SIZE];
                let n = match host.ftp_server_read_handler(requester, &file, segment_index, &mut buf)? {
                    ReadHandlerOutcome::Served(n) => n,
                    ReadHandlerOutcome::NotMine => host.read_file_segment(&file, segment_index, &mut buf)?,
                };
                buf.truncate(n);
                self.touch(requester, now_ms, Some(file));
                let mut out = segment_index.to_be_bytes().to_vec();
                out.extend_from_slice(&buf);
                Ok(Some(out))
            }
            RequestKind::FileWriteStart => {
                let name_len = *body.first().ok_or(MatrixError::Truncated)? as usize;
                let mut pos = 1;
                let name = std::str::from_utf8(body.get(pos..pos + name_len).ok_or(MatrixError::Truncated)?)
                    .map_err(|_| MatrixError::InvalidFileName)?
                    .to_string();
                pos += name_len;
                let size = u32::from_be_bytes(body.get(pos..pos + 4).ok_or(MatrixError::Truncated)?.try_into().unwrap());
                pos += 4;
                let crc = u16::from_be_bytes(body.get(pos..pos + 2).ok_or(MatrixError::Truncated)?.try_into().unwrap());
                pos += 2;
                let timestamp = u32::from_be_bytes(body.get(pos..pos + 4).ok_or(MatrixError::Truncated)?.try_into().unwrap());
                pos += 4;
                let code = u32::from_be_bytes(body.get(pos..pos + 4).ok_or(MatrixError::Truncated)?.try_into().unwrap());
                self.check_access(host, code)?;

                let meta = host.begin_file_write(&name, size, crc, timestamp)?;
                self.touch(requester, now_ms, Some(meta));
                let mut out = vec![name.len() as u8];
                out.extend_from_slice(name.as_bytes());
                Ok(Some(out))
            }
            RequestKind::FileWriteSegment => {
                let segment_index = u16::from_be_bytes(body.get(0..2).ok_or(MatrixError::Truncated)?.try_into().unwrap());
                let code = u32::from_be_bytes(body.get(2..6).ok_or(MatrixError::Truncated)?.try_into().unwrap());
                self.check_access(host, code)?;
                let data = body.get(6..).ok_or(MatrixError::Truncated)?;
                let file = self.current_file().cloned().ok_or(MatrixError::FtpClientError)?;
                host.write_file_segment(&file, segment_index, data)?;
                self.touch(requester, now_ms, Some(file));
                Ok(Some(segment_index.to_be_bytes().to_vec()))
            }
            RequestKind::FileDelete => {
                let name_len = *body.first().ok_or(MatrixError::Truncated)? as usize;
                let name = std::str::from_utf8(body.get(1..1 + name_len).ok_or(MatrixError::Truncated)?)
                    .map_err(|_| MatrixError::InvalidFileName)?
                    .to_string();
                let code_offset = 1 + name_len;
                let code = u32::from_be_bytes(
                    body.get(code_offset..code_offset + 4).ok_or(MatrixError::Truncated)?.try_into().unwrap(),
                );
                self.check_access(host, code)?;
                host.delete_file(&name)?;
                self.touch(requester, now_ms, None);
                let mut out = vec![name.len() as u8];
                out.extend_from_slice(name.as_bytes());
                Ok(Some(out))
            }
            RequestKind::FileTransferComplete => {
                self.state = State::Idle;
                Ok(None)
            }
        }
    }

    fn check_access(&self, host: &impl HostInterface, code: u32) -> Result<()> {
        if code == access_code(host.get_guid()) {
            Ok(())
        } else {
            Err(MatrixError::FtpClientError)
        }
    }
}
