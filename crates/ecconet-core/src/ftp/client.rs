//! FTP client state machine (spec §4.9).

use super::{RequestKind, SEGMENT_SIZE, TIMEOUT_MS, access_code, is_public, read_metadata};
use crate::error::MatrixError;
use crate::host::FileMetadata;

/// Outcome delivered to the caller's completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtpOutcome {
    Info(FileMetadata),
    Read { meta: FileMetadata, data: Vec<u8> },
    WriteComplete,
    Deleted,
    Error(MatrixError),
}

/// An outbound request the caller should transmit (key + body), and whether a
/// `FileTransferComplete` must follow because the transaction just ended.
pub struct ClientAction {
    pub request: RequestKind,
    pub body: Vec<u8>,
}

enum Pending {
    AwaitingInfo {
        for_read: bool,
        /// Access code supplied by the caller; used for the segment requests
        /// that follow when the file isn't the public product-info file.
        access_code: u32,
    },
    AwaitingIndexedInfo,
    AwaitingReadSegment {
        meta: FileMetadata,
        access_code: u32,
        collected: Vec<u8>,
        next_segment: u16,
        total_segments: u16,
    },
    AwaitingWriteStartAck {
        data: Vec<u8>,
        access_code: u32,
    },
    AwaitingWriteSegmentAck {
        data: Vec<u8>,
        access_code: u32,
        next_segment: u16,
        total_segments: u16,
    },
    AwaitingDeleteAck,
}

struct Session {
    server: u8,
    since_ms: u64,
    expected: RequestKind,
    pending: Pending,
}

/// `{Idle, Awaiting}` per spec §4.9; one outstanding request per node.
pub struct FtpClient {
    session: Option<Session>,
}

impl Default for FtpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FtpClient {
    #[must_use]
    pub fn new() -> Self {
        Self { session: None }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.session.is_none()
    }

    fn start(&mut self, server: u8, now_ms: u64, expected: RequestKind, pending: Pending, body: Vec<u8>) -> Result<ClientAction, MatrixError> {
        self.session = Some(Session {
            server,
            since_ms: now_ms,
            expected,
            pending,
        });
        Ok(ClientAction { request: expected, body })
    }

    fn guard(&self, own_server_busy: bool) -> Result<(), MatrixError> {
        if !self.is_idle() || own_server_busy {
            return Err(MatrixError::FtpServerBusy);
        }
        Ok(())
    }

    pub fn get_file_info(&mut self, server: u8, name: &str, access_code: u32, own_server_busy: bool, now_ms: u64) -> Result<ClientAction, MatrixError> {
        self.guard(own_server_busy)?;
        let mut body = vec![name.len() as u8];
        body.extend_from_slice(name.as_bytes());
        if !is_public(name) {
            body.extend_from_slice(&access_code.to_be_bytes());
        }
        self.start(
            server,
            now_ms,
            RequestKind::FileInfo,
            Pending::AwaitingInfo { for_read: false, access_code },
            body,
        )
    }

    pub fn get_indexed_file_info(&mut self, server: u8, volume: u8, index: u16, access_code: u32, own_server_busy: bool, now_ms: u64) -> Result<ClientAction, MatrixError> {
        self.guard(own_server_busy)?;
        let mut body = vec![volume];
        body.extend_from_slice(&index.to_be_bytes());
        body.extend_from_slice(&access_code.to_be_bytes());
        self.start(server, now_ms, RequestKind::FileIndexedInfo, Pending::AwaitingIndexedInfo, body)
    }

    /// Begin a read: sends `FileInfo`/`FileReadStart` first; segments follow
    /// as responses arrive via [`on_response`](Self::on_response).
    pub fn read_file(&mut self, server: u8, name: &str, access_code: u32, own_server_busy: bool, now_ms: u64) -> Result<ClientAction, MatrixError> {
        self.guard(own_server_busy)?;
        let mut body = vec![name.len() as u8];
        body.extend_from_slice(name.as_bytes());
        if !is_public(name) {
            body.extend_from_slice(&access_code.to_be_bytes());
        }
        self.start(
            server,
            now_ms,
            RequestKind::FileReadStart,
            Pending::AwaitingInfo { for_read: true, access_code },
            body,
        )
    }

    pub fn write_file(&mut self, server: u8, name: &str, data: Vec<u8>, crc16: u16, timestamp_ms: u32, access_code: u32, own_server_busy: bool, now_ms: u64) -> Result<ClientAction, MatrixError> {
        self.guard(own_server_busy)?;
        let mut body = vec![name.len() as u8];
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(&(data.len() as u32).to_be_bytes());
        body.extend_from_slice(&crc16.to_be_bytes());
        body.extend_from_slice(&timestamp_ms.to_be_bytes());
        body.extend_from_slice(&access_code.to_be_bytes());
        self.start(
            server,
            now_ms,
            RequestKind::FileWriteStart,
            Pending::AwaitingWriteStartAck { data, access_code },
            body,
        )
    }

    pub fn delete_file(&mut self, server: u8, name: &str, access_code: u32, own_server_busy: bool, now_ms: u64) -> Result<ClientAction, MatrixError> {
        self.guard(own_server_busy)?;
        let mut body = vec![name.len() as u8];
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(&access_code.to_be_bytes());
        self.start(server, now_ms, RequestKind::FileDelete, Pending::AwaitingDeleteAck, body)
    }

    /// Age out the current transaction if the server hasn't replied in 1 s.
    pub fn tick(&mut self, now_ms: u64) -> Option<FtpOutcome> {
        let timed_out = self
            .session
            .as_ref()
            .is_some_and(|s| now_ms.saturating_sub(s.since_ms) > TIMEOUT_MS);
        if timed_out {
            self.session = None;
            Some(FtpOutcome::Error(MatrixError::FtpTransactionTimedOut))
        } else {
            None
        }
    }

    /// Feed one FTP response. Returns `(next outbound request, terminal outcome)`;
    /// a terminal outcome always implies the caller should also emit
    /// `FileTransferComplete` to the server.
    pub fn on_response(&mut self, from: u8, kind: RequestKind, body: &[u8], now_ms: u64) -> (Option<ClientAction>, Option<FtpOutcome>) {
        let Some(session) = &self.session else {
            return (None, None);
        };
        if session.server != from || session.expected != kind {
            return (None, None);
        }

        let session = self.session.take().unwrap();
        match session.pending {
            Pending::AwaitingInfo { for_read, access_code: supplied_code } => {
                let Some((meta, _)) = read_metadata(body, 0) else {
                    return (None, Some(FtpOutcome::Error(MatrixError::Truncated)));
                };
                if !for_read {
                    return (None, Some(FtpOutcome::Info(meta)));
                }
                let guid_code = if is_public(&meta.name) && body.len() >= 16 {
                    let tail = &body[body.len() - 16..];
                    let mut guid = [0u32; 4];
                    for (i, chunk) in tail.chunks_exact(4).enumerate() {
                        guid[i] = u32::from_be_bytes(chunk.try_into().unwrap());
                    }
                    access_code(guid)
                } else {
                    supplied_code
                };
                let total_segments = meta.data_size.div_ceil(SEGMENT_SIZE as u32) as u16;
                let mut next_body = 0u16.to_be_bytes().to_vec();
                next_body.extend_from_slice(&guid_code.to_be_bytes());
                self.session = Some(Session {
                    server: from,
                    since_ms: now_ms,
                    expected: RequestKind::FileReadSegment,
                    pending: Pending::AwaitingReadSegment {
                        meta,
                        access_code: guid_code,
                        collected: Vec::new(),
                        next_segment: 0,
                        total_segments,
                    },
                });
                (
                    Some(ClientAction {
                        request: RequestKind::FileReadSegment,
                        body: next_body,
                    }),
                    None,
                )
            }
            Pending::AwaitingIndexedInfo => match read_metadata(body, 0) {
                Some((meta, _)) => (None, Some(FtpOutcome::Info(meta))),
                None => (None, Some(FtpOutcome::Error(MatrixError::Truncated))),
            },
            Pending::AwaitingReadSegment {
                meta,
                access_code,
                mut collected,
                next_segment,
                total_segments,
            } => {
                if body.len() < 2 {
                    return (None, Some(FtpOutcome::Error(MatrixError::Truncated)));
                }
                collected.extend_from_slice(&body[2..]);
                let next = next_segment + 1;
                if next >= total_segments {
                    let checksum = crate::crc::crc16(&collected);
                    if checksum != meta.data_checksum {
                        return (None, Some(FtpOutcome::Error(MatrixError::FileChecksumError)));
                    }
                    (None, Some(FtpOutcome::Read { meta, data: collected }))
                } else {
                    let mut next_body = next.to_be_bytes().to_vec();
                    next_body.extend_from_slice(&access_code.to_be_bytes());
                    self.session = Some(Session {
                        server: from,
                        since_ms: now_ms,
                        expected: RequestKind::FileReadSegment,
                        pending: Pending::AwaitingReadSegment {
                            meta,
                            access_code,
                            collected,
                            next_segment: next,
                            total_segments,
                        },
                    });
                    (
                        Some(ClientAction {
                            request: RequestKind::FileReadSegment,
                            body: next_body,
                        }),
                        None,
                    )
                }
            }
            Pending::AwaitingWriteStartAck { data, access_code } => {
                let total_segments = (data.len() as u32).div_ceil(SEGMENT_SIZE as u32) as u16;
                if total_segments == 0 {
                    return (None, Some(FtpOutcome::WriteComplete));
                }
                let chunk = &data[0..data.len().min(SEGMENT_SIZE)];
                let mut next_body = 0u16.to_be_bytes().to_vec();
                next_body.extend_from_slice(&access_code.to_be_bytes());
                next_body.extend_from_slice(chunk);
                self.session = Some(Session {
                    server: from,
                    since_ms: now_ms,
                    expected: RequestKind::FileWriteSegment,
                    pending: Pending::AwaitingWriteSegmentAck {
                        data,
                        access_code,
                        next_segment: 0,
                        total_segments,
                    },
                });
                (
                    Some(ClientAction {
                        request: RequestKind::FileWriteSegment,
                        body: next_body,
                    }),
                    None,
                )
            }
            Pending::AwaitingWriteSegmentAck {
                data,
                access_code,
                next_segment,
                total_segments,
            } => {
                let next = next_segment + 1;
                if next >= total_segments {
                    (None, Some(FtpOutcome::WriteComplete))
                } else {
                    let start = next as usize * SEGMENT_SIZE;
                    let end = (start + SEGMENT_SIZE).min(data.len());
                    let mut next_body = next.to_be_bytes().to_vec();
                    next_body.extend_from_slice(&access_code.to_be_bytes());
                    next_body.extend_from_slice(&data[start..end]);
                    self.session = Some(Session {
                        server: from,
                        since_ms: now_ms,
                        expected: RequestKind::FileWriteSegment,
                        pending: Pending::AwaitingWriteSegmentAck {
                            data,
                            access_code,
                            next_segment: next,
                            total_segments,
                        },
                    });
                    (
                        Some(ClientAction {
                            request: RequestKind::FileWriteSegment,
                            body: next_body,
                        }),
                        None,
                    )
                }
            }
            Pending::AwaitingDeleteAck => (None, Some(FtpOutcome::Deleted)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_product_inf_read_round_trip() {
        let mut client = FtpClient::new();
        let action = client.read_file(9, "product.inf", 0, false, 0).unwrap();
        assert_eq!(action.request, RequestKind::FileReadStart);

        let guid = [0xEE4C_AD97u32, 0x331C_E9EC, 0x9E95_7DBC, 0xA4A6_9FE5];
        let data = vec![0x11u8; 92];
        let crc = crate::crc::crc16(&data);
        let mut reply = vec!["product.inf".len() as u8];
        reply.extend_from_slice(b"product.inf");
        reply.extend_from_slice(&92u32.to_be_bytes());
        reply.extend_from_slice(&crc.to_be_bytes());
        reply.extend_from_slice(&0u32.to_be_bytes());
        for word in guid {
            reply.extend_from_slice(&word.to_be_bytes());
        }

        let (next, outcome) = client.on_response(9, RequestKind::FileReadStart, &reply, 10);
        assert!(outcome.is_none());
        let next = next.unwrap();
        assert_eq!(next.request, RequestKind::FileReadSegment);

        let mut seg_reply = 0u16.to_be_bytes().to_vec();
        seg_reply.extend_from_slice(&data);
        let (next2, outcome2) = client.on_response(9, RequestKind::FileReadSegment, &seg_reply, 20);
        assert!(next2.is_none());
        match outcome2.unwrap() {
            FtpOutcome::Read { meta, data: got } => {
                assert_eq!(meta.data_size, 92);
                assert_eq!(got, data);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(client.is_idle());
    }

    #[test]
    fn checksum_mismatch_surfaces_as_error() {
        let mut client = FtpClient::new();
        client.read_file(9, "product.inf", 0, false, 0).unwrap();
        let mut reply = vec!["product.inf".len() as u8];
        reply.extend_from_slice(b"product.inf");
        reply.extend_from_slice(&4u32.to_be_bytes());
        reply.extend_from_slice(&0xFFFFu16.to_be_bytes()); // wrong checksum
        reply.extend_from_slice(&0u32.to_be_bytes());
        reply.extend_from_slice(&[0u8; 16]);
        client.on_response(9, RequestKind::FileReadStart, &reply, 10);

        let mut seg_reply = 0u16.to_be_bytes().to_vec();
        seg_reply.extend_from_slice(&[1, 2, 3, 4]);
        let (_, outcome) = client.on_response(9, RequestKind::FileReadSegment, &seg_reply, 20);
        assert_eq!(outcome, Some(FtpOutcome::Error(MatrixError::FileChecksumError)));
    }

    #[test]
    fn busy_while_non_idle_rejects_new_request() {
        let mut client = FtpClient::new();
        client.get_file_info(9, "eq_user1.btc", 42, false, 0).unwrap();
        let err = client.get_file_info(9, "eq_user1.btc", 42, false, 5).unwrap_err();
        assert_eq!(err, MatrixError::FtpServerBusy);
    }

    #[test]
    fn busy_while_own_server_busy_rejects_new_request() {
        let mut client = FtpClient::new();
        let err = client.get_file_info(9, "eq_user1.btc", 42, true, 0).unwrap_err();
        assert_eq!(err, MatrixError::FtpServerBusy);
    }

    #[test]
    fn timeout_surfaces_after_one_second() {
        let mut client = FtpClient::new();
        client.get_file_info(9, "eq_user1.btc", 42, false, 0).unwrap();
        assert!(client.tick(500).is_none());
        assert_eq!(client.tick(1500), Some(FtpOutcome::Error(MatrixError::FtpTransactionTimedOut)));
        assert!(client.is_idle());
    }

    #[test]
    fn write_file_round_trip_drives_segments_to_completion() {
        let mut client = FtpClient::new();
        let data = vec![7u8; 300];
        let action = client.write_file(9, "eq_user1.btc", data.clone(), 0xBEEF, 0, 42, false, 0).unwrap();
        assert_eq!(action.request, RequestKind::FileWriteStart);

        let mut ack = vec!["eq_user1.btc".len() as u8];
        ack.extend_from_slice(b"eq_user1.btc");
        let (next, outcome) = client.on_response(9, RequestKind::FileWriteStart, &ack, 10);
        assert!(outcome.is_none());
        let next = next.unwrap();
        assert_eq!(next.request, RequestKind::FileWriteSegment);

        let seg0_ack = 0u16.to_be_bytes().to_vec();
        let (next2, outcome2) = client.on_response(9, RequestKind::FileWriteSegment, &seg0_ack, 20);
        assert!(outcome2.is_none());
        let next2 = next2.unwrap();

        assert_eq!(next2.request, RequestKind::FileWriteSegment);
        let seg1_ack = 1u16.to_be_bytes().to_vec();
        let (next3, outcome3) = client.on_response(9, RequestKind::FileWriteSegment, &seg1_ack, 30);
        assert!(next3.is_none());
        assert_eq!(outcome3, Some(FtpOutcome::WriteComplete));
    }
}
