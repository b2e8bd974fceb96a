use std::{fmt, io};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt as _};

use crate::wire;

/// Upper bound on a single backend message; anything larger means the
/// stream is out of step.
const MAX_BACKEND_MESSAGE_LEN: u32 = 1 << 30;

/// Authentication request codes that the client has to answer.
const AUTH_CODES_AWAITING_CLIENT: [u32; 8] = [2, 3, 5, 7, 8, 9, 10, 11];

/// What the replay has to wait for after sending a given payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPoint {
    /// SSLRequest / GSSENCRequest, answered by a single byte.
    EncryptionRequest,
    /// Startup packet: read until ready-for-query or an auth challenge.
    Startup,
    /// Password / SASL response: same wait as after startup.
    AuthResponse,
    /// One ready-for-query per simple query or Sync frame in the payload.
    AwaitReady { count: usize },
    /// Terminate or cancel request: nothing more is sent on the connection.
    Terminate,
    None,
}

impl SyncPoint {
    /// Whether the session must stop after this payload has been sent.
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::Terminate)
    }
}

/// Maps each payload a session sends to its sync point. Messages that span
/// several captured records are waited on after the record that completes
/// them.
#[derive(Debug, Clone, Default)]
pub struct SyncTracker {
    cursor: wire::FrameCursor,
}

impl SyncTracker {
    pub fn next_point(&mut self, payload: &[u8]) -> SyncPoint {
        if self.cursor.at_boundary() {
            if wire::is_encryption_request(payload) {
                return SyncPoint::EncryptionRequest;
            }
            if wire::is_startup(payload) {
                return SyncPoint::Startup;
            }
            if wire::is_cancel_request(payload) || payload.first() == Some(&wire::TERMINATE) {
                return SyncPoint::Terminate;
            }
        }

        let completed = self.cursor.advance(payload);
        if completed.contains(&wire::PASSWORD_MESSAGE) {
            return SyncPoint::AuthResponse;
        }
        match completed
            .iter()
            .filter(|tag| matches!(**tag, wire::QUERY | wire::SYNC))
            .count()
        {
            0 => SyncPoint::None,
            count => SyncPoint::AwaitReady { count },
        }
    }
}

/// Outcome of the post-send synchronization, echoed in the replay log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    None,
    Ready,
    EncryptionDeclined,
    EncryptionAccepted,
    AuthChallenge,
    Terminated,
    Failed,
    TimedOut,
    Cancelled,
}

impl SyncStatus {
    /// Whether the session can keep sending after this outcome.
    pub fn allows_continue(&self) -> bool {
        matches!(
            self,
            Self::None | Self::Ready | Self::EncryptionDeclined | Self::AuthChallenge
        )
    }
}

#[derive(Debug)]
pub enum SyncError {
    Io(io::Error),
    UnexpectedEof,
    MalformedFrame { tag: u8, len: u32 },
    UnexpectedEncryptionResponse(u8),
}

impl SyncError {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::UnexpectedEof => "unexpected_eof",
            Self::MalformedFrame { .. } => "malformed_frame",
            Self::UnexpectedEncryptionResponse(_) => "unexpected_encryption_response",
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "read server response: {err}"),
            Self::UnexpectedEof => f.write_str("server closed the connection mid-conversation"),
            Self::MalformedFrame { tag, len } => write!(
                f,
                "malformed server message (tag 0x{tag:02x}, length {len})"
            ),
            Self::UnexpectedEncryptionResponse(byte) => write!(
                f,
                "unexpected encryption negotiation response 0x{byte:02x}"
            ),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(source) => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for SyncError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::UnexpectedEof
        } else {
            Self::Io(err)
        }
    }
}

/// Consumes whatever the server must send back before the next queued
/// message of the session may go out.
pub async fn await_response<R>(reader: &mut R, point: SyncPoint) -> Result<SyncStatus, SyncError>
where
    R: AsyncRead + Unpin,
{
    match point {
        SyncPoint::None => Ok(SyncStatus::None),
        SyncPoint::Terminate => Ok(SyncStatus::Terminated),
        SyncPoint::EncryptionRequest => match reader.read_u8().await? {
            b'N' => Ok(SyncStatus::EncryptionDeclined),
            b'S' | b'G' => Ok(SyncStatus::EncryptionAccepted),
            other => Err(SyncError::UnexpectedEncryptionResponse(other)),
        },
        SyncPoint::Startup | SyncPoint::AuthResponse => loop {
            let message = read_message(reader).await?;
            match message.tag {
                wire::READY_FOR_QUERY => return Ok(SyncStatus::Ready),
                wire::AUTHENTICATION if message.awaits_client() => {
                    return Ok(SyncStatus::AuthChallenge);
                }
                _ => {}
            }
        },
        SyncPoint::AwaitReady { count } => {
            let mut remaining = count;
            while remaining > 0 {
                if read_message(reader).await?.tag == wire::READY_FOR_QUERY {
                    remaining -= 1;
                }
            }
            Ok(SyncStatus::Ready)
        }
    }
}

/// A backend message with its payload. Only authentication payloads are
/// kept; everything else is drained without buffering.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BackendMessage {
    tag: u8,
    auth_code: Option<u32>,
}

impl BackendMessage {
    fn awaits_client(&self) -> bool {
        self.auth_code
            .is_some_and(|code| AUTH_CODES_AWAITING_CLIENT.contains(&code))
    }
}

async fn read_message<R>(reader: &mut R) -> Result<BackendMessage, SyncError>
where
    R: AsyncRead + Unpin,
{
    let tag = reader.read_u8().await?;
    let len = reader.read_u32().await?;
    if !(4..=MAX_BACKEND_MESSAGE_LEN).contains(&len) {
        return Err(SyncError::MalformedFrame { tag, len });
    }

    let mut body_len = u64::from(len - 4);
    let auth_code = if tag == wire::AUTHENTICATION && body_len >= 4 {
        body_len -= 4;
        Some(reader.read_u32().await?)
    } else {
        None
    };

    let drained = tokio::io::copy(&mut (&mut *reader).take(body_len), &mut tokio::io::sink()).await?;
    if drained < body_len {
        return Err(SyncError::UnexpectedEof);
    }

    Ok(BackendMessage { tag, auth_code })
}
