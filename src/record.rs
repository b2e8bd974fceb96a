use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{sync::SyncStatus, wire};

pub const SUMMARY_MESSAGE_TYPE: char = '#';
pub const SUMMARY_DESCRIPTION: &str = "CaptureSummary";
const META_DESCRIPTOR: &str = "meta";
const CLIENT_TO_SERVER: &str = "client -> server";
const SERVER_TO_CLIENT: &str = "server -> client";
// Written by the first generation of capture logs.
const CLIENT_TO_SERVER_ARROW: &str = "client \u{2192} server";
const SERVER_TO_CLIENT_ARROW: &str = "server \u{2192} client";

/// Remote address of one captured client connection; the session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(SocketAddr);

impl PeerId {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// `(<ip>, <port>)`, the form embedded in direction descriptors.
    fn tuple(&self) -> String {
        format!("({}, {})", self.0.ip(), self.0.port())
    }

    fn parse_tuple(tuple: &str) -> Option<Self> {
        let inner = tuple.strip_prefix('(')?.strip_suffix(')')?;
        let (ip, port) = inner.rsplit_once(',')?;
        let ip = ip.trim().trim_matches('\'');
        let ip: IpAddr = ip.parse().ok()?;
        let port: u16 = port.trim().parse().ok()?;
        Some(Self(SocketAddr::new(ip, port)))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

/// Which way a chunk travelled. Serialized as a human-readable descriptor,
/// e.g. `(127.0.0.1, 4001) client -> server`, which doubles as the session
/// key when a log is replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Direction {
    ClientToServer(PeerId),
    ServerToClient(PeerId),
    Meta,
}

impl Direction {
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            Self::ClientToServer(peer) | Self::ServerToClient(peer) => Some(*peer),
            Self::Meta => None,
        }
    }

    pub fn is_client_to_server(&self) -> bool {
        matches!(self, Self::ClientToServer(_))
    }

    /// True when the descriptor names the client -> server direction, even if
    /// its peer tuple is unreadable.
    pub fn names_client_to_server(descriptor: &str) -> bool {
        descriptor.ends_with(CLIENT_TO_SERVER) || descriptor.ends_with(CLIENT_TO_SERVER_ARROW)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToServer(peer) => write!(f, "{} {CLIENT_TO_SERVER}", peer.tuple()),
            Self::ServerToClient(peer) => write!(f, "{} {SERVER_TO_CLIENT}", peer.tuple()),
            Self::Meta => f.write_str(META_DESCRIPTOR),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionParseError {
    descriptor: String,
}

impl fmt::Display for DirectionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized direction descriptor `{}`", self.descriptor)
    }
}

impl std::error::Error for DirectionParseError {}

impl FromStr for Direction {
    type Err = DirectionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let descriptor = s.trim();
        if descriptor == META_DESCRIPTOR {
            return Ok(Self::Meta);
        }

        let err = || DirectionParseError {
            descriptor: descriptor.to_owned(),
        };
        let (tuple, arrow) = descriptor.rsplit_once(')').ok_or_else(err)?;
        let peer = PeerId::parse_tuple(&format!("{tuple})")).ok_or_else(err)?;
        match arrow.trim() {
            CLIENT_TO_SERVER | CLIENT_TO_SERVER_ARROW => Ok(Self::ClientToServer(peer)),
            SERVER_TO_CLIENT | SERVER_TO_CLIENT_ARROW => Ok(Self::ServerToClient(peer)),
            _ => Err(err()),
        }
    }
}

impl From<Direction> for String {
    fn from(direction: Direction) -> Self {
        direction.to_string()
    }
}

impl TryFrom<String> for Direction {
    type Error = DirectionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Backend target attached to every record of a capture run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendMetadata {
    pub db_host: String,
    pub db_port: u16,
    pub db_user: Option<String>,
    pub db_name: Option<String>,
}

/// One chunk observed by the capture proxy. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRecord {
    pub direction: Direction,
    pub capture_time: DateTime<Utc>,
    pub message_type: Option<char>,
    pub description: Option<String>,
    pub sql: Option<String>,
    pub raw_hex: String,
    pub length: usize,
    #[serde(flatten)]
    pub backend: BackendMetadata,
}

impl CapturedRecord {
    pub fn from_chunk(
        direction: Direction,
        chunk: &[u8],
        capture_time: DateTime<Utc>,
        backend: BackendMetadata,
    ) -> Self {
        let classified = wire::classify(chunk);
        Self {
            direction,
            capture_time,
            message_type: classified.message_type,
            description: classified.description.map(str::to_owned),
            sql: classified.sql,
            raw_hex: hex::encode(chunk),
            length: chunk.len(),
            backend,
        }
    }

    pub fn payload(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.raw_hex)
    }
}

/// Terminal line of a capture run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRecord {
    pub direction: Direction,
    pub message_type: char,
    pub description: String,
    pub records_written: u64,
    pub records_skipped: u64,
    pub connections_accepted: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub backend: BackendMetadata,
}

/// One line of the replay log, written per replayed send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayLogEntry {
    pub replayed_at: DateTime<Utc>,
    pub session: String,
    pub direction: String,
    pub message_type: Option<String>,
    pub description: Option<String>,
    pub sql: Option<String>,
    pub raw_hex: String,
    pub capture_time: DateTime<Utc>,
    pub sync: SyncStatus,
}
