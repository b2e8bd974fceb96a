use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::record::{Direction, PeerId};

/// A client -> server record as read back from a capture log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRecord {
    /// 1-based line in the capture log, kept for diagnostics.
    pub line: usize,
    pub direction: Direction,
    pub capture_time: DateTime<Utc>,
    pub message_type: Option<String>,
    pub description: Option<String>,
    pub sql: Option<String>,
    pub raw_hex: String,
}

/// The ordered client -> server traffic of one captured connection. Never
/// empty; records are sorted by capture time, ties in log order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    peer: PeerId,
    records: Vec<ReplayRecord>,
}

impl Session {
    fn new(peer: PeerId, mut records: Vec<ReplayRecord>) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        records.sort_by_key(|record| record.capture_time);
        Some(Self { peer, records })
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn records(&self) -> &[ReplayRecord] {
        &self.records
    }

    pub fn first_capture_time(&self) -> DateTime<Utc> {
        self.records[0].capture_time
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedSessions {
    pub sessions: BTreeMap<PeerId, Session>,
    /// Lines that looked like client -> server traffic but could not be used.
    pub skipped: usize,
}

impl LoadedSessions {
    pub fn record_count(&self) -> usize {
        self.sessions
            .values()
            .map(|session| session.records().len())
            .sum()
    }

    /// Earliest capture time across all sessions: the replay time origin.
    pub fn origin(&self) -> Option<DateTime<Utc>> {
        self.sessions
            .values()
            .map(Session::first_capture_time)
            .min()
    }
}

/// Restricts which captured connections are loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub peer_port: Option<u16>,
}

impl SessionFilter {
    fn accepts(&self, peer: PeerId) -> bool {
        self.peer_port.is_none_or(|port| peer.port() == port)
    }
}

#[derive(Debug)]
pub enum SkipReason {
    InvalidEncoding(std::str::Utf8Error),
    InvalidRecord(serde_json::Error),
    MissingField(&'static str),
    InvalidTimestamp(String),
    UnparseablePeer(String),
}

impl SkipReason {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidEncoding(_) => "invalid_encoding",
            Self::InvalidRecord(_) => "invalid_record",
            Self::MissingField(_) => "missing_field",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::UnparseablePeer(_) => "unparseable_peer",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding(err) => write!(f, "not UTF-8: {err}"),
            Self::InvalidRecord(err) => write!(f, "not a valid record: {err}"),
            Self::MissingField(field) => write!(f, "missing `{field}`"),
            Self::InvalidTimestamp(value) => write!(f, "unparseable timestamp `{value}`"),
            Self::UnparseablePeer(descriptor) => {
                write!(f, "cannot parse peer from direction `{descriptor}`")
            }
        }
    }
}

impl std::error::Error for SkipReason {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidEncoding(source) => Some(source),
            Self::InvalidRecord(source) => Some(source),
            _ => None,
        }
    }
}

/// Lenient view of a log line: every field is optional so that missing
/// fields become skips instead of parse failures. Accepts both the current
/// camelCase keys and the snake_case keys of older logs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoggedRecord {
    direction: Option<String>,
    #[serde(alias = "timestamp")]
    capture_time: Option<String>,
    #[serde(alias = "msg_type")]
    message_type: Option<String>,
    description: Option<String>,
    sql: Option<String>,
    #[serde(alias = "raw_hex")]
    raw_hex: Option<String>,
}

pub async fn load_sessions(
    path: impl Into<PathBuf>,
    filter: SessionFilter,
) -> anyhow::Result<LoadedSessions> {
    let path = path.into();
    tokio::task::spawn_blocking(move || load_sessions_blocking(&path, filter))
        .await
        .context("join load_sessions task")?
}

fn load_sessions_blocking(path: &Path, filter: SessionFilter) -> anyhow::Result<LoadedSessions> {
    let file =
        File::open(path).with_context(|| format!("open capture log {}", path.display()))?;
    read_sessions(BufReader::new(file), filter)
        .with_context(|| format!("read capture log {}", path.display()))
}

pub fn read_sessions(reader: impl BufRead, filter: SessionFilter) -> anyhow::Result<LoadedSessions> {
    let mut grouped: BTreeMap<PeerId, Vec<ReplayRecord>> = BTreeMap::new();
    let mut skipped = 0usize;

    for (index, line) in reader.split(b'\n').enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("read line {line_no}"))?;
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }

        match parse_line(line, line_no) {
            Ok(Some(record)) => {
                let Some(peer) = record.direction.peer() else {
                    continue;
                };
                if filter.accepts(peer) {
                    grouped.entry(peer).or_default().push(record);
                }
            }
            Ok(None) => {}
            Err(reason) => {
                skipped += 1;
                tracing::warn!(
                    line = line_no,
                    reason = reason.kind(),
                    "skipping capture log line: {reason}"
                );
            }
        }
    }

    let sessions = grouped
        .into_iter()
        .filter_map(|(peer, records)| Session::new(peer, records).map(|session| (peer, session)))
        .collect();
    Ok(LoadedSessions { sessions, skipped })
}

/// `Ok(None)` for records that are not client -> server traffic.
fn parse_line(line: &[u8], line_no: usize) -> Result<Option<ReplayRecord>, SkipReason> {
    let line = std::str::from_utf8(line).map_err(SkipReason::InvalidEncoding)?;
    let logged: LoggedRecord = serde_json::from_str(line).map_err(SkipReason::InvalidRecord)?;

    let Some(descriptor) = logged.direction else {
        return Ok(None);
    };
    if !Direction::names_client_to_server(&descriptor) {
        return Ok(None);
    }

    let raw_capture_time = logged
        .capture_time
        .ok_or(SkipReason::MissingField("captureTime"))?;
    let raw_hex = logged.raw_hex.ok_or(SkipReason::MissingField("rawHex"))?;
    let direction = descriptor
        .parse::<Direction>()
        .map_err(|_| SkipReason::UnparseablePeer(descriptor.clone()))?;
    let capture_time = parse_capture_time(&raw_capture_time)
        .ok_or(SkipReason::InvalidTimestamp(raw_capture_time))?;

    Ok(Some(ReplayRecord {
        line: line_no,
        direction,
        capture_time,
        message_type: logged.message_type,
        description: logged.description,
        sql: logged.sql,
        raw_hex,
    }))
}

/// RFC 3339, or a naive ISO 8601 timestamp taken as UTC.
pub fn parse_capture_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use chrono::{TimeZone as _, Utc};

    use super::{SessionFilter, parse_capture_time, read_sessions};
    use crate::record::PeerId;

    fn client_line(port: u16, time: &str, hex: &str) -> String {
        format!(
            r#"{{"direction":"(127.0.0.1, {port}) client -> server","messageType":"Q","rawHex":"{hex}","captureTime":"{time}"}}"#
        )
    }

    fn server_line(port: u16, time: &str) -> String {
        format!(
            r#"{{"direction":"(127.0.0.1, {port}) server -> client","messageType":"Z","rawHex":"5a0000000549","captureTime":"{time}"}}"#
        )
    }

    fn load(lines: &[String]) -> super::LoadedSessions {
        let log = lines.join("\n");
        read_sessions(Cursor::new(log), SessionFilter::default()).expect("log should load")
    }

    fn peer(port: u16) -> PeerId {
        PeerId::new(format!("127.0.0.1:{port}").parse().unwrap())
    }

    #[test]
    fn interleaved_peers_become_sorted_sessions() {
        let loaded = load(&[
            client_line(4001, "2025-01-01T00:00:03Z", "03"),
            client_line(4002, "2025-01-01T00:00:02Z", "22"),
            server_line(4001, "2025-01-01T00:00:03.5Z"),
            client_line(4001, "2025-01-01T00:00:01Z", "01"),
            client_line(4002, "2025-01-01T00:00:01Z", "21"),
            client_line(4001, "2025-01-01T00:00:02Z", "02"),
        ]);

        assert_eq!(loaded.sessions.len(), 2);
        assert_eq!(loaded.skipped, 0);
        let first: Vec<&str> = loaded.sessions[&peer(4001)]
            .records()
            .iter()
            .map(|record| record.raw_hex.as_str())
            .collect();
        assert_eq!(first, vec!["01", "02", "03"]);
        let second: Vec<&str> = loaded.sessions[&peer(4002)]
            .records()
            .iter()
            .map(|record| record.raw_hex.as_str())
            .collect();
        assert_eq!(second, vec!["21", "22"]);
        assert!(
            loaded.sessions[&peer(4001)]
                .records()
                .iter()
                .all(|record| record.direction.is_client_to_server())
        );
        assert_eq!(
            loaded.origin(),
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap())
        );
    }

    #[test]
    fn equal_timestamps_keep_log_order() {
        let loaded = load(&[
            client_line(4001, "2025-01-01T00:00:01Z", "aa"),
            client_line(4001, "2025-01-01T00:00:01Z", "bb"),
            client_line(4001, "2025-01-01T00:00:01Z", "cc"),
        ]);
        let order: Vec<usize> = loaded.sessions[&peer(4001)]
            .records()
            .iter()
            .map(|record| record.line)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted() {
        let loaded = load(&[
            client_line(4001, "2025-01-01T00:00:01Z", "01"),
            "{not json".to_owned(),
            client_line(4001, "2025-01-01T00:00:02Z", "02"),
            client_line(4002, "2025-01-01T00:00:03Z", "03"),
        ]);
        assert_eq!(loaded.record_count(), 3);
        assert_eq!(loaded.skipped, 1);
    }

    #[test]
    fn non_utf8_line_is_skipped_and_loading_continues() {
        let mut log = client_line(4001, "2025-01-01T00:00:01Z", "01").into_bytes();
        log.extend_from_slice(b"\n{\"sql\":\"\xff\xfe\"}\n");
        log.extend_from_slice(client_line(4001, "2025-01-01T00:00:02Z", "02").as_bytes());
        log.extend_from_slice(b"\r\n");

        let loaded = read_sessions(Cursor::new(log), SessionFilter::default())
            .expect("a bad line must not fail the load");
        assert_eq!(loaded.record_count(), 2);
        assert_eq!(loaded.skipped, 1);
        let lines: Vec<usize> = loaded.sessions[&peer(4001)]
            .records()
            .iter()
            .map(|record| record.line)
            .collect();
        assert_eq!(lines, vec![1, 3]);
    }

    #[test]
    fn client_records_missing_fields_are_skipped() {
        let loaded = load(&[
            r#"{"direction":"(127.0.0.1, 4001) client -> server","rawHex":"01"}"#.to_owned(),
            r#"{"direction":"(127.0.0.1, 4001) client -> server","captureTime":"2025-01-01T00:00:01Z"}"#.to_owned(),
            r#"{"direction":"(127.0.0.1, 4001) client -> server","captureTime":"yesterday","rawHex":"01"}"#.to_owned(),
            r#"{"direction":"(somewhere) client -> server","captureTime":"2025-01-01T00:00:01Z","rawHex":"01"}"#.to_owned(),
            r#"{"direction":"(127.0.0.1, 4001) server -> client"}"#.to_owned(),
            r##"{"direction":"meta","messageType":"#","recordsWritten":3}"##.to_owned(),
        ]);
        assert!(loaded.sessions.is_empty());
        assert_eq!(loaded.skipped, 4);
    }

    #[test]
    fn empty_log_yields_no_sessions() {
        let loaded = load(&[]);
        assert!(loaded.sessions.is_empty());
        assert_eq!(loaded.skipped, 0);
        assert_eq!(loaded.origin(), None);
    }

    #[test]
    fn snake_case_logs_with_unicode_arrows_load() {
        let loaded = load(&[
            r#"{"timestamp":"2025-06-01T10:00:00.250000","msg_type":"Q","description":"Simple Query","sql":"select 1","raw_hex":"51","direction":"('127.0.0.1', 50280) client → server"}"#.to_owned(),
        ]);
        let session = &loaded.sessions[&peer(50280)];
        assert_eq!(session.records().len(), 1);
        assert_eq!(session.records()[0].sql.as_deref(), Some("select 1"));
        assert_eq!(session.records()[0].message_type.as_deref(), Some("Q"));
    }

    #[test]
    fn peer_filter_keeps_matching_port_only() {
        let log = [
            client_line(4001, "2025-01-01T00:00:01Z", "01"),
            client_line(4002, "2025-01-01T00:00:01Z", "02"),
        ]
        .join("\n");
        let loaded = read_sessions(
            Cursor::new(log),
            SessionFilter {
                peer_port: Some(4002),
            },
        )
        .unwrap();
        assert_eq!(loaded.sessions.keys().copied().collect::<Vec<_>>(), vec![peer(4002)]);
        assert_eq!(loaded.skipped, 0);
    }

    #[test]
    fn capture_time_accepts_rfc3339_and_naive_iso() {
        let expected = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_capture_time("2025-06-01T10:00:00Z"), Some(expected));
        assert_eq!(parse_capture_time("2025-06-01T12:00:00+02:00"), Some(expected));
        assert_eq!(parse_capture_time("2025-06-01T10:00:00"), Some(expected));
        assert_eq!(parse_capture_time("T0"), None);
    }
}
