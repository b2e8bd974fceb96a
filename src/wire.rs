use std::collections::BTreeMap;

/// Protocol version 3.0 as sent in the startup packet.
pub const PROTOCOL_VERSION_3: u32 = 196_608;
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: u32 = 80_877_104;
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

pub const QUERY: u8 = b'Q';
pub const TERMINATE: u8 = b'X';
pub const SYNC: u8 = b'S';
pub const PASSWORD_MESSAGE: u8 = b'p';
pub const READY_FOR_QUERY: u8 = b'Z';
pub const AUTHENTICATION: u8 = b'R';
pub const ERROR_RESPONSE: u8 = b'E';

/// Tag byte plus the 4-byte length of a regular protocol message.
pub const MESSAGE_HEADER_LEN: usize = 5;
const ENCRYPTION_REQUEST_LEN: usize = 8;
const CANCEL_REQUEST_LEN: usize = 16;
const STARTUP_PARAMS_OFFSET: usize = 8;

const DESCRIPTIONS: [(char, &str); 14] = [
    ('Q', "Simple Query"),
    ('R', "AuthenticationRequest"),
    ('S', "ParameterStatus"),
    ('K', "BackendKeyData"),
    ('Z', "ReadyForQuery"),
    ('T', "RowDescription"),
    ('D', "DataRow"),
    ('C', "CommandComplete"),
    ('E', "ErrorResponse"),
    ('N', "NoticeResponse"),
    ('1', "ParseComplete"),
    ('2', "BindComplete"),
    ('3', "CloseComplete"),
    ('X', "Terminate"),
];

/// Best-effort structural view of one chunk read off a socket.
///
/// The chunk is never re-framed: only its first bytes are inspected, so a
/// read that coalesces several protocol messages is described by the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub message_type: Option<char>,
    pub description: Option<&'static str>,
    pub sql: Option<String>,
}

pub fn classify(chunk: &[u8]) -> Classification {
    let Some(&first) = chunk.first() else {
        return Classification::default();
    };

    let message_type = tag_char(first);
    let sql = if first == QUERY && chunk.len() > MESSAGE_HEADER_LEN {
        let text = &chunk[MESSAGE_HEADER_LEN..];
        let end = text.iter().position(|byte| *byte == 0).unwrap_or(text.len());
        Some(String::from_utf8_lossy(&text[..end]).into_owned())
    } else {
        None
    };

    Classification {
        message_type: Some(message_type),
        description: describe(message_type),
        sql,
    }
}

pub fn describe(tag: char) -> Option<&'static str> {
    DESCRIPTIONS
        .iter()
        .find(|(known, _)| *known == tag)
        .map(|(_, description)| *description)
}

fn tag_char(byte: u8) -> char {
    if byte.is_ascii() {
        char::from(byte)
    } else {
        char::REPLACEMENT_CHARACTER
    }
}

fn request_code(chunk: &[u8]) -> Option<u32> {
    let code: [u8; 4] = chunk.get(4..8)?.try_into().ok()?;
    Some(u32::from_be_bytes(code))
}

pub fn is_startup(chunk: &[u8]) -> bool {
    request_code(chunk) == Some(PROTOCOL_VERSION_3)
}

/// SSLRequest or GSSENCRequest: both are answered with a single byte.
pub fn is_encryption_request(chunk: &[u8]) -> bool {
    chunk.len() == ENCRYPTION_REQUEST_LEN
        && matches!(
            request_code(chunk),
            Some(SSL_REQUEST_CODE | GSSENC_REQUEST_CODE)
        )
}

/// The server closes the connection after a cancel request without replying.
pub fn is_cancel_request(chunk: &[u8]) -> bool {
    chunk.len() == CANCEL_REQUEST_LEN && request_code(chunk) == Some(CANCEL_REQUEST_CODE)
}

/// Connection parameters announced by a startup packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupParameters {
    params: BTreeMap<String, String>,
}

impl StartupParameters {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    pub fn database(&self) -> Option<&str> {
        self.get("database")
    }
}

/// Parses a startup packet. Returns `None` unless bytes 4..8 carry the
/// protocol 3.0 version code; trailing garbage only shortens the result.
pub fn parse_startup(chunk: &[u8]) -> Option<StartupParameters> {
    if !is_startup(chunk) {
        return None;
    }

    let mut fields = chunk[STARTUP_PARAMS_OFFSET..]
        .split(|byte| *byte == 0)
        .map(|field| String::from_utf8_lossy(field).into_owned());
    let mut params = BTreeMap::new();
    while let (Some(key), Some(value)) = (fields.next(), fields.next()) {
        if key.is_empty() {
            break;
        }
        params.insert(key, value);
    }

    Some(StartupParameters { params })
}

/// Follows tagged message boundaries across the consecutive chunks of one
/// stream. A message split over several reads is reported once, by the
/// chunk that completes it.
#[derive(Debug, Clone, Default)]
pub struct FrameCursor {
    header: Vec<u8>,
    open: Option<OpenFrame>,
}

#[derive(Debug, Clone, Copy)]
struct OpenFrame {
    tag: u8,
    remaining: usize,
}

impl FrameCursor {
    /// Whether the next chunk starts on a message boundary.
    pub fn at_boundary(&self) -> bool {
        self.header.is_empty() && self.open.is_none()
    }

    /// Consumes the next chunk and returns the tags of the messages it
    /// completes, in order. A length below 4 means the stream is out of
    /// step: the rest of the chunk is dropped and tracking restarts.
    pub fn advance(&mut self, mut chunk: &[u8]) -> Vec<u8> {
        let mut completed = Vec::new();
        loop {
            if let Some(open) = self.open.as_mut() {
                if chunk.len() < open.remaining {
                    open.remaining -= chunk.len();
                    return completed;
                }
                chunk = &chunk[open.remaining..];
                completed.push(open.tag);
                self.open = None;
            }
            if chunk.is_empty() {
                return completed;
            }

            let wanted = (MESSAGE_HEADER_LEN - self.header.len()).min(chunk.len());
            self.header.extend_from_slice(&chunk[..wanted]);
            chunk = &chunk[wanted..];
            let Ok(header) = <[u8; MESSAGE_HEADER_LEN]>::try_from(self.header.as_slice()) else {
                return completed;
            };
            self.header.clear();

            let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
            if len < 4 {
                return completed;
            }
            self.open = Some(OpenFrame {
                tag: header[0],
                remaining: len - 4,
            });
        }
    }
}
