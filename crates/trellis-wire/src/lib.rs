// Wire format: a fixed frame header around JSON envelopes.
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAGIC: u32 = 0x54524C31;
pub const VERSION: u16 = 1;
// Flags describe how to interpret the frame payload.
pub const FLAG_JSON_ENVELOPE: u16 = 0x0000;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("unsupported frame flags {0:#06x}")]
    UnsupportedFlags(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Network byte order.
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use trellis_wire::Frame;
///
/// let frame = Frame::new(0, Bytes::from_static(b"{}")).expect("frame");
/// let decoded = Frame::decode(frame.encode()).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"{}"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// First envelope a connection sends; names the link and its roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub link: String,
    #[serde(default)]
    pub responder: bool,
    #[serde(default)]
    pub requester: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePath {
    pub path: String,
    pub sid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
}

/// Requests flowing from a requester to the broker, and from the broker to a
/// responder.
///
/// ```
/// use trellis_wire::Request;
///
/// let request = Request::List { rid: 1, path: "/foo".to_string() };
/// let json = serde_json::to_value(&request).expect("json");
/// assert_eq!(json["method"], "list");
/// assert_eq!(json["rid"], 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Request {
    List {
        rid: u64,
        path: String,
    },
    Subscribe {
        rid: u64,
        paths: Vec<SubscribePath>,
    },
    Unsubscribe {
        rid: u64,
        sids: Vec<u64>,
    },
    Close {
        rid: u64,
    },
}

impl Request {
    pub const METHODS: [&'static str; 4] = ["list", "subscribe", "unsubscribe", "close"];

    pub fn rid(&self) -> u64 {
        match self {
            Request::List { rid, .. }
            | Request::Subscribe { rid, .. }
            | Request::Unsubscribe { rid, .. }
            | Request::Close { rid } => *rid,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Request::List { .. } => "list",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::Close { .. } => "close",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Initialize,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub msg: String,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            msg: msg.into(),
        }
    }
}

/// A response for one request id. Subscription value updates use rid 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub rid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn new(rid: u64, stream: Option<StreamStatus>, updates: Vec<Value>) -> Self {
        Self {
            rid,
            stream,
            updates,
            error: None,
        }
    }

    /// Terminal `closed` response with no updates.
    pub fn closed(rid: u64) -> Self {
        Self::new(rid, Some(StreamStatus::Closed), Vec::new())
    }

    pub fn error(rid: u64, error: ErrorBody) -> Self {
        Self {
            rid,
            stream: Some(StreamStatus::Closed),
            updates: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream == Some(StreamStatus::Closed)
    }

    /// Fold a later response for the same rid into this one: updates are
    /// appended in order, the later stream status and error win.
    pub fn merge(&mut self, later: Response) {
        debug_assert_eq!(self.rid, later.rid);
        self.updates.extend(later.updates);
        if later.stream.is_some() {
            self.stream = later.stream;
        }
        if later.error.is_some() {
            self.error = later.error;
        }
    }
}

/// Unit of transmission: one envelope per frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hello: Option<Hello>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<Request>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub responses: Vec<Response>,
}

impl Envelope {
    pub fn with_requests(requests: Vec<Request>) -> Self {
        Self {
            requests,
            ..Self::default()
        }
    }

    pub fn with_responses(responses: Vec<Response>) -> Self {
        Self {
            responses,
            ..Self::default()
        }
    }

    pub fn ack_only(ack: u64) -> Self {
        Self {
            ack: Some(ack),
            ..Self::default()
        }
    }

    /// Envelopes that only acknowledge never consume flow-control credit.
    pub fn is_ack_only(&self) -> bool {
        self.hello.is_none() && self.requests.is_empty() && self.responses.is_empty()
    }

    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(FLAG_JSON_ENVELOPE, Bytes::from(payload))
    }

    /// Decode an envelope, keeping well-formed requests and collecting the
    /// malformed ones separately so each can be answered with an error.
    pub fn decode(frame: Frame) -> Result<Decoded> {
        if frame.header.flags != FLAG_JSON_ENVELOPE {
            return Err(Error::UnsupportedFlags(frame.header.flags));
        }
        let raw: RawEnvelope = serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)?;
        let mut requests = Vec::with_capacity(raw.requests.len());
        let mut rejected = Vec::new();
        for value in raw.requests {
            let rid = value.get("rid").and_then(Value::as_u64);
            let known = value
                .get("method")
                .and_then(Value::as_str)
                .is_some_and(|method| Request::METHODS.contains(&method));
            match serde_json::from_value::<Request>(value) {
                Ok(request) => requests.push(request),
                Err(err) => rejected.push(Rejected {
                    rid,
                    kind: if known {
                        RejectKind::Malformed
                    } else {
                        RejectKind::UnknownMethod
                    },
                    reason: err.to_string(),
                }),
            }
        }
        Ok(Decoded {
            envelope: Envelope {
                msg: raw.msg,
                ack: raw.ack,
                hello: raw.hello,
                requests,
                responses: raw.responses,
            },
            rejected,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    msg: Option<u64>,
    #[serde(default)]
    ack: Option<u64>,
    #[serde(default)]
    hello: Option<Hello>,
    #[serde(default)]
    requests: Vec<Value>,
    #[serde(default)]
    responses: Vec<Response>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    UnknownMethod,
    Malformed,
}

/// A request that could not be understood (unknown method, bad fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub rid: Option<u64>,
    pub kind: RejectKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub envelope: Envelope,
    pub rejected: Vec<Rejected>,
}
