//! The token protocol.
//!
//! Every message travels in a frame prefixed with its length as a big-endian
//! `u32`, over one long-lived TCP connection.
//!
//! ```text
//! Request:  | id: i32 | type: u8 | payload |
//! Response: | id: i32 | type: u8 | status: i8 | payload |
//! ```
//!
//! Integers are big-endian. A response with status `BAD` carries no payload.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use shot_guard::ClusterTokenResult;
use shot_guard::ParamValue;
use shot_guard::TokenStatus;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;

use crate::ProtocolError;

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

const REQUEST_HEADER: usize = 5;
const RESPONSE_HEADER: usize = 6;

const TAG_STR: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_BOOL: u8 = 2;

/// Wraps a connection in the length-prefixed framing both sides use.
pub fn framed<T>(io: T) -> Framed<T, LengthDelimitedCodec>
where
    T: AsyncRead + AsyncWrite,
{
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_framed(io)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    Flow = 1,
    BatchFlow = 2,
    ParamFlow = 3,
    ConcurrentAcquire = 4,
    ConcurrentRelease = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ping,
            1 => Self::Flow,
            2 => Self::BatchFlow,
            3 => Self::ParamFlow,
            4 => Self::ConcurrentAcquire,
            5 => Self::ConcurrentRelease,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// Whether the server could decode the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Ok,
    Bad,
}

impl FrameStatus {
    pub fn code(self) -> i8 {
        match self {
            Self::Ok => 0,
            Self::Bad => -1,
        }
    }

    pub fn from_code(code: i8) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Self::Ok),
            -1 => Ok(Self::Bad),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Ping,
    Flow {
        flow_id: i64,
        count: u32,
        prioritized: bool,
    },
    /// One flow check per id, all with the same count.
    BatchFlow {
        flow_ids: Vec<i64>,
        count: u32,
    },
    ParamFlow {
        flow_id: i64,
        count: u32,
        params: Vec<ParamValue>,
    },
    ConcurrentAcquire {
        flow_id: i64,
        count: u32,
        prioritized: bool,
    },
    ConcurrentRelease {
        token_id: u64,
    },
}

impl RequestBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Ping => MessageType::Ping,
            Self::Flow { .. } => MessageType::Flow,
            Self::BatchFlow { .. } => MessageType::BatchFlow,
            Self::ParamFlow { .. } => MessageType::ParamFlow,
            Self::ConcurrentAcquire { .. } => MessageType::ConcurrentAcquire,
            Self::ConcurrentRelease { .. } => MessageType::ConcurrentRelease,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: i32,
    pub body: RequestBody,
}

impl Request {
    pub fn new(id: i32, body: RequestBody) -> Self {
        Self { id, body }
    }

    /// Reads the id and raw type of a frame without decoding its payload.
    pub fn peek_header(frame: &[u8]) -> Option<(i32, u8)> {
        let mut header = frame.get(..REQUEST_HEADER)?;
        Some((header.get_i32(), header.get_u8()))
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.put_i32(self.id);
        dst.put_u8(self.body.message_type() as u8);
        match &self.body {
            RequestBody::Ping => {}
            RequestBody::Flow {
                flow_id,
                count,
                prioritized,
            }
            | RequestBody::ConcurrentAcquire {
                flow_id,
                count,
                prioritized,
            } => {
                dst.put_i64(*flow_id);
                dst.put_u32(*count);
                dst.put_u8(u8::from(*prioritized));
            }
            RequestBody::BatchFlow { flow_ids, count } => {
                dst.put_u32(*count);
                put_len(dst, flow_ids.len(), "batch")?;
                for flow_id in flow_ids {
                    dst.put_i64(*flow_id);
                }
            }
            RequestBody::ParamFlow {
                flow_id,
                count,
                params,
            } => {
                dst.put_i64(*flow_id);
                dst.put_u32(*count);
                put_len(dst, params.len(), "parameter list")?;
                for param in params {
                    put_param(dst, param)?;
                }
            }
            RequestBody::ConcurrentRelease { token_id } => dst.put_u64(*token_id),
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(32);
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, ProtocolError> {
        let len = frame.len();
        if len < REQUEST_HEADER {
            return Err(ProtocolError::Truncated(len));
        }
        let id = frame.get_i32();
        let kind = MessageType::try_from(frame.get_u8())?;
        let buf = &mut frame;
        let body = match kind {
            MessageType::Ping => RequestBody::Ping,
            MessageType::Flow => RequestBody::Flow {
                flow_id: get_i64(buf, len)?,
                count: get_u32(buf, len)?,
                prioritized: get_u8(buf, len)? != 0,
            },
            MessageType::ConcurrentAcquire => RequestBody::ConcurrentAcquire {
                flow_id: get_i64(buf, len)?,
                count: get_u32(buf, len)?,
                prioritized: get_u8(buf, len)? != 0,
            },
            MessageType::BatchFlow => {
                let count = get_u32(buf, len)?;
                let n = get_u16(buf, len)?;
                let flow_ids = (0..n)
                    .map(|_| get_i64(buf, len))
                    .collect::<Result<_, _>>()?;
                RequestBody::BatchFlow { flow_ids, count }
            }
            MessageType::ParamFlow => {
                let flow_id = get_i64(buf, len)?;
                let count = get_u32(buf, len)?;
                let n = get_u16(buf, len)?;
                let params = (0..n)
                    .map(|_| get_param(buf, len))
                    .collect::<Result<_, _>>()?;
                RequestBody::ParamFlow {
                    flow_id,
                    count,
                    params,
                }
            }
            MessageType::ConcurrentRelease => RequestBody::ConcurrentRelease {
                token_id: get_u64(buf, len)?,
            },
        };
        ensure_consumed(&frame)?;
        Ok(Self { id, body })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Token(ClusterTokenResult),
    Batch(Vec<(i64, ClusterTokenResult)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: i32,
    /// Raw message type, echoed from the request even when unknown.
    pub kind: u8,
    pub status: FrameStatus,
    pub body: ResponseBody,
}

impl Response {
    pub fn ok(id: i32, kind: MessageType, body: ResponseBody) -> Self {
        Self {
            id,
            kind: kind as u8,
            status: FrameStatus::Ok,
            body,
        }
    }

    pub fn bad(id: i32, kind: u8) -> Self {
        Self {
            id,
            kind,
            status: FrameStatus::Bad,
            body: ResponseBody::Empty,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.put_i32(self.id);
        dst.put_u8(self.kind);
        dst.put_i8(self.status.code());
        if self.status == FrameStatus::Bad {
            return Ok(());
        }
        let with_token_id = self.kind == MessageType::ConcurrentAcquire as u8;
        match &self.body {
            ResponseBody::Empty => {}
            ResponseBody::Token(result) => put_token(dst, result, with_token_id),
            ResponseBody::Batch(results) => {
                put_len(dst, results.len(), "batch")?;
                for (flow_id, result) in results {
                    dst.put_i64(*flow_id);
                    put_token(dst, result, false);
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(32);
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, ProtocolError> {
        let len = frame.len();
        if len < RESPONSE_HEADER {
            return Err(ProtocolError::Truncated(len));
        }
        let id = frame.get_i32();
        let kind = frame.get_u8();
        let status = FrameStatus::from_code(frame.get_i8())?;
        if status == FrameStatus::Bad {
            return Ok(Self::bad(id, kind));
        }
        let buf = &mut frame;
        let body = match MessageType::try_from(kind)? {
            MessageType::Ping => ResponseBody::Empty,
            MessageType::Flow | MessageType::ParamFlow | MessageType::ConcurrentRelease => {
                ResponseBody::Token(get_token(buf, len, false)?)
            }
            MessageType::ConcurrentAcquire => ResponseBody::Token(get_token(buf, len, true)?),
            MessageType::BatchFlow => {
                let n = get_u16(buf, len)?;
                let results = (0..n)
                    .map(|_| -> Result<_, ProtocolError> {
                        Ok((get_i64(buf, len)?, get_token(buf, len, false)?))
                    })
                    .collect::<Result<_, _>>()?;
                ResponseBody::Batch(results)
            }
        };
        ensure_consumed(&frame)?;
        Ok(Self {
            id,
            kind,
            status,
            body,
        })
    }
}

fn put_len(dst: &mut BytesMut, len: usize, what: &'static str) -> Result<(), ProtocolError> {
    let len = u16::try_from(len).map_err(|_| ProtocolError::TooLong(what))?;
    dst.put_u16(len);
    Ok(())
}

fn put_param(dst: &mut BytesMut, param: &ParamValue) -> Result<(), ProtocolError> {
    match param {
        ParamValue::Str(s) => {
            dst.put_u8(TAG_STR);
            put_len(dst, s.len(), "parameter")?;
            dst.put_slice(s.as_bytes());
        }
        ParamValue::Int(i) => {
            dst.put_u8(TAG_INT);
            dst.put_i64(*i);
        }
        ParamValue::Bool(b) => {
            dst.put_u8(TAG_BOOL);
            dst.put_u8(u8::from(*b));
        }
    }
    Ok(())
}

fn put_token(dst: &mut BytesMut, result: &ClusterTokenResult, with_token_id: bool) {
    dst.put_i8(result.status.code());
    dst.put_i32(result.remaining);
    dst.put_u32(u32::try_from(result.wait_ms).unwrap_or(u32::MAX));
    if with_token_id {
        dst.put_u64(result.token_id);
    }
}

fn get_u8(buf: &mut Bytes, len: usize) -> Result<u8, ProtocolError> {
    buf.try_get_u8().map_err(|_| ProtocolError::Truncated(len))
}

fn get_i8(buf: &mut Bytes, len: usize) -> Result<i8, ProtocolError> {
    buf.try_get_i8().map_err(|_| ProtocolError::Truncated(len))
}

fn get_u16(buf: &mut Bytes, len: usize) -> Result<u16, ProtocolError> {
    buf.try_get_u16().map_err(|_| ProtocolError::Truncated(len))
}

fn get_i32(buf: &mut Bytes, len: usize) -> Result<i32, ProtocolError> {
    buf.try_get_i32().map_err(|_| ProtocolError::Truncated(len))
}

fn get_u32(buf: &mut Bytes, len: usize) -> Result<u32, ProtocolError> {
    buf.try_get_u32().map_err(|_| ProtocolError::Truncated(len))
}

fn get_i64(buf: &mut Bytes, len: usize) -> Result<i64, ProtocolError> {
    buf.try_get_i64().map_err(|_| ProtocolError::Truncated(len))
}

fn get_u64(buf: &mut Bytes, len: usize) -> Result<u64, ProtocolError> {
    buf.try_get_u64().map_err(|_| ProtocolError::Truncated(len))
}

fn get_param(buf: &mut Bytes, len: usize) -> Result<ParamValue, ProtocolError> {
    match get_u8(buf, len)? {
        TAG_STR => {
            let n = usize::from(get_u16(buf, len)?);
            if buf.remaining() < n {
                return Err(ProtocolError::Truncated(len));
            }
            let raw = buf.split_to(n);
            let s = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8)?;
            Ok(ParamValue::Str(s.to_string()))
        }
        TAG_INT => Ok(ParamValue::Int(get_i64(buf, len)?)),
        TAG_BOOL => Ok(ParamValue::Bool(get_u8(buf, len)? != 0)),
        other => Err(ProtocolError::UnknownParamTag(other)),
    }
}

fn get_token(
    buf: &mut Bytes,
    len: usize,
    with_token_id: bool,
) -> Result<ClusterTokenResult, ProtocolError> {
    let code = get_i8(buf, len)?;
    let status = TokenStatus::from_code(code).ok_or(ProtocolError::UnknownTokenStatus(code))?;
    let remaining = get_i32(buf, len)?;
    let wait_ms = u64::from(get_u32(buf, len)?);
    let mut result = ClusterTokenResult::new(status)
        .with_remaining(remaining)
        .with_wait_ms(wait_ms);
    if with_token_id {
        result = result.with_token_id(get_u64(buf, len)?);
    }
    Ok(result)
}

fn ensure_consumed(frame: &Bytes) -> Result<(), ProtocolError> {
    match frame.remaining() {
        0 => Ok(()),
        n => Err(ProtocolError::TrailingBytes(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_lays_out_a_flow_request() {
        let request = Request::new(
            42,
            RequestBody::Flow {
                flow_id: 7,
                count: 2,
                prioritized: true,
            },
        );
        let bytes = request.to_bytes().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0, 0, 0, 42, 1, 0, 0, 0, 0, 0, 0, 0, 7, 0, 0, 0, 2, 1]
        );
        assert_eq!(Request::peek_header(&bytes), Some((42, 1)));
        assert_eq!(Request::decode(bytes).unwrap(), request);
    }

    #[test]
    fn it_carries_typed_parameters() {
        let request = Request::new(
            3,
            RequestBody::ParamFlow {
                flow_id: 9,
                count: 1,
                params: vec![
                    ParamValue::from("alice"),
                    ParamValue::Int(-5),
                    ParamValue::Bool(true),
                ],
            },
        );
        let decoded = Request::decode(request.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn it_rejects_malformed_requests() {
        assert_eq!(
            Request::decode(Bytes::from_static(&[0, 0, 1])),
            Err(ProtocolError::Truncated(3))
        );
        assert_eq!(
            Request::decode(Bytes::from_static(&[0, 0, 0, 1, 9])),
            Err(ProtocolError::UnknownType(9))
        );
        // Flow request cut short after the flow id.
        assert_eq!(
            Request::decode(Bytes::from_static(&[0, 0, 0, 1, 1, 0, 0, 0, 0, 0, 0, 0, 7])),
            Err(ProtocolError::Truncated(13))
        );
        assert_eq!(
            Request::decode(Bytes::from_static(&[0, 0, 0, 1, 0, 0xff])),
            Err(ProtocolError::TrailingBytes(1))
        );
        assert_eq!(Request::peek_header(&[0, 0, 0, 1, 9, 1, 2]), Some((1, 9)));
    }

    #[test]
    fn it_only_sends_token_ids_for_concurrency_grants() {
        let result = ClusterTokenResult::new(TokenStatus::Ok)
            .with_remaining(3)
            .with_token_id(11);
        let acquire = Response::ok(1, MessageType::ConcurrentAcquire, ResponseBody::Token(result));
        let flow = Response::ok(1, MessageType::Flow, ResponseBody::Token(result));

        let acquire_bytes = acquire.to_bytes().unwrap();
        let flow_bytes = flow.to_bytes().unwrap();
        assert_eq!(acquire_bytes.len(), flow_bytes.len() + 8);

        assert_eq!(Response::decode(acquire_bytes).unwrap(), acquire);
        let ResponseBody::Token(decoded) = Response::decode(flow_bytes).unwrap().body else {
            panic!("expected a token body");
        };
        assert_eq!(decoded.token_id, 0);
        assert_eq!(decoded.remaining, 3);
    }

    #[test]
    fn it_sends_bad_responses_without_payload() {
        let bad = Response::bad(5, 77);
        let bytes = bad.to_bytes().unwrap();
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 5, 77, 0xff]);
        assert_eq!(Response::decode(bytes).unwrap(), bad);
    }

    #[test]
    fn it_answers_batches_per_flow() {
        let response = Response::ok(
            8,
            MessageType::BatchFlow,
            ResponseBody::Batch(vec![
                (1, ClusterTokenResult::new(TokenStatus::Ok).with_remaining(4)),
                (2, ClusterTokenResult::new(TokenStatus::NoRuleExists)),
            ]),
        );
        assert_eq!(
            Response::decode(response.to_bytes().unwrap()).unwrap(),
            response
        );
    }
}
