/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file wire_protocol.rs
 * @brief MongoDB wire protocol framing: OP_MSG, OP_QUERY and OP_REPLY
 */

use crate::error::{FauxGateError, Result};
use bson::{Bson, Document};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const OP_REPLY: i32 = 1;
pub const OP_QUERY: i32 = 2004;
pub const OP_MSG: i32 = 2013;

pub const HEADER_LEN: usize = 16;

/// Advertised as `maxMessageSizeBytes`; larger frames are rejected.
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;
pub const MAX_BSON_OBJECT_SIZE: i32 = 16 * 1024 * 1024;

pub const MSG_FLAG_CHECKSUM_PRESENT: u32 = 1;
pub const MSG_FLAG_MORE_TO_COME: u32 = 1 << 1;
pub const MSG_FLAG_EXHAUST_ALLOWED: u32 = 1 << 16;

const MSG_REQUIRED_BITS: u32 = 0xffff;
const MSG_KNOWN_BITS: u32 = MSG_FLAG_CHECKSUM_PRESENT | MSG_FLAG_MORE_TO_COME;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buffer: &[u8; HEADER_LEN]) -> Self {
        let mut buf = &buffer[..];
        Self {
            message_length: buf.get_i32_le(),
            request_id: buf.get_i32_le(),
            response_to: buf.get_i32_le(),
            op_code: buf.get_i32_le(),
        }
    }

    fn write(&self, buffer: &mut BytesMut) {
        buffer.put_i32_le(self.message_length);
        buffer.put_i32_le(self.request_id);
        buffer.put_i32_le(self.response_to);
        buffer.put_i32_le(self.op_code);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Msg {
        header: MessageHeader,
        flags: u32,
        /// Section 0 body with every kind-1 sequence folded in as an array.
        document: Document,
    },
    Query {
        header: MessageHeader,
        flags: i32,
        full_collection_name: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: Document,
    },
    Reply {
        header: MessageHeader,
        flags: i32,
        cursor_id: i64,
        starting_from: i32,
        documents: Vec<Document>,
    },
}

impl WireMessage {
    pub fn header(&self) -> &MessageHeader {
        match self {
            WireMessage::Msg { header, .. }
            | WireMessage::Query { header, .. }
            | WireMessage::Reply { header, .. } => header,
        }
    }

    pub fn more_to_come(&self) -> bool {
        matches!(self, WireMessage::Msg { flags, .. } if flags & MSG_FLAG_MORE_TO_COME != 0)
    }
}

/// Reads one framed message. `Ok(None)` means the peer closed the stream
/// cleanly between messages.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<WireMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = MessageHeader::parse(&header_buf);
    let length = usize::try_from(header.message_length).unwrap_or(0);
    if length < HEADER_LEN {
        return Err(FauxGateError::WireProtocol(format!(
            "message length {} is shorter than the header",
            header.message_length
        )));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(FauxGateError::WireProtocol(format!(
            "message length {} exceeds maximum {}",
            length, MAX_MESSAGE_SIZE
        )));
    }

    let mut body = vec![0u8; length - HEADER_LEN];
    reader.read_exact(&mut body).await?;

    decode_body(header, &body).map(Some)
}

pub fn decode_body(header: MessageHeader, body: &[u8]) -> Result<WireMessage> {
    match header.op_code {
        OP_MSG => decode_op_msg(header, body),
        OP_QUERY => decode_op_query(header, body),
        OP_REPLY => decode_op_reply(header, body),
        other => Err(FauxGateError::WireProtocol(format!(
            "unsupported opcode {}",
            other
        ))),
    }
}

fn decode_op_msg(header: MessageHeader, body: &[u8]) -> Result<WireMessage> {
    let mut buf = body;
    if buf.remaining() < 4 {
        return Err(FauxGateError::WireProtocol("OP_MSG without flags".to_string()));
    }
    let flags = buf.get_u32_le();

    let unknown_required = flags & MSG_REQUIRED_BITS & !MSG_KNOWN_BITS;
    if unknown_required != 0 {
        return Err(FauxGateError::WireProtocol(format!(
            "OP_MSG has unsupported required flag bits {:#x}",
            unknown_required
        )));
    }

    if flags & MSG_FLAG_CHECKSUM_PRESENT != 0 {
        if buf.len() < 4 {
            return Err(FauxGateError::WireProtocol(
                "OP_MSG checksum flag set without checksum".to_string(),
            ));
        }
        buf = &buf[..buf.len() - 4];
    }

    let mut document: Option<Document> = None;
    let mut sequences: Vec<(String, Vec<Document>)> = Vec::new();

    while buf.has_remaining() {
        let kind = buf.get_u8();
        match kind {
            0 => {
                if document.is_some() {
                    return Err(FauxGateError::WireProtocol(
                        "OP_MSG has more than one body section".to_string(),
                    ));
                }
                document = Some(read_document(&mut buf)?);
            }
            1 => {
                let size = read_i32(&mut buf)?;
                let size = usize::try_from(size)
                    .ok()
                    .filter(|s| *s >= 4 && *s - 4 <= buf.len())
                    .ok_or_else(|| {
                        FauxGateError::WireProtocol(format!(
                            "invalid document sequence size {}",
                            size
                        ))
                    })?;
                let (mut section, rest) = buf.split_at(size - 4);
                buf = rest;

                let identifier = read_cstring(&mut section)?;
                let mut documents = Vec::new();
                while section.has_remaining() {
                    documents.push(read_document(&mut section)?);
                }
                sequences.push((identifier, documents));
            }
            other => {
                return Err(FauxGateError::WireProtocol(format!(
                    "unknown OP_MSG section kind {}",
                    other
                )))
            }
        }
    }

    let mut document = document.ok_or_else(|| {
        FauxGateError::WireProtocol("OP_MSG has no body section".to_string())
    })?;

    for (identifier, documents) in sequences {
        if document.contains_key(&identifier) {
            return Err(FauxGateError::WireProtocol(format!(
                "duplicate field '{}' in OP_MSG body and document sequence",
                identifier
            )));
        }
        document.insert(
            identifier,
            Bson::Array(documents.into_iter().map(Bson::Document).collect()),
        );
    }

    Ok(WireMessage::Msg {
        header,
        flags,
        document,
    })
}

fn decode_op_query(header: MessageHeader, body: &[u8]) -> Result<WireMessage> {
    let mut buf = body;
    let flags = read_i32(&mut buf)?;
    let full_collection_name = read_cstring(&mut buf)?;
    let number_to_skip = read_i32(&mut buf)?;
    let number_to_return = read_i32(&mut buf)?;
    let query = read_document(&mut buf)?;
    // An optional returnFieldsSelector may follow; commands never use it.

    Ok(WireMessage::Query {
        header,
        flags,
        full_collection_name,
        number_to_skip,
        number_to_return,
        query,
    })
}

fn decode_op_reply(header: MessageHeader, body: &[u8]) -> Result<WireMessage> {
    let mut buf = body;
    let flags = read_i32(&mut buf)?;
    if buf.remaining() < 8 {
        return Err(FauxGateError::WireProtocol("truncated OP_REPLY".to_string()));
    }
    let cursor_id = buf.get_i64_le();
    let starting_from = read_i32(&mut buf)?;
    let number_returned = read_i32(&mut buf)?;

    let mut documents = Vec::with_capacity(usize::try_from(number_returned).unwrap_or(0));
    while buf.has_remaining() {
        documents.push(read_document(&mut buf)?);
    }

    Ok(WireMessage::Reply {
        header,
        flags,
        cursor_id,
        starting_from,
        documents,
    })
}

fn read_i32(buf: &mut &[u8]) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(FauxGateError::WireProtocol("truncated message".to_string()));
    }
    Ok(buf.get_i32_le())
}

fn read_cstring(buf: &mut &[u8]) -> Result<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| FauxGateError::WireProtocol("unterminated cstring".to_string()))?;
    let value = std::str::from_utf8(&buf[..end])
        .map_err(|e| FauxGateError::WireProtocol(format!("invalid cstring: {}", e)))?
        .to_string();
    buf.advance(end + 1);
    Ok(value)
}

fn read_document(buf: &mut &[u8]) -> Result<Document> {
    if buf.remaining() < 4 {
        return Err(FauxGateError::WireProtocol("truncated document".to_string()));
    }
    let length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let length = usize::try_from(length)
        .ok()
        .filter(|l| *l >= 5 && *l <= buf.len())
        .ok_or_else(|| {
            FauxGateError::WireProtocol(format!("invalid document length {}", length))
        })?;

    let document = bson::from_slice::<Document>(&buf[..length])
        .map_err(|e| FauxGateError::WireProtocol(format!("invalid BSON document: {}", e)))?;
    buf.advance(length);
    Ok(document)
}

fn finish(op_code: i32, request_id: i32, response_to: i32, payload: BytesMut) -> Result<Vec<u8>> {
    let message_length = HEADER_LEN + payload.len();
    if message_length > MAX_MESSAGE_SIZE {
        return Err(FauxGateError::WireProtocol(format!(
            "reply of {} bytes exceeds maximum {}",
            message_length, MAX_MESSAGE_SIZE
        )));
    }

    let mut buffer = BytesMut::with_capacity(message_length);
    MessageHeader {
        message_length: message_length as i32,
        request_id,
        response_to,
        op_code,
    }
    .write(&mut buffer);
    buffer.extend_from_slice(&payload);
    Ok(buffer.to_vec())
}

pub fn encode_op_msg(
    request_id: i32,
    response_to: i32,
    flags: u32,
    document: &Document,
) -> Result<Vec<u8>> {
    let bytes = bson::to_vec(document)?;
    let mut payload = BytesMut::with_capacity(5 + bytes.len());
    payload.put_u32_le(flags & !MSG_FLAG_CHECKSUM_PRESENT);
    payload.put_u8(0);
    payload.extend_from_slice(&bytes);
    finish(OP_MSG, request_id, response_to, payload)
}

pub fn encode_op_reply(request_id: i32, response_to: i32, document: &Document) -> Result<Vec<u8>> {
    let bytes = bson::to_vec(document)?;
    let mut payload = BytesMut::with_capacity(20 + bytes.len());
    payload.put_i32_le(0);
    payload.put_i64_le(0);
    payload.put_i32_le(0);
    payload.put_i32_le(1);
    payload.extend_from_slice(&bytes);
    finish(OP_REPLY, request_id, response_to, payload)
}

pub fn encode_op_query(
    request_id: i32,
    full_collection_name: &str,
    query: &Document,
) -> Result<Vec<u8>> {
    let bytes = bson::to_vec(query)?;
    let mut payload = BytesMut::with_capacity(13 + full_collection_name.len() + bytes.len());
    payload.put_i32_le(0);
    payload.extend_from_slice(full_collection_name.as_bytes());
    payload.put_u8(0);
    payload.put_i32_le(0);
    payload.put_i32_le(-1);
    payload.extend_from_slice(&bytes);
    finish(OP_QUERY, request_id, 0, payload)
}
