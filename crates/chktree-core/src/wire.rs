//! Client/daemon wire messages
//!
//! Every frame starts with a 4-byte header `{size: u16, type: u16}` in
//! network byte order; `size` counts the header itself.

use bytes::{Buf, BufMut};

use crate::types::{ContentBlock, Hash, CONTENT_SIZE, HASH_SIZE};

/// Size of the frame header
pub const HEADER_SIZE: usize = 4;

pub const CS_PROTO_RETURN_VALUE: u16 = 0;
pub const CS_PROTO_QUERY: u16 = 8;
pub const CS_PROTO_RESULT_CHK: u16 = 9;
pub const CS_PROTO_INSERT_CHK: u16 = 10;
pub const CS_PROTO_INDEX_BLOCK: u16 = 11;
pub const CS_PROTO_DELETE_CHK: u16 = 12;
pub const CS_PROTO_UNINDEX_BLOCK: u16 = 13;
pub const CS_PROTO_GET_AVG_PRIORITY: u16 = 15;
pub const CS_PROTO_INDEX_SUPER: u16 = 17;
pub const CS_PROTO_UNINDEX_SUPER: u16 = 18;

/// Index entry refers to a plain CHK block
pub const LOOKUP_TYPE_CHK: u16 = 1;
/// Index entry refers to a leaf encoded on demand from an indexed file
pub const LOOKUP_TYPE_CHKS: u16 = 2;
/// Index entry refers to a super hash
pub const LOOKUP_TYPE_SUPER: u16 = 4;

const QUERY_FIXED_SIZE: usize = HEADER_SIZE + 4 + 4;
const CONTENT_INDEX_SIZE: usize = HASH_SIZE + 4 + 2 + 2 + 8;

/// Wire format error
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("Size field {declared} does not match frame length {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("Unexpected size {size} for message type {msg_type}")]
    BadSize { msg_type: u16, size: usize },
    #[error("Unknown message type {0}")]
    UnknownType(u16),
    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
}

/// A block query; one hash is a plain query, more is a super-query whose
/// first hash is the batch hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMessage {
    pub priority: u32,
    /// Time-to-live in milliseconds
    pub ttl: i32,
    pub queries: Vec<Hash>,
}

impl QueryMessage {
    /// New query with the initial priority and ttl of 1
    pub fn new(queries: Vec<Hash>) -> Self {
        Self {
            priority: 1,
            ttl: 1,
            queries,
        }
    }

    pub fn single(query: Hash) -> Self {
        Self::new(vec![query])
    }

    /// Encoded frame size
    pub fn wire_size(&self) -> usize {
        QUERY_FIXED_SIZE + self.queries.len() * HASH_SIZE
    }

    pub fn contains(&self, query: &Hash) -> bool {
        self.queries.iter().any(|q| q == query)
    }
}

/// Request to index a block of a locally shared file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentIndex {
    pub hash: Hash,
    pub priority: u32,
    pub lookup_type: u16,
    pub file_index: u16,
    pub offset: u64,
}

/// Messages from the client to the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Query(QueryMessage),
    InsertChk { priority: u32, block: Box<ContentBlock> },
    DeleteChk { priority: u32, block: Box<ContentBlock> },
    IndexBlock(ContentIndex),
    UnindexBlock(ContentIndex),
    IndexSuper { priority: u32, super_hash: Hash },
    UnindexSuper { priority: u32, super_hash: Hash },
    GetAveragePriority,
}

impl ClientMessage {
    pub fn msg_type(&self) -> u16 {
        match self {
            ClientMessage::Query(_) => CS_PROTO_QUERY,
            ClientMessage::InsertChk { .. } => CS_PROTO_INSERT_CHK,
            ClientMessage::DeleteChk { .. } => CS_PROTO_DELETE_CHK,
            ClientMessage::IndexBlock(_) => CS_PROTO_INDEX_BLOCK,
            ClientMessage::UnindexBlock(_) => CS_PROTO_UNINDEX_BLOCK,
            ClientMessage::IndexSuper { .. } => CS_PROTO_INDEX_SUPER,
            ClientMessage::UnindexSuper { .. } => CS_PROTO_UNINDEX_SUPER,
            ClientMessage::GetAveragePriority => CS_PROTO_GET_AVG_PRIORITY,
        }
    }
}

/// Messages from the daemon to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMessage {
    ReturnValue(i32),
    ResultChk(Box<ContentBlock>),
}

fn put_header(buf: &mut Vec<u8>, size: usize, msg_type: u16) {
    buf.put_u16(size as u16);
    buf.put_u16(msg_type);
}

fn put_content_index(buf: &mut Vec<u8>, index: &ContentIndex) {
    buf.put_slice(&index.hash);
    buf.put_u32(index.priority);
    buf.put_u16(index.lookup_type);
    buf.put_u16(index.file_index);
    buf.put_u64(index.offset);
}

fn get_hash(buf: &mut &[u8]) -> Hash {
    let mut hash = [0u8; HASH_SIZE];
    buf.copy_to_slice(&mut hash);
    hash
}

fn get_block(buf: &mut &[u8]) -> Box<ContentBlock> {
    let mut block = Box::new([0u8; CONTENT_SIZE]);
    buf.copy_to_slice(&mut block[..]);
    block
}

fn get_content_index(buf: &mut &[u8]) -> ContentIndex {
    let hash = get_hash(buf);
    ContentIndex {
        hash,
        priority: buf.get_u32(),
        lookup_type: buf.get_u16(),
        file_index: buf.get_u16(),
        offset: buf.get_u64(),
    }
}

/// Encode a client message into one frame
pub fn encode_client_message(msg: &ClientMessage) -> Result<Vec<u8>, WireError> {
    let size = match msg {
        ClientMessage::Query(q) => q.wire_size(),
        ClientMessage::InsertChk { .. } | ClientMessage::DeleteChk { .. } => {
            HEADER_SIZE + 4 + CONTENT_SIZE
        }
        ClientMessage::IndexBlock(_) | ClientMessage::UnindexBlock(_) => {
            HEADER_SIZE + CONTENT_INDEX_SIZE
        }
        ClientMessage::IndexSuper { .. } | ClientMessage::UnindexSuper { .. } => {
            HEADER_SIZE + 4 + HASH_SIZE
        }
        ClientMessage::GetAveragePriority => HEADER_SIZE,
    };
    if size > u16::MAX as usize {
        return Err(WireError::TooLarge(size));
    }

    let mut buf = Vec::with_capacity(size);
    put_header(&mut buf, size, msg.msg_type());
    match msg {
        ClientMessage::Query(q) => {
            buf.put_u32(q.priority);
            buf.put_i32(q.ttl);
            for query in &q.queries {
                buf.put_slice(query);
            }
        }
        ClientMessage::InsertChk { priority, block }
        | ClientMessage::DeleteChk { priority, block } => {
            buf.put_u32(*priority);
            buf.put_slice(&block[..]);
        }
        ClientMessage::IndexBlock(index) | ClientMessage::UnindexBlock(index) => {
            put_content_index(&mut buf, index);
        }
        ClientMessage::IndexSuper {
            priority,
            super_hash,
        }
        | ClientMessage::UnindexSuper {
            priority,
            super_hash,
        } => {
            buf.put_u32(*priority);
            buf.put_slice(super_hash);
        }
        ClientMessage::GetAveragePriority => {}
    }
    Ok(buf)
}

/// Parse the header, returning `(size, type)`
pub fn parse_header(header: &[u8]) -> Result<(usize, u16), WireError> {
    if header.len() < HEADER_SIZE {
        return Err(WireError::Truncated {
            needed: HEADER_SIZE,
            available: header.len(),
        });
    }
    let mut buf = header;
    let size = buf.get_u16() as usize;
    let msg_type = buf.get_u16();
    if size < HEADER_SIZE {
        return Err(WireError::BadSize { msg_type, size });
    }
    Ok((size, msg_type))
}

fn check_frame(frame: &[u8]) -> Result<(u16, &[u8]), WireError> {
    let (size, msg_type) = parse_header(frame)?;
    if size != frame.len() {
        return Err(WireError::SizeMismatch {
            declared: size,
            actual: frame.len(),
        });
    }
    Ok((msg_type, &frame[HEADER_SIZE..]))
}

fn expect_size(msg_type: u16, frame_len: usize, expected: usize) -> Result<(), WireError> {
    if frame_len != expected {
        return Err(WireError::BadSize {
            msg_type,
            size: frame_len,
        });
    }
    Ok(())
}

/// Decode one client frame (used by daemon-side code and tests)
pub fn decode_client_message(frame: &[u8]) -> Result<ClientMessage, WireError> {
    let (msg_type, mut body) = check_frame(frame)?;
    let len = frame.len();

    match msg_type {
        CS_PROTO_QUERY => {
            if len < QUERY_FIXED_SIZE + HASH_SIZE || (len - QUERY_FIXED_SIZE) % HASH_SIZE != 0 {
                return Err(WireError::BadSize { msg_type, size: len });
            }
            let priority = body.get_u32();
            let ttl = body.get_i32();
            let mut queries = Vec::with_capacity(body.len() / HASH_SIZE);
            while body.has_remaining() {
                queries.push(get_hash(&mut body));
            }
            Ok(ClientMessage::Query(QueryMessage {
                priority,
                ttl,
                queries,
            }))
        }
        CS_PROTO_INSERT_CHK | CS_PROTO_DELETE_CHK => {
            expect_size(msg_type, len, HEADER_SIZE + 4 + CONTENT_SIZE)?;
            let priority = body.get_u32();
            let block = get_block(&mut body);
            if msg_type == CS_PROTO_INSERT_CHK {
                Ok(ClientMessage::InsertChk { priority, block })
            } else {
                Ok(ClientMessage::DeleteChk { priority, block })
            }
        }
        CS_PROTO_INDEX_BLOCK | CS_PROTO_UNINDEX_BLOCK => {
            expect_size(msg_type, len, HEADER_SIZE + CONTENT_INDEX_SIZE)?;
            let index = get_content_index(&mut body);
            if msg_type == CS_PROTO_INDEX_BLOCK {
                Ok(ClientMessage::IndexBlock(index))
            } else {
                Ok(ClientMessage::UnindexBlock(index))
            }
        }
        CS_PROTO_INDEX_SUPER | CS_PROTO_UNINDEX_SUPER => {
            expect_size(msg_type, len, HEADER_SIZE + 4 + HASH_SIZE)?;
            let priority = body.get_u32();
            let super_hash = get_hash(&mut body);
            if msg_type == CS_PROTO_INDEX_SUPER {
                Ok(ClientMessage::IndexSuper {
                    priority,
                    super_hash,
                })
            } else {
                Ok(ClientMessage::UnindexSuper {
                    priority,
                    super_hash,
                })
            }
        }
        CS_PROTO_GET_AVG_PRIORITY => {
            expect_size(msg_type, len, HEADER_SIZE)?;
            Ok(ClientMessage::GetAveragePriority)
        }
        other => Err(WireError::UnknownType(other)),
    }
}

/// Encode a daemon message into one frame
pub fn encode_daemon_message(msg: &DaemonMessage) -> Vec<u8> {
    match msg {
        DaemonMessage::ReturnValue(value) => {
            let mut buf = Vec::with_capacity(HEADER_SIZE + 4);
            put_header(&mut buf, HEADER_SIZE + 4, CS_PROTO_RETURN_VALUE);
            buf.put_i32(*value);
            buf
        }
        DaemonMessage::ResultChk(block) => {
            let mut buf = Vec::with_capacity(HEADER_SIZE + CONTENT_SIZE);
            put_header(&mut buf, HEADER_SIZE + CONTENT_SIZE, CS_PROTO_RESULT_CHK);
            buf.put_slice(&block[..]);
            buf
        }
    }
}

/// Decode one daemon frame
pub fn decode_daemon_message(frame: &[u8]) -> Result<DaemonMessage, WireError> {
    let (msg_type, mut body) = check_frame(frame)?;

    match msg_type {
        CS_PROTO_RETURN_VALUE => {
            expect_size(msg_type, frame.len(), HEADER_SIZE + 4)?;
            Ok(DaemonMessage::ReturnValue(body.get_i32()))
        }
        CS_PROTO_RESULT_CHK => {
            expect_size(msg_type, frame.len(), HEADER_SIZE + CONTENT_SIZE)?;
            Ok(DaemonMessage::ResultChk(get_block(&mut body)))
        }
        other => Err(WireError::UnknownType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_layout() {
        let msg = ClientMessage::Query(QueryMessage {
            priority: 7,
            ttl: -3,
            queries: vec![[1u8; 20], [2u8; 20]],
        });
        let frame = encode_client_message(&msg).unwrap();
        assert_eq!(frame.len(), 4 + 8 + 40);
        assert_eq!(&frame[..4], &[0, 52, 0, CS_PROTO_QUERY as u8]);
        assert_eq!(&frame[4..8], &7u32.to_be_bytes());
        assert_eq!(&frame[8..12], &(-3i32).to_be_bytes());
        assert_eq!(decode_client_message(&frame).unwrap(), msg);
    }

    #[test]
    fn test_query_without_hashes_rejected() {
        let mut frame = Vec::new();
        put_header(&mut frame, 12, CS_PROTO_QUERY);
        frame.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_client_message(&frame),
            Err(WireError::BadSize { .. })
        ));
    }

    #[test]
    fn test_insert_and_index_messages() {
        let insert = ClientMessage::InsertChk {
            priority: 0xFFFF,
            block: Box::new([5u8; CONTENT_SIZE]),
        };
        let frame = encode_client_message(&insert).unwrap();
        assert_eq!(frame.len(), 1032);
        assert_eq!(decode_client_message(&frame).unwrap(), insert);

        let index = ClientMessage::IndexBlock(ContentIndex {
            hash: [3u8; 20],
            priority: 1,
            lookup_type: LOOKUP_TYPE_CHKS,
            file_index: 2,
            offset: 1 << 40,
        });
        let frame = encode_client_message(&index).unwrap();
        assert_eq!(decode_client_message(&frame).unwrap(), index);
    }

    #[test]
    fn test_daemon_messages() {
        let rv = DaemonMessage::ReturnValue(-1);
        assert_eq!(decode_daemon_message(&encode_daemon_message(&rv)).unwrap(), rv);

        let result = DaemonMessage::ResultChk(Box::new([9u8; CONTENT_SIZE]));
        let frame = encode_daemon_message(&result);
        assert_eq!(frame.len(), 1028);
        assert_eq!(decode_daemon_message(&frame).unwrap(), result);
    }

    #[test]
    fn test_size_mismatch_and_unknown_type() {
        let mut frame = encode_daemon_message(&DaemonMessage::ReturnValue(1));
        frame.push(0);
        assert!(matches!(
            decode_daemon_message(&frame),
            Err(WireError::SizeMismatch { .. })
        ));

        let mut frame = Vec::new();
        put_header(&mut frame, 4, 99);
        assert_eq!(decode_daemon_message(&frame), Err(WireError::UnknownType(99)));
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            parse_header(&[0, 4]),
            Err(WireError::Truncated { .. })
        ));
    }
}
