//! Wire format for the SANFT protocol.
//!
//! Five message kinds travel over UDP: MDR (metadata request), NTM (new
//! token), MDRR (metadata response), ACR (aggregated chunk request) and CRR
//! (chunk response). All multi-byte fields are big-endian; file sizes and
//! chunk indices are 48-bit quantities carried in the low six bytes of a
//! 64-bit integer. Version 0 is the only supported version.
//!
//! Server messages whose error code signals a request-level failure consist
//! of a bare four-byte header; parsers must not read past it. The error code
//! alone is ambiguous (FileNotFound and InvalidFileID share a value), so the
//! pair (type, error) is the discriminant everywhere.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Protocol version carried in the first byte of every message.
pub const VERSION: u8 = 0;

// Message type codes.
pub const NTM_T: u8 = 0;
pub const MDR_T: u8 = 1;
pub const MDRR_T: u8 = 2;
pub const ACR_T: u8 = 3;
pub const CRR_T: u8 = 4;

// Error codes. InvalidFileID and FileNotFound deliberately share a value;
// the message type disambiguates them.
pub const NO_ERROR: u8 = 0;
pub const UNSUPPORTED_VERSION: u8 = 1;
pub const INVALID_FILE_ID: u8 = 2;
pub const FILE_NOT_FOUND: u8 = 2;
pub const TOO_MANY_CHUNKS: u8 = 3;
pub const CHUNK_OUT_OF_BOUNDS: u8 = 4;
pub const ZERO_LENGTH_CR: u8 = 5;

pub const TOKEN_LEN: usize = 32;
pub const CHECKSUM_LEN: usize = 32;
pub const CLIENT_HEADER_LEN: usize = 35;
pub const SERVER_HEADER_LEN: usize = 4;
pub const CR_LEN: usize = 7;
pub const MDRR_LEN: usize = 50;
pub const NTM_LEN: usize = 36;

/// Largest value representable in a 48-bit wire field.
pub const MAX_U48: u64 = (1 << 48) - 1;
/// Largest chunk size that still fits a CRR into one UDP payload.
pub const MAX_CHUNK_SIZE: u16 = 65517;
/// Receive buffers must hold a maximum-size datagram.
pub const MAX_DATAGRAM: usize = 65535;

pub type Token = [u8; TOKEN_LEN];
pub type Checksum = [u8; CHECKSUM_LEN];

/// Classification of datagrams the codec refuses to produce a message for.
///
/// The classes drive different reactions: an unsupported version is answered
/// (server) or fatal (client), while the other three are dropped and counted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// The version byte is not [`VERSION`]. The observed type and number are
    /// kept so the server can echo them in its reply header.
    #[error("unsupported protocol version {version}")]
    UnsupportedVersion { version: u8, kind: u8, number: u8 },
    #[error("unsupported message type {0}")]
    UnsupportedType(u8),
    #[error("wrong packet length {len} for message type {kind}")]
    WrongPacketLength { kind: u8, len: usize },
    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// Encode a 48-bit value into its six-byte big-endian wire form.
pub fn u48_to_be_bytes(value: u64) -> [u8; 6] {
    debug_assert!(value <= MAX_U48);
    let be = value.to_be_bytes();
    [be[2], be[3], be[4], be[5], be[6], be[7]]
}

/// Decode a six-byte big-endian wire field into a 48-bit value.
pub fn u48_from_be_bytes(bytes: [u8; 6]) -> u64 {
    let mut be = [0u8; 8];
    be[2..].copy_from_slice(&bytes);
    u64::from_be_bytes(be)
}

/// Metadata request: client header followed by the URI. The URI is not
/// length-prefixed; it consumes the remainder of the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mdr {
    pub number: u8,
    pub token: Token,
    pub uri: String,
}

/// New token message: the server's challenge carrying the token the client
/// must echo in every subsequent request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ntm {
    pub number: u8,
    pub error: u8,
    pub token: Token,
}

/// Metadata response. Only ever encoded with error == NoError; failures are
/// reported as a bare [`ServerHeader`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mdrr {
    pub number: u8,
    pub chunk_size: u16,
    pub max_chunks_in_acr: u16,
    pub file_id: u32,
    /// File size in chunks (48-bit on the wire).
    pub file_size: u64,
    pub checksum: Checksum,
}

/// A single chunk request: `length` contiguous chunks starting at chunk
/// index `offset`. `length == 0` is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cr {
    /// Chunk index (48-bit on the wire).
    pub offset: u64,
    pub length: u8,
}

/// Aggregated chunk request: several CRs batched into one datagram, together
/// with the rate at which the client wants the responses paced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acr {
    pub number: u8,
    pub token: Token,
    pub file_id: u32,
    pub packet_rate: u32,
    pub crs: Vec<Cr>,
}

/// Chunk response. Carries NoError with at least one payload byte, or
/// ChunkOutOfBounds with an empty payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crr {
    pub number: u8,
    pub error: u8,
    /// Chunk index (48-bit on the wire).
    pub chunk_number: u64,
    pub data: Bytes,
}

/// Bare server header, used for request-level error replies and parsed for
/// any server message whose error code forbids reading further fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHeader {
    pub kind: u8,
    pub number: u8,
    pub error: u8,
}

/// Everything a server can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Mdr(Mdr),
    Acr(Acr),
}

/// Everything a client can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Ntm(Ntm),
    Mdrr(Mdrr),
    Crr(Crr),
    HeaderOnly(ServerHeader),
}

impl Mdr {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CLIENT_HEADER_LEN + self.uri.len());
        put_client_header(&mut buf, MDR_T, self.number, &self.token);
        buf.put_slice(self.uri.as_bytes());
        buf.freeze()
    }
}

impl Acr {
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(CLIENT_HEADER_LEN + 8 + self.crs.len() * CR_LEN);
        put_client_header(&mut buf, ACR_T, self.number, &self.token);
        buf.put_u32(self.file_id);
        buf.put_u32(self.packet_rate);
        for cr in &self.crs {
            buf.put_uint(cr.offset, 6);
            buf.put_u8(cr.length);
        }
        buf.freeze()
    }
}

impl Ntm {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NTM_LEN);
        put_server_header(&mut buf, NTM_T, self.number, self.error);
        buf.put_slice(&self.token);
        buf.freeze()
    }
}

impl Mdrr {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MDRR_LEN);
        put_server_header(&mut buf, MDRR_T, self.number, NO_ERROR);
        buf.put_u16(self.chunk_size);
        buf.put_u16(self.max_chunks_in_acr);
        buf.put_u32(self.file_id);
        buf.put_uint(self.file_size, 6);
        buf.put_slice(&self.checksum);
        buf.freeze()
    }
}

impl Crr {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SERVER_HEADER_LEN + 6 + self.data.len());
        put_server_header(&mut buf, CRR_T, self.number, self.error);
        buf.put_uint(self.chunk_number, 6);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

impl ServerHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SERVER_HEADER_LEN);
        put_server_header(&mut buf, self.kind, self.number, self.error);
        buf.freeze()
    }
}

fn put_client_header(buf: &mut BytesMut, kind: u8, number: u8, token: &Token) {
    buf.put_u8(VERSION);
    buf.put_u8(kind);
    buf.put_u8(number);
    buf.put_slice(token);
}

fn put_server_header(buf: &mut BytesMut, kind: u8, number: u8, error: u8) {
    buf.put_u8(VERSION);
    buf.put_u8(kind);
    buf.put_u8(number);
    buf.put_u8(error);
}

/// Checks version and type and returns them, or the matching [`WireError`].
///
/// Datagrams shorter than three bytes cannot even be echoed in an error
/// reply and are classified as the length violation they are.
fn check_prefix(data: &[u8]) -> Result<(u8, u8), WireError> {
    if data.len() < 3 {
        return Err(WireError::WrongPacketLength {
            kind: data.get(1).copied().unwrap_or(0),
            len: data.len(),
        });
    }
    if data[0] != VERSION {
        return Err(WireError::UnsupportedVersion {
            version: data[0],
            kind: data[1],
            number: data[2],
        });
    }
    Ok((data[1], data[2]))
}

fn token_from(data: &[u8]) -> Token {
    let mut token = [0u8; TOKEN_LEN];
    token.copy_from_slice(&data[..TOKEN_LEN]);
    token
}

/// Parse a datagram received by the server.
pub fn parse_client(data: &[u8]) -> Result<ClientMessage, WireError> {
    let (kind, number) = check_prefix(data)?;
    match kind {
        MDR_T => {
            if data.len() < CLIENT_HEADER_LEN + 1 {
                return Err(WireError::WrongPacketLength { kind, len: data.len() });
            }
            let token = token_from(&data[3..]);
            let uri = std::str::from_utf8(&data[CLIENT_HEADER_LEN..])
                .map_err(|_| WireError::Malformed("MDR URI is not valid UTF-8"))?
                .to_owned();
            Ok(ClientMessage::Mdr(Mdr { number, token, uri }))
        }
        ACR_T => {
            let body = data.len().saturating_sub(CLIENT_HEADER_LEN + 8);
            if data.len() < CLIENT_HEADER_LEN + 8 + CR_LEN || body % CR_LEN != 0 {
                return Err(WireError::WrongPacketLength { kind, len: data.len() });
            }
            let token = token_from(&data[3..]);
            let mut buf = &data[CLIENT_HEADER_LEN..];
            let file_id = buf.get_u32();
            let packet_rate = buf.get_u32();
            let mut crs = Vec::with_capacity(body / CR_LEN);
            while buf.has_remaining() {
                let offset = buf.get_uint(6);
                let length = buf.get_u8();
                crs.push(Cr { offset, length });
            }
            Ok(ClientMessage::Acr(Acr { number, token, file_id, packet_rate, crs }))
        }
        other => Err(WireError::UnsupportedType(other)),
    }
}

/// Parse a datagram received by the client.
pub fn parse_server(data: &[u8]) -> Result<ServerMessage, WireError> {
    let (kind, number) = check_prefix(data)?;
    if data.len() < SERVER_HEADER_LEN {
        return Err(WireError::WrongPacketLength { kind, len: data.len() });
    }
    let error = data[3];
    match kind {
        NTM_T => {
            if data.len() < NTM_LEN {
                return Err(WireError::WrongPacketLength { kind, len: data.len() });
            }
            let token = token_from(&data[SERVER_HEADER_LEN..]);
            Ok(ServerMessage::Ntm(Ntm { number, error, token }))
        }
        MDRR_T => {
            if error != NO_ERROR {
                return Ok(ServerMessage::HeaderOnly(ServerHeader { kind, number, error }));
            }
            if data.len() < MDRR_LEN {
                return Err(WireError::WrongPacketLength { kind, len: data.len() });
            }
            let mut buf = &data[SERVER_HEADER_LEN..];
            let chunk_size = buf.get_u16();
            let max_chunks_in_acr = buf.get_u16();
            let file_id = buf.get_u32();
            let file_size = buf.get_uint(6);
            let mut checksum = [0u8; CHECKSUM_LEN];
            buf.copy_to_slice(&mut checksum);
            Ok(ServerMessage::Mdrr(Mdrr {
                number,
                chunk_size,
                max_chunks_in_acr,
                file_id,
                file_size,
                checksum,
            }))
        }
        CRR_T => match error {
            // A data-bearing CRR must carry at least one payload byte; an
            // out-of-bounds CRR may be empty but still names the chunk.
            NO_ERROR | CHUNK_OUT_OF_BOUNDS => {
                let min = if error == NO_ERROR { 11 } else { 10 };
                if data.len() < min {
                    return Err(WireError::WrongPacketLength { kind, len: data.len() });
                }
                let mut buf = &data[SERVER_HEADER_LEN..];
                let chunk_number = buf.get_uint(6);
                let data = Bytes::copy_from_slice(buf.chunk());
                Ok(ServerMessage::Crr(Crr { number, error, chunk_number, data }))
            }
            _ => Ok(ServerMessage::HeaderOnly(ServerHeader { kind, number, error })),
        },
        other => Err(WireError::UnsupportedType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Token {
        let mut t = [0u8; TOKEN_LEN];
        for (i, b) in t.iter_mut().enumerate() {
            *b = i as u8;
        }
        t
    }

    #[test]
    fn test_u48_round_trip() {
        for value in [0u64, 1, 0x1bad_dead_beef, MAX_U48] {
            assert_eq!(u48_from_be_bytes(u48_to_be_bytes(value)), value);
        }
    }

    #[test]
    fn test_u48_is_big_endian() {
        assert_eq!(u48_to_be_bytes(0xcafe_face_1234), [0xca, 0xfe, 0xfa, 0xce, 0x12, 0x34]);
    }

    #[test]
    fn test_mdr_round_trip() {
        let mdr = Mdr { number: 7, token: token(), uri: "dir/file.bin".to_owned() };
        let encoded = mdr.encode();
        assert_eq!(encoded.len(), CLIENT_HEADER_LEN + 12);
        assert_eq!(parse_client(&encoded), Ok(ClientMessage::Mdr(mdr)));
    }

    #[test]
    fn test_acr_round_trip() {
        let acr = Acr {
            number: 250,
            token: token(),
            file_id: 0xcafe_babe,
            packet_rate: 512,
            crs: vec![Cr { offset: 0, length: 2 }, Cr { offset: 9, length: 255 }],
        };
        let encoded = acr.encode();
        assert_eq!(encoded.len(), CLIENT_HEADER_LEN + 8 + 2 * CR_LEN);
        assert_eq!(parse_client(&encoded), Ok(ClientMessage::Acr(acr)));
    }

    #[test]
    fn test_ntm_round_trip() {
        let ntm = Ntm { number: 3, error: NO_ERROR, token: token() };
        let encoded = ntm.encode();
        assert_eq!(encoded.len(), NTM_LEN);
        assert_eq!(parse_server(&encoded), Ok(ServerMessage::Ntm(ntm)));
    }

    #[test]
    fn test_mdrr_round_trip() {
        let mdrr = Mdrr {
            number: 1,
            chunk_size: 4048,
            max_chunks_in_acr: 128,
            file_id: 0x00fa_cade,
            file_size: MAX_U48,
            checksum: [0xab; CHECKSUM_LEN],
        };
        let encoded = mdrr.encode();
        assert_eq!(encoded.len(), MDRR_LEN);
        assert_eq!(parse_server(&encoded), Ok(ServerMessage::Mdrr(mdrr)));
    }

    #[test]
    fn test_crr_round_trip() {
        let crr = Crr {
            number: 9,
            error: NO_ERROR,
            chunk_number: 0x0100_0000_0001,
            data: Bytes::from_static(b"twenty bytes of data"),
        };
        assert_eq!(parse_server(&crr.encode()), Ok(ServerMessage::Crr(crr)));
    }

    #[test]
    fn test_crr_out_of_bounds_may_be_empty() {
        let crr = Crr {
            number: 9,
            error: CHUNK_OUT_OF_BOUNDS,
            chunk_number: 42,
            data: Bytes::new(),
        };
        let encoded = crr.encode();
        assert_eq!(encoded.len(), 10);
        assert_eq!(parse_server(&encoded), Ok(ServerMessage::Crr(crr)));
    }

    #[test]
    fn test_crr_without_payload_is_rejected() {
        let crr = Crr { number: 9, error: NO_ERROR, chunk_number: 42, data: Bytes::new() };
        assert_eq!(
            parse_server(&crr.encode()),
            Err(WireError::WrongPacketLength { kind: CRR_T, len: 10 })
        );
    }

    #[test]
    fn test_error_replies_parse_header_only() {
        for (kind, error) in [
            (MDRR_T, FILE_NOT_FOUND),
            (CRR_T, INVALID_FILE_ID),
            (CRR_T, TOO_MANY_CHUNKS),
            (CRR_T, ZERO_LENGTH_CR),
            (MDRR_T, UNSUPPORTED_VERSION),
        ] {
            let header = ServerHeader { kind, number: 17, error };
            assert_eq!(parse_server(&header.encode()), Ok(ServerMessage::HeaderOnly(header)));
        }
    }

    #[test]
    fn test_file_not_found_and_invalid_file_id_share_a_code() {
        assert_eq!(FILE_NOT_FOUND, INVALID_FILE_ID);
        // The (type, error) pair keeps the variants apart.
        let not_found = ServerHeader { kind: MDRR_T, number: 0, error: FILE_NOT_FOUND };
        let bad_id = ServerHeader { kind: CRR_T, number: 0, error: INVALID_FILE_ID };
        assert_ne!(
            parse_server(&not_found.encode()),
            parse_server(&bad_id.encode())
        );
    }

    #[test]
    fn test_wrong_version_keeps_type_and_number() {
        let mut encoded = BytesMut::from(&Mdr { number: 5, token: token(), uri: "x".into() }.encode()[..]);
        encoded[0] = 1;
        assert_eq!(
            parse_client(&encoded),
            Err(WireError::UnsupportedVersion { version: 1, kind: MDR_T, number: 5 })
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert_eq!(parse_client(&[VERSION, 99, 0]), Err(WireError::UnsupportedType(99)));
        assert_eq!(parse_server(&[VERSION, 99, 0, 0]), Err(WireError::UnsupportedType(99)));
    }

    #[test]
    fn test_short_datagrams_are_length_violations() {
        assert!(matches!(parse_client(&[]), Err(WireError::WrongPacketLength { .. })));
        assert!(matches!(parse_client(&[1]), Err(WireError::WrongPacketLength { .. })));
        // An MDR needs at least one URI byte.
        let bare = &Mdr { number: 0, token: token(), uri: String::new() }.encode()[..];
        assert_eq!(bare.len(), CLIENT_HEADER_LEN);
        assert!(matches!(parse_client(bare), Err(WireError::WrongPacketLength { .. })));
        // An ACR needs at least one CR.
        let empty_acr = Acr {
            number: 0,
            token: token(),
            file_id: 0,
            packet_rate: 1,
            crs: Vec::new(),
        }
        .encode();
        assert!(matches!(parse_client(&empty_acr), Err(WireError::WrongPacketLength { .. })));
    }

    #[test]
    fn test_acr_with_partial_cr_is_rejected() {
        let acr = Acr {
            number: 0,
            token: token(),
            file_id: 1,
            packet_rate: 1,
            crs: vec![Cr { offset: 0, length: 1 }],
        };
        let mut encoded = BytesMut::from(&acr.encode()[..]);
        encoded.put_u8(0xff); // trailing fragment of a CR
        assert!(matches!(parse_client(&encoded), Err(WireError::WrongPacketLength { .. })));
    }

    #[test]
    fn test_mdr_uri_must_be_utf8() {
        let mut encoded = BytesMut::from(&Mdr { number: 0, token: token(), uri: "ab".into() }.encode()[..]);
        let at = encoded.len() - 1;
        encoded[at] = 0xff;
        assert_eq!(parse_client(&encoded), Err(WireError::Malformed("MDR URI is not valid UTF-8")));
    }
}
