//! Request framing and classification of incoming datagrams.

use crate::{errors::Result, util::BinaryCursor};

use bytes::{BufMut, Bytes, BytesMut};
use enum_primitive_derive::Primitive;

/// Leading word of every request and of single-packet replies.
pub const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
pub const SINGLE_PACKET: i32 = -1;
pub const SPLIT_PACKET: i32 = -2;

pub const INFO_PAYLOAD: &[u8] = b"Source Engine Query\0";
/// Sent in place of a challenge token to request one.
pub const CHALLENGE_REQUEST: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

const COMPRESSED_FLAG: u32 = 0x8000_0000;
const SIZE_FIELD_OVERHEAD: u16 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Primitive)]
pub enum QueryType {
    Info = 0x54,
    Player = 0x55,
    Rules = 0x56,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Primitive)]
pub enum ResponseType {
    Challenge = 0x41,
    Player = 0x44,
    Rules = 0x45,
    Info = 0x49,
}

pub fn build_request(query_type: QueryType, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER.len() + 1 + payload.len());
    out.put_slice(&HEADER);
    out.put_u8(query_type as u8);
    out.put_slice(payload);
    out.freeze()
}

/// Splits a request frame back into its type byte and payload.
pub fn parse_request(data: &[u8]) -> Result<(u8, &[u8])> {
    let mut cursor = BinaryCursor::new(data);
    cursor.skip(HEADER.len())?;
    let query_type = cursor.read_u8()?;
    Ok((query_type, cursor.rest()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Datagram<'a> {
    /// Payload of a complete reply, starting at the type byte.
    Single(&'a [u8]),
    /// Fragment of a split reply, starting at the fragment header.
    Split(&'a [u8]),
}

pub fn classify(data: &[u8]) -> Result<Datagram<'_>> {
    let mut cursor = BinaryCursor::new(data);
    let marker = cursor.read_i32_le()?;
    Ok(if marker == SPLIT_PACKET {
        Datagram::Split(cursor.rest())
    } else {
        Datagram::Single(cursor.rest())
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decompressed {
    pub size: u32,
    pub crc32: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub id: u32,
    pub compressed: bool,
    pub total: u8,
    /// Zero-based position of this fragment in the reply.
    pub index: u8,
    pub fragment_size: u16,
    /// Only carried by fragment 0 of a compressed reply.
    pub decompressed: Option<Decompressed>,
}

impl FragmentHeader {
    /// Parses the header of a split datagram (marker already stripped) and returns it together
    /// with the fragment payload.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8])> {
        let mut cursor = BinaryCursor::new(data);

        // Little-endian on the wire, so the compression bit is the top bit of the last byte.
        let id = cursor.read_u32_le()?;
        let compressed = id & COMPRESSED_FLAG != 0;
        let total = cursor.read_u8()?;
        let index = cursor.read_u8()?;
        let fragment_size = cursor.read_u16_le()?.saturating_sub(SIZE_FIELD_OVERHEAD);

        let decompressed = if compressed && index == 0 {
            Some(Decompressed {
                size: cursor.read_u32_le()?,
                crc32: cursor.read_u32_le()?,
            })
        } else {
            None
        };

        Ok((
            Self {
                id,
                compressed,
                total,
                index,
                fragment_size,
                decompressed,
            },
            cursor.rest(),
        ))
    }
}
