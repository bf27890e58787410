//! Vidstream wire format: every datagram exchanged with the streaming server.
//!
//! A datagram starts with a literal ASCII tag and its binary fields follow
//! the tag with no separator. The server packs its integer fields with the
//! host machine word, so FRAME_START and CHUNK headers arrive in one of two
//! widths: wide (u64 words) or narrow (u32 words). Every integer is
//! little-endian.
//!
//! Layouts are #[repr(C)] zerocopy structs made of unaligned little-endian
//! integers. Decoding a layout is a length check plus a copy; there is no
//! unsafe code in this module.

use std::fmt;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Tags ──────────────────────────────────────────────────────────────────────

/// Client → server. Asks the server to start streaming to this socket.
pub const TAG_REGISTER_CLIENT: &[u8] = b"REGISTER_CLIENT";

/// Server → client. Registration acknowledgement.
pub const TAG_REGISTERED: &[u8] = b"REGISTERED";

/// Client → server. Liveness assertion, independent of frame traffic.
pub const TAG_KEEPALIVE: &[u8] = b"KEEPALIVE";

/// Client → server on shutdown. A server that sends it back ends the session.
pub const TAG_DISCONNECT: &[u8] = b"DISCONNECT";

/// Server → client. Announces a chunked frame.
pub const TAG_FRAME_START: &[u8] = b"FRAME_START";

/// Server → client. One fragment of an announced frame.
pub const TAG_CHUNK: &[u8] = b"CHUNK";

/// Server → client. A whole frame in one datagram (legacy, non-chunked).
pub const TAG_FRAME: &[u8] = b"FRAME";

/// Ceiling on any size or count a header may declare. Anything larger is
/// treated as garbage rather than a frame worth allocating for.
pub const MAX_DECLARED_SIZE: u64 = 1 << 30;

/// Server → client tags the parser recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Registered,
    Disconnect,
    FrameStart,
    Chunk,
    Frame,
}

impl Tag {
    /// Longest prefix first: `FRAME_START` must be tried before `FRAME`.
    const MATCH_ORDER: [Tag; 5] = [
        Tag::FrameStart,
        Tag::Registered,
        Tag::Disconnect,
        Tag::Chunk,
        Tag::Frame,
    ];

    pub fn bytes(self) -> &'static [u8] {
        match self {
            Tag::Registered => TAG_REGISTERED,
            Tag::Disconnect => TAG_DISCONNECT,
            Tag::FrameStart => TAG_FRAME_START,
            Tag::Chunk => TAG_CHUNK,
            Tag::Frame => TAG_FRAME,
        }
    }

    fn of(datagram: &[u8]) -> Option<Tag> {
        Self::MATCH_ORDER
            .into_iter()
            .find(|tag| datagram.starts_with(tag.bytes()))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tags are ASCII literals.
        f.write_str(std::str::from_utf8(self.bytes()).unwrap_or("?"))
    }
}

// ── Layouts ───────────────────────────────────────────────────────────────────

/// FRAME_START body from a server whose machine word is 64 bits.
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameStartWide {
    pub frame_id: U64<LittleEndian>,
    pub total_size: U64<LittleEndian>,
    pub chunk_count: U64<LittleEndian>,
}

assert_eq_size!(FrameStartWide, [u8; 24]);

/// FRAME_START body from a server whose machine word is 32 bits.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameStartNarrow {
    pub frame_id: U32<LittleEndian>,
    pub total_size: U32<LittleEndian>,
    pub chunk_count: U32<LittleEndian>,
}

assert_eq_size!(FrameStartNarrow, [u8; 12]);

/// CHUNK header, 64-bit words. The chunk payload follows immediately.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkHeaderWide {
    pub frame_id: U64<LittleEndian>,
    pub chunk_index: U64<LittleEndian>,
}

assert_eq_size!(ChunkHeaderWide, [u8; 16]);

/// CHUNK header, 32-bit words. The chunk payload follows immediately.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkHeaderNarrow {
    pub frame_id: U32<LittleEndian>,
    pub chunk_index: U32<LittleEndian>,
}

assert_eq_size!(ChunkHeaderNarrow, [u8; 8]);

/// Legacy FRAME header. Always 8 bytes regardless of server word size.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    pub size: U64<LittleEndian>,
}

assert_eq_size!(FrameHeader, [u8; 8]);

/// Word width a FRAME_START or CHUNK header was packed with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WordWidth {
    /// 64-bit words. Tried first.
    #[default]
    Wide,
    /// 32-bit words.
    Narrow,
}

impl WordWidth {
    /// Exact FRAME_START body length for this width.
    pub const fn frame_start_len(self) -> usize {
        match self {
            WordWidth::Wide => std::mem::size_of::<FrameStartWide>(),
            WordWidth::Narrow => std::mem::size_of::<FrameStartNarrow>(),
        }
    }

    /// CHUNK header length for this width; the payload starts right after it.
    pub const fn chunk_header_len(self) -> usize {
        match self {
            WordWidth::Wide => std::mem::size_of::<ChunkHeaderWide>(),
            WordWidth::Narrow => std::mem::size_of::<ChunkHeaderNarrow>(),
        }
    }

    pub const fn other(self) -> Self {
        match self {
            WordWidth::Wide => WordWidth::Narrow,
            WordWidth::Narrow => WordWidth::Wide,
        }
    }

    /// Candidate order when `self` is preferred.
    const fn candidates(self) -> [WordWidth; 2] {
        [self, self.other()]
    }
}

// ── Decoded datagrams ─────────────────────────────────────────────────────────

/// Decoded FRAME_START fields, independent of the width they arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStart {
    pub frame_id: u64,
    pub total_size: u64,
    pub chunk_count: u64,
    pub width: WordWidth,
}

/// Decoded CHUNK header plus a borrow of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub frame_id: u64,
    pub chunk_index: u64,
    pub payload: &'a [u8],
    pub width: WordWidth,
}

/// Classification of one received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram<'a> {
    Registered,
    Disconnect,
    FrameStart(FrameStart),
    Chunk(Chunk<'a>),
    /// Legacy single-datagram frame; the slice is exactly the declared size.
    Frame(&'a [u8]),
    /// A recognised tag whose fields did not decode. Routine on a lossy link.
    Malformed(WireError),
    /// No recognised tag.
    Unknown,
}

// ── Parser ────────────────────────────────────────────────────────────────────

/// Stateful front end to [`classify`].
///
/// CHUNK headers carry a variable-length payload, so their length cannot say
/// which width the server used. The parser remembers the width of the last
/// FRAME_START it decoded (whose length is exact) and tries that width first
/// for CHUNK headers. Before any FRAME_START it prefers the wide layout.
#[derive(Debug, Default)]
pub struct HeaderParser {
    preferred: WordWidth,
}

impl HeaderParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preferred_width(&self) -> WordWidth {
        self.preferred
    }

    pub fn parse<'a>(&mut self, datagram: &'a [u8]) -> Datagram<'a> {
        let parsed = classify(datagram, self.preferred);
        if let Datagram::FrameStart(start) = &parsed {
            self.preferred = start.width;
        }
        parsed
    }
}

/// Classify a datagram by tag and decode its fields.
///
/// `chunk_width` is the width tried first for CHUNK headers. FRAME_START
/// always tries wide then narrow and picks the layout whose exact length
/// matches the body.
pub fn classify(datagram: &[u8], chunk_width: WordWidth) -> Datagram<'_> {
    let Some(tag) = Tag::of(datagram) else {
        return Datagram::Unknown;
    };
    let body = &datagram[tag.bytes().len()..];

    let decoded = match tag {
        Tag::Registered => expect_empty(tag, body).map(|()| Datagram::Registered),
        Tag::Disconnect => expect_empty(tag, body).map(|()| Datagram::Disconnect),
        Tag::FrameStart => decode_frame_start(body).map(Datagram::FrameStart),
        Tag::Chunk => decode_chunk(body, chunk_width).map(Datagram::Chunk),
        Tag::Frame => decode_frame(body).map(Datagram::Frame),
    };

    decoded.unwrap_or_else(Datagram::Malformed)
}

fn expect_empty(tag: Tag, body: &[u8]) -> Result<(), WireError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(WireError::TrailingBytes {
            tag,
            extra: body.len(),
        })
    }
}

fn decode_frame_start(body: &[u8]) -> Result<FrameStart, WireError> {
    let start = WordWidth::Wide
        .candidates()
        .into_iter()
        .find_map(|width| read_frame_start(width, body))
        .ok_or(WireError::NoMatchingLayout {
            tag: Tag::FrameStart,
            actual: body.len(),
        })?;

    if start.total_size == 0 {
        return Err(WireError::ZeroField("total_size"));
    }
    if start.chunk_count == 0 {
        return Err(WireError::ZeroField("chunk_count"));
    }
    if start.total_size > MAX_DECLARED_SIZE {
        return Err(WireError::FieldTooLarge {
            field: "total_size",
            value: start.total_size,
            max: MAX_DECLARED_SIZE,
        });
    }
    // Every chunk carries at least one byte of the frame.
    if start.chunk_count > start.total_size {
        return Err(WireError::FieldTooLarge {
            field: "chunk_count",
            value: start.chunk_count,
            max: start.total_size,
        });
    }

    Ok(start)
}

/// `read_from` rejects any body whose length differs from the layout.
fn read_frame_start(width: WordWidth, body: &[u8]) -> Option<FrameStart> {
    let (frame_id, total_size, chunk_count) = match width {
        WordWidth::Wide => {
            let l = FrameStartWide::read_from(body)?;
            (l.frame_id.get(), l.total_size.get(), l.chunk_count.get())
        }
        WordWidth::Narrow => {
            let l = FrameStartNarrow::read_from(body)?;
            (
                u64::from(l.frame_id.get()),
                u64::from(l.total_size.get()),
                u64::from(l.chunk_count.get()),
            )
        }
    };
    Some(FrameStart {
        frame_id,
        total_size,
        chunk_count,
        width,
    })
}

fn decode_chunk(body: &[u8], preferred: WordWidth) -> Result<Chunk<'_>, WireError> {
    preferred
        .candidates()
        .into_iter()
        .find_map(|width| read_chunk(width, body))
        .ok_or(WireError::Truncated {
            tag: Tag::Chunk,
            required: TAG_CHUNK.len() + WordWidth::Narrow.chunk_header_len(),
            actual: TAG_CHUNK.len() + body.len(),
        })
}

fn read_chunk(width: WordWidth, body: &[u8]) -> Option<Chunk<'_>> {
    let header_len = width.chunk_header_len();
    if body.len() < header_len {
        return None;
    }
    let (header, payload) = body.split_at(header_len);
    let (frame_id, chunk_index) = match width {
        WordWidth::Wide => {
            let h = ChunkHeaderWide::read_from(header)?;
            (h.frame_id.get(), h.chunk_index.get())
        }
        WordWidth::Narrow => {
            let h = ChunkHeaderNarrow::read_from(header)?;
            (u64::from(h.frame_id.get()), u64::from(h.chunk_index.get()))
        }
    };
    Some(Chunk {
        frame_id,
        chunk_index,
        payload,
        width,
    })
}

fn decode_frame(body: &[u8]) -> Result<&[u8], WireError> {
    const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

    let header = FrameHeader::read_from_prefix(body).ok_or(WireError::Truncated {
        tag: Tag::Frame,
        required: TAG_FRAME.len() + HEADER_LEN,
        actual: TAG_FRAME.len() + body.len(),
    })?;

    let size = header.size.get();
    if size == 0 {
        return Err(WireError::ZeroField("size"));
    }
    if size > MAX_DECLARED_SIZE {
        return Err(WireError::FieldTooLarge {
            field: "size",
            value: size,
            max: MAX_DECLARED_SIZE,
        });
    }

    // Bounded by MAX_DECLARED_SIZE above, so the cast is lossless.
    let size = size as usize;
    let payload = &body[HEADER_LEN..];
    if payload.len() < size {
        return Err(WireError::Truncated {
            tag: Tag::Frame,
            required: TAG_FRAME.len() + HEADER_LEN + size,
            actual: TAG_FRAME.len() + body.len(),
        });
    }

    Ok(&payload[..size])
}

// ── Encoding ──────────────────────────────────────────────────────────────────
//
// The client only ever sends bare tags. These encoders produce the server's
// side of the protocol for tests and local tooling.

/// Encode a FRAME_START datagram in `start.width`.
pub fn encode_frame_start(start: &FrameStart) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(TAG_FRAME_START.len() + start.width.frame_start_len());
    out.extend_from_slice(TAG_FRAME_START);
    match start.width {
        WordWidth::Wide => out.extend_from_slice(
            FrameStartWide {
                frame_id: U64::new(start.frame_id),
                total_size: U64::new(start.total_size),
                chunk_count: U64::new(start.chunk_count),
            }
            .as_bytes(),
        ),
        WordWidth::Narrow => out.extend_from_slice(
            FrameStartNarrow {
                frame_id: narrow("frame_id", start.frame_id)?,
                total_size: narrow("total_size", start.total_size)?,
                chunk_count: narrow("chunk_count", start.chunk_count)?,
            }
            .as_bytes(),
        ),
    }
    Ok(out)
}

/// Encode a CHUNK datagram with a `width` header followed by `payload`.
pub fn encode_chunk(
    width: WordWidth,
    frame_id: u64,
    chunk_index: u64,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(TAG_CHUNK.len() + width.chunk_header_len() + payload.len());
    out.extend_from_slice(TAG_CHUNK);
    match width {
        WordWidth::Wide => out.extend_from_slice(
            ChunkHeaderWide {
                frame_id: U64::new(frame_id),
                chunk_index: U64::new(chunk_index),
            }
            .as_bytes(),
        ),
        WordWidth::Narrow => out.extend_from_slice(
            ChunkHeaderNarrow {
                frame_id: narrow("frame_id", frame_id)?,
                chunk_index: narrow("chunk_index", chunk_index)?,
            }
            .as_bytes(),
        ),
    }
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode a legacy single-datagram FRAME.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TAG_FRAME.len() + 8 + payload.len());
    out.extend_from_slice(TAG_FRAME);
    out.extend_from_slice(
        FrameHeader {
            size: U64::new(payload.len() as u64),
        }
        .as_bytes(),
    );
    out.extend_from_slice(payload);
    out
}

fn narrow(field: &'static str, value: u64) -> Result<U32<LittleEndian>, WireError> {
    u32::try_from(value)
        .map(U32::new)
        .map_err(|_| WireError::FieldTooLarge {
            field,
            value,
            max: u64::from(u32::MAX),
        })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a datagram with a recognised tag was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("{tag} datagram truncated: need at least {required} bytes, got {actual}")]
    Truncated {
        tag: Tag,
        required: usize,
        actual: usize,
    },

    #[error("{tag} body of {actual} bytes matches no known layout")]
    NoMatchingLayout { tag: Tag, actual: usize },

    #[error("{tag} carries {extra} unexpected trailing bytes")]
    TrailingBytes { tag: Tag, extra: usize },

    #[error("{0} must be non-zero")]
    ZeroField(&'static str),

    #[error("{field} = {value} exceeds ceiling {max}")]
    FieldTooLarge {
        field: &'static str,
        value: u64,
        max: u64,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
