use quicmux_x::ConnectionId;

/// Mask over the first byte that selects the connection id width.
pub const CONN_ID_FLAG_MASK: u8 = 0x0C;

pub type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty datagram")]
    Empty,

    #[error("datagram too short for connection id: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },
}

/// Routing view of a datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub conn_id: ConnectionId,
    /// Bytes consumed by the flags byte and connection id field.
    pub header_len: usize,
}

/// Width in bytes of the connection id field announced by `flags`.
///
/// | `flags & 0x0C` | width |
/// |----------------|-------|
/// | `0x00`         | 0     |
/// | `0x04`         | 2     |
/// | `0x08`         | 8     |
/// | `0x0C`         | 4     |
#[inline]
pub fn conn_id_width(flags: u8) -> usize {
    match flags & CONN_ID_FLAG_MASK {
        0x04 => 2,
        0x08 => 8,
        0x0C => 4,
        _ => 0,
    }
}

/// Extract the little-endian connection id that follows the flags byte.
///
/// A zero-width field yields connection id 0.
pub fn parse_connection_id(datagram: &[u8]) -> Result<ParsedHeader> {
    let flags = *datagram.first().ok_or(ParseError::Empty)?;
    let width = conn_id_width(flags);
    let needed = 1 + width;
    let field = datagram.get(1..needed).ok_or(ParseError::Truncated {
        needed,
        got: datagram.len(),
    })?;

    let mut raw = [0u8; 8];
    raw[..width].copy_from_slice(field);

    Ok(ParsedHeader {
        conn_id: ConnectionId(u64::from_le_bytes(raw)),
        header_len: needed,
    })
}

/// Owning shard for a connection.
#[inline]
pub fn shard_for(conn_id: ConnectionId, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    (conn_id.0 % shards as u64) as usize
}
