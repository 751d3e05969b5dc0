//! On-disk representation of a single cache entry. Tile bytes and their validation metadata live
//! in one file, so they are always replaced together.
//!
//! ```text
//! magic "MTC1" | modified: i64 LE, ms since epoch | etag length: u16 LE | etag | tile data
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

const MAGIC: &[u8; 4] = b"MTC1";
const HEADER_LEN: usize = MAGIC.len() + size_of::<i64>() + size_of::<u16>();

/// Tile as kept by [`crate::FileCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedTile {
    pub data: Bytes,
    pub etag: Option<String>,

    /// When the tile was downloaded, or last confirmed to be up to date.
    pub modified: DateTime<Utc>,
}

impl CachedTile {
    /// Whether the tile is at least `max_age` old.
    pub fn is_expired(&self, max_age: std::time::Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.modified);
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => age >= max_age,
            // Longer than chrono can express, so effectively forever.
            Err(_) => false,
        }
    }
}

pub(crate) fn encode(data: &[u8], etag: Option<&str>, modified: DateTime<Utc>) -> Bytes {
    // Longer ETags are not worth keeping, tile will simply be downloaded unconditionally.
    let etag = etag.filter(|etag| etag.len() <= u16::MAX as usize).unwrap_or_default();

    let mut buffer = BytesMut::with_capacity(HEADER_LEN + etag.len() + data.len());
    buffer.put_slice(MAGIC);
    buffer.put_i64_le(modified.timestamp_millis());
    buffer.put_u16_le(etag.len() as u16);
    buffer.put_slice(etag.as_bytes());
    buffer.put_slice(data);
    buffer.freeze()
}

pub(crate) fn decode(mut raw: Bytes) -> Result<CachedTile, &'static str> {
    if raw.len() < HEADER_LEN {
        return Err("truncated header");
    }

    if &raw[..MAGIC.len()] != MAGIC {
        return Err("bad magic");
    }
    raw.advance(MAGIC.len());

    let modified =
        DateTime::from_timestamp_millis(raw.get_i64_le()).ok_or("modification time out of range")?;

    let etag_len = raw.get_u16_le() as usize;
    if raw.len() < etag_len {
        return Err("truncated ETag");
    }

    let etag = raw.split_to(etag_len);
    let etag = match std::str::from_utf8(&etag) {
        Ok("") => None,
        Ok(etag) => Some(etag.to_owned()),
        Err(_) => return Err("ETag is not UTF-8"),
    };

    Ok(CachedTile {
        data: raw,
        etag,
        modified,
    })
}

/// Replace the modification time in an encoded entry, leaving everything else intact.
pub(crate) fn with_modified(raw: &[u8], modified: DateTime<Utc>) -> Result<Bytes, &'static str> {
    if raw.len() < HEADER_LEN || &raw[..MAGIC.len()] != MAGIC {
        return Err("bad header");
    }

    let mut buffer = BytesMut::from(raw);
    buffer[MAGIC.len()..MAGIC.len() + size_of::<i64>()]
        .copy_from_slice(&modified.timestamp_millis().to_le_bytes());
    Ok(buffer.freeze())
}
