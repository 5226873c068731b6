//! Shift-JIS text codec.
//!
//! Every string in both wire formats uses the engine's fixed legacy
//! Japanese encoding, never UTF-8. The encoded form always carries exactly
//! one trailing NUL terminator; the terminator is consumed on decode and
//! produced on encode, and is never part of the logical string value.
//! Malformed or unencodable text is a typed error, never a lossy decode.

use encoding_rs::SHIFT_JIS;

use crate::error::BlobError;

/// Decode an item's full byte range, trimming a single trailing NUL.
pub fn decode(bytes: &[u8], context: &str) -> Result<String, BlobError> {
    let body = match bytes.split_last() {
        Some((0, rest)) => rest,
        _ => bytes,
    };
    let (text, _, malformed) = SHIFT_JIS.decode(body);
    if malformed {
        return Err(BlobError::BadText {
            context: context.to_owned(),
        });
    }
    Ok(text.into_owned())
}

/// Decode a NUL-terminated string starting at `pos`. The terminator must
/// be found before the end of `data`.
pub fn decode_cstr(data: &[u8], pos: usize, context: &str) -> Result<String, BlobError> {
    let tail = data.get(pos..).ok_or(BlobError::OutOfBounds {
        offset: pos,
        len: 1,
        available: data.len(),
    })?;
    let nul = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| BlobError::BadText {
            context: context.to_owned(),
        })?;
    decode(&tail[..=nul], context)
}

/// Encode to Shift-JIS with a trailing NUL appended.
pub fn encode(text: &str) -> Result<Vec<u8>, BlobError> {
    let (bytes, _, unmappable) = SHIFT_JIS.encode(text);
    if unmappable {
        return Err(BlobError::UnencodableText(text.to_owned()));
    }
    let mut out = bytes.into_owned();
    out.push(0);
    Ok(out)
}
