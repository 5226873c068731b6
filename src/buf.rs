//! Bounds-checked little-endian buffer access shared by both codecs.
//!
//! All wire integers are little-endian. Every read/write validates the
//! range first, so a truncated blob surfaces as a typed error instead of a
//! panic.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::BlobError;
use crate::schema::Primitive;
use crate::value::Value;

pub(crate) fn check(data: &[u8], offset: usize, len: usize) -> Result<&[u8], BlobError> {
    match data.get(offset..offset + len) {
        Some(s) => Ok(s),
        None => Err(BlobError::OutOfBounds {
            offset,
            len,
            available: data.len(),
        }),
    }
}

pub(crate) fn check_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], BlobError> {
    let available = data.len();
    match data.get_mut(offset..offset + len) {
        Some(s) => Ok(s),
        None => Err(BlobError::OutOfBounds {
            offset,
            len,
            available,
        }),
    }
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32, BlobError> {
    Ok(LittleEndian::read_u32(check(data, offset, 4)?))
}

pub(crate) fn write_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), BlobError> {
    LittleEndian::write_u32(check_mut(data, offset, 4)?, value);
    Ok(())
}

/// Little-endian unsigned integer of 1, 2, 4 or 8 bytes.
pub(crate) fn read_uint(data: &[u8], offset: usize, width: usize) -> Result<u64, BlobError> {
    let s = check(data, offset, width)?;
    Ok(match width {
        1 => s[0] as u64,
        2 => LittleEndian::read_u16(s) as u64,
        4 => LittleEndian::read_u32(s) as u64,
        _ => LittleEndian::read_u64(s),
    })
}

pub(crate) fn write_uint(
    data: &mut [u8],
    offset: usize,
    width: usize,
    value: u64,
) -> Result<(), BlobError> {
    let s = check_mut(data, offset, width)?;
    match width {
        1 => s[0] = value as u8,
        2 => LittleEndian::write_u16(s, value as u16),
        4 => LittleEndian::write_u32(s, value as u32),
        _ => LittleEndian::write_u64(s, value),
    }
    Ok(())
}

fn sign_extend(raw: u64, width: usize) -> i64 {
    let shift = 64 - width * 8;
    ((raw << shift) as i64) >> shift
}

/// Decode one scalar at `offset`. `ptr_bytes` is the pointer width used by
/// the `ulong` primitive.
pub(crate) fn read_primitive(
    p: Primitive,
    data: &[u8],
    offset: usize,
    ptr_bytes: usize,
) -> Result<Value, BlobError> {
    let width = p.byte_size(ptr_bytes);
    Ok(match p {
        Primitive::Void => Value::Null,
        Primitive::Bool => Value::Bool(read_uint(data, offset, width)? > 0),
        Primitive::Float32 => {
            Value::F32(f32::from_bits(read_uint(data, offset, 4)? as u32))
        }
        Primitive::Float64 => Value::F64(f64::from_bits(read_uint(data, offset, 8)?)),
        Primitive::Half => Value::Half(read_uint(data, offset, 2)? as u16),
        _ if p.is_signed() => Value::Int(sign_extend(read_uint(data, offset, width)?, width)),
        _ => Value::UInt(read_uint(data, offset, width)?),
    })
}

/// Encode one scalar at `offset`. The value's shape must match the
/// primitive's category.
pub(crate) fn write_primitive(
    p: Primitive,
    data: &mut [u8],
    offset: usize,
    ptr_bytes: usize,
    value: &Value,
    context: &str,
) -> Result<(), BlobError> {
    let width = p.byte_size(ptr_bytes);
    let mismatch = || BlobError::InvalidWireCategory {
        category: p.name().to_owned(),
        context: context.to_owned(),
    };
    match p {
        Primitive::Void => Ok(()),
        Primitive::Bool => {
            let raw = match value {
                Value::Bool(b) => *b as u64,
                Value::Int(i) => (*i > 0) as u64,
                Value::UInt(u) => (*u > 0) as u64,
                _ => return Err(mismatch()),
            };
            write_uint(data, offset, width, raw)
        }
        Primitive::Float32 => match value {
            Value::F32(f) => write_uint(data, offset, 4, f.to_bits() as u64),
            _ => Err(mismatch()),
        },
        Primitive::Float64 => match value {
            Value::F64(f) => write_uint(data, offset, 8, f.to_bits()),
            Value::F32(f) => write_uint(data, offset, 8, (*f as f64).to_bits()),
            _ => Err(mismatch()),
        },
        Primitive::Half => match value {
            Value::Half(bits) => write_uint(data, offset, 2, *bits as u64),
            _ => Err(mismatch()),
        },
        _ => {
            let raw = match value {
                Value::Int(i) => *i as u64,
                Value::UInt(u) => *u,
                _ => return Err(mismatch()),
            };
            write_uint(data, offset, width, raw)
        }
    }
}
