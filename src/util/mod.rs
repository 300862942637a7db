//! Module implement common utility functions and types.

use cbordata::{Cbor, FromCbor, IntoCbor};

use std::convert::TryFrom;

use crate::Result;

pub mod files;
pub mod thread;

pub use thread::Thread;

#[macro_export]
macro_rules! check_remaining {
    ($buf:expr, $want:expr, $msg:expr) => {
        if $buf.len() < $want {
            err_at!(
                DecodeFail, msg: "insufficient input {}/{} ({})", $msg, $buf.len(), $want
            )
        } else {
            Ok(())
        }
    };
}

/// Helper function to serialize value `T` implementing IntoCbor, into byte-string.
pub fn into_cbor_bytes<T>(val: T) -> Result<Vec<u8>>
where
    T: IntoCbor,
{
    let mut data: Vec<u8> = vec![];
    let n = err_at!(
        FailCbor,
        err_at!(FailCbor, val.into_cbor())?.encode(&mut data)
    )?;
    if n != data.len() {
        err_at!(Fatal, msg: "cbor encoding len mistmatch {} {}", n, data.len())
    } else {
        Ok(data)
    }
}

/// Helper function to deserialize value `T` implementing FromCbor, from byte-string.
/// Return (value, bytes-consumed)
pub fn from_cbor_bytes<T>(mut data: &[u8]) -> Result<(T, usize)>
where
    T: FromCbor,
{
    let (val, n) = err_at!(FailCbor, Cbor::decode(&mut data))?;
    Ok((err_at!(FailCbor, T::from_cbor(val))?, n))
}

// Little endian fixed width and variable width integer encoding, used
// by the wire and on-disk formats.

pub fn encode_u8(buf: &mut Vec<u8>, val: u8) {
    buf.push(val)
}

pub fn encode_u16(buf: &mut Vec<u8>, val: u16) {
    buf.extend_from_slice(&val.to_le_bytes())
}

pub fn encode_u32(buf: &mut Vec<u8>, val: u32) {
    buf.extend_from_slice(&val.to_le_bytes())
}

pub fn encode_i32(buf: &mut Vec<u8>, val: i32) {
    buf.extend_from_slice(&val.to_le_bytes())
}

pub fn encode_u64(buf: &mut Vec<u8>, val: u64) {
    buf.extend_from_slice(&val.to_le_bytes())
}

pub fn encode_i64(buf: &mut Vec<u8>, val: i64) {
    buf.extend_from_slice(&val.to_le_bytes())
}

/// Encode `val` using 7-bit groups, least significant group first.
pub fn encode_vi32(buf: &mut Vec<u8>, mut val: u32) {
    while val >= 0x80 {
        buf.push(((val & 0x7f) as u8) | 0x80);
        val >>= 7;
    }
    buf.push(val as u8)
}

pub fn encoded_length_vi32(mut val: u32) -> usize {
    let mut n = 1;
    while val >= 0x80 {
        val >>= 7;
        n += 1;
    }
    n
}

/// Encode a length-prefixed byte string.
pub fn encode_bytes(buf: &mut Vec<u8>, val: &[u8]) -> Result<()> {
    encode_vi32(buf, err_at!(FailConvert, u32::try_from(val.len()))?);
    buf.extend_from_slice(val);
    Ok(())
}

pub fn encode_vstr(buf: &mut Vec<u8>, val: &str) -> Result<()> {
    encode_bytes(buf, val.as_bytes())
}

pub fn decode_u8(buf: &mut &[u8]) -> Result<u8> {
    check_remaining!(buf, 1, "u8")?;
    let val = buf[0];
    *buf = &buf[1..];
    Ok(val)
}

pub fn decode_u16(buf: &mut &[u8]) -> Result<u16> {
    check_remaining!(buf, 2, "u16")?;
    let val = u16::from_le_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(val)
}

pub fn decode_u32(buf: &mut &[u8]) -> Result<u32> {
    check_remaining!(buf, 4, "u32")?;
    let mut scratch = [0_u8; 4];
    scratch.copy_from_slice(&buf[..4]);
    *buf = &buf[4..];
    Ok(u32::from_le_bytes(scratch))
}

pub fn decode_i32(buf: &mut &[u8]) -> Result<i32> {
    Ok(decode_u32(buf)? as i32)
}

pub fn decode_u64(buf: &mut &[u8]) -> Result<u64> {
    check_remaining!(buf, 8, "u64")?;
    let mut scratch = [0_u8; 8];
    scratch.copy_from_slice(&buf[..8]);
    *buf = &buf[8..];
    Ok(u64::from_le_bytes(scratch))
}

pub fn decode_i64(buf: &mut &[u8]) -> Result<i64> {
    Ok(decode_u64(buf)? as i64)
}

pub fn decode_vi32(buf: &mut &[u8]) -> Result<u32> {
    let mut val: u32 = 0;
    for (i, shift) in (0..35).step_by(7).enumerate() {
        check_remaining!(buf, i + 1, "vi32")?;
        let byte = buf[i];
        val |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            *buf = &buf[(i + 1)..];
            return Ok(val);
        }
    }
    err_at!(DecodeFail, msg: "vi32 overflow")
}

pub fn decode_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let n = decode_vi32(buf)? as usize;
    check_remaining!(buf, n, "bytes")?;
    let (val, rest) = buf.split_at(n);
    *buf = rest;
    Ok(val)
}

pub fn decode_vstr(buf: &mut &[u8]) -> Result<String> {
    let val = decode_bytes(buf)?;
    Ok(err_at!(FailConvert, std::str::from_utf8(val))?.to_string())
}
