// src/codec.rs
//
// Little-endian primitive writers and readers shared by the wire codec.
// Readers advance a cursor and fail on truncation instead of panicking.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated input while reading {0}")]
    Truncated(&'static str),
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

// --- writers ---

pub fn put_u32(dst: &mut Vec<u8>, x: u32) {
    dst.extend_from_slice(&x.to_le_bytes());
}

pub fn put_u64(dst: &mut Vec<u8>, x: u64) {
    dst.extend_from_slice(&x.to_le_bytes());
}

// --- readers ---

pub fn rd_u8(i: &mut usize, b: &[u8]) -> Result<u8, CodecError> {
    if *i + 1 > b.len() {
        return Err(CodecError::Truncated("u8"));
    }
    let v = b[*i];
    *i += 1;
    Ok(v)
}

pub fn rd_u32(i: &mut usize, b: &[u8]) -> Result<u32, CodecError> {
    if *i + 4 > b.len() {
        return Err(CodecError::Truncated("u32"));
    }
    let v = u32::from_le_bytes(b[*i..*i + 4].try_into().unwrap());
    *i += 4;
    Ok(v)
}

pub fn rd_u64(i: &mut usize, b: &[u8]) -> Result<u64, CodecError> {
    if *i + 8 > b.len() {
        return Err(CodecError::Truncated("u64"));
    }
    let v = u64::from_le_bytes(b[*i..*i + 8].try_into().unwrap());
    *i += 8;
    Ok(v)
}

pub fn rd_fixed<const N: usize>(i: &mut usize, b: &[u8]) -> Result<[u8; N], CodecError> {
    if *i + N > b.len() {
        return Err(CodecError::Truncated("fixed bytes"));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&b[*i..*i + N]);
    *i += N;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_roundtrip() {
        let mut v = Vec::new();
        put_u64(&mut v, 0xdead_beef_0102_0304);
        let mut i = 0;
        assert_eq!(rd_u64(&mut i, &v).unwrap(), 0xdead_beef_0102_0304);
        assert_eq!(i, 8);
    }

    #[test]
    fn readers_reject_truncation() {
        let mut i = 0;
        assert_eq!(rd_u32(&mut i, &[1, 2, 3]), Err(CodecError::Truncated("u32")));
        let mut i = 0;
        assert_eq!(
            rd_fixed::<4>(&mut i, &[1, 2, 3]),
            Err(CodecError::Truncated("fixed bytes"))
        );
    }
}
