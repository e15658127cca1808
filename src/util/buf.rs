use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_varint_len(buf: &mut impl BufMut, len: usize) {
    buf.put_usize_varint(len);
}

pub fn try_get_varint_len(buf: &mut impl Buf) -> anyhow::Result<usize> {
    Ok(buf.try_get_usize_varint()?)
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_usize_varint(bytes.len());
    buf.put_slice(bytes);
}

/// Reads a varint length prefix followed by that many bytes. Fails without consuming the payload
///  if the buffer holds less than the announced length.
pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("buffer underflow: announced length {} exceeds remaining {} bytes", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}
