//! Little-endian field access for the on-disk structures.
//!
//! The verified-boot layouts place 64-bit fields at offsets C struct padding
//! rules would move, so everything is read and written field-wise rather
//! than transmuted.

use byteorder::{ByteOrder, LittleEndian};

use crate::Error;

/// Size of an embedded public key header.
pub const VB_PUBLIC_KEY_SIZE: usize = 32;

pub(crate) fn read_u16(buf: &[u8], off: usize, what: &'static str) -> Result<u16, Error> {
    let end = off.checked_add(2).ok_or(Error::Truncated(what))?;
    if end > buf.len() {
        return Err(Error::Truncated(what));
    }
    Ok(LittleEndian::read_u16(&buf[off..end]))
}

pub(crate) fn read_u32(buf: &[u8], off: usize, what: &'static str) -> Result<u32, Error> {
    let end = off.checked_add(4).ok_or(Error::Truncated(what))?;
    if end > buf.len() {
        return Err(Error::Truncated(what));
    }
    Ok(LittleEndian::read_u32(&buf[off..end]))
}

pub(crate) fn read_u64(buf: &[u8], off: usize, what: &'static str) -> Result<u64, Error> {
    let end = off.checked_add(8).ok_or(Error::Truncated(what))?;
    if end > buf.len() {
        return Err(Error::Truncated(what));
    }
    Ok(LittleEndian::read_u64(&buf[off..end]))
}

pub(crate) fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    LittleEndian::write_u32(&mut buf[off..off + 4], v);
}

pub(crate) fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    LittleEndian::write_u64(&mut buf[off..off + 8], v);
}

/// An embedded `VbSignature` header. All offsets are relative to the start
/// of the header itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SigHeader {
    pub sig_offset: u64,
    pub sig_size: u64,
    pub data_size: u64,
}

pub(crate) fn read_sig_header(
    buf: &[u8],
    pos: usize,
    what: &'static str,
) -> Result<SigHeader, Error> {
    Ok(SigHeader {
        sig_offset: read_u64(buf, pos, what)?,
        sig_size: read_u64(buf, pos + 8, what)?,
        data_size: read_u64(buf, pos + 16, what)?,
    })
}

/// Writes a signature header at `pos` describing signature data placed at
/// absolute offset `data_pos` in the same buffer.
pub(crate) fn write_sig_header(
    buf: &mut [u8],
    pos: usize,
    data_pos: usize,
    sig_size: usize,
    data_size: u64,
) {
    write_u64(buf, pos, (data_pos - pos) as u64);
    write_u64(buf, pos + 8, sig_size as u64);
    write_u64(buf, pos + 16, data_size);
}

/// Resolves the signature body described by a header at `pos`, bounds-checked
/// against both the buffer and `limit` (the enclosing structure's declared
/// size).
pub(crate) fn sig_body<'a>(
    buf: &'a [u8],
    pos: usize,
    hdr: &SigHeader,
    limit: usize,
    what: &'static str,
) -> Result<&'a [u8], Error> {
    let start = (pos as u64)
        .checked_add(hdr.sig_offset)
        .ok_or(Error::Truncated(what))?;
    let end = start.checked_add(hdr.sig_size).ok_or(Error::Truncated(what))?;
    if end > limit as u64 || end > buf.len() as u64 {
        return Err(Error::Truncated(what));
    }
    Ok(&buf[start as usize..end as usize])
}

/// Reads a fixed-width, not-necessarily-terminated name field.
pub(crate) fn read_name(buf: &[u8], off: usize, width: usize) -> String {
    let raw = &buf[off..off + width];
    let len = raw.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8_lossy(&raw[..len]).into_owned()
}
