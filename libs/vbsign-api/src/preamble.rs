//! Firmware and kernel preambles: the signed headers that bind a version,
//! a subkey, and a body signature together.
//!
//! Firmware preamble v2.1 (header 108 bytes):
//!
//! ```text
//! offset 0    preamble_size u64
//! offset 8    preamble_signature VbSignature
//! offset 32   header_version_major u32, header_version_minor u32
//! offset 40   firmware_version u64
//! offset 48   kernel_subkey VbPublicKey
//! offset 80   body_signature VbSignature
//! offset 104  flags u32
//! offset 108  subkey body | body-signature body | preamble-signature body
//! ```
//!
//! Kernel preamble v2.2 (header 116 bytes):
//!
//! ```text
//! offset 0    preamble_size u64
//! offset 8    preamble_signature VbSignature
//! offset 32   header_version_major u32, header_version_minor u32
//! offset 40   kernel_version u64
//! offset 48   body_load_address u64
//! offset 56   bootloader_address u64
//! offset 64   bootloader_size u64
//! offset 72   body_signature VbSignature
//! offset 96   vmlinuz_header_address u64, offset 104 vmlinuz_header_size u64
//! offset 112  flags u32
//! offset 116  body-signature body | preamble-signature body | zero padding
//! ```
//!
//! The preamble signature covers everything up to its own body; kernel
//! preamble padding sits after the signature and is not covered.

use crate::crypto::{PublicKey, Signer};
use crate::wire;
use crate::Error;

pub const FIRMWARE_PREAMBLE_HEADER_SIZE: usize = 108;
pub const FIRMWARE_PREAMBLE_VERSION_MAJOR: u32 = 2;
pub const FIRMWARE_PREAMBLE_VERSION_MINOR: u32 = 1;

pub const KERNEL_PREAMBLE_HEADER_SIZE: usize = 116;
pub const KERNEL_PREAMBLE_VERSION_MAJOR: u32 = 2;
pub const KERNEL_PREAMBLE_VERSION_MINOR: u32 = 2;

const FW_WHAT: &str = "firmware preamble";
const KERN_WHAT: &str = "kernel preamble";

#[derive(Debug, Clone)]
pub struct FirmwarePreamble {
    pub preamble_size: u64,
    pub firmware_version: u64,
    pub kernel_subkey: PublicKey,
    /// Authoritative firmware body length.
    pub body_data_size: u64,
    pub body_signature: Vec<u8>,
    pub flags: u32,
}

/// Fields of a kernel preamble that are not derived from the body
/// signature. Split out so resigning can inherit them wholesale.
#[derive(Debug, Clone, Copy)]
pub struct KernelPreambleInfo {
    pub kernel_version: u64,
    pub body_load_address: u64,
    pub bootloader_address: u64,
    pub bootloader_size: u64,
    pub vmlinuz_header_address: u64,
    pub vmlinuz_header_size: u64,
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct KernelPreamble {
    pub preamble_size: u64,
    pub info: KernelPreambleInfo,
    pub body_data_size: u64,
    pub body_signature: Vec<u8>,
}

/// Builds a firmware preamble signed by the firmware data key.
pub fn build_firmware(
    firmware_version: u64,
    kernel_subkey: &PublicKey,
    body_signature: &[u8],
    body_data_size: u64,
    flags: u32,
    signer: &dyn Signer,
) -> Result<Vec<u8>, Error> {
    let subkey_size = kernel_subkey.key_size();
    let signed_size = FIRMWARE_PREAMBLE_HEADER_SIZE + subkey_size + body_signature.len();
    let total = signed_size + signer.sig_bytes();

    let mut blob = vec![0u8; total];
    wire::write_u64(&mut blob, 0, total as u64);
    wire::write_u32(&mut blob, 32, FIRMWARE_PREAMBLE_VERSION_MAJOR);
    wire::write_u32(&mut blob, 36, FIRMWARE_PREAMBLE_VERSION_MINOR);
    wire::write_u64(&mut blob, 40, firmware_version);
    kernel_subkey.write_at(&mut blob, 48, FIRMWARE_PREAMBLE_HEADER_SIZE);

    let body_sig_pos = FIRMWARE_PREAMBLE_HEADER_SIZE + subkey_size;
    blob[body_sig_pos..body_sig_pos + body_signature.len()].copy_from_slice(body_signature);
    wire::write_sig_header(&mut blob, 80, body_sig_pos, body_signature.len(), body_data_size);
    wire::write_u32(&mut blob, 104, flags);

    // the preamble-signature header is itself covered by the signature, so
    // it goes in before signing; only the signature body follows
    wire::write_sig_header(&mut blob, 8, signed_size, signer.sig_bytes(), signed_size as u64);
    let sig = signer.sign(&blob[..signed_size])?;
    if sig.len() != signer.sig_bytes() {
        return Err(Error::BadSignature);
    }
    blob[signed_size..signed_size + sig.len()].copy_from_slice(&sig);

    Ok(blob)
}

/// Parses a firmware preamble at the start of `buf` (which may extend past
/// it), bounds-checking all declared lengths.
pub fn parse_firmware(buf: &[u8]) -> Result<FirmwarePreamble, Error> {
    if buf.len() < FIRMWARE_PREAMBLE_HEADER_SIZE {
        return Err(Error::Truncated(FW_WHAT));
    }
    let preamble_size = wire::read_u64(buf, 0, FW_WHAT)?;
    if preamble_size < FIRMWARE_PREAMBLE_HEADER_SIZE as u64 || preamble_size > buf.len() as u64 {
        return Err(Error::Truncated(FW_WHAT));
    }
    let limit = preamble_size as usize;

    let major = wire::read_u32(buf, 32, FW_WHAT)?;
    if major != FIRMWARE_PREAMBLE_VERSION_MAJOR {
        return Err(Error::BadMagic(FW_WHAT));
    }
    let minor = wire::read_u32(buf, 36, FW_WHAT)?;
    let firmware_version = wire::read_u64(buf, 40, FW_WHAT)?;
    let kernel_subkey = PublicKey::parse_at(buf, 48, limit)?;

    let body_sig = wire::read_sig_header(buf, 80, FW_WHAT)?;
    let body_signature = wire::sig_body(buf, 80, &body_sig, limit, FW_WHAT)?.to_vec();

    let sig = wire::read_sig_header(buf, 8, FW_WHAT)?;
    wire::sig_body(buf, 8, &sig, limit, FW_WHAT)?;

    // flags arrived with header 2.1; older preambles simply lack the field
    let flags = if minor >= 1 { wire::read_u32(buf, 104, FW_WHAT)? } else { 0 };

    Ok(FirmwarePreamble {
        preamble_size,
        firmware_version,
        kernel_subkey,
        body_data_size: body_sig.data_size,
        body_signature,
        flags,
    })
}

/// Parses and signature-checks a firmware preamble against the firmware
/// data key that signed it.
pub fn verify_firmware(buf: &[u8], data_key: &PublicKey) -> Result<FirmwarePreamble, Error> {
    let preamble = parse_firmware(buf)?;
    let sig = wire::read_sig_header(buf, 8, FW_WHAT)?;
    if sig.data_size < FIRMWARE_PREAMBLE_HEADER_SIZE as u64 || sig.data_size > preamble.preamble_size
    {
        return Err(Error::Truncated(FW_WHAT));
    }
    let body = wire::sig_body(buf, 8, &sig, preamble.preamble_size as usize, FW_WHAT)?;
    data_key.verify(&buf[..sig.data_size as usize], body)?;
    Ok(preamble)
}

/// Builds a kernel preamble; `min_size` pads the result (zeros after the
/// signature) so that keyblock + preamble can fill a fixed vblock size.
pub fn build_kernel(
    info: &KernelPreambleInfo,
    body_signature: &[u8],
    body_data_size: u64,
    signer: &dyn Signer,
    min_size: u64,
) -> Result<Vec<u8>, Error> {
    let signed_size = KERNEL_PREAMBLE_HEADER_SIZE + body_signature.len();
    let natural = signed_size + signer.sig_bytes();
    let total = natural.max(min_size as usize);

    let mut blob = vec![0u8; total];
    wire::write_u64(&mut blob, 0, total as u64);
    wire::write_u32(&mut blob, 32, KERNEL_PREAMBLE_VERSION_MAJOR);
    wire::write_u32(&mut blob, 36, KERNEL_PREAMBLE_VERSION_MINOR);
    wire::write_u64(&mut blob, 40, info.kernel_version);
    wire::write_u64(&mut blob, 48, info.body_load_address);
    wire::write_u64(&mut blob, 56, info.bootloader_address);
    wire::write_u64(&mut blob, 64, info.bootloader_size);

    let body_sig_pos = KERNEL_PREAMBLE_HEADER_SIZE;
    blob[body_sig_pos..body_sig_pos + body_signature.len()].copy_from_slice(body_signature);
    wire::write_sig_header(&mut blob, 72, body_sig_pos, body_signature.len(), body_data_size);

    wire::write_u64(&mut blob, 96, info.vmlinuz_header_address);
    wire::write_u64(&mut blob, 104, info.vmlinuz_header_size);
    wire::write_u32(&mut blob, 112, info.flags);

    // the preamble-signature header is itself covered by the signature, so
    // it goes in before signing; only the signature body follows
    wire::write_sig_header(&mut blob, 8, signed_size, signer.sig_bytes(), signed_size as u64);
    let sig = signer.sign(&blob[..signed_size])?;
    if sig.len() != signer.sig_bytes() {
        return Err(Error::BadSignature);
    }
    blob[signed_size..signed_size + sig.len()].copy_from_slice(&sig);

    Ok(blob)
}

pub fn parse_kernel(buf: &[u8]) -> Result<KernelPreamble, Error> {
    if buf.len() < KERNEL_PREAMBLE_HEADER_SIZE {
        return Err(Error::Truncated(KERN_WHAT));
    }
    let preamble_size = wire::read_u64(buf, 0, KERN_WHAT)?;
    if preamble_size < KERNEL_PREAMBLE_HEADER_SIZE as u64 || preamble_size > buf.len() as u64 {
        return Err(Error::Truncated(KERN_WHAT));
    }
    let limit = preamble_size as usize;

    let major = wire::read_u32(buf, 32, KERN_WHAT)?;
    if major != KERNEL_PREAMBLE_VERSION_MAJOR {
        return Err(Error::BadMagic(KERN_WHAT));
    }
    let minor = wire::read_u32(buf, 36, KERN_WHAT)?;

    let body_sig = wire::read_sig_header(buf, 72, KERN_WHAT)?;
    let body_signature = wire::sig_body(buf, 72, &body_sig, limit, KERN_WHAT)?.to_vec();

    let sig = wire::read_sig_header(buf, 8, KERN_WHAT)?;
    wire::sig_body(buf, 8, &sig, limit, KERN_WHAT)?;

    let info = KernelPreambleInfo {
        kernel_version: wire::read_u64(buf, 40, KERN_WHAT)?,
        body_load_address: wire::read_u64(buf, 48, KERN_WHAT)?,
        bootloader_address: wire::read_u64(buf, 56, KERN_WHAT)?,
        bootloader_size: wire::read_u64(buf, 64, KERN_WHAT)?,
        vmlinuz_header_address: if minor >= 1 { wire::read_u64(buf, 96, KERN_WHAT)? } else { 0 },
        vmlinuz_header_size: if minor >= 1 { wire::read_u64(buf, 104, KERN_WHAT)? } else { 0 },
        flags: if minor >= 2 { wire::read_u32(buf, 112, KERN_WHAT)? } else { 0 },
    };

    Ok(KernelPreamble { preamble_size, info, body_data_size: body_sig.data_size, body_signature })
}

pub fn verify_kernel(buf: &[u8], data_key: &PublicKey) -> Result<KernelPreamble, Error> {
    let preamble = parse_kernel(buf)?;
    let sig = wire::read_sig_header(buf, 8, KERN_WHAT)?;
    if sig.data_size < KERNEL_PREAMBLE_HEADER_SIZE as u64 || sig.data_size > preamble.preamble_size
    {
        return Err(Error::Truncated(KERN_WHAT));
    }
    let body = wire::sig_body(buf, 8, &sig, preamble.preamble_size as usize, KERN_WHAT)?;
    data_key.verify(&buf[..sig.data_size as usize], body)?;
    Ok(preamble)
}
