//! Keyblock: a signed wrapper around a public data key plus a flag word.
//!
//! Layout (`key_block_size` bytes total):
//!
//! ```text
//! offset 0    magic "CHROMEOS"
//! offset 8    header_version_major u32, header_version_minor u32
//! offset 16   key_block_size u64
//! offset 24   key_block_signature VbSignature   (RSA by the root key)
//! offset 48   key_block_checksum  VbSignature   (SHA-512)
//! offset 72   key_block_flags u64
//! offset 80   data_key VbPublicKey
//! offset 112  data key body | checksum body | signature body
//! ```
//!
//! Both the checksum and the signature cover the header plus the data key
//! body. A keyblock built without a signer carries `sig_size == 0` and can
//! only be validated by checksum.

use sha2::{Digest, Sha512};

use crate::crypto::{PublicKey, Signer};
use crate::wire;
use crate::Error;

pub const KEYBLOCK_MAGIC: &[u8; 8] = b"CHROMEOS";
pub const KEYBLOCK_HEADER_SIZE: usize = 112;
pub const KEYBLOCK_VERSION_MAJOR: u32 = 2;
pub const KEYBLOCK_VERSION_MINOR: u32 = 1;

pub const KEYBLOCK_FLAG_DEVELOPER_0: u64 = 0x1;
pub const KEYBLOCK_FLAG_DEVELOPER_1: u64 = 0x2;
pub const KEYBLOCK_FLAG_RECOVERY_0: u64 = 0x4;
pub const KEYBLOCK_FLAG_RECOVERY_1: u64 = 0x8;

/// Valid in every boot mode; the default when the caller does not care.
pub const KEYBLOCK_FLAGS_ANY: u64 = KEYBLOCK_FLAG_DEVELOPER_0
    | KEYBLOCK_FLAG_DEVELOPER_1
    | KEYBLOCK_FLAG_RECOVERY_0
    | KEYBLOCK_FLAG_RECOVERY_1;

const CHECKSUM_SIZE: usize = 64;
const WHAT: &str = "keyblock";

/// A parsed keyblock.
#[derive(Debug, Clone)]
pub struct Keyblock {
    pub flags: u64,
    pub data_key: PublicKey,
    /// Declared total size, including signature bodies.
    pub size: u64,
}

/// Packs `data_key` and `flags` into a keyblock, checksums it, and signs it
/// with `signer` when one is supplied.
pub fn build(
    data_key: &PublicKey,
    signer: Option<&dyn Signer>,
    flags: u64,
) -> Result<Vec<u8>, Error> {
    let key_size = data_key.key_size();
    let signed_size = KEYBLOCK_HEADER_SIZE + key_size;
    let sig_size = signer.map(|s| s.sig_bytes()).unwrap_or(0);
    let total = signed_size + CHECKSUM_SIZE + sig_size;

    let mut blob = vec![0u8; total];
    blob[0..8].copy_from_slice(KEYBLOCK_MAGIC);
    wire::write_u32(&mut blob, 8, KEYBLOCK_VERSION_MAJOR);
    wire::write_u32(&mut blob, 12, KEYBLOCK_VERSION_MINOR);
    wire::write_u64(&mut blob, 16, total as u64);
    wire::write_u64(&mut blob, 72, flags);
    data_key.write_at(&mut blob, 80, KEYBLOCK_HEADER_SIZE);

    // both signature headers live inside the signed region, so they must
    // be in place before anything is hashed; only the bodies come later
    let sig_pos = signed_size + CHECKSUM_SIZE;
    wire::write_sig_header(&mut blob, 48, signed_size, CHECKSUM_SIZE, signed_size as u64);
    wire::write_sig_header(&mut blob, 24, sig_pos, sig_size, signed_size as u64);

    let checksum = Sha512::digest(&blob[..signed_size]);
    blob[signed_size..signed_size + CHECKSUM_SIZE].copy_from_slice(&checksum);

    if let Some(signer) = signer {
        let sig = signer.sign(&blob[..signed_size])?;
        if sig.len() != sig_size {
            return Err(Error::BadSignature);
        }
        blob[sig_pos..sig_pos + sig_size].copy_from_slice(&sig);
    }

    Ok(blob)
}

/// Parses a keyblock at the start of `buf`, bounds-checking every declared
/// length against the buffer before touching the contents. `buf` may extend
/// past the keyblock (e.g. a whole VBLOCK region).
pub fn parse(buf: &[u8]) -> Result<Keyblock, Error> {
    if buf.len() < KEYBLOCK_HEADER_SIZE {
        return Err(Error::Truncated(WHAT));
    }
    if &buf[0..8] != KEYBLOCK_MAGIC {
        return Err(Error::BadMagic(WHAT));
    }
    let major = wire::read_u32(buf, 8, WHAT)?;
    if major != KEYBLOCK_VERSION_MAJOR {
        return Err(Error::BadMagic(WHAT));
    }
    let size = wire::read_u64(buf, 16, WHAT)?;
    if size < KEYBLOCK_HEADER_SIZE as u64 || size > buf.len() as u64 {
        return Err(Error::Truncated(WHAT));
    }
    let limit = size as usize;

    let sig = wire::read_sig_header(buf, 24, WHAT)?;
    wire::sig_body(buf, 24, &sig, limit, WHAT)?;
    let checksum = wire::read_sig_header(buf, 48, WHAT)?;
    wire::sig_body(buf, 48, &checksum, limit, WHAT)?;

    let flags = wire::read_u64(buf, 72, WHAT)?;
    let data_key = PublicKey::parse_at(buf, 80, limit)?;

    // key_block_size must leave room for everything it claims to hold
    let min = KEYBLOCK_HEADER_SIZE + data_key.key_size() + checksum.sig_size as usize
        + sig.sig_size as usize;
    if size < min as u64 {
        return Err(Error::Truncated(WHAT));
    }

    Ok(Keyblock { flags, data_key, size })
}

/// Parses and validates a keyblock. With a trusted root key, the RSA
/// signature is checked; without one, only the SHA-512 checksum is.
pub fn verify(buf: &[u8], root: Option<&PublicKey>) -> Result<Keyblock, Error> {
    let keyblock = parse(buf)?;
    match root {
        Some(root) => {
            let sig = wire::read_sig_header(buf, 24, WHAT)?;
            if sig.data_size < KEYBLOCK_HEADER_SIZE as u64 || sig.data_size > keyblock.size {
                return Err(Error::Truncated(WHAT));
            }
            let body = wire::sig_body(buf, 24, &sig, keyblock.size as usize, WHAT)?;
            root.verify(&buf[..sig.data_size as usize], body)?;
        }
        None => {
            let checksum = wire::read_sig_header(buf, 48, WHAT)?;
            if checksum.sig_size != CHECKSUM_SIZE as u64
                || checksum.data_size < KEYBLOCK_HEADER_SIZE as u64
                || checksum.data_size > keyblock.size
            {
                return Err(Error::Truncated(WHAT));
            }
            let body = wire::sig_body(buf, 48, &checksum, keyblock.size as usize, WHAT)?;
            let computed = Sha512::digest(&buf[..checksum.data_size as usize]);
            if body != computed.as_slice() {
                return Err(Error::BadSignature);
            }
        }
    }
    Ok(keyblock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Algorithm;
    use crate::testutil::private_key;

    #[test]
    fn build_verify_against_root() {
        let root = private_key(Algorithm::Rsa1024Sha256);
        let data = private_key(Algorithm::Rsa1024Sha512);
        let data_pub = data.public_key(2).unwrap();

        let blob = build(&data_pub, Some(&root), KEYBLOCK_FLAG_DEVELOPER_0).unwrap();
        let kb = verify(&blob, Some(&root.public_key(1).unwrap())).unwrap();
        assert_eq!(kb.flags, KEYBLOCK_FLAG_DEVELOPER_0);
        assert_eq!(kb.data_key.algorithm, Algorithm::Rsa1024Sha512);
        assert_eq!(kb.data_key.version, 2);
        assert_eq!(kb.size as usize, blob.len());

        // checksum-only validation also passes
        verify(&blob, None).unwrap();
    }

    #[test]
    fn wrong_root_rejected() {
        let root = private_key(Algorithm::Rsa1024Sha256);
        let other = private_key(Algorithm::Rsa1024Sha256);
        let data_pub = private_key(Algorithm::Rsa1024Sha256).public_key(1).unwrap();

        let blob = build(&data_pub, Some(&root), 0).unwrap();
        assert!(matches!(
            verify(&blob, Some(&other.public_key(1).unwrap())),
            Err(Error::BadSignature)
        ));
    }

    #[test]
    fn tampered_flags_fail_checksum() {
        let data_pub = private_key(Algorithm::Rsa1024Sha256).public_key(1).unwrap();
        let mut blob = build(&data_pub, None, KEYBLOCK_FLAGS_ANY).unwrap();
        blob[72] ^= 1;
        assert!(matches!(verify(&blob, None), Err(Error::BadSignature)));
    }

    #[test]
    fn unsigned_keyblock_has_empty_signature() {
        let data_pub = private_key(Algorithm::Rsa1024Sha256).public_key(1).unwrap();
        let blob = build(&data_pub, None, 0).unwrap();
        let kb = parse(&blob).unwrap();
        assert_eq!(kb.size as usize, blob.len());
        assert_eq!(blob.len(), KEYBLOCK_HEADER_SIZE + data_pub.key_size() + 64);
    }

    #[test]
    fn oversize_length_fields_rejected() {
        let data_pub = private_key(Algorithm::Rsa1024Sha256).public_key(1).unwrap();
        let mut blob = build(&data_pub, None, 0).unwrap();
        // claim a key_block_size past the end of the buffer
        let oversize = (blob.len() + 1) as u64;
        wire::write_u64(&mut blob, 16, oversize);
        assert!(matches!(parse(&blob), Err(Error::Truncated(_))));
    }
}
