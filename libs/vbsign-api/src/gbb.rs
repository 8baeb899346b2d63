//! GBB editor: in-place access to the board-metadata region (HWID, root
//! key, recovery key, flags).
//!
//! Header (128 bytes, offsets relative to the region):
//!
//! ```text
//! offset 0   signature "$GBB"
//! offset 4   major_version u16, minor_version u16
//! offset 8   header_size u32
//! offset 12  flags u32                  (valid from 1.1)
//! offset 16  hwid_offset u32, hwid_size u32
//! offset 24  rootkey_offset u32, rootkey_size u32
//! offset 32  bmpfv_offset u32, bmpfv_size u32
//! offset 40  recovery_key_offset u32, recovery_key_size u32
//! offset 48  hwid_digest[32]            (valid from 1.2)
//! ```

use sha2::{Digest, Sha256};

use crate::crypto::PublicKey;
use crate::wire::{self, VB_PUBLIC_KEY_SIZE};
use crate::Error;

pub const GBB_SIGNATURE: &[u8; 4] = b"$GBB";
pub const GBB_HEADER_SIZE: usize = 128;
pub const GBB_MAJOR_VERSION: u16 = 1;
/// Minimum minor version that carries the flags word.
pub const GBB_MINOR_VERSION_FLAGS: u16 = 1;
/// Minimum minor version that carries the HWID digest.
pub const GBB_MINOR_VERSION_HWID_DIGEST: u16 = 2;

const WHAT: &str = "GBB";
const HWID_DIGEST_OFFSET: usize = 48;

/// An editor over a mutable GBB region. Sub-region bounds are validated
/// once at parse time; every setter re-checks the payload against its
/// reserved space.
pub struct Gbb<'a> {
    region: &'a mut [u8],
    minor_version: u16,
    hwid_offset: usize,
    hwid_size: usize,
    rootkey_offset: usize,
    rootkey_size: usize,
    recovery_key_offset: usize,
    recovery_key_size: usize,
}

impl<'a> Gbb<'a> {
    pub fn parse(region: &'a mut [u8]) -> Result<Gbb<'a>, Error> {
        if region.len() < GBB_HEADER_SIZE {
            return Err(Error::Truncated(WHAT));
        }
        if &region[0..4] != GBB_SIGNATURE {
            return Err(Error::BadMagic(WHAT));
        }
        let major = wire::read_u16(region, 4, WHAT)?;
        if major != GBB_MAJOR_VERSION {
            return Err(Error::BadMagic(WHAT));
        }
        let minor_version = wire::read_u16(region, 6, WHAT)?;
        let header_size = wire::read_u32(region, 8, WHAT)? as usize;
        if header_size < GBB_HEADER_SIZE || header_size > region.len() {
            return Err(Error::Truncated(WHAT));
        }

        let sub = |off, size| -> Result<(usize, usize), Error> {
            let offset = wire::read_u32(region, off, WHAT)? as usize;
            let len = wire::read_u32(region, size, WHAT)? as usize;
            if offset.checked_add(len).map_or(true, |end| end > region.len()) {
                return Err(Error::Truncated(WHAT));
            }
            Ok((offset, len))
        };
        let (hwid_offset, hwid_size) = sub(16, 20)?;
        let (rootkey_offset, rootkey_size) = sub(24, 28)?;
        let (recovery_key_offset, recovery_key_size) = sub(40, 44)?;

        Ok(Gbb {
            region,
            minor_version,
            hwid_offset,
            hwid_size,
            rootkey_offset,
            rootkey_size,
            recovery_key_offset,
            recovery_key_size,
        })
    }

    pub fn hwid(&self) -> String {
        wire::read_name(self.region, self.hwid_offset, self.hwid_size)
    }

    /// Replaces the HWID. The string plus its terminator must fit the
    /// reserved slot; GBB 1.2+ also refreshes the HWID digest.
    pub fn set_hwid(&mut self, hwid: &str) -> Result<(), Error> {
        let bytes = hwid.as_bytes();
        if bytes.len() + 1 > self.hwid_size {
            return Err(Error::GbbFull("HWID"));
        }
        let slot = &mut self.region[self.hwid_offset..self.hwid_offset + self.hwid_size];
        slot.fill(0);
        slot[..bytes.len()].copy_from_slice(bytes);

        if self.minor_version >= GBB_MINOR_VERSION_HWID_DIGEST {
            let digest = Sha256::digest(bytes);
            self.region[HWID_DIGEST_OFFSET..HWID_DIGEST_OFFSET + 32].copy_from_slice(&digest);
        }
        Ok(())
    }

    pub fn rootkey(&self) -> Result<PublicKey, Error> {
        PublicKey::parse_at(self.region, self.rootkey_offset, self.rootkey_offset + self.rootkey_size)
    }

    pub fn recovery_key(&self) -> Result<PublicKey, Error> {
        PublicKey::parse_at(
            self.region,
            self.recovery_key_offset,
            self.recovery_key_offset + self.recovery_key_size,
        )
    }

    pub fn set_rootkey(&mut self, key: &PublicKey) -> Result<(), Error> {
        Self::set_key(self.region, self.rootkey_offset, self.rootkey_size, key, "root key")
    }

    pub fn set_recovery_key(&mut self, key: &PublicKey) -> Result<(), Error> {
        Self::set_key(
            self.region,
            self.recovery_key_offset,
            self.recovery_key_size,
            key,
            "recovery key",
        )
    }

    fn set_key(
        region: &mut [u8],
        offset: usize,
        size: usize,
        key: &PublicKey,
        what: &'static str,
    ) -> Result<(), Error> {
        if key.packed_size() > size {
            return Err(Error::GbbFull(what));
        }
        let slot = &mut region[offset..offset + size];
        slot.fill(0);
        key.write_at(slot, 0, VB_PUBLIC_KEY_SIZE);
        Ok(())
    }

    pub fn flags(&self) -> Result<u32, Error> {
        if self.minor_version < GBB_MINOR_VERSION_FLAGS {
            return Err(Error::UnsupportedField("flags"));
        }
        wire::read_u32(self.region, 12, WHAT)
    }

    /// Replaces the flag word. Pre-1.1 headers have no flags field; the
    /// caller downgrades the error to a warning.
    pub fn set_flags(&mut self, flags: u32) -> Result<(), Error> {
        if self.minor_version < GBB_MINOR_VERSION_FLAGS {
            return Err(Error::UnsupportedField("flags"));
        }
        wire::write_u32(self.region, 12, flags);
        Ok(())
    }
}
