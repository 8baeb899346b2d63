//! Key material and signing primitives.
//!
//! Algorithm identifiers select an RSA modulus size and a digest; signatures
//! are RSA-PKCS#1 v1.5 over the digest, so the signature length always
//! equals the modulus length. Public keys travel in a packed form that
//! carries the Montgomery constants the boot ROM wants precomputed
//! (`-n^-1 mod 2^32` and `R^2 mod n`).

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::wire::{self, VB_PUBLIC_KEY_SIZE};
use crate::Error;

/// Number of defined algorithm identifiers.
pub const NUM_ALGORITHMS: u64 = 12;

/// Largest supported modulus, in bits.
const MAX_RSA_BITS: usize = 8192;

const RSA_F4: u32 = 65537;

/// Signing algorithm identifiers. The id encodes (modulus size, digest):
/// `id / 3` selects RSA-1024/2048/4096/8192 and `id % 3` selects
/// SHA-1/SHA-256/SHA-512.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Algorithm {
    Rsa1024Sha1 = 0,
    Rsa1024Sha256 = 1,
    Rsa1024Sha512 = 2,
    Rsa2048Sha1 = 3,
    Rsa2048Sha256 = 4,
    Rsa2048Sha512 = 5,
    Rsa4096Sha1 = 6,
    Rsa4096Sha256 = 7,
    Rsa4096Sha512 = 8,
    Rsa8192Sha1 = 9,
    Rsa8192Sha256 = 10,
    Rsa8192Sha512 = 11,
}

impl Algorithm {
    pub fn from_id(id: u64) -> Result<Algorithm, Error> {
        use Algorithm::*;
        Ok(match id {
            0 => Rsa1024Sha1,
            1 => Rsa1024Sha256,
            2 => Rsa1024Sha512,
            3 => Rsa2048Sha1,
            4 => Rsa2048Sha256,
            5 => Rsa2048Sha512,
            6 => Rsa4096Sha1,
            7 => Rsa4096Sha256,
            8 => Rsa4096Sha512,
            9 => Rsa8192Sha1,
            10 => Rsa8192Sha256,
            11 => Rsa8192Sha512,
            _ => return Err(Error::BadAlgorithm(id)),
        })
    }

    pub fn id(self) -> u32 {
        self as u32
    }

    /// RSA modulus size in bits.
    pub fn rsa_bits(self) -> usize {
        1024 << (self.id() / 3)
    }

    /// Signature length in bytes.
    pub fn sig_bytes(self) -> usize {
        self.rsa_bits() / 8
    }

    pub fn digest_name(self) -> &'static str {
        match self.id() % 3 {
            0 => "sha1",
            1 => "sha256",
            _ => "sha512",
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self.id() % 3 {
            0 => Sha1::digest(data).to_vec(),
            1 => Sha256::digest(data).to_vec(),
            _ => Sha512::digest(data).to_vec(),
        }
    }

    fn padding(self) -> Pkcs1v15Sign {
        match self.id() % 3 {
            0 => Pkcs1v15Sign::new::<Sha1>(),
            1 => Pkcs1v15Sign::new::<Sha256>(),
            _ => Pkcs1v15Sign::new::<Sha512>(),
        }
    }
}

/// Anything that can produce a body/structure signature: a local private
/// key, or the external-signer adapter in the tools crate.
pub trait Signer {
    fn algorithm(&self) -> Algorithm;
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error>;

    fn sig_bytes(&self) -> usize {
        self.algorithm().sig_bytes()
    }
}

/// A packed public key: algorithm, key version, and the precomputed
/// modulus data (`arrsize`, `n0inv`, `n[]`, `rr[]`) exactly as it is laid
/// out on disk and inside keyblocks/preambles.
#[derive(Debug, Clone)]
pub struct PublicKey {
    pub algorithm: Algorithm,
    pub version: u64,
    key_data: Vec<u8>,
}

impl PublicKey {
    /// Packs an RSA public key, computing the Montgomery constants.
    pub fn from_rsa(key: &RsaPublicKey, algorithm: Algorithm, version: u64) -> Result<PublicKey, Error> {
        let bits = algorithm.rsa_bits();
        if key.n().bits() != bits {
            return Err(Error::AlgoMismatch(format!(
                "key modulus is {} bits, algorithm {} wants {}",
                key.n().bits(),
                algorithm.id(),
                bits
            )));
        }
        if key.e() != &BigUint::from(RSA_F4) {
            return Err(Error::BadKey("public exponent must be 65537".to_string()));
        }
        let arrsize = bits / 32;
        let mut data = vec![0u8; 8 + 8 * arrsize];
        LittleEndian::write_u32(&mut data[0..4], arrsize as u32);

        let n_bytes = key.n().to_bytes_le();
        data[8..8 + n_bytes.len()].copy_from_slice(&n_bytes);
        let n0 = LittleEndian::read_u32(&data[8..12]);
        LittleEndian::write_u32(&mut data[4..8], mont_n0inv(n0));

        let rr = (BigUint::from(1u32) << (2 * bits)) % key.n();
        let rr_bytes = rr.to_bytes_le();
        let rr_off = 8 + bits / 8;
        data[rr_off..rr_off + rr_bytes.len()].copy_from_slice(&rr_bytes);

        Ok(PublicKey { algorithm, version, key_data: data })
    }

    /// Parses a `VbPublicKey` header at `pos` plus the key data it points
    /// to. `limit` bounds the enclosing structure.
    pub fn parse_at(buf: &[u8], pos: usize, limit: usize) -> Result<PublicKey, Error> {
        const WHAT: &str = "public key";
        let key_offset = wire::read_u64(buf, pos, WHAT)?;
        let key_size = wire::read_u64(buf, pos + 8, WHAT)?;
        let algorithm = Algorithm::from_id(wire::read_u64(buf, pos + 16, WHAT)?)?;
        let version = wire::read_u64(buf, pos + 24, WHAT)?;

        let start = (pos as u64).checked_add(key_offset).ok_or(Error::Truncated(WHAT))?;
        let end = start.checked_add(key_size).ok_or(Error::Truncated(WHAT))?;
        if end > limit as u64 || end > buf.len() as u64 {
            return Err(Error::Truncated(WHAT));
        }
        let key_data = buf[start as usize..end as usize].to_vec();

        if key_data.len() < 8 {
            return Err(Error::BadKey("packed key data too short".to_string()));
        }
        let arrsize = LittleEndian::read_u32(&key_data[0..4]) as usize;
        if key_data.len() != 8 + 8 * arrsize {
            return Err(Error::BadKey(format!(
                "packed key data is {} bytes, arrsize {} wants {}",
                key_data.len(),
                arrsize,
                8 + 8 * arrsize
            )));
        }
        if arrsize * 32 != algorithm.rsa_bits() {
            return Err(Error::AlgoMismatch(format!(
                "key data is {} words, algorithm {} wants {}",
                arrsize,
                algorithm.id(),
                algorithm.rsa_bits() / 32
            )));
        }
        Ok(PublicKey { algorithm, version, key_data })
    }

    /// Parses a standalone `.vbpubk` blob (header at offset 0).
    pub fn parse(buf: &[u8]) -> Result<PublicKey, Error> {
        PublicKey::parse_at(buf, 0, buf.len())
    }

    pub fn read_file(path: &Path) -> Result<PublicKey, Error> {
        let buf = std::fs::read(path)?;
        PublicKey::parse(&buf)
    }

    /// Length of the packed key data, excluding the 32-byte header.
    pub fn key_size(&self) -> usize {
        self.key_data.len()
    }

    /// Header plus data, as stored in a `.vbpubk` file.
    pub fn packed_size(&self) -> usize {
        VB_PUBLIC_KEY_SIZE + self.key_data.len()
    }

    /// Writes the header at `pos` and the key data at `data_pos`.
    pub fn write_at(&self, buf: &mut [u8], pos: usize, data_pos: usize) {
        wire::write_u64(buf, pos, (data_pos - pos) as u64);
        wire::write_u64(buf, pos + 8, self.key_data.len() as u64);
        wire::write_u64(buf, pos + 16, self.algorithm.id() as u64);
        wire::write_u64(buf, pos + 24, self.version);
        buf[data_pos..data_pos + self.key_data.len()].copy_from_slice(&self.key_data);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.packed_size()];
        self.write_at(&mut buf, 0, VB_PUBLIC_KEY_SIZE);
        buf
    }

    /// Verifies `sig` over `data` with this key's algorithm.
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> Result<(), Error> {
        if sig.len() != self.algorithm.sig_bytes() {
            return Err(Error::BadSignature);
        }
        let digest = self.algorithm.digest(data);
        self.rsa_key()?
            .verify(self.algorithm.padding(), &digest, sig)
            .map_err(|_| Error::BadSignature)
    }

    fn rsa_key(&self) -> Result<RsaPublicKey, Error> {
        let arrsize = LittleEndian::read_u32(&self.key_data[0..4]) as usize;
        let n = BigUint::from_bytes_le(&self.key_data[8..8 + 4 * arrsize]);
        RsaPublicKey::new_with_max_size(n, BigUint::from(RSA_F4), MAX_RSA_BITS)
            .map_err(|e| Error::BadKey(format!("unusable public key: {}", e)))
    }
}

/// A private signing key with its declared algorithm.
pub struct PrivateKey {
    pub algorithm: Algorithm,
    rsa: RsaPrivateKey,
}

impl PrivateKey {
    pub fn from_rsa(rsa: RsaPrivateKey, algorithm: Algorithm) -> Result<PrivateKey, Error> {
        if rsa.n().bits() != algorithm.rsa_bits() {
            return Err(Error::AlgoMismatch(format!(
                "private key modulus is {} bits, algorithm {} wants {}",
                rsa.n().bits(),
                algorithm.id(),
                algorithm.rsa_bits()
            )));
        }
        Ok(PrivateKey { algorithm, rsa })
    }

    /// Parses the private-key wire format: a u64 algorithm id followed by a
    /// PKCS#1 DER `RSAPrivateKey`.
    pub fn parse(buf: &[u8]) -> Result<PrivateKey, Error> {
        if buf.len() < 8 {
            return Err(Error::Truncated("private key"));
        }
        let algorithm = Algorithm::from_id(LittleEndian::read_u64(&buf[0..8]))?;
        let rsa = RsaPrivateKey::from_pkcs1_der(&buf[8..])
            .map_err(|e| Error::BadKey(format!("undecodable private key: {}", e)))?;
        PrivateKey::from_rsa(rsa, algorithm)
    }

    pub fn read_file(path: &Path) -> Result<PrivateKey, Error> {
        let buf = std::fs::read(path)?;
        PrivateKey::parse(&buf)
    }

    /// Loads a PEM private key (PKCS#1 or PKCS#8) with an explicitly
    /// supplied algorithm, since PEM files do not carry one.
    pub fn from_pem_file(path: &Path, algorithm: Algorithm) -> Result<PrivateKey, Error> {
        let text = std::fs::read_to_string(path)?;
        let rsa = if text.contains("BEGIN RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_pem(&text)
                .map_err(|e| Error::BadKey(format!("undecodable PEM key: {}", e)))?
        } else {
            RsaPrivateKey::from_pkcs8_pem(&text)
                .map_err(|e| Error::BadKey(format!("undecodable PEM key: {}", e)))?
        };
        PrivateKey::from_rsa(rsa, algorithm)
    }

    /// The packed public half, stamped with `version`.
    pub fn public_key(&self, version: u64) -> Result<PublicKey, Error> {
        PublicKey::from_rsa(&self.rsa.to_public_key(), self.algorithm, version)
    }
}

impl Signer for PrivateKey {
    fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let digest = self.algorithm.digest(data);
        self.rsa
            .sign(self.algorithm.padding(), &digest)
            .map_err(|e| Error::BadKey(format!("RSA signing failed: {}", e)))
    }
}

/// Newton's iteration for `-n^-1 mod 2^32`; five rounds double the valid
/// bits from 1 to 32 for any odd modulus.
fn mont_n0inv(n0: u32) -> u32 {
    let mut inv: u32 = 1;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(n0.wrapping_mul(inv)));
    }
    inv.wrapping_neg()
}
