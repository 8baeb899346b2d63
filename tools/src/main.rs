mod bios;
mod error;
mod extsign;
mod kernel;
mod loem;
mod mapping;
mod opts;
mod rollback;
mod sign;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[clap(name = "vbsign")]
#[clap(about = "Signing tool for verified-boot firmware and kernel images.", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sign or re-sign a firmware image, kernel, or related artifact
    #[clap(arg_required_else_help = true)]
    Sign(opts::SignArgs),
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sign(args) => {
            let options = opts::resolve(args)?;
            sign::run(&options)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::PathBuf;

    use byteorder::{ByteOrder, LittleEndian};
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use vbsign_api::{keyblock, Algorithm, PrivateKey};

    pub fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vbsign-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn test_private_key(algorithm: Algorithm) -> PrivateKey {
        let rsa = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), algorithm.rsa_bits())
            .expect("keygen failed");
        PrivateKey::from_rsa(rsa, algorithm).unwrap()
    }

    /// A data key plus the keyblock wrapping it, root-signed.
    pub struct TestIdentity {
        pub signer: PrivateKey,
        pub keyblock: Vec<u8>,
    }

    pub fn test_identity(root: &PrivateKey, key_version: u64) -> TestIdentity {
        let signer = test_private_key(Algorithm::Rsa1024Sha256);
        let keyblock = keyblock::build(
            &signer.public_key(key_version).unwrap(),
            Some(root),
            keyblock::KEYBLOCK_FLAGS_ANY,
        )
        .unwrap();
        TestIdentity { signer, keyblock }
    }

    /// A private key together with its `.vbprivk` wire bytes, for tests
    /// that exercise the file-loading paths.
    pub struct FileKey {
        pub key: PrivateKey,
        pub vbprivk: Vec<u8>,
    }

    pub fn test_file_key(algorithm: Algorithm) -> FileKey {
        let rsa = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), algorithm.rsa_bits())
            .expect("keygen failed");
        let der = rsa.to_pkcs1_der().unwrap();
        let mut vbprivk = vec![0u8; 8];
        LittleEndian::write_u64(&mut vbprivk, algorithm.id() as u64);
        vbprivk.extend_from_slice(der.as_bytes());
        let key = PrivateKey::from_rsa(rsa, algorithm).unwrap();
        FileKey { key, vbprivk }
    }

    // test image geometry
    pub const FMAP_OFFSET: usize = 0x100;
    pub const GBB_OFFSET: usize = 0x1000;
    pub const GBB_LEN: usize = 0x3000;
    pub const VBLOCK_A_OFFSET: usize = 0x4000;
    pub const VBLOCK_B_OFFSET: usize = 0x5000;
    pub const VBLOCK_LEN: usize = 0x1000;
    pub const FW_A_OFFSET: usize = 0x6000;
    pub const FW_B_OFFSET: usize = 0x8000;
    pub const FW_LEN: usize = 0x2000;
    pub const IMAGE_LEN: usize = 0xb000;

    /// Builds a BIOS image with an FMAP directory, a GBB (header minor
    /// version `gbb_minor`), empty vblocks, and the given slot bodies.
    pub fn build_bios_image(fw_a: &[u8], fw_b: &[u8], gbb_minor: u16) -> Vec<u8> {
        assert!(fw_a.len() <= FW_LEN && fw_b.len() <= FW_LEN);
        let mut image = vec![0xffu8; IMAGE_LEN];

        let areas: [(&str, u32, u32); 5] = [
            ("GBB", GBB_OFFSET as u32, GBB_LEN as u32),
            ("VBLOCK_A", VBLOCK_A_OFFSET as u32, VBLOCK_LEN as u32),
            ("VBLOCK_B", VBLOCK_B_OFFSET as u32, VBLOCK_LEN as u32),
            ("FW_MAIN_A", FW_A_OFFSET as u32, FW_LEN as u32),
            ("FW_MAIN_B", FW_B_OFFSET as u32, FW_LEN as u32),
        ];
        let mut dir = vec![0u8; 56 + areas.len() * 42];
        dir[0..8].copy_from_slice(b"__FMAP__");
        dir[8] = 1;
        dir[9] = 1;
        LittleEndian::write_u32(&mut dir[18..22], IMAGE_LEN as u32);
        dir[22..27].copy_from_slice(b"IMAGE");
        LittleEndian::write_u16(&mut dir[54..56], areas.len() as u16);
        for (i, (name, offset, size)) in areas.iter().enumerate() {
            let at = 56 + i * 42;
            LittleEndian::write_u32(&mut dir[at..at + 4], *offset);
            LittleEndian::write_u32(&mut dir[at + 4..at + 8], *size);
            dir[at + 8..at + 8 + name.len()].copy_from_slice(name.as_bytes());
        }
        image[FMAP_OFFSET..FMAP_OFFSET + dir.len()].copy_from_slice(&dir);

        // GBB: hwid at +0x80, rootkey at +0x180, recovery key at +0x1180
        let gbb = &mut image[GBB_OFFSET..GBB_OFFSET + GBB_LEN];
        gbb.fill(0);
        gbb[0..4].copy_from_slice(b"$GBB");
        LittleEndian::write_u16(&mut gbb[4..6], 1);
        LittleEndian::write_u16(&mut gbb[6..8], gbb_minor);
        LittleEndian::write_u32(&mut gbb[8..12], 128);
        LittleEndian::write_u32(&mut gbb[16..20], 0x80);
        LittleEndian::write_u32(&mut gbb[20..24], 0x100);
        LittleEndian::write_u32(&mut gbb[24..28], 0x180);
        LittleEndian::write_u32(&mut gbb[28..32], 0x1000);
        LittleEndian::write_u32(&mut gbb[40..44], 0x1180);
        LittleEndian::write_u32(&mut gbb[44..48], 0x400);
        gbb[0x80..0x89].copy_from_slice(b"OLD HWID\0");

        image[FW_A_OFFSET..FW_A_OFFSET + fw_a.len()].copy_from_slice(fw_a);
        image[FW_B_OFFSET..FW_B_OFFSET + fw_b.len()].copy_from_slice(fw_b);
        image
    }
}
