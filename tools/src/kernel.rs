//! Kernel blob assembly and kernel-partition signing.
//!
//! Blob layout (all offsets 4 KiB aligned):
//!
//! ```text
//! 0                  kernel image (x86: vmlinuz with the real-mode part
//!                    stripped; other arches: the whole file)
//! config_offset      4 KiB command-line buffer, NUL padded
//! params_offset      4 KiB zero page (x86: populated from the vmlinuz
//!                    setup header)
//! bootloader_offset  bootloader stub, padded to 4 KiB
//! ```
//!
//! The zero page's `cmd_line_ptr` and the preamble's `bootloader_address`
//! are both expressed relative to the body load address, which lets a
//! resign recover the layout from the preamble alone.

use byteorder::{ByteOrder, LittleEndian};
use vbsign_api::preamble::{self, KernelPreambleInfo};
use vbsign_api::{keyblock, Signer};

use crate::bios::check_keyblock_matches_signer;
use crate::error::SignError;

/// Default 32-bit kernel entry/load address.
pub const CROS_32BIT_ENTRY_ADDR: u64 = 0x10_0000;
/// Default vblock padding for a kernel partition.
pub const DEFAULT_PAD: u64 = 65536;

const CROS_CONFIG_SIZE: usize = 4096;
const CROS_PARAMS_SIZE: usize = 4096;
const CROS_ALIGN: usize = 4096;

// linux/x86 zero-page offsets
const SETUP_SECTS_OFFSET: usize = 0x1f1;
const SETUP_HEADER_END: usize = 0x1000;
const TYPE_OF_LOADER_OFFSET: usize = 0x210;
const RAMDISK_IMAGE_OFFSET: usize = 0x218;
const RAMDISK_SIZE_OFFSET: usize = 0x21c;
const CMD_LINE_PTR_OFFSET: usize = 0x228;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    Arm,
    Mips,
}

impl std::str::FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Arch, String> {
        match s {
            "x86" | "amd64" => Ok(Arch::X86),
            "arm" | "aarch64" => Ok(Arch::Arm),
            "mips" => Ok(Arch::Mips),
            _ => Err(format!("unknown architecture \"{}\" (x86/amd64, arm/aarch64, mips)", s)),
        }
    }
}

#[derive(Debug)]
pub struct KernelBlob {
    pub data: Vec<u8>,
    pub config_offset: usize,
    pub bootloader_offset: usize,
    pub bootloader_len: usize,
}

fn align4k(n: usize) -> usize {
    (n + CROS_ALIGN - 1) & !(CROS_ALIGN - 1)
}

/// Assembles the signable kernel body from its parts.
pub fn build_blob(
    vmlinuz: &[u8],
    bootloader: &[u8],
    cmdline: &str,
    arch: Arch,
    load_addr: u64,
) -> Result<KernelBlob, SignError> {
    let kernel: &[u8] = match arch {
        Arch::X86 => {
            if vmlinuz.len() < SETUP_HEADER_END {
                return Err(SignError::Format(vbsign_api::Error::Truncated("vmlinuz")));
            }
            // the real-mode part is (setup_sects + 1) 512-byte sectors; a
            // zero field means 4 by boot-protocol convention
            let mut setup_sects = vmlinuz[SETUP_SECTS_OFFSET] as usize;
            if setup_sects == 0 {
                setup_sects = 4;
            }
            let setup_len = (setup_sects + 1) * 512;
            if setup_len >= vmlinuz.len() {
                return Err(SignError::Format(vbsign_api::Error::Truncated("vmlinuz")));
            }
            &vmlinuz[setup_len..]
        }
        Arch::Arm | Arch::Mips => vmlinuz,
    };

    if cmdline.len() + 1 > CROS_CONFIG_SIZE {
        return Err(SignError::RegionOverrun("command line"));
    }

    let config_offset = align4k(kernel.len());
    let params_offset = config_offset + CROS_CONFIG_SIZE;
    let bootloader_offset = params_offset + CROS_PARAMS_SIZE;
    let mut data = vec![0u8; bootloader_offset + align4k(bootloader.len())];

    data[..kernel.len()].copy_from_slice(kernel);
    data[config_offset..config_offset + cmdline.len()].copy_from_slice(cmdline.as_bytes());

    let params = &mut data[params_offset..params_offset + CROS_PARAMS_SIZE];
    if arch == Arch::X86 {
        // carry the setup header over so the bootloader stub finds the
        // protocol fields where the 16-bit loader would have put them
        params[SETUP_SECTS_OFFSET..SETUP_HEADER_END]
            .copy_from_slice(&vmlinuz[SETUP_SECTS_OFFSET..SETUP_HEADER_END]);
        params[TYPE_OF_LOADER_OFFSET] = 0xff;
        LittleEndian::write_u32(&mut params[RAMDISK_IMAGE_OFFSET..RAMDISK_IMAGE_OFFSET + 4], 0);
        LittleEndian::write_u32(&mut params[RAMDISK_SIZE_OFFSET..RAMDISK_SIZE_OFFSET + 4], 0);
    }
    LittleEndian::write_u32(
        &mut params[CMD_LINE_PTR_OFFSET..CMD_LINE_PTR_OFFSET + 4],
        (load_addr + config_offset as u64) as u32,
    );

    data[bootloader_offset..bootloader_offset + bootloader.len()].copy_from_slice(bootloader);

    Ok(KernelBlob { data, config_offset, bootloader_offset, bootloader_len: bootloader.len() })
}

pub struct KernelSignRequest<'a> {
    pub keyblock: &'a [u8],
    pub signer: &'a dyn Signer,
    pub version: u64,
    pub flags: u32,
    pub load_addr: u64,
    /// Target size for `keyblock || preamble`.
    pub pad: u64,
    pub vblock_only: bool,
}

/// Signs a fresh kernel blob into a partition (`vblock || blob`) or, in
/// vblock-only mode, just the vblock.
pub fn create_kernel_partition(
    blob: &KernelBlob,
    req: &KernelSignRequest,
) -> Result<Vec<u8>, SignError> {
    check_keyblock_matches_signer(req.keyblock, req.signer)?;
    let kb_size = keyblock::parse(req.keyblock)?.size as usize;
    let kb_bytes = &req.keyblock[..kb_size];

    let body_sig = req.signer.sign(&blob.data)?;
    let info = KernelPreambleInfo {
        kernel_version: req.version,
        body_load_address: req.load_addr,
        bootloader_address: req.load_addr + blob.bootloader_offset as u64,
        bootloader_size: align4k(blob.bootloader_len) as u64,
        vmlinuz_header_address: 0,
        vmlinuz_header_size: 0,
        flags: req.flags,
    };
    let min_preamble = req.pad.saturating_sub(kb_size as u64);
    if req.pad > 0 && min_preamble == 0 {
        return Err(SignError::RegionOverrun("keyblock"));
    }
    let pre = preamble::build_kernel(&info, &body_sig, blob.data.len() as u64, req.signer, min_preamble)?;
    if req.pad > 0 && kb_size + pre.len() > req.pad as usize {
        return Err(SignError::RegionOverrun("keyblock + preamble"));
    }

    let mut out = Vec::with_capacity(kb_size + pre.len() + blob.data.len());
    out.extend_from_slice(kb_bytes);
    out.extend_from_slice(&pre);
    if !req.vblock_only {
        out.extend_from_slice(&blob.data);
    }
    Ok(out)
}

pub struct KernelResignRequest<'a> {
    pub signer: &'a dyn Signer,
    /// Replacement keyblock; `None` keeps the existing one.
    pub keyblock: Option<&'a [u8]>,
    pub version: Option<u64>,
    pub flags: Option<u32>,
    pub cmdline: Option<&'a str>,
    /// A requested load address is ignored; the blob's zero page still
    /// points at the old one, so honoring it would produce an unbootable
    /// pairing.
    pub load_addr: Option<u64>,
}

pub struct ResignedKernel {
    /// New `keyblock || preamble`, padded to the partition's original
    /// vblock size so the blob does not move.
    pub vblock: Vec<u8>,
    pub blob: Vec<u8>,
}

/// Re-signs an existing kernel partition, inheriting every attribute the
/// caller did not override.
pub fn resign_kernel_partition(
    part: &[u8],
    req: &KernelResignRequest,
) -> Result<ResignedKernel, SignError> {
    let kb = keyblock::verify(part, None)?;
    let kb_size = kb.size as usize;
    let old_pre = preamble::parse_kernel(&part[kb_size..])?;
    let vblock_size = kb_size + old_pre.preamble_size as usize;
    if vblock_size > part.len() {
        return Err(SignError::Format(vbsign_api::Error::Truncated("kernel partition")));
    }
    let mut blob = part[vblock_size..].to_vec();
    let body_size = old_pre.body_data_size as usize;
    if body_size > blob.len() {
        return Err(SignError::Format(vbsign_api::Error::Truncated("kernel body")));
    }

    let mut info = old_pre.info;
    if let Some(addr) = req.load_addr {
        if addr != info.body_load_address {
            log::warn!(
                "kernel body load address is fixed at 0x{:x} by the existing partition; \
                 ignoring the requested 0x{:x}",
                info.body_load_address,
                addr
            );
        }
    }
    if let Some(version) = req.version {
        info.kernel_version = version;
    }
    if let Some(flags) = req.flags {
        info.flags = flags;
    }

    if let Some(cmdline) = req.cmdline {
        if cmdline.len() + 1 > CROS_CONFIG_SIZE {
            return Err(SignError::RegionOverrun("command line"));
        }
        let bootloader_offset = info
            .bootloader_address
            .checked_sub(info.body_load_address)
            .ok_or(SignError::Format(vbsign_api::Error::Truncated("kernel preamble")))?
            as usize;
        let config_offset = bootloader_offset
            .checked_sub(CROS_PARAMS_SIZE + CROS_CONFIG_SIZE)
            .ok_or(SignError::Format(vbsign_api::Error::Truncated("kernel preamble")))?;
        if config_offset + CROS_CONFIG_SIZE > blob.len() {
            return Err(SignError::Format(vbsign_api::Error::Truncated("kernel body")));
        }
        let config = &mut blob[config_offset..config_offset + CROS_CONFIG_SIZE];
        config.fill(0);
        config[..cmdline.len()].copy_from_slice(cmdline.as_bytes());
    }

    let kb_bytes = match req.keyblock {
        Some(new_kb) => {
            let size = keyblock::parse(new_kb)?.size as usize;
            &new_kb[..size]
        }
        None => &part[..kb_size],
    };
    check_keyblock_matches_signer(kb_bytes, req.signer)?;

    let body_sig = req.signer.sign(&blob[..body_size])?;
    let min_preamble = vblock_size
        .checked_sub(kb_bytes.len())
        .ok_or(SignError::RegionOverrun("keyblock"))? as u64;
    let pre =
        preamble::build_kernel(&info, &body_sig, body_size as u64, req.signer, min_preamble)?;
    if kb_bytes.len() + pre.len() != vblock_size {
        return Err(SignError::RegionOverrun("keyblock + preamble"));
    }

    let mut vblock = Vec::with_capacity(vblock_size);
    vblock.extend_from_slice(kb_bytes);
    vblock.extend_from_slice(&pre);
    Ok(ResignedKernel { vblock, blob })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use vbsign_api::{preamble, Algorithm, PublicKey};

    struct Fixture {
        root_pub: PublicKey,
        id: TestIdentity,
        data_pub: PublicKey,
    }

    fn fixture() -> Fixture {
        let root = test_private_key(Algorithm::Rsa1024Sha256);
        let id = test_identity(&root, 1);
        let data_pub = id.signer.public_key(1).unwrap();
        Fixture { root_pub: root.public_key(1).unwrap(), id, data_pub }
    }

    fn request<'a>(f: &'a Fixture, load_addr: u64, pad: u64) -> KernelSignRequest<'a> {
        KernelSignRequest {
            keyblock: &f.id.keyblock,
            signer: &f.id.signer,
            version: 2,
            flags: 0,
            load_addr,
            pad,
            vblock_only: false,
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
    }

    #[test]
    fn create_arm_partition() {
        let f = fixture();
        let vmlinuz = pattern(0x8000, 1);
        let bootloader = vec![0xee; 0x1000];
        let blob =
            build_blob(&vmlinuz, &bootloader, "console=tty0", Arch::Arm, 0x20_0000).unwrap();

        assert_eq!(blob.config_offset, 0x8000);
        assert_eq!(blob.bootloader_offset, 0x8000 + 0x2000);
        assert_eq!(&blob.data[..vmlinuz.len()], &vmlinuz[..]);
        assert_eq!(&blob.data[blob.config_offset..blob.config_offset + 13], b"console=tty0\0");
        let params_offset = blob.config_offset + CROS_CONFIG_SIZE;
        let cmd_line_ptr = LittleEndian::read_u32(
            &blob.data[params_offset + CMD_LINE_PTR_OFFSET..params_offset + CMD_LINE_PTR_OFFSET + 4],
        );
        assert_eq!(cmd_line_ptr as u64, 0x20_0000 + blob.config_offset as u64);

        let part = create_kernel_partition(&blob, &request(&f, 0x20_0000, 0x10000)).unwrap();
        let kb = keyblock::verify(&part, Some(&f.root_pub)).unwrap();
        let pre = preamble::verify_kernel(&part[kb.size as usize..], &f.data_pub).unwrap();
        assert_eq!(kb.size + pre.preamble_size, 0x10000);
        assert_eq!(pre.info.kernel_version, 2);
        assert_eq!(pre.info.body_load_address, 0x20_0000);
        assert_eq!(pre.info.bootloader_address, 0x20_0000 + blob.bootloader_offset as u64);
        assert_eq!(pre.body_data_size as usize, blob.data.len());
        assert_eq!(&part[0x10000..], &blob.data[..]);
        f.data_pub.verify(&blob.data, &pre.body_signature).unwrap();
    }

    #[test]
    fn resign_preserves_load_address() {
        let f = fixture();
        let blob =
            build_blob(&pattern(0x2000, 7), &[0xbb; 0x200], "one", Arch::Arm, 0x20_0000).unwrap();
        let part = create_kernel_partition(&blob, &request(&f, 0x20_0000, 0x10000)).unwrap();

        let resigned = resign_kernel_partition(
            &part,
            &KernelResignRequest {
                signer: &f.id.signer,
                keyblock: None,
                version: Some(3),
                flags: None,
                cmdline: None,
                load_addr: Some(0xdead_beef), // must be ignored
            },
        )
        .unwrap();

        assert_eq!(resigned.vblock.len(), 0x10000);
        assert_eq!(resigned.blob, blob.data);
        let kb = keyblock::verify(&resigned.vblock, Some(&f.root_pub)).unwrap();
        let pre =
            preamble::verify_kernel(&resigned.vblock[kb.size as usize..], &f.data_pub).unwrap();
        assert_eq!(pre.info.kernel_version, 3);
        assert_eq!(pre.info.body_load_address, 0x20_0000);
    }

    #[test]
    fn resign_replaces_cmdline() {
        let f = fixture();
        let blob =
            build_blob(&pattern(0x2000, 9), &[0xbb; 0x200], "old args", Arch::Arm, 0x10_0000)
                .unwrap();
        let part = create_kernel_partition(&blob, &request(&f, 0x10_0000, 0x8000)).unwrap();

        let resigned = resign_kernel_partition(
            &part,
            &KernelResignRequest {
                signer: &f.id.signer,
                keyblock: None,
                version: None,
                flags: None,
                cmdline: Some("root=/dev/sda2"),
                load_addr: None,
            },
        )
        .unwrap();

        let config = &resigned.blob[blob.config_offset..blob.config_offset + CROS_CONFIG_SIZE];
        assert_eq!(&config[..15], b"root=/dev/sda2\0");
        assert!(config[15..].iter().all(|&b| b == 0));
        // the body signature covers the rewritten blob
        let kb = keyblock::verify(&resigned.vblock, Some(&f.root_pub)).unwrap();
        let pre =
            preamble::verify_kernel(&resigned.vblock[kb.size as usize..], &f.data_pub).unwrap();
        f.data_pub.verify(&resigned.blob[..pre.body_data_size as usize], &pre.body_signature)
            .unwrap();
    }

    #[test]
    fn x86_vmlinuz_is_stripped() {
        let mut vmlinuz = pattern(0x3000, 3);
        vmlinuz[SETUP_SECTS_OFFSET] = 4; // 5 * 512 = 0xa00 of real-mode code
        vmlinuz[0xa00] = 0x77;
        let blob = build_blob(&vmlinuz, &[], "x", Arch::X86, CROS_32BIT_ENTRY_ADDR).unwrap();

        assert_eq!(blob.data[0], 0x77);
        assert_eq!(blob.config_offset, align4k(0x3000 - 0xa00));
        let params_offset = blob.config_offset + CROS_CONFIG_SIZE;
        let params = &blob.data[params_offset..params_offset + CROS_PARAMS_SIZE];
        assert_eq!(params[SETUP_SECTS_OFFSET], 4); // header carried over
        assert_eq!(params[TYPE_OF_LOADER_OFFSET], 0xff);
        let cmd_line_ptr = LittleEndian::read_u32(
            &params[CMD_LINE_PTR_OFFSET..CMD_LINE_PTR_OFFSET + 4],
        );
        assert_eq!(cmd_line_ptr as u64, CROS_32BIT_ENTRY_ADDR + blob.config_offset as u64);
    }

    #[test]
    fn vblock_only_matches_partition_head() {
        let f = fixture();
        let blob = build_blob(&pattern(0x1000, 5), &[], "", Arch::Mips, 0x10_0000).unwrap();
        let full = create_kernel_partition(&blob, &request(&f, 0x10_0000, 0x8000)).unwrap();
        let mut req = request(&f, 0x10_0000, 0x8000);
        req.vblock_only = true;
        let head = create_kernel_partition(&blob, &req).unwrap();
        // PKCS#1 v1.5 signing is deterministic, so the two runs agree
        assert_eq!(head.len(), 0x8000);
        assert_eq!(head, &full[..0x8000]);
    }

    #[test]
    fn keyblock_bigger_than_pad_is_rejected() {
        let f = fixture();
        let blob = build_blob(&pattern(0x1000, 5), &[], "", Arch::Arm, 0x10_0000).unwrap();
        let err = create_kernel_partition(&blob, &request(&f, 0x10_0000, 0x100)).unwrap_err();
        assert!(matches!(err, SignError::RegionOverrun(_)));
    }

    #[test]
    fn oversize_cmdline_rejected() {
        let long = "x".repeat(CROS_CONFIG_SIZE);
        let err =
            build_blob(&pattern(0x1000, 5), &[], &long, Arch::Arm, 0x10_0000).unwrap_err();
        assert!(matches!(err, SignError::RegionOverrun("command line")));
    }
}
