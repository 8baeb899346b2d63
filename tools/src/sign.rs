//! Operation driver: loads key material, owns the mapping lifecycle, and
//! dispatches to the per-type signing paths.

use std::path::PathBuf;

use vbsign_api::fmap::{self, Fmap};
use vbsign_api::gbb::Gbb;
use vbsign_api::{keyblock, Error as FormatError, PrivateKey, PublicKey, Signer};

use crate::bios::{self, BiosSignRequest};
use crate::error::SignError;
use crate::extsign::ExternalSigner;
use crate::kernel::{self, KernelResignRequest, KernelSignRequest, CROS_32BIT_ENTRY_ADDR};
use crate::loem;
use crate::mapping::SignMapping;
use crate::opts::{InputKind, SignOptions};
use crate::rollback;

pub fn run(opts: &SignOptions) -> Result<(), SignError> {
    match opts.kind {
        InputKind::Bios => sign_bios_image(opts),
        InputKind::Firmware => sign_firmware_file(opts),
        InputKind::Kernel => sign_vmlinuz(opts),
        InputKind::KernelPartition => resign_partition(opts),
        InputKind::Pubkey => wrap_pubkey(opts),
    }
}

fn require<'a>(path: &'a Option<PathBuf>, what: &'static str) -> Result<&'a PathBuf, SignError> {
    path.as_ref().ok_or(SignError::BadArgs(what))
}

/// Builds the signing identity: a local `.vbprivk`, a PEM key, or the
/// external-signer adapter when a program is configured.
fn load_signer(opts: &SignOptions) -> Result<Box<dyn Signer>, SignError> {
    if let Some(pem) = &opts.pem_signpriv {
        let algorithm = opts.pem_algo.ok_or(SignError::BadArgs("--pem_algo"))?;
        if let Some(program) = &opts.pem_external {
            Ok(Box::new(ExternalSigner::new(program.clone(), pem.clone(), algorithm)))
        } else {
            Ok(Box::new(PrivateKey::from_pem_file(pem, algorithm)?))
        }
    } else {
        let path = require(&opts.signprivate, "--signprivate")?;
        Ok(Box::new(PrivateKey::read_file(path)?))
    }
}

/// Applies any requested GBB edits in place. A flags write against a
/// pre-flags header downgrades to a warning; everything else is fatal.
fn apply_gbb_edits(image: &mut [u8], opts: &SignOptions) -> Result<(), SignError> {
    if opts.hwid.is_none()
        && opts.rootkey.is_none()
        && opts.recoverykey.is_none()
        && opts.gbb_flags.is_none()
    {
        return Ok(());
    }
    let fmap = Fmap::find(image)?;
    let area = fmap.area("GBB").ok_or(SignError::LayoutIncomplete("GBB"))?;
    let (offset, len) =
        fmap::clamp_area(area, image.len()).ok_or(SignError::LayoutIncomplete("GBB"))?;
    let mut gbb = Gbb::parse(&mut image[offset..offset + len])?;

    if let Some(hwid) = &opts.hwid {
        gbb.set_hwid(hwid)?;
    }
    if let Some(path) = &opts.rootkey {
        gbb.set_rootkey(&PublicKey::read_file(path)?)?;
    }
    if let Some(path) = &opts.recoverykey {
        gbb.set_recovery_key(&PublicKey::read_file(path)?)?;
    }
    if let Some(flags) = opts.gbb_flags {
        match gbb.set_flags(flags) {
            Err(FormatError::UnsupportedField(_)) => {
                log::warn!("GBB header predates the flags field; leaving flags untouched");
            }
            other => other?,
        }
    }
    Ok(())
}

/// Surfaces anti-rollback warnings against the platform-reported versions.
/// The intended data-key version is the one wrapped in the keyblock.
fn warn_rollback(opts: &SignOptions, kb_bytes: &[u8]) {
    let data_key_version = match keyblock::parse(kb_bytes) {
        Ok(kb) => kb.data_key.version,
        Err(_) => return,
    };
    let new_firmware_version = opts.version.unwrap_or(1) as u64;
    for warning in rollback::check(&opts.platform, data_key_version, new_firmware_version) {
        log::warn!("{}", warning);
    }
}

fn sign_bios_image(opts: &SignOptions) -> Result<(), SignError> {
    let signer = load_signer(opts)?;
    let kb_bytes = std::fs::read(require(&opts.keyblock, "--keyblock")?)?;
    let kernel_subkey = PublicKey::read_file(require(&opts.kernelkey, "--kernelkey")?)?;

    let dev_signer = match &opts.devsign {
        Some(path) => Some(PrivateKey::read_file(path)?),
        None => None,
    };
    let dev_kb_bytes = match &opts.devkeyblock {
        Some(path) => Some(std::fs::read(path)?),
        None => None,
    };

    warn_rollback(opts, &kb_bytes);

    let mut mapping = SignMapping::open(&opts.infile, opts.outfile.as_deref())?;
    apply_gbb_edits(mapping.bytes_mut(), opts)?;

    let req = BiosSignRequest {
        signer: signer.as_ref(),
        keyblock: &kb_bytes,
        dev_signer: dev_signer.as_ref().map(|k| k as &dyn Signer),
        dev_keyblock: dev_kb_bytes.as_deref(),
        kernel_subkey: &kernel_subkey,
        version: opts.version.unwrap_or(1) as u64,
        flags: opts.flags,
    };
    let signed = bios::sign_bios(mapping.bytes_mut(), &req)?;

    if let (Some(dir), Some(id)) = (&opts.loemdir, &opts.loemid) {
        loem::write_sidecars(dir, id, &signed.vblock_a, &signed.vblock_b)?;
    }
    mapping.commit()
}

fn sign_firmware_file(opts: &SignOptions) -> Result<(), SignError> {
    let signer = load_signer(opts)?;
    let kb_bytes = std::fs::read(require(&opts.keyblock, "--keyblock")?)?;
    let kernel_subkey = PublicKey::read_file(require(&opts.kernelkey, "--kernelkey")?)?;
    let body = std::fs::read(&opts.infile)?;

    warn_rollback(opts, &kb_bytes);

    let vblock = bios::sign_firmware_body(
        &body,
        &kb_bytes,
        signer.as_ref(),
        &kernel_subkey,
        opts.version.unwrap_or(1) as u64,
        opts.flags.unwrap_or(0),
    )?;
    std::fs::write(require(&opts.outfile, "--outfile")?, vblock)?;
    Ok(())
}

/// Compacts a config file into a single command line.
fn read_config(path: &PathBuf) -> Result<String, SignError> {
    let text = std::fs::read_to_string(path)?;
    Ok(text.replace('\n', " ").trim_end().to_string())
}

fn sign_vmlinuz(opts: &SignOptions) -> Result<(), SignError> {
    let signer = load_signer(opts)?;
    let kb_bytes = std::fs::read(require(&opts.keyblock, "--keyblock")?)?;
    let vmlinuz = std::fs::read(&opts.infile)?;
    let bootloader = match &opts.bootloader {
        Some(path) => std::fs::read(path)?,
        None => Vec::new(),
    };
    let cmdline = match &opts.config {
        Some(path) => read_config(path)?,
        None => String::new(),
    };
    let load_addr = opts.kloadaddr.map(|a| a as u64).unwrap_or(CROS_32BIT_ENTRY_ADDR);

    let blob = kernel::build_blob(&vmlinuz, &bootloader, &cmdline, opts.arch, load_addr)?;
    let req = KernelSignRequest {
        keyblock: &kb_bytes,
        signer: signer.as_ref(),
        version: opts.version.unwrap_or(1) as u64,
        flags: opts.flags.unwrap_or(0),
        load_addr,
        pad: opts.pad,
        vblock_only: opts.vblock_only,
    };
    let out = kernel::create_kernel_partition(&blob, &req)?;
    std::fs::write(require(&opts.outfile, "--outfile")?, out)?;
    Ok(())
}

fn resign_partition(opts: &SignOptions) -> Result<(), SignError> {
    let signer = load_signer(opts)?;
    let new_kb = match &opts.keyblock {
        Some(path) => Some(std::fs::read(path)?),
        None => None,
    };
    let cmdline = match &opts.config {
        Some(path) => Some(read_config(path)?),
        None => None,
    };
    let req = KernelResignRequest {
        signer: signer.as_ref(),
        keyblock: new_kb.as_deref(),
        version: opts.version.map(|v| v as u64),
        flags: opts.flags,
        cmdline: cmdline.as_deref(),
        load_addr: opts.kloadaddr.map(|a| a as u64),
    };

    if opts.vblock_only {
        let part = std::fs::read(&opts.infile)?;
        let resigned = kernel::resign_kernel_partition(&part, &req)?;
        std::fs::write(require(&opts.outfile, "--outfile")?, resigned.vblock)?;
        return Ok(());
    }

    let mut mapping = SignMapping::open(&opts.infile, opts.outfile.as_deref())?;
    let resigned = kernel::resign_kernel_partition(mapping.bytes(), &req)?;
    let out = mapping.bytes_mut();
    out[..resigned.vblock.len()].copy_from_slice(&resigned.vblock);
    out[resigned.vblock.len()..resigned.vblock.len() + resigned.blob.len()]
        .copy_from_slice(&resigned.blob);
    mapping.commit()
}

fn wrap_pubkey(opts: &SignOptions) -> Result<(), SignError> {
    let data_key = PublicKey::read_file(&opts.infile)?;
    let signer: Option<Box<dyn Signer>> =
        if opts.signprivate.is_some() || opts.pem_signpriv.is_some() {
            Some(load_signer(opts)?)
        } else {
            None
        };
    let flags = opts.flags.map(|f| f as u64).unwrap_or(keyblock::KEYBLOCK_FLAGS_ANY);
    let block = keyblock::build(&data_key, signer.as_deref(), flags)?;
    std::fs::write(require(&opts.outfile, "--outfile")?, block)?;
    Ok(())
}
