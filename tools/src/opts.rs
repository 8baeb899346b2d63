//! CLI argument resolution. Everything the components need is folded into
//! one immutable `SignOptions` record here, and every argument problem is
//! accumulated so the user sees the full list at once instead of
//! rediscovering them one run at a time. Signing itself fails fast; only
//! this layer accumulates.

use std::path::{Path, PathBuf};

use vbsign_api::fmap::Fmap;
use vbsign_api::keyblock::KEYBLOCK_MAGIC;
use vbsign_api::{Algorithm, PublicKey};

use crate::kernel::Arch;
use crate::mapping;
use crate::rollback::PlatformVersions;

fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

#[derive(Debug, Default, clap::Args)]
pub struct SignArgs {
    /// Firmware or kernel data-key private key (.vbprivk)
    #[clap(short = 's', long, value_parser)]
    pub signprivate: Option<PathBuf>,

    /// Keyblock wrapping the matching public key
    #[clap(short = 'b', long, value_parser)]
    pub keyblock: Option<PathBuf>,

    /// Kernel subkey public key (.vbpubk)
    #[clap(short = 'k', long, value_parser)]
    pub kernelkey: Option<PathBuf>,

    /// Developer-slot private key, for images whose A/B slots differ
    #[clap(short = 'S', long, value_parser)]
    pub devsign: Option<PathBuf>,

    /// Developer-slot keyblock
    #[clap(short = 'B', long, value_parser)]
    pub devkeyblock: Option<PathBuf>,

    /// Firmware or kernel version
    #[clap(short = 'v', long, value_parser = parse_u32)]
    pub version: Option<u32>,

    /// Preamble flags (default: preserve the existing ones)
    #[clap(short = 'f', long, value_parser = parse_u32)]
    pub flags: Option<u32>,

    /// Directory to receive per-OEM vblock sidecars
    #[clap(short = 'd', long, value_parser)]
    pub loemdir: Option<PathBuf>,

    /// OEM identifier for the sidecar filenames
    #[clap(short = 'l', long, value_parser)]
    pub loemid: Option<String>,

    /// Raw firmware body to sign (also forces the input type)
    #[clap(long, value_parser)]
    pub fv: Option<PathBuf>,

    /// Input file
    #[clap(long, value_parser)]
    pub infile: Option<PathBuf>,

    /// Raw kernel image to sign
    #[clap(long, value_parser)]
    pub vmlinuz: Option<PathBuf>,

    /// Bare public key to wrap into a keyblock
    #[clap(long, value_parser)]
    pub datapubkey: Option<PathBuf>,

    /// Output file (absent: sign in place)
    #[clap(long, value_parser)]
    pub outfile: Option<PathBuf>,

    /// Bootloader stub for the kernel blob
    #[clap(long, value_parser)]
    pub bootloader: Option<PathBuf>,

    /// Command-line (config) file for the kernel blob
    #[clap(long, value_parser)]
    pub config: Option<PathBuf>,

    /// Kernel architecture: x86/amd64, arm/aarch64, mips
    #[clap(long, value_parser)]
    pub arch: Option<String>,

    /// Kernel body load address
    #[clap(long, value_parser = parse_u32)]
    pub kloadaddr: Option<u32>,

    /// Vblock padding for kernel partitions
    #[clap(long, value_parser = parse_u32)]
    pub pad: Option<u32>,

    /// PEM private key for signing (requires --pem_algo)
    #[clap(long = "pem_signpriv", value_parser)]
    pub pem_signpriv: Option<PathBuf>,

    /// Algorithm id for the PEM key
    #[clap(long = "pem_algo", value_parser = parse_u32)]
    pub pem_algo: Option<u32>,

    /// External signer program invoked with the PEM key
    #[clap(long = "pem_external", value_parser)]
    pub pem_external: Option<PathBuf>,

    /// Emit only the vblock (requires a distinct --outfile)
    #[clap(long)]
    pub vblockonly: bool,

    /// Force the input classification: bios, fw, kernel, kernpart, pubkey
    #[clap(long = "type", value_parser)]
    pub input_type: Option<String>,

    /// New hardware id for the GBB
    #[clap(long, value_parser)]
    pub hwid: Option<String>,

    /// New root public key for the GBB (.vbpubk)
    #[clap(long, value_parser)]
    pub rootkey: Option<PathBuf>,

    /// New recovery public key for the GBB (.vbpubk)
    #[clap(long, value_parser)]
    pub recoverykey: Option<PathBuf>,

    /// New GBB flag word
    #[clap(long = "gbb_flags", value_parser = parse_u32)]
    pub gbb_flags: Option<u32>,

    /// Data-key version the platform reports (TPM readback)
    #[clap(long = "tpm_keyver", value_parser = parse_u32)]
    pub tpm_keyver: Option<u32>,

    /// Firmware version the platform reports (TPM readback)
    #[clap(long = "tpm_fwver", value_parser = parse_u32)]
    pub tpm_fwver: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Bios,
    Firmware,
    Kernel,
    KernelPartition,
    Pubkey,
}

impl InputKind {
    fn parse(s: &str) -> Option<InputKind> {
        match s {
            "bios" => Some(InputKind::Bios),
            "fw" => Some(InputKind::Firmware),
            "kernel" => Some(InputKind::Kernel),
            "kernpart" => Some(InputKind::KernelPartition),
            "pubkey" => Some(InputKind::Pubkey),
            _ => None,
        }
    }
}

/// Accumulated argument problems, reported all at once before any signing
/// I/O happens.
#[derive(Debug)]
pub struct BadArgs(pub Vec<String>);

impl std::fmt::Display for BadArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "BadArgs:")?;
        for problem in &self.0 {
            writeln!(f, "  - {}", problem)?;
        }
        Ok(())
    }
}

impl std::error::Error for BadArgs {}

/// The immutable option record handed to every component.
#[derive(Debug)]
pub struct SignOptions {
    pub kind: InputKind,
    pub infile: PathBuf,
    pub outfile: Option<PathBuf>,
    pub signprivate: Option<PathBuf>,
    pub keyblock: Option<PathBuf>,
    pub kernelkey: Option<PathBuf>,
    pub devsign: Option<PathBuf>,
    pub devkeyblock: Option<PathBuf>,
    pub version: Option<u32>,
    pub flags: Option<u32>,
    pub loemdir: Option<PathBuf>,
    pub loemid: Option<String>,
    pub bootloader: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub arch: Arch,
    pub kloadaddr: Option<u32>,
    pub pad: u64,
    pub pem_signpriv: Option<PathBuf>,
    pub pem_algo: Option<Algorithm>,
    pub pem_external: Option<PathBuf>,
    pub vblock_only: bool,
    pub hwid: Option<String>,
    pub rootkey: Option<PathBuf>,
    pub recoverykey: Option<PathBuf>,
    pub gbb_flags: Option<u32>,
    pub platform: PlatformVersions,
}

impl Default for SignOptions {
    fn default() -> SignOptions {
        SignOptions {
            kind: InputKind::Bios,
            infile: PathBuf::new(),
            outfile: None,
            signprivate: None,
            keyblock: None,
            kernelkey: None,
            devsign: None,
            devkeyblock: None,
            version: None,
            flags: None,
            loemdir: None,
            loemid: None,
            bootloader: None,
            config: None,
            arch: Arch::X86,
            kloadaddr: None,
            pad: crate::kernel::DEFAULT_PAD,
            pem_signpriv: None,
            pem_algo: None,
            pem_external: None,
            vblock_only: false,
            hwid: None,
            rootkey: None,
            recoverykey: None,
            gbb_flags: None,
            platform: PlatformVersions { data_key_version: None, firmware_version: None },
        }
    }
}

/// Content sniff for `--type`-less invocations. A keyblock magic at offset
/// zero marks a kernel partition, an FMAP directory a BIOS image, and a
/// plausible packed key header a bare public key.
fn sniff(path: &Path) -> Option<InputKind> {
    let map = mapping::map_readonly(path).ok()?;
    let bytes = &map[..];
    if bytes.len() >= 8 && &bytes[..8] == KEYBLOCK_MAGIC {
        return Some(InputKind::KernelPartition);
    }
    if PublicKey::parse(bytes).is_ok() {
        return Some(InputKind::Pubkey);
    }
    if Fmap::find(bytes).is_ok() {
        return Some(InputKind::Bios);
    }
    None
}

pub fn resolve(args: SignArgs) -> Result<SignOptions, BadArgs> {
    let mut errors: Vec<String> = Vec::new();

    // exactly one input path
    let inputs: Vec<(&str, &Option<PathBuf>)> = vec![
        ("--fv", &args.fv),
        ("--infile", &args.infile),
        ("--vmlinuz", &args.vmlinuz),
        ("--datapubkey", &args.datapubkey),
    ];
    let supplied: Vec<&(&str, &Option<PathBuf>)> =
        inputs.iter().filter(|(_, p)| p.is_some()).collect();
    if supplied.len() > 1 {
        let names: Vec<&str> = supplied.iter().map(|(n, _)| *n).collect();
        errors.push(format!("conflicting input files: {}", names.join(", ")));
    }
    let infile = supplied.first().and_then(|(_, p)| (*p).clone());
    if infile.is_none() {
        errors.push("no input file given (--infile, --fv, --vmlinuz or --datapubkey)".to_string());
    }

    // the input flag may force a type before any sniffing
    let forced = if args.fv.is_some() {
        Some(InputKind::Firmware)
    } else if args.vmlinuz.is_some() {
        Some(InputKind::Kernel)
    } else if args.datapubkey.is_some() {
        Some(InputKind::Pubkey)
    } else {
        None
    };
    let explicit = match &args.input_type {
        Some(name) => match InputKind::parse(name) {
            Some(kind) => Some(kind),
            None => {
                errors.push(format!(
                    "unknown --type \"{}\" (bios, fw, kernel, kernpart, pubkey)",
                    name
                ));
                None
            }
        },
        None => None,
    };
    if let (Some(explicit), Some(forced)) = (explicit, forced) {
        if explicit != forced {
            errors.push("--type contradicts the input flag that was used".to_string());
        }
    }
    let kind = explicit.or(forced).or_else(|| {
        let sniffed = infile.as_deref().and_then(sniff);
        sniffed.or({
            // inference of last resort, from the arguments supplied
            if args.bootloader.is_some() || args.config.is_some() || args.arch.is_some() {
                Some(InputKind::Kernel)
            } else if args.kernelkey.is_some() {
                Some(InputKind::Firmware)
            } else {
                None
            }
        })
    });
    if kind.is_none() && infile.is_some() {
        errors.push("unable to classify the input file; use --type".to_string());
    }

    let arch = match args.arch.as_deref() {
        Some(name) => match name.parse::<Arch>() {
            Ok(arch) => arch,
            Err(e) => {
                errors.push(e);
                Arch::X86
            }
        },
        None => Arch::X86,
    };

    let pem_algo = match args.pem_algo {
        Some(id) => match Algorithm::from_id(id as u64) {
            Ok(algo) => Some(algo),
            Err(_) => {
                errors.push(format!("--pem_algo {} is not a valid algorithm id", id));
                None
            }
        },
        None => None,
    };
    if args.pem_signpriv.is_some() && args.signprivate.is_some() {
        errors.push("--signprivate and --pem_signpriv are mutually exclusive".to_string());
    }
    if args.pem_signpriv.is_some() && args.pem_algo.is_none() {
        errors.push("--pem_signpriv requires --pem_algo".to_string());
    }
    if args.pem_algo.is_some() && args.pem_signpriv.is_none() {
        errors.push("--pem_algo requires --pem_signpriv".to_string());
    }
    if args.pem_external.is_some() && args.pem_signpriv.is_none() {
        errors.push("--pem_external requires --pem_signpriv".to_string());
    }
    let have_signer = args.signprivate.is_some() || args.pem_signpriv.is_some();

    if args.devsign.is_some() != args.devkeyblock.is_some() {
        errors.push("--devsign and --devkeyblock must be supplied together".to_string());
    }
    if args.loemdir.is_some() != args.loemid.is_some() {
        errors.push("--loemdir and --loemid must be supplied together".to_string());
    }

    if let Some(kind) = kind {
        let mut require = |ok: bool, what: &str| {
            if !ok {
                errors.push(format!("{} is required when signing {}", what, describe(kind)));
            }
        };
        match kind {
            InputKind::Bios => {
                require(have_signer, "--signprivate (or --pem_signpriv)");
                require(args.keyblock.is_some(), "--keyblock");
                require(args.kernelkey.is_some(), "--kernelkey");
            }
            InputKind::Firmware => {
                require(have_signer, "--signprivate (or --pem_signpriv)");
                require(args.keyblock.is_some(), "--keyblock");
                require(args.kernelkey.is_some(), "--kernelkey");
                require(args.outfile.is_some(), "--outfile");
            }
            InputKind::Kernel => {
                require(have_signer, "--signprivate (or --pem_signpriv)");
                require(args.keyblock.is_some(), "--keyblock");
                require(args.outfile.is_some(), "--outfile");
            }
            InputKind::KernelPartition => {
                require(have_signer, "--signprivate (or --pem_signpriv)");
            }
            InputKind::Pubkey => {
                require(args.outfile.is_some(), "--outfile");
            }
        }
        if args.vblockonly {
            if !matches!(kind, InputKind::Kernel | InputKind::KernelPartition) {
                errors.push("--vblockonly only applies to kernel inputs".to_string());
            } else if args.outfile.is_none() {
                errors.push("--vblockonly requires a distinct --outfile".to_string());
            } else if args.outfile == infile {
                errors.push("--vblockonly must not overwrite the input file".to_string());
            }
        }
        if kind != InputKind::Bios {
            if args.loemdir.is_some() || args.loemid.is_some() {
                errors.push("LOEM sidecars only apply to BIOS images".to_string());
            }
            if args.hwid.is_some()
                || args.rootkey.is_some()
                || args.recoverykey.is_some()
                || args.gbb_flags.is_some()
            {
                errors.push("GBB edits only apply to BIOS images".to_string());
            }
        }
    }

    if !errors.is_empty() {
        return Err(BadArgs(errors));
    }
    // both unwraps guarded by the error accumulation above
    let kind = kind.expect("input kind resolved");
    let infile = infile.expect("input file resolved");

    Ok(SignOptions {
        kind,
        infile,
        outfile: args.outfile,
        signprivate: args.signprivate,
        keyblock: args.keyblock,
        kernelkey: args.kernelkey,
        devsign: args.devsign,
        devkeyblock: args.devkeyblock,
        version: args.version,
        flags: args.flags,
        loemdir: args.loemdir,
        loemid: args.loemid,
        bootloader: args.bootloader,
        config: args.config,
        arch,
        kloadaddr: args.kloadaddr,
        pad: args.pad.map(|p| p as u64).unwrap_or(crate::kernel::DEFAULT_PAD),
        pem_signpriv: args.pem_signpriv,
        pem_algo,
        pem_external: args.pem_external,
        vblock_only: args.vblockonly,
        hwid: args.hwid,
        rootkey: args.rootkey,
        recoverykey: args.recoverykey,
        gbb_flags: args.gbb_flags,
        platform: PlatformVersions {
            data_key_version: args.tpm_keyver,
            firmware_version: args.tpm_fwver,
        },
    })
}

fn describe(kind: InputKind) -> &'static str {
    match kind {
        InputKind::Bios => "a BIOS image",
        InputKind::Firmware => "a raw firmware body",
        InputKind::Kernel => "a raw kernel",
        InputKind::KernelPartition => "a kernel partition",
        InputKind::Pubkey => "a bare public key",
    }
}
