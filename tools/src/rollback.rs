//! Anti-rollback advisory checks. The platform refuses firmware whose
//! data-key version is lower than the highest it has already accepted, so
//! signing with a downgraded version produces an image that will not boot.
//! This layer only warns; the caller decides whether to proceed.

/// Versions reported by the platform (TPM readback is an external adapter;
/// the values arrive through CLI options).
#[derive(Debug, Clone, Copy)]
pub struct PlatformVersions {
    pub data_key_version: Option<u32>,
    pub firmware_version: Option<u32>,
}

/// Compares the versions about to be signed in against the
/// platform-reported ones. Returns the warnings to emit; never fails.
pub fn check(
    platform: &PlatformVersions,
    new_data_key_version: u64,
    new_firmware_version: u64,
) -> Vec<String> {
    let mut warnings = Vec::new();
    if let Some(tpm) = platform.data_key_version {
        if (tpm as u64) > new_data_key_version {
            warnings.push(format!(
                "data key version {} is lower than the platform-reported version {}; \
                 the TPM will reject this firmware",
                new_data_key_version, tpm
            ));
        }
    }
    if let Some(tpm) = platform.firmware_version {
        if (tpm as u64) > new_firmware_version {
            warnings.push(format!(
                "firmware version {} is lower than the platform-reported version {}; \
                 the TPM will reject this firmware",
                new_firmware_version, tpm
            ));
        }
    }
    warnings
}
