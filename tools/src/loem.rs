//! LOEM sidecars: per-OEM copies of the freshly written vblocks, emitted
//! next to the in-place image so one build can serve several brandings.

use std::path::Path;

use crate::error::SignError;

/// Writes `vblock_A.<loemid>` and `vblock_B.<loemid>` under `dir`, each
/// containing exactly the corresponding in-image vblock region bytes.
pub fn write_sidecars(
    dir: &Path,
    loemid: &str,
    vblock_a: &[u8],
    vblock_b: &[u8],
) -> Result<(), SignError> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(format!("vblock_A.{}", loemid)), vblock_a)?;
    std::fs::write(dir.join(format!("vblock_B.{}", loemid)), vblock_b)?;
    Ok(())
}
