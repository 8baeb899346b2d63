//! Image buffer lifecycle: every mutating operation works on a memory-mapped
//! working copy next to the destination, which is renamed into place only
//! after the whole operation succeeds. A failure at any point discards the
//! copy, so the destination never sees a partial write.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::error::SignError;

pub struct SignMapping {
    map: MmapMut,
    work: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl SignMapping {
    /// Copies `input` to a working file beside the destination (`outfile`
    /// if given, otherwise `input` itself for an in-place sign) and maps it
    /// read-write.
    pub fn open(input: &Path, outfile: Option<&Path>) -> Result<SignMapping, SignError> {
        let dest = outfile.unwrap_or(input).to_path_buf();
        let work = work_path(&dest);
        std::fs::copy(input, &work)?;
        let file = OpenOptions::new().read(true).write(true).open(&work)?;
        let map = unsafe { memmap2::MmapOptions::new().map_mut(&file) }?;
        Ok(SignMapping { map, work, dest, committed: false })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Flushes the mapping and renames the working copy over the
    /// destination.
    pub fn commit(mut self) -> Result<(), SignError> {
        self.map.flush()?;
        std::fs::rename(&self.work, &self.dest)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for SignMapping {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.work);
        }
    }
}

/// Maps a file read-only, for parse-only paths like input sniffing.
pub fn map_readonly(path: &Path) -> Result<Mmap, SignError> {
    let file = std::fs::File::open(path)?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file) }?;
    Ok(map)
}

fn work_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| std::ffi::OsString::from("image"));
    name.push(".new");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vbsign-map-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn commit_renames_over_outfile() {
        let dir = scratch("commit");
        let input = dir.join("in.bin");
        let output = dir.join("out.bin");
        std::fs::write(&input, b"aaaa").unwrap();

        let mut mapping = SignMapping::open(&input, Some(&output)).unwrap();
        mapping.bytes_mut()[0] = b'z';
        mapping.commit().unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"zaaa");
        assert_eq!(std::fs::read(&input).unwrap(), b"aaaa"); // source untouched
        assert!(!dir.join("out.bin.new").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn drop_without_commit_discards() {
        let dir = scratch("discard");
        let input = dir.join("in.bin");
        std::fs::write(&input, b"original").unwrap();

        {
            let mut mapping = SignMapping::open(&input, None).unwrap();
            mapping.bytes_mut()[0] = b'X';
            // dropped here without commit
        }
        assert_eq!(std::fs::read(&input).unwrap(), b"original");
        assert!(!dir.join("in.bin.new").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
