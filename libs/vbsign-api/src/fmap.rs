//! FMAP: the self-describing directory of named regions embedded somewhere
//! in a firmware image.
//!
//! The directory is located by scanning for its signature on a 4-byte
//! stride. Header (56 bytes): signature[8] "__FMAP__", ver_major u8,
//! ver_minor u8, base u64, size u32, name[32], nareas u16; followed by
//! `nareas` 42-byte entries: offset u32, size u32, name[32], flags u16.
//! Area names are fixed-width and not necessarily NUL-terminated.

use crate::wire;
use crate::Error;

pub const FMAP_SIGNATURE: &[u8; 8] = b"__FMAP__";
pub const FMAP_HEADER_SIZE: usize = 56;
pub const FMAP_AREA_SIZE: usize = 42;
pub const FMAP_SEARCH_STRIDE: usize = 4;

const WHAT: &str = "FMAP";

/// Older images use descriptive area names; resolve the canonical name
/// first, then each alias.
const ALIASES: &[(&str, &str)] = &[
    ("GBB", "GBB Area"),
    ("FW_MAIN_A", "Firmware A Data"),
    ("FW_MAIN_B", "Firmware B Data"),
    ("VBLOCK_A", "Firmware A Key"),
    ("VBLOCK_B", "Firmware B Key"),
];

#[derive(Debug, Clone)]
pub struct FmapArea {
    pub name: String,
    pub offset: u32,
    pub size: u32,
    pub flags: u16,
}

#[derive(Debug, Clone)]
pub struct Fmap {
    /// Offset in the image where the directory itself was found.
    pub directory_offset: usize,
    pub base: u64,
    pub name: String,
    pub areas: Vec<FmapArea>,
}

impl Fmap {
    /// Scans `image` for the directory and parses it.
    pub fn find(image: &[u8]) -> Result<Fmap, Error> {
        let mut pos = 0;
        while pos + FMAP_HEADER_SIZE <= image.len() {
            if &image[pos..pos + 8] == FMAP_SIGNATURE {
                return Fmap::parse(image, pos);
            }
            pos += FMAP_SEARCH_STRIDE;
        }
        Err(Error::FmapNotFound)
    }

    fn parse(image: &[u8], pos: usize) -> Result<Fmap, Error> {
        let base = wire::read_u64(image, pos + 10, WHAT)?;
        let name = wire::read_name(image, pos + 22, 32);
        let nareas = wire::read_u16(image, pos + 54, WHAT)? as usize;

        let mut areas = Vec::with_capacity(nareas);
        let mut entry = pos + FMAP_HEADER_SIZE;
        for _ in 0..nareas {
            if entry + FMAP_AREA_SIZE > image.len() {
                return Err(Error::Truncated(WHAT));
            }
            areas.push(FmapArea {
                offset: wire::read_u32(image, entry, WHAT)?,
                size: wire::read_u32(image, entry + 4, WHAT)?,
                name: wire::read_name(image, entry + 8, 32),
                flags: wire::read_u16(image, entry + 40, WHAT)?,
            });
            entry += FMAP_AREA_SIZE;
        }

        Ok(Fmap { directory_offset: pos, base, name, areas })
    }

    /// Looks up an area by canonical name, falling back to its legacy
    /// alias. First match wins.
    pub fn area(&self, name: &str) -> Option<&FmapArea> {
        if let Some(area) = self.areas.iter().find(|a| a.name == name) {
            return Some(area);
        }
        let alias = ALIASES.iter().find(|(canon, _)| *canon == name).map(|(_, a)| *a)?;
        self.areas.iter().find(|a| a.name == alias)
    }
}

/// Clamps an area to an image of length `image_len`. Returns the usable
/// `(offset, len)`, or `None` when the area lies entirely outside the
/// image. A length overrunning the image end is truncated with a warning.
pub fn clamp_area(area: &FmapArea, image_len: usize) -> Option<(usize, usize)> {
    let offset = area.offset as usize;
    if offset >= image_len {
        return None;
    }
    let mut len = area.size as usize;
    if offset + len > image_len {
        log::warn!(
            "FMAP area {} (0x{:x}+0x{:x}) overruns the image, truncating to 0x{:x}",
            area.name,
            area.offset,
            area.size,
            image_len - offset
        );
        len = image_len - offset;
    }
    Some((offset, len))
}
