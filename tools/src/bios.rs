//! BIOS sign orchestrator: walks the FMAP, sizes the firmware bodies from
//! the existing preambles, detects A/B divergence, and rewrites both
//! VBLOCK regions.
//!
//! Slot ordering is load-bearing: VBLOCK_A is completely written before
//! VBLOCK_B is touched, so a mid-run crash leaves at most one slot
//! inconsistent.

use vbsign_api::fmap::{self, Fmap};
use vbsign_api::{keyblock, preamble, PublicKey, Signer};

use crate::error::SignError;

/// Keys and knobs for one whole-image signing pass. The developer identity
/// is only consulted when the two firmware bodies differ.
pub struct BiosSignRequest<'a> {
    pub signer: &'a dyn Signer,
    pub keyblock: &'a [u8],
    pub dev_signer: Option<&'a dyn Signer>,
    pub dev_keyblock: Option<&'a [u8]>,
    pub kernel_subkey: &'a PublicKey,
    pub version: u64,
    /// `None` preserves the flags found in the existing preambles.
    pub flags: Option<u32>,
}

/// The full vblock-region bytes as written, for LOEM sidecars.
#[derive(Debug)]
pub struct SignedBios {
    pub vblock_a: Vec<u8>,
    pub vblock_b: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    offset: usize,
    len: usize,
}

impl Region {
    fn slice<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        &image[self.offset..self.offset + self.len]
    }
}

/// Region classification for the four areas the orchestrator rewrites or
/// measures; anything else in the FMAP is ignored.
#[derive(Debug, Clone, Copy)]
enum RegionKind {
    FwMain(usize),
    Vblock(usize),
}

const BIOS_AREAS: [(&str, RegionKind); 4] = [
    ("FW_MAIN_A", RegionKind::FwMain(0)),
    ("FW_MAIN_B", RegionKind::FwMain(1)),
    ("VBLOCK_A", RegionKind::Vblock(0)),
    ("VBLOCK_B", RegionKind::Vblock(1)),
];

const SLOT_NAMES: [&str; 2] = ["A", "B"];

/// Observations accumulated while walking the FMAP. Finalizing checks that
/// every required region was seen.
#[derive(Default)]
struct StateBuilder {
    fw_main: [Option<Region>; 2],
    vblock: [Option<Region>; 2],
    preserved_flags: Option<u32>,
}

struct SignState {
    fw_main: [Region; 2],
    vblock: [Region; 2],
    /// Flags carried over from an existing preamble, when any parsed.
    flags: u32,
}

impl StateBuilder {
    fn observe(mut self, kind: RegionKind, region: Region) -> StateBuilder {
        match kind {
            RegionKind::FwMain(slot) => self.fw_main[slot] = Some(region),
            RegionKind::Vblock(slot) => self.vblock[slot] = Some(region),
        }
        self
    }

    /// Examines the existing vblocks. A parseable keyblock + preamble
    /// shrinks the corresponding firmware body to the signed length the
    /// preamble declares, and donates its flags when the caller did not
    /// specify any; an unparseable vblock downgrades to signing the whole
    /// region.
    fn examine_vblocks(mut self, image: &[u8], keep_flags: bool) -> StateBuilder {
        for slot in 0..2 {
            let (vblock, fw_main) = match (self.vblock[slot], self.fw_main[slot]) {
                (Some(v), Some(f)) => (v, f),
                _ => continue,
            };
            let parsed = keyblock::verify(vblock.slice(image), None).and_then(|kb| {
                preamble::parse_firmware(&vblock.slice(image)[kb.size as usize..])
            });
            match parsed {
                Ok(old) => {
                    if old.body_data_size <= fw_main.len as u64 {
                        self.fw_main[slot] = Some(Region {
                            offset: fw_main.offset,
                            len: old.body_data_size as usize,
                        });
                    } else {
                        log::warn!(
                            "VBLOCK_{}: preamble claims a {}-byte body but FW_MAIN_{} is only {} \
                             bytes; signing the whole region",
                            SLOT_NAMES[slot],
                            old.body_data_size,
                            SLOT_NAMES[slot],
                            fw_main.len
                        );
                    }
                    if keep_flags {
                        self.preserved_flags = Some(old.flags);
                    }
                }
                Err(e) => {
                    log::warn!(
                        "VBLOCK_{}: unusable existing contents ({}); signing the whole FW_MAIN_{} \
                         region",
                        SLOT_NAMES[slot],
                        e,
                        SLOT_NAMES[slot]
                    );
                }
            }
        }
        self
    }

    fn finalize(self) -> Result<SignState, SignError> {
        let require = |r: Option<Region>, what| r.ok_or(SignError::LayoutIncomplete(what));
        Ok(SignState {
            fw_main: [
                require(self.fw_main[0], "FW_MAIN_A")?,
                require(self.fw_main[1], "FW_MAIN_B")?,
            ],
            vblock: [
                require(self.vblock[0], "VBLOCK_A")?,
                require(self.vblock[1], "VBLOCK_B")?,
            ],
            flags: self.preserved_flags.unwrap_or(0),
        })
    }
}

/// Signs both BIOS slots in place. Only the VBLOCK regions are written;
/// every other byte of `image` is left as found.
pub fn sign_bios(image: &mut [u8], req: &BiosSignRequest) -> Result<SignedBios, SignError> {
    let fmap = Fmap::find(image)?;
    let mut builder = StateBuilder::default();
    for (name, kind) in BIOS_AREAS {
        if let Some(area) = fmap.area(name) {
            if let Some((offset, len)) = fmap::clamp_area(area, image.len()) {
                builder = builder.observe(kind, Region { offset, len });
            }
        }
    }
    let state = builder.examine_vblocks(image, req.flags.is_none()).finalize()?;
    let flags = req.flags.unwrap_or(state.flags);

    // A/B divergence decides which identity signs slot A; slot B always
    // gets the normal one
    let divergent = state.fw_main[0].slice(image) != state.fw_main[1].slice(image);
    let (signer_a, keyblock_a): (&dyn Signer, &[u8]) = if divergent {
        match (req.dev_signer, req.dev_keyblock) {
            (Some(signer), Some(kb)) => {
                log::warn!("FW_MAIN_A and FW_MAIN_B differ; signing slot A with the developer identity");
                (signer, kb)
            }
            _ => return Err(SignError::DevKeysRequired),
        }
    } else {
        (req.signer, req.keyblock)
    };

    let mut outputs: [Vec<u8>; 2] = [Vec::new(), Vec::new()];
    for (slot, signer, kb_bytes) in [(0, signer_a, keyblock_a), (1, req.signer, req.keyblock)] {
        let vblock = write_vblock(
            image,
            state.fw_main[slot],
            state.vblock[slot],
            signer,
            kb_bytes,
            req.kernel_subkey,
            req.version,
            flags,
        )?;
        outputs[slot] = vblock;
    }
    let [vblock_a, vblock_b] = outputs;
    Ok(SignedBios { vblock_a, vblock_b })
}

/// Signs one firmware body and writes `keyblock || preamble` at the start
/// of its vblock region, returning a copy of the whole region.
fn write_vblock(
    image: &mut [u8],
    fw_main: Region,
    vblock: Region,
    signer: &dyn Signer,
    kb_bytes: &[u8],
    kernel_subkey: &PublicKey,
    version: u64,
    flags: u32,
) -> Result<Vec<u8>, SignError> {
    check_keyblock_matches_signer(kb_bytes, signer)?;
    let body_sig = signer.sign(fw_main.slice(image))?;
    let pre = preamble::build_firmware(
        version,
        kernel_subkey,
        &body_sig,
        fw_main.len as u64,
        flags,
        signer,
    )?;
    if kb_bytes.len() + pre.len() > vblock.len {
        return Err(SignError::RegionOverrun("keyblock + preamble"));
    }
    let out = &mut image[vblock.offset..vblock.offset + vblock.len];
    out[..kb_bytes.len()].copy_from_slice(kb_bytes);
    out[kb_bytes.len()..kb_bytes.len() + pre.len()].copy_from_slice(&pre);
    Ok(out.to_vec())
}

/// Signs a raw firmware body into a standalone vblock
/// (`keyblock || preamble`).
pub fn sign_firmware_body(
    body: &[u8],
    kb_bytes: &[u8],
    signer: &dyn Signer,
    kernel_subkey: &PublicKey,
    version: u64,
    flags: u32,
) -> Result<Vec<u8>, SignError> {
    check_keyblock_matches_signer(kb_bytes, signer)?;
    let body_sig = signer.sign(body)?;
    let pre =
        preamble::build_firmware(version, kernel_subkey, &body_sig, body.len() as u64, flags, signer)?;
    let mut out = Vec::with_capacity(kb_bytes.len() + pre.len());
    out.extend_from_slice(kb_bytes);
    out.extend_from_slice(&pre);
    Ok(out)
}

/// The keyblock's wrapped data key must use the same algorithm as the
/// private key that will sign the preamble, or the boot ROM would reject
/// the pairing.
pub fn check_keyblock_matches_signer(kb_bytes: &[u8], signer: &dyn Signer) -> Result<(), SignError> {
    let kb = keyblock::parse(kb_bytes)?;
    if kb.data_key.algorithm != signer.algorithm() {
        return Err(SignError::Format(vbsign_api::Error::AlgoMismatch(format!(
            "keyblock wraps an algorithm-{} data key but the signing key is algorithm {}",
            kb.data_key.algorithm.id(),
            signer.algorithm().id()
        ))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use vbsign_api::{Algorithm, PrivateKey};

    struct Fixture {
        root_pub: PublicKey,
        normal: TestIdentity,
        subkey: PublicKey,
    }

    fn fixture() -> Fixture {
        let root = test_private_key(Algorithm::Rsa1024Sha256);
        let normal = test_identity(&root, 2);
        let subkey = test_private_key(Algorithm::Rsa1024Sha1).public_key(1).unwrap();
        Fixture { root_pub: root.public_key(1).unwrap(), normal, subkey }
    }

    fn body(seed: u8) -> Vec<u8> {
        (0..FW_LEN).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    fn request<'a>(f: &'a Fixture, flags: Option<u32>) -> BiosSignRequest<'a> {
        BiosSignRequest {
            signer: &f.normal.signer,
            keyblock: &f.normal.keyblock,
            dev_signer: None,
            dev_keyblock: None,
            kernel_subkey: &f.subkey,
            version: 1,
            flags,
        }
    }

    fn verify_slot(
        image: &[u8],
        vblock_offset: usize,
        root_pub: &PublicKey,
        data_pub: &PublicKey,
    ) -> vbsign_api::preamble::FirmwarePreamble {
        let vblock = &image[vblock_offset..vblock_offset + VBLOCK_LEN];
        let kb = keyblock::verify(vblock, Some(root_pub)).unwrap();
        preamble::verify_firmware(&vblock[kb.size as usize..], data_pub).unwrap()
    }

    #[test]
    fn identical_slots_sign_with_normal_identity() {
        let f = fixture();
        let fw = body(0xa5);
        let mut image = build_bios_image(&fw, &fw, 2);
        let before = image.clone();

        let signed = sign_bios(&mut image, &request(&f, Some(1))).unwrap();
        let data_pub = f.normal.signer.public_key(2).unwrap();

        for (vb_off, fw_off) in [(VBLOCK_A_OFFSET, FW_A_OFFSET), (VBLOCK_B_OFFSET, FW_B_OFFSET)] {
            let pre = verify_slot(&image, vb_off, &f.root_pub, &data_pub);
            assert_eq!(pre.flags, 1);
            assert_eq!(pre.body_data_size as usize, FW_LEN);
            data_pub.verify(&image[fw_off..fw_off + FW_LEN], &pre.body_signature).unwrap();
        }
        assert_eq!(signed.vblock_a, &image[VBLOCK_A_OFFSET..VBLOCK_A_OFFSET + VBLOCK_LEN]);
        assert_eq!(signed.vblock_b, &image[VBLOCK_B_OFFSET..VBLOCK_B_OFFSET + VBLOCK_LEN]);

        // everything outside the two vblocks is byte-identical
        for (i, (&was, &is)) in before.iter().zip(image.iter()).enumerate() {
            let in_vblock = (VBLOCK_A_OFFSET..VBLOCK_A_OFFSET + VBLOCK_LEN).contains(&i)
                || (VBLOCK_B_OFFSET..VBLOCK_B_OFFSET + VBLOCK_LEN).contains(&i);
            if !in_vblock {
                assert_eq!(was, is, "byte 0x{:x} changed outside the vblocks", i);
            }
        }
    }

    #[test]
    fn divergent_slots_require_dev_keys() {
        let f = fixture();
        let fw_a = body(0xa5);
        let mut fw_b = fw_a.clone();
        *fw_b.last_mut().unwrap() ^= 0xff;
        let mut image = build_bios_image(&fw_a, &fw_b, 2);
        let before = image.clone();

        let err = sign_bios(&mut image, &request(&f, None)).unwrap_err();
        assert!(matches!(err, SignError::DevKeysRequired));
        assert_eq!(before, image); // nothing written
    }

    #[test]
    fn divergent_slots_sign_with_dev_identity() {
        let f = fixture();
        let root = test_private_key(Algorithm::Rsa1024Sha256);
        let dev = test_identity(&root, 3);
        let fw_a = body(0x11);
        let fw_b = body(0x22);
        let mut image = build_bios_image(&fw_a, &fw_b, 2);

        let mut req = request(&f, Some(0));
        req.dev_signer = Some(&dev.signer);
        req.dev_keyblock = Some(&dev.keyblock);
        sign_bios(&mut image, &req).unwrap();

        // slot A carries the developer keyblock, slot B the normal one
        assert_eq!(
            &image[VBLOCK_A_OFFSET..VBLOCK_A_OFFSET + dev.keyblock.len()],
            &dev.keyblock[..]
        );
        verify_slot(&image, VBLOCK_A_OFFSET, &root.public_key(1).unwrap(),
            &dev.signer.public_key(3).unwrap());
        verify_slot(&image, VBLOCK_B_OFFSET, &f.root_pub,
            &f.normal.signer.public_key(2).unwrap());
    }

    #[test]
    fn existing_preamble_shrinks_body_and_donates_flags() {
        let f = fixture();
        let fw = body(0x5a);
        let mut image = build_bios_image(&fw, &fw, 2);
        let shrunk = 0x1800usize;

        // install plausible existing vblocks declaring a shorter body and
        // flags the caller wants preserved
        let old_kb =
            keyblock::build(&f.normal.signer.public_key(2).unwrap(), None, 0xf).unwrap();
        let old_sig = f.normal.signer.sign(&fw[..shrunk]).unwrap();
        let old_pre = preamble::build_firmware(
            9,
            &f.subkey,
            &old_sig,
            shrunk as u64,
            5,
            &f.normal.signer,
        )
        .unwrap();
        for off in [VBLOCK_A_OFFSET, VBLOCK_B_OFFSET] {
            image[off..off + old_kb.len()].copy_from_slice(&old_kb);
            image[off + old_kb.len()..off + old_kb.len() + old_pre.len()]
                .copy_from_slice(&old_pre);
        }

        sign_bios(&mut image, &request(&f, None)).unwrap();
        let data_pub = f.normal.signer.public_key(2).unwrap();
        for (vb_off, fw_off) in [(VBLOCK_A_OFFSET, FW_A_OFFSET), (VBLOCK_B_OFFSET, FW_B_OFFSET)] {
            let pre = verify_slot(&image, vb_off, &f.root_pub, &data_pub);
            assert_eq!(pre.body_data_size as usize, shrunk);
            assert_eq!(pre.flags, 5); // preserved from the old preamble
            data_pub.verify(&image[fw_off..fw_off + shrunk], &pre.body_signature).unwrap();
        }
    }

    #[test]
    fn explicit_flags_override_preserved_ones() {
        let f = fixture();
        let fw = body(0x5a);
        let mut image = build_bios_image(&fw, &fw, 2);
        let old_kb =
            keyblock::build(&f.normal.signer.public_key(2).unwrap(), None, 0xf).unwrap();
        let old_sig = f.normal.signer.sign(&fw).unwrap();
        let old_pre =
            preamble::build_firmware(9, &f.subkey, &old_sig, FW_LEN as u64, 5, &f.normal.signer)
                .unwrap();
        for off in [VBLOCK_A_OFFSET, VBLOCK_B_OFFSET] {
            image[off..off + old_kb.len()].copy_from_slice(&old_kb);
            image[off + old_kb.len()..off + old_kb.len() + old_pre.len()]
                .copy_from_slice(&old_pre);
        }

        sign_bios(&mut image, &request(&f, Some(7))).unwrap();
        let data_pub = f.normal.signer.public_key(2).unwrap();
        let pre = verify_slot(&image, VBLOCK_A_OFFSET, &f.root_pub, &data_pub);
        assert_eq!(pre.flags, 7);
    }

    #[test]
    fn missing_region_aborts() {
        let f = fixture();
        let fw = body(0x00);
        let mut image = build_bios_image(&fw, &fw, 2);
        // rename VBLOCK_B's directory entry so the area cannot be found
        let entry = FMAP_OFFSET + 56 + 2 * 42 + 8;
        image[entry..entry + 8].copy_from_slice(b"VBLOCK_X");

        let err = sign_bios(&mut image, &request(&f, None)).unwrap_err();
        assert!(matches!(err, SignError::LayoutIncomplete("VBLOCK_B")));
    }

    #[test]
    fn keyblock_signer_algorithm_mismatch() {
        let f = fixture();
        let other: PrivateKey = test_private_key(Algorithm::Rsa1024Sha512);
        let err =
            sign_firmware_body(b"body", &f.normal.keyblock, &other, &f.subkey, 1, 0).unwrap_err();
        assert!(matches!(err, SignError::Format(vbsign_api::Error::AlgoMismatch(_))));
    }

    #[test]
    fn raw_firmware_body_vblock() {
        let f = fixture();
        let fw = body(0x3c);
        let vblock =
            sign_firmware_body(&fw, &f.normal.keyblock, &f.normal.signer, &f.subkey, 4, 2)
                .unwrap();
        let kb = keyblock::verify(&vblock, Some(&f.root_pub)).unwrap();
        let data_pub = f.normal.signer.public_key(2).unwrap();
        let pre = preamble::verify_firmware(&vblock[kb.size as usize..], &data_pub).unwrap();
        assert_eq!(pre.firmware_version, 4);
        assert_eq!(pre.flags, 2);
        assert_eq!(pre.body_data_size as usize, fw.len());
        data_pub.verify(&fw, &pre.body_signature).unwrap();
    }
}
