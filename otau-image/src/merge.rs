//! Key merge layer: writes harvested device keys into an image working copy

use std::path::Path;

use log::{debug, info};

use crate::image::{ImageError, ImageFile, KeyBlock};
use crate::keydb::KeyDatabase;
use crate::keys::{KeyKind, ProvisioningKeys};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("image declares no blocks")]
    NoBlocks,
    #[error("key database has no entry for {kind} (CS version {cs_version})")]
    MissingKey { kind: KeyKind, cs_version: u16 },
    #[error("key database entry for {kind} covers {length} words, need {needed}")]
    DescriptorTooShort {
        kind: KeyKind,
        length: u16,
        needed: usize,
    },
    #[error("{kind} at CS offset {offset} lies outside the {size}-word CS block")]
    OutsideCsBlock { kind: KeyKind, offset: u16, size: u16 },
}

/// Which keys ended up in the image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: Vec<KeyKind>,
    pub skipped: Vec<KeyKind>,
    pub control_header_crc: u16,
    pub cs_block_crc: u16,
}

fn key_index(
    kb: &KeyBlock,
    db: &dyn KeyDatabase,
    cs_version: u16,
    kind: KeyKind,
) -> Result<usize, MergeError> {
    let desc = db
        .key(cs_version, kind)
        .ok_or(MergeError::MissingKey { kind, cs_version })?;
    if (desc.length as usize) < kind.words() {
        return Err(MergeError::DescriptorTooShort {
            kind,
            length: desc.length,
            needed: kind.words(),
        });
    }
    if desc.offset as usize + kind.words() > kb.size as usize {
        return Err(MergeError::OutsideCsBlock {
            kind,
            offset: desc.offset,
            size: kb.size,
        });
    }
    Ok(kb.data_index + desc.offset as usize)
}

/// Merge every valid key, then recompute the CS block and control header CRCs
///
/// Keys that were never read keep the placeholder words already in the image.
/// On error `image` is left untouched.
pub fn merge_keys(
    image: &mut ImageFile,
    keys: &ProvisioningKeys,
    db: &dyn KeyDatabase,
    cs_version: u16,
) -> Result<MergeReport, MergeError> {
    let mut work = image.clone();
    let report = merge_into(&mut work, keys, db, cs_version)?;
    *image = work;
    Ok(report)
}

fn merge_into(
    image: &mut ImageFile,
    keys: &ProvisioningKeys,
    db: &dyn KeyDatabase,
    cs_version: u16,
) -> Result<MergeReport, MergeError> {
    if image.number_of_blocks()? == 0 {
        return Err(MergeError::NoBlocks);
    }
    let kb = image.locate_key_block_and_compute_size()?;
    let mut report = MergeReport::default();

    for kind in KeyKind::ALL {
        let Some(bytes) = keys.get(kind) else {
            debug!("{kind} not read, keeping image placeholder");
            report.skipped.push(kind);
            continue;
        };
        let index = key_index(&kb, db, cs_version, kind)?;
        match kind {
            KeyKind::BtAddress => image.merge_bt_address(index, bytes)?,
            KeyKind::CrystalTrim => image.merge_crystal_trim(index, bytes)?,
            KeyKind::IdentityRoot => image.merge_identity_root(index, bytes)?,
            KeyKind::EncryptionRoot => image.merge_encryption_root(index, bytes)?,
        }
        report.merged.push(kind);
    }

    report.cs_block_crc = image.recompute_cs_block_crc()?;
    report.control_header_crc = image.recompute_control_header_crc()?;
    info!(
        "merged {} keys (CS CRC 0x{:04x}, header CRC 0x{:04x})",
        report.merged.len(),
        report.cs_block_crc,
        report.control_header_crc
    );
    Ok(report)
}

/// Open a working copy of `path` and merge `keys` into it
pub fn merge_keys_into_file(
    path: &Path,
    keys: &ProvisioningKeys,
    db: &dyn KeyDatabase,
    cs_version: u16,
) -> Result<(ImageFile, MergeReport), MergeError> {
    let mut image = ImageFile::open(path)?;
    let report = merge_keys(&mut image, keys, db, cs_version)?;
    Ok((image, report))
}

/// Open a working copy, validate it and drop it
///
/// Errors only when the file cannot be read or parsed.
pub fn validate_image_file(path: &Path) -> Result<bool, ImageError> {
    let image = ImageFile::open(path)?;
    Ok(image.is_valid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ImageBuilder;
    use crate::keydb::BuiltinKeyDatabase;

    fn placeholder_image() -> ImageFile {
        let text = ImageBuilder::new()
            .with_comments()
            .cs_block(vec![0xffff; 24])
            .block(0x0000, vec![0x1111, 0x2222, 0x3333])
            .block(0x8000, vec![0x4444; 6])
            .build();
        ImageFile::parse(&text).unwrap()
    }

    fn all_keys() -> ProvisioningKeys {
        let mut keys = ProvisioningKeys::new();
        keys.set_hex(KeyKind::BtAddress, "00:02:5b:00:a5:a5").unwrap();
        keys.set(KeyKind::CrystalTrim, &[0x27, 0x00]).unwrap();
        keys.set(KeyKind::IdentityRoot, &[0x11; 16]).unwrap();
        keys.set(KeyKind::EncryptionRoot, &(0..16).collect::<Vec<u8>>()).unwrap();
        keys
    }

    #[test]
    fn merge_then_validate() {
        let mut image = placeholder_image();
        let report = merge_keys(&mut image, &all_keys(), &BuiltinKeyDatabase, 1).unwrap();
        assert_eq!(report.merged, KeyKind::ALL.to_vec());
        assert!(report.skipped.is_empty());
        image.validate().unwrap();

        let kb = image.locate_key_block_and_compute_size().unwrap();
        let cs = |i: usize| image.word(kb.data_index + i).unwrap();
        assert_eq!((cs(0), cs(1), cs(2)), (0x0002, 0x5b00, 0xa5a5));
        assert_eq!(cs(3), 0x0027);
        assert_eq!(cs(4), 0x1111);
        assert_eq!(cs(12), 0x0100);
        assert_eq!(cs(19), 0x0f0e);
        assert_eq!(cs(20), 0xffff);
        assert_eq!(report.cs_block_crc, image.read_cs_block_crc().unwrap());
    }

    #[test]
    fn merge_is_idempotent() {
        let mut once = placeholder_image();
        merge_keys(&mut once, &all_keys(), &BuiltinKeyDatabase, 1).unwrap();
        let mut twice = once.clone();
        merge_keys(&mut twice, &all_keys(), &BuiltinKeyDatabase, 1).unwrap();
        assert_eq!(once.to_text(), twice.to_text());
    }

    #[test]
    fn unread_keys_keep_placeholders() {
        let mut keys = ProvisioningKeys::new();
        keys.set(KeyKind::CrystalTrim, &[0x05, 0x00]).unwrap();
        let mut image = placeholder_image();
        let report = merge_keys(&mut image, &keys, &BuiltinKeyDatabase, 1).unwrap();
        assert_eq!(report.merged, vec![KeyKind::CrystalTrim]);
        assert_eq!(report.skipped.len(), 3);
        assert!(image.is_valid());
        let kb = image.locate_key_block_and_compute_size().unwrap();
        assert_eq!(image.word(kb.data_index).unwrap(), 0xffff);
    }

    #[test]
    fn unknown_cs_version_is_rejected() {
        let mut image = placeholder_image();
        let err = merge_keys(&mut image, &all_keys(), &BuiltinKeyDatabase, 7).unwrap_err();
        assert!(matches!(err, MergeError::MissingKey { kind: KeyKind::BtAddress, cs_version: 7 }));
    }

    #[test]
    fn small_cs_block_is_rejected() {
        let text = ImageBuilder::new().cs_block(vec![0; 8]).block(0, vec![1]).build();
        let mut image = ImageFile::parse(&text).unwrap();
        let err = merge_keys(&mut image, &all_keys(), &BuiltinKeyDatabase, 1).unwrap_err();
        assert!(matches!(err, MergeError::OutsideCsBlock { kind: KeyKind::IdentityRoot, .. }));
        assert_eq!(image.to_text(), text, "address and trim must not be half-merged");
        assert!(image.is_valid());
    }

    #[test]
    fn no_blocks_is_rejected() {
        let text = ImageBuilder::new().cs_block(vec![0; 20]).build();
        let mut image = ImageFile::parse(&text).unwrap();
        assert!(matches!(
            merge_keys(&mut image, &all_keys(), &BuiltinKeyDatabase, 1),
            Err(MergeError::NoBlocks)
        ));
    }

    #[test]
    fn file_helpers() {
        let dir = std::env::temp_dir().join(format!("otau-merge-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("image.img");
        std::fs::write(&path, placeholder_image().to_text()).unwrap();

        assert!(validate_image_file(&path).unwrap());
        let (image, _) = merge_keys_into_file(&path, &all_keys(), &BuiltinKeyDatabase, 1).unwrap();
        assert!(image.is_valid());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), placeholder_image().to_text());

        assert!(merge_keys_into_file(&dir.join("missing.img"), &all_keys(), &BuiltinKeyDatabase, 1).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
