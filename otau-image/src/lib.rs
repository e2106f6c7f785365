//! OTA image file engine
//!
//! An image is a text file of `@AAAAAA DDDD` word lines. This crate parses it
//! into a private working copy, validates its CRCs, merges per-device keys
//! into its CS block and streams it out in transfer-sized chunks.

pub mod builder;
pub mod crc;
pub mod image;
pub mod keydb;
pub mod keys;
pub mod merge;

pub use builder::ImageBuilder;
pub use self::crc::{Crc16, crc_words};
pub use image::{BlockDescriptor, ImageError, ImageFile, KeyBlock, Region};
pub use keydb::{BuiltinKeyDatabase, JsonKeyDatabase, KeyDatabase, KeyDbError, KeyDescriptor};
pub use keys::{KeyError, KeyKind, ProvisioningKeys};
pub use merge::{MergeError, MergeReport, merge_keys, merge_keys_into_file, validate_image_file};
