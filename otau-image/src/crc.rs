//! 16-bit CRC used for image headers and blocks
//!
//! CRC-16/IBM-3740: MSB-first CCITT polynomial, initial remainder `0xFFFF`,
//! no final XOR. Deployed bootloaders check the same values.

use std::fmt;

use ::crc::{CRC_16_IBM_3740, Crc, Digest};

static CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Running 16-bit remainder, updated one byte at a time
#[derive(Clone)]
pub struct Crc16(Digest<'static, u16>);

impl Crc16 {
    pub const POLYNOMIAL: u16 = CRC_16_IBM_3740.poly;
    pub const INIT: u16 = CRC_16_IBM_3740.init;

    pub fn new() -> Self {
        Self(CCITT.digest())
    }

    pub fn reset(&mut self) {
        self.0 = CCITT.digest();
    }

    pub fn add_byte(&mut self, byte: u8) {
        self.0.update(&[byte]);
    }

    /// Add an image word in its on-wire order (low byte first)
    pub fn add_word(&mut self, word: u16) {
        self.0.update(&word.to_le_bytes());
    }

    pub fn add_slice(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn read(&self) -> u16 {
        self.0.clone().finalize()
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Crc16 {
    fn eq(&self, other: &Self) -> bool {
        self.read() == other.read()
    }
}

impl Eq for Crc16 {}

impl fmt::Debug for Crc16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Crc16(0x{:04x})", self.read())
    }
}

/// CRC over a run of image words
pub fn crc_words(words: &[u16]) -> u16 {
    let mut crc = Crc16::new();
    words.iter().for_each(|&w| crc.add_word(w));
    crc.read()
}
