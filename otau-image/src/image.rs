//! Image file engine
//!
//! Images are line-oriented text: structural lines `@AAAAAA DDDD` carry one
//! 16-bit word each, lines containing `/` are comments. The file is parsed once
//! into records and every operation addresses words by structural index, so
//! comments never shift an offset. Re-serialising reproduces the input
//! byte-for-byte apart from words that were overwritten.
//!
//! Layout by word index:
//!
//! ```text
//! w0              control header CRC (covers w1 .. w3 + section length)
//! w1              block count (low byte) | flags (high byte)
//! w2              section length = 4 * blocks + 2
//! w3 ..           per block: offset, destination, length, crc
//! wK              CS block size in words
//! wK+1            CS block CRC
//! wK+2 ..         CS block data, then the data blocks
//! ```

use std::fmt;
use std::path::Path;

use crate::crc::Crc16;

pub const CONTROL_HEADER_WORDS: usize = 3;
pub const BLOCK_HEADER_WORDS: usize = 4;
pub const CS_HEADER_WORDS: usize = 2;

/// Region covered by one stored CRC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    ControlHeader,
    CsBlock,
    Block(usize),
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::ControlHeader => f.write_str("control header"),
            Region::CsBlock => f.write_str("CS block"),
            Region::Block(i) => write!(f, "block {i}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("failed to read image file: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: malformed word line {text:?}")]
    Malformed { line: usize, text: String },
    #[error("word {index} is past the end of the image ({len} words)")]
    OutOfRange { index: usize, len: usize },
    #[error("invalid word text {0:?}, expected 4 hex digits")]
    BadWordText(String),
    #[error("key needs {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },
    #[error("image declares no blocks")]
    NoBlocks,
    #[error("section length {declared} does not match {blocks} blocks")]
    SectionLength { declared: u16, blocks: u8 },
    #[error("{region} CRC mismatch: stored 0x{stored:04x}, computed 0x{computed:04x}")]
    CrcMismatch {
        region: Region,
        stored: u16,
        computed: u16,
    },
}

/// Header of one data block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub offset: u16,
    pub destination: u16,
    pub length: u16,
    pub crc: u16,
}

/// Position and declared size of the CS-key block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBlock {
    pub header_index: usize,
    pub size: u16,
    pub crc_index: usize,
    pub data_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WordLine {
    /// `@AAAAAA` plus the separating whitespace
    prefix: String,
    address: u32,
    word: u16,
    text: String,
    /// Trailing whitespace and the line terminator
    suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Comment(String),
    Blank(String),
    /// Index into `ImageFile::words`
    Word(usize),
}

/// Working copy of an image file
#[derive(Debug, Clone)]
pub struct ImageFile {
    lines: Vec<Line>,
    /// Structural lines in file order; a word's position here is its index
    words: Vec<WordLine>,
    cursor: usize,
    packets: u32,
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn parse_word_line(body: &str, terminator: &str) -> Option<WordLine> {
    let rest = body.strip_prefix('@')?;
    let address_text = rest.get(..6)?;
    if !is_hex(address_text) {
        return None;
    }
    let after = rest.get(6..)?;
    let digits_at = after.len() - after.trim_start_matches([' ', '\t']).len();
    if digits_at == 0 {
        return None;
    }
    let text = after.get(digits_at..digits_at + 4)?;
    if !is_hex(text) {
        return None;
    }
    let tail = after.get(digits_at + 4..)?;
    if !tail.trim().is_empty() {
        return None;
    }
    Some(WordLine {
        prefix: format!("@{address_text}{}", &after[..digits_at]),
        address: u32::from_str_radix(address_text, 16).ok()?,
        word: u16::from_str_radix(text, 16).ok()?,
        text: text.to_string(),
        suffix: format!("{tail}{terminator}"),
    })
}

impl ImageFile {
    pub fn parse(text: &str) -> Result<Self, ImageError> {
        let mut lines = Vec::new();
        let mut words = Vec::new();

        for (n, raw) in text.split_inclusive('\n').enumerate() {
            let body = raw.strip_suffix('\n').unwrap_or(raw);
            let body = body.strip_suffix('\r').unwrap_or(body);
            let terminator = &raw[body.len()..];

            if body.contains('/') {
                lines.push(Line::Comment(raw.to_string()));
            } else if body.trim().is_empty() {
                lines.push(Line::Blank(raw.to_string()));
            } else {
                let word = parse_word_line(body, terminator).ok_or_else(|| ImageError::Malformed {
                    line: n + 1,
                    text: body.to_string(),
                })?;
                lines.push(Line::Word(words.len()));
                words.push(word);
            }
        }

        Ok(Self { lines, words, cursor: 0, packets: 0 })
    }

    /// Load a private working copy; the file on disk is never touched
    pub fn open(path: &Path) -> Result<Self, ImageError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Comment(s) | Line::Blank(s) => out.push_str(s),
                Line::Word(i) => {
                    let w = &self.words[*i];
                    out.push_str(&w.prefix);
                    out.push_str(&w.text);
                    out.push_str(&w.suffix);
                }
            }
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<(), ImageError> {
        std::fs::write(path, self.to_text())?;
        Ok(())
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Total size in bytes of the transferred word stream
    pub fn file_size(&self) -> usize {
        self.words.len() * 2
    }

    fn word_line(&self, index: usize) -> Result<&WordLine, ImageError> {
        self.words.get(index).ok_or(ImageError::OutOfRange {
            index,
            len: self.words.len(),
        })
    }

    pub fn word(&self, index: usize) -> Result<u16, ImageError> {
        Ok(self.word_line(index)?.word)
    }

    /// Address field of a word line as written in the file
    pub fn address(&self, index: usize) -> Result<u32, ImageError> {
        Ok(self.word_line(index)?.address)
    }

    fn check_range(&self, start: usize, len: usize) -> Result<(), ImageError> {
        if start + len > self.words.len() {
            return Err(ImageError::OutOfRange {
                index: start + len.saturating_sub(1),
                len: self.words.len(),
            });
        }
        Ok(())
    }

    fn crc_range(&self, start: usize, len: usize) -> Result<u16, ImageError> {
        self.check_range(start, len)?;
        let mut crc = Crc16::new();
        for index in start..start + len {
            crc.add_word(self.word(index)?);
        }
        Ok(crc.read())
    }

    pub fn number_of_blocks(&self) -> Result<u8, ImageError> {
        Ok((self.word(1)? & 0x00ff) as u8)
    }

    pub fn flags(&self) -> Result<u8, ImageError> {
        Ok((self.word(1)? >> 8) as u8)
    }

    pub fn section_length(&self) -> Result<u16, ImageError> {
        self.word(2)
    }

    pub fn block_descriptor(&self, block: usize) -> Result<BlockDescriptor, ImageError> {
        let base = CONTROL_HEADER_WORDS + block * BLOCK_HEADER_WORDS;
        Ok(BlockDescriptor {
            offset: self.word(base)?,
            destination: self.word(base + 1)?,
            length: self.word(base + 2)?,
            crc: self.word(base + 3)?,
        })
    }

    pub fn block_descriptors(&self) -> Result<Vec<BlockDescriptor>, ImageError> {
        (0..self.number_of_blocks()? as usize)
            .map(|i| self.block_descriptor(i))
            .collect()
    }

    /// Walk past the block headers to the CS-key block header
    pub fn locate_key_block_and_compute_size(&self) -> Result<KeyBlock, ImageError> {
        let header_index =
            CONTROL_HEADER_WORDS + self.number_of_blocks()? as usize * BLOCK_HEADER_WORDS;
        let size = self.word(header_index)?;
        let data_index = header_index + CS_HEADER_WORDS;
        self.check_range(data_index, size as usize)?;
        Ok(KeyBlock {
            header_index,
            size,
            crc_index: header_index + 1,
            data_index,
        })
    }

    /// Overwrite the 4-hex text of one word, leaving the rest of the line intact
    pub fn merge_word(&mut self, index: usize, hex_text: &str) -> Result<(), ImageError> {
        if hex_text.len() != 4 || !is_hex(hex_text) {
            return Err(ImageError::BadWordText(hex_text.to_string()));
        }
        let word = u16::from_str_radix(hex_text, 16)
            .map_err(|_| ImageError::BadWordText(hex_text.to_string()))?;
        let len = self.words.len();
        let line = self
            .words
            .get_mut(index)
            .ok_or(ImageError::OutOfRange { index, len })?;
        line.word = word;
        line.text = hex_text.to_string();
        Ok(())
    }

    pub fn set_word(&mut self, index: usize, word: u16) -> Result<(), ImageError> {
        self.merge_word(index, &format!("{word:04X}"))
    }

    fn merge_words(&mut self, index: usize, words: &[u16]) -> Result<(), ImageError> {
        self.check_range(index, words.len())?;
        for (i, word) in words.iter().enumerate() {
            self.set_word(index + i, *word)?;
        }
        Ok(())
    }

    fn key_words(bytes: &[u8], words: usize) -> Result<Vec<u16>, ImageError> {
        if bytes.len() < words * 2 {
            return Err(ImageError::KeyLength {
                expected: words * 2,
                actual: bytes.len(),
            });
        }
        Ok(bytes[..words * 2]
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    /// Address bytes are least-significant first; words are written most-significant first
    pub fn merge_bt_address(&mut self, index: usize, address: &[u8]) -> Result<(), ImageError> {
        let mut words = Self::key_words(address, 3)?;
        words.reverse();
        self.merge_words(index, &words)
    }

    pub fn merge_crystal_trim(&mut self, index: usize, trim: &[u8]) -> Result<(), ImageError> {
        let words = Self::key_words(trim, 1)?;
        self.merge_words(index, &words)
    }

    pub fn merge_identity_root(&mut self, index: usize, root: &[u8]) -> Result<(), ImageError> {
        let words = Self::key_words(root, 8)?;
        self.merge_words(index, &words)
    }

    pub fn merge_encryption_root(&mut self, index: usize, root: &[u8]) -> Result<(), ImageError> {
        let words = Self::key_words(root, 8)?;
        self.merge_words(index, &words)
    }

    pub fn read_control_header_crc(&self) -> Result<u16, ImageError> {
        self.word(0)
    }

    pub fn compute_control_header_crc(&self) -> Result<u16, ImageError> {
        self.crc_range(1, CONTROL_HEADER_WORDS - 1 + self.section_length()? as usize)
    }

    pub fn recompute_control_header_crc(&mut self) -> Result<u16, ImageError> {
        let crc = self.compute_control_header_crc()?;
        self.set_word(0, crc)?;
        Ok(crc)
    }

    pub fn read_cs_block_crc(&self) -> Result<u16, ImageError> {
        let kb = self.locate_key_block_and_compute_size()?;
        self.word(kb.crc_index)
    }

    pub fn compute_cs_block_crc(&self) -> Result<u16, ImageError> {
        let kb = self.locate_key_block_and_compute_size()?;
        self.crc_range(kb.data_index, kb.size as usize)
    }

    pub fn recompute_cs_block_crc(&mut self) -> Result<u16, ImageError> {
        let kb = self.locate_key_block_and_compute_size()?;
        let crc = self.crc_range(kb.data_index, kb.size as usize)?;
        self.set_word(kb.crc_index, crc)?;
        Ok(crc)
    }

    /// Check both header CRCs and every block CRC; fails closed
    pub fn validate(&self) -> Result<(), ImageError> {
        let blocks = self.number_of_blocks()?;
        if blocks == 0 {
            return Err(ImageError::NoBlocks);
        }
        let declared = self.section_length()?;
        if declared as usize != blocks as usize * BLOCK_HEADER_WORDS + CS_HEADER_WORDS {
            return Err(ImageError::SectionLength { declared, blocks });
        }

        let stored = self.read_control_header_crc()?;
        let computed = self.compute_control_header_crc()?;
        if stored != computed {
            return Err(ImageError::CrcMismatch { region: Region::ControlHeader, stored, computed });
        }

        let stored = self.read_cs_block_crc()?;
        let computed = self.compute_cs_block_crc()?;
        if stored != computed {
            return Err(ImageError::CrcMismatch { region: Region::CsBlock, stored, computed });
        }

        for (i, block) in self.block_descriptors()?.iter().enumerate() {
            let computed = self.crc_range(block.offset as usize, block.length as usize)?;
            if computed != block.crc {
                return Err(ImageError::CrcMismatch {
                    region: Region::Block(i),
                    stored: block.crc,
                    computed,
                });
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        match self.validate() {
            Ok(()) => true,
            Err(e) => {
                log::debug!("image rejected: {e}");
                false
            }
        }
    }

    /// Next run of words, little-endian, at most `max_bytes` long (whole words, at
    /// least one). An empty result marks the end of the image.
    pub fn get_next_chunk(&mut self, max_bytes: usize) -> Vec<u8> {
        let wanted = (max_bytes / 2).max(1);
        let end = (self.cursor + wanted).min(self.words.len());
        let chunk: Vec<u8> = self.words[self.cursor..end]
            .iter()
            .flat_map(|w| w.word.to_le_bytes())
            .collect();
        self.cursor = end;
        if !chunk.is_empty() {
            self.packets += 1;
        }
        chunk
    }

    pub fn reset_transfer(&mut self) {
        self.cursor = 0;
        self.packets = 0;
    }

    pub fn packets_sent(&self) -> u32 {
        self.packets
    }

    /// Word index the next chunk starts at
    pub fn transfer_position(&self) -> usize {
        self.cursor
    }
}

impl std::str::FromStr for ImageFile {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
