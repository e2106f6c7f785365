//! Build well-formed image text from blocks and a CS block
//!
//! Used to produce fixtures and placeholder images; every CRC is computed here.

use crate::crc::crc_words;
use crate::image::{BLOCK_HEADER_WORDS, CONTROL_HEADER_WORDS, CS_HEADER_WORDS};

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    flags: u8,
    cs_block: Vec<u16>,
    blocks: Vec<(u16, Vec<u16>)>,
    comments: bool,
    line_ending: &'static str,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self {
            flags: 0,
            cs_block: Vec::new(),
            blocks: Vec::new(),
            comments: false,
            line_ending: "\n",
        }
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn cs_block(mut self, words: Vec<u16>) -> Self {
        self.cs_block = words;
        self
    }

    pub fn block(mut self, destination: u16, words: Vec<u16>) -> Self {
        self.blocks.push((destination, words));
        self
    }

    /// Interleave `//` comment lines between sections
    pub fn with_comments(mut self) -> Self {
        self.comments = true;
        self
    }

    pub fn crlf(mut self) -> Self {
        self.line_ending = "\r\n";
        self
    }

    /// Word stream in structural order, CRCs filled in
    pub fn words(&self) -> Vec<u16> {
        let n = self.blocks.len();
        let section_length = n * BLOCK_HEADER_WORDS + CS_HEADER_WORDS;
        let mut offset = CONTROL_HEADER_WORDS + section_length + self.cs_block.len();

        let mut words = vec![0, (n as u16 & 0x00ff) | ((self.flags as u16) << 8), section_length as u16];
        for (destination, data) in &self.blocks {
            words.extend_from_slice(&[offset as u16, *destination, data.len() as u16, crc_words(data)]);
            offset += data.len();
        }
        words.push(self.cs_block.len() as u16);
        words.push(crc_words(&self.cs_block));
        words.extend_from_slice(&self.cs_block);
        for (_, data) in &self.blocks {
            words.extend_from_slice(data);
        }
        words[0] = crc_words(&words[1..CONTROL_HEADER_WORDS + section_length]);
        words
    }

    pub fn build(&self) -> String {
        let words = self.words();
        let n = self.blocks.len();
        let cs_start = CONTROL_HEADER_WORDS + n * BLOCK_HEADER_WORDS;
        let data_start = cs_start + CS_HEADER_WORDS + self.cs_block.len();
        let le = self.line_ending;

        let mut out = String::new();
        if self.comments {
            out.push_str(&format!("// control header{le}"));
        }
        for (i, word) in words.iter().enumerate() {
            if self.comments && i == cs_start {
                out.push_str(&format!("// cs keys{le}{le}"));
            }
            if self.comments && i == data_start {
                out.push_str(&format!("/* data */{le}"));
            }
            out.push_str(&format!("@{i:06X} {word:04X}{le}"));
        }
        out
    }
}
