//! Block framing for the XMODEM-CRC / YMODEM wire format.
//!
//! Every block is `[SOH][seq][!seq][payload; 128][crc_hi][crc_lo]`. Block 0 of
//! each file carries the file header (`name\0size\0` zero padded); an all-zero
//! block 0 ends the batch.
use std::fmt;

use crc::{CRC_16_XMODEM, Crc};
use thiserror::Error;

use super::{BLOCK_LEN, CHUNK, CTRL_Z, SOH};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

pub const DATA_POS: usize = 3;
pub const CRC_POS: usize = DATA_POS + CHUNK;

/// CRC-16/XMODEM: polynomial 0x1021, initial value 0, no reflection.
pub fn crc16(payload: &[u8]) -> u16 {
    CRC16.checksum(payload)
}

/// Result of checking a received block, in the order the checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Good,
    BadComplement,
    BadCrc,
    Short,
    Extra,
}

/// A file header that does not fit in block 0.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("header for '{name}' needs {len} bytes, block 0 holds {max}", max = CHUNK - 1)]
pub struct HeaderTooLong {
    pub name: String,
    pub len: usize,
}

/// File metadata carried by block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub size: u64,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Block([u8; BLOCK_LEN]);

impl Block {
    fn framed(seq: u8, payload: [u8; CHUNK]) -> Self {
        let mut raw = [0; BLOCK_LEN];
        raw[0] = SOH;
        raw[1] = seq;
        raw[2] = !seq;
        raw[DATA_POS..CRC_POS].copy_from_slice(&payload);
        raw[CRC_POS..].copy_from_slice(&crc16(&payload).to_be_bytes());
        Self(raw)
    }

    pub fn seq(&self) -> u8 {
        self.0[1]
    }

    pub fn payload(&self) -> &[u8] {
        &self.0[DATA_POS..CRC_POS]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("seq", &self.seq())
            .field("crc", &u16::from_be_bytes([self.0[CRC_POS], self.0[CRC_POS + 1]]))
            .finish()
    }
}

/// Builds block 0 for a file. An empty `name` yields the end-of-batch block.
///
/// A header with no room left for its terminating NUL is refused.
pub fn encode_stat_block(seq: u8, name: &str, size: u64) -> Result<Block, HeaderTooLong> {
    if name.is_empty() {
        return Ok(end_of_batch_block(seq));
    }

    let header = format!("{name}\0{size}");
    if header.len() >= CHUNK {
        return Err(HeaderTooLong {
            name: name.to_string(),
            len: header.len() + 1,
        });
    }

    let mut payload = [0; CHUNK];
    payload[..header.len()].copy_from_slice(header.as_bytes());
    Ok(Block::framed(seq, payload))
}

/// Block 0 with an all-zero payload and CRC, ending the batch.
pub fn end_of_batch_block(seq: u8) -> Block {
    Block::framed(seq, [0; CHUNK])
}

/// Builds a data block, padding a short final chunk with CTRL-Z.
pub fn encode_data_block(seq: u8, data: &[u8]) -> Block {
    let mut payload = [CTRL_Z; CHUNK];
    let n = data.len().min(CHUNK);
    payload[..n].copy_from_slice(&data[..n]);
    Block::framed(seq, payload)
}

/// Classifies a complete received block, start marker included.
pub fn validate(raw: &[u8]) -> BlockStatus {
    if raw.len() < BLOCK_LEN {
        return BlockStatus::Short;
    }
    if raw.len() > BLOCK_LEN {
        return BlockStatus::Extra;
    }
    if raw[2] != !raw[1] {
        return BlockStatus::BadComplement;
    }

    let expected = u16::from_be_bytes([raw[CRC_POS], raw[CRC_POS + 1]]);
    if crc16(&raw[DATA_POS..CRC_POS]) != expected {
        return BlockStatus::BadCrc;
    }
    BlockStatus::Good
}

/// Decodes the header in a block 0 payload. Returns `None` for the
/// end-of-batch block.
pub fn parse_stat_payload(payload: &[u8]) -> Option<FileHeader> {
    let mut fields = payload.split(|b| *b == 0);
    let name = fields.next().filter(|name| !name.is_empty())?;

    let size = fields
        .next()
        .map(|digits| {
            digits
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .fold(0u64, |acc, b| {
                    acc.saturating_mul(10).saturating_add(u64::from(b - b'0'))
                })
        })
        .unwrap_or(0);

    Some(FileHeader {
        name: String::from_utf8_lossy(name).into_owned(),
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[0; CHUNK]), 0);
    }

    #[test]
    fn data_blocks_validate() {
        let payload: Vec<u8> = (0..CHUNK as u8).collect();
        for seq in [0, 1, 127, 255] {
            let block = encode_data_block(seq, &payload);
            assert_eq!(validate(block.as_bytes()), BlockStatus::Good);
            assert_eq!(block.seq(), seq);
            assert_eq!(block.payload(), &payload[..]);
        }
    }

    #[test]
    fn short_data_is_padded() {
        let block = encode_data_block(1, b"hello");

        assert_eq!(&block.payload()[..5], b"hello");
        assert!(block.payload()[5..].iter().all(|b| *b == CTRL_Z));
        assert_eq!(validate(block.as_bytes()), BlockStatus::Good);
    }

    #[test]
    fn single_bit_flips_fail_crc() {
        let block = encode_data_block(7, b"the quick brown fox");

        for pos in DATA_POS..CRC_POS {
            for bit in 0..8 {
                let mut raw = block.as_bytes().to_vec();
                raw[pos] ^= 1 << bit;
                assert_eq!(validate(&raw), BlockStatus::BadCrc, "byte {pos} bit {bit}");
            }
        }
    }

    #[test]
    fn length_checked_before_contents() {
        let block = encode_data_block(2, b"x");
        let raw = block.as_bytes();

        assert_eq!(validate(&raw[..BLOCK_LEN - 1]), BlockStatus::Short);

        let mut extra = raw.to_vec();
        extra.push(0);
        extra[2] = 0;
        assert_eq!(validate(&extra), BlockStatus::Extra);
    }

    #[test]
    fn complement_checked_before_crc() {
        let mut raw = encode_data_block(3, b"abc").as_bytes().to_vec();
        raw[2] = 3;
        raw[DATA_POS] ^= 0xff;

        assert_eq!(validate(&raw), BlockStatus::BadComplement);
    }

    #[test]
    fn stat_block_carries_header() {
        let block = encode_stat_block(0, "a.txt", 12).unwrap();

        assert_eq!(validate(block.as_bytes()), BlockStatus::Good);
        assert_eq!(&block.payload()[..9], b"a.txt\x0012\x00");
        assert_eq!(
            parse_stat_payload(block.payload()),
            Some(FileHeader {
                name: "a.txt".into(),
                size: 12
            })
        );
    }

    #[test]
    fn end_of_batch_block_is_zeroed() {
        let block = encode_stat_block(0, "", 0).unwrap();

        assert_eq!(block, end_of_batch_block(0));
        assert!(block.payload().iter().all(|b| *b == 0));
        assert_eq!(validate(block.as_bytes()), BlockStatus::Good);
        assert_eq!(parse_stat_payload(block.payload()), None);
    }

    #[test]
    fn longest_header_keeps_its_nul() {
        // 124 + NUL + "12" leaves exactly one byte
        let name = "x".repeat(124);
        let block = encode_stat_block(0, &name, 12).unwrap();

        assert_eq!(block.payload()[CHUNK - 1], 0);
        assert_eq!(
            parse_stat_payload(block.payload()),
            Some(FileHeader { name, size: 12 })
        );
    }

    #[test]
    fn oversized_header_is_refused() {
        let name = "x".repeat(124);

        assert_eq!(
            encode_stat_block(0, &name, 1000),
            Err(HeaderTooLong {
                name: name.clone(),
                len: 130
            })
        );
        assert!(encode_stat_block(0, &"y".repeat(200), 0).is_err());
    }
}
