//! Metadata block written to the device after the binaries.
//!
//! Layout (little-endian):
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 2 | CRC-16 over bytes 2.. |
//! | 2 | 4 | entry |
//! | 6 + 12n | 12 | write address, load address, size |

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::checksum::crc16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Metadata length {0} is not 6 + 12n")]
    BadLength(usize),
    #[error("Metadata CRC mismatch: stored 0x{stored:04X}, computed 0x{computed:04X}")]
    CrcMismatch { stored: u16, computed: u16 },
}

/// Placement of one item in flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub write_addr: u32,
    pub load_addr: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaData {
    pub entry: u32,
    pub placements: Vec<Placement>,
}

impl MetaData {
    pub const HEADER_SIZE: usize = 6;
    pub const PLACEMENT_SIZE: usize = 12;

    pub fn encoded_len(count: usize) -> usize {
        Self::HEADER_SIZE + Self::PLACEMENT_SIZE * count
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::encoded_len(self.placements.len())];
        LittleEndian::write_u32(&mut buf[2..6], self.entry);
        for (chunk, p) in buf[Self::HEADER_SIZE..]
            .chunks_exact_mut(Self::PLACEMENT_SIZE)
            .zip(&self.placements)
        {
            LittleEndian::write_u32(&mut chunk[0..4], p.write_addr);
            LittleEndian::write_u32(&mut chunk[4..8], p.load_addr);
            LittleEndian::write_u32(&mut chunk[8..12], p.size);
        }
        let crc = crc16(&buf[2..]);
        LittleEndian::write_u16(&mut buf[0..2], crc);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MetadataError> {
        if data.len() < Self::HEADER_SIZE
            || (data.len() - Self::HEADER_SIZE) % Self::PLACEMENT_SIZE != 0
        {
            return Err(MetadataError::BadLength(data.len()));
        }

        let stored = LittleEndian::read_u16(&data[0..2]);
        let computed = crc16(&data[2..]);
        if stored != computed {
            return Err(MetadataError::CrcMismatch { stored, computed });
        }

        let placements = data[Self::HEADER_SIZE..]
            .chunks_exact(Self::PLACEMENT_SIZE)
            .map(|c| Placement {
                write_addr: LittleEndian::read_u32(&c[0..4]),
                load_addr: LittleEndian::read_u32(&c[4..8]),
                size: LittleEndian::read_u32(&c[8..12]),
            })
            .collect();

        Ok(Self {
            entry: LittleEndian::read_u32(&data[2..6]),
            placements,
        })
    }
}
