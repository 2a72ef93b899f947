//! Commands written to the control characteristic.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

use super::constants::*;
use crate::crypto::SIGNATURE_LEN;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Empty control command")]
    Empty,
    #[error("Unknown control opcode 0x{0:02X}")]
    UnknownOpcode(u8),
    #[error("Truncated control command: {0}")]
    Truncated(#[from] std::io::Error),
}

/// Control-channel command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlCommand {
    Start,
    PageBegin {
        addr: u32,
    },
    PageEnd {
        size: u16,
        crc: u16,
        signature: Option<[u8; SIGNATURE_LEN]>,
    },
    ReadPage {
        addr: u32,
    },
    SwitchApp,
    /// Plain metadata block, CRC included.
    Metadata(Vec<u8>),
    /// Signed metadata: `body` is the encrypted block minus its CRC field.
    SecureMetadata {
        signature: [u8; SIGNATURE_LEN],
        crc: u16,
        body: Vec<u8>,
    },
    Reboot,
}

impl CtrlCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            CtrlCommand::Start => OTA_CTRL_START,
            CtrlCommand::PageBegin { .. } => OTA_CTRL_PAGE_BEGIN,
            CtrlCommand::PageEnd { .. } => OTA_CTRL_PAGE_END,
            CtrlCommand::ReadPage { .. } => OTA_CTRL_READ_PAGE,
            CtrlCommand::SwitchApp => OTA_CTRL_SWITCH_APP,
            CtrlCommand::Metadata(_) | CtrlCommand::SecureMetadata { .. } => OTA_CTRL_METADATA,
            CtrlCommand::Reboot => OTA_CTRL_REBOOT,
        }
    }

    // Writes into a Vec cannot fail; the Results below are discarded with `let _`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![self.opcode()];
        match self {
            CtrlCommand::Start => buf.extend_from_slice(&[0; 4]),
            CtrlCommand::PageBegin { addr } | CtrlCommand::ReadPage { addr } => {
                let _ = buf.write_u32::<LittleEndian>(*addr);
            }
            CtrlCommand::PageEnd {
                size,
                crc,
                signature,
            } => {
                let _ = buf.write_u16::<LittleEndian>(*size);
                let _ = buf.write_u16::<LittleEndian>(*crc);
                if let Some(sig) = signature {
                    buf.extend_from_slice(sig);
                }
            }
            CtrlCommand::Metadata(block) => buf.extend_from_slice(block),
            CtrlCommand::SecureMetadata {
                signature,
                crc,
                body,
            } => {
                buf.extend_from_slice(signature);
                let _ = buf.write_u16::<LittleEndian>(*crc);
                buf.extend_from_slice(body);
            }
            CtrlCommand::SwitchApp | CtrlCommand::Reboot => {}
        }
        buf
    }

    /// Decode a control write. `secure` selects the signed layouts of
    /// PAGE_END and METADATA.
    pub fn parse(data: &[u8], secure: bool) -> Result<Self, CommandError> {
        let (&opcode, rest) = data.split_first().ok_or(CommandError::Empty)?;
        let mut cursor = Cursor::new(rest);
        let read_sig = |cursor: &mut Cursor<&[u8]>| -> Result<[u8; SIGNATURE_LEN], CommandError> {
            let mut sig = [0u8; SIGNATURE_LEN];
            cursor.read_exact(&mut sig)?;
            Ok(sig)
        };

        let cmd = match opcode {
            OTA_CTRL_START => CtrlCommand::Start,
            OTA_CTRL_PAGE_BEGIN => CtrlCommand::PageBegin {
                addr: cursor.read_u32::<LittleEndian>()?,
            },
            OTA_CTRL_READ_PAGE => CtrlCommand::ReadPage {
                addr: cursor.read_u32::<LittleEndian>()?,
            },
            OTA_CTRL_PAGE_END => {
                let size = cursor.read_u16::<LittleEndian>()?;
                let crc = cursor.read_u16::<LittleEndian>()?;
                let signature = if secure {
                    Some(read_sig(&mut cursor)?)
                } else {
                    None
                };
                CtrlCommand::PageEnd {
                    size,
                    crc,
                    signature,
                }
            }
            OTA_CTRL_METADATA if secure => {
                let signature = read_sig(&mut cursor)?;
                let crc = cursor.read_u16::<LittleEndian>()?;
                let mut body = Vec::new();
                cursor.read_to_end(&mut body)?;
                CtrlCommand::SecureMetadata {
                    signature,
                    crc,
                    body,
                }
            }
            OTA_CTRL_METADATA => CtrlCommand::Metadata(rest.to_vec()),
            OTA_CTRL_SWITCH_APP => CtrlCommand::SwitchApp,
            OTA_CTRL_REBOOT => CtrlCommand::Reboot,
            other => return Err(CommandError::UnknownOpcode(other)),
        };
        Ok(cmd)
    }
}
