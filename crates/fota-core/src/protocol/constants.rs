//! FOTA GATT service identifiers and control opcodes.

pub const SERVICE_NAME: &str = "INGChips FOTA Service";

pub const GUID_SERVICE: &str = "3345c2f0-6f36-45c5-8541-92f56728d5f3";
pub const GUID_CHAR_OTA_VER: &str = "3345c2f1-6f36-45c5-8541-92f56728d5f3";
pub const GUID_CHAR_OTA_CTRL: &str = "3345c2f2-6f36-45c5-8541-92f56728d5f3";
pub const GUID_CHAR_OTA_DATA: &str = "3345c2f3-6f36-45c5-8541-92f56728d5f3";
/// Present only on devices that require the secure path.
pub const GUID_CHAR_OTA_PUBKEY: &str = "3345c2f4-6f36-45c5-8541-92f56728d5f3";

// Control status values
pub const OTA_CTRL_STATUS_DISABLED: u8 = 0;
pub const OTA_CTRL_STATUS_OK: u8 = 1;
pub const OTA_CTRL_STATUS_ERROR: u8 = 2;
pub const OTA_CTRL_STATUS_WAIT_DATA: u8 = 3;

// Control opcodes
pub const OTA_CTRL_START: u8 = 0xAA; // param: none
pub const OTA_CTRL_PAGE_BEGIN: u8 = 0xB0; // param: page address, DATA follows
pub const OTA_CTRL_PAGE_END: u8 = 0xB1; // param: size, crc [, signature]
pub const OTA_CTRL_READ_PAGE: u8 = 0xC0; // param: page address
pub const OTA_CTRL_SWITCH_APP: u8 = 0xD0; // param: none
pub const OTA_CTRL_METADATA: u8 = 0xE0; // param: metadata block
pub const OTA_CTRL_REBOOT: u8 = 0xFF; // param: none

/// ATT MTU requested on connect.
pub const DEFAULT_REQUESTED_MTU: usize = 512;
/// ATT MTU when negotiation fails.
pub const DEFAULT_ATT_MTU: usize = 23;
/// ATT write header overhead.
pub const ATT_HEADER_SIZE: usize = 3;

pub const MAX_RETRY: u32 = 3;
pub const WAIT_BETWEEN_MTU_MS: u64 = 10;
pub const WAIT_BETWEEN_PAGE_MS: u64 = 80;
