//! Flash layout registry, one entry per chip family.

use std::fmt;

/// Flash window reserved for update images on one chip family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLayout {
    pub name: &'static str,
    pub base_addr: u32,
    pub total_size: u32,
    pub page_size: u32,
    pub manual_reboot: bool,
}

impl FlashLayout {
    /// First address past the window; allocation starts here.
    pub const fn top(&self) -> u32 {
        self.base_addr + self.total_size
    }

    /// Round `size` up to whole pages.
    pub const fn page_align(&self, size: u32) -> u32 {
        size.div_ceil(self.page_size) * self.page_size
    }
}

impl fmt::Display for FlashLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: base 0x{:08X}, {} KiB window, {} KiB pages, {} reboot",
            self.name,
            self.base_addr,
            self.total_size / 1024,
            self.page_size / 1024,
            if self.manual_reboot { "manual" } else { "automatic" }
        )
    }
}

/// Chip family 0.
pub const ING918: FlashLayout = FlashLayout {
    name: "ING9187xx/ING9186xx",
    base_addr: 0x0000_4000,
    total_size: 512 * 1024,
    page_size: 8 * 1024,
    manual_reboot: true,
};

/// Chip family 1.
pub const ING916: FlashLayout = FlashLayout {
    name: "ING9168xx",
    base_addr: 0x0200_0000,
    total_size: 512 * 1024,
    page_size: 4 * 1024,
    manual_reboot: false,
};

/// Registry indexed by chip-family selector.
pub const FLASH_LAYOUTS: &[FlashLayout] = &[ING918, ING916];

/// Look up a chip family.
pub fn flash_layout(chip_family: usize) -> Option<&'static FlashLayout> {
    FLASH_LAYOUTS.get(chip_family)
}
