//! Flash-write plans.
//!
//! A [`Plan`] is derived from a package and the device's reported version by
//! [`build_plan`], then placed into a chip family's flash window by
//! [`resolve_flash_layout`]. Changing any input means building a new plan.

pub mod layout;
pub mod metadata;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::package::{Package, UpdateItem};
use crate::version::ProductVersion;

pub use layout::{FLASH_LAYOUTS, FlashLayout, flash_layout};
pub use metadata::{MetaData, MetadataError, Placement};

/// Name given to the metadata item.
pub const METADATA_NAME: &str = "metadata";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanError {
    #[error("Unknown chip family index {0}")]
    UnknownChipFamily(usize),
    #[error("Secure flash planning is not supported")]
    SecureUnsupported,
    #[error("Item {name} ({size} bytes) does not fit below 0x{top:08X} in the flash window")]
    WindowOverflow { name: String, size: usize, top: u32 },
    #[error("Flash top 0x{top:08X} is not a page boundary inside 0x{base:08X}..=0x{limit:08X}")]
    InvalidFlashTop { top: u32, base: u32, limit: u32 },
    #[error("Plan has no flash layout yet")]
    Unresolved,
}

/// Device-specific update instructions.
#[derive(Debug, Clone)]
pub struct Plan {
    pub items: Vec<UpdateItem>,
    /// Set by [`resolve_flash_layout`].
    pub meta_data: Option<UpdateItem>,
    pub platform: bool,
    pub app: bool,
    pub manual_reboot: bool,
    pub entry: u32,
    pub page_size: u32,
}

impl Plan {
    /// Nothing needs flashing.
    pub fn is_up_to_date(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_resolved(&self) -> bool {
        self.meta_data.is_some() && self.items.iter().all(|i| i.write_addr.is_some())
    }

    /// Sum of all item sizes, excluding metadata.
    pub fn total_bytes(&self) -> usize {
        self.items.iter().map(UpdateItem::len).sum()
    }
}

/// Decide which components to flash.
///
/// The platform is flashed whenever its version differs from the device's;
/// the app whenever the platform is flashed or the package app is newer.
/// Extra binaries are always included. Packages without a platform always
/// flash the app.
pub fn build_plan(package: &Package, device: &ProductVersion) -> Plan {
    let (platform, app) = match &package.platform {
        Some(_) => {
            let platform = package.version.platform != device.platform;
            (platform, platform || package.version.app > device.app)
        }
        None => (false, true),
    };

    let mut items = Vec::with_capacity(2 + package.extra_bins.len());
    if platform {
        items.extend(package.platform.iter().cloned());
    }
    if app {
        items.push(package.app.clone());
    }
    items.extend(package.extra_bins.iter().cloned());

    debug!(platform, app, items = items.len(), "Built plan");

    Plan {
        items,
        meta_data: None,
        platform,
        app,
        manual_reboot: false,
        entry: package.entry,
        page_size: 0,
    }
}

/// Assign write addresses from the top of the chip family's flash window.
pub fn resolve_flash_layout(
    plan: &mut Plan,
    chip_family: usize,
    secure: bool,
) -> Result<(), PlanError> {
    resolve_flash_layout_with_top(plan, chip_family, secure, None)
}

/// Like [`resolve_flash_layout`], allocating downward from `flash_top` when given.
#[instrument(skip(plan), fields(items = plan.items.len()))]
pub fn resolve_flash_layout_with_top(
    plan: &mut Plan,
    chip_family: usize,
    secure: bool,
    flash_top: Option<u32>,
) -> Result<(), PlanError> {
    if secure {
        return Err(PlanError::SecureUnsupported);
    }
    let layout = flash_layout(chip_family).ok_or(PlanError::UnknownChipFamily(chip_family))?;

    if let Some(top) = flash_top {
        if top % layout.page_size != 0 || top <= layout.base_addr || top > layout.top() {
            return Err(PlanError::InvalidFlashTop {
                top,
                base: layout.base_addr,
                limit: layout.top(),
            });
        }
    }

    // Compute every address before touching the plan so a failure leaves it as it was.
    let mut top = flash_top.unwrap_or_else(|| layout.top());
    let mut addrs = Vec::with_capacity(plan.items.len());
    for item in &plan.items {
        let size = u32::try_from(item.len())
            .ok()
            .and_then(|s| s.checked_next_multiple_of(layout.page_size))
            .filter(|&s| top.checked_sub(s).is_some_and(|a| a >= layout.base_addr))
            .ok_or_else(|| PlanError::WindowOverflow {
                name: item.name.clone(),
                size: item.len(),
                top,
            })?;
        top -= size;
        addrs.push(top);
    }

    plan.manual_reboot = layout.manual_reboot;
    plan.page_size = layout.page_size;

    let mut placements = Vec::with_capacity(addrs.len());
    for (item, addr) in plan.items.iter_mut().zip(addrs) {
        item.write_addr = Some(addr);
        placements.push(Placement {
            write_addr: addr,
            load_addr: item.load_addr,
            size: item.len() as u32,
        });
        debug!(name = %item.name, write_addr = %format!("0x{addr:08X}"), "Placed item");
    }

    let meta = MetaData {
        entry: plan.entry,
        placements,
    };
    plan.meta_data = Some(UpdateItem::new(METADATA_NAME, meta.to_bytes(), 0));

    info!(layout = %layout, lowest = %format!("0x{top:08X}"), "Resolved flash layout");
    Ok(())
}
