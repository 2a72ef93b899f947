//! Protocol module - FOTA service definitions.

pub mod command;
pub mod constants;
pub mod status;

pub use command::CtrlCommand;
pub use constants::*;
pub use status::CtrlStatus;
