//! Device drivers.
//!
//! Everything here talks to the core through a narrow interface: block
//! sectors (ATA), decoded input events (keyboard/mouse), or formatted text
//! (console). Register-level programming stays inside each driver.

pub mod ata;
pub mod console;
pub mod keyboard;
pub mod mouse;
