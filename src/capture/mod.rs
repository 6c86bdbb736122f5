//! Capture-side components: the A/V handoff slot (C2) and the driver
//! adapter (C3) that feeds it.

pub mod avslot;
pub mod driver;

pub use avslot::AvSlot;
pub use driver::CaptureDriver;
