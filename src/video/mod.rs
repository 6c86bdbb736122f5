//! Color conversion and GPU surface management (C4).

pub mod convert;
pub mod surface;

pub use convert::{yuy2_to_nv12, Nv12Frame};
pub use surface::{GpuSurface, SurfaceGeometry};
