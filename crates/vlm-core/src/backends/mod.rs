//! Concrete model backends.

mod device;
pub mod gemma3;

pub use device::{DeviceKind, DeviceProfile};
pub use gemma3::{Gemma3Loader, Gemma3TextModel};
