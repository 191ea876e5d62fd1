#![allow(missing_docs)]

pub mod events;
pub mod identifiers;
pub mod serde;
pub mod sliding;
pub mod to_device;

pub use self::identifiers::*;
