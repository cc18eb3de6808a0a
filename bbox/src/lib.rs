//! Box geometry shared by labels and anchor matching.

mod common;

pub use cycxhw::*;
pub mod cycxhw;

pub use hw::*;
pub mod hw;
