// vim: tw=80
//! Userspace access to Open-Channel SSDs
//!
//! Open-Channel devices expose their physical layout to the host.  This crate
//! addresses that layout directly: it converts between address encodings,
//! builds and submits erase, write, and read commands synchronously or
//! asynchronously, manages the per-unit bad block tables, and stripes I/O
//! over several chunks with [`vblk::VirtualBlock`].

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// Errno names are acronyms, and that's how they should look.
#![allow(clippy::upper_case_acronyms)]

pub mod addr;
pub mod async_ctx;
pub mod backend;
pub mod bbt;
pub mod buf;
pub mod cmd;
pub mod dev;
pub mod geometry;
pub mod nvme;
pub mod options;
pub mod sgl;
pub mod types;
pub mod util;
pub mod vblk;

pub use crate::types::*;
pub use crate::util::*;
