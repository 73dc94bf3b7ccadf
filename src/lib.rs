//! A flash-resident filesystem for a 1 MiB NOR-flash-like device, with its
//! own flash translation layer (wear leveling, out-of-place writes,
//! compacting garbage collection) underneath a small file/tag API.
//!
//! Layering, bottom to top: [`emulator`] (the backing store stand-in) ->
//! [`flash`] (sector access discipline) -> [`ftl`] (logical/physical block
//! translation) -> [`layout`] (on-disk structures) -> [`driver`] (file
//! lifecycle and tags). [`crypt`] and [`codec`] are shared utilities used
//! throughout.

mod codec;
mod crypt;
pub mod driver;
pub mod emulator;
mod error;
mod flash;
mod ftl;
mod layout;

pub use crate::{
	driver::{FileStatus, Filesystem, OpenMode, Whence},
	emulator::{Backend, Emulator},
	error::{FileError, FileResult, Result, Status},
	layout::FLASH_CAPACITY,
};
