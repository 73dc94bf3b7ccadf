//! Coarse/refined error model (spec §7).
//!
//! The teacher crate builds a single [`std::io::Error`] from a raw `libc`
//! errno via the `err!`/`iobail!` macros (see `ufs/mod.rs`) rather than
//! reaching for `thiserror`/`anyhow`. There is no real errno here — this is
//! a software-emulated device, not a kernel block device — so the two-tier
//! status pair the spec already defines *is* the error type, written the
//! same plain-enum-plus-manual-`Display` way.

use std::fmt;

/// Coarse status returned by every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	NoError,
	/// Target absent, or nothing to do.
	NoAction,
	/// Media, I/O, or integrity failure.
	OperationFailed,
	InvalidParam,
	AccessDenied,
	DeviceBusy,
}

impl fmt::Display for Status {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::NoError => "no error",
			Self::NoAction => "no action",
			Self::OperationFailed => "operation failed",
			Self::InvalidParam => "invalid parameter",
			Self::AccessDenied => "access denied",
			Self::DeviceBusy => "device busy",
		};
		f.write_str(s)
	}
}

impl std::error::Error for Status {}

/// Refined error returned by file-level operations, alongside a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
	Permission,
	NoFile,
	Io,
	Descriptor,
	Busy,
	Exist,
	InvalidParam,
	NameSize,
	FileSize,
	Overflow,
	NoSpace,
}

impl fmt::Display for FileError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Permission => "permission denied",
			Self::NoFile => "no such file",
			Self::Io => "I/O error",
			Self::Descriptor => "invalid descriptor",
			Self::Busy => "file busy",
			Self::Exist => "file exists",
			Self::InvalidParam => "invalid parameter",
			Self::NameSize => "name too long",
			Self::FileSize => "file too large",
			Self::Overflow => "position overflow",
			Self::NoSpace => "no space left",
		};
		f.write_str(s)
	}
}

impl std::error::Error for FileError {}

/// (INTERNAL) Shorthand for the common `Err((Status::OperationFailed, FileError::X))` shape.
///
/// Mirrors the terseness of the teacher's `err!`/`iobail!` macros without
/// pulling in an error-derive crate.
macro_rules! file_fail {
	($status:expr, $err:expr) => {
		return Err(($status, $err))
	};
}

pub(crate) use file_fail;

/// Error type for file-level (C5) operations: always carries both tiers.
pub type FileResult<T> = Result<T, (Status, FileError)>;

/// Error type for layers below C5 (C2-C4), which only carry the coarse status.
pub type Result<T> = std::result::Result<T, Status>;
