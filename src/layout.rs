//! FS layout (C4): a pure-data module. Constants and on-logical-block layout
//! (spec §3/§4.4). No behavior lives here — accessors that read-modify-write
//! a logical block through the FTL belong to [`crate::driver`].

use bincode::{Decode, Encode};

// ---- Flash (C2) constants ----

pub const FLASH_CAPACITY: usize = 1024 * 1024;

/// Sector base addresses, `S0..S12` (13 entries bound 12 sectors). Must match
/// bit-for-bit (spec §6).
pub const SECTOR_BASES: [u32; 13] = [
	0x0800_0000,
	0x0800_4000,
	0x0800_8000,
	0x0800_C000,
	0x0801_0000,
	0x0802_0000,
	0x0804_0000,
	0x0806_0000,
	0x0808_0000,
	0x080A_0000,
	0x080C_0000,
	0x080E_0000,
	0x0810_0000,
];

pub const SECTOR_COUNT: usize = 12;

pub const FLASH_HEADER_MAGIC: u32 = 0x666C_6472;

// ---- FTL (C3) constants ----

pub const FTL_BLOCK_SIZE: usize = 256;
pub const FTL_DESCRIPTOR_SIZE: usize = 6;
/// Payload bytes per FTL frame; the "FS_BLOCK_SIZE" of spec §3 (see
/// SPEC_FULL.md §3 "Wire-size reconciliation").
pub const FTL_PAYLOAD_SIZE: usize = FTL_BLOCK_SIZE - FTL_DESCRIPTOR_SIZE;
pub const FTL_BLOCKS: u32 = 3968;
/// First sector visible to the FTL (sector 0 is "system code", sector 1 hosts
/// the flash header).
pub const FTL_FIRST_SECTOR: usize = 2;

// ---- FS (C4/C5) constants ----

pub const FS_BLOCK_SIZE: usize = FTL_PAYLOAD_SIZE;
pub const FS_DATA_SIZE: usize = FS_BLOCK_SIZE - 2;
pub const FS_MAGIC: u32 = 0x4653_4653;

pub const FS_FILES: usize = 2000;
pub const FS_DESCRIPTORS: usize = 128;
pub const FS_TAGS: usize = 52;

pub const FILE_NAME_SIZE: usize = 50;
pub const TAG_NAME_SIZE: usize = 19;
pub const TAG_BITMAP_SIZE: usize = 7;

/// Sentinel marking "no value" in narrower contexts (truncated as needed).
pub const UN_SET: u32 = 0xFFFF_FFFF;
/// The 16-bit truncation of [`UN_SET`] used for the chain's next-LBI link.
pub const UN_SET_U16: u16 = 0xFFFF;

pub const LBI_SUPERBLOCK: u32 = 0;
pub const LBI_BITMAP_START: u32 = 1;
pub const BITMAP_BLOCKS: u32 = 5;
/// Logical blocks covered by one bitmap block (2 bits/LBI, 4 LBIs/byte).
pub const LBIS_PER_BITMAP_BLOCK: u32 = FS_BLOCK_SIZE as u32 * 4;
pub const LBI_TAGS_START: u32 = LBI_BITMAP_START + BITMAP_BLOCKS; // 6
pub const TAGS_PER_BLOCK: u32 = 13;
pub const TAG_BLOCKS: u32 = 4;
pub const LBI_FILENAMES_START: u32 = LBI_TAGS_START + TAG_BLOCKS; // 10
pub const FILENAMES_PER_BLOCK: u32 = 5;
pub const FILENAME_BLOCKS: u32 = 400;
pub const LBI_HEADERS_START: u32 = LBI_FILENAMES_START + FILENAME_BLOCKS; // 410
pub const HEADERS_PER_BLOCK: u32 = 10;
pub const HEADER_BLOCKS: u32 = 200;
/// `id(4) + lbi_start(4) + tags(7) + size(4) + crc32(4)`, fixed-int little-endian.
pub const FILE_HEADER_WIRE_SIZE: usize = 23;
pub const LBI_DATA_START: u32 = LBI_HEADERS_START + HEADER_BLOCKS; // 610

/// Upper bound on a single file's size: one chain link per data block, so the
/// whole data region could in principle belong to one file.
pub const FS_MAX_FILE_SIZE: u32 = FS_DATA_SIZE as u32 * (FTL_BLOCKS - LBI_DATA_START);

const _: () = assert!(LBI_DATA_START == 610);
const _: () = assert!((BITMAP_BLOCKS as usize) * FS_BLOCK_SIZE * 4 >= FTL_BLOCKS as usize);
const _: () = assert!((TAGS_PER_BLOCK as usize) * TAG_NAME_SIZE <= FS_BLOCK_SIZE);
const _: () = assert!((FILENAMES_PER_BLOCK as usize) * FILE_NAME_SIZE <= FS_BLOCK_SIZE);
const _: () = assert!((HEADERS_PER_BLOCK as usize) * FILE_HEADER_WIRE_SIZE <= FS_BLOCK_SIZE);

/// On-disk FS superblock (spec §3 "FS superblock").
#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct Superblock {
	pub magic: u32,
}

impl Superblock {
	pub fn valid() -> Self {
		Self { magic: FS_MAGIC }
	}

	pub fn is_valid(&self) -> bool {
		self.magic == FS_MAGIC
	}
}

/// Per-file header, one of [`FS_FILES`] slots (spec §3 "File-header table").
#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct FileHeader {
	pub id: u32,
	pub lbi_start: u32,
	pub tags: [u8; TAG_BITMAP_SIZE],
	pub size: u32,
	pub crc32: u32,
}

impl FileHeader {
	pub fn empty() -> Self {
		Self {
			id: UN_SET,
			lbi_start: UN_SET,
			tags: [0u8; TAG_BITMAP_SIZE],
			size: 0,
			crc32: 0,
		}
	}
}

/// Block-flag bitmap values, 2 bits per logical block (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFlag {
	System = 1,
	Free = 2,
	Used = 3,
}

impl BlockFlag {
	pub fn from_bits(bits: u8) -> Option<Self> {
		match bits {
			1 => Some(Self::System),
			2 => Some(Self::Free),
			3 => Some(Self::Used),
			_ => None,
		}
	}
}
