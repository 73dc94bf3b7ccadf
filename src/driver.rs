//! Filesystem driver (C5, spec §4.5): file lifecycle, descriptor table, tag
//! add/remove/rename, format-on-invalid-superblock. Ground-truthed against
//! `fs_driver.c`/`.__old_fs_driver.c`, with the `file_create`-on-existing-name
//! open question resolved per SPEC_FULL.md §9 (reject with `Exist` rather than
//! reproducing the original's undefined fall-through).

use log::{debug, info, warn};

use crate::{
	codec::{decode_le, encode_le},
	emulator::Backend,
	error::{file_fail, FileError, FileResult, Result, Status},
	flash::Flash,
	ftl::Ftl,
	layout::{
		BlockFlag, FileHeader, Superblock, BITMAP_BLOCKS, FILENAMES_PER_BLOCK, FILENAME_BLOCKS, FILE_HEADER_WIRE_SIZE,
		FILE_NAME_SIZE, FS_BLOCK_SIZE, FS_DATA_SIZE, FS_DESCRIPTORS, FS_FILES, FS_MAX_FILE_SIZE, FS_TAGS, FTL_BLOCKS,
		HEADERS_PER_BLOCK, HEADER_BLOCKS, LBIS_PER_BITMAP_BLOCK, LBI_BITMAP_START, LBI_DATA_START, LBI_FILENAMES_START,
		LBI_HEADERS_START, LBI_SUPERBLOCK, LBI_TAGS_START, TAGS_PER_BLOCK, TAG_BITMAP_SIZE, TAG_BLOCKS, TAG_NAME_SIZE,
		UN_SET, UN_SET_U16,
	},
};

/// Mode a file was opened under (spec §3 "File descriptor").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
	ReadOnly,
	ReadWrite,
}

/// Seek origin (spec §4.5 "File seek").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
	Set,
	Cur,
	End,
}

/// Snapshot of an open file's status, as returned by `file_status` (spec §6
/// public API surface, `FILE_STATUS_TYPE`).
#[derive(Debug, Clone)]
pub struct FileStatus {
	pub size:     u32,
	pub position: u32,
	pub mode:     OpenMode,
	pub tags:     [u8; TAG_BITMAP_SIZE],
}

struct Descriptor {
	id:     u32,
	name:   [u8; FILE_NAME_SIZE],
	header: FileHeader,
	status: FileStatus,
}

/// The top-level filesystem handle: owns the FTL (which owns the flash
/// layer), the RAM-resident bitmap and tag-name caches, and the descriptor
/// table. Lifetime is `init` -> `teardown` (spec §9 re-architecture guidance).
pub struct Filesystem<B: Backend> {
	ftl:        Ftl<B>,
	bitmap:     Vec<BlockFlag>,
	tag_names:  [[u8; TAG_NAME_SIZE]; FS_TAGS],
	descriptors: Vec<Option<Descriptor>>,
}

fn encode_name(name: &str) -> std::result::Result<[u8; FILE_NAME_SIZE], FileError> {
	let bytes = name.as_bytes();
	if bytes.is_empty() || bytes.len() >= FILE_NAME_SIZE {
		return Err(FileError::NameSize);
	}
	let mut out = [0u8; FILE_NAME_SIZE];
	out[..bytes.len()].copy_from_slice(bytes);
	Ok(out)
}

fn encode_tag(tag: &str) -> Option<[u8; TAG_NAME_SIZE]> {
	let bytes = tag.as_bytes();
	if bytes.is_empty() || bytes.len() >= TAG_NAME_SIZE {
		return None;
	}
	let mut out = [0u8; TAG_NAME_SIZE];
	out[..bytes.len()].copy_from_slice(bytes);
	Some(out)
}

/// Interprets a raw chain next-pointer per spec §3: `0xFFFF` or any value
/// `>= FTL_BLOCKS` marks end-of-chain, reported as [`UN_SET`].
fn normalize_next(raw: u16) -> u32 {
	if raw == UN_SET_U16 || raw as u32 >= FTL_BLOCKS {
		UN_SET
	} else {
		raw as u32
	}
}

impl<B: Backend> Filesystem<B> {
	/// Brings up the FTL, reads the superblock, and either loads the bitmap
	/// and tag-name table from flash or formats a fresh filesystem (spec
	/// §4.5 "Initialization").
	pub fn init(emulator: crate::emulator::Emulator<B>) -> Result<Self> {
		let flash = Flash::init(emulator)?;
		let ftl = Ftl::init(flash)?;
		let mut fs = Self {
			ftl,
			bitmap: vec![BlockFlag::Free; FTL_BLOCKS as usize],
			tag_names: [[0u8; TAG_NAME_SIZE]; FS_TAGS],
			descriptors: (0..FS_DESCRIPTORS).map(|_| None).collect(),
		};

		let sb_valid = match fs.block_read(LBI_SUPERBLOCK) {
			Ok(buf) => decode_le::<Superblock>(&buf[..4]).map(|sb| sb.is_valid()).unwrap_or(false),
			Err(_) => false,
		};

		if sb_valid {
			debug!("driver: superblock valid, loading bitmap and tag names");
			fs.bitmap_load()?;
			fs.tag_names_load()?;
		} else {
			warn!("driver: superblock absent or invalid, formatting");
			fs.format()?;
		}

		info!("driver: initialized");
		Ok(fs)
	}

	/// Tears down the FTL (and, transitively, the flash layer).
	pub fn teardown(self) -> Result<()> {
		self.ftl.teardown()
	}

	// ---- block-level plumbing ----

	fn block_read(&mut self, lbi: u32) -> Result<[u8; FS_BLOCK_SIZE]> {
		let mut buf = [0u8; FS_BLOCK_SIZE];
		self.ftl.read(lbi, 1, &mut buf)?;
		Ok(buf)
	}

	fn block_write(&mut self, lbi: u32, data: &[u8; FS_BLOCK_SIZE]) -> Result<()> {
		self.ftl.write(lbi, 1, data)
	}

	fn block_next_get(&mut self, lbi: u32) -> Result<u32> {
		let data = self.block_read(lbi)?;
		Ok(normalize_next(u16::from_be_bytes([data[0], data[1]])))
	}

	fn block_next_set(&mut self, lbi: u32, next: u32) -> Result<()> {
		let mut data = self.block_read(lbi)?;
		let raw: u16 = if next >= FTL_BLOCKS { UN_SET_U16 } else { next as u16 };
		data[0..2].copy_from_slice(&raw.to_be_bytes());
		self.block_write(lbi, &data)
	}

	fn empty_chain_block() -> [u8; FS_BLOCK_SIZE] {
		let mut block = [0u8; FS_BLOCK_SIZE];
		block[0..2].copy_from_slice(&UN_SET_U16.to_be_bytes());
		block
	}

	// ---- block-flag bitmap (spec §4.4/§9 "BLOCKFLAG_READ"/"_WRITE") ----

	fn bitmap_load(&mut self) -> Result<()> {
		for block_idx in 0..BITMAP_BLOCKS {
			let data = self.block_read(LBI_BITMAP_START + block_idx)?;
			let base = block_idx * LBIS_PER_BITMAP_BLOCK;
			for i in 0..LBIS_PER_BITMAP_BLOCK {
				let lbi = base + i;
				if lbi >= FTL_BLOCKS {
					break;
				}
				let byte = data[(i / 4) as usize];
				let shift = (i % 4) * 2;
				let bits = (byte >> shift) & 0x03;
				self.bitmap[lbi as usize] = BlockFlag::from_bits(bits).unwrap_or(BlockFlag::Free);
			}
		}
		Ok(())
	}

	fn persist_bitmap_block(&mut self, block_idx: u32) -> Result<()> {
		let base = block_idx * LBIS_PER_BITMAP_BLOCK;
		let mut data = [0u8; FS_BLOCK_SIZE];
		for i in 0..LBIS_PER_BITMAP_BLOCK {
			let lbi = base + i;
			if lbi >= FTL_BLOCKS {
				break;
			}
			let byte_idx = (i / 4) as usize;
			let shift = (i % 4) * 2;
			data[byte_idx] |= (self.bitmap[lbi as usize] as u8) << shift;
		}
		self.block_write(LBI_BITMAP_START + block_idx, &data)
	}

	fn blockflag_write(&mut self, lbi: u32, flag: BlockFlag) -> Result<()> {
		self.bitmap[lbi as usize] = flag;
		self.persist_bitmap_block(lbi / LBIS_PER_BITMAP_BLOCK)
	}

	/// Linear scan of the data region for the first `Free` block, flipping it
	/// `Used` (spec §4.5 "Block allocation").
	fn block_allocate(&mut self) -> Result<u32> {
		for lbi in LBI_DATA_START..FTL_BLOCKS {
			if self.bitmap[lbi as usize] == BlockFlag::Free {
				self.blockflag_write(lbi, BlockFlag::Used)?;
				return Ok(lbi);
			}
		}
		warn!("driver: data region exhausted");
		Err(Status::OperationFailed)
	}

	// ---- tag-name table ----

	fn tag_names_load(&mut self) -> Result<()> {
		for block_idx in 0..TAG_BLOCKS {
			let data = self.block_read(LBI_TAGS_START + block_idx)?;
			for slot in 0..TAGS_PER_BLOCK {
				let idx = (block_idx * TAGS_PER_BLOCK + slot) as usize;
				if idx >= FS_TAGS {
					break;
				}
				let offset = (slot * TAG_NAME_SIZE as u32) as usize;
				self.tag_names[idx].copy_from_slice(&data[offset..offset + TAG_NAME_SIZE]);
			}
		}
		Ok(())
	}

	fn persist_tag_block(&mut self, idx: usize) -> Result<()> {
		let block_idx = (idx as u32) / TAGS_PER_BLOCK;
		let offset = ((idx as u32 % TAGS_PER_BLOCK) * TAG_NAME_SIZE as u32) as usize;
		let mut data = self.block_read(LBI_TAGS_START + block_idx)?;
		data[offset..offset + TAG_NAME_SIZE].copy_from_slice(&self.tag_names[idx]);
		self.block_write(LBI_TAGS_START + block_idx, &data)
	}

	// ---- filename table ----

	fn filename_read(&mut self, id: u32) -> Result<[u8; FILE_NAME_SIZE]> {
		let block = LBI_FILENAMES_START + id / FILENAMES_PER_BLOCK;
		let offset = ((id % FILENAMES_PER_BLOCK) * FILE_NAME_SIZE as u32) as usize;
		let data = self.block_read(block)?;
		let mut name = [0u8; FILE_NAME_SIZE];
		name.copy_from_slice(&data[offset..offset + FILE_NAME_SIZE]);
		Ok(name)
	}

	fn filename_write(&mut self, id: u32, name: &[u8; FILE_NAME_SIZE]) -> Result<()> {
		let block = LBI_FILENAMES_START + id / FILENAMES_PER_BLOCK;
		let offset = ((id % FILENAMES_PER_BLOCK) * FILE_NAME_SIZE as u32) as usize;
		let mut data = self.block_read(block)?;
		data[offset..offset + FILE_NAME_SIZE].copy_from_slice(name);
		self.block_write(block, &data)
	}

	/// Linear scan for a file by name (spec §4.5, `FS_FILE_FIND`). An empty
	/// slot (`name[0] == 0`) is skipped.
	fn file_find(&mut self, name: &[u8; FILE_NAME_SIZE]) -> Result<Option<u32>> {
		for id in 0..FS_FILES as u32 {
			let cur = self.filename_read(id)?;
			if cur[0] == 0 {
				continue;
			}
			if cur == *name {
				return Ok(Some(id));
			}
		}
		Ok(None)
	}

	// ---- file-header table ----

	fn fileheader_read(&mut self, id: u32) -> Result<FileHeader> {
		let block = LBI_HEADERS_START + id / HEADERS_PER_BLOCK;
		let offset = ((id % HEADERS_PER_BLOCK) * FILE_HEADER_WIRE_SIZE as u32) as usize;
		let data = self.block_read(block)?;
		decode_le(&data[offset..offset + FILE_HEADER_WIRE_SIZE]).map_err(|_| Status::OperationFailed)
	}

	fn fileheader_write(&mut self, id: u32, header: &FileHeader) -> Result<()> {
		let block = LBI_HEADERS_START + id / HEADERS_PER_BLOCK;
		let offset = ((id % HEADERS_PER_BLOCK) * FILE_HEADER_WIRE_SIZE as u32) as usize;
		let mut data = self.block_read(block)?;
		encode_le(header, &mut data[offset..offset + FILE_HEADER_WIRE_SIZE]).map_err(|_| Status::OperationFailed)?;
		self.block_write(block, &data)
	}

	// ---- format ----

	/// Writes a fresh superblock, resets the bitmap/tag/filename/header
	/// regions, and runs GC twice (spec §4.5 "Format").
	fn format(&mut self) -> Result<()> {
		let mut sb_block = [0u8; FS_BLOCK_SIZE];
		encode_le(&Superblock::valid(), &mut sb_block[..4]).map_err(|_| Status::OperationFailed)?;
		self.block_write(LBI_SUPERBLOCK, &sb_block)?;

		for lbi in 0..LBI_DATA_START {
			self.bitmap[lbi as usize] = BlockFlag::System;
		}
		for lbi in LBI_DATA_START..FTL_BLOCKS {
			self.bitmap[lbi as usize] = BlockFlag::Free;
		}
		for block_idx in 0..BITMAP_BLOCKS {
			self.persist_bitmap_block(block_idx)?;
		}

		for t in self.tag_names.iter_mut() {
			*t = [0u8; TAG_NAME_SIZE];
		}
		for idx in 0..FS_TAGS {
			self.persist_tag_block(idx)?;
		}

		let zero = [0u8; FS_BLOCK_SIZE];
		for block_idx in 0..FILENAME_BLOCKS {
			self.block_write(LBI_FILENAMES_START + block_idx, &zero)?;
		}
		self.ftl.garbage_collect()?;

		for block_idx in 0..HEADER_BLOCKS {
			self.block_write(LBI_HEADERS_START + block_idx, &zero)?;
		}
		self.ftl.garbage_collect()?;

		debug!("driver: formatted");
		Ok(())
	}

	// ---- descriptor table ----

	fn descriptor_index(&self, fd: u32) -> FileResult<usize> {
		let idx = fd as usize;
		if idx >= FS_DESCRIPTORS || self.descriptors[idx].is_none() {
			file_fail!(Status::InvalidParam, FileError::Descriptor);
		}
		Ok(idx)
	}

	// ---- file lifecycle ----

	/// Creates a file, rejecting a name collision up front (spec §9, resolved
	/// open question).
	pub fn file_create(&mut self, name: &str) -> FileResult<()> {
		let name_bytes = encode_name(name).map_err(|e| (Status::InvalidParam, e))?;
		if self.file_find(&name_bytes).map_err(|s| (s, FileError::Io))?.is_some() {
			file_fail!(Status::OperationFailed, FileError::Exist);
		}

		let mut slot = None;
		for id in 0..FS_FILES as u32 {
			if self.filename_read(id).map_err(|s| (s, FileError::Io))?[0] == 0 {
				slot = Some(id);
				break;
			}
		}
		let id = match slot {
			Some(id) => id,
			None => file_fail!(Status::OperationFailed, FileError::NoSpace),
		};

		let lbi = match self.block_allocate() {
			Ok(lbi) => lbi,
			Err(_) => file_fail!(Status::OperationFailed, FileError::NoSpace),
		};

		let header = FileHeader { id, lbi_start: lbi, tags: [0u8; TAG_BITMAP_SIZE], size: 0, crc32: 0 };

		if self.block_write(lbi, &Self::empty_chain_block()).is_err() {
			file_fail!(Status::OperationFailed, FileError::Io);
		}
		if self.filename_write(id, &name_bytes).is_err() {
			file_fail!(Status::OperationFailed, FileError::Io);
		}
		if self.fileheader_write(id, &header).is_err() {
			file_fail!(Status::OperationFailed, FileError::Io);
		}

		debug!("driver: created file id={id} lbi_start={lbi}");
		Ok(())
	}

	/// Opens a file by name, failing `Busy` if it is already open or no
	/// descriptor slot is free (spec §4.5 "File open").
	pub fn file_open(&mut self, name: &str, mode: OpenMode) -> FileResult<u32> {
		let name_bytes = encode_name(name).map_err(|e| (Status::InvalidParam, e))?;
		let id = match self.file_find(&name_bytes) {
			Ok(Some(id)) => id,
			Ok(None) => file_fail!(Status::OperationFailed, FileError::NoFile),
			Err(_) => file_fail!(Status::OperationFailed, FileError::Io),
		};

		if self.descriptors.iter().flatten().any(|d| d.id == id) {
			file_fail!(Status::OperationFailed, FileError::Busy);
		}

		let slot = match self.descriptors.iter().position(|d| d.is_none()) {
			Some(slot) => slot,
			None => file_fail!(Status::OperationFailed, FileError::Busy),
		};

		let header = match self.fileheader_read(id) {
			Ok(h) => h,
			Err(_) => file_fail!(Status::OperationFailed, FileError::Io),
		};

		let status = FileStatus { size: header.size, position: 0, mode, tags: header.tags };
		self.descriptors[slot] = Some(Descriptor { id, name: name_bytes, header, status });
		debug!("driver: opened file id={id} -> fd={slot}");
		Ok(slot as u32)
	}

	/// Closes a descriptor, persisting the header if `position != size`
	/// (spec §4.5 "File close", preserved verbatim including the shrink
	/// non-goal of §9).
	pub fn file_close(&mut self, fd: u32) -> FileResult<()> {
		let idx = self.descriptor_index(fd)?;
		let (id, position, size, header) = {
			let d = self.descriptors[idx].as_ref().unwrap();
			(d.id, d.status.position, d.header.size, d.header)
		};

		if position != size {
			if self.fileheader_write(id, &header).is_err() {
				file_fail!(Status::OperationFailed, FileError::Io);
			}
		}

		self.descriptors[idx] = None;
		Ok(())
	}

	/// Reads up to `buf.len()` bytes from the descriptor's current position,
	/// returning the number of bytes actually read. EOF is a short read, not
	/// an error (spec §4.5 "File read").
	pub fn file_read(&mut self, fd: u32, buf: &mut [u8]) -> FileResult<usize> {
		let idx = self.descriptor_index(fd)?;
		let (lbi_start, size, position) = {
			let d = self.descriptors[idx].as_ref().unwrap();
			(d.header.lbi_start, d.header.size, d.status.position)
		};

		let remaining = (size.saturating_sub(position) as usize).min(buf.len());
		if remaining == 0 {
			return Ok(0);
		}

		let mut block = lbi_start;
		let skip = position / FS_DATA_SIZE as u32;
		for _ in 0..skip {
			block = match self.block_next_get(block) {
				Ok(b) if b != UN_SET => b,
				_ => file_fail!(Status::OperationFailed, FileError::Io),
			};
		}

		let mut offset = (position % FS_DATA_SIZE as u32) as usize;
		let mut written = 0usize;
		let mut left = remaining;
		while left > 0 {
			let data = match self.block_read(block) {
				Ok(d) => d,
				Err(_) => file_fail!(Status::OperationFailed, FileError::Io),
			};
			let available = FS_DATA_SIZE - offset;
			let chunk = left.min(available);
			buf[written..written + chunk].copy_from_slice(&data[2 + offset..2 + offset + chunk]);
			written += chunk;
			left -= chunk;
			offset = 0;

			if left > 0 {
				block = match self.block_next_get(block) {
					Ok(b) if b != UN_SET => b,
					_ => file_fail!(Status::OperationFailed, FileError::Io),
				};
			}
		}

		self.descriptors[idx].as_mut().unwrap().status.position += remaining as u32;
		Ok(written)
	}

	/// Writes `data` at the descriptor's current position, extending the
	/// chain and `header.size` as needed (spec §4.5 "File write").
	pub fn file_write(&mut self, fd: u32, data: &[u8]) -> FileResult<()> {
		let idx = self.descriptor_index(fd)?;
		let (mode, lbi_start, mut size, position) = {
			let d = self.descriptors[idx].as_ref().unwrap();
			(d.status.mode, d.header.lbi_start, d.header.size, d.status.position)
		};

		if mode == OpenMode::ReadOnly {
			file_fail!(Status::AccessDenied, FileError::Permission);
		}

		let length = data.len() as u32;
		let end_pos = match position.checked_add(length) {
			Some(p) if p <= FS_MAX_FILE_SIZE => p,
			_ => file_fail!(Status::InvalidParam, FileError::FileSize),
		};
		if end_pos > size {
			size = end_pos;
		}

		let mut block = lbi_start;
		let skip = position / FS_DATA_SIZE as u32;
		for _ in 0..skip {
			block = match self.block_next_get(block) {
				Ok(b) if b != UN_SET => b,
				_ => file_fail!(Status::OperationFailed, FileError::Io),
			};
		}

		let mut offset = (position % FS_DATA_SIZE as u32) as usize;
		let mut consumed = 0usize;
		let mut left = data.len();
		while left > 0 {
			let mut block_data = match self.block_read(block) {
				Ok(d) => d,
				Err(_) => file_fail!(Status::OperationFailed, FileError::Io),
			};
			let available = FS_DATA_SIZE - offset;
			let chunk = left.min(available);
			block_data[2 + offset..2 + offset + chunk].copy_from_slice(&data[consumed..consumed + chunk]);
			if self.block_write(block, &block_data).is_err() {
				file_fail!(Status::OperationFailed, FileError::Io);
			}

			consumed += chunk;
			left -= chunk;
			offset = 0;

			if left > 0 {
				let next = match self.block_next_get(block) {
					Ok(n) => n,
					Err(_) => file_fail!(Status::OperationFailed, FileError::Io),
				};

				block = if next == UN_SET {
					let new_block = match self.block_allocate() {
						Ok(b) => b,
						Err(_) => file_fail!(Status::OperationFailed, FileError::NoSpace),
					};
					if self.block_write(new_block, &Self::empty_chain_block()).is_err() {
						file_fail!(Status::OperationFailed, FileError::Io);
					}
					if self.block_next_set(block, new_block).is_err() {
						file_fail!(Status::OperationFailed, FileError::Io);
					}
					new_block
				} else {
					next
				};
			}
		}

		let d = self.descriptors[idx].as_mut().unwrap();
		d.header.size = size;
		d.status.position = position + length;
		Ok(())
	}

	/// Repositions the descriptor's cursor (spec §4.5 "File seek").
	pub fn file_seek(&mut self, fd: u32, offset: i32, whence: Whence) -> FileResult<u32> {
		let idx = self.descriptor_index(fd)?;
		let d = self.descriptors[idx].as_ref().unwrap();
		let base: i64 = match whence {
			Whence::Set => 0,
			Whence::Cur => d.status.position as i64,
			Whence::End => d.header.size as i64,
		};

		let new_position = base + offset as i64;
		if new_position < 0 || new_position as u64 > d.header.size as u64 {
			file_fail!(Status::InvalidParam, FileError::Overflow);
		}

		let new_position = new_position as u32;
		self.descriptors[idx].as_mut().unwrap().status.position = new_position;
		Ok(new_position)
	}

	/// Returns the live status of an open descriptor.
	pub fn file_status(&self, fd: u32) -> FileResult<FileStatus> {
		let idx = fd as usize;
		if idx >= FS_DESCRIPTORS || self.descriptors[idx].is_none() {
			file_fail!(Status::InvalidParam, FileError::Descriptor);
		}
		Ok(self.descriptors[idx].as_ref().unwrap().status.clone())
	}

	/// Removes a file, freeing its chain (spec §4.5 "File remove").
	pub fn file_remove(&mut self, name: &str) -> FileResult<()> {
		let name_bytes = encode_name(name).map_err(|e| (Status::InvalidParam, e))?;
		let id = match self.file_find(&name_bytes) {
			Ok(Some(id)) => id,
			Ok(None) => file_fail!(Status::OperationFailed, FileError::NoFile),
			Err(_) => file_fail!(Status::OperationFailed, FileError::Io),
		};

		if self.descriptors.iter().flatten().any(|d| d.id == id) {
			file_fail!(Status::OperationFailed, FileError::Busy);
		}

		let header = match self.fileheader_read(id) {
			Ok(h) => h,
			Err(_) => file_fail!(Status::OperationFailed, FileError::Io),
		};

		let mut block = header.lbi_start;
		while block != UN_SET && block < FTL_BLOCKS {
			let next = match self.block_next_get(block) {
				Ok(n) => n,
				Err(_) => file_fail!(Status::OperationFailed, FileError::Io),
			};
			if self.blockflag_write(block, BlockFlag::Free).is_err() {
				file_fail!(Status::OperationFailed, FileError::Io);
			}
			block = next;
		}

		if self.filename_write(id, &[0u8; FILE_NAME_SIZE]).is_err() {
			file_fail!(Status::OperationFailed, FileError::Io);
		}
		let empty_header = FileHeader { id: 0, lbi_start: 0, tags: [0u8; TAG_BITMAP_SIZE], size: 0, crc32: 0 };
		if self.fileheader_write(id, &empty_header).is_err() {
			file_fail!(Status::OperationFailed, FileError::Io);
		}

		debug!("driver: removed file id={id}");
		Ok(())
	}

	/// Renames a file, failing `Exist` if the new name is taken (spec §4.5
	/// "File rename").
	pub fn file_rename(&mut self, old: &str, new: &str) -> FileResult<()> {
		let old_bytes = encode_name(old).map_err(|e| (Status::InvalidParam, e))?;
		let new_bytes = encode_name(new).map_err(|e| (Status::InvalidParam, e))?;

		let id = match self.file_find(&old_bytes) {
			Ok(Some(id)) => id,
			Ok(None) => file_fail!(Status::OperationFailed, FileError::NoFile),
			Err(_) => file_fail!(Status::OperationFailed, FileError::Io),
		};

		match self.file_find(&new_bytes) {
			Ok(None) => {}
			Ok(Some(_)) => file_fail!(Status::OperationFailed, FileError::Exist),
			Err(_) => file_fail!(Status::OperationFailed, FileError::Io),
		}

		if self.filename_write(id, &new_bytes).is_err() {
			file_fail!(Status::OperationFailed, FileError::Io);
		}
		Ok(())
	}

	// ---- tags ----

	/// Sets the tag bit for `file` if `tag` is a known tag name (spec §4.5
	/// "Tag add/remove"). Tag operations carry only the coarse [`Status`],
	/// matching the original's `FS_TAG_*` signatures.
	pub fn tag_add(&mut self, file: &str, tag: &str) -> Result<()> {
		self.tag_set(file, tag, true)
	}

	pub fn tag_remove(&mut self, file: &str, tag: &str) -> Result<()> {
		self.tag_set(file, tag, false)
	}

	fn tag_set(&mut self, file: &str, tag: &str, value: bool) -> Result<()> {
		let name_bytes = encode_name(file).map_err(|_| Status::InvalidParam)?;
		let id = match self.file_find(&name_bytes)? {
			Some(id) => id,
			None => return Err(Status::NoAction),
		};
		let tag_bytes = encode_tag(tag).ok_or(Status::InvalidParam)?;
		let tag_idx = self.tag_names.iter().position(|t| *t == tag_bytes).ok_or(Status::InvalidParam)?;

		let mut header = self.fileheader_read(id)?;
		let byte = tag_idx / 8;
		let bit = tag_idx % 8;
		if value {
			header.tags[byte] |= 1 << bit;
		} else {
			header.tags[byte] &= !(1 << bit);
		}
		self.fileheader_write(id, &header)?;

		if let Some(d) = self.descriptors.iter_mut().flatten().find(|d| d.id == id) {
			d.header.tags = header.tags;
			d.status.tags = header.tags;
		}
		Ok(())
	}

	/// Renames a tag, rejecting both an unknown old name and a colliding new
	/// one (spec §4.5 "Tag rename").
	pub fn tag_rename(&mut self, old: &str, new: &str) -> Result<()> {
		let old_bytes = encode_tag(old).ok_or(Status::InvalidParam)?;
		let new_bytes = encode_tag(new).ok_or(Status::InvalidParam)?;

		let idx = self.tag_names.iter().position(|t| *t == old_bytes).ok_or(Status::OperationFailed)?;
		if self.tag_names.iter().enumerate().any(|(i, t)| i != idx && *t == new_bytes) {
			return Err(Status::OperationFailed);
		}

		self.tag_names[idx] = new_bytes;
		self.persist_tag_block(idx)
	}
}

#[cfg(test)]
mod t {
	use std::fs::File;

	use super::*;
	use crate::{emulator::Emulator, layout::FLASH_CAPACITY};

	fn harness() -> Filesystem<File> {
		let f = tempfile::NamedTempFile::new().unwrap();
		f.as_file().set_len(FLASH_CAPACITY as u64).unwrap();
		let e = Emulator::open(f.path()).unwrap();
		Filesystem::init(e).unwrap()
	}

	mod lifecycle {
		use super::*;

		#[test]
		fn create_open_write_read_roundtrips() {
			let mut fs = harness();
			fs.file_create("hello.txt").unwrap();
			let fd = fs.file_open("hello.txt", OpenMode::ReadWrite).unwrap();
			fs.file_write(fd, b"BMSTU").unwrap();
			fs.file_seek(fd, 0, Whence::Set).unwrap();
			let mut buf = [0u8; 16];
			let n = fs.file_read(fd, &mut buf).unwrap();
			assert_eq!(n, 5);
			assert_eq!(&buf[..5], b"BMSTU");
		}

		#[test]
		fn cross_block_write_spans_chain() {
			let mut fs = harness();
			fs.file_create("ramp.bin").unwrap();
			let fd = fs.file_open("ramp.bin", OpenMode::ReadWrite).unwrap();
			let ramp: Vec<u8> = (0..500u32).map(|i| (i % 256) as u8).collect();
			fs.file_write(fd, &ramp).unwrap();
			fs.file_seek(fd, 0, Whence::Set).unwrap();
			let mut buf = vec![0u8; 500];
			let n = fs.file_read(fd, &mut buf).unwrap();
			assert_eq!(n, 500);
			assert_eq!(buf, ramp);
			assert_eq!(fs.file_status(fd).unwrap().size, 500);
		}

		#[test]
		fn rename_to_existing_name_fails() {
			let mut fs = harness();
			fs.file_create("a.txt").unwrap();
			fs.file_create("b.txt").unwrap();
			assert_eq!(fs.file_rename("a.txt", "b.txt"), Err((Status::OperationFailed, FileError::Exist)));
		}

		#[test]
		fn remove_while_open_is_busy() {
			let mut fs = harness();
			fs.file_create("a.txt").unwrap();
			let _fd = fs.file_open("a.txt", OpenMode::ReadOnly).unwrap();
			assert_eq!(fs.file_remove("a.txt"), Err((Status::OperationFailed, FileError::Busy)));
		}

		#[test]
		fn remove_then_reopen_is_no_file() {
			let mut fs = harness();
			fs.file_create("a.txt").unwrap();
			fs.file_remove("a.txt").unwrap();
			assert_eq!(fs.file_open("a.txt", OpenMode::ReadOnly), Err((Status::OperationFailed, FileError::NoFile)));
		}

		#[test]
		fn write_on_readonly_descriptor_is_denied() {
			let mut fs = harness();
			fs.file_create("a.txt").unwrap();
			let fd = fs.file_open("a.txt", OpenMode::ReadOnly).unwrap();
			assert_eq!(fs.file_write(fd, b"x"), Err((Status::AccessDenied, FileError::Permission)));
		}

		#[test]
		fn seek_past_size_overflows() {
			let mut fs = harness();
			fs.file_create("a.txt").unwrap();
			let fd = fs.file_open("a.txt", OpenMode::ReadWrite).unwrap();
			assert_eq!(fs.file_seek(fd, 1, Whence::Set), Err((Status::InvalidParam, FileError::Overflow)));
		}

		#[test]
		fn create_duplicate_name_rejected() {
			let mut fs = harness();
			fs.file_create("a.txt").unwrap();
			assert_eq!(fs.file_create("a.txt"), Err((Status::OperationFailed, FileError::Exist)));
		}
	}

	mod tags {
		use super::*;

		#[test]
		fn add_then_remove_tag_is_idempotent() {
			let mut fs = harness();
			fs.tag_rename("", "music").unwrap_err(); // no tag named "" to rename from
			fs.file_create("song.mp3").unwrap();

			// Name tag slot 0 first (tag identities are positional, spec §3).
			fs.tag_names[0] = {
				let mut b = [0u8; TAG_NAME_SIZE];
				b[..5].copy_from_slice(b"music");
				b
			};
			fs.persist_tag_block(0).unwrap();

			fs.tag_add("song.mp3", "music").unwrap();
			fs.tag_add("song.mp3", "music").unwrap();
			let fd = fs.file_open("song.mp3", OpenMode::ReadOnly).unwrap();
			assert_eq!(fs.file_status(fd).unwrap().tags[0] & 1, 1);

			fs.tag_remove("song.mp3", "music").unwrap();
			fs.tag_remove("song.mp3", "music").unwrap();
		}

		#[test]
		fn rename_unknown_tag_fails() {
			let mut fs = harness();
			assert_eq!(fs.tag_rename("nope", "also-nope"), Err(Status::OperationFailed));
		}
	}

	#[test]
	fn format_marks_system_and_free_regions() {
		let fs = harness();
		assert_eq!(fs.bitmap[0], BlockFlag::System);
		assert_eq!(fs.bitmap[LBI_DATA_START as usize - 1], BlockFlag::System);
		assert_eq!(fs.bitmap[LBI_DATA_START as usize], BlockFlag::Free);
		assert_eq!(fs.bitmap[(FTL_BLOCKS - 1) as usize], BlockFlag::Free);
	}
}
