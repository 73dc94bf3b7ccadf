//! Flash sector manager (C2, spec §4.2).
//!
//! Owns the emulated backing store and enforces the access discipline,
//! sector-metadata CRCs, erase-before-write, and whole-sector erase that the
//! FTL builds on.

use bincode::{Decode, Encode};
use log::{debug, error, info, warn};

use crate::{
	codec::{decode_le, encode_le},
	crypt::crc32,
	emulator::{Backend, Emulator},
	error::{Result, Status},
	layout::{FLASH_HEADER_MAGIC, SECTOR_BASES, SECTOR_COUNT},
};

/// Access level requested by a caller, and the level a sector is permitted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Encode, Decode)]
#[repr(u32)]
pub enum SectorPermission {
	Supervisor = 0,
	ReadOnly = 1,
	ReadWrite = 2,
}

impl SectorPermission {
	fn from_u32(v: u32) -> Option<Self> {
		match v {
			0 => Some(Self::Supervisor),
			1 => Some(Self::ReadOnly),
			2 => Some(Self::ReadWrite),
			_ => None,
		}
	}
}

/// Global flash mode (spec §4.2 "Access discipline").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMode {
	Supervisor,
	User,
}

/// Default sector permissions: S0 Supervisor, S1 ReadOnly, S2..S11 ReadWrite.
fn default_permission(sector: usize) -> SectorPermission {
	match sector {
		0 => SectorPermission::Supervisor,
		1 => SectorPermission::ReadOnly,
		_ => SectorPermission::ReadWrite,
	}
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
struct SectorRecordWire {
	pba: u32,
	permission: u32,
	wear: u32,
	crc32: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SectorRecord {
	pub pba: u32,
	pub permission: SectorPermission,
	pub wear: u32,
	pub crc32: u32,
}

impl SectorRecord {
	fn crc_fields(&self) -> [u8; 12] {
		let mut buf = [0u8; 12];
		buf[0..4].copy_from_slice(&self.pba.to_le_bytes());
		buf[4..8].copy_from_slice(&(self.permission as u32).to_le_bytes());
		buf[8..12].copy_from_slice(&self.wear.to_le_bytes());
		buf
	}

	/// "Admit": recompute and store the CRC.
	fn admit(&mut self) {
		self.crc32 = crc32(&self.crc_fields());
	}

	/// "Validate": does the stored CRC match?
	fn validate(&self) -> bool {
		crc32(&self.crc_fields()) == self.crc32
	}

	fn to_wire(self) -> SectorRecordWire {
		SectorRecordWire {
			pba: self.pba,
			permission: self.permission as u32,
			wear: self.wear,
			crc32: self.crc32,
		}
	}

	fn from_wire(w: SectorRecordWire) -> Option<Self> {
		Some(Self {
			pba: w.pba,
			permission: SectorPermission::from_u32(w.permission)?,
			wear: w.wear,
			crc32: w.crc32,
		})
	}
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
struct FlashHeaderWire {
	magic: u32,
	sectors: [SectorRecordWire; SECTOR_COUNT],
	mode: u32,
	crc32: u32,
}

const FLASH_HEADER_WIRE_SIZE: usize = 4 + SECTOR_COUNT * 16 + 4 + 4;

struct FlashHeader {
	magic: u32,
	sectors: [SectorRecord; SECTOR_COUNT],
	mode: FlashMode,
	crc32: u32,
}

impl FlashHeader {
	fn crc_fields(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(4 + SECTOR_COUNT * 12 + 4);
		buf.extend_from_slice(&self.magic.to_le_bytes());
		for s in &self.sectors {
			buf.extend_from_slice(&s.crc_fields());
			buf.extend_from_slice(&s.crc32.to_le_bytes());
		}
		buf.extend_from_slice(&(self.mode_u32()).to_le_bytes());
		buf
	}

	fn mode_u32(&self) -> u32 {
		match self.mode {
			FlashMode::Supervisor => 0,
			FlashMode::User => 1,
		}
	}

	fn admit(&mut self) {
		self.crc32 = crc32(&self.crc_fields());
	}

	fn validate(&self) -> bool {
		crc32(&self.crc_fields()) == self.crc32
	}
}

/// The flash sector manager: one per filesystem instance.
pub struct Flash<B: Backend> {
	emulator: Emulator<B>,
	header:   FlashHeader,
}

impl<B: Backend> Flash<B> {
	/// Reads the flash header from sector 1 and brings the layer into User
	/// mode, formatting (re-initializing sector metadata) if the header is
	/// absent or corrupt (spec §4.2 "Initialization").
	pub fn init(emulator: Emulator<B>) -> Result<Self> {
		let mut raw = [0u8; FLASH_HEADER_WIRE_SIZE];
		let mut this = Self {
			emulator,
			header: FlashHeader {
				magic:   0,
				sectors: [SectorRecord { pba: 0, permission: SectorPermission::Supervisor, wear: 0, crc32: 0 }; SECTOR_COUNT],
				mode:    FlashMode::Supervisor,
				crc32:   0,
			},
		};
		this.emulator.read_at(SECTOR_BASES[1], &mut raw).map_err(|_| Status::OperationFailed)?;
		let wire: Option<FlashHeaderWire> = decode_le(&raw).ok();

		let valid_header = wire.and_then(|w| {
			if w.magic != FLASH_HEADER_MAGIC {
				return None;
			}
			let mut sectors = [SectorRecord { pba: 0, permission: SectorPermission::Supervisor, wear: 0, crc32: 0 }; SECTOR_COUNT];
			for (i, sw) in w.sectors.into_iter().enumerate() {
				sectors[i] = SectorRecord::from_wire(sw)?;
			}
			Some(FlashHeader {
				magic: w.magic,
				sectors,
				mode: if w.mode == 1 { FlashMode::User } else { FlashMode::Supervisor },
				crc32: w.crc32,
			})
		});

		match valid_header {
			Some(h) if h.validate() => {
				debug!("flash: header valid, reusing sector metadata");
				this.header = h;
			}
			_ => {
				warn!("flash: header invalid or absent, reinitializing sector metadata");
				this.format_header()?;
			}
		}

		this.set_mode(FlashMode::User)?;
		Ok(this)
	}

	fn format_header(&mut self) -> Result<()> {
		for i in 0..SECTOR_COUNT {
			let mut rec = SectorRecord { pba: SECTOR_BASES[i], permission: default_permission(i), wear: 0, crc32: 0 };
			rec.admit();
			self.header.sectors[i] = rec;
		}
		self.header.magic = FLASH_HEADER_MAGIC;
		self.header.mode = FlashMode::Supervisor;

		// Sector 0 is reserved "system code" and is never erased here.
		for i in 1..SECTOR_COUNT {
			self.erase_sector_raw(i)?;
		}
		Ok(())
	}

	/// Switches into `User` mode iff every sector CRC and the header CRC
	/// currently validate, recomputing and storing the header CRC on success
	/// (spec §4.2 "Access discipline").
	pub fn set_mode(&mut self, mode: FlashMode) -> Result<()> {
		if mode == FlashMode::User {
			for (i, s) in self.header.sectors.iter().enumerate() {
				if !s.validate() {
					error!("flash: sector {i} CRC invalid, cannot enter User mode");
					return Err(Status::OperationFailed);
				}
			}
		}
		self.header.mode = mode;
		self.header.admit();
		self.write_header()?;
		info!("flash: mode -> {mode:?}");
		Ok(())
	}

	fn write_header(&mut self) -> Result<()> {
		let wire = FlashHeaderWire {
			magic:   self.header.magic,
			sectors: self.header.sectors.map(SectorRecord::to_wire),
			mode:    self.header.mode_u32(),
			crc32:   self.header.crc32,
		};
		let mut buf = [0u8; FLASH_HEADER_WIRE_SIZE];
		encode_le(&wire, &mut buf).map_err(|_| Status::OperationFailed)?;
		self.emulator.write_at(SECTOR_BASES[1], &buf).map_err(|_| Status::OperationFailed)
	}

	/// Binary search for the sector containing `pba`.
	pub fn sector_find(&self, pba: u32) -> Result<usize> {
		if pba < SECTOR_BASES[0] || pba >= SECTOR_BASES[SECTOR_COUNT] {
			return Err(Status::OperationFailed);
		}
		match SECTOR_BASES[..SECTOR_COUNT].binary_search(&pba) {
			Ok(idx) => Ok(idx),
			Err(idx) => Ok(idx - 1),
		}
	}

	fn access_ok(&self, sector: usize, access: SectorPermission) -> bool {
		if self.header.mode == FlashMode::Supervisor {
			return true;
		}
		access != SectorPermission::Supervisor && access <= self.header.sectors[sector].permission
	}

	fn check_range(&self, pba: u32, size: usize, access: SectorPermission) -> Result<()> {
		if pba % 4 != 0 || size % 4 != 0 {
			return Err(Status::InvalidParam);
		}
		let end = pba as u64 + size as u64;
		if end > SECTOR_BASES[SECTOR_COUNT] as u64 {
			return Err(Status::OperationFailed);
		}
		let first = self.sector_find(pba)?;
		let last = self.sector_find((end - 1) as u32)?;
		for s in first..=last {
			if !self.access_ok(s, access) {
				return Err(Status::AccessDenied);
			}
		}
		Ok(())
	}

	/// Aligned read, honoring access mode (spec §4.2 "Reads").
	pub fn read(&mut self, pba: u32, buf: &mut [u8], access: SectorPermission) -> Result<()> {
		self.check_range(pba, buf.len(), access)?;
		self.emulator.read_at(pba, buf).map_err(|_| Status::OperationFailed)
	}

	/// Aligned write; every target byte must currently read `0xFF` (spec §4.2
	/// "Writes").
	pub fn write(&mut self, pba: u32, data: &[u8], access: SectorPermission) -> Result<()> {
		self.check_range(pba, data.len(), access)?;
		let mut current = vec![0u8; data.len()];
		self.emulator.read_at(pba, &mut current).map_err(|_| Status::OperationFailed)?;
		if current.iter().any(|&b| b != 0xFF) {
			error!("flash: write to pba={pba:#x} would clear a bit without erasing");
			return Err(Status::OperationFailed);
		}
		self.emulator.write_at(pba, data).map_err(|_| Status::OperationFailed)
	}

	fn erase_sector_raw(&mut self, sector: usize) -> Result<()> {
		let start = SECTOR_BASES[sector];
		let len = (SECTOR_BASES[sector + 1] - start) as usize;
		let blank = vec![0xFFu8; len];
		self.emulator.write_at(start, &blank).map_err(|_| Status::OperationFailed)?;

		let prior_mode = self.header.mode;
		self.header.mode = FlashMode::Supervisor;
		self.header.sectors[sector].wear += 1;
		self.header.sectors[sector].admit();
		self.header.mode = prior_mode;
		debug!("flash: erased sector {sector}, wear={}", self.header.sectors[sector].wear);
		Ok(())
	}

	/// Whole-sector erase, requiring `ReadWrite` on that sector (spec §4.2
	/// "Sector erase").
	pub fn erase_sector(&mut self, sector: usize) -> Result<()> {
		if !self.access_ok(sector, SectorPermission::ReadWrite) {
			return Err(Status::AccessDenied);
		}
		self.erase_sector_raw(sector)?;
		self.set_mode(self.header.mode)
	}

	pub fn sector_base(&self, sector: usize) -> u32 {
		SECTOR_BASES[sector]
	}

	pub fn sector_len(&self, sector: usize) -> usize {
		(SECTOR_BASES[sector + 1] - SECTOR_BASES[sector]) as usize
	}

	pub fn mode(&self) -> FlashMode {
		self.header.mode
	}

	pub fn wear(&self, sector: usize) -> u32 {
		self.header.sectors[sector].wear
	}

	/// Switches to Supervisor, erases sector 1, and writes the current
	/// header back into it (spec §4.2 "Teardown").
	pub fn teardown(mut self) -> Result<()> {
		self.header.mode = FlashMode::Supervisor;
		self.erase_sector_raw(1)?;
		self.header.admit();
		self.write_header()?;
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use std::fs::File;

	use super::*;
	use crate::layout::FLASH_CAPACITY;

	fn harness() -> Flash<File> {
		let f = tempfile::NamedTempFile::new().unwrap();
		f.as_file().set_len(FLASH_CAPACITY as u64).unwrap();
		let e = Emulator::open(f.path()).unwrap();
		Flash::init(e).unwrap()
	}

	#[test]
	fn fresh_file_initializes_to_user_mode() {
		let flash = harness();
		assert_eq!(flash.mode(), FlashMode::User);
	}

	#[test]
	fn sector_find_locates_bases() {
		let flash = harness();
		for i in 0..SECTOR_COUNT {
			assert_eq!(flash.sector_find(SECTOR_BASES[i]).unwrap(), i);
		}
	}

	#[test]
	fn sector_find_out_of_range_fails() {
		let flash = harness();
		assert!(flash.sector_find(SECTOR_BASES[SECTOR_COUNT]).is_err());
	}

	#[test]
	fn write_then_read_roundtrips_on_readwrite_sector() {
		let mut flash = harness();
		let pba = flash.sector_base(3);
		flash.write(pba, b"abcd", SectorPermission::ReadWrite).unwrap();
		let mut buf = [0u8; 4];
		flash.read(pba, &mut buf, SectorPermission::ReadOnly).unwrap();
		assert_eq!(&buf, b"abcd");
	}

	#[test]
	fn write_without_erase_fails() {
		let mut flash = harness();
		let pba = flash.sector_base(3);
		flash.write(pba, b"abcd", SectorPermission::ReadWrite).unwrap();
		assert_eq!(flash.write(pba, b"efgh", SectorPermission::ReadWrite), Err(Status::OperationFailed));
	}

	#[test]
	fn misaligned_access_is_rejected() {
		let mut flash = harness();
		let pba = flash.sector_base(3) + 1;
		let mut buf = [0u8; 4];
		assert_eq!(flash.read(pba, &mut buf, SectorPermission::ReadOnly), Err(Status::InvalidParam));
	}

	#[test]
	fn readonly_sector_rejects_writes_in_user_mode() {
		let mut flash = harness();
		let pba = flash.sector_base(1);
		assert_eq!(flash.write(pba, b"abcd", SectorPermission::ReadWrite), Err(Status::AccessDenied));
	}

	#[test]
	fn erase_bumps_wear_and_restores_0xff() {
		let mut flash = harness();
		let pba = flash.sector_base(3);
		flash.write(pba, b"abcd", SectorPermission::ReadWrite).unwrap();
		let wear_before = flash.wear(3);
		flash.erase_sector(3).unwrap();
		assert_eq!(flash.wear(3), wear_before + 1);
		let mut buf = [0u8; 4];
		flash.read(pba, &mut buf, SectorPermission::ReadOnly).unwrap();
		assert_eq!(buf, [0xFF; 4]);
	}
}
