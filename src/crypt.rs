//! Primitives (spec §4.1): the bit-exact CRC-32 variant and the XOR stream cipher.
//!
//! Both are pure functions, ported bit-for-bit from `fs_crypt.c` rather than
//! reimplemented against a standard CRC-32 crate — the polynomial here is
//! un-reflected and right-shifting, which does not match any of the common
//! CRC-32 presets.

const CRC32_POLY: u32 = 0x04C1_1DB7;

/// Bitwise CRC-32, matching `HASH_CRC` in `fs_crypt.c`.
pub fn crc32(data: &[u8]) -> u32 {
	let mut state: u32 = 0xFFFF_FFFF;
	for &byte in data {
		state ^= u32::from(byte);
		for _ in 0..8 {
			state = if state & 1 != 0 {
				(state >> 1) ^ CRC32_POLY
			} else {
				state >> 1
			};
		}
	}
	state ^ 0xFFFF_FFFF
}

const XOR_BASE_KEY: [u8; 16] = [
	0x5A, 0x3C, 0x91, 0x7E, 0x0F, 0xB2, 0x44, 0xD8, 0x61, 0x2A, 0xE5, 0x17, 0x8C, 0x39, 0xF4, 0xA6,
];

/// XOR stream cipher with an address-derived rotating key, matching `CRYPT_XOR`
/// in `fs_crypt.c`. Involutive: applying it twice with the same `addr`
/// reproduces the original bytes, except that bytes equal to `0xFF` are never
/// touched (so an erased/all-`0xFF` region stays erased).
///
/// The FTL hooks this at its read/write call sites but currently bypasses it
/// (see spec §9); this function itself is always fully implemented and
/// tested, gated at the call site by the `ftl_crypt` feature.
pub fn xor_cipher(data: &mut [u8], addr: u32) {
	let mut iv = [0u8; 8];
	for (i, b) in iv.iter_mut().enumerate() {
		*b = ((addr >> (i * 4)) & 0xFF) as u8;
	}

	let mut key = XOR_BASE_KEY;
	for (i, k) in key.iter_mut().enumerate() {
		*k ^= iv[i % 8];
	}

	for (i, byte) in data.iter_mut().enumerate() {
		if *byte != 0xFF {
			*byte ^= key[i % 16];
		}
		let k = &mut key[i % 16];
		*k = k.rotate_left(1);
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn crc32_empty() {
		assert_eq!(crc32(&[]), 0xFFFF_FFFF ^ 0xFFFF_FFFF);
	}

	#[test]
	fn crc32_deterministic() {
		let data = b"BMSTU";
		assert_eq!(crc32(data), crc32(data));
	}

	#[test]
	fn crc32_distinguishes_inputs() {
		assert_ne!(crc32(b"hello.txt"), crc32(b"hello.tx0"));
	}

	#[test]
	fn xor_roundtrip() {
		let orig: Vec<u8> = (0..=253u8).collect();
		let mut buf = orig.clone();
		xor_cipher(&mut buf, 0x0800_2000);
		assert_ne!(buf, orig);
		xor_cipher(&mut buf, 0x0800_2000);
		assert_eq!(buf, orig);
	}

	#[test]
	fn xor_leaves_erased_bytes_alone() {
		let mut buf = vec![0xFFu8; 32];
		xor_cipher(&mut buf, 0x1234_5678);
		assert_eq!(buf, vec![0xFFu8; 32]);
	}

	#[test]
	fn xor_depends_on_address() {
		let orig = vec![0x00u8; 16];
		let mut a = orig.clone();
		let mut b = orig.clone();
		xor_cipher(&mut a, 1);
		xor_cipher(&mut b, 2);
		assert_ne!(a, b);
	}
}
