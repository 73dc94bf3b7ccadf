//! Thin (de)serialization helpers wrapping two fixed `bincode` configurations.
//!
//! Grounded in the teacher crate's `decoder::Config`, which wraps a
//! little/big-endian pair of `bincode::config::Configuration`s for UFS's
//! own mixed-endianness needs. This port's mixed endianness is *structural*
//! rather than autodetected (the flash header/FTL descriptor are always
//! little-endian; the file-chain next-LBI link is always big-endian), so
//! each region picks its config explicitly rather than sniffing a magic
//! number, but the underlying mechanism — pre-built `bincode` configs,
//! `encode`/`decode` over a fixed buffer — is the same.

use bincode::{
	config::{BigEndian, Configuration, Fixint, LittleEndian, NoLimit},
	error::{DecodeError, EncodeError},
	Decode, Encode,
};

pub const LE: Configuration<LittleEndian, Fixint, NoLimit> =
	bincode::config::standard().with_fixed_int_encoding().with_little_endian();

pub const BE: Configuration<BigEndian, Fixint, NoLimit> =
	bincode::config::standard().with_fixed_int_encoding().with_big_endian();

pub fn decode_le<T: Decode>(buf: &[u8]) -> Result<T, DecodeError> {
	bincode::decode_from_slice(buf, LE).map(|(v, _)| v)
}

pub fn encode_le<T: Encode>(value: &T, buf: &mut [u8]) -> Result<usize, EncodeError> {
	bincode::encode_into_slice(value, buf, LE)
}

pub fn decode_be<T: Decode>(buf: &[u8]) -> Result<T, DecodeError> {
	bincode::decode_from_slice(buf, BE).map(|(v, _)| v)
}

pub fn encode_be<T: Encode>(value: &T, buf: &mut [u8]) -> Result<usize, EncodeError> {
	bincode::encode_into_slice(value, buf, BE)
}
