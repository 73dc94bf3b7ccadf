use std::{error::Error, path::Path};

use flashfs::{Emulator, FileError, Filesystem, OpenMode, Status, Whence};
use log::info;

fn file_err(e: (Status, FileError)) -> Box<dyn Error> {
	format!("{}: {}", e.0, e.1).into()
}

fn main() -> Result<(), Box<dyn Error>> {
	env_logger::init();

	let emulator = Emulator::open(Path::new("flash.bin"))?;
	let mut fs = Filesystem::init(emulator)?;

	fs.file_create("hello.txt").map_err(file_err)?;
	let fd = fs.file_open("hello.txt", OpenMode::ReadWrite).map_err(file_err)?;
	fs.file_write(fd, b"BMSTU").map_err(file_err)?;
	fs.file_seek(fd, 0, Whence::Set).map_err(file_err)?;

	let mut buf = [0u8; 5];
	fs.file_read(fd, &mut buf).map_err(file_err)?;
	info!("demo file contents: {:?}", String::from_utf8_lossy(&buf));

	fs.file_close(fd).map_err(file_err)?;
	fs.teardown()?;

	Ok(())
}
