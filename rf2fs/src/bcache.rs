use std::{
	fs::File,
	io::{Error as IoError, ErrorKind, Result as IoResult},
	os::unix::fs::FileExt,
	path::Path,
	sync::{Arc, Mutex, MutexGuard},
};

use crate::{
	err,
	layout::{BLOCK_SIZE, DEFAULT_SECTOR_SIZE},
};

/// Abstract block device under the filesystem.
///
/// Offsets and lengths are in device sectors, which may be smaller than the
/// filesystem block size.
pub trait BlockDevice: Send + Sync {
	fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> IoResult<()>;
	fn write_sectors(&self, sector: u64, buf: &[u8]) -> IoResult<()>;
	fn flush(&self) -> IoResult<()>;
	fn sector_size(&self) -> u32;
	fn sector_count(&self) -> u64;

	fn supports_trim(&self) -> bool {
		false
	}

	fn trim(&self, _sector: u64, _count: u64) -> IoResult<()> {
		Err(IoError::from_raw_os_error(libc::EOPNOTSUPP))
	}
}

/// File-backed device with positional I/O.
pub struct FileDevice {
	file:         File,
	sector_count: u64,
}

impl FileDevice {
	pub fn open(path: &Path, rw: bool) -> IoResult<Self> {
		let file = File::options().read(true).write(rw).open(path)?;
		let len = file.metadata()?.len();
		Ok(Self {
			file,
			sector_count: len / DEFAULT_SECTOR_SIZE as u64,
		})
	}

	pub fn create(path: &Path, len: u64) -> IoResult<Self> {
		let file = File::options()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(path)?;
		file.set_len(len)?;
		Ok(Self {
			file,
			sector_count: len / DEFAULT_SECTOR_SIZE as u64,
		})
	}
}

impl BlockDevice for FileDevice {
	fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> IoResult<()> {
		self.file
			.read_exact_at(buf, sector * DEFAULT_SECTOR_SIZE as u64)
	}

	fn write_sectors(&self, sector: u64, buf: &[u8]) -> IoResult<()> {
		self.file
			.write_all_at(buf, sector * DEFAULT_SECTOR_SIZE as u64)
	}

	fn flush(&self) -> IoResult<()> {
		self.file.sync_data()
	}

	fn sector_size(&self) -> u32 {
		DEFAULT_SECTOR_SIZE
	}

	fn sector_count(&self) -> u64 {
		self.sector_count
	}
}

/// RAM-backed device. Cloning yields a handle to the same storage, which is
/// how tests simulate power cuts: drop the filesystem without unmounting and
/// mount a fresh instance over the surviving bytes.
#[derive(Clone)]
pub struct MemDevice {
	data:        Arc<Mutex<Vec<u8>>>,
	sector_size: u32,
}

impl MemDevice {
	pub fn new(blocks: u32) -> Self {
		Self {
			data:        Arc::new(Mutex::new(vec![0; blocks as usize * BLOCK_SIZE])),
			sector_size: DEFAULT_SECTOR_SIZE,
		}
	}
}

impl BlockDevice for MemDevice {
	fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> IoResult<()> {
		let data = self.data.lock().unwrap();
		let ofs = sector as usize * self.sector_size as usize;
		if ofs + buf.len() > data.len() {
			return Err(err!(ERANGE));
		}
		buf.copy_from_slice(&data[ofs..ofs + buf.len()]);
		Ok(())
	}

	fn write_sectors(&self, sector: u64, buf: &[u8]) -> IoResult<()> {
		let mut data = self.data.lock().unwrap();
		let ofs = sector as usize * self.sector_size as usize;
		if ofs + buf.len() > data.len() {
			return Err(err!(ERANGE));
		}
		data[ofs..ofs + buf.len()].copy_from_slice(buf);
		Ok(())
	}

	fn flush(&self) -> IoResult<()> {
		Ok(())
	}

	fn sector_size(&self) -> u32 {
		self.sector_size
	}

	fn sector_count(&self) -> u64 {
		self.data.lock().unwrap().len() as u64 / self.sector_size as u64
	}

	fn supports_trim(&self) -> bool {
		true
	}

	fn trim(&self, sector: u64, count: u64) -> IoResult<()> {
		let mut data = self.data.lock().unwrap();
		let ofs = sector as usize * self.sector_size as usize;
		let len = count as usize * self.sector_size as usize;
		if ofs + len > data.len() {
			return Err(err!(ERANGE));
		}
		data[ofs..ofs + len].fill(0);
		Ok(())
	}
}

/// Block-level shim between the filesystem and the device.
///
/// Maps 4K filesystem blocks onto device sectors through a single scratch
/// block, validates geometry, and gates submission during checkpoint freeze
/// windows via [`Bcache::pause`].
pub struct Bcache {
	device:            Box<dyn BlockDevice>,
	block_count:       u32,
	sectors_per_block: u32,
	scratch:           Mutex<Box<[u8; BLOCK_SIZE]>>,
	pause:             Mutex<()>,
}

impl Bcache {
	pub fn new(device: Box<dyn BlockDevice>) -> IoResult<Self> {
		let ss = device.sector_size();
		if ss == 0 || BLOCK_SIZE as u32 % ss != 0 {
			log::error!("unsupported device sector size: {ss}");
			return Err(err!(EINVAL));
		}

		let device_bytes = device.sector_count() * ss as u64;
		if device_bytes == 0 {
			log::error!("zero-sized device");
			return Err(err!(EINVAL));
		}
		let block_count = device_bytes / BLOCK_SIZE as u64;
		// 32-bit block addresses bound the volume to 16 TiB.
		if block_count >= u32::MAX as u64 {
			log::error!("device too large: {block_count} blocks");
			return Err(err!(ERANGE));
		}

		Ok(Self {
			sectors_per_block: BLOCK_SIZE as u32 / ss,
			block_count: block_count as u32,
			device,
			scratch: Mutex::new(Box::new([0; BLOCK_SIZE])),
			pause: Mutex::new(()),
		})
	}

	pub fn block_count(&self) -> u32 {
		self.block_count
	}

	pub fn device_sector_size(&self) -> u32 {
		self.device.sector_size()
	}

	fn check_range(&self, bno: u32) -> IoResult<()> {
		if bno >= self.block_count {
			log::error!("block {bno} out of range ({} blocks)", self.block_count);
			return Err(err!(ERANGE));
		}
		Ok(())
	}

	pub fn read_blk(&self, bno: u32, out: &mut [u8]) -> IoResult<()> {
		self.check_range(bno)?;
		let _gate = self.pause.lock().unwrap();
		let mut scratch = self.scratch.lock().unwrap();
		self.device
			.read_sectors(bno as u64 * self.sectors_per_block as u64, &mut scratch[..])?;
		out.copy_from_slice(&scratch[..]);
		Ok(())
	}

	pub fn write_blk(&self, bno: u32, data: &[u8]) -> IoResult<()> {
		self.check_range(bno)?;
		let _gate = self.pause.lock().unwrap();
		let mut scratch = self.scratch.lock().unwrap();
		scratch.copy_from_slice(data);
		self.device
			.write_sectors(bno as u64 * self.sectors_per_block as u64, &scratch[..])
	}

	/// Discard a block range. Succeeds as a no-op when the device cannot
	/// trim.
	pub fn trim(&self, start: u32, count: u32) -> IoResult<()> {
		if !self.device.supports_trim() {
			return Ok(());
		}
		self.device.trim(
			start as u64 * self.sectors_per_block as u64,
			count as u64 * self.sectors_per_block as u64,
		)
	}

	pub fn flush(&self) -> IoResult<()> {
		self.device.flush()
	}

	/// Block all submissions until the returned guard is dropped.
	pub fn pause(&self) -> MutexGuard<'_, ()> {
		self.pause.lock().unwrap()
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn mem_roundtrip() {
		let bc = Bcache::new(Box::new(MemDevice::new(16))).unwrap();
		assert_eq!(bc.block_count(), 16);

		let block = [0x5au8; BLOCK_SIZE];
		bc.write_blk(3, &block).unwrap();
		let mut out = [0u8; BLOCK_SIZE];
		bc.read_blk(3, &mut out).unwrap();
		assert_eq!(out, block);

		bc.trim(3, 1).unwrap();
		bc.read_blk(3, &mut out).unwrap();
		assert_eq!(out, [0u8; BLOCK_SIZE]);
	}

	#[test]
	fn pause_serialises_submission() {
		let bc = Bcache::new(Box::new(MemDevice::new(4))).unwrap();
		{
			let _frozen = bc.pause();
			// submissions resume once the guard drops
		}
		let block = [1u8; BLOCK_SIZE];
		bc.write_blk(0, &block).unwrap();
	}

	#[test]
	fn out_of_range_rejected() {
		let bc = Bcache::new(Box::new(MemDevice::new(4))).unwrap();
		let mut out = [0u8; BLOCK_SIZE];
		let e = bc.read_blk(4, &mut out).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ERANGE));
	}

	#[test]
	fn file_device_roundtrip() {
		let f = tempfile::NamedTempFile::new().unwrap();
		f.as_file().set_len(1 << 20).unwrap();
		let dev = FileDevice::open(f.path(), true).unwrap();
		let bc = Bcache::new(Box::new(dev)).unwrap();
		assert_eq!(bc.block_count(), 256);

		let block = [0x17u8; BLOCK_SIZE];
		bc.write_blk(200, &block).unwrap();
		let mut out = [0u8; BLOCK_SIZE];
		bc.read_blk(200, &mut out).unwrap();
		assert_eq!(out, block);
	}
}
