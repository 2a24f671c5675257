//! rf2fs: a log-structured, flash-friendly filesystem library.
//!
//! The on-disk format follows the F2FS layout: a fixed metadata region
//! (superblock, dual checkpoint packs, SIT, NAT, SSA) in front of a
//! log-structured main area divided into 2 MiB segments. [`F2fs::mount`]
//! opens a formatted [`Bcache`]; [`mkfs`] produces one; [`fsck`] checks a
//! frozen image.

mod bcache;
mod bits;
mod checkpoint;
mod dir;
mod file;
mod fsck;
mod gc;
mod inline;
mod layout;
mod mkfs;
mod mount;
mod node;
mod page;
mod recovery;
mod segment;
mod vnode;

/// Constructs an [`std::io::Error`] from an `errno` name.
#[macro_export]
macro_rules! err {
	($name:ident) => {
		std::io::Error::from_raw_os_error(libc::$name)
	};
}

/// Bails out with a structured [`std::io::Error`].
#[macro_export]
macro_rules! iobail {
	($kind:expr, $($tk:tt)+) => {
		return Err(std::io::Error::new($kind, format!($($tk)+)))
	};
}

pub use crate::{
	bcache::{Bcache, BlockDevice, FileDevice, MemDevice},
	dir::{dentry_hash, is_valid_name, DirEntryLoc},
	file::max_file_size,
	fsck::{fsck, FsckOptions, FsckReport, FsckWorker},
	layout::{
		SuperBlock, BLOCK_SIZE, F2FS_SUPER_MAGIC, MAX_INLINE_DATA, NR_INLINE_DENTRY, S_IFDIR,
		S_IFREG,
	},
	mkfs::{mkfs, MkfsOptions, MkfsWorker},
	mount::{F2fs, FsInfo, MountOptions},
	page::CountType,
	segment::CursegType,
	vnode::{Timespec, Vnode, VnodeAttr},
};
