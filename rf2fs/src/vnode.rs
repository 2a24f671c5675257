use std::{
	collections::{BTreeSet, HashMap},
	io::Result as IoResult,
	sync::{
		atomic::{AtomicU32, AtomicU64, Ordering},
		Arc, Mutex, RwLock,
	},
	time::{SystemTime, UNIX_EPOCH},
};

use crate::{
	err,
	layout::{
		self, Extent, NodeBlock, ADDRS_PER_BLOCK, ADDRS_PER_INODE, BLOCK_SIZE, DATA_EXIST,
		EXTRA_ATTR, INLINE_DATA, INLINE_DENTRY, INLINE_XATTR, MAX_NAME_LEN, NEW_ADDR, NULL_ADDR,
		S_IFDIR, S_IFMT, S_IFREG,
	},
	mount::F2fs,
	node::Dnode,
	page::{CountType, FileCache, Page, PageCounters},
};

pub const FADVISE_COLD_BIT: u8 = 0x01;

// In-memory vnode flags.
pub const VNODE_DIRTY: u32 = 1 << 0;
pub const VNODE_NEW: u32 = 1 << 1;
pub const VNODE_NEED_CP: u32 = 1 << 2;
pub const VNODE_INC_LINK: u32 = 1 << 3;
pub const VNODE_INLINE_DATA: u32 = 1 << 4;
pub const VNODE_INLINE_DENTRY: u32 = 1 << 5;
pub const VNODE_INLINE_XATTR: u32 = 1 << 6;
pub const VNODE_DATA_EXIST: u32 = 1 << 7;
pub const VNODE_NO_ALLOC: u32 = 1 << 8;
pub const VNODE_BAD: u32 = 1 << 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
	pub sec:  u64,
	pub nsec: u32,
}

pub fn timespec_now() -> Timespec {
	let d = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default();
	Timespec {
		sec:  d.as_secs(),
		nsec: d.subsec_nanos(),
	}
}

/// Attributes surfaced to the hosting VFS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnodeAttr {
	pub mode:         u16,
	pub ino:          u32,
	pub size:         u64,
	pub storage_size: u64,
	pub link_count:   u32,
	pub ctime:        Timespec,
	pub mtime:        Timespec,
}

/// Single-range extent hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentInfo {
	pub fofs:     u64,
	pub blk_addr: u32,
	pub len:      u32,
}

#[derive(Debug, Clone, Default)]
pub struct VnodeInfo {
	pub mode:          u16,
	pub uid:           u32,
	pub gid:           u32,
	pub nlink:         u32,
	pub size:          u64,
	/// Block count excluding the inode block itself; the on-disk count keeps
	/// the +1 for compatibility.
	pub blocks:        u64,
	pub atime:         Timespec,
	pub ctime:         Timespec,
	pub mtime:         Timespec,
	pub generation:    u32,
	pub pino:          u32,
	pub cur_dir_depth: u32,
	pub dir_level:     u8,
	pub xattr_nid:     u32,
	pub iflags:        u32,
	pub advise:        u8,
	pub name:          String,
	pub dir_hash:      Option<(u32, u32)>,
}

/// One live inode. Owned by the [`VnodeCache`]; everything mutable sits
/// behind its own lock so operations share `&Vnode`.
pub struct Vnode {
	ino:          u32,
	info:         RwLock<VnodeInfo>,
	ext:          RwLock<ExtentInfo>,
	flags:        AtomicU32,
	cache:        FileCache,
	data_version: AtomicU64,
}

impl Vnode {
	pub fn new(ino: u32, is_dir: bool, counters: Arc<PageCounters>) -> Arc<Self> {
		let count_type = if is_dir {
			CountType::DirtyDents
		} else {
			CountType::DirtyData
		};
		Arc::new(Self {
			ino,
			info: RwLock::new(VnodeInfo::default()),
			ext: RwLock::new(ExtentInfo::default()),
			flags: AtomicU32::new(0),
			cache: FileCache::new(count_type, counters),
			data_version: AtomicU64::new(0),
		})
	}

	pub fn ino(&self) -> u32 {
		self.ino
	}

	pub fn cache(&self) -> &FileCache {
		&self.cache
	}

	pub fn info(&self) -> std::sync::RwLockReadGuard<'_, VnodeInfo> {
		self.info.read().unwrap()
	}

	pub fn info_mut(&self) -> std::sync::RwLockWriteGuard<'_, VnodeInfo> {
		self.info.write().unwrap()
	}

	pub fn is_dir(&self) -> bool {
		self.info().mode & S_IFMT == S_IFDIR
	}

	pub fn is_reg(&self) -> bool {
		self.info().mode & S_IFMT == S_IFREG
	}

	pub fn size(&self) -> u64 {
		self.info().size
	}

	pub fn set_size(&self, size: u64) {
		self.info_mut().size = size;
	}

	pub fn nlink(&self) -> u32 {
		self.info().nlink
	}

	pub fn blocks(&self) -> u64 {
		self.info().blocks
	}

	pub fn inc_blocks(&self, count: u64) {
		self.info_mut().blocks += count;
	}

	pub fn dec_blocks(&self, count: u64) {
		let mut info = self.info_mut();
		debug_assert!(info.blocks >= count);
		info.blocks -= count;
	}

	pub fn pino(&self) -> u32 {
		self.info().pino
	}

	pub fn test_flag(&self, flag: u32) -> bool {
		self.flags.load(Ordering::Acquire) & flag != 0
	}

	/// Returns whether the flag was already set.
	pub fn set_flag(&self, flag: u32) -> bool {
		self.flags.fetch_or(flag, Ordering::AcqRel) & flag != 0
	}

	pub fn clear_flag(&self, flag: u32) -> bool {
		self.flags.fetch_and(!flag, Ordering::AcqRel) & flag != 0
	}

	pub fn is_cold_file(&self) -> bool {
		self.info().advise & FADVISE_COLD_BIT != 0
	}

	pub fn set_cold_file(&self) {
		self.info_mut().advise |= FADVISE_COLD_BIT;
	}

	pub fn attr(&self) -> VnodeAttr {
		let info = self.info();
		VnodeAttr {
			mode:         info.mode,
			ino:          self.ino,
			size:         info.size,
			storage_size: info.blocks * BLOCK_SIZE as u64,
			link_count:   info.nlink,
			ctime:        info.ctime,
			mtime:        info.mtime,
		}
	}

	pub fn extent(&self) -> ExtentInfo {
		*self.ext.read().unwrap()
	}

	pub fn set_extent(&self, ext: ExtentInfo) {
		*self.ext.write().unwrap() = ext;
	}

	pub fn extent_mut(&self) -> std::sync::RwLockWriteGuard<'_, ExtentInfo> {
		self.ext.write().unwrap()
	}

	pub fn raw_extent(&self) -> Extent {
		let ext = self.ext.read().unwrap();
		Extent {
			fofs:     ext.fofs as u32,
			blk_addr: ext.blk_addr,
			len:      ext.len,
		}
	}

	pub fn load_extent(&self, ext: &Extent) {
		*self.ext.write().unwrap() = ExtentInfo {
			fofs:     ext.fofs as u64,
			blk_addr: ext.blk_addr,
			len:      ext.len,
		};
	}

	pub fn update_version(&self, cp_ver: u64) {
		self.data_version.store(cp_ver, Ordering::Release);
	}

	pub fn data_version(&self) -> u64 {
		self.data_version.load(Ordering::Acquire)
	}

	pub fn touch(&self) {
		let now = timespec_now();
		let mut info = self.info_mut();
		info.ctime = now;
		info.mtime = now;
	}
}

/// Per-mount vnode cache: the owner of every live vnode, keyed by ino, plus
/// a dirty set of inos whose inode metadata has not reached its node page.
pub struct VnodeCache {
	map:   RwLock<HashMap<u32, Arc<Vnode>>>,
	dirty: Mutex<BTreeSet<u32>>,
}

impl VnodeCache {
	pub fn new() -> Self {
		Self {
			map:   RwLock::new(HashMap::new()),
			dirty: Mutex::new(BTreeSet::new()),
		}
	}

	pub fn lookup(&self, ino: u32) -> Option<Arc<Vnode>> {
		self.map.read().unwrap().get(&ino).cloned()
	}

	pub fn insert(&self, vnode: Arc<Vnode>) -> IoResult<()> {
		let mut map = self.map.write().unwrap();
		if map.contains_key(&vnode.ino()) {
			return Err(err!(EEXIST));
		}
		map.insert(vnode.ino(), vnode);
		Ok(())
	}

	pub fn remove(&self, ino: u32) {
		self.map.write().unwrap().remove(&ino);
		self.dirty.lock().unwrap().remove(&ino);
	}

	pub fn add_dirty(&self, ino: u32) {
		self.dirty.lock().unwrap().insert(ino);
	}

	pub fn remove_dirty(&self, ino: u32) {
		self.dirty.lock().unwrap().remove(&ino);
	}

	pub fn dirty_inos(&self) -> Vec<u32> {
		self.dirty.lock().unwrap().iter().copied().collect()
	}

	pub fn all_inos(&self) -> Vec<u32> {
		self.map.read().unwrap().keys().copied().collect()
	}

	pub fn external_users(&self, vnode: &Arc<Vnode>) -> usize {
		// One strong ref is the cache's own, one is the caller's probe.
		Arc::strong_count(vnode).saturating_sub(2)
	}
}

impl F2fs {
	/// Fetch (or load) the vnode for `ino`.
	pub fn vget(&self, ino: u32) -> IoResult<Arc<Vnode>> {
		if let Some(vnode) = self.vcache.lookup(ino) {
			return Ok(vnode);
		}

		let vnode = self.read_vnode(ino)?;
		if !self.sbi.on_recovery() && vnode.nlink() == 0 {
			vnode.set_flag(VNODE_BAD);
			return Err(err!(ENOENT));
		}
		match self.vcache.insert(vnode.clone()) {
			Ok(()) => Ok(vnode),
			// lost the race; take the winner
			Err(_) => self.vcache.lookup(ino).ok_or_else(|| err!(ENOENT)),
		}
	}

	fn read_vnode(&self, ino: u32) -> IoResult<Arc<Vnode>> {
		self.nm.check_nid_range(ino)?;
		let node_page = self.get_node_page(ino)?;
		let node: NodeBlock = node_page.decode()?;
		let raw = node.inode()?;

		let vnode = Vnode::new(ino, layout::is_dir_mode(raw.mode), self.sbi.page_counts.clone());
		{
			let mut info = vnode.info_mut();
			info.mode = raw.mode;
			info.uid = raw.uid;
			info.gid = raw.gid;
			info.nlink = raw.links;
			info.size = raw.size;
			info.blocks = raw.blocks.saturating_sub(1);
			info.atime = Timespec {
				sec:  raw.atime,
				nsec: raw.atime_nsec,
			};
			info.ctime = Timespec {
				sec:  raw.ctime,
				nsec: raw.ctime_nsec,
			};
			info.mtime = Timespec {
				sec:  raw.mtime,
				nsec: raw.mtime_nsec,
			};
			info.generation = raw.generation;
			info.pino = raw.pino;
			info.cur_dir_depth = raw.current_depth;
			info.xattr_nid = raw.xattr_nid;
			info.iflags = raw.flags;
			info.dir_level = raw.dir_level;
			info.advise = raw.advise;
			info.name = String::from_utf8_lossy(raw.name_bytes()).into_owned();
		}
		vnode.load_extent(&raw.ext);
		vnode.update_version(self.sbi.cp_ver().wrapping_sub(1));

		if raw.inline & INLINE_DENTRY != 0 {
			vnode.set_flag(VNODE_INLINE_DENTRY);
		}
		if raw.inline & INLINE_DATA != 0 {
			vnode.set_flag(VNODE_INLINE_DATA);
		}
		if raw.inline & INLINE_XATTR != 0 {
			vnode.set_flag(VNODE_INLINE_XATTR);
		}
		if raw.inline & DATA_EXIST != 0 {
			vnode.set_flag(VNODE_DATA_EXIST);
		}

		let namelen = raw.namelen as usize;
		if namelen > MAX_NAME_LEN || (ino != self.sbi.root_ino() && namelen == 0) {
			log::warn!("vget({ino}): corrupted inode name (len {namelen})");
			vnode.set_flag(VNODE_BAD);
			return Err(err!(ENOENT));
		}

		Ok(vnode)
	}

	pub fn mark_vnode_dirty(&self, vnode: &Vnode) {
		if vnode.set_flag(VNODE_DIRTY) {
			return;
		}
		if vnode.nlink() == 0 {
			return;
		}
		self.vcache.add_dirty(vnode.ino());
	}

	/// Write the in-memory inode metadata into the inode node page.
	pub fn update_inode(&self, vnode: &Vnode, node_page: &Page) -> IoResult<()> {
		let mut node: NodeBlock = node_page.decode()?;
		let mut raw = node.inode()?;
		{
			let info = vnode.info();
			raw.mode = info.mode;
			raw.advise = info.advise;
			raw.uid = info.uid;
			raw.gid = info.gid;
			raw.links = info.nlink;
			raw.size = info.size;
			raw.blocks = info.blocks + 1;
			raw.atime = info.atime.sec;
			raw.atime_nsec = info.atime.nsec;
			raw.ctime = info.ctime.sec;
			raw.ctime_nsec = info.ctime.nsec;
			raw.mtime = info.mtime.sec;
			raw.mtime_nsec = info.mtime.nsec;
			raw.generation = info.generation;
			raw.current_depth = info.cur_dir_depth;
			raw.xattr_nid = info.xattr_nid;
			raw.flags = info.iflags;
			raw.pino = info.pino;
			raw.dir_level = info.dir_level;
			raw.namelen = info.name.len() as u32;
			raw.name = [0; MAX_NAME_LEN];
			raw.name[..info.name.len()].copy_from_slice(info.name.as_bytes());
		}
		raw.ext = vnode.raw_extent();

		raw.inline &= !(INLINE_DATA | INLINE_DENTRY | INLINE_XATTR | DATA_EXIST | EXTRA_ATTR);
		if vnode.test_flag(VNODE_INLINE_DATA) {
			raw.inline |= INLINE_DATA;
		}
		if vnode.test_flag(VNODE_INLINE_DENTRY) {
			raw.inline |= INLINE_DENTRY;
		}
		if vnode.test_flag(VNODE_INLINE_XATTR) {
			raw.inline |= INLINE_XATTR;
		}
		if vnode.test_flag(VNODE_DATA_EXIST) {
			raw.inline |= DATA_EXIST;
		}

		node.set_inode(&raw)?;
		node_page.encode(&node)?;
		self.node_cache.set_dirty(node_page);
		Ok(())
	}

	/// Flush dirty inode metadata to its node page, if any.
	pub fn write_inode(&self, vnode: &Vnode) -> IoResult<()> {
		if !vnode.test_flag(VNODE_DIRTY) {
			return Ok(());
		}
		self.write_inode_now(vnode)
	}

	/// Flush inode metadata unconditionally; unlink paths use this so a dead
	/// inode's link count reaches disk even though it left the dirty list.
	pub(crate) fn write_inode_now(&self, vnode: &Vnode) -> IoResult<()> {
		if vnode.ino() == self.sbi.node_ino() || vnode.ino() == self.sbi.meta_ino() {
			return Ok(());
		}
		let _node_op = self.sbi.node_lock.read().unwrap();
		let node_page = self.get_node_page(vnode.ino())?;
		self.update_inode(vnode, &node_page)
	}

	/// Clear the dnode address slot at `ofs_in_node` range and release the
	/// data blocks. Returns the number of freed blocks.
	pub fn truncate_data_blocks_range(
		&self,
		vnode: &Vnode,
		dn: &Dnode,
		count: usize,
	) -> IoResult<usize> {
		let mut node: NodeBlock = dn.page.decode()?;
		let start_bidx = node.start_bidx_of_node();
		let mut nr_free = 0;

		for i in 0..count {
			let ofs = dn.ofs_in_node as usize + i;
			let blkaddr = node.data_addr(ofs);
			if blkaddr == NULL_ADDR {
				continue;
			}
			node.set_data_addr(ofs, NULL_ADDR);
			self.update_extent_cache(vnode, NULL_ADDR, start_bidx + ofs as u64);
			if blkaddr != NEW_ADDR {
				self.sm.invalidate_blocks(blkaddr);
			}
			self.sbi.dec_valid_block_count(Some(vnode), 1);
			nr_free += 1;
		}

		if nr_free > 0 {
			dn.page.encode(&node)?;
			self.node_cache.set_dirty(&dn.page);
			self.mark_vnode_dirty(vnode);
		}
		Ok(nr_free)
	}

	pub fn truncate_data_blocks(&self, vnode: &Vnode, dn: &Dnode) -> IoResult<usize> {
		self.truncate_data_blocks_range(vnode, dn, ADDRS_PER_BLOCK)
	}

	/// Zero the tail of the last partial block after a shrinking truncate.
	fn truncate_partial_data_page(&self, vnode: &Vnode, from: u64) -> IoResult<()> {
		let offset = (from as usize) % BLOCK_SIZE;
		if offset == 0 {
			return Ok(());
		}
		match self.find_data_page(vnode, from / BLOCK_SIZE as u64) {
			Ok(page) => {
				page.zero_range(offset, BLOCK_SIZE);
				vnode.cache().set_dirty(&page);
				Ok(())
			}
			Err(_) => Ok(()),
		}
	}

	pub fn truncate_blocks(&self, vnode: &Vnode, from: u64) -> IoResult<()> {
		if from > vnode.size() {
			return Ok(());
		}

		let free_from = (from + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;
		{
			let _file_op = self.sbi.file_lock.read().unwrap();
			vnode.cache().invalidate_range(free_from, u64::MAX);

			let mut node_free_from = free_from;
			match self.get_dnode_of_data(vnode, free_from, true) {
				Ok(dn) => {
					let node: NodeBlock = dn.page.decode()?;
					let count = if node.is_inode() {
						ADDRS_PER_INODE
					} else {
						ADDRS_PER_BLOCK
					};
					let count = count - dn.ofs_in_node as usize;
					if dn.ofs_in_node != 0 || node.is_inode() {
						self.truncate_data_blocks_range(vnode, &dn, count)?;
						node_free_from += count as u64;
					}
				}
				Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
				Err(e) => return Err(e),
			}

			self.truncate_inode_blocks(vnode, node_free_from)?;
		}

		// The extent hint must not survive pointing into freed space.
		{
			let mut ext = vnode.extent_mut();
			if ext.len > 0 && ext.fofs + ext.len as u64 > free_from {
				if ext.fofs >= free_from {
					*ext = ExtentInfo::default();
				} else {
					ext.len = (free_from - ext.fofs) as u32;
				}
			}
		}

		self.truncate_partial_data_page(vnode, from)
	}

	/// Punch a hole of whole blocks; used by delete-entry block reclaim and
	/// recovery.
	pub fn truncate_hole(&self, vnode: &Vnode, pg_start: u64, pg_end: u64) -> IoResult<()> {
		vnode.cache().invalidate_range(pg_start, pg_end);
		for index in pg_start..pg_end {
			let dn = match self.get_dnode_of_data(vnode, index, true) {
				Ok(dn) => dn,
				Err(e) if e.raw_os_error() == Some(libc::ENOENT) => continue,
				Err(e) => return Err(e),
			};
			if dn.data_blkaddr()? != NULL_ADDR {
				self.truncate_data_blocks_range(vnode, &dn, 1)?;
			}
		}
		Ok(())
	}

	pub fn do_truncate(&self, vnode: &Vnode, len: u64) -> IoResult<()> {
		if vnode.test_flag(VNODE_INLINE_DATA) {
			self.truncate_inline(vnode, len, false)?;
			vnode.set_size(len);
			self.mark_vnode_dirty(vnode);
			return Ok(());
		}

		self.truncate_blocks(vnode, len)?;
		vnode.set_size(len);
		if len == 0 {
			vnode.clear_flag(VNODE_DATA_EXIST);
		}
		vnode.touch();
		self.mark_vnode_dirty(vnode);
		self.balance_fs()?;
		Ok(())
	}

	/// Release everything a dead inode holds.
	pub fn truncate_to_size(&self, vnode: &Vnode) -> IoResult<()> {
		if vnode.test_flag(VNODE_INLINE_DATA) {
			return Ok(());
		}
		self.truncate_blocks(vnode, 0)
	}

	/// Final teardown of an unlinked inode: drop its data, its node tree and
	/// the inode page, then forget it.
	pub fn evict_vnode(&self, vnode: &Arc<Vnode>) -> IoResult<()> {
		if vnode.ino() == self.sbi.node_ino() || vnode.ino() == self.sbi.meta_ino() {
			return Ok(());
		}
		if vnode.nlink() > 0 || vnode.test_flag(VNODE_BAD) {
			return Ok(());
		}

		vnode.set_flag(VNODE_NO_ALLOC);
		vnode.set_size(0);
		if vnode.blocks() > 0 {
			self.truncate_to_size(vnode)?;
		}
		{
			let _file_op = self.sbi.file_lock.read().unwrap();
			self.remove_inode_page(vnode)?;
		}
		vnode.cache().invalidate();
		self.vcache.remove(vnode.ino());
		Ok(())
	}

	fn space_for_roll_forward(&self) -> bool {
		let c = self.sbi.counters.lock().unwrap();
		c.last_valid_block_count + c.alloc_valid_block_count <= self.sbi.user_block_count as u64
	}

	fn need_to_sync_dir(&self, vnode: &Vnode) -> bool {
		!self.nm.is_checkpointed_node(vnode.pino())
	}

	fn need_do_checkpoint(&self, vnode: &Vnode) -> bool {
		if !vnode.is_reg() || vnode.nlink() != 1 {
			return true;
		}
		if vnode.test_flag(VNODE_NEED_CP) {
			return true;
		}
		if !self.space_for_roll_forward() {
			return true;
		}
		if self.need_to_sync_dir(vnode) {
			return true;
		}
		if self.sbi.opts.disable_roll_forward {
			return true;
		}
		if self
			.sbi
			.modified_dir_inos
			.lock()
			.unwrap()
			.contains(&vnode.pino())
		{
			return true;
		}
		false
	}

	/// Make one file durable. Cheap path: push only the file's dnode chain
	/// with fsync markers; recovery replays it. Expensive path: a full
	/// checkpoint.
	pub fn sync_file(&self, vnode: &Arc<Vnode>) -> IoResult<()> {
		if self.sbi.cp_error() {
			return Err(err!(EROFS));
		}
		if !vnode.test_flag(VNODE_DIRTY) && vnode.cache().dirty_count() == 0 {
			return Ok(());
		}

		self.write_data_pages(vnode)?;
		self.write_inode(vnode)?;

		if self.need_do_checkpoint(vnode) {
			self.sync_fs()?;
			vnode.clear_flag(VNODE_NEED_CP);
			if self.sbi.cp_error() {
				return Err(err!(EROFS));
			}
		} else {
			self.fsync_node_pages(vnode)?;
			self.bc.flush()?;
		}
		self.clear_vnode_dirty(vnode);
		Ok(())
	}

	pub fn clear_vnode_dirty(&self, vnode: &Vnode) {
		if vnode.cache().dirty_count() == 0 {
			vnode.clear_flag(VNODE_DIRTY);
			self.vcache.remove_dirty(vnode.ino());
		}
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn flags_are_sticky() {
		let v = Vnode::new(5, false, PageCounters::new());
		assert!(!v.set_flag(VNODE_DIRTY));
		assert!(v.set_flag(VNODE_DIRTY));
		assert!(v.clear_flag(VNODE_DIRTY));
		assert!(!v.clear_flag(VNODE_DIRTY));
	}

	#[test]
	fn attr_reports_storage_size() {
		let v = Vnode::new(5, false, PageCounters::new());
		{
			let mut info = v.info_mut();
			info.mode = S_IFREG | 0o644;
			info.size = 5000;
			info.blocks = 2;
			info.nlink = 1;
		}
		let attr = v.attr();
		assert_eq!(attr.ino, 5);
		assert_eq!(attr.size, 5000);
		assert_eq!(attr.storage_size, 2 * BLOCK_SIZE as u64);
		assert_eq!(attr.link_count, 1);
	}

	#[test]
	fn cache_rejects_double_insert() {
		let cache = VnodeCache::new();
		let v = Vnode::new(9, false, PageCounters::new());
		cache.insert(v.clone()).unwrap();
		assert!(cache.insert(v.clone()).is_err());
		assert!(cache.lookup(9).is_some());
		cache.remove(9);
		assert!(cache.lookup(9).is_none());
	}
}
