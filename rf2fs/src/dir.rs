use std::{io::Result as IoResult, sync::Arc};

use crate::{
	bits, err,
	layout::{
		dentry_slots, file_type_of_mode, DentryBlock, DirEntry, BLOCK_SIZE, HASH_COL_BIT,
		MAX_DIR_HASH_DEPTH, MAX_NAME_LEN, NR_DENTRY_IN_BLOCK, S_IFDIR,
	},
	mount::F2fs,
	page::Page,
	vnode::{
		timespec_now, Vnode, VNODE_INC_LINK, VNODE_INLINE_DATA, VNODE_INLINE_DENTRY,
		VNODE_INLINE_XATTR, VNODE_NEED_CP, VNODE_NEW,
	},
};

fn str2hashbuf(msg: &[u8], len: usize) -> [u32; 4] {
	let mut pad = len as u32 | ((len as u32) << 8);
	pad |= pad << 16;

	let mut buf = [pad; 4];
	let mut val = pad;
	let len = len.min(16).min(msg.len());
	let mut num = 0;
	for (i, b) in msg.iter().enumerate().take(len) {
		if i % 4 == 0 {
			val = pad;
		}
		val = *b as u32 + (val << 8);
		if i % 4 == 3 {
			buf[num] = val;
			num += 1;
			val = pad;
		}
	}
	if num < 4 {
		buf[num] = val;
		num += 1;
	}
	while num < 4 {
		buf[num] = pad;
		num += 1;
	}
	buf
}

fn tea_transform(buf: &mut [u32; 4], input: &[u32; 4]) {
	let mut sum = 0u32;
	let (mut b0, mut b1) = (buf[0], buf[1]);
	let (a, b, c, d) = (input[0], input[1], input[2], input[3]);

	for _ in 0..16 {
		sum = sum.wrapping_add(0x9E37_79B9);
		b0 = b0.wrapping_add(
			((b1 << 4).wrapping_add(a)) ^ b1.wrapping_add(sum) ^ ((b1 >> 5).wrapping_add(b)),
		);
		b1 = b1.wrapping_add(
			((b0 << 4).wrapping_add(c)) ^ b0.wrapping_add(sum) ^ ((b0 >> 5).wrapping_add(d)),
		);
	}

	buf[0] = buf[0].wrapping_add(b0);
	buf[1] = buf[1].wrapping_add(b1);
}

/// TEA-based name hash; "." and ".." hash to 0 and the collision bit is
/// always cleared.
pub fn dentry_hash(name: &str) -> u32 {
	if name == "." || name == ".." {
		return 0;
	}

	let mut buf = [0x6745_2301u32, 0xefcd_ab89, 0x98ba_dcfe, 0x1032_5476];
	let bytes = name.as_bytes();
	let mut pos = 0usize;
	let mut left = bytes.len();
	while left > 0 {
		let input = str2hashbuf(&bytes[pos..], left);
		tea_transform(&mut buf, &input);
		left = left.saturating_sub(16);
		pos += 16;
	}
	buf[0] & !HASH_COL_BIT
}

/// Buckets at one level of the hash tree.
pub fn dir_buckets(level: u32, dir_level: u8) -> u32 {
	if level + (dir_level as u32) < MAX_DIR_HASH_DEPTH / 2 {
		1 << (level + dir_level as u32)
	} else {
		1 << (MAX_DIR_HASH_DEPTH / 2 - 1)
	}
}

/// Blocks spanned by one bucket.
pub fn bucket_blocks(level: u32) -> u32 {
	if level < MAX_DIR_HASH_DEPTH / 2 {
		2
	} else {
		4
	}
}

/// First directory block of `bucket` at `level`.
pub fn dir_block_index(level: u32, dir_level: u8, bucket: u32) -> u64 {
	let mut bidx = 0u64;
	for i in 0..level {
		bidx += dir_buckets(i, dir_level) as u64 * bucket_blocks(i) as u64;
	}
	bidx + bucket as u64 * bucket_blocks(level) as u64
}

pub fn is_valid_name(name: &str) -> bool {
	!name.is_empty()
		&& name.len() <= MAX_NAME_LEN
		&& name != "."
		&& name != ".."
		&& !name.bytes().any(|b| b == b'/' || b == 0)
}

/// A located directory entry: the page holding it (a dentry block, or the
/// inode page for inline directories) and its slot position.
pub struct DirEntryLoc {
	pub page:        Arc<Page>,
	pub inline:      bool,
	pub block_index: u64,
	pub bit_pos:     usize,
	pub entry:       DirEntry,
}

fn early_match_name(name: &str, hash: u32, de: &DirEntry) -> bool {
	de.name_len as usize == name.len() && de.hash_code == hash
}

/// Scan one dentry block. `max_slots` reports the widest free run seen, for
/// the insert-level hint.
fn find_in_block(
	blk: &DentryBlock,
	name: &str,
	hash: u32,
	max_slots: &mut usize,
) -> Option<(usize, DirEntry)> {
	let mut bit_pos = bits::find_next_bit(&blk.dentry_bitmap, NR_DENTRY_IN_BLOCK, 0);
	while bit_pos < NR_DENTRY_IN_BLOCK {
		let de = blk.dentry[bit_pos];
		// a zero name length would stall the scan on a corrupted block
		let slots = dentry_slots(de.name_len as usize).max(1);

		if early_match_name(name, hash, &de)
			&& blk.name_of(bit_pos, de.name_len as usize) == name.as_bytes()
		{
			return Some((bit_pos, de));
		}

		let next_pos = bit_pos + slots;
		bit_pos = bits::find_next_bit(&blk.dentry_bitmap, NR_DENTRY_IN_BLOCK, next_pos);
		let end_pos = if bit_pos >= NR_DENTRY_IN_BLOCK {
			NR_DENTRY_IN_BLOCK
		} else {
			bit_pos
		};
		if *max_slots < end_pos - next_pos {
			*max_slots = end_pos - next_pos;
		}
	}
	None
}

/// Widest-run-first slot search within one dentry bitmap.
pub(crate) fn room_for_filename(bitmap: &[u8], slots: usize, max: usize) -> usize {
	let mut bit_start = 0;
	loop {
		let zero_start = bits::find_next_zero_bit(bitmap, max, bit_start);
		if zero_start >= max {
			return max;
		}
		let zero_end = bits::find_next_bit(bitmap, max, zero_start);
		if zero_end - zero_start >= slots {
			return zero_start;
		}
		bit_start = zero_end + 1;
		if zero_end + 1 >= max {
			return max;
		}
	}
}

impl F2fs {
	fn find_in_level(
		&self,
		dir: &Vnode,
		level: u32,
		name: &str,
		hash: u32,
	) -> IoResult<Option<DirEntryLoc>> {
		let slots = dentry_slots(name.len());
		let dir_level = dir.info().dir_level;
		let nbucket = dir_buckets(level, dir_level);
		let nblock = bucket_blocks(level);
		let bidx = dir_block_index(level, dir_level, hash % nbucket);
		let mut room = false;

		for block in bidx..bidx + nblock as u64 {
			let page = match self.find_data_page(dir, block) {
				Ok(page) => page,
				Err(_) => {
					room = true;
					continue;
				}
			};
			let blk: DentryBlock = page.decode()?;
			let mut max_slots = 0usize;
			if let Some((bit_pos, entry)) = find_in_block(&blk, name, hash, &mut max_slots) {
				return Ok(Some(DirEntryLoc {
					page,
					inline: false,
					block_index: block,
					bit_pos,
					entry,
				}));
			}
			if max_slots >= slots {
				room = true;
			}
		}

		if room {
			let mut info = dir.info_mut();
			if info.dir_hash.map(|(h, _)| h) != Some(hash) {
				info.dir_hash = Some((hash, level));
			}
		}
		Ok(None)
	}

	/// Hashed lookup through the bucket levels.
	pub fn find_entry(&self, dir: &Vnode, name: &str) -> IoResult<Option<DirEntryLoc>> {
		if dir.test_flag(VNODE_INLINE_DENTRY) {
			return self.find_in_inline_dir(dir, name);
		}
		if dir.blocks() == 0 {
			return Ok(None);
		}

		let hash = dentry_hash(name);
		let max_depth = dir.info().cur_dir_depth;
		for level in 0..max_depth {
			if let Some(loc) = self.find_in_level(dir, level, name, hash)? {
				return Ok(Some(loc));
			}
		}
		{
			let mut info = dir.info_mut();
			if info.dir_hash.map(|(h, _)| h) != Some(hash) {
				info.dir_hash = Some((hash, max_depth.saturating_sub(1)));
			}
		}
		Ok(None)
	}

	pub fn inode_by_name(&self, dir: &Vnode, name: &str) -> IoResult<u32> {
		match self.find_entry(dir, name)? {
			Some(loc) => Ok(loc.entry.ino),
			None => Err(err!(ENOENT)),
		}
	}

	/// Point an existing entry at another inode (rename overwrite, ".."
	/// fixup).
	pub(crate) fn set_link(
		&self,
		dir: &Vnode,
		loc: &DirEntryLoc,
		vnode: &Vnode,
	) -> IoResult<()> {
		if loc.inline {
			return self.set_inline_link(dir, loc, vnode);
		}
		let mut blk: DentryBlock = loc.page.decode()?;
		blk.dentry[loc.bit_pos].ino = vnode.ino();
		blk.dentry[loc.bit_pos].file_type = file_type_of_mode(vnode.info().mode);
		loc.page.encode(&blk)?;
		dir.cache().set_dirty(&loc.page);
		dir.touch();
		self.mark_vnode_dirty(dir);
		Ok(())
	}

	/// Location of the ".." entry of `dir`.
	pub(crate) fn parent_entry(&self, dir: &Vnode) -> IoResult<DirEntryLoc> {
		if dir.test_flag(VNODE_INLINE_DENTRY) {
			return self.inline_parent_entry(dir);
		}
		let page = self.find_data_page(dir, 0)?;
		let blk: DentryBlock = page.decode()?;
		Ok(DirEntryLoc {
			entry: blk.dentry[1],
			page,
			inline: false,
			block_index: 0,
			bit_pos: 1,
		})
	}

	/// Seed a fresh directory with "." and "..".
	pub(crate) fn make_empty(&self, vnode: &Vnode, parent_ino: u32) -> IoResult<()> {
		if vnode.test_flag(VNODE_INLINE_DENTRY) {
			return self.make_empty_inline_dir(vnode, parent_ino);
		}

		let page = self.get_new_data_page(vnode, 0, true)?;
		let mut blk = DentryBlock::zeroed();

		blk.dentry[0] = DirEntry {
			hash_code: 0,
			ino:       vnode.ino(),
			name_len:  1,
			file_type: crate::layout::FT_DIR,
		};
		blk.set_name(0, b".");
		blk.dentry[1] = DirEntry {
			hash_code: 0,
			ino:       parent_ino,
			name_len:  2,
			file_type: crate::layout::FT_DIR,
		};
		blk.set_name(1, b"..");
		bits::set_bit(0, &mut blk.dentry_bitmap);
		bits::set_bit(1, &mut blk.dentry_bitmap);

		page.encode(&blk)?;
		vnode.cache().set_dirty(&page);
		self.mark_vnode_dirty(vnode);
		Ok(())
	}

	/// First-link setup for the child inode: materialise a new inode page,
	/// or refresh the name on an existing one.
	pub(crate) fn init_inode_metadata(&self, dir: &Vnode, vnode: &Vnode) -> IoResult<()> {
		if vnode.test_flag(VNODE_NEW) {
			let page = self.new_node_page(vnode, vnode.ino(), 0)?;
			if vnode.is_dir() {
				if let Err(e) = self.make_empty(vnode, dir.ino()) {
					self.remove_inode_page(vnode)?;
					return Err(e);
				}
				// "." counts against the new directory itself
				vnode.info_mut().nlink += 1;
			}
			self.update_inode(vnode, &page)?;
		} else {
			let page = self.get_node_page(vnode.ino())?;
			self.update_inode(vnode, &page)?;
		}
		if vnode.test_flag(VNODE_INC_LINK) {
			vnode.info_mut().nlink += 1;
			self.write_inode(vnode)?;
		}
		Ok(())
	}

	pub(crate) fn update_parent_metadata(&self, dir: &Vnode, vnode: &Vnode, current_depth: u32) {
		if vnode.clear_flag(VNODE_NEW) && vnode.is_dir() {
			dir.info_mut().nlink += 1;
		}
		vnode.info_mut().pino = dir.ino();
		dir.touch();
		if dir.info().cur_dir_depth != current_depth {
			dir.info_mut().cur_dir_depth = current_depth;
		}
		self.mark_vnode_dirty(dir);
		self.mark_vnode_dirty(vnode);
		vnode.clear_flag(VNODE_INC_LINK);
	}

	/// Insert a dentry, deepening the hash tree as needed. `ERANGE` when the
	/// maximum depth is exhausted.
	pub(crate) fn add_link(&self, dir: &Vnode, name: &str, vnode: &Vnode) -> IoResult<()> {
		if dir.test_flag(VNODE_INLINE_DENTRY) {
			if !self.add_inline_entry(dir, name, vnode)? {
				return Ok(());
			}
			// fell through: the inline area was full and got converted
		}

		let hash = dentry_hash(name);
		let slots = dentry_slots(name.len());
		let mut level = 0u32;
		let mut current_depth = dir.info().cur_dir_depth;
		{
			let mut info = dir.info_mut();
			if let Some((h, l)) = info.dir_hash {
				if h == hash {
					level = l;
					info.dir_hash = None;
				}
			}
		}

		loop {
			if current_depth == MAX_DIR_HASH_DEPTH {
				return Err(err!(ERANGE));
			}
			if level == current_depth {
				current_depth += 1;
			}

			let dir_level = dir.info().dir_level;
			let nbucket = dir_buckets(level, dir_level);
			let nblock = bucket_blocks(level);
			let bidx = dir_block_index(level, dir_level, hash % nbucket);

			for block in bidx..bidx + nblock as u64 {
				let page = self.get_new_data_page(dir, block, true)?;
				let mut blk: DentryBlock = page.decode()?;
				let bit_pos = room_for_filename(&blk.dentry_bitmap, slots, NR_DENTRY_IN_BLOCK);
				if bit_pos >= NR_DENTRY_IN_BLOCK {
					continue;
				}

				self.init_inode_metadata(dir, vnode)?;

				blk.dentry[bit_pos] = DirEntry {
					hash_code: hash,
					ino:       vnode.ino(),
					name_len:  name.len() as u16,
					file_type: file_type_of_mode(vnode.info().mode),
				};
				blk.set_name(bit_pos, name.as_bytes());
				for i in 0..slots {
					bits::set_bit(bit_pos + i, &mut blk.dentry_bitmap);
				}
				page.encode(&blk)?;
				dir.cache().set_dirty(&page);

				self.update_parent_metadata(dir, vnode, current_depth);
				return Ok(());
			}
			level += 1;
		}
	}

	/// Remove a dentry. When `target` is given its link counts move too; a
	/// block emptied completely is punched out of the directory.
	pub(crate) fn delete_entry(
		&self,
		dir: &Vnode,
		loc: &DirEntryLoc,
		target: Option<&Arc<Vnode>>,
	) -> IoResult<()> {
		if loc.inline {
			return self.delete_inline_entry(dir, loc, target);
		}

		let mut blk: DentryBlock = loc.page.decode()?;
		let slots = loc.entry.slots();
		for i in 0..slots {
			bits::clear_bit(loc.bit_pos + i, &mut blk.dentry_bitmap);
		}
		loc.page.encode(&blk)?;
		dir.cache().set_dirty(&loc.page);

		let now = timespec_now();
		{
			let mut info = dir.info_mut();
			info.ctime = now;
			info.mtime = now;
		}
		self.mark_vnode_dirty(dir);

		if let Some(vnode) = target {
			if vnode.is_dir() {
				dir.info_mut().nlink -= 1;
			}
			{
				let mut info = vnode.info_mut();
				info.ctime = now;
				info.nlink -= 1;
				if info.mode & S_IFDIR == S_IFDIR {
					info.nlink = info.nlink.saturating_sub(1);
					info.size = 0;
				}
			}
			self.mark_vnode_dirty(vnode);
			self.write_inode_now(vnode)?;
			if vnode.nlink() == 0 {
				self.add_orphan_inode(vnode.ino());
			}
		}

		let next = bits::find_next_bit(&blk.dentry_bitmap, NR_DENTRY_IN_BLOCK, 0);
		if next == NR_DENTRY_IN_BLOCK {
			self.truncate_hole(dir, loc.block_index, loc.block_index + 1)?;
		}
		Ok(())
	}

	pub fn is_empty_dir(&self, dir: &Vnode) -> IoResult<bool> {
		if dir.test_flag(VNODE_INLINE_DENTRY) {
			return self.is_empty_inline_dir(dir);
		}
		let nblock = dir.size().div_ceil(BLOCK_SIZE as u64);
		for bidx in 0..nblock {
			let page = match self.find_data_page(dir, bidx) {
				Ok(page) => page,
				Err(e) if e.raw_os_error() == Some(libc::ENOENT) => continue,
				Err(e) => return Err(e),
			};
			let blk: DentryBlock = page.decode()?;
			let start = if bidx == 0 { 2 } else { 0 };
			if bits::find_next_bit(&blk.dentry_bitmap, NR_DENTRY_IN_BLOCK, start)
				< NR_DENTRY_IN_BLOCK
			{
				return Ok(false);
			}
		}
		Ok(true)
	}

	/// Enumerate entries; the callback returns `false` to stop. ".." is
	/// skipped, matching the hosting VFS convention.
	pub fn readdir(
		&self,
		dir: &Vnode,
		mut f: impl FnMut(&str, u32, u8) -> bool,
	) -> IoResult<()> {
		if dir.size() == 0 {
			return Ok(());
		}
		if dir.test_flag(VNODE_INLINE_DENTRY) {
			return self.readdir_inline(dir, f);
		}

		let npages = dir.size().div_ceil(BLOCK_SIZE as u64);
		for n in 0..npages {
			let page = match self.find_data_page(dir, n) {
				Ok(page) => page,
				Err(e) if e.raw_os_error() == Some(libc::ENOENT) => continue,
				Err(e) => return Err(e),
			};
			let blk: DentryBlock = page.decode()?;
			let mut bit_pos = 0usize;
			while bit_pos < NR_DENTRY_IN_BLOCK {
				bit_pos = bits::find_next_bit(&blk.dentry_bitmap, NR_DENTRY_IN_BLOCK, bit_pos);
				if bit_pos >= NR_DENTRY_IN_BLOCK {
					break;
				}
				let de = blk.dentry[bit_pos];
				let raw_name = blk.name_of(bit_pos, de.name_len as usize);
				let name = String::from_utf8_lossy(&raw_name).into_owned();
				if de.ino != 0 && name != ".." && !f(&name, de.ino, de.file_type) {
					return Ok(());
				}
				bit_pos += de.slots().max(1);
			}
		}
		Ok(())
	}

	// -- namei ---------------------------------------------------------------

	/// Allocate an inode for a new file or directory.
	fn new_vnode(&self, dir: &Vnode, mode: u16, name: &str) -> IoResult<Arc<Vnode>> {
		let nid = {
			let _file_op = self.sbi.file_lock.read().unwrap();
			self.alloc_nid()?
		};

		let vnode = Vnode::new(nid, crate::layout::is_dir_mode(mode), self.sbi.page_counts.clone());
		let now = timespec_now();
		{
			let mut info = vnode.info_mut();
			info.mode = mode;
			info.uid = unsafe { libc::getuid() };
			info.gid = unsafe { libc::getgid() };
			info.nlink = 1;
			info.atime = now;
			info.ctime = now;
			info.mtime = now;
			info.generation = self.sbi.next_generation();
			info.pino = dir.ino();
			info.cur_dir_depth = 1;
			info.name = name.to_string();
		}

		if self.sbi.opts.inline_data && !vnode.is_dir() {
			vnode.set_flag(VNODE_INLINE_DATA);
		}
		if self.sbi.opts.inline_dentry && vnode.is_dir() {
			vnode.set_flag(VNODE_INLINE_DENTRY);
		}
		if self.sbi.opts.inline_xattr {
			vnode.set_flag(VNODE_INLINE_XATTR);
		}
		vnode.set_flag(VNODE_NEW);

		self.vcache.insert(vnode.clone())?;
		self.mark_vnode_dirty(&vnode);
		Ok(vnode)
	}

	/// Tag multimedia files cold so their data lands in the cold log.
	fn ext_identify(&self, vnode: &Vnode) {
		let name = vnode.info().name.clone();
		let lower = name.to_lowercase();
		for ext in self.sbi.raw.extensions() {
			if lower.ends_with(&format!(".{ext}")) {
				vnode.set_cold_file();
				return;
			}
		}
	}

	pub fn lookup(&self, dir: &Vnode, name: &str) -> IoResult<Arc<Vnode>> {
		if !dir.is_dir() {
			return Err(err!(ENOTDIR));
		}
		if !is_valid_name(name) {
			return Err(err!(EINVAL));
		}
		let ino = self.inode_by_name(dir, name)?;
		self.vget(ino)
	}

	/// Create a regular file or directory, depending on `mode`.
	pub fn create(&self, dir: &Arc<Vnode>, name: &str, mode: u16) -> IoResult<Arc<Vnode>> {
		self.check_rw()?;
		if !dir.is_dir() {
			return Err(err!(ENOTDIR));
		}
		if !is_valid_name(name) {
			return Err(err!(EINVAL));
		}
		if dir.nlink() == 0 {
			return Err(err!(ENOENT));
		}
		if self.find_entry(dir, name)?.is_some() {
			return Err(err!(EEXIST));
		}

		let vnode = self.new_vnode(dir, mode, name)?;
		if !self.sbi.opts.disable_ext_identify && !vnode.is_dir() {
			self.ext_identify(&vnode);
		}

		let linked = {
			let _file_op = self.sbi.file_lock.read().unwrap();
			self.add_link(dir, name, &vnode)
		};
		if let Err(e) = linked {
			vnode.info_mut().nlink = 0;
			self.vcache.remove(vnode.ino());
			self.nm.alloc_nid_failed(vnode.ino());
			return Err(e);
		}
		self.nm.alloc_nid_done(vnode.ino());
		vnode.clear_flag(VNODE_NEW);

		self.balance_fs()?;
		Ok(vnode)
	}

	pub fn mkdir(&self, dir: &Arc<Vnode>, name: &str, mode: u16) -> IoResult<Arc<Vnode>> {
		self.create(dir, name, S_IFDIR | (mode & 0o7777))
	}

	/// Add a hard link to an existing regular file.
	pub fn link(&self, dir: &Arc<Vnode>, name: &str, target: &Arc<Vnode>) -> IoResult<()> {
		self.check_rw()?;
		if !is_valid_name(name) {
			return Err(err!(EINVAL));
		}
		if target.is_dir() {
			return Err(err!(EISDIR));
		}
		if self.find_entry(dir, name)?.is_some() {
			return Err(err!(EEXIST));
		}
		if target.nlink() >= crate::layout::LINK_MAX {
			return Err(err!(EMLINK));
		}

		target.info_mut().ctime = timespec_now();
		target.set_flag(VNODE_INC_LINK);
		let res = {
			let _file_op = self.sbi.file_lock.read().unwrap();
			self.add_link(dir, name, target)
		};
		if let Err(e) = res {
			target.clear_flag(VNODE_INC_LINK);
			return Err(e);
		}
		self.balance_fs()?;
		Ok(())
	}

	/// Unlink a file or remove an empty directory.
	pub fn unlink(&self, dir: &Arc<Vnode>, name: &str) -> IoResult<()> {
		self.check_rw()?;
		if !is_valid_name(name) {
			return Err(err!(EINVAL));
		}
		let vnode = self.lookup(dir, name)?;
		if vnode.is_dir() && !self.is_empty_dir(&vnode)? {
			return Err(err!(ENOTEMPTY));
		}

		{
			let _file_op = self.sbi.file_lock.read().unwrap();
			let loc = self
				.find_entry(dir, name)?
				.ok_or_else(|| err!(ENOENT))?;
			self.check_orphan_space()?;
			self.delete_entry(dir, &loc, Some(&vnode))?;
		}
		self.balance_fs()?;
		Ok(())
	}

	/// Whether `child` sits inside the subtree rooted at `ancestor`.
	fn is_subdir(&self, ancestor: &Vnode, child: &Vnode) -> IoResult<bool> {
		let root_ino = self.sbi.root_ino();
		let mut cur_ino = child.ino();
		let mut cur_pino = child.pino();
		while cur_ino != root_ino {
			if cur_ino == ancestor.ino() {
				return Ok(true);
			}
			let parent = self.vget(cur_pino)?;
			cur_ino = parent.ino();
			cur_pino = parent.pino();
		}
		Ok(false)
	}

	/// Rename with POSIX overwrite semantics. A directory move marks both
	/// parents so the next fsync of either forces a full checkpoint.
	pub fn rename(
		&self,
		old_dir: &Arc<Vnode>,
		oldname: &str,
		new_dir: &Arc<Vnode>,
		newname: &str,
	) -> IoResult<()> {
		self.check_rw()?;
		if !is_valid_name(oldname) || !is_valid_name(newname) {
			return Err(err!(EINVAL));
		}
		if new_dir.nlink() == 0 {
			return Err(err!(ENOENT));
		}

		let now = timespec_now();
		let same_dir = old_dir.ino() == new_dir.ino();

		let old_loc = self
			.find_entry(old_dir, oldname)?
			.ok_or_else(|| err!(ENOENT))?;
		let old_vnode = self.vget(old_loc.entry.ino)?;

		let old_is_dir = old_vnode.is_dir();
		let old_parent_loc = if old_is_dir {
			if self.is_subdir(&old_vnode, new_dir)? {
				return Err(err!(EINVAL));
			}
			Some(self.parent_entry(&old_vnode)?)
		} else {
			None
		};

		let _file_op = self.sbi.file_lock.read().unwrap();

		if let Some(new_loc) = self.find_entry(new_dir, newname)? {
			let new_vnode = self.vget(new_loc.entry.ino)?;

			if same_dir && oldname == newname {
				return Ok(());
			}
			if old_is_dir && !new_vnode.is_dir() {
				return Err(err!(ENOTDIR));
			}
			if !old_is_dir && new_vnode.is_dir() {
				return Err(err!(EISDIR));
			}
			if old_is_dir && !self.is_empty_dir(&new_vnode)? {
				return Err(err!(ENOTEMPTY));
			}

			old_vnode.info_mut().name = newname.to_string();
			self.set_link(new_dir, &new_loc, &old_vnode)?;

			{
				let mut info = new_vnode.info_mut();
				info.ctime = now;
				if old_is_dir {
					info.nlink = info.nlink.saturating_sub(1);
				}
				info.nlink = info.nlink.saturating_sub(1);
			}
			self.mark_vnode_dirty(&new_vnode);
			self.write_inode_now(&new_vnode)?;
			if new_vnode.nlink() == 0 {
				self.add_orphan_inode(new_vnode.ino());
			}
		} else {
			if same_dir && oldname == newname {
				return Ok(());
			}
			old_vnode.info_mut().name = newname.to_string();
			self.add_link(new_dir, newname, &old_vnode)?;
			if old_is_dir && !same_dir {
				new_dir.info_mut().nlink += 1;
				self.mark_vnode_dirty(new_dir);
			}
		}

		{
			let mut info = old_vnode.info_mut();
			info.pino = new_dir.ino();
			info.ctime = now;
		}
		old_vnode.set_flag(VNODE_NEED_CP);
		self.mark_vnode_dirty(&old_vnode);

		self.delete_entry(old_dir, &old_loc, None)?;

		if let Some(parent_loc) = old_parent_loc {
			if !same_dir {
				self.set_link(&old_vnode, &parent_loc, new_dir)?;
			}
			old_dir.info_mut().nlink -= 1;
			self.mark_vnode_dirty(old_dir);
		}

		{
			let mut modified = self.sbi.modified_dir_inos.lock().unwrap();
			modified.insert(new_dir.ino());
			if old_is_dir {
				modified.insert(old_vnode.ino());
			}
		}

		drop(_file_op);
		self.balance_fs()?;
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn dot_names_hash_to_zero() {
		assert_eq!(dentry_hash("."), 0);
		assert_eq!(dentry_hash(".."), 0);
	}

	#[test]
	fn hash_is_stable_and_collision_bit_free() {
		let h1 = dentry_hash("hello.txt");
		let h2 = dentry_hash("hello.txt");
		assert_eq!(h1, h2);
		assert_eq!(h1 & HASH_COL_BIT, 0);
		assert_ne!(dentry_hash("hello.txt"), dentry_hash("hello.txu"));
		// names longer than one TEA round still hash
		let long = "a".repeat(40);
		assert_eq!(dentry_hash(&long) & HASH_COL_BIT, 0);
	}

	#[test]
	fn bucket_geometry() {
		assert_eq!(dir_buckets(0, 0), 1);
		assert_eq!(dir_buckets(3, 0), 8);
		assert_eq!(dir_buckets(40, 0), 1 << (MAX_DIR_HASH_DEPTH / 2 - 1));
		assert_eq!(bucket_blocks(0), 2);
		assert_eq!(bucket_blocks(40), 4);
		// level 0: one bucket of two blocks; level 1 starts at block 2
		assert_eq!(dir_block_index(0, 0, 0), 0);
		assert_eq!(dir_block_index(1, 0, 0), 2);
		assert_eq!(dir_block_index(1, 0, 1), 4);
	}

	#[test]
	fn name_validation() {
		assert!(is_valid_name("a"));
		assert!(is_valid_name(&"x".repeat(MAX_NAME_LEN)));
		assert!(!is_valid_name(""));
		assert!(!is_valid_name("."));
		assert!(!is_valid_name(".."));
		assert!(!is_valid_name("a/b"));
		assert!(!is_valid_name("a\0b"));
		assert!(!is_valid_name(&"x".repeat(MAX_NAME_LEN + 1)));
	}

	#[test]
	fn slot_search_finds_runs() {
		let mut bitmap = [0u8; 27];
		// occupy slots 0..3 and 5
		for i in 0..3 {
			bits::set_bit(i, &mut bitmap);
		}
		bits::set_bit(5, &mut bitmap);
		assert_eq!(room_for_filename(&bitmap, 1, NR_DENTRY_IN_BLOCK), 3);
		assert_eq!(room_for_filename(&bitmap, 2, NR_DENTRY_IN_BLOCK), 6);
		let full = [0xffu8; 27];
		assert_eq!(
			room_for_filename(&full, 1, NR_DENTRY_IN_BLOCK),
			NR_DENTRY_IN_BLOCK
		);
	}
}
