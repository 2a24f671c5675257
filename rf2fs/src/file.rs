use std::{io::Result as IoResult, sync::Arc};

use crate::{
	err,
	layout::{
		NodeBlock, ADDRS_PER_BLOCK, ADDRS_PER_INODE, BLOCK_SIZE, NEW_ADDR, NIDS_PER_BLOCK,
		NULL_ADDR,
	},
	mount::F2fs,
	node::Dnode,
	page::Page,
	vnode::{ExtentInfo, Vnode, VNODE_INLINE_DATA, VNODE_NO_ALLOC},
};

/// One extent-hint transition: replace, front/back merge, drop, or split
/// keeping the larger half. Returns whether the hint changed.
pub(crate) fn extent_update(ext: &mut ExtentInfo, blk_addr: u32, fofs: u64) -> bool {
	let start_fofs = ext.fofs;
	let end_fofs = ext.fofs + ext.len.saturating_sub(1) as u64;
	let start_blkaddr = ext.blk_addr;
	let end_blkaddr = ext.blk_addr + ext.len.saturating_sub(1);

	// drop and reinitialise a matched single block
	if ext.len == 1 && fofs == start_fofs {
		ext.len = 0;
	}

	if ext.len == 0 {
		if blk_addr != NULL_ADDR {
			ext.fofs = fofs;
			ext.blk_addr = blk_addr;
			ext.len = 1;
		}
		return true;
	}

	// front merge
	if fofs + 1 == start_fofs && blk_addr + 1 == start_blkaddr {
		ext.fofs -= 1;
		ext.blk_addr -= 1;
		ext.len += 1;
		return true;
	}

	// back merge
	if fofs == end_fofs + 1 && blk_addr == end_blkaddr + 1 {
		ext.len += 1;
		return true;
	}

	// split: keep the larger half
	if ext.len > 1 && fofs >= start_fofs && fofs <= end_fofs {
		if (end_fofs - fofs) < (ext.len as u64 >> 1) {
			ext.len = (fofs - start_fofs) as u32;
		} else {
			let advance = fofs - start_fofs + 1;
			ext.fofs = fofs + 1;
			ext.blk_addr = start_blkaddr + advance as u32;
			ext.len -= advance as u32;
		}
		return true;
	}

	false
}

/// Largest representable file: the whole dnode tree, in bytes.
pub fn max_file_size() -> u64 {
	let mut blocks = ADDRS_PER_INODE as u64;
	blocks += 2 * ADDRS_PER_BLOCK as u64;
	blocks += 2 * ADDRS_PER_BLOCK as u64 * NIDS_PER_BLOCK as u64;
	blocks += ADDRS_PER_BLOCK as u64 * NIDS_PER_BLOCK as u64 * NIDS_PER_BLOCK as u64;
	blocks * BLOCK_SIZE as u64
}

impl F2fs {
	/// Update the data block address in a dnode slot.
	pub(crate) fn set_data_blkaddr(&self, dn: &Dnode, new_addr: u32) -> IoResult<()> {
		let mut node: NodeBlock = dn.page.decode()?;
		node.set_data_addr(dn.ofs_in_node as usize, new_addr);
		dn.page.encode(&node)?;
		self.node_cache.set_dirty(&dn.page);
		Ok(())
	}

	/// Reserve an address slot for a block that has no physical home yet.
	pub(crate) fn reserve_new_block(&self, vnode: &Vnode, dn: &Dnode) -> IoResult<()> {
		if vnode.test_flag(VNODE_NO_ALLOC) {
			return Err(err!(EACCES));
		}
		self.sbi.inc_valid_block_count(Some(vnode), 1)?;
		self.set_data_blkaddr(dn, NEW_ADDR)?;
		self.mark_vnode_dirty(vnode);
		Ok(())
	}

	fn check_extent_cache(&self, vnode: &Vnode, index: u64) -> Option<u32> {
		let ext = vnode.extent();
		if ext.len == 0 {
			return None;
		}
		if index >= ext.fofs && index < ext.fofs + ext.len as u64 {
			return Some(ext.blk_addr + (index - ext.fofs) as u32);
		}
		None
	}

	/// Replace, merge, drop or split the single-range extent hint.
	pub(crate) fn update_extent_cache(&self, vnode: &Vnode, blk_addr: u32, fofs: u64) {
		debug_assert_ne!(blk_addr, NEW_ADDR);
		let dirty = {
			let mut ext = vnode.extent_mut();
			extent_update(&mut ext, blk_addr, fofs)
		};
		if dirty {
			self.mark_vnode_dirty(vnode);
		}
	}

	/// Physical address of a file block, hole-transparent.
	pub fn find_data_blkaddr(&self, vnode: &Vnode, index: u64) -> IoResult<u32> {
		if let Some(addr) = self.check_extent_cache(vnode, index) {
			return Ok(addr);
		}
		let dn = self.get_dnode_of_data(vnode, index, true)?;
		dn.data_blkaddr()
	}

	/// Fetch a data page that must exist; holes report `ENOENT` and
	/// reserved-but-unwritten blocks `EINVAL`.
	pub(crate) fn find_data_page(&self, vnode: &Vnode, index: u64) -> IoResult<Arc<Page>> {
		if let Some(page) = vnode.cache().find(index) {
			if page.is_uptodate() {
				return Ok(page);
			}
		}

		let addr = self.find_data_blkaddr(vnode, index)?;
		if addr == NULL_ADDR {
			return Err(err!(ENOENT));
		}
		if addr == NEW_ADDR {
			return Err(err!(EINVAL));
		}

		let page = vnode.cache().grab(index);
		{
			let mut data = page.write();
			self.bc.read_blk(addr, &mut data[..])?;
		}
		page.set_uptodate();
		Ok(page)
	}

	/// Data page for writing at `index`, allocating the address slot when
	/// the block does not exist yet.
	pub(crate) fn get_new_data_page(
		&self,
		vnode: &Vnode,
		index: u64,
		new_isize: bool,
	) -> IoResult<Arc<Page>> {
		let dn = self.get_dnode_of_data(vnode, index, false)?;
		let mut addr = dn.data_blkaddr()?;
		if addr == NULL_ADDR {
			self.reserve_new_block(vnode, &dn)?;
			addr = NEW_ADDR;
		}

		let page = vnode.cache().grab(index);
		if !page.is_uptodate() {
			if addr == NEW_ADDR {
				page.zero();
			} else {
				let mut data = page.write();
				self.bc.read_blk(addr, &mut data[..])?;
			}
			page.set_uptodate();
		}

		if new_isize && vnode.size() < (index + 1) * BLOCK_SIZE as u64 {
			vnode.set_size((index + 1) * BLOCK_SIZE as u64);
			self.mark_vnode_dirty(vnode);
		}
		Ok(page)
	}

	/// Prepare the page range `[offset, offset+len)` for a write: reserve
	/// missing blocks and read in partially covered edge blocks.
	fn write_begin(&self, vnode: &Vnode, offset: u64, len: usize) -> IoResult<Vec<Arc<Page>>> {
		self.balance_fs()?;

		let index_start = offset / BLOCK_SIZE as u64;
		let offset_end = offset + len as u64;
		let index_end = (offset_end + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;

		let _file_op = self.sbi.file_lock.read().unwrap();

		let mut pages = Vec::with_capacity((index_end - index_start) as usize);
		for index in index_start..index_end {
			let dn = self.get_dnode_of_data(vnode, index, false)?;
			let mut addr = dn.data_blkaddr()?;
			if addr == NULL_ADDR {
				self.reserve_new_block(vnode, &dn)?;
				addr = NEW_ADDR;
			}

			let page = vnode.cache().grab(index);
			let partial_head = index == index_start && offset % BLOCK_SIZE as u64 != 0;
			let partial_tail = index == index_end - 1 && offset_end % BLOCK_SIZE as u64 != 0;
			if !page.is_uptodate() {
				if addr == NEW_ADDR || !(partial_head || partial_tail) {
					page.zero();
				} else {
					let mut data = page.write();
					self.bc.read_blk(addr, &mut data[..])?;
				}
				page.set_uptodate();
			}
			pages.push(page);
		}
		Ok(pages)
	}

	/// Read file contents. Holes read as zeroes; reads past EOF are clipped.
	pub fn read(&self, vnode: &Vnode, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
		let size = vnode.size();
		if offset >= size {
			return Ok(0);
		}
		if vnode.test_flag(VNODE_INLINE_DATA) {
			return self.read_inline(vnode, offset, buf);
		}

		let len = (buf.len() as u64).min(size - offset) as usize;
		let mut done = 0usize;
		let mut pos = offset;

		while done < len {
			let index = pos / BLOCK_SIZE as u64;
			let in_block = (pos % BLOCK_SIZE as u64) as usize;
			let chunk = (BLOCK_SIZE - in_block).min(len - done);

			match self.find_data_page(vnode, index) {
				Ok(page) => {
					let data = page.read();
					buf[done..done + chunk].copy_from_slice(&data[in_block..in_block + chunk]);
				}
				Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
					buf[done..done + chunk].fill(0);
				}
				Err(e) => return Err(e),
			}
			done += chunk;
			pos += chunk as u64;
		}
		Ok(done)
	}

	/// Write file contents through the page cache; data reaches the log at
	/// writeback or fsync time.
	pub fn write(&self, vnode: &Arc<Vnode>, offset: u64, data: &[u8]) -> IoResult<usize> {
		self.check_rw()?;
		if data.is_empty() {
			return Ok(0);
		}
		if offset + data.len() as u64 > max_file_size() {
			return Err(err!(EINVAL));
		}

		if vnode.test_flag(VNODE_INLINE_DATA) {
			if offset + data.len() as u64 <= crate::layout::MAX_INLINE_DATA as u64 {
				return self.write_inline(vnode, offset, data);
			}
			self.convert_inline_data(vnode)?;
		}

		let pages = self.write_begin(vnode, offset, data.len())?;
		let mut done = 0usize;
		let mut pos = offset;
		for page in &pages {
			let in_block = (pos % BLOCK_SIZE as u64) as usize;
			let chunk = (BLOCK_SIZE - in_block).min(data.len() - done);
			{
				let mut pd = page.write();
				pd[in_block..in_block + chunk].copy_from_slice(&data[done..done + chunk]);
			}
			vnode.cache().set_dirty(page);
			done += chunk;
			pos += chunk as u64;
		}

		if vnode.size() < offset + done as u64 {
			vnode.set_size(offset + done as u64);
		}
		vnode.touch();
		self.mark_vnode_dirty(vnode);
		Ok(done)
	}

	pub fn append(&self, vnode: &Arc<Vnode>, data: &[u8]) -> IoResult<(u64, usize)> {
		let offset = vnode.size();
		let written = self.write(vnode, offset, data)?;
		Ok((offset + written as u64, written))
	}

	pub fn truncate(&self, vnode: &Arc<Vnode>, len: u64) -> IoResult<()> {
		self.check_rw()?;
		if len == vnode.size() {
			return Ok(());
		}
		if len > max_file_size() {
			return Err(err!(EINVAL));
		}
		self.do_truncate(vnode, len)
	}

	pub fn fsync(&self, vnode: &Arc<Vnode>) -> IoResult<()> {
		self.sync_file(vnode)
	}

	/// Relocate one dirty data page into the log (or in place under the
	/// in-place-update policy).
	fn do_write_data_page(&self, vnode: &Vnode, page: &Arc<Page>) -> IoResult<()> {
		let dn = match self.get_dnode_of_data(vnode, page.index(), true) {
			Ok(dn) => dn,
			// the subtree was truncated under the dirty page
			Err(e) if e.raw_os_error() == Some(libc::ENOENT) => return Ok(()),
			Err(e) => return Err(e),
		};
		let old_blkaddr = dn.data_blkaddr()?;

		if old_blkaddr == NULL_ADDR {
			// truncated while dirty
			return Ok(());
		}

		if old_blkaddr != NEW_ADDR && self.need_inplace_update(vnode) {
			self.rewrite_data_block(page, old_blkaddr)?;
			return Ok(());
		}

		let new_blkaddr =
			self.write_data_block(vnode, page, dn.nid, dn.ofs_in_node, old_blkaddr)?;
		self.set_data_blkaddr(&dn, new_blkaddr)?;
		self.update_extent_cache(vnode, new_blkaddr, page.index());
		vnode.update_version(self.sbi.cp_ver());
		Ok(())
	}

	/// Write back every dirty data page of one vnode.
	pub(crate) fn write_data_pages(&self, vnode: &Arc<Vnode>) -> IoResult<usize> {
		let cache = vnode.cache();
		let end_index = vnode.size().div_ceil(BLOCK_SIZE as u64);
		let mut written = 0usize;

		for index in cache.dirty_indices() {
			let page = match cache.find(index) {
				Some(page) => page,
				None => continue,
			};
			if !page.try_lock() {
				continue;
			}
			if index >= end_index {
				// out of range of the file size; drop, do not write
				cache.clear_dirty_for_io(&page);
				page.unlock();
				continue;
			}
			if cache.clear_dirty_for_io(&page) {
				cache.set_writeback(&page);
				let res = self.do_write_data_page(vnode, &page);
				cache.clear_writeback(&page);
				if let Err(e) = res {
					page.unlock();
					if e.raw_os_error() == Some(libc::EIO) {
						self.sbi.set_cp_error();
					}
					return Err(e);
				}
				written += 1;
			}
			page.unlock();
		}
		Ok(written)
	}
}

#[cfg(test)]
mod t {
	use super::*;

	fn ext(fofs: u64, blk: u32, len: u32) -> ExtentInfo {
		ExtentInfo {
			fofs,
			blk_addr: blk,
			len,
		}
	}

	#[test]
	fn max_file_size_matches_tree_shape() {
		let blocks = 923u64 + 2 * 1018 + 2 * 1018 * 1018 + 1018 * 1018 * 1018;
		assert_eq!(max_file_size(), blocks * 4096);
	}

	#[test]
	fn extent_insert_and_merge() {
		let mut e = ext(0, 0, 0);
		assert!(extent_update(&mut e, 100, 10));
		assert_eq!(e, ext(10, 100, 1));

		// back merge
		assert!(extent_update(&mut e, 101, 11));
		assert_eq!(e, ext(10, 100, 2));

		// front merge
		assert!(extent_update(&mut e, 99, 9));
		assert_eq!(e, ext(9, 99, 3));

		// unrelated offset leaves the hint alone
		assert!(!extent_update(&mut e, 500, 40));
		assert_eq!(e, ext(9, 99, 3));
	}

	#[test]
	fn extent_split_keeps_larger_half() {
		// fofs 0..10 at blk 100; punch at 2 keeps the tail
		let mut e = ext(0, 100, 10);
		assert!(extent_update(&mut e, NULL_ADDR, 2));
		assert_eq!(e, ext(3, 103, 7));

		// punch near the end keeps the head
		let mut e = ext(0, 100, 10);
		assert!(extent_update(&mut e, NULL_ADDR, 8));
		assert_eq!(e, ext(0, 100, 8));
	}

	#[test]
	fn extent_single_block_drop() {
		let mut e = ext(5, 200, 1);
		assert!(extent_update(&mut e, NULL_ADDR, 5));
		assert_eq!(e.len, 0);
	}
}
