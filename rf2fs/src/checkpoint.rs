//! Checkpoint procedure and orphan bookkeeping.
//!
//! Lock order across the filesystem: checkpoint mutex -> FileOp rwlock ->
//! NodeOp rwlock -> curseg mutex -> SIT -> dirty seglist -> free segmap ->
//! NAT tree -> orphan mutex -> page locks.

use std::{
	io::{Error as IoError, ErrorKind, Result as IoResult},
	sync::{Arc, RwLockWriteGuard},
};

use crate::{
	bcache::Bcache,
	err,
	layout::{
		self, Checkpoint, OrphanBlock, SuperBlock, BLOCK_SIZE, CP_COMPACT_SUM_FLAG,
		CP_ORPHAN_PRESENT_FLAG, CP_UMOUNT_FLAG, NR_CURSEG_NODE_TYPE, ORPHANS_PER_BLOCK,
	},
	mount::F2fs,
	page::{CountType, Page},
	segment::CursegType,
};

/// Read and CRC-check one checkpoint pack; both copies must agree on the
/// version.
fn validate_checkpoint(bc: &Bcache, cp_addr: u32) -> IoResult<Option<(Checkpoint, u64)>> {
	let mut buf = vec![0u8; BLOCK_SIZE];

	// any unreadable or mismatching copy just disqualifies the pack
	let read_cp = |buf: &mut [u8], addr: u32| -> Option<(Checkpoint, u64)> {
		bc.read_blk(addr, buf).ok()?;
		let cp: Checkpoint = layout::decode(buf).ok()?;
		let crc_offset = cp.checksum_offset as usize;
		if crc_offset > BLOCK_SIZE - 4 {
			return None;
		}
		let crc = u32::from_le_bytes(buf[crc_offset..crc_offset + 4].try_into().unwrap());
		if !layout::f2fs_crc_valid(crc, &buf[..crc_offset]) {
			return None;
		}
		let ver = cp.checkpoint_ver;
		Some((cp, ver))
	};

	let (cp1, ver1) = match read_cp(&mut buf, cp_addr) {
		Some(v) => v,
		None => return Ok(None),
	};
	if cp1.cp_pack_total_block_count < 2 {
		return Ok(None);
	}
	let second = cp_addr + cp1.cp_pack_total_block_count - 1;
	let (_cp2, ver2) = match read_cp(&mut buf, second) {
		Some(v) => v,
		None => return Ok(None),
	};
	if ver1 != ver2 {
		return Ok(None);
	}
	Ok(Some((cp1, ver1)))
}

/// Pick the valid checkpoint among the two packs; runs against a bare
/// `Bcache` so fsck shares it with mount.
pub(crate) fn load_checkpoint(
	bc: &Bcache,
	raw: &SuperBlock,
) -> IoResult<(Checkpoint, Vec<[u8; BLOCK_SIZE]>)> {
	let blocks_per_seg = 1u32 << raw.log_blocks_per_seg;
	let cp1 = validate_checkpoint(bc, raw.cp_blkaddr)?;
	let cp2 = validate_checkpoint(bc, raw.cp_blkaddr + blocks_per_seg)?;

	let (ckpt, base) = match (cp1, cp2) {
		(Some((c1, v1)), Some((c2, v2))) => {
			if layout::ver_after(v2, v1) {
				(c2, raw.cp_blkaddr + blocks_per_seg)
			} else {
				(c1, raw.cp_blkaddr)
			}
		}
		(Some((c1, _)), None) => (c1, raw.cp_blkaddr),
		(None, Some((c2, _))) => (c2, raw.cp_blkaddr + blocks_per_seg),
		(None, None) => {
			return Err(IoError::new(
				ErrorKind::InvalidData,
				"no valid checkpoint pack",
			))
		}
	};

	let mut trailer = Vec::with_capacity(raw.cp_payload as usize);
	for i in 0..raw.cp_payload {
		let mut block = [0u8; BLOCK_SIZE];
		bc.read_blk(base + 1 + i, &mut block)?;
		trailer.push(block);
	}
	Ok((ckpt, trailer))
}

impl F2fs {
	/// Meta page without a device read; the caller overwrites it entirely.
	pub(crate) fn grab_meta_page(&self, index: u32) -> Arc<Page> {
		let page = self.meta_cache.grab(index as u64);
		page.set_uptodate();
		page
	}

	/// Meta page backed by the device.
	pub(crate) fn get_meta_page(&self, index: u32) -> IoResult<Arc<Page>> {
		let page = self.meta_cache.grab(index as u64);
		if page.is_uptodate() {
			return Ok(page);
		}
		{
			let mut data = page.write();
			self.bc.read_blk(index, &mut data[..])?;
		}
		page.set_uptodate();
		Ok(page)
	}

	pub(crate) fn flush_single_meta_page(&self, page: &Arc<Page>) -> IoResult<()> {
		if self.meta_cache.clear_dirty_for_io(page) {
			self.meta_cache.set_writeback(page);
			let res = self.bc.write_blk(page.index() as u32, &page.read()[..]);
			self.meta_cache.clear_writeback(page);
			if res.is_err() {
				self.sbi.set_cp_error();
			}
			res?;
		}
		Ok(())
	}

	pub(crate) fn flush_dirty_meta_pages(&self) -> IoResult<usize> {
		let mut written = 0;
		for index in self.meta_cache.dirty_indices() {
			if let Some(page) = self.meta_cache.find(index) {
				self.flush_single_meta_page(&page)?;
				written += 1;
			}
		}
		Ok(written)
	}

	// -- orphan management ---------------------------------------------------

	/// One reserved segment bounds the orphan list: the pack needs room for
	/// the CP blocks and summaries too.
	pub(crate) fn check_orphan_space(&self) -> IoResult<()> {
		let max_orphans = (self.sbi.blocks_per_seg() as usize - 5) * ORPHANS_PER_BLOCK;
		let orphans = self.sbi.orphans.lock().unwrap();
		if orphans.len() >= max_orphans {
			return Err(err!(ENOSPC));
		}
		Ok(())
	}

	pub(crate) fn add_orphan_inode(&self, ino: u32) {
		self.sbi.orphans.lock().unwrap().insert(ino);
	}

	pub(crate) fn remove_orphan_inode(&self, ino: u32) {
		self.sbi.orphans.lock().unwrap().remove(&ino);
	}

	pub(crate) fn orphan_count(&self) -> usize {
		self.sbi.orphans.lock().unwrap().len()
	}

	fn recover_orphan_inode(&self, ino: u32) -> IoResult<()> {
		let vnode = self.vget(ino)?;
		vnode.info_mut().nlink = 0;
		self.evict_vnode(&vnode)?;
		self.remove_orphan_inode(ino);
		Ok(())
	}

	/// Replay the orphan list of the loaded checkpoint, releasing every
	/// block the dead inodes still hold.
	pub(crate) fn recover_orphan_inodes(&self) -> IoResult<()> {
		let (present, start_blk, orphan_blocks) = {
			let ckpt = self.sbi.ckpt.read().unwrap();
			let payload = self.sbi.raw.cp_payload;
			(
				ckpt.is_set(CP_ORPHAN_PRESENT_FLAG),
				self.sbi.start_cp_addr() + payload + 1,
				ckpt.cp_pack_start_sum - 1 - payload,
			)
		};
		if !present {
			return Ok(());
		}

		self.sbi.set_on_recovery(true);
		for i in 0..orphan_blocks {
			let page = self.get_meta_page(start_blk + i)?;
			let block: OrphanBlock = page.decode()?;
			if block.entry_count as usize > ORPHANS_PER_BLOCK {
				self.sbi.set_on_recovery(false);
				return Err(IoError::new(
					ErrorKind::InvalidData,
					"orphan block overflows",
				));
			}
			for j in 0..block.entry_count as usize {
				self.recover_orphan_inode(block.ino[j])?;
			}
		}
		self.sbi.ckpt.write().unwrap().clear_flag(CP_ORPHAN_PRESENT_FLAG);
		self.sbi.set_on_recovery(false);
		Ok(())
	}

	/// Evict orphans nobody holds open any more, so the next checkpoint only
	/// carries the ones still referenced.
	pub(crate) fn purge_inactive_orphans(&self) -> IoResult<()> {
		let doomed: Vec<u32> = self.sbi.orphans.lock().unwrap().iter().copied().collect();
		for ino in doomed {
			let vnode = match self.vcache.lookup(ino) {
				Some(vnode) => {
					if self.vcache.external_users(&vnode) > 0 {
						continue;
					}
					vnode
				}
				None => {
					self.sbi.set_on_recovery(true);
					let res = self.vget(ino);
					self.sbi.set_on_recovery(false);
					match res {
						Ok(v) => v,
						Err(_) => {
							// no trace of it; forget the orphan record
							self.remove_orphan_inode(ino);
							continue;
						}
					}
				}
			};
			vnode.info_mut().nlink = 0;
			self.evict_vnode(&vnode)?;
			self.remove_orphan_inode(ino);
		}
		Ok(())
	}

	fn write_orphan_inodes(&self, start_blk: u32) -> IoResult<()> {
		let orphans: Vec<u32> = self.sbi.orphans.lock().unwrap().iter().copied().collect();
		let orphan_blocks =
			(orphans.len() + ORPHANS_PER_BLOCK - 1) / ORPHANS_PER_BLOCK;

		for (index, chunk) in orphans.chunks(ORPHANS_PER_BLOCK).enumerate() {
			let mut block = OrphanBlock::zeroed();
			for (i, ino) in chunk.iter().enumerate() {
				block.ino[i] = *ino;
			}
			block.blk_addr = (index + 1) as u16;
			block.blk_count = orphan_blocks as u16;
			block.entry_count = chunk.len() as u32;

			let page = self.grab_meta_page(start_blk + index as u32);
			page.zero();
			page.encode(&block)?;
			self.meta_cache.set_dirty(&page);
			self.flush_single_meta_page(&page)?;
		}
		Ok(())
	}

	// -- freeze / thaw -------------------------------------------------------

	fn sync_dirty_data_pages(&self, dirs_only: bool) -> IoResult<()> {
		// walk every cached vnode: unlinked-but-open files are not on the
		// dirty-vnode list yet still carry dirty pages
		for ino in self.vcache.all_inos() {
			let vnode = match self.vcache.lookup(ino) {
				Some(v) => v,
				None => continue,
			};
			if dirs_only && !vnode.is_dir() {
				continue;
			}
			if vnode.cache().dirty_count() > 0 {
				self.write_data_pages(&vnode)?;
			}
		}
		Ok(())
	}

	fn sync_dirty_vnodes(&self) -> IoResult<()> {
		for ino in self.vcache.dirty_inos() {
			let vnode = match self.vcache.lookup(ino) {
				Some(v) => v,
				None => continue,
			};
			self.write_inode(&vnode)?;
			self.clear_vnode_dirty(&vnode);
		}
		Ok(())
	}

	/// Freeze file operations: drain dirty dentry pages under a retry loop,
	/// then dirty node pages, ending with both op locks held exclusively.
	fn block_operations(
		&self,
	) -> IoResult<(RwLockWriteGuard<'_, ()>, RwLockWriteGuard<'_, ()>)> {
		let file_guard = loop {
			self.sync_dirty_data_pages(false)?;
			let guard = self.sbi.file_lock.write().unwrap();
			if self.sbi.page_count(CountType::DirtyDents) == 0
				&& self.sbi.page_count(CountType::DirtyData) == 0
			{
				break guard;
			}
			drop(guard);
		};

		// no dirty node pages may survive until the NAT/SIT flush is done
		let node_guard = loop {
			self.sync_dirty_vnodes()?;
			self.flush_dirty_node_pages()?;
			let guard = self.sbi.node_lock.write().unwrap();
			if self.sbi.page_count(CountType::DirtyNodes) == 0 {
				break guard;
			}
			drop(guard);
		};

		Ok((file_guard, node_guard))
	}

	fn write_cp_block_through(&self, addr: u32, ckpt: &mut Checkpoint) -> IoResult<()> {
		let page = self.grab_meta_page(addr);
		{
			let mut data = page.write();
			data.fill(0);
			ckpt.write_to(&mut data[..])?;
		}
		self.meta_cache.set_dirty(&page);
		self.flush_single_meta_page(&page)
	}

	/// Emit the checkpoint pack. The new pack is not canonical until its
	/// trailing CP copy hits the device after a flush barrier.
	fn do_checkpoint(&self, is_umount: bool) -> IoResult<()> {
		// flush every NAT/SIT page made dirty by the preceding flushes
		while self.sbi.page_count(CountType::DirtyMeta) > 0 {
			self.flush_dirty_meta_pages()?;
		}

		let cp_payload = self.sbi.raw.cp_payload;
		let orphan_count = self.orphan_count();
		let orphan_blocks =
			((orphan_count + ORPHANS_PER_BLOCK - 1) / ORPHANS_PER_BLOCK) as u32;

		let mut ckpt_copy;
		{
			let mut ckpt = self.sbi.ckpt.write().unwrap();
			ckpt.elapsed_time = self.sm.get_mtime();
			{
				let c = self.sbi.counters.lock().unwrap();
				ckpt.valid_block_count = c.total_valid_block_count;
				ckpt.valid_node_count = c.valid_node_count;
				ckpt.valid_inode_count = c.valid_inode_count;
			}
			ckpt.free_segment_count = self.sm.free_segments();
			for i in 0..NR_CURSEG_NODE_TYPE {
				let t = CursegType::from_index(i + 3);
				ckpt.cur_node_segno[i] = self.sm.curseg_segno(t);
				ckpt.cur_node_blkoff[i] = self.sm.curseg_blkoff(t);
				ckpt.alloc_type[t.index()] = self.sm.curseg_alloc_type(t);
			}
			for i in 0..3 {
				let t = CursegType::from_index(i);
				ckpt.cur_data_segno[i] = self.sm.curseg_segno(t);
				ckpt.cur_data_blkoff[i] = self.sm.curseg_blkoff(t);
				ckpt.alloc_type[i] = self.sm.curseg_alloc_type(t);
			}
			if let Some(nid) = self.nm.next_free_nid() {
				ckpt.next_free_nid = nid;
			}

			let data_sum_blocks = self.npages_for_summary_flush(&ckpt);
			if data_sum_blocks < 3 {
				ckpt.set_flag(CP_COMPACT_SUM_FLAG);
			} else {
				ckpt.clear_flag(CP_COMPACT_SUM_FLAG);
			}

			ckpt.cp_pack_start_sum = 1 + orphan_blocks + cp_payload;
			ckpt.cp_pack_total_block_count =
				2 + data_sum_blocks + orphan_blocks + cp_payload;
			if is_umount {
				ckpt.set_flag(CP_UMOUNT_FLAG);
				ckpt.cp_pack_total_block_count += NR_CURSEG_NODE_TYPE as u32;
			} else {
				ckpt.clear_flag(CP_UMOUNT_FLAG);
			}
			if orphan_count > 0 {
				ckpt.set_flag(CP_ORPHAN_PRESENT_FLAG);
			} else {
				ckpt.clear_flag(CP_ORPHAN_PRESENT_FLAG);
			}

			self.sm.copy_sit_bitmap(ckpt.sit_bitmap_mut());
			self.nm.copy_nat_bitmap(ckpt.nat_bitmap_mut());

			ckpt_copy = ckpt.clone();
		}

		let start_blk = self.sbi.start_cp_addr();
		let mut blk = start_blk;

		self.write_cp_block_through(blk, &mut ckpt_copy)?;
		blk += 1;

		{
			let trailer = self.sbi.cp_trailer.read().unwrap();
			for payload in trailer.iter() {
				let page = self.grab_meta_page(blk);
				page.fill_from(&payload[..]);
				self.meta_cache.set_dirty(&page);
				self.flush_single_meta_page(&page)?;
				blk += 1;
			}
		}

		if orphan_count > 0 {
			self.write_orphan_inodes(blk)?;
			blk += orphan_blocks;
		}

		self.write_data_summaries(&ckpt_copy, blk)?;
		blk += ckpt_copy.cp_pack_total_block_count
			- 2 - orphan_blocks
			- cp_payload
			- if is_umount { NR_CURSEG_NODE_TYPE as u32 } else { 0 };
		if is_umount {
			self.write_node_summaries(&ckpt_copy, blk)?;
			blk += NR_CURSEG_NODE_TYPE as u32;
		}

		// everything but the closing CP copy, then the barrier
		while self.sbi.page_count(CountType::DirtyMeta) > 0 {
			self.flush_dirty_meta_pages()?;
		}
		self.bc.flush()?;

		// the pack becomes canonical with this write
		debug_assert_eq!(blk, start_blk + ckpt_copy.cp_pack_total_block_count - 1);
		self.write_cp_block_through(blk, &mut ckpt_copy)?;
		self.bc.flush()?;

		{
			let mut c = self.sbi.counters.lock().unwrap();
			c.last_valid_block_count = c.total_valid_block_count;
			c.alloc_valid_block_count = 0;
		}

		self.clear_prefree_segments()?;
		self.sbi.clear_dirty();

		// drop the stale meta cache; the next reader sees the new pack
		self.meta_cache.invalidate();
		Ok(())
	}

	/// The atomic dual-pack checkpoint commit. Single writer; both op locks
	/// are held exclusively across the metadata flushes.
	pub(crate) fn write_checkpoint(&self, is_umount: bool) -> IoResult<()> {
		if self.sbi.cp_error() {
			return Err(err!(EROFS));
		}
		let _cp = self.sbi.cp_mutex.lock().unwrap();
		let guards = self.block_operations()?;

		// bump the version first so SIT entries and summaries land in the
		// right pack
		{
			let mut ckpt = self.sbi.ckpt.write().unwrap();
			ckpt.checkpoint_ver += 1;
		}

		self.flush_nat_entries()?;
		self.flush_sit_entries()?;
		self.reset_victim_secmap();

		let res = self.do_checkpoint(is_umount);
		drop(guards);
		if res.is_err() {
			self.sbi.set_cp_error();
		}
		res
	}

	fn reset_victim_secmap(&self) {
		let mut dirty = self.sm.dirty.lock().unwrap();
		for b in dirty.victim_secmap.iter_mut() {
			*b = 0;
		}
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::bcache::MemDevice;

	#[test]
	fn checkpoint_crc_roundtrip() {
		let mut ckpt = Checkpoint::zeroed();
		ckpt.checkpoint_ver = 5;
		ckpt.checksum_offset = layout::CP_CHKSUM_OFFSET as u32;
		ckpt.cp_pack_total_block_count = 5;

		let mut buf = vec![0u8; BLOCK_SIZE];
		ckpt.write_to(&mut buf).unwrap();

		let crc_offset = layout::CP_CHKSUM_OFFSET;
		let crc = u32::from_le_bytes(buf[crc_offset..crc_offset + 4].try_into().unwrap());
		assert!(layout::f2fs_crc_valid(crc, &buf[..crc_offset]));
		assert_eq!(crc, ckpt.checksum);
	}

	#[test]
	fn validate_rejects_torn_pack() {
		let bc = Bcache::new(Box::new(MemDevice::new(2048))).unwrap();
		let mut ckpt = Checkpoint::zeroed();
		ckpt.checkpoint_ver = 1;
		ckpt.checksum_offset = layout::CP_CHKSUM_OFFSET as u32;
		ckpt.cp_pack_total_block_count = 4;

		let mut buf = vec![0u8; BLOCK_SIZE];
		ckpt.write_to(&mut buf).unwrap();
		bc.write_blk(512, &buf).unwrap();
		// the closing copy is missing: the pack must not validate
		assert!(validate_checkpoint(&bc, 512).unwrap().is_none());

		bc.write_blk(512 + 3, &buf).unwrap();
		let (_, ver) = validate_checkpoint(&bc, 512).unwrap().unwrap();
		assert_eq!(ver, 1);
	}
}
