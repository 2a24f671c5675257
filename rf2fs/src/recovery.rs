//! Roll-forward recovery: after an unclean shutdown, fsynced dnode chains
//! written since the last checkpoint are replayed from the warm node log.

use std::{io::Result as IoResult, sync::Arc};

use crate::{
	layout::{
		NodeBlock, Summary, ADDRS_PER_BLOCK, ADDRS_PER_INODE, BLOCK_SIZE, NEW_ADDR, NULL_ADDR,
	},
	mount::F2fs,
	node::Dnode,
	segment::CursegType,
	vnode::{Timespec, Vnode, VNODE_INC_LINK},
};

struct FsyncEntry {
	vnode:   Arc<Vnode>,
	blkaddr: u32,
}

impl F2fs {
	/// Re-create the inode page of a file that only exists in the fsync
	/// chain.
	fn recover_inode_page(&self, src: &NodeBlock) -> IoResult<()> {
		let ino = src.footer.ino;
		self.nm.remove_free_nid(ino);

		let old_ni = self.get_node_info(ino)?;
		let page = self.node_cache.grab(ino as u64);

		let mut node = NodeBlock::zeroed();
		node.fill_footer(ino, ino, 0, true);
		let mut inode = src.inode()?;
		inode.size = 0;
		inode.blocks = 1;
		inode.links = 1;
		inode.xattr_nid = 0;
		inode.ext = crate::layout::Extent {
			fofs:     0,
			blk_addr: 0,
			len:      0,
		};
		inode.addr = [NULL_ADDR; ADDRS_PER_INODE];
		inode.nid = [0; 5];
		node.set_inode(&inode)?;
		page.encode(&node)?;
		page.set_uptodate();

		let new_ni = crate::node::NodeInfo {
			nid:      ino,
			ino,
			blk_addr: old_ni.blk_addr,
			version:  old_ni.version,
		};
		self.sbi.inc_valid_node_count(None, 1)?;
		self.nm.set_node_addr(&new_ni, NEW_ADDR);
		self.sbi.inc_valid_inode_count();
		Ok(())
	}

	/// Refresh in-memory inode metadata from a replayed inode block and, for
	/// dentry-marked nodes, restore the directory entry.
	fn recover_inode(&self, vnode: &Arc<Vnode>, node: &NodeBlock) -> IoResult<()> {
		let raw = node.inode()?;
		{
			let mut info = vnode.info_mut();
			info.mode = raw.mode;
			info.size = raw.size;
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
		}
		if !node.is_dent() {
			return Ok(());
		}

		// restore the name and the dentry in the parent
		let name = String::from_utf8_lossy(raw.name_bytes()).into_owned();
		let pino = raw.pino;
		vnode.info_mut().name = name.clone();
		vnode.info_mut().pino = pino;
		let dir = self.vget(pino)?;
		if self.find_entry(&dir, &name)?.is_none() {
			self.add_link(&dir, &name, vnode)?;
		}
		Ok(())
	}

	/// Pass 1: walk the warm-node chain collecting fsync-marked dnodes per
	/// inode.
	fn find_fsync_dnodes(&self, cp_ver: u64) -> IoResult<Vec<FsyncEntry>> {
		let mut list: Vec<FsyncEntry> = Vec::new();
		let mut blkaddr = self.sm.next_free_blkaddr(CursegType::WarmNode);
		let mut buf = vec![0u8; BLOCK_SIZE];

		loop {
			if self.sm.segno_of(blkaddr) == crate::layout::NULL_SEGNO {
				break;
			}
			if self.bc.read_blk(blkaddr, &mut buf).is_err() {
				break;
			}
			let node: NodeBlock = match crate::layout::decode(&buf) {
				Ok(node) => node,
				Err(_) => break,
			};
			if node.footer.cp_ver != cp_ver {
				break;
			}
			if !node.is_fsync() {
				blkaddr = node.footer.next_blkaddr;
				continue;
			}

			let ino = node.footer.ino;
			let vnode = match list.iter().position(|e| e.vnode.ino() == ino) {
				Some(i) => {
					list[i].blkaddr = blkaddr;
					if node.is_inode() && node.is_dent() {
						list[i].vnode.set_flag(VNODE_INC_LINK);
					}
					list[i].vnode.clone()
				}
				None => {
					if node.is_inode() && node.is_dent() {
						self.recover_inode_page(&node)?;
					}
					let vnode = self.vget(ino)?;
					list.push(FsyncEntry {
						vnode: vnode.clone(),
						blkaddr,
					});
					vnode
				}
			};

			if node.is_inode() {
				self.recover_inode(&vnode, &node)?;
			}

			blkaddr = node.footer.next_blkaddr;
		}
		Ok(list)
	}

	/// The block at `blkaddr` is still valid under some pre-crash node.
	/// Drop that stale reference so the replayed one wins.
	fn check_index_in_prev_nodes(&self, blkaddr: u32) -> IoResult<()> {
		let segno = self.sm.segno_of(blkaddr);
		let blkoff = self.sm.blkoff_in_seg(blkaddr) as usize;

		{
			let sit = self.sm.sit.lock().unwrap();
			if !crate::bits::test_valid_bit(
				blkoff,
				&sit.sentries[segno as usize].cur_valid_map,
			) {
				return Ok(());
			}
		}

		// previous owner: an open data curseg, or the on-disk summary
		let mut sum: Option<Summary> = None;
		for i in CursegType::WarmData.index()..=CursegType::ColdData.index() {
			let curseg = self.sm.lock_curseg(CursegType::from_index(i));
			if curseg.segno == segno {
				sum = Some(curseg.sum.entries[blkoff]);
				break;
			}
		}
		let sum = match sum {
			Some(sum) => sum,
			None => {
				let sum_page = self.get_sum_page(segno)?;
				let block: crate::layout::SummaryBlock = sum_page.decode()?;
				block.entries[blkoff]
			}
		};

		let node_page = match self.get_node_page(sum.nid) {
			Ok(page) => page,
			Err(e) => {
				log::error!("stale summary for block {blkaddr}: {e}");
				return Ok(());
			}
		};
		let node: NodeBlock = node_page.decode()?;
		let bidx = node.start_bidx_of_node() + sum.ofs_in_node as u64;
		let ino = node.footer.ino;

		let vnode = self.vget(ino)?;
		self.truncate_hole(&vnode, bidx, bidx + 1)
	}

	/// Replay the data block addresses of one fsynced dnode.
	fn do_recover_data(
		&self,
		vnode: &Arc<Vnode>,
		node: &NodeBlock,
		blkaddr: u32,
	) -> IoResult<()> {
		if node.is_inode() && self.recover_inline_data(vnode, node)? {
			return Ok(());
		}

		let start = node.start_bidx_of_node();
		let end = start
			+ if node.is_inode() {
				ADDRS_PER_INODE as u64
			} else {
				ADDRS_PER_BLOCK as u64
			};

		let dn = self.get_dnode_of_data(vnode, start, false)?;
		let ni = self.get_node_info(dn.nid)?;
		if ni.ino != node.footer.ino {
			log::error!("replayed dnode belongs to {} not {}", node.footer.ino, ni.ino);
			return Ok(());
		}

		for fofs in start..end {
			let ofs = (fofs - start) as u32;
			let slot = Dnode {
				page:        dn.page.clone(),
				nid:         dn.nid,
				ofs_in_node: ofs,
			};
			let src = slot.data_blkaddr()?;
			let dest = node.data_addr(ofs as usize);

			if src != dest && dest != NEW_ADDR && dest != NULL_ADDR {
				if src == NULL_ADDR {
					self.reserve_new_block(vnode, &slot)?;
				}
				self.check_index_in_prev_nodes(dest)?;

				let sum = Summary::new(dn.nid, ofs as u16, ni.version);
				self.recover_data_page(&sum, src, dest)?;
				self.set_data_blkaddr(&slot, dest)?;
				self.update_extent_cache(vnode, dest, fofs);
			}
		}

		// rewrite the node page at its fsynced location
		{
			let mut live: NodeBlock = dn.page.decode()?;
			live.footer.cp_ver = node.footer.cp_ver;
			live.footer.next_blkaddr = node.footer.next_blkaddr;
			let ofs = node.ofs_of_node();
			live.fill_footer(dn.nid, ni.ino, ofs, false);
			dn.page.encode(&live)?;
		}
		let sum = Summary::new(dn.nid, 0, 0);
		self.rewrite_node_block(&dn.page, &sum, ni.blk_addr, blkaddr)?;
		self.nm.set_node_addr(&ni, blkaddr);
		self.node_cache.clear_dirty_for_io(&dn.page);
		self.mark_vnode_dirty(vnode);
		Ok(())
	}

	/// Pass 2: walk the chain again and wire the replayed blocks in.
	fn recover_data(&self, list: &mut Vec<FsyncEntry>, cp_ver: u64) -> IoResult<()> {
		let mut blkaddr = self.sm.next_free_blkaddr(CursegType::WarmNode);
		let mut buf = vec![0u8; BLOCK_SIZE];

		loop {
			if self.sm.segno_of(blkaddr) == crate::layout::NULL_SEGNO {
				break;
			}
			if self.bc.read_blk(blkaddr, &mut buf).is_err() {
				break;
			}
			let node: NodeBlock = match crate::layout::decode(&buf) {
				Ok(node) => node,
				Err(_) => break,
			};
			if node.footer.cp_ver != cp_ver {
				break;
			}
			if !node.is_fsync() {
				// interior nodes ride the chain unmarked; the dnode replay
				// rebuilds them
				blkaddr = node.footer.next_blkaddr;
				continue;
			}

			if let Some(pos) = list
				.iter()
				.position(|e| e.vnode.ino() == node.footer.ino)
			{
				let entry_blkaddr = list[pos].blkaddr;
				let vnode = list[pos].vnode.clone();
				self.do_recover_data(&vnode, &node, blkaddr)?;
				if entry_blkaddr == blkaddr {
					list.remove(pos);
				}
			}
			blkaddr = node.footer.next_blkaddr;
		}

		// separate recovered data from the pre-crash logs
		self.allocate_new_segments()?;
		Ok(())
	}

	/// Mount-time roll-forward of everything fsynced after the last
	/// checkpoint.
	pub(crate) fn recover_fsync_data(&self) -> IoResult<()> {
		let cp_ver = self.sbi.cp_ver();

		let mut list = self.find_fsync_dnodes(cp_ver)?;
		if !list.is_empty() {
			log::info!("roll-forward: replaying {} fsynced inode(s)", list.len());
			self.sbi.set_on_recovery(true);
			let res = self.recover_data(&mut list, cp_ver);
			self.sbi.set_on_recovery(false);
			res?;
			if !list.is_empty() {
				log::warn!("roll-forward left {} unfinished chains", list.len());
			}
		}

		self.write_checkpoint(false)
	}
}

#[cfg(test)]
mod t {
	use crate::layout::{NodeBlock, FSYNC_BIT_SHIFT};

	#[test]
	fn fsync_marks_survive_footer_refresh() {
		let mut node = NodeBlock::zeroed();
		node.fill_footer(7, 7, 0, true);
		node.set_mark(FSYNC_BIT_SHIFT, true);
		assert!(node.is_fsync());
		// refreshing the footer without reset drops the marks
		node.fill_footer(7, 7, 0, false);
		assert!(!node.is_fsync());
	}
}
