//! Offline consistency check and opt-in repair.
//!
//! The checker rebuilds read-only views of the NAT, SIT and current
//! segments from a frozen image, traverses every inode reachable from the
//! root (plus orphans), and cross-checks the visited sets against the
//! on-disk tables and checkpoint counters.

use std::{
	collections::HashMap,
	io::{Error as IoError, ErrorKind, Result as IoResult},
};

use crate::{
	bcache::Bcache,
	bits,
	checkpoint::load_checkpoint,
	layout::{
		self, Checkpoint, DentryBlock, NatBlock, NodeBlock, RawNatEntry, SitBlock, SitEntry,
		SummaryBlock, SuperBlock, ADDRS_PER_BLOCK, ADDRS_PER_INODE, BLOCK_SIZE,
		CP_COMPACT_SUM_FLAG, CP_ORPHAN_PRESENT_FLAG, CP_UMOUNT_FLAG, DATA_EXIST, FT_DIR,
		FT_MAX, FT_ORPHAN, INLINE_DATA, INLINE_DATA_OFFSET, INLINE_DENTRY,
		MAX_INLINE_DATA, NAT_ENTRY_PER_BLOCK, NEW_ADDR, NODE_DIR1_BLOCK, NR_CURSEG_DATA_TYPE,
		NR_CURSEG_TYPE, NR_DENTRY_IN_BLOCK, NULL_ADDR, ORPHANS_PER_BLOCK, SIT_ENTRY_PER_BLOCK,
		SUMMARY_SIZE, SUM_JOURNAL_SIZE, SUPER_OFFSET,
	},
	segment::ALLOC_LFS,
};

#[derive(Debug, Clone, Default)]
pub struct FsckOptions {
	/// Rewrite NAT/SIT/CP and inode fields to reconcile inconsistencies.
	pub repair: bool,
}

#[derive(Debug, Default)]
pub struct FsckReport {
	pub checked_inodes: u32,
	pub checked_nodes:  u64,
	pub checked_blocks: u64,
	pub errors:         Vec<String>,
	pub repaired:       bool,
}

impl FsckReport {
	pub fn ok(&self) -> bool {
		self.errors.is_empty()
	}
}

struct LinkInfo {
	links:  u32,
	found:  u32,
	is_dir: bool,
}

struct CursegView {
	segno:      u32,
	blkoff:     u16,
	alloc_type: u8,
	sum:        SummaryBlock,
}

struct SegView {
	valid_map:    [u8; layout::SIT_VBLOCK_MAP_SIZE],
	valid_blocks: u16,
	seg_type:     u8,
}

pub struct FsckWorker<'a> {
	bc:   &'a Bcache,
	opts: FsckOptions,

	raw:  SuperBlock,
	ckpt: Checkpoint,

	blocks_per_seg: u32,
	main_segments:  u32,
	main_blkaddr:   u32,
	start_segno:    u32,

	sit:     Vec<SegView>,
	nat:     HashMap<u32, RawNatEntry>,
	cursegs: Vec<CursegView>,

	/// nids with a non-null NAT entry; bits clear as the traversal reaches
	/// them.
	nat_area_bitmap: Vec<u8>,
	/// main-area blocks reached by the traversal.
	main_bitmap: Vec<u8>,

	link_map: HashMap<u32, LinkInfo>,
	/// inode fixes discovered on the way: (nid, links, clear_data_exist)
	inode_fixes: Vec<(u32, Option<u32>, bool)>,

	sum_cache: HashMap<u32, SummaryBlock>,

	checked_blocks: u64,
	checked_nodes:  u64,
	checked_inodes: u32,
	errors:         Vec<String>,
}

impl<'a> FsckWorker<'a> {
	pub fn new(bc: &'a Bcache, opts: FsckOptions) -> IoResult<Self> {
		let raw = Self::read_raw_super(bc)?;
		let (ckpt, _) = load_checkpoint(bc, &raw)?;

		let blocks_per_seg = 1u32 << raw.log_blocks_per_seg;
		let main_segments = raw.segment_count_main;
		let main_blocks = (main_segments * blocks_per_seg) as usize;
		let nat_blocks = (raw.segment_count_nat / 2) << raw.log_blocks_per_seg;
		let max_nid = nat_blocks as usize * NAT_ENTRY_PER_BLOCK;

		Ok(Self {
			bc,
			opts,
			blocks_per_seg,
			main_segments,
			main_blkaddr: raw.main_blkaddr,
			start_segno: (raw.main_blkaddr - raw.segment0_blkaddr) >> raw.log_blocks_per_seg,
			raw,
			ckpt,
			sit: Vec::new(),
			nat: HashMap::new(),
			cursegs: Vec::new(),
			nat_area_bitmap: vec![0; bits::bitmap_size(max_nid)],
			main_bitmap: vec![0; bits::bitmap_size(main_blocks)],
			link_map: HashMap::new(),
			inode_fixes: Vec::new(),
			sum_cache: HashMap::new(),
			checked_blocks: 0,
			checked_nodes: 0,
			checked_inodes: 0,
			errors: Vec::new(),
		})
	}

	fn read_raw_super(bc: &Bcache) -> IoResult<SuperBlock> {
		let mut buf = vec![0u8; BLOCK_SIZE];
		for copy in 0..2u32 {
			if bc.read_blk(copy, &mut buf).is_err() {
				continue;
			}
			if let Ok(sb) = layout::decode::<SuperBlock>(&buf[SUPER_OFFSET..]) {
				if sb.magic == layout::F2FS_SUPER_MAGIC {
					return Ok(sb);
				}
			}
		}
		Err(IoError::new(ErrorKind::InvalidData, "no valid superblock"))
	}

	fn note(&mut self, msg: String) {
		log::warn!("fsck: {msg}");
		self.errors.push(msg);
	}

	fn read_block(&self, blkaddr: u32) -> IoResult<Vec<u8>> {
		let mut buf = vec![0u8; BLOCK_SIZE];
		self.bc.read_blk(blkaddr, &mut buf)?;
		Ok(buf)
	}

	fn start_cp_addr(&self) -> u32 {
		let mut addr = self.raw.cp_blkaddr;
		if self.ckpt.checkpoint_ver & 1 == 0 {
			addr += self.blocks_per_seg;
		}
		addr
	}

	fn start_block(&self, segno: u32) -> u32 {
		self.raw.segment0_blkaddr + ((self.start_segno + segno) << self.raw.log_blocks_per_seg)
	}

	fn segno_of(&self, blkaddr: u32) -> u32 {
		((blkaddr - self.raw.segment0_blkaddr) >> self.raw.log_blocks_per_seg)
			- self.start_segno
	}

	fn is_valid_blkaddr(&self, blkaddr: u32) -> bool {
		blkaddr >= self.main_blkaddr
			&& blkaddr < self.main_blkaddr + self.main_segments * self.blocks_per_seg
	}

	// -- load phase ----------------------------------------------------------

	fn current_sit_addr(&self, segno: u32) -> u32 {
		let offset = segno / SIT_ENTRY_PER_BLOCK as u32;
		let mut addr = self.raw.sit_blkaddr + offset;
		if bits::test_valid_bit(offset as usize, self.ckpt.sit_bitmap()) {
			addr += (self.raw.segment_count_sit / 2) << self.raw.log_blocks_per_seg;
		}
		addr
	}

	fn current_nat_addr(&self, nid: u32) -> u32 {
		let block_off = nid / NAT_ENTRY_PER_BLOCK as u32;
		let seg_off = block_off >> self.raw.log_blocks_per_seg;
		let mut addr = self.raw.nat_blkaddr
			+ (seg_off << self.raw.log_blocks_per_seg << 1)
			+ (block_off & (self.blocks_per_seg - 1));
		if bits::test_valid_bit(block_off as usize, self.ckpt.nat_bitmap()) {
			addr += self.blocks_per_seg;
		}
		addr
	}

	fn restore_node_summary(&self, segno: u32) -> IoResult<SummaryBlock> {
		let mut sum = SummaryBlock::zeroed();
		sum.footer.entry_type = layout::SUM_TYPE_NODE;
		let mut addr = self.start_block(segno);
		for i in 0..self.blocks_per_seg as usize {
			let buf = self.read_block(addr)?;
			let node: NodeBlock = layout::decode(&buf)?;
			sum.entries[i] = layout::Summary::new(node.footer.nid, 0, 0);
			addr += 1;
		}
		Ok(sum)
	}

	fn load_cursegs(&mut self) -> IoResult<()> {
		let compact = self.ckpt.is_set(CP_COMPACT_SUM_FLAG);
		let umount = self.ckpt.is_set(CP_UMOUNT_FLAG);
		let start_sum = self.start_cp_addr() + self.ckpt.cp_pack_start_sum;

		let mut sums: Vec<SummaryBlock> = Vec::with_capacity(NR_CURSEG_TYPE);

		if compact {
			// journals and packed entries for the three data logs
			let mut addr = start_sum;
			let mut buf = self.read_block(addr)?;
			addr += 1;

			let nat_n = u16::from_le_bytes(buf[0..2].try_into().unwrap());
			let nat_journal: Vec<u8> = buf[2..2 + SUM_JOURNAL_SIZE].to_vec();
			let base = 2 + SUM_JOURNAL_SIZE;
			let sit_n = u16::from_le_bytes(buf[base..base + 2].try_into().unwrap());
			let sit_journal: Vec<u8> = buf[base + 2..base + 2 + SUM_JOURNAL_SIZE].to_vec();

			let mut offset = 2 * (SUM_JOURNAL_SIZE + 2);
			for i in 0..NR_CURSEG_DATA_TYPE {
				let mut sum = SummaryBlock::zeroed();
				sum.footer.entry_type = layout::SUM_TYPE_DATA;
				if i == 0 {
					sum.n_journal = nat_n;
					sum.journal.copy_from_slice(&nat_journal);
				} else if i == 2 {
					sum.n_journal = sit_n;
					sum.journal.copy_from_slice(&sit_journal);
				}
				let count = if self.ckpt.alloc_type[i] != ALLOC_LFS {
					self.blocks_per_seg as usize
				} else {
					self.ckpt.cur_data_blkoff[i] as usize
				};
				for entry in sum.entries.iter_mut().take(count) {
					if offset + SUMMARY_SIZE > BLOCK_SIZE - layout::SUM_FOOTER_SIZE {
						buf = self.read_block(addr)?;
						addr += 1;
						offset = 0;
					}
					*entry = layout::decode(&buf[offset..offset + SUMMARY_SIZE])?;
					offset += SUMMARY_SIZE;
				}
				sums.push(sum);
			}
		} else {
			let total = self.ckpt.cp_pack_total_block_count;
			for i in 0..NR_CURSEG_DATA_TYPE {
				let base = if umount {
					NR_CURSEG_TYPE
				} else {
					NR_CURSEG_DATA_TYPE
				};
				let addr = self.start_cp_addr() + total - (base as u32 + 1) + i as u32;
				let buf = self.read_block(addr)?;
				sums.push(layout::decode(&buf)?);
			}
		}

		for i in 0..layout::NR_CURSEG_NODE_TYPE {
			let segno = self.ckpt.cur_node_segno[i];
			let sum = if umount {
				let total = self.ckpt.cp_pack_total_block_count;
				let addr = self.start_cp_addr() + total - (layout::NR_CURSEG_NODE_TYPE as u32 + 1)
					+ i as u32;
				let buf = self.read_block(addr)?;
				layout::decode(&buf)?
			} else {
				self.restore_node_summary(segno)?
			};
			sums.push(sum);
		}

		for (i, sum) in sums.into_iter().enumerate() {
			let (segno, blkoff) = if i < NR_CURSEG_DATA_TYPE {
				(self.ckpt.cur_data_segno[i], self.ckpt.cur_data_blkoff[i])
			} else {
				(
					self.ckpt.cur_node_segno[i - NR_CURSEG_DATA_TYPE],
					self.ckpt.cur_node_blkoff[i - NR_CURSEG_DATA_TYPE],
				)
			};
			self.cursegs.push(CursegView {
				segno,
				blkoff,
				alloc_type: self.ckpt.alloc_type[i],
				sum,
			});
		}
		Ok(())
	}

	fn load_sit(&mut self) -> IoResult<()> {
		for segno in 0..self.main_segments {
			let addr = self.current_sit_addr(segno);
			let buf = self.read_block(addr)?;
			let blk: SitBlock = layout::decode(&buf)?;
			let raw = blk.entries[segno as usize % SIT_ENTRY_PER_BLOCK];
			self.sit.push(SegView {
				valid_map:    raw.valid_map,
				valid_blocks: raw.valid_blocks(),
				seg_type:     raw.seg_type(),
			});
		}
		// journal overrides
		let mut cold = self.cursegs[2].sum.clone();
		for i in 0..cold.journal_count().min(layout::SIT_JOURNAL_ENTRIES) {
			let (segno, se) = cold.sit_in_journal(i);
			if (segno as usize) < self.sit.len() {
				self.sit[segno as usize] = SegView {
					valid_map:    se.valid_map,
					valid_blocks: se.valid_blocks(),
					seg_type:     se.seg_type(),
				};
			}
		}
		Ok(())
	}

	fn load_nat(&mut self) -> IoResult<()> {
		let nat_blocks = (self.raw.segment_count_nat / 2) << self.raw.log_blocks_per_seg;
		for block_off in 0..nat_blocks {
			let start_nid = block_off * NAT_ENTRY_PER_BLOCK as u32;
			let buf = self.read_block(self.current_nat_addr(start_nid))?;
			let blk: NatBlock = layout::decode(&buf)?;
			for (i, entry) in blk.entries.iter().enumerate() {
				let nid = start_nid + i as u32;
				if nid == 0 {
					continue;
				}
				if entry.block_addr != NULL_ADDR {
					self.nat.insert(nid, *entry);
					bits::set_bit(nid as usize, &mut self.nat_area_bitmap);
				}
			}
		}
		// journal overrides from the hot data curseg
		let hot = self.cursegs[0].sum.clone();
		for i in 0..hot.journal_count().min(layout::NAT_JOURNAL_ENTRIES) {
			let (nid, ne) = hot.nat_in_journal(i);
			if ne.block_addr != NULL_ADDR {
				self.nat.insert(nid, ne);
				bits::set_bit(nid as usize, &mut self.nat_area_bitmap);
			} else {
				self.nat.remove(&nid);
				bits::clear_bit(nid as usize, &mut self.nat_area_bitmap);
			}
		}
		Ok(())
	}

	// -- traversal -----------------------------------------------------------

	fn mark_main_block(&mut self, blkaddr: u32, what: &str) -> bool {
		if !self.is_valid_blkaddr(blkaddr) {
			self.note(format!("{what}: block {blkaddr:#x} outside the main area"));
			return false;
		}
		let idx = (blkaddr - self.main_blkaddr) as usize;
		if bits::test_and_set_bit(idx, &mut self.main_bitmap) {
			self.note(format!("{what}: block {blkaddr:#x} referenced twice"));
			return false;
		}
		true
	}

	fn sum_entry_of(&mut self, blkaddr: u32) -> IoResult<layout::Summary> {
		let segno = self.segno_of(blkaddr);
		let blkoff = ((blkaddr - self.raw.segment0_blkaddr) & (self.blocks_per_seg - 1)) as usize;

		for curseg in &self.cursegs {
			if curseg.segno == segno {
				return Ok(curseg.sum.entries[blkoff]);
			}
		}
		if !self.sum_cache.contains_key(&segno) {
			let buf = self.read_block(self.raw.ssa_blkaddr + segno)?;
			let sum: SummaryBlock = layout::decode(&buf)?;
			self.sum_cache.insert(segno, sum);
		}
		Ok(self.sum_cache[&segno].entries[blkoff])
	}

	/// I3: every in-use node block must be reverse-mapped by its segment
	/// summary.
	fn check_ssa_node(&mut self, nid: u32, blkaddr: u32) -> IoResult<()> {
		let sum = self.sum_entry_of(blkaddr)?;
		if sum.nid != nid {
			self.note(format!(
				"ssa mismatch for node {nid}: summary names {}",
				sum.nid
			));
		}
		Ok(())
	}

	fn check_ssa_data(&mut self, parent_nid: u32, ofs_in_node: u16, blkaddr: u32) -> IoResult<()> {
		let sum = self.sum_entry_of(blkaddr)?;
		if sum.nid != parent_nid || sum.ofs_in_node != ofs_in_node {
			self.note(format!(
				"ssa mismatch for data block {blkaddr:#x}: ({}, {}) != ({parent_nid}, {ofs_in_node})",
				sum.nid, sum.ofs_in_node
			));
		}
		Ok(())
	}

	fn get_node(&mut self, nid: u32) -> IoResult<Option<(NodeBlock, u32)>> {
		let entry = match self.nat.get(&nid) {
			Some(entry) => *entry,
			None => {
				self.note(format!("node {nid} has no NAT entry"));
				return Ok(None);
			}
		};
		if entry.block_addr == NEW_ADDR {
			self.note(format!("node {nid} is reserved but unwritten"));
			return Ok(None);
		}
		if !self.is_valid_blkaddr(entry.block_addr) {
			self.note(format!("node {nid} points outside the main area"));
			return Ok(None);
		}
		let buf = self.read_block(entry.block_addr)?;
		let node: NodeBlock = layout::decode(&buf)?;
		if node.footer.nid != nid {
			self.note(format!(
				"node {nid}: footer says {}",
				node.footer.nid
			));
			return Ok(None);
		}
		Ok(Some((node, entry.block_addr)))
	}

	fn check_data_block(
		&mut self,
		parent_nid: u32,
		ofs_in_node: u16,
		blkaddr: u32,
		ftype: u8,
		depth: u32,
		child_dirs: &mut u32,
	) -> IoResult<u64> {
		if blkaddr == NULL_ADDR || blkaddr == NEW_ADDR {
			return Ok(0);
		}
		if !self.mark_main_block(blkaddr, "data") {
			return Ok(0);
		}
		self.checked_blocks += 1;
		self.check_ssa_data(parent_nid, ofs_in_node, blkaddr)?;

		if ftype == FT_DIR {
			*child_dirs += self.check_dentry_block(blkaddr, depth)?;
		}
		Ok(1)
	}

	/// Returns the number of child directories found in this block.
	fn check_dentry_block(&mut self, blkaddr: u32, depth: u32) -> IoResult<u32> {
		let buf = self.read_block(blkaddr)?;
		let blk: DentryBlock = layout::decode(&buf)?;
		let mut child_dirs = 0;
		let mut bit_pos = bits::find_next_bit(&blk.dentry_bitmap, NR_DENTRY_IN_BLOCK, 0);
		while bit_pos < NR_DENTRY_IN_BLOCK {
			let de = blk.dentry[bit_pos];
			let name = blk.name_of(bit_pos, de.name_len as usize);
			let name = String::from_utf8_lossy(&name).into_owned();
			if de.file_type >= FT_MAX {
				self.note(format!("dentry {name:?} has file type {}", de.file_type));
			} else if name != "." && name != ".." {
				if de.file_type == FT_DIR {
					child_dirs += 1;
				}
				self.check_inode(de.ino, de.file_type, depth + 1)?;
			}
			bit_pos += de.slots().max(1);
			bit_pos = bits::find_next_bit(&blk.dentry_bitmap, NR_DENTRY_IN_BLOCK, bit_pos);
		}
		Ok(child_dirs)
	}

	fn check_inline_dentries(&mut self, node: &NodeBlock, depth: u32) -> IoResult<u32> {
		let region =
			&node.payload[INLINE_DATA_OFFSET..INLINE_DATA_OFFSET + MAX_INLINE_DATA];
		let bitmap = region[..layout::INLINE_DENTRY_BITMAP_SIZE].to_vec();
		let dentry_base = MAX_INLINE_DATA
			- layout::NR_INLINE_DENTRY * (layout::SIZE_OF_DIR_ENTRY + layout::DENTRY_SLOT_LEN);

		let mut child_dirs = 0;
		let mut bit_pos = bits::find_next_bit(&bitmap, layout::NR_INLINE_DENTRY, 0);
		while bit_pos < layout::NR_INLINE_DENTRY {
			let ofs = dentry_base + bit_pos * layout::SIZE_OF_DIR_ENTRY;
			let de: layout::DirEntry =
				layout::decode(&region[ofs..ofs + layout::SIZE_OF_DIR_ENTRY])?;
			if bit_pos >= 2 && de.file_type < FT_MAX {
				if de.file_type == FT_DIR {
					child_dirs += 1;
				}
				self.check_inode(de.ino, de.file_type, depth + 1)?;
			}
			bit_pos += layout::dentry_slots(de.name_len as usize).max(1);
			bit_pos = bits::find_next_bit(&bitmap, layout::NR_INLINE_DENTRY, bit_pos);
		}
		Ok(child_dirs)
	}

	fn check_nid_slot(
		&mut self,
		inode_nid: u32,
		nid: u32,
		ftype: u8,
		depth_kind: usize,
		dir_depth: u32,
		child_dirs: &mut u32,
	) -> IoResult<u64> {
		if nid == 0 {
			return Ok(0);
		}
		let (node, blkaddr) = match self.get_node(nid)? {
			Some(v) => v,
			None => return Ok(0),
		};
		if node.footer.ino != inode_nid {
			self.note(format!(
				"node {nid} belongs to {} not {inode_nid}",
				node.footer.ino
			));
			return Ok(0);
		}
		if !self.mark_main_block(blkaddr, "node") {
			return Ok(0);
		}
		bits::clear_bit(nid as usize, &mut self.nat_area_bitmap);
		self.checked_nodes += 1;
		self.check_ssa_node(nid, blkaddr)?;

		let mut blocks = 1u64;
		match depth_kind {
			// direct node: payload is data addresses
			0 => {
				for i in 0..ADDRS_PER_BLOCK {
					blocks += self.check_data_block(
						nid,
						i as u16,
						node.data_addr(i),
						ftype,
						dir_depth,
						child_dirs,
					)?;
				}
			}
			// indirect: children are direct nodes
			1 => {
				for i in 0..layout::NIDS_PER_BLOCK {
					blocks += self.check_nid_slot(
						inode_nid,
						node.child_nid(i, false),
						ftype,
						0,
						dir_depth,
						child_dirs,
					)?;
				}
			}
			// double indirect: children are indirect nodes
			_ => {
				for i in 0..layout::NIDS_PER_BLOCK {
					blocks += self.check_nid_slot(
						inode_nid,
						node.child_nid(i, false),
						ftype,
						1,
						dir_depth,
						child_dirs,
					)?;
				}
			}
		}
		Ok(blocks)
	}

	fn check_inode(&mut self, ino: u32, ftype: u8, depth: u32) -> IoResult<()> {
		if depth > layout::MAX_DIR_HASH_DEPTH + 8 {
			self.note(format!("directory tree too deep at inode {ino}"));
			return Ok(());
		}
		// hard links revisit: bump the seen count only
		if let Some(info) = self.link_map.get_mut(&ino) {
			info.found += 1;
			if ftype == FT_DIR {
				self.note(format!("directory {ino} is multiply linked"));
			}
			return Ok(());
		}

		let (node, blkaddr) = match self.get_node(ino)? {
			Some(v) => v,
			None => return Ok(()),
		};
		if !node.is_inode() {
			self.note(format!("inode {ino} footer is not an inode footer"));
			return Ok(());
		}
		let inode = node.inode()?;

		if !self.mark_main_block(blkaddr, "inode") {
			return Ok(());
		}
		bits::clear_bit(ino as usize, &mut self.nat_area_bitmap);
		self.checked_nodes += 1;
		self.checked_inodes += 1;
		self.check_ssa_node(ino, blkaddr)?;

		if ftype == FT_ORPHAN && inode.links != 0 {
			self.note(format!("orphan {ino} still has {} links", inode.links));
		}
		let is_dir = layout::is_dir_mode(inode.mode);
		if ftype == FT_DIR && !is_dir {
			self.note(format!("dentry says dir but inode {ino} mode is {:o}", inode.mode));
		}
		self.link_map.insert(
			ino,
			LinkInfo {
				links: inode.links,
				found: if ftype == FT_ORPHAN { 0 } else { 1 },
				is_dir,
			},
		);

		let mut blocks = 1u64;
		let mut child_dirs = 0u32;

		if inode.inline & INLINE_DENTRY != 0 {
			child_dirs = self.check_inline_dentries(&node, depth)?;
		} else if inode.inline & INLINE_DATA != 0 {
			// data_exist must agree with the payload
			let region =
				&node.payload[INLINE_DATA_OFFSET..INLINE_DATA_OFFSET + MAX_INLINE_DATA];
			let has_data = region.iter().any(|b| *b != 0);
			let flagged = inode.inline & DATA_EXIST != 0;
			if has_data != flagged {
				self.note(format!("inode {ino}: data_exist flag disagrees with payload"));
				self.inode_fixes.push((ino, None, !has_data));
			}
		} else {
			for i in 0..ADDRS_PER_INODE {
				blocks += self.check_data_block(
					ino,
					i as u16,
					node.data_addr(i),
					ftype,
					depth,
					&mut child_dirs,
				)?;
			}
			for (slot, kind) in [(0usize, 0usize), (1, 0), (2, 1), (3, 1), (4, 2)] {
				let nid = node.child_nid(NODE_DIR1_BLOCK + slot, true);
				blocks +=
					self.check_nid_slot(ino, nid, ftype, kind, depth, &mut child_dirs)?;
			}
		}

		// a directory holds "." plus one ".." per child directory
		if is_dir && ftype != FT_ORPHAN {
			let expected = 2 + child_dirs;
			if inode.links != expected {
				self.note(format!(
					"directory {ino}: link count {} but {child_dirs} subdirectories",
					inode.links
				));
				self.inode_fixes.push((ino, Some(expected), false));
			}
		}

		if inode.xattr_nid != 0 {
			if let Some((_, xaddr)) = self.get_node(inode.xattr_nid)? {
				if self.mark_main_block(xaddr, "xattr node") {
					bits::clear_bit(inode.xattr_nid as usize, &mut self.nat_area_bitmap);
					self.checked_nodes += 1;
					blocks += 1;
				}
			}
		}

		if inode.blocks != blocks {
			self.note(format!(
				"inode {ino}: i_blocks {} but {blocks} in use",
				inode.blocks
			));
		}
		Ok(())
	}

	fn check_orphans(&mut self) -> IoResult<()> {
		if !self.ckpt.is_set(CP_ORPHAN_PRESENT_FLAG) {
			return Ok(());
		}
		let start = self.start_cp_addr() + self.raw.cp_payload + 1;
		let blocks = self.ckpt.cp_pack_start_sum - 1 - self.raw.cp_payload;
		for i in 0..blocks {
			let buf = self.read_block(start + i)?;
			let blk: layout::OrphanBlock = layout::decode(&buf)?;
			for j in 0..(blk.entry_count as usize).min(ORPHANS_PER_BLOCK) {
				self.check_inode(blk.ino[j], FT_ORPHAN, 0)?;
			}
		}
		Ok(())
	}

	// -- verification --------------------------------------------------------

	fn verify_curseg_offsets(&mut self) {
		for (i, curseg) in self.cursegs.iter().enumerate() {
			if curseg.segno >= self.main_segments {
				self.errors
					.push(format!("curseg {i} at invalid segment {}", curseg.segno));
				continue;
			}
			if curseg.alloc_type == ALLOC_LFS && (curseg.blkoff as u32) < self.blocks_per_seg {
				let se = &self.sit[curseg.segno as usize];
				if bits::test_valid_bit(curseg.blkoff as usize, &se.valid_map) {
					self.errors.push(format!(
						"curseg {i} next_blkoff {} points at a live block",
						curseg.blkoff
					));
				}
			}
		}
	}

	fn verify(&mut self) {
		// every NAT-mapped nid must have been reached
		let max_nid = self.nat_area_bitmap.len() * 8;
		let mut nid = bits::find_next_bit(&self.nat_area_bitmap, max_nid, 0);
		while nid < max_nid {
			if nid as u32 != self.raw.node_ino && nid as u32 != self.raw.meta_ino {
				self.errors
					.push(format!("nid {nid} is mapped but unreachable"));
			}
			nid = bits::find_next_bit(&self.nat_area_bitmap, max_nid, nid + 1);
		}

		// SIT valid maps must equal the traversal bitmap
		for segno in 0..self.main_segments as usize {
			let se = &self.sit[segno];
			let mut popcount = 0u16;
			for off in 0..self.blocks_per_seg as usize {
				let on_disk = bits::test_valid_bit(off, &se.valid_map);
				if on_disk {
					popcount += 1;
				}
				let visited = bits::test_bit(
					segno * self.blocks_per_seg as usize + off,
					&self.main_bitmap,
				);
				if on_disk != visited {
					self.errors.push(format!(
						"segment {segno} block {off}: sit={} traversal={}",
						on_disk as u8, visited as u8
					));
				}
			}
			if popcount != se.valid_blocks {
				self.errors.push(format!(
					"segment {segno}: popcount {popcount} != vblocks {}",
					se.valid_blocks
				));
			}
		}

		// hard link counts; directories are verified against their child
		// count during traversal
		let link_errors: Vec<String> = self
			.link_map
			.iter()
			.filter(|(_, info)| !info.is_dir && info.links != info.found)
			.map(|(ino, info)| {
				format!(
					"inode {ino}: link count {} but {} dentries",
					info.links, info.found
				)
			})
			.collect();
		for (ino, info) in self.link_map.iter() {
			if !info.is_dir && info.links != info.found {
				self.inode_fixes.push((*ino, Some(info.found), false));
			}
		}
		self.errors.extend(link_errors);

		// checkpoint counters
		let total_valid: u64 = self
			.sit
			.iter()
			.map(|se| se.valid_blocks as u64)
			.sum();
		if total_valid != self.ckpt.valid_block_count {
			self.errors.push(format!(
				"valid_block_count {} != sit total {total_valid}",
				self.ckpt.valid_block_count
			));
		}
		if self.checked_nodes != self.ckpt.valid_node_count as u64 {
			self.errors.push(format!(
				"valid_node_count {} != traversed {}",
				self.ckpt.valid_node_count, self.checked_nodes
			));
		}
		if self.checked_inodes != self.ckpt.valid_inode_count {
			self.errors.push(format!(
				"valid_inode_count {} != traversed {}",
				self.ckpt.valid_inode_count, self.checked_inodes
			));
		}

		self.verify_curseg_offsets();
	}

	// -- repair --------------------------------------------------------------

	fn repair_nat(&mut self) -> IoResult<()> {
		let max_nid = self.nat_area_bitmap.len() * 8;
		let mut nid = bits::find_next_bit(&self.nat_area_bitmap, max_nid, 0) as u32;
		while (nid as usize) < max_nid {
			if nid != self.raw.node_ino && nid != self.raw.meta_ino {
				let addr = self.current_nat_addr(nid);
				let mut buf = self.read_block(addr)?;
				let mut blk: NatBlock = layout::decode(&buf)?;
				blk.entries[nid as usize % NAT_ENTRY_PER_BLOCK] = RawNatEntry {
					version:    0,
					ino:        0,
					block_addr: NULL_ADDR,
				};
				layout::encode(&blk, &mut buf)?;
				self.bc.write_blk(addr, &buf)?;
				log::info!("fsck: cleared unreachable nid {nid}");
			}
			nid = bits::find_next_bit(&self.nat_area_bitmap, max_nid, nid as usize + 1) as u32;
		}
		Ok(())
	}

	fn repair_sit(&mut self) -> IoResult<()> {
		for segno in 0..self.main_segments {
			let base = segno as usize * self.blocks_per_seg as usize;
			let mut valid_map = [0u8; layout::SIT_VBLOCK_MAP_SIZE];
			let mut count = 0u16;
			for off in 0..self.blocks_per_seg as usize {
				if bits::test_bit(base + off, &self.main_bitmap) {
					bits::set_valid_bit(off, &mut valid_map);
					count += 1;
				}
			}
			let se = &self.sit[segno as usize];
			if se.valid_map != valid_map || se.valid_blocks != count {
				let addr = self.current_sit_addr(segno);
				let mut buf = self.read_block(addr)?;
				let mut blk: SitBlock = layout::decode(&buf)?;
				let slot = segno as usize % SIT_ENTRY_PER_BLOCK;
				blk.entries[slot] = SitEntry {
					vblocks: ((se.seg_type as u16) << layout::SIT_VBLOCKS_SHIFT) | count,
					valid_map,
					mtime: blk.entries[slot].mtime,
				};
				layout::encode(&blk, &mut buf)?;
				self.bc.write_blk(addr, &buf)?;
				self.sit[segno as usize] = SegView {
					valid_map,
					valid_blocks: count,
					seg_type: se.seg_type,
				};
				log::info!("fsck: rewrote sit entry for segment {segno}");
			}
		}
		// keep the journalled copies consistent with the rewritten area
		let mut cold = self.cursegs[2].sum.clone();
		let mut dirty = false;
		for i in 0..cold.journal_count().min(layout::SIT_JOURNAL_ENTRIES) {
			let (segno, old) = cold.sit_in_journal(i);
			if (segno as usize) < self.sit.len() {
				let se = &self.sit[segno as usize];
				let fixed = SitEntry {
					vblocks: ((se.seg_type as u16) << layout::SIT_VBLOCKS_SHIFT)
						| se.valid_blocks,
					valid_map: se.valid_map,
					mtime: old.mtime,
				};
				cold.set_sit_in_journal(i, segno, &fixed);
				dirty = true;
			}
		}
		if dirty {
			if self.ckpt.is_set(CP_COMPACT_SUM_FLAG) {
				// the journal lives in the first compact summary block
				let addr = self.start_cp_addr() + self.ckpt.cp_pack_start_sum;
				let mut buf = self.read_block(addr)?;
				let base = 2 + SUM_JOURNAL_SIZE;
				buf[base..base + 2].copy_from_slice(&cold.n_journal.to_le_bytes());
				buf[base + 2..base + 2 + SUM_JOURNAL_SIZE].copy_from_slice(&cold.journal);
				self.bc.write_blk(addr, &buf)?;
			} else {
				let total = self.ckpt.cp_pack_total_block_count;
				let base = if self.ckpt.is_set(CP_UMOUNT_FLAG) {
					NR_CURSEG_TYPE
				} else {
					NR_CURSEG_DATA_TYPE
				};
				let addr = self.start_cp_addr() + total - (base as u32 + 1) + 2;
				let mut buf = vec![0u8; BLOCK_SIZE];
				layout::encode(&cold, &mut buf)?;
				self.bc.write_blk(addr, &buf)?;
			}
			self.cursegs[2].sum = cold;
		}
		Ok(())
	}

	fn repair_inodes(&mut self) -> IoResult<()> {
		let fixes = std::mem::take(&mut self.inode_fixes);
		for (ino, links, clear_data_exist) in fixes {
			let entry = match self.nat.get(&ino) {
				Some(e) => *e,
				None => continue,
			};
			let mut buf = self.read_block(entry.block_addr)?;
			let mut node: NodeBlock = layout::decode(&buf)?;
			let mut inode = node.inode()?;
			if let Some(links) = links {
				log::info!("fsck: inode {ino} links {} -> {links}", inode.links);
				inode.links = links;
			}
			if clear_data_exist {
				inode.inline &= !DATA_EXIST;
			} else if inode.inline & INLINE_DATA != 0 {
				inode.inline |= DATA_EXIST;
			}
			node.set_inode(&inode)?;
			layout::encode(&node, &mut buf)?;
			self.bc.write_blk(entry.block_addr, &buf)?;
		}
		Ok(())
	}

	fn repair_checkpoint(&mut self) -> IoResult<()> {
		let total_valid: u64 = self.sit.iter().map(|se| se.valid_blocks as u64).sum();
		self.ckpt.valid_block_count = total_valid;
		self.ckpt.valid_node_count = self.checked_nodes as u32;
		self.ckpt.valid_inode_count = self.checked_inodes;

		let base = self.start_cp_addr();
		let mut buf = vec![0u8; BLOCK_SIZE];
		let mut ckpt = self.ckpt.clone();
		ckpt.write_to(&mut buf)?;
		self.bc.write_blk(base, &buf)?;
		self.bc
			.write_blk(base + ckpt.cp_pack_total_block_count - 1, &buf)?;
		self.bc.flush()?;
		self.ckpt = ckpt;
		Ok(())
	}

	fn repair(&mut self) -> IoResult<()> {
		self.repair_nat()?;
		self.repair_sit()?;
		self.repair_inodes()?;
		self.repair_checkpoint()?;
		Ok(())
	}

	/// Run the full check; with `repair` set, reconcile what the traversal
	/// proved wrong.
	pub fn run(mut self) -> IoResult<FsckReport> {
		self.load_cursegs()?;
		self.load_sit()?;
		self.load_nat()?;

		self.check_inode(self.raw.root_ino, FT_DIR, 0)?;
		self.check_orphans()?;
		self.verify();

		let mut repaired = false;
		if !self.errors.is_empty() && self.opts.repair {
			self.repair()?;
			repaired = true;
		}

		let report = FsckReport {
			checked_inodes: self.checked_inodes,
			checked_nodes:  self.checked_nodes,
			checked_blocks: self.checked_blocks,
			errors:         self.errors,
			repaired,
		};
		if report.ok() {
			log::info!(
				"fsck: OK ({} inodes, {} nodes, {} blocks)",
				report.checked_inodes,
				report.checked_nodes,
				report.checked_blocks
			);
		}
		Ok(report)
	}
}

/// Convenience entry point for the fsck binary and tests.
pub fn fsck(bc: &Bcache, opts: FsckOptions) -> IoResult<FsckReport> {
	FsckWorker::new(bc, opts)?.run()
}
