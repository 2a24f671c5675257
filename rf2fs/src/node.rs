use std::{
	collections::{BTreeSet, HashMap},
	io::{Error as IoError, ErrorKind, Result as IoResult},
	sync::{
		atomic::{AtomicU32, Ordering},
		Arc, Mutex, RwLock,
	},
};

use crate::{
	err,
	layout::{
		Checkpoint, NodeBlock, RawNatEntry, SuperBlock, ADDRS_PER_BLOCK, ADDRS_PER_INODE,
		COLD_BIT_SHIFT, DENT_BIT_SHIFT, FSYNC_BIT_SHIFT, NAT_ENTRY_PER_BLOCK, NEW_ADDR,
		NIDS_PER_BLOCK, NODE_DIR1_BLOCK, NODE_DIR2_BLOCK, NODE_DIND_BLOCK, NODE_IND1_BLOCK,
		NODE_IND2_BLOCK, NULL_ADDR, NULL_NID,
	},
	mount::F2fs,
	page::Page,
	segment::CursegType,
	vnode::{Vnode, VNODE_NO_ALLOC},
};

/// Readahead width when scanning NAT blocks for free nids.
pub const FREE_NID_PAGES: usize = 4;
/// Free-nid pool refill target.
pub const MAX_FREE_NIDS: usize = NAT_ENTRY_PER_BLOCK * FREE_NID_PAGES;
/// Soft bound on cached NAT entries.
pub const NM_WOUT_THRESHOLD: usize = 64 * NAT_ENTRY_PER_BLOCK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
	pub nid:      u32,
	pub ino:      u32,
	pub blk_addr: u32,
	pub version:  u8,
}

#[derive(Debug, Clone)]
struct NatCacheEntry {
	ino:           u32,
	blk_addr:      u32,
	version:       u8,
	checkpointed:  bool,
	dirty:         bool,
}

struct NatCache {
	entries: HashMap<u32, NatCacheEntry>,
	dirty:   BTreeSet<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NidState {
	New,
	Alloc,
}

struct FreeNidPool {
	list:      Vec<(u32, NidState)>,
	new_count: usize,
}

impl FreeNidPool {
	fn lookup(&self, nid: u32) -> Option<usize> {
		self.list.iter().position(|(n, _)| *n == nid)
	}
}

/// Logical-to-physical translation for every node block, with a write-back
/// cache over the NAT area and a pool of known-free node ids.
pub struct NodeManager {
	nat_blkaddr:        u32,
	max_nid:            u32,
	blocks_per_seg:     u32,
	log_blocks_per_seg: u32,

	nat:           RwLock<NatCache>,
	free_nids:     Mutex<FreeNidPool>,
	build_lock:    Mutex<()>,
	next_scan_nid: AtomicU32,

	/// NAT version bitmap (live copy selector) and its previous-checkpoint
	/// snapshot.
	bitmaps: Mutex<(Vec<u8>, Vec<u8>)>,
}

impl NodeManager {
	pub fn new(raw: &SuperBlock, ckpt: &Checkpoint) -> Self {
		let nat_segs = raw.segment_count_nat / 2;
		let nat_blocks = nat_segs << raw.log_blocks_per_seg;
		let bitmap = ckpt.nat_bitmap().to_vec();
		Self {
			nat_blkaddr: raw.nat_blkaddr,
			max_nid: NAT_ENTRY_PER_BLOCK as u32 * nat_blocks,
			blocks_per_seg: 1 << raw.log_blocks_per_seg,
			log_blocks_per_seg: raw.log_blocks_per_seg,
			nat: RwLock::new(NatCache {
				entries: HashMap::new(),
				dirty:   BTreeSet::new(),
			}),
			free_nids: Mutex::new(FreeNidPool {
				list:      Vec::new(),
				new_count: 0,
			}),
			build_lock: Mutex::new(()),
			next_scan_nid: AtomicU32::new(ckpt.next_free_nid),
			bitmaps: Mutex::new((bitmap.clone(), bitmap)),
		}
	}

	pub fn max_nid(&self) -> u32 {
		self.max_nid
	}

	pub fn check_nid_range(&self, nid: u32) -> IoResult<()> {
		if nid == NULL_NID || nid >= self.max_nid {
			log::error!("nid {nid} out of range (max {})", self.max_nid);
			return Err(err!(ERANGE));
		}
		Ok(())
	}

	fn nat_block_offset(nid: u32) -> u32 {
		nid / NAT_ENTRY_PER_BLOCK as u32
	}

	pub fn start_nid(nid: u32) -> u32 {
		(nid / NAT_ENTRY_PER_BLOCK as u32) * NAT_ENTRY_PER_BLOCK as u32
	}

	/// Block address of the live NAT copy holding `start_nid`'s entry. The
	/// two copies of each logical block sit one segment apart; the version
	/// bitmap picks the current one.
	pub fn current_nat_addr(&self, start_nid: u32) -> u32 {
		let block_off = Self::nat_block_offset(start_nid);
		let seg_off = block_off >> self.log_blocks_per_seg;
		let mut block_addr = self.nat_blkaddr
			+ (seg_off << self.log_blocks_per_seg << 1)
			+ (block_off & (self.blocks_per_seg - 1));
		let bitmaps = self.bitmaps.lock().unwrap();
		if crate::bits::test_valid_bit(block_off as usize, &bitmaps.0) {
			block_addr += self.blocks_per_seg;
		}
		block_addr
	}

	fn is_updated_nat_page(&self, start_nid: u32) -> bool {
		let block_off = Self::nat_block_offset(start_nid) as usize;
		let bitmaps = self.bitmaps.lock().unwrap();
		crate::bits::test_valid_bit(block_off, &bitmaps.0)
			^ crate::bits::test_valid_bit(block_off, &bitmaps.1)
	}

	fn next_nat_addr(&self, block_addr: u32) -> u32 {
		let a = block_addr - self.nat_blkaddr;
		let a = if (a >> self.log_blocks_per_seg) % 2 == 1 {
			a - self.blocks_per_seg
		} else {
			a + self.blocks_per_seg
		};
		a + self.nat_blkaddr
	}

	fn set_to_next_nat(&self, start_nid: u32) {
		let block_off = Self::nat_block_offset(start_nid) as usize;
		let mut bitmaps = self.bitmaps.lock().unwrap();
		if crate::bits::test_valid_bit(block_off, &bitmaps.0) {
			crate::bits::clear_valid_bit(block_off, &mut bitmaps.0);
		} else {
			crate::bits::set_valid_bit(block_off, &mut bitmaps.0);
		}
	}

	/// Copy the live NAT bitmap out for a checkpoint and snapshot it as the
	/// new previous-checkpoint view.
	pub fn copy_nat_bitmap(&self, dst: &mut [u8]) {
		let mut bitmaps = self.bitmaps.lock().unwrap();
		dst.copy_from_slice(&bitmaps.0);
		let cur = bitmaps.0.clone();
		bitmaps.1 = cur;
	}

	/// A node is "checkpointed" when its NAT entry has not changed since the
	/// last checkpoint.
	pub fn is_checkpointed_node(&self, nid: u32) -> bool {
		let nat = self.nat.read().unwrap();
		match nat.entries.get(&nid) {
			Some(e) => e.checkpointed,
			None => true,
		}
	}

	pub fn lookup_nat_cache(&self, nid: u32) -> Option<NodeInfo> {
		let nat = self.nat.read().unwrap();
		nat.entries.get(&nid).map(|e| NodeInfo {
			nid,
			ino: e.ino,
			blk_addr: e.blk_addr,
			version: e.version,
		})
	}

	pub fn cache_nat_entry(&self, nid: u32, raw: &RawNatEntry) {
		let mut nat = self.nat.write().unwrap();
		nat.entries.entry(nid).or_insert(NatCacheEntry {
			ino:          raw.ino,
			blk_addr:     raw.block_addr,
			version:      raw.version,
			checkpointed: true,
			dirty:        false,
		});
	}

	/// Record a new physical address for a node, marking the entry dirty for
	/// the next NAT flush. A transition to `NULL_ADDR` bumps the version so
	/// stale summaries are detectable.
	pub fn set_node_addr(&self, ni: &NodeInfo, new_blkaddr: u32) {
		let mut nat = self.nat.write().unwrap();
		let entry = nat.entries.entry(ni.nid).or_insert(NatCacheEntry {
			ino:          ni.ino,
			blk_addr:     ni.blk_addr,
			version:      ni.version,
			checkpointed: true,
			dirty:        false,
		});

		if new_blkaddr == NEW_ADDR {
			// a reallocated nid may leave a stale entry behind
			entry.ino = ni.ino;
			entry.blk_addr = ni.blk_addr;
			entry.version = ni.version;
			entry.checkpointed = false;
		}

		if entry.blk_addr != NEW_ADDR && new_blkaddr == NULL_ADDR {
			entry.version = entry.version.wrapping_add(1);
		}
		entry.blk_addr = new_blkaddr;
		entry.dirty = true;
		nat.dirty.insert(ni.nid);
	}

	/// Drop clean cache entries once the cache outgrows its threshold.
	fn try_to_free_nats(&self, mut nr_shrink: usize) {
		let mut nat = self.nat.write().unwrap();
		if nat.entries.len() < 2 * NM_WOUT_THRESHOLD || nr_shrink == 0 {
			return;
		}
		let clean: Vec<u32> = nat
			.entries
			.iter()
			.filter(|(_, e)| !e.dirty)
			.map(|(nid, _)| *nid)
			.collect();
		for nid in clean {
			if nr_shrink == 0 {
				break;
			}
			nat.entries.remove(&nid);
			nr_shrink -= 1;
		}
	}

	fn add_free_nid(&self, nid: u32) -> bool {
		if nid == NULL_NID {
			return false;
		}
		let mut pool = self.free_nids.lock().unwrap();
		if pool.new_count > 2 * MAX_FREE_NIDS {
			return false;
		}
		if pool.lookup(nid).is_some() {
			return false;
		}
		pool.list.push((nid, NidState::New));
		pool.new_count += 1;
		true
	}

	pub(crate) fn remove_free_nid(&self, nid: u32) {
		let mut pool = self.free_nids.lock().unwrap();
		if let Some(idx) = pool.lookup(nid) {
			if pool.list[idx].1 == NidState::New {
				pool.list.remove(idx);
				pool.new_count -= 1;
			}
		}
	}

	pub fn free_nid_count(&self) -> usize {
		self.free_nids.lock().unwrap().new_count
	}

	/// First unallocated nid the next checkpoint should advertise.
	pub fn next_free_nid(&self) -> Option<u32> {
		let pool = self.free_nids.lock().unwrap();
		pool.list
			.iter()
			.find(|(_, state)| *state == NidState::New)
			.map(|(nid, _)| *nid)
	}

	pub fn alloc_nid_done(&self, nid: u32) {
		let mut pool = self.free_nids.lock().unwrap();
		if let Some(idx) = pool.lookup(nid) {
			debug_assert_eq!(pool.list[idx].1, NidState::Alloc);
			pool.list.remove(idx);
		}
	}

	pub fn alloc_nid_failed(&self, nid: u32) {
		self.alloc_nid_done(nid);
		self.add_free_nid(nid);
	}
}

/// A located dnode: the node page holding the address slot for one file
/// offset.
pub struct Dnode {
	pub page:        Arc<Page>,
	pub nid:         u32,
	pub ofs_in_node: u32,
}

impl Dnode {
	pub fn data_blkaddr(&self) -> IoResult<u32> {
		let node: NodeBlock = self.page.decode()?;
		Ok(node.data_addr(self.ofs_in_node as usize))
	}
}

/// Offsets and node-offsets of the walk from an inode to the dnode covering
/// `block`. The tree shape is fixed: 923 direct slots, two direct nodes, two
/// double-indirect trees and one triple-indirect tree.
pub(crate) fn get_node_path(block: u64) -> IoResult<(usize, [usize; 4], [u32; 4])> {
	const DIRECT_INDEX: u64 = ADDRS_PER_INODE as u64;
	const DIRECT_BLKS: u64 = ADDRS_PER_BLOCK as u64;
	const DPTRS_PER_BLK: u64 = NIDS_PER_BLOCK as u64;
	const INDIRECT_BLKS: u64 = ADDRS_PER_BLOCK as u64 * NIDS_PER_BLOCK as u64;
	const DINDIRECT_BLKS: u64 = INDIRECT_BLKS * NIDS_PER_BLOCK as u64;

	let mut offset = [0usize; 4];
	let mut noffset = [0u32; 4];
	let mut block = block;

	if block < DIRECT_INDEX {
		offset[0] = block as usize;
		return Ok((0, offset, noffset));
	}
	block -= DIRECT_INDEX;
	if block < DIRECT_BLKS {
		offset[0] = NODE_DIR1_BLOCK;
		noffset[1] = 1;
		offset[1] = block as usize;
		return Ok((1, offset, noffset));
	}
	block -= DIRECT_BLKS;
	if block < DIRECT_BLKS {
		offset[0] = NODE_DIR2_BLOCK;
		noffset[1] = 2;
		offset[1] = block as usize;
		return Ok((1, offset, noffset));
	}
	block -= DIRECT_BLKS;
	if block < INDIRECT_BLKS {
		offset[0] = NODE_IND1_BLOCK;
		noffset[1] = 3;
		offset[1] = (block / DIRECT_BLKS) as usize;
		noffset[2] = 4 + offset[1] as u32;
		offset[2] = (block % DIRECT_BLKS) as usize;
		return Ok((2, offset, noffset));
	}
	block -= INDIRECT_BLKS;
	if block < INDIRECT_BLKS {
		offset[0] = NODE_IND2_BLOCK;
		noffset[1] = 4 + DPTRS_PER_BLK as u32;
		offset[1] = (block / DIRECT_BLKS) as usize;
		noffset[2] = 5 + DPTRS_PER_BLK as u32 + offset[1] as u32;
		offset[2] = (block % DIRECT_BLKS) as usize;
		return Ok((2, offset, noffset));
	}
	block -= INDIRECT_BLKS;
	if block < DINDIRECT_BLKS {
		offset[0] = NODE_DIND_BLOCK;
		noffset[1] = 5 + 2 * DPTRS_PER_BLK as u32;
		offset[1] = (block / INDIRECT_BLKS) as usize;
		noffset[2] = 6 + 2 * DPTRS_PER_BLK as u32 + offset[1] as u32 * (DPTRS_PER_BLK as u32 + 1);
		offset[2] = ((block / DIRECT_BLKS) % DPTRS_PER_BLK) as usize;
		noffset[3] = 7
			+ 2 * DPTRS_PER_BLK as u32
			+ offset[1] as u32 * (DPTRS_PER_BLK as u32 + 1)
			+ offset[2] as u32;
		offset[3] = (block % DIRECT_BLKS) as usize;
		return Ok((3, offset, noffset));
	}
	Err(err!(ERANGE))
}

impl F2fs {
	fn get_current_nat_page(&self, nid: u32) -> IoResult<Arc<Page>> {
		self.get_meta_page(self.nm.current_nat_addr(nid))
	}

	/// NAT copy-on-write: route updates for `nid`'s block to the inactive
	/// copy, flipping the version bit.
	fn get_next_nat_page(&self, nid: u32) -> IoResult<Arc<Page>> {
		let src_off = self.nm.current_nat_addr(nid);
		let dst_off = self.nm.next_nat_addr(src_off);

		let src_page = self.get_meta_page(src_off)?;
		if self.nm.is_updated_nat_page(nid) {
			return Ok(src_page);
		}
		let dst_page = self.grab_meta_page(dst_off);
		dst_page.copy_from(&src_page);
		dst_page.set_uptodate();
		self.meta_cache.set_dirty(&dst_page);
		self.nm.set_to_next_nat(nid);
		Ok(dst_page)
	}

	fn ra_nat_pages(&self, nid: u32) {
		let mut nid = nid;
		for _ in 0..FREE_NID_PAGES {
			if nid >= self.nm.max_nid() {
				nid = 0;
			}
			let _ = self.get_meta_page(self.nm.current_nat_addr(nid));
			nid += NAT_ENTRY_PER_BLOCK as u32;
		}
	}

	/// Resolve a nid: NAT cache, then the curseg journal, then the NAT area.
	pub fn get_node_info(&self, nid: u32) -> IoResult<NodeInfo> {
		if let Some(ni) = self.nm.lookup_nat_cache(nid) {
			return Ok(ni);
		}

		let mut raw = None;
		{
			let mut curseg = self.sm.lock_curseg(CursegType::HotData);
			if let Some(i) =
				crate::segment::lookup_journal_in_cursum(&mut curseg.sum, true, nid, false)
			{
				raw = Some(curseg.sum.nat_in_journal(i).1);
			}
		}
		let raw = match raw {
			Some(ne) => ne,
			None => {
				let start_nid = NodeManager::start_nid(nid);
				let page = self.get_current_nat_page(start_nid)?;
				let block: crate::layout::NatBlock = page.decode()?;
				block.entries[(nid - start_nid) as usize]
			}
		};
		self.nm.cache_nat_entry(nid, &raw);
		Ok(NodeInfo {
			nid,
			ino: raw.ino,
			blk_addr: raw.block_addr,
			version: raw.version,
		})
	}

	/// Fetch a node block into the node cache.
	pub fn get_node_page(&self, nid: u32) -> IoResult<Arc<Page>> {
		self.nm.check_nid_range(nid)?;
		let page = self.node_cache.grab(nid as u64);
		if page.is_uptodate() {
			return Ok(page);
		}

		let ni = self.get_node_info(nid)?;
		if ni.blk_addr == NULL_ADDR {
			self.node_cache.invalidate_range(nid as u64, nid as u64 + 1);
			return Err(err!(ENOENT));
		}
		if ni.blk_addr == NEW_ADDR {
			// reserved but never written; the zeroed page is the content
			page.set_uptodate();
			return Ok(page);
		}

		{
			let mut data = page.write();
			self.bc.read_blk(ni.blk_addr, &mut data[..])?;
		}
		page.set_uptodate();

		let node: NodeBlock = page.decode()?;
		if node.footer.nid != nid {
			log::error!(
				"node page {nid} carries footer nid {}",
				node.footer.nid
			);
			return Err(IoError::new(ErrorKind::InvalidData, "node footer mismatch"));
		}
		Ok(page)
	}

	/// Create a zero-filled node page for a freshly allocated nid.
	pub(crate) fn new_node_page(
		&self,
		vnode: &Vnode,
		nid: u32,
		ofs: u32,
	) -> IoResult<Arc<Page>> {
		if vnode.test_flag(VNODE_NO_ALLOC) {
			return Err(err!(EACCES));
		}

		let page = self.node_cache.grab(nid as u64);
		let old_ni = self.get_node_info(nid)?;
		if old_ni.blk_addr != NULL_ADDR {
			log::error!("new_node_page({nid}): nid already in use");
			return Err(IoError::new(ErrorKind::InvalidData, "nid already mapped"));
		}

		// the inode block itself stays out of the per-inode block count; the
		// on-disk i_blocks covers it via the traversal including the inode
		let counted_owner = if ofs == 0 { None } else { Some(vnode) };
		if let Err(e) = self.sbi.inc_valid_node_count(counted_owner, 1) {
			self.node_cache.invalidate_range(nid as u64, nid as u64 + 1);
			return Err(e);
		}

		let mut node = NodeBlock::zeroed();
		node.fill_footer(nid, vnode.ino(), ofs, true);
		// cold hint steers regular-file dnodes into the warm node log
		node.set_mark(COLD_BIT_SHIFT, !vnode.is_dir());
		page.encode(&node)?;
		page.set_uptodate();

		let new_ni = NodeInfo {
			nid,
			ino: vnode.ino(),
			blk_addr: old_ni.blk_addr,
			version: old_ni.version,
		};
		self.nm.set_node_addr(&new_ni, NEW_ADDR);

		self.node_cache.set_dirty(&page);
		self.mark_vnode_dirty(vnode);
		if ofs == 0 {
			self.sbi.inc_valid_inode_count();
		}
		Ok(page)
	}

	/// Walk the dnode path for `index`. In read-write mode missing interior
	/// nodes are allocated and wired into their parents.
	pub fn get_dnode_of_data(&self, vnode: &Vnode, index: u64, ro: bool) -> IoResult<Dnode> {
		let (level, offset, noffset) = get_node_path(index)?;

		let mut nids = [0u32; 4];
		nids[0] = vnode.ino();
		let mut parent = self.get_node_page(nids[0])?;

		if level > 0 {
			let node: NodeBlock = parent.decode()?;
			nids[1] = node.child_nid(offset[0], true);
		}

		let mut npage = parent.clone();
		for i in 1..=level {
			if nids[i] == NULL_NID && !ro {
				let nid = self.alloc_nid()?;
				nids[i] = nid;
				let child = match self.new_node_page(vnode, nid, noffset[i]) {
					Ok(page) => page,
					Err(e) => {
						self.nm.alloc_nid_failed(nid);
						return Err(e);
					}
				};
				{
					let mut pnode: NodeBlock = parent.decode()?;
					pnode.set_child_nid(offset[i - 1], i == 1, nid);
					parent.encode(&pnode)?;
					self.node_cache.set_dirty(&parent);
				}
				self.nm.alloc_nid_done(nid);
				npage = child;
			} else if nids[i] == NULL_NID {
				return Err(err!(ENOENT));
			} else {
				npage = self.get_node_page(nids[i])?;
			}

			if i < level {
				parent = npage.clone();
				let node: NodeBlock = parent.decode()?;
				nids[i + 1] = node.child_nid(offset[i], false);
			}
		}

		Ok(Dnode {
			page:        npage,
			nid:         nids[level],
			ofs_in_node: offset[level] as u32,
		})
	}

	/// Release one node block: SIT invalidation, NAT nulling, counters.
	fn truncate_node(&self, vnode: &Vnode, dn: &Dnode) -> IoResult<()> {
		let ni = self.get_node_info(dn.nid)?;
		if ni.blk_addr == NULL_ADDR {
			log::error!("truncate_node({}): already free", dn.nid);
			return Err(IoError::new(ErrorKind::InvalidData, "double node free"));
		}
		if ni.blk_addr != NEW_ADDR {
			self.sm.invalidate_blocks(ni.blk_addr);
		}
		let counted_owner = if dn.nid == vnode.ino() {
			None
		} else {
			Some(vnode)
		};
		self.sbi.dec_valid_node_count(counted_owner, 1);
		self.nm.set_node_addr(&ni, NULL_ADDR);

		if dn.nid == vnode.ino() {
			self.remove_orphan_inode(dn.nid);
			self.sbi.dec_valid_inode_count();
		} else {
			self.mark_vnode_dirty(vnode);
		}

		self.node_cache.clear_dirty_for_io(&dn.page);
		dn.page.clear_uptodate();
		self.node_cache
			.invalidate_range(dn.nid as u64, dn.nid as u64 + 1);
		self.sbi.set_dirty();
		Ok(())
	}

	/// Free a whole dnode with its data blocks. Returns the number of node
	/// offsets consumed, matching the tree walk of the caller.
	fn truncate_dnode(&self, vnode: &Vnode, nid: u32) -> IoResult<usize> {
		if nid == NULL_NID {
			return Ok(1);
		}
		let page = match self.get_node_page(nid) {
			Ok(page) => page,
			Err(e) if e.raw_os_error() == Some(libc::ENOENT) => return Ok(1),
			Err(e) => return Err(e),
		};
		let dn = Dnode {
			page,
			nid,
			ofs_in_node: 0,
		};
		self.truncate_data_blocks(vnode, &dn)?;
		self.truncate_node(vnode, &dn)?;
		Ok(1)
	}

	fn truncate_nodes(
		&self,
		vnode: &Vnode,
		nid: u32,
		nofs: u32,
		ofs: usize,
		depth: usize,
	) -> IoResult<usize> {
		if nid == NULL_NID {
			return Ok(NIDS_PER_BLOCK + 1);
		}
		let page = self.get_node_page(nid)?;
		let mut node: NodeBlock = page.decode()?;
		let mut freed = 0usize;

		if depth < 3 {
			for i in ofs..NIDS_PER_BLOCK {
				freed += 1;
				let child_nid = node.child_nid(i, false);
				if child_nid == NULL_NID {
					continue;
				}
				self.truncate_dnode(vnode, child_nid)?;
				node.set_child_nid(i, false, NULL_NID);
				page.encode(&node)?;
				self.node_cache.set_dirty(&page);
			}
		} else {
			let mut child_nofs = nofs + ofs as u32 * (NIDS_PER_BLOCK as u32 + 1) + 1;
			for i in ofs..NIDS_PER_BLOCK {
				let child_nid = node.child_nid(i, false);
				if child_nid == NULL_NID {
					child_nofs += NIDS_PER_BLOCK as u32 + 1;
					continue;
				}
				let ret = self.truncate_nodes(vnode, child_nid, child_nofs, 0, depth - 1)?;
				if ret == NIDS_PER_BLOCK + 1 {
					node.set_child_nid(i, false, NULL_NID);
					page.encode(&node)?;
					self.node_cache.set_dirty(&page);
					child_nofs += ret as u32;
				}
			}
			freed = child_nofs as usize;
		}

		if ofs == 0 {
			let dn = Dnode {
				page,
				nid,
				ofs_in_node: 0,
			};
			self.truncate_node(vnode, &dn)?;
			freed += 1;
		}
		Ok(freed)
	}

	fn truncate_partial_nodes(
		&self,
		vnode: &Vnode,
		inode_node: &NodeBlock,
		offset: &mut [usize; 4],
		depth: usize,
	) -> IoResult<()> {
		let mut nids = [0u32; 3];
		let idx = depth - 2;

		nids[0] = inode_node.child_nid(offset[0], true);
		if nids[0] == NULL_NID {
			return Ok(());
		}

		let mut pages: Vec<Arc<Page>> = Vec::new();
		for i in 0..depth - 1 {
			let page = self.get_node_page(nids[i])?;
			let node: NodeBlock = page.decode()?;
			nids[i + 1] = node.child_nid(offset[i + 1], false);
			pages.push(page);
		}

		// free the direct nodes hanging off the partial indirect node
		let target = pages[idx].clone();
		let mut node: NodeBlock = target.decode()?;
		for i in offset[depth - 1]..NIDS_PER_BLOCK {
			let child_nid = node.child_nid(i, false);
			if child_nid == NULL_NID {
				continue;
			}
			self.truncate_dnode(vnode, child_nid)?;
			node.set_child_nid(i, false, NULL_NID);
			target.encode(&node)?;
			self.node_cache.set_dirty(&target);
		}

		if offset[depth - 1] == 0 {
			let dn = Dnode {
				page:        target,
				nid:         nids[idx],
				ofs_in_node: 0,
			};
			self.truncate_node(vnode, &dn)?;
		}
		offset[idx] += 1;
		offset[depth - 1] = 0;
		Ok(())
	}

	/// Free every data and node block at or beyond file offset `from`.
	pub(crate) fn truncate_inode_blocks(&self, vnode: &Vnode, from: u64) -> IoResult<()> {
		let (level, mut offset, noffset) = get_node_path(from)?;
		let ipage = self.get_node_page(vnode.ino())?;
		let inode_node: NodeBlock = ipage.decode()?;

		let mut nofs: u32;
		match level {
			0 | 1 => {
				nofs = noffset[1];
			}
			2 => {
				nofs = noffset[1];
				if offset[level - 1] != 0 {
					match self.truncate_partial_nodes(vnode, &inode_node, &mut offset, level) {
						Ok(()) => {}
						Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
						Err(e) => return Err(e),
					}
					nofs += 1 + NIDS_PER_BLOCK as u32;
				}
			}
			3 => {
				nofs = 5 + 2 * NIDS_PER_BLOCK as u32;
				if offset[level - 1] != 0 {
					match self.truncate_partial_nodes(vnode, &inode_node, &mut offset, level) {
						Ok(()) => {}
						Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
						Err(e) => return Err(e),
					}
				}
			}
			_ => unreachable!("node path level {level}"),
		}

		loop {
			// re-read: lower levels may have rewritten the inode nid slots
			let inode_node: NodeBlock = ipage.decode()?;
			let nid = inode_node.child_nid(offset[0], true);
			let freed = match offset[0] {
				NODE_DIR1_BLOCK | NODE_DIR2_BLOCK => self.truncate_dnode(vnode, nid),
				NODE_IND1_BLOCK | NODE_IND2_BLOCK => {
					self.truncate_nodes(vnode, nid, nofs, offset[1], 2)
				}
				NODE_DIND_BLOCK => self.truncate_nodes(vnode, nid, nofs, offset[1], 3),
				_ => break,
			};
			let freed = match freed {
				Ok(n) => n,
				Err(e) if e.raw_os_error() == Some(libc::ENOENT) => 0,
				Err(e) => return Err(e),
			};
			let done = offset[0] == NODE_DIND_BLOCK;
			if offset[1] == 0 && nid != NULL_NID {
				let mut node: NodeBlock = ipage.decode()?;
				node.set_child_nid(offset[0], true, NULL_NID);
				ipage.encode(&node)?;
				self.node_cache.set_dirty(&ipage);
			}
			offset[1] = 0;
			offset[0] += 1;
			nofs += freed as u32;
			if done {
				break;
			}
		}
		Ok(())
	}

	/// Tear down the inode's own node page (and its xattr node) once all
	/// data is gone.
	pub(crate) fn remove_inode_page(&self, vnode: &Vnode) -> IoResult<()> {
		let ino = vnode.ino();
		let page = self.get_node_page(ino)?;

		let xattr_nid = vnode.info().xattr_nid;
		if xattr_nid != NULL_NID {
			let npage = self.get_node_page(xattr_nid)?;
			vnode.info_mut().xattr_nid = NULL_NID;
			let dn = Dnode {
				page:        npage,
				nid:         xattr_nid,
				ofs_in_node: 0,
			};
			self.truncate_node(vnode, &dn)?;
		}

		let blocks = vnode.blocks();
		if blocks != 0 {
			log::error!("inode {ino} still holds {blocks} blocks");
			return Err(IoError::new(ErrorKind::InvalidData, "inode accounting"));
		}
		let dn = Dnode {
			page,
			nid: ino,
			ofs_in_node: 0,
		};
		self.truncate_node(vnode, &dn)?;
		Ok(())
	}

	/// Write one dirty node page to the current node log.
	pub(crate) fn write_node_page(&self, page: &Arc<Page>) -> IoResult<()> {
		let nid = page.index() as u32;
		let ni = self.get_node_info(nid)?;

		if ni.blk_addr == NULL_ADDR {
			// already truncated; the dirty bit was cleared by the caller
			return Ok(());
		}

		let _node_op = self.sbi.node_lock.read().unwrap();
		self.node_cache.set_writeback(page);
		let new_addr = self.write_node_block(page, nid, ni.blk_addr)?;
		self.nm.set_node_addr(&NodeInfo { nid, ..ni }, new_addr);
		self.node_cache.clear_writeback(page);
		Ok(())
	}

	/// Flush every dirty node page.
	pub(crate) fn flush_dirty_node_pages(&self) -> IoResult<usize> {
		let mut written = 0;
		for index in self.node_cache.dirty_indices() {
			let page = match self.node_cache.find(index) {
				Some(page) => page,
				None => continue,
			};
			if !page.try_lock() {
				continue;
			}
			if self.node_cache.clear_dirty_for_io(&page) {
				// fsync marks are only meaningful on an fsync path
				let mut node: NodeBlock = page.decode()?;
				if node.is_fsync() || node.is_dent() {
					node.set_mark(FSYNC_BIT_SHIFT, false);
					node.set_mark(DENT_BIT_SHIFT, false);
					page.encode(&node)?;
				}
				if let Err(e) = self.write_node_page(&page) {
					page.unlock();
					return Err(e);
				}
				written += 1;
			}
			page.unlock();
		}
		Ok(written)
	}

	/// Fsync fast path: push only this inode's dirty node pages, with the
	/// fsync (and, for uncheckpointed parents, dentry) markers that recovery
	/// replays.
	pub(crate) fn fsync_node_pages(&self, vnode: &Vnode) -> IoResult<usize> {
		let ino = vnode.ino();
		let dent_mark = !self.nm.is_checkpointed_node(ino);
		let mut written = 0;

		for index in self.node_cache.dirty_indices() {
			let page = match self.node_cache.find(index) {
				Some(page) => page,
				None => continue,
			};
			let mut node: NodeBlock = page.decode()?;
			if node.footer.ino != ino {
				continue;
			}
			if self.node_cache.clear_dirty_for_io(&page) {
				if node.is_dnode() {
					node.set_mark(FSYNC_BIT_SHIFT, true);
					if node.is_inode() {
						node.set_mark(DENT_BIT_SHIFT, dent_mark);
					}
				} else {
					node.set_mark(FSYNC_BIT_SHIFT, false);
					node.set_mark(DENT_BIT_SHIFT, false);
				}
				page.encode(&node)?;
				self.write_node_page(&page)?;
				written += 1;
			}
		}
		Ok(written)
	}

	/// Rebuild a node segment's summary by reading the nids out of the node
	/// blocks themselves.
	pub(crate) fn restore_node_summary(
		&self,
		segno: u32,
		sum: &mut crate::layout::SummaryBlock,
	) -> IoResult<()> {
		let mut addr = self.sm.start_block(segno);
		let mut buf = vec![0u8; crate::layout::BLOCK_SIZE];
		for i in 0..self.sbi.blocks_per_seg() as usize {
			self.bc.read_blk(addr, &mut buf)?;
			let node: NodeBlock = crate::layout::decode(&buf)?;
			sum.entries[i] = crate::layout::Summary::new(node.footer.nid, 0, 0);
			addr += 1;
		}
		Ok(())
	}

	// -- free nid management -------------------------------------------------

	fn scan_nat_page(&self, block: &crate::layout::NatBlock, start_nid: u32) -> usize {
		let mut added = 0;
		let mut nid = start_nid;
		let mut i = (start_nid % NAT_ENTRY_PER_BLOCK as u32) as usize;
		if nid == 0 {
			nid += 1;
			i += 1;
		}
		while i < NAT_ENTRY_PER_BLOCK {
			if nid >= self.nm.max_nid() {
				break;
			}
			if block.entries[i].block_addr == NULL_ADDR && self.nm.add_free_nid(nid) {
				added += 1;
			}
			i += 1;
			nid += 1;
		}
		added
	}

	/// Refill the free-nid pool by scanning the NAT area, the curseg journal
	/// and the NAT cache.
	fn build_free_nids(&self) -> IoResult<()> {
		let mut nid = self.nm.next_scan_nid.load(Ordering::Acquire);
		let init_scan = nid;
		let mut cycled = false;
		let mut found = 0usize;

		self.ra_nat_pages(nid);

		loop {
			let start = NodeManager::start_nid(nid);
			let page = self.get_current_nat_page(start)?;
			let block: crate::layout::NatBlock = page.decode()?;
			found += self.scan_nat_page(&block, nid);

			nid = start + NAT_ENTRY_PER_BLOCK as u32;
			if nid >= self.nm.max_nid() {
				nid = 0;
				cycled = true;
			}
			if found > MAX_FREE_NIDS {
				break;
			}
			if cycled && init_scan <= nid {
				break;
			}
		}
		self.nm.next_scan_nid.store(nid, Ordering::Release);

		// journalled entries override what the scan saw on disk
		{
			let mut curseg = self.sm.lock_curseg(CursegType::HotData);
			let n = curseg.sum.journal_count();
			for i in 0..n {
				let (jnid, ne) = curseg.sum.nat_in_journal(i);
				if ne.block_addr == NULL_ADDR {
					self.nm.add_free_nid(jnid);
				} else {
					self.nm.remove_free_nid(jnid);
				}
			}
			drop(curseg);
		}

		// and the NAT cache overrides both: a nid can look free on disk
		// while its allocation has simply not been flushed yet
		let candidates: Vec<u32> = {
			let pool = self.nm.free_nids.lock().unwrap();
			pool.list.iter().map(|(nid, _)| *nid).collect()
		};
		for nid in candidates {
			if let Some(ni) = self.nm.lookup_nat_cache(nid) {
				if ni.blk_addr != NULL_ADDR {
					self.nm.remove_free_nid(nid);
				}
			}
		}
		Ok(())
	}

	/// Take a free nid for a new node.
	pub(crate) fn alloc_nid(&self) -> IoResult<u32> {
		{
			let _build = self.nm.build_lock.lock().unwrap();
			if self.nm.free_nid_count() == 0 {
				self.build_free_nids()?;
			}
		}

		let mut guard = self.nm.free_nids.lock().unwrap();
		let pool = &mut *guard;
		for entry in pool.list.iter_mut() {
			if entry.1 == NidState::New {
				entry.1 = NidState::Alloc;
				pool.new_count -= 1;
				return Ok(entry.0);
			}
		}
		Err(err!(ENOSPC))
	}

	pub(crate) fn build_node_manager(&self) -> IoResult<()> {
		let _build = self.nm.build_lock.lock().unwrap();
		self.build_free_nids()
	}

	// -- NAT flush at checkpoint --------------------------------------------

	/// When the journal cannot absorb the dirty set, spill its entries into
	/// the NAT cache so everything goes to NAT blocks this time.
	fn flush_nats_in_journal(&self) -> bool {
		let mut curseg = self.sm.lock_curseg(CursegType::HotData);
		{
			let nat = self.nm.nat.read().unwrap();
			if curseg.sum.journal_count() + nat.dirty.len() <= crate::layout::NAT_JOURNAL_ENTRIES
			{
				return false;
			}
		}

		let n = curseg.sum.journal_count();
		for i in 0..n {
			let (nid, raw) = curseg.sum.nat_in_journal(i);
			let mut nat = self.nm.nat.write().unwrap();
			let entry = nat.entries.entry(nid).or_insert(NatCacheEntry {
				ino:          raw.ino,
				blk_addr:     raw.block_addr,
				version:      raw.version,
				checkpointed: true,
				dirty:        false,
			});
			entry.dirty = true;
			nat.dirty.insert(nid);
		}
		curseg.sum.set_journal_count(0);
		true
	}

	/// Write every dirty NAT entry to the journal or the NAT area; free the
	/// nids that died on the way.
	pub(crate) fn flush_nat_entries(&self) -> IoResult<()> {
		let flushed = self.flush_nats_in_journal();
		let dirty_nids: Vec<u32> = {
			let nat = self.nm.nat.read().unwrap();
			nat.dirty.iter().copied().collect()
		};

		let mut page: Option<Arc<Page>> = None;
		let mut nat_block = crate::layout::NatBlock::zeroed();
		let mut start_nid = 0u32;
		let mut end_nid = 0u32;

		for nid in dirty_nids {
			let entry = {
				let nat = self.nm.nat.read().unwrap();
				match nat.entries.get(&nid) {
					Some(e) => e.clone(),
					None => continue,
				}
			};
			if entry.blk_addr == NEW_ADDR {
				continue;
			}

			let raw = RawNatEntry {
				version:    entry.version,
				ino:        entry.ino,
				block_addr: entry.blk_addr,
			};

			let mut slot = None;
			if !flushed {
				let mut curseg = self.sm.lock_curseg(CursegType::HotData);
				slot = crate::segment::lookup_journal_in_cursum(&mut curseg.sum, true, nid, true);
				if let Some(i) = slot {
					curseg.sum.set_nat_in_journal(i, nid, &raw);
				}
			}
			if slot.is_none() {
				if page.is_none() || nid < start_nid || nid > end_nid {
					if let Some(p) = page.take() {
						p.encode(&nat_block)?;
						self.meta_cache.set_dirty(&p);
					}
					start_nid = NodeManager::start_nid(nid);
					end_nid = start_nid + NAT_ENTRY_PER_BLOCK as u32 - 1;
					let p = self.get_next_nat_page(start_nid)?;
					nat_block = p.decode()?;
					page = Some(p);
				}
				nat_block.entries[(nid - start_nid) as usize] = raw;
			}

			{
				let mut nat = self.nm.nat.write().unwrap();
				nat.dirty.remove(&nid);
				if entry.blk_addr == NULL_ADDR {
					nat.entries.remove(&nid);
				} else if let Some(e) = nat.entries.get_mut(&nid) {
					e.dirty = false;
					e.checkpointed = true;
				}
			}
			if entry.blk_addr == NULL_ADDR {
				// the nid is reusable right away
				self.nm.add_free_nid(nid);
			}
		}
		if let Some(p) = page.take() {
			p.encode(&nat_block)?;
			self.meta_cache.set_dirty(&p);
		}

		let excess = {
			let nat = self.nm.nat.read().unwrap();
			nat.entries.len().saturating_sub(NM_WOUT_THRESHOLD)
		};
		self.nm.try_to_free_nats(excess);
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn node_path_levels() {
		// direct
		let (level, offset, _) = get_node_path(0).unwrap();
		assert_eq!((level, offset[0]), (0, 0));
		let (level, offset, _) = get_node_path(922).unwrap();
		assert_eq!((level, offset[0]), (0, 922));

		// first direct node
		let (level, offset, noffset) = get_node_path(923).unwrap();
		assert_eq!(level, 1);
		assert_eq!(offset[0], NODE_DIR1_BLOCK);
		assert_eq!(offset[1], 0);
		assert_eq!(noffset[1], 1);

		// second direct node
		let (level, offset, noffset) = get_node_path(923 + 1018).unwrap();
		assert_eq!(level, 1);
		assert_eq!(offset[0], NODE_DIR2_BLOCK);
		assert_eq!(noffset[1], 2);

		// first indirect tree
		let (level, offset, noffset) = get_node_path(923 + 2 * 1018).unwrap();
		assert_eq!(level, 2);
		assert_eq!(offset[0], NODE_IND1_BLOCK);
		assert_eq!(offset[1], 0);
		assert_eq!(offset[2], 0);
		assert_eq!(noffset[1], 3);
		assert_eq!(noffset[2], 4);

		// triple-indirect tree
		let base = 923u64 + 2 * 1018 + 2 * 1018 * 1018;
		let (level, offset, noffset) = get_node_path(base).unwrap();
		assert_eq!(level, 3);
		assert_eq!(offset[0], NODE_DIND_BLOCK);
		assert_eq!(noffset[1], 5 + 2 * 1018);
		assert_eq!(noffset[2], 6 + 2 * 1018);
		assert_eq!(noffset[3], 7 + 2 * 1018);
		assert_eq!(offset[3], 0);

		// beyond the tree
		let max = base + 1018u64 * 1018 * 1018;
		assert!(get_node_path(max).is_err());
	}

	fn test_nm() -> NodeManager {
		let mut raw = SuperBlock::zeroed();
		raw.log_blocks_per_seg = 9;
		raw.segment_count_nat = 2;
		raw.nat_blkaddr = 3072;
		let mut ckpt = Checkpoint::zeroed();
		ckpt.nat_ver_bitmap_bytesize = 64;
		ckpt.next_free_nid = 4;
		NodeManager::new(&raw, &ckpt)
	}

	#[test]
	fn nat_addressing_flips_with_bitmap() {
		let nm = test_nm();
		let a = nm.current_nat_addr(0);
		assert_eq!(a, 3072);
		nm.set_to_next_nat(0);
		let b = nm.current_nat_addr(0);
		assert_eq!(b, 3072 + 512);
		assert_eq!(nm.next_nat_addr(b), a);
	}

	#[test]
	fn set_node_addr_versions_on_free() {
		let nm = test_nm();
		let ni = NodeInfo {
			nid:      7,
			ino:      7,
			blk_addr: 5000,
			version:  0,
		};
		nm.cache_nat_entry(
			7,
			&RawNatEntry {
				version:    0,
				ino:        7,
				block_addr: 5000,
			},
		);
		assert!(nm.is_checkpointed_node(7));
		nm.set_node_addr(&ni, NULL_ADDR);
		let got = nm.lookup_nat_cache(7).unwrap();
		assert_eq!(got.blk_addr, NULL_ADDR);
		assert_eq!(got.version, 1);
	}

	#[test]
	fn free_nid_pool_states() {
		let nm = test_nm();
		assert!(nm.add_free_nid(10));
		assert!(!nm.add_free_nid(10));
		assert_eq!(nm.free_nid_count(), 1);
		assert_eq!(nm.next_free_nid(), Some(10));
		nm.remove_free_nid(10);
		assert_eq!(nm.free_nid_count(), 0);
		assert!(!nm.add_free_nid(0));
	}
}
