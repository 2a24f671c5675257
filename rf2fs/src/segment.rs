use std::{
	io::Result as IoResult,
	sync::{
		atomic::{AtomicU32, Ordering},
		Mutex, MutexGuard, RwLock,
	},
	time::{SystemTime, UNIX_EPOCH},
};

use crate::{
	bits,
	layout::{
		Checkpoint, NodeBlock, SitBlock, SitEntry, SummaryBlock, SuperBlock, Summary,
		BLOCK_SIZE, CP_COMPACT_SUM_FLAG, CP_UMOUNT_FLAG, ENTRIES_IN_SUM, NEW_ADDR,
		NR_CURSEG_DATA_TYPE, NR_CURSEG_NODE_TYPE, NR_CURSEG_TYPE, NULL_ADDR, NULL_SEGNO,
		SIT_ENTRY_PER_BLOCK, SIT_JOURNAL_ENTRIES, SIT_VBLOCK_MAP_SIZE, SIT_VBLOCKS_SHIFT,
		SUMMARY_SIZE, SUM_JOURNAL_SIZE, SUM_TYPE_DATA, SUM_TYPE_NODE, NAT_JOURNAL_ENTRIES,
	},
	mount::F2fs,
	page::Page,
	vnode::Vnode,
};

pub const ALLOC_LFS: u8 = 0;
pub const ALLOC_SSR: u8 = 1;

pub const MAX_SEARCH_LIMIT: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcType {
	Bg = 0,
	Fg = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
	CostBenefit,
	Greedy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
	Lfs,
	Ssr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocDirection {
	Right,
	Left,
}

/// The six write points: {hot,warm,cold} x {data,node}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursegType {
	HotData = 0,
	WarmData = 1,
	ColdData = 2,
	HotNode = 3,
	WarmNode = 4,
	ColdNode = 5,
}

impl CursegType {
	pub fn from_index(i: usize) -> Self {
		match i {
			0 => Self::HotData,
			1 => Self::WarmData,
			2 => Self::ColdData,
			3 => Self::HotNode,
			4 => Self::WarmNode,
			5 => Self::ColdNode,
			_ => unreachable!("curseg index {i}"),
		}
	}

	pub fn index(self) -> usize {
		self as usize
	}

	pub fn is_data(self) -> bool {
		(self as usize) < NR_CURSEG_DATA_TYPE
	}

	pub fn is_node(self) -> bool {
		!self.is_data()
	}
}

// Dirty-seglist partitions; the first six match the curseg types.
pub const DIRTY: usize = 6;
pub const PRE: usize = 7;
pub const NR_DIRTY_TYPE: usize = 8;

pub struct SegmentEntry {
	pub cur_valid_map:     [u8; SIT_VBLOCK_MAP_SIZE],
	pub ckpt_valid_map:    [u8; SIT_VBLOCK_MAP_SIZE],
	pub valid_blocks:      u16,
	pub ckpt_valid_blocks: u16,
	pub seg_type:          u8,
	pub mtime:             u64,
}

impl SegmentEntry {
	fn new() -> Self {
		Self {
			cur_valid_map:     [0; SIT_VBLOCK_MAP_SIZE],
			ckpt_valid_map:    [0; SIT_VBLOCK_MAP_SIZE],
			valid_blocks:      0,
			ckpt_valid_blocks: 0,
			seg_type:          0,
			mtime:             0,
		}
	}

	pub fn load(&mut self, raw: &SitEntry) {
		self.valid_blocks = raw.valid_blocks();
		self.ckpt_valid_blocks = raw.valid_blocks();
		self.cur_valid_map = raw.valid_map;
		self.ckpt_valid_map = raw.valid_map;
		self.seg_type = raw.seg_type();
		self.mtime = raw.mtime;
	}

	/// Serialise to a raw SIT entry; the checkpointed view catches up with
	/// the current one.
	pub fn store(&mut self) -> SitEntry {
		let raw = SitEntry {
			vblocks:   ((self.seg_type as u16) << SIT_VBLOCKS_SHIFT) | self.valid_blocks,
			valid_map: self.cur_valid_map,
			mtime:     self.mtime,
		};
		self.ckpt_valid_map = self.cur_valid_map;
		self.ckpt_valid_blocks = self.valid_blocks;
		raw
	}
}

pub struct SitInfo {
	pub sentries:              Vec<SegmentEntry>,
	pub sec_entries:           Vec<u32>,
	pub dirty_sentries_bitmap: Vec<u8>,
	pub dirty_sentries:        u32,
	/// Version bitmap choosing the live copy of each SIT block.
	pub sit_bitmap:            Vec<u8>,
	pub written_valid_blocks:  u32,
	pub min_mtime:             u64,
	pub max_mtime:             u64,
}

pub struct FreeSegmapInfo {
	pub free_segmap:   Vec<u8>,
	pub free_secmap:   Vec<u8>,
	pub free_segments: u32,
	pub free_sections: u32,
}

pub struct DirtySeglistInfo {
	pub dirty_segmap:  [Vec<u8>; NR_DIRTY_TYPE],
	pub nr_dirty:      [u32; NR_DIRTY_TYPE],
	pub victim_secmap: Vec<u8>,
}

pub struct CursegInfo {
	pub segno:      u32,
	pub zone:       u32,
	pub next_segno: u32,
	pub next_blkoff: u16,
	pub alloc_type: u8,
	pub sum:        Box<SummaryBlock>,
}

impl CursegInfo {
	fn new() -> Self {
		Self {
			segno:       NULL_SEGNO,
			zone:        0,
			next_segno:  NULL_SEGNO,
			next_blkoff: 0,
			alloc_type:  ALLOC_LFS,
			sum:         Box::new(SummaryBlock::zeroed()),
		}
	}
}

/// Journal slot search inside a curseg summary block. `alloc` appends a new
/// slot when the key is absent and space remains.
pub fn lookup_journal_in_cursum(
	sum: &mut SummaryBlock,
	nat: bool,
	val: u32,
	alloc: bool,
) -> Option<usize> {
	let n = sum.journal_count();
	if nat {
		for i in 0..n {
			if sum.nat_in_journal(i).0 == val {
				return Some(i);
			}
		}
		if alloc && n < NAT_JOURNAL_ENTRIES {
			sum.set_journal_count(n + 1);
			return Some(n);
		}
	} else {
		for i in 0..n {
			if sum.sit_in_journal(i).0 == val {
				return Some(i);
			}
		}
		if alloc && n < SIT_JOURNAL_ENTRIES {
			sum.set_journal_count(n + 1);
			return Some(n);
		}
	}
	None
}

/// Free-space bookkeeping and the six write points.
///
/// Lock order within this module: curseg mutex -> SIT -> dirty seglist ->
/// free segmap. Current segment numbers and zones are mirrored into atomics
/// so classification never reaches back into a curseg mutex.
pub struct SegmentManager {
	seg0_blkaddr:  u32,
	main_blkaddr:  u32,
	ssa_blkaddr:   u32,
	sit_base_addr: u32,
	sit_blocks:    u32,
	start_segno:   u32,

	segment_count:      u32,
	main_segments:      u32,
	reserved_segments:  u32,
	ovp_segments:       u32,
	blocks_per_seg:     u32,
	log_blocks_per_seg: u32,
	segs_per_sec:       u32,
	secs_per_zone:      u32,
	total_sections:     u32,

	pub(crate) sit:     Mutex<SitInfo>,
	pub(crate) free:    RwLock<FreeSegmapInfo>,
	pub(crate) dirty:   Mutex<DirtySeglistInfo>,
	cursegs:            [Mutex<CursegInfo>; NR_CURSEG_TYPE],
	curseg_segno_cache: [AtomicU32; NR_CURSEG_TYPE],
	curseg_zone_cache:  [AtomicU32; NR_CURSEG_TYPE],

	mounted_time: u64,
	elapsed_base: u64,
}

impl SegmentManager {
	pub fn new(raw: &SuperBlock, ckpt: &Checkpoint) -> Self {
		let main_segments = raw.segment_count_main;
		let segs = main_segments as usize;
		let seg_bitmap = vec![0u8; bits::bitmap_size(segs)];
		let total_sections = raw.section_count;
		let sec_bitmap = vec![0u8; bits::bitmap_size(total_sections as usize)];

		let mut sentries = Vec::with_capacity(segs);
		sentries.resize_with(segs, SegmentEntry::new);

		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs();

		Self {
			seg0_blkaddr: raw.segment0_blkaddr,
			main_blkaddr: raw.main_blkaddr,
			ssa_blkaddr: raw.ssa_blkaddr,
			sit_base_addr: raw.sit_blkaddr,
			sit_blocks: (raw.segment_count_sit / 2) << raw.log_blocks_per_seg,
			start_segno: (raw.main_blkaddr - raw.segment0_blkaddr) >> raw.log_blocks_per_seg,
			segment_count: raw.segment_count,
			main_segments,
			reserved_segments: ckpt.rsvd_segment_count,
			ovp_segments: ckpt.overprov_segment_count,
			blocks_per_seg: 1 << raw.log_blocks_per_seg,
			log_blocks_per_seg: raw.log_blocks_per_seg,
			segs_per_sec: raw.segs_per_sec,
			secs_per_zone: raw.secs_per_zone,
			total_sections,
			sit: Mutex::new(SitInfo {
				sentries,
				sec_entries: vec![0; total_sections as usize],
				dirty_sentries_bitmap: vec![0; bits::bitmap_size(segs)],
				dirty_sentries: 0,
				sit_bitmap: ckpt.sit_bitmap().to_vec(),
				written_valid_blocks: ckpt.valid_block_count as u32,
				min_mtime: 0,
				max_mtime: 0,
			}),
			free: RwLock::new(FreeSegmapInfo {
				free_segmap:   vec![0xff; seg_bitmap.len()],
				free_secmap:   vec![0xff; sec_bitmap.len()],
				free_segments: 0,
				free_sections: 0,
			}),
			dirty: Mutex::new(DirtySeglistInfo {
				dirty_segmap:  [
					vec![0; seg_bitmap.len()],
					vec![0; seg_bitmap.len()],
					vec![0; seg_bitmap.len()],
					vec![0; seg_bitmap.len()],
					vec![0; seg_bitmap.len()],
					vec![0; seg_bitmap.len()],
					vec![0; seg_bitmap.len()],
					vec![0; seg_bitmap.len()],
				],
				nr_dirty:      [0; NR_DIRTY_TYPE],
				victim_secmap: vec![0; sec_bitmap.len()],
			}),
			cursegs: [
				Mutex::new(CursegInfo::new()),
				Mutex::new(CursegInfo::new()),
				Mutex::new(CursegInfo::new()),
				Mutex::new(CursegInfo::new()),
				Mutex::new(CursegInfo::new()),
				Mutex::new(CursegInfo::new()),
			],
			curseg_segno_cache: [
				AtomicU32::new(NULL_SEGNO),
				AtomicU32::new(NULL_SEGNO),
				AtomicU32::new(NULL_SEGNO),
				AtomicU32::new(NULL_SEGNO),
				AtomicU32::new(NULL_SEGNO),
				AtomicU32::new(NULL_SEGNO),
			],
			curseg_zone_cache: [
				AtomicU32::new(0),
				AtomicU32::new(0),
				AtomicU32::new(0),
				AtomicU32::new(0),
				AtomicU32::new(0),
				AtomicU32::new(0),
			],
			mounted_time: now,
			elapsed_base: ckpt.elapsed_time,
		}
	}

	pub fn main_segments(&self) -> u32 {
		self.main_segments
	}

	pub fn main_blkaddr(&self) -> u32 {
		self.main_blkaddr
	}

	pub fn ssa_blkaddr(&self) -> u32 {
		self.ssa_blkaddr
	}

	pub fn reserved_segments(&self) -> u32 {
		self.reserved_segments
	}

	pub fn ovp_segments(&self) -> u32 {
		self.ovp_segments
	}

	pub fn blocks_per_seg(&self) -> u32 {
		self.blocks_per_seg
	}

	pub fn segs_per_sec(&self) -> u32 {
		self.segs_per_sec
	}

	pub(crate) fn curseg(&self, t: CursegType) -> &Mutex<CursegInfo> {
		&self.cursegs[t.index()]
	}

	pub(crate) fn lock_curseg(&self, t: CursegType) -> MutexGuard<'_, CursegInfo> {
		self.cursegs[t.index()].lock().unwrap()
	}

	pub fn curseg_segno(&self, t: CursegType) -> u32 {
		self.curseg_segno_cache[t.index()].load(Ordering::Acquire)
	}

	pub(crate) fn cache_curseg_position(&self, t: CursegType, segno: u32, zone: u32) {
		self.curseg_segno_cache[t.index()].store(segno, Ordering::Release);
		self.curseg_zone_cache[t.index()].store(zone, Ordering::Release);
	}

	pub fn is_cur_seg(&self, segno: u32) -> bool {
		(0..NR_CURSEG_TYPE)
			.any(|i| self.curseg_segno_cache[i].load(Ordering::Acquire) == segno)
	}

	pub fn is_cur_sec(&self, secno: u32) -> bool {
		(0..NR_CURSEG_TYPE).any(|i| {
			let segno = self.curseg_segno_cache[i].load(Ordering::Acquire);
			segno != NULL_SEGNO && segno / self.segs_per_sec == secno
		})
	}

	fn is_cur_zone(&self, zoneno: u32) -> bool {
		(0..NR_CURSEG_TYPE).any(|i| {
			self.curseg_segno_cache[i].load(Ordering::Acquire) != NULL_SEGNO
				&& self.curseg_zone_cache[i].load(Ordering::Acquire) == zoneno
		})
	}

	pub fn start_block(&self, segno: u32) -> u32 {
		self.seg0_blkaddr + ((self.start_segno + segno) << self.log_blocks_per_seg)
	}

	/// Main-area segment number owning `blk_addr`, or `NULL_SEGNO`.
	pub fn segno_of(&self, blk_addr: u32) -> u32 {
		if blk_addr == NULL_ADDR || blk_addr == NEW_ADDR {
			return NULL_SEGNO;
		}
		((blk_addr - self.seg0_blkaddr) >> self.log_blocks_per_seg) - self.start_segno
	}

	pub fn blkoff_in_seg(&self, blk_addr: u32) -> u32 {
		(blk_addr - self.seg0_blkaddr) & (self.blocks_per_seg - 1)
	}

	pub fn secno_of(&self, segno: u32) -> u32 {
		segno / self.segs_per_sec
	}

	pub fn zone_of(&self, segno: u32) -> u32 {
		segno / self.segs_per_sec / self.secs_per_zone
	}

	pub fn sum_blk_addr(&self, segno: u32) -> u32 {
		self.ssa_blkaddr + segno
	}

	pub fn get_mtime(&self) -> u64 {
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs();
		self.elapsed_base + now.saturating_sub(self.mounted_time)
	}

	pub fn free_segments(&self) -> u32 {
		self.free.read().unwrap().free_segments
	}

	pub fn free_sections(&self) -> u32 {
		self.free.read().unwrap().free_sections
	}

	pub fn prefree_segments(&self) -> u32 {
		self.dirty.lock().unwrap().nr_dirty[PRE]
	}

	pub fn dirty_segments(&self) -> u32 {
		let dirty = self.dirty.lock().unwrap();
		(0..NR_CURSEG_TYPE).map(|i| dirty.nr_dirty[i]).sum()
	}

	pub fn ovp_sections(&self) -> u32 {
		self.ovp_segments / self.segs_per_sec
	}

	pub fn reserved_sections(&self) -> u32 {
		self.reserved_segments / self.segs_per_sec
	}

	pub fn need_ssr(&self) -> bool {
		self.free_sections() < self.ovp_sections()
	}

	pub fn has_not_enough_free_secs(&self) -> bool {
		self.free_sections() <= self.reserved_sections()
	}

	pub fn has_curseg_space(&self, curseg: &CursegInfo) -> bool {
		(curseg.next_blkoff as u32) < self.blocks_per_seg
	}

	pub fn next_free_blkaddr(&self, t: CursegType) -> u32 {
		let curseg = self.lock_curseg(t);
		self.start_block(curseg.segno) + curseg.next_blkoff as u32
	}

	pub fn curseg_blkoff(&self, t: CursegType) -> u16 {
		self.lock_curseg(t).next_blkoff
	}

	pub fn curseg_alloc_type(&self, t: CursegType) -> u8 {
		self.lock_curseg(t).alloc_type
	}

	// free-segmap transitions; each takes the free lock internally and must
	// not be called with it held.

	pub(crate) fn set_free(&self, segno: u32) {
		let mut free = self.free.write().unwrap();
		let secno = segno / self.segs_per_sec;
		let start_segno = secno * self.segs_per_sec;
		bits::clear_bit(segno as usize, &mut free.free_segmap);
		free.free_segments += 1;

		let next = bits::find_next_bit(
			&free.free_segmap,
			self.main_segments as usize,
			start_segno as usize,
		);
		if next >= (start_segno + self.segs_per_sec) as usize {
			bits::clear_bit(secno as usize, &mut free.free_secmap);
			free.free_sections += 1;
		}
	}

	pub(crate) fn set_inuse_locked(&self, free: &mut FreeSegmapInfo, segno: u32) {
		let secno = segno / self.segs_per_sec;
		bits::set_bit(segno as usize, &mut free.free_segmap);
		free.free_segments -= 1;
		if !bits::test_and_set_bit(secno as usize, &mut free.free_secmap) {
			free.free_sections -= 1;
		}
	}

	pub(crate) fn set_test_and_free(&self, segno: u32) {
		let mut free = self.free.write().unwrap();
		let secno = segno / self.segs_per_sec;
		let start_segno = secno * self.segs_per_sec;
		if bits::test_and_clear_bit(segno as usize, &mut free.free_segmap) {
			free.free_segments += 1;
			let next = bits::find_next_bit(
				&free.free_segmap,
				self.main_segments as usize,
				start_segno as usize,
			);
			if next >= (start_segno + self.segs_per_sec) as usize
				&& bits::test_and_clear_bit(secno as usize, &mut free.free_secmap)
			{
				free.free_sections += 1;
			}
		}
	}

	pub(crate) fn set_test_and_inuse(&self, segno: u32) {
		let mut free = self.free.write().unwrap();
		let secno = segno / self.segs_per_sec;
		if !bits::test_and_set_bit(segno as usize, &mut free.free_segmap) {
			free.free_segments -= 1;
			if !bits::test_and_set_bit(secno as usize, &mut free.free_secmap) {
				free.free_sections -= 1;
			}
		}
	}

	fn find_next_inuse(&self, max: u32, start: u32) -> u32 {
		let free = self.free.read().unwrap();
		bits::find_next_bit(&free.free_segmap, max as usize, start as usize) as u32
	}

	// dirty-seglist transitions, called with the dirty lock held.

	fn locate_dirty_with_type(
		&self,
		dirty: &mut DirtySeglistInfo,
		segno: u32,
		dirty_type: usize,
	) {
		if !bits::test_and_set_bit(segno as usize, &mut dirty.dirty_segmap[dirty_type]) {
			dirty.nr_dirty[dirty_type] += 1;
		}
	}

	fn remove_dirty_with_type(
		&self,
		dirty: &mut DirtySeglistInfo,
		sit: &SitInfo,
		segno: u32,
		dirty_type: usize,
	) {
		if bits::test_and_clear_bit(segno as usize, &mut dirty.dirty_segmap[dirty_type]) {
			dirty.nr_dirty[dirty_type] -= 1;
		}
		if dirty_type == DIRTY {
			let t = sit.sentries[segno as usize].seg_type as usize;
			if bits::test_and_clear_bit(segno as usize, &mut dirty.dirty_segmap[t]) {
				dirty.nr_dirty[t] -= 1;
			}
			bits::clear_bit(segno as usize, &mut dirty.victim_secmap);
		}
	}

	fn locate_dirty_classified(
		&self,
		dirty: &mut DirtySeglistInfo,
		sit: &SitInfo,
		segno: u32,
	) {
		if segno == NULL_SEGNO || self.is_cur_seg(segno) {
			return;
		}
		let valid_blocks = sit.sentries[segno as usize].valid_blocks as u32;
		if valid_blocks == 0 {
			self.locate_dirty_with_type(dirty, segno, PRE);
			self.remove_dirty_with_type(dirty, sit, segno, DIRTY);
		} else if valid_blocks < self.blocks_per_seg {
			self.locate_dirty_with_type(dirty, segno, DIRTY);
			let t = sit.sentries[segno as usize].seg_type as usize;
			self.locate_dirty_with_type(dirty, segno, t);
		} else {
			// SSR during recovery can fill a segment back up
			self.remove_dirty_with_type(dirty, sit, segno, DIRTY);
		}
	}

	pub(crate) fn locate_dirty_segment(&self, sit: &SitInfo, segno: u32) {
		if segno == NULL_SEGNO || self.is_cur_seg(segno) {
			return;
		}
		let mut dirty = self.dirty.lock().unwrap();
		self.locate_dirty_classified(&mut dirty, sit, segno);
	}

	fn mark_sit_entry_dirty(&self, sit: &mut SitInfo, segno: u32) {
		if !bits::test_and_set_bit(segno as usize, &mut sit.dirty_sentries_bitmap) {
			sit.dirty_sentries += 1;
		}
	}

	fn set_sit_entry_type(
		&self,
		sit: &mut SitInfo,
		t: CursegType,
		segno: u32,
		modified: bool,
	) {
		sit.sentries[segno as usize].seg_type = t.index() as u8;
		if modified {
			self.mark_sit_entry_dirty(sit, segno);
		}
	}

	/// Flip one block's validity and maintain every derived counter.
	fn update_sit_entry(&self, sit: &mut SitInfo, blkaddr: u32, del: i32) {
		let segno = self.segno_of(blkaddr);
		let offset = self.blkoff_in_seg(blkaddr) as usize;
		let mtime = self.get_mtime();

		let se = &mut sit.sentries[segno as usize];
		let new_vblocks = (se.valid_blocks as i32 + del) as u16;
		assert!(new_vblocks as u32 <= self.blocks_per_seg);
		se.valid_blocks = new_vblocks;
		se.mtime = mtime;

		if del > 0 {
			assert!(!bits::set_valid_bit(offset, &mut se.cur_valid_map));
		} else {
			assert!(bits::clear_valid_bit(offset, &mut se.cur_valid_map));
		}
		if !bits::test_valid_bit(offset, &se.ckpt_valid_map) {
			se.ckpt_valid_blocks = (se.ckpt_valid_blocks as i32 + del) as u16;
		}

		self.mark_sit_entry_dirty(sit, segno);
		sit.max_mtime = mtime;
		sit.written_valid_blocks = (sit.written_valid_blocks as i64 + del as i64) as u32;
		if self.segs_per_sec > 1 {
			let secno = self.secno_of(segno) as usize;
			sit.sec_entries[secno] = (sit.sec_entries[secno] as i64 + del as i64) as u32;
		}
	}

	fn refresh_sit_entry(&self, sit: &mut SitInfo, old_blkaddr: u32, new_blkaddr: u32) {
		self.update_sit_entry(sit, new_blkaddr, 1);
		if self.segno_of(old_blkaddr) != NULL_SEGNO {
			self.update_sit_entry(sit, old_blkaddr, -1);
		}
	}

	/// Mark one block invalid, moving its segment to the dirty (or prefree)
	/// list.
	pub fn invalidate_blocks(&self, addr: u32) {
		assert_ne!(addr, NULL_ADDR);
		if addr == NEW_ADDR {
			return;
		}
		let mut sit = self.sit.lock().unwrap();
		self.update_sit_entry(&mut sit, addr, -1);
		let segno = self.segno_of(addr);
		self.locate_dirty_segment(&sit, segno);
	}

	pub fn valid_blocks_of(&self, segno: u32, section: bool) -> u32 {
		let sit = self.sit.lock().unwrap();
		if section && self.segs_per_sec > 1 {
			sit.sec_entries[self.secno_of(segno) as usize]
		} else {
			sit.sentries[segno as usize].valid_blocks as u32
		}
	}

	pub fn seg_type_of(&self, segno: u32) -> u8 {
		self.sit.lock().unwrap().sentries[segno as usize].seg_type
	}

	/// SIT block address currently holding `segno`'s entry, honouring the
	/// double-buffer bitmap.
	pub(crate) fn current_sit_addr(&self, sit: &SitInfo, segno: u32) -> u32 {
		let offset = segno / SIT_ENTRY_PER_BLOCK as u32;
		let mut blk_addr = self.sit_base_addr + offset;
		if bits::test_valid_bit(offset as usize, &sit.sit_bitmap) {
			blk_addr += self.sit_blocks;
		}
		blk_addr
	}

	fn next_sit_addr(&self, block_addr: u32) -> u32 {
		let mut a = block_addr - self.sit_base_addr;
		if a < self.sit_blocks {
			a += self.sit_blocks;
		} else {
			a -= self.sit_blocks;
		}
		a + self.sit_base_addr
	}

	fn set_to_next_sit(&self, sit: &mut SitInfo, start: u32) {
		let block_off = (start / SIT_ENTRY_PER_BLOCK as u32) as usize;
		if bits::test_valid_bit(block_off, &sit.sit_bitmap) {
			bits::clear_valid_bit(block_off, &mut sit.sit_bitmap);
		} else {
			bits::set_valid_bit(block_off, &mut sit.sit_bitmap);
		}
	}

	pub fn copy_sit_bitmap(&self, dst: &mut [u8]) {
		let sit = self.sit.lock().unwrap();
		dst.copy_from_slice(&sit.sit_bitmap);
	}

	/// Pick a free segment near the hint, keeping zones separated between
	/// write points.
	fn get_new_segment(&self, newseg: &mut u32, new_sec: bool, dir: AllocDirection) {
		let mut free = self.free.write().unwrap();
		let total_secs = self.total_sections;
		let total_zones = self.total_sections / self.secs_per_zone;
		let old_zoneno = self.zone_of(*newseg);
		let mut hint = *newseg / self.segs_per_sec;
		let mut left_start = hint;
		let mut init = true;
		let mut go_left = false;
		let mut segno;

		if !new_sec && ((*newseg + 1) % self.segs_per_sec) != 0 {
			segno = bits::find_next_zero_bit(
				&free.free_segmap,
				self.main_segments as usize,
				(*newseg + 1) as usize,
			) as u32;
			if segno < self.main_segments {
				self.set_inuse_locked(&mut free, segno);
				*newseg = segno;
				return;
			}
		}

		loop {
			let mut secno = bits::find_next_zero_bit(
				&free.free_secmap,
				total_secs as usize,
				hint as usize,
			) as u32;
			if secno >= total_secs {
				if dir == AllocDirection::Right {
					secno = bits::find_next_zero_bit(&free.free_secmap, total_secs as usize, 0)
						as u32;
					assert!(secno < total_secs);
				} else {
					go_left = true;
					left_start = hint.saturating_sub(1);
				}
			}
			if go_left {
				while bits::test_bit(left_start as usize, &free.free_secmap) {
					if left_start > 0 {
						left_start -= 1;
						continue;
					}
					left_start = bits::find_next_zero_bit(
						&free.free_secmap,
						total_secs as usize,
						0,
					) as u32;
					assert!(left_start < total_secs);
					break;
				}
				secno = left_start;
			}

			hint = secno;
			segno = secno * self.segs_per_sec;
			let zoneno = secno / self.secs_per_zone;

			if !init || self.secs_per_zone == 1 || zoneno == old_zoneno {
				break;
			}
			if dir == AllocDirection::Left {
				if !go_left && zoneno + 1 >= total_zones {
					break;
				}
				if go_left && zoneno == 0 {
					break;
				}
			}
			if self.is_cur_zone(zoneno) {
				// zone is in use, try another
				if go_left {
					hint = (zoneno * self.secs_per_zone).saturating_sub(1);
				} else if zoneno + 1 >= total_zones {
					hint = 0;
				} else {
					hint = (zoneno + 1) * self.secs_per_zone;
				}
				init = false;
				continue;
			}
			break;
		}

		assert!(!bits::test_bit(segno as usize, &free.free_segmap));
		self.set_inuse_locked(&mut free, segno);
		*newseg = segno;
	}

	fn reset_curseg(&self, sit: &mut SitInfo, curseg: &mut CursegInfo, t: CursegType, modified: bool) {
		curseg.segno = curseg.next_segno;
		curseg.zone = self.zone_of(curseg.segno);
		curseg.next_blkoff = 0;
		curseg.next_segno = NULL_SEGNO;
		self.cache_curseg_position(t, curseg.segno, curseg.zone);

		curseg.sum.footer = crate::layout::SummaryFooter {
			entry_type: if t.is_data() { SUM_TYPE_DATA } else { SUM_TYPE_NODE },
			check_sum:  0,
		};
		self.set_sit_entry_type(sit, t, curseg.segno, modified);
	}

	fn next_free_blkoff(&self, sit: &SitInfo, curseg: &mut CursegInfo, start: u32) {
		let se = &sit.sentries[curseg.segno as usize];
		let mut ofs = start;
		while ofs < self.blocks_per_seg {
			if !bits::test_valid_bit(ofs as usize, &se.ckpt_valid_map)
				&& !bits::test_valid_bit(ofs as usize, &se.cur_valid_map)
			{
				break;
			}
			ofs += 1;
		}
		curseg.next_blkoff = ofs as u16;
	}

	/// LFS appends; SSR scans forward for the next hole.
	fn refresh_next_blkoff(&self, sit: &SitInfo, curseg: &mut CursegInfo) {
		if curseg.alloc_type == ALLOC_SSR {
			let next = curseg.next_blkoff as u32 + 1;
			self.next_free_blkoff(sit, curseg, next);
		} else {
			curseg.next_blkoff += 1;
		}
	}

	pub(crate) fn restore_curseg(
		&self,
		t: CursegType,
		segno: u32,
		blkoff: u16,
		alloc_type: u8,
		sum: SummaryBlock,
	) {
		let mut curseg = self.lock_curseg(t);
		let mut sit = self.sit.lock().unwrap();
		*curseg.sum = sum;
		curseg.next_segno = segno;
		self.reset_curseg(&mut sit, &mut curseg, t, false);
		curseg.alloc_type = alloc_type;
		curseg.next_blkoff = blkoff;
	}

	/// Like [`SegmentManager::restore_curseg`], but only patches the summary
	/// entries so an already-restored journal survives.
	pub(crate) fn restore_curseg_entries(
		&self,
		t: CursegType,
		segno: u32,
		blkoff: u16,
		alloc_type: u8,
		entries: &[Summary],
	) {
		let mut curseg = self.lock_curseg(t);
		let mut sit = self.sit.lock().unwrap();
		curseg.sum.entries[..entries.len()].copy_from_slice(entries);
		curseg.next_segno = segno;
		self.reset_curseg(&mut sit, &mut curseg, t, false);
		curseg.alloc_type = alloc_type;
		curseg.next_blkoff = blkoff;
	}

	pub(crate) fn set_curseg_journal(&self, t: CursegType, n: u16, journal: &[u8]) {
		let mut curseg = self.lock_curseg(t);
		curseg.sum.n_journal = n;
		curseg.sum.journal.copy_from_slice(journal);
	}
}

impl F2fs {
	pub(crate) fn write_sum_page(&self, sum: &SummaryBlock, blk_addr: u32) -> IoResult<()> {
		let page = self.grab_meta_page(blk_addr);
		page.encode(sum)?;
		self.meta_cache.set_dirty(&page);
		self.flush_single_meta_page(&page)
	}

	pub(crate) fn get_sum_page(&self, segno: u32) -> IoResult<std::sync::Arc<Page>> {
		self.get_meta_page(self.sm.sum_blk_addr(segno))
	}

	fn new_curseg(
		&self,
		sit: &mut SitInfo,
		curseg: &mut CursegInfo,
		t: CursegType,
		new_sec: bool,
	) -> IoResult<()> {
		let sm = &self.sm;
		if curseg.segno != NULL_SEGNO {
			self.write_sum_page(&curseg.sum, sm.sum_blk_addr(curseg.segno))?;
		}
		let mut dir = AllocDirection::Left;
		if t == CursegType::WarmData || t == CursegType::ColdData {
			dir = AllocDirection::Right;
		}
		if self.sbi.opts.no_heap {
			dir = AllocDirection::Right;
		}
		let mut segno = curseg.segno;
		if segno == NULL_SEGNO {
			segno = 0;
		}
		sm.get_new_segment(&mut segno, new_sec, dir);
		curseg.next_segno = segno;
		sm.reset_curseg(sit, curseg, t, true);
		curseg.alloc_type = ALLOC_LFS;
		Ok(())
	}

	/// Reopen a dirty segment for slack-space recycling, reloading its
	/// on-disk summary.
	fn change_curseg(
		&self,
		sit: &mut SitInfo,
		curseg: &mut CursegInfo,
		t: CursegType,
		reuse: bool,
	) -> IoResult<()> {
		let sm = &self.sm;
		let new_segno = curseg.next_segno;

		self.write_sum_page(&curseg.sum, sm.sum_blk_addr(curseg.segno))?;
		sm.set_test_and_inuse(new_segno);

		{
			let mut dirty = sm.dirty.lock().unwrap();
			sm.remove_dirty_with_type(&mut dirty, sit, new_segno, PRE);
			sm.remove_dirty_with_type(&mut dirty, sit, new_segno, DIRTY);
		}

		sm.reset_curseg(sit, curseg, t, true);
		curseg.alloc_type = ALLOC_SSR;
		sm.next_free_blkoff(sit, curseg, 0);

		if reuse {
			let sum_page = self.get_sum_page(new_segno)?;
			let sum: SummaryBlock = sum_page.decode()?;
			curseg.sum.entries = sum.entries;
		}
		Ok(())
	}

	fn get_ssr_segment(&self, sit: &SitInfo, curseg: &mut CursegInfo, t: CursegType) -> bool {
		match self.sm.get_victim_by_default(
			sit,
			GcType::Bg,
			t,
			AllocMode::Ssr,
			self.gc.cur_victim_sec(),
			&self.sbi,
		) {
			Some(segno) => {
				curseg.next_segno = segno;
				true
			}
			None => false,
		}
	}

	/// Replace a full write point with a new segment: LFS from the free
	/// list, or SSR into a dirty one.
	fn allocate_segment_by_default(
		&self,
		sit: &mut SitInfo,
		curseg: &mut CursegInfo,
		t: CursegType,
		force: bool,
	) -> IoResult<()> {
		if force {
			self.new_curseg(sit, curseg, t, true)?;
		} else if !self.sbi.opts.disable_roll_forward && t == CursegType::WarmNode {
			// keep the fsync dnode chain in fresh segments
			self.new_curseg(sit, curseg, t, false)?;
		} else if self.sm.need_ssr() && self.get_ssr_segment(sit, curseg, t) {
			self.change_curseg(sit, curseg, t, true)?;
		} else {
			self.new_curseg(sit, curseg, t, false)?;
		}
		self.sbi.segment_count_mode[curseg.alloc_type as usize]
			.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}

	/// Force fresh data segments; used after roll-forward so recovered data
	/// does not mix with pre-crash segments.
	pub(crate) fn allocate_new_segments(&self) -> IoResult<()> {
		for i in 0..NR_CURSEG_DATA_TYPE {
			let t = CursegType::from_index(i);
			let old_segno;
			{
				let mut curseg = self.sm.lock_curseg(t);
				let mut sit = self.sm.sit.lock().unwrap();
				old_segno = curseg.segno;
				self.allocate_segment_by_default(&mut sit, &mut curseg, t, true)?;
				self.sm.locate_dirty_segment(&sit, old_segno);
			}
		}
		Ok(())
	}

	/// The allocation core: reserve the next block of the right write point,
	/// record the summary, update SIT state and submit the page.
	pub(crate) fn do_write_page(
		&self,
		page: &Page,
		old_blkaddr: u32,
		sum: &Summary,
		t: CursegType,
	) -> IoResult<u32> {
		let sm = &self.sm;
		let new_blkaddr;
		{
			let mut curseg = sm.lock_curseg(t);
			new_blkaddr = sm.start_block(curseg.segno) + curseg.next_blkoff as u32;
			let blkoff = curseg.next_blkoff as usize;
			curseg.sum.entries[blkoff] = *sum;

			{
				let mut sit = sm.sit.lock().unwrap();
				sm.refresh_next_blkoff(&sit, &mut curseg);
				self.sbi.block_count_mode[curseg.alloc_type as usize]
					.fetch_add(1, Ordering::Relaxed);

				// SIT must be current before a new segment is chosen, since
				// SSR wants the latest valid maps.
				sm.refresh_sit_entry(&mut sit, old_blkaddr, new_blkaddr);

				if !sm.has_curseg_space(&curseg) {
					self.allocate_segment_by_default(&mut sit, &mut curseg, t, false)?;
				}

				sm.locate_dirty_segment(&sit, sm.segno_of(old_blkaddr));
				sm.locate_dirty_segment(&sit, sm.segno_of(new_blkaddr));
			}

			if t.is_node() {
				// thread the recovery chain through the next write position
				let mut node: NodeBlock = page.decode()?;
				node.footer.cp_ver = self.sbi.cp_ver();
				node.footer.next_blkaddr =
					sm.start_block(curseg.segno) + curseg.next_blkoff as u32;
				page.encode(&node)?;
			}
		}

		self.bc.write_blk(new_blkaddr, &page.read()[..])?;
		Ok(new_blkaddr)
	}

	pub(crate) fn write_node_block(&self, page: &Page, nid: u32, old_blkaddr: u32) -> IoResult<u32> {
		let node: NodeBlock = page.decode()?;
		let t = self.node_segment_type(&node);
		let sum = Summary::new(nid, 0, 0);
		self.do_write_page(page, old_blkaddr, &sum, t)
	}

	pub(crate) fn write_data_block(
		&self,
		vnode: &Vnode,
		page: &Page,
		nid: u32,
		ofs_in_node: u32,
		old_blkaddr: u32,
	) -> IoResult<u32> {
		assert_ne!(old_blkaddr, NULL_ADDR);
		let ni = self.get_node_info(nid)?;
		let sum = Summary::new(nid, ofs_in_node as u16, ni.version);
		let t = self.data_segment_type(vnode);
		self.do_write_page(page, old_blkaddr, &sum, t)
	}

	/// In-place update: rewrite the block where it already lives.
	pub(crate) fn rewrite_data_block(&self, page: &Page, old_blkaddr: u32) -> IoResult<()> {
		self.bc.write_blk(old_blkaddr, &page.read()[..])
	}

	/// Roll-forward helper: make `new_blkaddr` valid again under the segment
	/// that owned it before the crash, fixing the summary on the way.
	pub(crate) fn recover_data_page(
		&self,
		sum: &Summary,
		old_blkaddr: u32,
		new_blkaddr: u32,
	) -> IoResult<()> {
		let sm = &self.sm;
		let segno = sm.segno_of(new_blkaddr);
		let mut t = CursegType::from_index(sm.seg_type_of(segno) as usize);

		if sm.valid_blocks_of(segno, false) == 0 && !sm.is_cur_seg(segno) {
			t = if old_blkaddr == NULL_ADDR {
				CursegType::ColdData
			} else {
				CursegType::WarmData
			};
		}

		let mut curseg = sm.lock_curseg(t);
		let mut sit = sm.sit.lock().unwrap();
		let old_cursegno = curseg.segno;

		if segno != curseg.segno {
			curseg.next_segno = segno;
			self.change_curseg(&mut sit, &mut curseg, t, true)?;
		}
		curseg.next_blkoff = sm.blkoff_in_seg(new_blkaddr) as u16;
		let blkoff = curseg.next_blkoff as usize;
		curseg.sum.entries[blkoff] = *sum;

		sm.refresh_sit_entry(&mut sit, old_blkaddr, new_blkaddr);

		sm.locate_dirty_segment(&sit, old_cursegno);
		sm.locate_dirty_segment(&sit, sm.segno_of(old_blkaddr));
		sm.locate_dirty_segment(&sit, sm.segno_of(new_blkaddr));
		Ok(())
	}

	/// Roll-forward helper: rewrite a node block in place at `new_blkaddr`
	/// and keep the warm-node chain pointing past it.
	pub(crate) fn rewrite_node_block(
		&self,
		page: &Page,
		sum: &Summary,
		old_blkaddr: u32,
		new_blkaddr: u32,
	) -> IoResult<()> {
		let sm = &self.sm;
		let t = CursegType::WarmNode;
		let node: NodeBlock = page.decode()?;
		let next_blkaddr = node.footer.next_blkaddr;
		let next_segno = sm.segno_of(next_blkaddr);

		{
			let mut curseg = sm.lock_curseg(t);
			let mut sit = sm.sit.lock().unwrap();
			let segno = sm.segno_of(new_blkaddr);
			let old_cursegno = curseg.segno;

			if segno != curseg.segno {
				curseg.next_segno = segno;
				self.change_curseg(&mut sit, &mut curseg, t, true)?;
			}
			curseg.next_blkoff = sm.blkoff_in_seg(new_blkaddr) as u16;
			let blkoff = curseg.next_blkoff as usize;
			curseg.sum.entries[blkoff] = *sum;

			// move the log to the next chain address in advance
			if next_segno != segno && next_segno != NULL_SEGNO {
				curseg.next_segno = next_segno;
				self.change_curseg(&mut sit, &mut curseg, t, true)?;
			}
			curseg.next_blkoff = sm.blkoff_in_seg(next_blkaddr) as u16;

			sm.refresh_sit_entry(&mut sit, old_blkaddr, new_blkaddr);

			sm.locate_dirty_segment(&sit, old_cursegno);
			sm.locate_dirty_segment(&sit, sm.segno_of(old_blkaddr));
			sm.locate_dirty_segment(&sit, sm.segno_of(new_blkaddr));
		}

		self.bc.write_blk(new_blkaddr, &page.read()[..])
	}

	/// Steer a data page to a temperature log.
	pub(crate) fn data_segment_type(&self, vnode: &Vnode) -> CursegType {
		match self.sbi.active_logs() {
			2 => CursegType::HotData,
			4 => {
				if vnode.is_dir() {
					CursegType::HotData
				} else {
					CursegType::ColdData
				}
			}
			_ => {
				if vnode.is_dir() {
					CursegType::HotData
				} else if vnode.is_cold_file() {
					CursegType::ColdData
				} else {
					CursegType::WarmData
				}
			}
		}
	}

	pub(crate) fn node_segment_type(&self, node: &NodeBlock) -> CursegType {
		match self.sbi.active_logs() {
			2 => CursegType::HotNode,
			4 => {
				if node.is_dnode() && !node.is_cold() {
					CursegType::HotNode
				} else {
					CursegType::ColdNode
				}
			}
			_ => {
				if node.is_dnode() {
					if node.is_cold() {
						CursegType::WarmNode
					} else {
						CursegType::HotNode
					}
				} else {
					CursegType::ColdNode
				}
			}
		}
	}

	/// In-place-update policy: only worth it for regular file data when the
	/// volume is starved enough that SSR is on and utilization is high.
	pub(crate) fn need_inplace_update(&self, vnode: &Vnode) -> bool {
		const MIN_IPU_UTIL: u32 = 70;
		if vnode.is_dir() {
			return false;
		}
		self.sm.need_ssr() && self.utilization() >= MIN_IPU_UTIL
	}

	/// Number of blocks needed to store the data summaries at checkpoint:
	/// 1 or 2 compact blocks, or 3 full ones.
	pub(crate) fn npages_for_summary_flush(&self, ckpt: &Checkpoint) -> u32 {
		let mut valid_sum_count = 0usize;
		for i in 0..NR_CURSEG_DATA_TYPE {
			if ckpt.alloc_type[i] == ALLOC_SSR {
				valid_sum_count += self.sm.blocks_per_seg() as usize;
			} else {
				valid_sum_count += ckpt.cur_data_blkoff[i] as usize;
			}
		}
		let total_size_bytes =
			valid_sum_count * (SUMMARY_SIZE + 1) + (SUM_JOURNAL_SIZE + 2) * 2;
		let sum_space = BLOCK_SIZE - crate::layout::SUM_FOOTER_SIZE;
		if total_size_bytes < sum_space {
			1
		} else if total_size_bytes < 2 * sum_space {
			2
		} else {
			3
		}
	}

	// -- summary restore at mount ------------------------------------------

	fn read_compacted_summaries(&self) -> IoResult<()> {
		let ckpt = self.sbi.ckpt.read().unwrap().clone();
		let mut start = self.sbi.start_cp_addr() + ckpt.cp_pack_start_sum;

		let mut page = self.get_meta_page(start)?;
		start += 1;

		// step 1: NAT journal belongs to the hot data curseg
		{
			let data = page.read();
			let n = u16::from_le_bytes(data[0..2].try_into().unwrap());
			self.sm
				.set_curseg_journal(CursegType::HotData, n, &data[2..2 + SUM_JOURNAL_SIZE]);
			// step 2: SIT journal belongs to the cold data curseg
			let base = 2 + SUM_JOURNAL_SIZE;
			let n = u16::from_le_bytes(data[base..base + 2].try_into().unwrap());
			self.sm.set_curseg_journal(
				CursegType::ColdData,
				n,
				&data[base + 2..base + 2 + SUM_JOURNAL_SIZE],
			);
		}

		// step 3: per-type summary entries, packed back to back
		let mut offset = 2 * (SUM_JOURNAL_SIZE + 2);
		for i in 0..NR_CURSEG_DATA_TYPE {
			let t = CursegType::from_index(i);
			let segno = ckpt.cur_data_segno[i];
			let blk_off = ckpt.cur_data_blkoff[i];
			let count = if ckpt.alloc_type[i] == ALLOC_SSR {
				self.sm.blocks_per_seg() as usize
			} else {
				blk_off as usize
			};
			let mut entries = vec![Summary::zeroed(); ENTRIES_IN_SUM];
			for entry in entries.iter_mut().take(count) {
				if offset + SUMMARY_SIZE > BLOCK_SIZE - crate::layout::SUM_FOOTER_SIZE {
					page = self.get_meta_page(start)?;
					start += 1;
					offset = 0;
				}
				let data = page.read();
				*entry = crate::layout::decode(&data[offset..offset + SUMMARY_SIZE])?;
				offset += SUMMARY_SIZE;
			}
			self.sm
				.restore_curseg_entries(t, segno, blk_off, ckpt.alloc_type[i], &entries);
		}
		Ok(())
	}

	fn read_normal_summaries(&self, t: CursegType) -> IoResult<()> {
		let ckpt = self.sbi.ckpt.read().unwrap().clone();
		let (segno, blk_off, blk_addr) = if t.is_data() {
			let i = t.index();
			let addr = if ckpt.is_set(CP_UMOUNT_FLAG) {
				self.sum_blk_addr_in_cp(&ckpt, NR_CURSEG_TYPE, t.index())
			} else {
				self.sum_blk_addr_in_cp(&ckpt, NR_CURSEG_DATA_TYPE, t.index())
			};
			(ckpt.cur_data_segno[i], ckpt.cur_data_blkoff[i], addr)
		} else {
			let i = t.index() - NR_CURSEG_DATA_TYPE;
			let addr = if ckpt.is_set(CP_UMOUNT_FLAG) {
				self.sum_blk_addr_in_cp(&ckpt, NR_CURSEG_NODE_TYPE, i)
			} else {
				self.sm.sum_blk_addr(ckpt.cur_node_segno[i])
			};
			(ckpt.cur_node_segno[i], ckpt.cur_node_blkoff[i], addr)
		};

		let page = self.get_meta_page(blk_addr)?;
		let mut sum: SummaryBlock = page.decode()?;

		if t.is_node() {
			if ckpt.is_set(CP_UMOUNT_FLAG) {
				for entry in sum.entries.iter_mut() {
					entry.version = 0;
					entry.ofs_in_node = 0;
				}
			} else {
				self.restore_node_summary(segno, &mut sum)?;
			}
		}

		self.sm
			.restore_curseg(t, segno, blk_off, ckpt.alloc_type[t.index()], sum);
		Ok(())
	}

	fn sum_blk_addr_in_cp(&self, ckpt: &Checkpoint, base: usize, t: usize) -> u32 {
		self.sbi.start_cp_addr() + ckpt.cp_pack_total_block_count
			- (base as u32 + 1)
			+ t as u32
	}

	pub(crate) fn restore_curseg_summaries(&self) -> IoResult<()> {
		let compact = self.sbi.ckpt.read().unwrap().is_set(CP_COMPACT_SUM_FLAG);
		let mut start = 0;
		if compact {
			self.read_compacted_summaries()?;
			start = NR_CURSEG_DATA_TYPE;
		}
		for i in start..NR_CURSEG_TYPE {
			self.read_normal_summaries(CursegType::from_index(i))?;
		}
		Ok(())
	}

	// -- summary write-out at checkpoint -----------------------------------

	fn write_compacted_summaries(&self, mut blkaddr: u32) -> IoResult<()> {
		let mut page = self.grab_meta_page(blkaddr);
		blkaddr += 1;
		let mut written = 0usize;
		{
			let mut data = page.write();
			data.fill(0);
			let hot = self.sm.lock_curseg(CursegType::HotData);
			data[written..written + 2].copy_from_slice(&hot.sum.n_journal.to_le_bytes());
			data[written + 2..written + 2 + SUM_JOURNAL_SIZE].copy_from_slice(&hot.sum.journal);
			written += SUM_JOURNAL_SIZE + 2;
			drop(hot);
			let cold = self.sm.lock_curseg(CursegType::ColdData);
			data[written..written + 2].copy_from_slice(&cold.sum.n_journal.to_le_bytes());
			data[written + 2..written + 2 + SUM_JOURNAL_SIZE].copy_from_slice(&cold.sum.journal);
			written += SUM_JOURNAL_SIZE + 2;
		}
		self.meta_cache.set_dirty(&page);

		for i in 0..NR_CURSEG_DATA_TYPE {
			let t = CursegType::from_index(i);
			let curseg = self.sm.lock_curseg(t);
			let blkoff = if self.sbi.ckpt.read().unwrap().alloc_type[i] == ALLOC_SSR {
				self.sm.blocks_per_seg() as usize
			} else {
				curseg.next_blkoff as usize
			};
			for j in 0..blkoff {
				if written + SUMMARY_SIZE > BLOCK_SIZE - crate::layout::SUM_FOOTER_SIZE {
					self.meta_cache.set_dirty(&page);
					page = self.grab_meta_page(blkaddr);
					page.zero();
					blkaddr += 1;
					written = 0;
				}
				let mut data = page.write();
				crate::layout::encode(
					&curseg.sum.entries[j],
					&mut data[written..written + SUMMARY_SIZE],
				)?;
				written += SUMMARY_SIZE;
			}
			self.meta_cache.set_dirty(&page);
		}
		Ok(())
	}

	fn write_normal_summaries(&self, blkaddr: u32, t: CursegType) -> IoResult<()> {
		let end = if t.is_data() {
			t.index() + NR_CURSEG_DATA_TYPE
		} else {
			t.index() + NR_CURSEG_NODE_TYPE
		};
		for i in t.index()..end {
			let curseg = self.sm.lock_curseg(CursegType::from_index(i));
			let page = self.grab_meta_page(blkaddr + (i - t.index()) as u32);
			page.encode(&*curseg.sum)?;
			self.meta_cache.set_dirty(&page);
		}
		Ok(())
	}

	pub(crate) fn write_data_summaries(&self, ckpt: &Checkpoint, start_blk: u32) -> IoResult<()> {
		if ckpt.is_set(CP_COMPACT_SUM_FLAG) {
			self.write_compacted_summaries(start_blk)
		} else {
			self.write_normal_summaries(start_blk, CursegType::HotData)
		}
	}

	pub(crate) fn write_node_summaries(&self, ckpt: &Checkpoint, start_blk: u32) -> IoResult<()> {
		if ckpt.is_set(CP_UMOUNT_FLAG) {
			self.write_normal_summaries(start_blk, CursegType::HotNode)?;
		}
		Ok(())
	}

	// -- SIT flush ----------------------------------------------------------

	fn get_next_sit_page(&self, sit: &mut SitInfo, start: u32) -> IoResult<std::sync::Arc<Page>> {
		let src_off = self.sm.current_sit_addr(sit, start);
		let dst_off = self.sm.next_sit_addr(src_off);

		let src_page = self.get_meta_page(src_off)?;
		let dst_page = self.grab_meta_page(dst_off);
		dst_page.copy_from(&src_page);
		dst_page.set_uptodate();
		self.meta_cache.set_dirty(&dst_page);

		self.sm.set_to_next_sit(sit, start);
		Ok(dst_page)
	}

	/// Move journalled SIT entries back to the dirty set when the journal
	/// cannot hold them all.
	fn flush_sits_in_journal(&self, sit: &mut SitInfo, cold: &mut CursegInfo) -> bool {
		let n = cold.sum.journal_count();
		if n + sit.dirty_sentries as usize <= SIT_JOURNAL_ENTRIES {
			return false;
		}
		for i in (0..n).rev() {
			let (segno, _) = cold.sum.sit_in_journal(i);
			self.sm.mark_sit_entry_dirty(sit, segno);
		}
		cold.sum.set_journal_count(0);
		true
	}

	/// Write every dirty SIT entry: journal first, overflow into the SIT
	/// area proper, then hand prefree segments to the free list.
	pub(crate) fn flush_sit_entries(&self) -> IoResult<()> {
		let sm = &self.sm;
		{
			let mut cold = sm.lock_curseg(CursegType::ColdData);
			let mut sit = sm.sit.lock().unwrap();
			let flushed = self.flush_sits_in_journal(&mut sit, &mut cold);

			let nsegs = sm.main_segments();
			let mut page: Option<std::sync::Arc<Page>> = None;
			let mut raw_sit = SitBlock::zeroed();
			let mut start = 0u32;
			let mut end = 0u32;

			let mut segno = bits::find_next_bit(&sit.dirty_sentries_bitmap, nsegs as usize, 0);
			while segno < nsegs as usize {
				let sit_offset = segno % SIT_ENTRY_PER_BLOCK;

				let mut offset = None;
				if !flushed {
					offset =
						lookup_journal_in_cursum(&mut cold.sum, false, segno as u32, true);
				}
				if let Some(slot) = offset {
					let raw = sit.sentries[segno].store();
					cold.sum.set_sit_in_journal(slot, segno as u32, &raw);
				} else {
					if page.is_none() || (segno as u32) < start || (segno as u32) > end {
						if let Some(p) = page.take() {
							p.encode(&raw_sit)?;
							self.meta_cache.set_dirty(&p);
						}
						start = (segno as u32 / SIT_ENTRY_PER_BLOCK as u32)
							* SIT_ENTRY_PER_BLOCK as u32;
						end = start + SIT_ENTRY_PER_BLOCK as u32 - 1;
						let p = self.get_next_sit_page(&mut sit, start)?;
						raw_sit = p.decode()?;
						page = Some(p);
					}
					raw_sit.entries[sit_offset] = sit.sentries[segno].store();
				}
				bits::clear_bit(segno, &mut sit.dirty_sentries_bitmap);
				sit.dirty_sentries -= 1;

				segno =
					bits::find_next_bit(&sit.dirty_sentries_bitmap, nsegs as usize, segno + 1);
			}
			if let Some(p) = page.take() {
				p.encode(&raw_sit)?;
				self.meta_cache.set_dirty(&p);
			}

			// prefree segments may be reused for allocation once the new
			// checkpoint makes their release durable
			let mut dirty = sm.dirty.lock().unwrap();
			let mut offset = 0usize;
			loop {
				let segno =
					bits::find_next_bit(&dirty.dirty_segmap[PRE], nsegs as usize, offset);
				if segno >= nsegs as usize {
					break;
				}
				offset = segno + 1;
				drop(dirty);
				sm.set_test_and_free(segno as u32);
				dirty = sm.dirty.lock().unwrap();
			}
		}
		Ok(())
	}

	/// After the checkpoint is durable, retire the prefree list and TRIM the
	/// released segments.
	pub(crate) fn clear_prefree_segments(&self) -> IoResult<()> {
		let sm = &self.sm;
		let nsegs = sm.main_segments();
		let mut doomed = Vec::new();
		{
			let mut dirty = sm.dirty.lock().unwrap();
			let mut offset = 0usize;
			loop {
				let segno =
					bits::find_next_bit(&dirty.dirty_segmap[PRE], nsegs as usize, offset);
				if segno >= nsegs as usize {
					break;
				}
				offset = segno + 1;
				if bits::test_and_clear_bit(segno, &mut dirty.dirty_segmap[PRE]) {
					dirty.nr_dirty[PRE] -= 1;
					doomed.push(segno as u32);
				}
			}
		}
		if self.sbi.opts.discard {
			for segno in doomed {
				self.bc
					.trim(sm.start_block(segno), sm.blocks_per_seg())?;
			}
		}
		Ok(())
	}

	// -- build at mount ------------------------------------------------------

	pub(crate) fn build_segment_manager(&self) -> IoResult<()> {
		self.restore_curseg_summaries()?;
		self.build_sit_entries()?;
		self.init_free_segmap();
		self.init_dirty_segmap();
		self.init_min_max_mtime();
		Ok(())
	}

	fn build_sit_entries(&self) -> IoResult<()> {
		let sm = &self.sm;
		let mut cold = sm.lock_curseg(CursegType::ColdData);
		let mut sit = sm.sit.lock().unwrap();

		for start in 0..sm.main_segments() {
			let mut raw = None;
			for i in 0..cold.sum.journal_count() {
				let (segno, se) = cold.sum.sit_in_journal(i);
				if segno == start {
					raw = Some(se);
					break;
				}
			}
			let raw = match raw {
				Some(se) => se,
				None => {
					let addr = sm.current_sit_addr(&sit, start);
					let page = self.get_meta_page(addr)?;
					let blk: SitBlock = page.decode()?;
					blk.entries[start as usize % SIT_ENTRY_PER_BLOCK]
				}
			};
			check_block_count(sm.blocks_per_seg(), start, &raw)?;
			sit.sentries[start as usize].load(&raw);
			if sm.segs_per_sec > 1 {
				let secno = sm.secno_of(start) as usize;
				sit.sec_entries[secno] += raw.valid_blocks() as u32;
			}
		}
		drop(sit);
		drop(cold);
		Ok(())
	}

	fn init_free_segmap(&self) {
		let sm = &self.sm;
		let empties: Vec<u32> = {
			let sit = sm.sit.lock().unwrap();
			(0..sm.main_segments())
				.filter(|segno| sit.sentries[*segno as usize].valid_blocks == 0)
				.collect()
		};
		for segno in empties {
			sm.set_free(segno);
		}
		self.mark_cursegs_inuse();
	}

	fn mark_cursegs_inuse(&self) {
		for i in 0..NR_CURSEG_TYPE {
			let segno = self.sm.curseg_segno(CursegType::from_index(i));
			if segno != NULL_SEGNO {
				self.sm.set_test_and_inuse(segno);
			}
		}
	}

	fn init_dirty_segmap(&self) {
		let sm = &self.sm;
		let total = sm.main_segments();
		let mut offset = 0u32;
		loop {
			let segno = sm.find_next_inuse(total, offset);
			if segno >= total {
				break;
			}
			offset = segno + 1;
			let valid_blocks = sm.valid_blocks_of(segno, false);
			if valid_blocks == 0 || valid_blocks >= sm.blocks_per_seg() {
				continue;
			}
			let sit = sm.sit.lock().unwrap();
			sm.locate_dirty_segment(&sit, segno);
		}
	}

	fn init_min_max_mtime(&self) {
		let sm = &self.sm;
		let mut sit = sm.sit.lock().unwrap();
		sit.min_mtime = u64::MAX;
		for segno in (0..sm.main_segments()).step_by(sm.segs_per_sec as usize) {
			let mut mtime = 0u64;
			for i in 0..sm.segs_per_sec {
				mtime += sit.sentries[(segno + i) as usize].mtime;
			}
			mtime /= sm.segs_per_sec as u64;
			if sit.min_mtime > mtime {
				sit.min_mtime = mtime;
			}
		}
		sit.max_mtime = sm.get_mtime();
	}

	/// Keep dirty state bounded: once prefree segments pile up (or free
	/// space runs low), fold them into a checkpoint.
	pub fn balance_fs(&self) -> IoResult<()> {
		if self.sbi.on_recovery() {
			return Ok(());
		}
		if self.sm.has_not_enough_free_secs() {
			self.garbage_collect()?;
			return Ok(());
		}
		if self.sm.prefree_segments() > 0 {
			self.sync_fs()?;
		}
		Ok(())
	}
}

pub(crate) fn check_block_count(
	blocks_per_seg: u32,
	segno: u32,
	raw: &SitEntry,
) -> IoResult<()> {
	if raw.valid_blocks() as u32 > blocks_per_seg {
		log::error!("segment {segno} claims {} valid blocks", raw.valid_blocks());
		return Err(std::io::Error::new(
			std::io::ErrorKind::InvalidData,
			"sit entry out of range",
		));
	}
	let actual = (0..blocks_per_seg as usize)
		.filter(|i| bits::test_valid_bit(*i, &raw.valid_map))
		.count();
	if actual != raw.valid_blocks() as usize {
		log::error!(
			"segment {segno}: bitmap population {actual} != vblocks {}",
			raw.valid_blocks()
		);
		return Err(std::io::Error::new(
			std::io::ErrorKind::InvalidData,
			"sit bitmap disagrees with count",
		));
	}
	Ok(())
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn curseg_type_partitions() {
		assert!(CursegType::HotData.is_data());
		assert!(CursegType::ColdData.is_data());
		assert!(CursegType::HotNode.is_node());
		assert!(CursegType::ColdNode.is_node());
		assert_eq!(CursegType::from_index(4), CursegType::WarmNode);
	}

	#[test]
	fn journal_lookup_allocates_slots() {
		let mut sum = SummaryBlock::zeroed();
		assert_eq!(lookup_journal_in_cursum(&mut sum, true, 7, false), None);
		let slot = lookup_journal_in_cursum(&mut sum, true, 7, true).unwrap();
		let ne = crate::layout::RawNatEntry {
			version:    0,
			ino:        7,
			block_addr: 1,
		};
		sum.set_nat_in_journal(slot, 7, &ne);
		assert_eq!(lookup_journal_in_cursum(&mut sum, true, 7, false), Some(slot));
		assert_eq!(sum.journal_count(), 1);
	}

	#[test]
	fn sit_entry_checks() {
		let mut raw = SitEntry::zeroed();
		raw.vblocks = 2;
		crate::bits::set_valid_bit(0, &mut raw.valid_map);
		crate::bits::set_valid_bit(9, &mut raw.valid_map);
		assert!(check_block_count(512, 0, &raw).is_ok());
		raw.vblocks = 3;
		assert!(check_block_count(512, 0, &raw).is_err());
	}

	fn test_manager(main_segments: u32, segs_per_sec: u32) -> SegmentManager {
		let mut raw = SuperBlock::zeroed();
		raw.log_blocks_per_seg = 9;
		raw.segment0_blkaddr = 512;
		raw.main_blkaddr = 512 + 10 * 512;
		raw.ssa_blkaddr = 512 + 8 * 512;
		raw.sit_blkaddr = 1024;
		raw.segment_count_sit = 2;
		raw.segment_count = main_segments + 10;
		raw.segment_count_main = main_segments;
		raw.segs_per_sec = segs_per_sec;
		raw.secs_per_zone = 1;
		raw.section_count = main_segments / segs_per_sec;
		let mut ckpt = Checkpoint::zeroed();
		ckpt.sit_ver_bitmap_bytesize = 64;
		SegmentManager::new(&raw, &ckpt)
	}

	#[test]
	fn address_arithmetic() {
		let sm = test_manager(64, 1);
		assert_eq!(sm.segno_of(NULL_ADDR), NULL_SEGNO);
		assert_eq!(sm.segno_of(NEW_ADDR), NULL_SEGNO);
		let b = sm.start_block(3);
		assert_eq!(sm.segno_of(b), 3);
		assert_eq!(sm.blkoff_in_seg(b + 17), 17);
	}

	#[test]
	fn free_segment_accounting() {
		let sm = test_manager(64, 2);
		// everything starts in-use; free two segments of one section
		sm.set_free(10);
		assert_eq!(sm.free_segments(), 1);
		assert_eq!(sm.free_sections(), 0);
		sm.set_free(11);
		assert_eq!(sm.free_segments(), 2);
		assert_eq!(sm.free_sections(), 1);
		sm.set_test_and_inuse(10);
		assert_eq!(sm.free_segments(), 1);
		assert_eq!(sm.free_sections(), 0);
		// double transitions are no-ops
		sm.set_test_and_inuse(10);
		assert_eq!(sm.free_segments(), 1);
	}

	#[test]
	fn invalidate_moves_to_prefree() {
		let sm = test_manager(64, 1);
		let addr = sm.start_block(5) + 3;
		{
			let mut sit = sm.sit.lock().unwrap();
			sm.update_sit_entry(&mut sit, addr, 1);
		}
		assert_eq!(sm.valid_blocks_of(5, false), 1);
		sm.invalidate_blocks(addr);
		assert_eq!(sm.valid_blocks_of(5, false), 0);
		let dirty = sm.dirty.lock().unwrap();
		assert_eq!(dirty.nr_dirty[PRE], 1);
	}
}
