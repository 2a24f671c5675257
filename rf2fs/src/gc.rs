use std::{
	io::Result as IoResult,
	sync::{
		atomic::{AtomicU32, Ordering},
		Mutex,
	},
};

use crate::{
	bits, err,
	layout::{SummaryBlock, NULL_SECNO, NULL_SEGNO, SUM_TYPE_NODE},
	mount::{F2fs, SuperblockInfo},
	segment::{
		AllocMode, CursegType, GcMode, GcType, SegmentManager, SitInfo, DIRTY, MAX_SEARCH_LIMIT,
	},
};

/// Victim search parameters, filled per request.
struct VictimSelPolicy {
	alloc_mode: AllocMode,
	gc_mode:    GcMode,
	dirty_type: usize,
	max_search: u32,
	offset:     u32,
	ofs_unit:   u32,
	min_cost:   u32,
	min_segno:  u32,
}

impl SegmentManager {
	fn victim_policy(
		&self,
		sbi: &SuperblockInfo,
		nr_dirty: &[u32],
		gc_type: GcType,
		t: CursegType,
		alloc_mode: AllocMode,
	) -> VictimSelPolicy {
		let (gc_mode, dirty_type, max_search, ofs_unit) = if alloc_mode == AllocMode::Ssr {
			(GcMode::Greedy, t.index(), nr_dirty[t.index()], 1)
		} else {
			let mode = if gc_type == GcType::Bg {
				GcMode::CostBenefit
			} else {
				GcMode::Greedy
			};
			(mode, DIRTY, nr_dirty[DIRTY], self.segs_per_sec())
		};
		let gc_mode_idx = if gc_mode == GcMode::CostBenefit { 0 } else { 1 };
		VictimSelPolicy {
			alloc_mode,
			gc_mode,
			dirty_type,
			max_search: max_search.min(MAX_SEARCH_LIMIT),
			offset: sbi.last_victim[gc_mode_idx].load(Ordering::Relaxed),
			ofs_unit,
			min_cost: 0,
			min_segno: NULL_SEGNO,
		}
	}

	fn max_cost(&self, policy: &VictimSelPolicy) -> u32 {
		match policy.alloc_mode {
			AllocMode::Ssr => self.blocks_per_seg(),
			AllocMode::Lfs => {
				if policy.gc_mode == GcMode::Greedy {
					2 * self.blocks_per_seg() * policy.ofs_unit
				} else {
					u32::MAX
				}
			}
		}
	}

	fn greedy_cost(&self, sit: &SitInfo, segno: u32) -> u32 {
		let valid_blocks = if self.segs_per_sec() > 1 {
			sit.sec_entries[self.secno_of(segno) as usize]
		} else {
			sit.sentries[segno as usize].valid_blocks as u32
		};
		let t = CursegType::from_index(sit.sentries[segno as usize].seg_type as usize);
		if t.is_data() {
			2 * valid_blocks
		} else {
			valid_blocks
		}
	}

	/// Cost-benefit: emptier and colder sections win; younger segments are
	/// penalised in proportion to their age.
	fn cost_benefit_cost(&self, sit: &SitInfo, segno: u32) -> u32 {
		let valid_blocks = sit.sentries[segno as usize].valid_blocks as u64;
		let mtime = sit.sentries[segno as usize].mtime;
		let age = sit.max_mtime.saturating_sub(mtime) + 1;
		(valid_blocks * 100 / age).min(u32::MAX as u64 - 1) as u32
	}

	fn gc_cost(&self, sit: &SitInfo, segno: u32, policy: &VictimSelPolicy) -> u32 {
		if policy.alloc_mode == AllocMode::Ssr {
			return sit.sentries[segno as usize].ckpt_valid_blocks as u32;
		}
		match policy.gc_mode {
			GcMode::Greedy => self.greedy_cost(sit, segno),
			GcMode::CostBenefit => self.cost_benefit_cost(sit, segno),
		}
	}

	/// Pick the cheapest victim among dirty segments: for GC (greedy in
	/// foreground, cost-benefit in background) or for SSR (most-reclaimable
	/// segment of the requested type). Returns the winning segment number.
	pub(crate) fn get_victim_by_default(
		&self,
		sit: &SitInfo,
		gc_type: GcType,
		t: CursegType,
		alloc_mode: AllocMode,
		avoid_secno: u32,
		sbi: &SuperblockInfo,
	) -> Option<u32> {
		let dirty = self.dirty.lock().unwrap();
		let mut policy = self.victim_policy(sbi, &dirty.nr_dirty, gc_type, t, alloc_mode);
		policy.min_cost = self.max_cost(&policy);
		let gc_mode_idx = if policy.gc_mode == GcMode::CostBenefit { 0 } else { 1 };

		if policy.max_search == 0 {
			return None;
		}

		let mut n_searched = 0u32;
		let mut last_segment = self.main_segments();
		let segmap = &dirty.dirty_segmap[policy.dirty_type];

		while n_searched < policy.max_search {
			let segno = bits::find_next_bit(
				segmap,
				last_segment as usize,
				policy.offset as usize,
			) as u32;
			if segno >= last_segment {
				let last_victim = sbi.last_victim[gc_mode_idx].load(Ordering::Relaxed);
				if last_victim != 0 {
					last_segment = last_victim;
					sbi.last_victim[gc_mode_idx].store(0, Ordering::Relaxed);
					policy.offset = 0;
					continue;
				}
				break;
			}

			policy.offset = segno + policy.ofs_unit;
			let secno = self.secno_of(segno);

			if policy.ofs_unit > 1 {
				policy.offset -= segno % policy.ofs_unit;
				n_searched += bits::count_bits(
					segmap,
					(policy.offset - policy.ofs_unit) as usize,
					policy.ofs_unit as usize,
				) as u32;
			} else {
				n_searched += 1;
			}

			// data segments move only via SSR until data cleaning exists
			let seg_t =
				CursegType::from_index(sit.sentries[segno as usize].seg_type as usize);
			if policy.alloc_mode == AllocMode::Lfs && seg_t.is_data() {
				continue;
			}

			if self.is_cur_sec(secno) || secno == avoid_secno {
				continue;
			}
			if gc_type == GcType::Bg && bits::test_bit(secno as usize, &dirty.victim_secmap) {
				continue;
			}

			let cost = self.gc_cost(sit, segno, &policy);
			if policy.min_cost > cost {
				policy.min_segno = segno;
				policy.min_cost = cost;
			}
			if cost == self.max_cost(&policy) {
				continue;
			}
			if n_searched >= policy.max_search {
				sbi.last_victim[gc_mode_idx]
					.store((segno + 1) % self.main_segments(), Ordering::Relaxed);
			}
		}

		if policy.min_segno == NULL_SEGNO {
			return None;
		}
		Some((policy.min_segno / policy.ofs_unit) * policy.ofs_unit)
	}
}

/// Serialises cleaning runs and remembers the section being cleaned so
/// victim selection does not hand it out twice.
pub struct GcManager {
	gc_mutex:       Mutex<()>,
	cur_victim_sec: AtomicU32,
}

impl GcManager {
	pub fn new() -> Self {
		Self {
			gc_mutex:       Mutex::new(()),
			cur_victim_sec: AtomicU32::new(NULL_SECNO),
		}
	}

	pub fn cur_victim_sec(&self) -> u32 {
		self.cur_victim_sec.load(Ordering::Acquire)
	}

	fn set_cur_victim_sec(&self, secno: u32) {
		self.cur_victim_sec.store(secno, Ordering::Release);
	}
}

impl F2fs {
	fn get_gc_victim(&self, gc_type: GcType) -> Option<u32> {
		let sit = self.sm.sit.lock().unwrap();
		self.sm.get_victim_by_default(
			&sit,
			gc_type,
			CursegType::HotData, // type is ignored for LFS victims
			AllocMode::Lfs,
			self.gc.cur_victim_sec(),
			&self.sbi,
		)
	}

	/// Foreground cleaning: migrate victims until enough sections are free,
	/// writing a checkpoint after each pass so the freed blocks become
	/// reusable.
	pub fn garbage_collect(&self) -> IoResult<u32> {
		let _gc = self.gc.gc_mutex.lock().unwrap();
		let gc_type = GcType::Fg;
		let mut sec_freed = 0u32;
		// a victim whose summaries are all stale frees nothing; bound the
		// walk so such segments cannot spin the cleaner
		let mut rounds = self.sm.main_segments();

		loop {
			if rounds == 0 {
				break;
			}
			rounds -= 1;
			if self.sbi.cp_error() {
				return Err(err!(EROFS));
			}

			// prefree segments may already satisfy the request once a
			// checkpoint retires them
			if self.sm.prefree_segments() > 0 {
				self.write_checkpoint(false)?;
				if !self.sm.has_not_enough_free_secs() {
					break;
				}
			}

			let segno = match self.get_gc_victim(gc_type) {
				Some(segno) => segno,
				None => break,
			};
			if gc_type == GcType::Fg {
				self.gc.set_cur_victim_sec(self.sm.secno_of(segno));
			}

			self.do_garbage_collect(segno, gc_type)?;

			if gc_type == GcType::Fg {
				self.gc.set_cur_victim_sec(NULL_SECNO);
				self.write_checkpoint(false)?;
				sec_freed += 1;
			}

			if !self.sm.has_not_enough_free_secs() {
				break;
			}
		}
		if sec_freed == 0 {
			log::warn!("cleaning freed no sections");
		}
		Ok(sec_freed)
	}

	fn do_garbage_collect(&self, start_segno: u32, gc_type: GcType) -> IoResult<()> {
		for i in 0..self.sbi.segs_per_sec() {
			let segno = start_segno + i;
			if self.sm.valid_blocks_of(segno, false) == 0 {
				continue;
			}

			let sum_page = self.get_sum_page(segno)?;
			let sum: SummaryBlock = sum_page.decode()?;
			if sum.footer.entry_type != SUM_TYPE_NODE {
				// data segments are skipped at victim selection
				continue;
			}
			self.gc_node_segment(&sum, segno, gc_type)?;
		}
		Ok(())
	}

	fn check_valid_map(&self, segno: u32, offset: u32) -> bool {
		let sit = self.sm.sit.lock().unwrap();
		bits::test_valid_bit(
			offset as usize,
			&sit.sentries[segno as usize].cur_valid_map,
		)
	}

	/// Migrate the live node blocks of a victim segment by dirtying their
	/// pages; writeback relocates them to the current node log.
	fn gc_node_segment(&self, sum: &SummaryBlock, segno: u32, gc_type: GcType) -> IoResult<()> {
		for off in 0..self.sbi.blocks_per_seg() {
			let entry = &sum.entries[off as usize];
			let nid = entry.nid;

			if gc_type == GcType::Bg && self.sm.has_not_enough_free_secs() {
				return Err(err!(EROFS));
			}
			if !self.check_valid_map(segno, off) {
				continue;
			}

			let node_page = match self.get_node_page(nid) {
				Ok(page) => page,
				Err(_) => continue,
			};

			let ni = self.get_node_info(nid)?;
			if ni.blk_addr != self.sm.start_block(segno) + off {
				// stale summary; the node moved since this SSA was written
				continue;
			}

			self.node_cache.set_dirty(&node_page);
		}
		self.flush_dirty_node_pages()?;
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn victim_sec_marker_roundtrip() {
		let gc = GcManager::new();
		assert_eq!(gc.cur_victim_sec(), NULL_SECNO);
		gc.set_cur_victim_sec(7);
		assert_eq!(gc.cur_victim_sec(), 7);
	}
}
