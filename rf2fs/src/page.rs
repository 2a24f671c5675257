use std::{
	collections::{BTreeMap, BTreeSet},
	io::Result as IoResult,
	sync::{
		atomic::{AtomicI64, AtomicU32, Ordering},
		Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
	},
};

use bincode::{Decode, Encode};

use crate::layout::{self, BLOCK_SIZE};

const FLAG_UPTODATE: u32 = 1 << 0;
const FLAG_DIRTY: u32 = 1 << 1;
const FLAG_WRITEBACK: u32 = 1 << 2;
const FLAG_LOCKED: u32 = 1 << 3;

/// Per-mount dirty/writeback page accounting. Checkpoint drain loops and
/// back-pressure decisions key off these counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountType {
	DirtyDents = 0,
	DirtyNodes = 1,
	DirtyMeta = 2,
	DirtyData = 3,
	Writeback = 4,
}

pub struct PageCounters {
	counts: [AtomicI64; 5],
}

impl PageCounters {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			counts: [
				AtomicI64::new(0),
				AtomicI64::new(0),
				AtomicI64::new(0),
				AtomicI64::new(0),
				AtomicI64::new(0),
			],
		})
	}

	pub fn inc(&self, t: CountType) {
		self.counts[t as usize].fetch_add(1, Ordering::Relaxed);
	}

	pub fn dec(&self, t: CountType) {
		self.counts[t as usize].fetch_sub(1, Ordering::Relaxed);
	}

	pub fn get(&self, t: CountType) -> i64 {
		self.counts[t as usize].load(Ordering::Relaxed)
	}
}

/// A cached filesystem block. The buffer is the host analogue of the
/// original's VMO page; flags are independent atomics so dirty/writeback
/// transitions need no data lock.
pub struct Page {
	index: u64,
	flags: AtomicU32,
	data:  RwLock<Box<[u8; BLOCK_SIZE]>>,
}

impl Page {
	fn new(index: u64) -> Arc<Self> {
		Arc::new(Self {
			index,
			flags: AtomicU32::new(0),
			data: RwLock::new(Box::new([0; BLOCK_SIZE])),
		})
	}

	pub fn index(&self) -> u64 {
		self.index
	}

	fn test(&self, flag: u32) -> bool {
		self.flags.load(Ordering::Acquire) & flag != 0
	}

	fn set(&self, flag: u32) -> bool {
		self.flags.fetch_or(flag, Ordering::AcqRel) & flag != 0
	}

	fn clear(&self, flag: u32) -> bool {
		self.flags.fetch_and(!flag, Ordering::AcqRel) & flag != 0
	}

	pub fn is_uptodate(&self) -> bool {
		self.test(FLAG_UPTODATE)
	}

	pub fn set_uptodate(&self) {
		self.set(FLAG_UPTODATE);
	}

	pub fn clear_uptodate(&self) {
		self.clear(FLAG_UPTODATE);
	}

	pub fn is_dirty(&self) -> bool {
		self.test(FLAG_DIRTY)
	}

	pub fn is_writeback(&self) -> bool {
		self.test(FLAG_WRITEBACK)
	}

	/// Cooperative page lock; writeback harvesting skips pages it cannot
	/// take.
	pub fn try_lock(&self) -> bool {
		!self.set(FLAG_LOCKED)
	}

	pub fn unlock(&self) {
		self.clear(FLAG_LOCKED);
	}

	pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8; BLOCK_SIZE]>> {
		self.data.read().unwrap()
	}

	pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8; BLOCK_SIZE]>> {
		self.data.write().unwrap()
	}

	pub fn decode<T: Decode>(&self) -> IoResult<T> {
		layout::decode(&self.read()[..])
	}

	pub fn encode<T: Encode>(&self, val: &T) -> IoResult<()> {
		layout::encode(val, &mut self.write()[..])?;
		Ok(())
	}

	pub fn zero(&self) {
		self.write().fill(0);
	}

	pub fn zero_range(&self, start: usize, end: usize) {
		self.write()[start..end].fill(0);
	}

	pub fn fill_from(&self, buf: &[u8]) {
		self.write().copy_from_slice(buf);
	}

	pub fn copy_from(&self, other: &Page) {
		self.write().copy_from_slice(&other.read()[..]);
	}
}

/// Per-owner page cache: one per vnode, plus one each for the node and meta
/// pseudo-files. A separate index set tracks dirty pages so writeback scans
/// cost O(dirty), not O(cached).
pub struct FileCache {
	count_type: CountType,
	counters:   Arc<PageCounters>,
	pages:      RwLock<BTreeMap<u64, Arc<Page>>>,
	dirty:      Mutex<BTreeSet<u64>>,
}

impl FileCache {
	pub fn new(count_type: CountType, counters: Arc<PageCounters>) -> Self {
		Self {
			count_type,
			counters,
			pages: RwLock::new(BTreeMap::new()),
			dirty: Mutex::new(BTreeSet::new()),
		}
	}

	pub fn count_type(&self) -> CountType {
		self.count_type
	}

	/// Look up or create the page at `index`.
	pub fn grab(&self, index: u64) -> Arc<Page> {
		if let Some(page) = self.pages.read().unwrap().get(&index) {
			return page.clone();
		}
		let mut pages = self.pages.write().unwrap();
		pages.entry(index).or_insert_with(|| Page::new(index)).clone()
	}

	pub fn find(&self, index: u64) -> Option<Arc<Page>> {
		self.pages.read().unwrap().get(&index).cloned()
	}

	/// Mark dirty, accounting the transition exactly once. Returns whether
	/// the page was already dirty.
	pub fn set_dirty(&self, page: &Page) -> bool {
		page.set_uptodate();
		if page.set(FLAG_DIRTY) {
			return true;
		}
		self.dirty.lock().unwrap().insert(page.index());
		self.counters.inc(self.count_type);
		false
	}

	/// Clear the dirty bit for writeback. Returns true when this call owned
	/// the transition and the page must be written.
	pub fn clear_dirty_for_io(&self, page: &Page) -> bool {
		if !page.clear(FLAG_DIRTY) {
			return false;
		}
		self.dirty.lock().unwrap().remove(&page.index());
		self.counters.dec(self.count_type);
		true
	}

	pub fn set_writeback(&self, page: &Page) {
		if !page.set(FLAG_WRITEBACK) {
			self.counters.inc(CountType::Writeback);
		}
	}

	pub fn clear_writeback(&self, page: &Page) {
		if page.clear(FLAG_WRITEBACK) {
			self.counters.dec(CountType::Writeback);
		}
	}

	pub fn dirty_count(&self) -> usize {
		self.dirty.lock().unwrap().len()
	}

	/// Snapshot of the dirty indices; iteration happens without the list
	/// lock so writeback may mutate the cache while walking.
	pub fn dirty_indices(&self) -> Vec<u64> {
		self.dirty.lock().unwrap().iter().copied().collect()
	}

	/// Drop every cached page, dirty ones included.
	pub fn invalidate(&self) {
		let mut pages = self.pages.write().unwrap();
		let mut dirty = self.dirty.lock().unwrap();
		for (_, page) in pages.iter() {
			if page.clear(FLAG_DIRTY) {
				self.counters.dec(self.count_type);
			}
		}
		dirty.clear();
		pages.clear();
	}

	/// Drop cached pages with `start <= index < end`.
	pub fn invalidate_range(&self, start: u64, end: u64) {
		let mut pages = self.pages.write().unwrap();
		let mut dirty = self.dirty.lock().unwrap();
		let doomed: Vec<u64> = pages.range(start..end).map(|(i, _)| *i).collect();
		for index in doomed {
			if let Some(page) = pages.remove(&index) {
				if page.clear(FLAG_DIRTY) {
					self.counters.dec(self.count_type);
				}
			}
			dirty.remove(&index);
		}
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn dirty_accounting_is_exact() {
		let counters = PageCounters::new();
		let cache = FileCache::new(CountType::DirtyData, counters.clone());

		let page = cache.grab(7);
		assert!(!cache.set_dirty(&page));
		assert!(cache.set_dirty(&page));
		assert_eq!(counters.get(CountType::DirtyData), 1);
		assert_eq!(cache.dirty_indices(), vec![7]);

		assert!(cache.clear_dirty_for_io(&page));
		assert!(!cache.clear_dirty_for_io(&page));
		assert_eq!(counters.get(CountType::DirtyData), 0);
		assert!(cache.dirty_indices().is_empty());
	}

	#[test]
	fn grab_returns_same_page() {
		let cache = FileCache::new(CountType::DirtyMeta, PageCounters::new());
		let a = cache.grab(1);
		let b = cache.grab(1);
		assert!(Arc::ptr_eq(&a, &b));
		assert!(cache.find(2).is_none());
	}

	#[test]
	fn invalidate_clears_dirty_counts() {
		let counters = PageCounters::new();
		let cache = FileCache::new(CountType::DirtyMeta, counters.clone());
		for i in 0..4 {
			let p = cache.grab(i);
			cache.set_dirty(&p);
		}
		cache.invalidate_range(0, 2);
		assert_eq!(counters.get(CountType::DirtyMeta), 2);
		cache.invalidate();
		assert_eq!(counters.get(CountType::DirtyMeta), 0);
	}

	#[test]
	fn cooperative_lock() {
		let cache = FileCache::new(CountType::DirtyData, PageCounters::new());
		let p = cache.grab(0);
		assert!(p.try_lock());
		assert!(!p.try_lock());
		p.unlock();
		assert!(p.try_lock());
	}
}
