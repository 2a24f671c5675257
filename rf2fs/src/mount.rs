use std::{
	collections::HashSet,
	io::{Error as IoError, ErrorKind, Result as IoResult},
	sync::{
		atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
		Arc, Mutex, OnceLock, RwLock,
	},
	time::{SystemTime, UNIX_EPOCH},
};

use crate::{
	bcache::Bcache,
	err, iobail,
	layout::{
		Checkpoint, SuperBlock, BLOCK_SIZE, F2FS_SUPER_MAGIC, LOG_BLOCK_SIZE, NAT_ENTRY_PER_BLOCK,
		SUPER_OFFSET,
	},
	node::NodeManager,
	page::{CountType, FileCache, PageCounters},
	segment::SegmentManager,
	vnode::{Vnode, VnodeCache},
};

/// Mount-time configuration. Non-listed behaviour is compiled in.
#[derive(Debug, Clone)]
pub struct MountOptions {
	/// Do not run background cleaning.
	pub background_gc_off:   bool,
	/// Skip roll-forward recovery at mount and force checkpoints on fsync.
	pub disable_roll_forward: bool,
	/// Issue TRIM when prefree segments become free.
	pub discard:             bool,
	/// Allocate new segments bottom-up instead of from the volume top.
	pub no_heap:             bool,
	/// Skip the multimedia-extension cold-data heuristic.
	pub disable_ext_identify: bool,
	pub inline_xattr:        bool,
	pub inline_data:         bool,
	pub inline_dentry:       bool,
	/// Number of active logs: 2, 4 or 6.
	pub active_logs:         u8,
}

impl Default for MountOptions {
	fn default() -> Self {
		Self {
			background_gc_off:    true,
			disable_roll_forward: false,
			discard:              true,
			no_heap:              false,
			disable_ext_identify: true,
			inline_xattr:         true,
			inline_data:          true,
			inline_dentry:        true,
			active_logs:          6,
		}
	}
}

#[derive(Debug, Default)]
pub struct Counts {
	pub total_valid_block_count: u64,
	pub alloc_valid_block_count: u64,
	pub last_valid_block_count:  u64,
	pub valid_node_count:        u32,
	pub valid_inode_count:       u32,
}

/// Filesystem statistics, shaped for statfs-style reporting.
#[derive(Debug, Clone)]
pub struct FsInfo {
	pub block_size:     u32,
	pub total_blocks:   u64,
	pub free_blocks:    u64,
	pub total_nodes:    u64,
	pub valid_inodes:   u64,
	pub free_segments:  u32,
	pub dirty_segments: u32,
	pub prefree_segments: u32,
	pub utilization:    u32,
}

/// Parsed superblock plus all mount-lifetime shared state: the live
/// checkpoint, counters, the lock hierarchy roots and the orphan set.
pub struct SuperblockInfo {
	pub(crate) raw:  SuperBlock,
	pub(crate) opts: MountOptions,

	pub(crate) ckpt:       RwLock<Checkpoint>,
	pub(crate) cp_trailer: RwLock<Vec<[u8; BLOCK_SIZE]>>,

	// geometry, cached from the superblock
	log_blocks_per_seg: u32,
	blocks_per_seg:     u32,
	segs_per_sec:       u32,
	secs_per_zone:      u32,
	total_sections:     u32,
	total_node_count:   u32,

	pub(crate) user_block_count: u32,
	pub(crate) counters:         Mutex<Counts>,
	pub(crate) page_counts:      Arc<PageCounters>,

	// lock hierarchy roots; see the module docs in checkpoint.rs
	pub(crate) cp_mutex:  Mutex<()>,
	pub(crate) file_lock: RwLock<()>,
	pub(crate) node_lock: RwLock<()>,

	pub(crate) orphans:           Mutex<std::collections::BTreeSet<u32>>,
	pub(crate) modified_dir_inos: Mutex<HashSet<u32>>,

	s_dirty:     AtomicBool,
	cp_error:    AtomicBool,
	on_recovery: AtomicBool,
	teardown:    AtomicBool,

	next_generation: AtomicU32,
	pub(crate) last_victim: [AtomicU32; 2],

	oos_events:    AtomicU64,
	oos_last_sec:  AtomicU64,

	/// Allocated segment/block counts per alloc mode (LFS, SSR).
	pub(crate) segment_count_mode: [AtomicU64; 2],
	pub(crate) block_count_mode:   [AtomicU64; 2],
}

impl SuperblockInfo {
	pub fn new(raw: SuperBlock, opts: MountOptions) -> Self {
		let log_blocks_per_seg = raw.log_blocks_per_seg;
		let blocks_per_seg = 1u32 << log_blocks_per_seg;
		let total_node_count =
			(raw.segment_count_nat / 2) * blocks_per_seg * NAT_ENTRY_PER_BLOCK as u32;
		Self {
			log_blocks_per_seg,
			blocks_per_seg,
			segs_per_sec: raw.segs_per_sec,
			secs_per_zone: raw.secs_per_zone,
			total_sections: raw.section_count,
			total_node_count,
			user_block_count: 0,
			raw,
			opts,
			ckpt: RwLock::new(Checkpoint::zeroed()),
			cp_trailer: RwLock::new(Vec::new()),
			counters: Mutex::new(Counts::default()),
			page_counts: PageCounters::new(),
			cp_mutex: Mutex::new(()),
			file_lock: RwLock::new(()),
			node_lock: RwLock::new(()),
			orphans: Mutex::new(std::collections::BTreeSet::new()),
			modified_dir_inos: Mutex::new(HashSet::new()),
			s_dirty: AtomicBool::new(false),
			cp_error: AtomicBool::new(false),
			on_recovery: AtomicBool::new(false),
			teardown: AtomicBool::new(false),
			next_generation: AtomicU32::new(0),
			last_victim: [AtomicU32::new(0), AtomicU32::new(0)],
			oos_events: AtomicU64::new(0),
			oos_last_sec: AtomicU64::new(0),
			segment_count_mode: [AtomicU64::new(0), AtomicU64::new(0)],
			block_count_mode: [AtomicU64::new(0), AtomicU64::new(0)],
		}
	}

	pub fn raw(&self) -> &SuperBlock {
		&self.raw
	}

	pub fn opts(&self) -> &MountOptions {
		&self.opts
	}

	pub fn log_blocks_per_seg(&self) -> u32 {
		self.log_blocks_per_seg
	}

	pub fn blocks_per_seg(&self) -> u32 {
		self.blocks_per_seg
	}

	pub fn segs_per_sec(&self) -> u32 {
		self.segs_per_sec
	}

	pub fn secs_per_zone(&self) -> u32 {
		self.secs_per_zone
	}

	pub fn total_sections(&self) -> u32 {
		self.total_sections
	}

	pub fn total_node_count(&self) -> u32 {
		self.total_node_count
	}

	pub fn root_ino(&self) -> u32 {
		self.raw.root_ino
	}

	pub fn node_ino(&self) -> u32 {
		self.raw.node_ino
	}

	pub fn meta_ino(&self) -> u32 {
		self.raw.meta_ino
	}

	pub fn active_logs(&self) -> usize {
		self.opts.active_logs as usize
	}

	pub fn cp_ver(&self) -> u64 {
		self.ckpt.read().unwrap().checkpoint_ver
	}

	/// Base of the checkpoint pack the *current* version belongs to: odd
	/// versions live in slot 0, even versions in slot 1.
	pub fn start_cp_addr(&self) -> u32 {
		let mut addr = self.raw.cp_blkaddr;
		if self.cp_ver() & 1 == 0 {
			addr += self.blocks_per_seg;
		}
		addr
	}

	pub fn start_sum_addr(&self) -> u32 {
		self.ckpt.read().unwrap().cp_pack_start_sum
	}

	pub fn set_dirty(&self) {
		self.s_dirty.store(true, Ordering::Release);
	}

	pub fn clear_dirty(&self) {
		self.s_dirty.store(false, Ordering::Release);
	}

	pub fn is_dirty(&self) -> bool {
		self.s_dirty.load(Ordering::Acquire)
	}

	pub fn cp_error(&self) -> bool {
		self.cp_error.load(Ordering::Acquire)
	}

	pub fn set_cp_error(&self) {
		self.cp_error.store(true, Ordering::Release);
	}

	pub fn on_recovery(&self) -> bool {
		self.on_recovery.load(Ordering::Acquire)
	}

	pub fn set_on_recovery(&self, v: bool) {
		self.on_recovery.store(v, Ordering::Release);
	}

	pub fn teardown(&self) -> bool {
		self.teardown.load(Ordering::Acquire)
	}

	pub fn set_teardown(&self) {
		self.teardown.store(true, Ordering::Release);
	}

	pub fn next_generation(&self) -> u32 {
		self.next_generation.fetch_add(1, Ordering::Relaxed)
	}

	pub fn page_count(&self, t: CountType) -> i64 {
		self.page_counts.get(t)
	}

	/// Admit `count` new blocks, or fail with `ENOSPC`.
	pub fn inc_valid_block_count(&self, vnode: Option<&Vnode>, count: u64) -> IoResult<()> {
		let mut c = self.counters.lock().unwrap();
		if c.total_valid_block_count + count > self.user_block_count as u64 {
			drop(c);
			self.note_out_of_space();
			return Err(err!(ENOSPC));
		}
		c.total_valid_block_count += count;
		c.alloc_valid_block_count += count;
		if let Some(vnode) = vnode {
			vnode.inc_blocks(count);
		}
		Ok(())
	}

	pub fn dec_valid_block_count(&self, vnode: Option<&Vnode>, count: u64) {
		let mut c = self.counters.lock().unwrap();
		debug_assert!(c.total_valid_block_count >= count);
		c.total_valid_block_count = c.total_valid_block_count.saturating_sub(count);
		if let Some(vnode) = vnode {
			vnode.dec_blocks(count);
		}
	}

	pub fn inc_valid_node_count(&self, vnode: Option<&Vnode>, count: u32) -> IoResult<()> {
		let mut c = self.counters.lock().unwrap();
		if c.total_valid_block_count + count as u64 > self.user_block_count as u64 {
			drop(c);
			self.note_out_of_space();
			return Err(err!(ENOSPC));
		}
		if c.valid_node_count + count > self.total_node_count {
			return Err(err!(ENOSPC));
		}
		c.total_valid_block_count += count as u64;
		c.alloc_valid_block_count += count as u64;
		c.valid_node_count += count;
		if let Some(vnode) = vnode {
			vnode.inc_blocks(count as u64);
		}
		Ok(())
	}

	pub fn dec_valid_node_count(&self, vnode: Option<&Vnode>, count: u32) {
		let mut c = self.counters.lock().unwrap();
		debug_assert!(c.valid_node_count >= count);
		debug_assert!(c.total_valid_block_count >= count as u64);
		c.valid_node_count = c.valid_node_count.saturating_sub(count);
		c.total_valid_block_count = c.total_valid_block_count.saturating_sub(count as u64);
		if let Some(vnode) = vnode {
			vnode.dec_blocks(count as u64);
		}
	}

	pub fn inc_valid_inode_count(&self) {
		self.counters.lock().unwrap().valid_inode_count += 1;
	}

	pub fn dec_valid_inode_count(&self) {
		let mut c = self.counters.lock().unwrap();
		debug_assert!(c.valid_inode_count >= 1);
		c.valid_inode_count = c.valid_inode_count.saturating_sub(1);
	}

	pub fn valid_user_blocks(&self) -> u64 {
		self.counters.lock().unwrap().total_valid_block_count
	}

	pub fn valid_node_count(&self) -> u32 {
		self.counters.lock().unwrap().valid_node_count
	}

	pub fn valid_inode_count(&self) -> u32 {
		self.counters.lock().unwrap().valid_inode_count
	}

	pub fn user_block_count(&self) -> u32 {
		self.user_block_count
	}

	pub fn out_of_space_events(&self) -> u64 {
		self.oos_events.load(Ordering::Relaxed)
	}

	/// Count an out-of-space event, debounced to one per second so a
	/// retrying writer does not flood the counter.
	fn note_out_of_space(&self) {
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs();
		let last = self.oos_last_sec.load(Ordering::Relaxed);
		if now != last
			&& self
				.oos_last_sec
				.compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
				.is_ok()
		{
			self.oos_events.fetch_add(1, Ordering::Relaxed);
		}
	}
}

/// The mounted filesystem: block shim, shared superblock state and the
/// node/segment managers wired together at mount.
pub struct F2fs {
	pub(crate) bc:         Bcache,
	pub(crate) sbi:        SuperblockInfo,
	pub(crate) nm:         NodeManager,
	pub(crate) sm:         SegmentManager,
	pub(crate) gc:         crate::gc::GcManager,
	pub(crate) vcache:     VnodeCache,
	pub(crate) meta_cache: FileCache,
	pub(crate) node_cache: FileCache,
	root: OnceLock<Arc<Vnode>>,
}

impl F2fs {
	/// Mount a formatted device.
	pub fn mount(bc: Bcache, opts: MountOptions) -> IoResult<Arc<F2fs>> {
		if !matches!(opts.active_logs, 2 | 4 | 6) {
			iobail!(ErrorKind::InvalidInput, "active_logs must be 2, 4 or 6");
		}

		let raw = Self::read_raw_super(&bc)?;
		Self::sanity_check_raw_super(&raw)?;

		let mut sbi = SuperblockInfo::new(raw, opts);
		let (ckpt, trailer) = crate::checkpoint::load_checkpoint(&bc, &sbi.raw)?;
		Self::sanity_check_ckpt(&sbi.raw, &ckpt)?;

		sbi.user_block_count = ckpt.user_block_count as u32;
		{
			let mut c = sbi.counters.lock().unwrap();
			c.total_valid_block_count = ckpt.valid_block_count;
			c.last_valid_block_count = ckpt.valid_block_count;
			c.alloc_valid_block_count = 0;
			c.valid_node_count = ckpt.valid_node_count;
			c.valid_inode_count = ckpt.valid_inode_count;
		}
		let nm = NodeManager::new(&sbi.raw, &ckpt);
		let sm = SegmentManager::new(&sbi.raw, &ckpt);
		*sbi.ckpt.write().unwrap() = ckpt;
		*sbi.cp_trailer.write().unwrap() = trailer;

		let page_counts = sbi.page_counts.clone();
		let fs = Arc::new(F2fs {
			bc,
			sbi,
			nm,
			sm,
			gc: crate::gc::GcManager::new(),
			vcache: VnodeCache::new(),
			meta_cache: FileCache::new(CountType::DirtyMeta, page_counts.clone()),
			node_cache: FileCache::new(CountType::DirtyNodes, page_counts),
			root: OnceLock::new(),
		});

		fs.build_segment_manager()?;
		fs.build_node_manager()?;

		fs.recover_orphan_inodes()?;

		let root = fs.vget(fs.sbi.root_ino())?;
		if !root.is_dir() || root.blocks() == 0 || root.size() == 0 {
			iobail!(ErrorKind::InvalidData, "root inode is corrupted");
		}
		let _ = fs.root.set(root);

		if !fs.sbi.opts.disable_roll_forward {
			fs.recover_fsync_data()?;
		}

		log::info!(
			"mounted: {} segments, {} free, cp version {}",
			fs.sm.main_segments(),
			fs.sm.free_segments(),
			fs.sbi.cp_ver()
		);
		Ok(fs)
	}

	pub fn root(&self) -> Arc<Vnode> {
		self.root.get().expect("mounted filesystem has a root").clone()
	}

	/// Flush everything and write a final checkpoint carrying node
	/// summaries.
	pub fn unmount(&self) -> IoResult<()> {
		self.purge_inactive_orphans()?;
		self.write_checkpoint(true)?;
		self.sbi.set_teardown();
		self.bc.flush()
	}

	/// Durable checkpoint of the whole filesystem.
	pub fn sync_fs(&self) -> IoResult<()> {
		self.purge_inactive_orphans()?;
		self.write_checkpoint(false)
	}

	pub fn info(&self) -> FsInfo {
		let valid = self.sbi.valid_user_blocks();
		FsInfo {
			block_size:       BLOCK_SIZE as u32,
			total_blocks:     self.sbi.user_block_count() as u64,
			free_blocks:      self.sbi.user_block_count() as u64 - valid,
			total_nodes:      self.sbi.total_node_count() as u64,
			valid_inodes:     self.sbi.valid_inode_count() as u64,
			free_segments:    self.sm.free_segments(),
			dirty_segments:   self.sm.dirty_segments(),
			prefree_segments: self.sm.prefree_segments(),
			utilization:      self.utilization(),
		}
	}

	/// Version of the live checkpoint.
	pub fn checkpoint_version(&self) -> u64 {
		self.sbi.cp_ver()
	}

	/// Writes are refused once teardown began or a writeback error made the
	/// mount effectively read-only.
	pub(crate) fn check_rw(&self) -> IoResult<()> {
		if self.sbi.teardown() {
			return Err(err!(EBADF));
		}
		if self.sbi.cp_error() {
			return Err(err!(EROFS));
		}
		Ok(())
	}

	pub fn utilization(&self) -> u32 {
		let user = self.sbi.user_block_count() as u64;
		if user == 0 {
			return 0;
		}
		(self.sbi.valid_user_blocks() * 100 / user) as u32
	}

	pub fn out_of_space_events(&self) -> u64 {
		self.sbi.out_of_space_events()
	}

	fn read_raw_super(bc: &Bcache) -> IoResult<SuperBlock> {
		let mut buf = vec![0u8; BLOCK_SIZE];
		for copy in 0..2u32 {
			if let Err(e) = bc.read_blk(copy, &mut buf) {
				log::warn!("unable to read superblock copy {copy}: {e}");
				continue;
			}
			match crate::layout::decode::<SuperBlock>(&buf[SUPER_OFFSET..]) {
				Ok(sb) if sb.magic == F2FS_SUPER_MAGIC => return Ok(sb),
				Ok(sb) => {
					log::warn!("superblock copy {copy} has bad magic {:#x}", sb.magic)
				}
				Err(e) => log::warn!("superblock copy {copy} undecodable: {e}"),
			}
		}
		Err(IoError::new(
			ErrorKind::InvalidData,
			"no valid superblock found",
		))
	}

	fn sanity_check_raw_super(raw: &SuperBlock) -> IoResult<()> {
		if raw.log_blocksize != LOG_BLOCK_SIZE {
			iobail!(
				ErrorKind::InvalidData,
				"unsupported block size: 2^{}",
				raw.log_blocksize
			);
		}
		if raw.log_sectorsize > LOG_BLOCK_SIZE || raw.log_sectorsize < 9 {
			iobail!(
				ErrorKind::InvalidData,
				"unsupported sector size: 2^{}",
				raw.log_sectorsize
			);
		}
		if raw.log_sectors_per_block + raw.log_sectorsize != LOG_BLOCK_SIZE {
			iobail!(ErrorKind::InvalidData, "inconsistent sector geometry");
		}
		if raw.segs_per_sec == 0 || raw.secs_per_zone == 0 {
			iobail!(ErrorKind::InvalidData, "zero-sized section or zone");
		}
		Ok(())
	}

	fn sanity_check_ckpt(raw: &SuperBlock, ckpt: &Checkpoint) -> IoResult<()> {
		let total = raw.segment_count;
		let fsmeta = raw.segment_count_ckpt
			+ raw.segment_count_sit
			+ raw.segment_count_nat
			+ ckpt.rsvd_segment_count
			+ raw.segment_count_ssa;
		if fsmeta >= total {
			iobail!(
				ErrorKind::InvalidData,
				"metadata segments ({fsmeta}) exceed volume ({total})"
			);
		}

		let sit_bitmap_size = ((raw.segment_count_sit / 2) << raw.log_blocks_per_seg) / 8;
		let nat_bitmap_size = ((raw.segment_count_nat / 2) << raw.log_blocks_per_seg) / 8;
		let nat_blocks = (raw.segment_count_nat / 2) << raw.log_blocks_per_seg;
		if ckpt.sit_ver_bitmap_bytesize != sit_bitmap_size
			|| ckpt.nat_ver_bitmap_bytesize != nat_bitmap_size
			|| ckpt.next_free_nid >= NAT_ENTRY_PER_BLOCK as u32 * nat_blocks
		{
			iobail!(ErrorKind::InvalidData, "checkpoint disagrees with superblock");
		}
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn defaults_match_documented_values() {
		let opts = MountOptions::default();
		assert!(opts.discard);
		assert!(!opts.no_heap);
		assert!(!opts.disable_roll_forward);
		assert!(opts.inline_dentry);
		assert_eq!(opts.active_logs, 6);
	}

	#[test]
	fn block_admission_is_bounded() {
		let mut raw = SuperBlock::zeroed();
		raw.log_blocks_per_seg = 9;
		raw.segment_count_nat = 2;
		let mut sbi = SuperblockInfo::new(raw, MountOptions::default());
		sbi.user_block_count = 10;

		sbi.inc_valid_block_count(None, 10).unwrap();
		let e = sbi.inc_valid_block_count(None, 1).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ENOSPC));
		sbi.dec_valid_block_count(None, 4);
		sbi.inc_valid_block_count(None, 2).unwrap();
		assert_eq!(sbi.valid_user_blocks(), 8);
		assert!(sbi.out_of_space_events() >= 1);
	}
}
