//! Formatter. The produced image is bit-compatible with what the mount path
//! consumes: two superblocks, a dual checkpoint pack, mirrored SIT/NAT
//! areas, SSA, and a seeded root directory.

use std::io::{Error as IoError, ErrorKind, Result as IoResult};

use crate::{
	bcache::Bcache,
	bits, err, iobail,
	layout::{
		self, Checkpoint, DentryBlock, DirEntry, NatBlock, NodeBlock, SitEntry, SummaryBlock,
		SuperBlock, BLOCK_SIZE, CHECKPOINT_SEGMENTS, CP_CHKSUM_OFFSET, CP_UMOUNT_FLAG,
		DEFAULT_BLOCKS_PER_SEGMENT, DEFAULT_SECTORS_PER_BLOCK, DEFAULT_SECTOR_SIZE,
		EXTENSION_LEN, F2FS_SUPER_MAGIC, MAJOR_VERSION, MAX_EXTENSION, MEDIA_EXT_LIST,
		MINOR_VERSION, NAT_ENTRY_PER_BLOCK, NR_CURSEG_TYPE, SIT_ENTRY_PER_BLOCK,
		SIT_VBLOCKS_SHIFT, SUM_TYPE_DATA, SUM_TYPE_NODE, SUPER_OFFSET,
	},
	segment::CursegType,
	vnode::timespec_now,
};

#[derive(Debug, Clone)]
pub struct MkfsOptions {
	/// Volume label, at most 15 characters.
	pub label:         Option<String>,
	/// Heap-style allocation: node logs start from the volume top.
	pub heap:          bool,
	/// Overprovision percentage; 0 selects it automatically.
	pub overprovision: u32,
	pub segs_per_sec:  u32,
	pub secs_per_zone: u32,
	/// Extra cold-file extensions appended to the built-in media list.
	pub extensions:    Vec<String>,
}

impl Default for MkfsOptions {
	fn default() -> Self {
		Self {
			label:         None,
			heap:          true,
			overprovision: 5,
			segs_per_sec:  1,
			secs_per_zone: 1,
			extensions:    Vec::new(),
		}
	}
}

pub struct MkfsWorker<'a> {
	bc:   &'a Bcache,
	opts: MkfsOptions,
	sb:   SuperBlock,

	blks_per_seg:      u32,
	reserved_segments: u32,
	overprovision:     u32,
	cur_seg:           [u32; NR_CURSEG_TYPE],
}

impl<'a> MkfsWorker<'a> {
	pub fn new(bc: &'a Bcache, opts: MkfsOptions) -> IoResult<Self> {
		if let Some(label) = &opts.label {
			if label.len() > 15 {
				iobail!(ErrorKind::InvalidInput, "label length should be less than 16");
			}
		}
		if opts.segs_per_sec == 0 || opts.secs_per_zone == 0 {
			iobail!(ErrorKind::InvalidInput, "sections and zones must be non-empty");
		}
		if opts.overprovision >= 100 {
			iobail!(ErrorKind::InvalidInput, "overprovision ratio must be below 100");
		}
		Ok(Self {
			bc,
			opts,
			sb: SuperBlock::zeroed(),
			blks_per_seg: DEFAULT_BLOCKS_PER_SEGMENT,
			reserved_segments: 0,
			overprovision: 0,
			cur_seg: [0; NR_CURSEG_TYPE],
		})
	}

	pub fn format(&mut self) -> IoResult<()> {
		self.prepare_super_block()?;
		self.bc.trim(0, self.bc.block_count())?;
		self.init_sit_area()?;
		self.init_nat_area()?;
		self.create_root_dir()?;
		self.write_checkpoint_pack()?;
		self.write_super_block()?;
		self.bc.flush()?;
		log::info!(
			"formatted: {} segments ({} main), overprovision {}%",
			self.sb.segment_count,
			self.sb.segment_count_main,
			self.overprovision
		);
		Ok(())
	}

	/// Best overprovision ratio: the one maximising user segments while the
	/// implied reserve still fits.
	fn calculate_op(&self, main_segments: u32) -> IoResult<u32> {
		let op = self.opts.overprovision;
		if op > 0 && op < 100 {
			return Ok(op);
		}
		let mut best = 0u32;
		let mut best_user = 0u32;
		for op in 1..100u32 {
			let reserved = (2 * (100 / op + 1) + NR_CURSEG_TYPE as u32) * self.opts.segs_per_sec;
			if main_segments < reserved + 2 {
				continue;
			}
			let user =
				main_segments - ((main_segments - reserved) * op / 100) - reserved;
			if user > best_user {
				best_user = user;
				best = op;
			}
		}
		if best == 0 {
			return Err(err!(ENOSPC));
		}
		Ok(best)
	}

	fn prepare_super_block(&mut self) -> IoResult<()> {
		let sb = &mut self.sb;
		sb.magic = F2FS_SUPER_MAGIC;
		sb.major_ver = MAJOR_VERSION;
		sb.minor_ver = MINOR_VERSION;
		sb.log_sectorsize = DEFAULT_SECTOR_SIZE.trailing_zeros();
		sb.log_sectors_per_block = DEFAULT_SECTORS_PER_BLOCK.trailing_zeros();
		sb.log_blocksize = layout::LOG_BLOCK_SIZE;
		sb.log_blocks_per_seg = self.blks_per_seg.trailing_zeros();
		sb.segs_per_sec = self.opts.segs_per_sec;
		sb.secs_per_zone = self.opts.secs_per_zone;
		sb.checksum_offset = 0;
		sb.cp_payload = 0;

		let blk_bytes = BLOCK_SIZE as u64;
		let seg_bytes = blk_bytes * self.blks_per_seg as u64;
		let zone_bytes =
			seg_bytes * self.opts.segs_per_sec as u64 * self.opts.secs_per_zone as u64;
		let device_bytes = self.bc.block_count() as u64 * blk_bytes;

		sb.block_count = device_bytes / blk_bytes;

		// the first zone holds the two superblock carriers
		let zone_align_start = (2 * blk_bytes + zone_bytes - 1) / zone_bytes * zone_bytes;
		sb.segment_count = ((device_bytes - zone_align_start) / seg_bytes) as u32;
		sb.segment0_blkaddr = (zone_align_start / blk_bytes) as u32;
		sb.cp_blkaddr = sb.segment0_blkaddr;
		sb.segment_count_ckpt = CHECKPOINT_SEGMENTS;

		sb.sit_blkaddr = sb.segment0_blkaddr + sb.segment_count_ckpt * self.blks_per_seg;
		let blocks_for_sit =
			(sb.segment_count + SIT_ENTRY_PER_BLOCK as u32 - 1) / SIT_ENTRY_PER_BLOCK as u32;
		let sit_segments = (blocks_for_sit + self.blks_per_seg - 1) / self.blks_per_seg;
		sb.segment_count_sit = sit_segments * 2;

		sb.nat_blkaddr = sb.sit_blkaddr + sb.segment_count_sit * self.blks_per_seg;
		let avail = sb
			.segment_count
			.checked_sub(sb.segment_count_ckpt + sb.segment_count_sit)
			.ok_or_else(|| err!(ENOSPC))?
			* self.blks_per_seg;
		let blocks_for_nat =
			(avail + NAT_ENTRY_PER_BLOCK as u32 - 1) / NAT_ENTRY_PER_BLOCK as u32;
		sb.segment_count_nat = (blocks_for_nat + self.blks_per_seg - 1) / self.blks_per_seg;

		// the NAT version bitmap has to fit in the checkpoint block next to
		// the SIT one
		let sit_bitmap_size = ((sb.segment_count_sit / 2) << sb.log_blocks_per_seg) / 8;
		let max_nat_bitmap = layout::CP_BITMAP_BYTES as u32 - sit_bitmap_size;
		let max_nat_segments = (max_nat_bitmap * 8) >> sb.log_blocks_per_seg;
		if sb.segment_count_nat > max_nat_segments {
			sb.segment_count_nat = max_nat_segments;
		}
		sb.segment_count_nat *= 2;

		sb.ssa_blkaddr = sb.nat_blkaddr + sb.segment_count_nat * self.blks_per_seg;
		let avail = sb
			.segment_count
			.checked_sub(
				sb.segment_count_ckpt + sb.segment_count_sit + sb.segment_count_nat,
			)
			.ok_or_else(|| err!(ENOSPC))?
			* self.blks_per_seg;
		let blocks_for_ssa = avail / self.blks_per_seg + 1;
		sb.segment_count_ssa = (blocks_for_ssa + self.blks_per_seg - 1) / self.blks_per_seg;

		let zone_segs = self.opts.segs_per_sec * self.opts.secs_per_zone;
		let total_meta = sb.segment_count_ckpt
			+ sb.segment_count_sit
			+ sb.segment_count_nat
			+ sb.segment_count_ssa;
		if total_meta % zone_segs != 0 {
			sb.segment_count_ssa += zone_segs - total_meta % zone_segs;
		}

		sb.main_blkaddr = sb.ssa_blkaddr + sb.segment_count_ssa * self.blks_per_seg;
		sb.segment_count_main = sb
			.segment_count
			.checked_sub(
				sb.segment_count_ckpt
					+ sb.segment_count_sit
					+ sb.segment_count_nat
					+ sb.segment_count_ssa,
			)
			.ok_or_else(|| err!(ENOSPC))?;
		sb.section_count = sb.segment_count_main / self.opts.segs_per_sec;
		sb.segment_count_main = sb.section_count * self.opts.segs_per_sec;

		let segment_count_main = sb.segment_count_main;
		self.overprovision = self.calculate_op(segment_count_main)?;
		self.reserved_segments =
			(2 * (100 / self.overprovision + 1) + NR_CURSEG_TYPE as u32)
				* self.opts.segs_per_sec;
		let sb = &mut self.sb;
		if segment_count_main < self.reserved_segments + 2 {
			log::error!(
				"device too small: {} main segments, {} reserved",
				segment_count_main,
				self.reserved_segments
			);
			return Err(err!(ENOSPC));
		}

		sb.uuid = *uuid::Uuid::new_v4().as_bytes();
		if let Some(label) = &self.opts.label {
			for (i, c) in label.encode_utf16().enumerate() {
				sb.volume_name[i] = c;
			}
		} else {
			for (i, c) in "F2FS".encode_utf16().enumerate() {
				sb.volume_name[i] = c;
			}
		}

		sb.node_ino = 1;
		sb.meta_ino = 2;
		sb.root_ino = 3;

		let total_zones =
			((sb.segment_count_main - 1) / self.opts.segs_per_sec) / self.opts.secs_per_zone;
		if total_zones <= 6 {
			log::error!("{total_zones} zones: need more zones, shrink the zone size");
			return Err(err!(ENOSPC));
		}

		let zone_segs = self.opts.segs_per_sec * self.opts.secs_per_zone;
		let cur = &mut self.cur_seg;
		if self.opts.heap {
			cur[CursegType::HotNode.index()] =
				(total_zones - 1) * zone_segs + (self.opts.secs_per_zone - 1) * self.opts.segs_per_sec;
			cur[CursegType::WarmNode.index()] = cur[CursegType::HotNode.index()] - zone_segs;
			cur[CursegType::ColdNode.index()] = cur[CursegType::WarmNode.index()] - zone_segs;
			cur[CursegType::HotData.index()] = cur[CursegType::ColdNode.index()] - zone_segs;
			cur[CursegType::ColdData.index()] = 0;
			cur[CursegType::WarmData.index()] = cur[CursegType::ColdData.index()] + zone_segs;
		} else {
			cur[CursegType::HotNode.index()] = 0;
			cur[CursegType::WarmNode.index()] = zone_segs;
			cur[CursegType::ColdNode.index()] = 2 * zone_segs;
			cur[CursegType::HotData.index()] = 3 * zone_segs;
			cur[CursegType::ColdData.index()] = 4 * zone_segs;
			cur[CursegType::WarmData.index()] = 5 * zone_segs;
		}

		// built-in media extensions first, user additions after
		let mut count = 0usize;
		for ext in MEDIA_EXT_LIST.iter().map(|s| s.to_string()).chain(self.opts.extensions.clone())
		{
			if count >= MAX_EXTENSION {
				break;
			}
			let bytes = ext.as_bytes();
			let n = bytes.len().min(EXTENSION_LEN);
			sb.extension_list[count][..n].copy_from_slice(&bytes[..n]);
			count += 1;
		}
		sb.extension_count = count as u32;
		Ok(())
	}

	fn write_block<T: bincode::Encode>(&self, val: &T, blkaddr: u32) -> IoResult<()> {
		let mut buf = vec![0u8; BLOCK_SIZE];
		layout::encode(val, &mut buf)?;
		self.bc.write_blk(blkaddr, &buf)
	}

	fn init_sit_area(&self) -> IoResult<()> {
		let zero = vec![0u8; BLOCK_SIZE];
		let mut blkaddr = self.sb.sit_blkaddr;
		for _ in 0..(self.sb.segment_count_sit / 2) {
			for b in 0..self.blks_per_seg {
				self.bc.write_blk(blkaddr + b, &zero)?;
			}
			blkaddr += self.blks_per_seg;
		}
		Ok(())
	}

	fn init_nat_area(&self) -> IoResult<()> {
		let zero = vec![0u8; BLOCK_SIZE];
		let mut blkaddr = self.sb.nat_blkaddr;
		for _ in 0..(self.sb.segment_count_nat / 2) {
			for b in 0..self.blks_per_seg {
				self.bc.write_blk(blkaddr + b, &zero)?;
			}
			// copies of one logical NAT block sit a segment pair apart
			blkaddr += 2 * self.blks_per_seg;
		}
		Ok(())
	}

	fn root_node_addr(&self) -> u32 {
		self.sb.main_blkaddr + self.cur_seg[CursegType::HotNode.index()] * self.blks_per_seg
	}

	fn root_data_addr(&self) -> u32 {
		self.sb.main_blkaddr + self.cur_seg[CursegType::HotData.index()] * self.blks_per_seg
	}

	fn write_root_inode(&self) -> IoResult<()> {
		let mut node = NodeBlock::zeroed();
		node.footer.nid = self.sb.root_ino;
		node.footer.ino = self.sb.root_ino;
		node.footer.cp_ver = 1;
		node.footer.next_blkaddr = self.root_node_addr() + 1;

		let now = timespec_now();
		let mut inode = node.inode()?;
		inode.mode = 0o040755;
		inode.links = 2;
		inode.uid = unsafe { libc::getuid() };
		inode.gid = unsafe { libc::getgid() };
		inode.size = BLOCK_SIZE as u64;
		inode.blocks = 2;
		inode.atime = now.sec;
		inode.atime_nsec = now.nsec;
		inode.ctime = now.sec;
		inode.ctime_nsec = now.nsec;
		inode.mtime = now.sec;
		inode.mtime_nsec = now.nsec;
		inode.current_depth = 1;
		inode.namelen = 1;
		inode.name[0] = b'/';
		inode.addr[0] = self.root_data_addr();
		inode.ext.fofs = 0;
		inode.ext.blk_addr = self.root_data_addr();
		inode.ext.len = 1;
		node.set_inode(&inode)?;

		self.write_block(&node, self.root_node_addr())?;

		// terminate the warm chain scan right after the root inode
		let garbage = vec![0xffu8; BLOCK_SIZE];
		self.bc.write_blk(self.root_node_addr() + 1, &garbage)
	}

	fn update_nat_root(&self) -> IoResult<()> {
		let mut nat = NatBlock::zeroed();
		nat.entries[self.sb.root_ino as usize].ino = self.sb.root_ino;
		nat.entries[self.sb.root_ino as usize].block_addr = self.root_node_addr();
		nat.entries[self.sb.node_ino as usize].ino = self.sb.node_ino;
		nat.entries[self.sb.node_ino as usize].block_addr = 1;
		nat.entries[self.sb.meta_ino as usize].ino = self.sb.meta_ino;
		nat.entries[self.sb.meta_ino as usize].block_addr = 1;
		self.write_block(&nat, self.sb.nat_blkaddr)
	}

	fn add_default_dentry_root(&self) -> IoResult<()> {
		let mut blk = DentryBlock::zeroed();
		blk.dentry[0] = DirEntry {
			hash_code: 0,
			ino:       self.sb.root_ino,
			name_len:  1,
			file_type: layout::FT_DIR,
		};
		blk.set_name(0, b".");
		blk.dentry[1] = DirEntry {
			hash_code: 0,
			ino:       self.sb.root_ino,
			name_len:  2,
			file_type: layout::FT_DIR,
		};
		blk.set_name(1, b"..");
		blk.dentry_bitmap[0] = 0b11;
		self.write_block(&blk, self.root_data_addr())
	}

	fn create_root_dir(&self) -> IoResult<()> {
		self.write_root_inode()?;
		self.update_nat_root()?;
		self.add_default_dentry_root()
	}

	fn write_checkpoint_pack(&self) -> IoResult<()> {
		let mut ckpt = Checkpoint::zeroed();
		ckpt.checkpoint_ver = 1;
		for i in 0..3 {
			ckpt.cur_node_segno[i] = self.cur_seg[3 + i];
			ckpt.cur_data_segno[i] = self.cur_seg[i];
		}
		for i in 3..layout::MAX_ACTIVE_NODE_LOGS {
			ckpt.cur_node_segno[i] = u32::MAX;
			ckpt.cur_data_segno[i] = u32::MAX;
		}
		ckpt.cur_node_blkoff[0] = 1;
		ckpt.cur_data_blkoff[0] = 1;
		ckpt.valid_block_count = 2;
		ckpt.rsvd_segment_count = self.reserved_segments;
		ckpt.overprov_segment_count = (self.sb.segment_count_main
			- ckpt.rsvd_segment_count)
			* self.overprovision
			/ 100;
		ckpt.overprov_segment_count += ckpt.rsvd_segment_count;
		ckpt.free_segment_count = self.sb.segment_count_main - NR_CURSEG_TYPE as u32;
		ckpt.user_block_count = ((ckpt.free_segment_count + NR_CURSEG_TYPE as u32
			- ckpt.overprov_segment_count)
			* self.blks_per_seg) as u64;
		ckpt.cp_pack_total_block_count = 8;
		ckpt.set_flag(CP_UMOUNT_FLAG);
		ckpt.cp_pack_start_sum = 1;
		ckpt.valid_node_count = 1;
		ckpt.valid_inode_count = 1;
		ckpt.next_free_nid = self.sb.root_ino + 1;
		ckpt.sit_ver_bitmap_bytesize =
			((self.sb.segment_count_sit / 2) << self.sb.log_blocks_per_seg) / 8;
		ckpt.nat_ver_bitmap_bytesize =
			((self.sb.segment_count_nat / 2) << self.sb.log_blocks_per_seg) / 8;
		ckpt.checksum_offset = CP_CHKSUM_OFFSET as u32;

		let cp_base = self.sb.segment0_blkaddr;
		let mut buf = vec![0u8; BLOCK_SIZE];
		ckpt.write_to(&mut buf)?;
		self.bc.write_blk(cp_base, &buf)?;

		// data summaries: hot carries the root dentry block, cold the SIT
		// journal seeding the six open segments
		let mut sum = SummaryBlock::zeroed();
		sum.footer.entry_type = SUM_TYPE_DATA;
		sum.entries[0] = layout::Summary::new(self.sb.root_ino, 0, 0);
		self.write_block(&sum, cp_base + 1)?;

		let mut sum = SummaryBlock::zeroed();
		sum.footer.entry_type = SUM_TYPE_DATA;
		self.write_block(&sum, cp_base + 2)?;

		let mut sum = SummaryBlock::zeroed();
		sum.footer.entry_type = SUM_TYPE_DATA;
		sum.set_journal_count(6);
		let journal_order = [
			(CursegType::HotNode, 1u16),
			(CursegType::WarmNode, 0),
			(CursegType::ColdNode, 0),
			(CursegType::HotData, 1),
			(CursegType::WarmData, 0),
			(CursegType::ColdData, 0),
		];
		for (i, (t, vblocks)) in journal_order.iter().enumerate() {
			let mut se = SitEntry::zeroed();
			se.vblocks = ((t.index() as u16) << SIT_VBLOCKS_SHIFT) | vblocks;
			if *vblocks > 0 {
				bits::set_valid_bit(0, &mut se.valid_map);
			}
			sum.set_sit_in_journal(i, self.cur_seg[t.index()], &se);
		}
		self.write_block(&sum, cp_base + 3)?;

		// node summaries
		let mut sum = SummaryBlock::zeroed();
		sum.footer.entry_type = SUM_TYPE_NODE;
		sum.entries[0] = layout::Summary::new(self.sb.root_ino, 0, 0);
		self.write_block(&sum, cp_base + 4)?;

		let mut sum = SummaryBlock::zeroed();
		sum.footer.entry_type = SUM_TYPE_NODE;
		self.write_block(&sum, cp_base + 5)?;
		self.write_block(&sum, cp_base + 6)?;

		// closing copy of pack 1
		self.bc.write_blk(cp_base + 7, &buf)?;

		// pack 2 is stamped version 0 so pack 1 wins
		ckpt.checkpoint_ver = 0;
		let mut buf2 = vec![0u8; BLOCK_SIZE];
		ckpt.write_to(&mut buf2)?;
		self.bc
			.write_blk(cp_base + self.blks_per_seg, &buf2)?;
		Ok(())
	}

	fn write_super_block(&self) -> IoResult<()> {
		let mut buf = vec![0u8; BLOCK_SIZE];
		layout::encode(&self.sb, &mut buf[SUPER_OFFSET..])?;
		self.bc.write_blk(0, &buf)?;
		self.bc.write_blk(1, &buf)
	}
}

/// Format `bc` with `opts`.
pub fn mkfs(bc: &Bcache, opts: MkfsOptions) -> IoResult<()> {
	if bc.block_count() == 0 {
		return Err(IoError::new(ErrorKind::InvalidInput, "empty device"));
	}
	MkfsWorker::new(bc, opts)?.format()
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::bcache::MemDevice;

	fn format_mem(blocks: u32) -> (Bcache, SuperBlock) {
		let bc = Bcache::new(Box::new(MemDevice::new(blocks))).unwrap();
		let mut worker = MkfsWorker::new(&bc, MkfsOptions::default()).unwrap();
		worker.format().unwrap();
		let sb = worker.sb.clone();
		(bc, sb)
	}

	#[test]
	fn regions_are_ordered_and_disjoint() {
		let (_bc, sb) = format_mem(102400); // 400 MiB
		assert_eq!(sb.magic, F2FS_SUPER_MAGIC);
		assert!(sb.cp_blkaddr < sb.sit_blkaddr);
		assert!(sb.sit_blkaddr < sb.nat_blkaddr);
		assert!(sb.nat_blkaddr < sb.ssa_blkaddr);
		assert!(sb.ssa_blkaddr < sb.main_blkaddr);

		let meta = sb.segment_count_ckpt
			+ sb.segment_count_sit
			+ sb.segment_count_nat
			+ sb.segment_count_ssa;
		assert!(meta < sb.segment_count);
		assert_eq!(
			sb.main_blkaddr,
			sb.segment0_blkaddr + meta * DEFAULT_BLOCKS_PER_SEGMENT
		);
		assert_eq!(sb.root_ino, 3);
	}

	#[test]
	fn label_too_long_is_rejected() {
		let bc = Bcache::new(Box::new(MemDevice::new(1024))).unwrap();
		let opts = MkfsOptions {
			label: Some("averylonglabel-x".to_string()),
			..Default::default()
		};
		assert!(MkfsWorker::new(&bc, opts).is_err());
	}

	#[test]
	fn tiny_device_runs_out_of_space() {
		let bc = Bcache::new(Box::new(MemDevice::new(1024))).unwrap(); // 4 MiB
		let mut worker = MkfsWorker::new(&bc, MkfsOptions::default()).unwrap();
		assert!(worker.format().is_err());
	}

	#[test]
	fn checkpoint_pack_is_loadable() {
		let (bc, sb) = format_mem(102400);
		let (ckpt, trailer) = crate::checkpoint::load_checkpoint(&bc, &sb).unwrap();
		assert_eq!(ckpt.checkpoint_ver, 1);
		assert!(ckpt.is_set(CP_UMOUNT_FLAG));
		assert_eq!(ckpt.valid_node_count, 1);
		assert_eq!(ckpt.valid_inode_count, 1);
		assert_eq!(ckpt.next_free_nid, 4);
		assert!(trailer.is_empty());
		assert!(ckpt.user_block_count > 0);
	}
}
