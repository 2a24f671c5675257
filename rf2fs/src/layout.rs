use std::io::{Error as IoError, ErrorKind, Result as IoResult};

use bincode::{
	config::{Configuration, Fixint, LittleEndian, NoLimit},
	Decode, Encode,
};

/// Filesystem magic number, stored in both superblock copies.
pub const F2FS_SUPER_MAGIC: u32 = 0xF2F5_2010;

/// Byte offset of the superblock within its carrier block.
pub const SUPER_OFFSET: usize = 1024;

pub const MAJOR_VERSION: u16 = 1;
pub const MINOR_VERSION: u16 = 0;

/// Fixed filesystem block size.
pub const BLOCK_SIZE: usize = 4096;
pub const LOG_BLOCK_SIZE: u32 = 12;

pub const DEFAULT_SECTOR_SIZE: u32 = 512;
pub const DEFAULT_SECTORS_PER_BLOCK: u32 = 8;
pub const DEFAULT_BLOCKS_PER_SEGMENT: u32 = 512;

/// Number of segments reserved for the two checkpoint packs.
pub const CHECKPOINT_SEGMENTS: u32 = 2;

/// An unallocated block address.
pub const NULL_ADDR: u32 = 0;

/// A reserved-but-unwritten block address.
pub const NEW_ADDR: u32 = 0xFFFF_FFFF;

pub const NULL_NID: u32 = 0;
pub const NULL_SEGNO: u32 = u32::MAX;
pub const NULL_SECNO: u32 = u32::MAX;

/// Hard-link limit per inode.
pub const LINK_MAX: u32 = 32000;

/// Maximum file name length in bytes.
pub const MAX_NAME_LEN: usize = 255;

// Node tree geometry.
pub const ADDRS_PER_INODE: usize = 923;
pub const ADDRS_PER_BLOCK: usize = 1018;
pub const NIDS_PER_BLOCK: usize = 1018;

// Child slot indices in the inode's nid array, continuing the address space
// right after the direct addresses.
pub const NODE_DIR1_BLOCK: usize = ADDRS_PER_INODE + 1;
pub const NODE_DIR2_BLOCK: usize = ADDRS_PER_INODE + 2;
pub const NODE_IND1_BLOCK: usize = ADDRS_PER_INODE + 3;
pub const NODE_IND2_BLOCK: usize = ADDRS_PER_INODE + 4;
pub const NODE_DIND_BLOCK: usize = ADDRS_PER_INODE + 5;

pub const NAT_ENTRY_PER_BLOCK: usize = 455;
pub const SIT_ENTRY_PER_BLOCK: usize = 55;
pub const SIT_VBLOCK_MAP_SIZE: usize = 64;
pub const SIT_VBLOCKS_SHIFT: u16 = 10;
pub const SIT_VBLOCKS_MASK: u16 = (1 << SIT_VBLOCKS_SHIFT) - 1;

pub const ENTRIES_IN_SUM: usize = 512;
pub const SUMMARY_SIZE: usize = 7;
pub const SUM_ENTRY_SIZE: usize = SUMMARY_SIZE * ENTRIES_IN_SUM;
pub const SUM_FOOTER_SIZE: usize = 3;
/// Byte size of the journal area of a summary block, excluding the leading
/// 2-byte entry count.
pub const SUM_JOURNAL_SIZE: usize = BLOCK_SIZE - SUM_ENTRY_SIZE - SUM_FOOTER_SIZE - 2;

pub const NAT_JOURNAL_ENTRY_SIZE: usize = 13;
pub const SIT_JOURNAL_ENTRY_SIZE: usize = 4 + SIT_ENTRY_SIZE;
pub const NAT_JOURNAL_ENTRIES: usize = SUM_JOURNAL_SIZE / NAT_JOURNAL_ENTRY_SIZE;
pub const SIT_JOURNAL_ENTRIES: usize = SUM_JOURNAL_SIZE / SIT_JOURNAL_ENTRY_SIZE;

pub const SIT_ENTRY_SIZE: usize = 74;

pub const SUM_TYPE_DATA: u8 = 0;
pub const SUM_TYPE_NODE: u8 = 1;

// Checkpoint flags.
pub const CP_UMOUNT_FLAG: u32 = 0x0000_0001;
pub const CP_ORPHAN_PRESENT_FLAG: u32 = 0x0000_0002;
pub const CP_COMPACT_SUM_FLAG: u32 = 0x0000_0004;
pub const CP_ERROR_FLAG: u32 = 0x0000_0008;

/// Byte offset of the checkpoint CRC within the checkpoint block.
pub const CP_CHKSUM_OFFSET: usize = 4092;
/// Space available for the SIT/NAT version bitmaps inside the checkpoint.
pub const CP_BITMAP_BYTES: usize = CP_CHKSUM_OFFSET - 192;

pub const MAX_ACTIVE_LOGS: usize = 16;
pub const MAX_ACTIVE_NODE_LOGS: usize = 8;
pub const MAX_ACTIVE_DATA_LOGS: usize = 8;
pub const NR_CURSEG_DATA_TYPE: usize = 3;
pub const NR_CURSEG_NODE_TYPE: usize = 3;
pub const NR_CURSEG_TYPE: usize = NR_CURSEG_DATA_TYPE + NR_CURSEG_NODE_TYPE;

pub const ORPHANS_PER_BLOCK: usize = 1020;

// Dentry blocks.
pub const NR_DENTRY_IN_BLOCK: usize = 214;
pub const SIZE_OF_DIR_ENTRY: usize = 11;
pub const SIZE_OF_DENTRY_BITMAP: usize = 27;
pub const SIZE_OF_DENTRY_RESERVED: usize = 3;
/// A file name occupies `ceil(len / DENTRY_SLOT_LEN)` consecutive slots.
pub const DENTRY_SLOT_LEN: usize = 8;

pub const MAX_DIR_HASH_DEPTH: u32 = 63;
pub const HASH_COL_BIT: u32 = 1 << 31;

// i_inline flags.
pub const INLINE_XATTR: u8 = 0x01;
pub const INLINE_DATA: u8 = 0x02;
pub const INLINE_DENTRY: u8 = 0x04;
pub const DATA_EXIST: u8 = 0x08;
pub const EXTRA_ATTR: u8 = 0x20;

/// Address slots reserved for inline xattrs at the tail of the inline region.
pub const INLINE_XATTR_ADDRS: usize = 50;
/// The first address slot is kept out of the inline region.
pub const INLINE_START_OFFSET: usize = 1;
/// Byte capacity of inline file data.
pub const MAX_INLINE_DATA: usize = 4 * (ADDRS_PER_INODE - INLINE_XATTR_ADDRS - INLINE_START_OFFSET);
/// Dentry slots available to an inline directory.
pub const NR_INLINE_DENTRY: usize =
	MAX_INLINE_DATA * 8 / ((SIZE_OF_DIR_ENTRY + DENTRY_SLOT_LEN) * 8 + 1);
pub const INLINE_DENTRY_BITMAP_SIZE: usize = (NR_INLINE_DENTRY + 7) / 8;

/// Byte offset of the inline region within a node block payload.
pub const INLINE_DATA_OFFSET: usize = INODE_ADDR_OFFSET + 4 * INLINE_START_OFFSET;

// Inode payload offsets (within the 4072-byte node payload).
pub const INODE_NAME_OFFSET: usize = 92;
pub const INODE_EXT_OFFSET: usize = 348;
pub const INODE_ADDR_OFFSET: usize = 360;

pub const NODE_PAYLOAD_SIZE: usize = 4072;
pub const NODE_FOOTER_SIZE: usize = 24;

// Node footer flag bits.
pub const COLD_BIT_SHIFT: u32 = 0;
pub const FSYNC_BIT_SHIFT: u32 = 1;
pub const DENT_BIT_SHIFT: u32 = 2;
pub const OFFSET_BIT_SHIFT: u32 = 11;

pub const CRC_POLY_LE: u32 = 0xEDB8_8320;

pub const MAX_EXTENSION: usize = 64;
pub const EXTENSION_LEN: usize = 8;
pub const VOLUME_NAME_LEN: usize = 512;

/// Extensions that steer file data to the cold log by default.
pub const MEDIA_EXT_LIST: [&str; 23] = [
	"jpg", "gif", "png", "avi", "divx", "mp4", "mp3", "3gp", "wmv", "wma", "mpeg", "mkv", "mov",
	"asx", "asf", "wmx", "svi", "wvx", "wm", "mpg", "mpe", "rm", "ogg",
];

// On-disk file types stored in dentries.
pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_CHRDEV: u8 = 3;
pub const FT_BLKDEV: u8 = 4;
pub const FT_FIFO: u8 = 5;
pub const FT_SOCK: u8 = 6;
pub const FT_SYMLINK: u8 = 7;
pub const FT_MAX: u8 = 8;
/// Pseudo file type used by the offline checker for orphan traversal.
pub const FT_ORPHAN: u8 = FT_MAX;

// Mode bits, kept POSIX-compatible on disk.
pub const S_IFMT: u16 = 0o170000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFREG: u16 = 0o100000;

pub fn is_dir_mode(mode: u16) -> bool {
	(mode & S_IFMT) == S_IFDIR
}

pub fn file_type_of_mode(mode: u16) -> u8 {
	match mode & S_IFMT {
		S_IFDIR => FT_DIR,
		S_IFREG => FT_REG_FILE,
		_ => FT_UNKNOWN,
	}
}

pub const fn disk_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
	bincode::config::standard()
		.with_fixed_int_encoding()
		.with_little_endian()
}

pub fn decode<T: Decode>(buf: &[u8]) -> IoResult<T> {
	bincode::decode_from_slice(buf, disk_config())
		.map(|(v, _)| v)
		.map_err(|_| IoError::new(ErrorKind::InvalidData, "failed to decode on-disk structure"))
}

pub fn encode<T: Encode>(val: &T, buf: &mut [u8]) -> IoResult<usize> {
	bincode::encode_into_slice(val, buf, disk_config())
		.map_err(|_| IoError::new(ErrorKind::InvalidData, "failed to encode on-disk structure"))
}

/// Table-free CRC-32 over little-endian bit order, seeded with the magic.
pub fn crc32(mut crc: u32, buf: &[u8]) -> u32 {
	for b in buf {
		crc ^= *b as u32;
		for _ in 0..8 {
			let low = crc & 1;
			crc = (crc >> 1) ^ if low != 0 { CRC_POLY_LE } else { 0 };
		}
	}
	crc
}

pub fn f2fs_crc32(buf: &[u8]) -> u32 {
	crc32(F2FS_SUPER_MAGIC, buf)
}

pub fn f2fs_crc_valid(expected: u32, buf: &[u8]) -> bool {
	f2fs_crc32(buf) == expected
}

pub fn ver_after(a: u64, b: u64) -> bool {
	(a.wrapping_sub(b) as i64) > 0
}

/// Superblock. Two identical copies live at byte offset 1024 of blocks 0
/// and 1.
#[derive(Debug, Clone, Encode, Decode)]
pub struct SuperBlock {
	pub magic:                 u32,
	pub major_ver:             u16,
	pub minor_ver:             u16,
	pub log_sectorsize:        u32,
	pub log_sectors_per_block: u32,
	pub log_blocksize:         u32,
	pub log_blocks_per_seg:    u32,
	pub segs_per_sec:          u32,
	pub secs_per_zone:         u32,
	pub checksum_offset:       u32,
	pub block_count:           u64,
	pub section_count:         u32,
	pub segment_count:         u32,
	pub segment_count_ckpt:    u32,
	pub segment_count_sit:     u32,
	pub segment_count_nat:     u32,
	pub segment_count_ssa:     u32,
	pub segment_count_main:    u32,
	pub segment0_blkaddr:      u32,
	pub cp_blkaddr:            u32,
	pub sit_blkaddr:           u32,
	pub nat_blkaddr:           u32,
	pub ssa_blkaddr:           u32,
	pub main_blkaddr:          u32,
	pub root_ino:              u32,
	pub node_ino:              u32,
	pub meta_ino:              u32,
	pub uuid:                  [u8; 16],
	pub volume_name:           [u16; VOLUME_NAME_LEN],
	pub extension_count:       u32,
	pub extension_list:        [[u8; EXTENSION_LEN]; MAX_EXTENSION],
	pub cp_payload:            u32,
}

impl SuperBlock {
	pub fn zeroed() -> Self {
		Self {
			magic:                 0,
			major_ver:             0,
			minor_ver:             0,
			log_sectorsize:        0,
			log_sectors_per_block: 0,
			log_blocksize:         0,
			log_blocks_per_seg:    0,
			segs_per_sec:          0,
			secs_per_zone:         0,
			checksum_offset:       0,
			block_count:           0,
			section_count:         0,
			segment_count:         0,
			segment_count_ckpt:    0,
			segment_count_sit:     0,
			segment_count_nat:     0,
			segment_count_ssa:     0,
			segment_count_main:    0,
			segment0_blkaddr:      0,
			cp_blkaddr:            0,
			sit_blkaddr:           0,
			nat_blkaddr:           0,
			ssa_blkaddr:           0,
			main_blkaddr:          0,
			root_ino:              0,
			node_ino:              0,
			meta_ino:              0,
			uuid:                  [0; 16],
			volume_name:           [0; VOLUME_NAME_LEN],
			extension_count:       0,
			extension_list:        [[0; EXTENSION_LEN]; MAX_EXTENSION],
			cp_payload:            0,
		}
	}

	pub fn extensions(&self) -> Vec<String> {
		let mut out = Vec::new();
		for i in 0..(self.extension_count as usize).min(MAX_EXTENSION) {
			let raw = &self.extension_list[i];
			let len = raw.iter().position(|b| *b == 0).unwrap_or(EXTENSION_LEN);
			if let Ok(s) = std::str::from_utf8(&raw[..len]) {
				if !s.is_empty() {
					out.push(s.to_string());
				}
			}
		}
		out
	}
}

/// Checkpoint block. The SIT version bitmap sits first in the shared bitmap
/// area, the NAT version bitmap directly after it; the CRC covers everything
/// up to `checksum_offset`.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Checkpoint {
	pub checkpoint_ver:            u64,
	pub user_block_count:          u64,
	pub valid_block_count:         u64,
	pub rsvd_segment_count:        u32,
	pub overprov_segment_count:    u32,
	pub free_segment_count:        u32,
	pub cur_node_segno:            [u32; MAX_ACTIVE_NODE_LOGS],
	pub cur_node_blkoff:           [u16; MAX_ACTIVE_NODE_LOGS],
	pub cur_data_segno:            [u32; MAX_ACTIVE_DATA_LOGS],
	pub cur_data_blkoff:           [u16; MAX_ACTIVE_DATA_LOGS],
	pub ckpt_flags:                u32,
	pub cp_pack_total_block_count: u32,
	pub cp_pack_start_sum:         u32,
	pub valid_node_count:          u32,
	pub valid_inode_count:         u32,
	pub next_free_nid:             u32,
	pub sit_ver_bitmap_bytesize:   u32,
	pub nat_ver_bitmap_bytesize:   u32,
	pub checksum_offset:           u32,
	pub elapsed_time:              u64,
	pub alloc_type:                [u8; MAX_ACTIVE_LOGS],
	pub sit_nat_version_bitmap:    [u8; CP_BITMAP_BYTES],
	pub checksum:                  u32,
}

impl Checkpoint {
	pub fn zeroed() -> Self {
		Self {
			checkpoint_ver:            0,
			user_block_count:          0,
			valid_block_count:         0,
			rsvd_segment_count:        0,
			overprov_segment_count:    0,
			free_segment_count:        0,
			cur_node_segno:            [0; MAX_ACTIVE_NODE_LOGS],
			cur_node_blkoff:           [0; MAX_ACTIVE_NODE_LOGS],
			cur_data_segno:            [0; MAX_ACTIVE_DATA_LOGS],
			cur_data_blkoff:           [0; MAX_ACTIVE_DATA_LOGS],
			ckpt_flags:                0,
			cp_pack_total_block_count: 0,
			cp_pack_start_sum:         0,
			valid_node_count:          0,
			valid_inode_count:         0,
			next_free_nid:             0,
			sit_ver_bitmap_bytesize:   0,
			nat_ver_bitmap_bytesize:   0,
			checksum_offset:           0,
			elapsed_time:              0,
			alloc_type:                [0; MAX_ACTIVE_LOGS],
			sit_nat_version_bitmap:    [0; CP_BITMAP_BYTES],
			checksum:                  0,
		}
	}

	pub fn is_set(&self, flag: u32) -> bool {
		(self.ckpt_flags & flag) != 0
	}

	pub fn set_flag(&mut self, flag: u32) {
		self.ckpt_flags |= flag;
	}

	pub fn clear_flag(&mut self, flag: u32) {
		self.ckpt_flags &= !flag;
	}

	pub fn sit_bitmap(&self) -> &[u8] {
		&self.sit_nat_version_bitmap[..self.sit_ver_bitmap_bytesize as usize]
	}

	pub fn nat_bitmap(&self) -> &[u8] {
		let start = self.sit_ver_bitmap_bytesize as usize;
		&self.sit_nat_version_bitmap[start..start + self.nat_ver_bitmap_bytesize as usize]
	}

	pub fn sit_bitmap_mut(&mut self) -> &mut [u8] {
		let end = self.sit_ver_bitmap_bytesize as usize;
		&mut self.sit_nat_version_bitmap[..end]
	}

	pub fn nat_bitmap_mut(&mut self) -> &mut [u8] {
		let start = self.sit_ver_bitmap_bytesize as usize;
		let end = start + self.nat_ver_bitmap_bytesize as usize;
		&mut self.sit_nat_version_bitmap[start..end]
	}

	/// Serialise into `buf` and stamp the CRC at `checksum_offset`.
	pub fn write_to(&mut self, buf: &mut [u8]) -> IoResult<()> {
		let ofs = self.checksum_offset as usize;
		encode(self, &mut buf[..])?;
		let crc = f2fs_crc32(&buf[..ofs]);
		self.checksum = crc;
		buf[ofs..ofs + 4].copy_from_slice(&crc.to_le_bytes());
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct RawNatEntry {
	pub version:    u8,
	pub ino:        u32,
	pub block_addr: u32,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct NatBlock {
	pub entries: [RawNatEntry; NAT_ENTRY_PER_BLOCK],
}

impl NatBlock {
	pub fn zeroed() -> Self {
		Self {
			entries: [RawNatEntry {
				version:    0,
				ino:        0,
				block_addr: 0,
			}; NAT_ENTRY_PER_BLOCK],
		}
	}
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct SitEntry {
	pub vblocks:   u16,
	pub valid_map: [u8; SIT_VBLOCK_MAP_SIZE],
	pub mtime:     u64,
}

impl SitEntry {
	pub fn zeroed() -> Self {
		Self {
			vblocks:   0,
			valid_map: [0; SIT_VBLOCK_MAP_SIZE],
			mtime:     0,
		}
	}

	pub fn valid_blocks(&self) -> u16 {
		self.vblocks & SIT_VBLOCKS_MASK
	}

	pub fn seg_type(&self) -> u8 {
		(self.vblocks >> SIT_VBLOCKS_SHIFT) as u8
	}
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct SitBlock {
	pub entries: [SitEntry; SIT_ENTRY_PER_BLOCK],
}

impl SitBlock {
	pub fn zeroed() -> Self {
		Self {
			entries: [SitEntry::zeroed(); SIT_ENTRY_PER_BLOCK],
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Summary {
	pub nid:         u32,
	pub ofs_in_node: u16,
	pub version:     u8,
}

impl Summary {
	pub fn new(nid: u32, ofs_in_node: u16, version: u8) -> Self {
		Self {
			nid,
			ofs_in_node,
			version,
		}
	}

	pub fn zeroed() -> Self {
		Self::new(0, 0, 0)
	}
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct SummaryFooter {
	pub entry_type: u8,
	pub check_sum:  u16,
}

/// One summary block per open segment: 512 reverse-map entries, a journal
/// area carrying either NAT or SIT deltas, and a type footer.
#[derive(Debug, Clone, Encode, Decode)]
pub struct SummaryBlock {
	pub entries:   [Summary; ENTRIES_IN_SUM],
	pub n_journal: u16,
	pub journal:   [u8; SUM_JOURNAL_SIZE],
	pub footer:    SummaryFooter,
}

impl SummaryBlock {
	pub fn zeroed() -> Self {
		Self {
			entries:   [Summary::zeroed(); ENTRIES_IN_SUM],
			n_journal: 0,
			journal:   [0; SUM_JOURNAL_SIZE],
			footer:    SummaryFooter {
				entry_type: 0,
				check_sum:  0,
			},
		}
	}

	pub fn journal_count(&self) -> usize {
		self.n_journal as usize
	}

	pub fn set_journal_count(&mut self, n: usize) {
		self.n_journal = n as u16;
	}

	pub fn nat_in_journal(&self, i: usize) -> (u32, RawNatEntry) {
		let ofs = i * NAT_JOURNAL_ENTRY_SIZE;
		let nid = u32::from_le_bytes(self.journal[ofs..ofs + 4].try_into().unwrap());
		let ne = decode::<RawNatEntry>(&self.journal[ofs + 4..ofs + NAT_JOURNAL_ENTRY_SIZE])
			.expect("nat journal entry");
		(nid, ne)
	}

	pub fn set_nat_in_journal(&mut self, i: usize, nid: u32, ne: &RawNatEntry) {
		let ofs = i * NAT_JOURNAL_ENTRY_SIZE;
		self.journal[ofs..ofs + 4].copy_from_slice(&nid.to_le_bytes());
		encode(ne, &mut self.journal[ofs + 4..ofs + NAT_JOURNAL_ENTRY_SIZE])
			.expect("nat journal entry");
	}

	pub fn sit_in_journal(&self, i: usize) -> (u32, SitEntry) {
		let ofs = i * SIT_JOURNAL_ENTRY_SIZE;
		let segno = u32::from_le_bytes(self.journal[ofs..ofs + 4].try_into().unwrap());
		let se = decode::<SitEntry>(&self.journal[ofs + 4..ofs + SIT_JOURNAL_ENTRY_SIZE])
			.expect("sit journal entry");
		(segno, se)
	}

	pub fn set_sit_in_journal(&mut self, i: usize, segno: u32, se: &SitEntry) {
		let ofs = i * SIT_JOURNAL_ENTRY_SIZE;
		self.journal[ofs..ofs + 4].copy_from_slice(&segno.to_le_bytes());
		encode(se, &mut self.journal[ofs + 4..ofs + SIT_JOURNAL_ENTRY_SIZE])
			.expect("sit journal entry");
	}
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct Extent {
	pub fofs:     u32,
	pub blk_addr: u32,
	pub len:      u32,
}

/// On-disk inode, exactly one node-block payload.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Inode {
	pub mode:          u16,
	pub advise:        u8,
	pub inline:        u8,
	pub uid:           u32,
	pub gid:           u32,
	pub links:         u32,
	pub size:          u64,
	pub blocks:        u64,
	pub atime:         u64,
	pub ctime:         u64,
	pub mtime:         u64,
	pub atime_nsec:    u32,
	pub ctime_nsec:    u32,
	pub mtime_nsec:    u32,
	pub generation:    u32,
	pub current_depth: u32,
	pub xattr_nid:     u32,
	pub flags:         u32,
	pub pino:          u32,
	pub namelen:       u32,
	pub name:          [u8; MAX_NAME_LEN],
	pub dir_level:     u8,
	pub ext:           Extent,
	pub addr:          [u32; ADDRS_PER_INODE],
	pub nid:           [u32; 5],
}

impl Inode {
	pub fn name_bytes(&self) -> &[u8] {
		let len = (self.namelen as usize).min(MAX_NAME_LEN);
		&self.name[..len]
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct NodeFooter {
	pub nid:          u32,
	pub ino:          u32,
	pub flag:         u32,
	pub cp_ver:       u64,
	pub next_blkaddr: u32,
}

/// One node block: a raw payload interpreted as inode, direct node or
/// indirect node depending on the footer, plus the footer itself.
#[derive(Clone, Encode, Decode)]
pub struct NodeBlock {
	pub payload: [u8; NODE_PAYLOAD_SIZE],
	pub footer:  NodeFooter,
}

impl NodeBlock {
	pub fn zeroed() -> Self {
		Self {
			payload: [0; NODE_PAYLOAD_SIZE],
			footer:  NodeFooter {
				nid:          0,
				ino:          0,
				flag:         0,
				cp_ver:       0,
				next_blkaddr: 0,
			},
		}
	}

	pub fn is_inode(&self) -> bool {
		self.footer.nid == self.footer.ino
	}

	pub fn inode(&self) -> IoResult<Inode> {
		decode(&self.payload)
	}

	pub fn set_inode(&mut self, inode: &Inode) -> IoResult<()> {
		encode(inode, &mut self.payload)?;
		Ok(())
	}

	fn u32_at(&self, ofs: usize) -> u32 {
		u32::from_le_bytes(self.payload[ofs..ofs + 4].try_into().unwrap())
	}

	fn set_u32_at(&mut self, ofs: usize, v: u32) {
		self.payload[ofs..ofs + 4].copy_from_slice(&v.to_le_bytes());
	}

	/// Block address array base: the inode's `addr` array or the direct
	/// node's, depending on what this block is.
	fn addr_base(&self) -> usize {
		if self.is_inode() {
			INODE_ADDR_OFFSET
		} else {
			0
		}
	}

	pub fn data_addr(&self, ofs_in_node: usize) -> u32 {
		self.u32_at(self.addr_base() + 4 * ofs_in_node)
	}

	pub fn set_data_addr(&mut self, ofs_in_node: usize, addr: u32) {
		self.set_u32_at(self.addr_base() + 4 * ofs_in_node, addr);
	}

	/// Child nid slot. For slot indices at or above `NODE_DIR1_BLOCK` the
	/// inode's `nid` array is addressed, otherwise an indirect node's.
	pub fn child_nid(&self, slot: usize, in_inode: bool) -> u32 {
		if in_inode {
			self.u32_at(INODE_ADDR_OFFSET + 4 * ADDRS_PER_INODE + 4 * (slot - NODE_DIR1_BLOCK))
		} else {
			self.u32_at(4 * slot)
		}
	}

	pub fn set_child_nid(&mut self, slot: usize, in_inode: bool, nid: u32) {
		if in_inode {
			self.set_u32_at(
				INODE_ADDR_OFFSET + 4 * ADDRS_PER_INODE + 4 * (slot - NODE_DIR1_BLOCK),
				nid,
			);
		} else {
			self.set_u32_at(4 * slot, nid);
		}
	}

	pub fn ofs_of_node(&self) -> u32 {
		self.footer.flag >> OFFSET_BIT_SHIFT
	}

	pub fn is_cold(&self) -> bool {
		(self.footer.flag >> COLD_BIT_SHIFT) & 1 != 0
	}

	pub fn is_fsync(&self) -> bool {
		(self.footer.flag >> FSYNC_BIT_SHIFT) & 1 != 0
	}

	pub fn is_dent(&self) -> bool {
		(self.footer.flag >> DENT_BIT_SHIFT) & 1 != 0
	}

	pub fn set_mark(&mut self, shift: u32, mark: bool) {
		if mark {
			self.footer.flag |= 1 << shift;
		} else {
			self.footer.flag &= !(1 << shift);
		}
	}

	pub fn fill_footer(&mut self, nid: u32, ino: u32, ofs: u32, reset: bool) {
		if reset {
			self.payload = [0; NODE_PAYLOAD_SIZE];
			self.footer = NodeFooter {
				nid:          0,
				ino:          0,
				flag:         0,
				cp_ver:       0,
				next_blkaddr: 0,
			};
		}
		self.footer.nid = nid;
		self.footer.ino = ino;
		self.footer.flag = ofs << OFFSET_BIT_SHIFT;
	}

	/// Whether this node block holds data block addresses.
	pub fn is_dnode(&self) -> bool {
		let mut ofs = self.ofs_of_node();
		let n = NIDS_PER_BLOCK as u32;
		if ofs == 3 || ofs == 4 + n || ofs == 5 + 2 * n {
			return false;
		}
		if ofs >= 6 + 2 * n {
			ofs -= 6 + 2 * n;
			if ofs % (n + 1) != 0 {
				return false;
			}
		}
		true
	}

	/// First file offset covered by this node block, derived from the node
	/// offset within the tree.
	pub fn start_bidx_of_node(&self) -> u64 {
		let node_ofs = self.ofs_of_node() as u64;
		let n = NIDS_PER_BLOCK as u64;
		let indirect_blks = 2 * n + 4;

		if node_ofs == 0 {
			return 0;
		}
		let bidx = if node_ofs <= 2 {
			node_ofs - 1
		} else if node_ofs <= indirect_blks {
			let dec = (node_ofs - 4) / (n + 1);
			node_ofs - 2 - dec
		} else {
			let dec = (node_ofs - indirect_blks - 3) / (n + 1);
			node_ofs - 5 - dec
		};
		bidx * ADDRS_PER_BLOCK as u64 + ADDRS_PER_INODE as u64
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct DirEntry {
	pub hash_code: u32,
	pub ino:       u32,
	pub name_len:  u16,
	pub file_type: u8,
}

impl DirEntry {
	pub fn zeroed() -> Self {
		Self {
			hash_code: 0,
			ino:       0,
			name_len:  0,
			file_type: 0,
		}
	}

	pub fn slots(&self) -> usize {
		dentry_slots(self.name_len as usize)
	}
}

pub fn dentry_slots(name_len: usize) -> usize {
	(name_len + DENTRY_SLOT_LEN - 1) / DENTRY_SLOT_LEN
}

#[derive(Clone, Encode, Decode)]
pub struct DentryBlock {
	pub dentry_bitmap: [u8; SIZE_OF_DENTRY_BITMAP],
	pub reserved:      [u8; SIZE_OF_DENTRY_RESERVED],
	pub dentry:        [DirEntry; NR_DENTRY_IN_BLOCK],
	pub filename:      [[u8; DENTRY_SLOT_LEN]; NR_DENTRY_IN_BLOCK],
}

impl DentryBlock {
	pub fn zeroed() -> Self {
		Self {
			dentry_bitmap: [0; SIZE_OF_DENTRY_BITMAP],
			reserved:      [0; SIZE_OF_DENTRY_RESERVED],
			dentry:        [DirEntry::zeroed(); NR_DENTRY_IN_BLOCK],
			filename:      [[0; DENTRY_SLOT_LEN]; NR_DENTRY_IN_BLOCK],
		}
	}

	pub fn name_of(&self, bit_pos: usize, len: usize) -> Vec<u8> {
		let mut out = Vec::with_capacity(len);
		let mut pos = bit_pos;
		let mut left = len;
		while left > 0 {
			let n = left.min(DENTRY_SLOT_LEN);
			out.extend_from_slice(&self.filename[pos][..n]);
			left -= n;
			pos += 1;
		}
		out
	}

	pub fn set_name(&mut self, bit_pos: usize, name: &[u8]) {
		let mut pos = bit_pos;
		let mut ofs = 0;
		while ofs < name.len() {
			let n = (name.len() - ofs).min(DENTRY_SLOT_LEN);
			self.filename[pos][..n].copy_from_slice(&name[ofs..ofs + n]);
			ofs += n;
			pos += 1;
		}
	}
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct OrphanBlock {
	pub ino:         [u32; ORPHANS_PER_BLOCK],
	pub reserved:    u32,
	pub blk_addr:    u16,
	pub blk_count:   u16,
	pub entry_count: u32,
	pub check_sum:   u32,
}

impl OrphanBlock {
	pub fn zeroed() -> Self {
		Self {
			ino:         [0; ORPHANS_PER_BLOCK],
			reserved:    0,
			blk_addr:    0,
			blk_count:   0,
			entry_count: 0,
			check_sum:   0,
		}
	}
}

#[cfg(test)]
mod t {
	use super::*;

	fn encoded_len<T: Encode>(v: &T) -> usize {
		let mut buf = vec![0u8; 2 * BLOCK_SIZE];
		encode(v, &mut buf).unwrap()
	}

	#[test]
	fn block_structs_encode_to_block_size() {
		assert_eq!(encoded_len(&Checkpoint::zeroed()), BLOCK_SIZE);
		assert_eq!(encoded_len(&SummaryBlock::zeroed()), BLOCK_SIZE);
		assert_eq!(encoded_len(&DentryBlock::zeroed()), BLOCK_SIZE);
		assert_eq!(encoded_len(&OrphanBlock::zeroed()), BLOCK_SIZE);
		assert_eq!(encoded_len(&NodeBlock::zeroed()), BLOCK_SIZE);
	}

	#[test]
	fn record_sizes() {
		assert_eq!(
			encoded_len(&RawNatEntry {
				version:    0,
				ino:        0,
				block_addr: 0,
			}),
			9
		);
		assert_eq!(encoded_len(&SitEntry::zeroed()), SIT_ENTRY_SIZE);
		assert_eq!(encoded_len(&Summary::zeroed()), SUMMARY_SIZE);
		assert_eq!(
			encoded_len(&DirEntry::zeroed()),
			SIZE_OF_DIR_ENTRY
		);
		assert_eq!(encoded_len(&NatBlock::zeroed()), 9 * NAT_ENTRY_PER_BLOCK);
		assert_eq!(
			encoded_len(&SitBlock::zeroed()),
			SIT_ENTRY_SIZE * SIT_ENTRY_PER_BLOCK
		);

		let node = NodeBlock::zeroed();
		assert_eq!(encoded_len(&node.inode().unwrap()), NODE_PAYLOAD_SIZE);
	}

	#[test]
	fn journal_capacity() {
		assert_eq!(NAT_JOURNAL_ENTRIES, 39);
		assert_eq!(SIT_JOURNAL_ENTRIES, 6);
	}

	#[test]
	fn crc_is_stable_and_validates() {
		let buf = [0xa5u8; 128];
		let crc = f2fs_crc32(&buf);
		assert!(f2fs_crc_valid(crc, &buf));
		assert!(!f2fs_crc_valid(crc ^ 1, &buf));
		assert_ne!(crc, f2fs_crc32(&buf[..127]));
	}

	#[test]
	fn summary_journal_roundtrip() {
		let mut sum = SummaryBlock::zeroed();
		let ne = RawNatEntry {
			version:    3,
			ino:        7,
			block_addr: 4096,
		};
		sum.set_nat_in_journal(5, 42, &ne);
		let (nid, got) = sum.nat_in_journal(5);
		assert_eq!(nid, 42);
		assert_eq!(got, ne);

		let mut se = SitEntry::zeroed();
		se.vblocks = (3 << SIT_VBLOCKS_SHIFT) | 17;
		se.valid_map[0] = 0xf0;
		sum.set_sit_in_journal(2, 99, &se);
		let (segno, got) = sum.sit_in_journal(2);
		assert_eq!(segno, 99);
		assert_eq!(got.valid_blocks(), 17);
		assert_eq!(got.seg_type(), 3);
		assert_eq!(got.valid_map[0], 0xf0);
	}

	#[test]
	fn node_block_addr_slots() {
		let mut node = NodeBlock::zeroed();
		// direct node
		node.fill_footer(10, 4, 1, true);
		assert!(!node.is_inode());
		node.set_data_addr(17, 0xabcd);
		assert_eq!(node.data_addr(17), 0xabcd);

		// inode
		node.fill_footer(4, 4, 0, true);
		assert!(node.is_inode());
		node.set_data_addr(0, 77);
		assert_eq!(node.data_addr(0), 77);
		let inode = node.inode().unwrap();
		assert_eq!(inode.addr[0], 77);

		node.set_child_nid(NODE_DIR1_BLOCK, true, 55);
		assert_eq!(node.child_nid(NODE_DIR1_BLOCK, true), 55);
		assert_eq!(node.inode().unwrap().nid[0], 55);
	}

	#[test]
	fn dnode_classification() {
		let mut node = NodeBlock::zeroed();
		for (ofs, expect) in [
			(0u32, true),
			(1, true),
			(2, true),
			(3, false),
			(4, true),
			(4 + NIDS_PER_BLOCK as u32, false),
			(5 + 2 * NIDS_PER_BLOCK as u32, false),
			(6 + 2 * NIDS_PER_BLOCK as u32, true),
		] {
			node.fill_footer(10, 4, ofs, true);
			assert_eq!(node.is_dnode(), expect, "ofs={ofs}");
		}
	}

	#[test]
	fn inline_geometry() {
		assert_eq!(MAX_INLINE_DATA, 3488);
		assert_eq!(NR_INLINE_DENTRY, 182);
		assert_eq!(INLINE_DENTRY_BITMAP_SIZE, 23);
	}
}
