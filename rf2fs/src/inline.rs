//! Inline data and inline dentries: small payloads live in the inode block
//! itself and convert to regular blocks on overflow.

use std::{io::Result as IoResult, sync::Arc};

use crate::{
	bits,
	dir::{room_for_filename, DirEntryLoc},
	layout::{
		self, dentry_slots, file_type_of_mode, DirEntry, NodeBlock, BLOCK_SIZE,
		INLINE_DATA_OFFSET, INLINE_DENTRY_BITMAP_SIZE, MAX_INLINE_DATA, NR_INLINE_DENTRY,
		NULL_ADDR, SIZE_OF_DIR_ENTRY,
	},
	mount::F2fs,
	vnode::{timespec_now, Vnode, VNODE_DATA_EXIST, VNODE_INLINE_DATA, VNODE_INLINE_DENTRY},
};

/// Byte offset of the dentry array inside the inline region.
const INLINE_DENTRY_ARRAY: usize =
	MAX_INLINE_DATA - NR_INLINE_DENTRY * (SIZE_OF_DIR_ENTRY + layout::DENTRY_SLOT_LEN);
/// Byte offset of the file-name slot array inside the inline region.
const INLINE_FILENAME_ARRAY: usize = MAX_INLINE_DATA - NR_INLINE_DENTRY * layout::DENTRY_SLOT_LEN;

fn inline_region(node: &NodeBlock) -> &[u8] {
	&node.payload[INLINE_DATA_OFFSET..INLINE_DATA_OFFSET + MAX_INLINE_DATA]
}

fn inline_region_mut(node: &mut NodeBlock) -> &mut [u8] {
	&mut node.payload[INLINE_DATA_OFFSET..INLINE_DATA_OFFSET + MAX_INLINE_DATA]
}

fn inline_dentry(region: &[u8], i: usize) -> DirEntry {
	let ofs = INLINE_DENTRY_ARRAY + i * SIZE_OF_DIR_ENTRY;
	layout::decode(&region[ofs..ofs + SIZE_OF_DIR_ENTRY]).expect("inline dentry")
}

fn set_inline_dentry(region: &mut [u8], i: usize, de: &DirEntry) {
	let ofs = INLINE_DENTRY_ARRAY + i * SIZE_OF_DIR_ENTRY;
	layout::encode(de, &mut region[ofs..ofs + SIZE_OF_DIR_ENTRY]).expect("inline dentry");
}

fn inline_name(region: &[u8], bit_pos: usize, len: usize) -> Vec<u8> {
	let base = INLINE_FILENAME_ARRAY + bit_pos * layout::DENTRY_SLOT_LEN;
	region[base..base + len].to_vec()
}

fn set_inline_name(region: &mut [u8], bit_pos: usize, name: &[u8]) {
	let base = INLINE_FILENAME_ARRAY + bit_pos * layout::DENTRY_SLOT_LEN;
	region[base..base + name.len()].copy_from_slice(name);
}

impl F2fs {
	// -- inline file data ----------------------------------------------------

	pub(crate) fn read_inline(&self, vnode: &Vnode, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
		let page = self.get_node_page(vnode.ino())?;
		let node: NodeBlock = page.decode()?;
		let region = inline_region(&node);

		let size = vnode.size();
		if offset >= size {
			return Ok(0);
		}
		let len = (buf.len() as u64).min(size - offset) as usize;
		buf[..len].copy_from_slice(&region[offset as usize..offset as usize + len]);
		Ok(len)
	}

	pub(crate) fn write_inline(
		&self,
		vnode: &Vnode,
		offset: u64,
		data: &[u8],
	) -> IoResult<usize> {
		let page = self.get_node_page(vnode.ino())?;
		let mut node: NodeBlock = page.decode()?;
		{
			let region = inline_region_mut(&mut node);
			region[offset as usize..offset as usize + data.len()].copy_from_slice(data);
		}
		page.encode(&node)?;
		self.node_cache.set_dirty(&page);

		if vnode.size() < offset + data.len() as u64 {
			vnode.set_size(offset + data.len() as u64);
		}
		vnode.set_flag(VNODE_DATA_EXIST);
		vnode.touch();
		self.mark_vnode_dirty(vnode);
		Ok(data.len())
	}

	/// Zero the inline payload beyond `len`. During recovery the file size
	/// is owned by the replayed inode and must not change here.
	pub(crate) fn truncate_inline(&self, vnode: &Vnode, len: u64, is_recover: bool) -> IoResult<()> {
		let page = self.get_node_page(vnode.ino())?;
		let mut node: NodeBlock = page.decode()?;
		{
			let size = vnode.size() as usize;
			let len = len as usize;
			let (from, to) = if len > size { (size, len) } else { (len, size) };
			let region = inline_region_mut(&mut node);
			region[from..to.min(MAX_INLINE_DATA)].fill(0);
		}
		page.encode(&node)?;
		self.node_cache.set_dirty(&page);

		if len == 0 {
			vnode.clear_flag(VNODE_DATA_EXIST);
		}
		if !is_recover {
			vnode.touch();
		}
		self.mark_vnode_dirty(vnode);
		Ok(())
	}

	/// Move inline payload into block 0 and drop the inline flags.
	pub(crate) fn convert_inline_data(&self, vnode: &Vnode) -> IoResult<()> {
		let dn = self.get_dnode_of_data(vnode, 0, false)?;
		if dn.data_blkaddr()? == NULL_ADDR {
			self.reserve_new_block(vnode, &dn)?;
		}

		let ipage = self.get_node_page(vnode.ino())?;
		let mut node: NodeBlock = ipage.decode()?;

		let data_page = vnode.cache().grab(0);
		{
			let mut data = data_page.write();
			data.fill(0);
			let size = (vnode.size() as usize).min(MAX_INLINE_DATA);
			data[..size].copy_from_slice(&inline_region(&node)[..size]);
		}
		data_page.set_uptodate();
		vnode.cache().set_dirty(&data_page);

		inline_region_mut(&mut node).fill(0);
		ipage.encode(&node)?;
		self.node_cache.set_dirty(&ipage);

		vnode.clear_flag(VNODE_INLINE_DATA);
		vnode.clear_flag(VNODE_DATA_EXIST);
		self.update_inode(vnode, &ipage)?;
		Ok(())
	}

	/// Roll-forward policy for inline data, keyed on the checkpointed state
	/// and the fsynced node:
	///   inline -> inline : copy the payload
	///   inline -> blocks : drop the payload, let block replay proceed
	///   blocks -> blocks : nothing to do here
	pub(crate) fn recover_inline_data(
		&self,
		vnode: &Vnode,
		new_node: &NodeBlock,
	) -> IoResult<bool> {
		let raw_inode = if new_node.is_inode() {
			Some(new_node.inode()?)
		} else {
			None
		};

		if let Some(raw) = &raw_inode {
			if raw.inline & layout::INLINE_DATA != 0 {
				let ipage = self.get_node_page(vnode.ino())?;
				let mut node: NodeBlock = ipage.decode()?;
				inline_region_mut(&mut node)
					.copy_from_slice(inline_region(new_node));
				ipage.encode(&node)?;
				self.node_cache.set_dirty(&ipage);

				vnode.set_flag(VNODE_INLINE_DATA);
				vnode.set_flag(VNODE_DATA_EXIST);
				return Ok(true);
			}
		}

		if vnode.test_flag(VNODE_INLINE_DATA) {
			self.truncate_inline(vnode, 0, true)?;
			vnode.clear_flag(VNODE_INLINE_DATA);
			vnode.clear_flag(VNODE_DATA_EXIST);
		}
		Ok(false)
	}

	// -- inline dentries -----------------------------------------------------

	pub(crate) fn find_in_inline_dir(
		&self,
		dir: &Vnode,
		name: &str,
	) -> IoResult<Option<DirEntryLoc>> {
		let page = self.get_node_page(dir.ino())?;
		let node: NodeBlock = page.decode()?;
		let region = inline_region(&node);
		let hash = crate::dir::dentry_hash(name);

		let mut bit_pos = 0usize;
		while bit_pos < NR_INLINE_DENTRY {
			bit_pos = bits::find_next_bit(
				&region[..INLINE_DENTRY_BITMAP_SIZE],
				NR_INLINE_DENTRY,
				bit_pos,
			);
			if bit_pos >= NR_INLINE_DENTRY {
				break;
			}
			let de = inline_dentry(region, bit_pos);
			if de.name_len as usize == name.len()
				&& de.hash_code == hash
				&& inline_name(region, bit_pos, name.len()) == name.as_bytes()
			{
				return Ok(Some(DirEntryLoc {
					page,
					inline: true,
					block_index: 0,
					bit_pos,
					entry: de,
				}));
			}
			bit_pos += dentry_slots(de.name_len as usize).max(1);
		}
		Ok(None)
	}

	pub(crate) fn inline_parent_entry(&self, dir: &Vnode) -> IoResult<DirEntryLoc> {
		let page = self.get_node_page(dir.ino())?;
		let node: NodeBlock = page.decode()?;
		let entry = inline_dentry(inline_region(&node), 1);
		Ok(DirEntryLoc {
			page,
			inline: true,
			block_index: 0,
			bit_pos: 1,
			entry,
		})
	}

	pub(crate) fn set_inline_link(
		&self,
		dir: &Vnode,
		loc: &DirEntryLoc,
		vnode: &Vnode,
	) -> IoResult<()> {
		let mut node: NodeBlock = loc.page.decode()?;
		{
			let region = inline_region_mut(&mut node);
			let mut de = inline_dentry(region, loc.bit_pos);
			de.ino = vnode.ino();
			de.file_type = file_type_of_mode(vnode.info().mode);
			set_inline_dentry(region, loc.bit_pos, &de);
		}
		loc.page.encode(&node)?;
		self.node_cache.set_dirty(&loc.page);
		dir.touch();
		self.mark_vnode_dirty(dir);
		Ok(())
	}

	pub(crate) fn make_empty_inline_dir(&self, vnode: &Vnode, parent_ino: u32) -> IoResult<()> {
		let page = self.get_node_page(vnode.ino())?;
		let mut node: NodeBlock = page.decode()?;
		{
			let region = inline_region_mut(&mut node);
			set_inline_dentry(
				region,
				0,
				&DirEntry {
					hash_code: 0,
					ino:       vnode.ino(),
					name_len:  1,
					file_type: layout::FT_DIR,
				},
			);
			set_inline_name(region, 0, b".");
			set_inline_dentry(
				region,
				1,
				&DirEntry {
					hash_code: 0,
					ino:       parent_ino,
					name_len:  2,
					file_type: layout::FT_DIR,
				},
			);
			set_inline_name(region, 1, b"..");
			bits::set_bit(0, &mut region[..INLINE_DENTRY_BITMAP_SIZE]);
			bits::set_bit(1, &mut region[..INLINE_DENTRY_BITMAP_SIZE]);
		}
		page.encode(&node)?;
		self.node_cache.set_dirty(&page);

		if vnode.size() < MAX_INLINE_DATA as u64 {
			vnode.set_size(MAX_INLINE_DATA as u64);
		}
		self.mark_vnode_dirty(vnode);
		Ok(())
	}

	/// Move the inline dentry area into dentry block 0.
	pub(crate) fn convert_inline_dir(&self, dir: &Vnode) -> IoResult<()> {
		let dn = self.get_dnode_of_data(dir, 0, false)?;
		if dn.data_blkaddr()? == NULL_ADDR {
			self.reserve_new_block(dir, &dn)?;
		}

		let ipage = self.get_node_page(dir.ino())?;
		let mut node: NodeBlock = ipage.decode()?;

		let mut blk = crate::layout::DentryBlock::zeroed();
		{
			let region = inline_region(&node);
			blk.dentry_bitmap[..INLINE_DENTRY_BITMAP_SIZE]
				.copy_from_slice(&region[..INLINE_DENTRY_BITMAP_SIZE]);
			for i in 0..NR_INLINE_DENTRY {
				blk.dentry[i] = inline_dentry(region, i);
				let base = INLINE_FILENAME_ARRAY + i * layout::DENTRY_SLOT_LEN;
				blk.filename[i]
					.copy_from_slice(&region[base..base + layout::DENTRY_SLOT_LEN]);
			}
		}

		let data_page = dir.cache().grab(0);
		data_page.zero();
		data_page.encode(&blk)?;
		data_page.set_uptodate();
		dir.cache().set_dirty(&data_page);

		inline_region_mut(&mut node).fill(0);
		ipage.encode(&node)?;
		self.node_cache.set_dirty(&ipage);

		dir.clear_flag(VNODE_INLINE_DENTRY);
		if dir.size() < BLOCK_SIZE as u64 {
			dir.set_size(BLOCK_SIZE as u64);
		}
		self.update_inode(dir, &ipage)?;
		self.mark_vnode_dirty(dir);
		Ok(())
	}

	/// Insert into the inline area. Returns `true` when the directory had to
	/// convert to block form and the caller must retry there.
	pub(crate) fn add_inline_entry(
		&self,
		dir: &Vnode,
		name: &str,
		vnode: &Vnode,
	) -> IoResult<bool> {
		let slots = dentry_slots(name.len());
		{
			let page = self.get_node_page(dir.ino())?;
			let mut node: NodeBlock = page.decode()?;
			let bit_pos = {
				let region = inline_region(&node);
				room_for_filename(
					&region[..INLINE_DENTRY_BITMAP_SIZE],
					slots,
					NR_INLINE_DENTRY,
				)
			};
			if bit_pos < NR_INLINE_DENTRY {
				self.init_inode_metadata(dir, vnode)?;

				let hash = crate::dir::dentry_hash(name);
				{
					let region = inline_region_mut(&mut node);
					set_inline_dentry(
						region,
						bit_pos,
						&DirEntry {
							hash_code: hash,
							ino:       vnode.ino(),
							name_len:  name.len() as u16,
							file_type: file_type_of_mode(vnode.info().mode),
						},
					);
					set_inline_name(region, bit_pos, name.as_bytes());
					for i in 0..slots {
						bits::set_bit(bit_pos + i, &mut region[..INLINE_DENTRY_BITMAP_SIZE]);
					}
				}
				page.encode(&node)?;
				self.node_cache.set_dirty(&page);

				let depth = dir.info().cur_dir_depth;
				self.update_parent_metadata(dir, vnode, depth);
				return Ok(false);
			}
		}

		self.convert_inline_dir(dir)?;
		Ok(true)
	}

	pub(crate) fn delete_inline_entry(
		&self,
		dir: &Vnode,
		loc: &DirEntryLoc,
		target: Option<&Arc<Vnode>>,
	) -> IoResult<()> {
		let mut node: NodeBlock = loc.page.decode()?;
		{
			let region = inline_region_mut(&mut node);
			let slots = dentry_slots(loc.entry.name_len as usize);
			for i in 0..slots {
				bits::clear_bit(loc.bit_pos + i, &mut region[..INLINE_DENTRY_BITMAP_SIZE]);
			}
		}
		loc.page.encode(&node)?;
		self.node_cache.set_dirty(&loc.page);

		let now = timespec_now();
		{
			let mut info = dir.info_mut();
			info.ctime = now;
			info.mtime = now;
		}
		self.mark_vnode_dirty(dir);

		if let Some(vnode) = target {
			let target_is_dir = vnode.is_dir();
			if target_is_dir {
				dir.info_mut().nlink -= 1;
			}
			{
				let mut info = vnode.info_mut();
				info.ctime = now;
				info.nlink -= 1;
				if target_is_dir {
					info.nlink = info.nlink.saturating_sub(1);
					info.size = 0;
				}
			}
			self.mark_vnode_dirty(vnode);
			self.write_inode_now(vnode)?;
			if vnode.nlink() == 0 {
				self.add_orphan_inode(vnode.ino());
			}
		}
		Ok(())
	}

	pub(crate) fn is_empty_inline_dir(&self, dir: &Vnode) -> IoResult<bool> {
		let page = self.get_node_page(dir.ino())?;
		let node: NodeBlock = page.decode()?;
		let region = inline_region(&node);
		Ok(
			bits::find_next_bit(&region[..INLINE_DENTRY_BITMAP_SIZE], NR_INLINE_DENTRY, 2)
				>= NR_INLINE_DENTRY,
		)
	}

	pub(crate) fn readdir_inline(
		&self,
		dir: &Vnode,
		mut f: impl FnMut(&str, u32, u8) -> bool,
	) -> IoResult<()> {
		let page = self.get_node_page(dir.ino())?;
		let node: NodeBlock = page.decode()?;
		let region = inline_region(&node);

		let mut bit_pos = 0usize;
		while bit_pos < NR_INLINE_DENTRY {
			bit_pos = bits::find_next_bit(
				&region[..INLINE_DENTRY_BITMAP_SIZE],
				NR_INLINE_DENTRY,
				bit_pos,
			);
			if bit_pos >= NR_INLINE_DENTRY {
				break;
			}
			let de = inline_dentry(region, bit_pos);
			let raw_name = inline_name(region, bit_pos, de.name_len as usize);
			let name = String::from_utf8_lossy(&raw_name).into_owned();
			if de.ino != 0 && name != ".." && !f(&name, de.ino, de.file_type) {
				return Ok(());
			}
			bit_pos += dentry_slots(de.name_len as usize).max(1);
		}
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn inline_area_layout_is_disjoint() {
		assert_eq!(INLINE_DENTRY_ARRAY, 30);
		assert_eq!(INLINE_FILENAME_ARRAY, 2032);
		assert!(INLINE_DENTRY_BITMAP_SIZE <= INLINE_DENTRY_ARRAY);
		assert_eq!(
			INLINE_DENTRY_ARRAY + NR_INLINE_DENTRY * SIZE_OF_DIR_ENTRY,
			INLINE_FILENAME_ARRAY
		);
		assert_eq!(
			INLINE_FILENAME_ARRAY + NR_INLINE_DENTRY * layout::DENTRY_SLOT_LEN,
			MAX_INLINE_DATA
		);
	}

	#[test]
	fn inline_dentry_roundtrip_in_region() {
		let mut node = NodeBlock::zeroed();
		node.fill_footer(4, 4, 0, true);
		let region = inline_region_mut(&mut node);
		let de = DirEntry {
			hash_code: 0xabcd,
			ino:       42,
			name_len:  5,
			file_type: layout::FT_REG_FILE,
		};
		set_inline_dentry(region, 3, &de);
		set_inline_name(region, 3, b"hello");
		assert_eq!(inline_dentry(region, 3), de);
		assert_eq!(inline_name(region, 3, 5), b"hello");
	}
}
