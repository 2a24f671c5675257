//! End-to-end scenarios over an in-memory device. Crashes are simulated by
//! dropping the filesystem without unmounting: everything that reached the
//! device stays, everything cached is lost.

use std::sync::Arc;

use rstest::rstest;
use rf2fs::{
	fsck, mkfs, Bcache, F2fs, FsckOptions, MemDevice, MkfsOptions, MountOptions, BLOCK_SIZE,
	MAX_INLINE_DATA, S_IFREG,
};

/// 128 MiB image.
const IMAGE_BLOCKS: u32 = 32768;

fn format(blocks: u32, overprovision: u32) -> MemDevice {
	let dev = MemDevice::new(blocks);
	let bc = Bcache::new(Box::new(dev.clone())).unwrap();
	mkfs(
		&bc,
		MkfsOptions {
			overprovision,
			..Default::default()
		},
	)
	.unwrap();
	dev
}

fn mount(dev: &MemDevice) -> Arc<F2fs> {
	let bc = Bcache::new(Box::new(dev.clone())).unwrap();
	F2fs::mount(bc, MountOptions::default()).unwrap()
}

fn check(dev: &MemDevice) -> rf2fs::FsckReport {
	let bc = Bcache::new(Box::new(dev.clone())).unwrap();
	fsck(&bc, FsckOptions::default()).unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
	(0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn format_mount_clean_cycle() {
	// mkfs -> mount -> create /a, write "hello", fsync -> remount -> read
	let dev = format(102400, 5); // 400 MiB with defaults
	{
		let fs = mount(&dev);
		let root = fs.root();
		let a = fs.create(&root, "a", S_IFREG | 0o644).unwrap();
		fs.write(&a, 0, b"hello").unwrap();
		fs.fsync(&a).unwrap();
	}

	let fs = mount(&dev);
	let root = fs.root();
	let a = fs.lookup(&root, "a").unwrap();
	assert_eq!(a.size(), 5);
	let mut buf = [0u8; 5];
	assert_eq!(fs.read(&a, 0, &mut buf).unwrap(), 5);
	assert_eq!(&buf, b"hello");
	fs.unmount().unwrap();

	let report = check(&dev);
	assert!(report.ok(), "fsck found: {:?}", report.errors);
	assert_eq!(report.checked_inodes, 2); // root and /a
}

#[rstest]
#[case(1)]
#[case(BLOCK_SIZE)]
#[case(BLOCK_SIZE + 17)]
#[case(10 * BLOCK_SIZE + 100)]
fn write_read_roundtrip(#[case] len: usize) {
	let dev = format(IMAGE_BLOCKS, 20);
	let fs = mount(&dev);
	let root = fs.root();
	let f = fs.create(&root, "data.bin", S_IFREG | 0o644).unwrap();

	let body = pattern(len, 7);
	assert_eq!(fs.write(&f, 0, &body).unwrap(), len);
	fs.fsync(&f).unwrap();
	drop(fs); // power cut

	let fs = mount(&dev);
	let f = fs.lookup(&fs.root(), "data.bin").unwrap();
	assert_eq!(f.size(), len as u64);
	let mut out = vec![0u8; len];
	assert_eq!(fs.read(&f, 0, &mut out).unwrap(), len);
	assert_eq!(out, body);
}

#[test]
fn overwrite_and_holes() {
	let dev = format(IMAGE_BLOCKS, 20);
	let fs = mount(&dev);
	let root = fs.root();
	let f = fs.create(&root, "sparse", S_IFREG | 0o644).unwrap();

	// write far past the start: everything before reads as zeroes
	let body = pattern(BLOCK_SIZE, 3);
	fs.write(&f, 6 * BLOCK_SIZE as u64, &body).unwrap();
	fs.fsync(&f).unwrap();

	let mut hole = vec![0xffu8; BLOCK_SIZE];
	assert_eq!(fs.read(&f, 0, &mut hole).unwrap(), BLOCK_SIZE);
	assert!(hole.iter().all(|b| *b == 0));

	// overwrite in the middle of the written block
	fs.write(&f, 6 * BLOCK_SIZE as u64 + 100, b"XYZ").unwrap();
	fs.fsync(&f).unwrap();

	let mut out = vec![0u8; BLOCK_SIZE];
	fs.read(&f, 6 * BLOCK_SIZE as u64, &mut out).unwrap();
	assert_eq!(&out[100..103], b"XYZ");
	assert_eq!(out[..100], body[..100]);
}

#[test]
fn rename_over_destination() {
	let dev = format(IMAGE_BLOCKS, 20);
	{
		let fs = mount(&dev);
		let root = fs.root();
		let d = fs.mkdir(&root, "d", 0o755).unwrap();
		let src = fs.create(&d, "src", S_IFREG | 0o644).unwrap();
		fs.write(&src, 0, b"X").unwrap();
		let dst = fs.create(&d, "dst", S_IFREG | 0o644).unwrap();
		fs.write(&dst, 0, b"YY").unwrap();
		// no open handles on the overwritten target, or it would survive
		// the checkpoint as an open orphan
		drop(src);
		drop(dst);

		let inodes_before = fs.info().valid_inodes;
		fs.rename(&d, "src", &d, "dst").unwrap();
		fs.sync_fs().unwrap();
		assert_eq!(fs.info().valid_inodes, inodes_before - 1);
	}

	let fs = mount(&dev);
	let d = fs.lookup(&fs.root(), "d").unwrap();
	assert!(fs.lookup(&d, "src").is_err());
	let dst = fs.lookup(&d, "dst").unwrap();
	let mut buf = [0u8; 2];
	assert_eq!(fs.read(&dst, 0, &mut buf).unwrap(), 1);
	assert_eq!(buf[0], b'X');
	fs.unmount().unwrap();

	let report = check(&dev);
	assert!(report.ok(), "fsck found: {:?}", report.errors);
}

#[test]
fn orphan_replay_frees_blocks() {
	let dev = format(IMAGE_BLOCKS, 20);
	let free_at_start;
	{
		let fs = mount(&dev);
		let root = fs.root();
		free_at_start = fs.info().free_blocks;

		let f = fs.create(&root, "f", S_IFREG | 0o644).unwrap();
		fs.write(&f, 0, &pattern(4 * BLOCK_SIZE, 1)).unwrap();
		fs.fsync(&f).unwrap();

		// unlink while the handle is still open, then keep writing
		fs.unlink(&root, "f").unwrap();
		assert_eq!(f.nlink(), 0);
		fs.write(&f, 4 * BLOCK_SIZE as u64, &pattern(4 * BLOCK_SIZE, 2))
			.unwrap();

		// the checkpoint records /f as an orphan because it is still open
		fs.sync_fs().unwrap();
		assert!(fs.info().free_blocks < free_at_start);
		// crash with the fd open: fs and handle dropped together
	}

	let fs = mount(&dev);
	assert!(fs.lookup(&fs.root(), "f").is_err());
	let free_after = fs.info().free_blocks;
	assert_eq!(free_after, free_at_start);
	fs.unmount().unwrap();

	let report = check(&dev);
	assert!(report.ok(), "fsck found: {:?}", report.errors);
}

#[test]
fn inline_dentry_overflow_converts() {
	let dev = format(IMAGE_BLOCKS, 20);
	let fs = mount(&dev);
	let root = fs.root();
	let big = fs.mkdir(&root, "big", 0o755).unwrap();

	// fresh directories start inline and report the inline capacity
	assert_eq!(big.size(), MAX_INLINE_DATA as u64);

	// 14-byte names occupy two slots each; enough of them overflow the
	// inline area and force the block conversion
	let count = 95;
	for i in 0..count {
		let name = format!("entry-{i:08}"); // 14 bytes
		fs.create(&big, &name, S_IFREG | 0o644).unwrap();
	}
	assert_eq!(big.size(), BLOCK_SIZE as u64);

	// every entry is still reachable after the conversion
	for i in 0..count {
		let name = format!("entry-{i:08}");
		fs.lookup(&big, &name)
			.unwrap_or_else(|e| panic!("{name} lost after conversion: {e}"));
	}

	let mut listed = 0;
	fs.readdir(&big, |name, _ino, _ftype| {
		if name != "." {
			listed += 1;
		}
		true
	})
	.unwrap();
	assert_eq!(listed, count);

	fs.sync_fs().unwrap();
	fs.unmount().unwrap();
	let report = check(&dev);
	assert!(report.ok(), "fsck found: {:?}", report.errors);
}

#[test]
fn roll_forward_recovers_two_fsyncs() {
	let dev = format(IMAGE_BLOCKS, 20);
	let body_a = pattern(8 * BLOCK_SIZE, 11);
	let body_b = pattern(8 * BLOCK_SIZE, 23);
	{
		let fs = mount(&dev);
		let root = fs.root();
		let r = fs.create(&root, "r", S_IFREG | 0o644).unwrap();

		let ver_before = fs.checkpoint_version();
		fs.write(&r, 0, &body_a).unwrap();
		fs.fsync(&r).unwrap();
		fs.write(&r, 8 * BLOCK_SIZE as u64, &body_b).unwrap();
		fs.fsync(&r).unwrap();

		// the fast fsync path must not have written a checkpoint
		assert_eq!(fs.checkpoint_version(), ver_before);
		// power cut
	}

	let fs = mount(&dev);
	let r = fs.lookup(&fs.root(), "r").unwrap();
	assert_eq!(r.size(), 16 * BLOCK_SIZE as u64);
	let mut out = vec![0u8; 16 * BLOCK_SIZE];
	assert_eq!(fs.read(&r, 0, &mut out).unwrap(), out.len());
	assert_eq!(&out[..8 * BLOCK_SIZE], &body_a[..]);
	assert_eq!(&out[8 * BLOCK_SIZE..], &body_b[..]);
	fs.unmount().unwrap();

	let report = check(&dev);
	assert!(report.ok(), "fsck found: {:?}", report.errors);
}

#[test]
fn deleted_segments_become_reusable() {
	let dev = format(IMAGE_BLOCKS, 20);
	let fs = mount(&dev);
	let root = fs.root();

	// one full segment of warm data
	let big = fs.create(&root, "big", S_IFREG | 0o644).unwrap();
	fs.write(&big, 0, &pattern(512 * BLOCK_SIZE, 5)).unwrap();
	fs.sync_fs().unwrap();
	let free_full = fs.info().free_segments;
	drop(big);

	fs.unlink(&root, "big").unwrap();
	fs.sync_fs().unwrap();
	// prefree segments turned free once the checkpoint committed
	let free_after_delete = fs.info().free_segments;
	assert!(free_after_delete > free_full);

	let small = fs.create(&root, "small", S_IFREG | 0o644).unwrap();
	fs.write(&small, 0, &pattern(256 * BLOCK_SIZE, 6)).unwrap();
	fs.sync_fs().unwrap();
	assert!(fs.info().free_segments <= free_after_delete);

	fs.unmount().unwrap();
	let report = check(&dev);
	assert!(report.ok(), "fsck found: {:?}", report.errors);
}

#[test]
fn back_to_back_checkpoints_only_bump_version() {
	let dev = format(IMAGE_BLOCKS, 20);
	let fs = mount(&dev);
	let root = fs.root();
	let f = fs.create(&root, "x", S_IFREG | 0o644).unwrap();
	fs.write(&f, 0, b"stable").unwrap();

	fs.sync_fs().unwrap();
	let ver = fs.checkpoint_version();
	let info = fs.info();

	fs.sync_fs().unwrap();
	assert_eq!(fs.checkpoint_version(), ver + 1);
	let info2 = fs.info();
	assert_eq!(info.free_blocks, info2.free_blocks);
	assert_eq!(info.free_segments, info2.free_segments);
	assert_eq!(info.valid_inodes, info2.valid_inodes);
}

#[test]
fn inline_files_convert_on_overflow() {
	let dev = format(IMAGE_BLOCKS, 20);
	let fs = mount(&dev);
	let root = fs.root();
	let f = fs.create(&root, "inline", S_IFREG | 0o644).unwrap();

	// stays inline: no block beyond the inode itself
	let small = pattern(1000, 9);
	fs.write(&f, 0, &small).unwrap();
	fs.fsync(&f).unwrap();
	assert_eq!(f.attr().storage_size, 0);

	// grows past the inline capacity: block 0 materialises
	let large = pattern(MAX_INLINE_DATA + 500, 13);
	fs.write(&f, 0, &large).unwrap();
	fs.fsync(&f).unwrap();
	assert!(f.attr().storage_size >= BLOCK_SIZE as u64);

	let mut out = vec![0u8; large.len()];
	assert_eq!(fs.read(&f, 0, &mut out).unwrap(), large.len());
	assert_eq!(out, large);
	drop(fs);

	let fs = mount(&dev);
	let f = fs.lookup(&fs.root(), "inline").unwrap();
	let mut out = vec![0u8; large.len()];
	fs.read(&f, 0, &mut out).unwrap();
	assert_eq!(out, large);
}

#[test]
fn namei_semantics() {
	let dev = format(IMAGE_BLOCKS, 20);
	let fs = mount(&dev);
	let root = fs.root();

	let d = fs.mkdir(&root, "dir", 0o755).unwrap();
	assert_eq!(d.nlink(), 2);
	assert_eq!(root.nlink(), 3);

	let f = fs.create(&d, "file", S_IFREG | 0o644).unwrap();
	assert!(fs.create(&d, "file", S_IFREG | 0o644).is_err());
	assert!(fs.lookup(&d, "nope").is_err());
	assert!(fs.unlink(&root, "dir").is_err()); // not empty

	fs.link(&d, "alias", &f).unwrap();
	assert_eq!(f.nlink(), 2);
	let alias = fs.lookup(&d, "alias").unwrap();
	assert_eq!(alias.ino(), f.ino());

	fs.unlink(&d, "file").unwrap();
	assert_eq!(f.nlink(), 1);
	fs.unlink(&d, "alias").unwrap();
	fs.unlink(&root, "dir").unwrap();
	assert_eq!(root.nlink(), 2);

	fs.sync_fs().unwrap();
	fs.unmount().unwrap();
	let report = check(&dev);
	assert!(report.ok(), "fsck found: {:?}", report.errors);
}

#[test]
fn cross_directory_rename_updates_dotdot() {
	let dev = format(IMAGE_BLOCKS, 20);
	let fs = mount(&dev);
	let root = fs.root();

	let a = fs.mkdir(&root, "a", 0o755).unwrap();
	let b = fs.mkdir(&root, "b", 0o755).unwrap();
	let sub = fs.mkdir(&a, "sub", 0o755).unwrap();
	let f = fs.create(&sub, "payload", S_IFREG | 0o644).unwrap();
	fs.write(&f, 0, b"move me").unwrap();

	// moving /a into its own subtree must fail
	assert!(fs.rename(&root, "a", &sub, "loop").is_err());

	fs.rename(&a, "sub", &b, "sub2").unwrap();
	assert!(fs.lookup(&a, "sub").is_err());
	let moved = fs.lookup(&b, "sub2").unwrap();
	assert_eq!(moved.ino(), sub.ino());
	assert_eq!(moved.pino(), b.ino());
	assert_eq!(a.nlink(), 2);
	assert_eq!(b.nlink(), 3);

	fs.sync_fs().unwrap();
	fs.unmount().unwrap();
	let report = check(&dev);
	assert!(report.ok(), "fsck found: {:?}", report.errors);
}

#[test]
fn truncate_shrinks_and_zeroes() {
	let dev = format(IMAGE_BLOCKS, 20);
	let fs = mount(&dev);
	let root = fs.root();
	let f = fs.create(&root, "t", S_IFREG | 0o644).unwrap();

	let body = pattern(5 * BLOCK_SIZE, 17);
	fs.write(&f, 0, &body).unwrap();
	fs.fsync(&f).unwrap();
	let blocks_full = f.blocks();

	fs.truncate(&f, BLOCK_SIZE as u64 + 100).unwrap();
	assert_eq!(f.size(), BLOCK_SIZE as u64 + 100);
	assert!(f.blocks() < blocks_full);

	// grow again: the tail past the old size reads as zeroes
	fs.truncate(&f, 3 * BLOCK_SIZE as u64).unwrap();
	let mut out = vec![0u8; 3 * BLOCK_SIZE];
	assert_eq!(fs.read(&f, 0, &mut out).unwrap(), out.len());
	assert_eq!(&out[..BLOCK_SIZE + 100], &body[..BLOCK_SIZE + 100]);
	assert!(out[BLOCK_SIZE + 100..].iter().all(|b| *b == 0));

	fs.fsync(&f).unwrap();
	fs.unmount().unwrap();
	let report = check(&dev);
	assert!(report.ok(), "fsck found: {:?}", report.errors);
}

#[test]
fn fsck_clean_image_with_and_without_repair() {
	let dev = format(IMAGE_BLOCKS, 20);
	{
		let fs = mount(&dev);
		let root = fs.root();
		let f = fs.create(&root, "victim", S_IFREG | 0o644).unwrap();
		fs.write(&f, 0, b"body").unwrap();
		fs.unmount().unwrap();
	}

	{
		let bc = Bcache::new(Box::new(dev.clone())).unwrap();
		let report = fsck(&bc, FsckOptions { repair: false }).unwrap();
		assert!(report.ok(), "fsck found: {:?}", report.errors);
	}
	// a clean image stays clean when repair is requested
	{
		let bc = Bcache::new(Box::new(dev.clone())).unwrap();
		let report = fsck(&bc, FsckOptions { repair: true }).unwrap();
		assert!(report.ok(), "fsck found: {:?}", report.errors);
		assert!(!report.repaired);
	}
}

#[test]
fn readdir_lists_everything_once() {
	let dev = format(IMAGE_BLOCKS, 20);
	let fs = mount(&dev);
	let root = fs.root();

	let names: Vec<String> = (0..40).map(|i| format!("n{i:03}")).collect();
	for name in &names {
		fs.create(&root, name, S_IFREG | 0o644).unwrap();
	}

	let mut seen = Vec::new();
	fs.readdir(&root, |name, _ino, _ftype| {
		if name != "." {
			seen.push(name.to_string());
		}
		true
	})
	.unwrap();
	seen.sort();
	let mut expected = names.clone();
	expected.sort();
	assert_eq!(seen, expected);
}
