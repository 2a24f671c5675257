use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use rf2fs::{mkfs, Bcache, FileDevice, MkfsOptions};

/// Format a block device or image file with the rf2fs layout.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
	/// Volume label (at most 15 characters)
	#[arg(short, long)]
	label: Option<String>,

	/// Heap-based allocation (node logs grow from the volume top)
	#[arg(short = 'a', long, default_value_t = 1)]
	heap: u8,

	/// Overprovision ratio in percent; 0 picks one automatically
	#[arg(short, long, default_value_t = 5)]
	overprovision: u32,

	/// Segments per section
	#[arg(short, long, default_value_t = 1)]
	segs_per_sec: u32,

	/// Sections per zone
	#[arg(short = 'z', long, default_value_t = 1)]
	secs_per_zone: u32,

	/// Extra cold-file extensions, comma separated (e.g. "mp3,gif,mov")
	#[arg(short, long, value_delimiter(','))]
	ext_list: Vec<String>,

	/// Path to the device or image file
	device: PathBuf,

	#[command(flatten)]
	verbose: Verbosity<WarnLevel>,
}

fn run(cli: Cli) -> Result<()> {
	let dev = FileDevice::open(&cli.device, true)
		.with_context(|| format!("cannot open {}", cli.device.display()))?;
	let bc = Bcache::new(Box::new(dev)).context("unsupported device geometry")?;

	let opts = MkfsOptions {
		label:         cli.label,
		heap:          cli.heap != 0,
		overprovision: cli.overprovision,
		segs_per_sec:  cli.segs_per_sec,
		secs_per_zone: cli.secs_per_zone,
		extensions:    cli.ext_list,
	};
	mkfs(&bc, opts).context("format failed")?;
	Ok(())
}

fn main() -> ExitCode {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	match run(cli) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			log::error!("{e:#}");
			ExitCode::FAILURE
		}
	}
}
