use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use rf2fs::{fsck, Bcache, FileDevice, FsckOptions, FsckReport};

/// Check (and optionally repair) an rf2fs image.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
	/// Rewrite NAT/SIT/checkpoint state to fix inconsistencies
	#[arg(short, long)]
	repair: bool,

	/// Path to the device or image file
	device: PathBuf,

	#[command(flatten)]
	verbose: Verbosity<WarnLevel>,
}

fn run(cli: &Cli) -> Result<FsckReport> {
	let dev = FileDevice::open(&cli.device, cli.repair)
		.with_context(|| format!("cannot open {}", cli.device.display()))?;
	let bc = Bcache::new(Box::new(dev)).context("unsupported device geometry")?;
	fsck(&bc, FsckOptions { repair: cli.repair }).context("check aborted")
}

fn main() -> ExitCode {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	match run(&cli) {
		Ok(report) if report.ok() => {
			println!(
				"clean: {} inodes, {} node blocks, {} data blocks",
				report.checked_inodes, report.checked_nodes, report.checked_blocks
			);
			ExitCode::SUCCESS
		}
		Ok(report) => {
			for error in &report.errors {
				eprintln!("{error}");
			}
			if report.repaired {
				eprintln!("{} problem(s) repaired; re-run to confirm", report.errors.len());
			}
			ExitCode::FAILURE
		}
		Err(e) => {
			log::error!("{e:#}");
			ExitCode::FAILURE
		}
	}
}
