use clap::Parser;
use std::path::PathBuf;

use scratchfs::fuse::{mount, MountOptions};

#[derive(Parser, Debug)]
#[command(name = "scratchfs")]
#[command(
    about = "Mount a disposable in-memory copy-on-write view of a directory tree"
)]
struct Args {
    #[arg(help = "Base directory to overlay (never modified)")]
    base_dir: PathBuf,

    #[arg(help = "Mount point for the scratch view")]
    mountpoint: PathBuf,

    #[arg(long, help = "Allow root to access the mount")]
    allow_root: bool,

    #[arg(long, help = "Unmount automatically when the process exits")]
    auto_unmount: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("SCRATCHFS_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();
    let opts = MountOptions {
        allow_root: args.allow_root,
        auto_unmount: args.auto_unmount,
    };

    if let Err(e) = mount(&args.base_dir, &args.mountpoint, opts) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
