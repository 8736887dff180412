mod config;
mod error;
mod fs;
mod handle_table;
mod node_store;
mod proto;
mod repair;
mod util;

use anyhow::Context;
use clap::Parser;
use config::Config;
use fs::SdcardFs;
use log::{error, info};
use nix::fcntl::{OFlag, open};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::stat::{Mode, umask};
use nix::unistd::{Gid, Uid, setgid, setuid};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process;

const MOUNT_POINT: &str = "/mnt/sdcard";
const FUSE_DEVICE: &str = "/dev/fuse";

#[derive(Parser, Debug)]
#[command(name = "sdcardfs")]
#[command(about = "Export a directory with FAT-style fixed ownership and permissions")]
struct Cli {
    /// Force file names to lower case on reported paths.
    #[arg(short = 'l')]
    lower_case: bool,

    /// Repair file name case and ownership on the backing tree before
    /// mounting.
    #[arg(short = 'f')]
    fix_files: bool,

    /// Backing directory to export.
    path: PathBuf,

    /// Uid the daemon drops to after mounting (must be nonzero).
    uid: u32,

    /// Gid the daemon drops to after mounting (must be nonzero).
    gid: u32,
}

fn main() {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            process::exit(-1);
        }
    };
    if cli.uid == 0 || cli.gid == 0 {
        error!("uid and gid must be nonzero");
        process::exit(-1);
    }

    if let Err(err) = run(cli) {
        error!("{err:#}");
        process::exit(-1);
    }
    // The request loop only returns once the kernel closes the channel;
    // that is a clean exit.
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::open_backing(
        cli.path,
        Uid::from_raw(cli.uid),
        Gid::from_raw(cli.gid),
        cli.lower_case,
    )
    .context("cannot open backing directory")?;

    // Clean up after a previous instance; failure just means there was
    // nothing stale to unmount.
    let _ = umount2(MOUNT_POINT, MntFlags::MNT_DETACH);

    let channel =
        open(FUSE_DEVICE, OFlag::O_RDWR, Mode::empty()).context("cannot open fuse device")?;

    let options = format!(
        "fd={},rootmode=40000,default_permissions,allow_other,user_id={},group_id={}",
        channel.as_raw_fd(),
        config.uid,
        config.gid
    );
    mount(
        Some(FUSE_DEVICE),
        MOUNT_POINT,
        Some("fuse"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(options.as_str()),
    )
    .context("cannot mount fuse filesystem")?;

    if cli.fix_files {
        repair::repair_tree(&config);
    }

    setgid(config.gid).context("cannot drop group privileges")?;
    setuid(config.uid).context("cannot drop user privileges")?;
    umask(Mode::empty());

    info!(
        "exporting {} at {MOUNT_POINT} as {}:{}",
        config.backing_path.display(),
        config.uid,
        config.gid
    );
    let mut fs = SdcardFs::new(channel, config);
    fs.run();
    Ok(())
}
