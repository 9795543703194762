//! A command-line front end to the UBI loader.
//!
//! This attaches to UBI the same way a boot loader would, on either a NAND image file or a real
//! MTD device, so that volumes can be listed and extracted and damaged images can be diagnosed.
//! Nothing is ever written to the NAND.

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use ubi_boot::nand::mtd::MtdNand;
use ubi_boot::{
    image::KernelImage,
    nand::{Nand, NandLayout, SimNand},
    ubi::{Ubi, UbiConfig},
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND image, as BLOCKSxPAGESxBYTES
    #[clap(long)]
    sim_layout: Option<NandLayout>,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        anyhow::bail!("no NAND given");
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            anyhow::bail!("--sim-layout is required")
        };

        Ok(nandimpl)
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

impl NandImpl {
    fn run(self, config: UbiConfig, cmd: Command) -> Result<()> {
        match self {
            Self::Sim(nand) => cmd.execute(&mut Ubi::attach(nand, config)),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => {
                let mut ubi = Ubi::attach(nand, config);
                cmd.execute(&mut ubi)?;

                let stats = ubi.nand().ecc_stats()?;
                info!(
                    "ECC: {} corrected, {} failed, {} bad blocks",
                    stats.corrected, stats.failed, stats.bad_blocks
                );
                Ok(())
            }
        }
    }
}

#[derive(Args, Debug)]
struct UbiOptions {
    /// Number of blocks at the start of the NAND that are not part of UBI
    #[clap(long, default_value_t = 0)]
    first_block: u32,

    /// Skip header and data CRC checks
    #[clap(long)]
    no_crc: bool,
}

impl UbiOptions {
    fn config(&self) -> UbiConfig {
        let config = UbiConfig::default().first_block(self.first_block);
        match self.no_crc {
            true => config.verify_crc(false),
            false => config,
        }
    }
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct VolumeSelector {
    /// The volume ID
    #[clap(long)]
    id: Option<u32>,

    /// The name of the volume
    #[clap(long)]
    name: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print what the scan found in each PEB
    Overview,

    /// List the volumes found, with their names and PEBs
    List,

    /// Copy the contents of a volume to a file
    Extract {
        #[clap(flatten)]
        volume: VolumeSelector,

        /// The file to write
        #[clap(long)]
        out: PathBuf,

        /// Read at most this many bytes of the volume
        #[clap(long)]
        max_size: Option<usize>,

        /// Treat the volume as a kernel image, and trim it to the size in its header
        #[clap(long)]
        kernel: bool,
    },
}

impl Command {
    fn execute<N: Nand>(self, ubi: &mut Ubi<N>) -> Result<()> {
        match self {
            Command::Overview => {
                for (i, peb) in ubi.pebs().iter().enumerate() {
                    if !peb.is_used() {
                        println!("{i:4} => unused");
                        continue;
                    }

                    let next = peb.next.map_or("-".to_string(), |x| x.to_string());
                    let copy = if peb.copy_flag { " (copy)" } else { "" };
                    println!(
                        "{i:4} => LEB {}:{}, sqnum {}{copy}, next {next}",
                        peb.vol_id, peb.lnum, peb.sqnum
                    );
                }
            }

            Command::List => {
                for id in ubi.volumes() {
                    let name = ubi.volume_name(id).unwrap_or("<unnamed>");
                    let chain: Vec<u32> = ubi.chain(id).collect();
                    println!("{id:10} {name:32} {chain:?}");
                }
            }

            Command::Extract {
                volume,
                out,
                max_size,
                kernel,
            } => {
                let id = match (volume.id, &volume.name) {
                    (Some(id), _) => id,
                    (None, Some(name)) => ubi
                        .search_volume(name)
                        .ok_or_else(|| anyhow!("volume \"{name}\" not found"))?,
                    (None, None) => anyhow::bail!("no volume given"),
                };

                // No LEB can hold more than a whole eraseblock
                let max_size = max_size.unwrap_or_else(|| {
                    ubi.chain(id).count() * ubi.nand().get_layout().block_size()
                });
                let mut buf = vec![0u8; max_size];
                let loaded = ubi.load_volume_extent(id, &mut buf)?;
                info!("Read {} bytes from volume {id}", loaded.bytes);
                if loaded.bytes < loaded.end {
                    warn!("Volume {id} has holes; they read as zeroes");
                }

                // Skipped LEBs leave holes, so the data runs up to the end, not the byte count
                let mut len = loaded.end;
                if kernel {
                    let image = KernelImage::detect(&buf[..len])?;
                    info!("Found kernel image: {image:?}");
                    if !image.is_bootable() {
                        warn!("Kernel image is compressed");
                    }
                    len = std::cmp::min(len, image.size());
                }

                File::create(&out)?.write_all(&buf[..len])?;
                println!("Wrote {len} bytes to {}", out.display());
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// How to attach to UBI
    #[clap(flatten)]
    ubi: UbiOptions,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = args.nand.open()?;
    nand.run(args.ubi.config(), args.cmd)
}
