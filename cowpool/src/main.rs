// vim: tw=80
//! Operator tooling for cowpool: permutation map generation and label
//! checksum repair.

use std::{io::Write, path::PathBuf, process::exit};

use clap::{Parser, Subcommand};

use cowpool_core::{
    draid::{self, DraidCfg},
    vdev::{repair_label_cksum, LabelVerdict, VDEV_LABELS},
};

#[derive(Parser, Clone, Debug)]
/// Generate an optimized dRAID permutation map
struct DraidcfgGenerate {
    /// Total number of children, including distributed spares
    #[clap(long, short = 'c')]
    children: u32,
    /// Number of redundancy groups
    #[clap(long, short = 'g')]
    groups: u32,
    /// Number of distributed spares
    #[clap(long, short = 's')]
    spares: u32,
    /// Base permutation rows; default chosen from the child count
    #[clap(long, short = 'n')]
    rows: Option<u32>,
    /// Fixed seed, for reproducible maps
    #[clap(long)]
    seed: Option<u64>,
    /// Write the packed configuration here
    #[clap(long, short = 'o')]
    out: Option<PathBuf>,
}

impl DraidcfgGenerate {
    fn main(self) {
        let cfg = DraidCfg {
            children: self.children,
            ngroups: self.groups,
            nspares: self.spares,
        };
        let nrows =
            self.rows.unwrap_or_else(|| draid::default_nrows(&cfg));
        let generated = match self.seed {
            Some(seed) => {
                draid::generate_with(&cfg, nrows, 16, Some(seed))
            }
            None => draid::generate_with(&cfg, nrows, 16, None),
        }.unwrap_or_else(|e| {
            eprintln!("Error: cannot generate map: {e}");
            exit(1);
        });
        println!(
            "{} x {}: worst-case imbalance {:.3}",
            generated.map.nrows(),
            generated.map.ndevs(),
            generated.score
        );
        println!("Seed chosen: {:x}", generated.seed);
        if let Some(path) = self.out {
            let packed = generated.map.to_nvlist().pack();
            let mut f = std::fs::File::create(path).unwrap_or_else(|e| {
                eprintln!("Error: {e}");
                exit(1);
            });
            f.write_all(&packed).unwrap();
        }
    }
}

#[derive(Parser, Clone, Debug)]
/// Repair corrupted label checksums on a device or image
struct LabelRepair {
    /// Device node or image file
    device: PathBuf,
}

impl LabelRepair {
    fn main(self) {
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device)
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: cannot open '{}': {e}",
                    self.device.display()
                );
                exit(1);
            });
        let psize = f.metadata().unwrap().len();
        let verdicts =
            repair_label_cksum(&f, psize).unwrap_or_else(|e| {
                eprintln!("Error: {e}");
                exit(1);
            });
        for l in 0..VDEV_LABELS {
            println!("label {l}: {}", verdicts[l]);
        }
        // Like any repair tool: success only if something was repaired
        if verdicts.iter().any(|v| *v == LabelVerdict::Repaired) {
            exit(0);
        }
        exit(1);
    }
}

#[derive(Subcommand, Clone, Debug)]
enum DraidcfgCmd {
    Generate(DraidcfgGenerate),
}

#[derive(Subcommand, Clone, Debug)]
enum LabelCmd {
    Repair(LabelRepair),
}

#[derive(Subcommand, Clone, Debug)]
enum SubCommand {
    /// dRAID configuration tooling
    #[clap(subcommand)]
    Draidcfg(DraidcfgCmd),
    /// Vdev label tooling
    #[clap(subcommand)]
    Label(LabelCmd),
}

#[derive(Parser, Clone, Debug)]
#[clap(version)]
struct Cli {
    #[clap(subcommand)]
    cmd: SubCommand,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env(),
        )
        .with_writer(std::io::stderr)
        .init();
    match Cli::parse().cmd {
        SubCommand::Draidcfg(DraidcfgCmd::Generate(cmd)) => cmd.main(),
        SubCommand::Label(LabelCmd::Repair(cmd)) => cmd.main(),
    }
}
