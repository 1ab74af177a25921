//! `lvmdevices-rs`: a thin demo front-end over `lvm_core`, exercising
//! scan -> match -> validate -> hints for manual testing. Not a
//! replacement for `lvm`/`lvmdevices` -- option parsing and output
//! formatting only, no provisioning.

use std::fs::File;
use std::io::{Read as IoRead, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;

use lvm_core::context::Config;
use lvm_core::label::{LabelHeader, LABEL_SCAN_SIZE};
use lvm_core::pvheader::PvHeader;
use lvm_core::{devices_file, hints};

#[derive(Parser)]
#[command(name = "lvmdevices-rs", about = "Inspect the lvm_core devices file, hints file and on-disk PV labels")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a block device's first 4 sectors for a LABELONE header and
    /// decode its PV header.
    Scan {
        /// Path to a block device or a file containing its first few KB.
        path: PathBuf,
    },
    /// List entries in the devices file.
    Devices,
    /// Show the current hints file, if any.
    Hints,
}

fn run_scan(path: &PathBuf) -> lvm_core::Result<()> {
    let mut f = File::open(path)?;
    let mut buf = vec![0u8; LABEL_SCAN_SIZE];
    f.read_exact(&mut buf)?;

    let label = match LabelHeader::scan(&buf)? {
        Some(l) => l,
        None => {
            println!("{}: no LABELONE header found", path.display());
            return Ok(());
        }
    };
    println!(
        "label: sector {} type {:?}",
        label.sector,
        label.labeller_type_str()
    );

    f.seek(SeekFrom::Start(label.offset as u64))?;
    let mut header_buf = vec![0u8; 512];
    f.read_exact(&mut header_buf)?;
    let header = PvHeader::decode(&header_buf)?;
    println!("pvid: {}", header.pvid_str());
    println!("size: {} sectors", header.size);
    println!("data areas: {}", header.data_areas.len());
    println!("metadata areas: {}", header.metadata_areas.len());
    Ok(())
}

fn run_devices(cfg: &Config) -> lvm_core::Result<()> {
    let path = cfg.devices_file_path();
    let df = devices_file::load(&path)?;
    if df.hash_mismatch {
        error!("devices file hash does not match its recorded content");
    }
    for entry in &df.entries {
        println!(
            "{} IDTYPE={} IDNAME={} PVID={}",
            entry.devname.display(),
            entry.idtype.as_str(),
            entry.idname,
            entry.pvid
        );
    }
    Ok(())
}

fn run_hints(cfg: &Config) -> lvm_core::Result<()> {
    match hints::load(&cfg.hints_file_path())? {
        Some(h) => {
            println!("hints file: {} entries", h.entries.len());
            for e in &h.entries {
                println!("  {} pvid={} vgname={:?}", e.name, e.pvid, e.vgname);
            }
        }
        None => println!("no hints file present"),
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let cfg = Config::from_env();

    let result = match &cli.command {
        Command::Scan { path } => run_scan(path),
        Command::Devices => run_devices(&cfg),
        Command::Hints => run_hints(&cfg),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
