use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::builder::Builder;
use crate::measure::{self, parse_phases};
use crate::signature::local::{LocalPcrSigner, SecureBootSigner};
use crate::signature::{PcrSigner, PeSigner};

/// The default log level.
///
/// 2 corresponds to the level INFO.
const DEFAULT_LOG_LEVEL: usize = 2;

#[derive(Parser)]
#[command(about = "Assemble, measure and Secure Boot-sign Unified Kernel Images")]
pub struct Cli {
    #[clap(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a UKI from an sd-stub, kernel and initrd.
    Create(CreateCommand),
    /// Produce signed PCR policies for a single file.
    Measure(MeasureCommand),
    /// Print the build version.
    Version,
}

#[derive(Args)]
struct CreateCommand {
    /// Architecture of the UKI file.
    #[arg(long)]
    arch: Option<String>,

    /// OS version recorded in the generated os-release.
    #[arg(long)]
    version: Option<String>,

    /// Path to the sd-stub the UKI is built from.
    #[arg(long)]
    sd_stub_path: PathBuf,

    /// Path to the sd-boot to sign alongside the UKI.
    #[arg(long)]
    sd_boot_path: Option<PathBuf>,

    /// Path to the kernel image.
    #[arg(long)]
    kernel: PathBuf,

    /// Path to the initrd image.
    #[arg(long)]
    initrd: PathBuf,

    /// Kernel command line.
    #[arg(long, default_value = "")]
    cmdline: String,

    /// Existing os-release file to embed instead of generating one.
    #[arg(long)]
    os_release: Option<PathBuf>,

    /// Secure Boot certificate to sign EFI files with.
    #[arg(long, requires = "sb_key")]
    sb_cert: Option<PathBuf>,

    /// Secure Boot private key to sign EFI files with.
    #[arg(long, requires = "sb_cert")]
    sb_key: Option<PathBuf>,

    /// RSA private key for PCR policy signing.
    #[arg(long)]
    pcr_key: Option<PathBuf>,

    /// Output path for the signed sd-boot.
    #[arg(long, default_value = "sdboot.signed.efi")]
    output_sdboot: PathBuf,

    /// Output path for the signed UKI.
    #[arg(long, default_value = "uki.signed.efi")]
    output_uki: PathBuf,

    /// Colon-separated boot phase path to precompute policies for.
    #[arg(long, default_value = "enter-initrd:leave-initrd:sysinit:ready")]
    phases: String,

    /// Splash image (BMP) to embed.
    #[arg(long)]
    splash: Option<PathBuf>,

    /// Verbose output.
    #[arg(long)]
    debug: bool,
}

#[derive(Args)]
struct MeasureCommand {
    /// File to measure.
    file: PathBuf,

    /// RSA private key for PCR policy signing.
    #[arg(long)]
    pcr_key: PathBuf,

    /// PCR index to bind the policies to.
    #[arg(long)]
    pcr: u32,

    /// Output file for the measurements, in JSON format.
    #[arg(long, default_value = "measurements.json")]
    output: PathBuf,

    /// Log level (debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    pub fn call(self, module: &str) {
        stderrlog::new()
            .module(module)
            .show_level(false)
            .verbosity(self.commands.verbosity())
            .init()
            .expect("Failed to setup logger.");

        if let Err(e) = self.commands.call() {
            log::error!("{e:#}");
            std::process::exit(1);
        }
    }
}

impl Commands {
    fn verbosity(&self) -> usize {
        match self {
            Commands::Create(args) if args.debug => DEFAULT_LOG_LEVEL + 1,
            Commands::Measure(args) => match args.log_level.as_str() {
                "error" => 0,
                "warn" => 1,
                "info" => 2,
                "debug" => 3,
                _ => DEFAULT_LOG_LEVEL,
            },
            _ => DEFAULT_LOG_LEVEL,
        }
    }

    fn call(self) -> Result<()> {
        match self {
            Commands::Create(args) => create(args),
            Commands::Measure(args) => measure_file(args),
            Commands::Version => {
                println!("{}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

fn create(args: CreateCommand) -> Result<()> {
    let pe_signer: Option<Box<dyn PeSigner>> = match (&args.sb_cert, &args.sb_key) {
        (Some(cert), Some(key)) => Some(Box::new(SecureBootSigner::new(cert, key))),
        _ => None,
    };
    let pcr_signer: Option<Box<dyn PcrSigner>> = match &args.pcr_key {
        Some(path) => Some(Box::new(LocalPcrSigner::from_pem_file(path)?)),
        None => None,
    };
    let phases = parse_phases(&args.phases)?;

    Builder {
        arch: args.arch,
        version: args.version,
        sd_stub_path: args.sd_stub_path,
        sd_boot_path: args.sd_boot_path,
        kernel_path: args.kernel,
        initrd_path: args.initrd,
        cmdline: args.cmdline,
        os_release: args.os_release,
        splash: args.splash,
        phases,
        pcr_signer,
        pe_signer,
        out_sd_boot_path: args.output_sdboot,
        out_uki_path: args.output_uki,
    }
    .build()
}

fn measure_file(args: MeasureCommand) -> Result<()> {
    log::info!("Measuring {:?} into PCR {}", args.file, args.pcr);

    let signer = LocalPcrSigner::from_pem_file(&args.pcr_key)?;
    let measurements = measure::generate_signed_pcr_for_file(&args.file, &signer, args.pcr)?;

    let json = serde_json::to_vec(&measurements).context("Failed to serialize measurements")?;
    std::fs::write(&args.output, json)
        .with_context(|| format!("Failed to write measurements to {:?}", args.output))?;

    log::info!("Wrote measurements to {:?}", args.output);
    Ok(())
}
