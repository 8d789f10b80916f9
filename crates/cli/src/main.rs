use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use fwprobe::commands::{
    analyze_command, list_analyzers_command, render_command, report_command, OutputFormat,
};
use fwprobe::console;
use fwprobe::GlobalOptions;
use tracing_subscriber::EnvFilter;

/// Firmware reverse-engineering reports for GL.iNet router/KVM images.
///
/// Thin wrapper around `fwprobe-core`; every subcommand maps onto one
/// library command so it can be exercised directly from tests.
#[derive(Parser, Debug)]
#[command(name = "fwprobe", version, about = "GL.iNet firmware analysis reports", long_about = None)]
struct Cli {
    /// Config file (defaults to $FWPROBE_CONFIG, then ./fwprobe.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for reports and side files such as binwalk-offsets.sh.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Scratch directory for downloads and extractions.
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Debug-level logging on stderr.
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Firmware image; downloaded from `firmware_url` when omitted.
    firmware: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Toml)]
    format: OutputFormat,

    /// Write the report here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse the binwalk signature table and write binwalk-offsets.sh.
    Binwalk(ReportArgs),
    /// Partition layout derived from the offsets.
    Partitions(ReportArgs),
    /// Boot chain stages, versions and boot environment.
    BootProcess(ReportArgs),
    /// U-Boot version, environment, commands and features.
    Uboot(ReportArgs),
    /// FIT signatures, public keys and verification hints.
    SecureBoot(ReportArgs),
    /// Every extracted device tree.
    DeviceTrees(ReportArgs),
    /// Init scripts, daemons, ports and user accounts.
    NetworkServices(ReportArgs),
    /// Vendor libraries, kernel modules and firmware blobs.
    ProprietaryBlobs(ReportArgs),
    /// OS release, file statistics, setuid and GPL binaries.
    Rootfs(ReportArgs),

    /// Run an analysis through the result cache and print JSON.
    Analyze {
        /// Analysis type (e.g. `uboot`, `boot-process`).
        analysis_type: String,
        firmware: Option<PathBuf>,
    },

    /// Fill `{{ type.key }}` placeholders in a Markdown template.
    Render {
        template: PathBuf,
        firmware: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// List the available analyzers.
    List {
        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn report(opts: &GlobalOptions, analyzer: &str, args: ReportArgs) -> Result<()> {
    report_command(opts, analyzer, args.firmware.as_deref(), args.format, args.out.as_deref())
}

fn run(cli: Cli) -> Result<()> {
    let opts = GlobalOptions { config: cli.config, output_dir: cli.output_dir, work_dir: cli.work_dir };

    match cli.command {
        Command::Binwalk(args) => report(&opts, "binwalk", args),
        Command::Partitions(args) => report(&opts, "partitions", args),
        Command::BootProcess(args) => report(&opts, "boot-process", args),
        Command::Uboot(args) => report(&opts, "uboot", args),
        Command::SecureBoot(args) => report(&opts, "secure-boot", args),
        Command::DeviceTrees(args) => report(&opts, "device-trees", args),
        Command::NetworkServices(args) => report(&opts, "network-services", args),
        Command::ProprietaryBlobs(args) => report(&opts, "proprietary-blobs", args),
        Command::Rootfs(args) => report(&opts, "rootfs", args),
        Command::Analyze { analysis_type, firmware } => {
            analyze_command(&opts, &analysis_type, firmware.as_deref())
        }
        Command::Render { template, firmware, out } => {
            render_command(&opts, &template, firmware.as_deref(), out.as_deref())
        }
        Command::List { json } => list_analyzers_command(json),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            console::failure(&err);
            ExitCode::FAILURE
        }
    }
}
