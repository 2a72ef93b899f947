use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fota_core::events::{ChannelObserver, FotaEvent};
use fota_core::online::{fetch_latest, package_file_name};
use fota_core::plan::{Plan, build_plan, resolve_flash_layout_with_top};
use fota_core::session::{Updater, UpdaterConfig};
use fota_core::transport::{DeviceAddress, SimulatedConnector, SimulatedDevice};
use fota_core::{Package, ProductVersion, Version};
use tracing::{error, info};

const SIMULATED_ADDRESS: &str = "C0:FF:EE:00:00:01";

/// How long `simulate` waits for the next event before giving up.
const EVENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about = "FOTA update tool", long_about = None)]
struct Args {
    /// Session configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show the contents of an update package
    Inspect { package: PathBuf },

    /// Show what would be flashed for a device version
    Plan {
        package: PathBuf,
        /// Device platform version (X.Y.Z)
        #[arg(long, default_value = "0.0.0")]
        platform: Version,
        /// Device app version (X.Y.Z)
        #[arg(long, default_value = "0.0.0")]
        app: Version,
        /// Flash layout index; overrides the config
        #[arg(long)]
        chip_family: Option<usize>,
        /// Allocate below this address (hex accepted); overrides the config
        #[arg(long, value_parser = parse_addr)]
        flash_top: Option<u32>,
    },

    /// Download the latest package from an update server
    Fetch {
        /// Server base URL; falls back to the config
        server: Option<String>,
        /// Where to save the archive
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Run a complete update against a simulated device
    Simulate {
        package: PathBuf,
        /// Simulate a device that requires the secure channel
        #[arg(long)]
        secure: bool,
        /// Platform version the simulated device reports
        #[arg(long, default_value = "0.0.0")]
        platform: Version,
        /// App version the simulated device reports
        #[arg(long, default_value = "0.0.0")]
        app: Version,
    },

    /// Write the default configuration to a file
    Config { path: PathBuf },
}

fn parse_addr(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {s}: {e}"))
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => UpdaterConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => UpdaterConfig::default(),
    };

    match args.command {
        Cmd::Inspect { package } => inspect(&load(&package)?),
        Cmd::Plan {
            package,
            platform,
            app,
            chip_family,
            flash_top,
        } => {
            let package = load(&package)?;
            let device = ProductVersion::new(platform, app);
            let plan = resolve(
                &package,
                &device,
                chip_family.unwrap_or(config.chip_family),
                flash_top.or(config.flash_top),
            )?;
            print_plan(&plan);
            Ok(())
        }
        Cmd::Fetch { server, out } => {
            let server = server
                .or(config.server)
                .context("no server given and none configured")?;
            fetch(&server, out)
        }
        Cmd::Simulate {
            package,
            secure,
            platform,
            app,
        } => simulate(&load(&package)?, secure, ProductVersion::new(platform, app), config),
        Cmd::Config { path } => {
            UpdaterConfig::default().save_to_file(&path)?;
            info!(path = %path.display(), "Default configuration written");
            Ok(())
        }
    }
}

fn load(path: &Path) -> Result<Package> {
    Package::load_from_file(path).with_context(|| format!("loading package {}", path.display()))
}

fn inspect(package: &Package) -> Result<()> {
    println!("version : {}", package.version);
    println!("entry   : 0x{:08X}", package.entry);
    if let Some(platform) = &package.platform {
        println!(
            "platform: {} ({} bytes @ 0x{:08X})",
            platform.name,
            platform.len(),
            platform.load_addr
        );
    }
    println!(
        "app     : {} ({} bytes @ 0x{:08X})",
        package.app.name,
        package.app.len(),
        package.app.load_addr
    );
    for bin in &package.extra_bins {
        println!("bin     : {} ({} bytes @ 0x{:08X})", bin.name, bin.len(), bin.load_addr);
    }
    println!("readme  :\n{}", package.readme);
    Ok(())
}

fn resolve(
    package: &Package,
    device: &ProductVersion,
    chip_family: usize,
    flash_top: Option<u32>,
) -> Result<Plan> {
    let mut plan = build_plan(package, device);
    // Encryption happens per page during the transfer; placement is the same.
    resolve_flash_layout_with_top(&mut plan, chip_family, false, flash_top)
        .with_context(|| format!("placing plan on chip family {chip_family}"))?;
    Ok(plan)
}

fn print_plan(plan: &Plan) {
    if plan.is_up_to_date() {
        println!("device is up to date");
    }
    println!(
        "flash   : platform={} app={} reboot={}",
        plan.platform,
        plan.app,
        if plan.manual_reboot { "manual" } else { "automatic" }
    );
    for item in plan.items.iter().chain(plan.meta_data.iter()) {
        println!(
            "  {:<24} {:>8} bytes  write 0x{:08X}  load 0x{:08X}",
            item.name,
            item.len(),
            item.write_addr.unwrap_or_default(),
            item.load_addr
        );
    }
    println!("total   : {} bytes", plan.total_bytes());
}

fn fetch(server: &str, out: Option<PathBuf>) -> Result<()> {
    // The archive is loaded before anything is written, so a broken one is never saved.
    let latest = fetch_latest(server)?;
    let out = out.unwrap_or_else(|| PathBuf::from(package_file_name(&latest.url)));
    std::fs::write(&out, &latest.archive).with_context(|| format!("writing {}", out.display()))?;
    info!(path = %out.display(), version = %latest.package.version, "Package saved");
    Ok(())
}

fn simulate(
    package: &Package,
    secure: bool,
    version: ProductVersion,
    config: UpdaterConfig,
) -> Result<()> {
    let device = Arc::new(if secure {
        SimulatedDevice::new_secure(version)
    } else {
        SimulatedDevice::new(version)
    });
    let chip_family = config.chip_family;
    let flash_top = config.flash_top;

    let (observer, events) = ChannelObserver::channel();
    let updater = Updater::with_observer(
        DeviceAddress::new(SIMULATED_ADDRESS),
        Arc::new(SimulatedConnector::new(Arc::clone(&device))),
        config,
        Arc::new(observer),
    );

    loop {
        let event = events
            .recv_timeout(EVENT_TIMEOUT)
            .context("no progress from the update session")?;
        match event {
            FotaEvent::Progress { percent, message } => {
                if let Some(message) = message {
                    println!("{message}");
                }
                if let Some(percent) = percent {
                    println!("{percent:>3}%");
                }
            }
            FotaEvent::SecureStatus { secure } => {
                info!(secure, "Device channel");
            }
            FotaEvent::Ready { version } => {
                let plan = resolve(package, &version, chip_family, flash_top)?;
                print_plan(&plan);
                updater.begin_transfer(plan)?;
            }
            FotaEvent::StateChanged { .. } => {}
            FotaEvent::Failed { code, message } => bail!("update failed ({code}): {message}"),
            FotaEvent::Completed => break,
        }
    }

    updater.wait();
    info!(
        pages = device.pages_committed(),
        rebooted = device.rebooted(),
        "Simulated update complete"
    );
    Ok(())
}
