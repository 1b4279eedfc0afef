use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wipekit_core::{
    DeviceInventory, EngineConfig, OperationRequest, OperationResult, OperationScheduler, Outcome, PermissionLevel,
    WipeMethod,
};
use wipekit_platform::{PlatformInventory, PlatformProbe};

#[derive(Parser)]
#[command(name = "wipekit")]
#[command(about = "Securely wipe and reformat block devices", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Machine-readable output, one JSON object per line
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available drives
    List,
    /// Run the safety checks against one or more devices
    Check {
        #[arg(required = true)]
        devices: Vec<String>,
        /// Check as a format to this filesystem instead of a wipe
        #[arg(short, long)]
        filesystem: Option<String>,
    },
    /// Overwrite one or more devices
    Wipe {
        #[arg(required = true)]
        devices: Vec<String>,
        /// Wipe method (zero, random, dod, gutmann)
        #[arg(short, long, default_value = "zero")]
        method: String,
        /// Format each device with this filesystem after wiping
        #[arg(long)]
        then_format: Option<String>,
        /// Volume label for --then-format
        #[arg(short, long)]
        label: Option<String>,
        /// Show what would run without touching the devices
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Partition and format one or more devices
    Format {
        #[arg(required = true)]
        devices: Vec<String>,
        /// Filesystem type (ext4, ntfs, fat32, exfat)
        #[arg(short, long)]
        filesystem: String,
        #[arg(short, long)]
        label: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout is reserved for results
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry().with(env_filter).with(console_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.validate()?;

    let scheduler = Arc::new(OperationScheduler::new(&config, Arc::new(PlatformProbe::new())));

    match cli.command {
        Commands::List => list_devices(cli.json).await?,
        Commands::Check { devices, filesystem } => {
            for device in devices {
                let request = match &filesystem {
                    Some(fs) => OperationRequest::format(device, fs.as_str(), None),
                    None => OperationRequest::wipe(device, WipeMethod::Zero.as_str()),
                };
                let verdict = scheduler.check(&request).await;
                if cli.json {
                    println!(
                        "{}",
                        serde_json::json!({ "device": request.device, "safe": verdict.safe, "reason": verdict.reason })
                    );
                } else if verdict.safe {
                    println!("{}: safe", request.device);
                } else {
                    println!("{}: UNSAFE - {}", request.device, verdict.reason.unwrap_or_default());
                }
            }
        }
        Commands::Wipe {
            devices,
            method,
            then_format,
            label,
            dry_run,
            yes,
        } => {
            let requests = devices
                .into_iter()
                .map(|device| match &then_format {
                    Some(fs) => OperationRequest::wipe_then_format(device, method.as_str(), fs.as_str(), label.clone()),
                    None => OperationRequest::wipe(device, method.as_str()),
                })
                .collect();
            run_operations(scheduler, requests, dry_run, yes, cli.json).await?;
        }
        Commands::Format {
            devices,
            filesystem,
            label,
            dry_run,
            yes,
        } => {
            let requests = devices
                .into_iter()
                .map(|device| OperationRequest::format(device, filesystem.as_str(), label.clone()))
                .collect();
            run_operations(scheduler, requests, dry_run, yes, cli.json).await?;
        }
    }

    Ok(())
}

async fn list_devices(json: bool) -> anyhow::Result<()> {
    let inventory = PlatformInventory::new();
    let devices = inventory.list_devices().await.context("Error enumerating devices")?;

    if json {
        println!("{}", serde_json::to_string(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!("Available devices:\n");
    for device in devices {
        println!("Device: {}", device.name);
        println!("  Path: {}", device.id);
        println!("  Size: {:.2} GB", device.size as f64 / 1_073_741_824.0);
        println!("  Type: {:?}", device.device_type);
        println!("  Removable: {}", if device.is_removable { "Yes" } else { "No" });
        if !device.mount_points.is_empty() {
            println!("  Mounted at: {:?}", device.mount_points);
        }
        println!();
    }
    Ok(())
}

async fn run_operations(
    scheduler: Arc<OperationScheduler>,
    requests: Vec<OperationRequest>,
    dry_run: bool,
    yes: bool,
    json: bool,
) -> anyhow::Result<()> {
    if dry_run {
        for request in &requests {
            let report = scheduler.simulate(request).await;
            if json {
                println!("{}", serde_json::to_string(&report)?);
                continue;
            }
            println!("Simulation for {}:", report.device);
            match &report.verdict.reason {
                None => println!("  Safety: passed"),
                Some(reason) => println!("  Safety: REJECTED - {}", reason),
            }
            for command in &report.commands {
                println!("  Would run: {}", command);
            }
            for warning in &report.warnings {
                println!("  Warning: {}", warning);
            }
            println!();
        }
        return Ok(());
    }

    check_permissions(&requests).await?;

    if !yes && !confirm(&requests)? {
        println!("Operation cancelled.");
        return Ok(());
    }

    let total = requests.len();
    let (mut progress, results) = scheduler.submit_batch(requests).await.into_parts();

    let interrupt = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling running operations");
                let cancelled = scheduler.shutdown();
                tracing::info!("Cancelled {} operation(s)", cancelled);
            }
        })
    };

    let results_task = tokio::spawn(results.wait());
    while let Some(event) = progress.recv().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            println!("[{}] {:>3}% {}", event.device, event.percentage, event.status);
        }
    }
    let results = results_task.await.context("Result collection failed")?;
    interrupt.abort();

    let failed = results.iter().filter(|r| !r.is_success()).count();
    for result in &results {
        print_result(result, json)?;
    }

    if failed > 0 {
        anyhow::bail!("{} of {} operation(s) did not succeed", failed, total);
    }
    Ok(())
}

/// Destructive runs need full access to every device.
async fn check_permissions(requests: &[OperationRequest]) -> anyhow::Result<()> {
    let inventory = PlatformInventory::new();
    for request in requests {
        let level = inventory
            .check_permissions(&request.device)
            .await
            .with_context(|| format!("Failed to check permissions for {}", request.device))?;
        tracing::debug!("Permission level for {}: {:?}", request.device, level);
        if let Some(problem) = permission_problem(&request.device, level) {
            anyhow::bail!(problem);
        }
    }
    Ok(())
}

fn permission_problem(device: &str, level: PermissionLevel) -> Option<String> {
    match level {
        PermissionLevel::FullAccess => None,
        PermissionLevel::Simulate => Some(format!(
            "Insufficient permissions to modify {}. Re-run as root, or use --dry-run to see what would happen.",
            device
        )),
        PermissionLevel::ReadOnly => Some(format!("Insufficient permissions to modify {}. Re-run as root.", device)),
    }
}

fn print_result(result: &OperationResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }
    match &result.outcome {
        Outcome::Success { details } => println!("{}: {}", result.device, details),
        Outcome::Error { reason } => println!("{}: FAILED - {}", result.device, reason),
        Outcome::Cancelled => println!("{}: cancelled", result.device),
    }
    Ok(())
}

fn confirm(requests: &[OperationRequest]) -> anyhow::Result<bool> {
    let devices: Vec<&str> = requests.iter().map(|r| r.device.as_str()).collect();
    println!("\nWARNING: This will ERASE ALL DATA on {}!", devices.join(", "));
    print!("Type 'yes' to continue: ");
    io::stdout().flush()?;

    let stdin = io::stdin();
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    Ok(line.trim() == "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_full_access_may_modify() {
        assert_eq!(permission_problem("/dev/sdb", PermissionLevel::FullAccess), None);

        let simulate = permission_problem("/dev/sdb", PermissionLevel::Simulate).unwrap();
        assert!(simulate.contains("/dev/sdb") && simulate.contains("--dry-run"));

        let read_only = permission_problem("/dev/sdb", PermissionLevel::ReadOnly).unwrap();
        assert!(read_only.contains("Re-run as root"));
    }

    #[test]
    fn test_cli_arguments_parse() {
        let cli = Cli::try_parse_from(["wipekit", "wipe", "/dev/sdb", "--method", "dod", "--then-format", "ext4", "--yes"])
            .unwrap();
        match cli.command {
            Commands::Wipe { devices, method, then_format, yes, .. } => {
                assert_eq!(devices, vec!["/dev/sdb".to_string()]);
                assert_eq!(method, "dod");
                assert_eq!(then_format.as_deref(), Some("ext4"));
                assert!(yes);
            }
            _ => panic!("expected the wipe subcommand"),
        }
    }
}
