//! One-shot commands: list, unmount, clone and config.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::context::AppContext;
use crate::core::{CloneRequest, CloneStatus, Device, default_destination, format_size};

/// Populate the store with one refresh before acting on it.
async fn load_devices(ctx: &AppContext) -> Vec<Device> {
    ctx.refresh_loop().tick().await;
    ctx.store.snapshot().await
}

pub async fn run_list(ctx: &AppContext, json: bool) -> Result<()> {
    let devices = load_devices(ctx).await;

    if json {
        let text = serde_json::to_string_pretty(&devices).context("Failed to encode devices")?;
        println!("{}", text);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No external drives detected");
        return Ok(());
    }

    println!(
        "{:<4} {:<14} {:<28} {:>10} {:>10}  {}",
        "#", "DEVICE", "NAME", "SIZE", "USED", "PARTITIONS"
    );
    for device in &devices {
        println!("{}", device_row(device));
        for part in &device.partitions {
            println!(
                "     {:<14} {:<28} {:>10} {:>10}  {}",
                part.kname,
                part.label.as_deref().unwrap_or("-"),
                part.size_str(),
                part.used_str(),
                part.mountpoint.as_deref().unwrap_or("(not mounted)")
            );
        }
    }
    Ok(())
}

fn device_row(device: &Device) -> String {
    let ro = if device.read_only { "  read-only" } else { "" };
    format!(
        "{:<4} {:<14} {:<28} {:>10} {:>10}  {}{}",
        device.index + 1,
        device.kname,
        device.name,
        device.size_str(),
        device.used_str(),
        device.partition_count(),
        ro
    )
}

pub async fn run_unmount(ctx: &AppContext, device: &str) -> Result<()> {
    load_devices(ctx).await;

    let summary = ctx
        .ops()
        .unmount(device)
        .await
        .with_context(|| format!("Failed to unmount {}", device))?;

    if summary.unmounted.is_empty() {
        println!("{}: nothing was mounted", summary.device);
    } else {
        for part in &summary.unmounted {
            println!("Unmounted {}", part);
        }
    }
    Ok(())
}

pub async fn run_clone(
    ctx: &AppContext,
    target: &str,
    output: Option<PathBuf>,
    block_size: Option<u64>,
) -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        warn!("Not running as root; reading raw devices will probably fail");
    }

    load_devices(ctx).await;

    let destination = output.unwrap_or_else(|| {
        default_destination(
            &ctx.config.backup_directory,
            std::path::Path::new(target),
            chrono::Local::now(),
        )
    });

    let request = CloneRequest {
        target: target.to_string(),
        destination,
        block_size,
    };

    let mut handle = ctx
        .ops()
        .start_clone(request)
        .await
        .with_context(|| format!("Failed to start clone of {}", target))?;

    let cancel = handle.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling clone");
            cancel.cancel();
        }
    });

    while let Some(status) = handle.next_status().await {
        print_status(&status);
    }
    interrupt.abort();

    let summary = handle.wait().await;
    eprintln!();
    let summary = summary.with_context(|| format!("Clone of {} did not complete", target))?;

    println!(
        "Saved {} ({}) to {} in {}s",
        summary.source.display(),
        format_size(summary.bytes_copied),
        summary.destination.display(),
        summary.duration_secs
    );
    Ok(())
}

fn print_status(status: &CloneStatus) {
    match status {
        CloneStatus::Started {
            source,
            destination,
            total_bytes,
        } => {
            eprintln!(
                "Copying {} ({}) to {}",
                source.display(),
                format_size(*total_bytes),
                destination.display()
            );
        }
        CloneStatus::Progress {
            bytes_copied,
            percentage,
        } => {
            eprint!("\r  {:>3}%  {:>10}", percentage, format_size(*bytes_copied));
            let _ = std::io::stderr().flush();
        }
        CloneStatus::Completed { .. } | CloneStatus::Failed(_) | CloneStatus::Cancelled => {}
    }
}

pub fn print_config(ctx: &AppContext) -> Result<()> {
    print!("{}", ctx.config.to_toml()?);
    Ok(())
}
