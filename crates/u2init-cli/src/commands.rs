use clap::CommandFactory;
use clap_complete::{Shell, generate};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use u2init_core::adb::{AdbCli, DeviceStatus, Transport, list_devices};
use u2init_core::bootstrap::{DeviceReport, Environment, InitOptions, init_devices};
use u2init_core::cache::{ContentCache, UreqDownloader};
use u2init_core::cancel::CancelToken;
use u2init_core::config::Config;
use u2init_core::probe::UreqHealthCheck;
use u2init_core::remote::install_via_agent;

use crate::Cli;

type CmdResult = Result<(), Box<dyn std::error::Error>>;

fn transport(config: &Config) -> Arc<dyn Transport> {
    Arc::new(AdbCli::new(config.adb_path.clone(), config.adb_timeout()))
}

/// Bootstrap every connected device
pub fn init(config: &Config, options: &InitOptions, deadline: Option<u64>) -> CmdResult {
    let downloader = UreqDownloader::new(config.download_timeout(), config.download_retries);
    let cache = ContentCache::new(config.cache_dir.clone(), Arc::new(downloader));
    let cancel = deadline.map_or_else(CancelToken::new, |secs| {
        CancelToken::with_deadline(Duration::from_secs(secs))
    });
    let env = Environment {
        transport: transport(config),
        cache: &cache,
        health: &UreqHealthCheck,
        config,
        cancel,
    };

    let reports = init_devices(&env, options)?;
    print_summary(&reports);

    let failed = reports.iter().filter(|r| r.result.is_err()).count();
    if failed > 0 {
        return Err(format!("{failed} of {} device(s) failed", reports.len()).into());
    }
    if reports.is_empty() {
        warn!("nothing to initialize");
    }
    Ok(())
}

fn print_summary(reports: &[DeviceReport]) {
    for report in reports {
        match &report.result {
            Ok(session) => println!(
                "{:<20} ok      minicap: {}, apk: {}, atx-agent: {} ({})",
                report.serial, session.minicap, session.apk, session.agent, session.agent_version
            ),
            Err(e) => println!("{:<20} FAILED  {e}", report.serial),
        }
    }
}

/// List connected Android devices
pub fn devices(config: &Config) -> CmdResult {
    let entries = list_devices(transport(config).as_ref(), &CancelToken::new())?;
    if entries.is_empty() {
        eprintln!("No devices found. Make sure ADB is installed and devices are connected.");
        return Ok(());
    }

    println!("Found {} device(s):\n", entries.len());
    for entry in &entries {
        let hint = match entry.status {
            DeviceStatus::Unauthorized => "  (accept the USB debugging prompt)",
            DeviceStatus::Offline => "  (reconnect the device)",
            _ => "",
        };
        let status = entry.status.to_string();
        println!("  {:<20} {status:<12} {}{hint}", entry.serial, entry.description);
    }
    Ok(())
}

/// Ask the agent at `addr` to install `apk_url`
pub fn install(config: &Config, addr: &str, apk_url: &str) -> CmdResult {
    let package = install_via_agent(addr, apk_url, config.remote)?;
    info!("{addr}: {package} installed");
    println!("{package}");
    Ok(())
}

/// Print the effective configuration, or store it at `write_to`
pub fn show_config(config: &Config, write_to: Option<&Path>) -> CmdResult {
    match write_to {
        Some(path) => {
            config.save(path)?;
            info!("configuration written to {}", path.display());
        }
        None => print!("{}", config.to_toml()?),
    }
    Ok(())
}

pub fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
