//! Maintenance entry point.
//!
//! # Responsibility
//! - Load store settings, start logging and synchronize the schema of each
//!   named tenant (or the main tenant when none is given).
//! - Print one line per tenant so scripted runs can check the outcome.
//!
//! Usage: `wikistore_cli <settings.json> [tenant...]`

use log::info;
use std::process::ExitCode;
use wikistore_core::{StoreContext, StoreSettings, WikiStore};

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(settings_path) = args.next() else {
        eprintln!("usage: wikistore_cli <settings.json> [tenant...]");
        return ExitCode::from(2);
    };
    let tenants: Vec<String> = args.collect();

    match run(&settings_path, &tenants) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(message) => {
            eprintln!("wikistore_cli: {message}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when at least one tenant failed.
fn run(settings_path: &str, tenants: &[String]) -> Result<bool, String> {
    let settings = StoreSettings::from_path(settings_path).map_err(|err| err.to_string())?;
    wikistore_core::logging::init_logging_in_data_dir(&settings.data_dir)?;
    println!("wikistore_core version={}", wikistore_core::core_version());

    let tenants = if tenants.is_empty() {
        vec![settings.main_tenant.clone()]
    } else {
        tenants.to_vec()
    };
    let store = WikiStore::open(settings).map_err(|err| err.to_string())?;
    info!(
        "event=cli_run module=cli status=start tenants={}",
        tenants.len()
    );

    let mut all_ok = true;
    for tenant in &tenants {
        let mut ctx = StoreContext::for_tenant(tenant.as_str()).with_request_url("cli://schema");
        match store.update_schema(&mut ctx, false) {
            Ok(report) if report.skipped => println!("tenant={tenant} status=skipped"),
            Ok(report) => {
                println!(
                    "tenant={tenant} status=ok generated={} executed={} failed={}",
                    report.generated,
                    report.executed.len(),
                    report.failed.len()
                );
                for failed in &report.failed {
                    println!("  failed sql=\"{}\" error=\"{}\"", failed.sql, failed.error);
                }
                all_ok &= report.failed.is_empty();
            }
            Err(err) => {
                println!("tenant={tenant} status=error error=\"{err}\"");
                all_ok = false;
            }
        }
        let cleanup = store.clean_up(&mut ctx);
        if !cleanup.is_clean() {
            println!("tenant={tenant} cleanup=dangling");
        }
    }

    let mut ctx = StoreContext::new();
    store.shutdown(&mut ctx);
    info!("event=cli_run module=cli status=ok ok={}", all_ok);
    Ok(all_ok)
}
