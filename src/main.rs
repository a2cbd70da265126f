#![cfg_attr(all(target_os = "windows", not(debug_assertions)), windows_subsystem = "windows")]

use anyhow::Context;
use std::sync::Arc;
use update_lock::app::{App, Collaborators, LogNotifier, Startup};
use update_lock::settings::{resolve_config_path, AppConfig};
use update_lock::settings_store::JsonSettingsStore;
use update_lock::{elevation, logging, service, supervision};

fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path()?;
    let (config, fixes) = AppConfig::load(&config_path)?;
    logging::init(config.debug_logging, config.log_file.as_deref());
    for fix in &fixes {
        tracing::warn!("{}: {fix}", config_path.display());
    }

    if let Some(request) = supervision::watcher_request() {
        return supervision::run_watcher(&request, &config.supervision);
    }

    tracing::info!("Starting with configuration {}", config_path.display());
    let is_elevated = elevation::is_elevated();
    tracing::info!("Elevated: {is_elevated}");

    let settings_path = config.settings_path()?;
    let collaborators = Collaborators {
        is_elevated,
        settings: Arc::new(JsonSettingsStore::new(settings_path)),
        services: service::system_service_control()?,
        notifier: Box::new(LogNotifier),
    };

    let app = match App::start(&config, collaborators)? {
        Startup::Started(app) => app,
        Startup::AlreadyRunning => return Ok(()),
    };

    let handle = app.handle();
    ctrlc::set_handler(move || handle.request_exit()).context("install Ctrl-C handler")?;

    let summary = app.run()?;
    tracing::info!("Stopped after {} tick(s)", summary.ticks);
    Ok(())
}
