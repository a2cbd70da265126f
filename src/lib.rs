pub mod app;
pub mod elevation;
pub mod engine;
pub mod hooks;
pub mod logging;
#[cfg(target_os = "windows")]
mod registry;
pub mod scheduler;
pub mod service;
pub mod settings;
pub mod settings_store;
pub mod supervision;
pub mod timer;
