pub mod app;
pub mod config;
pub mod device;
pub mod device_plugin;
pub mod discovery;
