use anyhow::Result;
use clap::Parser;
use tenstorrent_device_plugin::app::Application;
use tenstorrent_device_plugin::config::Cli;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    utils::logging::init(cli.daemon.log_level);

    tracing::info!("Starting Tenstorrent device plugin {}", &**version::VERSION);

    let app = Application::new(cli.daemon)?;
    app.run().await
}
