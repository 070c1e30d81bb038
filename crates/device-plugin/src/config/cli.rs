use clap::Parser;
use utils::version;

use crate::config::daemon::DaemonArgs;

/// Kubernetes device plugin advertising Tenstorrent accelerator cards
#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(flatten)]
    pub daemon: DaemonArgs,
}
