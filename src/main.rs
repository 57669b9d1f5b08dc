use std::path::PathBuf;

use log::LevelFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vigil_lib::utils::init_logging(LevelFilter::Info);
    vigil_lib::run(config_path()).await
}

/// `--config <path>` wins over `VIGIL_CONFIG`.
fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var_os("VIGIL_CONFIG").map(PathBuf::from)
}
