use anyhow::{Context, Result};
use std::{env, path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};
use train::config::Config;

#[derive(Debug, Clone, StructOpt)]
/// Train a YOLOv3 model on VOC annotations
struct Args {
    #[structopt(short = "c", long, default_value = "config.json")]
    /// configuration file
    pub config: PathBuf,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse arguments
    let Args { config } = Args::from_args();
    let config = Arc::new(
        Config::open(&config)
            .with_context(|| format!("failed to load config file '{}'", config.display()))?,
    );

    // start training program
    train::start(config).await?;

    Ok(())
}
