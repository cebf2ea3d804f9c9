use clap::Parser;

use avsig::cli::{dispatch, Cli};
use avsig::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("info")?;
    dispatch(Cli::parse()).await
}
