mod cli;
mod controller;
mod runs;
mod waiter;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("client=debug,gridsim=info,worker=info")
        .init();

    cli::run().await
}
