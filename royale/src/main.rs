use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;

mod init;
mod opts;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = opts::Cli::parse();
    init::tracing(args.log);

    opts::run(args).await
}
