use anyhow::Result;
use build_bisect::{cli, logging};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init(args.verbose);

    match cli::run(args).await {
        // Exit explicitly: a verdict prompt may still be blocked on stdin.
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => Err(e),
    }
}
