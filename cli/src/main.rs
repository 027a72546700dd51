// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

mod cli;
mod objectstore;

use anyhow::Result;

fn run() -> Result<()> {
    ostree_deploy_utils::initialize_tracing();
    tracing::trace!("starting");
    cli::run_from_iter(std::env::args())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
