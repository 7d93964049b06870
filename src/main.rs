use clap::Parser;

use ukify::cli::Cli;

fn main() {
    Cli::parse().call(module_path!())
}
