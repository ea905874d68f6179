use clap::Parser;
use monfaristo::cli::{run, Cli};

fn main() -> std::process::ExitCode {
    run(Cli::parse())
}
