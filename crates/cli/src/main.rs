use std::process::ExitCode;

fn main() -> ExitCode {
    ladder_cli::run()
}
