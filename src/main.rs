use std::process::ExitCode;

fn main() -> ExitCode {
    dotnet_corelib::run_cli()
}
