use std::path::PathBuf;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let workspace_root = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => match std::env::current_dir() {
            Ok(path) => path,
            Err(error) => {
                eprintln!("failed to resolve current directory: {error}");
                return ExitCode::FAILURE;
            }
        },
    };

    match remindsync::run(&workspace_root).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("remindsync-worker: {error}");
            ExitCode::FAILURE
        }
    }
}
