//! quarry CLI binary. All logic lives in the library; main only maps the
//! outcome to an exit code (0 success, 1 failure).

#[tokio::main]
async fn main() {
    if let Err(err) = quarry::cli::run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
