use routeplane::cli::run_cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional .env; a missing file is fine
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    run_cli().await
}
