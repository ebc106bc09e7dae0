#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rubrica_rust::run_worker().await {
        eprintln!("rubrica-worker fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
