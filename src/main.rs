#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rubrica_rust::run().await {
        eprintln!("rubrica-rust fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
