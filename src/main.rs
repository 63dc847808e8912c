#[tokio::main]
async fn main() -> anyhow::Result<()> {
    spoolkeeper::run().await
}
