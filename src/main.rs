#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcp_loader::run().await
}
