#[tokio::main]
async fn main() -> eyre::Result<()> {
    msgflow::run().start().await
}
