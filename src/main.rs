#[tokio::main]
async fn main() -> anyhow::Result<()>
{
    logicon::job_manager::interface::network::provider::main().await
}
