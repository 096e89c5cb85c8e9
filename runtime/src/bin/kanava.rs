//! kanava demo: a simulated device fleet streamed through both pipelines
//!
//! Configure with `KANAVA_*` environment variables or a `.env` file.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kanava_runtime::run().await
}
