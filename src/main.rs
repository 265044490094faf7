#[tokio::main]
async fn main() {
    if let Err(error) = live_metrics_lib::run().await {
        tracing::error!(%error, "live metrics failed");
        eprintln!("live-metrics: {error}");
        std::process::exit(1);
    }
}
