use terraform_provider_drp::{init_logging, serve, DrpProvider};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting DRP provider");
    serve(DrpProvider::new()).await
}
