//! Ambulance Routing - Axum Server

use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ambulance_routing=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    ambulance_routing::console::print_banner();

    let app = ambulance_routing::api::create_router();
    let addr = SocketAddr::from(([0, 0, 0, 0], 7860));
    println!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
