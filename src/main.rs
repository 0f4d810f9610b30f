//! Predictive outbound dialer control plane.
//!
//! Keeps a pool of human operators busy by placing more concurrent
//! outbound calls than there are idle operators, detecting live answers
//! via AMD, and bridging them to the longest-idle operator while holding
//! the abandon rate under the compliance ceiling.

mod config;
mod models;
mod server;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("parallel_dialer=info".parse().unwrap()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let settings = config::Settings::from_env();
    tracing::info!("Starting {} on port {}", settings.app_name, settings.port);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(server::run_server(settings))
}
