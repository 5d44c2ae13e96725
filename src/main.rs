use std::sync::Arc;

use proofport_gateway::config::GatewayConfig;
use proofport_gateway::directory::StaticNodeDirectory;
use proofport_gateway::gateway::VerificationGateway;
use proofport_gateway::keys::{FsKeyRepository, VerificationKeyStore};
use proofport_gateway::manager::{spawn_rotation_task, CircuitManager};
use proofport_gateway::routes::{build_router, AppState};
use proofport_gateway::transport::SimulatedTransport;
use proofport_gateway::verifier::ProofVerifier;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proofport_gateway=info".into()),
        )
        .init();

    let config = GatewayConfig::from_env().unwrap_or_else(|e| {
        panic!("Invalid configuration: {}", e);
    });

    tracing::info!("Loading verification keys from: {}", config.keys_dir.display());
    if !config.allow_simulated {
        tracing::info!("Simulated verification disabled; unknown circuits will be rejected");
    }

    let keys = Arc::new(VerificationKeyStore::new(Arc::new(FsKeyRepository::new(
        config.keys_dir.clone(),
    ))));
    let verifier = Arc::new(ProofVerifier::new(keys, config.allow_simulated));

    let directory = StaticNodeDirectory::parse(&config.nodes).unwrap_or_else(|e| {
        panic!("Invalid NODES value: {}", e);
    });
    tracing::info!(
        "Relay directory: {} nodes, {} hops per circuit",
        directory.len(),
        config.hop_count
    );

    let circuits = Arc::new(CircuitManager::new(
        Arc::new(directory),
        Arc::new(SimulatedTransport::new(config.hop_latency_ms.clone())),
        config.manager_config(),
    ));

    if let Some(every) = config.rotate_interval {
        tracing::info!("Rotating circuits every {}s", every.as_secs());
        spawn_rotation_task(Arc::clone(&circuits), every);
    }

    let gateway = VerificationGateway::new(verifier, circuits, config.verify_timeout);

    // Build application state
    let state = Arc::new(AppState { gateway });

    // Build router
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);

    tracing::info!("Verification gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            panic!("Failed to bind to {}: {}", addr, e);
        });

    axum::serve(listener, app)
        .await
        .unwrap_or_else(|e| {
            panic!("Server error: {}", e);
        });
}
