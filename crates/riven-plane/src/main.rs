//! Riven Plane Server Binary
//!
//! Serves one device-bound vault over HTTP.

use std::env;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use riven_core::TrustError;
use riven_plane::{
    create_router, AppState, HostFingerprint, KernelConfig, MemoryBackend, PlaneConfig,
    TrustKernel,
};

#[tokio::main]
async fn main() {
    let log_level = env::var("RIVEN_LOG_LEVEL")
        .unwrap_or_else(|_| "info".into())
        .parse()
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let kernel_config = KernelConfig::from_env().expect("Invalid kernel configuration");
    let mut plane_config = PlaneConfig::from_env().expect("Invalid plane configuration");
    if plane_config.name.is_none() {
        plane_config.name = Some(format!("riven-plane-{}", uuid::Uuid::new_v4()));
    }

    let fingerprint = Arc::new(HostFingerprint::new());
    let kernel = if kernel_config.vault_dir.is_some() {
        TrustKernel::open_dir(kernel_config, fingerprint).expect("Failed to open vault")
    } else {
        warn!("RIVEN_VAULT_DIR not set, serving an in-memory vault");
        TrustKernel::new(Arc::new(MemoryBackend::new()), fingerprint, kernel_config)
    };

    match kernel.open().await {
        Ok(status) => info!(vault = ?status.vault_id, "Opened vault"),
        Err(TrustError::NotProvisioned) => {
            let provisioned = kernel.provision().await.expect("Failed to provision vault");
            info!(vault = %provisioned.genesis.vault_id, "Provisioned new vault");
        }
        Err(e) => {
            error!(error = %e, "Vault failed its startup checks");
            std::process::exit(e.exit_code());
        }
    }

    info!(
        name = ?plane_config.name,
        port = plane_config.port,
        "Starting Riven plane"
    );

    let addr = format!("0.0.0.0:{}", plane_config.port);
    let state = Arc::new(AppState {
        kernel: Arc::new(kernel),
        config: plane_config,
    });
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!(addr = %addr, "Riven plane listening");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
