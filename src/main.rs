use prism::api::{create_router, AppState};
use prism::autoconfig::{RegistryActions, StreamManager};
use prism::config::{self, RelayConfig};
use prism::env::{EnvironmentRegistry, EventForwarding};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prism=info".into()),
        )
        .init();

    info!("Prism relay starting...");

    // Load configuration
    let config_path = std::env::var("PRISM_CONFIG").unwrap_or_else(|_| "prism.toml".to_string());
    let mut relay_config = config::load_config(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RelayConfig::default()
    });

    // Environment variable overrides
    if let Ok(port) = std::env::var("PORT") {
        match port.parse() {
            Ok(port) => relay_config.main.port = port,
            Err(_) => warn!(port = %port, "Ignoring unparseable PORT override"),
        }
    }
    if let Ok(key) = std::env::var("AUTO_CONFIG_KEY") {
        relay_config.main.auto_config_key = key;
    }

    if relay_config.main.tls_enabled {
        // TLS termination is an external collaborator; refuse to pretend
        error!("TLS listeners are not handled in-process; terminate TLS in front of the relay");
        std::process::exit(1);
    }

    // Event proxy wiring (per-environment dispatchers come from this)
    let event_forwarding = if relay_config.events.enabled && !relay_config.main.events_uri.is_empty()
    {
        Some(EventForwarding {
            uri: relay_config.main.events_uri.clone(),
            timeout: Duration::from_secs(relay_config.events.flush_timeout_seconds),
        })
    } else {
        None
    };

    let registry = Arc::new(EnvironmentRegistry::new(
        relay_config.main.keepalive_interval(),
        event_forwarding,
    ));

    // Statically configured environments
    for (name, env_config) in &relay_config.environments {
        let params = env_config.environment_params(name);
        if let Err(e) = registry.add_environment(params).await {
            error!(environment = %name, error = %e, "Failed to configure environment");
            std::process::exit(1);
        }
        info!(environment = %name, "Configured environment");
    }

    // Auto-configuration subscriber (background task). The manager only
    // returns when the control plane rejects the key; a panicked task is
    // restarted.
    if !relay_config.main.auto_config_key.is_empty() {
        let actions = Arc::new(RegistryActions::new(Arc::clone(&registry)));
        let manager = Arc::new(StreamManager::new(
            &relay_config.main.stream_uri,
            &relay_config.main.auto_config_key,
            actions,
        ));
        tokio::spawn(async move {
            loop {
                let run = tokio::spawn(Arc::clone(&manager).run());
                match run.await {
                    Ok(()) => break,
                    Err(e) => {
                        error!(error = %e, "Auto-configuration subscriber failed; restarting");
                    }
                }
            }
        });
        info!("Auto-configuration subscriber started");
    }

    if relay_config.main.exit_always {
        info!("exit_always is set; shutting down");
        std::process::exit(0);
    }

    let app = create_router(AppState {
        registry: Arc::clone(&registry),
    });

    let addr = format!("0.0.0.0:{}", relay_config.main.port);
    info!(addr = %addr, "Starting relay server");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind listener");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Server exited with error");
        std::process::exit(1);
    }
}
