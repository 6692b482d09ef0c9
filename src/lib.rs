//! s3proxy — a multi-backend S3-compatible replicating proxy.
//!
//! Accepts S3-protocol requests, authenticates them with SigV4, and fans
//! writes out to (and merges reads in from) a configured set of downstream
//! S3-compatible backends, tracking each backend's health independently.

pub mod auth;
pub mod cache;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod metrics;
pub mod model;
pub mod multipart;
pub mod registry;
pub mod replication;
pub mod routing;
pub mod server;
pub mod xml;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::NoopCache;
use crate::config::Config;
use crate::fetch::FetchExecutor;
use crate::model::Credential;
use crate::multipart::MultipartCoordinator;
use crate::registry::Registry;
use crate::replication::ReplicationExecutor;
use crate::routing::RoutingEngine;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub multipart: Arc<MultipartCoordinator>,
    pub routing: Arc<RoutingEngine>,
}

impl AppState {
    /// Build the full component graph from a loaded [`Config`]
    /// (`spec.md` §2 "System Overview").
    pub fn build(config: &Config) -> Self {
        let registry = Arc::new(Registry::new(&config.backend.backends, config.backend.manager.clone()));
        let multipart = Arc::new(MultipartCoordinator::new(Duration::from_secs(config.replicator.multipart_upload_ttl)));

        let operation_timeout = Duration::from_secs(config.replicator.operation_timeout);
        let retry_delay = Duration::from_secs(config.replicator.retry_delay);
        // Shared across both executors: caps the total number of in-flight
        // backend workers the process issues at once (`spec.md` §5
        // "MaxConcurrentOperations").
        let semaphore = Arc::new(tokio::sync::Semaphore::new(config.replicator.max_concurrent_operations));
        // `buffer_size` is a byte budget in config, but the tee's mpsc
        // channels are bounded in chunks, not bytes — approximate assuming
        // ~8KiB chunks off the wire, clamped to a sane range either way.
        let stream_channel_capacity = (config.replicator.buffer_size / 8192).clamp(2, 256);

        let replication = ReplicationExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&multipart),
            operation_timeout,
            Arc::clone(&semaphore),
            config.replicator.retry_attempts,
            retry_delay,
            stream_channel_capacity,
        );
        let fetch = FetchExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&multipart),
            Arc::new(NoopCache),
            operation_timeout,
            config.server.virtual_bucket.clone(),
            Arc::clone(&semaphore),
            config.replicator.retry_attempts,
            retry_delay,
        );

        let credentials: HashMap<String, Credential> = config
            .auth
            .static_users
            .users
            .iter()
            .map(|u| {
                (
                    u.access_key.clone(),
                    Credential {
                        secret_key: u.secret_key.clone(),
                        display_name: u.display_name.clone(),
                    },
                )
            })
            .collect();

        let routing = Arc::new(RoutingEngine::new(config, credentials, replication, fetch));

        AppState {
            registry,
            multipart,
            routing,
        }
    }

    /// Start the Registry's active prober and the Multipart Coordinator's
    /// sweeper background tasks.
    pub fn start_background_tasks(&self, config: &Config) {
        self.registry.start();
        self.multipart.start(Duration::from_secs(config.replicator.cleanup_interval));
    }

    pub async fn stop_background_tasks(&self) {
        self.registry.stop().await;
        self.multipart.stop().await;
    }
}
