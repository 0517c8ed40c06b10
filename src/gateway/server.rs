//! # HTTP Server Module
//!
//! Builds the gateway from configuration, wires the axum router and runs the
//! listener with graceful shutdown.
//!
//! ## Routes
//! - `/health`, `/metrics` at the root and under `/api/v1/security`
//! - `/api/v1/security/{validate, metrics/security, alerts, events}`
//! - everything else falls through to the upstream proxy
//!
//! Every route sits behind [`security_middleware`]. The current pipeline is held
//! behind a lock that is only taken to clone or replace one `Arc`, so a reload
//! is a single pointer swap.

use axum::{
    routing::{get, post},
    Router,
};
use parking_lot::RwLock;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{AllowAuthenticated, CredentialVerifier, PolicyDecisionPoint};
use crate::core::config::{ConfigChangeEvent, GatewayConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::gateway::handlers;
use crate::gateway::pipeline::{PipelineDeps, SecurityPipeline};
use crate::gateway::security_layer::security_middleware;
use crate::observability::{
    AlertSink, EventStore, HeuristicThreatDetector, KvAlertManager, KvEventStore, SecurityMetrics,
    SecurityMonitor, ThreatDetector,
};
use crate::security::waf::{GeoResolver, IpReputation, NoopGeoResolver};
use crate::store::{KvStore, MemoryStore};

/// Shared state handed to the middleware and every handler
#[derive(Clone)]
pub struct AppState {
    inner: Arc<SharedState>,
}

struct SharedState {
    pipeline: RwLock<Arc<SecurityPipeline>>,
    deps: PipelineDeps,
    events: Arc<dyn EventStore>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<SecurityMetrics>,
    concurrency: Arc<Semaphore>,
}

impl AppState {
    /// Pipeline generation for a new request
    pub fn pipeline(&self) -> Arc<SecurityPipeline> {
        Arc::clone(&*self.inner.pipeline.read())
    }

    pub fn monitor(&self) -> &SecurityMonitor {
        &self.inner.deps.monitor
    }

    pub fn metrics(&self) -> &Arc<SecurityMetrics> {
        &self.inner.metrics
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.inner.events
    }

    pub fn alerts(&self) -> &Arc<dyn AlertSink> {
        &self.inner.alerts
    }

    pub fn reputation(&self) -> &Arc<IpReputation> {
        &self.inner.deps.reputation
    }

    pub fn concurrency(&self) -> &Arc<Semaphore> {
        &self.inner.concurrency
    }

    /// Build a pipeline for `config` and swap it in; the running one stays on error
    pub fn reload(&self, config: GatewayConfig) -> GatewayResult<()> {
        config.validate()?;
        if config.server.max_concurrent_requests != self.pipeline().config().server.max_concurrent_requests {
            warn!("server.max_concurrent_requests changes take effect after a restart");
        }

        let next = Arc::new(SecurityPipeline::build(Arc::new(config), &self.inner.deps)?);
        let previous = std::mem::replace(&mut *self.inner.pipeline.write(), next);
        previous.retire();
        info!("Security pipeline reloaded");
        Ok(())
    }
}

/// Assembles a [`Gateway`]; every collaborator has a default
pub struct GatewayBuilder {
    config: GatewayConfig,
    store: Option<Arc<dyn KvStore>>,
    events: Option<Arc<dyn EventStore>>,
    alerts: Option<Arc<dyn AlertSink>>,
    detector: Option<Arc<dyn ThreatDetector>>,
    geo: Option<Arc<dyn GeoResolver>>,
    verifier: Option<Arc<dyn CredentialVerifier>>,
    policy: Option<Arc<dyn PolicyDecisionPoint>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            store: None,
            events: None,
            alerts: None,
            detector: None,
            geo: None,
            verifier: None,
            policy: None,
        }
    }

    /// Store for rate-limit state, and for events and alerts unless those are set
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_store(mut self, events: Arc<dyn EventStore>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn threat_detector(mut self, detector: Arc<dyn ThreatDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn geo_resolver(mut self, geo: Arc<dyn GeoResolver>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn credential_verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PolicyDecisionPoint>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Validate the configuration, start the security monitor and build the first pipeline
    pub fn build(self) -> GatewayResult<Gateway> {
        self.config.validate()?;
        let config = self.config;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KvStore>);
        let metrics = Arc::new(SecurityMetrics::new());
        let events = self.events.unwrap_or_else(|| {
            Arc::new(KvEventStore::new(
                Arc::clone(&store),
                config.monitoring.retention_period,
            )) as Arc<dyn EventStore>
        });
        let alerts = self.alerts.unwrap_or_else(|| {
            Arc::new(KvAlertManager::new(Arc::clone(&store), Arc::clone(&metrics))) as Arc<dyn AlertSink>
        });
        let detector = self.detector.unwrap_or_else(|| {
            Arc::new(HeuristicThreatDetector::new(
                config.monitoring.alert_thresholds.time_window,
            )) as Arc<dyn ThreatDetector>
        });
        let reputation = Arc::new(IpReputation::new());

        let monitor = SecurityMonitor::start(
            config.monitoring.clone(),
            Arc::clone(&events),
            Arc::clone(&alerts),
            Arc::clone(&metrics),
            detector,
            Arc::clone(&reputation),
        );

        let deps = PipelineDeps {
            store,
            monitor,
            reputation,
            geo: self
                .geo
                .unwrap_or_else(|| Arc::new(NoopGeoResolver) as Arc<dyn GeoResolver>),
            verifier: self.verifier,
            policy: self
                .policy
                .unwrap_or_else(|| Arc::new(AllowAuthenticated) as Arc<dyn PolicyDecisionPoint>),
        };

        let concurrency = Arc::new(Semaphore::new(config.server.max_concurrent_requests));
        let pipeline = SecurityPipeline::build(Arc::new(config), &deps)?;

        Ok(Gateway {
            state: AppState {
                inner: Arc::new(SharedState {
                    pipeline: RwLock::new(Arc::new(pipeline)),
                    deps,
                    events,
                    alerts,
                    metrics,
                    concurrency,
                }),
            },
        })
    }
}

/// The assembled security gateway
pub struct Gateway {
    state: AppState,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn monitor(&self) -> &SecurityMonitor {
        self.state.monitor()
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Apply configuration changes published by the config manager
    pub fn watch_config(&self, mut changes: broadcast::Receiver<ConfigChangeEvent>) -> JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        info!(path = ?change.file_path, "Applying configuration change");
                        if let Err(e) = state.reload((*change.config).clone()) {
                            error!(error = %e, "Configuration change rejected, keeping the running pipeline");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed configuration changes, waiting for the next one");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let server = self.state.pipeline().config().server.clone();
        let addr = format!("{}:{}", server.bind_address, server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::internal(format!("Failed to bind to {}: {}", addr, e)))?;

        info!(address = %addr, "Security gateway listening");
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    ///
    /// After `shutdown` resolves, in-flight requests get `shutdown_grace_period`
    /// to finish; then the monitor drains its queue and stops.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let grace = self.state.pipeline().config().server.shutdown_grace_period;
        let stopping = CancellationToken::new();
        let signal = {
            let stopping = stopping.clone();
            async move {
                shutdown.await;
                info!("Shutdown requested, draining in-flight requests");
                stopping.cancel();
            }
        };

        let app = self.router();
        let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal);

        tokio::select! {
            result = server => {
                result.map_err(|e| GatewayError::internal(format!("Server error: {}", e)))?;
            }
            _ = grace_elapsed(&stopping, grace) => {
                warn!(grace_period = ?grace, "Grace period elapsed with requests still in flight");
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop background tasks and flush pending security events
    pub async fn shutdown(&self) {
        self.state.pipeline().retire();
        self.state.monitor().shutdown().await;
        info!("Security gateway stopped");
    }
}

async fn grace_elapsed(stopping: &CancellationToken, grace: Duration) {
    stopping.cancelled().await;
    tokio::time::sleep(grace).await;
}

/// Router with management routes, the proxy fallback and the security layer
pub fn build_router(state: AppState) -> Router {
    let security = Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/metrics/security", get(handlers::security_metrics))
        .route("/validate", post(handlers::validate))
        .route("/alerts", get(handlers::list_alerts))
        .route("/alerts/:id", get(handlers::get_alert).patch(handlers::update_alert))
        .route("/alerts/:id/resolve", post(handlers::resolve_alert))
        .route("/events", get(handlers::query_events));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest("/api/v1/security", security)
        .fallback(handlers::proxy)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            security_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
