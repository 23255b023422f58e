//! Global services manager for long-running and background services.
//!
//! Services register with the manager and are started/stopped/restarted together.
//! Start order respects [dependencies](Service::dependencies); a service is only
//! started after all of its dependencies.
//!
//! **HTTP route registration:** Services (or main) can register `/api/*` route
//! builders via [add_api_routes](ServicesManagerBuilder::add_api_routes). The
//! [HttpServerService](crate::services::http_server::HttpServerService) builds
//! the app by calling [build_api_router](ServicesManager::build_api_router)
//! which merges all registered route builders. Use this so any service can
//! contribute endpoints without the HTTP service needing to know about them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::Router;
use parking_lot::RwLock as ParkingRwLock;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::app::AppState;

/// Health status of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a service health check.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServiceHealth {
    pub fn healthy() -> Self {
        Self { status: HealthStatus::Healthy, message: None }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Degraded, message: Some(message.into()) }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Unhealthy, message: Some(message.into()) }
    }
}

/// A service that can be started, stopped, restarted, and health-checked by the manager.
///
/// Implement this for components that run background tasks (HTTP listener,
/// content store sweeper, session reaper). Stateless utilities (argument
/// builder, ladder generator) do not need to implement `Service`; they are
/// constructed and passed where needed.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Unique name for logging and lookup (e.g. "http", "content-sweeper").
    fn name(&self) -> &str;

    /// Names of services that must be started before this one. Start order is
    /// computed from this; cycles are an error.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Start background tasks or connections. Idempotent allowed.
    async fn start(&self) -> Result<()>;

    /// Stop background tasks and release resources. Idempotent allowed.
    async fn stop(&self) -> Result<()>;

    /// Restart the service: stop then start. Override for atomic or
    /// non-sequential restart behaviour.
    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Report current health. Default returns [ServiceHealth::healthy].
    async fn health(&self) -> Result<ServiceHealth> {
        Ok(ServiceHealth::healthy())
    }

    /// Whether this service exposes HTTP routes. Used by the app to decide
    /// which route modules to merge; route wiring is done in `main`.
    fn provides_routes(&self) -> bool {
        false
    }
}

/// Builder for [ServicesManager]: add services, then [build](ServicesManagerBuilder::build)
/// or [start](ServicesManagerBuilder::start).
pub struct ServicesManagerBuilder {
    registrations: Vec<Arc<dyn Service>>,
    api_route_registrations: Vec<(String, Box<dyn Fn(AppState) -> Router<AppState> + Send + Sync>)>,
}

impl ServicesManagerBuilder {
    pub fn new() -> Self {
        Self { registrations: Vec::new(), api_route_registrations: Vec::new() }
    }

    /// Register a route builder for `/api/*`. All registered builders are merged
    /// in order when the HTTP server builds the app.
    pub fn add_api_routes<N, F>(mut self, name: N, builder: F) -> Self
    where
        N: Into<String>,
        F: Fn(AppState) -> Router<AppState> + Send + Sync + 'static,
    {
        self.api_route_registrations.push((name.into(), Box::new(builder)));
        self
    }

    /// Add a pre-built service. Add in dependency order.
    pub fn add_service(mut self, service: Arc<dyn Service>) -> Self {
        self.registrations.push(service);
        self
    }

    /// Build the manager and register all services. Does not start them.
    pub async fn build(self) -> Result<Arc<ServicesManager>> {
        let manager = Arc::new(ServicesManager::new());
        for (name, builder) in self.api_route_registrations {
            manager.register_api_routes(name, builder);
        }
        for svc in self.registrations {
            manager.register(svc).await;
        }
        Ok(manager)
    }

    /// Build the manager, register all services, and start them in dependency order.
    pub async fn start(self) -> Result<Arc<ServicesManager>> {
        let manager = self.build().await?;
        manager.start_all().await?;
        Ok(manager)
    }
}

impl Default for ServicesManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Global registry and lifecycle controller for services.
pub struct ServicesManager {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
    started: RwLock<HashSet<String>>,
    api_route_builders: ParkingRwLock<Vec<(String, Box<dyn Fn(AppState) -> Router<AppState> + Send + Sync>)>>,
}

impl Default for ServicesManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServicesManager {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            started: RwLock::new(HashSet::new()),
            api_route_builders: ParkingRwLock::new(Vec::new()),
        }
    }

    pub fn register_api_routes(
        &self,
        name: String,
        builder: Box<dyn Fn(AppState) -> Router<AppState> + Send + Sync>,
    ) {
        self.api_route_builders.write().push((name, builder));
    }

    /// Build the merged `/api` router from all registered route builders.
    pub fn build_api_router(&self, state: AppState) -> Router<AppState> {
        let builders = self.api_route_builders.read();
        let mut api = Router::new();
        for (name, f) in builders.iter() {
            api = api.merge(f(state.clone()));
            tracing::debug!(api_routes = %name, "merged API route builder");
        }
        api
    }

    pub fn builder() -> ServicesManagerBuilder {
        ServicesManagerBuilder::new()
    }

    /// Compute start order from dependencies (topological order). Returns an error on unknown deps or cycles.
    async fn start_order(&self) -> Result<Vec<String>> {
        let guard = self.services.read().await;
        let names: HashSet<String> = guard.keys().cloned().collect();
        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        for (name, svc) in guard.iter() {
            let d = svc.dependencies();
            for dep in &d {
                if !names.contains(dep) {
                    anyhow::bail!("service {} depends on {} which is not registered", name, dep);
                }
            }
            deps.insert(name.clone(), d);
        }
        drop(guard);

        let mut in_degree: HashMap<String, usize> =
            deps.iter().map(|(name, d)| (name.clone(), d.len())).collect();
        let mut dependent_on: HashMap<String, Vec<String>> =
            names.iter().map(|n| (n.clone(), Vec::new())).collect();
        for (name, d) in &deps {
            for dep in d {
                dependent_on.get_mut(dep).unwrap().push(name.clone());
            }
        }
        let mut queue: Vec<String> =
            in_degree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| n.clone()).collect();
        let mut order = Vec::with_capacity(names.len());
        while let Some(n) = queue.pop() {
            order.push(n.clone());
            for s in dependent_on.get(&n).unwrap_or(&vec![]) {
                let deg = in_degree.get_mut(s).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push(s.clone());
                }
            }
        }
        if order.len() != names.len() {
            anyhow::bail!("service dependency cycle detected");
        }
        Ok(order)
    }

    /// Register a service. Does not start it. If a service with the same name
    /// exists, it is replaced (the previous instance is not stopped).
    pub async fn register(&self, service: Arc<dyn Service>) {
        let name = service.name().to_string();
        let mut guard = self.services.write().await;
        if guard.insert(name.clone(), service).is_some() {
            warn!(service = %name, "service reregistered, overwriting previous");
        } else {
            info!(service = %name, "service registered");
        }
    }

    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.started.write().await.remove(name);
        let mut guard = self.services.write().await;
        let out = guard.remove(name);
        if out.is_some() {
            info!(service = %name, "service unregistered");
        }
        out
    }

    /// Start all registered services in dependency order (dependencies first).
    pub async fn start_all(&self) -> Result<()> {
        let order = self.start_order().await?;
        for name in &order {
            let svc = {
                let g = self.services.read().await;
                g.get(name).cloned()
            };
            if let Some(s) = svc {
                if let Err(e) = s.start().await {
                    warn!(service = %name, error = %e, "service start failed");
                    return Err(e).context(format!("failed to start service {}", name));
                }
                self.started.write().await.insert(name.clone());
                info!(service = %name, "service started");
            }
        }
        Ok(())
    }

    /// Stop all registered services in reverse dependency order (dependents first).
    pub async fn stop_all(&self) -> Result<()> {
        let order = self.start_order().await?;
        for name in order.into_iter().rev() {
            let svc = {
                let g = self.services.read().await;
                g.get(&name).cloned()
            };
            if let Some(s) = svc {
                if let Err(e) = s.stop().await {
                    warn!(service = %name, error = %e, "service stop failed");
                } else {
                    info!(service = %name, "service stopped");
                }
                self.started.write().await.remove(&name);
            }
        }
        Ok(())
    }

    pub async fn restart_one(&self, name: &str) -> Result<()> {
        let svc = {
            let guard = self.services.read().await;
            guard.get(name).cloned()
        };
        match svc {
            Some(s) => {
                s.stop().await?;
                self.started.write().await.remove(name);
                s.start().await?;
                self.started.write().await.insert(name.to_string());
                info!(service = %name, "service restarted");
                Ok(())
            }
            None => anyhow::bail!("service not found: {}", name),
        }
    }

    pub async fn restart_all(&self) -> Result<()> {
        self.stop_all().await?;
        self.start_all().await
    }

    pub async fn stop_one(&self, name: &str) -> bool {
        let svc = {
            let guard = self.services.read().await;
            guard.get(name).cloned()
        };
        if let Some(s) = svc {
            match s.stop().await {
                Ok(()) => {
                    self.started.write().await.remove(name);
                    info!(service = %name, "service stopped");
                    true
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "service stop failed");
                    false
                }
            }
        } else {
            warn!(service = %name, "service not found, cannot stop");
            false
        }
    }

    pub async fn start_one(&self, name: &str) -> Result<()> {
        let (svc, deps) = {
            let guard = self.services.read().await;
            let s = guard.get(name).cloned();
            let d = s.as_ref().map(|s| s.dependencies()).unwrap_or_default();
            (s, d)
        };
        let svc = svc.ok_or_else(|| anyhow::anyhow!("service not found: {}", name))?;
        let started = self.started.read().await;
        for dep in &deps {
            if !started.contains(dep) {
                anyhow::bail!("cannot start {}: dependency {} is not started", name, dep);
            }
        }
        drop(started);
        svc.start().await?;
        self.started.write().await.insert(name.to_string());
        info!(service = %name, "service started");
        Ok(())
    }

    pub async fn health_one(&self, name: &str) -> Result<ServiceHealth> {
        let svc = {
            let guard = self.services.read().await;
            guard.get(name).cloned()
        };
        match svc {
            Some(s) => s.health().await,
            None => anyhow::bail!("service not found: {}", name),
        }
    }

    pub async fn health_all(&self) -> HashMap<String, ServiceHealth> {
        let guard = self.services.read().await;
        let names: Vec<String> = guard.keys().cloned().collect();
        drop(guard);
        let mut out = HashMap::new();
        for name in names {
            let svc = {
                let g = self.services.read().await;
                g.get(&name).cloned()
            };
            if let Some(s) = svc {
                let h = match s.health().await {
                    Ok(h) => h,
                    Err(e) => ServiceHealth::unhealthy(e.to_string()),
                };
                out.insert(name, h);
            }
        }
        out
    }

    pub async fn is_started(&self, name: &str) -> bool {
        self.started.read().await.contains(name)
    }

    pub async fn services_with_routes(&self) -> Vec<String> {
        let guard = self.services.read().await;
        guard.values().filter(|s| s.provides_routes()).map(|s| s.name().to_string()).collect()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        let guard = self.services.read().await;
        guard.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let guard = self.services.read().await;
        guard.keys().cloned().collect()
    }
}
