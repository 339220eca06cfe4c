//! In-memory implementation of the storage contracts: a hash-map twin of
//! the real versioned store with monotonic resource versions, conflict
//! detection, and a broadcast-backed watch stream. Tests run against it,
//! and so can anyone embedding the core without an external store.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::HashMap;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use rand::Rng;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{
    CreateOptions, DeleteOptions, EndpointsStorage, PodGetter, RequestContext, ServiceStorage,
    UpdateOptions, WatchEvent, WatchStream,
};
use crate::error::{Error, Result};
use crate::service::name_of;

const WATCH_BUFFER: usize = 64;

fn key(ctx: &RequestContext, name: &str) -> String {
    format!("{}/{}", ctx.namespace.as_deref().unwrap_or("default"), name)
}

fn object_key(svc: &Service) -> String {
    format!(
        "{}/{}",
        svc.metadata.namespace.as_deref().unwrap_or("default"),
        name_of(svc)
    )
}

pub struct MemoryServiceStorage {
    services: Mutex<HashMap<String, Service>>,
    resource_version: AtomicU64,
    watch_tx: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryServiceStorage {
    fn default() -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_BUFFER);
        MemoryServiceStorage {
            services: Mutex::new(HashMap::default()),
            resource_version: AtomicU64::new(1),
            watch_tx,
        }
    }
}

impl MemoryServiceStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_resource_version(&self) -> String {
        self.resource_version.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn notify(&self, event: WatchEvent) {
        // nobody watching is fine
        let _ = self.watch_tx.send(event);
    }
}

#[async_trait]
impl ServiceStorage for MemoryServiceStorage {
    async fn create(
        &self,
        ctx: &RequestContext,
        mut service: Service,
        opts: CreateOptions,
    ) -> Result<Service> {
        if service.metadata.namespace.is_none() {
            service.metadata.namespace = ctx.namespace.clone();
        }
        let key = object_key(&service);
        let mut services = self.services.lock().expect("store mutex poisoned");
        if services.contains_key(&key) {
            return Err(Error::AlreadyExists { kind: "service", name: name_of(&service).into() });
        }
        service.metadata.uid = Some(format!("{:032x}", rand::rng().random::<u128>()));
        service.metadata.resource_version = Some(self.next_resource_version());
        if opts.dry_run {
            return Ok(service);
        }
        services.insert(key, service.clone());
        drop(services);
        self.notify(WatchEvent::Added(service.clone()));
        Ok(service)
    }

    async fn update(
        &self,
        _ctx: &RequestContext,
        mut service: Service,
        opts: UpdateOptions,
    ) -> Result<Service> {
        let key = object_key(&service);
        let mut services = self.services.lock().expect("store mutex poisoned");
        let Some(stored) = services.get(&key) else {
            return Err(Error::NotFound { kind: "service", name: name_of(&service).into() });
        };
        if let Some(rv) = &service.metadata.resource_version
            && stored.metadata.resource_version.as_ref() != Some(rv)
        {
            return Err(Error::Conflict(format!(
                "service {:?} was modified concurrently",
                name_of(&service)
            )));
        }
        service.metadata.uid = stored.metadata.uid.clone();
        service.metadata.resource_version = Some(self.next_resource_version());
        if opts.dry_run {
            return Ok(service);
        }
        services.insert(key, service.clone());
        drop(services);
        self.notify(WatchEvent::Modified(service.clone()));
        Ok(service)
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        name: &str,
        opts: DeleteOptions,
    ) -> Result<Service> {
        let mut services = self.services.lock().expect("store mutex poisoned");
        let key = key(ctx, name);
        if opts.dry_run {
            return services
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::NotFound { kind: "service", name: name.into() });
        }
        let Some(service) = services.remove(&key) else {
            return Err(Error::NotFound { kind: "service", name: name.into() });
        };
        drop(services);
        self.notify(WatchEvent::Deleted(service.clone()));
        Ok(service)
    }

    async fn get(&self, ctx: &RequestContext, name: &str) -> Result<Service> {
        self.services
            .lock()
            .expect("store mutex poisoned")
            .get(&key(ctx, name))
            .cloned()
            .ok_or_else(|| Error::NotFound { kind: "service", name: name.into() })
    }

    async fn list(&self, ctx: &RequestContext) -> Result<Vec<Service>> {
        let services = self.services.lock().expect("store mutex poisoned");
        let mut out: Vec<Service> = services
            .values()
            .filter(|svc| match &ctx.namespace {
                Some(ns) => svc.metadata.namespace.as_deref() == Some(ns.as_str()),
                None => true,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| name_of(a).cmp(name_of(b)));
        Ok(out)
    }

    async fn watch(&self, ctx: &RequestContext) -> Result<WatchStream> {
        let namespace = ctx.namespace.clone();
        let stream = BroadcastStream::new(self.watch_tx.subscribe())
            .filter_map(|event| async move { event.ok() })
            .filter(move |event| {
                let svc = match event {
                    WatchEvent::Added(s) | WatchEvent::Modified(s) | WatchEvent::Deleted(s) => s,
                };
                let keep = match &namespace {
                    Some(ns) => svc.metadata.namespace.as_deref() == Some(ns.as_str()),
                    None => true,
                };
                async move { keep }
            });
        Ok(stream.boxed())
    }

    fn storage_version(&self) -> &'static str {
        "v1"
    }
}

#[derive(Default)]
pub struct MemoryEndpointsStorage {
    endpoints: Mutex<HashMap<String, Endpoints>>,
}

impl MemoryEndpointsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, eps: Endpoints) {
        let key = format!(
            "{}/{}",
            eps.metadata.namespace.as_deref().unwrap_or("default"),
            eps.metadata.name.as_deref().unwrap_or_default()
        );
        self.endpoints.lock().expect("store mutex poisoned").insert(key, eps);
    }
}

#[async_trait]
impl EndpointsStorage for MemoryEndpointsStorage {
    async fn get(&self, ctx: &RequestContext, name: &str) -> Result<Endpoints> {
        self.endpoints
            .lock()
            .expect("store mutex poisoned")
            .get(&key(ctx, name))
            .cloned()
            .ok_or_else(|| Error::NotFound { kind: "endpoints", name: name.into() })
    }

    async fn delete(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        self.endpoints
            .lock()
            .expect("store mutex poisoned")
            .remove(&key(ctx, name))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound { kind: "endpoints", name: name.into() })
    }
}

#[derive(Default)]
pub struct MemoryPodGetter {
    pods: Mutex<HashMap<String, Pod>>,
}

impl MemoryPodGetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pod: Pod) {
        let key = format!(
            "{}/{}",
            pod.metadata.namespace.as_deref().unwrap_or("default"),
            pod.metadata.name.as_deref().unwrap_or_default()
        );
        self.pods.lock().expect("store mutex poisoned").insert(key, pod);
    }
}

#[async_trait]
impl PodGetter for MemoryPodGetter {
    async fn get(&self, ctx: &RequestContext, name: &str) -> Result<Pod> {
        self.pods
            .lock()
            .expect("store mutex poisoned")
            .get(&key(ctx, name))
            .cloned()
            .ok_or_else(|| Error::NotFound { kind: "pod", name: name.into() })
    }
}
