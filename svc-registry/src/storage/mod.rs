//! Contracts for the external collaborators: the versioned object store
//! for Services, the sibling Endpoints store, and a Pod reader. The REST
//! core treats their errors by kind and never assumes more than what is
//! promised here.

pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use serde::Serialize;

use crate::error::Result;
use crate::service::{self, ServiceType};

/// Ambient per-request context, carried through every call.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub namespace: Option<String>,
}

impl RequestContext {
    pub fn namespaced(namespace: impl Into<String>) -> Self {
        RequestContext { namespace: Some(namespace.into()) }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CreateOptions {
    pub dry_run: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateOptions {
    pub dry_run: bool,
    /// Create the object if it does not exist (create-on-update).
    pub force_allow_create: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteOptions {
    pub dry_run: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    Added(Service),
    Modified(Service),
    Deleted(Service),
}

pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Synthesized result of a successful delete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Status {
    pub status: String,
    pub name: String,
    pub uid: Option<String>,
    pub kind: String,
}

impl Status {
    pub fn success(name: impl Into<String>, uid: Option<String>) -> Self {
        Status {
            status: "Success".into(),
            name: name.into(),
            uid,
            kind: "services".into(),
        }
    }
}

/// Tabular rendering of a list of services.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Generic versioned CRUD over Service objects. Updates are expected to
/// enforce optimistic concurrency: a stale `resourceVersion` surfaces as a
/// `Conflict`.
#[async_trait]
pub trait ServiceStorage: Send + Sync {
    async fn create(&self, ctx: &RequestContext, service: Service, opts: CreateOptions)
    -> Result<Service>;

    async fn update(&self, ctx: &RequestContext, service: Service, opts: UpdateOptions)
    -> Result<Service>;

    /// Removes and returns the stored object.
    async fn delete(&self, ctx: &RequestContext, name: &str, opts: DeleteOptions)
    -> Result<Service>;

    async fn get(&self, ctx: &RequestContext, name: &str) -> Result<Service>;

    async fn list(&self, ctx: &RequestContext) -> Result<Vec<Service>>;

    async fn watch(&self, ctx: &RequestContext) -> Result<WatchStream>;

    fn storage_version(&self) -> &'static str;
}

#[async_trait]
pub trait EndpointsStorage: Send + Sync {
    async fn get(&self, ctx: &RequestContext, name: &str) -> Result<Endpoints>;
    async fn delete(&self, ctx: &RequestContext, name: &str) -> Result<()>;
}

#[async_trait]
pub trait PodGetter: Send + Sync {
    async fn get(&self, ctx: &RequestContext, name: &str) -> Result<Pod>;
}

/// Renders services into the table shape list endpoints serve.
pub fn convert_to_table(services: &[Service]) -> Table {
    let columns = ["Name", "Type", "Cluster-IPs", "Ports"]
        .map(String::from)
        .to_vec();
    let rows = services
        .iter()
        .map(|svc| {
            vec![
                service::name_of(svc).to_string(),
                ServiceType::of(svc).as_str().to_string(),
                service::cluster_ips(svc).join(","),
                service::ports(svc)
                    .iter()
                    .map(|p| {
                        format!("{}/{}", p.port, p.protocol.as_deref().unwrap_or("TCP"))
                    })
                    .collect::<Vec<_>>()
                    .join(","),
            ]
        })
        .collect();
    Table { columns, rows }
}
