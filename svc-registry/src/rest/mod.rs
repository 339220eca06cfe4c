//! The Service REST storage core: orchestrates policy gating, cluster-IP
//! and node-port allocation, store writes, and rollback on failure.

mod cluster_ips;
mod node_ports;
mod redirect;

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use svc_registry_alloc::{IpAllocator, PortAllocationOperation, PortAllocator};
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::service::{self, IpFamily, ServiceType, name_of};
use crate::storage::{
    CreateOptions, DeleteOptions, EndpointsStorage, PodGetter, RequestContext, ServiceStorage,
    Status, Table, UpdateOptions, WatchStream, convert_to_table,
};
use crate::strategy::{FeatureGates, Strategy, StatusStrategy};
use crate::validation;

use cluster_ips::{ReallocateOnFailure, ReleaseOnFailure};
use node_ports::{
    external_traffic_policy_update, health_check_node_port_update, init_node_ports,
    release_node_ports, update_node_ports,
};

pub(crate) type AllocatorMap = HashMap<IpFamily, Arc<dyn IpAllocator>>;

/// The allocator singletons the storage runs against. The primary range
/// decides the cluster's default IP family.
pub struct ServiceAllocators {
    pub primary_ips: Arc<dyn IpAllocator>,
    pub secondary_ips: Option<Arc<dyn IpAllocator>>,
    pub node_ports: Arc<dyn PortAllocator>,
}

pub struct Rest {
    strategy: Strategy,
    services: Arc<dyn ServiceStorage>,
    endpoints: Arc<dyn EndpointsStorage>,
    pods: Arc<dyn PodGetter>,
    ip_allocators: AllocatorMap,
    default_family: IpFamily,
    node_ports: Arc<dyn PortAllocator>,
    proxy_transport: reqwest::Client,
}

impl Rest {
    pub fn new(
        services: Arc<dyn ServiceStorage>,
        endpoints: Arc<dyn EndpointsStorage>,
        pods: Arc<dyn PodGetter>,
        allocators: ServiceAllocators,
        proxy_transport: reqwest::Client,
        gates: FeatureGates,
    ) -> Self {
        let default_family = if allocators.primary_ips.cidr().is_ipv6() {
            IpFamily::V6
        } else {
            IpFamily::V4
        };
        let mut ip_allocators: AllocatorMap = HashMap::new();
        ip_allocators.insert(default_family, allocators.primary_ips);
        if let Some(secondary) = allocators.secondary_ips {
            ip_allocators.insert(default_family.complement(), secondary);
        }
        info!(family = %default_family, "default service IP family for this cluster");

        Rest {
            strategy: Strategy::new(gates),
            services,
            endpoints,
            pods,
            ip_allocators,
            default_family,
            node_ports: allocators.node_ports,
            proxy_transport,
        }
    }

    pub fn short_names() -> &'static [&'static str] {
        &["svc"]
    }

    pub fn categories() -> &'static [&'static str] {
        &["all"]
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        mut service: Service,
        opts: CreateOptions,
    ) -> Result<Service> {
        self.strategy.before_create(ctx, &mut service)?;

        // defaulting runs for dry runs too; allocation does not
        self.try_default_validate_cluster_ip_fields(&mut service)?;

        let mut ip_guard = ReleaseOnFailure::new(self.ip_allocators.clone());
        if !opts.dry_run {
            self.alloc_service_cluster_ips(&mut service, &mut ip_guard)?;
        }

        let mut port_op = PortAllocationOperation::start(self.node_ports.clone(), opts.dry_run);
        if ServiceType::of(&service).wants_node_ports() {
            init_node_ports(&mut service, &mut port_op)?;
        }
        if service::needs_health_check(&service) {
            node_ports::allocate_health_check_node_port(&mut service, &mut port_op)?;
        }
        let errs = validation::validate_external_traffic_fields(&service);
        if !errs.is_empty() {
            return Err(Error::invalid(name_of(&service), errs));
        }

        let out = match self.services.create(ctx, service.clone(), opts).await {
            Ok(out) => out,
            Err(e) => return Err(check_generated_name_error(e, &service)),
        };

        for e in port_op.commit() {
            // left for an eventual reconciliation to repair
            error!(%e, "committing service node-port changes");
        }
        ip_guard.disarm();
        Ok(out)
    }

    /// Updates the named service, allocating and releasing resources to
    /// match the spec diff. Returns the stored object and whether it was
    /// created through the create-on-update path.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        name: &str,
        service: Service,
        opts: UpdateOptions,
    ) -> Result<(Service, bool)> {
        let old = match self.services.get(ctx, name).await {
            Ok(old) => old,
            Err(e) if e.is_not_found() && opts.force_allow_create => {
                let created = self
                    .create(ctx, service, CreateOptions { dry_run: opts.dry_run })
                    .await?;
                return Ok((created, true));
            }
            Err(e) => return Err(e),
        };

        let mut service = service;
        if let (Some(ctx_ns), Some(obj_ns)) = (&ctx.namespace, &service.metadata.namespace)
            && ctx_ns != obj_ns
        {
            return Err(Error::Conflict(
                "Service.Namespace does not match the provided context".into(),
            ));
        }
        self.strategy.before_update(&mut service, &old)?;

        // newly allocated IPs are released on failure; speculatively
        // released IPs are re-allocated to the old service on failure
        let mut ip_guard = ReleaseOnFailure::new(self.ip_allocators.clone());
        let mut restore_guard = ReallocateOnFailure::new(self.ip_allocators.clone());
        let mut port_op = PortAllocationOperation::start(self.node_ports.clone(), opts.dry_run);

        self.try_default_validate_cluster_ip_fields(&mut service)?;

        if !opts.dry_run {
            self.handle_cluster_ips_for_updated_service(
                &old,
                &mut service,
                &mut ip_guard,
                &mut restore_guard,
            )?;
        }

        let old_type = ServiceType::of(&old);
        let new_type = ServiceType::of(&service);
        // leaving the node-port types releases the old reservations
        if old_type.wants_node_ports() && !new_type.wants_node_ports() {
            release_node_ports(&old, &mut port_op);
        }
        if new_type.wants_node_ports() {
            update_node_ports(&old, &mut service, &mut port_op)?;
        }
        // the ingress status is only meaningful on a LoadBalancer
        if new_type != ServiceType::LoadBalancer
            && let Some(status) = service.status.as_mut()
        {
            status.load_balancer = None;
        }

        health_check_node_port_update(&old, &mut service, &mut port_op)?;
        external_traffic_policy_update(&old, &mut service);
        let errs = validation::validate_external_traffic_fields(&service);
        if !errs.is_empty() {
            return Err(Error::invalid(name_of(&service), errs));
        }

        let out = self.services.update(ctx, service, opts).await?;

        for e in port_op.commit() {
            error!(%e, "committing service node-port changes");
        }
        ip_guard.disarm();
        restore_guard.disarm();
        Ok((out, false))
    }

    /// Status-only update: the spec is taken from the stored object, so no
    /// allocation can change.
    pub async fn update_status(
        &self,
        ctx: &RequestContext,
        name: &str,
        mut service: Service,
        opts: UpdateOptions,
    ) -> Result<Service> {
        let old = self.services.get(ctx, name).await?;
        StatusStrategy::prepare_for_update(&mut service, &old);
        let errs = StatusStrategy::validate_update(&service, &old);
        if !errs.is_empty() {
            return Err(Error::invalid(name_of(&service), errs));
        }
        self.services.update(ctx, service, opts).await
    }

    /// Deletes the service, its sibling endpoints object, and every
    /// allocation it held. Release failures are logged, not returned; an
    /// external repair loop reconciles the stragglers.
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        name: &str,
        opts: DeleteOptions,
    ) -> Result<Status> {
        let service = self.services.delete(ctx, name, opts).await?;

        if !opts.dry_run {
            if let Err(e) = self.endpoints.delete(ctx, name).await
                && !e.is_not_found()
            {
                return Err(e);
            }
            self.release_allocated_resources(&service);
        }

        Ok(Status::success(service.name_any(), service.metadata.uid.clone()))
    }

    fn release_allocated_resources(&self, service: &Service) {
        if let Err(e) = self.release_service_cluster_ips(service) {
            error!(%e, service = name_of(service), "releasing cluster IPs of deleted service");
        }

        for node_port in service::collect_node_ports(service) {
            let Ok(port) = u16::try_from(node_port) else {
                continue;
            };
            if let Err(e) = self.node_ports.release(port) {
                error!(%e, port, service = name_of(service), "releasing node port of deleted service");
            }
        }

        if service::needs_health_check(service) {
            let port = service::health_check_node_port(service);
            if let Ok(port) = u16::try_from(port)
                && port > 0
                && let Err(e) = self.node_ports.release(port)
            {
                error!(%e, port, service = name_of(service), "releasing health check node port of deleted service");
            }
        }
    }

    /// Returns the stored object untouched.
    pub async fn get(&self, ctx: &RequestContext, name: &str) -> Result<Service> {
        self.services.get(ctx, name).await
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<Service>> {
        self.services.list(ctx).await
    }

    pub async fn watch(&self, ctx: &RequestContext) -> Result<WatchStream> {
        self.services.watch(ctx).await
    }

    pub async fn export(&self, ctx: &RequestContext, name: &str, exact: bool) -> Result<Service> {
        let mut service = self.services.get(ctx, name).await?;
        self.strategy.export(&mut service, exact);
        Ok(service)
    }

    pub fn convert_to_table(&self, services: &[Service]) -> Table {
        convert_to_table(services)
    }

    pub fn storage_version(&self) -> &'static str {
        self.services.storage_version()
    }
}

/// A name collision on a generated name is not the client's fault; tell
/// them to retry instead of surfacing AlreadyExists.
fn check_generated_name_error(err: Error, service: &Service) -> Error {
    let generated = service
        .metadata
        .generate_name
        .as_deref()
        .is_some_and(|g| !g.is_empty());
    if err.is_already_exists() && generated {
        return Error::ServerTimeout(
            "the POST operation against Service could not be completed at this time, please try again".into(),
        );
    }
    err
}

#[cfg(test)]
mod test {
    use std::net::IpAddr;

    use k8s_openapi::api::core::v1::{
        Endpoints, LoadBalancerIngress, LoadBalancerStatus, ServicePort, ServiceSpec,
        ServiceStatus,
    };
    use kube::api::ObjectMeta;
    use svc_registry_alloc::{PortRange, PortRangeAllocator, RangeAllocator};

    use super::*;
    use crate::service::{cluster_ips, ip_families};
    use crate::storage::memory::{MemoryEndpointsStorage, MemoryPodGetter, MemoryServiceStorage};

    struct Fixture {
        rest: Rest,
        endpoints: Arc<MemoryEndpointsStorage>,
        primary: Arc<RangeAllocator>,
        secondary: Option<Arc<RangeAllocator>>,
        node_ports: Arc<PortRangeAllocator>,
    }

    fn fixture(dual: bool) -> Fixture {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let primary = Arc::new(RangeAllocator::new("10.0.0.0/16".parse().unwrap()));
        let secondary =
            dual.then(|| Arc::new(RangeAllocator::new("2001:db8:1::/48".parse().unwrap())));
        let node_ports = Arc::new(PortRangeAllocator::new(PortRange::default()));
        let endpoints = Arc::new(MemoryEndpointsStorage::new());
        let rest = Rest::new(
            Arc::new(MemoryServiceStorage::new()),
            endpoints.clone(),
            Arc::new(MemoryPodGetter::new()),
            ServiceAllocators {
                primary_ips: primary.clone(),
                secondary_ips: secondary.clone().map(|s| s as Arc<dyn IpAllocator>),
                node_ports: node_ports.clone(),
            },
            reqwest::Client::new(),
            FeatureGates::default(),
        );
        Fixture { rest, endpoints, primary, secondary, node_ports }
    }

    fn ctx() -> RequestContext {
        RequestContext::namespaced("default")
    }

    fn svc(name: &str, spec: ServiceSpec) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn cluster_ip_spec() -> ServiceSpec {
        ServiceSpec {
            type_: Some("ClusterIP".into()),
            ports: Some(vec![ServicePort { port: 80, ..Default::default() }]),
            ..Default::default()
        }
    }

    fn parse_ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_create_defaults_single_stack() {
        let fix = fixture(false);
        let mut spec = cluster_ip_spec();
        spec.ip_family_policy = Some("SingleStack".into());
        let out = fix.rest.create(&ctx(), svc("web", spec), CreateOptions::default()).await.unwrap();

        assert_eq!(ip_families(&out), ["IPv4"]);
        assert_eq!(out.spec.as_ref().unwrap().ip_family_policy.as_deref(), Some("SingleStack"));
        let ips = cluster_ips(&out);
        assert_eq!(ips.len(), 1);
        let ip = parse_ip(&ips[0]);
        assert!(fix.primary.cidr().contains(ip));
        assert!(fix.primary.has(ip));
    }

    #[tokio::test]
    async fn test_create_require_dual_stack_on_single_stack_cluster() {
        let fix = fixture(false);
        let mut spec = cluster_ip_spec();
        spec.ip_family_policy = Some("RequireDualStack".into());
        let err = fix.rest.create(&ctx(), svc("web", spec), CreateOptions::default()).await.unwrap_err();
        assert_eq!(err.first_invalid_path(), Some("spec.ipFamilyPolicy"));
        assert_eq!(fix.primary.allocated_count(), 0);
    }

    #[tokio::test]
    async fn test_create_prefer_dual_stack_appends_complement() {
        let fix = fixture(true);
        let mut spec = cluster_ip_spec();
        spec.ip_family_policy = Some("PreferDualStack".into());
        spec.ip_families = Some(vec!["IPv6".into()]);
        let out = fix.rest.create(&ctx(), svc("web", spec), CreateOptions::default()).await.unwrap();

        assert_eq!(ip_families(&out), ["IPv6", "IPv4"]);
        let ips = cluster_ips(&out);
        assert_eq!(ips.len(), 2);
        assert!(parse_ip(&ips[0]).is_ipv6());
        assert!(parse_ip(&ips[1]).is_ipv4());
        assert!(fix.secondary.as_ref().unwrap().has(parse_ip(&ips[0])));
        assert!(fix.primary.has(parse_ip(&ips[1])));
    }

    #[tokio::test]
    async fn test_create_with_specific_ip() {
        let fix = fixture(false);
        let mut spec = cluster_ip_spec();
        spec.cluster_ips = Some(vec!["10.0.0.5".into()]);
        let out = fix.rest.create(&ctx(), svc("web", spec), CreateOptions::default()).await.unwrap();

        assert_eq!(ip_families(&out), ["IPv4"]);
        assert_eq!(cluster_ips(&out), ["10.0.0.5"]);
        assert!(fix.primary.has(parse_ip("10.0.0.5")));

        // the reserved IP is never handed out again
        let other = fix
            .rest
            .create(&ctx(), svc("other", cluster_ip_spec()), CreateOptions::default())
            .await
            .unwrap();
        assert_ne!(cluster_ips(&other), ["10.0.0.5"]);
    }

    #[tokio::test]
    async fn test_create_taken_ip_is_invalid() {
        let fix = fixture(false);
        let mut spec = cluster_ip_spec();
        spec.cluster_ips = Some(vec!["10.0.0.5".into()]);
        fix.rest.create(&ctx(), svc("web", spec.clone()), CreateOptions::default()).await.unwrap();

        let err = fix
            .rest
            .create(&ctx(), svc("other", spec), CreateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.first_invalid_path(), Some("spec.clusterIPs"));
    }

    #[tokio::test]
    async fn test_create_duplicate_node_port_for_different_ports() {
        let fix = fixture(false);
        let spec = ServiceSpec {
            type_: Some("NodePort".into()),
            cluster_ips: Some(vec!["10.0.0.77".into()]),
            ports: Some(vec![
                ServicePort {
                    name: Some("a".into()),
                    port: 80,
                    node_port: Some(30080),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("b".into()),
                    port: 443,
                    node_port: Some(30080),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        let err = fix.rest.create(&ctx(), svc("web", spec), CreateOptions::default()).await.unwrap_err();
        assert_eq!(err.first_invalid_path(), Some("spec.ports[1].nodePort"));

        // a failed create leaves every allocator untouched
        assert_eq!(fix.node_ports.allocated_count(), 0);
        assert!(!fix.primary.has(parse_ip("10.0.0.77")));
        assert_eq!(fix.primary.allocated_count(), 0);
    }

    #[tokio::test]
    async fn test_create_shared_node_port_for_same_port() {
        let fix = fixture(false);
        let spec = ServiceSpec {
            type_: Some("NodePort".into()),
            ports: Some(vec![
                ServicePort {
                    name: Some("dns-tcp".into()),
                    port: 53,
                    node_port: Some(30053),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("dns-udp".into()),
                    port: 53,
                    protocol: Some("UDP".into()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        let out = fix.rest.create(&ctx(), svc("dns", spec), CreateOptions::default()).await.unwrap();
        let ports = out.spec.as_ref().unwrap().ports.as_ref().unwrap();
        assert_eq!(ports[0].node_port, Some(30053));
        assert_eq!(ports[1].node_port, Some(30053));
        assert_eq!(fix.node_ports.allocated_count(), 1);
    }

    #[tokio::test]
    async fn test_update_to_external_name_releases_ip() {
        let fix = fixture(false);
        let created = fix
            .rest
            .create(&ctx(), svc("web", cluster_ip_spec()), CreateOptions::default())
            .await
            .unwrap();
        let ip = parse_ip(&cluster_ips(&created)[0]);
        assert!(fix.primary.has(ip));

        let mut update = created.clone();
        {
            let spec = update.spec.as_mut().unwrap();
            spec.type_ = Some("ExternalName".into());
            spec.cluster_ips = Some(vec!["".into()]);
        }
        let (out, created_flag) = fix
            .rest
            .update(&ctx(), "web", update, UpdateOptions::default())
            .await
            .unwrap();
        assert!(!created_flag);
        let spec = out.spec.as_ref().unwrap();
        assert!(spec.cluster_ips.is_none());
        assert!(spec.ip_families.is_none());
        assert!(spec.ip_family_policy.is_none());

        // the IP is free again for the next service
        assert!(!fix.primary.has(ip));
        let mut reuse = cluster_ip_spec();
        reuse.cluster_ips = Some(vec![ip.to_string()]);
        fix.rest.create(&ctx(), svc("other", reuse), CreateOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_upgrade_to_dual_stack() {
        let fix = fixture(true);
        let mut spec = cluster_ip_spec();
        spec.ip_families = Some(vec!["IPv4".into()]);
        spec.ip_family_policy = Some("SingleStack".into());
        let created = fix.rest.create(&ctx(), svc("web", spec), CreateOptions::default()).await.unwrap();
        let v4 = cluster_ips(&created)[0].clone();

        let mut update = created.clone();
        {
            let spec = update.spec.as_mut().unwrap();
            spec.ip_family_policy = Some("RequireDualStack".into());
            spec.ip_families = Some(vec!["IPv4".into(), "IPv6".into()]);
        }
        let (out, _) = fix
            .rest
            .update(&ctx(), "web", update, UpdateOptions::default())
            .await
            .unwrap();
        let ips = cluster_ips(&out);
        assert_eq!(ips[0], v4);
        assert!(parse_ip(&ips[1]).is_ipv6());
        assert!(fix.secondary.as_ref().unwrap().has(parse_ip(&ips[1])));
        assert!(fix.primary.has(parse_ip(&v4)));
    }

    #[tokio::test]
    async fn test_update_downgrade_releases_secondary() {
        let fix = fixture(true);
        let mut spec = cluster_ip_spec();
        spec.ip_family_policy = Some("RequireDualStack".into());
        let created = fix.rest.create(&ctx(), svc("web", spec), CreateOptions::default()).await.unwrap();
        let ips = cluster_ips(&created).to_vec();
        assert_eq!(ips.len(), 2);
        let secondary_ip = parse_ip(&ips[1]);

        let mut update = created.clone();
        {
            let spec = update.spec.as_mut().unwrap();
            spec.ip_family_policy = Some("SingleStack".into());
            spec.ip_families = Some(vec!["IPv4".into()]);
            spec.cluster_ips = Some(vec![ips[0].clone()]);
        }
        fix.rest.update(&ctx(), "web", update, UpdateOptions::default()).await.unwrap();
        assert!(!fix.secondary.as_ref().unwrap().has(secondary_ip));
        assert!(fix.primary.has(parse_ip(&ips[0])));
    }

    #[tokio::test]
    async fn test_failed_update_restores_released_ips() {
        let fix = fixture(true);
        let mut spec = cluster_ip_spec();
        spec.ip_family_policy = Some("RequireDualStack".into());
        let created = fix.rest.create(&ctx(), svc("web", spec), CreateOptions::default()).await.unwrap();
        let ips = cluster_ips(&created).to_vec();
        let secondary_ip = parse_ip(&ips[1]);

        // occupy the node port the update will ask for
        fix.node_ports.allocate(30080).unwrap();

        let mut update = created.clone();
        {
            let spec = update.spec.as_mut().unwrap();
            spec.type_ = Some("NodePort".into());
            spec.ip_family_policy = Some("SingleStack".into());
            spec.ip_families = Some(vec!["IPv4".into()]);
            spec.cluster_ips = Some(vec![ips[0].clone()]);
            spec.ports = Some(vec![ServicePort {
                port: 80,
                node_port: Some(30080),
                ..Default::default()
            }]);
        }
        let err = fix
            .rest
            .update(&ctx(), "web", update, UpdateOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_invalid());

        // the speculatively released secondary IP came back
        assert!(fix.secondary.as_ref().unwrap().has(secondary_ip));
        let stored = fix.rest.get(&ctx(), "web").await.unwrap();
        assert_eq!(cluster_ips(&stored), ips);
    }

    #[tokio::test]
    async fn test_conflict_rolls_back_upgrade() {
        let fix = fixture(true);
        let mut spec = cluster_ip_spec();
        spec.ip_families = Some(vec!["IPv4".into()]);
        let created = fix.rest.create(&ctx(), svc("web", spec), CreateOptions::default()).await.unwrap();

        // a writer slips in and bumps the resource version
        let (refreshed, _) = fix
            .rest
            .update(&ctx(), "web", created.clone(), UpdateOptions::default())
            .await
            .unwrap();
        assert_ne!(refreshed.metadata.resource_version, created.metadata.resource_version);

        let mut stale = created.clone();
        {
            let spec = stale.spec.as_mut().unwrap();
            spec.ip_family_policy = Some("RequireDualStack".into());
            spec.ip_families = Some(vec!["IPv4".into(), "IPv6".into()]);
        }
        let err = fix
            .rest
            .update(&ctx(), "web", stale, UpdateOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        // the staged v6 allocation was rolled back
        assert_eq!(fix.secondary.as_ref().unwrap().allocated_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_releases_everything() {
        let fix = fixture(false);
        let spec = ServiceSpec {
            type_: Some("LoadBalancer".into()),
            external_traffic_policy: Some("Local".into()),
            ports: Some(vec![ServicePort { port: 80, ..Default::default() }]),
            ..Default::default()
        };
        let created = fix.rest.create(&ctx(), svc("web", spec), CreateOptions::default()).await.unwrap();
        let ip = parse_ip(&cluster_ips(&created)[0]);
        let node_port = created.spec.as_ref().unwrap().ports.as_ref().unwrap()[0]
            .node_port
            .unwrap();
        let hcnp = service::health_check_node_port(&created);
        assert_ne!(hcnp, 0);
        fix.endpoints.insert(Endpoints {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            subsets: None,
        });

        let status = fix.rest.delete(&ctx(), "web", DeleteOptions::default()).await.unwrap();
        assert_eq!(status.status, "Success");
        assert_eq!(status.name, "web");

        assert!(!fix.primary.has(ip));
        assert!(!fix.node_ports.has(u16::try_from(node_port).unwrap()));
        assert!(!fix.node_ports.has(u16::try_from(hcnp).unwrap()));
        assert_eq!(fix.node_ports.allocated_count(), 0);

        // the sibling endpoints object went with it
        use crate::storage::EndpointsStorage as _;
        assert!(fix.endpoints.get(&ctx(), "web").await.unwrap_err().is_not_found());

        // deleting a service with no endpoints object also works
        fix.rest.create(&ctx(), svc("bare", cluster_ip_spec()), CreateOptions::default()).await.unwrap();
        fix.rest.delete(&ctx(), "bare", DeleteOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_headless_services_allocate_nothing() {
        let fix = fixture(false);
        let mut spec = cluster_ip_spec();
        spec.cluster_ips = Some(vec!["None".into()]);
        let out = fix.rest.create(&ctx(), svc("hdls", spec), CreateOptions::default()).await.unwrap();

        // selectorless headless defaults dual even on a single-stack cluster
        assert_eq!(
            out.spec.as_ref().unwrap().ip_family_policy.as_deref(),
            Some("RequireDualStack")
        );
        assert_eq!(ip_families(&out), ["IPv4", "IPv6"]);
        assert_eq!(cluster_ips(&out), ["None"]);
        assert_eq!(fix.primary.allocated_count(), 0);
    }

    #[tokio::test]
    async fn test_headless_with_selector_stays_single_stack() {
        let fix = fixture(false);
        let mut spec = cluster_ip_spec();
        spec.cluster_ips = Some(vec!["None".into()]);
        spec.selector = Some([("app".to_string(), "web".to_string())].into());
        let out = fix.rest.create(&ctx(), svc("hdls", spec), CreateOptions::default()).await.unwrap();

        assert_eq!(
            out.spec.as_ref().unwrap().ip_family_policy.as_deref(),
            Some("SingleStack")
        );
        assert_eq!(ip_families(&out), ["IPv4"]);
        assert_eq!(fix.primary.allocated_count(), 0);
    }

    #[tokio::test]
    async fn test_external_name_allocates_nothing() {
        let fix = fixture(false);
        let spec = ServiceSpec {
            type_: Some("ExternalName".into()),
            external_name: Some("example.com".into()),
            ..Default::default()
        };
        let out = fix.rest.create(&ctx(), svc("alias", spec), CreateOptions::default()).await.unwrap();
        assert!(cluster_ips(&out).is_empty());
        assert!(ip_families(&out).is_empty());
        assert_eq!(fix.primary.allocated_count(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_allocates_nothing() {
        let fix = fixture(false);
        let spec = ServiceSpec {
            type_: Some("NodePort".into()),
            ports: Some(vec![ServicePort { port: 80, node_port: Some(30080), ..Default::default() }]),
            ..Default::default()
        };
        let out = fix
            .rest
            .create(&ctx(), svc("web", spec), CreateOptions { dry_run: true })
            .await
            .unwrap();

        // defaulting is visible in the response
        assert_eq!(ip_families(&out), ["IPv4"]);
        assert_eq!(fix.primary.allocated_count(), 0);
        assert_eq!(fix.node_ports.allocated_count(), 0);
        assert!(fix.rest.get(&ctx(), "web").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_on_update() {
        let fix = fixture(false);
        let (out, created) = fix
            .rest
            .update(
                &ctx(),
                "web",
                svc("web", cluster_ip_spec()),
                UpdateOptions { force_allow_create: true, ..Default::default() },
            )
            .await
            .unwrap();
        assert!(created);
        assert_eq!(cluster_ips(&out).len(), 1);

        let err = fix
            .rest
            .update(&ctx(), "missing", svc("missing", cluster_ip_spec()), UpdateOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_status_never_touches_spec_or_allocations() {
        let fix = fixture(false);
        let spec = ServiceSpec {
            type_: Some("LoadBalancer".into()),
            ports: Some(vec![ServicePort { port: 80, ..Default::default() }]),
            ..Default::default()
        };
        let created = fix.rest.create(&ctx(), svc("web", spec), CreateOptions::default()).await.unwrap();
        let allocated_before = fix.primary.allocated_count();

        let mut status_update = created.clone();
        status_update.spec.as_mut().unwrap().cluster_ips = Some(vec!["10.0.9.9".into()]);
        status_update.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("203.0.113.7".into()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        let out = fix
            .rest
            .update_status(&ctx(), "web", status_update, UpdateOptions::default())
            .await
            .unwrap();

        assert_eq!(out.spec, created.spec);
        assert_eq!(
            out.status.as_ref().unwrap().load_balancer.as_ref().unwrap().ingress.as_ref().unwrap()[0].ip,
            Some("203.0.113.7".to_string())
        );
        assert_eq!(fix.primary.allocated_count(), allocated_before);
    }

    #[tokio::test]
    async fn test_export_round_trip() {
        let fix = fixture(false);
        let created = fix
            .rest
            .create(&ctx(), svc("web", cluster_ip_spec()), CreateOptions::default())
            .await
            .unwrap();

        let exact = fix.rest.export(&ctx(), "web", true).await.unwrap();
        assert_eq!(exact, created);

        let loose = fix.rest.export(&ctx(), "web", false).await.unwrap();
        assert!(loose.spec.as_ref().unwrap().cluster_ips.is_none());
    }

    #[tokio::test]
    async fn test_generated_name_collision_is_server_timeout() {
        let fix = fixture(false);
        let make = || {
            let mut service = svc("ignored", cluster_ip_spec());
            service.metadata.name = None;
            service.metadata.generate_name = Some("web-".into());
            service
        };
        let first = fix.rest.create(&ctx(), make(), CreateOptions::default()).await.unwrap();
        let name = first.metadata.name.clone().unwrap();

        // force the same generated name through a plain create
        let mut clash = svc(&name, cluster_ip_spec());
        clash.metadata.generate_name = Some("web-".into());
        let err = fix.rest.create(&ctx(), clash, CreateOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::ServerTimeout(_)));
    }

    #[tokio::test]
    async fn test_namespace_mismatch() {
        let fix = fixture(false);
        // create: the object namespace must match the request namespace
        let mut service = svc("web", cluster_ip_spec());
        service.metadata.namespace = Some("other".into());
        let err = fix.rest.create(&ctx(), service, CreateOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        // update: surfaced as a conflict
        fix.rest.create(&ctx(), svc("web", cluster_ip_spec()), CreateOptions::default()).await.unwrap();
        let mut update = svc("web", cluster_ip_spec());
        update.metadata.namespace = Some("other".into());
        let err = fix
            .rest
            .update(&ctx(), "web", update, UpdateOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_clears_lb_status_when_leaving_load_balancer() {
        let fix = fixture(false);
        let spec = ServiceSpec {
            type_: Some("LoadBalancer".into()),
            ports: Some(vec![ServicePort { port: 80, ..Default::default() }]),
            ..Default::default()
        };
        let created = fix.rest.create(&ctx(), svc("web", spec), CreateOptions::default()).await.unwrap();
        let mut with_status = created.clone();
        with_status.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("203.0.113.7".into()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        let stored = fix
            .rest
            .update_status(&ctx(), "web", with_status, UpdateOptions::default())
            .await
            .unwrap();

        let node_port = stored.spec.as_ref().unwrap().ports.as_ref().unwrap()[0]
            .node_port
            .unwrap();

        let mut update = stored.clone();
        {
            let spec = update.spec.as_mut().unwrap();
            spec.type_ = Some("ClusterIP".into());
            spec.ports.as_mut().unwrap()[0].node_port = None;
        }
        let (out, _) = fix
            .rest
            .update(&ctx(), "web", update, UpdateOptions::default())
            .await
            .unwrap();
        assert!(out.status.as_ref().unwrap().load_balancer.is_none());
        // leaving the node-port types released the reservation
        assert!(!fix.node_ports.has(u16::try_from(node_port).unwrap()));
    }

    #[tokio::test]
    async fn test_convert_to_table_and_short_names() {
        let fix = fixture(false);
        fix.rest.create(&ctx(), svc("web", cluster_ip_spec()), CreateOptions::default()).await.unwrap();
        let listed = fix.rest.list(&ctx()).await.unwrap();
        let table = fix.rest.convert_to_table(&listed);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0][0], "web");
        assert_eq!(table.rows[0][1], "ClusterIP");

        assert_eq!(Rest::short_names(), ["svc"]);
        assert_eq!(Rest::categories(), ["all"]);
        assert_eq!(fix.rest.storage_version(), "v1");
    }
}
