//! Policy gate run before every store write: conventions, feature-gate
//! stripping, type-transition field clearing, and validation dispatch.

use k8s_openapi::api::core::v1::{Service, ServiceStatus};
use kube::api::ObjectMeta;
use rand::Rng;

use crate::error::{Error, Result};
use crate::service::{self, ServiceType, is_headless, name_of};
use crate::storage::RequestContext;
use crate::validation;

/// Characters used for generated name suffixes; vowels and ambiguous
/// digits are left out so generated names never spell anything.
const ALPHANUMS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const SUFFIX_LEN: usize = 5;

#[derive(Clone, Copy, Debug)]
pub struct FeatureGates {
    /// Whether services may declare `ipFamilies`/`ipFamilyPolicy`.
    pub dual_stack: bool,
}

impl Default for FeatureGates {
    fn default() -> Self {
        FeatureGates { dual_stack: true }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Strategy {
    pub gates: FeatureGates,
}

impl Strategy {
    pub fn new(gates: FeatureGates) -> Self {
        Strategy { gates }
    }

    /// Generic create pre-hooks: namespace resolution, name generation,
    /// create conventions, validation.
    pub fn before_create(&self, ctx: &RequestContext, service: &mut Service) -> Result<()> {
        match (&ctx.namespace, &service.metadata.namespace) {
            (Some(ctx_ns), Some(ns)) if ns != ctx_ns => {
                return Err(Error::BadRequest(
                    "the namespace of the provided object does not match the namespace sent on the request".into(),
                ));
            }
            (Some(ctx_ns), None) => service.metadata.namespace = Some(ctx_ns.clone()),
            _ => {}
        }
        generate_name(&mut service.metadata);
        self.prepare_for_create(service);
        let errs = self.validate(service);
        if !errs.is_empty() {
            return Err(Error::invalid(name_of(service), errs));
        }
        Ok(())
    }

    /// Generic update pre-hooks: update conventions and validation against
    /// the stored object.
    pub fn before_update(&self, service: &mut Service, old: &Service) -> Result<()> {
        self.prepare_for_update(service, old);
        let errs = self.validate_update(service, old);
        if !errs.is_empty() {
            return Err(Error::invalid(name_of(service), errs));
        }
        Ok(())
    }

    /// Status is never writable through the main resource on create.
    pub fn prepare_for_create(&self, service: &mut Service) {
        service.status = Some(ServiceStatus::default());
        drop_disabled_fields(service, None, self.gates);
    }

    /// Status is carried over from the stored object; a type change to
    /// ExternalName sheds the cluster-IP related fields on the user's
    /// behalf when they cleared the IP literals.
    pub fn prepare_for_update(&self, service: &mut Service, old: &Service) {
        service.status = old.status.clone();
        drop_disabled_fields(service, Some(old), self.gates);
        clear_cluster_ip_related_fields(service, old);
    }

    pub fn validate(&self, service: &Service) -> Vec<crate::FieldError> {
        validation::validate_service(service)
    }

    pub fn validate_update(&self, service: &Service, old: &Service) -> Vec<crate::FieldError> {
        validation::validate_service_update(service, old)
    }

    pub fn allow_create_on_update(&self) -> bool {
        true
    }

    pub fn allow_unconditional_update(&self) -> bool {
        true
    }

    /// Strips instance-specific state for export. Exact exports keep the
    /// allocated identity; non-exact exports shed everything the cluster
    /// assigned.
    pub fn export(&self, service: &mut Service, exact: bool) {
        if exact {
            return;
        }
        service.status = Some(ServiceStatus::default());
        if !is_headless(service)
            && let Some(spec) = service.spec.as_mut()
        {
            spec.cluster_ips = None;
        }
        if ServiceType::of(service) == ServiceType::NodePort
            && let Some(spec) = service.spec.as_mut()
            && let Some(ports) = spec.ports.as_mut()
        {
            for port in ports {
                port.node_port = None;
            }
        }
    }
}

/// Status-only update path: whatever the caller sent, the spec is the
/// stored one. Status updates therefore never touch allocations.
pub struct StatusStrategy;

impl StatusStrategy {
    pub fn prepare_for_update(service: &mut Service, old: &Service) {
        service.spec = old.spec.clone();
    }

    pub fn validate_update(service: &Service, old: &Service) -> Vec<crate::FieldError> {
        validation::validate_status_update(service, old)
    }
}

/// Drops fields whose feature gate is off. Pure; keeps the fields whenever
/// either the old or the new object already uses them, so a gate being
/// turned off cannot silently strip an existing service.
pub fn drop_disabled_fields(service: &mut Service, old: Option<&Service>, gates: FeatureGates) {
    if !gates.dual_stack
        && !dual_stack_fields_in_use(Some(service))
        && !dual_stack_fields_in_use(old)
        && let Some(spec) = service.spec.as_mut()
    {
        spec.ip_families = None;
        spec.ip_family_policy = None;
    }
}

fn dual_stack_fields_in_use(service: Option<&Service>) -> bool {
    let Some(service) = service else {
        return false;
    };
    service.spec.as_ref().is_some_and(|s| s.ip_family_policy.is_some())
        || !service::ip_families(service).is_empty()
}

fn clear_cluster_ip_related_fields(service: &mut Service, old: &Service) {
    if ServiceType::of(service) != ServiceType::ExternalName
        || ServiceType::of(old) == ServiceType::ExternalName
    {
        return;
    }
    // only when the user cleared the IP literals; a remaining literal is
    // left for validation to reject
    let ips = service::cluster_ips(service);
    if ips.is_empty() || (ips.len() == 1 && ips[0].is_empty()) {
        if let Some(spec) = service.spec.as_mut() {
            spec.cluster_ips = None;
            spec.ip_families = None;
            spec.ip_family_policy = None;
        }
    }
}

/// Fills in `metadata.name` from `metadata.generateName` with a random
/// suffix, the way the upstream object store does before persisting.
pub fn generate_name(meta: &mut ObjectMeta) {
    if meta.name.is_some() {
        return;
    }
    let Some(base) = meta.generate_name.as_deref() else {
        return;
    };
    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| ALPHANUMS[rng.random_range(0..ALPHANUMS.len())] as char)
        .collect();
    meta.name = Some(format!("{base}{suffix}"));
}
