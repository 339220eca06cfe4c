//! Cluster-IP defaulting and allocation: turning a user's partial
//! `(ipFamilies, ipFamilyPolicy, clusterIPs)` triple into a fully
//! specified one, reserving the IPs, and undoing reservations when a
//! request fails after staging them.

use std::collections::HashMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Service;
use tracing::warn;

use super::{AllocatorMap, Rest};
use crate::error::{Error, Result};
use crate::service::{
    CLUSTER_IP_NONE, IpFamily, ServiceType, cluster_ips, ip_families, ip_family_policy,
    is_headless, name_of, selector, spec_mut,
};

const SINGLE_STACK: &str = "SingleStack";
const PREFER_DUAL_STACK: &str = "PreferDualStack";
const REQUIRE_DUAL_STACK: &str = "RequireDualStack";

/// Releases the recorded IPs on drop unless disarmed. Every allocation a
/// request makes is recorded here the moment it succeeds, so any exit
/// before the object persisted hands the IPs back, including cancellation.
pub(crate) struct ReleaseOnFailure {
    allocators: AllocatorMap,
    ips: HashMap<IpFamily, String>,
    armed: bool,
}

impl ReleaseOnFailure {
    pub(crate) fn new(allocators: AllocatorMap) -> Self {
        ReleaseOnFailure { allocators, ips: HashMap::new(), armed: true }
    }

    fn record(&mut self, family: IpFamily, ip: String) {
        self.ips.insert(family, ip);
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseOnFailure {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for (family, ip) in &self.ips {
            release_textual(&self.allocators, *family, ip);
        }
    }
}

/// Inverse guard for updates: IPs that were speculatively released from
/// the old object are re-allocated on drop unless disarmed. A failed
/// re-allocation is logged only; the reservation is then orphaned until an
/// external repair loop reconciles it.
pub(crate) struct ReallocateOnFailure {
    allocators: AllocatorMap,
    ips: HashMap<IpFamily, String>,
    armed: bool,
}

impl ReallocateOnFailure {
    pub(crate) fn new(allocators: AllocatorMap) -> Self {
        ReallocateOnFailure { allocators, ips: HashMap::new(), armed: true }
    }

    fn extend(&mut self, released: HashMap<IpFamily, String>) {
        self.ips.extend(released);
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReallocateOnFailure {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for (family, ip) in &self.ips {
            let Some(allocator) = self.allocators.get(family) else {
                continue;
            };
            let Ok(parsed) = ip.parse::<IpAddr>() else {
                warn!(%ip, "failed to parse released cluster IP for re-allocation");
                continue;
            };
            if let Err(e) = allocator.allocate(parsed) {
                warn!(%e, %ip, "failed to re-allocate cluster IP after failed update");
            }
        }
    }
}

fn release_textual(allocators: &AllocatorMap, family: IpFamily, ip: &str) {
    let Some(allocator) = allocators.get(&family) else {
        return;
    };
    let Ok(parsed) = ip.parse::<IpAddr>() else {
        warn!(ip, "failed to parse cluster IP for release");
        return;
    };
    if let Err(e) = allocator.release(parsed) {
        warn!(%e, ip, "failed to release cluster IP");
    }
}

impl Rest {
    /// Defaults the service's IP families and policy from the cluster
    /// configuration and what the user declared, or rejects incoherent
    /// combinations. Runs for dry runs too, so their responses show the
    /// same defaulting a real request would get.
    pub(crate) fn try_default_validate_cluster_ip_fields(&self, service: &mut Service) -> Result<()> {
        if ServiceType::of(service) == ServiceType::ExternalName {
            return Ok(());
        }
        let name = name_of(service).to_string();

        // more than one IP or family only makes sense under RequireDualStack
        if let Some(policy) = ip_family_policy(service)
            && policy != REQUIRE_DUAL_STACK
            && (cluster_ips(service).len() == 2 || ip_families(service).len() == 2)
        {
            return Err(Error::invalid_field(
                &name,
                "spec.ipFamilyPolicy",
                "must be RequireDualStack when two IP families or two cluster IPs are declared",
            ));
        }

        // derive missing families from the IP literals, in order
        let literals: Vec<String> = cluster_ips(service).to_vec();
        for (i, ip) in literals.iter().enumerate() {
            if ip.is_empty() || ip == CLUSTER_IP_NONE {
                break;
            }
            let Some(family) = IpFamily::of_literal(ip) else {
                break; // not reachable past validation
            };
            if i >= ip_families(service).len() {
                if !self.ip_allocators.contains_key(&family) {
                    return Err(Error::invalid_field(
                        &name,
                        format!("spec.clusterIPs[{i}]"),
                        format!("{family} is not configured on this cluster"),
                    ));
                }
                spec_mut(service)
                    .ip_families
                    .get_or_insert_with(Vec::new)
                    .push(family.as_str().to_string());
            }
        }

        // Selectorless headless services resolve entirely here: they lean
        // dual-stack by default and may declare families the cluster does
        // not serve, since nothing is allocated for them.
        if is_headless(service) && selector(service).is_none() {
            {
                let spec = spec_mut(service);
                if spec.ip_family_policy.is_none() {
                    spec.ip_family_policy = Some(REQUIRE_DUAL_STACK.into());
                }
                if spec.ip_families.as_ref().is_none_or(Vec::is_empty) {
                    spec.ip_families = Some(vec![self.default_family.as_str().into()]);
                }
            }
            let policy = ip_family_policy(service).unwrap_or_default().to_string();
            if ip_families(service).len() < 2
                && (policy == REQUIRE_DUAL_STACK
                    || (policy == PREFER_DUAL_STACK && self.ip_allocators.len() == 2))
            {
                self.append_complement_family(service, &name)?;
            }
            return Ok(());
        }

        if ip_family_policy(service) == Some(REQUIRE_DUAL_STACK) && self.ip_allocators.len() < 2 {
            return Err(Error::invalid_field(
                &name,
                "spec.ipFamilyPolicy",
                "cluster is not configured for dual-stack services",
            ));
        }

        // every declared family must be served by an allocator
        for (i, family) in ip_families(service).iter().enumerate() {
            let configured = IpFamily::parse(family)
                .map(|f| self.ip_allocators.contains_key(&f))
                .unwrap_or(false);
            if !configured {
                return Err(Error::invalid_field(
                    &name,
                    format!("spec.ipFamilies[{i}]"),
                    format!("{family} is not configured on this cluster"),
                ));
            }
        }

        {
            let spec = spec_mut(service);
            if spec.ip_family_policy.is_none() {
                spec.ip_family_policy = Some(SINGLE_STACK.into());
            }
            if spec.ip_families.as_ref().is_none_or(Vec::is_empty) {
                spec.ip_families = Some(vec![self.default_family.as_str().into()]);
            }
        }

        // a dual-stack appetite on a dual-stack cluster gets the second
        // family filled in
        if ip_family_policy(service) != Some(SINGLE_STACK)
            && ip_families(service).len() == 1
            && self.ip_allocators.len() == 2
        {
            self.append_complement_family(service, &name)?;
        }

        Ok(())
    }

    fn append_complement_family(&self, service: &mut Service, name: &str) -> Result<()> {
        let first = ip_families(service)
            .first()
            .and_then(|f| IpFamily::parse(f))
            .ok_or_else(|| {
                Error::invalid_field(name, "spec.ipFamilies[0]", "unsupported IP family")
            })?;
        spec_mut(service)
            .ip_families
            .get_or_insert_with(Vec::new)
            .push(first.complement().as_str().to_string());
        Ok(())
    }

    /// Reserves one IP per (family, requested-literal) pair, recording each
    /// success in the guard so a later failure releases them all.
    fn alloc_cluster_ips(
        &self,
        service_name: &str,
        to_alloc: Vec<(IpFamily, String)>,
        guard: &mut ReleaseOnFailure,
    ) -> Result<HashMap<IpFamily, String>> {
        let mut allocated = HashMap::new();
        for (family, ip) in to_alloc {
            let Some(allocator) = self.ip_allocators.get(&family) else {
                // families were validated against the allocator set already
                return Err(Error::internal(format!("no allocator for IP family {family}")));
            };
            if ip.is_empty() {
                let got = allocator.allocate_next().map_err(|e| {
                    Error::internal(format!("failed to allocate a cluster IP: {e}"))
                })?;
                guard.record(family, got.to_string());
                allocated.insert(family, got.to_string());
            } else {
                let parsed: IpAddr = ip.parse().map_err(|_| {
                    Error::invalid_field(
                        service_name,
                        "spec.clusterIPs",
                        format!("{ip:?} is not a valid IP address"),
                    )
                })?;
                allocator.allocate(parsed).map_err(|e| {
                    Error::invalid_field(
                        service_name,
                        "spec.clusterIPs",
                        format!("failed to allocate IP {ip}: {e}"),
                    )
                })?;
                guard.record(family, ip.clone());
                allocated.insert(family, ip);
            }
        }
        Ok(allocated)
    }

    /// Create-time allocation: one IP per declared family, extending
    /// `clusterIPs` with placeholders first and back-filling the allocated
    /// literals after.
    pub(crate) fn alloc_service_cluster_ips(
        &self,
        service: &mut Service,
        guard: &mut ReleaseOnFailure,
    ) -> Result<()> {
        if ServiceType::of(service) == ServiceType::ExternalName || is_headless(service) {
            return Ok(());
        }
        let name = name_of(service).to_string();
        let families: Vec<IpFamily> = ip_families(service)
            .iter()
            .filter_map(|f| IpFamily::parse(f))
            .collect();
        {
            let spec = spec_mut(service);
            let ips = spec.cluster_ips.get_or_insert_with(Vec::new);
            while ips.len() < families.len() {
                ips.push(String::new());
            }
        }
        let to_alloc: Vec<(IpFamily, String)> = families
            .iter()
            .copied()
            .zip(cluster_ips(service).iter().cloned())
            .collect();
        let allocated = self.alloc_cluster_ips(&name, to_alloc, guard)?;
        back_fill(service, &families, &allocated);
        Ok(())
    }

    /// Update-time allocation delta. New reservations go through `guard`
    /// (released again if the update fails); IPs released from the old
    /// object go into `restore` (re-allocated if the update fails).
    pub(crate) fn handle_cluster_ips_for_updated_service(
        &self,
        old: &Service,
        service: &mut Service,
        guard: &mut ReleaseOnFailure,
        restore: &mut ReallocateOnFailure,
    ) -> Result<()> {
        let old_type = ServiceType::of(old);
        let new_type = ServiceType::of(service);

        // ExternalName has no IPs: entering it releases everything the old
        // object held, leaving it allocates from scratch.
        if old_type == ServiceType::ExternalName && new_type != ServiceType::ExternalName {
            return self.alloc_service_cluster_ips(service, guard);
        }
        if old_type != ServiceType::ExternalName && new_type == ServiceType::ExternalName {
            restore.extend(self.release_service_cluster_ips(old)?);
            return Ok(());
        }

        if is_headless(old) {
            return Ok(());
        }

        let old_families = ip_families(old).len();
        let new_families = ip_families(service).len();

        // single- to dual-stack upgrade: only the secondary family is new
        if old_families == 1 && new_families == 2 {
            let name = name_of(service).to_string();
            let family = ip_families(service)
                .get(1)
                .and_then(|f| IpFamily::parse(f))
                .ok_or_else(|| {
                    Error::invalid_field(&name, "spec.ipFamilies[1]", "unsupported IP family")
                })?;
            {
                let spec = spec_mut(service);
                let ips = spec.cluster_ips.get_or_insert_with(Vec::new);
                if ips.len() < 2 {
                    ips.push(String::new());
                }
            }
            let requested = cluster_ips(service)[1].clone();
            let allocated = self.alloc_cluster_ips(&name, vec![(family, requested)], guard)?;
            if let Some(ip) = allocated.get(&family)
                && let Some(ips) = spec_mut(service).cluster_ips.as_mut()
                && ips[1].is_empty()
            {
                ips[1] = ip.clone();
            }
            return Ok(());
        }

        // dual- to single-stack downgrade: only the secondary is released
        if old_families == 2 && new_families == 1 {
            let Some(family) = ip_families(old).get(1).and_then(|f| IpFamily::parse(f)) else {
                return Ok(());
            };
            let Some(ip) = cluster_ips(old).get(1).cloned() else {
                return Ok(());
            };
            let mut to_release = HashMap::new();
            to_release.insert(family, ip);
            restore.extend(self.release_cluster_ips(&to_release)?);
            return Ok(());
        }

        Ok(())
    }

    /// Releases every IP the service holds, keyed by its family pairing.
    /// Returns what was actually released.
    pub(crate) fn release_service_cluster_ips(
        &self,
        service: &Service,
    ) -> Result<HashMap<IpFamily, String>> {
        if ServiceType::of(service) == ServiceType::ExternalName || is_headless(service) {
            return Ok(HashMap::new());
        }
        let mut to_release = HashMap::new();
        let ips = cluster_ips(service);
        for (i, family) in ip_families(service).iter().enumerate() {
            // create and update keep families and IPs aligned, so a missing
            // entry here means there is nothing to release
            if let Some(f) = IpFamily::parse(family)
                && let Some(ip) = ips.get(i)
            {
                to_release.insert(f, ip.clone());
            }
        }
        self.release_cluster_ips(&to_release)
    }

    fn release_cluster_ips(
        &self,
        to_release: &HashMap<IpFamily, String>,
    ) -> Result<HashMap<IpFamily, String>> {
        let mut released = HashMap::new();
        for (family, ip) in to_release {
            let Some(allocator) = self.ip_allocators.get(family) else {
                // cluster was reconfigured from dual to single stack
                continue;
            };
            let Ok(parsed) = ip.parse::<IpAddr>() else {
                warn!(%ip, "failed to parse cluster IP for release");
                continue;
            };
            allocator
                .release(parsed)
                .map_err(|e| Error::internal(format!("failed to release cluster IP {ip}: {e}")))?;
            released.insert(*family, ip.clone());
        }
        Ok(released)
    }
}

fn back_fill(service: &mut Service, families: &[IpFamily], allocated: &HashMap<IpFamily, String>) {
    let Some(ips) = spec_mut(service).cluster_ips.as_mut() else {
        return;
    };
    for (i, family) in families.iter().enumerate() {
        if let Some(ip) = allocated.get(family)
            && i < ips.len()
            && ips[i].is_empty()
        {
            ips[i] = ip.clone();
        }
    }
}
