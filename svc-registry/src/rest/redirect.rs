//! Service-proxy redirect resolution: map a `[scheme:]name[:port]`
//! identifier to the URL of one live backend endpoint.

use http::Uri;
use k8s_openapi::api::core::v1::EndpointAddress;
use rand::Rng;

use super::Rest;
use crate::error::{Error, Result};
use crate::storage::RequestContext;

/// Splits an identifier of the form `name`, `name:port` or
/// `scheme:name:port`. The port may be a number or a port name.
pub(crate) fn split_scheme_name_port(id: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = id.split(':').collect();
    let (scheme, name, port) = match parts.as_slice() {
        [name] => ("", *name, ""),
        [name, port] => ("", *name, *port),
        [scheme, name, port] => (*scheme, *name, *port),
        _ => return None,
    };
    if name.is_empty() || (parts.len() > 1 && port.is_empty()) {
        return None;
    }
    Some((scheme.to_string(), name.to_string(), port.to_string()))
}

fn join_host_port(host: &str, port: i32) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

impl Rest {
    /// Resolves a redirect target for the identified service: a URL for
    /// one healthy backend address plus the transport to reach it with.
    ///
    /// Fails with `BadRequest` on a malformed identifier and
    /// `ServiceUnavailable` when no endpoint qualifies.
    pub async fn resource_location(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> Result<(Uri, reqwest::Client)> {
        let Some((scheme, name, mut port_str)) = split_scheme_name_port(id) else {
            return Err(Error::BadRequest(format!("invalid service request {id:?}")));
        };

        // a numeric port refers to the service port; translate it to the
        // declared port name, which is what endpoint subsets carry
        if let Ok(port_number) = port_str.parse::<i32>() {
            let service = self.services.get(ctx, &name).await?;
            let declared = crate::service::ports(&service)
                .iter()
                .find(|p| p.port == port_number)
                .map(|p| p.name.clone().unwrap_or_default());
            match declared {
                Some(port_name) => port_str = port_name,
                None => {
                    return Err(Error::ServiceUnavailable(format!(
                        "no service port {port_number} found for service {name:?}"
                    )));
                }
            }
        }

        let endpoints = self.endpoints.get(ctx, &name).await?;
        let subsets = endpoints.subsets.unwrap_or_default();
        if subsets.is_empty() {
            return Err(Error::ServiceUnavailable(format!(
                "no endpoints available for service {name:?}"
            )));
        }

        // start from a random subset and rotate
        let subset_seed = rand::rng().random_range(0..subsets.len());
        for i in 0..subsets.len() {
            let subset = &subsets[(subset_seed + i) % subsets.len()];
            let addresses = subset.addresses.as_deref().unwrap_or(&[]);
            if addresses.is_empty() {
                continue;
            }
            for subset_port in subset.ports.as_deref().unwrap_or(&[]) {
                if subset_port.name.as_deref().unwrap_or_default() != port_str {
                    continue;
                }
                // Validating an address against its pod costs a store read,
                // so try addresses in random rotation and stop at the first
                // one that holds up; for healthy services one try suffices.
                let address_seed = rand::rng().random_range(0..addresses.len());
                for j in 0..addresses.len() {
                    let address = &addresses[(address_seed + j) % addresses.len()];
                    if let Err(reason) = self.validate_address(ctx, address).await {
                        tracing::warn!(ip = %address.ip, %reason, "skipping endpoint address");
                        continue;
                    }
                    let scheme = if scheme.is_empty() { "http" } else { &scheme };
                    let target = format!(
                        "{scheme}://{}",
                        join_host_port(&address.ip, subset_port.port)
                    );
                    let uri = target
                        .parse::<Uri>()
                        .map_err(|e| Error::internal(format!("building redirect URL: {e}")))?;
                    return Ok((uri, self.proxy_transport.clone()));
                }
                tracing::warn!(service = %name, "no valid address in subset, skipping");
            }
        }
        Err(Error::ServiceUnavailable(format!(
            "no endpoints available for service {id:?}"
        )))
    }

    /// An endpoint address counts only if it still maps to a live pod in
    /// the request's namespace whose reported IPs include the address.
    async fn validate_address(
        &self,
        ctx: &RequestContext,
        address: &EndpointAddress,
    ) -> Result<(), String> {
        let Some(target) = address.target_ref.as_ref() else {
            return Err("address has no target ref".into());
        };
        if ctx.namespace != target.namespace {
            return Err("address namespace does not match context namespace".into());
        }
        let name = target.name.as_deref().unwrap_or_default();
        let pod = self
            .pods
            .get(ctx, name)
            .await
            .map_err(|e| format!("getting pod {name:?}: {e}"))?;
        let pod_ips = pod.status.as_ref().and_then(|s| s.pod_ips.as_deref()).unwrap_or(&[]);
        if pod_ips.iter().any(|pip| pip.ip == address.ip) {
            return Ok(());
        }
        Err(format!("pod IPs do not include endpoint IP {}", address.ip))
    }
}
