//! Endpoint registry: holds the primary and its replicas.

use std::collections::HashMap;

use crate::endpoint::{ConnectAddress, Endpoint, EndpointRole};
use crate::error::RouterError;

/// Parallel-list configuration for the replica set, mirroring the URL /
/// region / weight lists described in the endpoint configuration surface.
#[derive(Clone, Debug, Default)]
pub struct ReplicaConfig {
    /// Replica addresses, in registration order.
    pub addresses: Vec<ConnectAddress>,
    /// Region tag per replica (parallel to `addresses`); `None` if untagged.
    pub regions: Vec<Option<String>>,
    /// Weight per replica (parallel to `addresses`); missing entries default
    /// to 1, and all values must be strictly positive.
    pub weights: Vec<u32>,
}

/// Holds the primary endpoint and the set of replica endpoints with their
/// static attributes.
///
/// Immutable after construction: registering a new replica requires
/// building a new `EndpointRegistry` (a supervised re-initialization), not
/// a mutation of this one.
#[derive(Debug)]
pub struct EndpointRegistry {
    primary: Endpoint,
    replicas: Vec<Endpoint>,
    by_id: HashMap<String, usize>, // index into `replicas`, primary excluded
}

impl EndpointRegistry {
    /// Build a registry from a required primary address and a parallel-list
    /// replica configuration. Weights default to 1 and must be positive;
    /// region/weight lists shorter than `addresses` are padded with
    /// defaults (`None` region, weight 1).
    pub fn new(primary_address: ConnectAddress, replicas: ReplicaConfig) -> Result<Self, RouterError> {
        let primary = Endpoint::primary("primary", primary_address);

        let mut built = Vec::with_capacity(replicas.addresses.len());
        for (idx, address) in replicas.addresses.into_iter().enumerate() {
            let region = replicas.regions.get(idx).cloned().flatten();
            let weight = replicas.weights.get(idx).copied().unwrap_or(1);
            if weight == 0 {
                return Err(RouterError::ConfigInvalid(format!(
                    "replica {idx} weight must be a strictly positive integer"
                )));
            }
            built.push(Endpoint::replica(
                format!("replica-{idx}"),
                address,
                region,
                weight,
                idx as u32,
            ));
        }

        let by_id = built
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.id.clone(), idx))
            .collect();

        Ok(Self {
            primary,
            replicas: built,
            by_id,
        })
    }

    /// The primary endpoint.
    pub fn primary(&self) -> &Endpoint {
        &self.primary
    }

    /// All replica endpoints, in registration/priority order.
    pub fn replicas(&self) -> &[Endpoint] {
        &self.replicas
    }

    /// All endpoints: primary first, then replicas.
    pub fn all(&self) -> impl Iterator<Item = &Endpoint> {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }

    /// Look up any endpoint (primary or replica) by id.
    pub fn by_id(&self, id: &str) -> Option<&Endpoint> {
        if id == self.primary.id {
            return Some(&self.primary);
        }
        self.by_id.get(id).map(|&idx| &self.replicas[idx])
    }

    /// Replicas tagged with the given region.
    pub fn replicas_in_region(&self, region: &str) -> impl Iterator<Item = &Endpoint> {
        self.replicas
            .iter()
            .filter(move |e| e.region.as_deref() == Some(region))
    }

    /// Replicas filtered by role (always `Replica` here; kept for symmetry
    /// with a lookup-by-role contract that also covers the primary).
    pub fn by_role(&self, role: EndpointRole) -> Vec<&Endpoint> {
        match role {
            EndpointRole::Primary => vec![&self.primary],
            EndpointRole::Replica => self.replicas.iter().collect(),
        }
    }
}
