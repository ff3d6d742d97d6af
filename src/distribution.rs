//! Worker replica distribution across failure domains
//!
//! Clusters run workers in up to three failure domains. This module decides
//! how many replicas land in each domain, as a pure function of the request,
//! and writes the result back into the configuration store so manifest
//! rendering downstream is deterministic.

use tracing::debug;

use crate::config::{keys, ConfigStore};
use crate::provider::ProviderKind;
use crate::{Error, Result};

/// Cluster plan flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Single-domain development plan
    Dev,
    /// Highly available production plan, spread across three domains
    Prod,
}

impl Plan {
    /// True for production plans
    pub fn is_prod(&self) -> bool {
        matches!(self, Plan::Prod)
    }
}

/// Explicit per-domain worker counts supplied by the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainOverrides {
    /// Per-domain counts; `None` means not configured
    pub counts: [Option<u32>; 3],
}

impl DomainOverrides {
    /// True when every domain has an explicit count
    pub fn is_complete(&self) -> bool {
        self.counts.iter().all(Option::is_some)
    }
}

/// Inputs for one distribution decision
#[derive(Debug, Clone, Copy)]
pub struct DistributionRequest {
    /// Total requested worker count
    pub total: u32,
    /// Plan flavor
    pub plan: Plan,
    /// True when distributing for a management cluster
    pub is_management_cluster: bool,
    /// Infrastructure back-end
    pub provider: ProviderKind,
    /// True for Windows-flavored workload clusters, which run single-domain
    pub is_windows_workload: bool,
    /// Caller-supplied per-domain counts
    pub overrides: DomainOverrides,
}

/// Split `request.total` workers across the three failure domains
///
/// Single-domain providers and Windows workload clusters put everything in
/// domain 0. Complete overrides win verbatim on prod plans; dev plans honor
/// only the domain-0 override. Otherwise prod plans spread evenly with the
/// remainder handed out to domains in index order, and dev plans use domain
/// 0 alone. A prod-plan workload cluster must end up with at least 3
/// workers so every domain is populated.
pub fn distribute_workers(request: &DistributionRequest) -> Result<[u32; 3]> {
    if request.provider.is_single_domain() || request.is_windows_workload {
        return Ok([request.total, 0, 0]);
    }

    let counts = if request.plan.is_prod() && request.overrides.is_complete() {
        [
            request.overrides.counts[0].unwrap_or(0),
            request.overrides.counts[1].unwrap_or(0),
            request.overrides.counts[2].unwrap_or(0),
        ]
    } else if !request.plan.is_prod() {
        match request.overrides.counts[0] {
            // dev plans honor only the domain-0 override
            Some(domain_zero) => [domain_zero, 0, 0],
            None => [request.total, 0, 0],
        }
    } else {
        let base = request.total / 3;
        let remainder = request.total % 3;
        let mut counts = [base; 3];
        for domain in 0..remainder as usize {
            counts[domain] += 1;
        }
        counts
    };

    let sum: u32 = counts.iter().sum();
    if !request.is_management_cluster && request.plan.is_prod() && sum < 3 {
        return Err(Error::validation(
            "prod plan requires at least 3 workers: one per failure domain",
        ));
    }

    debug!(
        total = request.total,
        domain_0 = counts[0],
        domain_1 = counts[1],
        domain_2 = counts[2],
        "distributed workers across failure domains"
    );
    Ok(counts)
}

/// Write the distribution back into the configuration store
///
/// The total written is the caller-requested one, which verbatim overrides
/// may diverge from. Always writes the total and domain 0; domains 1 and 2
/// are written only for prod plans, matching what the manifest templates
/// consume.
pub fn apply_worker_counts(store: &dyn ConfigStore, total: u32, counts: [u32; 3], plan: Plan) {
    store.set(keys::WORKER_MACHINE_COUNT, &total.to_string());
    store.set(keys::WORKER_MACHINE_COUNT_0, &counts[0].to_string());
    if plan.is_prod() {
        store.set(keys::WORKER_MACHINE_COUNT_1, &counts[1].to_string());
        store.set(keys::WORKER_MACHINE_COUNT_2, &counts[2].to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;

    fn request(total: u32, plan: Plan) -> DistributionRequest {
        DistributionRequest {
            total,
            plan,
            is_management_cluster: false,
            provider: ProviderKind::Aws,
            is_windows_workload: false,
            overrides: DomainOverrides::default(),
        }
    }

    // ==========================================================================
    // Story: Prod Plans Spread Evenly, Remainder in Index Order
    // ==========================================================================

    #[test]
    fn when_total_divides_evenly_every_domain_gets_the_same_count() {
        assert_eq!(distribute_workers(&request(6, Plan::Prod)).unwrap(), [2, 2, 2]);
    }

    #[test]
    fn when_total_leaves_a_remainder_it_lands_on_domains_in_index_order() {
        assert_eq!(distribute_workers(&request(5, Plan::Prod)).unwrap(), [2, 2, 1]);
        assert_eq!(distribute_workers(&request(7, Plan::Prod)).unwrap(), [3, 2, 2]);
    }

    #[test]
    fn distribution_always_sums_to_the_requested_total() {
        for total in 3..40u32 {
            let counts = distribute_workers(&request(total, Plan::Prod)).unwrap();
            assert_eq!(counts.iter().sum::<u32>(), total, "total {}", total);
            assert!(counts.iter().all(|&c| c > 0));
        }
    }

    // ==========================================================================
    // Story: Dev Plans and Single-Domain Back-Ends
    // ==========================================================================

    #[test]
    fn when_plan_is_dev_all_workers_go_to_domain_zero() {
        assert_eq!(distribute_workers(&request(5, Plan::Dev)).unwrap(), [5, 0, 0]);
    }

    #[test]
    fn when_provider_is_docker_distribution_is_single_domain_even_for_prod() {
        let mut req = request(5, Plan::Prod);
        req.provider = ProviderKind::Docker;
        assert_eq!(distribute_workers(&req).unwrap(), [5, 0, 0]);
    }

    #[test]
    fn when_workload_is_windows_distribution_is_single_domain() {
        let mut req = request(4, Plan::Prod);
        req.is_windows_workload = true;
        assert_eq!(distribute_workers(&req).unwrap(), [4, 0, 0]);
    }

    // ==========================================================================
    // Story: Explicit Overrides
    // ==========================================================================

    #[test]
    fn when_all_three_overrides_are_set_prod_uses_them_verbatim() {
        let mut req = request(9, Plan::Prod);
        req.overrides = DomainOverrides {
            counts: [Some(4), Some(3), Some(2)],
        };
        assert_eq!(distribute_workers(&req).unwrap(), [4, 3, 2]);
    }

    #[test]
    fn when_plan_is_dev_only_the_domain_zero_override_is_honored() {
        let mut req = request(9, Plan::Dev);
        req.overrides = DomainOverrides {
            counts: [Some(4), Some(3), Some(2)],
        };
        assert_eq!(distribute_workers(&req).unwrap(), [4, 0, 0]);
    }

    #[test]
    fn when_overrides_are_incomplete_prod_falls_back_to_even_spread() {
        let mut req = request(6, Plan::Prod);
        req.overrides = DomainOverrides {
            counts: [Some(4), None, Some(2)],
        };
        assert_eq!(distribute_workers(&req).unwrap(), [2, 2, 2]);
    }

    // ==========================================================================
    // Story: Prod Minimum Invariant
    //
    // A prod-plan workload cluster must populate all three domains; a
    // management cluster is exempt.
    // ==========================================================================

    #[test]
    fn when_prod_workload_requests_fewer_than_three_workers_it_fails() {
        let err = distribute_workers(&request(2, Plan::Prod)).unwrap_err();
        assert!(err.to_string().contains("at least 3 workers"));
    }

    #[test]
    fn when_prod_management_cluster_requests_fewer_than_three_it_succeeds() {
        let mut req = request(2, Plan::Prod);
        req.is_management_cluster = true;
        assert_eq!(distribute_workers(&req).unwrap(), [1, 1, 0]);
    }

    // ==========================================================================
    // Story: Example Scenario and Write-Back
    // ==========================================================================

    #[test]
    fn example_scenario_five_workers_prod_then_dev() {
        assert_eq!(distribute_workers(&request(5, Plan::Prod)).unwrap(), [2, 2, 1]);
        assert_eq!(distribute_workers(&request(5, Plan::Dev)).unwrap(), [5, 0, 0]);
    }

    #[test]
    fn write_back_sets_total_and_per_domain_keys_for_prod() {
        let store = MemoryConfigStore::new();
        apply_worker_counts(&store, 5, [2, 2, 1], Plan::Prod);
        assert_eq!(store.get(keys::WORKER_MACHINE_COUNT).unwrap(), "5");
        assert_eq!(store.get(keys::WORKER_MACHINE_COUNT_0).unwrap(), "2");
        assert_eq!(store.get(keys::WORKER_MACHINE_COUNT_1).unwrap(), "2");
        assert_eq!(store.get(keys::WORKER_MACHINE_COUNT_2).unwrap(), "1");
    }

    #[test]
    fn write_back_skips_upper_domains_for_dev() {
        let store = MemoryConfigStore::new();
        apply_worker_counts(&store, 5, [5, 0, 0], Plan::Dev);
        assert_eq!(store.get(keys::WORKER_MACHINE_COUNT).unwrap(), "5");
        assert_eq!(store.get(keys::WORKER_MACHINE_COUNT_0).unwrap(), "5");
        assert!(store.get(keys::WORKER_MACHINE_COUNT_1).is_err());
    }

    #[test]
    fn write_back_keeps_the_requested_total_when_overrides_diverge() {
        let store = MemoryConfigStore::new();
        apply_worker_counts(&store, 10, [4, 3, 2], Plan::Prod);
        assert_eq!(store.get(keys::WORKER_MACHINE_COUNT).unwrap(), "10");
        assert_eq!(store.get(keys::WORKER_MACHINE_COUNT_0).unwrap(), "4");
    }
}
