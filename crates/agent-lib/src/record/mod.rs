//! Usage record construction
//!
//! Pure transforms from raw cluster descriptors into the records shipped to
//! the sink. Nothing here touches shared state; callers supply the node
//! snapshot the workload is placed on.

pub mod node;
pub mod serverless;

pub use serverless::{
    parse_capacity_provisioned, patch_serverless_node, CapacityParseError,
    CAPACITY_PROVISIONED_ANNOTATION, PLATFORM_MEMORY_OVERHEAD,
};

use crate::models::{
    Allocation, Allocations, NodeCapacity, NodeRecord, ResourceAmounts, Resources, UsageRecord,
};
use crate::resources::ResourceDimension;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use tracing::warn;

/// Label keys with this suffix are dropped from usage records
pub const HASH_LABEL_SUFFIX: &str = "-hash";

/// Build the usage record of a workload over `[begin, end]`.
///
/// `node` is the snapshot of the node the workload runs on; `None` yields an
/// empty snapshot and zero allocations. Serverless nodes are patched from the
/// workload's provisioned capacity before allocations are computed.
pub fn build_usage_record(
    pod: &Pod,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
    node: Option<&NodeRecord>,
) -> UsageRecord {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();

    let mut node = node.cloned().unwrap_or_default();
    if let Err(e) = patch_serverless_node(pod, &mut node) {
        warn!(
            pod = %name,
            namespace = %namespace,
            node = %node.name,
            error = %e,
            "Skipping serverless capacity patch"
        );
    }

    let status = pod.status.as_ref();
    let start_time = status.and_then(|s| s.start_time.as_ref()).map(|t| t.0);
    let resources = aggregate_resources(pod);
    let allocations = Allocations {
        requests: allocation(&resources.requests, &node.allocatable),
        limits: allocation(&resources.limits, &node.allocatable),
    };

    UsageRecord {
        labels: filter_labels(pod.metadata.labels.as_ref()),
        qos_class: status
            .and_then(|s| s.qos_class.clone())
            .unwrap_or_default(),
        begin_time: effective_begin_time(begin, start_time),
        start_time,
        end_time: end,
        resources,
        allocations,
        node,
        name,
        namespace,
    }
}

/// Copy labels, dropping deployment-churn keys ending in `-hash`
pub fn filter_labels(labels: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    labels
        .into_iter()
        .flatten()
        .filter(|(key, _)| !key.ends_with(HASH_LABEL_SUFFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// The later of the window begin and the workload's start
pub fn effective_begin_time(
    begin: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    match start_time {
        Some(start) if start > begin => start,
        _ => begin,
    }
}

/// Sum requests and limits across all containers, per dimension
pub fn aggregate_resources(pod: &Pod) -> Resources {
    let mut resources = Resources::default();
    let containers = pod.spec.iter().flat_map(|spec| spec.containers.iter());

    for container in containers {
        let Some(requirements) = container.resources.as_ref() else {
            continue;
        };
        for dimension in ResourceDimension::ALL {
            resources
                .requests
                .add(dimension, dimension.amount(requirements.requests.as_ref()));
            resources
                .limits
                .add(dimension, dimension.amount(requirements.limits.as_ref()));
        }
    }

    resources
}

/// Percentage of node allocatable; dimensions with no allocatable stay zero
fn allocation(amounts: &ResourceAmounts, allocatable: &NodeCapacity) -> Allocation {
    let mut allocation = Allocation::default();
    for dimension in ResourceDimension::ALL {
        let available = allocatable.get(dimension);
        if available > 0 {
            allocation.set(
                dimension,
                100.0 * amounts.get(dimension) as f64 / available as f64,
            );
        }
    }
    allocation
}

#[cfg(test)]
mod tests;
