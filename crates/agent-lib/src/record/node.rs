//! Node descriptor conversion

use crate::models::{CapacityType, ComputeType, NodeCapacity, NodeRecord};
use crate::resources::{named_amount, ResourceDimension};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

pub const COMPUTE_TYPE_LABEL: &str = "eks.amazonaws.com/compute-type";
pub const CAPACITY_TYPE_LABEL: &str = "eks.amazonaws.com/capacityType";
pub const NODEGROUP_LABEL: &str = "eks.amazonaws.com/nodegroup";
pub const FARGATE_PROFILE_LABEL: &str = "eks.amazonaws.com/fargate-profile";
pub const REGION_LABEL: &str = "topology.kubernetes.io/region";
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const INSTANCE_TYPE_LABEL_BETA: &str = "beta.kubernetes.io/instance-type";
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";

/// Label value marking a serverless (Fargate) node
const SERVERLESS_COMPUTE_LABEL_VALUE: &str = "fargate";

/// Prefix of synthesized instance types and default nodegroup of serverless nodes
pub const SERVERLESS_PREFIX: &str = "serverless";

impl NodeRecord {
    /// Build a node record from a node descriptor
    pub fn from_node(cluster: &str, node: &Node) -> Self {
        let empty = BTreeMap::new();
        let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
        let label = |key: &str| labels.get(key).filter(|v| !v.is_empty()).cloned();

        let compute_type = match label(COMPUTE_TYPE_LABEL).as_deref() {
            Some(SERVERLESS_COMPUTE_LABEL_VALUE) => ComputeType::Serverless,
            _ => ComputeType::Standard,
        };
        let capacity_type = match label(CAPACITY_TYPE_LABEL).as_deref() {
            Some("SPOT") => CapacityType::Spot,
            _ => CapacityType::OnDemand,
        };

        // aws:///us-west-2a/i-0f9f9f9f9f9f9f9f9 -> i-0f9f9f9f9f9f9f9f9
        let id = node
            .spec
            .as_ref()
            .and_then(|spec| spec.provider_id.as_deref())
            .map(|provider_id| {
                provider_id
                    .rsplit_once('/')
                    .map(|(_, tail)| tail)
                    .unwrap_or(provider_id)
                    .to_string()
            })
            .unwrap_or_default();

        let nodegroup = label(NODEGROUP_LABEL)
            .or_else(|| label(FARGATE_PROFILE_LABEL))
            .unwrap_or_else(|| SERVERLESS_PREFIX.to_string());

        let status = node.status.as_ref();
        let capacity = to_capacity(status.and_then(|s| s.capacity.as_ref()));
        let allocatable = to_capacity(status.and_then(|s| s.allocatable.as_ref()));

        let instance_type = label(INSTANCE_TYPE_LABEL_BETA)
            .or_else(|| label(INSTANCE_TYPE_LABEL))
            .unwrap_or_else(|| synthetic_instance_type(&capacity));

        let info = status
            .and_then(|s| s.node_info.clone())
            .unwrap_or_default();

        NodeRecord {
            id,
            name: node.metadata.name.clone().unwrap_or_default(),
            cluster: cluster.to_string(),
            nodegroup,
            instance_type,
            compute_type,
            capacity_type,
            region: label(REGION_LABEL).unwrap_or_default(),
            zone: label(ZONE_LABEL).unwrap_or_default(),
            arch: info.architecture,
            os: info.operating_system,
            os_image: info.os_image,
            kernel_version: info.kernel_version,
            kubelet_version: info.kubelet_version,
            runtime: info.container_runtime_version,
            allocatable,
            capacity,
            created: node.metadata.creation_timestamp.as_ref().map(|t| t.0),
        }
    }
}

fn to_capacity(list: Option<&BTreeMap<String, Quantity>>) -> NodeCapacity {
    NodeCapacity {
        cpu: ResourceDimension::Cpu.amount(list),
        gpu: ResourceDimension::Gpu.amount(list),
        memory: ResourceDimension::Memory.amount(list),
        pods: named_amount(list, "pods"),
        storage: ResourceDimension::Storage.amount(list),
        storage_ephemeral: ResourceDimension::EphemeralStorage.amount(list),
    }
}

/// `serverless-<cores>vCPU-<GB>GB`, both rounded up
fn synthetic_instance_type(capacity: &NodeCapacity) -> String {
    let cores = ceil_div(capacity.cpu, 1000);
    let gigabytes = ceil_div(capacity.memory, 1_000_000_000);
    format!("{}-{}vCPU-{}GB", SERVERLESS_PREFIX, cores, gigabytes)
}

fn ceil_div(value: i64, divisor: i64) -> i64 {
    let quotient = value.div_euclid(divisor);
    if value.rem_euclid(divisor) == 0 {
        quotient
    } else {
        quotient + 1
    }
}
