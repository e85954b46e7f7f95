//! Capacity patch for serverless nodes
//!
//! A serverless node reports a capacity unrelated to the workload running on
//! it. The capacity actually provisioned for the workload is published as a
//! pod annotation (`"0.25vCPU 0.5GB"`); the node snapshot is rewritten from it.

use super::node::{FARGATE_PROFILE_LABEL, SERVERLESS_PREFIX};
use crate::models::{ComputeType, NodeRecord};
use crate::quantity::{parse_quantity, QuantityError};
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

/// Annotation carrying the provisioned capacity of a serverless workload
pub const CAPACITY_PROVISIONED_ANNOTATION: &str = "CapacityProvisioned";

/// Memory reserved by the platform on each serverless node (256 MB)
pub const PLATFORM_MEMORY_OVERHEAD: i64 = 256_000_000;

/// Failure to parse the provisioned-capacity annotation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityParseError {
    #[error("invalid capacity provisioned string: {0:?}")]
    Malformed(String),

    #[error("invalid CPU capacity provisioned: {0}")]
    Cpu(#[source] QuantityError),

    #[error("invalid memory capacity provisioned: {0}")]
    Memory(#[source] QuantityError),
}

/// Parse `"<cpu>vCPU <mem><unit>"` into CPU milli-units and memory bytes
pub fn parse_capacity_provisioned(value: &str) -> Result<(i64, i64), CapacityParseError> {
    let parts: Vec<&str> = value.split(' ').collect();
    let [cpu, memory] = parts.as_slice() else {
        return Err(CapacityParseError::Malformed(value.to_string()));
    };

    let mut cpu = cpu.trim_end_matches("vCPU").to_string();
    // Fractional vCPU is expressed in milli-units before unit parsing
    if let Ok(cores) = cpu.parse::<f64>() {
        if cores < 1.0 {
            cpu = format!("{}m", (cores * 1000.0) as i64);
        }
    }
    let cpu = parse_quantity(&cpu)
        .and_then(|q| q.milli_value())
        .map_err(CapacityParseError::Cpu)?;

    // GB -> G, MB -> M; binary units (Gi, Mi) pass through
    let memory = memory.strip_suffix('B').unwrap_or(memory);
    let memory = parse_quantity(memory)
        .and_then(|q| q.value())
        .map_err(CapacityParseError::Memory)?;

    Ok((cpu, memory))
}

/// Rewrite a serverless node snapshot from the workload's provisioned capacity.
///
/// Standard nodes are left untouched. On a parse error the snapshot is not
/// modified at all, nodegroup included.
pub fn patch_serverless_node(pod: &Pod, node: &mut NodeRecord) -> Result<(), CapacityParseError> {
    if node.compute_type != ComputeType::Serverless {
        return Ok(());
    }

    let provisioned = match pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CAPACITY_PROVISIONED_ANNOTATION))
    {
        Some(value) => Some((value, parse_capacity_provisioned(value)?)),
        None => None,
    };

    if let Some(profile) = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(FARGATE_PROFILE_LABEL))
    {
        node.nodegroup = profile.clone();
    }

    if let Some((value, (cpu, memory))) = provisioned {
        node.allocatable.cpu = cpu;
        node.allocatable.memory = memory.saturating_sub(PLATFORM_MEMORY_OVERHEAD);
        node.instance_type = format!("{}-{}", SERVERLESS_PREFIX, value.replace(' ', "-"));
    }

    Ok(())
}
