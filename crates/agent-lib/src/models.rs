//! Core data models for the usage agent
//!
//! These types are the wire format: each [`UsageRecord`] is serialized as
//! one compact JSON object per sink record.

use crate::resources::ResourceDimension;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn is_zero_percent(value: &f64) -> bool {
    *value == 0.0
}

/// How a node's capacity is provisioned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeType {
    /// A machine with fixed capacity
    #[default]
    Standard,
    /// A virtual node sized per workload
    Serverless,
}

/// Purchase option of the underlying machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapacityType {
    Spot,
    #[default]
    OnDemand,
}

/// Node capacity or allocatable resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    /// CPU millicores
    pub cpu: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub gpu: i64,
    /// Memory bytes
    pub memory: i64,
    /// Maximum number of pods
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pods: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub storage: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub storage_ephemeral: i64,
}

impl NodeCapacity {
    pub fn get(&self, dimension: ResourceDimension) -> i64 {
        match dimension {
            ResourceDimension::Cpu => self.cpu,
            ResourceDimension::Memory => self.memory,
            ResourceDimension::Gpu => self.gpu,
            ResourceDimension::Storage => self.storage,
            ResourceDimension::EphemeralStorage => self.storage_ephemeral,
        }
    }
}

/// Node snapshot embedded in every usage record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Instance ID (last segment of the provider ID)
    pub id: String,
    pub name: String,
    pub cluster: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nodegroup: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub instance_type: String,
    pub compute_type: ComputeType,
    pub capacity_type: CapacityType,
    pub region: String,
    pub zone: String,
    pub arch: String,
    pub os: String,
    pub os_image: String,
    #[serde(rename = "kernel")]
    pub kernel_version: String,
    #[serde(rename = "kubelet")]
    pub kubelet_version: String,
    pub runtime: String,
    pub allocatable: NodeCapacity,
    pub capacity: NodeCapacity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Summed resource amounts across a workload's containers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAmounts {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cpu: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub memory: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub storage: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub storage_ephemeral: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub gpu: i64,
}

impl ResourceAmounts {
    pub fn get(&self, dimension: ResourceDimension) -> i64 {
        match dimension {
            ResourceDimension::Cpu => self.cpu,
            ResourceDimension::Memory => self.memory,
            ResourceDimension::Gpu => self.gpu,
            ResourceDimension::Storage => self.storage,
            ResourceDimension::EphemeralStorage => self.storage_ephemeral,
        }
    }

    pub fn add(&mut self, dimension: ResourceDimension, amount: i64) {
        let slot = match dimension {
            ResourceDimension::Cpu => &mut self.cpu,
            ResourceDimension::Memory => &mut self.memory,
            ResourceDimension::Gpu => &mut self.gpu,
            ResourceDimension::Storage => &mut self.storage,
            ResourceDimension::EphemeralStorage => &mut self.storage_ephemeral,
        };
        *slot = slot.saturating_add(amount);
    }
}

/// Requested and limited resources of a workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub requests: ResourceAmounts,
    pub limits: ResourceAmounts,
}

/// Share of node allocatable resources, in percent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub cpu: f64,
    #[serde(default, skip_serializing_if = "is_zero_percent")]
    pub gpu: f64,
    pub memory: f64,
    #[serde(default, skip_serializing_if = "is_zero_percent")]
    pub storage: f64,
    #[serde(default, skip_serializing_if = "is_zero_percent")]
    pub storage_ephemeral: f64,
}

impl Allocation {
    pub fn get(&self, dimension: ResourceDimension) -> f64 {
        match dimension {
            ResourceDimension::Cpu => self.cpu,
            ResourceDimension::Memory => self.memory,
            ResourceDimension::Gpu => self.gpu,
            ResourceDimension::Storage => self.storage,
            ResourceDimension::EphemeralStorage => self.storage_ephemeral,
        }
    }

    pub fn set(&mut self, dimension: ResourceDimension, percent: f64) {
        match dimension {
            ResourceDimension::Cpu => self.cpu = percent,
            ResourceDimension::Memory => self.memory = percent,
            ResourceDimension::Gpu => self.gpu = percent,
            ResourceDimension::Storage => self.storage = percent,
            ResourceDimension::EphemeralStorage => self.storage_ephemeral = percent,
        }
    }
}

/// Request and limit allocations of a workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Allocations {
    pub requests: Allocation,
    pub limits: Allocation,
}

/// Usage snapshot of one workload over a time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub node: NodeRecord,
    pub qos_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub resources: Resources,
    pub allocations: Allocations,
}
