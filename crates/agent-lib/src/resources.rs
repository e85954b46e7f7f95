//! Resource dimensions tracked for nodes and workloads

use crate::quantity::{quantity_milli_value, quantity_value};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Extended resource name used for accelerator counts
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// A resource dimension with a fixed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    /// CPU in milli-units
    Cpu,
    /// Memory in bytes
    Memory,
    /// Accelerator count
    Gpu,
    /// Local storage in bytes
    Storage,
    /// Ephemeral storage in bytes
    EphemeralStorage,
}

impl ResourceDimension {
    pub const ALL: [ResourceDimension; 5] = [
        ResourceDimension::Cpu,
        ResourceDimension::Memory,
        ResourceDimension::Gpu,
        ResourceDimension::Storage,
        ResourceDimension::EphemeralStorage,
    ];

    /// Key of this dimension in an API resource list
    pub fn resource_name(self) -> &'static str {
        match self {
            ResourceDimension::Cpu => "cpu",
            ResourceDimension::Memory => "memory",
            ResourceDimension::Gpu => GPU_RESOURCE,
            ResourceDimension::Storage => "storage",
            ResourceDimension::EphemeralStorage => "ephemeral-storage",
        }
    }

    /// Read this dimension from a resource list. Absent or unparsable entries count as zero.
    pub fn amount(self, list: Option<&BTreeMap<String, Quantity>>) -> i64 {
        match self {
            ResourceDimension::Cpu => lookup(list, self.resource_name(), true),
            _ => lookup(list, self.resource_name(), false),
        }
    }
}

impl fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_name())
    }
}

/// Integer amount of a named resource outside the fixed dimensions (e.g. `pods`)
pub fn named_amount(list: Option<&BTreeMap<String, Quantity>>, name: &str) -> i64 {
    lookup(list, name, false)
}

fn lookup(list: Option<&BTreeMap<String, Quantity>>, name: &str, milli: bool) -> i64 {
    let Some(quantity) = list.and_then(|l| l.get(name)) else {
        return 0;
    };

    let parsed = if milli {
        quantity_milli_value(quantity)
    } else {
        quantity_value(quantity)
    };

    parsed.unwrap_or_else(|e| {
        debug!(resource = %name, error = %e, "Ignoring unparsable resource quantity");
        0
    })
}
