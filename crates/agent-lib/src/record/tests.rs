//! Tests for usage record construction

use super::*;
use crate::models::ComputeType;
use crate::record::node::FARGATE_PROFILE_LABEL;
use chrono::TimeZone;
use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

fn quantities(entries: &[(&str, &str)]) -> Option<BTreeMap<String, Quantity>> {
    if entries.is_empty() {
        return None;
    }
    Some(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect(),
    )
}

fn container(name: &str, requests: &[(&str, &str)], limits: &[(&str, &str)]) -> Container {
    Container {
        name: name.to_string(),
        resources: Some(ResourceRequirements {
            requests: quantities(requests),
            limits: quantities(limits),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod(containers: Vec<Container>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some("web-5d8f7c".to_string()),
            namespace: Some("shop".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            ..Default::default()
        }),
        status: Some(PodStatus {
            qos_class: Some("Burstable".to_string()),
            ..Default::default()
        }),
    }
}

fn window() -> (DateTime<Utc>, DateTime<Utc>) {
    let begin = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    (begin, begin + chrono::Duration::minutes(15))
}

fn node(cpu: i64, memory: i64) -> NodeRecord {
    NodeRecord {
        name: "ip-10-0-1-5.ec2.internal".to_string(),
        cluster: "prod".to_string(),
        instance_type: "m5.large".to_string(),
        allocatable: NodeCapacity {
            cpu,
            memory,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn test_single_container_allocation() {
    let p = pod(vec![container(
        "app",
        &[("cpu", "100m"), ("memory", "256Mi")],
        &[],
    )]);
    let (begin, end) = window();

    let record = build_usage_record(&p, begin, end, Some(&node(1000, 1 << 30)));

    assert_eq!(record.name, "web-5d8f7c");
    assert_eq!(record.namespace, "shop");
    assert_eq!(record.qos_class, "Burstable");
    assert_eq!(record.resources.requests.cpu, 100);
    assert_eq!(record.resources.requests.memory, 256 * 1024 * 1024);
    assert_eq!(record.allocations.requests.cpu, 10.0);
    assert_eq!(record.allocations.requests.memory, 25.0);
    assert_eq!(record.allocations.limits.cpu, 0.0);
    assert_eq!(record.node.instance_type, "m5.large");
    assert_eq!(record.end_time, end);
}

#[test]
fn test_requests_and_limits_sum_across_containers() {
    let p = pod(vec![
        container(
            "app",
            &[("cpu", "250m"), ("memory", "128Mi"), ("nvidia.com/gpu", "1")],
            &[("cpu", "500m"), ("memory", "256Mi"), ("nvidia.com/gpu", "1")],
        ),
        container(
            "sidecar",
            &[("cpu", "50m"), ("ephemeral-storage", "1Gi")],
            &[("cpu", "100m"), ("memory", "64Mi")],
        ),
        container("worker", &[("cpu", "0.7")], &[]),
    ]);
    let (begin, end) = window();

    let resources = build_usage_record(&p, begin, end, None).resources;

    assert_eq!(resources.requests.cpu, 250 + 50 + 700);
    assert_eq!(resources.requests.memory, 128 << 20);
    assert_eq!(resources.requests.gpu, 1);
    assert_eq!(resources.requests.storage_ephemeral, 1 << 30);
    assert_eq!(resources.requests.storage, 0);
    assert_eq!(resources.limits.cpu, 600);
    assert_eq!(resources.limits.memory, (256 + 64) << 20);
    assert_eq!(resources.limits.gpu, 1);
}

#[test]
fn test_container_without_resources_counts_as_zero() {
    let mut bare = container("bare", &[], &[]);
    bare.resources = None;
    let p = pod(vec![bare, container("app", &[("cpu", "1")], &[])]);

    assert_eq!(aggregate_resources(&p).requests.cpu, 1000);
    assert_eq!(aggregate_resources(&Pod::default()), Resources::default());
}

#[test]
fn test_hash_labels_are_filtered() {
    let labels = BTreeMap::from([
        ("app".to_string(), "web".to_string()),
        ("pod-template-hash".to_string(), "5d8f7c".to_string()),
        ("controller-revision-hash".to_string(), "abc".to_string()),
        ("hash".to_string(), "kept".to_string()),
        ("hash-ring".to_string(), "kept".to_string()),
    ]);

    let filtered = filter_labels(Some(&labels));

    assert_eq!(filtered.len(), 3);
    assert_eq!(filtered["app"], "web");
    assert_eq!(filtered["hash"], "kept");
    assert_eq!(filtered["hash-ring"], "kept");
    assert!(filtered.keys().all(|k| !k.ends_with("-hash")));
    assert!(filter_labels(None).is_empty());
}

#[test]
fn test_zero_allocatable_yields_zero_allocation() {
    let p = pod(vec![container(
        "app",
        &[("cpu", "2"), ("memory", "1Gi"), ("nvidia.com/gpu", "2")],
        &[("cpu", "4")],
    )]);
    let (begin, end) = window();

    let record = build_usage_record(&p, begin, end, Some(&node(0, 2 << 30)));

    assert_eq!(record.allocations.requests.cpu, 0.0);
    assert_eq!(record.allocations.limits.cpu, 0.0);
    assert_eq!(record.allocations.requests.gpu, 0.0);
    assert_eq!(record.allocations.requests.memory, 50.0);
    assert!(record.allocations.requests.cpu.is_finite());

    let json = serde_json::to_value(&record).unwrap();
    assert!(json["allocations"]["requests"].get("gpu").is_none());
}

#[test]
fn test_missing_node_yields_empty_snapshot() {
    let p = pod(vec![container("app", &[("cpu", "100m")], &[])]);
    let (begin, end) = window();

    let record = build_usage_record(&p, begin, end, None);

    assert_eq!(record.node, NodeRecord::default());
    assert_eq!(record.allocations, Allocations::default());
    assert_eq!(record.resources.requests.cpu, 100);
}

#[test]
fn test_begin_time_is_later_of_window_and_start() {
    let (begin, _) = window();
    let late_start = begin + chrono::Duration::minutes(5);
    let early_start = begin - chrono::Duration::hours(3);

    assert_eq!(effective_begin_time(begin, Some(late_start)), late_start);
    assert_eq!(effective_begin_time(begin, Some(early_start)), begin);
    assert_eq!(effective_begin_time(begin, Some(begin)), begin);
    assert_eq!(effective_begin_time(begin, None), begin);
}

#[test]
fn test_long_running_workload_never_claims_usage_before_window() {
    // Regression: the window begin must win over an older start time
    let (begin, end) = window();
    let mut p = pod(vec![container("app", &[("cpu", "100m")], &[])]);
    let started = begin - chrono::Duration::days(2);
    if let Some(status) = p.status.as_mut() {
        status.start_time = Some(Time(started));
    }

    let record = build_usage_record(&p, begin, end, None);

    assert_eq!(record.begin_time, begin);
    assert_eq!(record.start_time, Some(started));
}

#[test]
fn test_serverless_node_is_patched_before_allocation() {
    let mut p = pod(vec![container(
        "job",
        &[("cpu", "125m"), ("memory", "122M")],
        &[],
    )]);
    p.metadata.annotations = Some(BTreeMap::from([(
        CAPACITY_PROVISIONED_ANNOTATION.to_string(),
        "0.25vCPU 0.5GB".to_string(),
    )]));
    p.metadata.labels = Some(BTreeMap::from([(
        FARGATE_PROFILE_LABEL.to_string(),
        "batch".to_string(),
    )]));
    let serverless = NodeRecord {
        compute_type: ComputeType::Serverless,
        nodegroup: "serverless".to_string(),
        instance_type: "serverless-2vCPU-5GB".to_string(),
        allocatable: NodeCapacity {
            cpu: 2000,
            memory: 4 << 30,
            ..Default::default()
        },
        ..Default::default()
    };
    let (begin, end) = window();

    let record = build_usage_record(&p, begin, end, Some(&serverless));

    assert_eq!(record.node.allocatable.cpu, 250);
    assert_eq!(record.node.allocatable.memory, 244_000_000);
    assert_eq!(record.node.instance_type, "serverless-0.25vCPU-0.5GB");
    assert_eq!(record.node.nodegroup, "batch");
    assert_eq!(record.allocations.requests.cpu, 50.0);
    assert_eq!(record.allocations.requests.memory, 50.0);
    // The cached snapshot itself is untouched
    assert_eq!(serverless.allocatable.cpu, 2000);
}

#[test]
fn test_bad_capacity_annotation_does_not_abort_build() {
    let mut p = pod(vec![container("job", &[("cpu", "500m")], &[])]);
    p.metadata.annotations = Some(BTreeMap::from([(
        CAPACITY_PROVISIONED_ANNOTATION.to_string(),
        "half a core".to_string(),
    )]));
    let serverless = NodeRecord {
        compute_type: ComputeType::Serverless,
        allocatable: NodeCapacity {
            cpu: 1000,
            memory: 2 << 30,
            ..Default::default()
        },
        ..Default::default()
    };
    let (begin, end) = window();

    let record = build_usage_record(&p, begin, end, Some(&serverless));

    assert_eq!(record.node.allocatable.cpu, 1000);
    assert_eq!(record.allocations.requests.cpu, 50.0);
}
