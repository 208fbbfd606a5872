//! Deficit calculation for admission-failure events.
//!
//! A single FailedCreate event names one resource and one pod's worth of
//! request. When the involved object is a workload controller with a
//! replica gap, the true missing capacity is the pod template projected
//! across every resource it needs, multiplied by the gap. The projection
//! replaces the event-stated single resource whenever it is non-empty.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{
    Container, Event, ObjectReference, PersistentVolumeClaim, PodSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::Api;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use tracing::{debug, warn};

use crate::quantity::Amount;

pub const REQUESTS_PREFIX: &str = "requests.";
pub const LIMITS_PREFIX: &str = "limits.";

/// Per-resource deficit in milli-units.
pub type DeficitMap = BTreeMap<String, i64>;

/// Parse `exceeded quota: <q>, requested: <res>=<qty>, ...` into the
/// resource name and requested quantity.
pub fn parse_event_message(message: &str) -> Option<(String, Amount)> {
    for part in message.split(',') {
        let part = part.trim();
        let Some(req) = part.strip_prefix("requested: ") else {
            continue;
        };
        let kv: Vec<&str> = req.split('=').collect();
        if kv.len() != 2 {
            continue;
        }
        if let Ok(qty) = Amount::parse(kv[1]) {
            return Some((kv[0].to_string(), qty));
        }
    }
    None
}

/// Collapse per-pod identity to per-workload identity by stripping the
/// trailing `-<suffix>`: `web-0` -> `web`, `app-a-6b4-xfg2z` -> `app-a-6b4`.
/// Retries of one workload then aggregate by max; distinct workloads sum.
pub fn workload_key(name: &str) -> &str {
    match name.rfind('-') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// Effective per-pod requests projected onto quota resource names:
/// container requests sum onto `requests.*`, limits onto `limits.*`,
/// and init containers max-merge into both (the platform's effective
/// request is max(max(init), sum(containers))).
pub fn pod_requests(spec: &PodSpec) -> DeficitMap {
    let mut reqs = DeficitMap::new();

    let mut add = |prefix: &str, list: Option<&BTreeMap<String, Quantity>>| {
        let Some(list) = list else { return };
        for (name, qty) in list {
            if let Ok(amount) = Amount::parse(&qty.0) {
                *reqs.entry(format!("{prefix}{name}")).or_insert(0) +=
                    amount.milli();
            }
        }
    };
    for c in &spec.containers {
        let res = c.resources.as_ref();
        add(REQUESTS_PREFIX, res.and_then(|r| r.requests.as_ref()));
        add(LIMITS_PREFIX, res.and_then(|r| r.limits.as_ref()));
    }

    let mut max_merge = |prefix: &str, list: Option<&BTreeMap<String, Quantity>>| {
        let Some(list) = list else { return };
        for (name, qty) in list {
            if let Ok(amount) = Amount::parse(&qty.0) {
                let entry =
                    reqs.entry(format!("{prefix}{name}")).or_insert(0);
                *entry = (*entry).max(amount.milli());
            }
        }
    };
    for c in init_containers(spec) {
        let res = c.resources.as_ref();
        max_merge(REQUESTS_PREFIX, res.and_then(|r| r.requests.as_ref()));
        max_merge(LIMITS_PREFIX, res.and_then(|r| r.limits.as_ref()));
    }

    reqs
}

fn init_containers(spec: &PodSpec) -> &[Container] {
    spec.init_containers.as_deref().unwrap_or(&[])
}

/// Storage requested by volume-claim templates, projected onto
/// `requests.*` (one claim set per pod).
pub fn claim_requests(templates: &[PersistentVolumeClaim]) -> DeficitMap {
    let mut reqs = DeficitMap::new();
    for pvc in templates {
        let Some(requests) = pvc
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
        else {
            continue;
        };
        for (name, qty) in requests {
            if let Ok(amount) = Amount::parse(&qty.0) {
                *reqs
                    .entry(format!("{REQUESTS_PREFIX}{name}"))
                    .or_insert(0) += amount.milli();
            }
        }
    }
    reqs
}

/// Multiply per-pod needs by the replica gap.
pub fn project(per_pod: &DeficitMap, missing: i64) -> DeficitMap {
    per_pod.iter().map(|(k, v)| (k.clone(), v * missing)).collect()
}

/// Does the event's involved object still exist? Deleted workloads leave
/// ghost events behind (rollbacks, restarts) which must not count.
pub async fn is_object_alive(
    client: &kube::Client,
    reference: &ObjectReference,
    namespace: &str,
) -> bool {
    let (Some(api_version), Some(kind), Some(name)) = (
        reference.api_version.as_deref(),
        reference.kind.as_deref(),
        reference.name.as_deref(),
    ) else {
        return false;
    };

    let (group, version) = split_api_version(api_version);
    let gvk = GroupVersionKind::gvk(group, version, kind);
    let ar = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), namespace, &ar);
    matches!(api.get_opt(name).await, Ok(Some(_)))
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Derive `(workload_key, deficit map)` for one admission failure,
/// consulting the owning workload's spec when its kind is recognized.
pub async fn calculate_workload_deficit(
    client: &kube::Client,
    event: &Event,
    failed_res: &str,
    failed_qty: Amount,
) -> (String, DeficitMap) {
    let involved = &event.involved_object;
    let name = involved.name.as_deref().unwrap_or_default();
    let namespace = involved
        .namespace
        .as_deref()
        .or(event.metadata.namespace.as_deref())
        .unwrap_or_default();
    let kind = involved.kind.as_deref().unwrap_or_default();
    let key = workload_key(name).to_string();

    // Event-stated single resource; replaced by a non-empty projection.
    let mut deficits = DeficitMap::new();
    deficits.insert(failed_res.to_string(), failed_qty.milli());

    debug!(kind, name, failed_res, "calculating deficit");

    let projected = match kind {
        "StatefulSet" => {
            statefulset_shortfall(client, namespace, name).await
        }
        "DaemonSet" => daemonset_shortfall(client, namespace, name).await,
        "ReplicaSet" => replicaset_shortfall(client, namespace, name).await,
        _ => None,
    };

    if let Some(projected) = projected {
        if !projected.is_empty() {
            deficits = projected;
        }
    }

    (key, deficits)
}

async fn statefulset_shortfall(
    client: &kube::Client,
    namespace: &str,
    name: &str,
) -> Option<DeficitMap> {
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let sts = match api.get_opt(name).await {
        Ok(found) => found?,
        Err(e) => {
            warn!(name, error = %e, "failed to get StatefulSet");
            return None;
        }
    };
    let spec = sts.spec.as_ref()?;
    let desired = i64::from(spec.replicas?);
    let current = i64::from(sts.status.as_ref().map(|s| s.replicas).unwrap_or(0));
    if desired <= current {
        return None;
    }

    let mut per_pod = spec
        .template
        .spec
        .as_ref()
        .map(pod_requests)
        .unwrap_or_default();
    if let Some(templates) = spec.volume_claim_templates.as_deref() {
        for (res, milli) in claim_requests(templates) {
            *per_pod.entry(res).or_insert(0) += milli;
        }
    }
    Some(project(&per_pod, desired - current))
}

async fn daemonset_shortfall(
    client: &kube::Client,
    namespace: &str,
    name: &str,
) -> Option<DeficitMap> {
    let api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    let ds = match api.get_opt(name).await {
        Ok(found) => found?,
        Err(e) => {
            warn!(name, error = %e, "failed to get DaemonSet");
            return None;
        }
    };
    let status = ds.status.as_ref()?;
    let desired = i64::from(status.desired_number_scheduled);
    let current = i64::from(status.current_number_scheduled);
    if desired <= current {
        return None;
    }

    let per_pod = ds
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(pod_requests)
        .unwrap_or_default();
    Some(project(&per_pod, desired - current))
}

async fn replicaset_shortfall(
    client: &kube::Client,
    namespace: &str,
    name: &str,
) -> Option<DeficitMap> {
    let api: Api<ReplicaSet> = Api::namespaced(client.clone(), namespace);
    let rs = match api.get_opt(name).await {
        Ok(found) => found?,
        Err(e) => {
            warn!(name, error = %e, "failed to get ReplicaSet");
            return None;
        }
    };
    let spec = rs.spec.as_ref()?;
    let desired = i64::from(spec.replicas?);
    let current = i64::from(rs.status.as_ref().map(|s| s.replicas).unwrap_or(0));
    if desired <= current {
        return None;
    }

    let per_pod = spec
        .template
        .as_ref()
        .and_then(|t| t.spec.as_ref())
        .map(pod_requests)
        .unwrap_or_default();
    Some(project(&per_pod, desired - current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn resource_list(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    fn container(requests: &[(&str, &str)], limits: &[(&str, &str)]) -> Container {
        Container {
            name: "main".into(),
            resources: Some(ResourceRequirements {
                requests: (!requests.is_empty())
                    .then(|| resource_list(requests)),
                limits: (!limits.is_empty()).then(|| resource_list(limits)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn parses_requested_segment() {
        let msg = "create Pod burst-sts-0 in StatefulSet burst-sts failed \
                   error: pods \"burst-sts-0\" is forbidden: exceeded quota: \
                   sts-burst-quota, requested: requests.cpu=200m, used: \
                   requests.cpu=0, limited: requests.cpu=100m";
        let (res, qty) = parse_event_message(msg).unwrap();
        assert_eq!(res, "requests.cpu");
        assert_eq!(qty.milli(), 200);
    }

    #[test]
    fn parses_whole_unit_request() {
        let msg = "exceeded quota: test-quota, requested: cpu=1, used: cpu=10, limited: cpu=10";
        let (res, qty) = parse_event_message(msg).unwrap();
        assert_eq!(res, "cpu");
        assert_eq!(qty.milli(), 1000);
    }

    #[test]
    fn unparseable_message_is_none() {
        assert!(parse_event_message("pod rejected for other reasons").is_none());
        assert!(parse_event_message("requested: cpu").is_none());
    }

    #[test]
    fn workload_key_strips_trailing_segment() {
        assert_eq!(workload_key("web-0"), "web");
        assert_eq!(workload_key("app-a-6b474476c4-xfg2z"), "app-a-6b474476c4");
        assert_eq!(workload_key("standalone"), "standalone");
    }

    #[test]
    fn pod_requests_project_requests_and_limits() {
        let spec = PodSpec {
            containers: vec![container(
                &[("cpu", "100m"), ("memory", "100Mi")],
                &[("cpu", "200m"), ("memory", "200Mi")],
            )],
            ..Default::default()
        };
        let reqs = pod_requests(&spec);
        assert_eq!(reqs["requests.cpu"], 100);
        assert_eq!(reqs["requests.memory"], 100 * 1024 * 1024 * 1000);
        assert_eq!(reqs["limits.cpu"], 200);
        assert_eq!(reqs["limits.memory"], 200 * 1024 * 1024 * 1000);
    }

    #[test]
    fn pod_requests_sum_across_containers() {
        let spec = PodSpec {
            containers: vec![
                container(&[("cpu", "100m")], &[]),
                container(&[("cpu", "150m")], &[]),
            ],
            ..Default::default()
        };
        assert_eq!(pod_requests(&spec)["requests.cpu"], 250);
    }

    #[test]
    fn init_containers_max_merge() {
        let spec = PodSpec {
            containers: vec![container(&[("cpu", "100m")], &[])],
            init_containers: Some(vec![
                container(&[("cpu", "400m")], &[]),
                container(&[("memory", "50Mi")], &[]),
            ]),
            ..Default::default()
        };
        let reqs = pod_requests(&spec);
        // init cpu dominates the container sum; init memory stands alone
        assert_eq!(reqs["requests.cpu"], 400);
        assert_eq!(reqs["requests.memory"], 50 * 1024 * 1024 * 1000);
    }

    #[test]
    fn claim_requests_project_storage() {
        let pvc = PersistentVolumeClaim {
            spec: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimSpec {
                resources: Some(
                    k8s_openapi::api::core::v1::VolumeResourceRequirements {
                        requests: Some(resource_list(&[("storage", "1Gi")])),
                        ..Default::default()
                    },
                ),
                ..Default::default()
            }),
            ..Default::default()
        };
        let reqs = claim_requests(&[pvc]);
        assert_eq!(reqs["requests.storage"], 1024 * 1024 * 1024 * 1000);
    }

    #[test]
    fn projection_multiplies_by_replica_gap() {
        let per_pod = DeficitMap::from([
            ("requests.cpu".to_string(), 200),
            ("requests.memory".to_string(), 100 * 1024 * 1024 * 1000),
        ]);
        let projected = project(&per_pod, 3);
        assert_eq!(projected["requests.cpu"], 600);
        assert_eq!(
            projected["requests.memory"],
            300 * 1024 * 1024 * 1000
        );
    }
}
