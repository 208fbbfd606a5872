//! Recommendation engine: usage-ratio analysis and event-deficit
//! analysis, combined per resource by max.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Event, ResourceQuota};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::api::{Api, ListParams};
use tracing::{debug, info, warn};

use super::deficit::{
    DeficitMap, REQUESTS_PREFIX, calculate_workload_deficit, is_object_alive,
    parse_event_message,
};
use crate::config::NamespacePolicy;
use crate::quantity::{Amount, to_readable};

pub type Recommendations = BTreeMap<String, Amount>;

/// Parse a quota resource list, dropping entries that do not parse.
pub fn parse_resource_list(
    list: Option<&BTreeMap<String, Quantity>>,
) -> BTreeMap<String, Amount> {
    let mut out = BTreeMap::new();
    let Some(list) = list else {
        return out;
    };
    for (res, qty) in list {
        match Amount::parse(&qty.0) {
            Ok(amount) => {
                out.insert(res.clone(), amount);
            }
            Err(e) => warn!(%res, value = %qty.0, error = %e, "skipping unparseable quantity"),
        }
    }
    out
}

/// Usage analysis: any resource at or above its threshold grows by its
/// growth factor.
pub fn usage_analysis(
    hard: &BTreeMap<String, Amount>,
    used: &BTreeMap<String, Amount>,
    policy: &NamespacePolicy,
) -> Recommendations {
    let mut recs = Recommendations::new();
    for (res, limit) in hard {
        let Some(current) = used.get(res) else {
            continue;
        };
        if limit.milli() == 0 {
            continue;
        }
        let percentage =
            current.milli() as f64 / limit.milli() as f64 * 100.0;
        if percentage < policy.threshold(res) {
            continue;
        }
        info!(
            %res,
            usage = percentage,
            threshold = policy.threshold(res),
            "threshold exceeded"
        );
        let increment = (limit.milli() as f64 * policy.growth(res)) as i64;
        recs.insert(
            res.clone(),
            to_readable(res, limit.milli() + increment, limit.format()),
        );
    }
    recs
}

/// Two-phase deficit aggregation: retries of one workload keep only
/// their maximum, distinct workloads stack.
#[derive(Default)]
pub struct DeficitLedger {
    per_resource: BTreeMap<String, BTreeMap<String, i64>>,
}

impl DeficitLedger {
    pub fn record(&mut self, workload_key: &str, deficits: &DeficitMap) {
        for (res, milli) in deficits {
            let by_workload =
                self.per_resource.entry(res.clone()).or_default();
            let entry =
                by_workload.entry(workload_key.to_string()).or_insert(0);
            *entry = (*entry).max(*milli);
        }
    }

    pub fn totals(&self) -> BTreeMap<String, i64> {
        self.per_resource
            .iter()
            .map(|(res, by_workload)| {
                (res.clone(), by_workload.values().sum())
            })
            .collect()
    }
}

/// Find the hard-map key a deficit resource refers to: exact match,
/// then the `requests.`-stripped or `requests.`-prefixed variant.
pub fn resolve_hard_key(
    hard: &BTreeMap<String, Amount>,
    res: &str,
) -> Option<String> {
    if hard.contains_key(res) {
        return Some(res.to_string());
    }
    if let Some(short) = res.strip_prefix(REQUESTS_PREFIX) {
        if hard.contains_key(short) {
            return Some(short.to_string());
        }
    } else {
        let prefixed = format!("{REQUESTS_PREFIX}{res}");
        if hard.contains_key(&prefixed) {
            return Some(prefixed);
        }
    }
    None
}

/// Turn aggregated deficits into target limits: `used + deficit` plus a
/// growth buffer, rounded readable, included only when strictly above
/// the current hard value.
pub fn event_recommendations(
    totals: &BTreeMap<String, i64>,
    hard: &BTreeMap<String, Amount>,
    used: &BTreeMap<String, Amount>,
    policy: &NamespacePolicy,
) -> Recommendations {
    let mut recs = Recommendations::new();
    for (res, total_deficit) in totals {
        let Some(hard_key) = resolve_hard_key(hard, res) else {
            continue;
        };
        let limit = hard[&hard_key];
        let current = used.get(&hard_key).map(Amount::milli).unwrap_or(0);

        let base = current + total_deficit;
        let buffer = (base as f64 * policy.growth(res)) as i64;
        let needed = to_readable(&hard_key, base + buffer, limit.format());

        if needed.milli() > limit.milli() {
            recs.insert(hard_key, needed);
        }
    }
    recs
}

/// Per-resource max of the two analyses.
pub fn combine(
    usage: Recommendations,
    events: Recommendations,
) -> Recommendations {
    let mut out = usage;
    for (res, amount) in events {
        match out.get(&res) {
            Some(existing) if existing.milli() >= amount.milli() => {}
            _ => {
                out.insert(res, amount);
            }
        }
    }
    out
}

/// Full engine pass for one quota. Event-analysis failures degrade to
/// usage-only recommendations rather than failing the tick.
pub async fn calculate(
    client: &kube::Client,
    quota: &ResourceQuota,
    policy: &NamespacePolicy,
    last_modified: Option<DateTime<Utc>>,
) -> (Recommendations, bool) {
    let status = quota.status.as_ref();
    let hard = parse_resource_list(status.and_then(|s| s.hard.as_ref()));
    let used = parse_resource_list(status.and_then(|s| s.used.as_ref()));

    let usage = usage_analysis(&hard, &used, policy);

    let events = match analyze_events(client, quota, policy, last_modified)
        .await
    {
        Ok(totals) => event_recommendations(&totals, &hard, &used, policy),
        Err(e) => {
            warn!(error = %e, "event analysis failed; using usage analysis only");
            Recommendations::new()
        }
    };
    for (res, amount) in &events {
        info!(%res, new_limit = %amount, "event-based recommendation");
    }

    let recs = combine(usage, events);
    let needs_resize = !recs.is_empty();
    (recs, needs_resize)
}

/// Is an event both recent enough and strictly after the dedup
/// watermark? Events at or before the watermark already got their
/// capacity in the last merge.
pub fn event_in_window(
    timestamp: DateTime<Utc>,
    cutoff: DateTime<Utc>,
    watermark: Option<DateTime<Utc>>,
) -> bool {
    if timestamp < cutoff {
        return false;
    }
    match watermark {
        Some(watermark) => timestamp > watermark,
        None => true,
    }
}

/// Event analysis: filter recent admission failures for this quota, run
/// the deficit calculator per event, aggregate per workload.
async fn analyze_events(
    client: &kube::Client,
    quota: &ResourceQuota,
    _policy: &NamespacePolicy,
    last_modified: Option<DateTime<Utc>>,
) -> Result<BTreeMap<String, i64>, kube::Error> {
    let namespace = quota.namespace().unwrap_or_default();
    let quota_name = quota.name_any();

    let event_api: Api<Event> = Api::namespaced(client.clone(), &namespace);
    let events = event_api.list(&ListParams::default()).await?;

    let cutoff = Utc::now() - Duration::hours(1);
    let mut ledger = DeficitLedger::default();

    for event in events {
        let Some(timestamp) = event.last_timestamp.as_ref().map(|t| t.0)
        else {
            continue;
        };
        if !event_in_window(timestamp, cutoff, last_modified) {
            continue;
        }
        if event.type_.as_deref() != Some("Warning")
            || event.reason.as_deref() != Some("FailedCreate")
        {
            continue;
        }
        let Some(message) = event.message.as_deref() else {
            continue;
        };
        if !message.contains("exceeded quota")
            || !message.contains(quota_name.as_str())
        {
            continue;
        }

        let Some((failed_res, failed_qty)) = parse_event_message(message)
        else {
            debug!(%message, "failed to parse event message");
            continue;
        };

        if !is_object_alive(client, &event.involved_object, &namespace).await
        {
            continue;
        }

        let (key, deficits) =
            calculate_workload_deficit(client, &event, &failed_res, failed_qty)
                .await;
        ledger.record(&key, &deficits);
    }

    Ok(ledger.totals())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyDefaults;
    use crate::quantity::Format;

    const MIB: i64 = 1024 * 1024;
    const GIB: i64 = 1024 * MIB;

    fn amounts(pairs: &[(&str, &str)]) -> BTreeMap<String, Amount> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Amount::parse(v).unwrap()))
            .collect()
    }

    fn policy(pairs: &[(&str, &str)]) -> NamespacePolicy {
        let ann: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NamespacePolicy::from_annotations(ann.iter(), &PolicyDefaults::default())
    }

    #[test]
    fn usage_analysis_trips_at_threshold() {
        let hard = amounts(&[("cpu", "1000m")]);
        let used = amounts(&[("cpu", "850m")]);
        let recs = usage_analysis(&hard, &used, &policy(&[]));
        assert_eq!(recs["cpu"].to_string(), "1200m");
    }

    #[test]
    fn usage_analysis_below_threshold_is_quiet() {
        let hard = amounts(&[("cpu", "1000m")]);
        let used = amounts(&[("cpu", "790m")]);
        assert!(usage_analysis(&hard, &used, &policy(&[])).is_empty());
    }

    #[test]
    fn usage_analysis_skips_unused_and_zero_limits() {
        let hard = amounts(&[("cpu", "0"), ("pods", "10")]);
        let used = amounts(&[("cpu", "0")]);
        assert!(usage_analysis(&hard, &used, &policy(&[])).is_empty());
    }

    #[test]
    fn usage_analysis_grows_memory_readably() {
        let hard = amounts(&[("memory", "1Gi")]);
        let used = amounts(&[("memory", "1Gi")]);
        let recs = usage_analysis(&hard, &used, &policy(&[]));
        // 1 Gi * 1.2 = 1228.8 Mi, rounded up
        assert_eq!(recs["memory"].to_string(), "1229Mi");
    }

    #[test]
    fn ledger_absorbs_retries_by_max() {
        let mut ledger = DeficitLedger::default();
        ledger.record("pod-a", &DeficitMap::from([("cpu".into(), 2000)]));
        ledger.record("pod-a", &DeficitMap::from([("cpu".into(), 5000)]));
        ledger.record("pod-a", &DeficitMap::from([("cpu".into(), 2000)]));
        assert_eq!(ledger.totals()["cpu"], 5000);
    }

    #[test]
    fn ledger_stacks_distinct_workloads() {
        let mut ledger = DeficitLedger::default();
        ledger.record("web-a", &DeficitMap::from([("cpu".into(), 2000)]));
        ledger.record("web-a", &DeficitMap::from([("cpu".into(), 2000)]));
        ledger.record("api-b", &DeficitMap::from([("cpu".into(), 3000)]));
        assert_eq!(ledger.totals()["cpu"], 5000);
    }

    #[test]
    fn resolve_hard_key_tries_both_prefix_directions() {
        let hard = amounts(&[("cpu", "10"), ("requests.memory", "1Gi")]);
        assert_eq!(resolve_hard_key(&hard, "cpu").as_deref(), Some("cpu"));
        assert_eq!(
            resolve_hard_key(&hard, "requests.cpu").as_deref(),
            Some("cpu")
        );
        assert_eq!(
            resolve_hard_key(&hard, "memory").as_deref(),
            Some("requests.memory")
        );
        assert_eq!(resolve_hard_key(&hard, "requests.storage"), None);
    }

    #[test]
    fn event_recommendation_adds_deficit_to_used() {
        // hard cpu=10 fully used, total deficit 5, no buffer -> 15
        let hard = amounts(&[("cpu", "10")]);
        let used = amounts(&[("cpu", "10")]);
        let totals = BTreeMap::from([("cpu".to_string(), 5000i64)]);
        let recs = event_recommendations(
            &totals,
            &hard,
            &used,
            &policy(&[("resizer.io/default-increment", "0")]),
        );
        assert_eq!(recs["cpu"].to_string(), "15");
    }

    #[test]
    fn event_recommendation_buffers_and_rounds_storage() {
        // used 1Gi + deficit 3Gi = 4Gi, +20% = 4.8Gi -> 4916Mi
        let hard = amounts(&[("requests.storage", "1Gi")]);
        let used = amounts(&[("requests.storage", "1Gi")]);
        let totals =
            BTreeMap::from([("requests.storage".to_string(), 3 * GIB * 1000)]);
        let recs = event_recommendations(&totals, &hard, &used, &policy(&[]));
        assert_eq!(recs["requests.storage"].to_string(), "4916Mi");
    }

    #[test]
    fn event_recommendation_below_hard_is_dropped() {
        let hard = amounts(&[("cpu", "100")]);
        let used = amounts(&[("cpu", "1")]);
        let totals = BTreeMap::from([("cpu".to_string(), 1000i64)]);
        let recs = event_recommendations(&totals, &hard, &used, &policy(&[]));
        assert!(recs.is_empty());
    }

    #[test]
    fn event_recommendation_keyed_by_hard_map_key() {
        // deficit projected as requests.cpu; quota declares plain cpu
        let hard = amounts(&[("cpu", "10")]);
        let used = amounts(&[("cpu", "10")]);
        let totals =
            BTreeMap::from([("requests.cpu".to_string(), 3000i64)]);
        let recs = event_recommendations(
            &totals,
            &hard,
            &used,
            &policy(&[("resizer.io/default-increment", "0")]),
        );
        assert_eq!(recs["cpu"].to_string(), "13");
    }

    #[test]
    fn combine_takes_per_resource_max() {
        let usage = amounts(&[("cpu", "12"), ("memory", "2Gi")]);
        let events = amounts(&[("cpu", "15")]);
        let combined = combine(usage, events);
        assert_eq!(combined["cpu"].to_string(), "15");
        assert_eq!(combined["memory"].to_string(), "2Gi");
    }

    #[test]
    fn statefulset_burst_with_volumes_end_to_end() {
        // Scenario: 3 replicas missing, template 200m cpu + 100Mi memory,
        // claim 1Gi storage, growth 20%.
        let hard = amounts(&[
            ("requests.cpu", "100m"),
            ("requests.memory", "100Mi"),
            ("requests.storage", "1Gi"),
        ]);
        let used = amounts(&[
            ("requests.cpu", "0"),
            ("requests.memory", "0"),
            ("requests.storage", "1Gi"),
        ]);

        let per_pod = DeficitMap::from([
            ("requests.cpu".to_string(), 200),
            ("requests.memory".to_string(), 100 * MIB * 1000),
            ("requests.storage".to_string(), GIB * 1000),
        ]);
        let mut ledger = DeficitLedger::default();
        ledger.record(
            "burst-sts",
            &super::super::deficit::project(&per_pod, 3),
        );

        let recs =
            event_recommendations(&ledger.totals(), &hard, &used, &policy(&[]));
        assert_eq!(recs["requests.cpu"].to_string(), "720m");
        assert_eq!(recs["requests.memory"].to_string(), "360Mi");
        assert_eq!(recs["requests.storage"].to_string(), "4916Mi");
    }

    #[test]
    fn events_at_or_before_the_watermark_are_excluded() {
        let now = Utc::now();
        let cutoff = now - Duration::hours(1);
        let watermark = now - Duration::minutes(10);

        assert!(event_in_window(now, cutoff, Some(watermark)));
        assert!(!event_in_window(watermark, cutoff, Some(watermark)));
        assert!(!event_in_window(
            watermark - Duration::seconds(1),
            cutoff,
            Some(watermark)
        ));
    }

    #[test]
    fn stale_events_are_excluded_even_without_a_watermark() {
        let now = Utc::now();
        let cutoff = now - Duration::hours(1);
        assert!(!event_in_window(cutoff - Duration::seconds(1), cutoff, None));
        assert!(event_in_window(now, cutoff, None));
    }

    #[test]
    fn usage_amount_is_float_safe_for_large_memory() {
        let hard = amounts(&[("requests.memory", "100Mi")]);
        let used = amounts(&[("requests.memory", "90Mi")]);
        let recs = usage_analysis(&hard, &used, &policy(&[]));
        // 100Mi * 1.2 = 120Mi exactly
        assert_eq!(recs["requests.memory"].to_string(), "120Mi");
    }
}
