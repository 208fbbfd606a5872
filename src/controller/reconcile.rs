//! The per-quota reconcile tick.
//!
//! The lease record is the only cross-tick state: `holder` is the
//! proposal mutex, `last-modified` the cooldown clock and event
//! watermark. Decisions are pure functions over the provider-side PR
//! status and the recommendation, so every row of the state table has a
//! unit test; the async body only performs the IO those decisions ask
//! for.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Namespace, ResourceQuota};
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::events::{ACTION_PROPOSE, REASON_RESIZE_RECOMMENDED, emit_event};
use super::recommend::{self, Recommendations, parse_resource_list};
use super::{ControllerContext, ReconcileErr, into_cluster};
use crate::config::{ANNOTATION_ENABLED, NamespacePolicy};
use crate::git::PrStatus;

const REQUEUE_IDLE: Duration = Duration::from_secs(5 * 60);
const REQUEUE_NOOP: Duration = Duration::from_secs(10 * 60);
const REQUEUE_FILE_NOT_FOUND: Duration = Duration::from_secs(60);
const REQUEUE_MERGEABLE_UNKNOWN: Duration = Duration::from_secs(15);

/// What to do about an open proposal this tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeGate {
    /// The provider has not computed mergeability yet; poll again soon.
    Unknown,
    /// Mergeable now: clean, or blocked only by review policy while
    /// checks pass (or no checks exist).
    Ready,
    NotReady,
}

pub fn merge_gate(status: &PrStatus) -> MergeGate {
    if status.mergeable_state.eq_ignore_ascii_case("unknown") {
        return MergeGate::Unknown;
    }
    let blocked_with_passing_checks = status.mergeable_state == "blocked"
        && (status.checks_state == "success"
            || status.checks_total_count == 0);
    if status.mergeable
        && (status.mergeable_state == "clean" || blocked_with_passing_checks)
    {
        return MergeGate::Ready;
    }
    MergeGate::NotReady
}

/// A recommendation that matches `spec.hard` exactly proposes nothing.
pub fn is_noop(
    spec_hard: &BTreeMap<String, crate::quantity::Amount>,
    recs: &Recommendations,
) -> bool {
    for (res, rec) in recs {
        match spec_hard.get(res) {
            Some(current) if current.milli() == rec.milli() => {}
            _ => return false,
        }
    }
    true
}

/// Time left in the cooldown window, padded by one second so the requeue
/// lands after expiry.
pub fn cooldown_remaining(
    last_modified: Option<DateTime<Utc>>,
    cooldown: chrono::Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let elapsed = now - last_modified?;
    if elapsed >= cooldown {
        return None;
    }
    let remaining = (cooldown - elapsed) + chrono::Duration::seconds(1);
    remaining.to_std().ok()
}

#[instrument(skip_all, fields(ns = %quota.namespace().unwrap_or_default(), quota = %quota.name_any()))]
pub async fn reconcile(
    quota: Arc<ResourceQuota>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let namespace = quota.namespace().unwrap_or_default();
    let name = quota.name_any();

    let ns_api: Api<Namespace> = Api::all(ctx.client.clone());
    let ns = ns_api.get(&namespace).await.map_err(into_cluster)?;
    let annotations = ns.metadata.annotations.clone().unwrap_or_default();

    if annotations.get(ANNOTATION_ENABLED).map(String::as_str)
        == Some("false")
    {
        debug!("namespace is opted out");
        return Ok(Action::await_change());
    }

    let policy =
        NamespacePolicy::from_annotations(annotations.iter(), &ctx.defaults);

    let last_modified =
        ctx.store.get_last_modified(&namespace, &name).await?;
    let (recommendations, needs_resize) =
        recommend::calculate(&ctx.client, &quota, &policy, last_modified)
            .await;

    // The lock is checked regardless of whether a resize is due: an
    // already-open proposal needs its lifecycle driven either way.
    let holder = ctx.store.get_holder(&namespace, &name).await?;

    if let Some(pr_id) = holder {
        return handle_active_pr(
            &ctx,
            &namespace,
            &name,
            &annotations,
            &policy,
            pr_id,
            &recommendations,
            needs_resize,
        )
        .await;
    }

    if needs_resize {
        return handle_new_proposal(
            &ctx,
            &quota,
            &namespace,
            &name,
            &annotations,
            &policy,
            last_modified,
            &recommendations,
        )
        .await;
    }

    Ok(Action::requeue(REQUEUE_IDLE))
}

#[allow(clippy::too_many_arguments)]
async fn handle_active_pr(
    ctx: &ControllerContext,
    namespace: &str,
    quota_name: &str,
    annotations: &BTreeMap<String, String>,
    policy: &NamespacePolicy,
    pr_id: u64,
    recommendations: &Recommendations,
    needs_resize: bool,
) -> Result<Action, ReconcileErr> {
    info!(pr = pr_id, "lock found, checking PR status");
    let status = ctx.provider.pr_status(pr_id).await?;

    if !status.is_open {
        info!(pr = pr_id, merged = status.is_merged, "PR closed, releasing lock");
        if status.is_merged {
            // One update: the timestamp and the release must not race.
            ctx.store
                .release_with_timestamp(namespace, quota_name, Utc::now())
                .await?;
        } else {
            ctx.store.release(namespace, quota_name).await?;
        }
        return Ok(Action::requeue(Duration::ZERO));
    }

    // The annotation is an opt-out: it can disable auto-merge for a
    // namespace but never enable it against the process-wide flag.
    let auto_merge = ctx.auto_merge && policy.auto_merge.unwrap_or(true);
    if auto_merge {
        match merge_gate(&status) {
            MergeGate::Unknown => {
                info!(pr = pr_id, "mergeable state unknown, polling again");
                return Ok(Action::requeue(REQUEUE_MERGEABLE_UNKNOWN));
            }
            MergeGate::Ready => {
                info!(
                    pr = pr_id,
                    state = %status.mergeable_state,
                    checks = %status.checks_state,
                    "auto-merging PR"
                );
                match ctx.provider.merge_pr(pr_id, "squash").await {
                    Ok(()) => return Ok(Action::requeue(Duration::ZERO)),
                    Err(e) => {
                        // The lock stays; the next tick retries.
                        warn!(pr = pr_id, error = %e, "auto-merge attempt failed");
                    }
                }
            }
            MergeGate::NotReady => {
                info!(
                    pr = pr_id,
                    mergeable = status.mergeable,
                    state = %status.mergeable_state,
                    checks = %status.checks_state,
                    "auto-merge enabled but PR is not ready"
                );
            }
        }
    }

    if needs_resize {
        debug!(pr = pr_id, "PR open, refreshing with current recommendation");
        match ctx
            .provider
            .update_pr(pr_id, quota_name, namespace, annotations, recommendations)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_file_not_found() => {
                info!(error = %e, "quota file missing during update, retrying later");
                return Ok(Action::requeue(REQUEUE_FILE_NOT_FOUND));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Action::requeue(REQUEUE_IDLE))
}

#[allow(clippy::too_many_arguments)]
async fn handle_new_proposal(
    ctx: &ControllerContext,
    quota: &ResourceQuota,
    namespace: &str,
    quota_name: &str,
    annotations: &BTreeMap<String, String>,
    policy: &NamespacePolicy,
    last_modified: Option<DateTime<Utc>>,
    recommendations: &Recommendations,
) -> Result<Action, ReconcileErr> {
    let spec_hard =
        parse_resource_list(quota.spec.as_ref().and_then(|s| s.hard.as_ref()));
    if is_noop(&spec_hard, recommendations) {
        info!("recommendation is a no-op against spec.hard, skipping");
        return Ok(Action::requeue(REQUEUE_NOOP));
    }

    if let Some(remaining) =
        cooldown_remaining(last_modified, policy.cooldown, Utc::now())
    {
        info!(remaining_secs = remaining.as_secs(), "in cooldown, deferring");
        return Ok(Action::requeue(remaining));
    }

    let status_hard = parse_resource_list(
        quota.status.as_ref().and_then(|s| s.hard.as_ref()),
    );
    let uid = quota.meta().uid.clone();
    for (res, new_limit) in recommendations {
        let old = status_hard
            .get(res)
            .map(|a| a.to_string())
            .unwrap_or_else(|| "0".to_string());
        let note =
            format!("Recommendation: Increase {res} from {old} to {new_limit}");
        info!("{note}");
        emit_event(
            &ctx.recorder,
            namespace,
            quota_name,
            uid.as_deref(),
            EventType::Warning,
            REASON_RESIZE_RECOMMENDED,
            ACTION_PROPOSE,
            Some(note),
        )
        .await;
    }

    info!("no lock found, creating PR");
    let pr_id = match ctx
        .provider
        .create_pr(quota_name, namespace, annotations, recommendations)
        .await
    {
        Ok(id) => id,
        Err(e) if e.is_file_not_found() => {
            info!(error = %e, "quota file not found in repository, retrying later");
            return Ok(Action::requeue(REQUEUE_FILE_NOT_FOUND));
        }
        Err(e) => return Err(e.into()),
    };

    // Locking after creation means a failed creation leaves no orphan
    // lock; the PR id in the holder lets later ticks find the proposal.
    info!(pr = pr_id, "PR created, acquiring lock");
    ctx.store.acquire(namespace, quota_name, pr_id).await?;

    Ok(Action::requeue(REQUEUE_IDLE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::Amount;

    fn status(
        mergeable: bool,
        mergeable_state: &str,
        checks_state: &str,
        checks_total_count: i64,
    ) -> PrStatus {
        PrStatus {
            is_open: true,
            is_merged: false,
            mergeable,
            mergeable_state: mergeable_state.into(),
            checks_state: checks_state.into(),
            checks_total_count,
        }
    }

    #[test]
    fn clean_pr_is_ready() {
        assert_eq!(
            merge_gate(&status(true, "clean", "success", 2)),
            MergeGate::Ready
        );
    }

    #[test]
    fn blocked_with_passing_checks_bypasses() {
        assert_eq!(
            merge_gate(&status(true, "blocked", "success", 2)),
            MergeGate::Ready
        );
    }

    #[test]
    fn blocked_with_no_checks_bypasses() {
        assert_eq!(
            merge_gate(&status(true, "blocked", "", 0)),
            MergeGate::Ready
        );
    }

    #[test]
    fn blocked_by_failing_ci_is_not_ready() {
        assert_eq!(
            merge_gate(&status(true, "blocked", "failure", 2)),
            MergeGate::NotReady
        );
    }

    #[test]
    fn dirty_pr_is_not_ready() {
        assert_eq!(
            merge_gate(&status(false, "dirty", "success", 2)),
            MergeGate::NotReady
        );
    }

    #[test]
    fn unstable_pr_is_not_ready() {
        assert_eq!(
            merge_gate(&status(true, "unstable", "failure", 2)),
            MergeGate::NotReady
        );
    }

    #[test]
    fn unknown_state_polls_again() {
        assert_eq!(
            merge_gate(&status(false, "unknown", "", 0)),
            MergeGate::Unknown
        );
        assert_eq!(
            merge_gate(&status(false, "UNKNOWN", "", 0)),
            MergeGate::Unknown
        );
    }

    fn amounts(
        pairs: &[(&str, &str)],
    ) -> BTreeMap<String, Amount> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Amount::parse(v).unwrap()))
            .collect()
    }

    #[test]
    fn matching_recommendation_is_noop() {
        let hard = amounts(&[("cpu", "1200m"), ("memory", "2Gi")]);
        let recs = amounts(&[("cpu", "1200m")]);
        assert!(is_noop(&hard, &recs));
    }

    #[test]
    fn equivalent_spellings_are_noop() {
        let hard = amounts(&[("cpu", "1200m")]);
        let recs = amounts(&[("cpu", "1.2")]);
        assert!(is_noop(&hard, &recs));
    }

    #[test]
    fn higher_recommendation_is_not_noop() {
        let hard = amounts(&[("cpu", "1")]);
        let recs = amounts(&[("cpu", "1200m")]);
        assert!(!is_noop(&hard, &recs));
    }

    #[test]
    fn recommendation_for_absent_key_is_not_noop() {
        let hard = amounts(&[("cpu", "1")]);
        let recs = amounts(&[("memory", "1Gi")]);
        assert!(!is_noop(&hard, &recs));
    }

    #[test]
    fn empty_recommendation_counts_as_noop() {
        let hard = amounts(&[("cpu", "1")]);
        assert!(is_noop(&hard, &Recommendations::new()));
    }

    #[test]
    fn cooldown_blocks_and_pads_by_one_second() {
        let now = Utc::now();
        let last = now - chrono::Duration::minutes(30);
        let remaining =
            cooldown_remaining(Some(last), chrono::Duration::minutes(60), now)
                .unwrap();
        assert_eq!(remaining, Duration::from_secs(30 * 60 + 1));
    }

    #[test]
    fn elapsed_cooldown_does_not_block() {
        let now = Utc::now();
        let last = now - chrono::Duration::minutes(61);
        assert!(
            cooldown_remaining(Some(last), chrono::Duration::minutes(60), now)
                .is_none()
        );
    }

    #[test]
    fn no_watermark_means_no_cooldown() {
        assert!(
            cooldown_remaining(None, chrono::Duration::minutes(60), Utc::now())
                .is_none()
        );
    }
}
