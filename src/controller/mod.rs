pub mod deficit;
pub mod events;
pub mod recommend;
pub mod reconcile;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Event, ResourceQuota};
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{Controller, watcher};
use kube::{Client, ResourceExt};
use tracing::{error, info};

use crate::config::{PolicyDefaults, ResizerConfig};
use crate::git::{GitError, Provider};
use crate::lock::{LeaseStore, LockError, MANAGER};

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("cluster api error: {0}")]
    Cluster(#[source] kube::Error),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("git provider error: {0}")]
    Git(#[from] GitError),
}

pub(crate) fn into_cluster(e: kube::Error) -> ReconcileErr {
    ReconcileErr::Cluster(e)
}

pub struct ControllerContext {
    pub client: Client,
    pub provider: Arc<dyn Provider>,
    pub store: LeaseStore,
    pub recorder: Recorder,
    pub auto_merge: bool,
    pub defaults: PolicyDefaults,
}

pub async fn run_controller(
    client: Client,
    cfg: &ResizerConfig,
    provider: Arc<dyn Provider>,
) -> anyhow::Result<()> {
    let quotas: Api<ResourceQuota> = Api::all(client.clone());
    let namespace_events: Api<Event> = Api::all(client.clone());

    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: MANAGER.into(),
            instance: None,
        },
    );

    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        provider,
        store: LeaseStore::new(client, cfg.controller_namespace.clone()),
        recorder,
        auto_merge: cfg.auto_merge,
        defaults: cfg.policy_defaults(),
    });

    Controller::new(quotas, watcher::Config::default())
        .watches(
            namespace_events,
            watcher::Config::default(),
            |event: Event| map_event_to_quota(&event),
        )
        .run(reconcile::reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => {
                    info!(quota = %obj.name, "reconciled: requeue={:?}", action)
                }
                Err(e) => error!(error = ?e, "reconcile error"),
            }
        })
        .await;

    Ok(())
}

fn error_policy(
    _obj: Arc<ResourceQuota>,
    _error: &ReconcileErr,
    _ctx: Arc<ControllerContext>,
) -> Action {
    Action::requeue(Duration::from_secs(60))
}

/// Extract the quota name from an admission-failure message: the text
/// after `exceeded quota: ` up to the first comma.
pub fn extract_quota_name(message: &str) -> Option<&str> {
    let rest = message.split_once("exceeded quota: ")?.1;
    let name = match rest.find(',') {
        Some(idx) => &rest[..idx],
        None => rest,
    };
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

/// Map a warning event onto the quota it names so quota-less namespaces
/// still trigger ticks on admission failures.
fn map_event_to_quota(event: &Event) -> Option<ObjectRef<ResourceQuota>> {
    if event.type_.as_deref() != Some("Warning")
        || event.reason.as_deref() != Some("FailedCreate")
    {
        return None;
    }
    let message = event.message.as_deref()?;
    let quota_name = extract_quota_name(message)?;
    let namespace = event.namespace()?;
    Some(ObjectRef::new(quota_name).within(&namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn extracts_quota_name_up_to_comma() {
        let msg = "pods \"web-0\" is forbidden: exceeded quota: team-quota, \
                   requested: cpu=1, used: cpu=10, limited: cpu=10";
        assert_eq!(extract_quota_name(msg), Some("team-quota"));
    }

    #[test]
    fn extracts_quota_name_without_trailing_fields() {
        assert_eq!(
            extract_quota_name("exceeded quota: solo-quota"),
            Some("solo-quota")
        );
    }

    #[test]
    fn no_marker_means_no_name() {
        assert_eq!(extract_quota_name("some other failure"), None);
        assert_eq!(extract_quota_name("exceeded quota: "), None);
    }

    fn event(
        type_: &str,
        reason: &str,
        message: &str,
        namespace: Option<&str>,
    ) -> Event {
        Event {
            metadata: ObjectMeta {
                name: Some("evt".into()),
                namespace: namespace.map(Into::into),
                ..Default::default()
            },
            type_: Some(type_.into()),
            reason: Some(reason.into()),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    #[test]
    fn maps_admission_failures_to_quota_refs() {
        let evt = event(
            "Warning",
            "FailedCreate",
            "exceeded quota: team-quota, requested: cpu=1",
            Some("team-a"),
        );
        let obj_ref = map_event_to_quota(&evt).unwrap();
        assert_eq!(obj_ref.name, "team-quota");
        assert_eq!(obj_ref.namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn ignores_normal_events_and_other_reasons() {
        let normal = event(
            "Normal",
            "FailedCreate",
            "exceeded quota: q, requested: cpu=1",
            Some("ns"),
        );
        assert!(map_event_to_quota(&normal).is_none());

        let other = event(
            "Warning",
            "FailedScheduling",
            "exceeded quota: q, requested: cpu=1",
            Some("ns"),
        );
        assert!(map_event_to_quota(&other).is_none());
    }

    #[test]
    fn ignores_unrelated_warnings() {
        let evt = event("Warning", "FailedCreate", "image pull backoff", Some("ns"));
        assert!(map_event_to_quota(&evt).is_none());
    }
}
