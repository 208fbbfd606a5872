//! Durable per-quota lease records.
//!
//! One coordination/v1 Lease per (namespace, quota), stored in the
//! controller's own namespace so the GitOps reconciler cannot prune it.
//! The record is three things at once: the proposal mutex (`holder`),
//! the cooldown clock and the event-dedup watermark (the last-modified
//! annotation). Keeping them in one object is what makes
//! release-with-timestamp a single atomic update.

pub mod gc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};

/// Timestamp of the most recent merged proposal, RFC 3339.
pub const ANNOTATION_LAST_MODIFIED: &str = "resizer.io/last-modified";
pub const LABEL_TARGET_NAMESPACE: &str = "resizer.io/target-ns";
pub const LABEL_TARGET_QUOTA: &str = "resizer.io/quota";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGER: &str = "quota-resizer";

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("lease is already locked by {0}")]
    AlreadyLocked(String),
    /// The holder field does not parse as `pr-<n>`; operator attention
    /// required.
    #[error("invalid lock identity format: {0}")]
    CorruptHolder(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

pub fn lease_name(target_ns: &str, quota: &str) -> String {
    format!("state-{target_ns}-{quota}")
}

pub fn format_holder(pr_id: u64) -> String {
    format!("pr-{pr_id}")
}

pub fn parse_holder(identity: &str) -> Result<u64, LockError> {
    identity
        .strip_prefix("pr-")
        .and_then(|n| n.parse::<u64>().ok())
        .ok_or_else(|| LockError::CorruptHolder(identity.to_string()))
}

#[derive(Clone)]
pub struct LeaseStore {
    client: kube::Client,
    namespace: String,
}

impl LeaseStore {
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn new_lease(&self, target_ns: &str, quota: &str) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(lease_name(target_ns, quota)),
                namespace: Some(self.namespace.clone()),
                labels: Some(
                    [
                        (LABEL_TARGET_NAMESPACE.to_string(), target_ns.to_string()),
                        (LABEL_TARGET_QUOTA.to_string(), quota.to_string()),
                        (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
                    ]
                    .into(),
                ),
                ..Default::default()
            },
            spec: Some(LeaseSpec::default()),
        }
    }

    /// Returns the PR id held for this quota, or `None` when the record
    /// is absent or unlocked.
    pub async fn get_holder(
        &self,
        target_ns: &str,
        quota: &str,
    ) -> Result<Option<u64>, LockError> {
        let Some(lease) =
            self.api().get_opt(&lease_name(target_ns, quota)).await?
        else {
            return Ok(None);
        };
        let Some(identity) =
            lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref())
        else {
            return Ok(None);
        };
        parse_holder(identity).map(Some)
    }

    /// Create-or-update the record with `holder = pr-<id>`. Fails when
    /// another proposal already holds the lock.
    pub async fn acquire(
        &self,
        target_ns: &str,
        quota: &str,
        pr_id: u64,
    ) -> Result<(), LockError> {
        let name = lease_name(target_ns, quota);
        let identity = format_holder(pr_id);
        let now = MicroTime(Utc::now());

        match self.api().get_opt(&name).await? {
            None => {
                let mut lease = self.new_lease(target_ns, quota);
                lease.spec = Some(LeaseSpec {
                    holder_identity: Some(identity),
                    acquire_time: Some(now),
                    ..Default::default()
                });
                self.api().create(&PostParams::default(), &lease).await?;
                Ok(())
            }
            Some(mut lease) => {
                let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                if let Some(existing) = &spec.holder_identity {
                    return Err(LockError::AlreadyLocked(existing.clone()));
                }
                spec.holder_identity = Some(identity);
                spec.acquire_time = Some(now);
                // replace() carries the fetched resourceVersion, so a
                // concurrent writer surfaces as a conflict.
                self.api()
                    .replace(&name, &PostParams::default(), &lease)
                    .await?;
                Ok(())
            }
        }
    }

    /// Clear the holder, keeping the record.
    pub async fn release(
        &self,
        target_ns: &str,
        quota: &str,
    ) -> Result<(), LockError> {
        self.release_inner(target_ns, quota, None).await
    }

    /// Clear the holder and stamp last-modified in one update. Splitting
    /// the two writes loses the timestamp when the second read returns a
    /// stale resourceVersion.
    pub async fn release_with_timestamp(
        &self,
        target_ns: &str,
        quota: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), LockError> {
        self.release_inner(target_ns, quota, Some(timestamp)).await
    }

    async fn release_inner(
        &self,
        target_ns: &str,
        quota: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), LockError> {
        let name = lease_name(target_ns, quota);
        let Some(mut lease) = self.api().get_opt(&name).await? else {
            return Ok(());
        };

        if let Some(t) = timestamp {
            lease
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(ANNOTATION_LAST_MODIFIED.to_string(), t.to_rfc3339());
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
        }
        self.api()
            .replace(&name, &PostParams::default(), &lease)
            .await?;
        Ok(())
    }

    /// Upsert the record and stamp last-modified. Test support; the
    /// engine releases with a timestamp instead.
    pub async fn set_last_modified(
        &self,
        target_ns: &str,
        quota: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), LockError> {
        let name = lease_name(target_ns, quota);
        let mut lease = match self.api().get_opt(&name).await? {
            Some(lease) => lease,
            None => {
                self.api()
                    .create(
                        &PostParams::default(),
                        &self.new_lease(target_ns, quota),
                    )
                    .await?;
                self.api().get(&name).await?
            }
        };
        lease
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_LAST_MODIFIED.to_string(), timestamp.to_rfc3339());
        self.api()
            .replace(&name, &PostParams::default(), &lease)
            .await?;
        Ok(())
    }

    pub async fn get_last_modified(
        &self,
        target_ns: &str,
        quota: &str,
    ) -> Result<Option<DateTime<Utc>>, LockError> {
        let Some(lease) =
            self.api().get_opt(&lease_name(target_ns, quota)).await?
        else {
            return Ok(None);
        };
        Ok(last_modified_of(&lease))
    }

    pub async fn in_cooldown(
        &self,
        target_ns: &str,
        quota: &str,
        duration: Duration,
    ) -> Result<bool, LockError> {
        let Some(last) = self.get_last_modified(target_ns, quota).await? else {
            return Ok(false);
        };
        Ok(last + duration > Utc::now())
    }
}

pub(crate) fn last_modified_of(lease: &Lease) -> Option<DateTime<Utc>> {
    lease
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_LAST_MODIFIED))
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_name_includes_both_identities() {
        assert_eq!(lease_name("team-a", "compute"), "state-team-a-compute");
    }

    #[test]
    fn holder_round_trip() {
        assert_eq!(parse_holder(&format_holder(123)).unwrap(), 123);
    }

    #[test]
    fn corrupt_holder_is_an_error() {
        assert!(matches!(
            parse_holder("leader-election-7a2f"),
            Err(LockError::CorruptHolder(_))
        ));
        assert!(matches!(
            parse_holder("pr-"),
            Err(LockError::CorruptHolder(_))
        ));
        assert!(matches!(
            parse_holder("pr-abc"),
            Err(LockError::CorruptHolder(_))
        ));
    }

    #[test]
    fn last_modified_parses_rfc3339_annotation() {
        let t = Utc::now();
        let lease = Lease {
            metadata: ObjectMeta {
                annotations: Some(
                    [(ANNOTATION_LAST_MODIFIED.to_string(), t.to_rfc3339())]
                        .into(),
                ),
                ..Default::default()
            },
            spec: None,
        };
        let parsed = last_modified_of(&lease).unwrap();
        assert_eq!(parsed.timestamp(), t.timestamp());
    }

    #[test]
    fn missing_annotation_means_no_watermark() {
        let lease = Lease::default();
        assert!(last_modified_of(&lease).is_none());
    }
}
