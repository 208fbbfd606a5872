//! Provider doubles: a log-only provider for smoke runs without a Git
//! host, and a stateful in-memory provider that simulates the full PR
//! lifecycle, including the GitOps sync that follows a merge.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ResourceQuota;
use kube::api::{Api, Patch, PatchParams};
use rand::Rng;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{GitError, NewLimits, PrStatus, Provider};

fn open_clean() -> PrStatus {
    PrStatus {
        is_open: true,
        is_merged: false,
        mergeable: true,
        mergeable_state: "clean".to_string(),
        checks_state: "success".to_string(),
        checks_total_count: 0,
    }
}

fn next_pr_id() -> u64 {
    rand::rng().random_range(1000..2000)
}

/// Logs every operation and reports PRs as open and clean.
#[derive(Default)]
pub struct LogOnlyProvider;

impl LogOnlyProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for LogOnlyProvider {
    async fn pr_status(&self, _pr_id: u64) -> Result<PrStatus, GitError> {
        Ok(open_clean())
    }

    async fn merge_pr(&self, pr_id: u64, method: &str) -> Result<(), GitError> {
        info!(pr = pr_id, method, "gitops simulation: merging PR");
        Ok(())
    }

    async fn create_pr(
        &self,
        quota: &str,
        namespace: &str,
        _annotations: &BTreeMap<String, String>,
        new_limits: &NewLimits,
    ) -> Result<u64, GitError> {
        let id = next_pr_id();
        info!(
            %namespace,
            %quota,
            pr = id,
            limits = ?new_limits,
            "gitops simulation: creating PR"
        );
        Ok(id)
    }

    async fn update_pr(
        &self,
        pr_id: u64,
        _quota: &str,
        _namespace: &str,
        _annotations: &BTreeMap<String, String>,
        new_limits: &NewLimits,
    ) -> Result<(), GitError> {
        info!(pr = pr_id, limits = ?new_limits, "gitops simulation: updating PR");
        Ok(())
    }
}

struct PrDetails {
    namespace: String,
    quota: String,
    new_limits: NewLimits,
    status: PrStatus,
}

/// In-memory provider with real lifecycle state. Merging flips the stored
/// status and, when a cluster client is present, writes the proposed
/// limits into the live quota's `spec.hard` the way the GitOps reconciler
/// eventually would.
pub struct StatefulProvider {
    client: Option<kube::Client>,
    prs: Mutex<HashMap<u64, PrDetails>>,
}

impl StatefulProvider {
    pub fn new(client: Option<kube::Client>) -> Self {
        Self {
            client,
            prs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Provider for StatefulProvider {
    async fn pr_status(&self, pr_id: u64) -> Result<PrStatus, GitError> {
        let prs = self.prs.lock().await;
        match prs.get(&pr_id) {
            Some(details) => Ok(details.status.clone()),
            None => Ok(open_clean()),
        }
    }

    async fn merge_pr(&self, pr_id: u64, method: &str) -> Result<(), GitError> {
        info!(pr = pr_id, method, "gitops simulation: merging PR");
        let mut prs = self.prs.lock().await;
        let Some(details) = prs.get_mut(&pr_id) else {
            warn!(pr = pr_id, "merge requested for unknown PR");
            return Ok(());
        };
        details.status.is_open = false;
        details.status.is_merged = true;

        if let Some(client) = &self.client {
            let api: Api<ResourceQuota> =
                Api::namespaced(client.clone(), &details.namespace);
            let mut hard = serde_json::Map::new();
            for (res, qty) in &details.new_limits {
                hard.insert(res.clone(), json!(qty.to_string()));
            }
            api.patch(
                &details.quota,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "spec": { "hard": hard } })),
            )
            .await
            .map_err(|e| {
                GitError::Api(format!("gitops sync of quota failed: {e}"))
            })?;
            info!(
                namespace = %details.namespace,
                quota = %details.quota,
                "gitops simulation: synced quota spec"
            );
        }
        Ok(())
    }

    async fn create_pr(
        &self,
        quota: &str,
        namespace: &str,
        _annotations: &BTreeMap<String, String>,
        new_limits: &NewLimits,
    ) -> Result<u64, GitError> {
        let id = next_pr_id();
        info!(%namespace, %quota, pr = id, "gitops simulation: creating PR");
        let mut prs = self.prs.lock().await;
        prs.insert(
            id,
            PrDetails {
                namespace: namespace.to_string(),
                quota: quota.to_string(),
                new_limits: new_limits.clone(),
                status: open_clean(),
            },
        );
        Ok(id)
    }

    async fn update_pr(
        &self,
        pr_id: u64,
        _quota: &str,
        _namespace: &str,
        _annotations: &BTreeMap<String, String>,
        new_limits: &NewLimits,
    ) -> Result<(), GitError> {
        info!(pr = pr_id, "gitops simulation: updating PR");
        let mut prs = self.prs.lock().await;
        if let Some(details) = prs.get_mut(&pr_id) {
            details.new_limits = new_limits.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::Amount;

    fn limits(pairs: &[(&str, &str)]) -> NewLimits {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Amount::parse(v).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn stateful_provider_tracks_the_pr_lifecycle() {
        let provider = StatefulProvider::new(None);
        let pr = provider
            .create_pr(
                "compute-quota",
                "team-a",
                &BTreeMap::new(),
                &limits(&[("requests.cpu", "1200m")]),
            )
            .await
            .unwrap();

        let status = provider.pr_status(pr).await.unwrap();
        assert!(status.is_open);
        assert!(!status.is_merged);

        provider.merge_pr(pr, "squash").await.unwrap();

        let status = provider.pr_status(pr).await.unwrap();
        assert!(!status.is_open);
        assert!(status.is_merged);
    }

    #[tokio::test]
    async fn unknown_pr_reports_open_and_clean() {
        let provider = StatefulProvider::new(None);
        let status = provider.pr_status(9999).await.unwrap();
        assert!(status.is_open);
        assert_eq!(status.mergeable_state, "clean");
    }
}
