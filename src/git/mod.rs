pub mod github;
pub mod log_provider;
pub mod yaml_edit;

pub use github::GitHubProvider;
pub use log_provider::{LogOnlyProvider, StatefulProvider};

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::quantity::Amount;

/// Proposed new `spec.hard` values, keyed by the quota's own resource
/// names.
pub type NewLimits = BTreeMap<String, Amount>;

/// Provider-side view of a pull request, as consumed by the reconcile
/// state machine.
#[derive(Clone, Debug, Default)]
pub struct PrStatus {
    pub is_open: bool,
    pub is_merged: bool,
    pub mergeable: bool,
    /// clean | blocked | dirty | unstable | unknown
    pub mergeable_state: String,
    /// success | failure | pending | "" (no checks reported)
    pub checks_state: String,
    pub checks_total_count: i64,
}

#[derive(thiserror::Error, Debug)]
pub enum GitError {
    /// The quota manifest could not be located in the repository. A soft
    /// failure: the reconcile loop requeues instead of erroring.
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("provider api error: {0}")]
    Api(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("auth error: {0}")]
    Auth(String),
}

impl GitError {
    pub fn is_file_not_found(&self) -> bool {
        matches!(self, GitError::FileNotFound(_))
    }
}

/// Pull-request capability of a Git hosting provider.
///
/// Satisfied by the GitHub implementation, the log-only smoke double and
/// the stateful in-memory double.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn pr_status(&self, pr_id: u64) -> Result<PrStatus, GitError>;

    async fn merge_pr(&self, pr_id: u64, method: &str) -> Result<(), GitError>;

    /// Opens a proposal and returns its PR number.
    async fn create_pr(
        &self,
        quota: &str,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
        new_limits: &NewLimits,
    ) -> Result<u64, GitError>;

    async fn update_pr(
        &self,
        pr_id: u64,
        quota: &str,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
        new_limits: &NewLimits,
    ) -> Result<(), GitError>;
}

/// Render the fixed Markdown body of a proposal.
pub fn pr_body(namespace: &str, quota: &str, limits: &NewLimits) -> String {
    let mut body = format!(
        "### Quota Resize Recommendation for `{}` in `{}`\n\n",
        quota, namespace
    );
    body.push_str(
        "The Quota Resizer controller detected a need to increase the following limits:\n\n",
    );
    body.push_str("| Resource | New Limit |\n");
    body.push_str("| :--- | :--- |\n");
    for (res, qty) in limits {
        body.push_str(&format!("| {} | {} |\n", res, qty));
    }
    body.push_str("\n\n*Generated automatically by Quota Resizer*");
    body
}

/// Render the base-directory template with `{cluster}` and `{namespace}`.
pub fn render_path_template(template: &str, cluster: &str, namespace: &str) -> String {
    template
        .replace("{cluster}", cluster)
        .replace("{namespace}", namespace)
}
