//! GitHub REST implementation of the pull-request provider.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{GitError, NewLimits, PrStatus, Provider, pr_body, render_path_template};
use crate::config::ANNOTATION_GIT_PATH;
use crate::git::yaml_edit::apply_new_limits;

const COMMITTER_NAME: &str = "Quota Resizer";
const COMMITTER_EMAIL: &str = "bot@resizer.io";
pub const LABEL_MANAGED: &str = "resizer/managed";

enum Auth {
    Token(String),
    App {
        app_id: i64,
        installation_id: i64,
        key: jsonwebtoken::EncodingKey,
        cached: Mutex<Option<InstallationToken>>,
    },
}

#[derive(Clone)]
struct InstallationToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct GitHubProvider {
    http: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    cluster_name: String,
    path_template: String,
    auth: Auth,
}

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Deserialize)]
struct ContentEntry {
    name: String,
    path: String,
    sha: String,
    #[serde(rename = "type")]
    kind: String,
    content: Option<String>,
}

#[derive(Deserialize)]
struct PullRequest {
    number: u64,
    state: String,
    #[serde(default)]
    merged: bool,
    mergeable: Option<bool>,
    mergeable_state: Option<String>,
    head: PullRequestHead,
}

#[derive(Deserialize)]
struct PullRequestHead {
    #[serde(rename = "ref")]
    branch: String,
    sha: Option<String>,
}

#[derive(Deserialize)]
struct CombinedStatus {
    state: String,
    total_count: i64,
}

#[derive(Deserialize)]
struct AccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl GitHubProvider {
    /// Provider authenticated with a personal access token.
    pub fn with_token(
        token: String,
        api_base: String,
        owner: String,
        repo: String,
        cluster_name: String,
        path_template: String,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base,
            owner,
            repo,
            cluster_name,
            path_template,
            auth: Auth::Token(token),
        }
    }

    /// Provider authenticated as a GitHub App installation. `private_key`
    /// is the app's RS256 key in PEM form.
    pub fn with_app(
        app_id: i64,
        installation_id: i64,
        private_key: &[u8],
        api_base: String,
        owner: String,
        repo: String,
        cluster_name: String,
        path_template: String,
    ) -> Result<Self, GitError> {
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key)
            .map_err(|e| GitError::Auth(format!("invalid app key: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            api_base,
            owner,
            repo,
            cluster_name,
            path_template,
            auth: Auth::App {
                app_id,
                installation_id,
                key,
                cached: Mutex::new(None),
            },
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base, self.owner, self.repo, path
        )
    }

    async fn bearer(&self) -> Result<String, GitError> {
        match &self.auth {
            Auth::Token(t) => Ok(t.clone()),
            Auth::App {
                app_id,
                installation_id,
                key,
                cached,
            } => {
                let mut guard = cached.lock().await;
                if let Some(tok) = guard.as_ref() {
                    if tok.expires_at - Utc::now() > Duration::seconds(60) {
                        return Ok(tok.token.clone());
                    }
                }
                let now = Utc::now();
                let claims = AppClaims {
                    iat: (now - Duration::seconds(30)).timestamp(),
                    exp: (now + Duration::minutes(9)).timestamp(),
                    iss: app_id.to_string(),
                };
                let jwt = jsonwebtoken::encode(
                    &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
                    &claims,
                    key,
                )
                .map_err(|e| GitError::Auth(e.to_string()))?;

                let url = format!(
                    "{}/app/installations/{}/access_tokens",
                    self.api_base, installation_id
                );
                let resp = self
                    .http
                    .post(&url)
                    .bearer_auth(jwt)
                    .header(reqwest::header::USER_AGENT, COMMITTER_NAME)
                    .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(GitError::Auth(format!(
                        "installation token request failed: {}",
                        resp.status()
                    )));
                }
                let tok: AccessToken = resp.json().await?;
                let cached_tok = InstallationToken {
                    token: tok.token.clone(),
                    expires_at: tok.expires_at,
                };
                *guard = Some(cached_tok);
                Ok(tok.token)
            }
        }
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, GitError> {
        let token = self.bearer().await?;
        let resp = req
            .bearer_auth(token)
            .header(reqwest::header::USER_AGENT, COMMITTER_NAME)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;
        Ok(resp)
    }

    async fn expect_success(
        resp: reqwest::Response,
        what: &str,
    ) -> Result<reqwest::Response, GitError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let detail = resp.text().await.unwrap_or_default();
        Err(GitError::Api(format!("{what}: {status}: {detail}")))
    }

    fn resolve_path(
        &self,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
    ) -> String {
        if let Some(path) = annotations.get(ANNOTATION_GIT_PATH) {
            return path.clone();
        }
        render_path_template(&self.path_template, &self.cluster_name, namespace)
    }

    async fn default_branch(&self) -> Result<String, GitError> {
        let resp = self
            .send(self.http.get(format!(
                "{}/repos/{}/{}",
                self.api_base, self.owner, self.repo
            )))
            .await?;
        let info: RepoInfo =
            Self::expect_success(resp, "get repo").await?.json().await?;
        Ok(info.default_branch)
    }

    async fn branch_head(&self, branch: &str) -> Result<String, GitError> {
        let resp = self
            .send(
                self.http
                    .get(self.repo_url(&format!("git/ref/heads/{branch}"))),
            )
            .await?;
        let r: GitRef =
            Self::expect_success(resp, "get ref").await?.json().await?;
        Ok(r.object.sha)
    }

    async fn create_branch(
        &self,
        branch: &str,
        sha: &str,
    ) -> Result<(), GitError> {
        let resp = self
            .send(self.http.post(self.repo_url("git/refs")).json(&json!({
                "ref": format!("refs/heads/{branch}"),
                "sha": sha,
            })))
            .await?;
        Self::expect_success(resp, "create branch").await?;
        Ok(())
    }

    async fn get_contents(
        &self,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<reqwest::Response>, GitError> {
        let resp = self
            .send(
                self.http
                    .get(self.repo_url(&format!("contents/{path}")))
                    .query(&[("ref", git_ref)]),
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::expect_success(resp, "get contents").await?))
    }

    /// Scan the base directory for the first YAML file declaring this
    /// quota. Returns (path, blob sha, decoded content).
    async fn find_quota_file(
        &self,
        base_path: &str,
        git_ref: &str,
        quota: &str,
    ) -> Result<(String, String, String), GitError> {
        let Some(resp) = self.get_contents(base_path, git_ref).await? else {
            return Err(GitError::FileNotFound(format!(
                "directory {base_path} does not exist"
            )));
        };
        let entries: Vec<ContentEntry> = resp.json().await?;

        for entry in entries {
            if entry.kind != "file" {
                continue;
            }
            if !entry.name.ends_with(".yaml") && !entry.name.ends_with(".yml") {
                continue;
            }
            let Some(file_resp) =
                self.get_contents(&entry.path, git_ref).await?
            else {
                continue;
            };
            let file: ContentEntry = file_resp.json().await?;
            let Some(content) = file
                .content
                .as_deref()
                .and_then(|c| decode_content(c).ok())
            else {
                continue;
            };
            if content.contains("kind: ResourceQuota")
                && content.contains(&format!("name: {quota}"))
            {
                return Ok((entry.path, file.sha, content));
            }
        }

        Err(GitError::FileNotFound(format!(
            "quota {quota} not found in {base_path}"
        )))
    }

    async fn commit_file(
        &self,
        path: &str,
        branch: &str,
        sha: &str,
        message: &str,
        content: &str,
    ) -> Result<(), GitError> {
        let resp = self
            .send(
                self.http
                    .put(self.repo_url(&format!("contents/{path}")))
                    .json(&json!({
                        "message": message,
                        "content": BASE64.encode(content),
                        "sha": sha,
                        "branch": branch,
                        "committer": {
                            "name": COMMITTER_NAME,
                            "email": COMMITTER_EMAIL,
                        },
                    })),
            )
            .await?;
        Self::expect_success(resp, "commit file").await?;
        Ok(())
    }

    async fn get_pull(&self, pr_id: u64) -> Result<PullRequest, GitError> {
        let resp = self
            .send(self.http.get(self.repo_url(&format!("pulls/{pr_id}"))))
            .await?;
        Ok(Self::expect_success(resp, "get pull").await?.json().await?)
    }
}

fn decode_content(raw: &str) -> Result<String, GitError> {
    // The contents API returns base64 with embedded newlines.
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(cleaned)
        .map_err(|e| GitError::Api(format!("bad content encoding: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| GitError::Api(format!("content is not utf-8: {e}")))
}

#[async_trait]
impl Provider for GitHubProvider {
    async fn pr_status(&self, pr_id: u64) -> Result<PrStatus, GitError> {
        let pr = self.get_pull(pr_id).await?;

        let mut checks_state = String::new();
        let mut checks_total_count = 0;
        if let Some(sha) = pr.head.sha.as_deref() {
            let resp = self
                .send(
                    self.http
                        .get(self.repo_url(&format!("commits/{sha}/status"))),
                )
                .await?;
            if resp.status().is_success() {
                if let Ok(combined) = resp.json::<CombinedStatus>().await {
                    checks_state = combined.state;
                    checks_total_count = combined.total_count;
                }
            }
        }

        Ok(PrStatus {
            is_open: pr.state == "open",
            is_merged: pr.merged,
            mergeable: pr.mergeable.unwrap_or(false),
            mergeable_state: pr
                .mergeable_state
                .unwrap_or_else(|| "unknown".to_string()),
            checks_state,
            checks_total_count,
        })
    }

    async fn merge_pr(&self, pr_id: u64, method: &str) -> Result<(), GitError> {
        let method = if method.is_empty() { "squash" } else { method };
        let resp = self
            .send(
                self.http
                    .put(self.repo_url(&format!("pulls/{pr_id}/merge")))
                    .json(&json!({
                        "commit_title": "Auto-merge by Quota Resizer",
                        "merge_method": method,
                    })),
            )
            .await?;
        Self::expect_success(resp, "merge pull").await?;
        Ok(())
    }

    async fn create_pr(
        &self,
        quota: &str,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
        new_limits: &NewLimits,
    ) -> Result<u64, GitError> {
        let base_branch = self.default_branch().await?;
        let base_sha = self.branch_head(&base_branch).await?;

        let branch = format!(
            "resize/{}-{}-{}",
            namespace,
            quota,
            Utc::now().timestamp()
        );
        self.create_branch(&branch, &base_sha).await?;

        let base_path = self.resolve_path(namespace, annotations);
        let (file_path, file_sha, content) =
            self.find_quota_file(&base_path, &branch, quota).await?;

        let edited = apply_new_limits(&content, new_limits);
        self.commit_file(
            &file_path,
            &branch,
            &file_sha,
            &format!("chore({namespace}): resize quota {quota}"),
            &edited,
        )
        .await?;

        let resp = self
            .send(self.http.post(self.repo_url("pulls")).json(&json!({
                "title": format!("Resize Quota {quota} in {namespace}"),
                "head": branch,
                "base": base_branch,
                "body": pr_body(namespace, quota, new_limits),
                "maintainer_can_modify": true,
            })))
            .await?;
        let pr: PullRequest =
            Self::expect_success(resp, "create pull").await?.json().await?;

        // Labels are informational; a failure must not undo the proposal.
        let label_resp = self
            .send(
                self.http
                    .post(self.repo_url(&format!("issues/{}/labels", pr.number)))
                    .json(&json!({
                        "labels": [
                            LABEL_MANAGED,
                            format!("resizer/ns:{namespace}"),
                        ],
                    })),
            )
            .await;
        match label_resp {
            Ok(resp) if !resp.status().is_success() => {
                warn!(pr = pr.number, status = %resp.status(), "failed to attach labels");
            }
            Err(e) => warn!(pr = pr.number, error = %e, "failed to attach labels"),
            Ok(_) => {}
        }

        info!(pr = pr.number, %branch, file = %file_path, "created resize proposal");
        Ok(pr.number)
    }

    async fn update_pr(
        &self,
        pr_id: u64,
        quota: &str,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
        new_limits: &NewLimits,
    ) -> Result<(), GitError> {
        let pr = self.get_pull(pr_id).await?;
        let branch = pr.head.branch;

        let base_path = self.resolve_path(namespace, annotations);
        let (file_path, file_sha, content) =
            self.find_quota_file(&base_path, &branch, quota).await?;

        let edited = apply_new_limits(&content, new_limits);
        if edited == content {
            return Ok(());
        }

        self.commit_file(
            &file_path,
            &branch,
            &file_sha,
            &format!("chore({namespace}): update quota resize {quota}"),
            &edited,
        )
        .await?;

        let resp = self
            .send(
                self.http
                    .patch(self.repo_url(&format!("pulls/{pr_id}")))
                    .json(&json!({
                        "body": pr_body(namespace, quota, new_limits),
                    })),
            )
            .await?;
        Self::expect_success(resp, "update pull body").await?;
        Ok(())
    }
}
