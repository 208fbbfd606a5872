use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use envconfig::Envconfig;
use kube::Client;
use quota_resizer::config::ResizerConfig;
use quota_resizer::controller::run_controller;
use quota_resizer::git::{
    GitHubProvider, LogOnlyProvider, Provider, StatefulProvider,
};
use quota_resizer::init_tracing;
use quota_resizer::lock::gc::LeaseGarbageCollector;
use tokio::try_join;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let cfg = ResizerConfig::init_from_env()?;
    info!(provider = %cfg.provider, "starting quota-resizer");

    let client = Client::try_default().await?;
    let provider = build_provider(&cfg, client.clone())?;

    let gc = LeaseGarbageCollector::new(
        client.clone(),
        cfg.controller_namespace.clone(),
        Duration::from_secs(cfg.gc_interval_hours * 60 * 60),
    );
    let gc_task = tokio::spawn(gc.run());

    let controller_client = client.clone();
    let controller_cfg = cfg.clone();
    let controller = tokio::spawn(async move {
        run_controller(controller_client, &controller_cfg, provider).await
    });

    let (ctrl_res, _) = try_join!(controller, gc_task)?;
    ctrl_res?;
    Ok(())
}

fn build_provider(
    cfg: &ResizerConfig,
    client: Client,
) -> anyhow::Result<Arc<dyn Provider>> {
    match cfg.provider.as_str() {
        "log" => Ok(Arc::new(LogOnlyProvider::new())),
        "stateful" => Ok(Arc::new(StatefulProvider::new(Some(client)))),
        "github-app" => {
            let app_id = cfg
                .github_app_id
                .context("RESIZER_GITHUB_APP_ID is required for github-app")?;
            let installation_id = cfg.github_app_installation_id.context(
                "RESIZER_GITHUB_APP_INSTALLATION_ID is required for github-app",
            )?;
            let key_path = cfg.github_app_private_key_path.as_deref().context(
                "RESIZER_GITHUB_APP_PRIVATE_KEY_PATH is required for github-app",
            )?;
            let key = std::fs::read(key_path).with_context(|| {
                format!("reading app private key from {key_path}")
            })?;
            let provider = GitHubProvider::with_app(
                app_id,
                installation_id,
                &key,
                cfg.github_api_url.clone(),
                cfg.github_owner.clone(),
                cfg.github_repo.clone(),
                cfg.cluster_name.clone(),
                cfg.git_path_template.clone(),
            )?;
            Ok(Arc::new(provider))
        }
        "github" => {
            let token = cfg
                .github_token
                .clone()
                .context("RESIZER_GITHUB_TOKEN is required for github")?;
            Ok(Arc::new(GitHubProvider::with_token(
                token,
                cfg.github_api_url.clone(),
                cfg.github_owner.clone(),
                cfg.github_repo.clone(),
                cfg.cluster_name.clone(),
                cfg.git_path_template.clone(),
            )))
        }
        other => anyhow::bail!("unknown provider kind: {other}"),
    }
}
