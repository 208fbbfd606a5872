//! Background cleanup of lease records whose target namespace is gone.

use std::time::Duration;

use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams};
use kube::ResourceExt;
use tracing::{error, info, warn};

use super::{LABEL_MANAGED_BY, LABEL_TARGET_NAMESPACE, MANAGER};

pub struct LeaseGarbageCollector {
    client: kube::Client,
    namespace: String,
    interval: Duration,
}

impl LeaseGarbageCollector {
    pub fn new(
        client: kube::Client,
        namespace: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            interval,
        }
    }

    /// Runs forever: one pass immediately, then one per interval.
    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "starting lease GC");
        loop {
            if let Err(e) = self.cleanup().await {
                error!(error = %e, "lease GC pass failed");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Delete managed leases whose target namespace no longer exists.
    /// Unmanaged records and records without a target label are left
    /// alone.
    pub async fn cleanup(&self) -> Result<(), kube::Error> {
        let lease_api: Api<Lease> =
            Api::namespaced(self.client.clone(), &self.namespace);
        let ns_api: Api<Namespace> = Api::all(self.client.clone());

        let selector = format!("{LABEL_MANAGED_BY}={MANAGER}");
        let leases = lease_api
            .list(&ListParams::default().labels(&selector))
            .await?;

        for lease in leases {
            let name = lease.name_any();
            let Some(target_ns) = lease
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_TARGET_NAMESPACE))
            else {
                continue;
            };

            match ns_api.get_opt(target_ns).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    info!(lease = %name, target = %target_ns, "deleting orphaned lease");
                    if let Err(e) =
                        lease_api.delete(&name, &DeleteParams::default()).await
                    {
                        warn!(lease = %name, error = %e, "failed to delete orphaned lease");
                    }
                }
                Err(e) => {
                    warn!(target = %target_ns, error = %e, "failed to check namespace existence");
                }
            }
        }
        Ok(())
    }
}
