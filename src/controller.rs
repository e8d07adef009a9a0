//! Service deletion reconciler
//!
//! Watches Services cluster-wide and guarantees port release: a NodePort
//! Service gets our finalizer on first sight, and a deleting Service has its
//! ports released before the finalizer is removed. Release problems are
//! logged but never block deletion.
//!
//! The reconciler mutates shared allocation state, so it runs on exactly one
//! replica; the leader wires it up inside the leadership callback.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::allocator::{is_node_port, service_key};
use crate::manager::Manager;
use crate::{Error, Result, FINALIZER};

const FIELD_MANAGER: &str = "nodeport-allocator";

/// Shared state for the reconciler
pub struct Context {
    /// Kubernetes client for finalizer patches
    pub client: Client,
    /// Port manager owning the range bitmaps
    pub manager: Arc<Manager>,
}

/// Reconcile one Service
///
/// Live NodePort Services receive the finalizer; deleting ones have their
/// ports released and the finalizer removed.
pub async fn reconcile(svc: Arc<Service>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let name = svc.name_any();

    if svc.metadata.deletion_timestamp.is_some() {
        debug!(service = %service_key(&svc), "service is deleting, releasing ports");
        return handle_deletion(&svc, &ctx, &namespace, &name).await;
    }

    if !is_node_port(&svc) {
        return Ok(Action::await_change());
    }

    if !has_finalizer(&svc) {
        let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
        let finalizers = with_finalizer(svc.metadata.finalizers.clone().unwrap_or_default());
        patch_finalizers(&api, &name, finalizers).await?;
        info!(service = %service_key(&svc), "added finalizer");
    }

    Ok(Action::await_change())
}

async fn handle_deletion(
    svc: &Service,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    if is_node_port(svc) {
        if let Err(e) = ctx.manager.allocator().release_for_service(svc).await {
            // deletion proceeds regardless; the next startup scan repairs
            warn!(service = %service_key(svc), error = %e, "port release incomplete");
        }
    }

    if has_finalizer(svc) {
        let api: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
        let finalizers = without_finalizer(svc.metadata.finalizers.clone().unwrap_or_default());
        patch_finalizers(&api, name, finalizers).await?;
        info!(service = %service_key(svc), "removed finalizer");
    }

    Ok(Action::await_change())
}

/// Requeue with a short delay on reconciliation failure
pub fn error_policy(svc: Arc<Service>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        service = %service_key(&svc),
        error = %error,
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Run the reconciler until the process shuts down
pub async fn run(client: Client, manager: Arc<Manager>) {
    let services: Api<Service> = Api::all(client.clone());
    let ctx = Arc::new(Context { client, manager });

    info!("starting service controller");
    Controller::new(services, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(_) => {}
                Err(e) => debug!(error = ?e, "reconciliation error"),
            }
        })
        .await;
    info!("service controller stopped");
}

fn has_finalizer(svc: &Service) -> bool {
    svc.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

fn with_finalizer(mut finalizers: Vec<String>) -> Vec<String> {
    if !finalizers.iter().any(|s| s == FINALIZER) {
        finalizers.push(FINALIZER.to_string());
    }
    finalizers
}

fn without_finalizer(finalizers: Vec<String>) -> Vec<String> {
    finalizers.into_iter().filter(|s| s != FINALIZER).collect()
}

async fn patch_finalizers(api: &Api<Service>, name: &str, finalizers: Vec<String>) -> Result<()> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });

    match api
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(service = %name, "service gone before finalizer patch");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn service_with_finalizers(finalizers: Option<Vec<&str>>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("dev".to_string()),
                finalizers: finalizers
                    .map(|f| f.into_iter().map(String::from).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_has_finalizer() {
        assert!(!has_finalizer(&service_with_finalizers(None)));
        assert!(!has_finalizer(&service_with_finalizers(Some(vec![
            "other/finalizer"
        ]))));
        assert!(has_finalizer(&service_with_finalizers(Some(vec![
            FINALIZER
        ]))));
    }

    #[test]
    fn test_with_finalizer_appends_once() {
        let finalizers = with_finalizer(vec![]);
        assert_eq!(finalizers, vec![FINALIZER.to_string()]);

        // existing entries are preserved, ours is not duplicated
        let finalizers = with_finalizer(vec!["other".to_string(), FINALIZER.to_string()]);
        assert_eq!(finalizers.len(), 2);
        assert_eq!(finalizers[0], "other");
    }

    #[test]
    fn test_without_finalizer_removes_only_ours() {
        let finalizers = without_finalizer(vec![
            "other".to_string(),
            FINALIZER.to_string(),
            "another".to_string(),
        ]);
        assert_eq!(finalizers, vec!["other".to_string(), "another".to_string()]);

        assert!(without_finalizer(vec![FINALIZER.to_string()]).is_empty());
    }
}
