use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use kube::{runtime::controller::Action, CustomResourceExt, Resource, ResourceExt};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    operator::Diagnostics,
    provider::{Connection, Provider},
    store::Store,
    DeviceLock, Error, LockError, Metrics, OperatorConfig, ResourceLocker,
};

mod backoff;
pub mod device;
pub mod interface;

pub use backoff::Backoff;

/// The context passed around
pub struct Context {
    /// Access to the custom resources
    pub store: Arc<dyn Store>,

    /// Provider used to talk to devices
    pub provider: Arc<dyn Provider>,

    /// Device locks shared by all controllers
    pub locker: Arc<ResourceLocker>,

    pub config: OperatorConfig,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub metrics: Metrics,

    /// Failure counts for transient errors
    pub backoff: Backoff,
}

/// A resource that can be reconciled by a controller
#[async_trait]
pub(crate) trait Reconcile
where
    Self: CustomResourceExt + ResourceExt,
{
    /// Attempt to reconcile a resource
    async fn reconcile(&self, context: Arc<Context>) -> Result<Action, Error>;

    /// Remove everything this resource configured, before it is deleted.
    async fn cleanup(&self, context: Arc<Context>) -> Result<Action, Error>;
}

/// Key of the device lock for a device
pub(crate) fn device_key(namespace: &str, device: &str) -> String {
    format!("{namespace}/{device}")
}

/// Lock holder for one reconcile of `obj`
pub(crate) fn holder<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!(
        "{}/{}/{}@{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any(),
        Uuid::new_v4().simple(),
    )
}

/// Claim a device, counting and logging contention.
pub(crate) fn lock_device(ctx: &Context, key: &str, holder: &str) -> Result<DeviceLock, LockError> {
    match ctx.locker.try_lock(key, holder) {
        Err(LockError::AlreadyHeld { key, holder }) => {
            info!(device = %key, %holder, "device is locked, deferring");
            ctx.metrics.lock_contention(&key);
            Err(LockError::AlreadyHeld { key, holder })
        }
        other => other,
    }
}

/// Run `op` against a connected device, disconnecting afterwards whatever `op` returned.
pub(crate) async fn connected<T, F, Fut>(
    provider: &dyn Provider,
    conn: &Connection,
    op: F,
) -> Result<T, Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    provider.connect(conn).await?;
    let result = op().await;

    if let Err(e) = provider.disconnect(conn).await {
        warn!(address = %conn.address, error = %e, "failed to disconnect");
    }

    result
}
