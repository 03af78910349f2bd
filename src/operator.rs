use std::{fmt::Debug, sync::Arc};

use anyhow::bail;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::{
    api::ListParams,
    core::NamespaceResourceScope,
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as Finalizer},
        reflector::ObjectRef,
        watcher::Config,
        Controller,
    },
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{error, field, info, instrument, warn, Span};

use crate::{
    provider::Provider,
    reconcilers::{Backoff, Context, Reconcile},
    resources::{Device, Interface},
    store::{KubeStore, Store},
    telemetry, Error, Metrics, OperatorConfig, ResourceLocker, Result,
};

pub const FINALIZER: &str = "networking.netop.dev/finalizer";

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    /// Device locks held when the diagnostics were read
    pub held_device_locks: usize,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            held_device_locks: 0,
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Device locks shared by every controller
    locker: Arc<ResourceLocker>,
}

impl State {
    pub fn new(config: &OperatorConfig) -> Self {
        let locker = match config.stale_lock_after {
            Some(after) => ResourceLocker::with_stale_after(after),
            None => ResourceLocker::new(),
        };

        Self {
            diagnostics: Default::default(),
            registry: Default::default(),
            locker: Arc::new(locker),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        let mut diagnostics = self.diagnostics.read().await.clone();
        diagnostics.held_device_locks = self.locker.held();
        diagnostics
    }

    // Create a Controller Context that can update State
    pub(crate) fn to_context(
        &self,
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        config: OperatorConfig,
    ) -> anyhow::Result<Arc<Context>> {
        Ok(Arc::new(Context {
            store,
            provider,
            locker: self.locker.clone(),
            config,
            diagnostics: self.diagnostics.clone(),
            metrics: Metrics::new()?.register(&self.registry)?,
            backoff: Backoff::default(),
        }))
    }
}

/// What the controllers hand to each reconcile
struct ControllerContext {
    client: Client,
    context: Arc<Context>,
}

pub struct Operator {
    state: State,
    config: OperatorConfig,
    provider: Arc<dyn Provider>,
}

impl Operator {
    pub fn new(state: State, config: OperatorConfig, provider: Arc<dyn Provider>) -> Self {
        Self {
            state,
            config,
            provider,
        }
    }

    /// Initialize the controllers and shared state (given the crds are installed)
    pub async fn run(self) -> anyhow::Result<()> {
        // Get a k8s client for communicating with the cluster
        let client = Client::try_default().await?;

        let devices = Api::<Device>::all(client.clone());
        let interfaces = Api::<Interface>::all(client.clone());

        // Test that we can actually query for our CRDs (a.k.a. they are installed)
        for (kind, probe) in [
            ("Device", devices.list(&ListParams::default().limit(1)).await.err()),
            ("Interface", interfaces.list(&ListParams::default().limit(1)).await.err()),
        ] {
            if let Some(e) = probe {
                info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
                bail!("{kind} CRD is not queryable; {e:?}. Is the CRD installed?");
            }
        }

        info!(provider = %self.provider.name(), "starting controllers");
        let store = Arc::new(KubeStore::new(client.clone()));
        let context = Arc::new(ControllerContext {
            client: client.clone(),
            context: self.state.to_context(store, self.provider, self.config)?,
        });

        let watching_config = Config::default().page_size(50).any_semantic();

        let device_controller = Controller::new(devices.clone(), watching_config.clone())
            .shutdown_on_signal()
            .run(reconcile::<Device>, error_policy::<Device>, context.clone())
            .filter_map(|x| async move { Result::ok(x) })
            .for_each(|_| futures::future::ready(()));

        let controller = Controller::new(interfaces.clone(), watching_config.clone());
        let cache = controller.store();
        let by_device = cache.clone();
        let interface_controller = controller
            .shutdown_on_signal()
            .watches(devices, watching_config.clone(), move |device| {
                // Every interface configured on the device
                let namespace = device.namespace();
                let name = device.name_any();
                by_device
                    .state()
                    .into_iter()
                    .filter(|i| i.namespace() == namespace && i.spec.device_ref.name == name)
                    .map(|i| ObjectRef::from_obj(i.as_ref()))
                    .collect::<Vec<_>>()
            })
            .watches(interfaces, watching_config, move |member| {
                // Aggregates bundling the interface
                let namespace = member.namespace();
                let name = member.name_any();
                cache
                    .state()
                    .into_iter()
                    .filter(|i| i.namespace() == namespace && i.member_refs().any(|m| m == name))
                    .map(|i| ObjectRef::from_obj(i.as_ref()))
                    .collect::<Vec<_>>()
            })
            .run(reconcile::<Interface>, error_policy::<Interface>, context)
            .filter_map(|x| async move { Result::ok(x) })
            .for_each(|_| futures::future::ready(()));

        tokio::join!(device_controller, interface_controller);

        Ok(())
    }
}

fn object_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!(
        "{}/{}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Reconciler shared by all managed resources
#[instrument(skip(ctx, obj), fields(trace_id))]
async fn reconcile<K>(obj: Arc<K>, ctx: Arc<ControllerContext>) -> Result<Action>
where
    K: Reconcile + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    K: Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    // Add some tracing for debugging's sake
    let trace_id = telemetry::get_trace_id();

    // Take some metrics to see the average reconcile time
    Span::current().record("trace_id", &field::display(&trace_id));
    let context = ctx.context.clone();
    let _timer = context.metrics.count_and_measure(&K::kind(&()));
    context.diagnostics.write().await.last_event = Utc::now();

    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::illegal(K::kind(&()), &name, "missing namespace"))?;
    let key = object_key(obj.as_ref());

    let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);
    let action = finalizer(&api, FINALIZER, obj, |event| async {
        match event {
            Finalizer::Apply(o) => o.reconcile(context.clone()).await,
            Finalizer::Cleanup(o) => o.cleanup(context.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))?;

    context.backoff.reset(&key);
    Ok(action)
}

/// Error handler for failed reconciliations
fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<ControllerContext>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let context = &ctx.context;
    let config = &context.config;
    let key = object_key(obj.as_ref());

    if error.is_lock_contention() {
        info!(object = %key, "device busy, retrying");
        return Action::requeue(config.lock_requeue);
    }

    context.metrics.reconcile_failure(obj.as_ref(), error);
    if error.is_terminal() {
        warn!(object = %key, "reconcile failed permanently: {error}");
        return Action::await_change();
    }

    let delay = context
        .backoff
        .next(&key, config.error_backoff_base, config.error_backoff_max);
    error!(object = %key, retry_in = ?delay, "reconcile failed: {error:?}");
    Action::requeue(delay)
}
