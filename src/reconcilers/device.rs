use std::sync::Arc;

use async_trait::async_trait;
use kube::{runtime::controller::Action, ResourceExt as _};
use tracing::{info, warn};

use crate::{
    conditions::{self, reasons, Condition, ConditionStatus, OPERATIONAL, READY},
    resources::Device,
    Error, LockError, Result,
};

use super::{connected, device_key, holder, lock_device, Context, Reconcile};

const CONDITIONS: &[&str] = &[READY, OPERATIONAL];

#[async_trait]
impl Reconcile for Device {
    async fn reconcile(&self, context: Arc<Context>) -> Result<Action, Error> {
        let name = self.name_any();
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::illegal("Device", &name, "missing namespace"))?;

        info!("Reconciling device '{}/{}' at {}", namespace, name, self.spec.endpoint.address);

        let mut device = self.clone();
        if conditions::initialize(&mut device, CONDITIONS) {
            let status = device.status.clone().unwrap_or_default();
            context.store.patch_device_status(&device, &status).await?;
            return Ok(Action::await_change());
        }

        let _lock = match lock_device(&context, &device_key(&namespace, &name), &holder(self)) {
            Ok(lock) => lock,
            Err(LockError::AlreadyHeld { .. }) => {
                return Ok(Action::requeue(context.config.lock_requeue))
            }
            Err(e) => return Err(e.into()),
        };

        let result: Result<()> = async {
            let conn = &context.store.connection(self).await?;
            connected(context.provider.as_ref(), conn, || async { Ok(()) }).await
        }
        .await;

        let operational = match &result {
            Ok(()) => Condition::new(
                OPERATIONAL,
                ConditionStatus::True,
                reasons::REACHABLE,
                format!("connected to {}", self.spec.endpoint.address),
            ),
            Err(e) if e.is_terminal() => conditions::from_error(Some(e)).with_type(OPERATIONAL),
            Err(e) => Condition::new(
                OPERATIONAL,
                ConditionStatus::False,
                reasons::UNREACHABLE,
                e.to_string(),
            ),
        };

        let changed = conditions::set(&mut device, operational) | conditions::recompute_ready(&mut device);
        if changed {
            let status = device.status.clone().unwrap_or_default();
            context.store.patch_device_status(&device, &status).await?;
        }

        match result {
            Ok(()) => Ok(Action::requeue(context.config.resync)),
            Err(e) if e.is_terminal() => {
                warn!(device = %name, "{e}");
                Ok(Action::await_change())
            }
            Err(e) => Err(e),
        }
    }

    async fn cleanup(&self, _context: Arc<Context>) -> Result<Action, Error> {
        // Interfaces clean up after themselves, the device holds no configuration
        info!(device = %self.name_any(), "device deleted");
        Ok(Action::await_change())
    }
}
