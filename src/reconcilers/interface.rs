use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::{runtime::controller::Action, ResourceExt as _};
use tracing::{info, warn};

use crate::{
    conditions::{
        self, reasons, Condition, ConditionStatus, CONFIGURED, OPERATIONAL, READY,
    },
    provider::{self, Capability, InterfaceRequest, OperStatus},
    resources::{AdminState, Device, Interface, InterfaceType},
    store::Store,
    Error, LockError, Result, TerminalError,
};

use super::{connected, device_key, holder, lock_device, Context, Reconcile};

const CONDITIONS: &[&str] = &[READY, CONFIGURED, OPERATIONAL];

/// How far a reconcile pass got
enum Progress {
    /// Someone else holds the device, nothing was touched
    Locked,
    /// A member interface is not configured yet
    Waiting(String),
    /// The interface was pushed, with the operational state read back
    Applied(Result<OperStatus>),
}

#[async_trait]
impl Reconcile for Interface {
    async fn reconcile(&self, context: Arc<Context>) -> Result<Action, Error> {
        let name = self.name_any();
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::illegal("Interface", &name, "missing namespace"))?;

        info!(
            "Reconciling interface '{}/{}' ({}) of device '{}'",
            namespace, name, self.spec.name, self.spec.device_ref.name,
        );

        // New resources get their conditions persisted first, the work happens next pass
        let mut interface = self.clone();
        if conditions::initialize(&mut interface, CONDITIONS) {
            let status = interface.status.clone().unwrap_or_default();
            context
                .store
                .patch_interface_status(&interface, &status)
                .await?;
            return Ok(Action::await_change());
        }

        let config = &context.config;
        let (outcome, changed) = match self.configure(&context, &namespace).await {
            Ok(Progress::Locked) => return Ok(Action::requeue(config.lock_requeue)),

            Ok(Progress::Waiting(message)) => {
                let waiting = Condition::new(
                    CONFIGURED,
                    ConditionStatus::False,
                    reasons::WAITING_FOR_DEPENDENCIES,
                    message,
                );
                let changed = conditions::set(&mut interface, waiting);
                (Ok(Action::requeue(config.dependency_requeue)), changed)
            }

            Ok(Progress::Applied(oper)) => {
                let mut changed = conditions::set(&mut interface, conditions::from_error(None));
                match oper {
                    Ok(oper) => {
                        changed |= conditions::set(&mut interface, self.operational(oper));
                        (Ok(Action::requeue(config.resync)), changed)
                    }
                    Err(e) => {
                        let unknown = Condition::new(
                            OPERATIONAL,
                            ConditionStatus::Unknown,
                            reasons::ERROR,
                            e.to_string(),
                        );
                        changed |= conditions::set(&mut interface, unknown);
                        (Err(e), changed)
                    }
                }
            }

            // Conditions of earlier steps are left as they were
            Err(e) => {
                let changed = conditions::set(&mut interface, conditions::from_error(Some(&e)));
                if e.is_terminal() {
                    warn!(interface = %name, "{e}");
                    (Ok(Action::await_change()), changed)
                } else {
                    (Err(e), changed)
                }
            }
        };

        let changed = conditions::recompute_ready(&mut interface) | changed;
        if changed {
            let status = interface.status.clone().unwrap_or_default();
            context
                .store
                .patch_interface_status(&interface, &status)
                .await?;
        }

        outcome
    }

    async fn cleanup(&self, context: Arc<Context>) -> Result<Action, Error> {
        let name = self.name_any();
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::illegal("Interface", &name, "missing namespace"))?;

        // Without the capability nothing can have been configured
        let Some(provider) = context.provider.interfaces() else {
            return Ok(Action::await_change());
        };

        let device_name = &self.spec.device_ref.name;
        let Some(device) = context.store.get_device(&namespace, device_name).await? else {
            info!(interface = %name, device = %device_name, "device is gone, nothing to clean up");
            return Ok(Action::await_change());
        };

        // Contention has to fail the cleanup so the finalizer stays in place
        let _lock = lock_device(&context, &device_key(&namespace, device_name), &holder(self))?;

        info!(interface = %name, device = %device_name, "removing interface '{}'", self.spec.name);
        let conn = &context.store.connection(&device).await?;
        connected(context.provider.as_ref(), conn, || {
            provider.delete_interface(conn, &self.spec.name)
        })
        .await?;

        Ok(Action::await_change())
    }
}

impl Interface {
    async fn configure(&self, context: &Context, namespace: &str) -> Result<Progress> {
        let provider = provider::require(
            context.provider.as_ref(),
            Capability::Interface,
            context.provider.interfaces(),
        )?;

        let device_name = &self.spec.device_ref.name;
        let device = context
            .store
            .get_device(namespace, device_name)
            .await?
            .ok_or_else(|| {
                TerminalError::new(
                    reasons::DEVICE_NOT_FOUND,
                    format!("device {device_name} not found"),
                )
            })?;

        if !self.is_owned_by(&device) {
            context.store.set_owner(self, &device).await?;
        }

        let _lock = match lock_device(context, &device_key(namespace, device_name), &holder(self)) {
            Ok(lock) => lock,
            Err(LockError::AlreadyHeld { .. }) => return Ok(Progress::Locked),
            Err(e) => return Err(e.into()),
        };

        let members = self.resolve_members(context.store.as_ref(), namespace).await?;
        if let Some(pending) = members.iter().find(|m| !conditions::is_configured(*m)) {
            return Ok(Progress::Waiting(format!(
                "member interface {} is not configured yet",
                pending.name_any()
            )));
        }

        let request = &self.request(&members);
        let conn = &context.store.connection(&device).await?;
        let oper = connected(context.provider.as_ref(), conn, || async move {
            provider.ensure_interface(conn, request).await?;
            Ok::<_, Error>(provider.get_interface_status(conn, &request.name).await)
        })
        .await?;

        Ok(Progress::Applied(oper))
    }

    fn is_owned_by(&self, device: &Device) -> bool {
        let uid = device.uid();
        self.owner_references()
            .iter()
            .any(|o| Some(&o.uid) == uid.as_ref())
    }

    /// Fetch the members of an aggregate and check they may be bundled.
    async fn resolve_members(&self, store: &dyn Store, namespace: &str) -> Result<Vec<Interface>> {
        // Listing a member twice bundles it once
        let mut refs: Vec<&str> = Vec::new();
        for member_ref in self.member_refs() {
            if !refs.contains(&member_ref) {
                refs.push(member_ref);
            }
        }
        if refs.is_empty() {
            return Ok(vec![]);
        }

        let others = store.list_interfaces(namespace).await?;
        let mut members = Vec::with_capacity(refs.len());
        for member_name in refs {
            let member = store
                .get_interface(namespace, member_name)
                .await?
                .ok_or_else(|| {
                    TerminalError::new(
                        reasons::INTERFACE_NOT_FOUND,
                        format!("member interface {member_name} not found"),
                    )
                })?;

            if member.spec.device_ref != self.spec.device_ref {
                return Err(TerminalError::new(
                    reasons::CROSS_DEVICE_REFERENCE,
                    format!(
                        "member interface {member_name} belongs to device {}, not {}",
                        member.spec.device_ref.name, self.spec.device_ref.name
                    ),
                )
                .into());
            }

            if member.spec.type_ != InterfaceType::Physical {
                return Err(TerminalError::new(
                    reasons::INVALID_INTERFACE_TYPE,
                    format!(
                        "member interface {member_name} is {}, only Physical interfaces can be aggregated",
                        member.spec.type_
                    ),
                )
                .into());
            }

            // The oldest aggregate on the same device claiming a member keeps it
            if let Some(owner) = others.iter().find(|other| {
                other.name_any() != self.name_any()
                    && other.spec.device_ref == self.spec.device_ref
                    && other.member_refs().any(|m| m == member_name)
                    && claim_order(other) < claim_order(self)
            }) {
                return Err(TerminalError::new(
                    reasons::MEMBER_INTERFACE_ALREADY_IN_USE,
                    format!(
                        "member interface {member_name} is already part of {}",
                        owner.name_any()
                    ),
                )
                .into());
            }

            members.push(member);
        }

        Ok(members)
    }

    fn request(&self, members: &[Interface]) -> InterfaceRequest {
        InterfaceRequest {
            name: self.spec.name.clone(),
            type_: self.spec.type_,
            admin_state: self.spec.admin_state,
            description: self.spec.description.clone(),
            mtu: self.spec.mtu,
            members: members.iter().map(|m| m.spec.name.clone()).collect(),
        }
    }

    /// Compare what the device reports with what was asked for
    fn operational(&self, oper: OperStatus) -> Condition {
        let (status, reason, message) = match (self.spec.admin_state, oper) {
            (AdminState::Up, OperStatus::Up) => {
                (ConditionStatus::True, reasons::OPER_UP, "interface is up")
            }
            (AdminState::Up, OperStatus::Down) => {
                (ConditionStatus::False, reasons::OPER_DOWN, "interface is down")
            }
            (AdminState::Down, OperStatus::Down) => (
                ConditionStatus::True,
                reasons::ADMIN_DOWN,
                "interface is administratively down",
            ),
            (AdminState::Down, OperStatus::Up) => (
                ConditionStatus::False,
                reasons::OPER_UP,
                "interface is up although administratively down",
            ),
        };

        Condition::new(OPERATIONAL, status, reason, message)
    }
}

fn claim_order(interface: &Interface) -> (Option<DateTime<Utc>>, String) {
    (
        interface.creation_timestamp().map(|t| t.0),
        interface.name_any(),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use super::*;
    use crate::{
        conditions::get,
        provider::MemoryProvider,
        reconcilers::fixtures::{aggregate, device, interface, Harness, NS},
    };

    /// Store the interface and run reconciles until past condition initialization
    async fn reconcile(h: &Harness, name: &str) -> Result<Action> {
        let current = h.store.interface(NS, name);
        current.reconcile(h.ctx.clone()).await
    }

    async fn initialized(h: &Harness, iface: Interface) {
        let name = iface.name_any();
        h.store.put_interface(iface);
        let action = reconcile(h, &name).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    fn condition(h: &Harness, name: &str, type_: &str) -> Condition {
        get(&h.store.interface(NS, name), type_).unwrap().clone()
    }

    #[tokio::test]
    async fn first_pass_only_initializes() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        initialized(&h, interface("eth1", "leaf-1", InterfaceType::Physical)).await;

        let stored = h.store.interface(NS, "eth1");
        assert_eq!(stored.status.unwrap().conditions.len(), 3);
        for type_ in CONDITIONS {
            assert_eq!(condition(&h, "eth1", type_).status, ConditionStatus::Unknown);
        }
        assert_eq!(h.provider.interface_count("leaf-1.mgmt:9339"), 0);
    }

    #[tokio::test]
    async fn configures_physical_interface() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        let mut eth1 = interface("eth1", "leaf-1", InterfaceType::Physical);
        eth1.spec.mtu = Some(9216);
        initialized(&h, eth1).await;

        let action = reconcile(&h, "eth1").await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.config.resync));

        let pushed = h.provider.interface("leaf-1.mgmt:9339", "eth1").unwrap();
        assert_eq!(pushed.mtu, Some(9216));
        assert!(!h.provider.is_connected("leaf-1.mgmt:9339"));

        assert!(conditions::is_configured(&h.store.interface(NS, "eth1")));
        assert_eq!(condition(&h, "eth1", OPERATIONAL).reason, reasons::OPER_UP);
        assert!(condition(&h, "eth1", READY).is_true());

        // Owned by the device, and the lock is free again
        let stored = h.store.interface(NS, "eth1");
        assert_eq!(stored.owner_references()[0].uid, "uid-leaf-1");
        assert_eq!(h.locker.held(), 0);
    }

    #[tokio::test]
    async fn existing_owners_are_kept() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        let mut eth1 = interface("eth1", "leaf-1", InterfaceType::Physical);
        eth1.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "fabric.netop.dev/v1".into(),
            kind: "Fabric".into(),
            name: "dc-1".into(),
            uid: "uid-dc-1".into(),
            ..Default::default()
        }]);
        initialized(&h, eth1).await;

        reconcile(&h, "eth1").await.unwrap();
        reconcile(&h, "eth1").await.unwrap();

        let uids: Vec<_> = h
            .store
            .interface(NS, "eth1")
            .owner_references()
            .iter()
            .map(|o| o.uid.clone())
            .collect();
        assert_eq!(uids, vec!["uid-dc-1".to_string(), "uid-leaf-1".to_string()]);
    }

    #[tokio::test]
    async fn steady_state_does_not_write_status() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        initialized(&h, interface("lo0", "leaf-1", InterfaceType::Loopback)).await;

        reconcile(&h, "lo0").await.unwrap();
        let writes = h.store.status_writes();
        let since = condition(&h, "lo0", READY).last_transition_time;

        reconcile(&h, "lo0").await.unwrap();
        assert_eq!(h.store.status_writes(), writes);
        assert_eq!(condition(&h, "lo0", READY).last_transition_time, since);
    }

    #[tokio::test]
    async fn admin_down_is_operational() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        let mut eth2 = interface("eth2", "leaf-1", InterfaceType::Physical);
        eth2.spec.admin_state = AdminState::Down;
        initialized(&h, eth2).await;

        reconcile(&h, "eth2").await.unwrap();
        assert_eq!(condition(&h, "eth2", OPERATIONAL).reason, reasons::ADMIN_DOWN);
        assert!(condition(&h, "eth2", READY).is_true());
    }

    #[tokio::test]
    async fn oper_down_makes_ready_false() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        h.provider
            .set_oper_status("leaf-1.mgmt:9339", "eth3", OperStatus::Down);
        initialized(&h, interface("eth3", "leaf-1", InterfaceType::Physical)).await;

        reconcile(&h, "eth3").await.unwrap();
        assert!(conditions::is_configured(&h.store.interface(NS, "eth3")));
        let ready = condition(&h, "eth3", READY);
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, reasons::OPER_DOWN);
    }

    #[tokio::test]
    async fn missing_capability_is_not_retried() {
        let h = Harness::with_provider(MemoryProvider::without_interfaces());
        h.store.put_device(device("leaf-1"));
        initialized(&h, interface("eth1", "leaf-1", InterfaceType::Physical)).await;

        let action = reconcile(&h, "eth1").await.unwrap();
        assert_eq!(action, Action::await_change());

        let configured = condition(&h, "eth1", CONFIGURED);
        assert_eq!(configured.status, ConditionStatus::False);
        assert_eq!(configured.reason, reasons::NOT_IMPLEMENTED);
        assert_eq!(condition(&h, "eth1", READY).reason, reasons::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn missing_device_is_terminal() {
        let h = Harness::new();
        initialized(&h, interface("eth1", "leaf-9", InterfaceType::Physical)).await;

        let action = reconcile(&h, "eth1").await.unwrap();
        assert_eq!(action, Action::await_change());
        let configured = condition(&h, "eth1", CONFIGURED);
        assert_eq!(configured.reason, reasons::DEVICE_NOT_FOUND);
        assert_eq!(configured.message, "device leaf-9 not found");
    }

    #[tokio::test]
    async fn locked_device_requeues_without_touching_status() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        initialized(&h, interface("eth1", "leaf-1", InterfaceType::Physical)).await;

        h.locker.acquire("default/leaf-1", "Bgp/default/peer-1").unwrap();
        let writes = h.store.status_writes();

        let action = reconcile(&h, "eth1").await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert_eq!(h.store.status_writes(), writes);
        assert_eq!(h.provider.interface_count("leaf-1.mgmt:9339"), 0);
        assert_eq!(
            h.locker.holder("default/leaf-1").as_deref(),
            Some("Bgp/default/peer-1")
        );

        h.locker.release("default/leaf-1", "Bgp/default/peer-1").unwrap();
        reconcile(&h, "eth1").await.unwrap();
        assert!(conditions::is_configured(&h.store.interface(NS, "eth1")));
    }

    #[tokio::test]
    async fn transient_failure_is_reported_and_retried() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        initialized(&h, interface("eth1", "leaf-1", InterfaceType::Physical)).await;

        h.provider.fail_next("ensure_interface", "gnmi set timed out");
        let err = reconcile(&h, "eth1").await.unwrap_err();
        assert!(!err.is_terminal());

        let configured = condition(&h, "eth1", CONFIGURED);
        assert_eq!(configured.status, ConditionStatus::False);
        assert_eq!(configured.reason, reasons::ERROR);
        assert_eq!(configured.message, "provider error: gnmi set timed out");
        // Operational was never evaluated
        assert_eq!(condition(&h, "eth1", OPERATIONAL).status, ConditionStatus::Unknown);
        assert!(!h.provider.is_connected("leaf-1.mgmt:9339"));
        assert_eq!(h.locker.held(), 0);

        reconcile(&h, "eth1").await.unwrap();
        assert!(condition(&h, "eth1", READY).is_true());
    }

    #[tokio::test]
    async fn unreachable_device_is_transient() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        initialized(&h, interface("eth1", "leaf-1", InterfaceType::Physical)).await;

        h.provider.set_unreachable("leaf-1.mgmt:9339", true);
        assert!(reconcile(&h, "eth1").await.is_err());
        assert_eq!(condition(&h, "eth1", CONFIGURED).reason, reasons::ERROR);
        assert_eq!(h.locker.held(), 0);
    }

    #[tokio::test]
    async fn status_read_failure_keeps_configured() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        initialized(&h, interface("eth1", "leaf-1", InterfaceType::Physical)).await;

        h.provider.fail_next("get_interface_status", "stream closed");
        assert!(reconcile(&h, "eth1").await.is_err());
        assert!(condition(&h, "eth1", CONFIGURED).is_true());
        let operational = condition(&h, "eth1", OPERATIONAL);
        assert_eq!(operational.status, ConditionStatus::Unknown);
        assert_eq!(operational.reason, reasons::ERROR);
        assert_eq!(condition(&h, "eth1", READY).status, ConditionStatus::Unknown);
    }

    /// Bring members to Configured
    async fn configured_members(h: &Harness, members: &[Interface]) {
        for member in members {
            let name = member.name_any();
            initialized(h, member.clone()).await;
            reconcile(h, &name).await.unwrap();
            assert!(conditions::is_configured(&h.store.interface(NS, &name)));
        }
    }

    #[tokio::test]
    async fn aggregate_bundles_members() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        configured_members(
            &h,
            &[
                interface("eth1", "leaf-1", InterfaceType::Physical),
                interface("eth2", "leaf-1", InterfaceType::Physical),
            ],
        )
        .await;
        initialized(&h, aggregate("po1", "leaf-1", &["eth1", "eth2"])).await;

        reconcile(&h, "po1").await.unwrap();
        let pushed = h.provider.interface("leaf-1.mgmt:9339", "po1").unwrap();
        assert_eq!(pushed.type_, InterfaceType::Aggregate);
        assert_eq!(pushed.members, vec!["eth1".to_string(), "eth2".to_string()]);
        assert!(condition(&h, "po1", READY).is_true());
    }

    #[tokio::test]
    async fn aggregate_waits_for_members() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        // Stored, but never reconciled
        h.store
            .put_interface(interface("eth1", "leaf-1", InterfaceType::Physical));
        initialized(&h, aggregate("po1", "leaf-1", &["eth1"])).await;

        let action = reconcile(&h, "po1").await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.config.dependency_requeue));

        let configured = condition(&h, "po1", CONFIGURED);
        assert_eq!(configured.status, ConditionStatus::False);
        assert_eq!(configured.reason, reasons::WAITING_FOR_DEPENDENCIES);
        assert!(h.provider.interface("leaf-1.mgmt:9339", "po1").is_none());
        assert_eq!(h.locker.held(), 0);

        // Once the member is configured the aggregate proceeds
        initialized(&h, interface("eth1", "leaf-1", InterfaceType::Physical)).await;
        reconcile(&h, "eth1").await.unwrap();
        reconcile(&h, "po1").await.unwrap();
        assert!(conditions::is_configured(&h.store.interface(NS, "po1")));
    }

    #[tokio::test]
    async fn aggregate_rejects_missing_member() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        initialized(&h, aggregate("po1", "leaf-1", &["eth7"])).await;

        assert_eq!(reconcile(&h, "po1").await.unwrap(), Action::await_change());
        let configured = condition(&h, "po1", CONFIGURED);
        assert_eq!(configured.reason, reasons::INTERFACE_NOT_FOUND);
        assert_eq!(configured.message, "member interface eth7 not found");
    }

    #[tokio::test]
    async fn aggregate_rejects_cross_device_member() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        h.store.put_device(device("leaf-2"));
        configured_members(&h, &[interface("eth1", "leaf-2", InterfaceType::Physical)]).await;
        initialized(&h, aggregate("po1", "leaf-1", &["eth1"])).await;

        assert_eq!(reconcile(&h, "po1").await.unwrap(), Action::await_change());
        let configured = condition(&h, "po1", CONFIGURED);
        assert_eq!(configured.reason, reasons::CROSS_DEVICE_REFERENCE);
        assert_eq!(
            configured.message,
            "member interface eth1 belongs to device leaf-2, not leaf-1"
        );
        assert!(h.provider.interface("leaf-1.mgmt:9339", "po1").is_none());
    }

    #[tokio::test]
    async fn aggregate_rejects_non_physical_member() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        configured_members(&h, &[interface("lo0", "leaf-1", InterfaceType::Loopback)]).await;
        initialized(&h, aggregate("po1", "leaf-1", &["lo0"])).await;

        reconcile(&h, "po1").await.unwrap();
        assert_eq!(
            condition(&h, "po1", CONFIGURED).reason,
            reasons::INVALID_INTERFACE_TYPE
        );
    }

    #[tokio::test]
    async fn member_can_only_join_one_aggregate() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        configured_members(&h, &[interface("eth1", "leaf-1", InterfaceType::Physical)]).await;
        initialized(&h, aggregate("po1", "leaf-1", &["eth1"])).await;
        initialized(&h, aggregate("po2", "leaf-1", &["eth1"])).await;

        reconcile(&h, "po1").await.unwrap();
        reconcile(&h, "po2").await.unwrap();

        assert!(conditions::is_configured(&h.store.interface(NS, "po1")));
        let configured = condition(&h, "po2", CONFIGURED);
        assert_eq!(configured.reason, reasons::MEMBER_INTERFACE_ALREADY_IN_USE);
        assert_eq!(configured.message, "member interface eth1 is already part of po1");
    }

    #[tokio::test]
    async fn claims_from_other_devices_do_not_count() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        h.store.put_device(device("leaf-2"));
        configured_members(&h, &[interface("eth1", "leaf-1", InterfaceType::Physical)]).await;
        // Older by name, but on the wrong device
        initialized(&h, aggregate("po0", "leaf-2", &["eth1"])).await;
        initialized(&h, aggregate("po1", "leaf-1", &["eth1"])).await;

        reconcile(&h, "po0").await.unwrap();
        reconcile(&h, "po1").await.unwrap();

        assert_eq!(
            condition(&h, "po0", CONFIGURED).reason,
            reasons::CROSS_DEVICE_REFERENCE
        );
        assert!(conditions::is_configured(&h.store.interface(NS, "po1")));
        let pushed = h.provider.interface("leaf-1.mgmt:9339", "po1").unwrap();
        assert_eq!(pushed.members, vec!["eth1".to_string()]);
    }

    #[tokio::test]
    async fn repeated_member_is_bundled_once() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        configured_members(
            &h,
            &[
                interface("eth1", "leaf-1", InterfaceType::Physical),
                interface("eth2", "leaf-1", InterfaceType::Physical),
            ],
        )
        .await;
        initialized(&h, aggregate("po1", "leaf-1", &["eth1", "eth2", "eth1"])).await;

        reconcile(&h, "po1").await.unwrap();
        let pushed = h.provider.interface("leaf-1.mgmt:9339", "po1").unwrap();
        assert_eq!(pushed.members, vec!["eth1".to_string(), "eth2".to_string()]);
        assert!(condition(&h, "po1", READY).is_true());
    }

    #[tokio::test]
    async fn validation_failure_keeps_operational() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        configured_members(&h, &[interface("eth1", "leaf-1", InterfaceType::Physical)]).await;
        initialized(&h, aggregate("po1", "leaf-1", &["eth1"])).await;
        reconcile(&h, "po1").await.unwrap();
        let operational = condition(&h, "po1", OPERATIONAL);
        assert!(operational.is_true());

        // Point the aggregate at a member that does not exist
        let mut po1 = h.store.interface(NS, "po1");
        po1.spec.aggregation.as_mut().unwrap().member_interface_refs = vec!["eth9".into()];
        h.store.put_interface(po1);
        reconcile(&h, "po1").await.unwrap();

        assert_eq!(condition(&h, "po1", CONFIGURED).reason, reasons::INTERFACE_NOT_FOUND);
        assert_eq!(condition(&h, "po1", OPERATIONAL), operational);
        assert_eq!(condition(&h, "po1", READY).status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn cleanup_removes_interface_from_device() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        initialized(&h, interface("eth1", "leaf-1", InterfaceType::Physical)).await;
        reconcile(&h, "eth1").await.unwrap();
        assert_eq!(h.provider.interface_count("leaf-1.mgmt:9339"), 1);

        let eth1 = h.store.interface(NS, "eth1");
        assert_eq!(eth1.cleanup(h.ctx.clone()).await.unwrap(), Action::await_change());
        assert_eq!(h.provider.interface_count("leaf-1.mgmt:9339"), 0);
        assert_eq!(h.locker.held(), 0);
    }

    #[tokio::test]
    async fn cleanup_fails_while_device_is_locked() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        initialized(&h, interface("eth1", "leaf-1", InterfaceType::Physical)).await;
        reconcile(&h, "eth1").await.unwrap();

        h.locker.acquire("default/leaf-1", "Device/default/leaf-1@1").unwrap();
        let err = h
            .store
            .interface(NS, "eth1")
            .cleanup(h.ctx.clone())
            .await
            .unwrap_err();
        assert!(err.is_lock_contention());
        assert_eq!(h.provider.interface_count("leaf-1.mgmt:9339"), 1);
    }

    #[tokio::test]
    async fn cleanup_without_device_is_a_noop() {
        let h = Harness::new();
        h.store.put_device(device("leaf-1"));
        initialized(&h, interface("eth1", "leaf-1", InterfaceType::Physical)).await;
        h.store.remove_device(NS, "leaf-1");

        let eth1 = h.store.interface(NS, "eth1");
        assert_eq!(eth1.cleanup(h.ctx.clone()).await.unwrap(), Action::await_change());
    }
}
