use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Connection, InterfaceProvider, InterfaceRequest, OperStatus, Provider};
use crate::{resources::AdminState, Error, Result};

/// A provider that keeps device configuration in memory.
///
/// Used as the `simulated` provider for dry runs, and by the reconciler tests.
/// Failures can be injected per operation.
#[derive(Debug)]
pub struct MemoryProvider {
    state: Mutex<State>,
    interfaces: bool,
}

#[derive(Debug, Default)]
struct State {
    /// Currently open connections, by address
    connected: HashSet<String>,
    /// Configured interfaces, by address and interface name
    devices: HashMap<String, BTreeMap<String, InterfaceRequest>>,
    /// Operational overrides, by address and interface name
    oper: HashMap<(String, String), OperStatus>,
    /// Error to return from the next call of an operation
    failures: HashMap<&'static str, String>,
    unreachable: HashSet<String>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self {
            state: Default::default(),
            interfaces: true,
        }
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that cannot configure interfaces
    pub fn without_interfaces() -> Self {
        Self {
            interfaces: false,
            ..Default::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self, op: &'static str) -> Result<()> {
        match self.state().failures.remove(op) {
            Some(msg) => Err(Error::provider(msg)),
            None => Ok(()),
        }
    }

    fn ensure_connected(&self, conn: &Connection) -> Result<()> {
        if self.state().connected.contains(&conn.address) {
            Ok(())
        } else {
            Err(Error::provider(format!("not connected to {}", conn.address)))
        }
    }

    /// Make the next call of `op` fail with `msg`
    pub fn fail_next(&self, op: &'static str, msg: impl Into<String>) {
        self.state().failures.insert(op, msg.into());
    }

    /// Refuse connections to `address` until called with `false`
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(address.into());
        } else {
            state.unreachable.remove(address);
        }
    }

    /// Override the operational status reported for an interface
    pub fn set_oper_status(&self, address: &str, name: &str, status: OperStatus) {
        self.state()
            .oper
            .insert((address.into(), name.into()), status);
    }

    /// The interface configuration last pushed to `address`
    pub fn interface(&self, address: &str, name: &str) -> Option<InterfaceRequest> {
        self.state()
            .devices
            .get(address)
            .and_then(|d| d.get(name))
            .cloned()
    }

    pub fn interface_count(&self, address: &str) -> usize {
        self.state().devices.get(address).map_or(0, BTreeMap::len)
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.state().connected.contains(address)
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn connect(&self, conn: &Connection) -> Result<()> {
        self.take_failure("connect")?;

        let mut state = self.state();
        if state.unreachable.contains(&conn.address) {
            return Err(Error::provider(format!("{} is unreachable", conn.address)));
        }
        state.connected.insert(conn.address.clone());
        debug!(address = %conn.address, "connected");

        Ok(())
    }

    async fn disconnect(&self, conn: &Connection) -> Result<()> {
        self.take_failure("disconnect")?;
        self.state().connected.remove(&conn.address);
        debug!(address = %conn.address, "disconnected");

        Ok(())
    }

    fn interfaces(&self) -> Option<&dyn InterfaceProvider> {
        self.interfaces.then_some(self as &dyn InterfaceProvider)
    }
}

#[async_trait]
impl InterfaceProvider for MemoryProvider {
    async fn ensure_interface(&self, conn: &Connection, req: &InterfaceRequest) -> Result<()> {
        self.ensure_connected(conn)?;
        self.take_failure("ensure_interface")?;

        info!(address = %conn.address, interface = %req.name, "applying interface configuration");
        self.state()
            .devices
            .entry(conn.address.clone())
            .or_default()
            .insert(req.name.clone(), req.clone());

        Ok(())
    }

    async fn delete_interface(&self, conn: &Connection, name: &str) -> Result<()> {
        self.ensure_connected(conn)?;
        self.take_failure("delete_interface")?;

        info!(address = %conn.address, interface = %name, "removing interface configuration");
        let mut state = self.state();
        if let Some(device) = state.devices.get_mut(&conn.address) {
            device.remove(name);
        }
        state.oper.remove(&(conn.address.clone(), name.to_string()));

        Ok(())
    }

    async fn get_interface_status(&self, conn: &Connection, name: &str) -> Result<OperStatus> {
        self.ensure_connected(conn)?;
        self.take_failure("get_interface_status")?;

        let state = self.state();
        let key = (conn.address.clone(), name.to_string());
        if let Some(status) = state.oper.get(&key) {
            return Ok(*status);
        }

        // Without an override an interface follows its admin state
        match state.devices.get(&conn.address).and_then(|d| d.get(name)) {
            Some(req) if req.admin_state == AdminState::Up => Ok(OperStatus::Up),
            _ => Ok(OperStatus::Down),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::InterfaceType;

    fn conn() -> Connection {
        Connection {
            address: "10.0.0.1:9339".into(),
            ..Default::default()
        }
    }

    fn request(name: &str) -> InterfaceRequest {
        InterfaceRequest {
            name: name.into(),
            type_: InterfaceType::Physical,
            admin_state: AdminState::Up,
            description: None,
            mtu: Some(9216),
            members: vec![],
        }
    }

    #[tokio::test]
    async fn ensure_requires_a_connection() {
        let provider = MemoryProvider::new();
        assert!(provider.ensure_interface(&conn(), &request("Ethernet1/1")).await.is_err());

        provider.connect(&conn()).await.unwrap();
        provider.ensure_interface(&conn(), &request("Ethernet1/1")).await.unwrap();
        assert_eq!(provider.interface_count(&conn().address), 1);
        assert_eq!(
            provider.get_interface_status(&conn(), "Ethernet1/1").await.unwrap(),
            OperStatus::Up
        );

        provider.disconnect(&conn()).await.unwrap();
        assert!(!provider.is_connected(&conn().address));
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let provider = MemoryProvider::new();
        provider.fail_next("connect", "timeout");

        let err = provider.connect(&conn()).await.unwrap_err();
        assert_eq!(err.to_string(), "provider error: timeout");
        assert!(!err.is_terminal());
        provider.connect(&conn()).await.unwrap();
    }

    #[tokio::test]
    async fn delete_forgets_interface() {
        let provider = MemoryProvider::new();
        provider.connect(&conn()).await.unwrap();
        provider.ensure_interface(&conn(), &request("Loopback0")).await.unwrap();
        provider.set_oper_status(&conn().address, "Loopback0", OperStatus::Down);

        provider.delete_interface(&conn(), "Loopback0").await.unwrap();
        assert!(provider.interface(&conn().address, "Loopback0").is_none());
        assert_eq!(
            provider.get_interface_status(&conn(), "Loopback0").await.unwrap(),
            OperStatus::Down
        );
    }
}
