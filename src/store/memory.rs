use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use kube::{Resource as _, ResourceExt as _};

use super::Store;
use crate::{
    provider::Connection,
    resources::{Device, DeviceStatus, Interface, InterfaceStatus},
    Error, Result,
};

/// In-memory [`Store`] for reconciler tests
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    devices: BTreeMap<(String, String), Device>,
    interfaces: BTreeMap<(String, String), Interface>,
    status_writes: usize,
}

fn key<K: kube::Resource>(obj: &K) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

impl MemoryStore {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_device(&self, device: Device) {
        self.inner().devices.insert(key(&device), device);
    }

    pub fn put_interface(&self, interface: Interface) {
        self.inner().interfaces.insert(key(&interface), interface);
    }

    pub fn remove_device(&self, namespace: &str, name: &str) {
        self.inner()
            .devices
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn device(&self, namespace: &str, name: &str) -> Device {
        self.inner().devices[&(namespace.to_string(), name.to_string())].clone()
    }

    pub fn interface(&self, namespace: &str, name: &str) -> Interface {
        self.inner().interfaces[&(namespace.to_string(), name.to_string())].clone()
    }

    pub fn status_writes(&self) -> usize {
        self.inner().status_writes
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_device(&self, namespace: &str, name: &str) -> Result<Option<Device>> {
        Ok(self
            .inner()
            .devices
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_interface(&self, namespace: &str, name: &str) -> Result<Option<Interface>> {
        Ok(self
            .inner()
            .interfaces
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_interfaces(&self, namespace: &str) -> Result<Vec<Interface>> {
        Ok(self
            .inner()
            .interfaces
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, i)| i.clone())
            .collect())
    }

    async fn connection(&self, device: &Device) -> Result<Connection> {
        Ok(Connection {
            address: device.spec.endpoint.address.clone(),
            username: Some("admin".into()),
            password: Some("admin".into()),
        })
    }

    async fn set_owner(&self, interface: &Interface, device: &Device) -> Result<()> {
        let owner = device
            .controller_owner_ref(&())
            .ok_or_else(|| Error::illegal("Device", device.name_any(), "missing uid"))?;

        let mut inner = self.inner();
        let stored = inner
            .interfaces
            .get_mut(&key(interface))
            .ok_or_else(|| Error::illegal("Interface", interface.name_any(), "not stored"))?;
        stored.metadata.owner_references = Some(super::with_owner(stored.owner_references(), owner));

        Ok(())
    }

    async fn patch_device_status(&self, device: &Device, status: &DeviceStatus) -> Result<()> {
        let mut inner = self.inner();
        inner.status_writes += 1;
        let stored = inner
            .devices
            .get_mut(&key(device))
            .ok_or_else(|| Error::illegal("Device", device.name_any(), "not stored"))?;
        stored.status = Some(status.clone());

        Ok(())
    }

    async fn patch_interface_status(
        &self,
        interface: &Interface,
        status: &InterfaceStatus,
    ) -> Result<()> {
        let mut inner = self.inner();
        inner.status_writes += 1;
        let stored = inner
            .interfaces
            .get_mut(&key(interface))
            .ok_or_else(|| Error::illegal("Interface", interface.name_any(), "not stored"))?;
        stored.status = Some(status.clone());

        Ok(())
    }
}
