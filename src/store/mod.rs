//! Read and write access to the custom resources the reconcilers work on.
//!
//! Reconcilers go through [`Store`] rather than `kube::Api` directly so the
//! whole reconcile flow can run against an in-memory store in tests.

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    api::{ListParams, Patch, PatchParams},
    Api, Client, Resource as _, ResourceExt as _,
};
use serde_json::json;

use crate::{
    provider::Connection,
    resources::{Device, DeviceStatus, Interface, InterfaceStatus},
    Error, Result, MANAGER,
};

#[cfg(test)]
pub(crate) mod memory;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_device(&self, namespace: &str, name: &str) -> Result<Option<Device>>;

    async fn get_interface(&self, namespace: &str, name: &str) -> Result<Option<Interface>>;

    async fn list_interfaces(&self, namespace: &str) -> Result<Vec<Interface>>;

    /// Resolve the address and credentials of a device
    async fn connection(&self, device: &Device) -> Result<Connection>;

    /// Make `device` an owner of `interface` so it is garbage collected along with it
    async fn set_owner(&self, interface: &Interface, device: &Device) -> Result<()>;

    async fn patch_device_status(&self, device: &Device, status: &DeviceStatus) -> Result<()>;

    async fn patch_interface_status(
        &self,
        interface: &Interface,
        status: &InterfaceStatus,
    ) -> Result<()>;
}

/// [`Store`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn namespace_of<K: kube::Resource<DynamicType = ()>>(obj: &K) -> Result<String> {
    obj.namespace()
        .ok_or_else(|| Error::illegal(K::kind(&()), obj.name_any(), "missing namespace"))
}

/// `existing` plus `owner`, replacing an older reference to the same object
pub(crate) fn with_owner(existing: &[OwnerReference], owner: OwnerReference) -> Vec<OwnerReference> {
    let uid = owner.uid.clone();
    existing
        .iter()
        .filter(|o| o.uid != uid)
        .cloned()
        .chain(Some(owner))
        .collect()
}

/// Server-side apply patch owning only the status
fn apply_status<S: serde::Serialize>(kind: &str, status: &S) -> Result<Patch<serde_json::Value>> {
    let status = serde_json::to_value(status).map_err(Error::SerializationError)?;
    Ok(Patch::Apply(json!({
        "apiVersion": "networking.netop.dev/v1alpha1",
        "kind": kind,
        "status": status,
    })))
}

#[async_trait]
impl Store for KubeStore {
    async fn get_device(&self, namespace: &str, name: &str) -> Result<Option<Device>> {
        Api::<Device>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn get_interface(&self, namespace: &str, name: &str) -> Result<Option<Interface>> {
        Api::<Interface>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn list_interfaces(&self, namespace: &str) -> Result<Vec<Interface>> {
        let list = Api::<Interface>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;

        Ok(list.items)
    }

    async fn connection(&self, device: &Device) -> Result<Connection> {
        let name = device.name_any();
        let namespace = namespace_of(device)?;

        let mut conn = Connection {
            address: device.spec.endpoint.address.clone(),
            ..Default::default()
        };

        let Some(secret_ref) = device.spec.endpoint.secret_ref.as_ref() else {
            return Ok(conn);
        };
        let secret_name = secret_ref
            .name
            .as_ref()
            .ok_or_else(|| Error::illegal("Device", &name, "secretRef without name"))?;
        let secret_namespace = secret_ref.namespace.as_deref().unwrap_or(&namespace);

        let secret = Api::<Secret>::namespaced(self.client.clone(), secret_namespace)
            .get(secret_name)
            .await
            .map_err(Error::KubeError)?;
        let data = secret.data.unwrap_or_default();

        let field = |key: &str| -> Result<Option<String>> {
            data.get(key)
                .map(|v| {
                    String::from_utf8(v.0.clone()).map_err(|_| {
                        Error::illegal("Device", &name, format!("{key} in secret is not utf-8"))
                    })
                })
                .transpose()
        };
        conn.username = field("username")?;
        conn.password = field("password")?;

        Ok(conn)
    }

    async fn set_owner(&self, interface: &Interface, device: &Device) -> Result<()> {
        let owner = device
            .controller_owner_ref(&())
            .ok_or_else(|| Error::illegal("Device", device.name_any(), "missing uid"))?;

        // A merge patch replaces the whole list, the resource version guards the ones kept
        let patch = Patch::Merge(json!({
            "metadata": {
                "resourceVersion": interface.resource_version(),
                "ownerReferences": with_owner(interface.owner_references(), owner),
            }
        }));
        Api::<Interface>::namespaced(self.client.clone(), &namespace_of(interface)?)
            .patch(&interface.name_any(), &PatchParams::default(), &patch)
            .await
            .map_err(Error::KubeError)?;

        Ok(())
    }

    async fn patch_device_status(&self, device: &Device, status: &DeviceStatus) -> Result<()> {
        let new_status = apply_status("Device", status)?;
        let ps = PatchParams::apply(MANAGER).force();
        Api::<Device>::namespaced(self.client.clone(), &namespace_of(device)?)
            .patch_status(&device.name_any(), &ps, &new_status)
            .await
            .map_err(Error::KubeError)?;

        Ok(())
    }

    async fn patch_interface_status(
        &self,
        interface: &Interface,
        status: &InterfaceStatus,
    ) -> Result<()> {
        let new_status = apply_status("Interface", status)?;
        let ps = PatchParams::apply(MANAGER).force();
        Api::<Interface>::namespaced(self.client.clone(), &namespace_of(interface)?)
            .patch_status(&interface.name_any(), &ps, &new_status)
            .await
            .map_err(Error::KubeError)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(kind: &str, name: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "networking.netop.dev/v1alpha1".into(),
            kind: kind.into(),
            name: name.into(),
            uid: format!("uid-{name}"),
            controller: Some(controller),
            ..Default::default()
        }
    }

    #[test]
    fn owner_is_appended_to_existing_references() {
        let existing = vec![owner("Fabric", "dc-1", false)];
        let owners = with_owner(&existing, owner("Device", "leaf-1", true));

        assert_eq!(owners.len(), 2);
        assert_eq!(owners[0], existing[0]);
        assert_eq!(owners[1].name, "leaf-1");
    }

    #[test]
    fn owner_replaces_its_own_reference() {
        let existing = vec![owner("Device", "leaf-1", false), owner("Fabric", "dc-1", false)];
        let owners = with_owner(&existing, owner("Device", "leaf-1", true));

        assert_eq!(owners.len(), 2);
        assert_eq!(owners[0].name, "dc-1");
        assert_eq!(owners[1].controller, Some(true));
    }
}
