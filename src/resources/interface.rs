use std::fmt::Display;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::LocalReference;
use crate::{conditions::Condition, impl_conditioned};

/// Specification for an interface on a device
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "Interface",
    group = "networking.netop.dev",
    version = "v1alpha1",
    status = "InterfaceStatus",
    doc = "An interface configured on a device",
    namespaced,
    printcolumn = r#"{ "name": "device", "type": "string", "description": "owning device", "jsonPath": ".spec.deviceRef.name" }"#,
    printcolumn = r#"{ "name": "interface", "type": "string", "description": "name on the device", "jsonPath": ".spec.name" }"#,
    printcolumn = r#"{ "name": "type", "type": "string", "description": "interface type", "jsonPath": ".spec.type" }"#,
    printcolumn = r#"{ "name": "ready", "type": "string", "description": "interface readiness", "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceSpec {
    /// The device this interface lives on.
    pub device_ref: LocalReference,

    /// Name of the interface on the device, e.g. `Ethernet1/1`.
    pub name: String,

    #[serde(rename = "type")]
    pub type_: InterfaceType,

    #[serde(default)]
    pub admin_state: AdminState,

    pub description: Option<String>,

    /// Maximum transmission unit in bytes.
    pub mtu: Option<i32>,

    /// Members of an `Aggregate` interface. Ignored for other types.
    pub aggregation: Option<Aggregation>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum InterfaceType {
    #[default]
    Physical,
    Loopback,
    /// A port channel bundling physical members
    Aggregate,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum AdminState {
    #[default]
    Up,
    Down,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Aggregation {
    /// Interfaces bundled into this aggregate.
    ///
    /// Members must be `Physical`, on the same device, and not part of any
    /// other aggregate.
    pub member_interface_refs: Vec<LocalReference>,
}

/// The status of an interface
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl_conditioned!(Interface);

impl Interface {
    /// Names of the member Interface resources, empty unless this is an aggregate
    pub fn member_refs(&self) -> impl Iterator<Item = &str> {
        self.spec
            .aggregation
            .iter()
            .filter(|_| self.spec.type_ == InterfaceType::Aggregate)
            .flat_map(|a| a.member_interface_refs.iter())
            .map(|r| r.name.as_str())
    }
}

impl Display for InterfaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Physical => write!(f, "Physical"),
            Self::Loopback => write!(f, "Loopback"),
            Self::Aggregate => write!(f, "Aggregate"),
        }
    }
}
