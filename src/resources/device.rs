use k8s_openapi::api::core::v1::SecretReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{conditions::Condition, impl_conditioned};

/// Specification for a managed network device
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "Device",
    group = "networking.netop.dev",
    version = "v1alpha1",
    status = "DeviceStatus",
    doc = "A network switch configured through a provider",
    namespaced,
    printcolumn = r#"{ "name": "address", "type": "string", "description": "management address", "jsonPath": ".spec.endpoint.address" }"#,
    printcolumn = r#"{ "name": "ready", "type": "string", "description": "device readiness", "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    /// How to reach the device.
    pub endpoint: Endpoint,
}

/// Management endpoint of a device
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Address of the management interface, e.g. `10.0.0.1:9339`.
    pub address: String,

    /// Secret holding `username` and `password` for the device.
    ///
    /// The namespace defaults to the namespace of the device.
    pub secret_ref: Option<SecretReference>,
}

/// The status of a device
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Latest observations of the device.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl_conditioned!(Device);
