use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod device;
mod interface;

pub use device::*;
pub use interface::*;

/// Reference to an object in the same namespace
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalReference {
    /// The name of the resource
    pub name: String,
}

impl From<&str> for LocalReference {
    fn from(name: &str) -> Self {
        Self { name: name.into() }
    }
}
