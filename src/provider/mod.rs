//! Device provider abstraction.
//!
//! A provider knows how to push configuration to one family of devices. The
//! reconcilers only see the traits in this module: a base [`Provider`] for
//! connection handling, plus one capability trait per resource kind. A
//! provider advertises a capability by returning `Some` from the matching
//! accessor, and reconcilers look it up through [`require`] so a missing
//! capability becomes a `NotImplemented` condition instead of a crash.

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    conditions::reasons,
    resources::{AdminState, InterfaceType},
    Result, TerminalError,
};

mod memory;
pub use memory::MemoryProvider;

/// Connection parameters resolved from a Device and its credentials secret.
///
/// Opaque to the operator, only providers interpret it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Connection {
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Resource kinds a provider may be able to configure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    Interface,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interface => write!(f, "interface"),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, conn: &Connection) -> Result<()>;

    async fn disconnect(&self, conn: &Connection) -> Result<()>;

    fn interfaces(&self) -> Option<&dyn InterfaceProvider> {
        None
    }
}

/// Desired state of a single interface, as handed to a provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceRequest {
    pub name: String,
    pub type_: InterfaceType,
    pub admin_state: AdminState,
    pub description: Option<String>,
    pub mtu: Option<i32>,
    /// On-device names of aggregate members
    pub members: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperStatus {
    Up,
    Down,
}

#[async_trait]
pub trait InterfaceProvider: Send + Sync {
    async fn ensure_interface(&self, conn: &Connection, req: &InterfaceRequest) -> Result<()>;

    async fn delete_interface(&self, conn: &Connection, name: &str) -> Result<()>;

    async fn get_interface_status(&self, conn: &Connection, name: &str) -> Result<OperStatus>;
}

/// Look up a capability, turning its absence into a terminal error.
pub fn require<'a, T: ?Sized>(
    provider: &dyn Provider,
    capability: Capability,
    found: Option<&'a T>,
) -> Result<&'a T> {
    found.ok_or_else(|| {
        TerminalError::new(
            reasons::NOT_IMPLEMENTED,
            format!(
                "provider {} does not implement {capability} configuration",
                provider.name()
            ),
        )
        .into()
    })
}

/// Names accepted by [`by_name`]
pub const PROVIDERS: &[&str] = &["simulated"];

/// Instantiate a provider from the registry.
pub fn by_name(name: &str) -> Option<Arc<dyn Provider>> {
    match name {
        "simulated" => Some(Arc::new(MemoryProvider::new())),
        _ => None,
    }
}
