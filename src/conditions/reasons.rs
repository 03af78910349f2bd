//! Reasons carried by status conditions.
//!
//! Reasons are CamelCase machine-readable tokens explaining why a condition
//! has its current status. Messages carry the human-readable detail.

// ============================================================================
// Common
// ============================================================================

/// Condition was just added and nothing has been evaluated yet.
pub const RECONCILE_PENDING: &str = "ReconcilePending";

/// The desired state has been pushed to the device.
pub const READY: &str = "Ready";

/// Generic transient failure, the reconcile will be retried with backoff.
pub const ERROR: &str = "Error";

/// A referenced resource exists but is not Configured yet.
pub const WAITING_FOR_DEPENDENCIES: &str = "WaitingForDependencies";

/// The loaded provider lacks the capability needed for this resource kind.
pub const NOT_IMPLEMENTED: &str = "NotImplemented";

// ============================================================================
// Reference validation
// ============================================================================

/// The referenced Device does not exist.
pub const DEVICE_NOT_FOUND: &str = "DeviceNotFound";

/// A referenced Interface does not exist.
pub const INTERFACE_NOT_FOUND: &str = "InterfaceNotFound";

/// A referenced resource belongs to a different device.
pub const CROSS_DEVICE_REFERENCE: &str = "CrossDeviceReference";

/// A referenced resource has the wrong type for its role.
pub const INVALID_INTERFACE_TYPE: &str = "InvalidInterfaceType";

/// A member interface is already part of another aggregate.
pub const MEMBER_INTERFACE_ALREADY_IN_USE: &str = "MemberInterfaceAlreadyInUse";

// ============================================================================
// Operational state
// ============================================================================

/// The device answered a connection attempt.
pub const REACHABLE: &str = "Reachable";

/// The device did not answer a connection attempt.
pub const UNREACHABLE: &str = "Unreachable";

/// Interface is administratively and operationally up.
pub const OPER_UP: &str = "OperUp";

/// Interface is administratively up but operationally down.
pub const OPER_DOWN: &str = "OperDown";

/// Interface was shut down on purpose.
pub const ADMIN_DOWN: &str = "AdminDown";
