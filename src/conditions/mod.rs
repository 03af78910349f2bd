//! Kubernetes-style status conditions.
//!
//! Every managed resource carries an ordered list of conditions, unique by
//! type. Business logic sets the fine-grained ones (`Configured`,
//! `Operational`, ...) and calls [`recompute_ready`] once at the end of a
//! reconcile pass to derive the aggregate `Ready` condition.
//!
//! `lastTransitionTime` only moves when a condition's status changes, so
//! tooling watching it sees real transitions rather than every re-evaluation.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

pub mod reasons;

/// Aggregate condition, derived from all others
pub const READY: &str = "Ready";
/// The desired state has been pushed to the device
pub const CONFIGURED: &str = "Configured";
/// The observed state on the device matches what was asked for
pub const OPERATIONAL: &str = "Operational";

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Rank used when aggregating, higher is worse
    fn severity(self) -> u8 {
        match self {
            Self::True => 0,
            Self::Unknown => 1,
            Self::False => 2,
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Ready, Configured)
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Generation of the resource this condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the status changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: Utc::now(),
        }
    }

    pub fn with_type(mut self, type_: impl Into<String>) -> Self {
        self.type_ = type_.into();
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// A resource whose status carries a condition list
pub trait Conditioned {
    /// Current `metadata.generation`
    fn generation(&self) -> Option<i64>;

    fn conditions(&self) -> &[Condition];

    /// Mutable access, creating an empty status if there is none yet
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

/// Implement [`Conditioned`] for custom resources whose status has a `conditions` field.
#[macro_export]
macro_rules! impl_conditioned {
    ($($kind:ty),+ $(,)?) => {$(
        impl $crate::conditions::Conditioned for $kind {
            fn generation(&self) -> Option<i64> {
                self.metadata.generation
            }

            fn conditions(&self) -> &[$crate::conditions::Condition] {
                self.status
                    .as_ref()
                    .map(|s| s.conditions.as_slice())
                    .unwrap_or(&[])
            }

            fn conditions_mut(&mut self) -> &mut Vec<$crate::conditions::Condition> {
                &mut self.status.get_or_insert_with(Default::default).conditions
            }
        }
    )+};
}

/// Add any of `types` that are missing as `Unknown`.
///
/// Returns whether something was added, in which case the caller persists the
/// status and leaves the actual work to the next reconcile.
pub fn initialize<R: Conditioned + ?Sized>(resource: &mut R, types: &[&str]) -> bool {
    let generation = resource.generation();
    let now = Utc::now();
    let conditions = resource.conditions_mut();

    let mut changed = false;
    for type_ in types {
        if conditions.iter().any(|c| c.type_ == *type_) {
            continue;
        }

        conditions.push(Condition {
            observed_generation: generation,
            last_transition_time: now,
            ..Condition::new(
                *type_,
                ConditionStatus::Unknown,
                reasons::RECONCILE_PENDING,
                "reconciliation pending",
            )
        });
        changed = true;
    }

    changed
}

/// Set a condition, replacing any of the same type in place.
///
/// Returns whether anything changed, so callers can skip no-op status writes.
pub fn set<R: Conditioned + ?Sized>(resource: &mut R, condition: Condition) -> bool {
    set_at(resource, condition, Utc::now())
}

/// [`set`] with an explicit clock
pub fn set_at<R: Conditioned + ?Sized>(
    resource: &mut R,
    mut condition: Condition,
    now: DateTime<Utc>,
) -> bool {
    condition.observed_generation = resource.generation();
    let conditions = resource.conditions_mut();

    let Some(index) = conditions.iter().position(|c| c.type_ == condition.type_) else {
        condition.last_transition_time = now;
        conditions.push(condition);
        return true;
    };

    let existing = &mut conditions[index];
    if existing.status != condition.status {
        condition.last_transition_time = now;
        *existing = condition;
        return true;
    }

    let changed = existing.reason != condition.reason
        || existing.message != condition.message
        || existing.observed_generation != condition.observed_generation;

    existing.reason = condition.reason;
    existing.message = condition.message;
    existing.observed_generation = condition.observed_generation;

    changed
}

pub fn get<'a, R: Conditioned + ?Sized>(resource: &'a R, type_: &str) -> Option<&'a Condition> {
    resource.conditions().iter().find(|c| c.type_ == type_)
}

/// Absent, False and Unknown all count as "not yet".
pub fn is_true<R: Conditioned + ?Sized>(resource: &R, type_: &str) -> bool {
    get(resource, type_).is_some_and(Condition::is_true)
}

/// Gate used by dependents before they act on a referenced resource
pub fn is_configured<R: Conditioned + ?Sized>(resource: &R) -> bool {
    is_true(resource, CONFIGURED)
}

/// Derive `Ready` from all other conditions, worst status wins.
///
/// False beats Unknown beats True. The aggregate copies reason and message
/// from the first condition with the worst status. With nothing to aggregate
/// `Ready` stays Unknown.
pub fn recompute_ready<R: Conditioned + ?Sized>(resource: &mut R) -> bool {
    recompute_ready_at(resource, Utc::now())
}

/// [`recompute_ready`] with an explicit clock
pub fn recompute_ready_at<R: Conditioned + ?Sized>(resource: &mut R, now: DateTime<Utc>) -> bool {
    let worst = resource
        .conditions()
        .iter()
        .filter(|c| c.type_ != READY)
        .fold(None::<&Condition>, |worst, c| match worst {
            Some(w) if w.status.severity() >= c.status.severity() => Some(w),
            _ => Some(c),
        });

    let ready = match worst {
        Some(w) => Condition::new(READY, w.status, w.reason.clone(), w.message.clone()),
        None => Condition::new(
            READY,
            ConditionStatus::Unknown,
            reasons::RECONCILE_PENDING,
            "no conditions to aggregate",
        ),
    };

    set_at(resource, ready, now)
}

/// Map the outcome of a provider call to a `Configured` condition.
///
/// Terminal failures keep their own reason, anything else is reported as a
/// generic error. Whether to requeue is up to the caller.
pub fn from_error(err: Option<&Error>) -> Condition {
    match err {
        None => Condition::new(
            CONFIGURED,
            ConditionStatus::True,
            reasons::READY,
            "configured successfully",
        ),
        Some(Error::Terminal(terminal)) => Condition::new(
            CONFIGURED,
            ConditionStatus::False,
            terminal.reason.clone(),
            terminal.message.clone(),
        ),
        Some(e) => Condition::new(
            CONFIGURED,
            ConditionStatus::False,
            reasons::ERROR,
            e.to_string(),
        ),
    }
}

/// [`from_error`] for a whole result
pub fn from_result<T>(result: &Result<T, Error>) -> Condition {
    from_error(result.as_ref().err())
}
