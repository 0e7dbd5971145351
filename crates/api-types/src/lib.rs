//! Shared record schema for the scalepool project.
//!
//! This crate defines the durable resource record that represents one pool
//! slot: its spec, its persisted status shape, the structured lifecycle view
//! derived from that shape, and the record-kind table store clients are
//! constructed with.

use chrono::DateTime;
use chrono::Utc;
use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Stable identifier of a record within the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub struct UnitId(pub String);

impl From<&str> for UnitId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Reference to the live backing workload bound to a record.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, derive_more::Display,
)]
#[display("{namespace}/{name}")]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Desired state of a pool unit. Both fields are immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, CustomResource)]
#[kube(
    group = "pool.scalepool.dev",
    version = "v1",
    kind = "PoolUnit",
    plural = "poolunits",
    shortname = "pu",
    namespaced,
    status = "UnitStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PoolUnitSpec {
    /// Lease duration in seconds once the unit is activated.
    #[schemars(range(min = 0))]
    pub max_ready_time_seconds: i64,

    /// Opaque image descriptor handed to the workload backend on creation.
    pub workload_image_ref: String,
}

impl PoolUnitSpec {
    /// Validate the configured fields.
    ///
    /// A record failing validation is non-retryable: the reconcile loop
    /// surfaces it once as a terminal diagnostic.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_ready_time_seconds < 0 {
            return Err(ValidationError::NegativeLease(self.max_ready_time_seconds));
        }
        if self.workload_image_ref.is_empty() {
            return Err(ValidationError::EmptyImage);
        }
        Ok(())
    }

    /// The activation lease as a duration.
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_ready_time_seconds)
    }
}

/// Spec validation failures. Non-retryable configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("maxReadyTimeSeconds must be non-negative, got {0}")]
    NegativeLease(i64),

    #[error("workloadImageRef must not be empty")]
    EmptyImage,
}

/// Persisted lifecycle state value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum UnitState {
    Active,
    Inactive,
}

/// Observed state of a pool unit as persisted and transmitted.
///
/// `state` is absent on first observation; the first reconcile pass
/// initializes it. Use [`UnitStatus::phase`] for the structured view
/// instead of inspecting the optional fields directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatus {
    /// Current lifecycle state, absent until initialized.
    #[serde(rename = "status", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<UnitState>,

    /// When the unit was last activated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// The workload this unit is bound to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_workload: Option<WorkloadRef>,

    /// Advisory activation request set by the admission scheduler and
    /// consumed by the reconcile loop. Never authoritative state.
    #[serde(default)]
    pub requested: bool,
}

/// Structured lifecycle view of a [`UnitStatus`].
///
/// "Not yet initialized" is a distinct variant rather than a null check on
/// the persisted state value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitPhase {
    Uninitialized,
    Inactive {
        bound_workload: Option<WorkloadRef>,
    },
    Active {
        started_at: Option<DateTime<Utc>>,
        bound_workload: Option<WorkloadRef>,
    },
}

impl UnitStatus {
    /// Project the persisted shape into the tagged lifecycle view.
    pub fn phase(&self) -> UnitPhase {
        match self.state {
            None => UnitPhase::Uninitialized,
            Some(UnitState::Inactive) => UnitPhase::Inactive {
                bound_workload: self.bound_workload.clone(),
            },
            Some(UnitState::Active) => UnitPhase::Active {
                started_at: self.started_at,
                bound_workload: self.bound_workload.clone(),
            },
        }
    }

    /// A freshly initialized status: Inactive, unbound, not requested.
    pub fn initialized() -> Self {
        Self {
            state: Some(UnitState::Inactive),
            started_at: None,
            bound_workload: None,
            requested: false,
        }
    }
}

/// Opaque version token compared on every conditional update.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub struct Revision(String);

impl Revision {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A durable resource record as observed from a store.
///
/// The revision pins the read; every mutation derived from this record must
/// be written back conditionally against it.
#[derive(Debug, Clone)]
pub struct UnitRecord {
    pub id: UnitId,
    pub spec: PoolUnitSpec,
    pub status: UnitStatus,
    pub revision: Revision,
}

impl From<PoolUnit> for UnitRecord {
    fn from(unit: PoolUnit) -> Self {
        let revision = Revision::new(unit.resource_version().unwrap_or_default());
        Self {
            id: UnitId(unit.name_any()),
            spec: unit.spec.clone(),
            status: unit.status.clone().unwrap_or_default(),
            revision,
        }
    }
}

/// One entry of the record-kind table.
///
/// Store clients take the kind they serve at construction; there is no
/// process-wide scheme registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl RecordKind {
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

/// The pool unit record kind. Must agree with the derive attributes on
/// [`PoolUnitSpec`].
pub const POOL_UNIT_KIND: RecordKind = RecordKind {
    group: "pool.scalepool.dev",
    version: "v1",
    kind: "PoolUnit",
    plural: "poolunits",
};

/// All record kinds this project persists.
pub const RECORD_KINDS: &[RecordKind] = &[POOL_UNIT_KIND];
