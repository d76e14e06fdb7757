//! Permission manifests, the trust store, the decision audit log and the
//! broker that ties them together.

pub mod audit;
pub mod broker;
pub mod manifest;
pub mod trust_store;

pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use broker::{Decision, DecisionBasis, PermissionBroker};
pub use manifest::{ManifestSource, PermissionManifest, SidecarManifest, extract_or_undeclared};
pub use trust_store::{PermissionRecord, TrustStore};
