//! Permission and resource authorities
//!
//! Admission control consults two external services: the resource
//! authority resolves the concrete resources a task implies, and the
//! permission authority answers "use" checks on each of them. Both are
//! pluggable behind a two-variant enum — a permissive stub or a
//! caller-supplied remote backend — chosen once at construction and never
//! swapped at runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authority query failure; treated as transient infrastructure trouble
#[derive(Debug, thiserror::Error)]
#[error("authority query failed: {0}")]
pub struct AuthorityError(pub String);

/// A concrete resource a task will claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaim {
    /// Stable resource name, used in denial messages
    pub name: String,
    /// Resource kind (host, network, pool, ...)
    pub kind: String,
}

impl ResourceClaim {
    /// Convenience constructor
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }
}

/// Remote permission service interface
pub trait PermissionBackend: Send + Sync {
    /// Whether `requester` holds "use" permission on `resource`
    fn can_use(&self, requester: &str, resource: &ResourceClaim) -> Result<bool, AuthorityError>;
}

/// Remote resource service interface
pub trait ResourceBackend: Send + Sync {
    /// Resolve the concrete resources implied by a task and the
    /// requester's group memberships
    fn resolve(
        &self,
        job_type: &str,
        parameters: &Value,
        requester: &str,
    ) -> Result<Vec<ResourceClaim>, AuthorityError>;
}

/// Permission authority, fixed at construction
pub enum PermissionAuthority {
    /// Grants every check
    Stub,
    /// Delegates to a remote service
    Remote(Box<dyn PermissionBackend>),
}

impl PermissionAuthority {
    /// Whether `requester` may use `resource`
    pub fn can_use(
        &self,
        requester: &str,
        resource: &ResourceClaim,
    ) -> Result<bool, AuthorityError> {
        match self {
            PermissionAuthority::Stub => Ok(true),
            PermissionAuthority::Remote(backend) => backend.can_use(requester, resource),
        }
    }
}

/// Resource authority, fixed at construction
pub enum ResourceAuthority {
    /// Resolves every task to no resources
    Stub,
    /// Delegates to a remote service
    Remote(Box<dyn ResourceBackend>),
}

impl ResourceAuthority {
    /// Resolve the resources a task implies
    pub fn resolve(
        &self,
        job_type: &str,
        parameters: &Value,
        requester: &str,
    ) -> Result<Vec<ResourceClaim>, AuthorityError> {
        match self {
            ResourceAuthority::Stub => Ok(Vec::new()),
            ResourceAuthority::Remote(backend) => backend.resolve(job_type, parameters, requester),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stub_authorities_grant_everything_and_claim_nothing() {
        let perm = PermissionAuthority::Stub;
        let res = ResourceAuthority::Stub;
        let claim = ResourceClaim::new("vm-1", "host");
        assert!(perm.can_use("anyone", &claim).unwrap());
        assert!(res.resolve("echo", &json!({}), "anyone").unwrap().is_empty());
    }

    struct DenyAll;

    impl PermissionBackend for DenyAll {
        fn can_use(&self, _: &str, _: &ResourceClaim) -> Result<bool, AuthorityError> {
            Ok(false)
        }
    }

    #[test]
    fn test_remote_variant_delegates() {
        let perm = PermissionAuthority::Remote(Box::new(DenyAll));
        let claim = ResourceClaim::new("vm-1", "host");
        assert!(!perm.can_use("anyone", &claim).unwrap());
    }
}
