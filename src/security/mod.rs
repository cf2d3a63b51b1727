//! Security contract consumed by the storage core
//!
//! Only two questions are asked of the security layer: does a subject hold a
//! set of permission bits on a resource, and does it hold the admin role.

mod permission;
mod subject;

pub use permission::{
    Permission, DEFAULT_COLLECTION_MODE, DEFAULT_RESOURCE_MODE, EXECUTE, READ, SET_GID, WRITE,
};
pub use subject::{Subject, DBA_GROUP, GUEST_USER, SYSTEM_USER};

use crate::errors::{StorageError, StorageResult};

pub trait SecurityManager: Send + Sync {
    fn validate(&self, subject: &Subject, permission: &Permission, bits: u16) -> bool;

    fn has_admin_role(&self, subject: &Subject) -> bool;

    /// `validate` as a `Result`, naming the resource in the error.
    fn check(
        &self,
        subject: &Subject,
        permission: &Permission,
        bits: u16,
        resource: &str,
    ) -> StorageResult<()> {
        if self.validate(subject, permission, bits) {
            Ok(())
        } else {
            Err(StorageError::permission_denied(format!(
                "{} lacks {} on {}",
                subject.name(),
                describe_bits(bits),
                resource
            )))
        }
    }
}

/// Plain owner/group/other evaluation with dba as the admin group
#[derive(Debug, Default, Clone)]
pub struct UnixSecurityManager;

impl SecurityManager for UnixSecurityManager {
    fn validate(&self, subject: &Subject, permission: &Permission, bits: u16) -> bool {
        permission.validate(subject, bits)
    }

    fn has_admin_role(&self, subject: &Subject) -> bool {
        subject.has_admin_role()
    }
}

fn describe_bits(bits: u16) -> String {
    let mut parts = Vec::new();
    if bits & READ != 0 {
        parts.push("READ");
    }
    if bits & WRITE != 0 {
        parts.push("WRITE");
    }
    if bits & EXECUTE != 0 {
        parts.push("EXECUTE");
    }
    parts.join("+")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_group_other_bits() {
        let perm = Permission::new("alice", "staff", 0o750);
        let alice = Subject::new("alice", &["users"]);
        let bob = Subject::new("bob", &["staff"]);
        let eve = Subject::new("eve", &["users"]);

        assert!(perm.validate(&alice, READ | WRITE | EXECUTE));
        assert!(perm.validate(&bob, READ | EXECUTE));
        assert!(!perm.validate(&bob, WRITE));
        assert!(!perm.validate(&eve, READ));
    }

    #[test]
    fn test_admin_passes_everything() {
        let perm = Permission::new("alice", "staff", 0o000);
        assert!(perm.validate(&Subject::system(), READ | WRITE | EXECUTE));
    }

    #[test]
    fn test_set_gid_toggle() {
        let mut perm = Permission::new("a", "g", 0o755);
        assert!(!perm.is_set_gid());
        perm.set_set_gid(true);
        assert!(perm.is_set_gid());
        assert_eq!(perm.mode & 0o777, 0o755);
        perm.set_set_gid(false);
        assert_eq!(perm.mode, 0o755);
    }

    #[test]
    fn test_check_names_missing_bits() {
        let manager = UnixSecurityManager;
        let perm = Permission::new("alice", "staff", 0o700);
        let err = manager
            .check(&Subject::guest(), &perm, WRITE | EXECUTE, "/db/a")
            .unwrap_err();
        assert!(err.is_permission_denied());
        assert!(err.to_string().contains("WRITE+EXECUTE"));
        assert!(err.to_string().contains("/db/a"));
    }

    #[test]
    fn test_mode_string() {
        assert_eq!(Permission::new("a", "g", 0o754).mode_string(), "rwxr-xr--");
    }
}
