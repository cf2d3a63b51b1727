//! Unix-style permission triple carried by collections and documents

use serde::{Deserialize, Serialize};

use super::subject::Subject;

pub const READ: u16 = 0o4;
pub const WRITE: u16 = 0o2;
pub const EXECUTE: u16 = 0o1;

/// Set-group-id: new children inherit the collection's group
pub const SET_GID: u16 = 0o2000;

pub const DEFAULT_COLLECTION_MODE: u16 = 0o755;
pub const DEFAULT_RESOURCE_MODE: u16 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub owner: String,
    pub group: String,
    pub mode: u16,
}

impl Permission {
    pub fn new(owner: impl Into<String>, group: impl Into<String>, mode: u16) -> Self {
        Self {
            owner: owner.into(),
            group: group.into(),
            mode,
        }
    }

    /// Collection permission owned by `subject`
    pub fn collection_for(subject: &Subject) -> Self {
        Self::new(subject.name(), subject.primary_group(), DEFAULT_COLLECTION_MODE)
    }

    /// Resource permission owned by `subject`
    pub fn resource_for(subject: &Subject) -> Self {
        Self::new(subject.name(), subject.primary_group(), DEFAULT_RESOURCE_MODE)
    }

    pub fn is_set_gid(&self) -> bool {
        self.mode & SET_GID != 0
    }

    pub fn set_set_gid(&mut self, enabled: bool) {
        if enabled {
            self.mode |= SET_GID;
        } else {
            self.mode &= !SET_GID;
        }
    }

    /// True if `subject` holds every bit in `bits` (READ | WRITE | EXECUTE).
    pub fn validate(&self, subject: &Subject, bits: u16) -> bool {
        if subject.has_admin_role() {
            return true;
        }
        let granted = if subject.name() == self.owner {
            (self.mode >> 6) & 0o7
        } else if subject.has_group(&self.group) {
            (self.mode >> 3) & 0o7
        } else {
            self.mode & 0o7
        };
        granted & bits == bits
    }

    /// `rwxr-xr-x` style rendering
    pub fn mode_string(&self) -> String {
        let mut out = String::with_capacity(9);
        for shift in [6u16, 3, 0] {
            let bits = (self.mode >> shift) & 0o7;
            out.push(if bits & READ != 0 { 'r' } else { '-' });
            out.push(if bits & WRITE != 0 { 'w' } else { '-' });
            out.push(if bits & EXECUTE != 0 { 'x' } else { '-' });
        }
        out
    }
}
