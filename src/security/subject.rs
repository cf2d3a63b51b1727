//! Acting subjects

use serde::{Deserialize, Serialize};

pub const SYSTEM_USER: &str = "SYSTEM";
pub const GUEST_USER: &str = "guest";
pub const DBA_GROUP: &str = "dba";

/// The identity an operation is performed as
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    name: String,
    groups: Vec<String>,
}

impl Subject {
    /// A subject whose primary group is the first entry of `groups`.
    pub fn new(name: impl Into<String>, groups: &[&str]) -> Self {
        Self {
            name: name.into(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    /// Internal administrative subject used by maintenance tasks
    pub fn system() -> Self {
        Self::new(SYSTEM_USER, &[DBA_GROUP])
    }

    pub fn guest() -> Self {
        Self::new(GUEST_USER, &[GUEST_USER])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn primary_group(&self) -> &str {
        self.groups.first().map(String::as_str).unwrap_or(GUEST_USER)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    /// Members of the dba group hold the administrative role.
    pub fn has_admin_role(&self) -> bool {
        self.has_group(DBA_GROUP)
    }
}
