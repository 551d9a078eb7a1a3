//! Machine role bitmask
//!
//! A machine may be a control-plane member, a worker, or both. Roles are
//! rendered as a comma-separated list ("control-plane,worker") in labels
//! and CLI flags.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Role bitmask for a cluster machine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineRole(u8);

impl MachineRole {
    /// The machine hosts control-plane components
    pub const CONTROL_PLANE: MachineRole = MachineRole(1);
    /// The machine accepts workloads
    pub const WORKER: MachineRole = MachineRole(2);

    /// Check whether this role includes all bits of `other`
    pub fn has(self, other: MachineRole) -> bool {
        self.0 & other.0 == other.0
    }

    /// Add the bits of `other` to this role
    pub fn set(&mut self, other: MachineRole) {
        self.0 |= other.0;
    }

    /// True when no role bit is set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for MachineRole {
    type Output = MachineRole;

    fn bitor(self, rhs: MachineRole) -> MachineRole {
        MachineRole(self.0 | rhs.0)
    }
}

impl fmt::Display for MachineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(2);
        if self.has(MachineRole::CONTROL_PLANE) {
            parts.push("control-plane");
        }
        if self.has(MachineRole::WORKER) {
            parts.push("worker");
        }
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for MachineRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut role = MachineRole::default();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part {
                "control-plane" => role.set(MachineRole::CONTROL_PLANE),
                "worker" => role.set(MachineRole::WORKER),
                other => {
                    return Err(Error::validation(format!("unknown machine role {other:?}")));
                }
            }
        }
        if role.is_empty() {
            return Err(Error::validation("machine role may not be empty"));
        }
        Ok(role)
    }
}

impl TryFrom<String> for MachineRole {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MachineRole> for String {
    fn from(role: MachineRole) -> String {
        role.to_string()
    }
}
