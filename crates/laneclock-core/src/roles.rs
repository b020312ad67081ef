use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::RoleError;
use crate::ids::ConnectionId;

pub const LANE_COUNT: usize = 8;

/// One of the eight timed lanes, numbered 1..=8.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Lane(u8);

impl Lane {
    pub fn new(n: u8) -> Option<Self> {
        (1..=LANE_COUNT as u8).contains(&n).then_some(Self(n))
    }

    /// Parse a lane from a loosely typed wire value.
    ///
    /// Accepts integral numbers and numeric strings ("3", "3.0"). Anything
    /// fractional, out of range or of another JSON type yields `None`.
    pub fn parse(value: &serde_json::Value) -> Option<Self> {
        let n = match value {
            serde_json::Value::Number(n) => n.as_f64()?,
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        if !n.is_finite() || n.fract() != 0.0 || n < 1.0 || n > LANE_COUNT as f64 {
            return None;
        }
        Self::new(n as u8)
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// Zero-based slot for per-lane arrays.
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }

    pub fn all() -> impl Iterator<Item = Lane> {
        (1..=LANE_COUNT as u8).map(Lane)
    }
}

impl TryFrom<u8> for Lane {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Self::new(n).ok_or_else(|| format!("lane out of range: {n}"))
    }
}

impl From<Lane> for u8 {
    fn from(lane: Lane) -> u8 {
        lane.0
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exclusive capability held by at most one connection at a time.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Role {
    Admin,
    Lane(Lane),
}

impl Role {
    /// The lane this role operates, if any.
    pub fn lane(self) -> Option<Lane> {
        match self {
            Self::Admin => None,
            Self::Lane(lane) => Some(lane),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => f.write_str("admin"),
            Self::Lane(lane) => write!(f, "lane-{lane}"),
        }
    }
}

impl FromStr for Role {
    type Err = RoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "admin" {
            return Ok(Self::Admin);
        }
        s.strip_prefix("lane-")
            .filter(|n| n.len() == 1)
            .and_then(|n| n.parse::<u8>().ok())
            .and_then(Lane::new)
            .map(Self::Lane)
            .ok_or_else(|| RoleError::UnknownRole(s.to_string()))
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Process-wide mapping of connection to role.
///
/// Both directions are kept so that "who holds lane-3" and "what does this
/// connection hold" are O(1). The two maps are always mutated together.
#[derive(Debug, Default)]
pub struct RoleRegistry {
    by_connection: HashMap<ConnectionId, Role>,
    by_role: HashMap<Role, ConnectionId>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `role` to `connection` if nobody holds it yet.
    pub fn request_role(&mut self, connection: &ConnectionId, role: Role) -> Result<(), RoleError> {
        if self.by_role.contains_key(&role) {
            return Err(RoleError::RoleTaken(role));
        }
        if let Some(held) = self.by_connection.get(connection) {
            return Err(RoleError::AlreadyHolds(*held));
        }
        self.by_connection.insert(connection.clone(), role);
        self.by_role.insert(role, connection.clone());
        Ok(())
    }

    /// Free whatever role `connection` holds. Returns the released role.
    pub fn release_connection(&mut self, connection: &ConnectionId) -> Option<Role> {
        let role = self.by_connection.remove(connection)?;
        self.by_role.remove(&role);
        Some(role)
    }

    pub fn role_of(&self, connection: &ConnectionId) -> Option<Role> {
        self.by_connection.get(connection).copied()
    }

    pub fn is_held(&self, role: Role) -> bool {
        self.by_role.contains_key(&role)
    }

    /// Held roles, admin first then lanes in order.
    pub fn held_roles(&self) -> Vec<Role> {
        std::iter::once(Role::Admin)
            .chain(Lane::all().map(Role::Lane))
            .filter(|r| self.is_held(*r))
            .collect()
    }
}
