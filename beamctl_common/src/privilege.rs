//! Ordered privilege levels gating instrument operations.
//!
//! A user holds a maximum level; the session's effective level can be
//! lowered below that maximum but never raised above it. Every mutating
//! operation names a required level and is rejected with a
//! [`PrivilegeError`] before any device is touched.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Privilege levels, totally ordered by their fixed ordinals.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum Privilege {
    /// Run scripts, move ordinary motors.
    Layman = 0,
    /// Move the beamstop motors.
    Beamstop = 10,
    /// Connect and disconnect devices.
    ConnectDevices = 15,
    /// Move the pinhole motors.
    Pinhole = 20,
    /// Create and remove projects.
    ManageProjects = 30,
    /// Calibrate motor positions.
    CalibrateMotors = 40,
    /// Change motor driver parameters and soft limits.
    ConfigureMotors = 50,
    /// Change device-level configuration.
    ConfigureDevices = 55,
    /// Create, remove and edit users.
    ManageUsers = 60,
    /// Everything.
    Superuser = 100,
}

impl Privilege {
    /// All levels in ascending order.
    pub const ALL: [Privilege; 10] = [
        Privilege::Layman,
        Privilege::Beamstop,
        Privilege::ConnectDevices,
        Privilege::Pinhole,
        Privilege::ManageProjects,
        Privilege::CalibrateMotors,
        Privilege::ConfigureMotors,
        Privilege::ConfigureDevices,
        Privilege::ManageUsers,
        Privilege::Superuser,
    ];

    /// The fixed ordinal of the level.
    #[inline]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Convert from a raw ordinal. Returns `None` for unknown values.
    #[inline]
    pub const fn from_ordinal(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Layman),
            10 => Some(Self::Beamstop),
            15 => Some(Self::ConnectDevices),
            20 => Some(Self::Pinhole),
            30 => Some(Self::ManageProjects),
            40 => Some(Self::CalibrateMotors),
            50 => Some(Self::ConfigureMotors),
            55 => Some(Self::ConfigureDevices),
            60 => Some(Self::ManageUsers),
            100 => Some(Self::Superuser),
        _ => None,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Layman => "Layman",
            Self::Beamstop => "Beamstop",
            Self::ConnectDevices => "(Dis)connect Devices",
            Self::Pinhole => "Pinhole",
            Self::ManageProjects => "Manage Projects",
            Self::CalibrateMotors => "Calibrate Motors",
            Self::ConfigureMotors => "Configure Motors",
            Self::ConfigureDevices => "Configure Devices",
            Self::ManageUsers => "Manage Users",
            Self::Superuser => "Superuser",
        }
    }

    /// Look a level up by name, ignoring case, spaces and punctuation.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self::ALL.iter().copied().find(|level| {
            let lname: String = level
                .name()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .collect();
            lname == normalized
        })
    }

    /// Whether this level suffices for an operation requiring `required`.
    #[inline]
    pub fn allows(self, required: Privilege) -> bool {
        self >= required
    }
}

impl Default for Privilege {
    fn default() -> Self {
        Self::Layman
    }
}

impl std::fmt::Display for Privilege {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The session privilege does not cover the requested operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("operation requires privilege '{required}', session holds '{held}'")]
pub struct PrivilegeError {
    pub required: Privilege,
    pub held: Privilege,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_ordinals() {
        assert!(Privilege::Layman < Privilege::Beamstop);
        assert!(Privilege::Beamstop < Privilege::ConnectDevices);
        assert!(Privilege::ManageUsers < Privilege::Superuser);
        for window in Privilege::ALL.windows(2) {
            assert!(window[0] < window[1]);
            assert!(window[0].ordinal() < window[1].ordinal());
        }
    }

    #[test]
    fn ordinal_roundtrip() {
        for level in Privilege::ALL {
            assert_eq!(Privilege::from_ordinal(level.ordinal()), Some(level));
        }
        assert_eq!(Privilege::from_ordinal(42), None);
    }

    #[test]
    fn lookup_by_name_is_normalized() {
        assert_eq!(Privilege::from_name("superuser"), Some(Privilege::Superuser));
        assert_eq!(
            Privilege::from_name("(dis)connect devices"),
            Some(Privilege::ConnectDevices)
        );
        assert_eq!(Privilege::from_name("MANAGE_USERS"), Some(Privilege::ManageUsers));
        assert_eq!(Privilege::from_name("wizard"), None);
    }

    #[test]
    fn allows_is_reflexive_and_monotonic() {
        assert!(Privilege::Pinhole.allows(Privilege::Pinhole));
        assert!(Privilege::Superuser.allows(Privilege::Layman));
        assert!(!Privilege::Layman.allows(Privilege::Beamstop));
    }
}
