//! Snapshot status state machine.
//!
//! ```text
//! creating ──► available ──► deleting ──► deleted
//!     │            │             │
//!     └────────────┴─────────────┴──► error
//! ```
//!
//! `available` and `error` are the states that end a reconciliation
//! campaign. `deleted` and `error` admit no further transitions.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;

/// Lifecycle status of a snapshot, as mirrored from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotStatus {
    Creating,
    Available,
    Deleting,
    Deleted,
    Error,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Creating => "creating",
            SnapshotStatus::Available => "available",
            SnapshotStatus::Deleting => "deleting",
            SnapshotStatus::Deleted => "deleted",
            SnapshotStatus::Error => "error",
        }
    }

    /// Map a status string reported by the block-storage provider.
    ///
    /// Returns `None` for statuses this system does not track.
    pub fn from_provider(status: &str) -> Option<Self> {
        match status.to_ascii_lowercase().as_str() {
            "creating" => Some(SnapshotStatus::Creating),
            "available" => Some(SnapshotStatus::Available),
            "deleting" => Some(SnapshotStatus::Deleting),
            "deleted" => Some(SnapshotStatus::Deleted),
            "error" | "error_deleting" => Some(SnapshotStatus::Error),
            _ => None,
        }
    }

    /// States that stop a polling campaign.
    pub fn is_final(&self) -> bool {
        matches!(self, SnapshotStatus::Available | SnapshotStatus::Error)
    }

    /// States with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SnapshotStatus::Deleted | SnapshotStatus::Error)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    ///
    /// Staying in the same state is always allowed.
    pub fn can_transition_to(&self, next: SnapshotStatus) -> bool {
        use SnapshotStatus::*;

        if *self == next {
            return true;
        }
        match (self, next) {
            (Deleted | Error, _) => false,
            (_, Error) => true,
            (Creating, Available) => true,
            (Available, Deleting) => true,
            (Deleting, Deleted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(SnapshotStatus::Creating),
            "available" => Ok(SnapshotStatus::Available),
            "deleting" => Ok(SnapshotStatus::Deleting),
            "deleted" => Ok(SnapshotStatus::Deleted),
            "error" => Ok(SnapshotStatus::Error),
            other => Err(anyhow!("unknown snapshot status: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SnapshotStatus::*;
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(Creating.can_transition_to(Available));
        assert!(Creating.can_transition_to(Error));
        assert!(Available.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
        assert!(Deleting.can_transition_to(Error));
        assert!(Available.can_transition_to(Error));
    }

    #[test]
    fn test_no_backward_or_terminal_transitions() {
        assert!(!Available.can_transition_to(Creating));
        assert!(!Deleted.can_transition_to(Available));
        assert!(!Error.can_transition_to(Available));
        assert!(!Error.can_transition_to(Creating));
        assert!(!Creating.can_transition_to(Deleted));
    }

    #[test]
    fn test_self_transition_allowed() {
        for status in [Creating, Available, Deleting, Deleted, Error] {
            assert!(status.can_transition_to(status));
        }
    }

    #[test]
    fn test_final_and_terminal() {
        assert!(Available.is_final());
        assert!(Error.is_final());
        assert!(!Creating.is_final());
        assert!(!Deleted.is_final());

        assert!(Deleted.is_terminal());
        assert!(Error.is_terminal());
        assert!(!Available.is_terminal());
    }

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(SnapshotStatus::from_provider("available"), Some(Available));
        assert_eq!(SnapshotStatus::from_provider("CREATING"), Some(Creating));
        assert_eq!(SnapshotStatus::from_provider("error_deleting"), Some(Error));
        assert_eq!(SnapshotStatus::from_provider("backing-up"), None);
    }

    #[test]
    fn test_round_trip_through_str() {
        for status in [Creating, Available, Deleting, Deleted, Error] {
            assert_eq!(status.as_str().parse::<SnapshotStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SnapshotStatus>().is_err());
    }
}
