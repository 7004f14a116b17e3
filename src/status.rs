//! Derived peer status
//!
//! The status is never stored as an independent fact; it is recomputed from
//! the connection, mode and version flags after every mutation that could
//! affect it. Precedence, highest first:
//!
//! ```text
//! routable          -> Connected | RoutingBackedOff
//! disabled          -> Disabled
//! connected + newer -> TooNew
//! connected + older -> TooOld
//! never connected   -> NeverConnected
//! listen-only       -> ListenOnly
//! bursting          -> Bursting
//! burst-only        -> Listening
//! otherwise         -> Disconnected
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Discrete peer status used for indexing and display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerStatus {
    Connected,
    RoutingBackedOff,
    Disabled,
    TooNew,
    TooOld,
    NeverConnected,
    ListenOnly,
    Bursting,
    /// Burst-only peer between bursts
    Listening,
    Disconnected,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Connected => "CONNECTED",
            PeerStatus::RoutingBackedOff => "BACKED OFF",
            PeerStatus::Disabled => "DISABLED",
            PeerStatus::TooNew => "TOO NEW",
            PeerStatus::TooOld => "TOO OLD",
            PeerStatus::NeverConnected => "NEVER CONNECTED",
            PeerStatus::ListenOnly => "LISTEN ONLY",
            PeerStatus::Bursting => "BURSTING",
            PeerStatus::Listening => "LISTENING",
            PeerStatus::Disconnected => "DISCONNECTED",
        }
    }

    /// Statuses in which requests may be routed to the peer
    pub fn is_routable(&self) -> bool {
        matches!(self, PeerStatus::Connected | PeerStatus::RoutingBackedOff)
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake policy for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PeerMode {
    /// Retry on a randomised interval
    #[default]
    Normal,
    /// Never initiate; wait for the peer
    ListenOnly,
    /// Short bursts of attempts separated by long pauses
    BurstOnly,
}

/// Result of the two version checks against a connected peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VersionCompat {
    #[default]
    Compatible,
    /// Peer's build is below our minimum
    TooOld,
    /// Our build is below the peer's minimum
    TooNew,
}

impl VersionCompat {
    /// Combine the two checks; "too new" wins when both fail
    pub fn from_checks(peer_too_old: bool, we_too_new: bool) -> Self {
        if we_too_new {
            VersionCompat::TooNew
        } else if peer_too_old {
            VersionCompat::TooOld
        } else {
            VersionCompat::Compatible
        }
    }

    pub fn is_compatible(&self) -> bool {
        *self == VersionCompat::Compatible
    }
}

/// Everything status derivation looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusInputs {
    pub connected: bool,
    pub routable: bool,
    pub backed_off_until: u64,
    pub disabled: bool,
    pub never_connected: bool,
    pub mode: PeerMode,
    pub bursting: bool,
    pub compat: VersionCompat,
}

/// Pure status derivation
pub fn derive_status(inputs: &StatusInputs, now: u64) -> PeerStatus {
    if inputs.routable {
        if now < inputs.backed_off_until {
            PeerStatus::RoutingBackedOff
        } else {
            PeerStatus::Connected
        }
    } else if inputs.disabled {
        PeerStatus::Disabled
    } else if inputs.connected && inputs.compat == VersionCompat::TooNew {
        PeerStatus::TooNew
    } else if inputs.connected && inputs.compat == VersionCompat::TooOld {
        PeerStatus::TooOld
    } else if inputs.never_connected {
        PeerStatus::NeverConnected
    } else if inputs.mode == PeerMode::ListenOnly {
        PeerStatus::ListenOnly
    } else if inputs.bursting {
        PeerStatus::Bursting
    } else if inputs.mode == PeerMode::BurstOnly {
        PeerStatus::Listening
    } else {
        PeerStatus::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> StatusInputs {
        StatusInputs {
            connected: true,
            routable: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_routable_beats_disabled() {
        let inputs = StatusInputs {
            disabled: true,
            ..connected()
        };
        assert_eq!(derive_status(&inputs, 100), PeerStatus::Connected);
    }

    #[test]
    fn test_backed_off() {
        let inputs = StatusInputs {
            backed_off_until: 200,
            ..connected()
        };
        assert_eq!(derive_status(&inputs, 100), PeerStatus::RoutingBackedOff);
        assert_eq!(derive_status(&inputs, 200), PeerStatus::Connected);
    }

    #[test]
    fn test_version_statuses_need_connection() {
        let mut inputs = StatusInputs {
            connected: true,
            compat: VersionCompat::TooOld,
            ..Default::default()
        };
        assert_eq!(derive_status(&inputs, 0), PeerStatus::TooOld);
        inputs.compat = VersionCompat::TooNew;
        assert_eq!(derive_status(&inputs, 0), PeerStatus::TooNew);
        inputs.connected = false;
        assert_eq!(derive_status(&inputs, 0), PeerStatus::Disconnected);
        inputs.disabled = true;
        assert_eq!(derive_status(&inputs, 0), PeerStatus::Disabled);
    }

    #[test]
    fn test_mode_statuses() {
        let mut inputs = StatusInputs {
            mode: PeerMode::BurstOnly,
            ..Default::default()
        };
        assert_eq!(derive_status(&inputs, 0), PeerStatus::Listening);
        inputs.bursting = true;
        assert_eq!(derive_status(&inputs, 0), PeerStatus::Bursting);
        inputs.mode = PeerMode::ListenOnly;
        assert_eq!(derive_status(&inputs, 0), PeerStatus::ListenOnly);
        inputs.never_connected = true;
        assert_eq!(derive_status(&inputs, 0), PeerStatus::NeverConnected);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let inputs = StatusInputs {
            connected: true,
            never_connected: true,
            mode: PeerMode::BurstOnly,
            ..Default::default()
        };
        let first = derive_status(&inputs, 5);
        for _ in 0..10 {
            assert_eq!(derive_status(&inputs, 5), first);
        }
        assert_eq!(first, PeerStatus::NeverConnected);
    }

    #[test]
    fn test_too_new_wins() {
        assert_eq!(VersionCompat::from_checks(true, true), VersionCompat::TooNew);
        assert_eq!(VersionCompat::from_checks(true, false), VersionCompat::TooOld);
        assert_eq!(VersionCompat::from_checks(false, false), VersionCompat::Compatible);
        assert_eq!(PeerStatus::RoutingBackedOff.to_string(), "BACKED OFF");
    }
}
