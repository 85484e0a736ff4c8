//! Presence and typing view rules shared by runtime and consumers.

use serde::{Deserialize, Serialize};

use crate::types::{PresenceRecord, TypingRecord};

/// Interval at which the online presence record is republished, bounding how
/// stale a last-seen value can get when a client dies without running its
/// disconnect handler.
pub const HEARTBEAT_INTERVAL_MS: u64 = 5 * 60 * 1_000;

/// Window after which an unrefreshed typing record is treated as stopped.
pub const TYPING_STALE_AFTER_MS: u64 = 3_000;

/// Viewer-side liveness state for a watched identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerLiveness {
    /// No presence record observed yet.
    Unknown,
    /// The peer's client reports itself online.
    Online,
    /// The peer is offline; last seen at the contained timestamp.
    Offline {
        /// Last-seen timestamp in milliseconds since Unix epoch.
        last_online_ms: u64,
    },
}

impl PeerLiveness {
    /// Map a raw presence record into the viewer-side state.
    pub fn from_record(record: Option<&PresenceRecord>) -> Self {
        match record {
            None => Self::Unknown,
            Some(record) if record.online => Self::Online,
            Some(record) => Self::Offline {
                last_online_ms: record.last_online_ms,
            },
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Whether a typing indicator should be shown for a peer's record.
///
/// A record claiming `is_typing` is only honored while it is fresh; a missed
/// stopped write (peer tab crashed) must not leave the indicator on forever.
pub fn typing_indicator_visible(
    record: Option<&TypingRecord>,
    now_ms: u64,
    stale_after_ms: u64,
) -> bool {
    match record {
        Some(record) if record.is_typing => {
            now_ms.saturating_sub(record.updated_at_ms) < stale_after_ms
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(online: bool, last_online_ms: u64) -> PresenceRecord {
        PresenceRecord {
            identity_id: "u-bob".to_owned(),
            online,
            last_online_ms,
        }
    }

    fn typing(is_typing: bool, updated_at_ms: u64) -> TypingRecord {
        TypingRecord {
            conversation_id: "u-alice#u-bob".to_owned(),
            identity_id: "u-bob".to_owned(),
            is_typing,
            updated_at_ms,
        }
    }

    #[test]
    fn liveness_starts_unknown_before_first_record() {
        assert_eq!(PeerLiveness::from_record(None), PeerLiveness::Unknown);
    }

    #[test]
    fn liveness_follows_the_record() {
        assert_eq!(
            PeerLiveness::from_record(Some(&presence(true, 1_000))),
            PeerLiveness::Online
        );
        assert_eq!(
            PeerLiveness::from_record(Some(&presence(false, 2_500))),
            PeerLiveness::Offline {
                last_online_ms: 2_500
            }
        );
    }

    #[test]
    fn fresh_typing_record_is_visible() {
        let record = typing(true, 10_000);
        assert!(typing_indicator_visible(
            Some(&record),
            11_000,
            TYPING_STALE_AFTER_MS
        ));
    }

    #[test]
    fn stale_typing_record_is_hidden_without_a_stopped_write() {
        let record = typing(true, 10_000);
        assert!(!typing_indicator_visible(
            Some(&record),
            10_000 + TYPING_STALE_AFTER_MS,
            TYPING_STALE_AFTER_MS
        ));
        assert!(!typing_indicator_visible(
            Some(&record),
            60_000,
            TYPING_STALE_AFTER_MS
        ));
    }

    #[test]
    fn stopped_or_missing_records_are_hidden() {
        assert!(!typing_indicator_visible(None, 1_000, TYPING_STALE_AFTER_MS));
        let stopped = typing(false, 1_000);
        assert!(!typing_indicator_visible(
            Some(&stopped),
            1_001,
            TYPING_STALE_AFTER_MS
        ));
    }

    #[test]
    fn clock_skew_does_not_underflow_the_freshness_check() {
        // Record written slightly in the viewer's future still counts as fresh.
        let record = typing(true, 12_000);
        assert!(typing_indicator_visible(
            Some(&record),
            11_500,
            TYPING_STALE_AFTER_MS
        ));
    }
}
