//! UTC instants for chat and message ordering.
//!
//! Stores persist these as Unix milliseconds, so that is the only
//! precision that survives a round trip through SQLite.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Wall-clock now, clamped so it never sorts before `floor`.
    ///
    /// A new message is stamped with the previous one's time as the floor,
    /// which keeps a chat ordered even if the system clock steps back.
    pub fn now_not_before(floor: Timestamp) -> Self {
        Self::now().max(floor)
    }

    /// Out-of-range input lands on the Unix epoch.
    pub fn from_unix_millis(millis: i64) -> Self {
        let at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self(at)
    }

    pub fn as_unix_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn is_before(&self, other: &Timestamp) -> bool {
        self < other
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}
