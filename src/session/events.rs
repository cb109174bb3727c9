use std::{fmt, time::Duration};

use serde::Serialize;

use crate::types::StoredFile;

/// Lifecycle of a stream session. Only moves forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
   Acquiring = 0,
   Active = 1,
   Renewing = 2,
   Terminating = 3,
   Released = 4,
}

impl SessionState {
   pub(crate) const fn from_u8(v: u8) -> Self {
      match v {
         0 => Self::Acquiring,
         1 => Self::Active,
         2 => Self::Renewing,
         3 => Self::Terminating,
         _ => Self::Released,
      }
   }

   /// Still accepting I/O and renewals.
   pub const fn is_live(self) -> bool {
      matches!(self, Self::Active | Self::Renewing)
   }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "reason", content = "message")]
pub enum TerminationReason {
   /// The stream finished normally.
   Completed,
   /// The stream or a caller-side sink failed.
   Errored(String),
   /// The lease ran out before the stream finished.
   Expired,
   /// The caller ended the session early.
   Stopped,
}

impl TerminationReason {
   pub const fn as_str(&self) -> &'static str {
      match self {
         Self::Completed => "completed",
         Self::Errored(_) => "errored",
         Self::Expired => "expired",
         Self::Stopped => "stopped",
      }
   }
}

impl fmt::Display for TerminationReason {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Errored(msg) => write!(f, "errored: {msg}"),
         other => f.write_str(other.as_str()),
      }
   }
}

/// Terminal notification of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Termination {
   pub reason:        TerminationReason,
   /// Stored record, present for completed writes.
   pub file:          Option<StoredFile>,
   /// Set when releasing the lease failed. Never replaces `reason`.
   pub release_error: Option<String>,
}

impl Termination {
   pub fn is_clean(&self) -> bool {
      self.release_error.is_none()
   }
}

/// Notifications delivered on a session's event channel.
///
/// `Closed` is always the last event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
   /// Remaining lease time dropped to the warning threshold. Sent once per
   /// lease period; call `renew` to extend.
   ExpiresSoon { remaining: Duration },
   /// Cumulative bytes moved through the stream.
   Progress { bytes: u64 },
   Closed(Termination),
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn state_round_trips_through_u8() {
      for state in [
         SessionState::Acquiring,
         SessionState::Active,
         SessionState::Renewing,
         SessionState::Terminating,
         SessionState::Released,
      ] {
         assert_eq!(SessionState::from_u8(state as u8), state);
      }
      assert!(SessionState::Renewing.is_live());
      assert!(!SessionState::Terminating.is_live());
   }

   #[test]
   fn reason_display() {
      assert_eq!(TerminationReason::Expired.to_string(), "expired");
      assert_eq!(TerminationReason::Errored("disk full".into()).to_string(), "errored: disk full");
   }
}
