//! Coordination-service seam and the region transition event payload.
//!
//! The session is an external collaborator with blocking upsert/delete
//! semantics; the manager tolerates spurious reconnects because every write
//! it issues is idempotent. The event payload layout is a wire contract
//! shared with region-server-side handlers: one event kind byte followed by
//! a length-prefixed sender string.

use std::time::Duration;

use crate::server::ServerAddress;

/// Event kind byte for "master has cleared the region, any server may claim
/// it". Written both when a region becomes unassigned and when the master
/// hands it out; region servers key their open handlers off this value.
pub const EVENT_REGION_OFFLINE: u8 = 50;

/// Sender recorded in every event the master writes.
pub const MASTER_SENDER: &str = "master";

/// Backoff ladder for retried coordination writes, in multiples of the
/// configured pause.
const RETRY_BACKOFF: [u32; 10] = [1, 1, 1, 2, 2, 4, 4, 8, 16, 32];

/// Handle to the external coordination service.
///
/// Both mutations may block on network round-trips. Implementations must make
/// `upsert` and `delete` idempotent so the manager can repeat them across
/// reconnects.
pub trait CoordinationSession: Send + Sync {
    fn upsert(&self, path: &str, payload: &[u8]) -> anyhow::Result<()>;

    fn delete(&self, path: &str) -> anyhow::Result<()>;

    /// Persist the root region location at its dedicated node.
    fn write_root_location(&self, addr: &ServerAddress) -> anyhow::Result<()>;

    /// Drop ephemeral master state on clean shutdown.
    fn clear(&self);

    fn close(&self);
}

/// Mirror node path for a region in transition, keyed by its encoded name.
pub fn unassigned_path(encoded_name: &str) -> String {
    format!("unassigned/{encoded_name}")
}

/// Event record mirrored into the coordination service for each transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionEvent {
    pub kind: u8,
    pub sender: String,
}

impl TransitionEvent {
    pub fn offline() -> Self {
        Self {
            kind: EVENT_REGION_OFFLINE,
            sender: MASTER_SENDER.to_string(),
        }
    }

    /// Stable binary form: kind byte, then u32 big-endian sender length, then
    /// the sender bytes.
    pub fn encode(&self) -> Vec<u8> {
        let sender = self.sender.as_bytes();
        let mut out = Vec::with_capacity(1 + 4 + sender.len());
        out.push(self.kind);
        out.extend_from_slice(&(sender.len() as u32).to_be_bytes());
        out.extend_from_slice(sender);
        out
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() < 5 {
            anyhow::bail!("transition event payload too short: {} bytes", bytes.len());
        }
        let kind = bytes[0];
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        let rest = &bytes[5..];
        if rest.len() != len {
            anyhow::bail!(
                "transition event sender length mismatch: declared {len}, got {}",
                rest.len()
            );
        }
        let sender = std::str::from_utf8(rest)?.to_string();
        Ok(Self { kind, sender })
    }
}

/// Pause before retry `attempt`, capped at the last ladder step.
pub(crate) fn pause_for_attempt(pause: Duration, attempt: usize) -> Duration {
    let idx = attempt.min(RETRY_BACKOFF.len() - 1);
    pause * RETRY_BACKOFF[idx]
}

/// Write the root location with bounded retries and exponential backoff.
/// Returns false once every attempt has failed; the caller decides how hard
/// to escalate.
pub(crate) fn write_root_location_with_retry(
    session: &dyn CoordinationSession,
    addr: &ServerAddress,
    retries: usize,
    pause: Duration,
) -> bool {
    for attempt in 0..retries.max(1) {
        match session.write_root_location(addr) {
            Ok(()) => return true,
            Err(err) => {
                tracing::warn!(
                    attempt,
                    root = %addr,
                    error = ?err,
                    "root location write failed, backing off"
                );
                std::thread::sleep(pause_for_attempt(pause, attempt));
            }
        }
    }
    false
}
