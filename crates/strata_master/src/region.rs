//! Region descriptor and the per-region transition state record.
//!
//! `RegionState` is the unit the transition table tracks. Field mutation goes
//! through a per-record lock with validated transitions:
//!
//! unassigned -> pending_open -> open
//! closing -> pending_close -> closed
//!
//! Tolerated misuses (re-running an assignment, forcing a close) log a
//! warning and proceed; only `set_closed` from an unexpected precursor is a
//! hard error, because it would let a region vanish while a server still
//! believes it owns it.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys;
use crate::server::ServerAddress;

/// Immutable descriptor of one region.
///
/// Field order matters: the derived ordering is table, start key, region id,
/// which matches unsigned byte order of the rendered region name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionInfo {
    pub table: String,
    pub start_key: Vec<u8>,
    pub region_id: u64,
    pub end_key: Vec<u8>,
}

impl RegionInfo {
    pub fn new(
        table: impl Into<String>,
        start_key: impl Into<Vec<u8>>,
        end_key: impl Into<Vec<u8>>,
        region_id: u64,
    ) -> Self {
        Self {
            table: table.into(),
            start_key: start_key.into(),
            region_id,
            end_key: end_key.into(),
        }
    }

    /// The canonical bootstrap region `-ROOT-,,0`.
    pub fn root() -> Self {
        Self::new(keys::ROOT_TABLE_NAME, Vec::new(), Vec::new(), 0)
    }

    /// A region of the meta catalog table.
    pub fn meta(start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>, region_id: u64) -> Self {
        Self::new(keys::META_TABLE_NAME, start_key, end_key, region_id)
    }

    pub fn is_root(&self) -> bool {
        self.table == keys::ROOT_TABLE_NAME
    }

    pub fn is_meta_table(&self) -> bool {
        self.table == keys::META_TABLE_NAME
    }

    /// Root and meta regions together form the catalog; several assignment
    /// rules treat them alike.
    pub fn is_catalog(&self) -> bool {
        self.is_root() || self.is_meta_table()
    }

    pub fn region_name(&self) -> Vec<u8> {
        keys::region_name(&self.table, &self.start_key, self.region_id)
    }

    pub fn region_name_string(&self) -> String {
        String::from_utf8_lossy(&self.region_name()).into_owned()
    }

    /// Stable short name keying the coordination-service mirror node.
    pub fn encoded_name(&self) -> String {
        keys::encoded_name(&self.region_name())
    }
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.region_name_string())
    }
}

/// Lifecycle states a region moves through between stable catalog states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Awaiting a server to be assigned.
    Unassigned,
    /// A server was told to open the region but has not confirmed yet.
    PendingOpen,
    /// Open on a server, not yet recorded in the catalog.
    Open,
    /// A close has been decided but the message not yet delivered.
    Closing,
    /// The close message has been delivered to the server.
    PendingClose,
    /// Closed on the server, not yet recorded in the catalog.
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unassigned => "unassigned",
            Self::PendingOpen => "pending_open",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::PendingClose => "pending_close",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Raised when a region is marked closed from a state that never delivered a
/// close message.
#[derive(Debug, Error)]
#[error("region {region} cannot be marked closed from state {from}")]
pub struct IllegalTransition {
    pub region: String,
    pub from: LifecycleState,
}

struct StateInner {
    state: LifecycleState,
    server_name: Option<String>,
    server_address: Option<ServerAddress>,
    /// Set at close time when the region must not be reassigned afterwards.
    offline: bool,
}

/// Mutable transition record for one region.
pub struct RegionState {
    info: RegionInfo,
    inner: Mutex<StateInner>,
}

impl RegionState {
    pub fn new(info: RegionInfo, state: LifecycleState) -> Self {
        Self {
            info,
            inner: Mutex::new(StateInner {
                state,
                server_name: None,
                server_address: None,
                offline: false,
            }),
        }
    }

    pub fn info(&self) -> &RegionInfo {
        &self.info
    }

    pub fn region_name(&self) -> Vec<u8> {
        self.info.region_name()
    }

    pub fn region_name_string(&self) -> String {
        self.info.region_name_string()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().unwrap().state
    }

    pub fn server_name(&self) -> Option<String> {
        self.inner.lock().unwrap().server_name.clone()
    }

    pub fn server_address(&self) -> Option<ServerAddress> {
        self.inner.lock().unwrap().server_address.clone()
    }

    pub fn is_unassigned(&self) -> bool {
        self.state() == LifecycleState::Unassigned
    }

    pub fn is_pending_open(&self) -> bool {
        self.state() == LifecycleState::PendingOpen
    }

    pub fn is_open(&self) -> bool {
        self.state() == LifecycleState::Open
    }

    pub fn is_closing(&self) -> bool {
        self.state() == LifecycleState::Closing
    }

    pub fn is_pending_close(&self) -> bool {
        self.state() == LifecycleState::PendingClose
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LifecycleState::Closed
    }

    /// True anywhere on the open path: unassigned, pending open, or open.
    pub fn is_opening(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::Unassigned | LifecycleState::PendingOpen | LifecycleState::Open
        )
    }

    /// True when the region is being taken down for good: on the close path
    /// with the offline flag set.
    pub fn is_offlined(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        matches!(
            inner.state,
            LifecycleState::Closing | LifecycleState::PendingClose
        ) && inner.offline
    }

    /// Raw offline flag, independent of the current state.
    pub fn offline_flag(&self) -> bool {
        self.inner.lock().unwrap().offline
    }

    /// Callers ensure this is only invoked when reverting is safe; see the
    /// forced paths in the manager.
    pub fn set_unassigned(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = LifecycleState::Unassigned;
        inner.server_name = None;
        inner.server_address = None;
    }

    pub fn set_pending_open(&self, server_name: &str, address: &ServerAddress) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != LifecycleState::Unassigned {
            tracing::warn!(
                region = %self.info,
                state = %inner.state,
                "assigning a region that is not currently unassigned"
            );
        }
        inner.state = LifecycleState::PendingOpen;
        inner.server_name = Some(server_name.to_string());
        inner.server_address = Some(address.clone());
    }

    pub fn set_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != LifecycleState::PendingOpen {
            tracing::warn!(
                region = %self.info,
                state = %inner.state,
                "marking open a region that was not pending open"
            );
        }
        inner.state = LifecycleState::Open;
    }

    /// If the region was already asked to open, the close keeps the server
    /// recorded by the assignment rather than the caller's view.
    pub fn set_closing(
        &self,
        server_name: &str,
        address: Option<&ServerAddress>,
        set_offline: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != LifecycleState::PendingOpen {
            inner.server_name = Some(server_name.to_string());
            inner.server_address = address.cloned();
        }
        inner.state = LifecycleState::Closing;
        inner.offline = set_offline;
    }

    pub fn set_pending_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != LifecycleState::Closing {
            tracing::warn!(
                region = %self.info,
                state = %inner.state,
                "marking pending close a region that was not closing"
            );
        }
        inner.state = LifecycleState::PendingClose;
    }

    pub fn set_closed(&self) -> Result<(), IllegalTransition> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            LifecycleState::PendingClose | LifecycleState::PendingOpen | LifecycleState::Closing => {
                inner.state = LifecycleState::Closed;
                Ok(())
            }
            from => Err(IllegalTransition {
                region: self.info.region_name_string(),
                from,
            }),
        }
    }
}

impl fmt::Debug for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("RegionState")
            .field("region", &self.info.region_name_string())
            .field("state", &inner.state)
            .field("server_name", &inner.server_name)
            .field("offline", &inner.offline)
            .finish()
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(
            f,
            "name={}, state={}",
            self.info.region_name_string(),
            inner.state
        )
    }
}
