//! The dynamic-DNS update contract the supervisor calls on a schedule. Grounded on spec §6
//! and `original_source/upagekite/__init__.py`'s `check_dns`. The concrete implementation
//! (signed HTTP GET to `up.pagekite.net`) lives in the separate `ddns` crate so the
//! supervisor can be tested against a fake updater without opening sockets.

use pagekite_core::error::PkResult;

#[derive(Debug, Clone)]
pub struct DdnsUpdate {
    pub kite_name: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdnsOutcome {
    Updated,
    Unchanged,
}

pub trait DdnsUpdater: Send {
    fn update(&mut self, request: &DdnsUpdate) -> PkResult<DdnsOutcome>;
}

/// An updater that never contacts anything, for kites that only serve LAN traffic through
/// `LocalListener` and never register with a public relay.
pub struct NullDdnsUpdater;

impl DdnsUpdater for NullDdnsUpdater {
    fn update(&mut self, _request: &DdnsUpdate) -> PkResult<DdnsOutcome> {
        Ok(DdnsOutcome::Unchanged)
    }
}
