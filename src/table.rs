//! Session table: an arena of sessions with a free-list, two handle indices
//! and per-target accounting, all behind one lock.
//!
//! The lock is a [`parking_lot::Mutex`]; every method takes it for the
//! duration of the call and releases it before returning, so it is never
//! held across network I/O.

use crate::client;
use crate::config::{Endpoint, RelayConfig, TargetId};
use crate::error::{Error, Result};
use crate::server;
use crate::session::{
    Handle, Progress, Role, Session, SessionId, SessionState, UNSPECIFIED_DESTINATION,
};
use crate::stats::{ServerStats, ServerStatsSnapshot, TargetStats};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Target is the routing context sessions are created against
struct Target {
    endpoint: Arc<Endpoint>,
    enabled: bool,
    stats: TargetStats,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Inbound,
    Outbound,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Option<Session>>,
    free: Vec<u32>,
    by_inbound: HashMap<Handle, SessionId>,
    by_outbound: HashMap<Handle, SessionId>,
    targets: HashMap<TargetId, Target>,
    default_endpoint: Option<Arc<Endpoint>>,
}

impl Inner {
    fn session(&self, id: SessionId) -> Option<&Session> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    /// allocate takes the most recently freed slot, or grows the arena
    fn allocate(&mut self) -> SessionId {
        match self.free.pop() {
            Some(index) => SessionId(index),
            None => {
                self.slots.push(None);
                SessionId((self.slots.len() - 1) as u32)
            }
        }
    }

    fn lookup(&self, direction: Direction, handle: Handle) -> Option<SessionId> {
        match direction {
            Direction::Inbound => self.by_inbound.get(&handle).copied(),
            Direction::Outbound => self.by_outbound.get(&handle).copied(),
        }
    }

    /// remove takes a session out of both indices, folds its bytes into its
    /// target and frees the slot
    fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.slots.get_mut(id.0 as usize).and_then(Option::take)?;

        for (handle, direction) in [
            (session.inbound(), Direction::Inbound),
            (session.outbound(), Direction::Outbound),
        ] {
            let Some(handle) = handle else { continue };
            let index = self.index(direction);
            if index.get(&handle) == Some(&id) {
                index.remove(&handle);
            }
        }

        if let Some(entry) = self.targets.get_mut(&session.target()) {
            entry
                .stats
                .record_close(session.bytes_sent(), session.bytes_received());
        }

        self.free.push(id.0);
        Some(session)
    }

    fn index(&mut self, direction: Direction) -> &mut HashMap<Handle, SessionId> {
        match direction {
            Direction::Inbound => &mut self.by_inbound,
            Direction::Outbound => &mut self.by_outbound,
        }
    }

    fn register(&mut self, id: SessionId, handle: Handle, direction: Direction) -> Result<()> {
        if !handle.is_valid() {
            return Err(Error::InvalidHandle);
        }

        let previous = match self.session(id) {
            Some(session) => match direction {
                Direction::Inbound => session.inbound(),
                Direction::Outbound => session.outbound(),
            },
            None => return Err(Error::SessionNotFound(id)),
        };

        let index = self.index(direction);
        if let Some(&owner) = index.get(&handle) {
            if owner != id {
                return Err(Error::HandleInUse { handle, owner });
            }
        }

        // A session owns at most one handle per direction
        if let Some(old) = previous.filter(|old| *old != handle) {
            index.remove(&old);
        }
        index.insert(handle, id);

        if let Some(session) = self.session_mut(id) {
            match direction {
                Direction::Inbound => session.set_inbound(Some(handle)),
                Direction::Outbound => session.set_outbound(Some(handle)),
            }
        }

        debug!(session = %id, %handle, ?direction, "handle registered");
        Ok(())
    }
}

/// SessionTable owns every live session
pub struct SessionTable {
    inner: Mutex<Inner>,
    config: RelayConfig,
    server_stats: ServerStats,
}

/// SessionTable implementation block
impl SessionTable {
    /// new is a constructor for the SessionTable type
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;

        let inner = Inner {
            default_endpoint: config.default_endpoint.clone(),
            ..Inner::default()
        };

        Ok(Self {
            inner: Mutex::new(inner),
            config,
            server_stats: ServerStats::default(),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    // =========
    // TARGETS
    // =========

    /// enable_target attaches an endpoint to target and allows sessions on
    /// it. Without an explicit endpoint the default endpoint is used.
    /// Statistics survive re-enabling
    pub fn enable_target(&self, target: TargetId, endpoint: Option<Arc<Endpoint>>) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let endpoint = endpoint
            .or_else(|| inner.default_endpoint.clone())
            .ok_or_else(|| {
                Error::config(format!("{target} has no endpoint and no default is set"))
            })?;
        endpoint.validate()?;

        info!(%target, endpoint = %endpoint.addr, protocol = %endpoint.protocol, "target enabled");

        match inner.targets.get_mut(&target) {
            Some(entry) => {
                entry.endpoint = endpoint;
                entry.enabled = true;
            }
            None => {
                inner.targets.insert(
                    target,
                    Target {
                        endpoint,
                        enabled: true,
                        stats: TargetStats::default(),
                    },
                );
            }
        }
        Ok(())
    }

    /// disable_target refuses new sessions on target; existing sessions are
    /// left alone. Returns whether the target was enabled
    pub fn disable_target(&self, target: TargetId) -> bool {
        let mut inner = self.inner.lock();
        match inner.targets.get_mut(&target) {
            Some(entry) if entry.enabled => {
                entry.enabled = false;
                info!(%target, "target disabled");
                true
            }
            _ => false,
        }
    }

    /// set_default_endpoint replaces the endpoint used by targets enabled
    /// without one
    pub fn set_default_endpoint(&self, endpoint: Arc<Endpoint>) -> Result<()> {
        endpoint.validate()?;
        self.inner.lock().default_endpoint = Some(endpoint);
        Ok(())
    }

    /// target_stats returns the counters of target, zeros if it was never used
    pub fn target_stats(&self, target: TargetId) -> TargetStats {
        self.inner
            .lock()
            .targets
            .get(&target)
            .map(|entry| entry.stats)
            .unwrap_or_default()
    }

    pub fn server_stats(&self) -> ServerStatsSnapshot {
        self.server_stats.snapshot()
    }

    pub(crate) fn server_counters(&self) -> &ServerStats {
        &self.server_stats
    }

    // ===========
    // LIFECYCLE
    // ===========

    /// create allocates a client-role session toward destination through
    /// target's endpoint. Fails with a capacity error, counted against the
    /// target, when its connection limit is reached
    pub fn create(&self, destination: SocketAddrV4, target: TargetId) -> Result<SessionId> {
        self.insert(Role::Client, target, destination)
    }

    /// accept allocates a server-role session for a client that connected to
    /// target's listener. Its destination is learned from the CONNECT request
    pub fn accept(&self, target: TargetId) -> Result<SessionId> {
        self.insert(Role::Server, target, UNSPECIFIED_DESTINATION)
    }

    fn insert(&self, role: Role, target: TargetId, destination: SocketAddrV4) -> Result<SessionId> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let entry = inner
            .targets
            .get_mut(&target)
            .filter(|entry| entry.enabled)
            .ok_or(Error::TargetDisabled(target))?;

        let limit = entry.endpoint.max_connections;
        if limit > 0 && entry.stats.active_connections >= limit {
            entry.stats.record_failure();
            warn!(%target, limit, "connection limit reached");
            return Err(Error::Capacity { target, limit });
        }
        entry.stats.record_open();
        let endpoint = Arc::clone(&entry.endpoint);

        let id = inner.allocate();
        let session = Session::new(id, role, target, destination, endpoint, Instant::now());
        inner.slots[id.0 as usize] = Some(session);

        debug!(session = %id, %target, ?role, %destination, "session created");
        Ok(id)
    }

    /// delete removes a session: both handle indices first, then its bytes
    /// are folded into the target and the slot is freed for reuse
    pub fn delete(&self, id: SessionId) -> Result<()> {
        let session = self.inner.lock().remove(id).ok_or(Error::SessionNotFound(id))?;
        debug!(session = %id, state = %session.state(), "session deleted");
        Ok(())
    }

    /// release_inbound drops the session bound to an inbound handle once its
    /// connection is gone. See [`SessionTable::release_outbound`]
    pub fn release_inbound(&self, handle: Handle) -> Option<SessionId> {
        self.release(handle, Direction::Inbound)
    }

    /// release_outbound drops the session bound to an outbound handle once
    /// its connection is gone. A session in ERROR stays in the table for the
    /// reaper unless reaping is disabled. Returns the deleted identity
    pub fn release_outbound(&self, handle: Handle) -> Option<SessionId> {
        self.release(handle, Direction::Outbound)
    }

    fn release(&self, handle: Handle, direction: Direction) -> Option<SessionId> {
        let mut inner = self.inner.lock();
        let id = inner.lookup(direction, handle)?;

        let failed = inner
            .session(id)
            .is_some_and(|session| session.state() == SessionState::Error);
        if failed && !self.config.session_timeout.is_zero() {
            debug!(session = %id, %handle, "failed session left for the reaper");
            return None;
        }

        let session = inner.remove(id)?;
        debug!(session = %id, state = %session.state(), "session released");
        Some(id)
    }

    /// len is the number of live sessions
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========
    // HANDLES
    // =========

    pub fn register_inbound(&self, id: SessionId, handle: Handle) -> Result<()> {
        self.inner.lock().register(id, handle, Direction::Inbound)
    }

    pub fn register_outbound(&self, id: SessionId, handle: Handle) -> Result<()> {
        self.inner.lock().register(id, handle, Direction::Outbound)
    }

    pub fn lookup_by_inbound(&self, handle: Handle) -> Option<SessionId> {
        self.inner.lock().lookup(Direction::Inbound, handle)
    }

    pub fn lookup_by_outbound(&self, handle: Handle) -> Option<SessionId> {
        self.inner.lock().lookup(Direction::Outbound, handle)
    }

    /// with_inbound runs f on the session bound to an inbound handle. Handles
    /// are never recycled by the table, so a session that was deleted and had
    /// its slot reused is not found
    pub fn with_inbound<R>(&self, handle: Handle, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.with_handle(handle, Direction::Inbound, f)
    }

    /// with_outbound runs f on the session bound to an outbound handle
    pub fn with_outbound<R>(&self, handle: Handle, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.with_handle(handle, Direction::Outbound, f)
    }

    fn with_handle<R>(
        &self,
        handle: Handle,
        direction: Direction,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        let id = inner.lookup(direction, handle)?;
        inner.session_mut(id).map(f)
    }

    // ==========
    // SESSIONS
    // ==========

    /// with_session runs f on the session under the table lock. f must not
    /// block
    pub fn with_session<R>(&self, id: SessionId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.inner.lock().session_mut(id).map(f)
    }

    /// drive_client feeds bytes from the upstream to a client-role session
    pub fn drive_client(&self, id: SessionId, input: &[u8]) -> Result<Progress> {
        self.with_session(id, |session| client::drive(session, input))
            .ok_or(Error::SessionNotFound(id))?
    }

    /// drive_server feeds bytes from an inbound client to a server-role session
    pub fn drive_server(&self, id: SessionId, input: &[u8]) -> Result<Progress> {
        let stats = &self.server_stats;
        self.with_session(id, |session| server::drive(session, input, stats))
            .ok_or(Error::SessionNotFound(id))?
    }

    /// reuse_for_destination finds an established client session of target
    /// already bound to destination and refreshes its activity. Always None
    /// when pooling is off
    pub fn reuse_for_destination(
        &self,
        target: TargetId,
        destination: SocketAddrV4,
    ) -> Option<SessionId> {
        if !self.config.enable_pooling {
            return None;
        }

        let mut inner = self.inner.lock();
        let session = inner.slots.iter_mut().flatten().find(|session| {
            session.role() == Role::Client
                && session.target() == target
                && session.destination() == destination
                && session.state() == SessionState::Established
        })?;

        session.touch();
        debug!(session = %session.id(), %destination, "reusing established session");
        Some(session.id())
    }

    // ========
    // REAPER
    // ========

    /// reap evicts errored, closed and idle sessions
    pub fn reap(&self) -> Vec<SessionId> {
        self.reap_at(Instant::now())
    }

    /// reap_at is reap with the caller's clock. Expired identities are
    /// collected and removed under one hold of the lock. A zero session
    /// timeout disables reaping entirely
    pub fn reap_at(&self, now: Instant) -> Vec<SessionId> {
        let timeout = self.config.session_timeout;
        if timeout.is_zero() {
            return Vec::new();
        }

        let mut inner = self.inner.lock();
        let expired: Vec<SessionId> = inner
            .slots
            .iter()
            .flatten()
            .filter(|session| session.state().is_terminal() || session.is_idle(now, timeout))
            .map(Session::id)
            .collect();

        for id in &expired {
            if let Some(session) = inner.remove(*id) {
                debug!(session = %id, state = %session.state(), "session reaped");
            }
        }
        drop(inner);

        if !expired.is_empty() {
            info!(count = expired.len(), "reaped sessions");
        }
        expired
    }

    /// describe lists every live session, one per line
    pub fn describe(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        for session in inner.slots.iter().flatten() {
            let _ = writeln!(out, "{session}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    const TARGET: TargetId = TargetId(7);

    fn endpoint() -> Arc<Endpoint> {
        Arc::new(Endpoint::new("192.0.2.1:1080".parse().unwrap()))
    }

    fn table_with(config: RelayConfig, endpoint: Arc<Endpoint>) -> SessionTable {
        let table = SessionTable::new(config).unwrap();
        table.enable_target(TARGET, Some(endpoint)).unwrap();
        table
    }

    fn table() -> SessionTable {
        table_with(RelayConfig::default(), endpoint())
    }

    fn dst() -> SocketAddrV4 {
        "10.0.0.5:443".parse().unwrap()
    }

    fn establish(table: &SessionTable, id: SessionId) {
        table
            .with_session(id, |session| {
                session.advance(SessionState::Greeting).unwrap();
                session.advance(SessionState::Request).unwrap();
                session.establish().unwrap();
            })
            .unwrap();
    }

    #[test]
    fn indices_are_reused_only_after_delete() {
        let table = table();
        let a = table.create(dst(), TARGET).unwrap();
        let b = table.create(dst(), TARGET).unwrap();
        let c = table.create(dst(), TARGET).unwrap();
        assert_eq!((a, b, c), (SessionId(0), SessionId(1), SessionId(2)));

        table.delete(b).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.create(dst(), TARGET).unwrap(), SessionId(1));
        assert_eq!(table.create(dst(), TARGET).unwrap(), SessionId(3));
    }

    #[test]
    fn delete_removes_handle_indices() {
        let table = table();
        let id = table.create(dst(), TARGET).unwrap();
        table.register_inbound(id, Handle(10)).unwrap();
        table.register_outbound(id, Handle(11)).unwrap();
        assert_eq!(table.lookup_by_inbound(Handle(10)), Some(id));
        assert_eq!(table.lookup_by_outbound(Handle(11)), Some(id));

        table.delete(id).unwrap();
        assert_eq!(table.lookup_by_inbound(Handle(10)), None);
        assert_eq!(table.lookup_by_outbound(Handle(11)), None);
        assert!(matches!(table.delete(id), Err(Error::SessionNotFound(_))));

        // The freed handle is usable by the next session in the same slot
        let id = table.create(dst(), TARGET).unwrap();
        table.register_inbound(id, Handle(10)).unwrap();
    }

    #[test]
    fn registration_misuse_is_rejected_without_changes() {
        let table = table();
        let a = table.create(dst(), TARGET).unwrap();
        let b = table.create(dst(), TARGET).unwrap();

        assert!(matches!(
            table.register_inbound(a, Handle::INVALID),
            Err(Error::InvalidHandle)
        ));
        assert!(matches!(
            table.register_inbound(SessionId(99), Handle(1)),
            Err(Error::SessionNotFound(SessionId(99)))
        ));

        table.register_inbound(a, Handle(1)).unwrap();
        assert!(matches!(
            table.register_inbound(b, Handle(1)),
            Err(Error::HandleInUse { owner, .. }) if owner == a
        ));
        assert_eq!(table.with_session(b, |s| s.inbound()), Some(None));
    }

    #[test]
    fn reregistering_replaces_previous_handle() {
        let table = table();
        let id = table.create(dst(), TARGET).unwrap();
        table.register_inbound(id, Handle(1)).unwrap();
        table.register_inbound(id, Handle(2)).unwrap();

        assert_eq!(table.lookup_by_inbound(Handle(1)), None);
        assert_eq!(table.lookup_by_inbound(Handle(2)), Some(id));
    }

    #[test]
    fn capacity_limit_counts_failures() {
        let endpoint = Arc::new(
            Endpoint::new("192.0.2.1:1080".parse().unwrap()).with_max_connections(2),
        );
        let table = table_with(RelayConfig::default(), endpoint);

        let a = table.create(dst(), TARGET).unwrap();
        table.create(dst(), TARGET).unwrap();
        let err = table.create(dst(), TARGET).unwrap_err();
        assert!(err.is_recoverable());

        let stats = table.target_stats(TARGET);
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.connection_failures, 1);

        table.delete(a).unwrap();
        table.create(dst(), TARGET).unwrap();
        assert_eq!(table.target_stats(TARGET).total_connections, 3);
    }

    #[test]
    fn disabled_and_unknown_targets_refuse_sessions() {
        let table = table();
        assert!(matches!(
            table.create(dst(), TargetId(99)),
            Err(Error::TargetDisabled(TargetId(99)))
        ));

        assert!(table.disable_target(TARGET));
        assert!(!table.disable_target(TARGET));
        assert!(matches!(
            table.create(dst(), TARGET),
            Err(Error::TargetDisabled(_))
        ));
        assert_eq!(table.target_stats(TargetId(99)), TargetStats::default());
    }

    #[test]
    fn enable_without_endpoint_uses_default() {
        let table = SessionTable::new(RelayConfig::default()).unwrap();
        assert!(matches!(
            table.enable_target(TARGET, None),
            Err(Error::Config(_))
        ));

        table.set_default_endpoint(endpoint()).unwrap();
        table.enable_target(TARGET, None).unwrap();
        let id = table.create(dst(), TARGET).unwrap();
        assert_eq!(
            table.with_session(id, |s| s.endpoint().addr),
            Some("192.0.2.1:1080".parse().unwrap())
        );

        let portless = Arc::new(Endpoint::new("192.0.2.1:0".parse().unwrap()));
        assert!(table.set_default_endpoint(portless).is_err());
    }

    #[test]
    fn delete_folds_bytes_into_target() {
        let table = table();
        let id = table.create(dst(), TARGET).unwrap();
        establish(&table, id);
        table
            .with_session(id, |s| {
                s.forward_to_upstream(300).unwrap();
                s.forward_to_client(1200).unwrap();
            })
            .unwrap();
        table.delete(id).unwrap();

        let stats = table.target_stats(TARGET);
        assert_eq!(stats.bytes_sent, 300);
        assert_eq!(stats.bytes_received, 1200);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn reuse_returns_same_established_session() {
        let table = table();
        let id = table.create(dst(), TARGET).unwrap();
        assert_eq!(table.reuse_for_destination(TARGET, dst()), None);

        establish(&table, id);
        assert_eq!(table.reuse_for_destination(TARGET, dst()), Some(id));
        assert_eq!(table.reuse_for_destination(TARGET, dst()), Some(id));
        assert_eq!(table.len(), 1);
        assert_eq!(table.target_stats(TARGET).total_connections, 1);

        assert_eq!(
            table.reuse_for_destination(TARGET, "10.0.0.5:80".parse().unwrap()),
            None
        );
        assert_eq!(table.reuse_for_destination(TargetId(1), dst()), None);
    }

    #[test]
    fn reuse_honours_pooling_switch() {
        let config = RelayConfig {
            enable_pooling: false,
            ..RelayConfig::default()
        };
        let table = table_with(config, endpoint());
        let id = table.create(dst(), TARGET).unwrap();
        establish(&table, id);
        assert_eq!(table.reuse_for_destination(TARGET, dst()), None);
    }

    #[test]
    fn reaper_boundary() {
        let timeout = Duration::from_secs(300);
        let config = RelayConfig {
            session_timeout: timeout,
            ..RelayConfig::default()
        };
        let table = table_with(config, endpoint());
        let base = Instant::now();

        let stale = table.create(dst(), TARGET).unwrap();
        let fresh = table.create(dst(), TARGET).unwrap();
        table.with_session(stale, |s| s.touch_at(base)).unwrap();
        table
            .with_session(fresh, |s| s.touch_at(base + Duration::from_secs(2)))
            .unwrap();

        // stale is timeout + 1s idle, fresh is timeout - 1s idle
        let now = base + timeout + Duration::from_secs(1);
        assert_eq!(table.reap_at(now), vec![stale]);
        assert_eq!(table.len(), 1);
        assert!(table.with_session(fresh, |_| ()).is_some());
    }

    #[test]
    fn reaper_evicts_errored_sessions_immediately() {
        let table = table();
        let id = table.create(dst(), TARGET).unwrap();
        let keep = table.create(dst(), TARGET).unwrap();
        table
            .with_session(id, |s| s.fail(Error::Authentication))
            .unwrap();

        assert_eq!(table.reap(), vec![id]);
        assert!(table.with_session(keep, |_| ()).is_some());
    }

    #[test]
    fn reaping_clears_indices_and_folds_bytes() {
        let table = table();
        let id = table.create(dst(), TARGET).unwrap();
        table.register_inbound(id, Handle(10)).unwrap();
        table.register_outbound(id, Handle(11)).unwrap();
        establish(&table, id);
        table
            .with_session(id, |s| {
                s.forward_to_upstream(40).unwrap();
                s.forward_to_client(90).unwrap();
                s.fail(Error::Authentication);
            })
            .unwrap();

        assert_eq!(table.reap(), vec![id]);
        assert_eq!(table.lookup_by_inbound(Handle(10)), None);
        assert_eq!(table.lookup_by_outbound(Handle(11)), None);

        let stats = table.target_stats(TARGET);
        assert_eq!((stats.bytes_sent, stats.bytes_received), (40, 90));
        assert_eq!(stats.active_connections, 0);

        // The slot is reused, the old handles stay unbound
        assert_eq!(table.create(dst(), TARGET).unwrap(), id);
        assert_eq!(table.with_inbound(Handle(10), |_| ()), None);
        assert_eq!(table.with_outbound(Handle(11), |_| ()), None);
    }

    #[test]
    fn reuse_refreshes_activity() {
        let timeout = Duration::from_millis(200);
        let config = RelayConfig {
            session_timeout: timeout,
            ..RelayConfig::default()
        };
        let table = table_with(config, endpoint());
        let base = Instant::now();

        let reused = table.create(dst(), TARGET).unwrap();
        let other = table.create("10.0.0.6:443".parse().unwrap(), TARGET).unwrap();
        for id in [reused, other] {
            establish(&table, id);
            table.with_session(id, |s| s.touch_at(base)).unwrap();
        }

        thread::sleep(Duration::from_millis(150));
        assert_eq!(table.reuse_for_destination(TARGET, dst()), Some(reused));
        assert!(table.with_session(reused, |s| s.last_activity()).unwrap() > base);

        // Only the untouched session has been idle past the timeout
        let now = base + timeout + Duration::from_millis(50);
        assert_eq!(table.reap_at(now), vec![other]);
        assert!(table.with_session(reused, |_| ()).is_some());
    }

    #[test]
    fn release_keeps_failed_sessions_for_the_reaper() {
        let table = table();
        let clean = table.accept(TARGET).unwrap();
        let failed = table.accept(TARGET).unwrap();
        table.register_inbound(clean, Handle(1)).unwrap();
        table.register_inbound(failed, Handle(2)).unwrap();
        table
            .with_session(failed, |s| s.fail(Error::Authentication))
            .unwrap();

        assert_eq!(table.release_inbound(Handle(1)), Some(clean));
        assert_eq!(table.release_inbound(Handle(2)), None);
        assert_eq!(table.release_inbound(Handle(3)), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.target_stats(TARGET).active_connections, 1);

        assert_eq!(table.reap(), vec![failed]);
        assert!(table.is_empty());
    }

    #[test]
    fn release_deletes_failed_sessions_when_reaping_is_off() {
        let config = RelayConfig {
            session_timeout: Duration::ZERO,
            ..RelayConfig::default()
        };
        let table = table_with(config, endpoint());
        let id = table.create(dst(), TARGET).unwrap();
        table.register_outbound(id, Handle(5)).unwrap();
        table.with_session(id, |s| s.fail(Error::Authentication)).unwrap();

        assert_eq!(table.release_outbound(Handle(5)), Some(id));
        assert!(table.is_empty());
    }

    #[test]
    fn zero_timeout_disables_reaping() {
        let config = RelayConfig {
            session_timeout: Duration::ZERO,
            ..RelayConfig::default()
        };
        let table = table_with(config, endpoint());
        let id = table.create(dst(), TARGET).unwrap();
        table.with_session(id, |s| s.close()).unwrap();

        assert!(table.reap_at(Instant::now() + Duration::from_secs(3600)).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn describe_lists_sessions() {
        let table = table();
        table.create(dst(), TARGET).unwrap();
        assert_eq!(
            table.describe(),
            "[0] dst=10.0.0.5:443 state=idle tx=0 rx=0 errors=0\n"
        );
    }

    #[test]
    fn concurrent_create_and_delete() {
        let table = Arc::new(table());

        let workers: Vec<_> = (0..8)
            .map(|n| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..100u64 {
                        let id = table.create(dst(), TARGET).unwrap();
                        table.register_inbound(id, Handle(n * 1000 + i)).unwrap();
                        table.delete(id).unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert!(table.is_empty());
        let stats = table.target_stats(TARGET);
        assert_eq!(stats.total_connections, 800);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(table.lookup_by_inbound(Handle(0)), None);
    }
}
