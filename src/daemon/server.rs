use crate::console::ConsoleRegistry;
use crate::daemon::auth::{AuthContext, PeerIdentity};
use crate::daemon::config::DaemonConfig;
use crate::daemon::methods::MethodTable;
use crate::daemon::protocol::{read_message, write_message, Call, Message, Reply};
use crate::error::{Error, Result};
use crate::signal::Cancellation;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::any::Any;
use std::collections::HashMap;
use std::fs::{self, Permissions};
use std::io;
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Default time shutdown waits for in-flight calls
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection identifier (for shutdown bookkeeping)
type ConnectionId = u64;

/// Bookkeeping shared between the accept loop and connection workers
#[derive(Default)]
struct Tracker {
    in_flight: Mutex<usize>,
    idle: Condvar,
    connections: Mutex<HashMap<ConnectionId, UnixStream>>,
    next_id: AtomicU64,
}

impl Tracker {
    fn register(&self, stream: &UnixStream) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match stream.try_clone() {
            Ok(clone) => {
                self.lock_connections().insert(id, clone);
            }
            Err(e) => log::warn!("Connection {} cannot be force-closed on shutdown: {}", id, e),
        }
        id
    }

    fn unregister(&self, id: ConnectionId) {
        self.lock_connections().remove(&id);
    }

    fn begin_call(&self) -> InFlight<'_> {
        *self.lock_in_flight() += 1;
        InFlight(self)
    }

    /// Wait until no call is running or `timeout` elapses; returns calls still running
    fn drain(&self, timeout: Duration) -> usize {
        let guard = self.lock_in_flight();
        let (guard, _) = self
            .idle
            .wait_timeout_while(guard, timeout, |n| *n > 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }

    fn close_all(&self) {
        for (_, stream) in self.lock_connections().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, UnixStream>> {
        self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Marks one call as running until dropped
struct InFlight<'a>(&'a Tracker);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut n = self.0.lock_in_flight();
        *n = n.saturating_sub(1);
        if *n == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Requests server shutdown from any thread
#[derive(Clone)]
pub struct ShutdownHandle {
    cancel: Cancellation,
}

impl ShutdownHandle {
    /// Stop accepting connections. Returns true only for the first request.
    pub fn shutdown(&self) -> bool {
        let first = self.cancel.cancel();
        if first {
            log::info!("Shutdown requested");
        }
        first
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The underlying cancellation event, for wiring up signal handlers
    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }
}

/// Unix socket RPC server
///
/// One thread per connection; the accept loop only polls the listener and
/// the shutdown event.
pub struct RpcServer {
    socket_path: PathBuf,
    listener: UnixListener,
    table: Arc<MethodTable>,
    admin_group: Arc<str>,
    drain_timeout: Duration,
    shutdown: Cancellation,
    tracker: Arc<Tracker>,
    consoles: Option<Arc<ConsoleRegistry>>,
}

impl RpcServer {
    /// Bind the Unix socket at `path`
    ///
    /// A stale socket file left by a previous run is removed first; a socket
    /// that still has a live listener is reported as in use.
    pub fn bind(path: impl AsRef<Path>, table: MethodTable) -> Result<Self> {
        let socket_path = path.as_ref().to_path_buf();
        let bind_error = |source: io::Error| Error::Bind {
            path: socket_path.clone(),
            source,
        };

        if socket_path.exists() {
            if UnixStream::connect(&socket_path).is_ok() {
                return Err(bind_error(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "another server is listening on this socket",
                )));
            }
            fs::remove_file(&socket_path).map_err(bind_error)?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(bind_error)?;

        // Every local account may connect; callers are told apart by peer credentials
        fs::set_permissions(&socket_path, Permissions::from_mode(0o666)).map_err(bind_error)?;

        Ok(Self {
            socket_path,
            listener,
            table: Arc::new(table),
            admin_group: Arc::from("webspace-admin"),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            shutdown: Cancellation::new()?,
            tracker: Arc::new(Tracker::default()),
            consoles: None,
        })
    }

    /// Bind according to the daemon configuration
    pub fn from_config(
        config: &DaemonConfig,
        table: MethodTable,
        consoles: Arc<ConsoleRegistry>,
    ) -> Result<Self> {
        Ok(Self::bind(&config.bind_socket, table)?
            .with_admin_group(&config.admin_group)
            .with_drain_timeout(config.drain_timeout)
            .with_consoles(consoles))
    }

    pub fn with_admin_group(mut self, group: &str) -> Self {
        self.admin_group = Arc::from(group);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Console sessions to close when the server stops
    pub fn with_consoles(mut self, consoles: Arc<ConsoleRegistry>) -> Self {
        self.consoles = Some(consoles);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            cancel: self.shutdown.clone(),
        }
    }

    /// Run the accept loop until shutdown is requested, then drain
    pub fn serve(&self) -> Result<()> {
        log::info!("Listening on {}", self.socket_path.display());

        let result = self.accept_loop();

        let stuck = self.tracker.drain(self.drain_timeout);
        if stuck > 0 {
            log::warn!("{} call(s) still running after {:?}, closing anyway", stuck, self.drain_timeout);
        }
        self.tracker.close_all();
        if let Some(consoles) = &self.consoles {
            consoles.close_all();
        }
        self.remove_socket();

        log::info!("Server stopped");
        result
    }

    fn accept_loop(&self) -> Result<()> {
        self.listener.set_nonblocking(true)?;

        loop {
            let mut fds = [
                PollFd::new(self.shutdown.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.listener.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            }

            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.listener.accept() {
                Ok((stream, _addr)) => self.spawn_worker(stream),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => log::error!("Error accepting connection: {}", e),
            }
        }
    }

    fn spawn_worker(&self, stream: UnixStream) {
        // Reset to blocking mode for the connection
        if let Err(e) = stream.set_nonblocking(false) {
            log::error!("Error configuring connection: {}", e);
            return;
        }

        let id = self.tracker.register(&stream);
        let table = Arc::clone(&self.table);
        let tracker = Arc::clone(&self.tracker);
        let admin_group = Arc::clone(&self.admin_group);

        let spawned = thread::Builder::new()
            .name(format!("rpc-conn-{}", id))
            .spawn(move || {
                handle_connection(stream, &table, &tracker, &admin_group);
                tracker.unregister(id);
            });

        if let Err(e) = spawned {
            log::error!("Failed to spawn connection worker: {}", e);
            self.tracker.unregister(id);
        }
    }

    fn remove_socket(&self) {
        if let Err(e) = fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", self.socket_path.display(), e);
            }
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.remove_socket();
    }
}

/// Serve calls on one connection until the peer leaves or a frame is bad
fn handle_connection(mut stream: UnixStream, table: &MethodTable, tracker: &Tracker, admin_group: &str) {
    let identity = match PeerIdentity::from_stream(&stream, admin_group) {
        Ok(identity) => identity,
        Err(e) => {
            log::warn!("Rejecting connection without peer credentials: {}", e);
            return;
        }
    };
    log::debug!("Connection from {} (uid {})", identity.user, identity.uid);

    loop {
        let (message, msg_id) = match read_message(&mut stream) {
            Ok(received) => received,
            Err(Error::ConnectionLost) => break,
            Err(e) => {
                log::warn!("Closing connection from {}: {}", identity.user, e);
                break;
            }
        };

        let call = match message {
            Message::Call(call) => call,
            Message::Reply(_) => {
                log::warn!("Closing connection from {}: unexpected reply frame", identity.user);
                break;
            }
        };

        let reply = {
            let _running = tracker.begin_call();
            invoke(table, &identity, &call)
        };

        if let Err(e) = write_message(&mut stream, &Message::Reply(reply), msg_id) {
            log::debug!("Failed to send reply to {}: {}", identity.user, e);
            break;
        }
    }

    log::debug!("Connection from {} closed", identity.user);
}

/// Run one call; failures and panics become faults
fn invoke(table: &MethodTable, identity: &PeerIdentity, call: &Call) -> Reply {
    let ctx = AuthContext::for_call(identity, call.impersonate.as_deref());
    log::debug!("{} called {} as {}", ctx.caller, call.method, ctx.owner);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        table.dispatch(&ctx, &call.method, &call.args)
    }))
    .unwrap_or_else(|payload| {
        Err(Error::Remote(format!(
            "Internal error in {}: {}",
            call.method,
            panic_message(payload.as_ref())
        )))
    });

    if let Err(e) = &result {
        log::info!("{} for {} failed: {}", call.method, ctx.owner, e);
    }
    Reply::from(result)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("handler panicked")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn echo_table() -> MethodTable {
        let mut table = MethodTable::new();
        table.register("whoami", |ctx, _args| Ok(json!(ctx.owner)));
        table.register("explode", |_ctx, _args| -> Result<Value> { panic!("boom") });
        table
    }

    fn identity() -> PeerIdentity {
        PeerIdentity {
            uid: 1000,
            user: "alice".to_string(),
            is_admin: false,
        }
    }

    #[test]
    fn test_invoke_success_and_unknown_method() {
        let table = echo_table();
        let reply = invoke(&table, &identity(), &Call::new("whoami", vec![]));
        assert_eq!(reply, Reply::Ok(json!("alice")));

        let reply = invoke(&table, &identity(), &Call::new("missing", vec![]));
        assert!(matches!(reply.into_result(), Err(Error::NoSuchMethod(_))));
    }

    #[test]
    fn test_invoke_turns_panic_into_fault() {
        let table = echo_table();
        let reply = invoke(&table, &identity(), &Call::new("explode", vec![]));
        match reply.into_result() {
            Err(Error::Remote(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected remote fault, got {:?}", other),
        }
    }

    #[test]
    fn test_invoke_ignores_impersonation_for_non_admin() {
        let table = echo_table();
        let call = Call::new("whoami", vec![]).impersonating(Some("root".to_string()));
        assert_eq!(invoke(&table, &identity(), &call), Reply::Ok(json!("alice")));
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unix.socket");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let server = RpcServer::bind(&path, MethodTable::new()).unwrap();
        assert_eq!(server.socket_path(), path.as_path());
    }

    #[test]
    fn test_bind_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unix.socket");
        let _first = RpcServer::bind(&path, MethodTable::new()).unwrap();

        let err = RpcServer::bind(&path, MethodTable::new()).err().unwrap();
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[test]
    fn test_bind_unwritable_path() {
        let err = RpcServer::bind("/nonexistent-dir/unix.socket", MethodTable::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[test]
    fn test_drain_waits_for_in_flight_calls() {
        let tracker = Arc::new(Tracker::default());
        let running = Arc::clone(&tracker);

        let worker = thread::spawn(move || {
            let _call = running.begin_call();
            thread::sleep(Duration::from_millis(50));
        });
        thread::sleep(Duration::from_millis(10));

        assert_eq!(tracker.drain(Duration::from_secs(2)), 0);
        worker.join().unwrap();
    }

    #[test]
    fn test_drain_is_bounded() {
        let tracker = Tracker::default();
        let _stuck = tracker.begin_call();
        assert_eq!(tracker.drain(Duration::from_millis(20)), 1);
    }
}
