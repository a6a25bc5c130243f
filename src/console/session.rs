//! Daemon side of a console attachment
//!
//! Each `console` call creates a [`ConsoleSession`]: a private Unix socket
//! that the caller's proxy connects to, bridged byte-for-byte onto the
//! backend's console stream. Sessions move through
//! `Created → Attached ⇄ Resizing → Closed`, and the socket file lives
//! exactly as long as the session.

use crate::backend::Backend;
use crate::daemon::auth::AuthContext;
use crate::error::{Error, Result};
use crate::signal::Cancellation;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, DirBuilder, Permissions};
use std::io;
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lifecycle stage of a console session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket bound, waiting for the proxy
    Created,
    /// Proxy connected, bytes flowing
    Attached,
    /// A resize is being forwarded to the backend
    Resizing,
    /// Proxy gone or console ended; socket unlinked
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Attached => "attached",
            SessionState::Resizing => "resizing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Inner {
    state: SessionState,
    width: u16,
    height: u16,
    /// Clones of the bridged streams so `close` can unblock the copy loops
    streams: Vec<UnixStream>,
}

/// One console attachment owned by the daemon
pub struct ConsoleSession {
    owner: String,
    socket_path: PathBuf,
    backend: Arc<dyn Backend>,
    inner: Mutex<Inner>,
    closer: Cancellation,
}

impl ConsoleSession {
    fn new(
        owner: String,
        socket_path: PathBuf,
        backend: Arc<dyn Backend>,
        width: u16,
        height: u16,
    ) -> Result<Self> {
        Ok(Self {
            owner,
            socket_path,
            backend,
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                width,
                height,
                streams: Vec::new(),
            }),
            closer: Cancellation::new()?,
        })
    }

    /// Account whose container this console belongs to
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Last dimensions successfully forwarded to the backend
    pub fn dimensions(&self) -> (u16, u16) {
        let inner = self.lock();
        (inner.width, inner.height)
    }

    /// Forward new terminal dimensions to the backend's console
    ///
    /// Only valid while a proxy is attached; the byte stream is untouched.
    pub fn resize(&self, width: u16, height: u16) -> Result<()> {
        {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Attached | SessionState::Resizing => {
                    inner.state = SessionState::Resizing;
                }
                state => {
                    return Err(Error::InvalidState(format!(
                        "Cannot resize a console session that is {}",
                        state
                    )));
                }
            }
        }

        let result = self.backend.resize_console(&self.owner, width, height);

        let mut inner = self.lock();
        if inner.state == SessionState::Resizing {
            inner.state = SessionState::Attached;
        }
        if result.is_ok() {
            inner.width = width;
            inner.height = height;
            log::debug!("Resized console {} to {}x{}", self.socket_path.display(), width, height);
        }
        result
    }

    /// Tear the session down from outside (daemon shutdown)
    pub fn close(&self) {
        self.closer.cancel();
        let inner = self.lock();
        for stream in &inner.streams {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run(&self, listener: UnixListener, device: UnixStream, attach_timeout: Duration) {
        match self.wait_for_proxy(&listener, attach_timeout) {
            Ok(Some(proxy)) => {
                drop(listener);
                if let Err(e) = self.bridge(proxy, device) {
                    log::warn!("Console {} failed: {}", self.socket_path.display(), e);
                }
            }
            Ok(None) => {
                log::info!("No proxy attached to {}, closing", self.socket_path.display());
            }
            Err(e) => {
                log::warn!("Waiting for console proxy failed: {}", e);
            }
        }
        self.finish();
    }

    fn wait_for_proxy(&self, listener: &UnixListener, timeout: Duration) -> Result<Option<UnixStream>> {
        listener.set_nonblocking(true)?;
        // A timeout too large to represent means wait until closed
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    let millis = i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX);
                    PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
                }
                None => PollTimeout::NONE,
            };

            let mut fds = [
                PollFd::new(self.closer.as_fd(), PollFlags::POLLIN),
                PollFd::new(listener.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, wait) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            }

            if is_ready(&fds[0]) {
                return Ok(None);
            }
            if !is_ready(&fds[1]) {
                continue;
            }

            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(Some(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn bridge(&self, proxy: UnixStream, device: UnixStream) -> Result<()> {
        {
            let mut inner = self.lock();
            if self.closer.is_cancelled() {
                return Ok(());
            }
            inner.streams = vec![proxy.try_clone()?, device.try_clone()?];
            inner.state = SessionState::Attached;
        }
        log::info!("Console {} attached for {}", self.socket_path.display(), self.owner);

        let mut proxy_in = proxy.try_clone()?;
        let mut device_out = device.try_clone()?;
        let upstream = thread::Builder::new()
            .name("console-upstream".to_string())
            .spawn(move || {
                let _ = io::copy(&mut proxy_in, &mut device_out);
                let _ = proxy_in.shutdown(Shutdown::Both);
                let _ = device_out.shutdown(Shutdown::Both);
            })?;

        let (mut device_in, mut proxy_out) = (device, proxy);
        let _ = io::copy(&mut device_in, &mut proxy_out);
        let _ = device_in.shutdown(Shutdown::Both);
        let _ = proxy_out.shutdown(Shutdown::Both);

        let _ = upstream.join();
        Ok(())
    }

    fn finish(&self) {
        let mut inner = self.lock();
        inner.state = SessionState::Closed;
        inner.streams.clear();
        drop(inner);

        if let Err(e) = fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", self.socket_path.display(), e);
            }
        }
        log::info!("Console {} closed", self.socket_path.display());
    }
}

fn is_ready(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .map_or(false, |r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
}

type SessionMap = Arc<Mutex<HashMap<PathBuf, Arc<ConsoleSession>>>>;

/// All live console sessions, keyed by socket path
pub struct ConsoleRegistry {
    dir: PathBuf,
    attach_timeout: Duration,
    sessions: SessionMap,
    threads: Mutex<Vec<JoinHandle<()>>>,
    counter: AtomicU64,
}

impl ConsoleRegistry {
    pub fn new(dir: impl Into<PathBuf>, attach_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            attach_timeout,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            threads: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Open the owner's console and expose it on a fresh socket
    pub fn open(
        &self,
        backend: Arc<dyn Backend>,
        ctx: &AuthContext,
        width: u16,
        height: u16,
    ) -> Result<Arc<ConsoleSession>> {
        DirBuilder::new().recursive(true).mode(0o711).create(&self.dir)?;

        let device = backend.open_console(&ctx.owner, width, height)?;

        let socket_path = self.dir.join(format!(
            "{}-{}-{}.sock",
            ctx.owner,
            std::process::id(),
            self.counter.fetch_add(1, Ordering::Relaxed)
        ));
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        fs::set_permissions(&socket_path, Permissions::from_mode(0o600))?;
        if nix::unistd::geteuid().is_root() {
            nix::unistd::chown(&socket_path, Some(nix::unistd::Uid::from_raw(ctx.caller_uid)), None)
                .map_err(io::Error::from)?;
        }

        let session = Arc::new(ConsoleSession::new(
            ctx.owner.clone(),
            socket_path.clone(),
            backend,
            width,
            height,
        )?);
        self.lock_sessions().insert(socket_path.clone(), Arc::clone(&session));

        let runner = Arc::clone(&session);
        let sessions = Arc::clone(&self.sessions);
        let attach_timeout = self.attach_timeout;
        let spawned = thread::Builder::new()
            .name("console-session".to_string())
            .spawn(move || {
                runner.run(listener, device, attach_timeout);
                sessions
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(runner.socket_path());
            });

        match spawned {
            Ok(handle) => {
                let mut threads = self.threads.lock().unwrap_or_else(|p| p.into_inner());
                threads.retain(|t| !t.is_finished());
                threads.push(handle);
            }
            Err(e) => {
                self.lock_sessions().remove(&socket_path);
                let _ = fs::remove_file(&socket_path);
                return Err(e.into());
            }
        }

        log::info!("Opened console {} for {} ({}x{})", socket_path.display(), ctx.owner, width, height);
        Ok(session)
    }

    /// Look up a live session by the path handed to the client
    pub fn get(&self, socket_path: &Path) -> Option<Arc<ConsoleSession>> {
        self.lock_sessions().get(socket_path).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session and wait for their threads
    pub fn close_all(&self) {
        let sessions: Vec<_> = self.lock_sessions().values().cloned().collect();
        for session in sessions {
            session.close();
        }

        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|p| p.into_inner()));
        for thread in threads {
            let _ = thread.join();
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<ConsoleSession>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::io::{Read, Write};

    fn owner_ctx(owner: &str) -> AuthContext {
        AuthContext {
            caller: owner.to_string(),
            caller_uid: nix::unistd::geteuid().as_raw(),
            owner: owner.to_string(),
        }
    }

    fn setup(attach_timeout: Duration) -> (tempfile::TempDir, Arc<MemoryBackend>, ConsoleRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::default());
        let fingerprint = backend.list_images().unwrap()[0].fingerprint.clone();
        backend.create_container(&fingerprint, "alice").unwrap();
        let registry = ConsoleRegistry::new(dir.path().join("consoles"), attach_timeout);
        (dir, backend, registry)
    }

    fn wait_for_state(session: &ConsoleSession, state: SessionState) {
        for _ in 0..200 {
            if session.state() == state {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("session never reached {}", state);
    }

    #[test]
    fn test_resize_before_attach_is_invalid() {
        let (_dir, backend, registry) = setup(Duration::from_secs(5));
        let session = registry.open(backend, &owner_ctx("alice"), 80, 24).unwrap();

        assert_eq!(session.state(), SessionState::Created);
        assert!(matches!(session.resize(100, 30), Err(Error::InvalidState(_))));
        registry.close_all();
    }

    #[test]
    fn test_attach_bridge_resize_and_close() {
        let (_dir, backend, registry) = setup(Duration::from_secs(5));
        let session = registry
            .open(backend.clone(), &owner_ctx("alice"), 80, 24)
            .unwrap();
        let path = session.socket_path().to_path_buf();
        assert!(path.exists());

        let mut proxy = UnixStream::connect(&path).unwrap();
        wait_for_state(&session, SessionState::Attached);

        proxy.write_all(b"ls\r").unwrap();
        let mut buf = [0u8; 3];
        proxy.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ls\r");

        session.resize(132, 43).unwrap();
        assert_eq!(session.state(), SessionState::Attached);
        assert_eq!(session.dimensions(), (132, 43));
        assert_eq!(backend.console_size("alice"), Some((132, 43)));

        drop(proxy);
        wait_for_state(&session, SessionState::Closed);
        assert!(matches!(session.resize(80, 24), Err(Error::InvalidState(_))));
        assert!(!path.exists(), "socket is unlinked when the session ends");

        for _ in 0..200 {
            if registry.get(&path).is_none() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(registry.get(&path).is_none());
    }

    #[test]
    fn test_unattached_session_times_out() {
        let (_dir, backend, registry) = setup(Duration::from_millis(50));
        let session = registry.open(backend, &owner_ctx("alice"), 80, 24).unwrap();
        wait_for_state(&session, SessionState::Closed);
        assert!(!session.socket_path().exists());
    }

    #[test]
    fn test_unbounded_attach_timeout_waits_until_closed() {
        let (_dir, backend, registry) = setup(Duration::from_secs(u64::MAX));
        let session = registry.open(backend, &owner_ctx("alice"), 80, 24).unwrap();
        let path = session.socket_path().to_path_buf();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(session.state(), SessionState::Created);
        assert!(path.exists());

        registry.close_all();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!path.exists());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_all_ends_attached_sessions() {
        let (_dir, backend, registry) = setup(Duration::from_secs(5));
        let session = registry.open(backend, &owner_ctx("alice"), 80, 24).unwrap();
        let mut proxy = UnixStream::connect(session.socket_path()).unwrap();
        wait_for_state(&session, SessionState::Attached);

        registry.close_all();
        assert_eq!(session.state(), SessionState::Closed);

        let mut buf = [0u8; 1];
        assert_eq!(proxy.read(&mut buf).unwrap_or(0), 0);
    }

    #[test]
    fn test_open_fails_without_container() {
        let (_dir, backend, registry) = setup(Duration::from_secs(5));
        assert!(registry.open(backend, &owner_ctx("bob"), 80, 24).is_err());
        assert!(registry.is_empty());
    }
}
