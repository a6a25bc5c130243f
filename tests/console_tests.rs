use nix::pty::openpty;
use nix::sys::termios::{self, LocalFlags};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use webspace::backend::{Backend, MemoryBackend};
use webspace::console::{
    resize_notifier, run_proxy, ConsoleRegistry, ProxyExit, ESCAPE_BYTE, ESCAPE_DETACH,
};
use webspace::daemon::{register_backend, MethodTable, PeerIdentity, RpcClient, RpcServer};
use webspace::signal::{Cancellation, SignalHandler};
use webspace::terminal::{self, RawMode};
use webspace::Error;

/// Stand-in terminal and session socket for driving the proxy loop
struct Harness {
    keyboard: UnixStream,
    input: UnixStream,
    socket: UnixStream,
    remote: UnixStream,
    output: Vec<u8>,
    cancel: Cancellation,
}

impl Harness {
    fn new() -> Self {
        let (keyboard, input) = UnixStream::pair().unwrap();
        let (socket, remote) = UnixStream::pair().unwrap();
        Self {
            keyboard,
            input,
            socket,
            remote,
            output: Vec::new(),
            cancel: Cancellation::new().unwrap(),
        }
    }

    fn run(&mut self) -> webspace::Result<ProxyExit> {
        run_proxy(&self.cancel, &mut self.input, &mut self.socket, &mut self.output)
    }

    /// Everything the proxy forwarded to the session socket so far
    fn forwarded(&mut self) -> Vec<u8> {
        self.remote.set_nonblocking(true).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match self.remote.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("read failed: {}", e),
            }
        }
        out
    }
}

#[test]
fn test_escape_quit_detaches_without_forwarding() {
    let mut h = Harness::new();
    h.keyboard.write_all(&[ESCAPE_BYTE, ESCAPE_DETACH]).unwrap();

    assert_eq!(h.run().unwrap(), ProxyExit::Detached);
    assert!(h.forwarded().is_empty());
}

#[test]
fn test_escape_other_forwards_both_and_continues() {
    let mut h = Harness::new();
    h.keyboard.write_all(&[ESCAPE_BYTE, b'x', b'y']).unwrap();
    h.keyboard.shutdown(std::net::Shutdown::Write).unwrap();

    // The loop kept going after the escape and only stopped at end of input
    assert_eq!(h.run().unwrap(), ProxyExit::InputClosed);
    assert_eq!(h.forwarded(), vec![ESCAPE_BYTE, b'x', b'y']);
}

#[test]
fn test_keystrokes_are_forwarded_verbatim() {
    let mut h = Harness::new();
    h.keyboard.write_all(b"ls -l\r\x03").unwrap();
    h.keyboard.write_all(&[ESCAPE_BYTE, ESCAPE_DETACH]).unwrap();

    assert_eq!(h.run().unwrap(), ProxyExit::Detached);
    assert_eq!(h.forwarded(), b"ls -l\r\x03".to_vec());
}

#[test]
fn test_socket_output_reaches_terminal() {
    let mut h = Harness::new();
    h.remote.write_all(b"login: ").unwrap();
    h.remote.shutdown(std::net::Shutdown::Write).unwrap();

    assert_eq!(h.run().unwrap(), ProxyExit::RemoteClosed);
    assert_eq!(h.output, b"login: ".to_vec());
}

#[test]
fn test_zero_length_read_ends_loop_and_restores_once() {
    let pty = openpty(None, None).unwrap();
    let tty = pty.slave.as_fd();
    let before = termios::tcgetattr(tty).unwrap();

    let mut h = Harness::new();
    drop(std::mem::replace(&mut h.remote, UnixStream::pair().unwrap().0));

    let mut raw = RawMode::enable(tty).unwrap();
    assert_eq!(h.run().unwrap(), ProxyExit::RemoteClosed);
    raw.restore().unwrap();
    assert!(!raw.is_active());

    let after = termios::tcgetattr(tty).unwrap();
    assert_eq!(after.local_flags, before.local_flags);

    // A later change must survive the guard going away
    let mut changed = after.clone();
    changed.local_flags.remove(LocalFlags::ECHO);
    termios::tcsetattr(tty, termios::SetArg::TCSANOW, &changed).unwrap();
    drop(raw);
    assert!(!termios::tcgetattr(tty).unwrap().local_flags.contains(LocalFlags::ECHO));
}

#[test]
fn test_cancellation_wakes_blocked_loop() {
    let mut h = Harness::new();
    let cancel = h.cancel.clone();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
    });

    // Nothing arrives on either endpoint; only the cancellation can end this
    assert_eq!(h.run().unwrap(), ProxyExit::Cancelled);
    canceller.join().unwrap();
}

#[test]
fn test_cancellation_takes_priority_over_input() {
    let mut h = Harness::new();
    h.keyboard.write_all(b"abc").unwrap();
    h.cancel.cancel();

    assert_eq!(h.run().unwrap(), ProxyExit::Cancelled);
    assert!(h.forwarded().is_empty());
}

#[test]
fn test_large_paste_into_echoing_console_completes() {
    const PASTE_LEN: usize = 1 << 20;

    let (mut keyboard, mut input) = UnixStream::pair().unwrap();
    let (mut socket, mut remote) = UnixStream::pair().unwrap();
    let cancel = Cancellation::new().unwrap();

    // The remote end behaves like a tty with echo on
    let echo = thread::spawn(move || {
        let mut received = 0;
        let mut echoing = true;
        let mut buf = [0u8; 4096];
        loop {
            let n = match remote.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            received += n;
            if echoing && remote.write_all(&buf[..n]).is_err() {
                echoing = false;
            }
        }
        received
    });

    let typist = thread::spawn(move || {
        keyboard.write_all(&vec![b'a'; PASTE_LEN]).unwrap();
        keyboard.write_all(&[ESCAPE_BYTE, ESCAPE_DETACH]).unwrap();
        keyboard
    });

    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut screen = Vec::new();
        let exit = run_proxy(&cancel, &mut input, &mut socket, &mut screen);
        drop(socket);
        let _ = done_tx.send((exit, screen.len()));
    });

    let (exit, shown) = done_rx
        .recv_timeout(Duration::from_secs(60))
        .expect("proxy stopped making progress during the paste");
    assert_eq!(exit.unwrap(), ProxyExit::Detached);
    assert!(shown <= PASTE_LEN);

    assert_eq!(echo.join().unwrap(), PASTE_LEN);
    drop(typist.join().unwrap());
}

#[test]
fn test_window_change_resizes_attached_console() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::default());
    let consoles = Arc::new(ConsoleRegistry::new(dir.path().join("consoles"), Duration::from_secs(5)));
    let mut table = MethodTable::new();
    register_backend(&mut table, backend.clone(), Arc::clone(&consoles));

    let socket_path = dir.path().join("unix.socket");
    let server = RpcServer::bind(&socket_path, table)
        .unwrap()
        .with_consoles(Arc::clone(&consoles));
    let shutdown = server.shutdown_handle();
    let server_thread = thread::spawn(move || server.serve());

    let owner = PeerIdentity::resolve(nix::unistd::geteuid().as_raw(), "webspace-admin").user;
    let client = RpcClient::new(&socket_path);
    let fingerprint = client.images().unwrap()[0].fingerprint.clone();
    client.init(&fingerprint).unwrap();

    // Start from a size no real terminal reports
    let session = client.console(7, 3).unwrap();
    let mut proxy_socket = UnixStream::connect(&session).unwrap();
    proxy_socket.write_all(b"x").unwrap();
    let mut echoed = [0u8; 1];
    proxy_socket.read_exact(&mut echoed).unwrap();

    let cancel = Cancellation::new().unwrap();
    let (tx, rx) = mpsc::channel();
    let mut notify = resize_notifier(&client, &session);
    let signals = SignalHandler::install_with_resize(cancel.clone(), move || {
        notify();
        let _ = tx.send(());
    })
    .unwrap();

    nix::sys::signal::raise(nix::sys::signal::Signal::SIGWINCH).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).expect("window change not handled");
    assert_eq!(backend.console_size(&owner), Some(terminal::dimensions()));
    assert!(!cancel.is_cancelled());

    drop(signals);
    drop(proxy_socket);
    shutdown.shutdown();
    server_thread.join().unwrap().unwrap();
}

#[test]
fn test_console_attach_resize_and_detach_through_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::default());
    let consoles = Arc::new(ConsoleRegistry::new(dir.path().join("consoles"), Duration::from_secs(5)));
    let mut table = MethodTable::new();
    register_backend(&mut table, backend.clone(), Arc::clone(&consoles));

    let socket_path = dir.path().join("unix.socket");
    let server = RpcServer::bind(&socket_path, table)
        .unwrap()
        .with_consoles(Arc::clone(&consoles));
    let shutdown = server.shutdown_handle();
    let server_thread = thread::spawn(move || server.serve());

    let owner = PeerIdentity::resolve(nix::unistd::geteuid().as_raw(), "webspace-admin").user;
    let client = RpcClient::new(&socket_path);
    let fingerprint = client.images().unwrap()[0].fingerprint.clone();
    client.init(&fingerprint).unwrap();

    let session = client.console(80, 24).unwrap();
    assert!(session.exists());
    assert_eq!(backend.console_size(&owner), Some((80, 24)));

    // Resizing before the proxy attaches is rejected
    assert!(matches!(client.console_resize(&session, 100, 40), Err(Error::InvalidState(_))));

    let (mut keyboard, mut input) = UnixStream::pair().unwrap();
    let (mut screen_out, mut screen) = UnixStream::pair().unwrap();
    let mut proxy_socket = UnixStream::connect(&session).unwrap();
    let cancel = Cancellation::new().unwrap();
    let proxy = thread::spawn(move || run_proxy(&cancel, &mut input, &mut proxy_socket, &mut screen_out));

    keyboard.write_all(b"hi").unwrap();
    let mut echoed = [0u8; 2];
    screen.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hi");

    client.console_resize(&session, 100, 40).unwrap();
    assert_eq!(backend.console_size(&owner), Some((100, 40)));

    keyboard.write_all(&[ESCAPE_BYTE, ESCAPE_DETACH]).unwrap();
    assert_eq!(proxy.join().unwrap().unwrap(), ProxyExit::Detached);

    // The proxy's socket closed with the loop; the daemon tears the session down
    for _ in 0..200 {
        if !session.exists() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!session.exists());
    assert!(matches!(client.console_resize(&session, 80, 24), Err(Error::InvalidState(_))));

    shutdown.shutdown();
    server_thread.join().unwrap().unwrap();
    assert!(backend.container_status(&owner).is_ok());
}
