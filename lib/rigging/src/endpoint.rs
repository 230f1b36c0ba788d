//! The multi-worker TCP front end. A configurable pool of worker threads
//! each runs its own `mio::Poll` loop; every worker registers a clone of
//! every listening socket and races the others to accept. A connection is
//! pinned to the worker that accepted it for its whole life, so command
//! dispatch for one client is strictly serial.

use crate::channel::{Channel, Conduit};
use crate::frame::Header;
use crate::support::{ErrorUtils, NetworkError};
use crate::version::Version;
use hashbrown::HashMap;
use keel::crypto::Cipher;
use keel::logging;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Identity of one accepted connection, fixed at accept time.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Process-unique id; also the registry key the application uses.
    pub token: usize,
    pub version: Version,
    /// The application tag the listener was configured with (the game layer
    /// stores its per-port behavior here).
    pub tag: u32,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// What a handler may touch while a command (or connect event) for one
/// client is being processed on its home worker.
pub struct CommandCtx<'a> {
    pub info: &'a ConnectionInfo,
    pub conduit: &'a Arc<Conduit>,
    /// The inbound cipher slot; handshake handlers install ciphers here.
    pub crypt_in: &'a mut Option<Box<dyn Cipher>>,
}

/// The application side of the transport: the game server implements this
/// once and hands it to the endpoint.
pub trait Dispatch: Send + Sync + 'static {
    fn on_connect(&self, ctx: &mut CommandCtx);

    /// Handles one decrypted command. An error here is logged and the client
    /// is marked for disconnect; it never takes down the worker.
    fn on_command(
        &self,
        ctx: &mut CommandCtx,
        header: Header,
        payload: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    fn on_disconnect(&self, info: &ConnectionInfo);
}

struct ListenerConfig {
    socket: std::net::TcpListener,
    version: Version,
    tag: u32,
    address: SocketAddr,
}

/// Owns the listening sockets and the worker pool.
pub struct Endpoint<D: Dispatch> {
    app: Arc<D>,
    threads: usize,
    listeners: Vec<ListenerConfig>,
    workers: Vec<thread::JoinHandle<()>>,
    wakers: Arc<Mutex<Vec<Arc<Waker>>>>,
    should_exit: Arc<AtomicBool>,
    log: logging::Logger,
}

impl<D: Dispatch> Endpoint<D> {
    pub fn new(app: Arc<D>, threads: usize, log: &logging::Logger) -> Endpoint<D> {
        let threads = threads.max(1);
        Endpoint {
            app,
            threads,
            listeners: Vec::new(),
            workers: Vec::new(),
            wakers: Arc::new(Mutex::new(Vec::new())),
            should_exit: Arc::new(AtomicBool::new(false)),
            log: log.new(logging::o!("source" => "endpoint")),
        }
    }

    /// Binds a listening socket for one client dialect. Must be called
    /// before `start`.
    pub fn listen(&mut self, address: SocketAddr, version: Version, tag: u32) -> io::Result<()> {
        let socket = std::net::TcpListener::bind(address)?;
        socket.set_nonblocking(true)?;
        logging::info!(self.log, "listening";
                       "address" => %address,
                       "version" => version.name());
        self.listeners.push(ListenerConfig { socket, version, tag, address });
        Ok(())
    }

    /// Spawns the worker threads. Each worker gets a clone of every
    /// listening socket.
    pub fn start(&mut self) -> io::Result<()> {
        for index in 0..self.threads {
            let mut specs = Vec::with_capacity(self.listeners.len());
            for listener in &self.listeners {
                let socket = listener.socket.try_clone()?;
                specs.push((socket, listener.version, listener.tag, listener.address));
            }

            let app = self.app.clone();
            let should_exit = self.should_exit.clone();
            let wakers = self.wakers.clone();
            let log = self.log.new(logging::o!("worker" => index));

            let handle = thread::Builder::new()
                .name(format!("endpoint-worker-{}", index))
                .spawn(move || {
                    match Worker::new(index, app, specs, should_exit, log.clone()) {
                        Ok(mut worker) => {
                            wakers.lock().unwrap().push(worker.waker.clone());
                            worker.run();
                        }
                        Err(err) => {
                            logging::error!(log, "worker failed to start"; "error" => %err);
                        }
                    }
                })?;
            self.workers.push(handle);
        }
        Ok(())
    }

    /// Closes the listeners and asks every worker loop to drain and stop.
    pub fn schedule_stop(&mut self) {
        logging::info!(self.log, "scheduling exit for all workers");
        self.should_exit.store(true, Ordering::Release);
        self.listeners.clear();
        for waker in self.wakers.lock().unwrap().iter() {
            let _ = waker.wake();
        }
    }

    pub fn wait_for_stop(&mut self) {
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        logging::info!(self.log, "shutdown complete");
    }
}

struct Connection {
    channel: Channel,
    info: ConnectionInfo,
}

struct Worker<D: Dispatch> {
    index: usize,
    app: Arc<D>,
    poll: Poll,
    waker: Arc<Waker>,
    listeners: Vec<(TcpListener, Version, u32)>,
    connections: HashMap<usize, Connection>,
    free_slots: Vec<usize>,
    next_slot: usize,
    should_exit: Arc<AtomicBool>,
    log: logging::Logger,
}

impl<D: Dispatch> Worker<D> {
    fn new(
        index: usize,
        app: Arc<D>,
        specs: Vec<(std::net::TcpListener, Version, u32, SocketAddr)>,
        should_exit: Arc<AtomicBool>,
        log: logging::Logger,
    ) -> io::Result<Worker<D>> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut listeners = Vec::with_capacity(specs.len());
        for (slot, (socket, version, tag, _)) in specs.into_iter().enumerate() {
            let mut listener = TcpListener::from_std(socket);
            poll.registry().register(&mut listener, Token(slot), Interest::READABLE)?;
            listeners.push((listener, version, tag));
        }

        Ok(Worker {
            index,
            app,
            poll,
            waker,
            listeners,
            connections: HashMap::new(),
            free_slots: Vec::new(),
            next_slot: 0,
            should_exit,
            log,
        })
    }

    fn run(&mut self) {
        let mut events = Events::with_capacity(1024);
        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(EXIT_POLL_INTERVAL)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(self.log, "poll failed"; "error" => %err);
                break;
            }

            if self.should_exit.load(Ordering::Acquire) {
                break;
            }

            let mut touched = Vec::new();
            let mut service_all = false;
            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => service_all = true,
                    Token(t) if t < self.listeners.len() => self.accept(t),
                    Token(t) => touched.push((
                        t - self.listeners.len(),
                        event.is_readable(),
                        event.is_writable(),
                    )),
                }
            }

            for (slot, readable, writable) in touched {
                self.service_connection(slot, readable, writable);
            }
            if service_all {
                let slots: Vec<usize> = self.connections.keys().copied().collect();
                for slot in slots {
                    self.service_connection(slot, false, true);
                }
            }
        }
        self.shutdown();
    }

    fn accept(&mut self, listener_index: usize) {
        loop {
            let (listener, version, tag) = &self.listeners[listener_index];
            match listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let version = *version;
                    let tag = *tag;
                    let local_addr = match stream.local_addr() {
                        Ok(addr) => addr,
                        Err(err) => {
                            logging::warn!(self.log, "no local address for accepted socket";
                                           "error" => %err);
                            continue;
                        }
                    };

                    let slot = match self.free_slots.pop() {
                        Some(slot) => slot,
                        None => {
                            let slot = self.next_slot;
                            self.next_slot += 1;
                            slot
                        }
                    };
                    let token = Token(self.listeners.len() + slot);
                    if let Err(err) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
                    {
                        logging::warn!(self.log, "failed to register stream"; "error" => %err);
                        self.free_slots.push(slot);
                        continue;
                    }

                    let info = ConnectionInfo {
                        token: (self.index << 24) | slot,
                        version,
                        tag,
                        local_addr,
                        peer_addr,
                    };
                    logging::info!(self.log, "client connected";
                                   "peer" => %peer_addr,
                                   "version" => version.name());

                    let conduit =
                        Arc::new(Conduit::new(version, info.token, Some(self.waker.clone())));
                    let mut channel = Channel::new(stream, version, conduit);
                    {
                        let (conduit, crypt_in) = channel.dispatch_parts();
                        let mut ctx = CommandCtx { info: &info, conduit, crypt_in };
                        self.app.on_connect(&mut ctx);
                    }
                    self.connections.insert(slot, Connection { channel, info });
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn service_connection(&mut self, slot: usize, readable: bool, writable: bool) {
        let app = self.app.clone();
        let log = self.log.clone();
        let mut remove = false;

        if let Some(conn) = self.connections.get_mut(&slot) {
            if readable && conn.channel.is_established() {
                match conn.channel.receive() {
                    Ok(eof) => {
                        Self::dispatch_commands(&app, conn, &log);
                        if eof {
                            conn.channel.start_drain();
                        }
                    }
                    Err(NetworkError::Wait) => {}
                    Err(err) => {
                        logging::warn!(log, "error in client stream"; "error" => %err);
                        remove = true;
                    }
                }
            }

            if !remove {
                if conn.channel.conduit().disconnect_requested() && conn.channel.is_established() {
                    conn.channel.start_drain();
                }

                if writable || conn.channel.conduit().has_pending() {
                    match conn.channel.flush() {
                        Ok(empty) => {
                            if empty && !conn.channel.is_established() {
                                remove = true;
                            }
                        }
                        Err(NetworkError::Wait) => {}
                        Err(_) => remove = true,
                    }
                } else if !conn.channel.is_established() {
                    // Nothing left to flush for a draining connection.
                    remove = true;
                }
            }
        }

        if remove {
            self.close_connection(slot);
        }
    }

    fn dispatch_commands(app: &Arc<D>, conn: &mut Connection, log: &logging::Logger) {
        loop {
            if conn.channel.conduit().disconnect_requested() {
                return;
            }
            match conn.channel.next_command() {
                Ok(Some((header, payload))) => {
                    let (conduit, crypt_in) = conn.channel.dispatch_parts();
                    let conduit = conduit.clone();
                    let mut ctx = CommandCtx { info: &conn.info, conduit: &conduit, crypt_in };
                    if let Err(err) = app.on_command(&mut ctx, header, &payload) {
                        logging::info!(log, "error in command handler";
                                       "command" => header.command,
                                       "error" => %err);
                        conduit.request_disconnect();
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    logging::warn!(log, "unframeable client data"; "error" => %err);
                    conn.channel.conduit().request_disconnect();
                    return;
                }
            }
        }
    }

    fn close_connection(&mut self, slot: usize) {
        if let Some(mut conn) = self.connections.remove(&slot) {
            let _ = conn.channel.deregister(self.poll.registry());
            logging::info!(self.log, "client disconnected"; "peer" => %conn.info.peer_addr);
            self.app.on_disconnect(&conn.info);
            self.free_slots.push(slot);
        }
    }

    fn shutdown(&mut self) {
        let slots: Vec<usize> = self.connections.keys().copied().collect();
        for slot in slots {
            if let Some(conn) = self.connections.get_mut(&slot) {
                // One last best-effort flush before the socket drops.
                if conn.channel.flush().has_failed() {
                    logging::debug!(self.log, "flush failed during shutdown");
                }
            }
            self.close_connection(slot);
        }
    }
}
