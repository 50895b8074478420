//! Per-peer connection endpoints: connection establishment with the
//! concurrent-connect tie-break, the connected steady state with its send
//! queue, graceful shutdown, failure and reconnection.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::component::Shared;
use crate::frag::{Cache, Fragment, RecvOutcome};
use crate::frame::{Handshake, HANDSHAKE_SIZE, HDR_TYPE_GET, HDR_TYPE_PUT, HDR_TYPE_SEND};
use crate::logging::{self, Logger};
use crate::module::Module;
use crate::proc::ProcessName;
use crate::progress::Target;
use crate::support::{
    CompletionFn, CompletionStatus, DescFlags, ErrorType, TransportError, TransportResult,
};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EndpointState {
    Closed,
    Connecting,
    ConnectAck,
    Connected,
    ShuttingDown,
    Failed,
}

type Completions = Vec<(Box<Fragment>, CompletionStatus)>;

/// Attempts superseded by a concurrent connect are retried at most this many
/// times before the endpoint fails for real.
const MAX_CONNECT_RETRIES: u32 = 8;

struct Core {
    state: EndpointState,
    stream: Option<TcpStream>,
    token: Option<Token>,
    /// Peer byte order differs from ours (negotiated at handshake).
    nbo: bool,
    write_armed: bool,
    connect_retries: u32,
    tx_queue: VecDeque<Box<Fragment>>,
    tx_frag: Option<Box<Fragment>>,
    rx_frag: Option<Box<Fragment>>,
    cache: Cache,
}

/// One peer connection. The `core` mutex is the endpoint send lock; the
/// receive side is additionally serialized by read-event ownership (a single
/// reactor drives the socket).
pub struct Endpoint {
    peer: ProcessName,
    addr: SocketAddr,
    shared: Arc<Shared>,
    module: Weak<Module>,
    log: Logger,
    core: Mutex<Core>,
}

impl Endpoint {
    pub(crate) fn new(
        peer: ProcessName,
        addr: SocketAddr,
        shared: Arc<Shared>,
        module: Weak<Module>,
    ) -> Arc<Endpoint> {
        let cache_size = shared.config.endpoint_cache;
        let log = shared.log.new(logging::o!("peer" => peer.to_string()));

        Arc::new(Endpoint {
            peer,
            addr,
            shared,
            module,
            log,
            core: Mutex::new(Core {
                state: EndpointState::Closed,
                stream: None,
                token: None,
                nbo: false,
                write_armed: false,
                connect_retries: 0,
                tx_queue: VecDeque::new(),
                tx_frag: None,
                rx_frag: None,
                cache: Cache::new(cache_size),
            }),
        })
    }

    #[inline]
    pub fn peer(&self) -> ProcessName {
        self.peer
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> EndpointState {
        self.core.lock().unwrap().state
    }

    /// True while exactly one socket is open for this endpoint.
    pub fn has_socket(&self) -> bool {
        self.core.lock().unwrap().stream.is_some()
    }

    /// Whether an inbound connection supersedes an in-flight outbound
    /// attempt. The peer with the lower identity keeps its outbound socket;
    /// the higher side yields and adopts the inbound one, so both ends
    /// converge on the lower peer's attempt.
    #[inline]
    pub(crate) fn inbound_beats_outbound(local: ProcessName, remote: ProcessName) -> bool {
        remote < local
    }

    // --- public verbs -----------------------------------------------------

    /// Enqueue a tagged fragment for transmission. Returns `Ok(true)` when
    /// the fragment completed inline (the callback then fires only with
    /// `always_callback`), `Ok(false)` when it was queued.
    pub fn send(self: &Arc<Self>, mut frag: Box<Fragment>, tag: u16) -> TransportResult<bool> {
        frag.setup_send(tag);
        self.submit(frag)
    }

    /// Emulated RDMA write: transmit `size` bytes from `local` into the
    /// peer's memory at `remote`.
    ///
    /// # Safety
    ///
    /// `local` must stay valid and unmodified until the completion callback
    /// runs, and `remote` must name writable memory of `size` bytes in the
    /// peer, obtained from the peer itself.
    pub unsafe fn put(
        self: &Arc<Self>,
        local: *const u8,
        remote: u64,
        size: usize,
        flags: DescFlags,
        cb: Option<CompletionFn>,
    ) -> TransportResult<bool> {
        if size > u32::max_value() as usize {
            return Err(TransportError::Fatal(ErrorType::PayloadTooLarge));
        }

        let mut frag = self.shared.pools.user.alloc()?;
        frag.flags = flags;
        if let Some(cb) = cb {
            frag.set_completion(cb);
        }
        frag.setup_put(local, remote, size as u32, 0);
        self.submit(frag)
    }

    /// Emulated RDMA read: fetch `size` bytes from the peer's memory at
    /// `remote` into `local`. `cb` fires once the reply lands.
    ///
    /// # Safety
    ///
    /// `local` must stay valid and otherwise untouched until `cb` runs;
    /// `remote` must name readable memory of `size` bytes in the peer.
    pub unsafe fn get(
        self: &Arc<Self>,
        local: *mut u8,
        remote: u64,
        size: usize,
        flags: DescFlags,
        cb: CompletionFn,
    ) -> TransportResult<()> {
        if size > u32::max_value() as usize {
            return Err(TransportError::Fatal(ErrorType::PayloadTooLarge));
        }

        let cookie = local as u64;
        self.shared.pending_gets.lock().unwrap().insert(cookie, cb);

        let mut frag = match self.shared.pools.user.alloc() {
            Ok(frag) => frag,
            Err(err) => {
                self.shared.pending_gets.lock().unwrap().remove(&cookie);
                return Err(err);
            }
        };
        frag.flags = flags;
        frag.setup_get(cookie, remote, size as u32);

        // If the request fragment itself fails, the pending get completes
        // with that failure instead of dangling.
        let shared = self.shared.clone();
        frag.set_completion(Box::new(move |status| {
            if let CompletionStatus::Error(_) = status {
                let pending = shared.pending_gets.lock().unwrap().remove(&cookie);
                if let Some(cb) = pending {
                    cb(status);
                }
            }
        }));

        match self.submit(frag) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.shared.pending_gets.lock().unwrap().remove(&cookie);
                Err(err)
            }
        }
    }

    /// Initiate a graceful close: a FIN is queued behind any pending sends,
    /// no new sends are accepted, and the socket closes once the queue
    /// drains.
    pub fn shutdown(self: &Arc<Self>) -> TransportResult<()> {
        let mut completions = Completions::new();

        {
            let mut guard = self.core.lock().unwrap();
            let core = &mut *guard;

            if core.state != EndpointState::Connected {
                return Ok(());
            }

            let mut frag = self.shared.pools.eager.alloc()?;
            frag.setup_fin();

            if core.tx_frag.is_none() && core.tx_queue.is_empty() {
                core.tx_frag = Some(frag);
            } else {
                core.tx_queue.push_back(frag);
            }
            core.state = EndpointState::ShuttingDown;

            if let Err(TransportError::Fatal(err)) = self.drain_locked(core, &mut completions) {
                self.fail_locked(core, err, &mut completions);
            }
        }

        self.shared.events.kick();
        self.finish(completions, false);
        Ok(())
    }

    /// Tear the endpoint down, completing outstanding fragments with the
    /// given status. Used by `del_procs` and transport teardown; the module
    /// error callback is not invoked for deliberate removal.
    pub(crate) fn close_for(&self, reason: ErrorType) {
        let mut completions = Completions::new();

        {
            let mut guard = self.core.lock().unwrap();
            let core = &mut *guard;
            self.fail_locked(core, reason, &mut completions);
        }

        self.finish(completions, false);
    }

    // --- send path --------------------------------------------------------

    fn submit(self: &Arc<Self>, frag: Box<Fragment>) -> TransportResult<bool> {
        let mut completions = Completions::new();
        let mut error: Option<ErrorType> = None;

        let result = {
            let mut guard = self.core.lock().unwrap();
            let core = &mut *guard;

            match core.state {
                EndpointState::ShuttingDown => {
                    completions.push((frag, CompletionStatus::Error(ErrorType::Closing)));
                    Err(TransportError::Fatal(ErrorType::Closing))
                }
                EndpointState::Closed | EndpointState::Failed => {
                    core.tx_queue.push_back(frag);
                    core.connect_retries = 0;
                    match self.start_connect(core) {
                        Ok(()) => Ok(false),
                        Err(TransportError::Fatal(err)) => {
                            self.fail_locked(core, err, &mut completions);
                            error = Some(err);
                            Err(TransportError::Fatal(err))
                        }
                        Err(TransportError::Wait) => Ok(false),
                    }
                }
                EndpointState::Connecting | EndpointState::ConnectAck => {
                    core.tx_queue.push_back(frag);
                    Ok(false)
                }
                EndpointState::Connected => {
                    if core.tx_frag.is_some() || !core.tx_queue.is_empty() {
                        core.tx_queue.push_back(frag);
                        Ok(false)
                    } else {
                        core.tx_frag = Some(frag);
                        match self.drain_locked(core, &mut completions) {
                            Ok(drained) => Ok(drained),
                            Err(TransportError::Fatal(err)) => {
                                self.fail_locked(core, err, &mut completions);
                                error = Some(err);
                                Err(TransportError::Fatal(err))
                            }
                            Err(TransportError::Wait) => Ok(false),
                        }
                    }
                }
            }
        };

        self.shared.events.kick();
        self.finish(completions, true);
        if let Some(err) = error {
            self.report_error(err);
        }
        result
    }

    /// Write fragments until the queue empties or the socket would block.
    /// Returns `Ok(true)` when nothing is left outstanding. Caller holds the
    /// send lock.
    fn drain_locked(&self, core: &mut Core, completions: &mut Completions) -> TransportResult<bool> {
        loop {
            if core.tx_frag.is_none() {
                match core.tx_queue.pop_front() {
                    Some(frag) => core.tx_frag = Some(frag),
                    None => {
                        self.want_write(core, false)?;
                        if core.state == EndpointState::ShuttingDown {
                            // FIN flushed; the connection closes for good.
                            self.close_locked(core);
                        }
                        return Ok(true);
                    }
                }
            }

            let sent = {
                let stream = core
                    .stream
                    .as_mut()
                    .expect("Connected endpoint must have a stream");
                let frag = core.tx_frag.as_mut().unwrap();
                frag.frag_send(stream)?
            };

            if sent {
                let frag = core.tx_frag.take().unwrap();
                completions.push((frag, CompletionStatus::Ok));
            } else {
                self.want_write(core, true)?;
                return Ok(false);
            }
        }
    }

    fn want_write(&self, core: &mut Core, on: bool) -> TransportResult<()> {
        if core.write_armed == on {
            return Ok(());
        }
        let token = match core.token {
            Some(token) => token,
            None => return Ok(()),
        };
        if let Some(stream) = core.stream.as_mut() {
            let interest = if on {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            self.shared.events.rearm(stream, token, interest)?;
            core.write_armed = on;
        }
        Ok(())
    }

    // --- connection establishment ----------------------------------------

    fn start_connect(self: &Arc<Self>, core: &mut Core) -> TransportResult<()> {
        let domain = match self.addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|_| TransportError::Fatal(ErrorType::ConnectFailed))?;
        socket
            .set_nonblocking(true)
            .map_err(|_| TransportError::Fatal(ErrorType::ConnectFailed))?;

        let config = &self.shared.config;
        if config.sndbuf > 0 {
            let _ = socket.set_send_buffer_size(config.sndbuf);
        }
        if config.rcvbuf > 0 {
            let _ = socket.set_recv_buffer_size(config.rcvbuf);
        }
        if !config.not_use_nodelay {
            let _ = socket.set_nodelay(true);
        }

        match socket.connect(&self.addr.into()) {
            Ok(()) => (),
            Err(ref err) if err.raw_os_error() == Some(nix::libc::EINPROGRESS) => (),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => (),
            Err(_) => return Err(TransportError::Fatal(ErrorType::ConnectFailed)),
        }

        let mut stream = TcpStream::from_std(socket.into());
        let token = self
            .shared
            .events
            .token_for(Target::Peer(Arc::downgrade(self)));
        self.shared
            .events
            .register(&mut stream, token, Interest::WRITABLE)?;

        core.stream = Some(stream);
        core.token = Some(token);
        core.write_armed = false;
        core.nbo = false;
        core.state = EndpointState::Connecting;

        logging::debug!(self.log, "connect initiated";
                        "context" => "connect",
                        "addr" => %self.addr);
        Ok(())
    }

    /// The outbound socket became writable: the connect finished (or
    /// failed). On success our handshake goes out and the endpoint waits for
    /// the peer's.
    fn connect_ready(&self, core: &mut Core) -> TransportResult<()> {
        let timeout = Duration::from_millis(self.shared.config.handshake_timeout_ms);
        let local = self.shared.local;

        let stream = core
            .stream
            .as_mut()
            .expect("Connecting endpoint must have a stream");

        match stream.take_error() {
            Ok(None) => (),
            // A refusal means nobody is listening; a reset here is usually
            // the peer's tie-break dropping our attempt.
            Ok(Some(ref err)) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(TransportError::Fatal(ErrorType::ConnectFailed));
            }
            Ok(Some(_)) => return Err(TransportError::Fatal(ErrorType::PeerHungUp)),
            Err(_) => return Err(TransportError::Fatal(ErrorType::ConnectFailed)),
        }

        let mut buf = [0u8; HANDSHAKE_SIZE];
        Handshake::new(local).encode(&mut buf);
        send_blocking(stream, &buf, timeout)?;

        core.state = EndpointState::ConnectAck;
        let token = core.token.expect("Connecting endpoint must have a token");
        let stream = core.stream.as_mut().unwrap();
        self.shared.events.rearm(stream, token, Interest::READABLE)?;
        core.write_armed = false;

        logging::debug!(self.log, "handshake sent"; "context" => "connect");
        Ok(())
    }

    /// The peer's handshake arrived on our outbound socket; the connection
    /// is established and queued fragments drain.
    fn handshake_ready(&self, core: &mut Core, completions: &mut Completions) -> TransportResult<()> {
        let timeout = Duration::from_millis(self.shared.config.handshake_timeout_ms);

        let (hs, nbo) = {
            let stream = core
                .stream
                .as_mut()
                .expect("Handshaking endpoint must have a stream");
            let mut buf = [0u8; HANDSHAKE_SIZE];
            recv_blocking(stream, &mut buf, timeout)?;
            Handshake::decode(&buf)?
        };

        if hs.name != self.peer {
            return Err(TransportError::Fatal(ErrorType::HandshakeMagic));
        }

        core.nbo = nbo;
        core.state = EndpointState::Connected;
        core.connect_retries = 0;

        logging::debug!(self.log, "endpoint connected";
                        "context" => "connect",
                        "nbo" => nbo);

        self.drain_locked(core, completions)?;
        Ok(())
    }

    /// An accepted socket carrying a valid handshake from our peer. Applies
    /// the concurrent-connect tie-break against any in-flight outbound
    /// attempt, then promotes the endpoint to `Connected`.
    pub(crate) fn accept_inbound(self: &Arc<Self>, mut stream: TcpStream, nbo: bool) {
        let mut completions = Completions::new();
        let mut error: Option<ErrorType> = None;

        {
            let mut guard = self.core.lock().unwrap();
            let core = &mut *guard;

            let adopt = match core.state {
                EndpointState::Closed | EndpointState::Failed => true,
                EndpointState::Connecting | EndpointState::ConnectAck => {
                    Self::inbound_beats_outbound(self.shared.local, self.peer)
                }
                EndpointState::Connected | EndpointState::ShuttingDown => false,
            };

            if !adopt {
                logging::debug!(self.log, "inbound connection rejected";
                                "context" => "accept",
                                "state" => ?core.state);
                let _ = stream.shutdown(std::net::Shutdown::Both);
                return;
            }

            // The inbound socket supersedes whatever was in flight.
            self.teardown_socket(core);

            let timeout = Duration::from_millis(self.shared.config.handshake_timeout_ms);
            let mut buf = [0u8; HANDSHAKE_SIZE];
            Handshake::new(self.shared.local).encode(&mut buf);
            if let Err(TransportError::Fatal(err)) = send_blocking(&mut stream, &buf, timeout) {
                self.fail_locked(core, err, &mut completions);
                error = Some(err);
            } else {
                let token = self
                    .shared
                    .events
                    .token_for(Target::Peer(Arc::downgrade(self)));
                match self.shared.events.register(&mut stream, token, Interest::READABLE) {
                    Ok(()) => {
                        core.stream = Some(stream);
                        core.token = Some(token);
                        core.write_armed = false;
                        core.nbo = nbo;
                        core.state = EndpointState::Connected;
                        core.connect_retries = 0;

                        logging::debug!(self.log, "inbound connection adopted";
                                        "context" => "accept",
                                        "nbo" => nbo);

                        if let Err(TransportError::Fatal(err)) =
                            self.drain_locked(core, &mut completions)
                        {
                            self.fail_locked(core, err, &mut completions);
                            error = Some(err);
                        }
                    }
                    Err(_) => {
                        self.shared.events.forget(token);
                        self.fail_locked(core, ErrorType::ConnectFailed, &mut completions);
                        error = Some(ErrorType::ConnectFailed);
                    }
                }
            }
        }

        self.finish(completions, false);
        if let Some(err) = error {
            self.report_error(err);
        }
    }

    // --- event dispatch ---------------------------------------------------

    /// Socket readiness handler, invoked by the reactor.
    pub(crate) fn on_event(self: &Arc<Self>, readable: bool, writable: bool) {
        let mut completions = Completions::new();
        let mut deliveries: Vec<Box<Fragment>> = Vec::new();
        let mut error: Option<ErrorType> = None;

        {
            let mut guard = self.core.lock().unwrap();
            let core = &mut *guard;

            if writable {
                let state_before = core.state;
                let result = match core.state {
                    EndpointState::Connecting => self.connect_ready(core),
                    EndpointState::Connected | EndpointState::ShuttingDown => {
                        self.drain_locked(core, &mut completions).map(|_| ())
                    }
                    _ => Ok(()),
                };
                if let Err(TransportError::Fatal(err)) = result {
                    self.handle_failure(core, state_before, err, &mut completions, &mut error);
                }
            }

            if readable && error.is_none() {
                let state_before = core.state;
                let result = match core.state {
                    EndpointState::ConnectAck => self.handshake_ready(core, &mut completions),
                    EndpointState::Connected | EndpointState::ShuttingDown => {
                        self.recv_locked(core, &mut deliveries)
                    }
                    _ => Ok(()),
                };
                if let Err(TransportError::Fatal(err)) = result {
                    self.handle_failure(core, state_before, err, &mut completions, &mut error);
                }
            }
        }

        self.finish(completions, false);
        for frag in deliveries {
            self.deliver(frag);
        }
        if let Some(err) = error {
            self.report_error(err);
        }
    }

    /// Read fragments until the socket would block, collecting completed
    /// ones for dispatch outside the lock.
    fn recv_locked(
        &self,
        core: &mut Core,
        deliveries: &mut Vec<Box<Fragment>>,
    ) -> TransportResult<()> {
        loop {
            if core.rx_frag.is_none() {
                let mut frag = self.shared.pools.max.alloc()?;
                frag.begin_recv();
                core.rx_frag = Some(frag);
            }

            let outcome = {
                let stream = core
                    .stream
                    .as_mut()
                    .expect("Receiving endpoint must have a stream");
                let frag = core.rx_frag.as_mut().unwrap();
                let cache = if core.cache.capacity() > 0 {
                    Some(&mut core.cache)
                } else {
                    None
                };
                frag.frag_recv(stream, core.nbo, cache)?
            };

            match outcome {
                RecvOutcome::Blocked => return Ok(()),
                RecvOutcome::Deliver => {
                    let frag = core.rx_frag.take().unwrap();
                    deliveries.push(frag);
                }
                RecvOutcome::Fin => {
                    logging::debug!(self.log, "peer requested close"; "context" => "recv");
                    let frag = core.rx_frag.take().unwrap();
                    self.shared.pools.release(frag);
                    if core.tx_frag.is_none() && core.tx_queue.is_empty() {
                        self.close_locked(core);
                    } else {
                        core.state = EndpointState::ShuttingDown;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Hand a completed inbound fragment to its consumer: tag dispatch for
    /// SEND, pending-get matching for PUT replies, the auto-reply for GET.
    fn deliver(self: &Arc<Self>, frag: Box<Fragment>) {
        match frag.hdr.htype {
            HDR_TYPE_SEND => {
                let handler = self
                    .shared
                    .recv_cbs
                    .lock()
                    .unwrap()
                    .get(&frag.hdr.tag)
                    .cloned();
                match handler {
                    Some(handler) => handler(self.peer, frag.hdr.tag, frag.recv_payload()),
                    None => {
                        logging::warn!(self.log, "no handler registered for tag";
                                       "context" => "deliver",
                                       "tag" => frag.hdr.tag);
                    }
                }
            }
            HDR_TYPE_PUT => {
                // The payload already landed in the target addresses during
                // the read. A non-zero base is a GET reply cookie.
                if frag.hdr.base != 0 {
                    let pending = self
                        .shared
                        .pending_gets
                        .lock()
                        .unwrap()
                        .remove(&frag.hdr.base);
                    if let Some(cb) = pending {
                        cb(CompletionStatus::Ok);
                    }
                }
            }
            HDR_TYPE_GET => {
                self.reply_get(&frag);
            }
            _ => (),
        }

        self.shared.pools.release(frag);
    }

    /// Answer a GET by putting the requested bytes back, echoing the request
    /// cookie so the requester can match its pending get.
    fn reply_get(self: &Arc<Self>, request: &Fragment) {
        let seg = request.segments[0];

        let mut frag = match self.shared.pools.user.alloc() {
            Ok(frag) => frag,
            Err(_) => {
                logging::error!(self.log, "no fragment for get reply"; "context" => "get");
                return;
            }
        };

        frag.setup_put(seg.addr as *const u8, request.hdr.base, seg.len, request.hdr.base);
        if let Err(err) = self.submit(frag) {
            logging::warn!(self.log, "get reply failed";
                           "context" => "get",
                           "error" => ?err);
        }
    }

    // --- failure and teardown --------------------------------------------

    /// Route a fatal error by phase. A hang-up during connection
    /// establishment is usually the peer's concurrent-connect tie-break
    /// dropping our attempt: the socket is torn down but queued fragments
    /// survive, and a bounded retry (or the adopted inbound socket) drains
    /// them. Everything else is terminal.
    fn handle_failure(
        self: &Arc<Self>,
        core: &mut Core,
        state_before: EndpointState,
        err: ErrorType,
        completions: &mut Completions,
        error_out: &mut Option<ErrorType>,
    ) {
        let handshake_phase = matches!(
            state_before,
            EndpointState::Connecting | EndpointState::ConnectAck
        );
        let terminal = matches!(
            err,
            ErrorType::ConnectFailed
                | ErrorType::Timeout
                | ErrorType::HandshakeMagic
                | ErrorType::VersionMismatch
        );

        if handshake_phase && !terminal && core.connect_retries < MAX_CONNECT_RETRIES {
            logging::debug!(self.log, "connection attempt superseded";
                            "context" => "connect",
                            "retries" => core.connect_retries);
            core.connect_retries += 1;
            self.teardown_socket(core);
            core.state = EndpointState::Closed;

            if !core.tx_queue.is_empty() {
                if let Err(TransportError::Fatal(err)) = self.start_connect(core) {
                    self.fail_locked(core, err, completions);
                    *error_out = Some(err);
                }
            }
            return;
        }

        self.fail_locked(core, err, completions);
        *error_out = Some(err);
    }

    /// Terminal failure: close the socket, fail everything outstanding.
    /// Caller holds the send lock; completions and the error callback run
    /// after it is released.
    fn fail_locked(&self, core: &mut Core, reason: ErrorType, completions: &mut Completions) {
        let already_down =
            core.state == EndpointState::Closed || core.state == EndpointState::Failed;

        if !already_down {
            if reason == ErrorType::PeerHungUp {
                logging::warn!(self.log, "peer hung up"; "context" => "fail");
            } else {
                logging::debug!(self.log, "endpoint failed";
                                "context" => "fail",
                                "reason" => ?reason);
            }
            core.state = EndpointState::Failed;
        }

        self.teardown_socket(core);

        // Fragments may sit queued even on a closed endpoint (a superseded
        // connect keeps them for the retry); they all fail here.
        if let Some(frag) = core.tx_frag.take() {
            completions.push((frag, CompletionStatus::Error(reason)));
        }
        while let Some(frag) = core.tx_queue.pop_front() {
            completions.push((frag, CompletionStatus::Error(reason)));
        }
    }

    /// Graceful close once both directions are done.
    fn close_locked(&self, core: &mut Core) {
        logging::debug!(self.log, "endpoint closed"; "context" => "close");
        core.state = EndpointState::Closed;
        self.teardown_socket(core);
    }

    fn teardown_socket(&self, core: &mut Core) {
        if let Some(mut stream) = core.stream.take() {
            let _ = self.shared.events.disarm(&mut stream);
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(token) = core.token.take() {
            self.shared.events.forget(token);
        }
        if let Some(frag) = core.rx_frag.take() {
            self.shared.pools.release(frag);
        }
        core.write_armed = false;
        core.cache.clear();
    }

    /// Run completion callbacks and reclaim pool-owned fragments. Never call
    /// with the send lock held: callbacks may re-enter `send`, and pool
    /// mutexes are leaves acquired on their own.
    fn finish(&self, completions: Completions, inline: bool) {
        for (mut frag, status) in completions {
            frag.rc = status;
            let invoke = frag.cb.is_some() && (!inline || frag.flags.always_callback);
            if invoke {
                let cb = frag.cb.take().unwrap();
                cb(status);
            }
            if frag.flags.pool_owned {
                self.shared.pools.release(frag);
            }
        }
    }

    fn report_error(&self, reason: ErrorType) {
        if let Some(module) = self.module.upgrade() {
            module.report_error(self.peer, reason);
        }
    }
}

/// A blocking send over the otherwise non-blocking socket, bounded by the
/// handshake timeout. Only used for the fixed-size handshake records.
fn send_blocking<W: Write>(stream: &mut W, buf: &[u8], timeout: Duration) -> TransportResult<()> {
    let deadline = Instant::now() + timeout;
    let mut offset = 0;

    while offset < buf.len() {
        match stream.write(&buf[offset..]) {
            Ok(0) => return Err(TransportError::Fatal(ErrorType::PeerHungUp)),
            Ok(count) => offset += count,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(TransportError::Fatal(ErrorType::Timeout));
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

/// Blocking counterpart of `send_blocking` for the peer handshake.
pub(crate) fn recv_blocking<R: Read>(
    stream: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> TransportResult<()> {
    let deadline = Instant::now() + timeout;
    let mut offset = 0;

    while offset < buf.len() {
        match stream.read(&mut buf[offset..]) {
            Ok(0) => return Err(TransportError::Fatal(ErrorType::PeerHungUp)),
            Ok(count) => offset += count,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(TransportError::Fatal(ErrorType::Timeout));
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_tie_break_lower_identity_keeps_outbound() {
        let a = ProcessName::new(1, 5);
        let b = ProcessName::new(1, 4);

        // At A (higher): B's inbound supersedes A's outbound attempt.
        assert!(Endpoint::inbound_beats_outbound(a, b));
        // At B (lower): A's inbound is rejected, B keeps its outbound.
        assert!(!Endpoint::inbound_beats_outbound(b, a));
    }

    #[test]
    fn test_tie_break_orders_by_jobid_first() {
        let a = ProcessName::new(2, 0);
        let b = ProcessName::new(1, 9);

        assert!(Endpoint::inbound_beats_outbound(a, b));
        assert!(!Endpoint::inbound_beats_outbound(b, a));
    }

    struct ChunkedPipe {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        blocks_first: usize,
    }

    impl Read for ChunkedPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.blocks_first > 0 {
                self.blocks_first -= 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            if self.cursor == self.data.len() {
                return Ok(0);
            }
            let take = self.chunk.min(buf.len()).min(self.data.len() - self.cursor);
            buf[..take].copy_from_slice(&self.data[self.cursor..self.cursor + take]);
            self.cursor += take;
            Ok(take)
        }
    }

    impl Write for ChunkedPipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.blocks_first > 0 {
                self.blocks_first -= 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let take = self.chunk.min(buf.len());
            self.data.extend_from_slice(&buf[..take]);
            Ok(take)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_blocking_handshake_roundtrip_over_partial_io() {
        let mut pipe = ChunkedPipe {
            data: Vec::new(),
            cursor: 0,
            chunk: 3,
            blocks_first: 2,
        };

        let mut out = [0u8; HANDSHAKE_SIZE];
        Handshake::new(ProcessName::new(4, 2)).encode(&mut out);
        send_blocking(&mut pipe, &out, Duration::from_millis(500)).unwrap();

        pipe.blocks_first = 2;
        let mut inbuf = [0u8; HANDSHAKE_SIZE];
        recv_blocking(&mut pipe, &mut inbuf, Duration::from_millis(500)).unwrap();

        let (hs, nbo) = Handshake::decode(&inbuf).unwrap();
        assert!(!nbo);
        assert_eq!(hs.name, ProcessName::new(4, 2));
    }

    #[test]
    fn test_blocking_recv_times_out() {
        struct AlwaysBlocked;
        impl Read for AlwaysBlocked {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::WouldBlock.into())
            }
        }

        let mut buf = [0u8; 4];
        let result = recv_blocking(&mut AlwaysBlocked, &mut buf, Duration::from_millis(5));
        assert_eq!(result.unwrap_err(), TransportError::Fatal(ErrorType::Timeout));
    }

    #[test]
    fn test_blocking_recv_eof_is_peer_hangup() {
        let mut pipe = ChunkedPipe {
            data: vec![1, 2],
            cursor: 0,
            chunk: 8,
            blocks_first: 0,
        };

        let mut buf = [0u8; 4];
        let result = recv_blocking(&mut pipe, &mut buf, Duration::from_millis(50));
        assert_eq!(
            result.unwrap_err(),
            TransportError::Fatal(ErrorType::PeerHungUp)
        );
    }
}
