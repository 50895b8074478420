//! Per-interface transport modules: one listening socket each, the endpoint
//! set for peers reached through that interface, and the upper-layer verbs.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use indexmap::IndexMap;
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use socket2::{Domain, Protocol, Socket, Type};

use crate::component::Shared;
use crate::endpoint::{recv_blocking, Endpoint};
use crate::frag::Fragment;
use crate::frame::{Handshake, HANDSHAKE_SIZE};
use crate::logging::{self, Logger};
use crate::proc::{Bitmap, ProcessName};
use crate::progress::Target;
use crate::support::{CompletionFn, DescFlags, ErrorType, TransportError, TransportResult};

pub type ErrorFn = Box<dyn Fn(ProcessName, ErrorType) + Send + Sync>;

/// One transport module per exposed local interface. Owns the listening
/// socket and the endpoints reached through this interface; fragment pools
/// are component-wide and only accessed from here.
pub struct Module {
    index: u32,
    ifname: String,
    if_addr: IpAddr,
    if_mask: Option<IpAddr>,
    listen_addr: SocketAddr,
    listener: Mutex<TcpListener>,
    token: mio::Token,
    endpoints: Mutex<IndexMap<ProcessName, Arc<Endpoint>>>,
    /// Accepted sockets parked until the connector's handshake arrives.
    pending: Mutex<HashMap<usize, TcpStream>>,
    error_cb: Mutex<Option<ErrorFn>>,
    shared: Arc<Shared>,
    log: Logger,
}

impl Module {
    pub(crate) fn new(
        index: u32,
        ifname: String,
        if_addr: IpAddr,
        if_mask: Option<IpAddr>,
        shared: Arc<Shared>,
    ) -> TransportResult<Arc<Module>> {
        let (std_listener, listen_addr) = bind_in_range(
            if_addr,
            shared.config.port_min,
            shared.config.port_range,
            shared.config.listen_backlog,
        )?;
        let listener = TcpListener::from_std(std_listener);

        let log = shared.log.new(logging::o!(
            "module" => index,
            "if" => ifname.clone(),
        ));

        let module = {
            let shared = shared.clone();
            Arc::new_cyclic(move |weak: &std::sync::Weak<Module>| {
                let token = shared.events.token_for(Target::Listener(weak.clone()));
                Module {
                    index,
                    ifname,
                    if_addr,
                    if_mask,
                    listen_addr,
                    listener: Mutex::new(listener),
                    token,
                    endpoints: Mutex::new(IndexMap::new()),
                    pending: Mutex::new(HashMap::new()),
                    error_cb: Mutex::new(None),
                    shared,
                    log,
                }
            })
        };

        {
            let mut listener = module.listener.lock().unwrap();
            module
                .shared
                .events
                .register(&mut *listener, module.token, Interest::READABLE)?;
        }

        logging::debug!(module.log, "module listening";
                        "context" => "init",
                        "addr" => %listen_addr);

        Ok(module)
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    #[inline]
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Install the upper-layer error callback invoked on terminal endpoint
    /// failures.
    pub fn set_error_callback(&self, cb: ErrorFn) {
        *self.error_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn report_error(&self, peer: ProcessName, reason: ErrorType) {
        let cb = self.error_cb.lock().unwrap();
        if let Some(cb) = cb.as_ref() {
            cb(peer, reason);
        }
    }

    // --- peer management --------------------------------------------------

    /// Associate each reachable peer with an endpoint, filling `peers[i]`
    /// and setting bit `i` in `reachable`. Unreachable peers (self, unknown
    /// to the directory, no address surviving the family filter) keep their
    /// bit clear and the upper layer picks another transport.
    pub fn add_procs(
        self: &Arc<Self>,
        procs: &[ProcessName],
        peers: &mut Vec<Option<Arc<Endpoint>>>,
        reachable: &mut Bitmap,
    ) -> TransportResult<()> {
        peers.clear();

        for (i, proc) in procs.iter().enumerate() {
            if *proc == self.shared.local {
                peers.push(None);
                continue;
            }

            let published = match self.shared.directory.lookup(proc) {
                Some(addrs) => addrs,
                None => {
                    peers.push(None);
                    continue;
                }
            };

            let best = published
                .into_iter()
                .filter(|addr| !self.family_disabled(addr))
                .max_by_key(|addr| match_score(self.if_addr, self.if_mask, addr.ip()));

            match best {
                Some(addr) => {
                    let endpoint = {
                        let mut endpoints = self.endpoints.lock().unwrap();
                        endpoints
                            .entry(*proc)
                            .or_insert_with(|| {
                                Endpoint::new(
                                    *proc,
                                    addr,
                                    self.shared.clone(),
                                    Arc::downgrade(self),
                                )
                            })
                            .clone()
                    };
                    reachable.set(i);
                    peers.push(Some(endpoint));
                }
                None => peers.push(None),
            }
        }

        Ok(())
    }

    /// Tear down peer state; pending sends complete with a peer-removed
    /// status.
    pub fn del_procs(&self, procs: &[ProcessName]) {
        for proc in procs {
            let endpoint = {
                let mut endpoints = self.endpoints.lock().unwrap();
                endpoints.swap_remove(proc)
            };
            if let Some(endpoint) = endpoint {
                endpoint.close_for(ErrorType::PeerRemoved);
            }
        }
    }

    pub fn endpoint_for(&self, peer: &ProcessName) -> Option<Arc<Endpoint>> {
        self.endpoints.lock().unwrap().get(peer).cloned()
    }

    pub(crate) fn close_all(&self, reason: ErrorType) {
        let parked: Vec<(usize, TcpStream)> =
            self.pending.lock().unwrap().drain().collect();
        for (token, mut stream) in parked {
            let _ = self.shared.events.disarm(&mut stream);
            self.shared.events.forget(mio::Token(token));
        }

        let drained: Vec<Arc<Endpoint>> = {
            let mut endpoints = self.endpoints.lock().unwrap();
            endpoints.drain(..).map(|(_, endpoint)| endpoint).collect()
        };
        for endpoint in drained {
            endpoint.close_for(reason);
        }
    }

    // --- upper-layer verbs ------------------------------------------------

    /// Allocate a fragment whose addressable segment covers `size` bytes.
    pub fn alloc(&self, size: usize, flags: DescFlags) -> TransportResult<Box<Fragment>> {
        let mut frag = self.shared.pools.alloc_for_size(size)?;
        frag.flags = flags;
        frag.set_inline_src(size);
        Ok(frag)
    }

    /// Return a fragment to its pool.
    pub fn free(&self, frag: Box<Fragment>) {
        self.shared.pools.release(frag);
    }

    /// Prepare a source descriptor. Contiguous data beyond the eager limit
    /// with no reserve short-circuits to a user fragment aliasing the caller
    /// buffer; everything else is packed into pooled inline space, with the
    /// first `reserve` bytes left for the upper layer to fill.
    ///
    /// # Safety
    ///
    /// `src` must point at `*size` readable bytes that outlive the fragment
    /// (until its completion callback for the aliasing path).
    pub unsafe fn prepare_src(
        &self,
        src: *const u8,
        reserve: usize,
        size: &mut usize,
        flags: DescFlags,
    ) -> TransportResult<Box<Fragment>> {
        if reserve + *size > self.shared.pools.max_send_size() {
            return Err(TransportError::Fatal(ErrorType::PayloadTooLarge));
        }

        if reserve == 0 && *size > self.shared.pools.eager_limit() {
            let mut frag = self.shared.pools.user.alloc()?;
            frag.flags = flags;
            frag.set_user_src(src, *size);
            return Ok(frag);
        }

        let total = reserve + *size;
        let mut frag = self.shared.pools.alloc_for_size(total)?;
        frag.flags = flags;
        frag.set_inline_src(total);
        if *size > 0 {
            std::ptr::copy_nonoverlapping(src, frag.payload_mut()[reserve..].as_mut_ptr(), *size);
        }
        Ok(frag)
    }

    /// Enqueue a prepared fragment for transmission to `endpoint`.
    pub fn send(
        &self,
        endpoint: &Arc<Endpoint>,
        frag: Box<Fragment>,
        tag: u16,
    ) -> TransportResult<bool> {
        endpoint.send(frag, tag)
    }

    /// See [`Endpoint::put`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Endpoint::put`].
    pub unsafe fn put(
        &self,
        endpoint: &Arc<Endpoint>,
        local: *const u8,
        remote: u64,
        size: usize,
        flags: DescFlags,
        cb: Option<CompletionFn>,
    ) -> TransportResult<bool> {
        endpoint.put(local, remote, size, flags, cb)
    }

    /// See [`Endpoint::get`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Endpoint::get`].
    pub unsafe fn get(
        &self,
        endpoint: &Arc<Endpoint>,
        local: *mut u8,
        remote: u64,
        size: usize,
        flags: DescFlags,
        cb: CompletionFn,
    ) -> TransportResult<()> {
        endpoint.get(local, remote, size, flags, cb)
    }

    // --- accept path ------------------------------------------------------

    /// Listener readiness: accept every pending connection and run the
    /// handshake-driven endpoint promotion.
    pub(crate) fn accept_ready(self: &Arc<Self>) {
        loop {
            let accepted = {
                let listener = self.listener.lock().unwrap();
                listener.accept()
            };

            match accepted {
                Ok((stream, addr)) => self.handle_inbound(stream, addr),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::warn!(self.log, "accept failed";
                                   "context" => "accept",
                                   "error" => %err);
                    break;
                }
            }
        }
    }

    /// Park a freshly accepted socket until the connector's handshake shows
    /// up as read readiness. Reading it here would stall the reactor when
    /// two peers accept each other's crossing connects simultaneously.
    fn handle_inbound(self: &Arc<Self>, mut stream: TcpStream, addr: SocketAddr) {
        let config = &self.shared.config;

        if !config.not_use_nodelay {
            let _ = stream.set_nodelay(true);
        }
        if config.sndbuf > 0 || config.rcvbuf > 0 {
            use std::os::unix::io::{AsRawFd, BorrowedFd};
            // The fd stays owned by the mio stream for this whole scope.
            let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
            let sock = socket2::SockRef::from(&fd);
            if config.sndbuf > 0 {
                let _ = sock.set_send_buffer_size(config.sndbuf);
            }
            if config.rcvbuf > 0 {
                let _ = sock.set_recv_buffer_size(config.rcvbuf);
            }
        }

        let token = self
            .shared
            .events
            .token_for(Target::Inbound(Arc::downgrade(self)));
        if let Err(err) = self
            .shared
            .events
            .register(&mut stream, token, Interest::READABLE)
        {
            self.shared.events.forget(token);
            logging::warn!(self.log, "inbound registration failed";
                           "context" => "accept",
                           "addr" => %addr,
                           "error" => %err);
            return;
        }

        self.pending.lock().unwrap().insert(token.0, stream);
    }

    /// The connector's handshake arrived on a parked socket: read it, find
    /// the endpoint it names and hand the socket over for promotion.
    pub(crate) fn inbound_ready(self: &Arc<Self>, token: mio::Token) {
        let mut stream = match self.pending.lock().unwrap().remove(&token.0) {
            Some(stream) => stream,
            None => return,
        };

        let _ = self.shared.events.disarm(&mut stream);
        self.shared.events.forget(token);

        // The handshake is in flight by now; the bounded read below returns
        // promptly.
        let timeout = std::time::Duration::from_millis(self.shared.config.handshake_timeout_ms);
        let mut buf = [0u8; HANDSHAKE_SIZE];
        if let Err(err) = recv_blocking(&mut stream, &mut buf, timeout) {
            logging::warn!(self.log, "inbound handshake failed";
                           "context" => "accept",
                           "error" => ?err);
            return;
        }

        let (hs, nbo) = match Handshake::decode(&buf) {
            Ok(decoded) => decoded,
            Err(err) => {
                logging::warn!(self.log, "inbound handshake rejected";
                               "context" => "accept",
                               "error" => ?err);
                return;
            }
        };

        let endpoint = self.endpoint_for(&hs.name);
        match endpoint {
            Some(endpoint) => endpoint.accept_inbound(stream, nbo),
            None => {
                logging::warn!(self.log, "inbound connection from unknown peer";
                               "context" => "accept",
                               "peer" => %hs.name);
            }
        }
    }

    fn family_disabled(&self, addr: &SocketAddr) -> bool {
        match self.shared.config.disable_family {
            Some(4) => addr.is_ipv4(),
            Some(6) => addr.is_ipv6(),
            _ => false,
        }
    }
}

/// Interface-match score for a published peer address: same subnet beats
/// same address family beats a bare cross-family match.
pub(crate) fn match_score(if_addr: IpAddr, if_mask: Option<IpAddr>, candidate: IpAddr) -> u8 {
    match (if_addr, candidate) {
        (IpAddr::V4(local), IpAddr::V4(remote)) => {
            if let Some(IpAddr::V4(mask)) = if_mask {
                let mask = u32::from(mask);
                if u32::from(local) & mask == u32::from(remote) & mask {
                    return 2;
                }
            }
            1
        }
        (IpAddr::V6(local), IpAddr::V6(remote)) => {
            if let Some(IpAddr::V6(mask)) = if_mask {
                let mask = u128::from(mask);
                if u128::from(local) & mask == u128::from(remote) & mask {
                    return 2;
                }
            }
            1
        }
        _ => 0,
    }
}

/// Bind a listening socket to the first free port in
/// `[port_min, port_min + port_range)` on `ip`.
fn bind_in_range(
    ip: IpAddr,
    port_min: u16,
    port_range: u16,
    backlog: i32,
) -> TransportResult<(std::net::TcpListener, SocketAddr)> {
    let domain = match ip {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };

    for offset in 0..port_range {
        let port = match port_min.checked_add(offset) {
            Some(port) => port,
            None => break,
        };

        let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
            Ok(socket) => socket,
            Err(err) => return Err(err.into()),
        };
        let _ = socket.set_reuse_address(true);
        if socket.set_nonblocking(true).is_err() {
            continue;
        }

        if socket.bind(&SocketAddr::new(ip, port).into()).is_err() {
            continue;
        }
        if socket.listen(backlog).is_err() {
            continue;
        }

        let listener: std::net::TcpListener = socket.into();
        let addr = listener.local_addr()?;
        return Ok((listener, addr));
    }

    Err(TransportError::Fatal(ErrorType::PortRangeExhausted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_score_ladder() {
        let if_addr: IpAddr = "192.168.1.10".parse().unwrap();
        let mask: IpAddr = "255.255.255.0".parse().unwrap();

        let same_subnet: IpAddr = "192.168.1.42".parse().unwrap();
        let same_family: IpAddr = "10.0.0.1".parse().unwrap();
        let other_family: IpAddr = "::1".parse().unwrap();

        assert_eq!(match_score(if_addr, Some(mask), same_subnet), 2);
        assert_eq!(match_score(if_addr, Some(mask), same_family), 1);
        assert_eq!(match_score(if_addr, Some(mask), other_family), 0);
    }

    #[test]
    fn test_match_score_without_mask() {
        let if_addr: IpAddr = "192.168.1.10".parse().unwrap();
        let candidate: IpAddr = "192.168.1.42".parse().unwrap();

        assert_eq!(match_score(if_addr, None, candidate), 1);
    }

    #[test]
    fn test_bind_ephemeral() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let (listener, addr) = bind_in_range(ip, 0, 1, 16).unwrap();

        assert_ne!(addr.port(), 0);
        assert_eq!(listener.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_bind_range_exhaustion() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        // Occupy an ephemeral port, then restrict the range to exactly it.
        let (held, addr) = bind_in_range(ip, 0, 1, 16).unwrap();
        let result = bind_in_range(ip, addr.port(), 1, 16);

        assert_eq!(
            result.err().unwrap(),
            TransportError::Fatal(ErrorType::PortRangeExhausted)
        );
        drop(held);
    }
}
