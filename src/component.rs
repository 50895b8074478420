//! The process-wide transport component: interface discovery, module
//! bring-up, address publication, fragment pools and the progress engine.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use hashbrown::HashMap;
use nix::net::if_::InterfaceFlags;

use crate::config::TransportConfig;
use crate::endpoint::Endpoint;
use crate::logging::{self, Logger};
use crate::module::Module;
use crate::pool::FragPools;
use crate::proc::{Bitmap, Directory, ProcessName};
use crate::progress::{spawn_progress_thread, EventBase, Reactor, MODE_INLINE};
use crate::support::{CompletionFn, ErrorType, TransportError, TransportResult};

/// Upper-layer tag dispatch callback: peer identity, tag and the received
/// payload.
pub type RecvFn = Arc<dyn Fn(ProcessName, u16, &[u8]) + Send + Sync>;

/// Component internals shared by modules, endpoints and the reactor: the
/// explicit context threaded through every operation instead of process-wide
/// singletons.
pub(crate) struct Shared {
    pub config: TransportConfig,
    pub local: ProcessName,
    pub pools: FragPools,
    pub events: EventBase,
    pub recv_cbs: Mutex<HashMap<u16, RecvFn>>,
    pub pending_gets: Mutex<HashMap<u64, CompletionFn>>,
    pub directory: Arc<dyn Directory>,
    pub log: Logger,
}

/// One local interface chosen for a module.
#[derive(Debug, Clone)]
struct Iface {
    name: String,
    addr: IpAddr,
    mask: Option<IpAddr>,
}

/// The transport component. Created once per process, it owns the modules,
/// the fragment pools and the progress engine, and is handed as the explicit
/// context to every operation.
pub struct Transport {
    shared: Arc<Shared>,
    modules: Vec<Arc<Module>>,
    reactor: Arc<Mutex<Reactor>>,
    shutdown: Arc<AtomicBool>,
    progress_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Bring the component up: discover interfaces honoring the
    /// include/exclude lists, create one module per interface, publish the
    /// bound addresses under `local`, initialize the pools and optionally
    /// spawn the progress thread.
    pub fn new(
        local: ProcessName,
        config: TransportConfig,
        directory: Arc<dyn Directory>,
        log: Logger,
    ) -> TransportResult<Arc<Transport>> {
        config.validate()?;

        let (reactor, events) = Reactor::new()?;
        let log = log.new(logging::o!("local" => local.to_string()));
        let pools = FragPools::new(&config, &log);

        let interfaces = discover_interfaces(&config)?;
        if interfaces.is_empty() {
            return Err(TransportError::Fatal(ErrorType::NoInterface));
        }

        let shared = Arc::new(Shared {
            config,
            local,
            pools,
            events,
            recv_cbs: Mutex::new(HashMap::new()),
            pending_gets: Mutex::new(HashMap::new()),
            directory,
            log,
        });

        let mut modules = Vec::with_capacity(interfaces.len());
        for (index, iface) in interfaces.into_iter().enumerate() {
            logging::debug!(shared.log, "exposing interface";
                            "context" => "init",
                            "if" => iface.name.clone(),
                            "addr" => %iface.addr);
            modules.push(Module::new(
                index as u32,
                iface.name,
                iface.addr,
                iface.mask,
                shared.clone(),
            )?);
        }

        let published: Vec<SocketAddr> = modules.iter().map(|module| module.listen_addr()).collect();
        shared.directory.publish(local, published);

        let reactor = Arc::new(Mutex::new(reactor));
        let shutdown = Arc::new(AtomicBool::new(false));

        let transport = Arc::new(Transport {
            shared: shared.clone(),
            modules,
            reactor: reactor.clone(),
            shutdown: shutdown.clone(),
            progress_thread: Mutex::new(None),
        });

        if shared.config.enable_progress_thread {
            let handle = spawn_progress_thread(reactor, shared, shutdown);
            *transport.progress_thread.lock().unwrap() = Some(handle);
        }

        Ok(transport)
    }

    #[inline]
    pub fn local(&self) -> ProcessName {
        self.shared.local
    }

    #[inline]
    pub fn modules(&self) -> &[Arc<Module>] {
        &self.modules
    }

    /// The first (primary) module; single-interface setups only have one.
    #[inline]
    pub fn module(&self) -> &Arc<Module> {
        &self.modules[0]
    }

    /// Register the tag dispatch callback for `tag`. A completed inbound
    /// SEND with that tag invokes the callback on the progress path.
    pub fn register_recv<F>(&self, tag: u16, cb: F)
    where
        F: Fn(ProcessName, u16, &[u8]) + Send + Sync + 'static,
    {
        self.shared
            .recv_cbs
            .lock()
            .unwrap()
            .insert(tag, Arc::new(cb));
    }

    pub fn unregister_recv(&self, tag: u16) {
        self.shared.recv_cbs.lock().unwrap().remove(&tag);
    }

    /// Inline progress: pump the event base once without blocking. A no-op
    /// while the dedicated progress thread owns the poll. Returns the number
    /// of dispatched events.
    pub fn progress(&self) -> usize {
        match self.reactor.try_lock() {
            Ok(mut reactor) => {
                reactor.pump(&self.shared.events, Some(Duration::from_millis(0)))
            }
            Err(_) => 0,
        }
    }

    /// Populate `peers` and the reachability bitmap across all modules;
    /// each peer is bound to the first module that reaches it.
    pub fn add_procs(
        &self,
        procs: &[ProcessName],
        peers: &mut Vec<Option<Arc<Endpoint>>>,
        reachable: &mut Bitmap,
    ) -> TransportResult<()> {
        peers.clear();
        peers.resize_with(procs.len(), || None);

        for module in &self.modules {
            let mut module_peers = Vec::new();
            let mut module_reachable = Bitmap::new(procs.len());
            module.add_procs(procs, &mut module_peers, &mut module_reachable)?;

            for (i, endpoint) in module_peers.into_iter().enumerate() {
                if peers[i].is_none() {
                    if let Some(endpoint) = endpoint {
                        peers[i] = Some(endpoint);
                        reachable.set(i);
                    }
                }
            }
        }

        Ok(())
    }

    pub fn del_procs(&self, procs: &[ProcessName]) {
        for module in &self.modules {
            module.del_procs(procs);
        }
    }

    /// Reverse bring-up: stop the progress thread, withdraw the published
    /// addresses and drain outstanding fragments with a cancellation status.
    pub fn finalize(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shared.events.wake();

        let handle = self.progress_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.shared.events.set_mode(MODE_INLINE);

        self.shared.directory.withdraw(&self.shared.local);

        for module in &self.modules {
            module.close_all(ErrorType::Cancelled);
        }

        logging::debug!(self.shared.log, "transport finalized"; "context" => "fini");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Enumerate local interfaces honoring the include/exclude lists and the
/// disabled address family. Link-local IPv6 addresses are skipped (they are
/// not bindable without a scope).
fn discover_interfaces(config: &TransportConfig) -> TransportResult<Vec<Iface>> {
    let include = TransportConfig::split_if_list(&config.if_include);
    let exclude = TransportConfig::split_if_list(&config.if_exclude);

    let mut out: Vec<Iface> = Vec::new();

    let addrs =
        nix::ifaddrs::getifaddrs().map_err(|_| TransportError::Fatal(ErrorType::NoInterface))?;

    for ifaddr in addrs {
        let name = ifaddr.interface_name.clone();

        if !include.is_empty() && !include.iter().any(|item| *item == name) {
            continue;
        }
        if exclude.iter().any(|item| *item == name) {
            continue;
        }
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP) {
            continue;
        }

        let storage = match ifaddr.address {
            Some(storage) => storage,
            None => continue,
        };

        let addr = if let Some(sin) = storage.as_sockaddr_in() {
            IpAddr::V4(Ipv4Addr::from(sin.ip()))
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            let v6 = sin6.ip();
            if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                continue;
            }
            IpAddr::V6(v6)
        } else {
            continue;
        };

        match config.disable_family {
            Some(4) if addr.is_ipv4() => continue,
            Some(6) if addr.is_ipv6() => continue,
            _ => (),
        }

        if out.iter().any(|iface| iface.addr == addr) {
            continue;
        }

        let mask = ifaddr.netmask.and_then(|storage| {
            if let Some(sin) = storage.as_sockaddr_in() {
                Some(IpAddr::V4(Ipv4Addr::from(sin.ip())))
            } else if let Some(sin6) = storage.as_sockaddr_in6() {
                Some(IpAddr::V6(sin6.ip()))
            } else {
                None
            }
        });

        out.push(Iface { name, addr, mask });
    }

    Ok(out)
}
