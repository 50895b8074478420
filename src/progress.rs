//! The progress engine: a mio poll pumped either by the caller (`progress`)
//! or by the dedicated progress thread, with a waker carrying the wake
//! record between threads.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::component::Shared;
use crate::endpoint::Endpoint;
use crate::module::Module;

pub(crate) const WAKER_TOKEN: Token = Token(0);

/// Progress is driven inline by callers until the dedicated thread takes
/// over; the transition is published with release/acquire ordering so a
/// posting thread either sees the thread active (and wakes it) or inactive.
pub(crate) const MODE_INLINE: u8 = 0;
pub(crate) const MODE_HANDOFF: u8 = 1;

/// What a readiness token dispatches to.
#[derive(Clone)]
pub(crate) enum Target {
    Listener(Weak<Module>),
    /// An accepted socket still waiting for the connector's handshake.
    Inbound(Weak<Module>),
    Peer(Weak<Endpoint>),
}

/// Narrow interface over the event machinery: arm/rearm/disarm a source,
/// allocate dispatch tokens, and kick the progress thread out of its poll.
pub(crate) struct EventBase {
    registry: Registry,
    waker: Waker,
    targets: Mutex<HashMap<usize, Target>>,
    next_token: AtomicUsize,
    mode: AtomicU8,
}

impl EventBase {
    fn new(registry: Registry, waker: Waker) -> EventBase {
        EventBase {
            registry,
            waker,
            targets: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
            mode: AtomicU8::new(MODE_INLINE),
        }
    }

    /// Allocate a dispatch token for `target`. Tokens are never reused, so a
    /// stale readiness event resolves to nothing rather than to a new owner.
    pub fn token_for(&self, target: Target) -> Token {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.targets.lock().unwrap().insert(id, target);
        Token(id)
    }

    pub fn forget(&self, token: Token) {
        self.targets.lock().unwrap().remove(&token.0);
    }

    fn resolve(&self, token: Token) -> Option<Target> {
        self.targets.lock().unwrap().get(&token.0).cloned()
    }

    pub fn register<S: Source>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.registry.register(source, token, interest)
    }

    pub fn rearm<S: Source>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.registry.reregister(source, token, interest)
    }

    pub fn disarm<S: Source>(&self, source: &mut S) -> io::Result<()> {
        self.registry.deregister(source)
    }

    /// Post the wake record: a no-op while progress is inline, a waker write
    /// once the dedicated thread owns the poll.
    pub fn kick(&self) {
        if self.mode.load(Ordering::Acquire) == MODE_HANDOFF {
            // A failed wake leaves the thread to its poll timeout.
            let _ = self.waker.wake();
        }
    }

    pub fn set_mode(&self, mode: u8) {
        self.mode.store(mode, Ordering::Release);
    }

    /// Unconditional wake, used by teardown to unblock the thread.
    pub fn wake(&self) {
        let _ = self.waker.wake();
    }
}

/// Owner of the poll and its event buffer. Exactly one driver pumps it at a
/// time: the progress thread holds the lock for its lifetime, inline callers
/// try-lock and back off.
pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new() -> io::Result<(Reactor, EventBase)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let registry = poll.registry().try_clone()?;

        Ok((
            Reactor {
                poll,
                events: Events::with_capacity(1024),
            },
            EventBase::new(registry, waker),
        ))
    }

    /// Poll once and dispatch every readiness event. Returns the number of
    /// dispatched (non-waker) events.
    pub fn pump(&mut self, base: &EventBase, timeout: Option<Duration>) -> usize {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => (),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return 0,
            Err(err) => panic!("Event poll failed: {:?}", err),
        }

        // Readiness is collected first so dispatch runs without borrowing
        // the event buffer; handlers may re-enter the event base.
        let mut ready: Vec<(Token, bool, bool)> = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_error();
            ready.push((event.token(), readable, writable));
        }

        let count = ready.len();
        for (token, readable, writable) in ready {
            match base.resolve(token) {
                Some(Target::Listener(module)) => {
                    if let Some(module) = module.upgrade() {
                        module.accept_ready();
                    }
                }
                Some(Target::Inbound(module)) => {
                    if let Some(module) = module.upgrade() {
                        module.inbound_ready(token);
                    }
                }
                Some(Target::Peer(endpoint)) => {
                    if let Some(endpoint) = endpoint.upgrade() {
                        endpoint.on_event(readable, writable);
                    }
                }
                None => (),
            }
        }

        count
    }
}

/// Hand the reactor to a dedicated progress thread. The thread owns the poll
/// until `shutdown` is observed; `EventBase::kick` posts wake records to it.
pub(crate) fn spawn_progress_thread(
    reactor: Arc<Mutex<Reactor>>,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    shared.events.set_mode(MODE_HANDOFF);

    thread::Builder::new()
        .name("osmium-progress".to_string())
        .spawn(move || {
            let mut reactor = reactor.lock().unwrap();
            while !shutdown.load(Ordering::Acquire) {
                reactor.pump(&shared.events, Some(Duration::from_millis(200)));
            }
        })
        .expect("Failed to spawn the progress thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_forgettable() {
        let (_reactor, base) = Reactor::new().unwrap();

        let a = base.token_for(Target::Listener(Weak::new()));
        let b = base.token_for(Target::Peer(Weak::new()));

        assert_ne!(a, b);
        assert_ne!(a, WAKER_TOKEN);
        assert!(base.resolve(a).is_some());

        base.forget(a);
        assert!(base.resolve(a).is_none());
        assert!(base.resolve(b).is_some());
    }

    #[test]
    fn test_waker_unblocks_pump() {
        let (mut reactor, base) = Reactor::new().unwrap();

        base.set_mode(MODE_HANDOFF);
        base.kick();

        // The waker event itself is swallowed, so no targets dispatch.
        let dispatched = reactor.pump(&base, None);
        assert_eq!(dispatched, 0);
    }

    #[test]
    fn test_inline_kick_is_a_no_op() {
        let (mut reactor, base) = Reactor::new().unwrap();

        base.kick();

        let dispatched = reactor.pump(&base, Some(Duration::from_millis(10)));
        assert_eq!(dispatched, 0);
    }

    #[test]
    fn test_dead_targets_are_skipped() {
        let (mut reactor, base) = Reactor::new().unwrap();

        let token = base.token_for(Target::Peer(Weak::new()));
        let _ = token;

        // Nothing registered under the token; a zero-timeout pump simply
        // returns.
        assert_eq!(reactor.pump(&base, Some(Duration::from_millis(0))), 0);
    }
}
