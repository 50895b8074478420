//! Loopback integration tests: two transports on the loopback interface
//! exchanging fragments through their progress threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use osmium::logging;
use osmium::proc::LocalDirectory;
use osmium::support::ErrorType;
use osmium::{
    Bitmap, CompletionStatus, DescFlags, Endpoint, EndpointState, ProcessName, Transport,
    TransportConfig,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn loopback_config(bufsize: usize) -> TransportConfig {
    let mut config = TransportConfig::default();
    config.if_include = Some("lo".to_string());
    config.enable_progress_thread = true;
    if bufsize > 0 {
        config.sndbuf = bufsize;
        config.rcvbuf = bufsize;
    }
    config
}

fn flags() -> DescFlags {
    DescFlags {
        pool_owned: true,
        always_callback: true,
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn transport(
    vpid: u32,
    directory: &Arc<LocalDirectory>,
    bufsize: usize,
) -> Arc<Transport> {
    Transport::new(
        ProcessName::new(1, vpid),
        loopback_config(bufsize),
        directory.clone(),
        logging::discard(),
    )
    .unwrap()
}

/// Make `a` and `b` mutually reachable, returning a's endpoint for b and
/// b's endpoint for a.
fn link(a: &Arc<Transport>, b: &Arc<Transport>) -> (Arc<Endpoint>, Arc<Endpoint>) {
    let mut peers = Vec::new();
    let mut reachable = Bitmap::new(1);
    a.add_procs(&[b.local()], &mut peers, &mut reachable).unwrap();
    assert!(reachable.is_set(0));
    let a_to_b = peers[0].take().unwrap();

    let mut peers = Vec::new();
    let mut reachable = Bitmap::new(1);
    b.add_procs(&[a.local()], &mut peers, &mut reachable).unwrap();
    assert!(reachable.is_set(0));
    let b_to_a = peers[0].take().unwrap();

    (a_to_b, b_to_a)
}

fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn send_bytes(
    from: &Arc<Transport>,
    endpoint: &Arc<Endpoint>,
    payload: &[u8],
    tag: u16,
) -> mpsc::Receiver<CompletionStatus> {
    let mut frag = from.module().alloc(payload.len(), flags()).unwrap();
    frag.payload_mut().copy_from_slice(payload);

    let (tx, rx) = mpsc::channel();
    frag.set_completion(Box::new(move |status| {
        let _ = tx.send(status);
    }));

    from.module().send(endpoint, frag, tag).unwrap();
    rx
}

#[test]
fn single_send_delivers_once() {
    let directory = Arc::new(LocalDirectory::new());
    let a = transport(0, &directory, 0);
    let b = transport(1, &directory, 0);

    let (delivered_tx, delivered_rx) = mpsc::channel();
    b.register_recv(7, move |peer, tag, payload| {
        let _ = delivered_tx.send((peer, tag, payload.to_vec()));
    });

    let (a_to_b, _b_to_a) = link(&a, &b);

    let payload = pattern(1024, 3);
    let completion = send_bytes(&a, &a_to_b, &payload, 7);

    let (peer, tag, received) = delivered_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(peer, a.local());
    assert_eq!(tag, 7);
    assert_eq!(received, payload);

    assert_eq!(
        completion.recv_timeout(RECV_TIMEOUT).unwrap(),
        CompletionStatus::Ok
    );

    // The callback fires exactly once.
    assert!(delivered_rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn zero_length_send_delivers_header_only() {
    let directory = Arc::new(LocalDirectory::new());
    let a = transport(0, &directory, 0);
    let b = transport(1, &directory, 0);

    let (delivered_tx, delivered_rx) = mpsc::channel();
    b.register_recv(3, move |_, _, payload| {
        let _ = delivered_tx.send(payload.len());
    });

    let (a_to_b, _) = link(&a, &b);

    let completion = send_bytes(&a, &a_to_b, &[], 3);

    assert_eq!(delivered_rx.recv_timeout(RECV_TIMEOUT).unwrap(), 0);
    assert_eq!(
        completion.recv_timeout(RECV_TIMEOUT).unwrap(),
        CompletionStatus::Ok
    );
    assert!(delivered_rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn fragmented_write_completes_under_tiny_buffers() {
    let directory = Arc::new(LocalDirectory::new());
    // 4 KiB socket buffers force many partial writes of the 64 KiB payload.
    let a = transport(0, &directory, 4096);
    let b = transport(1, &directory, 4096);

    let (delivered_tx, delivered_rx) = mpsc::channel();
    b.register_recv(11, move |_, _, payload| {
        let _ = delivered_tx.send(payload.to_vec());
    });

    let (a_to_b, _) = link(&a, &b);

    let mut payload = vec![0u8; 64 * 1024];
    StdRng::seed_from_u64(11).fill(payload.as_mut_slice());
    let completion = send_bytes(&a, &a_to_b, &payload, 11);

    let received = delivered_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(received.len(), 65536);
    assert_eq!(received, payload);
    assert_eq!(
        completion.recv_timeout(RECV_TIMEOUT).unwrap(),
        CompletionStatus::Ok
    );
}

#[test]
fn sends_are_delivered_in_fifo_order() {
    let directory = Arc::new(LocalDirectory::new());
    let a = transport(0, &directory, 0);
    let b = transport(1, &directory, 0);

    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    b.register_recv(5, move |_, _, payload| {
        sink.lock().unwrap().push(payload[0]);
    });

    let (a_to_b, _) = link(&a, &b);

    for i in 0..20u8 {
        let _ = send_bytes(&a, &a_to_b, &[i; 8], 5);
    }

    assert!(wait_until(|| order.lock().unwrap().len() == 20, RECV_TIMEOUT));
    let seen = order.lock().unwrap().clone();
    assert_eq!(seen, (0..20u8).collect::<Vec<_>>());
}

#[test]
fn concurrent_connect_converges_to_one_socket() {
    let directory = Arc::new(LocalDirectory::new());
    // A has the higher vpid, so B's outbound attempt must win the tie-break.
    let a = transport(5, &directory, 0);
    let b = transport(4, &directory, 0);

    let hits = Arc::new(AtomicUsize::new(0));

    let a_hits = hits.clone();
    a.register_recv(2, move |_, _, _| {
        a_hits.fetch_add(1, Ordering::SeqCst);
    });
    let b_hits = hits.clone();
    b.register_recv(2, move |_, _, _| {
        b_hits.fetch_add(1, Ordering::SeqCst);
    });

    let (a_to_b, b_to_a) = link(&a, &b);

    // Fire both directions at once to provoke crossing connects.
    let payload = pattern(512, 9);
    let ha = {
        let a = a.clone();
        let a_to_b = a_to_b.clone();
        let payload = payload.clone();
        thread::spawn(move || send_bytes(&a, &a_to_b, &payload, 2))
    };
    let hb = {
        let b = b.clone();
        let b_to_a = b_to_a.clone();
        let payload = payload.clone();
        thread::spawn(move || send_bytes(&b, &b_to_a, &payload, 2))
    };
    let ca = ha.join().unwrap();
    let cb = hb.join().unwrap();

    assert_eq!(ca.recv_timeout(RECV_TIMEOUT).unwrap(), CompletionStatus::Ok);
    assert_eq!(cb.recv_timeout(RECV_TIMEOUT).unwrap(), CompletionStatus::Ok);
    assert!(wait_until(|| hits.load(Ordering::SeqCst) == 2, RECV_TIMEOUT));

    // Both endpoints settle on exactly one connected socket each.
    assert!(wait_until(
        || a_to_b.state() == EndpointState::Connected
            && b_to_a.state() == EndpointState::Connected,
        RECV_TIMEOUT
    ));
    assert!(a_to_b.has_socket());
    assert!(b_to_a.has_socket());
}

#[test]
fn peer_hangup_fails_endpoint_and_reconnect_recovers() {
    let directory = Arc::new(LocalDirectory::new());
    let a = transport(0, &directory, 0);
    let b = transport(1, &directory, 0);

    let (delivered_tx, delivered_rx) = mpsc::channel();
    b.register_recv(8, move |_, _, payload| {
        let _ = delivered_tx.send(payload.to_vec());
    });

    let (error_tx, error_rx) = mpsc::channel();
    a.module().set_error_callback(Box::new(move |peer, reason| {
        let _ = error_tx.send((peer, reason));
    }));

    let (a_to_b, _b_to_a) = link(&a, &b);

    // Establish the connection with a first message.
    let first = pattern(1024, 1);
    let completion = send_bytes(&a, &a_to_b, &first, 8);
    assert_eq!(delivered_rx.recv_timeout(RECV_TIMEOUT).unwrap(), first);
    assert_eq!(completion.recv_timeout(RECV_TIMEOUT).unwrap(), CompletionStatus::Ok);

    // B hangs up on A.
    b.del_procs(&[a.local()]);

    let (peer, reason) = error_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(peer, b.local());
    assert_eq!(reason, ErrorType::PeerHungUp);
    assert!(wait_until(
        || a_to_b.state() == EndpointState::Failed,
        RECV_TIMEOUT
    ));
    assert!(!a_to_b.has_socket());

    // B re-adds A; a fresh send from A transitions the failed endpoint
    // through a new connect and the message delivers.
    let mut peers = Vec::new();
    let mut reachable = Bitmap::new(1);
    b.add_procs(&[a.local()], &mut peers, &mut reachable).unwrap();
    assert!(reachable.is_set(0));

    let second = pattern(2048, 2);
    let completion = send_bytes(&a, &a_to_b, &second, 8);
    assert_eq!(delivered_rx.recv_timeout(RECV_TIMEOUT).unwrap(), second);
    assert_eq!(completion.recv_timeout(RECV_TIMEOUT).unwrap(), CompletionStatus::Ok);
    assert_eq!(a_to_b.state(), EndpointState::Connected);
}

#[test]
fn put_roundtrip_writes_peer_memory() {
    let directory = Arc::new(LocalDirectory::new());
    let a = transport(0, &directory, 0);
    let b = transport(1, &directory, 0);

    let (done_tx, done_rx) = mpsc::channel();
    b.register_recv(9, move |_, _, _| {
        let _ = done_tx.send(());
    });

    let (a_to_b, _b_to_a) = link(&a, &b);

    // Targets in B's memory; sources in A's.
    let sizes = [100usize, 200, 300];
    let sources: Vec<Vec<u8>> = sizes
        .iter()
        .enumerate()
        .map(|(i, &len)| pattern(len, i as u8 + 40))
        .collect();
    let mut targets: Vec<Box<[u8]>> = sizes.iter().map(|&len| vec![0u8; len].into()).collect();
    let target_addrs: Vec<u64> = targets
        .iter_mut()
        .map(|t| t.as_mut_ptr() as u64)
        .collect();

    let (put_tx, put_rx) = mpsc::channel();
    for (i, source) in sources.iter().enumerate() {
        let put_tx = put_tx.clone();
        let status = unsafe {
            a.module().put(
                &a_to_b,
                source.as_ptr(),
                target_addrs[i],
                source.len(),
                flags(),
                Some(Box::new(move |status| {
                    let _ = put_tx.send(status);
                })),
            )
        };
        status.unwrap();
    }

    for _ in 0..3 {
        assert_eq!(
            put_rx.recv_timeout(RECV_TIMEOUT).unwrap(),
            CompletionStatus::Ok
        );
    }

    // A trailing SEND on the same stream flushes behind the puts; once it
    // delivers, the put payloads have landed in order.
    let _ = send_bytes(&a, &a_to_b, &[0xAA], 9);
    done_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    for (target, source) in targets.iter().zip(sources.iter()) {
        assert_eq!(&target[..], &source[..]);
    }
}

#[test]
fn get_roundtrip_reads_peer_memory() {
    let directory = Arc::new(LocalDirectory::new());
    let a = transport(0, &directory, 0);
    let b = transport(1, &directory, 0);

    let (a_to_b, _b_to_a) = link(&a, &b);

    let source: Vec<u8> = pattern(256, 77);
    let mut dest: Box<[u8]> = vec![0u8; 256].into();

    let (get_tx, get_rx) = mpsc::channel();
    unsafe {
        a.module()
            .get(
                &a_to_b,
                dest.as_mut_ptr(),
                source.as_ptr() as u64,
                256,
                flags(),
                Box::new(move |status| {
                    let _ = get_tx.send(status);
                }),
            )
            .unwrap();
    }

    assert_eq!(
        get_rx.recv_timeout(RECV_TIMEOUT).unwrap(),
        CompletionStatus::Ok
    );
    assert_eq!(&dest[..], &source[..]);
}

#[test]
fn oversized_prepare_src_is_refused() {
    let directory = Arc::new(LocalDirectory::new());
    let a = transport(0, &directory, 0);

    let max = TransportConfig::default().max_send_size;
    let data = vec![0u8; max + 1];
    let mut size = data.len();

    let result = unsafe { a.module().prepare_src(data.as_ptr(), 0, &mut size, flags()) };
    assert!(result.is_err());
}

#[test]
fn graceful_shutdown_closes_both_sides() {
    let directory = Arc::new(LocalDirectory::new());
    let a = transport(0, &directory, 0);
    let b = transport(1, &directory, 0);

    let (delivered_tx, delivered_rx) = mpsc::channel();
    b.register_recv(1, move |_, _, _| {
        let _ = delivered_tx.send(());
    });

    let (a_to_b, b_to_a) = link(&a, &b);

    let _ = send_bytes(&a, &a_to_b, &[1, 2, 3], 1);
    delivered_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    a_to_b.shutdown().unwrap();

    assert!(wait_until(
        || a_to_b.state() == EndpointState::Closed && b_to_a.state() == EndpointState::Closed,
        RECV_TIMEOUT
    ));
    assert!(!a_to_b.has_socket());
    assert!(!b_to_a.has_socket());
}
