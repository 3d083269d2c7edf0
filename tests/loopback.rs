//! End-to-end tests: socket pairs over real UDP on localhost, with and
//! without a lossy forwarding relay in the middle.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rivulet::{Error, ReadMode, Segment, Socket, SocketKind};

const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

fn read_exact(sock: &Socket, want: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(want);
    let mut buf = [0u8; 4096];

    while out.len() < want {
        let cap = (want - out.len()).min(buf.len());
        let n = sock.read(&mut buf[..cap], ReadMode::Blocking).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }

    out
}

/// Forwards datagrams between an initiator and `server_port`, dropping
/// every `drop_every`-th data-bearing segment in either direction.
/// Control segments (handshake, acks, FIN) pass through untouched, so
/// loss recovery is exercised without stalling teardown.
fn lossy_relay(
    relay_port: u16,
    server_port: u16,
    drop_every: usize,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let sock = UdpSocket::bind((LOCALHOST, relay_port)).unwrap();
        sock.set_read_timeout(Some(Duration::from_millis(100))).unwrap();

        let server = SocketAddr::from((LOCALHOST, server_port));
        let mut client: Option<SocketAddr> = None;
        let mut data_count = 0usize;
        let mut buf = [0u8; 2048];

        while !stop.load(Ordering::Relaxed) {
            let (n, from) = match sock.recv_from(&mut buf) {
                Ok(x) => x,
                Err(_) => continue,
            };

            if let Ok(seg) = Segment::decode(&buf[..n]) {
                if !seg.payload.is_empty() {
                    data_count += 1;
                    if data_count % drop_every == 0 {
                        continue;
                    }
                }
            }

            if from == server {
                if let Some(client) = client {
                    let _ = sock.send_to(&buf[..n], client);
                }
            } else {
                client = Some(from);
                let _ = sock.send_to(&buf[..n], server);
            }
        }
    })
}

#[test]
fn handshake_and_exchange() {
    let port = 43101;

    let server = thread::spawn(move || {
        let sock = Socket::open(SocketKind::Listener, port, LOCALHOST).unwrap();

        let knock = read_exact(&sock, 11);
        assert_eq!(knock, b"Knock knock");

        sock.write(b"Who's there?").unwrap();
        sock.close().unwrap();
    });

    thread::sleep(Duration::from_millis(50));

    let sock = Socket::open(SocketKind::Initiator, port, LOCALHOST).unwrap();
    sock.write(b"Knock knock").unwrap();

    let reply = read_exact(&sock, 12);
    assert_eq!(reply, b"Who's there?");

    sock.close().unwrap();
    server.join().unwrap();
}

#[test]
fn bulk_transfer() {
    let port = 43102;
    let size = 10240;

    let server = thread::spawn(move || {
        let sock = Socket::open(SocketKind::Listener, port, LOCALHOST).unwrap();
        let got = read_exact(&sock, size);
        sock.close().unwrap();
        got
    });

    thread::sleep(Duration::from_millis(50));

    let sock = Socket::open(SocketKind::Initiator, port, LOCALHOST).unwrap();
    sock.write(&pattern(size)).unwrap();
    sock.close().unwrap();

    assert_eq!(server.join().unwrap(), pattern(size));
}

#[test]
fn bulk_transfer_through_lossy_relay() {
    let relay_port = 43103;
    let server_port = 43104;
    let size = 10240;

    let stop = Arc::new(AtomicBool::new(false));
    let relay = lossy_relay(relay_port, server_port, 10, stop.clone());

    let server = thread::spawn(move || {
        let sock = Socket::open(SocketKind::Listener, server_port, LOCALHOST).unwrap();
        let got = read_exact(&sock, size);
        sock.close().unwrap();
        got
    });

    thread::sleep(Duration::from_millis(50));

    let sock = Socket::open(SocketKind::Initiator, relay_port, LOCALHOST).unwrap();
    sock.write(&pattern(size)).unwrap();
    sock.close().unwrap();

    assert_eq!(server.join().unwrap(), pattern(size));

    stop.store(true, Ordering::Relaxed);
    relay.join().unwrap();
}

#[test]
fn backpressure_fills_and_reopens_the_window() {
    let port = 43105;
    let size = 100_000;

    let server = thread::spawn(move || {
        let sock = Socket::open(SocketKind::Listener, port, LOCALHOST).unwrap();
        // Let the sender run into the closed window before draining it.
        thread::sleep(Duration::from_millis(500));
        let got = read_exact(&sock, size);
        sock.close().unwrap();
        got
    });

    thread::sleep(Duration::from_millis(50));

    let sock = Socket::open(SocketKind::Initiator, port, LOCALHOST).unwrap();
    sock.write(&pattern(size)).unwrap();
    sock.close().unwrap();

    assert_eq!(server.join().unwrap(), pattern(size));
}

#[test]
fn transfer_across_sequence_wrap() {
    let port = 43106;
    let size = 4096;
    let isn = u32::MAX - 1000;

    let server = thread::spawn(move || {
        let sock = Socket::open_with_isn(SocketKind::Listener, port, LOCALHOST, isn).unwrap();
        let got = read_exact(&sock, size);
        sock.write(&pattern(size)).unwrap();
        sock.close().unwrap();
        got
    });

    thread::sleep(Duration::from_millis(50));

    let sock = Socket::open_with_isn(SocketKind::Initiator, port, LOCALHOST, isn).unwrap();
    sock.write(&pattern(size)).unwrap();
    let echoed = read_exact(&sock, size);
    sock.close().unwrap();

    assert_eq!(server.join().unwrap(), pattern(size));
    assert_eq!(echoed, pattern(size));
}

#[test]
fn read_modes_and_close_semantics() {
    let port = 43107;

    let server = thread::spawn(move || {
        let sock = Socket::open(SocketKind::Listener, port, LOCALHOST).unwrap();
        let got = read_exact(&sock, 4);
        assert_eq!(got, b"ping");
        sock.close().unwrap();
        sock
    });

    thread::sleep(Duration::from_millis(50));

    let sock = Socket::open(SocketKind::Initiator, port, LOCALHOST).unwrap();

    let mut buf = [0u8; 16];
    // Nothing buffered yet: non-blocking reads return 0 instead of waiting.
    assert_eq!(sock.read(&mut buf, ReadMode::NonBlocking).unwrap(), 0);
    // The timeout mode is not implemented.
    assert!(matches!(
        sock.read(&mut buf, ReadMode::Timeout),
        Err(Error::UnsupportedReadMode(_))
    ));

    sock.write(b"ping").unwrap();
    sock.close().unwrap();

    // Once teardown has begun, writes are refused.
    assert!(matches!(sock.write(b"late"), Err(Error::WriteAfterClose)));

    // Both engines are gone; a blocking read drains to EOF instead of
    // hanging.
    assert_eq!(sock.read(&mut buf, ReadMode::Blocking).unwrap(), 0);

    let server_sock = server.join().unwrap();
    assert!(matches!(
        server_sock.write(b"late"),
        Err(Error::WriteAfterClose)
    ));
}
