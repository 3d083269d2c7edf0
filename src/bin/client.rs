use std::env;
use std::net::Ipv4Addr;
use std::str::FromStr;

use rivulet::{ReadMode, Socket, SocketKind};

fn read_exact(sock: &Socket, want: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(want);
    let mut buf = [0u8; 2048];

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

fn main() {
    env_logger::init();

    let addr = env::var("RIVULET_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
    let addr = Ipv4Addr::from_str(&addr).expect("RIVULET_ADDR must be an IPv4 address");
    let port: u16 = env::var("RIVULET_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let bytes: usize = env::var("RIVULET_BYTES")
        .ok()
        .and_then(|b| b.parse().ok())
        .unwrap_or(10240);

    println!(">>> Connecting to {addr}:{port}...");
    let sock = Socket::open(SocketKind::Initiator, port, addr).unwrap();

    sock.write(b"Knock knock").unwrap();
    let reply = read_exact(&sock, 12);
    println!(">>> {}", String::from_utf8_lossy(&reply));

    sock.write(b"Rivulet").unwrap();
    let reply = read_exact(&sock, 12);
    println!(">>> {}", String::from_utf8_lossy(&reply));

    println!(">>> Sending {bytes} bytes...");
    let payload: Vec<u8> = (0..bytes).map(|i| (i * 31 + 7) as u8).collect();
    sock.write(&payload).unwrap();

    sock.close().unwrap();
    println!(">>> Done");
}
