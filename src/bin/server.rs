use std::env;
use std::net::Ipv4Addr;

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

    let port: u16 = env::var("RIVULET_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let bytes: usize = env::var("RIVULET_BYTES")
        .ok()
        .and_then(|b| b.parse().ok())
        .unwrap_or(10240);

    println!(">>> Waiting for a connection on port {port}...");
    let sock = Socket::open(SocketKind::Listener, port, Ipv4Addr::UNSPECIFIED).unwrap();

    let greeting = read_exact(&sock, 11);
    println!(">>> {}", String::from_utf8_lossy(&greeting));
    sock.write(b"Who's there?").unwrap();

    let name = read_exact(&sock, 7);
    println!(">>> {}", String::from_utf8_lossy(&name));
    sock.write(b"Rivulet who?").unwrap();

    println!(">>> Receiving {bytes} bytes...");
    let payload = read_exact(&sock, bytes);
    let expected: Vec<u8> = (0..payload.len()).map(|i| (i * 31 + 7) as u8).collect();
    if payload.len() == bytes && payload == expected {
        println!(">>> Transfer of {bytes} bytes verified");
    } else {
        println!(">>> Transfer mismatch: got {} bytes", payload.len());
    }

    sock.close().unwrap();
    println!(">>> Done");
}
