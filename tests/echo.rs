//! End-to-end exercise of the relay state machine: a real client socket, a
//! real upstream echo server, and the pool's event-driven dispatch wiring
//! them together exactly as `worker.rs` does, minus the process fork.

use std::io::{Read, Write};
use std::net::TcpListener as StdTcpListener;
use std::net::TcpStream as StdTcpStream;
use std::time::Duration;

use mio::net::TcpStream as MioTcpStream;
use relaypoold::config::HostDescriptor;
use relaypoold::pair::RetCode;
use relaypoold::pool::{Op, Pool};
use relaypoold::readiness::Readiness;

/// A single-shot echo server: accepts one connection, bounces back whatever
/// it reads until the peer closes.
fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
    addr
}

/// Pumps the pool against whatever readiness events arrive for `budget`,
/// driving connect-completion and read/write on every ready fd exactly as
/// `worker.rs::run` does.
fn pump(pool: &mut Pool, readiness: &mut Readiness, budget: Duration) {
    let deadline = std::time::Instant::now() + budget;
    while std::time::Instant::now() < deadline {
        let n = readiness.wait(Some(Duration::from_millis(50))).unwrap();
        if n == 0 {
            continue;
        }
        let events: Vec<(i32, bool, bool)> = readiness
            .events()
            .iter()
            .map(|e| (e.token().0 as i32, e.is_readable(), e.is_writable()))
            .collect();
        for (fd, readable, writable) in events {
            if writable && pool.finish_connecting(fd, readiness) {
                continue;
            }
            if readable {
                pool.process(fd, Op::Read, readiness);
            }
            if writable {
                pool.process(fd, Op::Write, readiness);
            }
        }
    }
}

#[test]
fn round_trips_a_message_through_the_pool() {
    let upstream_addr = spawn_echo_server();

    let host = HostDescriptor {
        name: upstream_addr.ip().to_string(),
        addr: upstream_addr.ip(),
        port: upstream_addr.port(),
        conncnt: 1,
    };
    let mut readiness = Readiness::new(16).unwrap();
    let mut pool = Pool::new(host, upstream_addr, &readiness);
    assert_eq!(pool.total_tracked(), 1);

    // Wait for the pool's own connect to the echo server to finish
    // handshaking before handing it a client.
    pump(&mut pool, &mut readiness, Duration::from_millis(500));

    // Stand in for the worker's own listener accepting a client: bind a
    // loopback listener, connect a real peer, accept it as the pair's
    // client-side socket.
    let proxy_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    let mut test_client = StdTcpStream::connect(proxy_addr).unwrap();
    let (accepted, client_addr) = proxy_listener.accept().unwrap();
    accepted.set_nonblocking(true).unwrap();
    let accepted = MioTcpStream::from_std(accepted);

    let handle = pool
        .pick(accepted, client_addr, &readiness)
        .expect("pool has an idle upstream slot");

    test_client.write_all(b"ping").unwrap();
    drop(handle);

    pump(&mut pool, &mut readiness, Duration::from_millis(500));

    test_client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    let mut buf = [0u8; 4];
    test_client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

#[test]
fn release_recycles_the_pair_into_awaiting_repair() {
    let upstream_addr = spawn_echo_server();
    let host = HostDescriptor {
        name: upstream_addr.ip().to_string(),
        addr: upstream_addr.ip(),
        port: upstream_addr.port(),
        conncnt: 1,
    };
    let mut readiness = Readiness::new(16).unwrap();
    let mut pool = Pool::new(host, upstream_addr, &readiness);
    pump(&mut pool, &mut readiness, Duration::from_millis(500));
    assert_eq!(pool.total_tracked(), 1);

    let proxy_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    let _client = StdTcpStream::connect(proxy_addr).unwrap();
    let (accepted, client_addr) = proxy_listener.accept().unwrap();
    accepted.set_nonblocking(true).unwrap();
    let accepted = MioTcpStream::from_std(accepted);

    let handle = pool
        .pick(accepted, client_addr, &readiness)
        .expect("pool has an idle upstream slot");
    assert_eq!(pool.used_count(), 1);

    pool.release(handle, &readiness);
    assert_eq!(pool.used_count(), 0);
    assert_eq!(pool.total_tracked(), 1);

    pool.recycle(&readiness);
    pump(&mut pool, &mut readiness, Duration::from_millis(500));
    assert_eq!(pool.total_tracked(), 1);
}

#[test]
fn retcode_distinguishes_ok_paths() {
    assert_ne!(RetCode::Ok, RetCode::Closed);
}
