//! End-to-end scenarios over real TCP loopback sockets: a plain echo round
//! trip, and a slow reader that forces the output buffer past its
//! high-water mark. Grounded in spirit on
//! `examples/original_source/examples/testserver.cc`'s `EchoServer`.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use muduo_rs::{ConnectionCallback, EventLoop, EventLoopHandle, HighWaterMarkCallback, MessageCallback, PortOption, TcpConnection, TcpServer};

/// Spawns a server loop on its own OS thread and hands back its
/// `EventLoopHandle` once the loop is up and listening, mirroring how
/// `EventLoopThread` publishes its handle back to the spawner.
fn spawn_server(addr: SocketAddr, configure: impl FnOnce(&std::rc::Rc<std::cell::RefCell<TcpServer>>) + Send + 'static) -> (EventLoopHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(&event_loop, addr, "echo-test".to_string(), PortOption::NoReusePort).unwrap();
        configure(&server);
        TcpServer::start(&server);
        tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let handle = rx.recv().expect("server thread died before publishing its handle");
    (handle, join)
}

#[test]
fn echo_round_trip_over_loopback() {
    let echo: MessageCallback = Arc::new(|conn, buf, _when| {
        let data = buf.retrieve_all_as_vec();
        TcpConnection::send(conn, &data);
    });

    let addr: SocketAddr = "127.0.0.1:18231".parse().unwrap();
    let (handle, join) = spawn_server(addr, move |server| {
        let mut server = server.borrow_mut();
        server.set_message_callback(echo);
        server.set_thread_num(2, None);
    });

    // give the acceptor a moment to start listening before dialing in.
    thread::sleep(Duration::from_millis(100));

    let mut client = StdTcpStream::connect(addr).unwrap();
    client.write_all(b"hello reactor").unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello reactor");

    drop(client);
    handle.quit();
    join.join().unwrap();
}

#[test]
fn backpressure_high_water_mark_fires_for_slow_reader() {
    const HIGH_WATER_MARK: usize = 64 * 1024;

    let (hwm_tx, hwm_rx) = mpsc::channel::<usize>();
    let hwm_tx = Arc::new(Mutex::new(Some(hwm_tx)));

    // Much larger than any kernel send buffer, so a client that never reads
    // forces most of it to sit in our own output buffer.
    let payload = Arc::new(vec![b'x'; 8 * 1024 * 1024]);

    let payload_for_cb = payload.clone();
    let connection_cb: ConnectionCallback = Arc::new(move |conn| {
        if TcpConnection::connected(conn) {
            TcpConnection::send(conn, &payload_for_cb);
        }
    });

    let high_water_mark_cb: HighWaterMarkCallback = Arc::new(move |_conn, total| {
        if let Some(tx) = hwm_tx.lock().unwrap().take() {
            let _ = tx.send(total);
        }
    });

    let addr: SocketAddr = "127.0.0.1:18232".parse().unwrap();
    let (handle, join) = spawn_server(addr, move |server| {
        let mut server = server.borrow_mut();
        server.set_connection_callback(connection_cb);
        server.set_high_water_mark_callback(high_water_mark_cb, HIGH_WATER_MARK);
        server.set_thread_num(1, None);
    });

    thread::sleep(Duration::from_millis(100));

    // Connect but never read: a deliberately slow reader.
    let client = StdTcpStream::connect(addr).unwrap();

    let total = hwm_rx.recv_timeout(Duration::from_secs(5)).expect("high water mark callback did not fire");
    assert!(total >= HIGH_WATER_MARK);

    drop(client);
    handle.quit();
    join.join().unwrap();
}
