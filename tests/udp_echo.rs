#![cfg(unix)]

use std::net::UdpSocket;
use std::os::unix::io::IntoRawFd;
use std::time::Duration;

use dns_netcore::Base;

mod util;
use util::init;

/// Scenario S1: a UDP comm point echoes a datagram back to its sender.
#[test]
fn udp_echo_reply_reaches_the_sender() {
    init();

    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server_addr = server.local_addr().unwrap();
    server.set_nonblocking(true).unwrap();
    let server_fd = server.into_raw_fd();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // The datagram is sent before `dispatch` ever runs, so it is already
    // sitting in the server socket's receive buffer by the time `poll`
    // is asked to wait for readiness (spec §4.2 steps 1-5).
    client.send_to(b"hello", server_addr).unwrap();

    let mut base = Base::new(false).unwrap();
    base.create_udp(
        server_fd,
        512,
        Box::new(|ctx| {
            let reply = ctx.request().to_vec();
            ctx.set_reply(&reply);
            ctx.exit();
            true
        }),
    )
    .unwrap();

    base.dispatch();

    let mut buf = [0u8; 512];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");
}
