#![cfg(unix)]

use std::io::Write;
use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dns_netcore::Base;

mod util;
use util::init;

/// Scenario S5: a length-prefixed message that arrives in separate writes is
/// still delivered to the callback exactly once, whole.
#[test]
fn local_stream_reassembles_a_message_delivered_across_two_writes() {
    init();

    let (base_side, test_side) = UnixStream::pair().unwrap();
    base_side.set_nonblocking(true).unwrap();
    let base_fd = base_side.into_raw_fd();

    let body = b"fragmented control payload".to_vec();
    let mut framed = Vec::with_capacity(2 + body.len());
    framed.extend_from_slice(&(body.len() as u16).to_be_bytes());
    framed.extend_from_slice(&body);

    let (first, rest) = framed.split_at(3);
    let rest = rest.to_vec();
    let mut writer = test_side;
    writer.write_all(first).unwrap();

    let writer_thread = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        writer.write_all(&rest).unwrap();
    });

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_in_callback = received.clone();

    let mut base = Base::new(false).unwrap();
    base.create_local_stream(
        base_fd,
        256,
        Box::new(move |ctx| {
            received_in_callback.lock().unwrap().extend_from_slice(ctx.request());
            ctx.exit();
            false
        }),
    )
    .unwrap();

    // The first readable wakeup only has 3 of the framed message's bytes
    // (spec §4.5 `READ_LEN`/`READ_BODY`): `dispatch` must keep looping
    // through a second wakeup instead of giving up after one partial read.
    base.dispatch();

    writer_thread.join().unwrap();
    assert_eq!(*received.lock().unwrap(), body);
}
