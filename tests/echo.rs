//! End-to-end echo/batch/shutdown scenarios against a live `Datapath`.
//!
//! These exercise the public API the way an upper-layer QUIC stack would:
//! create a datapath, create bindings, push datagrams through the real
//! kernel loopback interface, and observe what the receive callback sees.

use quic_darwin_datapath::config::DatapathConfig;
use quic_darwin_datapath::send::MAX_SEND_BATCH_SIZE;
use quic_darwin_datapath::{return_recv_datagrams, Addr, Datapath};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn wait_until(mut pred: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn echo_v4_reports_matching_local_and_remote_ports() {
    let received: Arc<Mutex<Vec<(u16, u16, Ipv4Addr)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();

    let dp = Datapath::<()>::new(
        0,
        Arc::new(move |_binding, block| {
            let local = block.tuple.local;
            let remote = block.tuple.remote;
            if let Addr::V4 { ip, .. } = local {
                received_clone.lock().unwrap().push((local.port(), remote.port(), ip));
            }
        }),
        Arc::new(|_, _| {}),
        DatapathConfig::default(),
    )
    .unwrap();

    let b1 = dp
        .create_binding(Addr::new_v4(Ipv4Addr::LOCALHOST, 0, 0), None, ())
        .unwrap();
    let b2 = dp
        .create_binding(Addr::new_v4(Ipv4Addr::LOCALHOST, 0, 0), None, ())
        .unwrap();

    let p1 = b1.local_address().port();
    let p2 = b2.local_address().port();

    let mut ctx = b1.alloc_send_context(b2.local_address(), None, 64);
    b1.alloc_send_datagram(&mut ctx, 64).unwrap().fill(b'x');
    b1.send_to(ctx).unwrap();

    let ok = wait_until(|| {
        received
            .lock()
            .unwrap()
            .iter()
            .any(|&(local, remote, ip)| local == p2 && remote == p1 && ip == Ipv4Addr::LOCALHOST)
    });
    assert!(ok, "expected echo with local={p2} remote={p1}");

    b1.delete();
    b2.delete();
    dp.shutdown();
}

#[test]
fn echo_v6_reports_matching_local_and_remote_ports() {
    let received: Arc<Mutex<Vec<(u16, u16)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();

    let dp = Datapath::<()>::new(
        0,
        Arc::new(move |_binding, block| {
            received_clone
                .lock()
                .unwrap()
                .push((block.tuple.local.port(), block.tuple.remote.port()));
        }),
        Arc::new(|_, _| {}),
        DatapathConfig::default(),
    )
    .unwrap();

    let b1 = dp
        .create_binding(Addr::new_v6(Ipv6Addr::LOCALHOST, 0, 0), None, ())
        .unwrap();
    let b2 = dp
        .create_binding(Addr::new_v6(Ipv6Addr::LOCALHOST, 0, 0), None, ())
        .unwrap();

    let p1 = b1.local_address().port();
    let p2 = b2.local_address().port();

    let mut ctx = b1.alloc_send_context(b2.local_address(), None, 32);
    b1.alloc_send_datagram(&mut ctx, 32).unwrap().fill(b'y');
    b1.send_to(ctx).unwrap();

    let ok = wait_until(|| {
        received
            .lock()
            .unwrap()
            .iter()
            .any(|&(local, remote)| local == p2 && remote == p1)
    });
    assert!(ok, "expected v6 echo with local={p2} remote={p1}");

    b1.delete();
    b2.delete();
    dp.shutdown();
}

#[test]
fn batch_of_ten_arrives_in_order() {
    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();

    let dp = Datapath::<()>::new(
        0,
        Arc::new(move |_binding, block| {
            received_clone.lock().unwrap().push(block.buffer[0]);
            return_recv_datagrams(block);
        }),
        Arc::new(|_, _| {}),
        DatapathConfig::default(),
    )
    .unwrap();

    let receiver = dp
        .create_binding(Addr::new_v4(Ipv4Addr::LOCALHOST, 0, 0), None, ())
        .unwrap();
    let sender = dp
        .create_binding(Addr::new_v4(Ipv4Addr::LOCALHOST, 0, 0), None, ())
        .unwrap();
    let remote = receiver.local_address();

    let mut ctx = sender.alloc_send_context(remote, None, 1200);
    for i in 0..MAX_SEND_BATCH_SIZE {
        let slot = sender.alloc_send_datagram(&mut ctx, 1200).unwrap();
        slot[0] = i as u8;
    }
    // An 11th datagram must be rejected while the context stays usable.
    assert!(sender.alloc_send_datagram(&mut ctx, 1200).is_none());
    assert!(sender.is_send_context_full(&ctx));

    sender.send_to(ctx).unwrap();

    let ok = wait_until(|| received.lock().unwrap().len() == MAX_SEND_BATCH_SIZE);
    assert!(ok, "only received {} of {MAX_SEND_BATCH_SIZE}", received.lock().unwrap().len());
    assert_eq!(*received.lock().unwrap(), (0..MAX_SEND_BATCH_SIZE as u8).collect::<Vec<_>>());

    receiver.delete();
    sender.delete();
    dp.shutdown();
}

#[test]
fn send_from_to_selects_the_requested_source_address() {
    let received: Arc<Mutex<Option<Ipv4Addr>>> = Arc::new(Mutex::new(None));
    let received_clone = received.clone();

    let dp = Datapath::<()>::new(
        0,
        Arc::new(move |_binding, block| {
            if let Addr::V4 { ip, .. } = block.tuple.local {
                *received_clone.lock().unwrap() = Some(ip);
            }
        }),
        Arc::new(|_, _| {}),
        DatapathConfig::default(),
    )
    .unwrap();

    let receiver = dp
        .create_binding(Addr::new_v4(Ipv4Addr::UNSPECIFIED, 0, 0), None, ())
        .unwrap();
    let sender = dp
        .create_binding(Addr::new_v4(Ipv4Addr::LOCALHOST, 0, 0), None, ())
        .unwrap();
    let remote = receiver.local_address();
    let source = Addr::new_v4(Ipv4Addr::LOCALHOST, 0, 0);

    let mut ctx = sender.alloc_send_context(remote, Some(source), 8);
    sender.alloc_send_datagram(&mut ctx, 8).unwrap().fill(1);
    sender.send_from_to(source, ctx).unwrap();

    let ok = wait_until(|| *received.lock().unwrap() == Some(Ipv4Addr::LOCALHOST));
    assert!(ok, "expected source address {:?}, got {:?}", Ipv4Addr::LOCALHOST, *received.lock().unwrap());

    receiver.delete();
    sender.delete();
    dp.shutdown();
}

#[test]
fn over_batch_alloc_is_rejected_but_context_stays_sendable() {
    let dp = Datapath::<()>::new(
        0,
        Arc::new(|_, _| {}),
        Arc::new(|_, _| {}),
        DatapathConfig::default(),
    )
    .unwrap();
    let receiver = dp
        .create_binding(Addr::new_v4(Ipv4Addr::LOCALHOST, 0, 0), None, ())
        .unwrap();
    let sender = dp
        .create_binding(Addr::new_v4(Ipv4Addr::LOCALHOST, 0, 0), None, ())
        .unwrap();
    let remote = receiver.local_address();

    let mut ctx = sender.alloc_send_context(remote, None, 64);
    for _ in 0..MAX_SEND_BATCH_SIZE {
        assert!(sender.alloc_send_datagram(&mut ctx, 64).is_some());
    }
    assert!(sender.alloc_send_datagram(&mut ctx, 64).is_none());
    // A rejected 11th alloc doesn't poison the context for a normal send.
    assert!(sender.send_to(ctx).is_ok());

    receiver.delete();
    sender.delete();
    dp.shutdown();
}

#[test]
fn binding_delete_stops_callbacks_before_returning() {
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter_clone = counter.clone();

    let dp = Datapath::<()>::new(
        0,
        Arc::new(move |_binding, _block| {
            counter_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }),
        Arc::new(|_, _| {}),
        DatapathConfig::default(),
    )
    .unwrap();

    let receiver = dp
        .create_binding(Addr::new_v4(Ipv4Addr::LOCALHOST, 0, 0), None, ())
        .unwrap();
    let sender = dp
        .create_binding(Addr::new_v4(Ipv4Addr::LOCALHOST, 0, 0), None, ())
        .unwrap();
    let remote = receiver.local_address();

    receiver.delete();

    for _ in 0..50 {
        let mut ctx = sender.alloc_send_context(remote, None, 16);
        sender.alloc_send_datagram(&mut ctx, 16).unwrap().fill(0);
        let _ = sender.send_to(ctx);
    }

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 0);

    sender.delete();
    dp.shutdown();
}
