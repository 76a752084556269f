//! Socket transport scenarios over loopback TCP.

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_fabric::{make_queuelike, CallbackScheduler, Channel, SocketChannel};

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let client = TcpStream::connect(address).unwrap();
    let (server, _) = listener.accept().unwrap();
    client.set_nodelay(true).unwrap();
    server.set_nodelay(true).unwrap();
    (client, server)
}

#[test]
fn frames_cross_intact_including_large_ones() {
    let scheduler = CallbackScheduler::new("test");
    let (client, server) = tcp_pair();

    let near = SocketChannel::new(scheduler.clone(), client);
    let far = SocketChannel::new(scheduler.clone(), server);
    near.set_description("near side");

    // Installing handlers starts the transport threads on both sides.
    near.set_handlers(Box::new(|_| {}), Box::new(|| {}));
    let far = make_queuelike(&scheduler, far as Arc<dyn Channel<Vec<u8>, Vec<u8>>>);

    let small = b"hello fabric".to_vec();
    let large: Vec<u8> = (0..3 * 1024 * 1024u32).map(|index| (index % 251) as u8).collect();

    near.write(small.clone()).unwrap();
    near.write(large.clone()).unwrap();

    let first = far.get_timeout(Duration::from_secs(10)).unwrap().expect("small frame");
    assert_eq!(first, small);
    let second = far.get_timeout(Duration::from_secs(10)).unwrap().expect("large frame");
    assert_eq!(second.len(), large.len());
    assert_eq!(second, large);
}

#[test]
fn frames_arrive_in_send_order() {
    let scheduler = CallbackScheduler::new("test");
    let (client, server) = tcp_pair();

    let near = SocketChannel::new(scheduler.clone(), client);
    let far = SocketChannel::new(scheduler.clone(), server);

    near.set_handlers(Box::new(|_| {}), Box::new(|| {}));
    let far = make_queuelike(&scheduler, far as Arc<dyn Channel<Vec<u8>, Vec<u8>>>);

    for index in 0..100u8 {
        near.write(vec![index]).unwrap();
    }
    for index in 0..100u8 {
        let frame = far.get_timeout(Duration::from_secs(10)).unwrap().expect("a frame");
        assert_eq!(frame, vec![index]);
    }
}

#[test]
fn concurrent_disconnects_join_threads_and_notify_once() {
    let scheduler = CallbackScheduler::new("test");
    let (client, server) = tcp_pair();

    let near = SocketChannel::new(scheduler.clone(), client);
    let far = SocketChannel::new(scheduler.clone(), server);

    let near_disconnects = Arc::new(Mutex::new(0));
    let observed = near_disconnects.clone();
    near.set_handlers(
        Box::new(|_| {}),
        Box::new(move || *observed.lock().unwrap() += 1),
    );
    far.set_handlers(Box::new(|_| {}), Box::new(|| {}));

    let contender = near.clone();
    let racer = std::thread::spawn(move || contender.disconnect());
    near.disconnect();
    racer.join().unwrap();
    scheduler.block_until_idle();

    assert_eq!(*near_disconnects.lock().unwrap(), 1);
    assert!(near.write(vec![1]).is_err());
}

#[test]
fn peer_closure_surfaces_as_disconnect() {
    let scheduler = CallbackScheduler::new("test");
    let (client, server) = tcp_pair();

    let near = SocketChannel::new(scheduler.clone(), client);
    let far = SocketChannel::new(scheduler.clone(), server);

    let far_disconnects = Arc::new(Mutex::new(0));
    let observed = far_disconnects.clone();
    far.set_handlers(
        Box::new(|_| {}),
        Box::new(move || *observed.lock().unwrap() += 1),
    );
    near.set_handlers(Box::new(|_| {}), Box::new(|| {}));

    near.disconnect();

    // The peer notices the closed stream on its reader thread; give it a
    // moment and then confirm exactly one notification.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while *far_disconnects.lock().unwrap() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    scheduler.block_until_idle();
    assert_eq!(*far_disconnects.lock().unwrap(), 1);
}
