//! Channel-stack scenarios over the in-memory transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_codec::{
    CodecError, Decode, Encode, FlattenedStream, InflatedStream, Memo, Sink, Source,
};
use weft_fabric::{
    in_memory_pair, make_queuelike, CallbackScheduler, Channel, Disconnected, MultiChannel,
    SerializedChannel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MinimumIdResponse {
    id: u64,
}

impl<S: Sink + ?Sized> Encode<S> for MinimumIdResponse {
    fn encode(&self, sink: &mut S) {
        self.id.encode(sink);
    }
}

impl<S: Source + ?Sized> Decode<S> for MinimumIdResponse {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        Ok(MinimumIdResponse { id: u64::decode(source)? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MinimumId {
    id: u64,
    max_id: u64,
}

impl<S: Sink + ?Sized> Encode<S> for MinimumId {
    fn encode(&self, sink: &mut S) {
        self.id.encode(sink);
        self.max_id.encode(sink);
    }
}

impl<S: Source + ?Sized> Decode<S> for MinimumId {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        Ok(MinimumId { id: u64::decode(source)?, max_id: u64::decode(source)? })
    }
}

#[test]
fn serialized_channel_over_in_memory_transport() {
    let scheduler = CallbackScheduler::new("test");
    let (raw_near, raw_far) = in_memory_pair::<Vec<u8>, Vec<u8>>(&scheduler);

    let typed: Arc<SerializedChannel<MinimumIdResponse, MinimumId>> =
        SerializedChannel::new(scheduler.clone(), raw_near);
    let typed =
        make_queuelike(&scheduler, typed as Arc<dyn Channel<MinimumIdResponse, MinimumId>>);
    let raw = make_queuelike(&scheduler, raw_far as Arc<dyn Channel<Vec<u8>, Vec<u8>>>);

    typed.write(MinimumIdResponse { id: 42 }).unwrap();

    let frame = raw.get_timeout(Duration::from_secs(5)).unwrap().expect("a frame");
    assert!(!frame.is_empty());
    let decoded: MinimumIdResponse = InflatedStream::new().deserialize(frame).unwrap();
    assert_eq!(decoded, MinimumIdResponse { id: 42 });

    let reply = FlattenedStream::new().serialize(&MinimumId { id: 11, max_id: 42 });
    raw.write(reply).unwrap();

    let received = typed.get_timeout(Duration::from_secs(5)).unwrap().expect("a message");
    assert_eq!(received, MinimumId { id: 11, max_id: 42 });
}

#[test]
fn seeded_memoization_sends_a_seen_record() {
    let scheduler = CallbackScheduler::new("test");
    let (raw_near, raw_far) = in_memory_pair::<Vec<u8>, Vec<u8>>(&scheduler);

    let typed: Arc<SerializedChannel<Memo<Vec<u8>>, Memo<Vec<u8>>>> =
        SerializedChannel::new(scheduler.clone(), raw_near);
    let raw = make_queuelike(&scheduler, raw_far as Arc<dyn Channel<Vec<u8>, Vec<u8>>>);

    // Both ends hold the large value already; seed the tables identically.
    let big = Memo::new(vec![9u8; 100_000]);
    typed.with_outbound_stream(|stream| stream.consider_written(&big));

    typed.write(big.clone()).unwrap();

    let frame = raw.get_timeout(Duration::from_secs(5)).unwrap().expect("a frame");
    assert!(frame.len() <= 5, "seen record was {} bytes", frame.len());

    let mut inflated = InflatedStream::new();
    inflated.consider_read(&big);
    let decoded: Memo<Vec<u8>> = inflated.deserialize(frame).unwrap();
    assert_eq!(decoded, big);
}

#[test]
fn queuelike_channel_becomes_normal_channel() {
    let scheduler = CallbackScheduler::new("test");
    let (near, far) = in_memory_pair::<String, String>(&scheduler);
    let queuelike = make_queuelike(&scheduler, near as Arc<dyn Channel<String, String>>);

    far.write("A".to_owned()).unwrap();
    far.write("B".to_owned()).unwrap();
    far.write("C".to_owned()).unwrap();

    assert_eq!(queuelike.get_timeout(Duration::from_secs(5)).unwrap().as_deref(), Some("A"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    queuelike.set_handlers(
        Box::new(move |message| sink.lock().unwrap().push(message)),
        Box::new(|| {}),
    );
    scheduler.block_until_idle();

    assert_eq!(*seen.lock().unwrap(), vec!["B", "C"]);

    far.write("D".to_owned()).unwrap();
    scheduler.block_until_idle();
    assert_eq!(*seen.lock().unwrap(), vec!["B", "C", "D"]);
}

#[test]
fn single_channel_preserves_send_order() {
    let scheduler = CallbackScheduler::new("test");
    let (raw_near, raw_far) = in_memory_pair::<Vec<u8>, Vec<u8>>(&scheduler);

    let sender: Arc<SerializedChannel<u64, u64>> =
        SerializedChannel::new(scheduler.clone(), raw_near);
    let receiver: Arc<SerializedChannel<u64, u64>> =
        SerializedChannel::new(scheduler.clone(), raw_far);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    receiver.set_handlers(
        Box::new(move |message| sink.lock().unwrap().push(message)),
        Box::new(|| {}),
    );

    for index in 0..200u64 {
        sender.write(index).unwrap();
    }
    scheduler.block_until_idle();

    assert_eq!(*seen.lock().unwrap(), (0..200).collect::<Vec<_>>());
}

#[test]
fn late_handler_install_preserves_order() {
    let scheduler = CallbackScheduler::new("test");
    let (near, far) = in_memory_pair::<String, String>(&scheduler);

    near.write("A".to_owned()).unwrap();
    near.write("B".to_owned()).unwrap();
    near.write("C".to_owned()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    far.set_handlers(
        Box::new(move |message| sink.lock().unwrap().push(message)),
        Box::new(|| {}),
    );
    scheduler.block_until_idle();
    assert_eq!(*seen.lock().unwrap(), vec!["A", "B", "C"]);
}

#[test]
fn disconnect_propagates_to_the_peer_exactly_once() {
    let scheduler = CallbackScheduler::new("test");
    let (near, far) = in_memory_pair::<u32, u32>(&scheduler);

    let disconnects = Arc::new(Mutex::new(0));
    let observed = disconnects.clone();
    far.set_handlers(
        Box::new(|_| {}),
        Box::new(move || *observed.lock().unwrap() += 1),
    );

    near.disconnect();
    near.disconnect();
    scheduler.block_until_idle();

    assert_eq!(*disconnects.lock().unwrap(), 1);
    assert_eq!(near.write(7), Err(Disconnected));
}

#[test]
fn concurrent_disconnects_deliver_once() {
    let scheduler = CallbackScheduler::new("test");
    let (near, far) = in_memory_pair::<u32, u32>(&scheduler);

    let disconnects = Arc::new(Mutex::new(0));
    let observed = disconnects.clone();
    far.set_handlers(
        Box::new(|_| {}),
        Box::new(move || *observed.lock().unwrap() += 1),
    );

    let contender = near.clone();
    let racer = std::thread::spawn(move || contender.disconnect());
    near.disconnect();
    racer.join().unwrap();
    scheduler.block_until_idle();

    assert_eq!(*disconnects.lock().unwrap(), 1);
}

#[test]
fn multi_channel_routes_by_priority_mod_n() {
    let scheduler = CallbackScheduler::new("test");

    let mut subs: Vec<Arc<dyn Channel<u32, u32>>> = Vec::new();
    let mut peers = Vec::new();
    for _ in 0..4 {
        let (near, far) = in_memory_pair::<u32, u32>(&scheduler);
        subs.push(near);
        peers.push(make_queuelike(&scheduler, far as Arc<dyn Channel<u32, u32>>));
    }

    let multi = MultiChannel::new(subs, Arc::new(|message: &u32| *message));
    for priority in 0..8u32 {
        multi.write(priority).unwrap();
    }
    scheduler.block_until_idle();

    for (index, peer) in peers.iter().enumerate() {
        let mut landed = Vec::new();
        while let Some(message) = peer.get_nonblocking().unwrap() {
            landed.push(message);
        }
        assert_eq!(landed, vec![index as u32, index as u32 + 4]);
    }
}

#[test]
fn multi_channel_disconnects_when_any_sub_channel_does() {
    let scheduler = CallbackScheduler::new("test");

    let mut subs: Vec<Arc<dyn Channel<u32, u32>>> = Vec::new();
    let mut far_sides = Vec::new();
    for _ in 0..3 {
        let (near, far) = in_memory_pair::<u32, u32>(&scheduler);
        subs.push(near);
        far_sides.push(far);
    }

    let multi = MultiChannel::new(subs, Arc::new(|message: &u32| *message));
    let disconnects = Arc::new(Mutex::new(0));
    let observed = disconnects.clone();
    multi.set_handlers(
        Box::new(|_| {}),
        Box::new(move || *observed.lock().unwrap() += 1),
    );

    far_sides[1].disconnect();
    scheduler.block_until_idle();

    assert_eq!(*disconnects.lock().unwrap(), 1);
    assert_eq!(multi.write(0), Err(Disconnected));
}
