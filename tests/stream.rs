use std::thread;
use std::time::Duration;

use pcqueue::{InsertItem, MemChannel, ProducerConsumerQueue, RemoveItem};

const RECORDS: u32 = 10_000;
const WAIT: Option<Duration> = Some(Duration::from_secs(30));

#[test]
fn ten_thousand_records_arrive_in_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let channel = MemChannel::new(0);
    let (mut producer, mut consumer) = ProducerConsumerQueue::create(&channel, 256, 0)
        .expect("queue")
        .split();

    let writer = thread::spawn(move || {
        for seq in 0..RECORDS {
            // Variable-length payload keeps the cursors off any fixed stride.
            let payload: Vec<u8> = (0..(seq % 11) as u8).map(|b| b ^ seq as u8).collect();
            producer
                .try_wait_insert(WAIT, &[&seq as &dyn InsertItem, &payload])
                .expect("insert");
        }
    });

    for seq in 0..RECORDS {
        let mut got_seq = 0u32;
        let mut got_payload: Vec<u8> = Vec::new();
        let mut items: [&mut dyn RemoveItem; 2] = [&mut got_seq, &mut got_payload];
        consumer.try_wait_remove(WAIT, &mut items).expect("remove");
        assert_eq!(got_seq, seq, "records reordered");
        let expected: Vec<u8> = (0..(seq % 11) as u8).map(|b| b ^ seq as u8).collect();
        assert_eq!(got_payload, expected, "payload corrupted at {seq}");
    }
    assert!(consumer.is_empty());
    writer.join().expect("writer");
}

#[test]
fn blocking_ends_rendezvous_through_an_empty_queue() {
    let channel = MemChannel::new(0);
    let (mut producer, mut consumer) = ProducerConsumerQueue::create(&channel, 16, 0)
        .expect("queue")
        .split();

    // Consumer parks first; a late producer must wake it.
    let reader = thread::spawn(move || {
        let mut out = 0u64;
        let mut items: [&mut dyn RemoveItem; 1] = [&mut out];
        consumer.try_wait_remove(WAIT, &mut items).expect("remove");
        out
    });
    thread::sleep(Duration::from_millis(50));
    producer
        .try_wait_insert(WAIT, &[&0xFEED_FACEu64 as &dyn InsertItem])
        .expect("insert");
    assert_eq!(reader.join().expect("reader"), 0xFEED_FACE);
}

#[test]
fn blocking_producer_wakes_when_space_frees_up() {
    let channel = MemChannel::new(0);
    let (mut producer, mut consumer) = ProducerConsumerQueue::create(&channel, 8, 0)
        .expect("queue")
        .split();
    producer.try_insert(&[&1u64 as &dyn InsertItem]).expect("fill");

    let writer = thread::spawn(move || {
        producer
            .try_wait_insert(WAIT, &[&2u64 as &dyn InsertItem])
            .expect("insert");
        producer
    });
    thread::sleep(Duration::from_millis(50));

    let mut out = 0u64;
    let mut items: [&mut dyn RemoveItem; 1] = [&mut out];
    consumer.try_remove(&mut items).expect("remove");
    assert_eq!(out, 1);

    let producer = writer.join().expect("writer");
    assert!(producer.is_full());
    let mut items: [&mut dyn RemoveItem; 1] = [&mut out];
    consumer.try_remove(&mut items).expect("remove");
    assert_eq!(out, 2);
}
