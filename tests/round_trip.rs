use pcqueue::{
    Consumer, Error, InsertItem, MemChannel, ProducerConsumerQueue, RemoveItem, Skip,
};

#[test]
fn scalar_batch_round_trip() {
    let channel = MemChannel::new(0);
    let (mut producer, mut consumer) = ProducerConsumerQueue::create(&channel, 64, 0)
        .expect("queue")
        .split();

    // u32 + u16 + u32 = 10 serialized bytes.
    producer
        .try_insert(&[&7u32 as &dyn InsertItem, &21u16, &0xFFFF_FFFFu32])
        .expect("insert");
    assert_eq!(producer.used_bytes(), 10);
    assert_eq!(consumer.used_bytes(), 10);
    assert_eq!(producer.free_bytes(), 54);

    let mut a = 0u32;
    let mut b = 0u16;
    let mut c = 0u32;
    let mut items: [&mut dyn RemoveItem; 3] = [&mut a, &mut b, &mut c];
    consumer.try_remove(&mut items).expect("remove");
    assert_eq!((a, b, c), (7, 21, 0xFFFF_FFFF));
    assert!(consumer.is_empty());
    assert_eq!(producer.free_bytes(), 64);
}

#[test]
fn heterogeneous_batch_with_payloads() {
    let channel = MemChannel::new(0);
    let (mut producer, mut consumer) = ProducerConsumerQueue::create(&channel, 1024, 0)
        .expect("queue")
        .split();

    let blob: Vec<u8> = (0u8..32).collect();
    let label = "ticker/BTC-USD".to_string();
    producer
        .try_insert(&[&42u64 as &dyn InsertItem, &blob, &label, &true])
        .expect("insert");

    let mut seq = 0u64;
    let mut payload: Vec<u8> = Vec::new();
    let mut name = String::new();
    let mut flag = false;
    let mut items: [&mut dyn RemoveItem; 4] =
        [&mut seq, &mut payload, &mut name, &mut flag];
    consumer.try_remove(&mut items).expect("remove");
    assert_eq!(seq, 42);
    assert_eq!(payload, blob);
    assert_eq!(name, label);
    assert!(flag);
    assert!(consumer.is_empty());
}

#[test]
fn oversized_payload_travels_out_of_band() {
    let channel = MemChannel::new(0);
    let (mut producer, mut consumer) = ProducerConsumerQueue::create(&channel, 256, 0)
        .expect("queue")
        .split();

    // Well past capacity / 16, and larger than the ring itself could hold
    // inline alongside its length header.
    let blob = vec![0xA5u8; 4096];
    producer
        .try_insert(&[&blob as &dyn InsertItem])
        .expect("insert");
    // Only length + region id crossed the ring.
    assert_eq!(producer.used_bytes(), 8);

    let mut out: Vec<u8> = Vec::new();
    let mut items: [&mut dyn RemoveItem; 1] = [&mut out];
    consumer.try_remove(&mut items).expect("remove");
    assert_eq!(out, blob);
}

#[test]
fn borrowed_slice_inserts_match_vec_wire_form() {
    let channel = MemChannel::new(0);
    let (mut producer, mut consumer) = ProducerConsumerQueue::create(&channel, 128, 0)
        .expect("queue")
        .split();

    let bytes = [9u8, 8, 7, 6];
    producer
        .try_insert(&[&&bytes[..] as &dyn InsertItem])
        .expect("insert");

    let mut out: Vec<u8> = Vec::new();
    let mut items: [&mut dyn RemoveItem; 1] = [&mut out];
    consumer.try_remove(&mut items).expect("remove");
    assert_eq!(out, bytes);
}

#[test]
fn skip_discards_without_a_destination() {
    let channel = MemChannel::new(0);
    let (mut producer, mut consumer) = ProducerConsumerQueue::create(&channel, 128, 0)
        .expect("queue")
        .split();

    producer
        .try_insert(&[&1u32 as &dyn InsertItem, &2u64, &3u32])
        .expect("insert");

    let mut first = 0u32;
    let mut skipped = Skip::<u64>::new();
    let mut last = 0u32;
    let mut items: [&mut dyn RemoveItem; 3] = [&mut first, &mut skipped, &mut last];
    consumer.try_remove(&mut items).expect("remove");
    assert_eq!((first, last), (1, 3));
    assert!(consumer.is_empty());
}

#[test]
fn failed_removal_leaves_queue_untouched() {
    let channel = MemChannel::new(0);
    let (mut producer, mut consumer) = ProducerConsumerQueue::create(&channel, 64, 0)
        .expect("queue")
        .split();

    producer.try_insert(&[&5u16 as &dyn InsertItem]).expect("insert");

    // Asking for more than is enqueued must not consume the u16.
    let mut a = 0u16;
    let mut b = 0u64;
    let mut items: [&mut dyn RemoveItem; 2] = [&mut a, &mut b];
    assert!(matches!(
        consumer.try_remove(&mut items),
        Err(Error::NotReady)
    ));
    assert_eq!(consumer.used_bytes(), 2);

    let mut a = 0u16;
    let mut items: [&mut dyn RemoveItem; 1] = [&mut a];
    consumer.try_remove(&mut items).expect("remove");
    assert_eq!(a, 5);
}

#[test]
fn out_of_band_region_survives_a_not_ready_removal() {
    let channel = MemChannel::new(0);
    let (mut producer, mut consumer) = ProducerConsumerQueue::create(&channel, 256, 0)
        .expect("queue")
        .split();

    let blob = vec![0x42u8; 64];
    producer
        .try_insert(&[&blob as &dyn InsertItem, &7u32])
        .expect("insert");

    // Mismatched batch: the Vec deserializes, then the u64 runs out of
    // bytes. The whole batch must roll back, region included.
    let mut first: Vec<u8> = Vec::new();
    let mut wrong = 0u64;
    let mut items: [&mut dyn RemoveItem; 2] = [&mut first, &mut wrong];
    assert!(matches!(
        consumer.try_remove(&mut items),
        Err(Error::NotReady)
    ));
    assert_eq!(consumer.used_bytes(), 12);

    let mut payload: Vec<u8> = Vec::new();
    let mut tag = 0u32;
    let mut items: [&mut dyn RemoveItem; 2] = [&mut payload, &mut tag];
    consumer
        .try_remove(&mut items)
        .expect("retry after transient failure");
    assert_eq!(payload, blob);
    assert_eq!(tag, 7);
    assert!(consumer.is_empty());
}

#[test]
fn producer_alloc_shared_memory_seeds_contents() {
    let channel = MemChannel::new(0);
    let (producer, consumer) = ProducerConsumerQueue::create(&channel, 64, 0)
        .expect("queue")
        .split();

    let seed = b"warm start state";
    let (id, _region) = producer
        .alloc_shared_memory(64, Some(seed.as_slice()))
        .expect("alloc");
    let found = consumer.lookup_shared_memory(id).expect("lookup");
    let mut out = vec![0u8; seed.len()];
    unsafe {
        std::ptr::copy_nonoverlapping(found.base(), out.as_mut_ptr(), seed.len());
    }
    assert_eq!(out, seed);
}

#[cfg(target_os = "linux")]
#[test]
fn transferred_consumer_resumes_in_flight_data() {
    let channel = MemChannel::new(3);
    let (mut producer, consumer) = ProducerConsumerQueue::create(&channel, 128, 0)
        .expect("queue")
        .split();

    producer
        .try_insert(&[&11u32 as &dyn InsertItem, &22u32])
        .expect("insert");

    // Flatten, ship as bytes, rebuild. The original consumer stays alive
    // until the import lands, then must no longer be used.
    let wire = consumer.export().expect("export").encode();
    let descriptor = pcqueue::EndpointDescriptor::decode(&wire).expect("decode");
    let peer_channel = MemChannel::new(3);
    let mut imported = Consumer::from_descriptor(&descriptor, &peer_channel).expect("import");
    drop(consumer);

    assert_eq!(imported.used_bytes(), 8);
    let mut a = 0u32;
    let mut b = 0u32;
    let mut items: [&mut dyn RemoveItem; 2] = [&mut a, &mut b];
    imported.try_remove(&mut items).expect("remove");
    assert_eq!((a, b), (11, 22));

    // The rebuilt end still wakes the original producer's semaphores.
    producer.try_insert(&[&33u32 as &dyn InsertItem]).expect("insert");
    let mut c = 0u32;
    let mut items: [&mut dyn RemoveItem; 1] = [&mut c];
    imported.try_remove(&mut items).expect("remove");
    assert_eq!(c, 33);
}

#[cfg(target_os = "linux")]
#[test]
fn import_rejects_descriptor_from_other_channel() {
    let channel = MemChannel::new(1);
    let (_producer, consumer) = ProducerConsumerQueue::create(&channel, 64, 0)
        .expect("queue")
        .split();
    let descriptor = consumer.export().expect("export");
    let wrong_channel = MemChannel::new(2);
    assert!(matches!(
        Consumer::from_descriptor(&descriptor, &wrong_channel),
        Err(Error::Fatal(_))
    ));
}
