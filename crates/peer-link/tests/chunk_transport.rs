mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use common::{FakeChannel, init_tracing, test_keys};
use peer_link::crypto::RsaOaep;
use peer_link::{
    ChannelHandle, ChunkReceiver, CryptoError, EncryptedChunkTransport, KeyPair, KeyProvider,
    LocalKey, SessionConfig, TransportError, TransportEvent, TransportPump,
};

struct Fixture {
    keys: Arc<RsaOaep>,
    peer: KeyPair,
    channel: Arc<FakeChannel>,
    handle: ChannelHandle,
    transport: Arc<EncryptedChunkTransport>,
}

async fn fixture(threshold: usize) -> Fixture {
    let keys = test_keys();
    let peer = keys.generate_key_pair().await.expect("peer key pair");
    let (channel, handle) = FakeChannel::new("fileTransfer");
    let transport = EncryptedChunkTransport::new(
        handle.channel.clone(),
        keys.clone(),
        Arc::new(peer.public.clone()),
        threshold,
    )
    .await;
    Fixture {
        keys,
        peer,
        channel,
        handle,
        transport,
    }
}

async fn decrypt_sent(fixture: &Fixture) -> Vec<Bytes> {
    let mut plaintexts = Vec::new();
    for ciphertext in fixture.channel.sent() {
        let plaintext = fixture
            .keys
            .decrypt(&fixture.peer.private, &ciphertext)
            .await
            .expect("peer can decrypt");
        plaintexts.push(Bytes::from(plaintext));
    }
    plaintexts
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("transport event in time")
        .expect("transport event stream open")
}

#[tokio::test]
async fn backpressure_pauses_and_resumes_in_order() {
    init_tracing();
    // 1024-bit ciphertexts are 128 bytes; two fit under the threshold.
    let fixture = fixture(200).await;
    assert_eq!(fixture.channel.low_threshold(), 200);

    for n in 0..5 {
        let sent = fixture
            .transport
            .send(format!("chunk-{n}"))
            .await
            .expect("queued");
        assert_eq!(sent, 0);
    }
    assert_eq!(fixture.transport.queued(), 5);

    fixture.channel.set_open();
    assert_eq!(fixture.transport.drain().await.expect("drain"), 2);
    assert_eq!(fixture.transport.queued(), 3);

    fixture.channel.set_buffered(0);
    assert_eq!(fixture.transport.drain().await.expect("drain"), 2);
    fixture.channel.set_buffered(0);
    assert_eq!(fixture.transport.drain().await.expect("drain"), 1);
    assert_eq!(fixture.transport.queued(), 0);

    let expected: Vec<Bytes> = (0..5)
        .map(|n| Bytes::from(format!("chunk-{n}")))
        .collect();
    assert_eq!(decrypt_sent(&fixture).await, expected);
    assert_eq!(fixture.transport.send_progress(), 5 * 7);
}

#[tokio::test]
async fn oversized_chunk_is_reported_and_the_rest_still_sent() {
    init_tracing();
    let fixture = fixture(16 * 1024).await;
    fixture.transport.send("before").await.expect("queued");
    fixture
        .transport
        .send(vec![7u8; 100])
        .await
        .expect("queued");
    fixture.transport.send("after").await.expect("queued");
    assert_eq!(fixture.transport.queued(), 3);

    fixture.channel.set_open();
    let err = fixture.transport.drain().await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::Encryption(CryptoError::ChunkTooLarge { len: 100, max: 62 })
    ));
    assert_eq!(fixture.transport.queued(), 1);
    assert_eq!(fixture.transport.drain().await.expect("drain"), 1);
    assert_eq!(fixture.transport.queued(), 0);
    assert_eq!(
        decrypt_sent(&fixture).await,
        vec![Bytes::from_static(b"before"), Bytes::from_static(b"after")]
    );
    assert_eq!(fixture.transport.send_progress(), 11);
}

#[tokio::test]
async fn every_oversized_chunk_is_reported() {
    init_tracing();
    let fixture = fixture(16 * 1024).await;
    fixture.transport.send(vec![1u8; 100]).await.expect("queued");
    fixture.transport.send(vec![2u8; 200]).await.expect("queued");
    fixture.transport.send("ok").await.expect("queued");

    fixture.channel.set_open();
    assert!(matches!(
        fixture.transport.drain().await,
        Err(TransportError::Encryption(CryptoError::ChunkTooLarge { len: 100, .. }))
    ));
    assert_eq!(fixture.transport.queued(), 2);
    assert!(matches!(
        fixture.transport.drain().await,
        Err(TransportError::Encryption(CryptoError::ChunkTooLarge { len: 200, .. }))
    ));
    assert_eq!(fixture.transport.queued(), 1);
    assert_eq!(fixture.transport.drain().await.expect("drain"), 1);
    assert_eq!(decrypt_sent(&fixture).await, vec![Bytes::from_static(b"ok")]);
}

#[tokio::test]
async fn pump_reports_each_oversized_chunk_and_keeps_draining() {
    init_tracing();
    let Fixture {
        keys,
        peer,
        channel,
        handle,
        transport,
    } = fixture(16 * 1024).await;
    transport.send(vec![1u8; 100]).await.expect("queued");
    transport.send(vec![2u8; 200]).await.expect("queued");
    transport.send("ok").await.expect("queued");

    let (pump, mut events) = TransportPump::new(transport.clone(), handle.events);
    let pump_task = pump.spawn();
    channel.open();

    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Connected
    ));
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::SendFailed(TransportError::Encryption(CryptoError::ChunkTooLarge {
            len: 100,
            ..
        }))
    ));
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::SendFailed(TransportError::Encryption(CryptoError::ChunkTooLarge {
            len: 200,
            ..
        }))
    ));
    timeout(Duration::from_secs(5), async {
        while transport.queued() > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("remaining chunk drained");
    let sent = channel.sent();
    assert_eq!(sent.len(), 1);
    let plaintext = keys.decrypt(&peer.private, &sent[0]).await.expect("decrypt");
    assert_eq!(plaintext, b"ok".to_vec());

    pump_task.abort();
}

#[tokio::test]
async fn buffer_low_signal_resumes_queued_sends_in_order() {
    init_tracing();
    let threshold = 1024;
    let Fixture {
        keys,
        peer,
        channel,
        handle,
        transport,
    } = fixture(threshold).await;

    let (pump, mut events) = TransportPump::new(transport.clone(), handle.events);
    let pump_task = pump.spawn();
    channel.open();
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Connected
    ));

    channel.set_buffered(threshold + 1);
    for n in 0..3 {
        assert_eq!(
            transport.send(format!("chunk-{n}")).await.expect("queued"),
            0
        );
    }
    assert_eq!(transport.queued(), 3);
    assert!(channel.sent().is_empty());

    channel.flush();
    timeout(Duration::from_secs(5), async {
        while transport.queued() > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("buffer-low drains the queue");

    let mut plaintexts = Vec::new();
    for ciphertext in channel.sent() {
        let plaintext = keys
            .decrypt(&peer.private, &ciphertext)
            .await
            .expect("peer can decrypt");
        plaintexts.push(Bytes::from(plaintext));
    }
    let expected: Vec<Bytes> = (0..3)
        .map(|n| Bytes::from(format!("chunk-{n}")))
        .collect();
    assert_eq!(plaintexts, expected);

    pump_task.abort();
}

#[tokio::test]
async fn transport_takes_threshold_from_config() {
    init_tracing();
    let keys = test_keys();
    let peer = keys.generate_key_pair().await.expect("peer key pair");
    let (channel, handle) = FakeChannel::new("fileTransfer");
    let config = SessionConfig::builder().buffer_threshold(4096).build();
    let transport = EncryptedChunkTransport::from_config(
        handle.channel.clone(),
        keys,
        Arc::new(peer.public.clone()),
        &config,
    )
    .await;
    assert_eq!(channel.low_threshold(), 4096);

    channel.set_open();
    channel.set_buffered(4096);
    assert_eq!(transport.send("at threshold").await.expect("send"), 1);
    channel.set_buffered(4097);
    assert_eq!(transport.send("above threshold").await.expect("queued"), 0);
    assert_eq!(transport.queued(), 1);
}

#[tokio::test]
async fn capacity_boundary_is_inclusive() {
    init_tracing();
    let fixture = fixture(16 * 1024).await;
    fixture.channel.set_open();
    assert_eq!(fixture.transport.capacity().await.expect("capacity"), 62);
    assert_eq!(
        fixture.transport.send(vec![1u8; 62]).await.expect("at limit"),
        1
    );
    assert!(matches!(
        fixture.transport.send(vec![1u8; 63]).await,
        Err(TransportError::Encryption(CryptoError::ChunkTooLarge { len: 63, .. }))
    ));
}

#[tokio::test]
async fn failed_channel_send_keeps_chunk_at_head() {
    init_tracing();
    let fixture = fixture(16 * 1024).await;
    fixture.channel.set_open();
    fixture.channel.fail_sends(true);

    assert!(matches!(
        fixture.transport.send("first").await,
        Err(TransportError::Channel(_))
    ));
    fixture.transport.send("second").await.unwrap_err();
    assert_eq!(fixture.transport.queued(), 2);
    assert_eq!(fixture.transport.send_progress(), 0);

    fixture.channel.fail_sends(false);
    assert_eq!(fixture.transport.drain().await.expect("drain"), 2);
    assert_eq!(
        decrypt_sent(&fixture).await,
        vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
    );
}

#[tokio::test]
async fn draining_an_empty_queue_is_a_no_op() {
    init_tracing();
    let fixture = fixture(16 * 1024).await;
    fixture.channel.set_open();
    assert_eq!(fixture.transport.drain().await.expect("drain"), 0);
    assert_eq!(fixture.transport.drain().await.expect("drain"), 0);
    assert!(fixture.channel.sent().is_empty());
}

#[tokio::test]
async fn send_split_chunks_to_capacity() {
    init_tracing();
    let fixture = fixture(16 * 1024).await;
    fixture.channel.set_open();
    let data: Vec<u8> = (0..150u8).collect();

    let sent = fixture
        .transport
        .send_split(data.clone())
        .await
        .expect("split send");
    assert_eq!(sent, 3);

    let chunks = decrypt_sent(&fixture).await;
    let lengths: Vec<usize> = chunks.iter().map(Bytes::len).collect();
    assert_eq!(lengths, vec![62, 62, 26]);
    assert_eq!(chunks.concat(), data);
    assert_eq!(fixture.transport.send_progress(), 150);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_senders_never_duplicate_chunks() {
    init_tracing();
    let fixture = fixture(16 * 1024).await;
    fixture.channel.set_open();

    let mut tasks = Vec::new();
    for n in 0..16 {
        let transport = fixture.transport.clone();
        tasks.push(tokio::spawn(async move {
            transport.send(format!("message-{n}")).await
        }));
    }
    for task in tasks {
        task.await.expect("sender task").expect("send");
    }

    let plaintexts = decrypt_sent(&fixture).await;
    assert_eq!(plaintexts.len(), 16);
    let unique: HashSet<Bytes> = plaintexts.into_iter().collect();
    assert_eq!(unique.len(), 16);
    assert_eq!(fixture.transport.queued(), 0);
}

#[tokio::test]
async fn pump_surfaces_lifecycle_and_decrypts_inbound() {
    init_tracing();
    let Fixture {
        keys,
        peer,
        channel,
        handle,
        transport,
    } = fixture(16 * 1024).await;

    transport.send("queued before open").await.expect("queued");
    assert_eq!(transport.queued(), 1);

    let receiver = ChunkReceiver::new(keys.clone(), LocalKey::fixed(peer.private.clone()));
    let (pump, mut events) = TransportPump::new(transport.clone(), handle.events);
    let pump_task = pump.with_receiver(receiver).spawn();

    channel.open();
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Connected
    ));
    timeout(Duration::from_secs(5), async {
        while transport.queued() > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queued chunk drained on open");
    assert_eq!(channel.sent().len(), 1);

    let inbound = keys
        .encrypt(&peer.public, b"hello back")
        .await
        .expect("encrypt inbound");
    channel.deliver(Bytes::from(inbound));
    match next_event(&mut events).await {
        TransportEvent::Received(data) => assert_eq!(&data[..], b"hello back"),
        other => panic!("unexpected event {other:?}"),
    }

    channel.deliver(Bytes::from_static(&[0u8; 128]));
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::ReceiveFailed(TransportError::Decryption(_))
    ));

    channel.fail("ice transport failed");
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::ConnectFailed(message) if message == "ice transport failed"
    ));
    channel.remote_close();
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::ConnectionLost
    ));

    drop(channel);
    drop(transport);
    pump_task.abort();
}
