//! End-to-end tests for PostOffice pairs over in-memory duplex streams.

use super::mailbox::{MailboxId, MailboxMessage};
use super::office::{PostOffice, PostOfficeOptions};
use super::wire::{encode_message, MAX_FRAGMENT_PAYLOAD};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

fn options(name: &str, is_server: bool, dedicated: bool) -> PostOfficeOptions {
    PostOfficeOptions {
        name: name.to_string(),
        is_server,
        dedicated_reader: dedicated,
        ..Default::default()
    }
}

fn pair(dedicated: bool) -> (Arc<PostOffice>, Arc<PostOffice>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        Arc::new(PostOffice::from_stream(a, options("client", false, dedicated))),
        Arc::new(PostOffice::from_stream(b, options("server", true, dedicated))),
    )
}

/// Server PostOffice plus the raw far end of its stream.
fn raw_pair(dedicated: bool) -> (DuplexStream, PostOffice) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (a, PostOffice::from_stream(b, options("server", true, dedicated)))
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8).collect()
}

async fn round_trip(client: &PostOffice, server: &PostOffice, payload: Vec<u8>) {
    let cancel = CancellationToken::new();
    let mailbox = client.create_transient_mailbox().unwrap();
    let message = MailboxMessage {
        mailbox_id: mailbox,
        protocol_id: 5,
        message_id: client.generate_message_id(),
        reply_to_id: 77,
        payload: payload.clone(),
    };

    let send = client.send_message(&message, &cancel);
    let receive = async {
        let opened = server.wait_for_messages_on_new_mailbox(&cancel).await.unwrap();
        assert_eq!(opened, mailbox);
        server.receive_message(opened, &cancel).await.unwrap()
    };
    let (sent, received) = tokio::join!(send, receive);
    sent.unwrap();

    assert_eq!(received.payload.len(), payload.len());
    assert!(received.payload == payload, "payload bytes differ");
    assert_eq!(received.protocol_id, 5);
    assert_eq!(received.message_id, message.message_id);
    assert_eq!(received.reply_to_id, 77);
    assert_eq!(received.mailbox_id, mailbox);
}

// TEST070: Payloads from empty to several megabytes round-trip in both reader modes
#[tokio::test]
async fn test_round_trip_sizes() {
    let sizes = [
        0,
        1,
        1000,
        MAX_FRAGMENT_PAYLOAD - 1,
        MAX_FRAGMENT_PAYLOAD,
        MAX_FRAGMENT_PAYLOAD + 1,
        MAX_FRAGMENT_PAYLOAD * 3 + 7,
        4 * 1024 * 1024,
    ];
    for dedicated in [false, true] {
        let (client, server) = pair(dedicated);
        for size in sizes {
            round_trip(&client, &server, pattern(size)).await;
        }
    }
}

// TEST071: 200 KB request arrives intact via new-mailbox notification
#[tokio::test]
async fn test_scenario_200kb() {
    let (client, server) = pair(false);
    round_trip(&client, &server, pattern(200 * 1024)).await;
    assert!(server.stats().frames_received >= 4);
}

// TEST072: Noise and corrupted frames never lose valid frames nor leak bad ones
#[tokio::test]
async fn test_corruption_resilience() {
    for dedicated in [false, true] {
        let (mut raw, server) = raw_pair(dedicated);
        let cancel = CancellationToken::new();
        let box_a = MailboxId(10);
        let box_b = MailboxId::permanent(3);

        let good = |mailbox, id: u32, payload: Vec<u8>| {
            encode_message(&MailboxMessage { mailbox_id: mailbox, protocol_id: 1, message_id: id, reply_to_id: 0, payload })
        };
        let mut corrupted = good(box_a, 99, b"must never arrive".to_vec());
        let mid = corrupted.len() - 3;
        corrupted[mid] ^= 0x40;

        let mut stream = b"\x00\xFFDPoP junk DPoPDPo".to_vec();
        stream.extend(good(box_a, 1, b"one".to_vec()));
        stream.extend(corrupted);
        stream.extend(b"DPoP".repeat(3));
        stream.extend(good(box_b, 2, pattern(MAX_FRAGMENT_PAYLOAD + 500)));
        stream.extend(b"trailing noise DP".to_vec());
        stream.extend(good(box_a, 3, b"three".to_vec()));

        let writer = async {
            for piece in stream.chunks(997) {
                raw.write_all(piece).await.unwrap();
            }
            raw.flush().await.unwrap();
        };
        let reader = async {
            let first = server.receive_message(box_a, &cancel).await.unwrap();
            let big = server.receive_message(box_b, &cancel).await.unwrap();
            let third = server.receive_message(box_a, &cancel).await.unwrap();
            (first, big, third)
        };
        let (_, (first, big, third)) = tokio::join!(writer, reader);

        assert_eq!(first.payload, b"one");
        assert_eq!(big.payload, pattern(MAX_FRAGMENT_PAYLOAD + 500));
        assert_eq!(third.payload, b"three");
        assert_eq!(third.message_id, 3);

        let leftover = server.try_receive_message(box_a, &cancel, Duration::from_millis(20)).await.unwrap();
        assert!(leftover.is_none());
        assert!(server.stats().checksum_failures >= 1);
    }
}

// TEST073: A receiver on mailbox B never sees mailbox A's traffic
#[tokio::test]
async fn test_mailbox_isolation() {
    let (client, server) = pair(true);
    let cancel = CancellationToken::new();
    let a = client.create_transient_mailbox().unwrap();
    let b = client.create_transient_mailbox().unwrap();

    client
        .send_message(&MailboxMessage::new(a, 1, b"for a".to_vec()).with_message_id(client.generate_message_id()), &cancel)
        .await
        .unwrap();
    client
        .send_message(&MailboxMessage::new(b, 1, b"for b".to_vec()).with_message_id(client.generate_message_id()), &cancel)
        .await
        .unwrap();

    let on_b = server.receive_message(b, &cancel).await.unwrap();
    assert_eq!(on_b.payload, b"for b");
    let more_b = server.try_receive_message(b, &cancel, Duration::from_millis(20)).await.unwrap();
    assert!(more_b.is_none());
    let on_a = server.receive_message(a, &cancel).await.unwrap();
    assert_eq!(on_a.payload, b"for a");
}

// TEST074: Request on a transient mailbox and correlated reply on the same mailbox
#[tokio::test]
async fn test_request_reply() {
    let (client, server) = pair(false);
    let cancel = CancellationToken::new();

    let responder = {
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mailbox = server.wait_for_messages_on_new_mailbox(&cancel).await.unwrap();
            let request = server.receive_message(mailbox, &cancel).await.unwrap();
            let mut payload = request.payload.clone();
            payload.reverse();
            let reply = MailboxMessage::new(mailbox, request.protocol_id, payload)
                .with_message_id(server.generate_message_id())
                .replying_to(request.message_id);
            server.send_message(&reply, &cancel).await.unwrap();
        })
    };

    let mailbox = client.create_transient_mailbox().unwrap();
    let request_id = client.generate_message_id();
    let request = MailboxMessage::new(mailbox, 2, b"ping".to_vec()).with_message_id(request_id);
    client.send_message(&request, &cancel).await.unwrap();

    let reply = client.receive_message(mailbox, &cancel).await.unwrap();
    assert_eq!(reply.payload, b"gnip");
    assert_eq!(reply.reply_to_id, request_id);
    responder.await.unwrap();
}

// TEST075: Many concurrent carpool receivers on distinct mailboxes all complete
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_carpool_many_receivers() {
    let (client, server) = pair(false);
    let cancel = CancellationToken::new();

    let ids: Vec<MailboxId> = (0..20).map(|_| client.create_transient_mailbox().unwrap()).collect();
    let mut receivers = Vec::new();
    for (i, id) in ids.iter().copied().enumerate() {
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        receivers.push(tokio::spawn(async move {
            let msg = server.receive_message(id, &cancel).await.unwrap();
            assert_eq!(msg.payload, format!("message {i}").into_bytes());
        }));
    }

    for (i, id) in ids.iter().copied().enumerate().rev() {
        let msg = MailboxMessage::new(id, 1, format!("message {i}").into_bytes())
            .with_message_id(client.generate_message_id());
        client.send_message(&msg, &cancel).await.unwrap();
    }

    for receiver in receivers {
        tokio::time::timeout(Duration::from_secs(5), receiver).await.unwrap().unwrap();
    }
}

// TEST076: FIFO order within one mailbox
#[tokio::test]
async fn test_fifo_within_mailbox() {
    let (client, server) = pair(true);
    let cancel = CancellationToken::new();
    let id = client.create_permanent_mailbox(4);
    for i in 0..10u8 {
        let size = if i % 3 == 0 { MAX_FRAGMENT_PAYLOAD + 10 } else { 10 };
        let msg = MailboxMessage::new(id, 1, vec![i; size]).with_message_id(client.generate_message_id());
        client.send_message(&msg, &cancel).await.unwrap();
    }
    for i in 0..10u8 {
        let msg = server.receive_message(id, &cancel).await.unwrap();
        assert_eq!(msg.payload[0], i);
    }
    assert_eq!(client.stats().frames_sent, 14);
}

// TEST077: Peer shutdown wakes a dedicated-mode receiver with an error
#[tokio::test]
async fn test_peer_shutdown_wakes_receiver() {
    let (client, server) = pair(true);
    let cancel = CancellationToken::new();
    let id = client.create_transient_mailbox().unwrap();
    let waiter = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.receive_message(id, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(server);
    let result = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
    assert!(result.is_err());
}
