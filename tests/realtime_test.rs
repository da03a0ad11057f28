//! Realtime fan-out integration tests
//!
//! Exercises the feed registry and per-thread broadcast through the
//! public API: ordering towards multiple subscribers, join catch-up
//! and slow-subscriber closure.

mod common;

use std::time::Duration;

use kagami::backend::feeds::Feeds;
use kagami::shared::ProtocolError;

use common::handle;

#[tokio::test]
async fn test_frames_reach_all_subscribers_in_order() {
    let feeds = Feeds::spawn(Duration::from_secs(3600));
    let (a, mut channels_a) = handle("127.0.0.1");
    let (b, mut channels_b) = handle("127.0.0.2");

    let feed = feeds.sync_client(&a, 1, "a");
    channels_a.send_rx.recv().await.unwrap();
    feeds.sync_client(&b, 1, "a");
    channels_a.send_rx.recv().await.unwrap();
    channels_b.send_rx.recv().await.unwrap();
    let _ = feed.flush();

    for i in 0..20 {
        feed.write(format!("03[2,{}]", i));
    }
    feed.flush_and_send();

    let frame_a = channels_a.send_rx.recv().await.unwrap();
    let frame_b = channels_b.send_rx.recv().await.unwrap();
    assert_eq!(frame_a, frame_b);

    // Append order survives the concat wrapping
    let mut last = None;
    for i in 0..20 {
        let at = frame_a.find(&format!("03[2,{}]", i)).unwrap();
        if let Some(last) = last {
            assert!(at > last);
        }
        last = Some(at);
    }
}

#[tokio::test]
async fn test_subscriber_present_at_a_receives_a_before_b() {
    let feeds = Feeds::spawn(Duration::from_secs(3600));
    let (client, mut channels) = handle("127.0.0.1");
    let feed = feeds.sync_client(&client, 1, "a");
    channels.send_rx.recv().await.unwrap();
    let _ = feed.flush();

    feed.write("A".to_string());
    feed.flush_and_send();
    feed.write("B".to_string());
    feed.flush_and_send();

    assert_eq!(channels.send_rx.recv().await.unwrap(), r#"33["A"]"#);
    assert_eq!(channels.send_rx.recv().await.unwrap(), r#"33["B"]"#);
}

#[tokio::test]
async fn test_slow_subscriber_closed_with_overflow() {
    let feeds = Feeds::spawn(Duration::from_secs(3600));
    let (client, mut channels) = handle("127.0.0.1");
    let feed = feeds.sync_client(&client, 1, "a");
    channels.send_rx.recv().await.unwrap();
    let _ = feed.flush();

    // Nobody drains the queue
    for i in 0..700 {
        feed.write(format!("03[2,{}]", i));
        feed.flush_and_send();
    }

    let signal = channels.close_rx.recv().await.unwrap();
    match signal {
        Some(err) => assert!(matches!(
            err.as_protocol(),
            Some(ProtocolError::BufferOverflow)
        )),
        None => panic!("expected overflow close"),
    }
}

#[tokio::test]
async fn test_late_joiner_caught_up_from_body_mirror() {
    let feeds = Feeds::spawn(Duration::from_secs(3600));
    let (early, mut early_channels) = handle("127.0.0.1");
    let feed = feeds.sync_client(&early, 1, "a");
    early_channels.send_rx.recv().await.unwrap();

    // An open post progresses while only the early client watches
    feed.set_open_body(2, "ab", "03[2,97]".to_string());
    feed.set_open_body(2, "abc", "03[2,98]".to_string());
    feed.flush_and_send();
    while let Ok(frame) = early_channels.send_rx.try_recv() {
        drop(frame);
    }

    let (late, mut late_channels) = handle("127.0.0.2");
    feeds.sync_client(&late, 1, "a");
    let catch_up = late_channels.send_rx.recv().await.unwrap();
    assert!(catch_up.contains(r#"\"text\":\"abc\""#));
    assert!(catch_up.contains(r#"\"total\":2"#));
}
