//! Protocol behavior tests over an in-process duplex transport.
//!
//! Each test wires two `Connection`s back to back through a duplex pipe,
//! avoiding real sockets; `end_to_end.rs` covers the TCP path.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::sleep;
use tokio_test::assert_ok;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;

use wsmux::{ChannelId, CloseReason, Connection, Error, Frame};

/// Routes test logging through the capture writer; `RUST_LOG` filters.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builds a connection pair joined by an in-memory duplex pipe.
async fn pair() -> (Connection, Connection) {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    (Connection::new(client_ws), Connection::new(server_ws))
}

/// Grace period for cross-connection frame delivery.
async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn handler_invoked_exactly_once_with_payload() {
    let (client, server) = pair().await;

    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(None));

    let counter = Arc::clone(&invocations);
    let seen_clone = Arc::clone(&seen);
    server.register("greet", move |_channel, data| {
        let counter = Arc::clone(&counter);
        let seen = Arc::clone(&seen_clone);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            *seen.lock() = data;
            Ok(())
        }
    });

    client
        .open("greet", Some(json!({"name": "mux"})))
        .await
        .expect("open");
    settle().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock(), Some(json!({"name": "mux"})));
    // The server registered the remote channel.
    assert_eq!(server.channel_count(), 1);
}

#[tokio::test]
async fn all_handlers_on_a_path_are_invoked() {
    let (client, server) = pair().await;

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&first);
    server.register("shared", move |_channel, _data| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let counter = Arc::clone(&second);
    server.register("shared", move |_channel, _data| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    client.open("shared", None).await.expect("open");
    settle().await;

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn echo_request_resolves_with_close_payload() {
    let (client, server) = pair().await;

    server.register("echo", |channel, data| async move {
        channel.close(data).await;
        Ok(())
    });

    let reply = client
        .request("echo", Some(json!({"n": 1})))
        .await
        .expect("request");
    assert_eq!(reply, json!({"n": 1}));
}

#[tokio::test]
async fn data_frame_settles_request() {
    let (client, server) = pair().await;

    server.register("stream", |channel, _data| async move {
        channel.send(json!("first")).await?;
        Ok(())
    });

    let reply = tokio_test::assert_ok!(client.request("stream", None).await);
    assert_eq!(reply, json!("first"));

    // A data-frame settlement leaves the channel open on both sides.
    assert_eq!(client.channel_count(), 1);
}

#[tokio::test]
async fn reply_before_waiter_attaches_is_parked() {
    let (client, server) = pair().await;

    server.register("fast", |channel, _data| async move {
        channel.send(json!("now")).await?;
        Ok(())
    });

    // The reply lands while nobody is listening on the channel yet.
    let channel = client.open("fast", None).await.expect("open");
    settle().await;

    let reply = channel
        .final_response(Duration::from_millis(100))
        .await
        .expect("parked reply settles the wait");
    assert_eq!(reply, json!("now"));
    assert_eq!(client.channel_count(), 1);
}

#[tokio::test]
async fn request_timeout_leaves_channel_registered() {
    let (client, server) = pair().await;

    // Handler that never answers.
    server.register("void", |_channel, _data| async move { Ok(()) });

    let err = client
        .request_with_deadline("void", Some(json!(1)), Duration::from_millis(50))
        .await
        .expect_err("should time out");

    assert!(err.is_timeout());
    assert_eq!(client.channel_count(), 1, "timeout must not close the channel");
}

#[tokio::test]
async fn handler_failure_error_closes_only_that_channel() {
    let (client, server) = pair().await;

    server.register("broken", |_channel, _data| async move {
        Err(Error::protocol("handler exploded"))
    });
    server.register("echo", |channel, data| async move {
        channel.close(data).await;
        Ok(())
    });

    let err = client
        .request("broken", None)
        .await
        .expect_err("handler failure propagates");
    match err {
        Error::ChannelError { reason } => assert!(reason.contains("handler exploded")),
        other => panic!("expected channel error, got {other:?}"),
    }

    // Unrelated path still works on the same connection.
    let reply = client.request("echo", Some(json!(2))).await.expect("echo");
    assert_eq!(reply, json!(2));
    assert!(!client.is_closed());
}

#[tokio::test]
async fn close_event_fires_exactly_once() {
    let (client, server) = pair().await;

    server.register("once", |channel, _data| async move {
        // Let the opener subscribe before the close comes back.
        sleep(Duration::from_millis(50)).await;
        channel.close(Some(json!("bye"))).await;
        Ok(())
    });

    let channel = client.open("once", None).await.expect("open");
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    channel.close_events().subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    settle().await;
    assert!(channel.is_closed());

    // A second explicit close is a no-op.
    channel.close(None).await;
    settle().await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(client.channel_count(), 0);
}

#[tokio::test]
async fn messages_delivered_in_order() {
    let (client, server) = pair().await;

    server.register("counter", |channel, _data| async move {
        for n in 0..10 {
            channel.send(json!(n)).await?;
        }
        Ok(())
    });

    // Subscribing after the burst started is fine: early payloads park
    // and replay to the first listener in arrival order.
    let channel = client.open("counter", None).await.expect("open");
    let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    channel.on_message(move |value| {
        sink.lock().push(value.clone());
    });

    settle().await;

    let received = received.lock();
    assert_eq!(received.len(), 10);
    for (index, value) in received.iter().enumerate() {
        assert_eq!(*value, json!(index));
    }
}

#[tokio::test]
async fn unknown_data_frame_is_a_protocol_violation() {
    let (client, server) = pair().await;

    let closes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&closes);
    server.close_events().subscribe(move |close| {
        sink.lock().push(close.clone());
    });

    client
        .send(Frame::Data {
            id: ChannelId::generate(),
            data: Some(json!(1)),
        })
        .await
        .expect("send");
    settle().await;

    let closes = closes.lock();
    assert_eq!(closes.len(), 1, "violation closes the connection");
    assert_eq!(closes[0].code, 1002);
    assert!(closes[0].reason.contains("Unknown channel"));
    assert!(server.is_closed());
}

#[tokio::test]
async fn stray_close_frame_is_reported_not_fatal() {
    let (client, server) = pair().await;

    let reports: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    server.error_events().subscribe(move |report| {
        sink.lock().push(report.clone());
    });

    // A close for an identifier we never opened: a benign close race,
    // not a violation, but still observable.
    client
        .send(Frame::Close {
            id: ChannelId::generate(),
            data: None,
        })
        .await
        .expect("send");
    settle().await;

    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("unknown channel"));
    assert!(!server.is_closed());
    assert!(!client.is_closed());
}

#[tokio::test]
async fn connection_close_force_closes_channels_first() {
    let (client, server) = pair().await;
    server.register("keep", |_channel, _data| async move { Ok(()) });

    let first = client.open("keep", None).await.expect("open");
    let second = client.open("keep", None).await.expect("open");
    assert_eq!(client.channel_count(), 2);

    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    for channel in [&first, &second] {
        let sink = Arc::clone(&order);
        let id = channel.id();
        channel.close_events().subscribe(move |reason| {
            assert_eq!(*reason, CloseReason::Connection);
            sink.lock().push(format!("channel {id}"));
        });
    }
    let sink = Arc::clone(&order);
    client.close_events().subscribe(move |_| {
        sink.lock().push("connection".to_string());
    });

    client.close(Some("shutting down".to_string()));
    settle().await;

    let order = order.lock();
    assert_eq!(order.len(), 3);
    assert_eq!(order[2], "connection", "channel closes fire before the connection close");
    assert_eq!(client.channel_count(), 0);

    // No further sends succeed.
    assert!(first.send(json!(1)).await.is_err());
}

#[tokio::test]
async fn remote_connection_close_fails_pending_request() {
    let (client, server) = pair().await;
    server.register("void", |_channel, _data| async move { Ok(()) });

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request_with_deadline("void", None, Duration::ZERO)
                .await
        })
    };

    settle().await;
    server.close(None);

    let err = pending.await.expect("join").expect_err("close interrupts");
    assert!(matches!(err, Error::ConnectionClosed));
}

#[tokio::test]
async fn wait_for_path_rendezvous() {
    let (client, server) = pair().await;

    {
        let client = client.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            let _ = client.open("meet", Some(json!("hello"))).await;
        });
    }

    let (channel, data) = server
        .wait_for_path("meet", Duration::from_secs(5))
        .await
        .expect("rendezvous");

    assert_eq!(data, Some(json!("hello")));
    assert!(!channel.is_closed());
}

#[tokio::test]
async fn wait_for_path_times_out() {
    let (_client, server) = pair().await;

    let err = server
        .wait_for_path("nobody", Duration::from_millis(50))
        .await
        .expect_err("nothing opens");
    assert!(err.is_timeout());
}

#[tokio::test]
async fn wait_for_path_fails_on_connection_close() {
    let (client, server) = pair().await;

    let waiting = {
        let server = server.clone();
        tokio::spawn(async move { server.wait_for_path("meet", Duration::ZERO).await })
    };

    settle().await;
    client.close(None);

    let err = waiting.await.expect("join").expect_err("close interrupts");
    assert!(matches!(err, Error::ConnectionClosed));
}

#[tokio::test]
async fn raw_message_event_sees_inbound_text() {
    let (client, server) = pair().await;
    server.register("echo", |channel, data| async move {
        channel.close(data).await;
        Ok(())
    });

    let raw: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&raw);
    server.message_events().subscribe(move |text| {
        sink.lock().push(text.clone());
    });

    client.request("echo", Some(json!(1))).await.expect("echo");

    let raw = raw.lock();
    assert_eq!(raw.len(), 1);
    assert!(raw[0].contains(r#""type":"open""#));
}
