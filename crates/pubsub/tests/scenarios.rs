// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! End-to-end scenarios for [`PubSubClient`] over the in-memory transport.

use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use resub_pubsub::{
    PubSubClient, PubSubConfig, PubSubError, PubSubEvent,
    binary::Payload,
    router::channel_event_listener,
    state::ConnectionState,
    testing::{MockTransport, wait_until_async},
};
use rstest::{fixture, rstest};
use tokio::sync::mpsc::UnboundedReceiver;
use ustr::Ustr;

#[fixture]
fn config() -> PubSubConfig {
    PubSubConfig {
        debounce_ms: 20,
        reconnect_delay_initial_ms: 10,
        reconnect_delay_max_ms: 1_000,
        reconnect_jitter_ms: 0,
        reconnect_immediate_first: false,
        health_check_interval_ms: None,
        shutdown_timeout_ms: 2_000,
        ..Default::default()
    }
}

fn client(transport: &MockTransport, config: PubSubConfig) -> PubSubClient {
    PubSubClient::new(Arc::new(transport.clone()), config).unwrap()
}

async fn next_matching<F>(rx: &mut UnboundedReceiver<PubSubEvent>, mut predicate: F) -> PubSubEvent
where
    F: FnMut(&PubSubEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("Router stopped");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

#[rstest]
#[tokio::test]
async fn test_duplicate_subscribe_is_ref_counted_without_reconnect(config: PubSubConfig) {
    let transport = MockTransport::new();
    let client = client(&transport, config);

    assert_eq!(client.subscribe(["a"]).await.unwrap(), 1);
    assert_eq!(client.subscribe(["a"]).await.unwrap(), 1);
    assert_eq!(transport.connections_built(), 1);

    assert_eq!(client.unsubscribe(["a"]).await.unwrap(), 1);
    assert_eq!(transport.connections_built(), 1);
    assert_eq!(transport.construct_attempts(), 1);
    assert!(client.applied_snapshot().exact_channels().contains(&Ustr::from("a")));

    // The last reference removes the channel and with it the only connection
    assert_eq!(client.unsubscribe(["a"]).await.unwrap(), 0);
    assert_eq!(transport.open_connections(), 0);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    client.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_subscribe_and_unsubscribe_in_one_window_never_reconciles(config: PubSubConfig) {
    let transport = MockTransport::new();
    let client = client(&transport, config);

    let (subscribed, unsubscribed) =
        tokio::join!(client.subscribe(["a"]), client.unsubscribe(["a"]));

    assert_eq!(subscribed.unwrap(), 1);
    assert_eq!(unsubscribed.unwrap(), 0);
    assert_eq!(transport.construct_attempts(), 0);
    assert_eq!(client.subscription_count(), 0);

    client.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_applied_snapshot_tracks_channels_and_patterns(config: PubSubConfig) {
    let transport = MockTransport::new();
    let client = client(&transport, config);

    client.subscribe(["x"]).await.unwrap();
    let snapshot = client.applied_snapshot();
    assert_eq!(
        snapshot.exact_channels().iter().copied().collect::<Vec<_>>(),
        vec![Ustr::from("x")]
    );
    assert!(snapshot.patterns().is_empty());

    assert_eq!(client.psubscribe(["news.*"]).await.unwrap(), 2);
    let snapshot = client.applied_snapshot();
    assert_eq!(
        snapshot.exact_channels().iter().copied().collect::<Vec<_>>(),
        vec![Ustr::from("x")]
    );
    assert_eq!(
        snapshot.patterns().iter().copied().collect::<Vec<_>>(),
        vec![Ustr::from("news.*")]
    );

    // The second connection was built for the complete set and the first one retired
    let built = transport.snapshots();
    assert_eq!(built.len(), 2);
    assert!(built[1].same_keys(&snapshot));
    let probe = transport.clone();
    wait_until_async(
        || {
            let probe = probe.clone();
            async move { probe.close_counts() == vec![1, 0] }
        },
        Duration::from_secs(1),
    )
    .await;

    client.shutdown().await.unwrap();
    assert_eq!(transport.close_counts(), vec![1, 1]);
}

#[rstest]
#[tokio::test]
async fn test_construction_failures_retry_with_growing_delay(config: PubSubConfig) {
    let transport = MockTransport::new();
    let client = client(&transport, config);
    let (listener, mut rx) = channel_event_listener();
    client.add_listener(listener);

    transport.fail_next_constructs(3);
    assert_eq!(client.subscribe(["a"]).await.unwrap(), 1);
    assert_eq!(transport.construct_attempts(), 4);

    let mut events = Vec::new();
    loop {
        let event = next_matching(&mut rx, |_| true).await;
        let acked = matches!(event, PubSubEvent::Subscribe { .. });
        events.push(event);
        if acked {
            break;
        }
    }
    let errors = events
        .iter()
        .filter(|e| matches!(e, PubSubEvent::Error(PubSubError::ConnectionConstruction { .. })))
        .count();
    let delays: Vec<Duration> = events
        .iter()
        .filter_map(|e| match e {
            PubSubEvent::Reconnecting { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();

    // One error per failed attempt, each followed by a longer wait than the last
    assert_eq!(errors, 3);
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40),
        ]
    );
    assert!(events.iter().any(|e| matches!(e, PubSubEvent::Ready { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        PubSubEvent::Subscribe { channel, count: 1 } if channel.as_str() == "a"
    )));

    client.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_binary_and_text_payloads_round_trip(config: PubSubConfig) {
    let transport = MockTransport::new();
    let client = client(&transport, config);
    let (bin_listener, mut bin_rx) = channel_event_listener();
    let (txt_listener, mut txt_rx) = channel_event_listener();
    client.add_channel_listener("bin", bin_listener);
    client.add_channel_listener("txt", txt_listener);

    client.subscribe(["bin", "txt"]).await.unwrap();

    let raw: Vec<u8> = vec![0xff, 0xfe, 0x00, 0x80, 0xc3, 0x28, 0x01, b'R', b'S', b'B'];
    assert_eq!(client.publish_binary("bin", &raw).await.unwrap(), 1);
    assert_eq!(client.publish("txt", "plain text é").await.unwrap(), 1);

    let binary = next_matching(&mut bin_rx, |e| matches!(e, PubSubEvent::Message { .. })).await;
    let text = next_matching(&mut txt_rx, |e| matches!(e, PubSubEvent::Message { .. })).await;

    match binary {
        PubSubEvent::Message { channel, payload } => {
            assert_eq!(channel.as_str(), "bin");
            assert!(payload.is_binary());
            assert_eq!(payload.as_bytes(), raw.as_slice());
        }
        other => panic!("Unexpected event {other:?}"),
    }
    assert_eq!(
        text,
        PubSubEvent::Message {
            channel: Ustr::from("txt"),
            payload: Payload::Text("plain text é".to_string()),
        }
    );

    client.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_pattern_messages_carry_pattern_and_channel(config: PubSubConfig) {
    let transport = MockTransport::new();
    let client = client(&transport, config);
    let (listener, mut rx) = channel_event_listener();
    client.add_pattern_listener("news.*", listener);

    client.psubscribe(["news.*"]).await.unwrap();
    transport.publish("news.sport", "goal");
    transport.publish("weather", "rain");

    let event = next_matching(&mut rx, |e| matches!(e, PubSubEvent::PMessage { .. })).await;
    assert_eq!(
        event,
        PubSubEvent::PMessage {
            pattern: Ustr::from("news.*"),
            channel: Ustr::from("news.sport"),
            payload: Payload::Text("goal".to_string()),
        }
    );

    client.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_unsubscribe_all_resets_count(config: PubSubConfig) {
    let transport = MockTransport::new();
    let client = client(&transport, config);

    assert_eq!(client.subscribe(["a", "b"]).await.unwrap(), 2);
    assert_eq!(client.unsubscribe_all().await.unwrap(), 0);
    assert!(client.applied_snapshot().is_empty());
    assert_eq!(transport.open_connections(), 0);

    assert_eq!(client.subscribe(["c"]).await.unwrap(), 1);
    assert_eq!(
        client
            .applied_snapshot()
            .exact_channels()
            .iter()
            .copied()
            .collect::<Vec<_>>(),
        vec![Ustr::from("c")]
    );

    client.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_messages_resume_after_lost_connection(config: PubSubConfig) {
    let transport = MockTransport::new();
    let client = client(&transport, config);
    let (listener, mut rx) = channel_event_listener();
    client.add_listener(listener);

    client.subscribe(["a"]).await.unwrap();
    transport.lose_latest_connection("Connection reset by peer");

    next_matching(&mut rx, |e| {
        matches!(e, PubSubEvent::Error(PubSubError::ConnectionLost { .. }))
    })
    .await;
    next_matching(&mut rx, |e| matches!(e, PubSubEvent::Ready { .. })).await;

    assert_eq!(transport.connections_built(), 2);
    assert!(transport.publish("a", "after") >= 1);

    let event = next_matching(&mut rx, |e| matches!(e, PubSubEvent::Message { .. })).await;
    assert_eq!(
        event,
        PubSubEvent::Message {
            channel: Ustr::from("a"),
            payload: Payload::Text("after".to_string()),
        }
    );

    client.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_shutdown_mid_reconcile_closes_everything_once(config: PubSubConfig) {
    let transport = MockTransport::new();
    let client = Arc::new(client(&transport, config));
    let (listener, mut rx) = channel_event_listener();
    client.add_listener(listener);

    client.subscribe(["a"]).await.unwrap();
    client.publish_binary("a", &[0x00, 0xff]).await.unwrap();

    transport.set_construct_delay(Duration::from_millis(100));
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.subscribe(["b"]).await })
    };

    let probe = transport.clone();
    wait_until_async(
        || {
            let probe = probe.clone();
            async move { probe.construct_attempts() == 2 }
        },
        Duration::from_secs(1),
    )
    .await;

    client.shutdown().await.unwrap();

    assert_eq!(pending.await.unwrap().unwrap(), 2);
    assert_eq!(transport.close_counts(), vec![1, 1]);
    assert_eq!(transport.publishers_opened(), 1);
    assert_eq!(transport.publisher_close_count(), 1);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    let last = next_matching(&mut rx, |e| matches!(e, PubSubEvent::End)).await;
    assert_eq!(last, PubSubEvent::End);
    assert_eq!(client.subscribe(["c"]).await, Err(PubSubError::Closed));
}

#[rstest]
#[tokio::test]
async fn test_shutdown_timeout_force_closes(config: PubSubConfig) {
    let transport = MockTransport::new();
    let config = PubSubConfig {
        shutdown_timeout_ms: 100,
        ..config
    };
    let client = Arc::new(client(&transport, config));

    client.subscribe(["a"]).await.unwrap();
    client.publish("a", "x").await.unwrap();

    transport.set_construct_delay(Duration::from_secs(5));
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.subscribe(["b"]).await })
    };

    let probe = transport.clone();
    wait_until_async(
        || {
            let probe = probe.clone();
            async move { probe.construct_attempts() == 2 }
        },
        Duration::from_secs(1),
    )
    .await;

    let started = tokio::time::Instant::now();
    let result = client.shutdown().await;

    assert_eq!(result, Err(PubSubError::ShutdownTimeout { timeout_ms: 100 }));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(pending.await.unwrap().is_err());

    // The first connection and the publisher are still closed exactly once
    assert_eq!(transport.close_counts(), vec![1]);
    assert_eq!(transport.publisher_close_count(), 1);

    // Repeated shutdown reports the same outcome
    assert_eq!(
        client.shutdown().await,
        Err(PubSubError::ShutdownTimeout { timeout_ms: 100 })
    );
}
