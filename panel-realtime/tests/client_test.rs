//! End-to-end behaviour of the realtime client over a scripted transport.
//!
//! Run with: cargo test -p panel-realtime --test client_test

mod support;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use chrono::Utc;
use panel_realtime::{
    CommandRejection, ConnectionState, EventKind, HistoryError, HistoryStatus, RealtimeConfig,
    TopicChange, TransportError,
};
use serde_json::json;
use shared_types::{ConsoleStream, HistoricalLine, ServerAllocation};
use support::*;
use tokio::task::LocalSet;

async fn connected() -> (Harness, Peer) {
    let h = harness();
    h.client.connect().unwrap();
    settle().await;
    assert_eq!(h.client.connection_state(), ConnectionState::Connected);
    let peer = h.connector.take_peer();
    (h, peer)
}

fn lines(h: &Harness, server_id: &str) -> Vec<String> {
    h.client
        .console(server_id)
        .map(|snapshot| snapshot.entries.into_iter().map(|e| e.text).collect())
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn test_n_subscribes_send_one_subscribe_and_one_unsubscribe() {
    LocalSet::new()
        .run_until(async {
            let (h, mut peer) = connected().await;

            for _ in 0..4 {
                h.client.subscribe("srv-1");
            }
            settle().await;
            for _ in 0..4 {
                h.client.unsubscribe("srv-1").unwrap();
            }
            settle().await;

            assert_eq!(
                peer.drain(),
                vec![subscribe_frame("srv-1"), unsubscribe_frame("srv-1")]
            );
            assert_eq!(h.history.call_count(), 1);
            assert!(h.client.active_topics().is_empty());
            assert!(h.client.console("srv-1").is_none());
            assert!(h.client.metrics("srv-1").is_none());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_extra_unsubscribe_is_rejected_without_traffic() {
    LocalSet::new()
        .run_until(async {
            let (h, mut peer) = connected().await;
            assert!(h.client.unsubscribe("srv-1").is_err());

            h.client.subscribe("srv-1");
            h.client.unsubscribe("srv-1").unwrap();
            assert!(h.client.unsubscribe("srv-1").is_err());
            assert_eq!(h.client.subscriber_count("srv-1"), 0);
            assert_eq!(peer.drain().len(), 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resubscribes_exactly_live_topics() {
    LocalSet::new()
        .run_until(async {
            let (h, mut peer) = connected().await;
            let mut connectivity = h.client.connectivity();
            assert!(*connectivity.borrow_and_update());

            for topic in ["srv-a", "srv-b", "srv-c"] {
                h.client.subscribe(topic);
            }
            h.client.unsubscribe("srv-c").unwrap();
            settle().await;
            h.history.resolve_lines("srv-a", &["old"]);
            h.history.resolve_lines("srv-b", &[]);
            peer.push(console_frame("srv-a", "before"));
            settle().await;
            assert_eq!(lines(&h, "srv-a"), vec!["old", "before"]);
            peer.drain();

            drop(peer);
            settle().await;
            assert_eq!(h.client.connection_state(), ConnectionState::Reconnecting);
            assert!(!*connectivity.borrow_and_update());

            tokio::time::sleep(Duration::from_millis(150)).await;
            assert_eq!(h.client.connection_state(), ConnectionState::Connected);
            assert!(*connectivity.borrow_and_update());

            let mut peer = h.connector.take_peer();
            let mut frames = peer.drain();
            frames.sort_by_key(|f| f["serverId"].as_str().unwrap_or_default().to_string());
            assert_eq!(frames, vec![subscribe_frame("srv-a"), subscribe_frame("srv-b")]);

            peer.push(console_frame("srv-a", "after"));
            settle().await;
            assert_eq!(lines(&h, "srv-a"), vec!["old", "before", "after"]);
            // srv-c was released before its fetch ever ran
            assert_eq!(h.history.call_count(), 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_made_offline_go_out_on_connect() {
    LocalSet::new()
        .run_until(async {
            let h = harness();
            h.client.subscribe("srv-1");
            assert_eq!(h.connector.dials.get(), 0);

            h.client.connect().unwrap();
            settle().await;
            let mut peer = h.connector.take_peer();
            assert_eq!(peer.drain(), vec![subscribe_frame("srv-1")]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_booting_then_ready_scenario() {
    LocalSet::new()
        .run_until(async {
            let (h, peer) = connected().await;
            h.client.subscribe("srv-1");
            settle().await;

            peer.push(console_frame("srv-1", "ready"));
            settle().await;
            let snapshot = h.client.console("srv-1").unwrap();
            assert!(snapshot.entries.is_empty());
            assert_eq!(snapshot.history, HistoryStatus::Pending);

            assert!(h.history.resolve_lines("srv-1", &["booting"]));
            settle().await;
            assert_eq!(lines(&h, "srv-1"), vec!["booting", "ready"]);
            assert_eq!(
                h.client.console("srv-1").unwrap().history,
                HistoryStatus::Loaded
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_history_seam_independent_of_arrival_timing() {
    let history = ["h1", "h2", "h3", "h4", "h5"];
    let expected = vec!["h1", "h2", "h3", "h4", "h5", "l1", "l2"];

    for live_before_history in [0, 1, 2] {
        LocalSet::new()
            .run_until(async {
                let (h, peer) = connected().await;
                h.client.subscribe("srv-1");
                settle().await;

                for (i, text) in ["l1", "l2"].iter().enumerate() {
                    if i == live_before_history {
                        h.history.resolve_lines("srv-1", &history);
                        settle().await;
                    }
                    peer.push(console_frame("srv-1", text));
                    settle().await;
                }
                if live_before_history == 2 {
                    h.history.resolve_lines("srv-1", &history);
                    settle().await;
                }

                assert_eq!(lines(&h, "srv-1"), expected, "case {live_before_history}");
            })
            .await;
    }
}

/// Console transcript when the history resolves after `resolve_after` of the live lines.
async fn seam_transcript(history: &[HistoricalLine], live: &[&str], resolve_after: usize) -> Vec<String> {
    let (h, peer) = connected().await;
    h.client.subscribe("srv-1");
    settle().await;

    for (i, text) in live.iter().enumerate() {
        if i == resolve_after {
            h.history.resolve("srv-1", Ok(history.to_vec()));
            settle().await;
        }
        peer.push(console_frame("srv-1", text));
        settle().await;
    }
    if resolve_after >= live.len() {
        h.history.resolve("srv-1", Ok(history.to_vec()));
        settle().await;
    }
    lines(&h, "srv-1")
}

#[tokio::test(start_paused = true)]
async fn test_repeated_line_across_seam_survives_any_timing() {
    let history = history_lines(&["h1", "h2", "h3", "h4", "tick"]);
    let expected = vec!["h1", "h2", "h3", "h4", "tick", "tick", "l2"];

    for resolve_after in [0, 1, 2] {
        let transcript = LocalSet::new()
            .run_until(seam_transcript(&history, &["tick", "l2"], resolve_after))
            .await;
        assert_eq!(transcript, expected, "resolved after {resolve_after} live lines");
    }
}

#[tokio::test(start_paused = true)]
async fn test_history_written_after_subscribe_appears_once() {
    for resolve_after in [0, 1, 2, 3] {
        let transcript = LocalSet::new()
            .run_until(async {
                // stamped once the subscription is open
                let written = Utc::now() + chrono::Duration::seconds(1);
                let mut history = history_lines(&["booting", "ready", "joined"]);
                history[1].timestamp = Some(written);
                history[2].timestamp = Some(written);
                seam_transcript(&history, &["ready", "joined", "chat"], resolve_after).await
            })
            .await;
        assert_eq!(
            transcript,
            vec!["booting", "ready", "joined", "chat"],
            "resolved after {resolve_after} live lines"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_console_cap_evicts_oldest_live_lines() {
    LocalSet::new()
        .run_until(async {
            let h = harness_with(RealtimeConfig {
                console_cap: 3,
                ..test_config()
            });
            h.client.connect().unwrap();
            settle().await;
            let peer = h.connector.take_peer();

            h.client.subscribe("srv-1");
            settle().await;
            h.history.resolve_lines("srv-1", &[]);
            settle().await;

            for i in 1..=5 {
                peer.push(console_frame("srv-1", &format!("line {i}")));
            }
            settle().await;

            let snapshot = h.client.console("srv-1").unwrap();
            assert_eq!(snapshot.entries.len(), 3);
            assert_eq!(lines(&h, "srv-1"), vec!["line 3", "line 4", "line 5"]);
            assert_eq!(snapshot.evicted, 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_history_failure_then_retry() {
    LocalSet::new()
        .run_until(async {
            let (h, peer) = connected().await;
            let mut changes = h.client.changes();
            h.client.subscribe("srv-1");
            settle().await;

            peer.push(console_frame("srv-1", "live-1"));
            settle().await;
            h.history.resolve("srv-1", Err(HistoryError::Status(502)));
            settle().await;

            let snapshot = h.client.console("srv-1").unwrap();
            assert_eq!(lines(&h, "srv-1"), vec!["live-1"]);
            assert!(snapshot.history.is_unavailable());

            let mut seen = Vec::new();
            while let Ok(change) = changes.try_recv() {
                seen.push(change);
            }
            assert!(seen.iter().any(|c| matches!(
                c,
                TopicChange::HistoryUnavailable { server_id, .. } if server_id == "srv-1"
            )));

            assert!(h.client.retry_history("srv-1"));
            assert!(!h.client.retry_history("srv-1"));
            settle().await;
            peer.push(console_frame("srv-1", "live-2"));
            settle().await;
            assert_eq!(lines(&h, "srv-1"), vec!["live-1", "live-2"]);

            h.history.resolve_lines("srv-1", &["old"]);
            settle().await;
            assert_eq!(lines(&h, "srv-1"), vec!["old", "live-1", "live-2"]);
            assert_eq!(h.history.call_count(), 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_history_timeout_counts_as_failure() {
    LocalSet::new()
        .run_until(async {
            let h = harness_with(RealtimeConfig {
                history_timeout: Duration::from_secs(1),
                ..test_config()
            });
            h.client.connect().unwrap();
            settle().await;
            let peer = h.connector.take_peer();

            h.client.subscribe("srv-1");
            peer.push(console_frame("srv-1", "held"));
            tokio::time::sleep(Duration::from_secs(2)).await;

            let snapshot = h.client.console("srv-1").unwrap();
            assert!(snapshot.history.is_unavailable());
            assert_eq!(lines(&h, "srv-1"), vec!["held"]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_discards_in_flight_history() {
    LocalSet::new()
        .run_until(async {
            let (h, _peer) = connected().await;
            h.client.subscribe("srv-1");
            settle().await;
            h.client.unsubscribe("srv-1").unwrap();
            settle().await;

            assert!(!h.history.resolve_lines("srv-1", &["stale"]));
            assert!(h.client.console("srv-1").is_none());

            // rapid cycling: each fresh subscribe starts a fresh fetch
            h.client.subscribe("srv-1");
            h.client.unsubscribe("srv-1").unwrap();
            h.client.subscribe("srv-1");
            settle().await;
            assert!(h.history.resolve_lines("srv-1", &["fresh"]));
            settle().await;
            assert_eq!(lines(&h, "srv-1"), vec!["fresh"]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_clear_console_keeps_only_new_lines() {
    LocalSet::new()
        .run_until(async {
            let (h, peer) = connected().await;
            h.client.subscribe("srv-1");
            settle().await;
            h.history.resolve_lines("srv-1", &["a", "b"]);
            settle().await;

            assert!(h.client.clear_console("srv-1"));
            assert!(h.client.console("srv-1").unwrap().entries.is_empty());
            peer.push(console_frame("srv-1", "c"));
            settle().await;
            assert_eq!(lines(&h, "srv-1"), vec!["c"]);
            assert_eq!(h.history.call_count(), 1);
            assert!(!h.client.clear_console("srv-2"));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_commands_rejected_without_wire_traffic() {
    LocalSet::new()
        .run_until(async {
            let h = harness();
            h.client.subscribe("srv-1");
            assert_eq!(
                h.client.send_command("srv-1", "say hi"),
                Err(CommandRejection::Disconnected)
            );

            h.client.connect().unwrap();
            settle().await;
            let peer = h.connector.take_peer();
            drop(peer);
            settle().await;
            assert_eq!(h.client.connection_state(), ConnectionState::Reconnecting);
            assert_eq!(
                h.client.send_command("srv-1", "say hi"),
                Err(CommandRejection::Disconnected)
            );

            tokio::time::sleep(Duration::from_millis(150)).await;
            let mut peer = h.connector.take_peer();
            assert_eq!(peer.drain(), vec![subscribe_frame("srv-1")]);

            assert_eq!(
                h.client.send_command("srv-2", "say hi"),
                Err(CommandRejection::NotSubscribed {
                    server_id: "srv-2".to_string()
                })
            );
            assert_eq!(h.client.send_command("srv-1", "  "), Err(CommandRejection::Empty));
            assert!(peer.drain().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_accepted_command_is_sent_and_echoed() {
    LocalSet::new()
        .run_until(async {
            let (h, mut peer) = connected().await;
            h.client.subscribe("srv-1");
            settle().await;
            h.history.resolve_lines("srv-1", &["booting"]);
            settle().await;
            peer.drain();

            h.client.send_command("srv-1", " say hi ").unwrap();
            assert_eq!(
                peer.drain(),
                vec![json!({"type": "console_command", "serverId": "srv-1", "command": "say hi"})]
            );

            let snapshot = h.client.console("srv-1").unwrap();
            let last = snapshot.entries.last().unwrap();
            assert_eq!(last.stream, ConsoleStream::Stdin);
            assert_eq!(last.text, "say hi");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_handler_does_not_starve_the_next() {
    LocalSet::new()
        .run_until(async {
            let (h, peer) = connected().await;
            h.client.subscribe("srv-1");

            let _failing = h
                .client
                .on_topic_event("srv-1", |_| Err(anyhow::anyhow!("broken view")));
            let seen = Rc::new(RefCell::new(Vec::new()));
            let sink = seen.clone();
            let _recording = h.client.on_topic_event("srv-1", move |event| {
                if let EventKind::ConsoleLine { text, .. } = &event.kind {
                    sink.borrow_mut().push((event.seq, text.clone()));
                }
                Ok(())
            });

            for text in ["one", "two", "three"] {
                peer.push(console_frame("srv-1", text));
            }
            settle().await;

            let seen = seen.borrow();
            let texts: Vec<&str> = seen.iter().map(|(_, t)| t.as_str()).collect();
            assert_eq!(texts, vec!["one", "two", "three"]);
            assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_guard_dropped_inside_handler_stops_delivery() {
    LocalSet::new()
        .run_until(async {
            let (h, mut peer) = connected().await;
            let topic = Rc::new(RefCell::new(Some(h.client.watch("srv-1"))));
            settle().await;

            let calls = Rc::new(Cell::new(0));
            let counter = calls.clone();
            let held = topic.clone();
            let _handler = h.client.on_event(move |_| {
                counter.set(counter.get() + 1);
                held.borrow_mut().take();
                Ok(())
            });

            peer.push(console_frame("srv-1", "first"));
            peer.push(console_frame("srv-1", "second"));
            settle().await;

            assert_eq!(calls.get(), 1);
            assert_eq!(h.client.subscriber_count("srv-1"), 0);
            assert!(h.client.console("srv-1").is_none());
            assert_eq!(
                peer.drain(),
                vec![subscribe_frame("srv-1"), unsubscribe_frame("srv-1")]
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_handler_guard_drop_unregisters() {
    LocalSet::new()
        .run_until(async {
            let (h, peer) = connected().await;
            h.client.subscribe("srv-1");
            let calls = Rc::new(Cell::new(0));
            let counter = calls.clone();
            let guard = h.client.on_event(move |_| {
                counter.set(counter.get() + 1);
                Ok(())
            });

            peer.push(console_frame("srv-1", "a"));
            settle().await;
            drop(guard);
            peer.push(console_frame("srv-1", "b"));
            settle().await;
            assert_eq!(calls.get(), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_and_foreign_frames_are_dropped() {
    LocalSet::new()
        .run_until(async {
            let (h, peer) = connected().await;
            h.client.subscribe("srv-1");
            let calls = Rc::new(Cell::new(0));
            let counter = calls.clone();
            let _handler = h.client.on_event(move |_| {
                counter.set(counter.get() + 1);
                Ok(())
            });

            peer.push_raw("{not json");
            peer.push(json!({"type": "mystery", "serverId": "srv-1"}));
            peer.push(json!({"type": "pong"}));
            peer.push(console_frame("srv-9", "not ours"));
            peer.push(console_frame("srv-1", "ours"));
            settle().await;

            assert_eq!(calls.get(), 1);
            assert_eq!(h.client.connection_state(), ConnectionState::Connected);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_metrics_follow_latest_sample_and_allocation() {
    LocalSet::new()
        .run_until(async {
            let (h, peer) = connected().await;
            h.client.subscribe("srv-1");

            peer.push(json!({
                "type": "resource_stats", "serverId": "srv-1",
                "cpu": 10.0, "memory": 256, "disk": 100,
            }));
            peer.push(json!({
                "type": "resource_stats", "serverId": "srv-1",
                "stats": {"cpuPercent": 50.0, "memoryUsageMb": 512, "diskUsageMb": 1024, "networkRxBytes": 42},
            }));
            settle().await;

            let view = h.client.metrics("srv-1").unwrap();
            assert_eq!(view.sample.cpu_percent, 50.0);
            assert_eq!(view.sample.network_rx_bytes, 42);
            assert_eq!(view.memory_percent, None);

            h.allocations.set(
                "srv-1",
                ServerAllocation {
                    memory_mb: Some(1024),
                    disk_mb: Some(0),
                    cpu_limit_percent: Some(100.0),
                },
            );
            let view = h.client.metrics("srv-1").unwrap();
            assert_eq!(view.memory_percent, Some(50.0));
            assert_eq!(view.disk_percent, None);
            assert_eq!(view.cpu_of_limit_percent, Some(50.0));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_terminal() {
    LocalSet::new()
        .run_until(async {
            let (h, peer) = connected().await;
            drop(peer);
            settle().await;
            assert_eq!(h.client.connection_state(), ConnectionState::Reconnecting);

            h.client.disconnect();
            tokio::time::sleep(Duration::from_secs(10)).await;
            assert_eq!(h.connector.dials.get(), 1);
            assert_eq!(h.client.connection_state(), ConnectionState::Disconnected);
            assert!(!*h.client.connectivity().borrow());
            assert_eq!(h.client.connect(), Err(TransportError::Closed));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_no_dial_until_auth_is_ready() {
    LocalSet::new()
        .run_until(async {
            let h = harness();
            h.auth.set_ready(false);
            assert_eq!(h.client.connect(), Err(TransportError::NotAuthenticated));
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(h.connector.dials.get(), 0);

            h.auth.set_ready(true);
            h.client.connect().unwrap();
            settle().await;
            assert_eq!(h.connector.dials.get(), 1);
            assert!(h.client.is_connected());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_dials_retry_until_connected() {
    LocalSet::new()
        .run_until(async {
            let h = harness();
            h.connector.failures.set(3);
            h.client.subscribe("srv-1");
            h.client.connect().unwrap();

            // 100 + 200 + 400 ms of backoff
            tokio::time::sleep(Duration::from_millis(750)).await;
            assert_eq!(h.connector.dials.get(), 4);
            assert!(h.client.is_connected());
            let mut peer = h.connector.take_peer();
            assert_eq!(peer.drain(), vec![subscribe_frame("srv-1")]);
        })
        .await;
}
