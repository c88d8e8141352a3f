//! Background fills listener.
//!
//! The WebSocket task never touches loop state. It overwrites a watch slot
//! with the newest snapshot, so a slow loop never stalls the socket reader
//! and never sees a stale backlog. The tick reads whatever changed since its
//! previous read.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use crate::logging::{log, obj, v_str, Domain, Level};

/// The newest batch of raw venue fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillSnapshot {
    pub ts: u64,
    pub fills: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FillEvent {
    Snapshot(FillSnapshot),
    Malformed(String),
}

/// `{"fills": [...]}` or a single fill object. Anything else is malformed;
/// an empty list is no update.
pub fn parse_fill_message(text: &str, now: u64) -> Option<FillEvent> {
    let data: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Some(FillEvent::Malformed(e.to_string())),
    };
    let fills = match data {
        Value::Object(ref map) => match map.get("fills") {
            Some(Value::Array(list)) => list.clone(),
            Some(_) => return Some(FillEvent::Malformed("fills is not a list".to_string())),
            None => vec![data.clone()],
        },
        _ => return Some(FillEvent::Malformed("expected object".to_string())),
    };
    if fills.is_empty() {
        return None;
    }
    Some(FillEvent::Snapshot(FillSnapshot { ts: now, fills }))
}

/// Latest state of the fills stream as published by the listener.
#[derive(Debug, Clone, Default)]
pub struct FillFeed {
    pub latest: Option<FillSnapshot>,
    /// Snapshots published so far.
    pub snapshots: u64,
    /// Malformed messages seen so far.
    pub malformed: u64,
}

impl FillFeed {
    fn apply(&mut self, event: FillEvent) {
        match event {
            FillEvent::Snapshot(s) => {
                self.latest = Some(s);
                self.snapshots += 1;
            }
            FillEvent::Malformed(_) => self.malformed += 1,
        }
    }
}

pub fn fill_channel() -> (watch::Sender<FillFeed>, FillReader) {
    let (tx, rx) = watch::channel(FillFeed::default());
    (tx, FillReader { rx, seen_snapshots: 0, seen_malformed: 0 })
}

/// Overwrites the slot in place. Never waits on the reader.
pub fn publish(tx: &watch::Sender<FillFeed>, event: FillEvent) {
    tx.send_modify(|feed| feed.apply(event));
}

/// Connects, forwards, and reconnects after a 1 s pause forever. Returns only
/// once the reading side is gone.
pub async fn start_fills_listener(url: String, sender: watch::Sender<FillFeed>) {
    loop {
        if sender.is_closed() {
            return;
        }
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                log(Level::Info, Domain::Fill, "ws_connected", obj(&[("url", v_str(&url))]));
                let (_write, mut read) = ws.split();
                while let Some(msg) = read.next().await {
                    let msg = match msg {
                        Ok(m) => m,
                        Err(e) => {
                            log(Level::Warn, Domain::Fill, "ws_error", obj(&[("error", v_str(&e.to_string()))]));
                            break;
                        }
                    };
                    if !(msg.is_text() || msg.is_binary()) {
                        continue;
                    }
                    let text = match msg.into_text() {
                        Ok(t) => t,
                        Err(_) => continue,
                    };
                    if sender.is_closed() {
                        return;
                    }
                    if let Some(event) = parse_fill_message(&text, crate::state::now_ts()) {
                        publish(&sender, event);
                    }
                }
            }
            Err(e) => {
                log(Level::Warn, Domain::Fill, "ws_connect_failed", obj(&[("error", v_str(&e.to_string()))]));
            }
        }
        sleep(Duration::from_secs(1)).await;
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct Drained {
    pub latest: Option<FillSnapshot>,
    pub malformed: usize,
}

/// Loop-side handle: remembers how much of the feed it has already seen.
#[derive(Debug)]
pub struct FillReader {
    rx: watch::Receiver<FillFeed>,
    seen_snapshots: u64,
    seen_malformed: u64,
}

impl FillReader {
    /// Newest snapshot and malformed count since the previous call. A closed
    /// feed still yields whatever it published last.
    pub fn drain(&mut self) -> Drained {
        let feed = self.rx.borrow_and_update();
        let latest = if feed.snapshots > self.seen_snapshots { feed.latest.clone() } else { None };
        let malformed = feed.malformed.saturating_sub(self.seen_malformed) as usize;
        self.seen_snapshots = feed.snapshots;
        self.seen_malformed = feed.malformed;
        Drained { latest, malformed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_list_and_single() {
        let list = parse_fill_message(r#"{"fills":[{"id":1},{"id":2}]}"#, 5);
        match list {
            Some(FillEvent::Snapshot(s)) => {
                assert_eq!(s.fills.len(), 2);
                assert_eq!(s.ts, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        let single = parse_fill_message(r#"{"id":3,"price":"1.0"}"#, 6);
        match single {
            Some(FillEvent::Snapshot(s)) => assert_eq!(s.fills, vec![json!({"id": 3, "price": "1.0"})]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed_and_empty() {
        assert!(matches!(parse_fill_message("not json", 1), Some(FillEvent::Malformed(_))));
        assert!(matches!(parse_fill_message("[1,2]", 1), Some(FillEvent::Malformed(_))));
        assert!(matches!(parse_fill_message(r#"{"fills": 3}"#, 1), Some(FillEvent::Malformed(_))));
        assert_eq!(parse_fill_message(r#"{"fills": []}"#, 1), None);
    }

    fn snap(ts: u64) -> FillEvent {
        FillEvent::Snapshot(FillSnapshot { ts, fills: vec![json!({})] })
    }

    #[test]
    fn test_drain_keeps_newest() {
        let (tx, mut reader) = fill_channel();
        assert_eq!(reader.drain(), Drained::default());
        for ts in 1..=3 {
            publish(&tx, snap(ts));
        }
        publish(&tx, FillEvent::Malformed("x".into()));
        let d = reader.drain();
        assert_eq!(d.latest.map(|s| s.ts), Some(3));
        assert_eq!(d.malformed, 1);
        assert_eq!(reader.drain(), Drained::default());
    }

    #[test]
    fn test_publisher_never_waits_on_idle_reader() {
        let (tx, mut reader) = fill_channel();
        // far more than any bounded queue would hold
        for ts in 0..10_000 {
            publish(&tx, snap(ts));
        }
        let d = reader.drain();
        assert_eq!(d.latest.map(|s| s.ts), Some(9_999));
        assert_eq!(d.malformed, 0);
    }

    #[test]
    fn test_closed_feed_keeps_last_unread_snapshot() {
        let (tx, mut reader) = fill_channel();
        publish(&tx, snap(7));
        drop(tx);
        assert_eq!(reader.drain().latest.map(|s| s.ts), Some(7));
        assert_eq!(reader.drain(), Drained::default());
    }

    #[tokio::test]
    async fn test_listener_returns_once_reader_dropped() {
        let (tx, reader) = fill_channel();
        drop(reader);
        // nothing listens on port 9; the closed check comes first
        tokio::time::timeout(Duration::from_secs(1), start_fills_listener("ws://127.0.0.1:9".into(), tx))
            .await
            .unwrap();
    }
}
