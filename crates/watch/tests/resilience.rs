#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use keel_core::{Gvk, ObjectKey};
use keel_watch::{DynamicWatch, EventStream, EventType, KindResolver, ListFilter, RawEvent, ResourceRef, WatchSource};
use tokio::time::Instant;

enum Step {
    Event(&'static str),
    Fail,
}

/// Each `open` replays the next scripted session; once the script runs out
/// sessions stay open without events.
struct ScriptedSource {
    sessions: Mutex<VecDeque<Vec<Step>>>,
    opens: AtomicUsize,
    opened_at: Mutex<Vec<Instant>>,
}

impl ScriptedSource {
    fn new(sessions: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self { sessions: Mutex::new(sessions.into()), opens: AtomicUsize::new(0), opened_at: Mutex::new(Vec::new()) })
    }
}

fn cm(name: &str) -> RawEvent {
    RawEvent {
        kind: EventType::Added,
        object: serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}}),
    }
}

#[async_trait::async_trait]
impl WatchSource for ScriptedSource {
    async fn open(&self, _resource: &ResourceRef, _filter: &ListFilter) -> Result<EventStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.opened_at.lock().expect("lock").push(Instant::now());
        let next = self.sessions.lock().expect("lock").pop_front();
        let Some(steps) = next else { return Ok(futures::stream::pending().boxed()) };
        Ok(async_stream::stream! {
            for step in steps {
                match step {
                    Step::Event(name) => yield Ok(cm(name)),
                    Step::Fail => yield Err(anyhow!("connection reset")),
                }
            }
        }
        .boxed())
    }
}

struct Known;

#[async_trait::async_trait]
impl KindResolver for Known {
    async fn resolve(&self, kind: &Gvk) -> Result<ResourceRef> {
        if kind.kind == "ConfigMap" {
            Ok(ResourceRef { gvk: kind.clone(), plural: "configmaps".into(), namespaced: true })
        } else {
            Err(anyhow!("no mapping for {}", kind))
        }
    }
}

fn configmaps() -> Gvk { Gvk::new("", "v1", "ConfigMap") }

async fn wait_for(seen: &Arc<Mutex<Vec<String>>>, n: usize) {
    for _ in 0..200 {
        if seen.lock().expect("lock").len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn watch_reopens_after_close_and_error() {
    let source = ScriptedSource::new(vec![
        vec![Step::Event("a"), Step::Event("b")],
        vec![Step::Event("c"), Step::Fail, Step::Event("never")],
        vec![Step::Event("d")],
    ]);
    let (watch, _rx) = DynamicWatch::new(source.clone(), Arc::new(Known), Duration::from_millis(5));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let resource = Known.resolve(&configmaps()).await.expect("resolve");
    let handle = watch.register_raw(resource, ListFilter::default(), move |ev| {
        let sink = sink.clone();
        async move {
            let name = ev.object["metadata"]["name"].as_str().unwrap_or_default().to_string();
            sink.lock().expect("lock").push(name);
        }
    });

    wait_for(&seen, 4).await;
    assert_eq!(*seen.lock().expect("lock"), ["a", "b", "c", "d"]);
    assert!(source.opens.load(Ordering::SeqCst) >= 3);

    watch.shutdown_token().cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.expect("stops on shutdown").expect("join");
}

/// Let spawned tasks run without moving the paused clock.
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn reopen_waits_for_the_fixed_delay() {
    let delay = Duration::from_secs(30);
    let source = ScriptedSource::new(vec![vec![Step::Event("a")], vec![Step::Event("b")]]);
    let (watch, _rx) = DynamicWatch::new(source.clone(), Arc::new(Known), delay);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let resource = Known.resolve(&configmaps()).await.expect("resolve");
    let handle = watch.register_raw(resource, ListFilter::default(), move |ev| {
        let sink = sink.clone();
        async move {
            let name = ev.object["metadata"]["name"].as_str().unwrap_or_default().to_string();
            sink.lock().expect("lock").push(name);
        }
    });

    settle().await;
    assert_eq!(*seen.lock().expect("lock"), ["a"]);
    assert_eq!(source.opens.load(Ordering::SeqCst), 1);

    tokio::time::advance(delay - Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(source.opens.load(Ordering::SeqCst), 1, "reopened before the delay");

    tokio::time::advance(Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(source.opens.load(Ordering::SeqCst), 2);
    assert_eq!(*seen.lock().expect("lock"), ["a", "b"]);
    let opened = source.opened_at.lock().expect("lock").clone();
    assert!(opened[1] - opened[0] >= delay);

    watch.shutdown_token().cancel();
    handle.await.expect("join");
}

#[tokio::test]
async fn register_correlates_events_with_target() {
    let source = ScriptedSource::new(vec![vec![Step::Event("x"), Step::Event("y")]]);
    let (watch, mut rx) = DynamicWatch::new(source, Arc::new(Known), Duration::from_millis(5));
    let target = ObjectKey::namespaced("addons", "dash");
    watch.register(&configmaps(), ListFilter::in_namespace("ns"), target.clone()).await.expect("register");

    for expected in ["x", "y"] {
        let ev = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.expect("in time").expect("event");
        assert_eq!(ev.target, target);
        assert_eq!(ev.event.object["metadata"]["name"], expected);
    }
    watch.shutdown_token().cancel();
}

#[tokio::test]
async fn register_owned_targets_the_event_object() {
    let source = ScriptedSource::new(vec![vec![Step::Event("self")]]);
    let (watch, mut rx) = DynamicWatch::new(source, Arc::new(Known), Duration::from_millis(5));
    watch.register_owned(&configmaps(), ListFilter::default()).await.expect("register");
    let ev = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.expect("in time").expect("event");
    assert_eq!(ev.target, ObjectKey::namespaced("ns", "self"));
    watch.shutdown_token().cancel();
}

#[tokio::test]
async fn unknown_kind_is_reported_to_the_caller() {
    let (watch, _rx) = DynamicWatch::new(ScriptedSource::new(vec![]), Arc::new(Known), Duration::from_millis(5));
    let err = watch
        .register(&Gvk::new("example.com", "v1", "Widget"), ListFilter::default(), ObjectKey::cluster("t"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Widget"));
}
