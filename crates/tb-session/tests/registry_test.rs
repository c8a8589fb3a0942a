use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tb_core::shutdown::ShutdownSignal;
use tb_session::pty::SpawnSpec;
use tb_session::registry::{RegistryConfig, RegistryError, SessionRegistry};
use tb_session::session::{Session, SessionEvent};
use tb_session::spawn::{CommandResolver, StaticCommand};

/// Resolver running a fixed shell script, counting how often it is asked.
struct ScriptResolver {
    script: String,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptResolver {
    fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandResolver for ScriptResolver {
    async fn resolve(&self, _logical_key: &str) -> Result<SpawnSpec, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(SpawnSpec::new("/bin/sh", std::env::temp_dir())
            .arg("-c")
            .arg(&self.script)
            .env("TERM", "dumb"))
    }
}

fn registry_with(idle_timeout: Duration) -> SessionRegistry {
    SessionRegistry::new(RegistryConfig {
        idle_timeout,
        close_grace: Duration::from_millis(100),
        ..RegistryConfig::default()
    })
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let ok = tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok();
    assert!(ok, "timed out waiting for {what}");
}

#[tokio::test]
async fn create_or_get_reuses_live_session() {
    let registry = registry_with(Duration::from_secs(60));
    let resolver = ScriptResolver::new("sleep 30");

    let first = registry.create_or_get("work-1", &resolver).await.unwrap();
    let again = registry.create_or_get("work-1", &resolver).await.unwrap();
    let other = registry.create_or_get("work-2", &resolver).await.unwrap();

    assert_eq!(first.id(), again.id());
    assert_ne!(first.id(), other.id());
    assert_eq!(resolver.calls(), 2);
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.get_by_key("work-1").unwrap().id(), first.id());
    assert_eq!(registry.get(other.id()).unwrap().logical_key(), "work-2");

    assert_eq!(registry.shutdown().await, 2);
    assert!(registry.is_empty());
    assert!(first.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_create_spawns_once() {
    let registry = Arc::new(registry_with(Duration::from_secs(60)));
    let resolver = Arc::new(ScriptResolver {
        delay: Duration::from_millis(150),
        ..ScriptResolver::new("sleep 30")
    });

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        let resolver = Arc::clone(&resolver);
        tasks.push(tokio::spawn(async move {
            registry
                .create_or_get("shared", resolver.as_ref())
                .await
                .map(|s| s.id())
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "all callers must see one session");
    assert_eq!(resolver.calls(), 1);
    assert_eq!(registry.len(), 1);
    registry.shutdown().await;
}

#[tokio::test]
async fn invalid_key_is_rejected_before_spawning() {
    let registry = registry_with(Duration::from_secs(60));
    let resolver = ScriptResolver::new("sleep 30");
    let err = registry
        .create_or_get("../escape", &resolver)
        .await
        .expect_err("should reject");
    assert!(matches!(err, RegistryError::InvalidKey { .. }));
    assert_eq!(resolver.calls(), 0);
}

#[tokio::test]
async fn spawn_failure_is_reported() {
    let registry = registry_with(Duration::from_secs(60));
    let root = tempfile::tempdir().unwrap();
    let resolver = StaticCommand::new("/nonexistent/agent-binary", root.path());
    let err = registry
        .create_or_get("broken", &resolver)
        .await
        .expect_err("spawn should fail");
    assert!(matches!(err, RegistryError::Spawn(_)), "got {err:?}");
    assert!(registry.is_empty());
}

#[tokio::test]
async fn reconnect_replays_most_recent_output() {
    let registry = SessionRegistry::new(RegistryConfig {
        replay_capacity: 64 * 1024,
        ..RegistryConfig::default()
    });
    // 1000 lines of 99 digits, each ending in CR LF on the terminal.
    let resolver = ScriptResolver::new(
        "i=0; while [ $i -lt 1000 ]; do printf '%099d\\n' $i; i=$((i+1)); done; printf END; sleep 30",
    );
    let session = registry.create_or_get("replay", &resolver).await.unwrap();
    wait_until("all output buffered", || session.replay().ends_with(b"END")).await;

    let mut transcript = Vec::new();
    for i in 0..1000 {
        transcript.extend_from_slice(format!("{i:099}\r\n").as_bytes());
    }
    transcript.extend_from_slice(b"END");
    assert!(transcript.len() > 100_000);

    let replay = registry.replay(session.id()).unwrap();
    assert_eq!(replay.len(), 64 * 1024);
    assert_eq!(replay, transcript[transcript.len() - 64 * 1024..]);

    // A connection binding now starts from exactly that history.
    let binding = session.bind(16);
    assert_eq!(binding.replay, replay);
    session.unbind(binding.id());
    registry.close(session.id()).await;
}

#[tokio::test]
async fn disconnect_keeps_session_for_resumption() {
    let registry = registry_with(Duration::from_secs(60));
    let resolver = ScriptResolver::new("while read line; do echo \"echo:$line\"; done");
    let session = registry.create_or_get("resume", &resolver).await.unwrap();

    let first = session.bind(64);
    assert!(!first.resumed);
    session.write_input(b"one\n").await.unwrap();
    wait_until("first reply", || {
        String::from_utf8_lossy(&session.replay()).contains("echo:one")
    })
    .await;
    session.unbind(first.id());
    drop(first);

    // Output produced while nobody is attached still lands in the replay.
    session.write_input(b"two\n").await.unwrap();
    wait_until("detached reply", || {
        String::from_utf8_lossy(&session.replay()).contains("echo:two")
    })
    .await;

    let resumed = registry.create_or_get("resume", &resolver).await.unwrap();
    assert_eq!(resumed.id(), session.id());
    assert_eq!(resolver.calls(), 1);

    let second = resumed.bind(64);
    assert!(second.resumed);
    let text = String::from_utf8_lossy(&second.replay).into_owned();
    assert!(text.contains("echo:one") && text.contains("echo:two"), "{text:?}");

    resumed.write_input(b"three\n").await.unwrap();
    let mut live = Vec::new();
    while !String::from_utf8_lossy(&live).contains("echo:three") {
        match tokio::time::timeout(Duration::from_secs(5), second.recv()).await.unwrap() {
            SessionEvent::Output(chunk) => live.extend(chunk),
            other => panic!("unexpected event {other:?}"),
        }
    }
    registry.shutdown().await;
}

#[tokio::test]
async fn lagging_connection_is_detached() {
    let registry = registry_with(Duration::from_secs(60));
    let resolver = ScriptResolver::new(
        "i=0; while [ $i -lt 200 ]; do echo chunk-$i; sleep 0.01; i=$((i+1)); done; sleep 30",
    );
    let session = registry.create_or_get("lag", &resolver).await.unwrap();
    let binding = session.bind(1);

    // Never read: the one-slot queue overflows on the next chunks.
    wait_until("binding detached", || !session.is_attached()).await;
    let mut last = None;
    while let Ok(event) = tokio::time::timeout(Duration::from_secs(1), binding.recv()).await {
        let detached = matches!(event, SessionEvent::Detached(_));
        last = Some(event);
        if detached {
            break;
        }
    }
    assert_eq!(
        last,
        Some(SessionEvent::Detached(tb_core::types::CloseReason::Lagged))
    );
    assert!(session.is_alive(), "lagging only drops the connection");
    registry.shutdown().await;
}

#[tokio::test]
async fn exited_session_is_not_returned() {
    let registry = registry_with(Duration::from_secs(60));
    let resolver = ScriptResolver::new("exit 0");
    let session = registry.create_or_get("short", &resolver).await.unwrap();
    wait_until("process exit", || session.terminal().has_exited()).await;

    assert!(registry.get(session.id()).is_none());
    assert!(registry.get_by_key("short").is_none());
    assert!(registry.list_alive().is_empty());

    let fresh = registry.create_or_get("short", &resolver).await.unwrap();
    assert_ne!(fresh.id(), session.id());
    assert_eq!(resolver.calls(), 2);
    registry.shutdown().await;
}

#[tokio::test]
async fn idle_sessions_are_swept() {
    let registry = registry_with(Duration::from_millis(200));
    let resolver = ScriptResolver::new("sleep 30");
    let idle = registry.create_or_get("idle", &resolver).await.unwrap();
    let busy = registry.create_or_get("busy", &resolver).await.unwrap();

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.touch(busy.id()));
    }

    assert_eq!(registry.sweep().await, 1);
    assert!(idle.is_closed());
    assert!(idle.terminal().has_exited(), "sweep must kill the process");
    assert!(!busy.is_closed());
    let alive = registry.list_alive();
    assert_eq!(alive.len(), 1);
    assert_eq!(alive[0].logical_key, "busy");
    assert_eq!(alive[0].session_id, busy.id());
    registry.shutdown().await;
}

#[tokio::test]
async fn sweeper_runs_until_shutdown() {
    let registry = Arc::new(registry_with(Duration::from_millis(100)));
    let resolver = ScriptResolver::new("sleep 30");
    let session: Arc<Session> = registry.create_or_get("swept", &resolver).await.unwrap();

    let shutdown = ShutdownSignal::new();
    let sweeper = registry.spawn_sweeper(Duration::from_millis(50), shutdown.clone());

    wait_until("background sweep", || registry.is_empty()).await;
    assert!(session.is_closed());

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(2), sweeper)
        .await
        .expect("sweeper should stop")
        .unwrap();
}

#[tokio::test]
async fn append_and_touch_through_registry() {
    let registry = registry_with(Duration::from_secs(60));
    let resolver = ScriptResolver::new("sleep 30");
    let session = registry.create_or_get("manual", &resolver).await.unwrap();

    assert!(registry.append_to_buffer(session.id(), b"injected"));
    assert!(registry.replay(session.id()).unwrap().ends_with(b"injected"));
    assert!(registry.touch(session.id()));

    assert!(registry.close(session.id()).await);
    assert!(!registry.close(session.id()).await);
    assert!(registry.get(session.id()).is_none());
}
