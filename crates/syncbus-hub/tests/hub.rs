//! Election, failover and document lifecycle across several hubs.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncbus_hub::{
    FileAdapter, HubConfig, HubConfigBuilder, HubError, HubRole, MemoryAdapter, NullAdapter,
    PersistenceAdapter, PersistenceError, SyncHub,
};
use syncbus_mom::{
    Dispatcher, DispatcherConfigBuilder, MemoryBroker, MemoryTransport, Message, PublishOptions,
};
use syncbus_store::{Role, StateFactory, StateTree, StoreConfigBuilder, SyncStore};
use tokio_test::assert_ok;

const DOC: &str = "doc-1";

async fn connect(broker: &MemoryBroker, id: &str) -> Dispatcher {
    connect_with(id, Arc::new(broker.transport())).await
}

async fn connect_with(id: &str, transport: Arc<MemoryTransport>) -> Dispatcher {
    let config = DispatcherConfigBuilder::new()
        .client_id(id)
        .topic_prefix("hub-test")
        .response_timeout(Duration::from_secs(1))
        .listener_detach_timeout(Duration::from_secs(2))
        .build();
    let dispatcher = Dispatcher::connect(config, transport).await.unwrap();
    dispatcher.when_ready().await;
    dispatcher
}

fn hub_config() -> HubConfig {
    HubConfigBuilder::new()
        .election_timeout(Duration::from_millis(300))
        .election_backoff(Duration::from_millis(50))
        .persist_interval(Duration::from_secs(60))
        .store(
            StoreConfigBuilder::new()
                .debounce(Duration::ZERO)
                .mutex_retry_delay(Duration::from_millis(10))
                .build(),
        )
        .build()
}

fn notes() -> StateFactory {
    StateFactory::new("note", true, |_| {
        let mut state = StateTree::new();
        state.insert("title".into(), json!(""));
        state.insert("property".into(), json!(0));
        state.insert("items".into(), json!([]));
        state
    })
}

async fn candidate(dispatcher: &Dispatcher, adapter: Arc<dyn PersistenceAdapter>) -> SyncHub {
    SyncHub::start(dispatcher, adapter, Role::Server, hub_config(), [notes()])
        .await
        .unwrap()
}

async fn client(dispatcher: &Dispatcher) -> SyncHub {
    SyncHub::start(dispatcher, Arc::new(NullAdapter), Role::Client, hub_config(), [notes()])
        .await
        .unwrap()
}

async fn open(hub: &SyncHub, id: &str) -> SyncStore {
    let store = hub.open(id, "note").await.unwrap();
    store.when_ready().await;
    store
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Counts writes on top of a memory adapter.
#[derive(Default)]
struct CountingAdapter {
    inner: MemoryAdapter,
    writes: AtomicUsize,
}

impl CountingAdapter {
    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceAdapter for CountingAdapter {
    async fn get(&self, id: &str) -> Result<StateTree, PersistenceError> {
        self.inner.get(id).await
    }

    async fn set(&self, state: StateTree) -> Result<StateTree, PersistenceError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(state).await
    }

    async fn has(&self, id: &str) -> Result<bool, PersistenceError> {
        self.inner.has(id).await
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        self.inner.delete(id).await
    }
}

// ============================================================================
// Election and failover
// ============================================================================

#[tokio::test]
async fn test_election_picks_smallest_id() {
    let broker = MemoryBroker::new();
    let c = connect(&broker, "c").await;
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;

    let (hub_c, hub_a, hub_b) = tokio::join!(
        candidate(&c, Arc::new(MemoryAdapter::new())),
        candidate(&a, Arc::new(MemoryAdapter::new())),
        candidate(&b, Arc::new(MemoryAdapter::new())),
    );

    let hubs = [&hub_a, &hub_b, &hub_c];
    assert!(hubs.iter().all(|hub| hub.is_ready()));
    assert_eq!(hubs.iter().filter(|hub| hub.is_server()).count(), 1);
    assert!(hub_a.is_server());
    assert_eq!(hub_b.role(), HubRole::Client);
    assert_eq!(hub_c.role(), HubRole::Client);
    for hub in hubs {
        assert_eq!(hub.leader().as_deref(), Some("a"));
    }

    eventually(|| {
        hub_c
            .hub_state()
            .map(|state| syncbus_hub::state::server_order(&state).len() == 3)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_failover_keeps_exactly_one_server() {
    let broker = MemoryBroker::new();
    let first = connect(&broker, "first").await;
    let second = connect(&broker, "second").await;
    let (hub_1, hub_2) = tokio::join!(
        candidate(&first, Arc::new(MemoryAdapter::new())),
        candidate(&second, Arc::new(MemoryAdapter::new())),
    );
    assert!(hub_1.is_server() != hub_2.is_server());
    assert!(hub_1.is_client() != hub_2.is_client());

    let (leader, follower) = if hub_1.is_server() {
        (hub_1, hub_2)
    } else {
        (hub_2, hub_1)
    };
    assert_ok!(leader.dispatcher().destroy(false).await);
    eventually(|| follower.is_server()).await;
    assert!(!follower.is_client());
    eventually(|| leader.is_destroyed()).await;

    // a newcomer joins as backup of the surviving leader
    let third = connect(&broker, "third").await;
    let hub_3 = candidate(&third, Arc::new(MemoryAdapter::new())).await;
    assert!(hub_3.is_ready());
    assert!(hub_3.is_client());
    assert!(follower.is_server());
    assert_eq!(hub_3.leader().as_deref(), Some(follower.client_id()));
    assert_eq!(follower.open_instances(), 0);
    assert_eq!(hub_3.open_instances(), 0);

    eventually(|| {
        hub_3
            .hub_state()
            .map(|state| syncbus_hub::state::server_order(&state).len() == 2)
            .unwrap_or(false)
    })
    .await;
    assert_ok!(follower.dispatcher().destroy(false).await);
    eventually(|| hub_3.is_server()).await;

    hub_3.destroy().await;
}

#[tokio::test]
async fn test_pure_client_follows_the_leader_across_failover() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;
    let (hub_a, hub_b) = tokio::join!(
        candidate(&a, Arc::new(MemoryAdapter::new())),
        candidate(&b, Arc::new(MemoryAdapter::new())),
    );
    assert!(hub_a.is_server());

    let c = connect(&broker, "c").await;
    let hub_c = client(&c).await;
    eventually(|| hub_c.leader().as_deref() == Some("a")).await;
    assert!(hub_c.is_client());

    assert_ok!(a.destroy(false).await);
    eventually(|| hub_b.is_server()).await;
    eventually(|| hub_c.leader().as_deref() == Some("b")).await;
    assert_eq!(hub_b.leader().as_deref(), Some("b"));
}

#[tokio::test]
async fn test_election_gives_up_after_max_rounds() {
    let broker = MemoryBroker::new();
    let alpha = connect(&broker, "alpha").await;
    let zulu = connect(&broker, "zulu").await;
    let config = HubConfigBuilder::new()
        .election_timeout(Duration::from_millis(100))
        .election_backoff(Duration::from_millis(10))
        .max_election_rounds(2)
        .build();

    // "zulu" hears "alpha" ask once, ranks it first, but "alpha" never answers
    let silent = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let topic = alpha.topic(["hub", "control", "broadcast"]);
        alpha
            .publish(Message::to(topic, "who is in charge?"), PublishOptions::default())
            .await
            .unwrap();
    };
    let (result, _) = tokio::join!(
        SyncHub::start(&zulu, Arc::new(MemoryAdapter::new()), Role::Server, config, [notes()]),
        silent,
    );
    assert_eq!(result.err(), Some(HubError::ElectionExhausted(2)));
}

// ============================================================================
// Documents
// ============================================================================

#[tokio::test]
async fn test_two_clients_and_two_candidates_converge() {
    let broker = MemoryBroker::new();
    let s1 = connect(&broker, "s1").await;
    let s2 = connect(&broker, "s2").await;
    let (server_1, server_2) = tokio::join!(
        candidate(&s1, Arc::new(MemoryAdapter::new())),
        candidate(&s2, Arc::new(MemoryAdapter::new())),
    );
    let (leader, backup) = if server_1.is_server() {
        (server_1, server_2)
    } else {
        (server_2, server_1)
    };

    let a = connect(&broker, "client-a").await;
    let b = connect(&broker, "client-b").await;
    let hub_a = client(&a).await;
    let hub_b = client(&b).await;
    assert!(hub_a.is_client());
    assert!(hub_a.hub_state().is_none());

    let store_a = open(&hub_a, DOC).await;
    let store_b = open(&hub_b, DOC).await;
    assert_eq!(store_a.snapshot(), store_b.snapshot());
    assert_eq!(store_a.snapshot()["_id"], json!(DOC));
    let before = store_a.snapshot()["items"].as_array().unwrap().len();

    eventually(|| leader.has(DOC) && backup.has(DOC)).await;
    let leader_store = leader.get(DOC).unwrap();
    let backup_store = backup.get(DOC).unwrap();
    backup_store.when_ready().await;
    assert_eq!(leader_store.role(), Some(Role::Server));
    assert_eq!(backup_store.role(), Some(Role::Client));

    let (first, second) = tokio::join!(
        store_a.patch(|state| {
            state.insert("property".into(), json!(42));
            state["items"].as_array_mut().unwrap().push(json!("from-a"));
        }),
        store_b.patch(|state| {
            state.insert("property".into(), json!(13));
            let items = state["items"].as_array_mut().unwrap();
            items.push(json!("from-b-1"));
            items.push(json!("from-b-2"));
        }),
    );
    assert_ok!(first);
    assert_ok!(second);

    let replicas = [store_a.clone(), store_b.clone(), leader_store.clone(), backup_store.clone()];
    eventually(|| {
        replicas
            .windows(2)
            .all(|pair| pair[0].snapshot() == pair[1].snapshot())
            && replicas[0].snapshot()["items"].as_array().map(Vec::len) == Some(before + 3)
    })
    .await;
    let property = store_a.snapshot()["property"].clone();
    assert!(property == json!(42) || property == json!(13));

    assert_eq!(hub_a.open_instances(), 1);
    assert_eq!(leader.open_instances(), 1);
    assert_eq!(backup.open_instances(), 1);
    let state = leader.hub_state().unwrap();
    assert_eq!(
        syncbus_hub::state::participants(&state, DOC),
        vec!["client-a".to_string(), "client-b".to_string()]
    );
}

#[tokio::test]
async fn test_abandoned_document_is_persisted_once_and_restored() {
    let broker = MemoryBroker::new();
    let s = connect(&broker, "server").await;
    let adapter = Arc::new(CountingAdapter::default());
    let leader = candidate(&s, adapter.clone()).await;
    let c = connect(&broker, "client").await;
    let hub = client(&c).await;

    let store = open(&hub, DOC).await;
    assert_ok!(store.patch(|state| state.insert("title".into(), json!("kept"))).await);
    eventually(|| leader.get(DOC).map(|s| s.snapshot()["title"] == json!("kept")).unwrap_or(false)).await;

    assert!(hub.close(DOC).await.unwrap());
    assert!(!hub.has(DOC));
    eventually(|| !leader.has(DOC)).await;
    assert_eq!(adapter.writes(), 1);
    assert!(adapter.has(DOC).await.unwrap());
    assert!(!hub.close(DOC).await.unwrap());

    let reopened = open(&hub, DOC).await;
    assert_eq!(reopened.snapshot()["title"], json!("kept"));
    assert!(leader.has(DOC));
    assert_eq!(adapter.writes(), 1);
}

#[tokio::test]
async fn test_delete_drops_persisted_state() {
    let broker = MemoryBroker::new();
    let s = connect(&broker, "server").await;
    let adapter = Arc::new(MemoryAdapter::new());
    let leader = candidate(&s, adapter.clone()).await;
    let c = connect(&broker, "client").await;
    let hub = client(&c).await;

    let store = open(&hub, DOC).await;
    assert_ok!(store.patch(|state| state.insert("title".into(), json!("gone"))).await);
    assert!(hub.delete(DOC).await.unwrap());

    eventually(|| !leader.has(DOC)).await;
    eventually(|| adapter.is_empty()).await;
}

#[tokio::test]
async fn test_departed_client_releases_its_handles() {
    let broker = MemoryBroker::new();
    let s = connect(&broker, "server").await;
    let leader = candidate(&s, Arc::new(MemoryAdapter::new())).await;

    let transport = Arc::new(broker.transport());
    let c = connect_with("client", transport.clone()).await;
    let hub = client(&c).await;
    open(&hub, DOC).await;
    eventually(|| leader.has(DOC)).await;

    transport.kill();
    eventually(|| !leader.has(DOC)).await;
    let state = leader.hub_state().unwrap();
    assert!(syncbus_hub::state::handles(&state).is_empty());
    assert!(!syncbus_hub::state::clients(&state).contains(&"client".to_string()));
}

#[tokio::test]
async fn test_failover_carries_documents_over() {
    let broker = MemoryBroker::new();
    let s1 = connect(&broker, "s1").await;
    let s2 = connect(&broker, "s2").await;
    let backup_adapter = Arc::new(MemoryAdapter::new());
    let hub_1 = candidate(&s1, Arc::new(MemoryAdapter::new())).await;
    let hub_2 = candidate(&s2, backup_adapter.clone()).await;
    assert!(hub_1.is_server());

    let c = connect(&broker, "client").await;
    let hub = client(&c).await;
    let store = open(&hub, DOC).await;
    assert_ok!(store.patch(|state| state.insert("title".into(), json!("before"))).await);
    eventually(|| hub_2.get(DOC).map(|s| s.snapshot()["title"] == json!("before")).unwrap_or(false)).await;

    assert_ok!(s1.destroy(false).await);
    eventually(|| hub_2.is_server()).await;
    let promoted = hub_2.get(DOC).unwrap();
    eventually(|| promoted.role() == Some(Role::Server)).await;

    // the takeover force-persists what it serves
    eventually(|| !backup_adapter.is_empty()).await;

    // the client keeps working against the new leader
    assert_ok!(store.mutex("title", true, |state| state.insert("title".into(), json!("after"))).await);
    eventually(|| promoted.snapshot()["title"] == json!("after")).await;
}

#[tokio::test]
async fn test_failover_releases_locks_of_the_former_leader() {
    let broker = MemoryBroker::new();
    let s1 = connect(&broker, "s1").await;
    let s2 = connect(&broker, "s2").await;
    let hub_1 = candidate(&s1, Arc::new(MemoryAdapter::new())).await;
    let hub_2 = candidate(&s2, Arc::new(MemoryAdapter::new())).await;
    assert!(hub_1.is_server());

    let c = connect(&broker, "client").await;
    let hub = client(&c).await;
    let store = open(&hub, DOC).await;
    eventually(|| hub_1.has(DOC) && hub_2.has(DOC)).await;

    let served = hub_1.get(DOC).unwrap();
    assert!(served.try_acquire_mutex("title").await.unwrap());
    let mirror = hub_2.get(DOC).unwrap();
    eventually(|| mirror.locks_of("s1") == vec!["title".to_string()]).await;

    assert_ok!(s1.destroy(false).await);
    eventually(|| hub_2.is_server()).await;
    let promoted = hub_2.get(DOC).unwrap();
    eventually(|| promoted.role() == Some(Role::Server)).await;
    eventually(|| promoted.locks_of("s1").is_empty()).await;
    assert!(promoted.is_locked("title").is_none());

    assert!(store.try_acquire_mutex("title").await.unwrap());
    eventually(|| promoted.is_locked("title").as_deref() == Some("client")).await;
}

#[tokio::test]
async fn test_file_adapter_backs_the_leader() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(FileAdapter::open(dir.path()).await.unwrap());

    let broker = MemoryBroker::new();
    let s = connect(&broker, "server").await;
    let leader = candidate(&s, adapter.clone()).await;
    let c = connect(&broker, "client").await;
    let hub = client(&c).await;

    let store = open(&hub, DOC).await;
    assert_ok!(store.patch(|state| state.insert("title".into(), json!("on disk"))).await);
    eventually(|| leader.get(DOC).map(|s| s.snapshot()["title"] == json!("on disk")).unwrap_or(false)).await;
    assert!(hub.close(DOC).await.unwrap());
    eventually(|| !leader.has(DOC)).await;

    let reader = FileAdapter::open(dir.path()).await.unwrap();
    let stored = reader.get(DOC).await.unwrap();
    assert_eq!(stored["title"], json!("on disk"));
    assert_eq!(stored["_type"], json!("note"));
}
