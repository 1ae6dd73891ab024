use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use syncbus_hub::{HubConfigBuilder, MemoryAdapter, NullAdapter, Result, SyncHub};
use syncbus_mom::{Dispatcher, DispatcherConfigBuilder, MemoryBroker};
use syncbus_store::{Role, StateFactory, StateTree, StoreConfigBuilder, SyncStore};
use tracing::{info, warn};

const BOARD: &str = "board";
const BOARD_ID: &str = "board-1";

/// Statistics collected during a failover simulation
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub num_candidates: usize,
    pub num_clients: usize,
    pub edits_per_client: usize,
    pub applied_edits: usize,
    pub failed_edits: usize,
    pub failover_time: Duration,
    pub convergence_time: Duration,
    pub total_time: Duration,
    pub converged: bool,
    pub final_items: usize,
    pub final_counter: u64,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Failover Simulation Statistics                ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Server Candidates:         {:>30} ║", self.num_candidates);
        println!("║  Clients:                   {:>30} ║", self.num_clients);
        println!("║  Edits per Client:          {:>30} ║", self.edits_per_client);
        println!("║  Applied Edits:             {:>30} ║", self.applied_edits);
        println!("║  Failed Edits:              {:>30} ║", self.failed_edits);
        println!("║  Final Items:               {:>30} ║", self.final_items);
        println!("║  Final Counter:             {:>30} ║", self.final_counter);
        println!("║  Failover Time:             {:>29}s ║", format!("{:.3}", self.failover_time.as_secs_f64()));
        println!("║  Convergence Time:          {:>29}s ║", format!("{:.3}", self.convergence_time.as_secs_f64()));
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Replicas Converged:        {:>30} ║", if self.converged { "yes" } else { "NO" });
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

#[derive(Clone, Copy, Debug)]
enum Edit {
    Push(u64),
    Increment,
    Title(u64),
}

/// Generator that yields (client index, edit) pairs
fn edit_generator(num_clients: usize, num_edits: usize) -> impl Stream<Item = (usize, Edit)> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for _ in 0..num_edits {
            let client = rng.gen_range(0..num_clients);
            let edit = match rng.gen_range(0..10) {
                0..=5 => Edit::Push(rng.gen()),
                6..=8 => Edit::Increment,
                _ => Edit::Title(rng.gen_range(0..1000)),
            };
            yield (client, edit);
        }
    }
}

fn board_factory() -> StateFactory {
    StateFactory::new(BOARD, true, |_| {
        let mut state = StateTree::new();
        state.insert("title".into(), json!("untitled"));
        state.insert("counter".into(), json!(0));
        state.insert("items".into(), json!([]));
        state
    })
}

async fn connect(broker: &MemoryBroker, id: &str) -> Result<Dispatcher> {
    let config = DispatcherConfigBuilder::new()
        .client_id(id)
        .topic_prefix("syncbus/simulation")
        .response_timeout(Duration::from_secs(2))
        .listener_detach_timeout(Duration::from_secs(2))
        .build();
    let dispatcher = Dispatcher::connect(config, Arc::new(broker.transport())).await?;
    dispatcher.when_ready().await;
    Ok(dispatcher)
}

async fn apply(store: &SyncStore, edit: Edit) -> Result<()> {
    match edit {
        Edit::Push(value) => {
            store
                .patch(|state| {
                    if let Some(Value::Array(items)) = state.get_mut("items") {
                        items.push(json!(value));
                    }
                })
                .await?
        }
        Edit::Increment => {
            store
                .mutex("counter", true, |state| {
                    let counter = state.get("counter").and_then(Value::as_u64).unwrap_or(0);
                    state.insert("counter".into(), json!(counter + 1));
                })
                .await?
        }
        Edit::Title(n) => {
            store
                .patch(|state| {
                    state.insert("title".into(), json!(format!("board #{n}")));
                })
                .await?
        }
    }
    Ok(())
}

/// Stream `num_edits` random edits over the client replicas.
async fn run_edits(replicas: &[SyncStore], num_edits: usize) -> (usize, usize) {
    let mut applied = 0;
    let mut failed = 0;
    let mut edits = Box::pin(edit_generator(replicas.len(), num_edits));
    while let Some((client, edit)) = edits.next().await {
        match apply(&replicas[client], edit).await {
            Ok(()) => applied += 1,
            Err(err) => {
                warn!(client, ?edit, error = %err, "Edit failed");
                failed += 1;
            }
        }
        if (applied + failed) % 50 == 0 {
            println!("  Edits completed: {}/{}", applied + failed, num_edits);
        }
    }
    (applied, failed)
}

fn converged(replicas: &[SyncStore]) -> bool {
    let Some(first) = replicas.first() else {
        return true;
    };
    let reference = first.snapshot();
    replicas.iter().all(|replica| replica.snapshot() == reference)
}

async fn wait_for(mut condition: impl FnMut() -> bool, limit: Duration) -> (bool, Duration) {
    let start = Instant::now();
    while start.elapsed() < limit {
        if condition() {
            return (true, start.elapsed());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (condition(), start.elapsed())
}

/// Two server candidates and `num_clients` clients edit one document while the leader dies.
pub async fn simulate_failover(num_clients: usize, edits_per_client: usize) -> Result<SimulationStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Leader Failover Simulation                          ║");
    println!("║  Candidates: 2 | Clients: {} | Edits/Client: {} ║", num_clients, edits_per_client);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let broker = MemoryBroker::new();
    let config = HubConfigBuilder::new()
        .election_timeout(Duration::from_millis(300))
        .election_backoff(Duration::from_millis(50))
        .store(
            StoreConfigBuilder::new()
                .debounce(Duration::from_millis(5))
                .mutex_retry_delay(Duration::from_millis(10))
                .build(),
        )
        .build();

    println!("\n[Phase 1/4] Electing a leader...");
    let server_a = connect(&broker, "server-a").await?;
    let server_b = connect(&broker, "server-b").await?;
    let (hub_a, hub_b) = tokio::join!(
        SyncHub::start(&server_a, Arc::new(MemoryAdapter::new()), Role::Server, config.clone(), [board_factory()]),
        SyncHub::start(&server_b, Arc::new(MemoryAdapter::new()), Role::Server, config.clone(), [board_factory()]),
    );
    let (leader, backup) = match (hub_a?, hub_b?) {
        (a, b) if a.is_server() => (a, b),
        (a, b) => (b, a),
    };
    info!(leader = leader.client_id(), backup = backup.client_id(), "Leader elected");

    let mut clients = Vec::with_capacity(num_clients);
    let mut replicas = Vec::with_capacity(num_clients);
    for i in 0..num_clients {
        let dispatcher = connect(&broker, &format!("client-{i}")).await?;
        let hub = SyncHub::start(&dispatcher, Arc::new(NullAdapter), Role::Client, config.clone(), [board_factory()]).await?;
        let store = hub.open(BOARD_ID, BOARD).await?;
        store.when_ready().await;
        replicas.push(store);
        clients.push(hub);
    }
    println!("[Phase 1/4] ✓ Completed");

    let total_edits = num_clients * edits_per_client;
    let before = total_edits / 2;

    println!("[Phase 2/4] Editing under the first leader...");
    let (mut applied, mut failed) = run_edits(&replicas, before).await;
    println!("[Phase 2/4] ✓ Completed");

    println!("[Phase 3/4] Killing the leader...");
    let failover_start = Instant::now();
    leader.dispatcher().destroy(false).await?;
    let (promoted, failover_time) = wait_for(|| backup.is_server(), Duration::from_secs(10)).await;
    if !promoted {
        warn!(backup = backup.client_id(), "Backup did not take over");
    }
    println!("[Phase 3/4] ✓ Completed in {:.3}s", failover_start.elapsed().as_secs_f64());

    println!("[Phase 4/4] Editing under the new leader...");
    let (more_applied, more_failed) = run_edits(&replicas, total_edits - before).await;
    applied += more_applied;
    failed += more_failed;

    let (is_converged, convergence_time) =
        wait_for(|| converged(&replicas), Duration::from_secs(10)).await;
    println!("[Phase 4/4] ✓ Completed");

    let final_state = replicas.first().map(SyncStore::snapshot).unwrap_or_default();
    let final_items = final_state
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    let final_counter = final_state.get("counter").and_then(Value::as_u64).unwrap_or(0);

    for hub in &clients {
        hub.dispatcher().destroy(true).await?;
    }
    backup.dispatcher().destroy(true).await?;

    Ok(SimulationStats {
        num_candidates: 2,
        num_clients,
        edits_per_client,
        applied_edits: applied,
        failed_edits: failed,
        failover_time,
        convergence_time,
        total_time: start.elapsed(),
        converged: is_converged,
        final_items,
        final_counter,
    })
}
