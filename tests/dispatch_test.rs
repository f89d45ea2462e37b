//! Dispatcher tests against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use entryflow::dispatch::{DispatchConfig, Dispatcher};
use entryflow::lease::LeaseManager;
use entryflow::model::{EntryId, Lease, NewEntry, Status, WorkerId};
use entryflow::plan::StagePlan;
use entryflow::scheduler::EntryScheduler;
use entryflow::stage::SimulatedStage;
use entryflow::store::{MemoryStore, RecordStore};

fn dispatcher(store: &Arc<MemoryStore>, worker: &str, config: DispatchConfig) -> Dispatcher {
    let leases = LeaseManager::new(store.clone(), WorkerId::new(worker), Duration::from_secs(5));
    let scheduler = EntryScheduler::new(
        leases,
        Arc::new(SimulatedStage::new(Duration::from_millis(10))),
        StagePlan::default(),
    );
    Dispatcher::new(Arc::new(scheduler), config)
}

async fn wait_for(store: &MemoryStore, id: EntryId, status: Status) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let entry = store.get(id).await.unwrap();
        if entry.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "entry stuck at {}",
            entry.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn create_returns_immediately_and_completes_in_background() {
    let store = Arc::new(MemoryStore::new());
    let d = dispatcher(&store, "w1", DispatchConfig::default());

    let (entry, _run) = d.create(NewEntry::new("  background  ").unwrap()).await.unwrap();
    assert_eq!(entry.title, "background");
    assert_eq!(entry.status, Status::Created);
    assert_eq!(entry.progress, 0);

    wait_for(&store, entry.id, Status::Completed).await;
    let done = store.get(entry.id).await.unwrap();
    assert_eq!(done.progress, 100);
    assert_eq!(done.lease, Lease::Unleased);
}

#[tokio::test]
async fn create_hands_back_the_run_handle() {
    let store = Arc::new(MemoryStore::new());
    let d = dispatcher(&store, "w1", DispatchConfig::default());

    let (entry, run) = d.create(NewEntry::new("awaited").unwrap()).await.unwrap();
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.advanced, 3);
    assert_eq!(store.get(entry.id).await.unwrap().status, Status::Completed);
}

#[tokio::test]
async fn dispatch_handle_yields_the_run_report() {
    let store = Arc::new(MemoryStore::new());
    let entry = store.insert(NewEntry::new("awaited").unwrap()).await.unwrap();
    let d = dispatcher(&store, "w1", DispatchConfig::default());

    let report = d.dispatch(entry.id).await.unwrap().unwrap();
    assert_eq!(report.advanced, 3);
    assert_eq!(report.last_status, Some(Status::Completed));
}

#[tokio::test]
async fn duplicate_dispatch_is_harmless() {
    let store = Arc::new(MemoryStore::new());
    let entry = store.insert(NewEntry::new("twice").unwrap()).await.unwrap();
    let d = dispatcher(&store, "w1", DispatchConfig::default());
    let other = dispatcher(&store, "w2", DispatchConfig::default());

    let (a, b) = tokio::join!(d.dispatch(entry.id), other.dispatch(entry.id));
    let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());
    assert_eq!(a.advanced + b.advanced, 3);
    assert_eq!(
        store.history(entry.id),
        vec![
            (Status::Created, 0),
            (Status::Stage1, 33),
            (Status::Stage2, 66),
            (Status::Completed, 100),
        ]
    );
}

#[tokio::test]
async fn sweep_skips_live_leases_and_finished_entries() {
    let store = Arc::new(MemoryStore::new());
    let d = dispatcher(&store, "w1", DispatchConfig::default());

    let held = store.insert(NewEntry::new("held").unwrap()).await.unwrap();
    store
        .force_lease(
            held.id,
            Lease::LeasedBy {
                worker: WorkerId::new("alive"),
                since: Utc::now(),
            },
        )
        .unwrap();

    let finished = store.insert(NewEntry::new("finished").unwrap()).await.unwrap();
    d.dispatch(finished.id).await.unwrap();
    assert_eq!(store.get(finished.id).await.unwrap().status, Status::Completed);

    assert_eq!(d.sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn sweep_recovers_entry_abandoned_by_crashed_worker() {
    let store = Arc::new(MemoryStore::new());
    let d = dispatcher(&store, "rescuer", DispatchConfig::default());

    let entry = store.insert(NewEntry::new("orphan").unwrap()).await.unwrap();
    store
        .force_lease(
            entry.id,
            Lease::LeasedBy {
                worker: WorkerId::new("crashed"),
                since: Utc::now() - chrono::Duration::seconds(60),
            },
        )
        .unwrap();

    assert_eq!(d.sweep().await.unwrap(), 1);
    wait_for(&store, entry.id, Status::Completed).await;
}

#[tokio::test]
async fn run_loop_sweeps_until_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let d = dispatcher(
        &store,
        "daemon",
        DispatchConfig {
            sweep_interval: Duration::from_millis(20),
            sweep_batch: 10,
        },
    );

    let entry = store.insert(NewEntry::new("pending").unwrap()).await.unwrap();

    let daemon = d.clone();
    let handle = tokio::spawn(async move { daemon.run().await });

    wait_for(&store, entry.id, Status::Completed).await;
    d.shutdown();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("dispatcher did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn sweep_surfaces_store_errors() {
    let store = Arc::new(MemoryStore::new());
    let d = dispatcher(&store, "w1", DispatchConfig::default());
    store.set_unavailable(true);
    assert!(d.sweep().await.is_err());
}
