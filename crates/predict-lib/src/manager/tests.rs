use super::*;
use crate::checkpoint::{
    CheckpointInfo, CheckpointStore, MemoryCheckpointStore, ProfileCheckpoint,
};
use crate::models::{
    DistributionModel, EstimatorSpec, HierarchyLevel, MetricServerSource, MetricSource,
    ResourceName, WorkloadRef,
};
use crate::metrics::{RepositoryConfig, UsageSnapshot, UsageSource};
use crate::resolver::{ClusterSnapshot, LabelSelector};
use crate::testing::{ts, usage, web_cluster, web_key, Fixture};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;

/// Memory store with switchable failures that tracks concurrent saves
#[derive(Default)]
struct FlakyCheckpointStore {
    inner: MemoryCheckpointStore,
    save_delay: Duration,
    fail_load: AtomicBool,
    fail_save: AtomicBool,
    saves_in_flight: AtomicUsize,
    peak_saves: AtomicUsize,
}

impl FlakyCheckpointStore {
    fn with_save_delay(save_delay: Duration) -> Self {
        Self {
            save_delay,
            ..Default::default()
        }
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpointStore {
    async fn save(&self, checkpoint: &ProfileCheckpoint) -> Result<(), PredictionError> {
        let in_flight = self.saves_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_saves.fetch_max(in_flight, Ordering::SeqCst);
        tokio::time::sleep(self.save_delay).await;
        self.saves_in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(PredictionError::Checkpoint("no space left on device".to_string()));
        }
        self.inner.save(checkpoint).await
    }

    async fn load(&self, key: &ProfileKey) -> Result<Option<ProfileCheckpoint>, PredictionError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(PredictionError::Checkpoint("permission denied".to_string()));
        }
        self.inner.load(key).await
    }

    async fn delete(&self, key: &ProfileKey) -> Result<bool, PredictionError> {
        self.inner.delete(key).await
    }

    async fn list(&self) -> Result<Vec<CheckpointInfo>, PredictionError> {
        self.inner.list().await
    }
}

fn spec(resources: &[ResourceName]) -> PredictionProfileSpec {
    PredictionProfileSpec::new(
        None,
        vec![MetricSource::MetricsApi(MetricServerSource {
            resources: resources.to_vec(),
        })],
        vec![EstimatorSpec::Distribution(DistributionModel::default())],
    )
    .unwrap()
}

async fn web_fixture() -> Fixture {
    Fixture::new(
        web_cluster(
            &[("web-1", &["app"]), ("web-2", &["app"]), ("web-3", &["app"])],
            &["app"],
        ),
        usage(
            ts(0),
            &[
                ("web-1", "app", ResourceName::Cpu, "100m"),
                ("web-2", "app", ResourceName::Cpu, "200m"),
                ("web-3", "app", ResourceName::Cpu, "300m"),
                ("web-1", "app", ResourceName::Memory, "512Mi"),
            ],
        ),
    )
    .await
}

fn manager(fixture: &Fixture, config: ManagerConfig) -> PredictionManager {
    PredictionManager::new(
        config,
        fixture.resolver.clone(),
        fixture.repository.clone(),
        fixture.checkpoints.clone(),
    )
}

async fn manager_with_store(
    fixture: &Fixture,
    config: ManagerConfig,
    store: Arc<FlakyCheckpointStore>,
) -> PredictionManager {
    let manager = PredictionManager::new(
        config,
        fixture.resolver.clone(),
        fixture.repository.clone(),
        store,
    );
    assert!(manager.try_start().await);
    manager
}

async fn started_manager(fixture: &Fixture) -> PredictionManager {
    let manager = manager(fixture, ManagerConfig::default());
    assert!(manager.try_start().await);
    manager
}

#[tokio::test]
async fn test_register_before_start_is_rejected() {
    let fixture = web_fixture().await;
    let manager = manager(&fixture, ManagerConfig::default());
    let spec = spec(&[ResourceName::Cpu]);
    let key = web_key(&spec, HierarchyLevel::Container);

    assert!(!manager.started());
    assert!(matches!(
        manager.register(key.clone(), spec).await,
        Err(PredictionError::NotStarted)
    ));
    assert!(matches!(
        manager.get_result(&key),
        Err(PredictionError::NotStarted)
    ));
}

#[tokio::test]
async fn test_start_waits_for_dependencies() {
    let fixture = web_fixture().await;
    fixture.usage.set(None);
    let unsynced = Arc::new(MetricsRepository::new(
        RepositoryConfig::default(),
        vec![fixture.usage.clone() as Arc<dyn UsageSource>],
    ));
    unsynced.refresh_all().await;

    let manager = PredictionManager::new(
        ManagerConfig::default(),
        fixture.resolver.clone(),
        unsynced.clone(),
        fixture.checkpoints.clone(),
    );
    assert!(!manager.try_start().await);

    fixture.usage.set(Some(UsageSnapshot::default()));
    unsynced.refresh_all().await;
    assert!(manager.try_start().await);
    assert!(manager.started());
}

#[tokio::test]
async fn test_three_pod_mean_after_one_cycle() {
    let fixture = web_fixture().await;
    let manager = started_manager(&fixture).await;
    let spec = spec(&[ResourceName::Cpu]);
    let key = web_key(&spec, HierarchyLevel::Container);

    manager.register(key.clone(), spec).await.unwrap();
    assert!(manager.get_result(&key).unwrap().is_empty());

    let summary = manager.run_cycle().await;
    assert_eq!(summary.profiles, 1);
    assert_eq!(summary.succeeded, 1);

    let result = manager.get_result(&key).unwrap();
    let cpu = &result["app"].resources[&ResourceName::Cpu];
    assert!((cpu.mean - 0.2).abs() < 1e-9);
    assert_eq!(cpu.total_samples_count, 3);
}

#[tokio::test]
async fn test_register_same_key_twice_keeps_one_profile() {
    let fixture = web_fixture().await;
    let manager = started_manager(&fixture).await;

    let wide = spec(&[ResourceName::Cpu, ResourceName::Memory]);
    let key = web_key(&wide, HierarchyLevel::Container);
    manager.register(key.clone(), wide).await.unwrap();
    manager.run_cycle().await;
    assert_eq!(manager.get_result(&key).unwrap()["app"].resources.len(), 2);

    let narrow = spec(&[ResourceName::Memory]);
    assert_eq!(web_key(&narrow, HierarchyLevel::Container), key);
    manager.register(key.clone(), narrow).await.unwrap();
    assert_eq!(manager.len(), 1);

    manager.run_cycle().await;
    let result = manager.get_result(&key).unwrap();
    let resources: Vec<_> = result["app"].resources.keys().copied().collect();
    assert_eq!(resources, vec![ResourceName::Memory]);
}

#[tokio::test]
async fn test_unregister_unknown_key() {
    let fixture = web_fixture().await;
    let manager = started_manager(&fixture).await;
    let spec = spec(&[ResourceName::Cpu]);
    manager
        .register(web_key(&spec, HierarchyLevel::Container), spec.clone())
        .await
        .unwrap();

    let unknown = web_key(&spec, HierarchyLevel::Pod);
    assert!(matches!(
        manager.unregister(&unknown).await,
        Err(PredictionError::NotRegistered(_))
    ));
    assert_eq!(manager.len(), 1);
    assert!(matches!(
        manager.get_result(&unknown),
        Err(PredictionError::NotRegistered(_))
    ));
}

#[tokio::test]
async fn test_unregister_removes_result_but_keeps_checkpoint() {
    let fixture = web_fixture().await;
    let manager = started_manager(&fixture).await;
    let spec = spec(&[ResourceName::Cpu]);
    let key = web_key(&spec, HierarchyLevel::Container);
    manager.register(key.clone(), spec).await.unwrap();
    manager.run_cycle().await;

    manager.unregister(&key).await.unwrap();
    assert!(manager.is_empty());
    assert!(matches!(
        manager.get_result(&key),
        Err(PredictionError::NotRegistered(_))
    ));
    assert!(fixture.checkpoints.load(&key).await.unwrap().is_some());
}

#[tokio::test]
async fn test_backend_outage_keeps_previous_results() {
    let fixture = web_fixture().await;
    let manager = started_manager(&fixture).await;
    let spec = spec(&[ResourceName::Cpu]);
    let key = web_key(&spec, HierarchyLevel::Container);
    manager.register(key.clone(), spec).await.unwrap();
    manager.run_cycle().await;
    let before = manager.get_result(&key).unwrap();

    fixture.usage.set(None);
    fixture.repository.refresh_all().await;
    let summary = manager.run_cycle().await;
    assert_eq!(summary.failed, 0);

    let after = manager.get_result(&key).unwrap();
    let cpu = &after["app"].resources[&ResourceName::Cpu];
    assert_eq!(cpu.total_samples_count, 3);
    assert_eq!(cpu.mean, before["app"].resources[&ResourceName::Cpu].mean);
}

#[tokio::test]
async fn test_unsupported_kind_is_rejected() {
    let fixture = web_fixture().await;
    let manager = started_manager(&fixture).await;
    let spec = spec(&[ResourceName::Cpu]);
    let key = ProfileKey::new(
        TargetRef::Workload(WorkloadRef::new("CronJob", "default", "backup")),
        HierarchyLevel::Container,
        &spec,
    );
    assert!(matches!(
        manager.register(key, spec).await,
        Err(PredictionError::UnsupportedTargetKind(_))
    ));
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_mismatched_spec_is_rejected() {
    let fixture = web_fixture().await;
    let manager = started_manager(&fixture).await;
    let key = web_key(&spec(&[ResourceName::Cpu]), HierarchyLevel::Container);
    let other = PredictionProfileSpec::for_workload(
        None,
        &[crate::models::PrometheusSource {
            name: "vms-kube".to_string(),
            resources: vec![ResourceName::Cpu],
        }],
    );
    assert!(matches!(
        manager.register(key, other).await,
        Err(PredictionError::InvalidSpec(_))
    ));
}

#[tokio::test]
async fn test_restart_restores_from_checkpoint() {
    let fixture = web_fixture().await;
    let spec = spec(&[ResourceName::Cpu]);
    let key = web_key(&spec, HierarchyLevel::Container);
    {
        let manager = started_manager(&fixture).await;
        manager.register(key.clone(), spec.clone()).await.unwrap();
        manager.run_cycle().await;
    }

    let restarted = started_manager(&fixture).await;
    restarted.register(key.clone(), spec).await.unwrap();
    let result = restarted.get_result(&key).unwrap();
    assert_eq!(result["app"].resources[&ResourceName::Cpu].total_samples_count, 3);
}

#[tokio::test]
async fn test_bounded_fan_out_runs_every_profile() {
    let fixture = web_fixture().await;
    let store = Arc::new(FlakyCheckpointStore::with_save_delay(Duration::from_millis(20)));
    let manager = manager_with_store(
        &fixture,
        ManagerConfig {
            max_concurrent_profiles: 2,
            ..Default::default()
        },
        store.clone(),
    )
    .await;

    let spec = spec(&[ResourceName::Cpu]);
    for i in 0..6 {
        let key = ProfileKey::new(
            TargetRef::PodSelector {
                namespace: "default".to_string(),
                selector: LabelSelector::from_labels([("app".to_string(), format!("web-{i}"))]),
            },
            HierarchyLevel::Container,
            &spec,
        );
        manager.register(key, spec.clone()).await.unwrap();
    }
    let summary = manager.run_cycle().await;
    assert_eq!(summary.profiles, 6);
    assert_eq!(summary.succeeded, 6);
    assert_eq!(summary.failed, 0);

    // every cycle ends with a checkpoint save, so saves in flight
    // bound the cycles in flight
    assert_eq!(store.peak_saves.load(Ordering::SeqCst), 2);
    assert_eq!(store.inner.list().await.unwrap().len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_register_of_same_key() {
    let fixture = web_fixture().await;
    let manager = Arc::new(started_manager(&fixture).await);
    let spec = spec(&[ResourceName::Cpu]);
    let key = web_key(&spec, HierarchyLevel::Container);

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        let key = key.clone();
        let spec = spec.clone();
        tasks.spawn(async move { manager.register(key, spec).await });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    assert_eq!(manager.len(), 1);
    assert_eq!(manager.keys(), vec![key.clone()]);
    assert_eq!(manager.run_cycle().await.succeeded, 1);
    assert_eq!(
        manager.get_result(&key).unwrap()["app"].resources[&ResourceName::Cpu].total_samples_count,
        3
    );
}

#[tokio::test]
async fn test_unreadable_checkpoint_registers_empty_profile() {
    let fixture = web_fixture().await;
    let store = Arc::new(FlakyCheckpointStore::default());
    let spec = spec(&[ResourceName::Cpu]);
    let key = web_key(&spec, HierarchyLevel::Container);

    let first = manager_with_store(&fixture, ManagerConfig::default(), store.clone()).await;
    first.register(key.clone(), spec.clone()).await.unwrap();
    first.run_cycle().await;
    assert!(store.inner.load(&key).await.unwrap().is_some());

    store.fail_load.store(true, Ordering::SeqCst);
    let second = manager_with_store(&fixture, ManagerConfig::default(), store.clone()).await;
    second.register(key.clone(), spec).await.unwrap();
    assert!(second.get_result(&key).unwrap().is_empty());

    second.run_cycle().await;
    let cpu = &second.get_result(&key).unwrap()["app"].resources[&ResourceName::Cpu];
    assert_eq!(cpu.total_samples_count, 3);
}

#[tokio::test]
async fn test_failed_checkpoint_save_still_publishes() {
    let fixture = web_fixture().await;
    let store = Arc::new(FlakyCheckpointStore::default());
    store.fail_save.store(true, Ordering::SeqCst);
    let manager = manager_with_store(&fixture, ManagerConfig::default(), store.clone()).await;
    let spec = spec(&[ResourceName::Cpu]);
    let key = web_key(&spec, HierarchyLevel::Container);
    manager.register(key.clone(), spec).await.unwrap();

    let summary = manager.run_cycle().await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);

    let cpu = &manager.get_result(&key).unwrap()["app"].resources[&ResourceName::Cpu];
    assert!((cpu.mean - 0.2).abs() < 1e-9);
    assert!(store.inner.load(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_workload_counts_as_skipped() {
    let fixture = web_fixture().await;
    let manager = started_manager(&fixture).await;
    let spec = spec(&[ResourceName::Cpu]);
    let key = web_key(&spec, HierarchyLevel::Container);
    manager.register(key.clone(), spec).await.unwrap();

    fixture.set_cluster(ClusterSnapshot::default()).await;
    let summary = manager.run_cycle().await;
    assert_eq!(summary.skipped, 1);
    assert!(manager.get_result(&key).unwrap().is_empty());
}

#[tokio::test]
async fn test_garbage_collection_removes_orphaned_checkpoints() {
    let fixture = web_fixture().await;
    let manager = manager(
        &fixture,
        ManagerConfig {
            checkpoint_grace_period: Duration::from_secs(3600),
            ..Default::default()
        },
    );
    assert!(manager.try_start().await);

    let spec = spec(&[ResourceName::Cpu]);
    let live = web_key(&spec, HierarchyLevel::Container);
    manager.register(live.clone(), spec.clone()).await.unwrap();
    manager.run_cycle().await;

    let stale = web_key(&spec, HierarchyLevel::Pod);
    let recent = ProfileKey::new(
        TargetRef::Workload(WorkloadRef::new("StatefulSet", "default", "db")),
        HierarchyLevel::Container,
        &spec,
    );
    for (key, saved_at) in [
        (stale.clone(), Utc::now() - chrono::Duration::hours(2)),
        (recent.clone(), Utc::now()),
    ] {
        fixture
            .checkpoints
            .save(&ProfileCheckpoint {
                key,
                saved_at,
                entries: BTreeMap::new(),
            })
            .await
            .unwrap();
    }

    assert_eq!(manager.collect_garbage().await, 1);
    assert!(fixture.checkpoints.load(&stale).await.unwrap().is_none());
    assert!(fixture.checkpoints.load(&recent).await.unwrap().is_some());
    assert!(fixture.checkpoints.load(&live).await.unwrap().is_some());
}

#[tokio::test]
async fn test_snapshot_lists_owners() {
    let fixture = web_fixture().await;
    let manager = started_manager(&fixture).await;
    let mut spec = spec(&[ResourceName::Cpu]);
    spec.owner = Some(OwnerRef {
        namespace: "default".to_string(),
        name: "web-recommendation".to_string(),
    });
    let key = web_key(&spec, HierarchyLevel::Container);
    manager.register(key.clone(), spec).await.unwrap();
    manager.run_cycle().await;

    let statuses = manager.snapshot().await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].key, key);
    assert_eq!(
        statuses[0].owner.as_ref().map(|o| o.name.as_str()),
        Some("web-recommendation")
    );
    assert!(statuses[0].result.contains_key("app"));
}

#[tokio::test]
async fn test_run_loop_starts_and_profiles() {
    let fixture = web_fixture().await;
    let manager = Arc::new(manager(
        &fixture,
        ManagerConfig {
            profile_interval: Duration::from_millis(20),
            ..Default::default()
        },
    ));
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = manager.start(&shutdown_tx);

    for _ in 0..50 {
        if manager.started() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(manager.started());

    let spec = spec(&[ResourceName::Cpu]);
    let key = web_key(&spec, HierarchyLevel::Container);
    manager.register(key.clone(), spec).await.unwrap();
    for _ in 0..50 {
        if !manager.get_result(&key).unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!manager.get_result(&key).unwrap().is_empty());

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}
