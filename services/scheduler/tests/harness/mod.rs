//! Shared fixtures for scheduler integration tests.
//!
//! Builds a full [`Scheduler`] over the in-memory store, the mock driver and a
//! manual clock. Leadership is never granted, so every control loop stays
//! closed and tests step transactions and the deployment controller by hand.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use drover_id::TransactionId;
use drover_scheduler::clock::{ManualClock, SharedClock};
use drover_scheduler::config::Config;
use drover_scheduler::driver::{MockDriver, StatusUpdate};
use drover_scheduler::model::{
    Application, Container, Offer, PortMapping, PortRange, Resource, RestartPolicy, TaskGroup, TaskStatus,
    Transaction, Version, WorkloadKind,
};
use drover_scheduler::notify::{Notifier, RecordingSink};
use drover_scheduler::store::MemoryStore;
use drover_scheduler::{Context, Scheduler};

pub const NAMESPACE: &str = "prod";

pub struct TestCluster {
    pub scheduler: Arc<Scheduler>,
    pub driver: Arc<MockDriver>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<RecordingSink>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::at_epoch());
        let driver = Arc::new(MockDriver::new());
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(MemoryStore::new());

        let shared: SharedClock = clock.clone();
        let notifier = Notifier::new(sink.clone(), sink.clone(), shared.clone());
        let ctx = Context::new(config, store.clone(), driver.clone(), notifier, shared);

        Self {
            scheduler: Scheduler::new(ctx),
            driver,
            store,
            clock,
            sink,
        }
    }

    pub fn ctx(&self) -> &Context {
        self.scheduler.context()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    // =========================================================================
    // Offers
    // =========================================================================

    pub fn offer(&self, host: &str) -> Offer {
        self.sized_offer(host, 4.0, 8192.0)
    }

    pub fn sized_offer(&self, host: &str, cpus: f64, mem: f64) -> Offer {
        Offer {
            id: format!("offer-{host}-{}", ulid::Ulid::new()),
            pool_id: 0,
            agent_id: format!("agent-{host}"),
            hostname: host.to_string(),
            agent_ip: Some("10.0.0.1".to_string()),
            attributes: BTreeMap::from([("rack".to_string(), "r1".to_string())]),
            resources: Resource::new(cpus, mem, 10_000.0),
            ports: vec![PortRange::new(31000, 31009)],
            received_at: self.clock_now(),
            delta: Resource::default(),
        }
    }

    /// One fresh offer per host.
    pub fn add_offers(&self, hosts: &[&str]) {
        let offers = hosts.iter().map(|h| self.offer(h)).collect();
        self.ctx().offers.add_offers(offers);
    }

    fn clock_now(&self) -> chrono::DateTime<chrono::Utc> {
        self.ctx().now()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// One engine step. `None` once the transaction was finalized earlier.
    pub async fn step(&self, id: &TransactionId) -> Option<Transaction> {
        self.scheduler.engine().run_once(id).await.unwrap()
    }

    /// Steps until the transaction ends or `max` steps ran. Returns its last state.
    pub async fn drive(&self, id: &TransactionId, max: usize) -> Transaction {
        let mut last = None;
        for _ in 0..max {
            match self.step(id).await {
                Some(txn) if txn.is_terminal() => return txn,
                Some(txn) => last = Some(txn),
                None => break,
            }
        }
        last.expect("transaction never ran")
    }

    /// Steps every stored transaction once.
    pub async fn step_all(&self) {
        let txns = self.ctx().store.list_transactions().await.unwrap();
        for txn in txns {
            self.step(&txn.id).await;
        }
    }

    pub async fn live_transactions(&self) -> Vec<Transaction> {
        self.ctx()
            .store
            .list_transactions()
            .await
            .unwrap()
            .into_iter()
            .filter(|t| !t.is_terminal())
            .collect()
    }

    // =========================================================================
    // Status reports
    // =========================================================================

    pub fn update(&self, task_id: &str, state: TaskStatus) -> StatusUpdate {
        StatusUpdate {
            task_id: task_id.to_string(),
            state,
            agent_id: None,
            healthy: None,
            message: None,
            reason: None,
            uuid: None,
            timestamp: self.clock_now(),
            raw: serde_json::json!({ "state": format!("{state:?}") }),
        }
    }

    /// Reports every task of a pod in `state`.
    pub async fn report(&self, group: &TaskGroup, state: TaskStatus) {
        for task in &group.tasks {
            let update = self.update(&task.id.to_string(), state);
            self.scheduler.pipeline().handle_update(&update).await.unwrap();
        }
    }

    /// Reports every attached pod of an application RUNNING.
    pub async fn run_all(&self, name: &str) {
        for group in self.groups(name).await {
            if group.status != drover_scheduler::model::TaskGroupStatus::Running && !group.status.is_end() {
                self.report(&group, TaskStatus::Running).await;
            }
        }
    }

    /// Reports KILLED for every pod a kill was requested for.
    pub async fn confirm_kills(&self, name: &str) {
        let groups = self.ctx().store.list_task_groups(NAMESPACE, name).await.unwrap();
        for group in groups {
            if group.kill_requested_at.is_some() && !group.is_drained() {
                self.report(&group, TaskStatus::Killed).await;
            }
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    pub async fn app(&self, name: &str) -> Application {
        self.ctx()
            .store
            .get_application(NAMESPACE, name)
            .await
            .unwrap()
            .expect("application exists")
    }

    pub async fn find_app(&self, name: &str) -> Option<Application> {
        self.ctx().store.get_application(NAMESPACE, name).await.unwrap()
    }

    /// Pods attached to the application, ordered by index.
    pub async fn groups(&self, name: &str) -> Vec<TaskGroup> {
        let Some(app) = self.find_app(name).await else {
            return Vec::new();
        };
        let mut groups = Vec::new();
        for id in app.task_groups.values() {
            if let Some(group) = self.ctx().store.get_task_group(id).await.unwrap() {
                groups.push(group);
            }
        }
        groups
    }

    /// Creates an application and drives its launch until every pod runs.
    pub async fn launch_running(&self, version: Version) -> Application {
        let name = version.name.clone();
        let hosts: Vec<String> = (0..version.instances).map(|i| format!("{name}-h{i}")).collect();
        let hosts: Vec<&str> = hosts.iter().map(String::as_str).collect();
        self.add_offers(&hosts);

        let txn_id = self.scheduler.transactions().create_application(version).await.unwrap();
        self.step(&txn_id).await;
        self.run_all(&name).await;
        let txn = self.drive(&txn_id, 5).await;
        assert!(txn.is_terminal(), "launch did not end: {:?}", txn.status);
        self.app(&name).await
    }
}

/// A single-container version needing 1 cpu and 512 MiB.
pub fn version(name: &str, instances: u32) -> Version {
    Version {
        id: format!("{name}-v1"),
        namespace: NAMESPACE.to_string(),
        name: name.to_string(),
        kind: WorkloadKind::Application,
        instances,
        containers: vec![Container {
            name: "main".to_string(),
            image: "registry.local/web:1".to_string(),
            command: None,
            args: vec![],
            resources: Resource::new(1.0, 512.0, 0.0),
            env: BTreeMap::new(),
            ports: vec![PortMapping {
                name: "http".to_string(),
                container_port: 8080,
                protocol: "tcp".to_string(),
                host_port: None,
            }],
            health_check: None,
            config_maps: vec![],
            secrets: vec![],
        }],
        constraints: vec![],
        restart_policy: RestartPolicy::default(),
        kill_policy: Default::default(),
        env: BTreeMap::new(),
        labels: BTreeMap::new(),
        created_at: chrono::DateTime::<chrono::Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
    }
}
