//! In-process store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use drover_id::{CommandId, TaskGroupId, TransactionId};
use tokio::sync::RwLock;

use super::{Store, StoreError, StoreResult};
use crate::model::{AgentLedger, Application, Command, Deployment, TaskGroup, Transaction, Version};

type AppKey = (String, String);

fn app_key(namespace: &str, name: &str) -> AppKey {
    (namespace.to_string(), name.to_string())
}

#[derive(Debug, Default)]
struct Tables {
    applications: BTreeMap<AppKey, Application>,
    /// Per application, keyed by version id.
    versions: BTreeMap<AppKey, BTreeMap<String, Version>>,
    /// Per application, keyed by full pod id.
    task_groups: BTreeMap<AppKey, BTreeMap<String, TaskGroup>>,
    transactions: BTreeMap<TransactionId, Transaction>,
    deployments: BTreeMap<AppKey, Deployment>,
    commands: HashMap<CommandId, Command>,
    ledgers: BTreeMap<String, AgentLedger>,
    framework_id: Option<String>,
}

/// Store that keeps everything in memory. State is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_task_group_deletes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every task group delete fail with a backend error.
    pub fn set_fail_task_group_deletes(&self, fail: bool) {
        self.fail_task_group_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_application(&self, app: &Application) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let key = app_key(&app.namespace, &app.name);
        if tables.applications.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: "application",
                key: app.key(),
            });
        }
        tables.applications.insert(key, app.clone());
        Ok(())
    }

    async fn get_application(&self, namespace: &str, name: &str) -> StoreResult<Option<Application>> {
        let tables = self.tables.read().await;
        Ok(tables.applications.get(&app_key(namespace, name)).cloned())
    }

    async fn update_application(&self, app: &Application) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        match tables.applications.get_mut(&app_key(&app.namespace, &app.name)) {
            Some(slot) => {
                *slot = app.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("application", app.key())),
        }
    }

    async fn delete_application(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let key = app_key(namespace, name);
        tables.task_groups.remove(&key);
        if tables.applications.remove(&key).is_none() {
            return Err(StoreError::not_found("application", format!("{namespace}.{name}")));
        }
        Ok(())
    }

    async fn list_applications(&self) -> StoreResult<Vec<Application>> {
        let tables = self.tables.read().await;
        Ok(tables.applications.values().cloned().collect())
    }

    async fn put_version(&self, version: &Version) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .versions
            .entry(app_key(&version.namespace, &version.name))
            .or_default()
            .insert(version.id.clone(), version.clone());
        Ok(())
    }

    async fn get_version(&self, namespace: &str, name: &str, id: &str) -> StoreResult<Option<Version>> {
        let tables = self.tables.read().await;
        Ok(tables
            .versions
            .get(&app_key(namespace, name))
            .and_then(|v| v.get(id))
            .cloned())
    }

    async fn list_versions(&self, namespace: &str, name: &str) -> StoreResult<Vec<Version>> {
        let tables = self.tables.read().await;
        let mut versions: Vec<Version> = tables
            .versions
            .get(&app_key(namespace, name))
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default();
        versions.sort_by_key(|v| v.created_at);
        Ok(versions)
    }

    async fn delete_versions(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.versions.remove(&app_key(namespace, name));
        Ok(())
    }

    async fn put_task_group(&self, group: &TaskGroup) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .task_groups
            .entry(app_key(group.id.namespace(), group.id.app()))
            .or_default()
            .insert(group.id.to_string(), group.clone());
        Ok(())
    }

    async fn get_task_group(&self, id: &TaskGroupId) -> StoreResult<Option<TaskGroup>> {
        let tables = self.tables.read().await;
        Ok(tables
            .task_groups
            .get(&app_key(id.namespace(), id.app()))
            .and_then(|groups| groups.get(&id.to_string()))
            .cloned())
    }

    async fn list_task_groups(&self, namespace: &str, name: &str) -> StoreResult<Vec<TaskGroup>> {
        let tables = self.tables.read().await;
        let mut groups: Vec<TaskGroup> = tables
            .task_groups
            .get(&app_key(namespace, name))
            .map(|g| g.values().cloned().collect())
            .unwrap_or_default();
        groups.sort_by_key(|g| (g.index(), g.id.stamp()));
        Ok(groups)
    }

    async fn delete_task_group(&self, id: &TaskGroupId) -> StoreResult<()> {
        if self.fail_task_group_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("delete of {id} refused")));
        }
        let mut tables = self.tables.write().await;
        let removed = tables
            .task_groups
            .get_mut(&app_key(id.namespace(), id.app()))
            .and_then(|groups| groups.remove(&id.to_string()));
        match removed {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found("task group", id.to_string())),
        }
    }

    async fn put_transaction(&self, txn: &Transaction) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.transactions.insert(txn.id, txn.clone());
        Ok(())
    }

    async fn get_transaction(&self, id: &TransactionId) -> StoreResult<Option<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables.transactions.get(id).cloned())
    }

    async fn list_transactions(&self) -> StoreResult<Vec<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables.transactions.values().cloned().collect())
    }

    async fn delete_transaction(&self, id: &TransactionId) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.transactions.remove(id);
        Ok(())
    }

    async fn put_deployment(&self, deployment: &Deployment) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.deployments.insert(
            app_key(&deployment.namespace, &deployment.name),
            deployment.clone(),
        );
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> StoreResult<Option<Deployment>> {
        let tables = self.tables.read().await;
        Ok(tables.deployments.get(&app_key(namespace, name)).cloned())
    }

    async fn list_deployments(&self) -> StoreResult<Vec<Deployment>> {
        let tables = self.tables.read().await;
        Ok(tables.deployments.values().cloned().collect())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.deployments.remove(&app_key(namespace, name));
        Ok(())
    }

    async fn put_command(&self, command: &Command) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.commands.insert(command.id, command.clone());
        Ok(())
    }

    async fn get_command(&self, id: &CommandId) -> StoreResult<Option<Command>> {
        let tables = self.tables.read().await;
        Ok(tables.commands.get(id).cloned())
    }

    async fn get_ledger(&self, agent_id: &str) -> StoreResult<Option<AgentLedger>> {
        let tables = self.tables.read().await;
        Ok(tables.ledgers.get(agent_id).cloned())
    }

    async fn put_ledger(&self, ledger: &AgentLedger) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if ledger.grants.is_empty() {
            tables.ledgers.remove(&ledger.agent_id);
        } else {
            tables.ledgers.insert(ledger.agent_id.clone(), ledger.clone());
        }
        Ok(())
    }

    async fn list_ledgers(&self) -> StoreResult<Vec<AgentLedger>> {
        let tables = self.tables.read().await;
        Ok(tables.ledgers.values().cloned().collect())
    }

    async fn save_framework_id(&self, id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.framework_id = Some(id.to_string());
        Ok(())
    }

    async fn framework_id(&self) -> StoreResult<Option<String>> {
        let tables = self.tables.read().await;
        Ok(tables.framework_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::{AppStatus, Resource, WorkloadKind};

    fn app(name: &str) -> Application {
        Application::new("prod", name, "c1", WorkloadKind::Application, 2, "v1", Utc::now())
    }

    #[tokio::test]
    async fn test_application_crud() {
        let store = MemoryStore::new();
        store.create_application(&app("web")).await.unwrap();

        let err = store.create_application(&app("web")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        let mut loaded = store.get_application("prod", "web").await.unwrap().unwrap();
        loaded.set_status(AppStatus::Running, Utc::now());
        store.update_application(&loaded).await.unwrap();
        assert_eq!(
            store.get_application("prod", "web").await.unwrap().unwrap().status,
            AppStatus::Running
        );

        store.delete_application("prod", "web").await.unwrap();
        assert!(store.get_application("prod", "web").await.unwrap().is_none());
        assert!(store.update_application(&loaded).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_empty_ledger_is_dropped() {
        let store = MemoryStore::new();
        let mut ledger = AgentLedger::new("agent-1");
        ledger.commit("0.web.prod.c1.1", Resource::new(1.0, 0.0, 0.0));
        store.put_ledger(&ledger).await.unwrap();
        assert_eq!(store.list_ledgers().await.unwrap().len(), 1);

        ledger.release("0.web.prod.c1.1");
        store.put_ledger(&ledger).await.unwrap();
        assert!(store.get_ledger("agent-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_framework_id_round_trip() {
        let store = MemoryStore::new();
        assert!(store.framework_id().await.unwrap().is_none());
        store.save_framework_id("fw-1").await.unwrap();
        assert_eq!(store.framework_id().await.unwrap().as_deref(), Some("fw-1"));
    }
}
