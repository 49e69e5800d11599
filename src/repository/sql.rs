use super::unrestricted::UnrestrictedCache;
use super::{PermissionsRepository, RepositoryError, UNRESTRICTED_USERNAME};
use crate::model::{ResourceFactoryRegistry, ResourceType, UserPermission};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::Utc;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, QueryResult, Statement,
    TransactionTrait, Value,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Permission rows reference resources by `(type, name)`; bodies are
/// stored once and deduplicated by content hash, so writing a thousand
/// users over the same account fleet touches each resource row once.
pub struct SqlPermissionsRepository {
    db: DatabaseConnection,
    registry: Arc<ResourceFactoryRegistry>,
    unrestricted: UnrestrictedCache,
    write_attempts: u32,
    write_backoff: Duration,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn body_hash(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

impl SqlPermissionsRepository {
    pub fn new(
        db: DatabaseConnection,
        registry: Arc<ResourceFactoryRegistry>,
        cache_ttl: Duration,
    ) -> Self {
        SqlPermissionsRepository {
            db,
            registry,
            unrestricted: UnrestrictedCache::new(cache_ttl),
            write_attempts: 3,
            write_backoff: Duration::from_millis(250),
        }
    }

    fn stmt(&self, sql: &str, values: Vec<Value>) -> Statement {
        Statement::from_sql_and_values(self.db.get_database_backend(), sql, values)
    }

    /// Read-path retry: longer than the write policy, never transactional.
    async fn query_all_retry(&self, stmt: Statement) -> Result<Vec<QueryResult>, RepositoryError> {
        let policy = read_retry_policy();
        backoff::future::retry(policy, || async {
            self.db
                .query_all(stmt.clone())
                .await
                .map_err(|e| backoff::Error::transient(RepositoryError::Db(e)))
        })
        .await
    }

    async fn query_one_retry(
        &self,
        stmt: Statement,
    ) -> Result<Option<QueryResult>, RepositoryError> {
        let policy = read_retry_policy();
        backoff::future::retry(policy, || async {
            self.db
                .query_one(stmt.clone())
                .await
                .map_err(|e| backoff::Error::transient(RepositoryError::Db(e)))
        })
        .await
    }

    async fn put_in_txn(
        &self,
        txn: &DatabaseTransaction,
        permission: &UserPermission,
    ) -> Result<(), RepositoryError> {
        let backend = txn.get_database_backend();
        let now = now_millis();

        // 1. Upsert resource bodies, skipping unchanged hashes.
        let mut incoming: BTreeSet<(String, String)> = BTreeSet::new();
        for resource in permission.all_resources() {
            let body = resource.to_body_json()?;
            let hash = body_hash(&body);
            let resource_type = resource.resource_type().name().to_string();
            let resource_name = resource.name().to_string();
            incoming.insert((resource_type.clone(), resource_name.clone()));

            let stored: Option<String> = txn
                .query_one(Statement::from_sql_and_values(
                    backend,
                    "SELECT body_hash FROM resources WHERE resource_type = ? AND resource_name = ?",
                    [resource_type.clone().into(), resource_name.clone().into()],
                ))
                .await?
                .and_then(|row| row.try_get::<Option<String>>("", "body_hash").ok())
                .flatten();
            if stored.as_deref() == Some(hash.as_str()) {
                continue;
            }

            txn.execute(Statement::from_sql_and_values(
                backend,
                r#"INSERT INTO resources (resource_type, resource_name, body, body_hash, updated_at)
                   VALUES (?, ?, ?, ?, ?)
                   ON CONFLICT(resource_type, resource_name) DO UPDATE
                   SET body = excluded.body, body_hash = excluded.body_hash, updated_at = excluded.updated_at"#,
                [
                    resource_type.into(),
                    resource_name.into(),
                    body.into(),
                    hash.into(),
                    now.into(),
                ],
            ))
            .await?;
        }

        // 2. Replace the user's permission rows by delta.
        let existing: BTreeSet<(String, String)> = txn
            .query_all(Statement::from_sql_and_values(
                backend,
                "SELECT resource_type, resource_name FROM permissions WHERE user_id = ?",
                [permission.id.clone().into()],
            ))
            .await?
            .iter()
            .filter_map(|row| {
                let resource_type: String = row.try_get("", "resource_type").ok()?;
                let resource_name: String = row.try_get("", "resource_name").ok()?;
                Some((resource_type, resource_name))
            })
            .collect();

        let to_insert: Vec<&(String, String)> = incoming.difference(&existing).collect();
        let to_delete: Vec<&(String, String)> = existing.difference(&incoming).collect();

        for chunk in to_insert.chunks(200) {
            let rows = vec!["(?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO permissions (user_id, resource_type, resource_name) VALUES {rows}"
            );
            let mut values: Vec<Value> = Vec::with_capacity(chunk.len() * 3);
            for (resource_type, resource_name) in chunk {
                values.push(permission.id.clone().into());
                values.push(resource_type.clone().into());
                values.push(resource_name.clone().into());
            }
            txn.execute(Statement::from_sql_and_values(backend, sql, values))
                .await?;
        }

        let mut deletes_by_type: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (resource_type, resource_name) in &to_delete {
            deletes_by_type
                .entry(resource_type.as_str())
                .or_default()
                .push(resource_name.as_str());
        }
        for (resource_type, names) in deletes_by_type {
            let sql = format!(
                "DELETE FROM permissions WHERE user_id = ? AND resource_type = ? AND resource_name IN ({})",
                placeholders(names.len())
            );
            let mut values: Vec<Value> = vec![
                permission.id.clone().into(),
                resource_type.to_string().into(),
            ];
            values.extend(names.iter().map(|n| Value::from(n.to_string())));
            txn.execute(Statement::from_sql_and_values(backend, sql, values))
                .await?;
        }

        // 3. Bump the user row last; its updated_at keys the unrestricted
        // cache.
        txn.execute(Statement::from_sql_and_values(
            backend,
            r#"INSERT INTO users (id, admin, updated_at) VALUES (?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET admin = excluded.admin, updated_at = excluded.updated_at"#,
            [
                permission.id.clone().into(),
                (permission.admin as i64).into(),
                now.into(),
            ],
        ))
        .await?;

        Ok(())
    }

    async fn load_record(
        &self,
        id: &str,
        admin: bool,
    ) -> Result<UserPermission, RepositoryError> {
        let rows = self
            .query_all_retry(self.stmt(
                r#"SELECT r.resource_type, r.resource_name, r.body
                   FROM resources r
                   JOIN permissions p
                     ON p.resource_type = r.resource_type AND p.resource_name = r.resource_name
                   WHERE p.user_id = ?"#,
                vec![id.to_string().into()],
            ))
            .await?;

        let mut permission = UserPermission::new(id);
        permission.admin = admin;
        for row in rows {
            let resource_type: String = row.try_get("", "resource_type")?;
            let resource_name: String = row.try_get("", "resource_name")?;
            let body: String = row.try_get("", "body")?;
            let parsed = self.parse_body(&resource_type, &resource_name, &body)?;
            permission.add_resource(parsed);
        }
        Ok(permission)
    }

    fn parse_body(
        &self,
        resource_type: &str,
        resource_name: &str,
        body: &str,
    ) -> Result<crate::model::Resource, RepositoryError> {
        let resource_type = ResourceType::parse(resource_type)
            .ok_or_else(|| RepositoryError::Body(format!("bad type tag `{resource_type}`")))?;
        self.registry
            .parse(&resource_type, resource_name, body)
            .map_err(|e| RepositoryError::Body(e.to_string()))
    }

    async fn unrestricted_cached(&self) -> Result<Arc<UserPermission>, RepositoryError> {
        let key = self
            .query_one_retry(self.stmt(
                "SELECT updated_at FROM users WHERE id = ?",
                vec![UNRESTRICTED_USERNAME.into()],
            ))
            .await?
            .and_then(|row| row.try_get::<i64>("", "updated_at").ok())
            .unwrap_or(0);

        self.unrestricted
            .get(key.to_string(), || async {
                self.load_record(UNRESTRICTED_USERNAME, false).await
            })
            .await
    }

    async fn user_rows(&self) -> Result<HashMap<String, bool>, RepositoryError> {
        Ok(self
            .query_all_retry(self.stmt("SELECT id, admin FROM users", vec![]))
            .await?
            .iter()
            .filter_map(|row| {
                let id: String = row.try_get("", "id").ok()?;
                let admin: i64 = row.try_get("", "admin").unwrap_or(0);
                Some((id, admin != 0))
            })
            .collect())
    }
}

fn read_retry_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(1),
        max_elapsed_time: Some(Duration::from_secs(5)),
        ..ExponentialBackoff::default()
    }
}

#[async_trait]
impl PermissionsRepository for SqlPermissionsRepository {
    async fn put(&self, permission: &UserPermission) -> Result<(), RepositoryError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let txn = self.db.begin().await?;
            let outcome = self.put_in_txn(&txn, permission).await;
            let outcome = match outcome {
                Ok(()) => txn.commit().await.map_err(RepositoryError::Db),
                Err(err) => {
                    let _ = txn.rollback().await;
                    Err(err)
                }
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let transient = matches!(err, RepositoryError::Db(_));
                    if !transient || attempt >= self.write_attempts {
                        return Err(err);
                    }
                    warn!(
                        user = %permission.id,
                        attempt,
                        error = %err,
                        "permission write failed; retrying"
                    );
                    tokio::time::sleep(self.write_backoff).await;
                }
            }
        }
    }

    async fn put_all(
        &self,
        permissions: HashMap<String, UserPermission>,
    ) -> Result<(), RepositoryError> {
        for permission in permissions.values() {
            self.put(permission).await?;
        }

        // Orphan pruning runs only after every upsert succeeded.
        let mut survivors: Vec<String> = permissions.keys().cloned().collect();
        if !survivors.iter().any(|id| id == UNRESTRICTED_USERNAME) {
            survivors.push(UNRESTRICTED_USERNAME.to_string());
        }
        let marks = placeholders(survivors.len());
        let values: Vec<Value> = survivors.iter().map(|id| Value::from(id.clone())).collect();

        let txn = self.db.begin().await?;
        txn.execute(Statement::from_sql_and_values(
            txn.get_database_backend(),
            format!("DELETE FROM permissions WHERE user_id NOT IN ({marks})"),
            values.clone(),
        ))
        .await?;
        txn.execute(Statement::from_sql_and_values(
            txn.get_database_backend(),
            format!("DELETE FROM users WHERE id NOT IN ({marks})"),
            values,
        ))
        .await?;
        // Resources no surviving permission row references are dead weight
        txn.execute(Statement::from_string(
            txn.get_database_backend(),
            r#"DELETE FROM resources WHERE NOT EXISTS (
                   SELECT 1 FROM permissions p
                   WHERE p.resource_type = resources.resource_type
                     AND p.resource_name = resources.resource_name)"#,
        ))
        .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UserPermission>, RepositoryError> {
        if id.eq_ignore_ascii_case(UNRESTRICTED_USERNAME) {
            return Ok(Some(self.unrestricted_cached().await?.as_ref().clone()));
        }

        let user_row = self
            .query_one_retry(self.stmt(
                "SELECT admin FROM users WHERE id = ?",
                vec![id.to_string().into()],
            ))
            .await?;
        let Some(row) = user_row else {
            return Ok(None);
        };
        let admin: i64 = row.try_get("", "admin").unwrap_or(0);

        let mut permission = self.load_record(id, admin != 0).await?;
        permission.merge(self.unrestricted_cached().await?.as_ref());
        Ok(Some(permission))
    }

    async fn get_all_by_id(&self) -> Result<HashMap<String, UserPermission>, RepositoryError> {
        let users = self.user_rows().await?;
        if users.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = self
            .query_all_retry(self.stmt(
                r#"SELECT p.user_id, r.resource_type, r.resource_name, r.body
                   FROM permissions p
                   JOIN resources r
                     ON r.resource_type = p.resource_type AND r.resource_name = p.resource_name"#,
                vec![],
            ))
            .await?;

        let mut records: HashMap<String, UserPermission> = users
            .iter()
            .map(|(id, admin)| {
                let mut permission = UserPermission::new(id);
                permission.admin = *admin;
                (id.clone(), permission)
            })
            .collect();
        for row in rows {
            let user_id: String = row.try_get("", "user_id")?;
            let resource_type: String = row.try_get("", "resource_type")?;
            let resource_name: String = row.try_get("", "resource_name")?;
            let body: String = row.try_get("", "body")?;
            if let Some(permission) = records.get_mut(&user_id) {
                permission.add_resource(self.parse_body(&resource_type, &resource_name, &body)?);
            }
        }

        let unrestricted = records.get(UNRESTRICTED_USERNAME).cloned();
        if let Some(unrestricted) = unrestricted {
            for (id, permission) in records.iter_mut() {
                if id != UNRESTRICTED_USERNAME {
                    permission.merge(&unrestricted);
                }
            }
        }
        Ok(records)
    }

    async fn get_all_by_roles(
        &self,
        any_roles: Option<&[String]>,
    ) -> Result<HashMap<String, UserPermission>, RepositoryError> {
        let roles = match any_roles {
            None => return self.get_all_by_id().await,
            Some(roles) => roles,
        };

        let unrestricted = self.unrestricted_cached().await?.as_ref().clone();
        let mut result = HashMap::new();
        result.insert(UNRESTRICTED_USERNAME.to_string(), unrestricted.clone());
        if roles.is_empty() {
            return Ok(result);
        }

        let wanted: Vec<String> = roles.iter().map(|r| r.to_lowercase()).collect();
        let marks = placeholders(wanted.len());
        let holder_filter = format!(
            "SELECT DISTINCT user_id FROM permissions WHERE resource_type = 'ROLE' AND lower(resource_name) IN ({marks})"
        );
        let role_values: Vec<Value> = wanted.iter().map(|r| Value::from(r.clone())).collect();

        // Statement 1: every distinct resource body reachable from the
        // holder set.
        let body_rows = self
            .query_all_retry(self.stmt(
                &format!(
                    r#"SELECT DISTINCT r.resource_type, r.resource_name, r.body
                       FROM resources r
                       JOIN permissions p
                         ON p.resource_type = r.resource_type AND p.resource_name = r.resource_name
                       WHERE p.user_id IN ({holder_filter})"#
                ),
                role_values.clone(),
            ))
            .await?;
        let mut bodies: HashMap<(String, String), crate::model::Resource> = HashMap::new();
        for row in body_rows {
            let resource_type: String = row.try_get("", "resource_type")?;
            let resource_name: String = row.try_get("", "resource_name")?;
            let body: String = row.try_get("", "body")?;
            let parsed = self.parse_body(&resource_type, &resource_name, &body)?;
            bodies.insert((resource_type, resource_name), parsed);
        }

        // Statement 2: the holder users and their permission keys.
        let permission_rows = self
            .query_all_retry(self.stmt(
                &format!(
                    r#"SELECT p.user_id, p.resource_type, p.resource_name, u.admin
                       FROM permissions p
                       JOIN users u ON u.id = p.user_id
                       WHERE p.user_id IN ({holder_filter})"#
                ),
                role_values,
            ))
            .await?;
        for row in permission_rows {
            let user_id: String = row.try_get("", "user_id")?;
            let resource_type: String = row.try_get("", "resource_type")?;
            let resource_name: String = row.try_get("", "resource_name")?;
            let admin: i64 = row.try_get("", "admin").unwrap_or(0);
            let record = result.entry(user_id.clone()).or_insert_with(|| {
                let mut permission = UserPermission::new(&user_id);
                permission.admin = admin != 0;
                permission.merge(&unrestricted);
                permission
            });
            if let Some(resource) = bodies.get(&(resource_type, resource_name)) {
                record.add_resource(resource.clone());
            }
        }
        Ok(result)
    }

    async fn remove(&self, id: &str) -> Result<(), RepositoryError> {
        let txn = self.db.begin().await?;
        txn.execute(Statement::from_sql_and_values(
            txn.get_database_backend(),
            "DELETE FROM permissions WHERE user_id = ?",
            [id.to_string().into()],
        ))
        .await?;
        txn.execute(Statement::from_sql_and_values(
            txn.get_database_backend(),
            "DELETE FROM users WHERE id = ?",
            [id.to_string().into()],
        ))
        .await?;
        txn.commit().await?;
        Ok(())
    }
}
