use super::unrestricted::UnrestrictedCache;
use super::{PermissionsRepository, RepositoryError, TimeoutContext, UNRESTRICTED_USERNAME};
use crate::model::{ResourceFactoryRegistry, ResourceType, UserPermission};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct KvError(pub String);

impl From<KvError> for RepositoryError {
    fn from(err: KvError) -> Self {
        RepositoryError::Kv(err.0)
    }
}

/// Typed interface over the remote key-value store. `replace_hash` must
/// swap the whole hash in one step (temp-key-and-rename on backends that
/// need it); scans are cursor-based so reads bound their peak memory.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn del(&self, key: &str) -> Result<(), KvError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError>;

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError>;

    /// One page of a set scan; a returned cursor of 0 ends the scan.
    async fn sscan(&self, key: &str, cursor: u64) -> Result<(u64, Vec<String>), KvError>;

    /// One page of a hash scan; a returned cursor of 0 ends the scan.
    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
    ) -> Result<(u64, Vec<(String, String)>), KvError>;

    /// Replace the hash at `key` with `entries`; empty entries delete it.
    async fn replace_hash(
        &self,
        key: &str,
        entries: HashMap<String, String>,
    ) -> Result<(), KvError>;

    async fn server_time_millis(&self) -> Result<i64, KvError>;
}

const SCAN_PAGE: usize = 100;

enum KvValue {
    Str(String),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
}

/// The embedded deployment flavor: a process-local store with the same
/// contract as the remote one. Also the test double.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, KvValue>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        InMemoryKvStore::default()
    }
}

#[async_trait]
impl KvClient for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries.get(key).and_then(|v| match v.value() {
            KvValue::Str(s) => Some(s.clone()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.entries
            .insert(key.to_string(), KvValue::Str(value.to_string()));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| KvValue::Set(BTreeSet::new()));
        if let KvValue::Set(set) = entry.value_mut() {
            set.insert(member.to_string());
        }
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if let KvValue::Set(set) = entry.value_mut() {
                set.remove(member);
            }
        }
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError> {
        Ok(self
            .entries
            .get(key)
            .map(|v| match v.value() {
                KvValue::Set(set) => set.contains(member),
                _ => false,
            })
            .unwrap_or(false))
    }

    async fn sscan(&self, key: &str, cursor: u64) -> Result<(u64, Vec<String>), KvError> {
        let members: Vec<String> = self
            .entries
            .get(key)
            .map(|v| match v.value() {
                KvValue::Set(set) => set.iter().cloned().collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default();
        Ok(paginate(members, cursor))
    }

    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
    ) -> Result<(u64, Vec<(String, String)>), KvError> {
        let entries: Vec<(String, String)> = self
            .entries
            .get(key)
            .map(|v| match v.value() {
                KvValue::Hash(hash) => hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default();
        Ok(paginate(entries, cursor))
    }

    async fn replace_hash(
        &self,
        key: &str,
        entries: HashMap<String, String>,
    ) -> Result<(), KvError> {
        if entries.is_empty() {
            self.entries.remove(key);
        } else {
            self.entries.insert(
                key.to_string(),
                KvValue::Hash(entries.into_iter().collect()),
            );
        }
        Ok(())
    }

    async fn server_time_millis(&self) -> Result<i64, KvError> {
        Ok(Utc::now().timestamp_millis())
    }
}

fn paginate<T: Clone>(items: Vec<T>, cursor: u64) -> (u64, Vec<T>) {
    // The collection may have shrunk since the previous page
    let start = (cursor as usize).min(items.len());
    let end = (start + SCAN_PAGE).min(items.len());
    let page = items[start..end].to_vec();
    let next = if end >= items.len() { 0 } else { end as u64 };
    (next, page)
}

/// Key-value repository. Key layout (under the configured prefix):
/// `users` set of ids, `permissions:admin` set, per-user per-type hashes
/// `permissions:{id}:{suffix}` mapping resource name to body, role member
/// sets `roles:{name}`, and the unrestricted record's `last_modified`
/// stamp that keys the unrestricted cache.
pub struct KvPermissionsRepository {
    client: Arc<dyn KvClient>,
    prefix: String,
    registry: Arc<ResourceFactoryRegistry>,
    unrestricted: UnrestrictedCache,
    read_timeout: Duration,
}

impl KvPermissionsRepository {
    pub fn new(
        client: Arc<dyn KvClient>,
        prefix: &str,
        registry: Arc<ResourceFactoryRegistry>,
        cache_ttl: Duration,
        read_timeout: Duration,
    ) -> Self {
        KvPermissionsRepository {
            client,
            prefix: prefix.to_string(),
            registry,
            unrestricted: UnrestrictedCache::new(cache_ttl),
            read_timeout,
        }
    }

    fn users_key(&self) -> String {
        format!("{}:users", self.prefix)
    }

    fn admin_key(&self) -> String {
        format!("{}:permissions:admin", self.prefix)
    }

    fn user_key(&self, id: &str, resource_type: &ResourceType) -> String {
        format!(
            "{}:permissions:{}:{}",
            self.prefix,
            id,
            resource_type.key_suffix()
        )
    }

    fn role_key(&self, role: &str) -> String {
        format!("{}:roles:{}", self.prefix, role)
    }

    fn last_modified_key(&self) -> String {
        format!("{}:last_modified:{}", self.prefix, UNRESTRICTED_USERNAME)
    }

    // Read helpers. Each checks the deadline at entry and between scan
    // pages, so a slow backend cannot pin a request forever.

    async fn read_ismember(
        &self,
        key: &str,
        member: &str,
        ctx: &TimeoutContext,
    ) -> Result<bool, RepositoryError> {
        ctx.check()?;
        Ok(self.client.sismember(key, member).await?)
    }

    async fn read_set(
        &self,
        key: &str,
        ctx: &TimeoutContext,
    ) -> Result<BTreeSet<String>, RepositoryError> {
        ctx.check()?;
        let mut members = BTreeSet::new();
        let mut cursor = 0;
        loop {
            let (next, page) = self.client.sscan(key, cursor).await?;
            members.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
            ctx.check()?;
        }
        Ok(members)
    }

    async fn read_hash(
        &self,
        key: &str,
        ctx: &TimeoutContext,
    ) -> Result<BTreeMap<String, String>, RepositoryError> {
        ctx.check()?;
        let mut entries = BTreeMap::new();
        let mut cursor = 0;
        loop {
            let (next, page) = self.client.hscan(key, cursor).await?;
            entries.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
            ctx.check()?;
        }
        Ok(entries)
    }

    async fn get_from_kv(
        &self,
        id: &str,
        ctx: &TimeoutContext,
    ) -> Result<Option<UserPermission>, RepositoryError> {
        let unrestricted = id.eq_ignore_ascii_case(UNRESTRICTED_USERNAME);
        let exists =
            unrestricted || self.read_ismember(&self.users_key(), id, ctx).await?;
        if !exists {
            return Ok(None);
        }

        let mut permission = UserPermission::new(id);
        for resource_type in self.registry.types() {
            let entries = self
                .read_hash(&self.user_key(id, &resource_type), ctx)
                .await?;
            for (name, body) in entries {
                let resource = self
                    .registry
                    .parse(&resource_type, &name, &body)
                    .map_err(|e| RepositoryError::Body(e.to_string()))?;
                permission.add_resource(resource);
            }
        }
        if !unrestricted {
            permission.admin = self.read_ismember(&self.admin_key(), id, ctx).await?;
        }
        Ok(Some(permission))
    }

    async fn unrestricted_cached(&self) -> Result<Arc<UserPermission>, RepositoryError> {
        let ctx = TimeoutContext::new("kv check last_modified", self.read_timeout);
        ctx.check()?;
        let key = self
            .client
            .get(&self.last_modified_key())
            .await?
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "0".to_string());

        self.unrestricted
            .get(key, || async {
                let ctx = TimeoutContext::new("kv load unrestricted", self.read_timeout);
                Ok(self
                    .get_from_kv(UNRESTRICTED_USERNAME, &ctx)
                    .await?
                    .unwrap_or_else(|| UserPermission::new(UNRESTRICTED_USERNAME)))
            })
            .await
    }
}

#[async_trait]
impl PermissionsRepository for KvPermissionsRepository {
    async fn put(&self, permission: &UserPermission) -> Result<(), RepositoryError> {
        let id = permission.id.to_lowercase();

        // Serialize each owned resource per type.
        let mut by_type: HashMap<ResourceType, HashMap<String, String>> = HashMap::new();
        for resource in permission.all_resources() {
            by_type
                .entry(resource.resource_type())
                .or_default()
                .insert(resource.name().to_string(), resource.to_body_json()?);
        }

        // Role membership delta against the stored role hash.
        let role_hash_key = self.user_key(&id, &ResourceType::role());
        let mut existing_roles = BTreeSet::new();
        let mut cursor = 0;
        loop {
            let (next, page) = self.client.hscan(&role_hash_key, cursor).await?;
            existing_roles.extend(page.into_iter().map(|(name, _)| name));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        let current_roles: BTreeSet<String> =
            permission.roles.iter().map(|r| r.name.clone()).collect();

        if permission.admin {
            self.client.sadd(&self.admin_key(), &id).await?;
        } else {
            self.client.srem(&self.admin_key(), &id).await?;
        }
        for role in &current_roles {
            self.client.sadd(&self.role_key(role), &id).await?;
        }
        for stale in existing_roles.difference(&current_roles) {
            self.client.srem(&self.role_key(stale), &id).await?;
        }
        for resource_type in self.registry.types() {
            let entries = by_type.remove(&resource_type).unwrap_or_default();
            self.client
                .replace_hash(&self.user_key(&id, &resource_type), entries)
                .await?;
        }
        let server_time = self.client.server_time_millis().await?;
        self.client.sadd(&self.users_key(), &id).await?;

        if permission.is_unrestricted_user() {
            self.client
                .set(&self.last_modified_key(), &server_time.to_string())
                .await?;
        }
        Ok(())
    }

    async fn put_all(
        &self,
        permissions: HashMap<String, UserPermission>,
    ) -> Result<(), RepositoryError> {
        for permission in permissions.values() {
            self.put(permission).await?;
        }

        let survivors: BTreeSet<String> = permissions
            .keys()
            .map(|id| id.to_lowercase())
            .chain(std::iter::once(UNRESTRICTED_USERNAME.to_string()))
            .collect();
        let ctx = TimeoutContext::new("kv prune", self.read_timeout);
        let stored = self.read_set(&self.users_key(), &ctx).await?;
        for orphan in stored.difference(&survivors) {
            self.remove(orphan).await?;
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UserPermission>, RepositoryError> {
        if id.eq_ignore_ascii_case(UNRESTRICTED_USERNAME) {
            return Ok(Some(self.unrestricted_cached().await?.as_ref().clone()));
        }

        let ctx = TimeoutContext::new("kv get permission", self.read_timeout);
        let Some(mut permission) = self.get_from_kv(&id.to_lowercase(), &ctx).await? else {
            return Ok(None);
        };
        permission.merge(self.unrestricted_cached().await?.as_ref());
        Ok(Some(permission))
    }

    async fn get_all_by_id(&self) -> Result<HashMap<String, UserPermission>, RepositoryError> {
        let ctx = TimeoutContext::new("kv get all", self.read_timeout);
        let users = self.read_set(&self.users_key(), &ctx).await?;

        let mut result = HashMap::with_capacity(users.len());
        for id in users {
            let id = id.to_lowercase();
            if let Some(permission) = self.get(&id).await? {
                result.insert(id, permission);
            }
        }
        Ok(result)
    }

    async fn get_all_by_roles(
        &self,
        any_roles: Option<&[String]>,
    ) -> Result<HashMap<String, UserPermission>, RepositoryError> {
        let roles = match any_roles {
            None => return self.get_all_by_id().await,
            Some(roles) => roles,
        };

        if roles.is_empty() {
            let unrestricted = self.unrestricted_cached().await?.as_ref().clone();
            return Ok(HashMap::from([(
                UNRESTRICTED_USERNAME.to_string(),
                unrestricted,
            )]));
        }

        let ctx = TimeoutContext::new("kv get by roles", self.read_timeout);
        let mut usernames = BTreeSet::new();
        for role in roles {
            let members = self
                .read_set(&self.role_key(&role.to_lowercase()), &ctx)
                .await?;
            usernames.extend(members.into_iter().map(|m| m.to_lowercase()));
        }
        usernames.insert(UNRESTRICTED_USERNAME.to_string());

        let mut result = HashMap::with_capacity(usernames.len());
        for id in usernames {
            if let Some(permission) = self.get(&id).await? {
                result.insert(id, permission);
            }
        }
        Ok(result)
    }

    async fn remove(&self, id: &str) -> Result<(), RepositoryError> {
        let id = id.to_lowercase();

        let role_hash_key = self.user_key(&id, &ResourceType::role());
        let mut role_names = BTreeSet::new();
        let mut cursor = 0;
        loop {
            let (next, page) = self.client.hscan(&role_hash_key, cursor).await?;
            role_names.extend(page.into_iter().map(|(name, _)| name));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        self.client.srem(&self.users_key(), &id).await?;
        for role in role_names {
            self.client.srem(&self.role_key(&role), &id).await?;
        }
        for resource_type in self.registry.types() {
            self.client.del(&self.user_key(&id, &resource_type)).await?;
        }
        self.client.srem(&self.admin_key(), &id).await?;
        Ok(())
    }
}
