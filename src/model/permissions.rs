use super::types::Authorization;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

static EMPTY_GROUPS: LazyLock<BTreeSet<String>> = LazyLock::new(BTreeSet::new);

/// Mapping from authorization to the ordered set of group names that hold
/// it. Group names are trimmed and lowercased on construction; comparison
/// is therefore case-insensitive. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Permissions {
    grants: BTreeMap<Authorization, BTreeSet<String>>,
}

impl Permissions {
    pub fn unrestricted() -> Self {
        Permissions::default()
    }

    pub fn builder() -> PermissionsBuilder {
        PermissionsBuilder::default()
    }

    /// Per-authorization union of several permission maps.
    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a Permissions>) -> Self {
        let mut builder = Permissions::builder();
        for part in parts {
            for (auth, groups) in &part.grants {
                builder = builder.add(*auth, groups.iter().map(String::as_str));
            }
        }
        builder.build()
    }

    pub fn get(&self, authorization: Authorization) -> &BTreeSet<String> {
        self.grants.get(&authorization).unwrap_or(&EMPTY_GROUPS)
    }

    /// A permission map is restricted iff any authorization names at least
    /// one group.
    pub fn is_restricted(&self) -> bool {
        self.grants.values().any(|groups| !groups.is_empty())
    }

    /// Union of group names across all authorizations.
    pub fn all_groups(&self) -> BTreeSet<String> {
        self.grants.values().flatten().cloned().collect()
    }

    /// The authorizations whose group set intersects `user_groups`. An
    /// unrestricted map grants every known authorization.
    pub fn get_authorizations<'a>(
        &self,
        user_groups: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<Authorization> {
        if !self.is_restricted() {
            return Authorization::ALL.into_iter().collect();
        }
        let groups: BTreeSet<String> = user_groups
            .into_iter()
            .map(|g| g.trim().to_lowercase())
            .collect();
        self.grants
            .iter()
            .filter(|(_, holders)| holders.iter().any(|h| groups.contains(h)))
            .map(|(auth, _)| *auth)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Authorization, &BTreeSet<String>)> {
        self.grants.iter().map(|(a, g)| (*a, g))
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Normalize group names on the way in so stored bodies and external
        // inventories obey the same invariant.
        let raw = BTreeMap::<Authorization, Vec<String>>::deserialize(deserializer)?;
        let mut builder = Permissions::builder();
        for (auth, groups) in raw {
            builder = builder.add(auth, groups.iter().map(String::as_str));
        }
        Ok(builder.build())
    }
}

#[derive(Debug, Default)]
pub struct PermissionsBuilder {
    grants: BTreeMap<Authorization, BTreeSet<String>>,
}

impl PermissionsBuilder {
    pub fn add<'a>(
        mut self,
        authorization: Authorization,
        groups: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let entry = self.grants.entry(authorization).or_default();
        for group in groups {
            let normalized = group.trim().to_lowercase();
            if !normalized.is_empty() {
                entry.insert(normalized);
            }
        }
        self
    }

    pub fn build(mut self) -> Permissions {
        // Authorizations left with no holders carry no information
        self.grants.retain(|_, groups| !groups.is_empty());
        Permissions {
            grants: self.grants,
        }
    }
}
