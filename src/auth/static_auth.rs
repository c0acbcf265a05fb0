//! Config-backed in-memory authenticator
//!
//! Resolves credentials against a static user table and hands out
//! principals assembled from the configured permission filter lists and
//! quota overrides. Production deployments substitute their own
//! [`Authenticator`] implementation.

use ahash::AHashMap;
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::config::{AuthConfig, QuotaConfig};

use super::{
    AuthError, Authenticator, ConnectionRequest, PermissionSet, Principal, PrincipalId, Quota,
};

struct UserEntry {
    /// Plaintext password; `None` accepts any password
    password: Option<String>,
    principal_id: PrincipalId,
}

pub struct StaticAuthenticator {
    users: AHashMap<String, UserEntry>,
    principals: AHashMap<PrincipalId, Principal>,
    /// Principal handed to connections without credentials, if allowed
    anonymous: Option<PrincipalId>,
}

impl StaticAuthenticator {
    /// Build the user table from configuration. Filter lists have been
    /// validated by `Config::validate`; invalid filters are skipped here
    /// rather than propagated.
    pub fn from_config(auth: &AuthConfig, default_quota: &QuotaConfig) -> Self {
        let defaults = &auth.default_permissions;
        let mut users = AHashMap::with_capacity(auth.users.len());
        let mut principals = AHashMap::with_capacity(auth.users.len() + 1);

        for user in &auth.users {
            let quota = user
                .quota
                .as_ref()
                .unwrap_or(default_quota)
                .to_quota();
            let principal_id = Uuid::new_v4();
            principals.insert(
                principal_id,
                Principal {
                    username: Some(user.username.clone()),
                    quota,
                    publish_permissions: permission_set(&user.permissions.publish, &defaults.publish),
                    subscribe_permissions: permission_set(
                        &user.permissions.subscribe,
                        &defaults.subscribe,
                    ),
                    retain_permissions: permission_set(&user.permissions.retain, &defaults.retain),
                },
            );
            users.insert(
                user.username.clone(),
                UserEntry {
                    password: user.password.clone(),
                    principal_id,
                },
            );
        }

        let anonymous = auth.allow_anonymous.then(|| {
            let principal_id = Uuid::new_v4();
            principals.insert(
                principal_id,
                Principal {
                    username: None,
                    quota: default_quota.to_quota(),
                    publish_permissions: permission_set(&[], &defaults.publish),
                    subscribe_permissions: permission_set(&[], &defaults.subscribe),
                    retain_permissions: permission_set(&[], &defaults.retain),
                },
            );
            principal_id
        });

        Self {
            users,
            principals,
            anonymous,
        }
    }

    /// An authenticator that accepts every connection with the given
    /// permissions and quota. Useful for embedding and tests.
    pub fn allow_all(quota: Quota, permissions: PermissionSet) -> Self {
        let principal_id = Uuid::new_v4();
        let mut principals = AHashMap::with_capacity(1);
        principals.insert(
            principal_id,
            Principal {
                username: None,
                quota,
                publish_permissions: permissions.clone(),
                subscribe_permissions: permissions.clone(),
                retain_permissions: permissions,
            },
        );
        Self {
            users: AHashMap::new(),
            principals,
            anonymous: Some(principal_id),
        }
    }

    fn verify_password(provided: &[u8], stored: &str) -> bool {
        match std::str::from_utf8(provided) {
            Ok(provided) => provided == stored,
            Err(_) => false,
        }
    }
}

fn permission_set(own: &[String], defaults: &[String]) -> PermissionSet {
    let mut set = PermissionSet::new();
    for filter in own.iter().chain(defaults) {
        // validated at config load; ignore stragglers
        let _ = set.insert(filter);
    }
    set
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(
        &self,
        request: &ConnectionRequest,
    ) -> Result<Option<PrincipalId>, AuthError> {
        match &request.credentials {
            Some(credentials) => {
                let Some(entry) = self.users.get(&credentials.username) else {
                    debug!(username = %credentials.username, "unknown user");
                    return Ok(None);
                };
                match &entry.password {
                    Some(stored) => {
                        let provided = credentials.password.as_deref().unwrap_or(&[]);
                        if Self::verify_password(provided, stored) {
                            Ok(Some(entry.principal_id))
                        } else {
                            debug!(username = %credentials.username, "bad password");
                            Ok(None)
                        }
                    }
                    None => Ok(Some(entry.principal_id)),
                }
            }
            None => Ok(self.anonymous),
        }
    }

    async fn principal(&self, principal_id: PrincipalId) -> Result<Option<Principal>, AuthError> {
        Ok(self.principals.get(&principal_id).cloned())
    }
}
