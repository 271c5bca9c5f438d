// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Registered local clients (the owner's devices and third-party apps).

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::context::{CallerContext, CallerIdentity, PermissionContext};
use super::permissions::{DriveGrant, PermissionKey, PermissionSet};
use super::token::{half_key_hash, ClientAuthenticationToken};
use crate::crypto::secret::KEY_LENGTH;
use crate::crypto::{EncryptedKey, SensitiveByteArray};
use crate::drive::SecurityGroupType;
use crate::error::{ServiceError, ServiceResult};
use crate::models::{unix_millis_now, IdentityId};
use crate::storage::FileStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientRegistration {
    id: Uuid,
    name: String,
    #[serde(with = "crate::crypto::base64_bytes")]
    half_key_hash: Vec<u8>,
    security_level: SecurityGroupType,
    permissions: PermissionSet,
    drive_grants: Vec<DriveGrant>,
    /// Encrypted under the token half key.
    shared_secret: EncryptedKey,
    /// Encrypted under the token half key. Owner clients only.
    icr_key: Option<EncryptedKey>,
    created: i64,
}

/// Returned once at registration; the server keeps neither value in clear.
pub struct RegisteredClient {
    pub token: ClientAuthenticationToken,
    pub shared_secret: SensitiveByteArray,
}

pub struct ClientRegistry {
    tenant: IdentityId,
    store: FileStore,
}

impl ClientRegistry {
    pub fn new(tenant: IdentityId, store: FileStore) -> Self {
        Self { tenant, store }
    }

    pub fn register_owner(&self, name: &str, icr_key: &SensitiveByteArray) -> ServiceResult<RegisteredClient> {
        self.register(name, SecurityGroupType::Owner, PermissionSet::all(), Vec::new(), Some(icr_key))
    }

    /// Apps holding a transit permission also get the icr key so they can
    /// reach connected identities.
    pub fn register_app(
        &self,
        name: &str,
        permissions: PermissionSet,
        drive_grants: Vec<DriveGrant>,
        icr_key: &SensitiveByteArray,
    ) -> ServiceResult<RegisteredClient> {
        let uses_transit =
            permissions.has(PermissionKey::UseTransitRead) || permissions.has(PermissionKey::UseTransitWrite);
        let icr_key = uses_transit.then_some(icr_key);
        self.register(name, SecurityGroupType::Authenticated, permissions, drive_grants, icr_key)
    }

    fn register(
        &self,
        name: &str,
        security_level: SecurityGroupType,
        permissions: PermissionSet,
        drive_grants: Vec<DriveGrant>,
        icr_key: Option<&SensitiveByteArray>,
    ) -> ServiceResult<RegisteredClient> {
        let token = ClientAuthenticationToken::new_random()?;
        let shared_secret = SensitiveByteArray::random(KEY_LENGTH)?;
        let half_key = &token.access_token_half_key;

        let registration = ClientRegistration {
            id: token.id,
            name: name.to_string(),
            half_key_hash: token.half_key_hash().to_vec(),
            security_level,
            permissions,
            drive_grants,
            shared_secret: EncryptedKey::encrypt(&shared_secret, half_key)?,
            icr_key: icr_key.map(|k| EncryptedKey::encrypt(k, half_key)).transpose()?,
            created: unix_millis_now(),
        };
        self.store
            .write_json(self.store.paths().client_record(token.id), &registration)?;

        info!(tenant = %self.tenant, client_id = %token.id, name = %name, "client registered");
        Ok(RegisteredClient { token, shared_secret })
    }

    /// Authenticate a presented token and build its caller context.
    pub fn resolve(&self, token: &ClientAuthenticationToken) -> ServiceResult<CallerContext> {
        let Some(registration) = self
            .store
            .try_read_json::<ClientRegistration>(self.store.paths().client_record(token.id))?
        else {
            return Err(ServiceError::security("unknown client token"));
        };

        let presented = SensitiveByteArray::from_slice(&token.half_key_hash());
        if !presented.ct_eq(&registration.half_key_hash) {
            warn!(tenant = %self.tenant, client_id = %token.id, "client token half key mismatch");
            return Err(ServiceError::security("invalid client token"));
        }

        let half_key = &token.access_token_half_key;
        let shared_secret = registration
            .shared_secret
            .decrypt(half_key)
            .map_err(|_| ServiceError::security("invalid client token"))?;
        let icr_key = registration
            .icr_key
            .as_ref()
            .map(|k| k.decrypt(half_key))
            .transpose()
            .map_err(|_| ServiceError::security("invalid client token"))?;

        Ok(CallerContext {
            tenant: self.tenant.clone(),
            caller: CallerIdentity {
                identity: Some(self.tenant.clone()),
                security_level: registration.security_level,
                circles: Vec::new(),
            },
            permissions: PermissionContext {
                permission_set: registration.permissions,
                drive_grants: registration.drive_grants,
                shared_secret: Some(shared_secret),
                icr_key,
            },
        })
    }

    pub fn revoke(&self, client_id: Uuid) -> ServiceResult<()> {
        let path = self.store.paths().client_record(client_id);
        if self.store.exists(&path) {
            self.store.delete(path)?;
            info!(tenant = %self.tenant, client_id = %client_id, "client revoked");
        }
        Ok(())
    }

    #[cfg(test)]
    fn stored_hash(&self, client_id: Uuid) -> Vec<u8> {
        self.store
            .read_json::<ClientRegistration>(self.store.paths().client_record(client_id))
            .map(|r| r.half_key_hash)
            .unwrap_or_default()
    }
}
