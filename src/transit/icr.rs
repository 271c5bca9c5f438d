// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identity connection registrations (ICRs).
//!
//! Each side of a connection holds one record for the other identity:
//!
//! - **incoming**: the token this host issued to the peer. Only the half key
//!   hash is stored; the shared secret is encrypted under the half key.
//! - **outgoing**: the token the peer issued to this host, encrypted under
//!   the tenant's icr key, used when calling the peer.
//!
//! The connection-request handshake is not part of this server;
//! [`connect_identities`] establishes both records directly.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::token::half_key_hash;
use crate::auth::{CallerContext, ClientAuthenticationToken};
use crate::crypto::secret::KEY_LENGTH;
use crate::crypto::{EncryptedKey, SensitiveByteArray};
use crate::drive::SecurityGroupType;
use crate::error::{ServiceError, ServiceResult};
use crate::models::{unix_millis_now, IdentityId};
use crate::storage::FileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Connected,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingAccess {
    token_id: Uuid,
    #[serde(with = "crate::crypto::base64_bytes")]
    half_key_hash: Vec<u8>,
    /// Encrypted under the token half key.
    shared_secret: EncryptedKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingAccess {
    /// Portable token, encrypted under the icr key.
    token: EncryptedKey,
    /// Encrypted under the icr key.
    shared_secret: EncryptedKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionRecord {
    identity: IdentityId,
    status: ConnectionStatus,
    circles: Vec<Uuid>,
    created: i64,
    last_updated: i64,
    incoming: IncomingAccess,
    outgoing: OutgoingAccess,
}

/// Public view of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConnectionRegistration {
    pub identity: IdentityId,
    pub status: ConnectionStatus,
    pub circles: Vec<Uuid>,
    pub created: i64,
}

impl IdentityConnectionRegistration {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// A token plus the shared secret that goes with it.
#[derive(Debug, Clone)]
pub struct PeerAccessToken {
    pub token: ClientAuthenticationToken,
    pub shared_secret: SensitiveByteArray,
}

impl PeerAccessToken {
    pub fn new_random() -> ServiceResult<Self> {
        Ok(Self {
            token: ClientAuthenticationToken::new_random()?,
            shared_secret: SensitiveByteArray::random(KEY_LENGTH)?,
        })
    }
}

pub struct ConnectionRegistry {
    tenant: IdentityId,
    store: FileStore,
}

impl ConnectionRegistry {
    pub fn new(tenant: IdentityId, store: FileStore) -> Self {
        Self { tenant, store }
    }

    fn load(&self, identity: &IdentityId) -> ServiceResult<Option<ConnectionRecord>> {
        Ok(self.store.try_read_json(self.store.paths().connection_record(identity))?)
    }

    fn save(&self, record: &ConnectionRecord) -> ServiceResult<()> {
        Ok(self
            .store
            .write_json(self.store.paths().connection_record(&record.identity), record)?)
    }

    pub fn get_identity_connection_registration(
        &self,
        identity: &IdentityId,
    ) -> ServiceResult<Option<IdentityConnectionRegistration>> {
        Ok(self.load(identity)?.map(|r| IdentityConnectionRegistration {
            identity: r.identity,
            status: r.status,
            circles: r.circles,
            created: r.created,
        }))
    }

    pub fn is_connected(&self, identity: &IdentityId) -> ServiceResult<bool> {
        Ok(self
            .get_identity_connection_registration(identity)?
            .is_some_and(|icr| icr.is_connected()))
    }

    /// Record a connection with `identity`.
    ///
    /// `issued` is the access this host grants the peer, `outgoing` the
    /// access the peer granted this host.
    pub fn register(
        &self,
        identity: &IdentityId,
        issued: &PeerAccessToken,
        outgoing: &PeerAccessToken,
        icr_key: &SensitiveByteArray,
    ) -> ServiceResult<()> {
        if *identity == self.tenant {
            return Err(ServiceError::client(
                crate::error::ClientErrorCode::InvalidRecipient,
                "an identity cannot connect to itself",
            ));
        }
        let portable = outgoing.token.to_portable();
        let now = unix_millis_now();
        let record = ConnectionRecord {
            identity: identity.clone(),
            status: ConnectionStatus::Connected,
            circles: Vec::new(),
            created: now,
            last_updated: now,
            incoming: IncomingAccess {
                token_id: issued.token.id,
                half_key_hash: issued.token.half_key_hash().to_vec(),
                shared_secret: EncryptedKey::encrypt(&issued.shared_secret, &issued.token.access_token_half_key)?,
            },
            outgoing: OutgoingAccess {
                token: EncryptedKey::encrypt(&SensitiveByteArray::from_slice(portable.as_bytes()), icr_key)?,
                shared_secret: EncryptedKey::encrypt(&outgoing.shared_secret, icr_key)?,
            },
        };
        self.save(&record)?;
        info!(tenant = %self.tenant, peer = %identity, "identity connection registered");
        Ok(())
    }

    pub fn grant_circles(&self, identity: &IdentityId, circles: Vec<Uuid>) -> ServiceResult<()> {
        let Some(mut record) = self.load(identity)? else {
            return Err(ServiceError::client(
                crate::error::ClientErrorCode::NotAConnectedIdentity,
                format!("{identity} is not connected"),
            ));
        };
        record.circles = circles;
        record.last_updated = unix_millis_now();
        self.save(&record)
    }

    /// Token and shared secret used to call `identity`, if connected.
    pub fn resolve_outgoing(
        &self,
        identity: &IdentityId,
        icr_key: &SensitiveByteArray,
    ) -> ServiceResult<Option<PeerAccessToken>> {
        let Some(record) = self.load(identity)? else {
            return Ok(None);
        };
        if record.status != ConnectionStatus::Connected {
            return Ok(None);
        }
        let portable = record
            .outgoing
            .token
            .decrypt(icr_key)
            .map_err(|_| ServiceError::security("icr key does not open the connection"))?;
        let portable = std::str::from_utf8(portable.as_bytes())
            .map_err(|_| ServiceError::system("stored connection token is corrupt"))?;
        let token = ClientAuthenticationToken::parse(portable)
            .map_err(|_| ServiceError::system("stored connection token is corrupt"))?;
        let shared_secret = record
            .outgoing
            .shared_secret
            .decrypt(icr_key)
            .map_err(|_| ServiceError::security("icr key does not open the connection"))?;
        Ok(Some(PeerAccessToken { token, shared_secret }))
    }

    /// Check a token presented by `identity` and build its caller context.
    pub fn authenticate_incoming(
        &self,
        identity: &IdentityId,
        token: &ClientAuthenticationToken,
    ) -> ServiceResult<CallerContext> {
        let record = self
            .load(identity)?
            .filter(|r| r.status == ConnectionStatus::Connected)
            .ok_or_else(|| ServiceError::security(format!("{identity} is not connected")))?;

        let presented = SensitiveByteArray::from_slice(&half_key_hash(&token.access_token_half_key));
        if record.incoming.token_id != token.id || !presented.ct_eq(&record.incoming.half_key_hash) {
            warn!(tenant = %self.tenant, peer = %identity, "peer presented an invalid connection token");
            return Err(ServiceError::security("invalid connection token"));
        }
        let shared_secret = record
            .incoming
            .shared_secret
            .decrypt(&token.access_token_half_key)
            .map_err(|_| ServiceError::security("invalid connection token"))?;

        let mut ctx = CallerContext::peer(
            self.tenant.clone(),
            Some(identity.clone()),
            SecurityGroupType::Connected,
            Some(shared_secret),
        );
        ctx.caller.circles = record.circles;
        Ok(ctx)
    }

    pub fn revoke_connection(&self, identity: &IdentityId) -> ServiceResult<()> {
        if let Some(mut record) = self.load(identity)? {
            record.status = ConnectionStatus::Revoked;
            record.last_updated = unix_millis_now();
            self.save(&record)?;
            warn!(tenant = %self.tenant, peer = %identity, "identity connection revoked");
        }
        Ok(())
    }

    pub fn connected_identities(&self) -> ServiceResult<Vec<IdentityConnectionRegistration>> {
        let mut connected = Vec::new();
        for stem in self.store.list_files(self.store.paths().connections_dir(), "json")? {
            let Ok(identity) = stem.parse::<IdentityId>() else {
                continue;
            };
            if let Some(icr) = self.get_identity_connection_registration(&identity)? {
                if icr.is_connected() {
                    connected.push(icr);
                }
            }
        }
        Ok(connected)
    }
}

/// Connect two identities in both directions.
pub fn connect_identities(
    a: &ConnectionRegistry,
    a_icr_key: &SensitiveByteArray,
    b: &ConnectionRegistry,
    b_icr_key: &SensitiveByteArray,
) -> ServiceResult<()> {
    let a_grants_b = PeerAccessToken::new_random()?;
    let b_grants_a = PeerAccessToken::new_random()?;
    a.register(&b.tenant, &a_grants_b, &b_grants_a, a_icr_key)?;
    b.register(&a.tenant, &b_grants_a, &a_grants_b, b_icr_key)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TenantPaths;
    use tempfile::TempDir;

    struct Side {
        registry: ConnectionRegistry,
        icr_key: SensitiveByteArray,
    }

    fn side(dir: &TempDir, name: &str) -> Side {
        let tenant: IdentityId = name.parse().unwrap();
        let store = FileStore::open(TenantPaths::new(dir.path(), &tenant)).unwrap();
        Side {
            registry: ConnectionRegistry::new(tenant, store),
            icr_key: SensitiveByteArray::random(KEY_LENGTH).unwrap(),
        }
    }

    #[test]
    fn connected_identities_can_authenticate_each_other() {
        let dir = TempDir::new().unwrap();
        let frodo = side(&dir, "frodo.dotyou.cloud");
        let sam = side(&dir, "sam.dotyou.cloud");
        connect_identities(&frodo.registry, &frodo.icr_key, &sam.registry, &sam.icr_key).unwrap();

        let frodo_id: IdentityId = "frodo.dotyou.cloud".parse().unwrap();
        let sam_id: IdentityId = "sam.dotyou.cloud".parse().unwrap();
        assert!(frodo.registry.is_connected(&sam_id).unwrap());

        let access = frodo.registry.resolve_outgoing(&sam_id, &frodo.icr_key).unwrap().unwrap();
        let ctx = sam.registry.authenticate_incoming(&frodo_id, &access.token).unwrap();
        assert_eq!(ctx.caller_identity(), Some(&frodo_id));
        assert_eq!(ctx.caller.security_level, SecurityGroupType::Connected);
        assert!(ctx.shared_secret_key().unwrap().ct_eq(access.shared_secret.as_bytes()));
    }

    #[test]
    fn wrong_icr_key_cannot_open_outgoing_token() {
        let dir = TempDir::new().unwrap();
        let frodo = side(&dir, "frodo.dotyou.cloud");
        let sam = side(&dir, "sam.dotyou.cloud");
        connect_identities(&frodo.registry, &frodo.icr_key, &sam.registry, &sam.icr_key).unwrap();

        let sam_id: IdentityId = "sam.dotyou.cloud".parse().unwrap();
        let wrong = SensitiveByteArray::random(KEY_LENGTH).unwrap();
        assert!(frodo.registry.resolve_outgoing(&sam_id, &wrong).is_err());
    }

    #[test]
    fn revoked_connection_rejects_tokens() {
        let dir = TempDir::new().unwrap();
        let frodo = side(&dir, "frodo.dotyou.cloud");
        let sam = side(&dir, "sam.dotyou.cloud");
        connect_identities(&frodo.registry, &frodo.icr_key, &sam.registry, &sam.icr_key).unwrap();

        let frodo_id: IdentityId = "frodo.dotyou.cloud".parse().unwrap();
        let sam_id: IdentityId = "sam.dotyou.cloud".parse().unwrap();
        let access = frodo.registry.resolve_outgoing(&sam_id, &frodo.icr_key).unwrap().unwrap();

        sam.registry.revoke_connection(&frodo_id).unwrap();
        assert!(!sam.registry.is_connected(&frodo_id).unwrap());
        assert!(sam
            .registry
            .authenticate_incoming(&frodo_id, &access.token)
            .unwrap_err()
            .is_security());
    }

    #[test]
    fn circles_flow_into_caller_context() {
        let dir = TempDir::new().unwrap();
        let frodo = side(&dir, "frodo.dotyou.cloud");
        let sam = side(&dir, "sam.dotyou.cloud");
        connect_identities(&frodo.registry, &frodo.icr_key, &sam.registry, &sam.icr_key).unwrap();

        let frodo_id: IdentityId = "frodo.dotyou.cloud".parse().unwrap();
        let sam_id: IdentityId = "sam.dotyou.cloud".parse().unwrap();
        let circle = Uuid::new_v4();
        sam.registry.grant_circles(&frodo_id, vec![circle]).unwrap();

        let access = frodo.registry.resolve_outgoing(&sam_id, &frodo.icr_key).unwrap().unwrap();
        let ctx = sam.registry.authenticate_incoming(&frodo_id, &access.token).unwrap();
        assert_eq!(ctx.caller.circles, vec![circle]);
        assert_eq!(sam.registry.connected_identities().unwrap().len(), 1);
    }
}
