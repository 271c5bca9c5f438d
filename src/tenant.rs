// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Tenants
//!
//! One [`Tenant`] per hosted identity. It owns every per-identity component,
//! so no key, secret or file reference is ever shared between identities.
//!
//! ```text
//! Tenant
//!   ├── DriveManager ─┐
//!   ├── LocalDriveStorage ──┬── UploadPackageAssembler ── FileUpdatePipeline
//!   ├── ConnectionRegistry ─┼── PeerTransitSender ── Outbox (redb)
//!   ├── ClientRegistry      ├── TransitQueryService
//!   └── keys.json (icr key) └── PeerPerimeterService
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::ClientRegistry;
use crate::config::{Config, UploadSettings};
use crate::crypto::secret::KEY_LENGTH;
use crate::crypto::SensitiveByteArray;
use crate::drive::{DriveManager, DriveStorage, LocalDriveStorage};
use crate::error::{ServiceError, ServiceResult};
use crate::models::IdentityId;
use crate::perimeter::PeerPerimeterService;
use crate::storage::{FileStore, TenantPaths};
use crate::transit::icr::ConnectionRegistry;
use crate::transit::outbox::{Outbox, RetryPolicy};
use crate::transit::retry::ImmediateRetry;
use crate::transit::sender::{OutboxSweepReport, PeerTransitSender, SenderSettings};
use crate::transit::transport::{HostedPeerTransport, HostedPerimeters, HttpPeerTransport, PeerTransport};
use crate::transit::TransitQueryService;
use crate::upload::{FileUpdatePipeline, PackageRegistry, UploadPackageAssembler};

/// Credentials of the first owner client, written once for bootstrapping.
const OWNER_CREDENTIALS_FILE: &str = "owner-client.json";

#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub data_dir: PathBuf,
    pub outbox_retry: RetryPolicy,
    pub sender: SenderSettings,
    pub immediate_retry: ImmediateRetry,
    pub uploads: UploadSettings,
}

impl TenantSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            outbox_retry: config.outbox_retry,
            sender: SenderSettings {
                immediate_retry: config.immediate_retry,
                outbox_batch_size: config.outbox_batch_size,
            },
            immediate_retry: config.immediate_retry,
            uploads: config.uploads.clone(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TenantKeys {
    /// Encrypts outgoing connection tokens and secrets at rest.
    icr_key: SensitiveByteArray,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OwnerCredentials<'a> {
    token: &'a str,
    shared_secret: &'a SensitiveByteArray,
}

pub struct Tenant {
    pub identity: IdentityId,
    pub drives: Arc<DriveManager>,
    pub storage: Arc<dyn DriveStorage>,
    pub clients: ClientRegistry,
    pub connections: Arc<ConnectionRegistry>,
    pub sender: Arc<PeerTransitSender>,
    pub queries: TransitQueryService,
    pub uploads: Arc<UploadPackageAssembler>,
    pub updates: FileUpdatePipeline,
    pub perimeter: Arc<PeerPerimeterService>,
    store: FileStore,
    icr_key: SensitiveByteArray,
}

impl Tenant {
    /// Open (or initialise) the storage of `identity` and wire its
    /// components. `transport` carries every outgoing peer call.
    pub fn open(
        identity: IdentityId,
        settings: &TenantSettings,
        transport: Arc<dyn PeerTransport>,
    ) -> ServiceResult<Self> {
        let store = FileStore::open(TenantPaths::new(&settings.data_dir, &identity))?;
        let keys = load_or_create_keys(&store)?;

        let drives = Arc::new(DriveManager::open(store.clone())?);
        let storage: Arc<dyn DriveStorage> = Arc::new(LocalDriveStorage::new(store.clone()));
        let clients = ClientRegistry::new(identity.clone(), store.clone());
        let connections = Arc::new(ConnectionRegistry::new(identity.clone(), store.clone()));
        let outbox = Arc::new(Outbox::open(&store.paths().outbox_db(), settings.outbox_retry)?);

        let sender = Arc::new(PeerTransitSender::new(
            identity.clone(),
            drives.clone(),
            storage.clone(),
            connections.clone(),
            outbox,
            transport.clone(),
            settings.sender,
        ));
        let queries = TransitQueryService::new(
            identity.clone(),
            connections.clone(),
            transport,
            settings.immediate_retry,
        );
        let packages = Arc::new(PackageRegistry::new(
            settings.uploads.package_capacity,
            settings.uploads.package_ttl,
        ));
        let uploads = Arc::new(UploadPackageAssembler::new(
            identity.clone(),
            drives.clone(),
            storage.clone(),
            packages,
            sender.clone(),
        ));
        let updates = FileUpdatePipeline::new(
            identity.clone(),
            drives.clone(),
            storage.clone(),
            uploads.clone(),
            sender.clone(),
        );
        let perimeter = Arc::new(PeerPerimeterService::new(
            identity.clone(),
            drives.clone(),
            storage.clone(),
            connections.clone(),
        ));

        Ok(Self {
            identity,
            drives,
            storage,
            clients,
            connections,
            sender,
            queries,
            uploads,
            updates,
            perimeter,
            store,
            icr_key: keys.icr_key,
        })
    }

    pub fn icr_key(&self) -> &SensitiveByteArray {
        &self.icr_key
    }

    /// Attempt every due outbox item of this identity once.
    pub async fn process_outbox(&self) -> ServiceResult<OutboxSweepReport> {
        self.sender.process_outbox(&self.icr_key).await
    }

    pub fn health_check(&self) -> ServiceResult<()> {
        Ok(self.store.health_check()?)
    }

    /// Register an owner client the first time an identity starts and write
    /// its credentials next to the identity's data. Later starts do nothing.
    pub fn ensure_owner_client(&self) -> ServiceResult<()> {
        let path = self.store.paths().root().join(OWNER_CREDENTIALS_FILE);
        if self.store.exists(&path) {
            return Ok(());
        }
        let client = self.clients.register_owner("owner", &self.icr_key)?;
        let token = client.token.to_portable();
        self.store.write_json(
            &path,
            &OwnerCredentials {
                token: token.as_str(),
                shared_secret: &client.shared_secret,
            },
        )?;
        info!(tenant = %self.identity, path = %path.display(), "owner client credentials written");
        Ok(())
    }
}

fn load_or_create_keys(store: &FileStore) -> ServiceResult<TenantKeys> {
    let path = store.paths().tenant_keys();
    if let Some(keys) = store.try_read_json::<TenantKeys>(&path)? {
        return Ok(keys);
    }
    let keys = TenantKeys {
        icr_key: SensitiveByteArray::random(KEY_LENGTH)
            .map_err(|e| ServiceError::system(format!("failed to generate tenant keys: {e}")))?,
    };
    store.write_json(&path, &keys)?;
    Ok(keys)
}

/// Every identity hosted by this process.
pub struct TenantRegistry {
    tenants: HashMap<IdentityId, Arc<Tenant>>,
}

impl TenantRegistry {
    /// Open the configured identities. Peer calls between them stay in
    /// process; everything else goes out over HTTP.
    pub fn open(config: &Config) -> ServiceResult<Self> {
        let hosted = Arc::new(HostedPerimeters::default());
        let http = HttpPeerTransport::new(config.peer_request_timeout, config.peer_address_overrides.clone())
            .map_err(|e| ServiceError::system(e.to_string()))?;
        let transport: Arc<dyn PeerTransport> = Arc::new(HostedPeerTransport::new(hosted.clone(), Some(Arc::new(http))));
        Self::open_hosted(
            &config.tenants,
            &TenantSettings::from_config(config),
            &hosted,
            transport,
        )
    }

    /// Open `identities` over a shared transport and register their
    /// perimeters in `hosted`.
    pub fn open_hosted(
        identities: &[IdentityId],
        settings: &TenantSettings,
        hosted: &HostedPerimeters,
        transport: Arc<dyn PeerTransport>,
    ) -> ServiceResult<Self> {
        let mut tenants = HashMap::new();
        for identity in identities {
            let tenant = Arc::new(Tenant::open(identity.clone(), settings, transport.clone())?);
            hosted.register(identity.clone(), tenant.perimeter.clone());
            info!(tenant = %identity, "identity opened");
            tenants.insert(identity.clone(), tenant);
        }
        Ok(Self { tenants })
    }

    pub fn get(&self, identity: &IdentityId) -> Option<Arc<Tenant>> {
        self.tenants.get(identity).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Tenant>> {
        self.tenants.values()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}
