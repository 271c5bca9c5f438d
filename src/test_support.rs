// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared fixtures for unit tests: sample headers, a set of hosted identities
//! wired through the in-process transport, and client-side upload helpers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use crate::auth::{CallerContext, ClientAuthenticationToken, DriveGrant, DrivePermission, PermissionSet};
use crate::config::UploadSettings;
use crate::crypto::secret::KEY_LENGTH;
use crate::crypto::{random_iv, EncryptedKeyHeader, KeyHeader, SensitiveByteArray};
use crate::drive::metadata::{
    AppFileMetadata, FileMetadata, PayloadDescriptor, ServerFileHeader, ServerMetadata,
};
use crate::drive::{AccessControlList, CreateDriveRequest, FileSystemType, SecurityGroupType, StorageDrive};
use crate::error::ServiceResult;
use crate::models::{FileIdentifier, IdentityId, InternalDriveFileId, TargetDrive};
use crate::tenant::{Tenant, TenantRegistry, TenantSettings};
use crate::transit::icr::{connect_identities, PeerAccessToken};
use crate::transit::outbox::RetryPolicy;
use crate::transit::retry::ImmediateRetry;
use crate::transit::sender::SenderSettings;
use crate::transit::transport::{
    HostedPeerTransport, HostedPerimeters, PeerReply, PeerRequest, PeerTransport, PeerTransportError,
};
use crate::upload::assembler::UploadResult;
use crate::upload::descriptor::{UploadFileDescriptor, UploadFileMetadata};
use crate::upload::instruction_set::{
    FileUpdateInstructionSet, PayloadUpdateOperationType, StorageIntent, StorageOptions, UpdateLocale,
    UploadInstructionSet, UploadManifest, UploadManifestPayloadDescriptor, UploadedManifestThumbnailDescriptor,
};
use crate::upload::update::UpdateResult;

/// Drive type shared by every drive the fixtures create.
pub const TEST_DRIVE_TYPE: Uuid = Uuid::from_u128(0x2b1e_0c55_42a0_4b6f_8d1d_6f0a_9c3e_7a11);

pub fn frodo() -> IdentityId {
    "frodo.dotyou.cloud".parse().unwrap()
}

pub fn sam() -> IdentityId {
    "sam.dotyou.cloud".parse().unwrap()
}

pub fn merry() -> IdentityId {
    "merry.dotyou.cloud".parse().unwrap()
}

/// A header for a fresh file on `drive_id` with no payloads.
pub fn sample_header(drive_id: Uuid, timestamp: i64) -> ServerFileHeader {
    ServerFileHeader {
        encrypted_key_header: EncryptedKeyHeader::empty(),
        file_metadata: FileMetadata {
            file: Some(InternalDriveFileId::new(drive_id, Uuid::new_v4())),
            global_transit_id: None,
            created: timestamp,
            updated: timestamp,
            is_encrypted: false,
            sender_identity: None,
            original_recipient_list: Vec::new(),
            app_data: AppFileMetadata::default(),
            payloads: Vec::new(),
            version_tag: Uuid::new_v4(),
            referenced_file: None,
        },
        server_metadata: ServerMetadata {
            access_control_list: AccessControlList::with_group(SecurityGroupType::Connected),
            allow_distribution: true,
            file_system_type: FileSystemType::Standard,
            original_recipient_count: 0,
            file_byte_count: 0,
        },
    }
}

pub fn sample_payload(key: &str, uid: u64) -> PayloadDescriptor {
    PayloadDescriptor {
        key: key.to_string(),
        uid,
        iv: vec![0; 16],
        content_type: "application/octet-stream".to_string(),
        bytes_written: 5,
        last_modified: 1,
        descriptor_content: None,
        preview_thumbnail: None,
        thumbnails: Vec::new(),
    }
}

// =============================================================================
// Hosted identities
// =============================================================================

/// Fails every call to an identity marked unreachable and never answers
/// calls to one marked hanging.
struct FlakyTransport {
    inner: Arc<dyn PeerTransport>,
    unreachable: Arc<RwLock<HashSet<IdentityId>>>,
    hanging: Arc<RwLock<HashSet<IdentityId>>>,
}

#[async_trait]
impl PeerTransport for FlakyTransport {
    async fn send(
        &self,
        sender: &IdentityId,
        recipient: &IdentityId,
        auth: Option<&ClientAuthenticationToken>,
        request: PeerRequest,
    ) -> Result<PeerReply, PeerTransportError> {
        if self.unreachable.read().unwrap().contains(recipient) {
            return Err(PeerTransportError::Unreachable {
                identity: recipient.clone(),
                message: "connection refused".to_string(),
            });
        }
        let hangs = self.hanging.read().unwrap().contains(recipient);
        if hangs {
            std::future::pending::<()>().await;
        }
        self.inner.send(sender, recipient, auth, request).await
    }
}

pub struct TestWorld {
    pub registry: Arc<TenantRegistry>,
    unreachable: Arc<RwLock<HashSet<IdentityId>>>,
    hanging: Arc<RwLock<HashSet<IdentityId>>>,
    _dir: TempDir,
}

impl TestWorld {
    pub async fn new(identities: &[IdentityId]) -> Self {
        Self::with_package_ttl(identities, UploadSettings::default().package_ttl).await
    }

    pub async fn with_package_ttl(identities: &[IdentityId], package_ttl: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let immediate_retry = ImmediateRetry {
            attempts: 2,
            delay: Duration::from_millis(1),
        };
        let settings = TenantSettings {
            data_dir: dir.path().to_path_buf(),
            outbox_retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            sender: SenderSettings {
                immediate_retry,
                outbox_batch_size: 100,
            },
            immediate_retry,
            uploads: UploadSettings {
                package_ttl,
                package_capacity: 64,
            },
        };

        let hosted = Arc::new(HostedPerimeters::default());
        let unreachable = Arc::new(RwLock::new(HashSet::new()));
        let hanging = Arc::new(RwLock::new(HashSet::new()));
        let transport: Arc<dyn PeerTransport> = Arc::new(FlakyTransport {
            inner: Arc::new(HostedPeerTransport::new(hosted.clone(), None)),
            unreachable: unreachable.clone(),
            hanging: hanging.clone(),
        });
        let registry = TenantRegistry::open_hosted(identities, &settings, &hosted, transport).unwrap();
        Self {
            registry: Arc::new(registry),
            unreachable,
            hanging,
            _dir: dir,
        }
    }

    pub fn tenant(&self, identity: &IdentityId) -> &Tenant {
        self.registry
            .iter()
            .find(|t| &t.identity == identity)
            .map(Arc::as_ref)
            .unwrap_or_else(|| panic!("{identity} is not hosted in this world"))
    }

    pub fn set_unreachable(&self, identity: &IdentityId, unreachable: bool) {
        toggle(&self.unreachable, identity, unreachable);
    }

    /// Calls to `identity` never complete while set.
    pub fn set_hanging(&self, identity: &IdentityId, hanging: bool) {
        toggle(&self.hanging, identity, hanging);
    }

    pub fn connect(&self, a: &IdentityId, b: &IdentityId) {
        let (a, b) = (self.tenant(a), self.tenant(b));
        connect_identities(&a.connections, a.icr_key(), &b.connections, b.icr_key()).unwrap();
    }

    pub fn create_drive(&self, identity: &IdentityId, owner_only: bool, allow_anonymous_reads: bool) -> StorageDrive {
        self.create_drive_at(identity, TargetDrive::new(Uuid::new_v4(), TEST_DRIVE_TYPE), owner_only, allow_anonymous_reads)
    }

    /// Create a drive on `identity` with the same target drive as `drive`.
    pub fn mirror_drive(&self, identity: &IdentityId, drive: &StorageDrive) -> StorageDrive {
        self.create_drive_at(
            identity,
            drive.target_drive.clone(),
            drive.owner_only,
            drive.allow_anonymous_reads,
        )
    }

    fn create_drive_at(
        &self,
        identity: &IdentityId,
        target_drive: TargetDrive,
        owner_only: bool,
        allow_anonymous_reads: bool,
    ) -> StorageDrive {
        self.tenant(identity)
            .drives
            .create_drive(CreateDriveRequest {
                name: "shire".to_string(),
                target_drive,
                owner_only,
                allow_anonymous_reads,
                allow_subscriptions: false,
            })
            .unwrap()
    }

    pub fn owner(&self, identity: &IdentityId) -> CallerContext {
        let tenant = self.tenant(identity);
        CallerContext::owner(
            identity.clone(),
            SensitiveByteArray::random(KEY_LENGTH).unwrap(),
            tenant.icr_key().clone(),
        )
    }

    /// An app client that may write `drive` but holds no transit permission.
    pub fn app_without_transit(&self, identity: &IdentityId, drive: &StorageDrive) -> CallerContext {
        let tenant = self.tenant(identity);
        let client = tenant
            .clients
            .register_app(
                "notes",
                PermissionSet::default(),
                vec![DriveGrant {
                    drive_id: drive.id,
                    target_drive: drive.target_drive.clone(),
                    permission: DrivePermission::ReadWrite,
                }],
                tenant.icr_key(),
            )
            .unwrap();
        tenant.clients.resolve(&client.token).unwrap()
    }

    /// The token `from` presents when calling `to`.
    pub fn outgoing_access(&self, from: &IdentityId, to: &IdentityId) -> PeerAccessToken {
        let tenant = self.tenant(from);
        tenant
            .connections
            .resolve_outgoing(to, tenant.icr_key())
            .unwrap()
            .unwrap()
    }

    /// Context `host` builds for an authenticated call from `caller`.
    pub fn peer_context(&self, host: &IdentityId, caller: &IdentityId) -> CallerContext {
        let access = self.outgoing_access(caller, host);
        self.tenant(host)
            .connections
            .authenticate_incoming(caller, &access.token)
            .unwrap()
    }
}

fn toggle(set: &RwLock<HashSet<IdentityId>>, identity: &IdentityId, on: bool) {
    let mut set = set.write().unwrap();
    if on {
        set.insert(identity.clone());
    } else {
        set.remove(identity);
    }
}

// =============================================================================
// Client side of uploads and updates
// =============================================================================

fn new_descriptor(access_control_list: Option<AccessControlList>, version_tag: Option<Uuid>) -> UploadFileDescriptor {
    UploadFileDescriptor {
        encrypted_key_header: None,
        file_metadata: UploadFileMetadata {
            allow_distribution: true,
            is_encrypted: false,
            app_data: AppFileMetadata::default(),
            access_control_list,
            version_tag,
            referenced_file: None,
        },
    }
}

fn manifest_entry(key: &str, iv: Vec<u8>, operation: PayloadUpdateOperationType) -> UploadManifestPayloadDescriptor {
    UploadManifestPayloadDescriptor {
        payload_key: key.to_string(),
        iv,
        descriptor_content: None,
        preview_thumbnail: None,
        thumbnails: Vec::new(),
        payload_update_operation_type: operation,
        payload_uid: 0,
    }
}

/// Builds an upload the way a client would and runs it through the
/// assembler.
pub struct UploadFixture {
    pub instruction_set: UploadInstructionSet,
    pub descriptor: UploadFileDescriptor,
}

impl UploadFixture {
    pub fn new(drive: &StorageDrive) -> Self {
        let group = if drive.owner_only {
            SecurityGroupType::Owner
        } else {
            SecurityGroupType::Connected
        };
        Self {
            instruction_set: UploadInstructionSet {
                transfer_iv: random_iv().unwrap().to_vec(),
                storage_options: StorageOptions {
                    drive: drive.target_drive.clone(),
                    overwrite_file_id: None,
                    storage_intent: StorageIntent::NewFileOrOverwrite,
                    file_system_type: FileSystemType::Standard,
                },
                transit_options: None,
                manifest: UploadManifest::default(),
            },
            descriptor: new_descriptor(Some(AccessControlList::with_group(group)), None),
        }
    }

    /// Declare a payload with one thumbnail per name. Payload bytes are
    /// `"{key} bytes"`.
    pub fn add_payload(&mut self, key: &str, thumbnails: &[&str]) {
        let iv = if self.descriptor.file_metadata.is_encrypted {
            random_iv().unwrap().to_vec()
        } else {
            Vec::new()
        };
        let mut entry = manifest_entry(key, iv, PayloadUpdateOperationType::AppendOrOverwrite);
        entry.thumbnails = thumbnails
            .iter()
            .enumerate()
            .map(|(i, name)| UploadedManifestThumbnailDescriptor {
                thumbnail_key: name.to_string(),
                pixel_width: 20 + i as u32,
                pixel_height: 20 + i as u32,
                content_type: Some("image/png".to_string()),
            })
            .collect();
        self.instruction_set.manifest.payload_descriptors.push(entry);
    }

    /// Mark the file encrypted with a fresh key wrapped for `ctx`.
    pub fn encrypt(&mut self, ctx: &CallerContext) -> KeyHeader {
        let key_header = KeyHeader::new_random().unwrap();
        self.descriptor.file_metadata.is_encrypted = true;
        self.descriptor.encrypted_key_header =
            Some(EncryptedKeyHeader::wrap_with_random_iv(&key_header, ctx.shared_secret_key().unwrap()).unwrap());
        for payload in &mut self.instruction_set.manifest.payload_descriptors {
            payload.iv = random_iv().unwrap().to_vec();
        }
        key_header
    }

    pub async fn upload(&self, world: &TestWorld, identity: &IdentityId, ctx: &CallerContext) -> ServiceResult<UploadResult> {
        let uploads = &world.tenant(identity).uploads;
        let package = uploads.create_package(ctx, self.instruction_set.clone()).await?;
        let sealed = self
            .descriptor
            .seal(ctx.shared_secret_key()?, &self.instruction_set.transfer_iv)?;
        uploads.add_metadata(package, &sealed).await?;
        for payload in &self.instruction_set.manifest.payload_descriptors {
            let bytes = format!("{} bytes", payload.payload_key);
            uploads
                .add_payload(package, &payload.payload_key, "application/octet-stream", bytes.as_bytes())
                .await?;
            for thumb in &payload.thumbnails {
                uploads.add_thumbnail(package, &thumb.thumbnail_key, "", b"thumb").await?;
            }
        }
        uploads.finalize_upload(ctx, package).await
    }
}

/// Builds a payload update and runs it through the update pipeline.
pub struct UpdateFixture {
    pub instruction_set: FileUpdateInstructionSet,
    pub descriptor: UploadFileDescriptor,
    contents: HashMap<String, Vec<u8>>,
}

impl UpdateFixture {
    /// Update of a file stored on this identity.
    pub fn local(drive: &StorageDrive, file_id: Uuid, version_tag: Uuid) -> Self {
        Self::build(
            UpdateLocale::Local,
            FileIdentifier {
                target_drive: drive.target_drive.clone(),
                file_id: Some(file_id),
                global_transit_id: None,
                unique_id: None,
            },
            Vec::new(),
            new_descriptor(None, Some(version_tag)),
        )
    }

    /// Update of copies held only by `recipients`.
    pub fn peer(drive: &StorageDrive, global_transit_id: Uuid, recipients: Vec<IdentityId>) -> Self {
        Self::build(
            UpdateLocale::Peer,
            FileIdentifier {
                target_drive: drive.target_drive.clone(),
                file_id: None,
                global_transit_id: Some(global_transit_id),
                unique_id: None,
            },
            recipients,
            new_descriptor(Some(AccessControlList::with_group(SecurityGroupType::Connected)), None),
        )
    }

    fn build(
        locale: UpdateLocale,
        file: FileIdentifier,
        recipients: Vec<IdentityId>,
        descriptor: UploadFileDescriptor,
    ) -> Self {
        Self {
            instruction_set: FileUpdateInstructionSet {
                transfer_iv: random_iv().unwrap().to_vec(),
                locale,
                file,
                recipients,
                manifest: UploadManifest::default(),
                use_app_notification: false,
                app_notification_options: None,
            },
            descriptor,
            contents: HashMap::new(),
        }
    }

    pub fn replace_payload(&mut self, key: &str, bytes: &[u8]) {
        self.instruction_set
            .manifest
            .payload_descriptors
            .push(manifest_entry(key, Vec::new(), PayloadUpdateOperationType::AppendOrOverwrite));
        self.contents.insert(key.to_string(), bytes.to_vec());
    }

    pub fn delete_payload(&mut self, key: &str) {
        self.instruction_set
            .manifest
            .payload_descriptors
            .push(manifest_entry(key, Vec::new(), PayloadUpdateOperationType::DeletePayload));
    }

    pub async fn apply(&self, world: &TestWorld, identity: &IdentityId, ctx: &CallerContext) -> ServiceResult<UpdateResult> {
        let tenant = world.tenant(identity);
        let package = tenant.updates.create_package(ctx, self.instruction_set.clone()).await?;
        let sealed = self
            .descriptor
            .seal(ctx.shared_secret_key()?, &self.instruction_set.transfer_iv)?;
        tenant.uploads.add_metadata(package, &sealed).await?;
        for (key, bytes) in &self.contents {
            tenant
                .uploads
                .add_payload(package, key, "application/octet-stream", bytes)
                .await?;
        }
        tenant.updates.finalize_update(ctx, package).await
    }
}
