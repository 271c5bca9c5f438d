// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Upload Module
//!
//! Multipart uploads and updates of drive files.
//!
//! - `instruction_set` - what the client asks for: storage, transit and manifest
//! - `descriptor` - the metadata part, sealed under the client's shared secret
//! - `package` - bounded registry of in-flight packages
//! - `validator` - ACL and metadata checks run before anything is committed
//! - `assembler` - new files and overwrites
//! - `update` - payload-level updates, local or peer

pub mod assembler;
pub mod descriptor;
pub mod instruction_set;
pub mod package;
pub mod update;
pub mod validator;

pub use assembler::{UploadPackageAssembler, UploadResult};
pub use descriptor::{UploadFileDescriptor, UploadFileMetadata};
pub use instruction_set::{FileUpdateInstructionSet, TransitOptions, UploadInstructionSet};
pub use package::{PackageId, PackageRegistry};
pub use update::{FileUpdatePipeline, UpdateResult};
