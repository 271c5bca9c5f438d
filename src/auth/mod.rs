// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Module
//!
//! Local callers present `Authorization: Bearer <client token>`. The token
//! is resolved against the tenant's [`ClientRegistry`] into a
//! [`CallerContext`] that is threaded through every operation explicitly.
//!
//! Peers authenticate separately at the perimeter with the access token of
//! their identity connection.

pub mod clients;
pub mod context;
pub mod error;
pub mod extractor;
pub mod permissions;
pub mod token;

pub use clients::{ClientRegistry, RegisteredClient};
pub use context::{CallerContext, CallerIdentity, PermissionContext, RedactedCallerContext};
pub use error::AuthError;
pub use extractor::{PeerCaller, TenantCaller};
pub use permissions::{DriveGrant, DrivePermission, PermissionKey, PermissionSet};
pub use token::ClientAuthenticationToken;
