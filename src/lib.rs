// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identity Drive Server
//!
//! Hosts one or more identities, each with its own drives of files. Files
//! are uploaded in multipart packages, committed atomically and distributed
//! to connected identities over peer transit, with an outbox that retries
//! deliveries a recipient could not take right away.
//!
//! ## Modules
//!
//! - `api` - HTTP API handlers (Axum)
//! - `auth` - Client tokens and caller contexts
//! - `drive` - Drives, file headers and their storage
//! - `upload` - Upload packages and payload updates
//! - `transit` - Peer sending, outbox and remote queries
//! - `perimeter` - Requests arriving from other identities' hosts
//! - `tenant` - Per-identity wiring of the above

pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod drive;
pub mod error;
pub mod models;
pub mod perimeter;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod tenant;
pub mod transit;
pub mod upload;

#[cfg(test)]
mod test_support;
