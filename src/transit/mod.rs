// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Transit Module
//!
//! Moving files between identities.
//!
//! ```text
//! upload ──▶ PeerTransitSender ──deliver──▶ PeerTransport ──▶ peer perimeter
//!                 │    ▲
//!        retryable│    │process_outbox (OutboxPoller)
//!                 ▼    │
//!               Outbox (redb)
//! ```
//!
//! - `icr` - identity connection registrations and their access tokens
//! - `sender` - send, update and delete-linked-file fan-out
//! - `outbox` - durable queue of retryable deliveries
//! - `poller` - background outbox sweeps
//! - `query` - reading files held by other identities
//! - `transport` - HTTP and in-process peer transports
//! - `wire` - request and response bodies shared with peers

pub mod icr;
pub mod outbox;
pub mod poller;
pub mod query;
pub mod retry;
pub mod sender;
pub mod transport;
pub mod types;
pub mod wire;

pub use icr::{connect_identities, ConnectionRegistry};
pub use outbox::{Outbox, RetryPolicy};
pub use poller::OutboxPoller;
pub use query::TransitQueryService;
pub use retry::ImmediateRetry;
pub use sender::{PeerTransitSender, SenderSettings};
pub use transport::{HostedPeerTransport, HostedPerimeters, HttpPeerTransport, PeerTransport};
pub use types::{TransferFailureReason, TransferStatus};
