// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Axum extractor for authenticated local callers.
//!
//! ```rust,ignore
//! async fn handler(caller: TenantCaller) -> impl IntoResponse {
//!     // caller.tenant is the addressed identity, caller.ctx the caller context
//! }
//! ```
//!
//! Peer routes use [`PeerCaller`] instead: its credentials are checked by
//! the tenant's perimeter, not the client registry.

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{
        header::{AUTHORIZATION, HOST},
        request::Parts,
    },
};

use super::{AuthError, CallerContext, ClientAuthenticationToken};
use crate::models::IdentityId;
use crate::state::AppState;
use crate::tenant::Tenant;
use crate::transit::wire::{PEER_RECIPIENT_HEADER, PEER_SENDER_HEADER};

/// The addressed tenant plus the context of the client calling it.
pub struct TenantCaller {
    pub tenant: Arc<Tenant>,
    pub ctx: CallerContext,
}

impl FromRequestParts<AppState> for TenantCaller {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let tenant = resolve_tenant(parts, state)?;

        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::MissingAuthHeader)?
            .to_str()
            .map_err(|_| AuthError::InvalidAuthHeader)?;

        let portable = auth_header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidAuthHeader)?;

        let token = ClientAuthenticationToken::parse(portable).map_err(|_| AuthError::MalformedToken)?;
        let ctx = tenant.clients.resolve(&token)?;

        Ok(TenantCaller { tenant, ctx })
    }
}

/// The addressed tenant plus the unverified credentials of a calling host.
pub struct PeerCaller {
    pub tenant: Arc<Tenant>,
    pub sender: Option<IdentityId>,
    pub token: Option<ClientAuthenticationToken>,
}

impl FromRequestParts<AppState> for PeerCaller {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let tenant = resolve_tenant(parts, state)?;

        let sender = parts
            .headers
            .get(PEER_SENDER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        let token = match parts.headers.get(AUTHORIZATION) {
            None => None,
            Some(value) => {
                let portable = value
                    .to_str()
                    .ok()
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .ok_or(AuthError::InvalidAuthHeader)?;
                Some(ClientAuthenticationToken::parse(portable).map_err(|_| AuthError::MalformedToken)?)
            }
        };

        Ok(PeerCaller { tenant, sender, token })
    }
}

/// Find the hosted identity a request is addressed to.
///
/// The explicit recipient header wins over `Host`, so peers can reach an
/// identity through a shared address.
pub fn resolve_tenant(parts: &Parts, state: &AppState) -> Result<Arc<Tenant>, AuthError> {
    let host = parts
        .headers
        .get(PEER_RECIPIENT_HEADER)
        .or_else(|| parts.headers.get(HOST))
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .ok_or_else(|| AuthError::UnknownTenant(String::new()))?;

    let identity: IdentityId = host
        .parse()
        .map_err(|_| AuthError::UnknownTenant(host.clone()))?;

    state
        .tenants
        .get(&identity)
        .ok_or(AuthError::UnknownTenant(host))
}
