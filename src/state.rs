// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::config::Config;
use crate::tenant::TenantRegistry;

#[derive(Clone)]
pub struct AppState {
    pub tenants: Arc<TenantRegistry>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(tenants: Arc<TenantRegistry>, config: Config) -> Self {
        Self {
            tenants,
            config: Arc::new(config),
        }
    }
}
