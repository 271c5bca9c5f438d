// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Drive queries over stored file headers.
//!
//! Headers are scanned rather than indexed. Batch pages are ordered newest
//! first and use an offset cursor; modified pages are ordered by update time
//! and use the last update time seen as cursor.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::{FileMetadata, ServerFileHeader};
use crate::models::{IdentityId, TargetDrive};

pub const DEFAULT_MAX_RECORDS: usize = 100;

fn default_max_records() -> usize {
    DEFAULT_MAX_RECORDS
}

/// Filters on app metadata. An empty list means "any".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileQueryParams {
    pub target_drive: TargetDrive,
    #[serde(default)]
    pub file_type: Vec<i32>,
    #[serde(default)]
    pub data_type: Vec<i32>,
    #[serde(default)]
    pub global_transit_id: Vec<Uuid>,
    #[serde(default)]
    pub client_unique_id_at_least_one: Vec<Uuid>,
    #[serde(default)]
    pub tags_match_at_least_one: Vec<Uuid>,
    #[serde(default)]
    pub group_id: Vec<Uuid>,
    #[serde(default)]
    pub sender_id: Vec<IdentityId>,
    #[serde(default)]
    pub archival_status: Vec<i32>,
}

impl FileQueryParams {
    pub fn for_drive(target_drive: TargetDrive) -> Self {
        Self {
            target_drive,
            file_type: Vec::new(),
            data_type: Vec::new(),
            global_transit_id: Vec::new(),
            client_unique_id_at_least_one: Vec::new(),
            tags_match_at_least_one: Vec::new(),
            group_id: Vec::new(),
            sender_id: Vec::new(),
            archival_status: Vec::new(),
        }
    }

    pub fn matches(&self, metadata: &FileMetadata) -> bool {
        let app = &metadata.app_data;
        any_or(&self.file_type, |t| *t == app.file_type)
            && any_or(&self.data_type, |t| *t == app.data_type)
            && any_or(&self.archival_status, |s| *s == app.archival_status)
            && any_or(&self.global_transit_id, |g| metadata.global_transit_id == Some(*g))
            && any_or(&self.client_unique_id_at_least_one, |u| app.unique_id == Some(*u))
            && any_or(&self.group_id, |g| app.group_id == Some(*g))
            && any_or(&self.tags_match_at_least_one, |t| app.tags.contains(t))
            && any_or(&self.sender_id, |s| metadata.sender_identity.as_ref() == Some(s))
    }
}

fn any_or<T>(filter: &[T], pred: impl Fn(&T) -> bool) -> bool {
    filter.is_empty() || filter.iter().any(pred)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBatchOptions {
    #[serde(default)]
    pub cursor_state: Option<String>,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for QueryBatchOptions {
    fn default() -> Self {
        Self {
            cursor_state: None,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryModifiedOptions {
    #[serde(default)]
    pub cursor: Option<i64>,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for QueryModifiedOptions {
    fn default() -> Self {
        Self {
            cursor: None,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchPage {
    pub headers: Vec<ServerFileHeader>,
    pub cursor_state: String,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct ModifiedPage {
    pub headers: Vec<ServerFileHeader>,
    pub cursor: i64,
    pub has_more: bool,
}

/// Newest-first page of the headers matching `params`.
pub fn batch(mut headers: Vec<ServerFileHeader>, params: &FileQueryParams, options: &QueryBatchOptions) -> BatchPage {
    headers.retain(|h| params.matches(&h.file_metadata));
    headers.sort_by(|a, b| {
        b.file_metadata
            .created
            .cmp(&a.file_metadata.created)
            .then_with(|| file_id(b).cmp(&file_id(a)))
    });

    let offset = options
        .cursor_state
        .as_deref()
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(0)
        .min(headers.len());
    let end = offset.saturating_add(options.max_records).min(headers.len());
    let has_more = end < headers.len();
    let page = headers.drain(offset..end).collect();

    BatchPage {
        headers: page,
        cursor_state: end.to_string(),
        has_more,
    }
}

/// Headers updated after the cursor, oldest update first.
pub fn modified(
    mut headers: Vec<ServerFileHeader>,
    params: &FileQueryParams,
    options: &QueryModifiedOptions,
) -> ModifiedPage {
    let since = options.cursor.unwrap_or(0);
    headers.retain(|h| h.file_metadata.updated > since && params.matches(&h.file_metadata));
    headers.sort_by_key(|h| (h.file_metadata.updated, file_id(h)));

    let has_more = headers.len() > options.max_records;
    headers.truncate(options.max_records);
    let cursor = headers.last().map_or(since, |h| h.file_metadata.updated);

    ModifiedPage {
        headers,
        cursor,
        has_more,
    }
}

fn file_id(header: &ServerFileHeader) -> Uuid {
    header.file_metadata.file.map(|f| f.file_id).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_header;

    fn drive() -> TargetDrive {
        TargetDrive::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn filters_match_app_data() {
        let mut header = sample_header(Uuid::new_v4(), 10);
        header.file_metadata.app_data.file_type = 7;
        header.file_metadata.app_data.tags = vec![Uuid::from_u128(1)];

        let mut params = FileQueryParams::for_drive(drive());
        assert!(params.matches(&header.file_metadata));

        params.file_type = vec![7, 8];
        params.tags_match_at_least_one = vec![Uuid::from_u128(1), Uuid::from_u128(2)];
        assert!(params.matches(&header.file_metadata));

        params.data_type = vec![3];
        assert!(!params.matches(&header.file_metadata));
    }

    #[test]
    fn batch_pages_newest_first() {
        let drive_id = Uuid::new_v4();
        let headers: Vec<_> = (1..=5).map(|i| sample_header(drive_id, i * 100)).collect();
        let params = FileQueryParams::for_drive(drive());

        let first = batch(
            headers.clone(),
            &params,
            &QueryBatchOptions {
                cursor_state: None,
                max_records: 2,
            },
        );
        assert_eq!(first.headers.len(), 2);
        assert_eq!(first.headers[0].file_metadata.created, 500);
        assert!(first.has_more);

        let last = batch(
            headers,
            &params,
            &QueryBatchOptions {
                cursor_state: Some("4".to_string()),
                max_records: 2,
            },
        );
        assert_eq!(last.headers.len(), 1);
        assert_eq!(last.headers[0].file_metadata.created, 100);
        assert!(!last.has_more);
    }

    #[test]
    fn modified_uses_update_cursor() {
        let drive_id = Uuid::new_v4();
        let headers: Vec<_> = (1..=4).map(|i| sample_header(drive_id, i * 10)).collect();
        let params = FileQueryParams::for_drive(drive());

        let page = modified(
            headers,
            &params,
            &QueryModifiedOptions {
                cursor: Some(15),
                max_records: 2,
            },
        );
        let updated: Vec<i64> = page.headers.iter().map(|h| h.file_metadata.updated).collect();
        assert_eq!(updated, vec![20, 30]);
        assert_eq!(page.cursor, 30);
        assert!(page.has_more);
    }
}
