//! Filters and paging for record listings.

use serde::Serialize;

use super::backup::{BackupRecord, BackupStatus, BackupType};
use crate::error::{AppError, Result};

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Record filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub server: Option<String>,
    pub database: Option<String>,
    pub backup_type: Option<BackupType>,
    /// Exclude deleted records.
    pub active_only: bool,
}

impl RecordFilter {
    pub fn validate(&self) -> Result<()> {
        if self.server.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(AppError::Validation("server filter must not be empty".into()));
        }
        if self.database.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(AppError::Validation(
                "database filter must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn matches(&self, record: &BackupRecord) -> bool {
        if let Some(server) = &self.server {
            if &record.server_name != server {
                return false;
            }
        }
        if let Some(database) = &self.database {
            if &record.database != database {
                return false;
            }
        }
        if let Some(backup_type) = self.backup_type {
            if record.backup_type != backup_type {
                return false;
            }
        }
        !(self.active_only && !record.is_active())
    }
}

/// Listing order by creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// A filtered, sorted, paged listing request.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub filter: RecordFilter,
    pub status: Option<BackupStatus>,
    pub sort: SortOrder,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: RecordFilter::default(),
            status: None,
            sort: SortOrder::default(),
            limit: 50,
            offset: 0,
        }
    }
}

impl ListQuery {
    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        if self.limit == 0 || self.limit > MAX_PAGE_SIZE {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }

    pub fn matches(&self, record: &BackupRecord) -> bool {
        self.filter.matches(record) && self.status.map_or(true, |s| record.status == s)
    }

    /// In-memory evaluation, for stores without a pushed-down query.
    pub fn apply(&self, records: Vec<BackupRecord>) -> Page<BackupRecord> {
        let mut matching: Vec<BackupRecord> =
            records.into_iter().filter(|r| self.matches(r)).collect();
        sort_records(&mut matching, self.sort);
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect();
        Page {
            items,
            total,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// Sort by creation time, ties broken by id so the order is stable.
pub fn sort_records(records: &mut [BackupRecord], order: SortOrder) {
    records.sort_by(|a, b| {
        let ord = a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id));
        match order {
            SortOrder::NewestFirst => ord.reverse(),
            SortOrder::OldestFirst => ord,
        }
    });
}

/// One page of results plus the unpaged total.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup::NewRecord;
    use chrono::{Duration, Utc};

    fn records() -> Vec<BackupRecord> {
        let base = Utc::now();
        (0..5)
            .map(|i| {
                let server = if i % 2 == 0 { "s1" } else { "s2" };
                BackupRecord::pending(
                    &NewRecord::new(server, "mysql", "db1", BackupType::Daily),
                    base - Duration::hours(i),
                )
            })
            .collect()
    }

    #[test]
    fn test_apply_filters_sorts_and_pages() {
        let query = ListQuery {
            filter: RecordFilter {
                server: Some("s1".into()),
                ..Default::default()
            },
            limit: 2,
            ..Default::default()
        };
        let page = query.apply(records());
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert!(page.items[0].created_at > page.items[1].created_at);

        let next = ListQuery {
            offset: 2,
            ..query.clone()
        };
        assert_eq!(next.apply(records()).items.len(), 1);
    }

    #[test]
    fn test_validation() {
        let mut query = ListQuery::default();
        assert!(query.validate().is_ok());
        query.limit = 0;
        assert!(query.validate().is_err());
        query.limit = MAX_PAGE_SIZE + 1;
        assert!(query.validate().is_err());

        let filter = RecordFilter {
            server: Some("  ".into()),
            ..Default::default()
        };
        assert!(matches!(filter.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_active_only_excludes_deleted() {
        let mut all = records();
        all[0].status = BackupStatus::Deleted;
        let filter = RecordFilter {
            active_only: true,
            ..Default::default()
        };
        assert_eq!(all.iter().filter(|r| filter.matches(r)).count(), 4);
    }
}
