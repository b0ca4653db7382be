//! Lead lookup by phone number or email.
//!
//! [`LeadCache`] sits in front of a [`LeadSource`] and caches every answer,
//! misses included, for a fixed TTL. Concurrent lookups of the same key are
//! coalesced into one query. Failed queries are not cached and resolve to
//! "no lead".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, warn};

use callwatch_core::{normalize_email, normalize_phone, parse_alias, LeadIdentity};

use crate::db::{self, DbError};

/// Trailing digits compared when an exact phone match fails.
pub const SUFFIX_DIGITS: usize = 10;

#[derive(Debug, Error)]
pub enum LeadError {
    #[error("lead query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Backing store of leads.
#[async_trait]
pub trait LeadSource: Send + Sync {
    /// Exact match on a normalized phone number.
    async fn find_by_phone(&self, phone: &str) -> Result<Option<LeadIdentity>, LeadError>;

    /// Match on the trailing digits of the stored number.
    async fn find_by_phone_suffix(&self, digits: &str) -> Result<Option<LeadIdentity>, LeadError>;

    /// Case-insensitive exact match on a normalized email.
    async fn find_by_email(&self, email: &str) -> Result<Option<LeadIdentity>, LeadError>;
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Clone)]
pub struct LeadCache {
    source: Arc<dyn LeadSource>,
    phones: Cache<String, Option<LeadIdentity>>,
    emails: Cache<String, Option<LeadIdentity>>,
}

impl LeadCache {
    pub fn new(source: Arc<dyn LeadSource>, ttl: Duration, capacity: u64) -> Self {
        Self {
            source,
            phones: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            emails: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Looks up a lead by phone. Numbers shorter than 5 characters after
    /// normalization are never queried.
    pub async fn lookup_phone(&self, raw: &str) -> Option<LeadIdentity> {
        let key = normalize_phone(raw)?;
        let source = Arc::clone(&self.source);
        let query = key.clone();
        let result = self
            .phones
            .try_get_with(key, async move { resolve_phone(source.as_ref(), &query).await })
            .await;
        match result {
            Ok(lead) => lead,
            Err(e) => {
                warn!(phone = %raw, error = %e, "Lead lookup failed");
                None
            }
        }
    }

    pub async fn lookup_email(&self, raw: &str) -> Option<LeadIdentity> {
        let key = normalize_email(raw)?;
        let source = Arc::clone(&self.source);
        let query = key.clone();
        let result = self
            .emails
            .try_get_with(key, async move { source.find_by_email(&query).await })
            .await;
        match result {
            Ok(lead) => lead,
            Err(e) => {
                warn!(error = %e, "Lead lookup by email failed");
                None
            }
        }
    }

    /// Resolves the lead behind a caller.
    ///
    /// Tries the number first; when that yields nothing, scans the caller-id
    /// name for an embedded email, then for an embedded phone number.
    pub async fn resolve_caller(
        &self,
        number: Option<&str>,
        caller_name: Option<&str>,
    ) -> Option<LeadIdentity> {
        if let Some(number) = number {
            if let Some(lead) = self.lookup_phone(number).await {
                return Some(lead);
            }
        }
        let alias = parse_alias(caller_name.unwrap_or(""));
        if let Some(email) = alias.email.as_deref() {
            if let Some(lead) = self.lookup_email(email).await {
                return Some(lead);
            }
        }
        match alias.phone.as_deref() {
            Some(phone) => self.lookup_phone(phone).await,
            None => None,
        }
    }
}

async fn resolve_phone(source: &dyn LeadSource, phone: &str) -> Result<Option<LeadIdentity>, LeadError> {
    if let Some(lead) = source.find_by_phone(phone).await? {
        return Ok(Some(lead));
    }
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < SUFFIX_DIGITS {
        return Ok(None);
    }
    let suffix = &digits[digits.len() - SUFFIX_DIGITS..];
    debug!(suffix = %suffix, "No exact lead match, trying suffix");
    source.find_by_phone_suffix(suffix).await
}

// ============================================================================
// MySQL Source
// ============================================================================

/// Leads stored in a SQL table with columns
/// `id, first_name, last_name, email, phone, country`.
pub struct MySqlLeadSource {
    pool: MySqlPool,
    table: String,
}

impl MySqlLeadSource {
    pub fn new(pool: MySqlPool, table: &str) -> Result<Self, LeadError> {
        Ok(Self {
            pool,
            table: db::quote_identifier(table)?,
        })
    }

    fn select(&self, condition: &str) -> String {
        format!(
            "SELECT CAST(id AS CHAR) AS id, first_name, last_name, email, phone, country \
             FROM {} WHERE {} LIMIT 1",
            self.table, condition
        )
    }

    async fn fetch_one(&self, sql: &str, binds: &[&str]) -> Result<Option<LeadIdentity>, LeadError> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.map(|r| lead_from_row(&r)).transpose()
    }
}

fn lead_from_row(row: &sqlx::mysql::MySqlRow) -> Result<LeadIdentity, LeadError> {
    let id: String = row.try_get("id")?;
    let first: Option<String> = row.try_get("first_name")?;
    let last: Option<String> = row.try_get("last_name")?;
    Ok(LeadIdentity {
        id,
        display_name: LeadIdentity::full_name(first.as_deref(), last.as_deref()),
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        country: row.try_get("country")?,
    })
}

#[async_trait]
impl LeadSource for MySqlLeadSource {
    async fn find_by_phone(&self, phone: &str) -> Result<Option<LeadIdentity>, LeadError> {
        let bare = phone.trim_start_matches('+');
        let plus = format!("+{bare}");
        self.fetch_one(&self.select("phone = ? OR phone = ?"), &[bare, plus.as_str()])
            .await
    }

    async fn find_by_phone_suffix(&self, digits: &str) -> Result<Option<LeadIdentity>, LeadError> {
        let pattern = format!("%{digits}");
        self.fetch_one(&self.select("phone LIKE ?"), &[pattern.as_str()]).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<LeadIdentity>, LeadError> {
        self.fetch_one(&self.select("LOWER(email) = ?"), &[email]).await
    }
}
