//! CDR ingestion.
//!
//! The PBX writes one row per finished call into a CDR table. At startup the
//! most recent rows are loaded; afterwards rows newer than the newest seen
//! `calldate` are fetched on a fixed interval. Rows become CDR-provenance
//! [`HistoryRecord`]s and go through the engine's deduplicating merge.
//!
//! Failure to reach the database at startup disables ingestion for the rest
//! of the process; event-sourced history keeps working. Failures of later
//! polls are retried on the next interval.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::Row;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use callwatch_core::{
    classify_extension, extension_from_channel, is_short_extension, parse_pbx_timestamp,
    CallDirection, Disposition, Extension, ExtensionKind, HistoryRecord, Provenance,
};
use callwatch_protocol::CdrEvent;

use crate::config::CdrConfig;
use crate::db::{self, DbError};
use crate::engine::EngineHandle;
use crate::leads::LeadCache;

#[derive(Debug, Error)]
pub enum CdrError {
    #[error("CDR query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("no CDR table found")]
    NoTable,

    #[error("engine channel closed")]
    EngineClosed,
}

/// One row of the CDR table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdrRow {
    /// Call start, as stored by the PBX
    pub calldate: NaiveDateTime,
    pub src: String,
    pub dst: String,
    /// `incoming`, `outgoing` or `local`
    pub call_type: String,
    pub disposition: String,
    pub duration: i64,
    pub billsec: i64,
    /// End of call as epoch seconds, when the table has the column
    pub timestamp_end: Option<i64>,
}

/// Source of CDR rows, newest first.
#[async_trait]
pub trait CdrSource: Send + Sync {
    async fn recent(&self, limit: u32) -> Result<Vec<CdrRow>, CdrError>;

    async fn newer_than(&self, after: NaiveDateTime, limit: u32) -> Result<Vec<CdrRow>, CdrError>;
}

// ============================================================================
// Record Conversion
// ============================================================================

fn is_agent(value: &str) -> bool {
    is_short_extension(value) && classify_extension(value) == ExtensionKind::Agent
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Converts a CDR row into a history record.
///
/// Outgoing rows have the agent in `src`, all others in `dst`. Rows whose
/// agent side is not a 2-4 digit extension are not agent calls.
pub fn record_from_row(row: &CdrRow) -> Option<HistoryRecord> {
    let direction = CallDirection::from_call_type(&row.call_type);
    let (agent, phone) = if direction == CallDirection::Outgoing {
        (row.src.trim(), row.dst.trim())
    } else {
        (row.dst.trim(), row.src.trim())
    };
    if !is_agent(agent) {
        return None;
    }

    let started_at = row.calldate.and_utc();
    let duration = u64::try_from(row.duration).unwrap_or(0);
    let billable = u64::try_from(row.billsec).unwrap_or(0);
    let ended_at = row
        .timestamp_end
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(|| started_at + chrono::Duration::seconds(row.duration.max(0)));

    let mut record = HistoryRecord::new(Provenance::Cdr, Extension::new(agent), started_at);
    record.phone = non_empty(phone);
    record.src = non_empty(&row.src);
    record.dst = non_empty(&row.dst);
    record.direction = direction.refine_for_counterpart(record.phone.as_deref());
    record.disposition = Disposition::from_cdr(&row.disposition);
    record.duration_secs = duration;
    record.billable_secs = billable;
    if billable > 0 {
        record.answered_at = Some(ended_at - chrono::Duration::seconds(row.billsec));
    }
    record.ended_at = Some(ended_at);
    Some(record)
}

/// Converts a CDR event from the management interface into a history record.
///
/// The agent is taken from the source channel, else the destination
/// channel; the phone is the other side.
pub fn record_from_cdr_event(event: &CdrEvent) -> Option<HistoryRecord> {
    let source_ext = event.channel.as_deref().and_then(extension_from_channel);
    let dest_ext = event
        .destination_channel
        .as_deref()
        .and_then(extension_from_channel);
    let (extension, agent_is_source) = match (source_ext, dest_ext) {
        (Some(ext), _) => (ext, true),
        (None, Some(ext)) => (ext, false),
        (None, None) => return None,
    };

    let Some(started_at) = event
        .start_time
        .as_deref()
        .and_then(|t| parse_pbx_timestamp(t).ok())
    else {
        debug!(extension = %extension, "CDR event without a usable start time");
        return None;
    };

    let phone = if agent_is_source {
        event.destination.as_deref()
    } else {
        event.source.as_deref()
    };
    let direction = if agent_is_source {
        CallDirection::Outgoing
    } else {
        CallDirection::Incoming
    };

    let mut record = HistoryRecord::new(Provenance::Cdr, extension, started_at);
    record.phone = phone.and_then(non_empty);
    record.src = event.source.as_deref().and_then(non_empty);
    record.dst = event.destination.as_deref().and_then(non_empty);
    record.direction = direction.refine_for_counterpart(record.phone.as_deref());
    record.disposition = Disposition::from_cdr(event.disposition.as_deref().unwrap_or(""));
    record.duration_secs = event.duration;
    record.billable_secs = event.billable_seconds;
    record.answered_at = event
        .answer_time
        .as_deref()
        .and_then(|t| parse_pbx_timestamp(t).ok());
    record.ended_at = event
        .end_time
        .as_deref()
        .and_then(|t| parse_pbx_timestamp(t).ok());
    Some(record)
}

// ============================================================================
// MySQL Source
// ============================================================================

const AGENT_FILTER: &str = "((dst REGEXP '^[0-9]{2,4}$' AND call_type = 'incoming') \
     OR (src REGEXP '^[0-9]{2,4}$' AND call_type = 'outgoing'))";

pub struct MySqlCdrSource {
    pool: MySqlPool,
    table: String,
    has_end_column: bool,
}

impl MySqlCdrSource {
    /// Connects and locates the CDR table.
    ///
    /// Uses `preferred` when it exists, else the first table whose name
    /// contains `cdr`.
    pub async fn connect(database_url: &str, preferred: &str) -> Result<Self, CdrError> {
        let pool = db::connect(database_url).await?;
        let table = discover_table(&pool, preferred).await?;
        let quoted = db::quote_identifier(&table)?;

        let end_column = sqlx::query(&format!("SHOW COLUMNS FROM {quoted} LIKE 'timestamp_end'"))
            .fetch_optional(&pool)
            .await?;
        info!(table = %table, "Using CDR table");

        Ok(Self {
            pool,
            table: quoted,
            has_end_column: end_column.is_some(),
        })
    }

    fn select(&self, condition: &str) -> String {
        let end = if self.has_end_column {
            "CAST(timestamp_end AS SIGNED)"
        } else {
            "NULL"
        };
        format!(
            "SELECT calldate, CAST(src AS CHAR) AS src, CAST(dst AS CHAR) AS dst, \
             call_type, disposition, CAST(duration AS SIGNED) AS duration, \
             CAST(billsec AS SIGNED) AS billsec, {end} AS timestamp_end \
             FROM {table} WHERE {condition} ORDER BY calldate DESC LIMIT ?",
            table = self.table,
        )
    }
}

async fn discover_table(pool: &MySqlPool, preferred: &str) -> Result<String, CdrError> {
    let exact = sqlx::query("SHOW TABLES LIKE ?")
        .bind(preferred)
        .fetch_optional(pool)
        .await?;
    if exact.is_some() {
        return Ok(preferred.to_string());
    }
    let fallback = sqlx::query("SHOW TABLES LIKE '%cdr%'")
        .fetch_optional(pool)
        .await?;
    match fallback {
        Some(row) => {
            let name: String = row.try_get(0)?;
            warn!(preferred = %preferred, found = %name, "Preferred CDR table missing, using fallback");
            Ok(name)
        }
        None => Err(CdrError::NoTable),
    }
}

fn row_to_cdr(row: &MySqlRow) -> Result<CdrRow, sqlx::Error> {
    let src: Option<String> = row.try_get("src")?;
    let dst: Option<String> = row.try_get("dst")?;
    let call_type: Option<String> = row.try_get("call_type")?;
    let disposition: Option<String> = row.try_get("disposition")?;
    let duration: Option<i64> = row.try_get("duration")?;
    let billsec: Option<i64> = row.try_get("billsec")?;
    Ok(CdrRow {
        calldate: row.try_get("calldate")?,
        src: src.unwrap_or_default(),
        dst: dst.unwrap_or_default(),
        call_type: call_type.unwrap_or_default(),
        disposition: disposition.unwrap_or_default(),
        duration: duration.unwrap_or(0),
        billsec: billsec.unwrap_or(0),
        timestamp_end: row.try_get("timestamp_end")?,
    })
}

#[async_trait]
impl CdrSource for MySqlCdrSource {
    async fn recent(&self, limit: u32) -> Result<Vec<CdrRow>, CdrError> {
        let rows = sqlx::query(&self.select(AGENT_FILTER))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_cdr).collect::<Result<_, _>>()?)
    }

    async fn newer_than(&self, after: NaiveDateTime, limit: u32) -> Result<Vec<CdrRow>, CdrError> {
        let condition = format!("calldate > ? AND {AGENT_FILTER}");
        let rows = sqlx::query(&self.select(&condition))
            .bind(after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_cdr).collect::<Result<_, _>>()?)
    }
}

// ============================================================================
// Ingester
// ============================================================================

/// Pulls CDR rows and hands enriched records to the engine.
pub struct CdrIngester {
    source: Arc<dyn CdrSource>,
    leads: Option<LeadCache>,
    engine: EngineHandle,
    bootstrap_limit: u32,
    poll_limit: u32,
    last_seen: Option<NaiveDateTime>,
}

impl CdrIngester {
    pub fn new(
        source: Arc<dyn CdrSource>,
        leads: Option<LeadCache>,
        engine: EngineHandle,
        config: &CdrConfig,
    ) -> Self {
        Self {
            source,
            leads,
            engine,
            bootstrap_limit: config.bootstrap_limit,
            poll_limit: config.poll_limit,
            last_seen: None,
        }
    }

    /// Newest `calldate` seen so far.
    pub fn last_seen(&self) -> Option<NaiveDateTime> {
        self.last_seen
    }

    /// Loads the most recent rows. Returns how many agent records were built.
    pub async fn bootstrap(&mut self) -> Result<usize, CdrError> {
        let rows = self.source.recent(self.bootstrap_limit).await?;
        self.ingest(rows).await
    }

    /// Loads rows newer than the last one seen.
    pub async fn poll_once(&mut self) -> Result<usize, CdrError> {
        let Some(after) = self.last_seen else {
            return self.bootstrap().await;
        };
        let rows = self.source.newer_than(after, self.poll_limit).await?;
        self.ingest(rows).await
    }

    async fn ingest(&mut self, rows: Vec<CdrRow>) -> Result<usize, CdrError> {
        if let Some(newest) = rows.iter().map(|r| r.calldate).max() {
            self.last_seen = Some(self.last_seen.map_or(newest, |seen| seen.max(newest)));
        }

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(mut record) = record_from_row(row) else {
                continue;
            };
            if let Some(leads) = &self.leads {
                record.lead = leads.resolve_caller(record.phone.as_deref(), None).await;
            }
            records.push(record);
        }

        let count = records.len();
        if count > 0 {
            self.engine
                .merge_history(records)
                .await
                .map_err(|_| CdrError::EngineClosed)?;
        }
        Ok(count)
    }
}

/// Connects to the CDR database and runs ingestion until cancelled.
///
/// Returns `None` when no database is configured.
pub fn spawn_cdr_ingestion(
    config: CdrConfig,
    leads: Option<LeadCache>,
    engine: EngineHandle,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    let url = config.database_url.clone()?;
    Some(tokio::spawn(async move {
        let source = tokio::select! {
            _ = cancel.cancelled() => return,
            source = MySqlCdrSource::connect(&url, &config.table) => source,
        };
        match source {
            Ok(source) => {
                let ingester = CdrIngester::new(Arc::new(source), leads, engine, &config);
                run_cdr_ingestion(ingester, config.poll_interval(), cancel).await;
            }
            Err(e) => {
                warn!(error = %e, "CDR ingestion disabled");
                let _ = engine.set_cdr_enabled(false).await;
            }
        }
    }))
}

/// Bootstraps, then polls every `every` until cancelled.
pub async fn run_cdr_ingestion(
    mut ingester: CdrIngester,
    every: Duration,
    cancel: CancellationToken,
) {
    match ingester.bootstrap().await {
        Ok(count) => info!(count, "Loaded CDR history"),
        Err(e) => {
            warn!(error = %e, "CDR ingestion disabled: initial load failed");
            let _ = ingester.engine.set_cdr_enabled(false).await;
            return;
        }
    }
    if ingester.engine.set_cdr_enabled(true).await.is_err() {
        return;
    }

    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match ingester.poll_once().await {
            Ok(0) => {}
            Ok(count) => debug!(count, "Ingested new CDR rows"),
            Err(CdrError::EngineClosed) => break,
            Err(e) => debug!(error = %e, "CDR poll failed, retrying next interval"),
        }
    }
    info!("CDR ingestion stopped");
}
