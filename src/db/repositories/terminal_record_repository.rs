use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use log::{debug, warn};

use crate::error::AppError;
use crate::services::log_sink::{LogSink, RecordKind, SinkRecord};

/// Writes terminal uploads into a flat table.
///
/// Expected layout (managed outside this service):
///
/// ```sql
/// CREATE TABLE terminal_records (
///     id BIGSERIAL PRIMARY KEY,
///     cmd TEXT NOT NULL,
///     sn TEXT NOT NULL,
///     enrollid BIGINT,
///     aliasid TEXT,
///     name TEXT,
///     time TEXT,
///     mode BIGINT,
///     "inout" BIGINT,
///     event BIGINT,
///     detail JSONB,
///     received_at TIMESTAMPTZ NOT NULL DEFAULT now()
/// );
/// ```
#[derive(Debug, Clone)]
pub struct TerminalRecordRepository {
    db_pool: PgPool,
    table: String,
}

impl TerminalRecordRepository {
    /// `table` must already be a validated identifier.
    pub fn new(db_pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            db_pool,
            table: table.into(),
        }
    }

    /// Inserts one batch in a single transaction, preserving record order.
    pub async fn insert_batch(
        &self,
        device_sn: &str,
        kind: RecordKind,
        records: &[SinkRecord],
    ) -> Result<u64, AppError> {
        if records.is_empty() {
            return Ok(0);
        }

        let statements = insert_statements(&self.table, device_sn, kind, records)?;
        let mut tx = self.db_pool.begin().await?;
        let mut inserted = 0;
        for mut builder in statements {
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        debug!(
            "Inserted {} {} rows for {} into {}",
            inserted,
            kind,
            device_sn,
            self.table
        );

        Ok(inserted)
    }
}

/// Bind parameters per row
const COLUMNS: usize = 10;

/// PostgreSQL caps a statement at 65535 bind parameters
const MAX_ROWS_PER_STATEMENT: usize = u16::MAX as usize / COLUMNS;

fn insert_statements<'a>(
    table: &str,
    device_sn: &'a str,
    kind: RecordKind,
    records: &'a [SinkRecord],
) -> Result<Vec<QueryBuilder<'a, Postgres>>, AppError> {
    records
        .chunks(MAX_ROWS_PER_STATEMENT)
        .map(|chunk| insert_statement(table, device_sn, kind, chunk))
        .collect()
}

fn insert_statement<'a>(
    table: &str,
    device_sn: &'a str,
    kind: RecordKind,
    records: &'a [SinkRecord],
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} (cmd, sn, enrollid, aliasid, name, time, mode, \"inout\", event, detail) ",
        table
    ));

    let details = records
        .iter()
        .map(|record| match record {
            SinkRecord::Registration(devinfo) => serde_json::to_value(devinfo).map(Some),
            SinkRecord::Access(_) => Ok(None),
        })
        .collect::<Result<Vec<_>, _>>()?;

    builder.push_values(records.iter().zip(details), |mut row, (record, detail)| {
        row.push_bind(kind.as_str()).push_bind(device_sn);
        match record {
            SinkRecord::Registration(_) => {
                row.push_bind(None::<i64>)
                    .push_bind(None::<String>)
                    .push_bind(None::<String>)
                    .push_bind(None::<String>)
                    .push_bind(None::<i64>)
                    .push_bind(None::<i64>)
                    .push_bind(None::<i64>);
            }
            SinkRecord::Access(log) => {
                row.push_bind(log.enrollid)
                    .push_bind(log.aliasid.clone())
                    .push_bind(log.name.clone())
                    .push_bind(log.time.clone())
                    .push_bind(log.mode)
                    .push_bind(log.inout)
                    .push_bind(log.event);
            }
        }
        row.push_bind(detail.map(sqlx::types::Json));
    });

    Ok(builder)
}

#[async_trait]
impl LogSink for TerminalRecordRepository {
    async fn append_records(
        &self,
        device_sn: &str,
        kind: RecordKind,
        records: Vec<SinkRecord>,
    ) -> Result<(), AppError> {
        self.insert_batch(device_sn, kind, &records)
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!("Failed to persist {} records for {}: {}", kind, device_sn, e);
                e
            })
    }
}
