use crate::reading::{Measurement, MeasurementColumns, Reading};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgConnection, PgPool, Postgres, QueryBuilder};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

#[cfg(test)]
mod tests;

/// Ten columns per row keeps each INSERT well under Postgres' 65535 bind limit.
const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub updated: usize,
}

/// Durable sink for reading batches.
pub trait ReadingStore: Send + Sync + 'static {
    /// Commits `readings` in one transaction, overwriting rows whose id already exists.
    fn save_batch(&self, readings: &[Reading]) -> impl Future<Output = Result<BatchOutcome>> + Send;

    fn is_connected(&self) -> impl Future<Output = bool> + Send;
}

#[derive(Clone)]
pub struct PgReadingStore {
    pool: PgPool,
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(8))
        .connect(database_url)
        .await
        .context("connect to reading store")?;
    Ok(pool)
}

impl PgReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensor_readings (
                id varchar(255) primary key,
                sensor_id varchar(255) not null,
                type varchar(100) not null,
                location varchar(255) not null,
                timestamp timestamptz not null,
                energy_consumption numeric(18,2) null,
                co2 integer null,
                pm25 integer null,
                humidity integer null,
                motion_detected boolean null
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("create sensor_readings")?;

        for (name, column) in [
            ("idx_sensor_readings_sensor_id", "sensor_id"),
            ("idx_sensor_readings_timestamp", "timestamp"),
            ("idx_sensor_readings_type", "type"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {name} ON sensor_readings ({column})"
            ))
            .execute(&self.pool)
            .await
            .with_context(|| format!("create index {name}"))?;
        }
        Ok(())
    }

    pub async fn save_batch(&self, readings: &[Reading]) -> Result<BatchOutcome> {
        if readings.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let latest = latest_by_id(readings);
        if latest.len() < readings.len() {
            tracing::debug!(
                received = readings.len(),
                unique = latest.len(),
                "collapsed duplicate reading ids in batch"
            );
        }
        let ids: Vec<String> = latest.iter().map(|reading| reading.id.clone()).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin reading batch transaction")?;

        let existing: HashSet<String> = sqlx::query_scalar::<_, String>(
            "SELECT id FROM sensor_readings WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .context("load existing reading ids")?
        .into_iter()
        .collect();

        let (updates, mut inserts): (Vec<&Reading>, Vec<&Reading>) = latest
            .into_iter()
            .partition(|reading| existing.contains(&reading.id));
        // Concurrent batches take index locks in the same order.
        inserts.sort_by(|a, b| a.id.cmp(&b.id));

        for reading in &updates {
            update_reading(&mut *tx, reading).await?;
        }
        for chunk in inserts.chunks(INSERT_CHUNK_ROWS) {
            insert_readings(&mut *tx, chunk).await?;
        }

        tx.commit().await.context("commit reading batch")?;

        Ok(BatchOutcome {
            inserted: inserts.len(),
            updated: updates.len(),
        })
    }

    pub async fn is_connected(&self) -> bool {
        if self.pool.is_closed() {
            return false;
        }
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error=%err, "reading store connectivity probe failed");
                false
            }
        }
    }

    pub async fn fetch_reading(&self, id: &str) -> Result<Option<Reading>> {
        let row = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT id, sensor_id, type, location, timestamp,
                   energy_consumption, co2, pm25, humidity, motion_detected
            FROM sensor_readings
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Reading::from))
    }
}

impl ReadingStore for PgReadingStore {
    async fn save_batch(&self, readings: &[Reading]) -> Result<BatchOutcome> {
        PgReadingStore::save_batch(self, readings).await
    }

    async fn is_connected(&self) -> bool {
        PgReadingStore::is_connected(self).await
    }
}

/// Keeps one reading per id: the last occurrence wins, placed where the id first appeared.
pub(crate) fn latest_by_id(readings: &[Reading]) -> Vec<&Reading> {
    let mut positions: HashMap<&str, usize> = HashMap::with_capacity(readings.len());
    let mut latest: Vec<&Reading> = Vec::with_capacity(readings.len());
    for reading in readings {
        match positions.get(reading.id.as_str()) {
            Some(&idx) => latest[idx] = reading,
            None => {
                positions.insert(reading.id.as_str(), latest.len());
                latest.push(reading);
            }
        }
    }
    latest
}

async fn update_reading(conn: &mut PgConnection, reading: &Reading) -> Result<()> {
    let columns = reading.measurement.columns();
    sqlx::query(
        r#"
        UPDATE sensor_readings
        SET sensor_id = $2,
            type = $3,
            location = $4,
            timestamp = $5,
            energy_consumption = $6,
            co2 = $7,
            pm25 = $8,
            humidity = $9,
            motion_detected = $10
        WHERE id = $1
        "#,
    )
    .bind(&reading.id)
    .bind(&reading.sensor_id)
    .bind(reading.kind())
    .bind(&reading.location)
    .bind(reading.timestamp)
    .bind(columns.energy_consumption)
    .bind(columns.co2)
    .bind(columns.pm25)
    .bind(columns.humidity)
    .bind(columns.motion_detected)
    .execute(conn)
    .await
    .with_context(|| format!("update reading {}", reading.id))?;
    Ok(())
}

async fn insert_readings(conn: &mut PgConnection, readings: &[&Reading]) -> Result<()> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO sensor_readings (id, sensor_id, type, location, timestamp, \
         energy_consumption, co2, pm25, humidity, motion_detected) ",
    );
    builder.push_values(readings.iter(), |mut b, reading| {
        let columns = reading.measurement.columns();
        b.push_bind(&reading.id)
            .push_bind(&reading.sensor_id)
            .push_bind(reading.kind())
            .push_bind(&reading.location)
            .push_bind(reading.timestamp)
            .push_bind(columns.energy_consumption)
            .push_bind(columns.co2)
            .push_bind(columns.pm25)
            .push_bind(columns.humidity)
            .push_bind(columns.motion_detected);
    });
    // A concurrent batch may have inserted the same id since our snapshot.
    builder.push(
        " ON CONFLICT (id) DO UPDATE SET \
         sensor_id = EXCLUDED.sensor_id, \
         type = EXCLUDED.type, \
         location = EXCLUDED.location, \
         timestamp = EXCLUDED.timestamp, \
         energy_consumption = EXCLUDED.energy_consumption, \
         co2 = EXCLUDED.co2, \
         pm25 = EXCLUDED.pm25, \
         humidity = EXCLUDED.humidity, \
         motion_detected = EXCLUDED.motion_detected",
    );

    builder
        .build()
        .execute(conn)
        .await
        .with_context(|| format!("insert {} readings", readings.len()))?;
    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
struct ReadingRow {
    id: String,
    sensor_id: String,
    #[sqlx(rename = "type")]
    kind: String,
    location: String,
    timestamp: DateTime<Utc>,
    energy_consumption: Option<Decimal>,
    co2: Option<i32>,
    pm25: Option<i32>,
    humidity: Option<i32>,
    motion_detected: Option<bool>,
}

impl From<ReadingRow> for Reading {
    fn from(row: ReadingRow) -> Self {
        let columns = MeasurementColumns {
            energy_consumption: row.energy_consumption,
            co2: row.co2,
            pm25: row.pm25,
            humidity: row.humidity,
            motion_detected: row.motion_detected,
        };
        Reading {
            id: row.id,
            sensor_id: row.sensor_id,
            location: row.location,
            timestamp: row.timestamp,
            measurement: Measurement::from_parts(&row.kind, columns),
        }
    }
}
