use super::{latest_by_id, BatchOutcome, PgReadingStore};
use crate::reading::{Measurement, Reading};
use anyhow::Result;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;

fn energy(id: &str, consumption: i64) -> Reading {
    Reading {
        id: id.to_string(),
        sensor_id: "energy_Main_Hall".to_string(),
        location: "Main Hall".to_string(),
        timestamp: Utc.with_ymd_and_hms(2025, 11, 11, 22, 0, 0).unwrap(),
        measurement: Measurement::Energy {
            consumption: Some(Decimal::from(consumption)),
        },
    }
}

fn integration_database_url() -> Option<String> {
    if env::var("PROCESSOR_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return None;
    }
    env::var("PROCESSOR_TEST_DATABASE_URL").ok()
}

async fn setup_test_store(database_url: &str, schema: &str) -> Result<PgReadingStore> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {}", schema))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    let store = PgReadingStore::new(pool);
    store.ensure_schema().await?;
    Ok(store)
}

async fn drop_schema(database_url: &str, schema: &str) {
    if let Ok(admin_pool) = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await
    {
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .execute(&admin_pool)
            .await;
    }
}

async fn count_rows(pool: &PgPool, id: &str) -> Result<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM sensor_readings WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await?,
    )
}

#[test]
fn latest_by_id_keeps_last_value_at_first_position() {
    let readings = vec![energy("a", 1), energy("b", 2), energy("a", 3), energy("c", 4)];

    let latest = latest_by_id(&readings);

    let ids: Vec<&str> = latest.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(
        latest[0].measurement,
        Measurement::Energy {
            consumption: Some(Decimal::from(3))
        }
    );
}

#[test]
fn latest_by_id_is_identity_without_duplicates() {
    let readings = vec![energy("x", 1), energy("y", 2)];
    let latest = latest_by_id(&readings);
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[1].id, "y");
}

#[tokio::test]
async fn test_upsert_overwrites_existing_row() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("processor_test_upsert_{}", std::process::id());
    let store = setup_test_store(&database_url, &schema).await?;

    let first = store.save_batch(&[energy("x", 100)]).await?;
    assert_eq!(first, BatchOutcome { inserted: 1, updated: 0 });

    let second = store.save_batch(&[energy("x", 200)]).await?;
    assert_eq!(second, BatchOutcome { inserted: 0, updated: 1 });

    assert_eq!(count_rows(store.pool(), "x").await?, 1);
    let stored = store.fetch_reading("x").await?.expect("row x");
    assert_eq!(
        stored.measurement,
        Measurement::Energy {
            consumption: Some(Decimal::from(200))
        }
    );

    drop_schema(&database_url, &schema).await;
    Ok(())
}

#[tokio::test]
async fn test_upsert_replaces_every_column() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("processor_test_replace_{}", std::process::id());
    let store = setup_test_store(&database_url, &schema).await?;

    let mut air = Reading {
        id: "q".to_string(),
        sensor_id: "air_quality_Lab".to_string(),
        location: "Lab".to_string(),
        timestamp: Utc.with_ymd_and_hms(2025, 11, 11, 8, 0, 0).unwrap(),
        measurement: Measurement::AirQuality {
            co2: Some(410),
            pm25: Some(12),
            humidity: Some(40),
        },
    };
    store.save_batch(std::slice::from_ref(&air)).await?;

    air.location = "Lab 2".to_string();
    air.measurement = Measurement::AirQuality {
        co2: None,
        pm25: Some(15),
        humidity: None,
    };
    store.save_batch(std::slice::from_ref(&air)).await?;

    let stored = store.fetch_reading("q").await?.expect("row q");
    assert_eq!(stored, air);

    drop_schema(&database_url, &schema).await;
    Ok(())
}

#[tokio::test]
async fn test_mixed_batch_inserts_and_updates_atomically() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("processor_test_mixed_{}", std::process::id());
    let store = setup_test_store(&database_url, &schema).await?;

    store.save_batch(&[energy("a", 1)]).await?;
    let outcome = store
        .save_batch(&[energy("a", 10), energy("b", 20), energy("b", 21), energy("c", 30)])
        .await?;
    assert_eq!(outcome, BatchOutcome { inserted: 2, updated: 1 });

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_readings")
        .fetch_one(store.pool())
        .await?;
    assert_eq!(total, 3);
    let b = store.fetch_reading("b").await?.expect("row b");
    assert_eq!(
        b.measurement,
        Measurement::Energy {
            consumption: Some(Decimal::from(21))
        }
    );

    drop_schema(&database_url, &schema).await;
    Ok(())
}

#[tokio::test]
async fn test_empty_batch_is_a_no_op() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("processor_test_empty_{}", std::process::id());
    let store = setup_test_store(&database_url, &schema).await?;

    assert_eq!(store.save_batch(&[]).await?, BatchOutcome::default());
    assert!(store.is_connected().await);

    drop_schema(&database_url, &schema).await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_batches_with_same_new_id_both_commit() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("processor_test_concurrent_{}", std::process::id());
    let store = setup_test_store(&database_url, &schema).await?;

    let first = [energy("x", 1), energy("w", 5)];
    let second = [energy("y", 3), energy("x", 2)];
    let (a, b) = tokio::join!(store.save_batch(&first), store.save_batch(&second));
    a?;
    b?;

    assert_eq!(count_rows(store.pool(), "x").await?, 1);
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_readings")
        .fetch_one(store.pool())
        .await?;
    assert_eq!(total, 3);
    let x = store.fetch_reading("x").await?.expect("row x");
    assert!(matches!(
        x.measurement,
        Measurement::Energy { consumption: Some(value) }
            if value == Decimal::from(1) || value == Decimal::from(2)
    ));

    drop_schema(&database_url, &schema).await;
    Ok(())
}
