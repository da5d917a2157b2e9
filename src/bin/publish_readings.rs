use anyhow::{Context, Result};
use clap::Parser;
use reading_processor::broker::BrokerConnection;
use reading_processor::config::Config;
use reading_processor::reading::{decode_reading, Reading};
use tokio::io::AsyncReadExt;

#[derive(Parser, Debug)]
#[command(
    about = "Publish sensor readings to the processor queue (JSON array or newline-delimited JSON)."
)]
struct Args {
    /// Readings file; stdin is read when omitted.
    #[arg(long)]
    file: Option<String>,
    /// Queue name override (defaults to PROCESSOR_QUEUE_NAME).
    #[arg(long)]
    queue: Option<String>,
}

fn parse_readings(contents: &str) -> Result<Vec<Reading>> {
    let trimmed = contents.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("parse readings array");
    }
    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            let mut bytes = line.trim().as_bytes().to_vec();
            decode_reading(&mut bytes).with_context(|| format!("parse reading on line {}", idx + 1))
        })
        .collect()
}

async fn read_input(file: Option<&str>) -> Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read {path}")),
        None => {
            let mut contents = String::new();
            tokio::io::stdin()
                .read_to_string(&mut contents)
                .await
                .context("read stdin")?;
            Ok(contents)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let config = Config::from_env()?;
    let readings = parse_readings(&read_input(args.file.as_deref()).await?)?;
    let queue = args
        .queue
        .unwrap_or_else(|| config.broker.queue_name.clone());

    let connection = BrokerConnection::connect(&config.broker).await?;
    let publisher = connection.publisher(&queue).await?;
    for reading in &readings {
        publisher.publish(reading).await?;
    }
    publisher.close().await?;
    connection.close().await?;

    println!("published {} readings to {}", readings.len(), publisher.queue());
    Ok(())
}
