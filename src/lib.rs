//! Consumes sensor readings from an AMQP queue, groups them into batches and upserts
//! each batch into PostgreSQL, acknowledging deliveries once their batch is committed.

pub mod broker;
pub mod config;
pub mod grpc;
pub mod pipeline;
pub mod reading;
pub mod store;
pub mod telemetry;
