use anyhow::Result;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;

use crate::models::RunTrigger;

pub const RUN_QUEUE: &str = "envcache.task_runs";
pub const DEFAULT_PRIORITY: u8 = 5;

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

fn default_priority() -> u8 {
  DEFAULT_PRIORITY
}

fn default_trigger() -> RunTrigger {
  RunTrigger::Manual
}

/// Body of a queued run request. Lower priority values run first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
  pub task: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub params: Option<Map<String, Value>>,
  #[serde(default = "default_trigger")]
  pub trigger: RunTrigger,
  #[serde(default = "default_priority")]
  pub priority: u8,
}

impl RunRequest {
  pub fn new(task: &str, trigger: RunTrigger) -> Self {
    Self { task: task.to_string(), params: None, trigger, priority: DEFAULT_PRIORITY }
  }
}

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub async fn declare_run_queue(channel: &Channel) -> Result<()> {
  channel
    .queue_declare(RUN_QUEUE, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
    .await?;
  Ok(())
}

pub async fn publish_message(channel: &Channel, queue: &str, payload: &[u8]) -> Result<()> {
  Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || async {
    channel.basic_publish("", queue, BasicPublishOptions::default(), payload, BasicProperties::default()).await
  })
    .await?;
  Ok(())
}

pub async fn publish_run_request(channel: &Channel, request: &RunRequest) -> Result<()> {
  let payload = serde_json::to_vec(request)?;
  publish_message(channel, RUN_QUEUE, &payload).await?;
  info!(task = %request.task, trigger = request.trigger.as_str(), priority = request.priority, "Run request published");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn run_request_defaults() {
    let request: RunRequest = serde_json::from_str(r#"{"task": "fires_nordic"}"#).unwrap();
    assert_eq!(request, RunRequest::new("fires_nordic", RunTrigger::Manual));

    let encoded = serde_json::to_value(RunRequest::new("air_global", RunTrigger::Schedule)).unwrap();
    assert_eq!(encoded, serde_json::json!({"task": "air_global", "trigger": "schedule", "priority": 5}));
  }
}
