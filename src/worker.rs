use anyhow::Result;
use chrono::Utc;
use envcache::app::{AppContext, load_catalog};
use envcache::config::Config;
use envcache::database::setup_database;
use envcache::messaging::{RUN_QUEUE, RunRequest, create_rabbit_channel, declare_run_queue, publish_run_request};
use envcache::models::RunTrigger;
use envcache::tasks::TaskRunner;
use envcache::worker_processing::{parse_run_request, process_run_request};
use envcache::worker_scheduler::{EnqueueTracker, RunQueue};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_stream::wrappers::IntervalStream;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let worker_id = env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", std::process::id()));
  let catalog = load_catalog(&config)?;
  let db_pool = setup_database(&config.database_url).await?;
  let context = AppContext::build(db_pool, &catalog, &config).await?;

  match &config.rabbitmq_url {
    Some(url) => {
      let channel = create_rabbit_channel(url).await?;
      declare_run_queue(&channel).await?;
      tokio::spawn(enqueue_due_tasks(context.runner.clone(), channel.clone(), config.tick_interval));
      consume_run_queue(context.runner, channel, config.worker_concurrency, worker_id).await
    }
    None => {
      info!(worker = %worker_id, "RABBITMQ_URL not set, running due tasks directly");
      run_due_tasks_directly(context.runner, config.tick_interval).await;
      Ok(())
    }
  }
}

/// Schedule ticker for queue mode: publishes one request per due task.
async fn enqueue_due_tasks(runner: TaskRunner, channel: Channel, tick: Duration) {
  let mut tracker = EnqueueTracker::default();
  let mut ticks = IntervalStream::new(tokio::time::interval(tick));
  while ticks.next().await.is_some() {
    let now = Utc::now();
    let tasks = match runner.registry().list_with_last_start().await {
      Ok(tasks) => tasks,
      Err(e) => {
        error!("Schedule tick could not list tasks: {}", e);
        continue;
      }
    };
    for name in tracker.due(&tasks, now) {
      match publish_run_request(&channel, &RunRequest::new(&name, RunTrigger::Schedule)).await {
        Ok(()) => {
          info!(task = %name, "Scheduled run enqueued");
          tracker.mark(&name, now);
        }
        Err(e) => error!(task = %name, "Failed to enqueue scheduled run: {:?}", e),
      }
    }
  }
}

/// Schedule ticker without a queue: due tasks run in this process.
async fn run_due_tasks_directly(runner: TaskRunner, tick: Duration) {
  let mut ticks = IntervalStream::new(tokio::time::interval(tick));
  while ticks.next().await.is_some() {
    let runner = runner.clone();
    tokio::spawn(async move {
      match runner.run_due_tasks(Utc::now()).await {
        Ok(outcomes) if !outcomes.is_empty() => info!(runs = outcomes.len(), "Schedule tick finished"),
        Ok(_) => {}
        Err(e) => error!("Schedule tick failed: {}", e),
      }
    });
  }
}

async fn consume_run_queue(runner: TaskRunner, channel: Channel, concurrency: usize, worker_id: String) -> Result<()> {
  let mut consumer = channel
    .basic_consume(RUN_QUEUE, &worker_id, BasicConsumeOptions::default(), FieldTable::default())
    .await?;

  let queue: Arc<RunQueue<Delivery>> = Arc::new(RunQueue::new());
  let semaphore = Arc::new(Semaphore::new(concurrency));

  let queue_consumer = queue.clone();
  tokio::spawn(async move {
    while let Some(delivery) = consumer.next().await {
      match delivery {
        Ok(delivery) => match parse_run_request(&delivery.data) {
          Ok(request) => queue_consumer.push(request, delivery).await,
          Err(e) => {
            error!("Failed to parse run request: {:?}", e);
            let _ = delivery.ack(BasicAckOptions::default()).await;
          }
        },
        Err(e) => error!("Consumer error: {:?}", e),
      }
    }
  });

  info!(worker = %worker_id, concurrency, "Consuming run requests");
  loop {
    if let Some(queued) = queue.pop().await {
      let permit = semaphore.clone().acquire_owned().await?;
      let runner = runner.clone();
      let worker_id = worker_id.clone();
      tokio::spawn(async move {
        if let Err(e) = process_run_request(&runner, &queued.request, &worker_id).await {
          error!(task = %queued.request.task, "Run request could not be processed: {:?}", e);
        }
        // runs are recorded in the history either way, so the request is done
        let _ = queued.delivery.ack(BasicAckOptions::default()).await;
        drop(permit);
      });
    } else {
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
  }
}
