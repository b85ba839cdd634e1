use anyhow::Result;
use envcache::app::{AppContext, load_catalog};
use envcache::config::Config;
use envcache::database::setup_database;
use envcache::messaging::{create_rabbit_channel, declare_run_queue};
use envcache::routes::{AppState, routes};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let catalog = load_catalog(&config)?;
  let db_pool = setup_database(&config.database_url).await?;
  let context = AppContext::build(db_pool, &catalog, &config).await?;

  let channel = match &config.rabbitmq_url {
    Some(url) => {
      let channel = create_rabbit_channel(url).await?;
      declare_run_queue(&channel).await?;
      Some(channel)
    }
    None => {
      warn!("RABBITMQ_URL not set, queued runs are disabled");
      None
    }
  };

  let api = routes(AppState { context, channel });
  info!(port = config.server_port, "API listening");
  warp::serve(api)
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
