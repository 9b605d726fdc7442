//! Service kernel: shared dependencies plus the background services that
//! drive tasks through the pipeline.

pub mod broker;
pub mod dispatcher;
pub mod record;
pub mod workers;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use broker::Broker;

/// The dependency hub handed to services and control-plane operations.
#[derive(Clone)]
pub struct Kernel {
    pub db: PgPool,
    pub broker: Arc<dyn Broker>,
    pub config: Arc<Config>,
}

impl Kernel {
    pub fn new(db: PgPool, broker: Arc<dyn Broker>, config: Config) -> Self {
        Self {
            db,
            broker,
            config: Arc::new(config),
        }
    }
}
