// =============================================================================
// portal-ingest — market-data ingestion and reconciliation for the broker
// web portal
// =============================================================================
//
// Three independent binaries (`session-keeper`, `tick-streamer`,
// `bar-reconciler`) share this library. Each builds its own `ServiceContext`
// at startup and owns it for the process lifetime; there is no module-level
// mutable singleton anywhere in this crate.
// =============================================================================

pub mod broker;
pub mod calendar;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod reconciler;
pub mod session_keeper;
pub mod store;
pub mod tick_stream;
pub mod types;

use std::sync::Arc;

use broker::BrokerClient;
use calendar::{CalendarCache, ReferenceCalendar};
use config::Config;
use error::IngestError;
use store::{RedisStore, StoreAdapter};
use types::Instrument;

/// Everything a binary needs to run its subsystem, built once at startup
/// and passed down by value/reference instead of reached for through a
/// global.
pub struct ServiceContext {
    pub config: Config,
    pub broker: BrokerClient,
    pub store: Arc<dyn StoreAdapter>,
    pub calendar: Arc<CalendarCache<ReferenceCalendar>>,
    pub instruments: Vec<Instrument>,
}

impl ServiceContext {
    pub async fn build(config: Config) -> Result<Self, IngestError> {
        let broker = BrokerClient::new(&config.username, &config.password, config.paper);
        let store: Arc<dyn StoreAdapter> = Arc::new(RedisStore::connect(&config.redis.url()).await?);
        let calendar = Arc::new(CalendarCache::new(ReferenceCalendar, config.instruments.len().max(1) * 2));
        let instruments = config
            .instruments
            .iter()
            .map(Instrument::from_config)
            .collect();

        Ok(Self {
            config,
            broker,
            store,
            calendar,
            instruments,
        })
    }
}
