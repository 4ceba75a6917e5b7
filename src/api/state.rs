use std::sync::Arc;

use crate::config::Config;
use crate::fetcher::Fetcher;
use crate::float_catalog::FloatCatalog;
use crate::market::MarketAdapter;
use crate::queue::JobBroker;
use crate::read_layer::ReadLayer;
use crate::store::SqliteStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub fetcher: Fetcher,
    pub market: Arc<MarketAdapter>,
    pub float_catalog: Arc<FloatCatalog>,
    pub store: Arc<SqliteStore>,
    pub broker: Arc<dyn JobBroker>,
    pub read_layer: Arc<ReadLayer>,
}
