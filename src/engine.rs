//! Central handle wiring every component together; owned by `main` and
//! shared with the axum external surface as application state.

use std::sync::Arc;

use rumqttc::AsyncClient;
use sqlx::PgPool;

use crate::alarm_engine::AlarmEngine;
use crate::delete_cascade::DeleteCascade;
use crate::hidden::HiddenStore;
use crate::hot_cache::HotCache;
use crate::properties::PropertyStore;
use crate::pubsub::PubSub;
use crate::storage::Storage;
use crate::topology::Topology;

#[derive(Clone)]
pub struct Engine {
    pub topology: Arc<Topology>,
    pub storage: Arc<Storage>,
    pub properties: Arc<PropertyStore>,
    pub hidden: Arc<HiddenStore>,
    pub hot_cache: Option<Arc<HotCache>>,
    pub pubsub: Arc<PubSub>,
    pub alarms: Arc<AlarmEngine>,
    pub delete_cascade: Arc<DeleteCascade>,
    pub mqtt: AsyncClient,
    pub historian_enabled: bool,
    pub pool: PgPool,
}

impl Engine {
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
