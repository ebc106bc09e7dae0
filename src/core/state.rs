use std::sync::Arc;

use crate::core::{config::Settings, redis::RedisHandle};
use crate::services::notifier::JobEventSink;
use crate::store::Store;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    store: Arc<dyn Store>,
    redis: RedisHandle,
    events: Arc<dyn JobEventSink>,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        redis: RedisHandle,
        events: Arc<dyn JobEventSink>,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, store, redis, events }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub(crate) fn events(&self) -> &Arc<dyn JobEventSink> {
        &self.inner.events
    }
}
