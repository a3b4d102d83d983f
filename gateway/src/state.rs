//! Shared process state handed to every Gateway WS handler.

use std::sync::Arc;

use common::config::Config;

use crate::upstream::UpstreamPool;

#[derive(Clone)]
pub struct GatewayState {
    pub config: &'static Config,
    pub upstream_pool: Arc<UpstreamPool>,
}

impl GatewayState {
    pub fn new(config: &'static Config) -> Self {
        Self { config, upstream_pool: UpstreamPool::new(config.sm_upstream_url.clone()) }
    }
}
