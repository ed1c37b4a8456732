//! Settings applied to every connection a broker opens

use std::sync::Arc;
use std::time::Duration;

use pgb_core::config::BrokerConfig;
use pgb_core::{Clock, SystemClock};

use crate::tunnel::TunnelOptions;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// A connection unused for longer than this is idle
    pub idle_threshold: Duration,
    /// Deadline for a single query, if any
    pub query_timeout: Option<Duration>,
    pub tunnel: TunnelOptions,
    /// Source of last-used timestamps
    pub clock: Arc<dyn Clock>,
}

impl ConnectOptions {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            idle_threshold: config.idle_timeout,
            query_timeout: config.query_timeout,
            tunnel: TunnelOptions::from_config(config),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}
