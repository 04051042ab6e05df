//! Shared application state

use leafscan_classifiers::Predictor;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// State handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub predictor: Arc<Predictor>,
    pub metrics_handle: PrometheusHandle,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(predictor: Arc<Predictor>, metrics_handle: PrometheusHandle, max_body_bytes: usize) -> Self {
        Self {
            predictor,
            metrics_handle,
            max_body_bytes,
        }
    }
}
