//! Coordinator-side collaborators answering worker requests

use async_trait::async_trait;
use simbatch_ipc::WireValue;
use std::fmt;
use std::sync::Arc;

/// Computes predictions requested by stepping workers
#[async_trait]
pub trait PredictionService: Send + Sync {
    async fn compute_prediction(&self, client_id: u32, input: WireValue) -> anyhow::Result<WireValue>;
}

/// Receives visualization refresh requests
pub trait VisualizationSink: Send + Sync {
    fn update_visualization(&self, client_id: u32, instance: WireValue) -> anyhow::Result<()>;
}

/// Collaborators shared by every conversation of a coordinator
#[derive(Clone, Default)]
pub struct CoordinatorServices {
    pub prediction: Option<Arc<dyn PredictionService>>,
    pub visualization: Option<Arc<dyn VisualizationSink>>,
}

impl CoordinatorServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prediction(mut self, service: Arc<dyn PredictionService>) -> Self {
        self.prediction = Some(service);
        self
    }

    pub fn with_visualization(mut self, sink: Arc<dyn VisualizationSink>) -> Self {
        self.visualization = Some(sink);
        self
    }
}

impl fmt::Debug for CoordinatorServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorServices")
            .field("prediction", &self.prediction.is_some())
            .field("visualization", &self.visualization.is_some())
            .finish()
    }
}
