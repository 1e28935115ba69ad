//! Demo environment and coordinator collaborators used by the CLI

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simbatch_execution::{Environment, EnvironmentError, PredictionService, StepContext, VisualizationSink};
use simbatch_ipc::{Field, FieldMap, NdArray, WireValue};
use tracing::{debug, info};

/// One-dimensional random walk. Walks that leave `bounds` are rejected and
/// restarted from the origin.
pub struct RandomWalkEnv {
    rng: StdRng,
    step_scale: f64,
    bounds: f64,
    position: f64,
    drift: f64,
    path: Vec<f64>,
}

impl RandomWalkEnv {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            step_scale: 1.0,
            bounds: 10.0,
            position: 0.0,
            drift: 0.0,
            path: Vec::new(),
        }
    }

    pub fn position(&self) -> f64 {
        self.position
    }
}

fn float_param(parameters: &FieldMap, key: &str) -> Option<f64> {
    parameters
        .get(key)
        .and_then(Field::as_value)
        .and_then(|value| value.as_float().or_else(|| value.as_int().map(|int| int as f64)))
}

#[async_trait]
impl Environment for RandomWalkEnv {
    async fn create(&mut self, parameters: &FieldMap) -> Result<(), EnvironmentError> {
        if let Some(scale) = float_param(parameters, "step_scale") {
            self.step_scale = scale;
        }
        if let Some(bounds) = float_param(parameters, "bounds") {
            if bounds <= 0.0 {
                return Err(anyhow::anyhow!("bounds must be positive, got {}", bounds).into());
            }
            self.bounds = bounds;
        }
        debug!("Random walk with scale {} in ±{}", self.step_scale, self.bounds);
        Ok(())
    }

    async fn init_visualization(&mut self) -> Result<Option<FieldMap>, EnvironmentError> {
        Ok(Some(FieldMap::from([(
            "bounds".to_string(),
            Field::Value(WireValue::Float(self.bounds)),
        )])))
    }

    fn parameters(&self) -> Option<FieldMap> {
        Some(FieldMap::from([
            ("step_scale".to_string(), Field::Value(WireValue::Float(self.step_scale))),
            ("bounds".to_string(), Field::Value(WireValue::Float(self.bounds))),
        ]))
    }

    async fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EnvironmentError> {
        if ctx.substep() == 0 && self.position.abs() > self.bounds {
            self.position = 0.0;
            self.path.clear();
        }
        let noise: f64 = self.rng.random_range(-1.0..=1.0);
        self.position += noise * self.step_scale + self.drift;
        self.path.push(self.position);

        if ctx.is_sampling_step() && ctx.predictions_allowed() {
            let prediction = ctx.request_prediction(&WireValue::Float(self.position)).await?;
            self.drift = prediction.as_float().unwrap_or_default();
        }
        Ok(())
    }

    fn check_sample(&self) -> bool {
        self.position.abs() <= self.bounds
    }

    fn sample(&self) -> FieldMap {
        let path = NdArray::from_f64(vec![self.path.len()], &self.path)
            .map_or(WireValue::None, WireValue::Array);
        FieldMap::from([
            ("position".to_string(), Field::Value(WireValue::Float(self.position))),
            ("path".to_string(), Field::Value(path)),
        ])
    }

    fn load_sample(&mut self, sample: FieldMap) -> Result<(), EnvironmentError> {
        self.position = float_param(&sample, "position")
            .ok_or_else(|| anyhow::anyhow!("stored sample has no position"))?;
        self.path = sample
            .get("path")
            .and_then(Field::as_value)
            .and_then(WireValue::as_array)
            .map(NdArray::to_f64_vec)
            .unwrap_or_default();
        Ok(())
    }

    fn reset_sample(&mut self) {
        self.path.clear();
    }

    async fn apply_prediction(&mut self, prediction: WireValue) -> Result<(), EnvironmentError> {
        self.drift = prediction.as_float().unwrap_or_default();
        Ok(())
    }

    async fn update_visualization(&mut self, state: WireValue) -> Result<(), EnvironmentError> {
        debug!("Visualization state received: {}", state.kind_name());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EnvironmentError> {
        debug!("Random walk closed at {}", self.position);
        Ok(())
    }
}

/// Predicts a drift pulling the walk back toward the origin
#[derive(Debug, Clone, Copy)]
pub struct DampingPredictor {
    pub factor: f64,
}

impl Default for DampingPredictor {
    fn default() -> Self {
        Self { factor: 0.1 }
    }
}

#[async_trait]
impl PredictionService for DampingPredictor {
    async fn compute_prediction(&self, client_id: u32, input: WireValue) -> anyhow::Result<WireValue> {
        let position = input
            .as_float()
            .ok_or_else(|| anyhow::anyhow!("client {} sent a {} input", client_id, input.kind_name()))?;
        Ok(WireValue::Float(-self.factor * position))
    }
}

/// Logs visualization refresh requests
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl VisualizationSink for LoggingSink {
    fn update_visualization(&self, client_id: u32, instance: WireValue) -> anyhow::Result<()> {
        info!("Client {} asked for a visualization refresh ({:?})", client_id, instance.as_int());
        Ok(())
    }
}
