//! Shared counter environment and wiring for the end-to-end tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;

use simbatch_config::{CoordinatorConfig, WorkerConfig};
use simbatch_execution::{
    Environment, EnvironmentError, MemoryStore, StepContext, WorkerClient, WorkerError,
};
use simbatch_ipc::{Field, FieldMap, FrameLimits, TokioTransport, WireValue};

pub const GAIN: f64 = 2.5;
pub const SUBSTEPS: u32 = 2;

/// Adds `gain` on every sub-step and records what the coordinator sent it.
/// The value carries over from one sample to the next; only `load_sample`
/// replaces it.
#[derive(Debug, Default)]
pub struct CounterEnv {
    pub gain: f64,
    pub value: f64,
    pub steps: u32,
    pub predict: bool,
    pub visualize: bool,
    pub fail_steps: bool,
    pub prediction: Option<WireValue>,
    pub loaded: Vec<f64>,
    pub visual_states: Vec<WireValue>,
}

impl CounterEnv {
    pub fn predicting() -> Self {
        Self {
            predict: true,
            ..Self::default()
        }
    }

    pub fn visualizing() -> Self {
        Self {
            visualize: true,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_steps: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Environment for CounterEnv {
    async fn create(&mut self, parameters: &FieldMap) -> Result<(), EnvironmentError> {
        self.gain = parameters
            .get("gain")
            .and_then(Field::as_value)
            .and_then(WireValue::as_float)
            .ok_or_else(|| anyhow::anyhow!("missing gain"))?;
        Ok(())
    }

    async fn init_visualization(&mut self) -> Result<Option<FieldMap>, EnvironmentError> {
        Ok(Some(FieldMap::from([(
            "gain".to_string(),
            Field::Value(WireValue::Float(self.gain)),
        )])))
    }

    fn parameters(&self) -> Option<FieldMap> {
        Some(FieldMap::from([(
            "kind".to_string(),
            Field::Value(WireValue::Text("counter".to_string())),
        )]))
    }

    async fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EnvironmentError> {
        if self.fail_steps {
            return Err(anyhow::anyhow!("step failed").into());
        }
        self.value += self.gain;
        self.steps += 1;
        if ctx.is_sampling_step() {
            if self.predict {
                let input = WireValue::from(ctx.instance_id().unwrap_or_default());
                self.prediction = Some(ctx.request_prediction(&input).await?);
            }
            if self.visualize {
                ctx.request_visualization_update().await?;
            }
        }
        Ok(())
    }

    fn sample(&self) -> FieldMap {
        FieldMap::from([
            ("value".to_string(), Field::Value(WireValue::Float(self.value))),
            (
                "prediction".to_string(),
                Field::Value(self.prediction.clone().unwrap_or(WireValue::None)),
            ),
        ])
    }

    fn load_sample(&mut self, sample: FieldMap) -> Result<(), EnvironmentError> {
        self.value = sample_value(&sample).ok_or_else(|| anyhow::anyhow!("sample has no value"))?;
        self.loaded.push(self.value);
        Ok(())
    }

    async fn apply_prediction(&mut self, prediction: WireValue) -> Result<(), EnvironmentError> {
        self.prediction = Some(prediction);
        Ok(())
    }

    async fn update_visualization(&mut self, state: WireValue) -> Result<(), EnvironmentError> {
        self.visual_states.push(state);
        Ok(())
    }
}

pub fn sample_value(sample: &FieldMap) -> Option<f64> {
    sample.get("value").and_then(Field::as_value).and_then(WireValue::as_float)
}

/// Loopback coordinator on an ephemeral port
pub fn coordinator_config(nb_client: usize, batch_size: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        nb_client,
        max_client_count: nb_client,
        batch_size,
        simulations_per_step: SUBSTEPS,
        receive_timeout: Some(Duration::from_secs(10)),
        environment_parameters: json!({ "gain": GAIN }),
        ..CoordinatorConfig::default()
    }
}

pub fn worker_config(addr: SocketAddr, instance_id: Option<u32>) -> WorkerConfig {
    WorkerConfig {
        coordinator_address: addr.ip().to_string(),
        port: addr.port(),
        instance_id,
        receive_timeout: Some(Duration::from_secs(10)),
    }
}

pub type CounterWorker = WorkerClient<TokioTransport, CounterEnv>;

/// Connect a worker and run it until the coordinator releases it. The
/// client comes back with the result so tests can inspect its environment.
pub fn spawn_worker(
    addr: SocketAddr,
    instance_id: Option<u32>,
    env: CounterEnv,
    store: MemoryStore,
) -> JoinHandle<(CounterWorker, Result<(), WorkerError>)> {
    tokio::spawn(async move {
        let mut client = WorkerClient::connect(
            &worker_config(addr, instance_id),
            FrameLimits::default(),
            env,
            Box::new(store),
        )
        .await
        .expect("worker should connect");
        let result = client.run().await;
        (client, result)
    })
}
