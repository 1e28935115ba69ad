//! Simulation environment driven by a worker

use async_trait::async_trait;
use simbatch_ipc::{
    Command, Connection, FieldMap, FrameTransport, IpcError, WireValue,
};

use crate::error::EnvironmentError;

/// Label of the visualization request sent by a worker
pub const VISUALIZATION_REQUEST_LABEL: &str = "instance";

/// Label of the visualization state pushed by the coordinator
pub const VISUALIZATION_STATE_LABEL: &str = "visualization";

/// Requests a stepping environment may send back to its coordinator
#[async_trait]
pub trait CoordinatorLink: Send {
    /// Send `input` and wait for the matching prediction
    async fn request_prediction(&mut self, input: &WireValue) -> Result<WireValue, IpcError>;

    /// Ask the coordinator to refresh this instance's visualization
    async fn request_visualization_update(&mut self, instance_id: Option<u32>) -> Result<(), IpcError>;
}

#[async_trait]
impl<T: FrameTransport> CoordinatorLink for Connection<T> {
    async fn request_prediction(&mut self, input: &WireValue) -> Result<WireValue, IpcError> {
        Connection::request_prediction(self, input).await
    }

    async fn request_visualization_update(&mut self, instance_id: Option<u32>) -> Result<(), IpcError> {
        self.send_command(Command::Visualisation).await?;
        let instance = instance_id.map_or(WireValue::None, WireValue::from);
        self.send_labeled(VISUALIZATION_REQUEST_LABEL, &instance, true).await
    }
}

/// Handle passed to [`Environment::step`]
pub struct StepContext<'a> {
    link: &'a mut dyn CoordinatorLink,
    instance_id: Option<u32>,
    allow_predictions: bool,
    substep: u32,
    substeps: u32,
}

impl<'a> StepContext<'a> {
    pub fn new(
        link: &'a mut dyn CoordinatorLink,
        instance_id: Option<u32>,
        allow_predictions: bool,
        substep: u32,
        substeps: u32,
    ) -> Self {
        Self {
            link,
            instance_id,
            allow_predictions,
            substep,
            substeps,
        }
    }

    /// Zero-based index of the current sub-step
    pub fn substep(&self) -> u32 {
        self.substep
    }

    pub fn substeps(&self) -> u32 {
        self.substeps
    }

    /// True on the last sub-step of the group, the one whose training
    /// data is kept
    pub fn is_sampling_step(&self) -> bool {
        self.substep + 1 >= self.substeps
    }

    pub fn instance_id(&self) -> Option<u32> {
        self.instance_id
    }

    pub fn predictions_allowed(&self) -> bool {
        self.allow_predictions
    }

    /// Block this step until the coordinator answers with a prediction
    pub async fn request_prediction(&mut self, input: &WireValue) -> Result<WireValue, EnvironmentError> {
        if !self.allow_predictions {
            return Err(EnvironmentError::PredictionsDisabled);
        }
        Ok(self.link.request_prediction(input).await?)
    }

    pub async fn request_visualization_update(&mut self) -> Result<(), EnvironmentError> {
        Ok(self.link.request_visualization_update(self.instance_id).await?)
    }
}

/// A simulation producing training samples.
///
/// `step` and `sample` are required; every other hook has a default. The
/// worker calls `create`, `init`, `init_database` and `init_visualization`
/// once during the handshake, then `step` once per sub-step until
/// `check_sample` accepts the result.
#[async_trait]
pub trait Environment: Send {
    /// Build the simulation from the coordinator's parameters
    async fn create(&mut self, _parameters: &FieldMap) -> Result<(), EnvironmentError> {
        Ok(())
    }

    async fn init(&mut self) -> Result<(), EnvironmentError> {
        Ok(())
    }

    /// Point the environment at the store location the coordinator chose
    async fn init_database(&mut self, _store_location: Option<&str>) -> Result<(), EnvironmentError> {
        Ok(())
    }

    /// Visualization data reported to the coordinator during the handshake
    async fn init_visualization(&mut self) -> Result<Option<FieldMap>, EnvironmentError> {
        Ok(None)
    }

    /// Parameters reported back to the coordinator during the handshake
    fn parameters(&self) -> Option<FieldMap> {
        None
    }

    async fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EnvironmentError>;

    /// Whether the last step group produced a usable sample
    fn check_sample(&self) -> bool {
        true
    }

    /// Current sample, as written to the store
    fn sample(&self) -> FieldMap;

    /// Replace the current state with a stored sample
    fn load_sample(&mut self, _sample: FieldMap) -> Result<(), EnvironmentError> {
        Ok(())
    }

    /// Clear per-sample state after it has been stored
    fn reset_sample(&mut self) {}

    async fn apply_prediction(&mut self, _prediction: WireValue) -> Result<(), EnvironmentError> {
        Ok(())
    }

    async fn update_visualization(&mut self, _state: WireValue) -> Result<(), EnvironmentError> {
        Ok(())
    }

    /// Release simulation resources. Unimplemented closes are ignored.
    async fn close(&mut self) -> Result<(), EnvironmentError> {
        Err(EnvironmentError::NotImplemented("close"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedLink {
        predictions: Vec<WireValue>,
        visualization_requests: Vec<Option<u32>>,
    }

    #[async_trait]
    impl CoordinatorLink for ScriptedLink {
        async fn request_prediction(&mut self, input: &WireValue) -> Result<WireValue, IpcError> {
            self.predictions.push(input.clone());
            Ok(WireValue::Float(1.5))
        }

        async fn request_visualization_update(&mut self, instance_id: Option<u32>) -> Result<(), IpcError> {
            self.visualization_requests.push(instance_id);
            Ok(())
        }
    }

    fn link() -> ScriptedLink {
        ScriptedLink {
            predictions: Vec::new(),
            visualization_requests: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_prediction_gated_by_permission() {
        let mut link = link();
        let mut ctx = StepContext::new(&mut link, Some(2), false, 0, 1);
        assert!(matches!(
            ctx.request_prediction(&WireValue::Int(1)).await,
            Err(EnvironmentError::PredictionsDisabled)
        ));

        let mut ctx = StepContext::new(&mut link, Some(2), true, 0, 1);
        assert_eq!(
            ctx.request_prediction(&WireValue::Int(1)).await.unwrap(),
            WireValue::Float(1.5)
        );
        ctx.request_visualization_update().await.unwrap();
        assert_eq!(link.predictions, vec![WireValue::Int(1)]);
        assert_eq!(link.visualization_requests, vec![Some(2)]);
    }

    #[test]
    fn test_sampling_step_is_last() {
        let mut link = link();
        assert!(!StepContext::new(&mut link, None, false, 0, 3).is_sampling_step());
        assert!(StepContext::new(&mut link, None, false, 2, 3).is_sampling_step());
        assert!(StepContext::new(&mut link, None, false, 0, 1).is_sampling_step());
    }
}
