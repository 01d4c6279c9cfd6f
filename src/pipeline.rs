use crate::error::Result;
use crate::metrics::StageMetrics;
use crate::stage::{StageBuilder, StageHandle, StageState};

/// Owner of the running stages of one assembled graph.
///
/// Queues are created by the application and shared between stages; the
/// pipeline only owns the stages. Shutting it down stops every stage in the
/// order it was added.
#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<StageHandle>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Start a stage and take ownership of it.
    ///
    /// If the stage fails to start, every stage already running in this
    /// pipeline is stopped before the error is returned.
    pub fn add<S: StageBuilder>(&mut self, stage: S) -> Result<&mut Self> {
        let name = stage.name().to_string();
        match stage.start() {
            Ok(handle) => {
                self.stages.push(handle);
                Ok(self)
            }
            Err(e) => {
                tracing::error!(stage = %name, error = %e, "stage failed to start, tearing down pipeline");
                self.shutdown();
                Err(e)
            }
        }
    }

    pub fn stages(&self) -> &[StageHandle] {
        &self.stages
    }

    /// Metrics for the stage with the given name
    pub fn stage_metrics(&self, name: &str) -> Option<&StageMetrics> {
        self.stages
            .iter()
            .find(|stage| stage.name() == name)
            .map(StageHandle::metrics)
    }

    /// True while at least one stage is running
    pub fn is_running(&self) -> bool {
        self.stages
            .iter()
            .any(|stage| stage.state() == StageState::Running)
    }

    /// Stop all stages and release them.
    pub fn shutdown(&mut self) {
        for stage in &mut self.stages {
            stage.stop();
        }
        if !self.stages.is_empty() {
            tracing::info!(stages = self.stages.len(), "pipeline shut down");
        }
        self.stages.clear();
    }

    /// Get a summary of all metrics
    pub fn metrics_summary(&self) -> String {
        let mut summary = String::from("Pipeline Metrics Summary:\n");
        for stage in &self.stages {
            summary.push_str(&format!(
                "  Stage {}: {}\n",
                stage.name(),
                stage.metrics().snapshot().format()
            ));
        }
        summary
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::queue::BoundedQueue;
    use crate::stage::{SinkStage, TransformStage};
    use std::sync::Arc;

    #[test]
    fn test_empty_pipeline() {
        let mut pipeline = Pipeline::new();
        assert!(!pipeline.is_running());
        pipeline.shutdown();
        assert!(pipeline.stages().is_empty());
    }

    #[test]
    fn test_add_and_shutdown() {
        let a: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(2));
        let b: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(2));

        let mut pipeline = Pipeline::new();
        pipeline
            .add(TransformStage::new("inc", 1, |v: &i32| v + 1).input(a.clone()).output(b.clone()))
            .unwrap()
            .add(SinkStage::new("drop", 1, |_: &i32| {}).input(b.clone()))
            .unwrap();

        assert!(pipeline.is_running());
        assert_eq!(pipeline.stages().len(), 2);
        assert!(pipeline.stage_metrics("inc").is_some());
        assert!(pipeline.metrics_summary().contains("Stage drop"));

        pipeline.shutdown();
        assert!(!pipeline.is_running());
        assert!(a.is_read_interrupted());
        assert!(b.is_write_interrupted());
        assert!(b.is_read_interrupted());
    }

    #[test]
    fn test_failed_start_stops_running_stages() {
        let a: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(2));

        let mut pipeline = Pipeline::new();
        pipeline
            .add(SinkStage::new("first", 1, |_: &i32| {}).input(a.clone()))
            .unwrap();

        let result = pipeline.add(TransformStage::new("unbound", 1, |v: &i32| *v).input(a.clone()));
        assert!(matches!(result, Err(PipelineError::MissingEndpoint { .. })));
        assert!(pipeline.stages().is_empty());
        assert!(a.is_read_interrupted());
    }
}
