use crate::capture::{DefaultConnector, StreamConnector};
use crate::compositor::Slot;
use crate::config::{Config, StreamConfig};
use crate::error::SupervisorError;
use crate::source::{StreamHealth, StreamSource};
use std::sync::Arc;
use tokio::time::Instant;

/// Owns every [`StreamSource`] of a session.
///
/// The supervisor starts and stops sources and reads their health. It never
/// retries anything itself; reconnection lives entirely in the sources.
/// Dropping the supervisor drops the sources, which stops their tasks.
pub struct StreamSupervisor {
    sources: Vec<StreamSource>,
    started_at: Option<Instant>,
}

impl StreamSupervisor {
    /// One source per config, ids assigned in order
    pub fn new(configs: Vec<StreamConfig>, connector: Arc<dyn StreamConnector>) -> Self {
        let sources = configs
            .into_iter()
            .enumerate()
            .map(|(id, config)| StreamSource::new(id, config, connector.clone()))
            .collect();
        Self {
            sources,
            started_at: None,
        }
    }

    /// Supervisor for a loaded config, using the URL-scheme based backends
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.streams.clone(), Arc::new(DefaultConnector))
    }

    /// Start every source.
    ///
    /// Fails only if there is nothing to start or not a single source could
    /// be spawned. Cameras that are down at this point are not an error;
    /// they show up as reconnecting in the health snapshots.
    pub fn start_all(&mut self) -> Result<usize, SupervisorError> {
        if self.sources.is_empty() {
            return Err(SupervisorError::NoStreams);
        }

        let mut started = 0;
        let mut errors = Vec::new();
        for source in &mut self.sources {
            match source.start() {
                Ok(()) => started += 1,
                Err(e) => {
                    log::error!("[{}] failed to start: {}", source.name(), e);
                    errors.push(e.to_string());
                }
            }
        }

        if started == 0 {
            return Err(SupervisorError::StartFailed(errors.join("; ")));
        }

        self.started_at.get_or_insert_with(Instant::now);
        log::info!("Started {}/{} streams", started, self.sources.len());
        Ok(started)
    }

    /// Stop every source and wait for all capture tasks to exit.
    pub async fn stop_all(&mut self) {
        futures::future::join_all(self.sources.iter_mut().map(|source| source.stop())).await;
        log::info!("All {} streams stopped", self.sources.len());
    }

    /// Restart a single stream, e.g. after it reached `Failed`
    pub fn start_stream(&mut self, id: usize) -> Result<(), SupervisorError> {
        self.sources
            .get_mut(id)
            .ok_or(SupervisorError::UnknownStream(id))?
            .start()
    }

    pub async fn stop_stream(&mut self, id: usize) -> Result<(), SupervisorError> {
        self.sources
            .get_mut(id)
            .ok_or(SupervisorError::UnknownStream(id))?
            .stop()
            .await;
        Ok(())
    }

    /// Health snapshot of every stream, in configuration order
    pub fn health(&self) -> Vec<StreamHealth> {
        self.sources.iter().map(StreamSource::health).collect()
    }

    /// Read handles for the compositor, in configuration order
    pub fn slots(&self) -> Vec<Slot> {
        self.sources.iter().map(Slot::from_source).collect()
    }

    pub fn sources(&self) -> &[StreamSource] {
        &self.sources
    }

    pub fn source(&self, id: usize) -> Option<&StreamSource> {
        self.sources.get(id)
    }

    /// When `start_all` first succeeded
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CameraState;

    fn stub(name: &str) -> StreamConfig {
        let mut config = StreamConfig::new(name, format!("stub://{}", name));
        config.width = 8;
        config.height = 8;
        config
    }

    #[tokio::test]
    async fn test_empty_supervisor_refuses_to_start() {
        let mut supervisor = StreamSupervisor::new(Vec::new(), Arc::new(DefaultConnector));
        assert!(matches!(
            supervisor.start_all(),
            Err(SupervisorError::NoStreams)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_all() {
        let mut supervisor =
            StreamSupervisor::new(vec![stub("a"), stub("b")], Arc::new(DefaultConnector));
        assert_eq!(supervisor.start_all().unwrap(), 2);
        assert!(supervisor.started_at().is_some());

        let mut rx = supervisor.source(1).unwrap().subscribe();
        rx.wait_for(|h| h.is_connected()).await.unwrap();

        supervisor.stop_all().await;
        assert!(supervisor
            .health()
            .iter()
            .all(|h| h.state == CameraState::Stopped));
        assert!(supervisor.sources().iter().all(|s| !s.is_running()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_stream_control() {
        let mut supervisor =
            StreamSupervisor::new(vec![stub("a"), stub("b")], Arc::new(DefaultConnector));
        supervisor.start_all().unwrap();

        supervisor.stop_stream(0).await.unwrap();
        assert_eq!(supervisor.health()[0].state, CameraState::Stopped);
        assert!(supervisor.source(1).unwrap().is_running());

        supervisor.start_stream(0).unwrap();
        assert!(supervisor.source(0).unwrap().is_running());

        assert!(matches!(
            supervisor.start_stream(7),
            Err(SupervisorError::UnknownStream(7))
        ));
        supervisor.stop_all().await;
    }

    #[test]
    fn test_start_without_runtime_is_reported() {
        let mut supervisor = StreamSupervisor::new(vec![stub("a")], Arc::new(DefaultConnector));
        assert!(matches!(
            supervisor.start_all(),
            Err(SupervisorError::StartFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_slots_follow_configuration_order() {
        let supervisor = StreamSupervisor::new(
            vec![stub("c"), stub("a"), stub("b")],
            Arc::new(DefaultConnector),
        );
        let names: Vec<String> = supervisor
            .slots()
            .iter()
            .map(|slot| slot.name().to_string())
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }
}
