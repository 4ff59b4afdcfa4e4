use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, instrument, trace, warn};

use crate::models::{
    device_group::DeviceGroup,
    level::{Level, LevelBounds},
    supervisor_state::SupervisorSnapshot,
};

use super::ports::LinkError;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// There is no connected group, or the group changed mid-command. Wait for
    /// the next `Ready` before trying again.
    #[error("Device group is no longer current.")]
    StaleGroup,
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Failed to reach device. Error: {0}")]
    Link(LinkError),
    /// Some devices refused the new value. Not retried here; the next monitor
    /// tick reconciles.
    #[error("{failed} of {total} devices rejected the new level: {}", .reasons.join("; "))]
    BroadcastPartialFailure {
        failed: usize,
        total: usize,
        reasons: Vec<String>,
    },
}

/// Serves read and adjust requests against whichever group the supervisor
/// currently publishes. Clones share one admission lock, so at most one
/// command is in flight across all of them.
#[derive(Debug, Clone)]
pub struct ControlDispatcher {
    rx_snapshot: watch::Receiver<SupervisorSnapshot>,
    admission: Arc<Mutex<()>>,
    bounds: LevelBounds,
    step: f64,
}

impl ControlDispatcher {
    pub fn new(
        rx_snapshot: watch::Receiver<SupervisorSnapshot>,
        bounds: LevelBounds,
        step: f64,
    ) -> Self {
        Self {
            rx_snapshot,
            admission: Arc::new(Mutex::new(())),
            bounds,
            step,
        }
    }

    /// Read the level from the first device of the current group.
    #[instrument(skip_all)]
    pub async fn read(&self) -> Result<Level, DispatchError> {
        let _admitted = self.admission.lock().await;
        let group = self.current_group()?;
        let level = read_primary(&group).await?;
        self.ensure_current(&group)?;
        debug!("Read level {} from {}.", level, group);
        Ok(level)
    }

    /// Read, move by `step` within bounds, and send the result to every device
    /// of the group. Returns the value that was sent without reading it back.
    #[instrument(skip(self))]
    pub async fn adjust(&self, step: f64) -> Result<Level, DispatchError> {
        let _admitted = self.admission.lock().await;
        let group = self.current_group()?;
        let current = read_primary(&group).await?;
        let target = current.stepped(step, &self.bounds);
        trace!("Adjusting level from {} to {}.", current, target);

        // NOTE: the group may have been lost while the read was in flight.
        self.ensure_current(&group)?;
        broadcast(&group, target).await?;
        debug!("Set level {} on {}.", target, group);
        Ok(target)
    }

    /// Adjust up by the configured step.
    pub async fn step_up(&self) -> Result<Level, DispatchError> {
        self.adjust(self.step).await
    }

    /// Adjust down by the configured step.
    pub async fn step_down(&self) -> Result<Level, DispatchError> {
        self.adjust(-self.step).await
    }

    fn current_group(&self) -> Result<Arc<DeviceGroup>, DispatchError> {
        self.rx_snapshot
            .borrow()
            .ready_group()
            .cloned()
            .ok_or(DispatchError::StaleGroup)
    }

    fn ensure_current(&self, group: &DeviceGroup) -> Result<(), DispatchError> {
        match self.current_group() {
            Ok(current) if current.is_same(group) => Ok(()),
            _ => {
                warn!("Group {} was replaced while a command was in flight.", group);
                Err(DispatchError::StaleGroup)
            }
        }
    }
}

/// Query the primary device and parse its answer into a level. Shared with the
/// supervisor's monitor tick.
pub(crate) async fn read_primary(group: &DeviceGroup) -> Result<Level, DispatchError> {
    let raw = match group.primary().link().query().await {
        Ok(raw) => raw,
        Err(LinkError::Malformed(reason)) => return Err(DispatchError::ProtocolError(reason)),
        Err(e) => return Err(DispatchError::Link(e)),
    };
    Level::try_from(raw).map_err(|e| DispatchError::ProtocolError(e.to_string()))
}

/// Send one level to every device of the group concurrently.
async fn broadcast(group: &DeviceGroup, level: Level) -> Result<(), DispatchError> {
    let results = join_all(group.devices().iter().map(|device| async move {
        (device.handle(), device.link().apply(level.value()).await)
    }))
    .await;

    let reasons = results
        .into_iter()
        .filter_map(|(handle, result)| result.err().map(|e| format!("{}: {}", handle, e)))
        .collect::<Vec<String>>();

    if reasons.is_empty() {
        return Ok(());
    }
    warn!("Broadcast of {} was rejected. Reasons: {:?}", level, reasons);
    Err(DispatchError::BroadcastPartialFailure {
        failed: reasons.len(),
        total: group.len(),
        reasons,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            device::InterfaceHint,
            supervisor_state::{SupervisorSnapshot, SupervisorState},
        },
        testing::{fake_group, FakeLink},
    };

    fn monitoring(group: Arc<DeviceGroup>) -> SupervisorSnapshot {
        SupervisorSnapshot {
            state: SupervisorState::Monitoring,
            interface: InterfaceHint::new("en0"),
            group: Some(group),
        }
    }

    fn setup(
        levels: &[f64],
        bounds: LevelBounds,
        step: f64,
    ) -> (
        ControlDispatcher,
        watch::Sender<SupervisorSnapshot>,
        Vec<Arc<FakeLink>>,
    ) {
        let (group, links) = fake_group(1, levels);
        let (tx_snapshot, rx_snapshot) = watch::channel(monitoring(group));
        let dispatcher = ControlDispatcher::new(rx_snapshot, bounds, step);
        (dispatcher, tx_snapshot, links)
    }

    #[tokio::test]
    async fn test_read_returns_primary_level() {
        let (dispatcher, _tx, links) = setup(&[42f64, 10f64], LevelBounds::default(), 1f64);

        let level = dispatcher.read().await.expect("Failed to read.");
        assert_eq!(level.value(), 42f64);
        assert_eq!(links[0].query_count(), 1);
        assert_eq!(links[1].query_count(), 0);
    }

    #[tokio::test]
    async fn test_consecutive_reads_agree() {
        let (dispatcher, _tx, _links) = setup(&[37.5f64, 37.5f64], LevelBounds::default(), 1f64);

        let first = dispatcher.read().await.unwrap();
        let second = dispatcher.read().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_adjust_clamps_and_broadcasts_clamped_value() {
        let bounds = LevelBounds::new(0f64, 90f64).unwrap();
        let (dispatcher, _tx, links) = setup(&[85f64, 85f64], bounds, 10f64);

        let level = dispatcher.step_up().await.expect("Failed to adjust.");
        assert_eq!(level.value(), 90f64);
        for link in &links {
            assert_eq!(link.applied(), vec![90f64]);
        }
    }

    #[tokio::test]
    async fn test_adjust_down_and_up() {
        let (dispatcher, _tx, links) = setup(&[50f64, 50f64], LevelBounds::default(), 1f64);

        assert_eq!(dispatcher.step_down().await.unwrap().value(), 49f64);
        assert_eq!(dispatcher.step_down().await.unwrap().value(), 48f64);
        assert_eq!(dispatcher.step_up().await.unwrap().value(), 49f64);
        assert_eq!(links[1].applied(), vec![49f64, 48f64, 49f64]);
    }

    #[tokio::test]
    async fn test_adjust_sequence_stays_in_bounds() {
        let bounds = LevelBounds::new(0f64, 3f64).unwrap();
        let (dispatcher, _tx, _links) = setup(&[2f64, 2f64], bounds, 1f64);

        for step in [1f64, 1f64, 1f64, -1f64, -1f64, -1f64, -1f64, -1f64] {
            let level = dispatcher.adjust(step).await.unwrap();
            assert!(bounds.contains(level.value()));
        }
        assert_eq!(dispatcher.read().await.unwrap().value(), 0f64);
    }

    #[tokio::test]
    async fn test_stale_when_not_monitoring() {
        let (dispatcher, tx, _links) = setup(&[50f64, 50f64], LevelBounds::default(), 1f64);
        tx.send_replace(SupervisorSnapshot {
            state: SupervisorState::Scanning,
            interface: InterfaceHint::new("en0"),
            group: None,
        });

        assert!(matches!(
            dispatcher.read().await,
            Err(DispatchError::StaleGroup)
        ));
        assert!(matches!(
            dispatcher.step_up().await,
            Err(DispatchError::StaleGroup)
        ));
    }

    #[tokio::test]
    async fn test_stale_when_group_replaced_mid_command() {
        let (dispatcher, tx, links) = setup(&[50f64, 50f64], LevelBounds::default(), 1f64);
        let (replacement, _) = fake_group(2, &[50f64, 50f64]);
        links[0].on_query(move || {
            tx.send_replace(monitoring(replacement.clone()));
        });

        assert!(matches!(
            dispatcher.step_up().await,
            Err(DispatchError::StaleGroup)
        ));
        assert!(links.iter().all(|l| l.applied().is_empty()));
    }

    #[tokio::test]
    async fn test_malformed_response_is_protocol_error() {
        let (dispatcher, _tx, links) = setup(&[50f64, 50f64], LevelBounds::default(), 1f64);
        links[0].respond_malformed(true);

        assert!(matches!(
            dispatcher.read().await,
            Err(DispatchError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn test_non_finite_level_is_protocol_error() {
        let (dispatcher, _tx, _links) = setup(&[f64::NAN, 50f64], LevelBounds::default(), 1f64);

        assert!(matches!(
            dispatcher.read().await,
            Err(DispatchError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn test_partial_broadcast_failure_is_reported() {
        let (dispatcher, _tx, links) = setup(&[50f64, 50f64], LevelBounds::default(), 1f64);
        links[1].reject_applies(true);

        match dispatcher.step_up().await {
            Err(DispatchError::BroadcastPartialFailure { failed, total, .. }) => {
                assert_eq!(failed, 1);
                assert_eq!(total, 2);
            }
            other => panic!("Unexpected result: {:?}", other),
        }
        assert_eq!(links[0].applied(), vec![51f64]);
    }

    #[tokio::test]
    async fn test_concurrent_adjusts_are_serialized() {
        let (dispatcher, _tx, links) = setup(&[10f64, 10f64], LevelBounds::default(), 1f64);

        let a = dispatcher.clone();
        let b = dispatcher.clone();
        let (first, second) = tokio::join!(a.step_up(), b.step_up());

        let mut results = vec![first.unwrap().value(), second.unwrap().value()];
        results.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(results, vec![11f64, 12f64]);
        assert_eq!(links[0].level(), 12f64);
    }
}
