use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc, watch},
    task::{JoinError, JoinHandle},
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    config::Config,
    models::{
        device::{DeviceHandle, InterfaceHint},
        device_group::DeviceGroup,
        status_event::StatusEvent,
        supervisor_state::{SupervisorSnapshot, SupervisorState},
    },
};

use super::{
    dispatcher::{read_primary, ControlDispatcher},
    ports::{ConnectionPort, ProbeError, ProbePort},
};

const STATUS_CHANNEL_CAPACITY: usize = 32;

/// Requests a consumer may send to a running supervisor. Stopping goes
/// through the cancellation token instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCommand {
    ChangeInterface(InterfaceHint),
}

/// The consumer's side of a supervisor: status events, the current snapshot,
/// and the inbound control signals.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx_commands: mpsc::UnboundedSender<SupervisorCommand>,
    tx_status: broadcast::Sender<StatusEvent>,
    rx_snapshot: watch::Receiver<SupervisorSnapshot>,
    token: CancellationToken,
}

impl SupervisorHandle {
    /// Drop any connected group without reporting it lost and start scanning
    /// on `interface`. Returns false if the supervisor is no longer running.
    pub fn change_interface(&self, interface: InterfaceHint) -> bool {
        match self
            .tx_commands
            .send(SupervisorCommand::ChangeInterface(interface))
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Supervisor is not running. Error: {}", e);
                false
            }
        }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx_status.subscribe()
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.rx_snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SupervisorSnapshot> {
        self.rx_snapshot.clone()
    }

    /// A dispatcher bound to the groups this supervisor publishes.
    pub fn dispatcher(&self, config: &Config) -> ControlDispatcher {
        ControlDispatcher::new(self.watch(), config.value_bounds, config.adjust_step)
    }
}

/// Why a wait or an in-flight call ended before it completed.
#[derive(Debug)]
enum Interrupt {
    Stop,
    Interface(InterfaceHint),
    TimedOut,
}

enum Phase {
    Scanning,
    Connecting(Vec<DeviceHandle>),
    Monitoring(Arc<DeviceGroup>),
}

/// A result tagged with the interface it was produced on.
struct Attempt<T> {
    interface: InterfaceHint,
    outcome: T,
}

/// Background task that finds the group, connects to it, watches it, and
/// starts over when it is lost. It is the only writer of the published
/// snapshot and the only producer of status events.
pub struct Supervisor {
    config: Config,
    probe: Arc<dyn ProbePort>,
    connector: Arc<dyn ConnectionPort>,
    token: CancellationToken,
    tx_status: broadcast::Sender<StatusEvent>,
    tx_snapshot: watch::Sender<SupervisorSnapshot>,
    rx_commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    interface: InterfaceHint,
    deadline: Option<Instant>,
    generation: u64,
}

impl Supervisor {
    pub fn new(
        config: Config,
        probe: Arc<dyn ProbePort>,
        connector: Arc<dyn ConnectionPort>,
        interface: InterfaceHint,
        token: CancellationToken,
    ) -> (Self, SupervisorHandle) {
        let (tx_status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (tx_snapshot, rx_snapshot) = watch::channel(SupervisorSnapshot::idle(interface.clone()));
        let (tx_commands, rx_commands) = mpsc::unbounded_channel();

        let handle = SupervisorHandle {
            tx_commands,
            tx_status: tx_status.clone(),
            rx_snapshot,
            token: token.clone(),
        };
        let supervisor = Self {
            config,
            probe,
            connector,
            token,
            tx_status,
            tx_snapshot,
            rx_commands,
            interface,
            deadline: None,
            generation: 0,
        };
        (supervisor, handle)
    }

    /// Task: scan, connect, and monitor until stopped or timed out. Ends in
    /// the `Stopped` state.
    #[instrument(skip_all)]
    pub async fn run(mut self) {
        info!("Started with interface {}.", self.interface);
        let mut phase = self.enter_scanning();

        loop {
            if self.token.is_cancelled() {
                warn!("Cancelled.");
                break;
            }

            let step = match phase {
                Phase::Scanning => self.scan().await,
                Phase::Connecting(candidates) => self.connect(candidates).await,
                Phase::Monitoring(group) => self.monitor(group).await,
            };

            phase = match step {
                Ok(next) => next,
                Err(Interrupt::Stop) => {
                    warn!("Cancelled.");
                    break;
                }
                Err(Interrupt::TimedOut) => {
                    error!(
                        "No group connected within {:?}. Giving up.",
                        self.config.overall_timeout
                    );
                    self.emit(StatusEvent::Error("timed out".into()));
                    break;
                }
                Err(Interrupt::Interface(interface)) => {
                    info!("Switching to network interface {}.", interface);
                    self.interface = interface;
                    self.enter_scanning()
                }
            };
        }

        self.publish(SupervisorState::Stopped, None);
        info!("Stopped.");
    }

    /// Probe once and decide what to do with the result.
    #[instrument(skip_all)]
    async fn scan(&mut self) -> Result<Phase, Interrupt> {
        trace!("Attempting scan.");
        let probe = Arc::clone(&self.probe);
        let landed = self
            .in_flight(tokio::spawn(async move { probe.probe().await }))
            .await?;
        let group_size = self.config.group_size;

        let backoff = match landed {
            Ok(Ok(candidates)) if candidates.len() == group_size => {
                info!("Found all {} devices.", group_size);
                for (i, candidate) in candidates.iter().enumerate() {
                    debug!("Device {}: {}", i + 1, candidate);
                }
                self.publish(SupervisorState::Connecting, None);
                return Ok(Phase::Connecting(candidates));
            }
            Ok(Ok(candidates)) if candidates.is_empty() => {
                info!("No devices found in this scan.");
                self.emit(StatusEvent::Searching);
                self.config.scan_interval
            }
            Ok(Ok(candidates)) if candidates.len() < group_size => {
                info!(
                    "Found {} of {} devices, continuing search.",
                    candidates.len(),
                    group_size
                );
                self.emit(StatusEvent::FoundPartial(candidates.len()));
                self.config.scan_interval
            }
            Ok(Ok(candidates)) => {
                warn!(
                    "Found {} devices but expected {}. Ignoring this scan.",
                    candidates.len(),
                    group_size
                );
                self.emit(StatusEvent::Searching);
                self.config.scan_interval
            }
            Ok(Err(ProbeError::TransientCongestion(reason))) => {
                warn!("Discovery transport congested, retrying shortly. Reason: {}", reason);
                self.emit(StatusEvent::Searching);
                self.config.retry_interval
            }
            Ok(Err(e)) => {
                error!("Scan failed. Error: {}", e);
                self.emit(StatusEvent::Retrying(e.to_string()));
                self.config.scan_interval
            }
            Err(e) => {
                error!("Probe task failed. Error: {}", e);
                self.emit(StatusEvent::Retrying(e.to_string()));
                self.config.scan_interval
            }
        };

        self.pause(backoff).await?;
        Ok(Phase::Scanning)
    }

    /// Connect to a complete set of candidates.
    #[instrument(skip_all)]
    async fn connect(&mut self, candidates: Vec<DeviceHandle>) -> Result<Phase, Interrupt> {
        info!("Attempting to connect to all devices via {}.", self.interface);
        match self.open_group(candidates).await? {
            Ok(group) => {
                info!("Successfully connected. Group: {}", group);
                self.deadline = None;
                self.publish(SupervisorState::Monitoring, Some(Arc::clone(&group)));
                self.emit(StatusEvent::Ready(Arc::clone(&group)));
                Ok(Phase::Monitoring(group))
            }
            Err(reason) => {
                error!("Connection failed. Error: {}", reason);
                self.emit(StatusEvent::ConnectFailed(reason));
                self.pause(self.config.scan_interval).await?;
                self.publish(SupervisorState::Scanning, None);
                Ok(Phase::Scanning)
            }
        }
    }

    /// One monitor tick: wait, read from the primary device, and on failure
    /// try exactly one reconnect before declaring the group lost.
    #[instrument(skip_all)]
    async fn monitor(&mut self, group: Arc<DeviceGroup>) -> Result<Phase, Interrupt> {
        self.pause(self.config.monitor_interval).await?;

        let interface = self.interface.clone();
        let checked = Arc::clone(&group);
        let task = tokio::spawn(async move {
            let outcome = read_primary(&checked).await;
            Attempt { interface, outcome }
        });

        let failure = match self.in_flight(task).await? {
            Ok(attempt) => match self.accept(attempt)? {
                Ok(level) => {
                    trace!("Group {} answered with {}.", group, level);
                    return Ok(Phase::Monitoring(group));
                }
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        warn!("Monitor read failed, attempting reconnect. Error: {}", failure);
        match self.open_group(group.handles()).await? {
            Ok(fresh) => {
                info!("Reconnected. Group: {}", fresh);
                self.publish(SupervisorState::Monitoring, Some(Arc::clone(&fresh)));
                Ok(Phase::Monitoring(fresh))
            }
            Err(reason) => {
                error!("Reconnect failed, group lost. Error: {}", reason);
                // NOTE: the group is unpublished before `Lost` goes out.
                let next = self.enter_scanning();
                self.emit(StatusEvent::Lost);
                Ok(next)
            }
        }
    }

    /// Run the connection port for `candidates` and build a group from the
    /// result. The inner `Err` is a connect failure worth reporting.
    async fn open_group(
        &mut self,
        candidates: Vec<DeviceHandle>,
    ) -> Result<Result<Arc<DeviceGroup>, String>, Interrupt> {
        let connector = Arc::clone(&self.connector);
        let interface = self.interface.clone();
        let task = tokio::spawn(async move {
            let outcome = connector.connect(&candidates, &interface).await;
            Attempt {
                interface,
                outcome: outcome.map(|links| (candidates, links)),
            }
        });

        let outcome = match self.in_flight(task).await? {
            Ok(attempt) => self.accept(attempt)?,
            Err(e) => return Ok(Err(format!("Connect task failed. Error: {}", e))),
        };
        let (candidates, links) = match outcome {
            Ok(opened) => opened,
            Err(e) => return Ok(Err(e.to_string())),
        };

        self.generation += 1;
        let built = DeviceGroup::build(
            self.config.group_size,
            self.generation,
            candidates,
            links,
            &self.interface,
        );
        Ok(built.map(Arc::new).map_err(|e| e.to_string()))
    }

    /// Reset to scanning with a fresh overall deadline. Any group is dropped
    /// without an event.
    fn enter_scanning(&mut self) -> Phase {
        self.deadline = Some(Instant::now() + self.config.overall_timeout);
        self.publish(SupervisorState::Scanning, None);
        Phase::Scanning
    }

    /// Unwrap a landed result, unless it belongs to an interface that has
    /// been replaced since it was started.
    fn accept<T>(&self, attempt: Attempt<T>) -> Result<T, Interrupt> {
        if attempt.interface != self.interface {
            warn!(
                "Discarding result for superseded interface {}.",
                attempt.interface
            );
            return Err(Interrupt::Interface(self.interface.clone()));
        }
        Ok(attempt.outcome)
    }

    /// Wait for a spawned call. If interrupted first, the call is left to
    /// finish on its own and its result is dropped.
    async fn in_flight<T>(
        &mut self,
        task: JoinHandle<T>,
    ) -> Result<Result<T, JoinError>, Interrupt> {
        tokio::select! {
            biased;
            interrupt = self.interrupted() => {
                debug!("Abandoning in-flight call. Reason: {:?}", interrupt);
                Err(interrupt)
            }
            landed = task => Ok(landed),
        }
    }

    async fn pause(&mut self, duration: Duration) -> Result<(), Interrupt> {
        trace!("Sleeping for {:?}.", duration);
        let wake = Instant::now() + duration;
        tokio::select! {
            biased;
            interrupt = self.interrupted() => Err(interrupt),
            _ = sleep_until(wake) => Ok(()),
        }
    }

    /// Resolves on the first of: stop, an interface change, or the overall
    /// deadline passing.
    async fn interrupted(&mut self) -> Interrupt {
        let deadline = self.deadline;
        let timed_out = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        let rx_commands = &mut self.rx_commands;
        let command = async move {
            match rx_commands.recv().await {
                Some(command) => command,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Interrupt::Stop,
            command = command => match command {
                SupervisorCommand::ChangeInterface(interface) => Interrupt::Interface(interface),
            },
            _ = timed_out => Interrupt::TimedOut,
        }
    }

    fn publish(&self, state: SupervisorState, group: Option<Arc<DeviceGroup>>) {
        debug!("State is now {}.", state);
        self.tx_snapshot.send_replace(SupervisorSnapshot {
            state,
            interface: self.interface.clone(),
            group,
        });
    }

    fn emit(&self, event: StatusEvent) {
        debug!("Status: {}", event);
        if let Err(e) = self.tx_status.send(event) {
            trace!("No status subscribers. Error: {}", e);
        }
    }
}
