//! In-memory stand-ins for the ports, driven by scripts.

use std::{
    collections::VecDeque,
    fmt::Debug,
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    internals::core::ports::{
        ConnectError, ConnectionPort, DeviceLink, LinkError, LinkHandle, ProbeError, ProbePort,
    },
    models::{
        device::{DeviceHandle, InterfaceHint},
        device_group::DeviceGroup,
    },
};

pub fn handles(count: usize) -> Vec<DeviceHandle> {
    (0..count)
        .map(|i| DeviceHandle::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i as u8 + 1)), 45))
        .collect()
}

pub fn fake_links(levels: &[f64]) -> Vec<Arc<FakeLink>> {
    levels.iter().map(|l| Arc::new(FakeLink::new(*l))).collect()
}

pub fn fake_group(generation: u64, levels: &[f64]) -> (Arc<DeviceGroup>, Vec<Arc<FakeLink>>) {
    let links = fake_links(levels);
    let group = DeviceGroup::build(
        levels.len(),
        generation,
        handles(levels.len()),
        links.iter().map(|l| Some(l.clone() as LinkHandle)).collect(),
        &InterfaceHint::new("en0"),
    )
    .expect("Failed to build fake group.");
    (Arc::new(group), links)
}

#[derive(Debug, Default)]
struct FakeLinkState {
    level: f64,
    queries: usize,
    applied: Vec<f64>,
    fail_queries: bool,
    malformed: bool,
    reject_applies: bool,
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// A device that keeps its level in memory. Applied values become the new
/// level, so reads after an adjust observe it.
pub struct FakeLink {
    state: Mutex<FakeLinkState>,
    on_query: Mutex<Option<Hook>>,
}

impl FakeLink {
    pub fn new(level: f64) -> Self {
        Self {
            state: Mutex::new(FakeLinkState {
                level,
                ..Default::default()
            }),
            on_query: Mutex::new(None),
        }
    }

    pub fn level(&self) -> f64 {
        self.state.lock().unwrap().level
    }

    pub fn query_count(&self) -> usize {
        self.state.lock().unwrap().queries
    }

    pub fn applied(&self) -> Vec<f64> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn fail_queries(&self, fail: bool) {
        self.state.lock().unwrap().fail_queries = fail;
    }

    pub fn respond_malformed(&self, malformed: bool) {
        self.state.lock().unwrap().malformed = malformed;
    }

    pub fn reject_applies(&self, reject: bool) {
        self.state.lock().unwrap().reject_applies = reject;
    }

    /// Run `hook` while a query is in flight, before it answers.
    pub fn on_query(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_query.lock().unwrap() = Some(Box::new(hook));
    }
}

impl Debug for FakeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeLink")
            .field("state", &self.state)
            .finish()
    }
}

#[async_trait]
impl DeviceLink for FakeLink {
    async fn query(&self) -> Result<f64, LinkError> {
        tokio::task::yield_now().await;
        if let Some(hook) = self.on_query.lock().unwrap().as_ref() {
            hook();
        }
        let mut state = self.state.lock().unwrap();
        state.queries += 1;
        if state.fail_queries {
            return Err(LinkError::Closed);
        }
        if state.malformed {
            return Err(LinkError::Malformed("unexpected field `osc`".into()));
        }
        Ok(state.level)
    }

    async fn apply(&self, value: f64) -> Result<(), LinkError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        if state.reject_applies {
            return Err(LinkError::Rejected("nack".into()));
        }
        state.applied.push(value);
        state.level = value;
        Ok(())
    }
}

type ProbeOutcome = Result<Vec<DeviceHandle>, ProbeError>;

/// Answers probes from a script. Once the script runs out it repeats the
/// fallback, or never answers if there is none.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeOutcome>>,
    fallback: Option<ProbeOutcome>,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedProbe {
    pub fn new(script: Vec<ProbeOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            calls: Mutex::new(vec![]),
        }
    }

    pub fn repeating(mut self, outcome: ProbeOutcome) -> Self {
        self.fallback = Some(outcome);
        self
    }

    /// When each probe started, on tokio's clock.
    pub fn calls(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProbePort for ScriptedProbe {
    async fn probe(&self) -> ProbeOutcome {
        self.calls.lock().unwrap().push(Instant::now());
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.clone());
        match next {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }
}

type ConnectOutcome = Result<Vec<Option<Arc<FakeLink>>>, ConnectError>;

/// Answers connect calls from a script and never answers once it runs out.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<ConnectOutcome>>,
    calls: Mutex<Vec<(Vec<DeviceHandle>, InterfaceHint)>>,
}

impl ScriptedConnector {
    pub fn new(script: Vec<ConnectOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn calls(&self) -> Vec<(Vec<DeviceHandle>, InterfaceHint)> {
        self.calls.lock().unwrap().clone()
    }
}

/// Wrap links as a successful connect outcome.
pub fn connected(links: &[Arc<FakeLink>]) -> ConnectOutcome {
    Ok(links.iter().map(|l| Some(l.clone())).collect())
}

#[async_trait]
impl ConnectionPort for ScriptedConnector {
    async fn connect(
        &self,
        handles: &[DeviceHandle],
        interface: &InterfaceHint,
    ) -> Result<Vec<Option<LinkHandle>>, ConnectError> {
        self.calls
            .lock()
            .unwrap()
            .push((handles.to_vec(), interface.clone()));
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(outcome) => outcome.map(|links| {
                links
                    .into_iter()
                    .map(|l| l.map(|l| l as LinkHandle))
                    .collect()
            }),
            None => std::future::pending().await,
        }
    }
}
