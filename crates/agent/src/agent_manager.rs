use std::sync::{Arc, RwLock};

use common::{AgentId, PingInfo};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::http::RosterListener;
use crate::metrics::Metrics;
use crate::ping::PingSender;

type Roster = Arc<Vec<(AgentId, PingInfo)>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub active: usize,
    pub inactive: usize,
}

/// Owns the configured peer list and the active roster derived from pings.
///
/// The roster is replaced wholesale on every refresh; readers clone the
/// current `Arc` and never observe a half-built roster.
pub struct AgentManager {
    configured: Vec<AgentId>,
    active: RwLock<Roster>,
    pinger: Arc<PingSender>,
    ping_concurrency: usize,
    listeners: Vec<Arc<dyn RosterListener>>,
    metrics: Arc<Metrics>,
}

impl AgentManager {
    pub fn new(
        self_id: &AgentId,
        peers: Vec<AgentId>,
        pinger: Arc<PingSender>,
        ping_concurrency: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let configured: Vec<AgentId> = peers.into_iter().filter(|p| p != self_id).collect();
        Self {
            configured,
            active: RwLock::new(Arc::new(Vec::new())),
            pinger,
            ping_concurrency: ping_concurrency.max(1),
            listeners: Vec::new(),
            metrics,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn RosterListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Every configured peer in configuration order, regardless of liveness.
    pub fn get_all(&self) -> Vec<AgentId> {
        self.configured.clone()
    }

    /// Point-in-time snapshot of the peers that answered the last refresh.
    pub fn get_active(&self) -> Vec<AgentId> {
        self.snapshot().iter().map(|(id, _)| id.clone()).collect()
    }

    /// Active peers together with the PingInfo each last reported.
    pub fn active_with_info(&self) -> Vec<(AgentId, PingInfo)> {
        self.snapshot().as_ref().clone()
    }

    #[cfg(test)]
    pub fn ping_info(&self, agent: &AgentId) -> Option<PingInfo> {
        self.snapshot()
            .iter()
            .find(|(id, _)| id == agent)
            .map(|(_, info)| info.clone())
    }

    fn snapshot(&self) -> Roster {
        match self.active.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, roster: Vec<(AgentId, PingInfo)>) {
        let roster = Arc::new(roster);
        match self.active.write() {
            Ok(mut guard) => *guard = roster,
            Err(poisoned) => *poisoned.into_inner() = roster,
        }
    }

    /// Ping every configured peer and swap in the resulting roster.
    /// Individual ping failures only mark that peer inactive.
    pub async fn refresh(&self) -> RefreshReport {
        let pings: Vec<_> = self
            .configured
            .iter()
            .cloned()
            .enumerate()
            .map(|(idx, agent)| {
                let pinger = self.pinger.clone();
                async move {
                    match pinger.ping(agent.host(), agent.rest_port(), false).await {
                        Ok(info) => {
                            if info.agent_id.base_port() != agent.base_port() {
                                warn!(agent=%agent, reported=%info.agent_id, "peer reports a different base port");
                            }
                            debug!(agent=%agent, "ping ok");
                            (idx, Some(info))
                        }
                        Err(e) => {
                            debug!(agent=%agent, error=%e, "ping failed");
                            (idx, None)
                        }
                    }
                }
            })
            .collect();
        let mut results: Vec<(usize, Option<PingInfo>)> = futures::stream::iter(pings)
            .buffer_unordered(self.ping_concurrency)
            .collect()
            .await;
        results.sort_by_key(|(idx, _)| *idx);

        let roster: Vec<(AgentId, PingInfo)> = results
            .into_iter()
            .filter_map(|(idx, info)| info.map(|i| (self.configured[idx].clone(), i)))
            .collect();

        let report = RefreshReport {
            active: roster.len(),
            inactive: self.configured.len() - roster.len(),
        };
        Metrics::add(&self.metrics.pings_ok_total, report.active as u64);
        Metrics::add(&self.metrics.pings_failed_total, report.inactive as u64);
        self.metrics.set_agents_active(report.active as u64);

        self.replace(roster);
        for listener in &self.listeners {
            listener.roster_refreshed(&self.configured);
        }
        info!(active = report.active, inactive = report.inactive, "agent roster refreshed");
        report
    }
}
