//! Event router
//!
//! Single dispatch point for provider, terminal, address and call events.
//! Keeps the readiness latches current, registers call observers across the
//! provider inventory once the provider comes up, and starts the conference
//! sequencer when an offer lands on the route point. Sequences run in their
//! own task so the event loop never stalls behind a join poll; one sequence
//! is admitted per triggering call id.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MergeRule;
use crate::cti::{CallControlProvider, CtiCall, CtiConnection, CtiError, CtiEvent, CtiTerminal};
use crate::readiness::ReadinessTracker;
use crate::sequencer::ConferenceSequencer;

pub struct EventRouter {
    provider: Arc<dyn CallControlProvider>,
    readiness: Arc<ReadinessTracker>,
    rule: MergeRule,
    in_flight: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
}

impl EventRouter {
    pub fn new(
        provider: Arc<dyn CallControlProvider>,
        readiness: Arc<ReadinessTracker>,
        rule: MergeRule,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            readiness,
            rule,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cancel,
        }
    }

    /// Consume the provider event stream until it closes.
    pub async fn run(self, mut events: mpsc::Receiver<CtiEvent>) {
        while let Some(event) = events.recv().await {
            info!(%event, "received");
            self.dispatch(event).await;
        }
        info!("provider event stream ended");
    }

    async fn dispatch(&self, event: CtiEvent) {
        match event {
            CtiEvent::ProviderInService => {
                self.readiness.provider.set();
                self.observe_inventory().await;
            }
            CtiEvent::ProviderOutOfService => {
                warn!("provider went out of service");
            }
            CtiEvent::TerminalInService { terminal } => {
                if terminal == self.rule.route_point_terminal {
                    self.readiness.route_point_terminal.set();
                }
                self.readiness.any_terminal.set();
            }
            CtiEvent::AddressInService { address } => {
                if address == self.rule.route_point_dn {
                    self.readiness.route_point_address.set();
                }
                self.readiness.any_address.set();
            }
            CtiEvent::ConnectionOffered { call, connection } => {
                self.handle_offer(call, connection).await;
            }
            // Observed for the log, no action.
            CtiEvent::ConnectionConnected { .. }
            | CtiEvent::ConnectionDisconnected { .. }
            | CtiEvent::CallEnded { .. } => {}
        }
    }

    /// Attach call observers across the provider's current inventory. A
    /// failing resource is logged and skipped; the rest are still attempted.
    async fn observe_inventory(&self) {
        let terminals = match self.provider.terminals().await {
            Ok(terminals) => terminals,
            Err(e) => {
                warn!(error = %e, "terminal inventory query failed");
                Vec::new()
            }
        };
        for terminal in terminals {
            info!(terminal = terminal.name(), "adding call observer");
            if let Err(e) = self.observe_terminal(terminal.as_ref()).await {
                warn!(terminal = terminal.name(), error = %e, "failed to observe terminal");
            }
        }

        let addresses = match self.provider.addresses().await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(error = %e, "address inventory query failed");
                Vec::new()
            }
        };
        for address in addresses {
            info!(address = address.name(), "adding call observer");
            if let Err(e) = address.observe_calls().await {
                warn!(address = address.name(), error = %e, "failed to observe address");
            }
        }
    }

    async fn observe_terminal(&self, terminal: &dyn CtiTerminal) -> Result<(), CtiError> {
        if terminal.is_route_point() {
            terminal.register_media_less().await?;
        }
        terminal.observe_calls().await
    }

    async fn handle_offer(&self, call: Arc<dyn CtiCall>, connection: Arc<dyn CtiConnection>) {
        let address = connection.address_name();
        if address != self.rule.route_point_dn {
            debug!(address, "offer outside the route point, ignoring");
            return;
        }

        let call_id = call.id().to_string();
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(call_id.clone()) {
                warn!(call = %call_id, "merge sequence already in flight, ignoring duplicate offer");
                return;
            }
        }

        info!(call = %call_id, dn = %self.rule.route_point_dn, "offer on route point, starting merge sequence");
        let sequencer = ConferenceSequencer::new(self.provider.clone(), self.rule.clone());
        let in_flight = self.in_flight.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            match sequencer.run(call, &cancel).await {
                Ok(outcome) => info!(call = %call_id, %outcome, "merge sequence finished"),
                Err(e) => error!(call = %call_id, error = %e, "merge sequence failed"),
            }
            in_flight.lock().await.remove(&call_id);
        });
    }
}
