//! In-memory fake of the call-control boundary
//!
//! Drives the router and sequencer tests without a gateway. Every command
//! verb is recorded; failure injection covers the paths the error-handling
//! design cares about (inventory queries, per-resource registration, merge
//! and connect commands).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    CallControlProvider, ConnectionState, CtiAddress, CtiCall, CtiConnection, CtiError, CtiEvent,
    CtiTerminal,
};

/// A recorded command verb, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RegisterMediaLess {
        terminal: String,
    },
    ObserveTerminal {
        terminal: String,
    },
    ObserveAddress {
        address: String,
    },
    CreateCall {
        call: String,
    },
    SetConferenceEnabled {
        call: String,
        enabled: bool,
    },
    Connect {
        call: String,
        terminal: String,
        address: String,
        dialed: String,
    },
    Conference {
        call: String,
        other: String,
    },
    Disconnect {
        address: String,
    },
}

#[derive(Clone)]
struct Leg {
    id: String,
    call_id: String,
    address: String,
    state: ConnectionState,
}

#[derive(Default)]
struct FakeInner {
    terminals: Mutex<Vec<(String, bool)>>,
    addresses: Mutex<Vec<String>>,
    address_legs: Mutex<HashMap<String, Vec<Leg>>>,
    calls: Mutex<HashMap<String, Vec<Leg>>>,
    commands: Mutex<Vec<Command>>,
    poll_counts: Mutex<HashMap<String, u32>>,
    join_after_polls: Mutex<Option<u32>>,
    next_id: AtomicU64,
    fail_merge: AtomicBool,
    fail_terminals_query: AtomicBool,
    fail_addresses_query: AtomicBool,
    fail_register: Mutex<HashSet<String>>,
    fail_observe_address: Mutex<HashSet<String>>,
    fail_connect: Mutex<HashSet<String>>,
}

impl FakeInner {
    fn record(&self, command: Command) {
        self.commands.lock().unwrap().push(command);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Programmable fake provider. Clone freely; clones share state.
#[derive(Clone, Default)]
pub struct FakeCti {
    inner: Arc<FakeInner>,
}

impl FakeCti {
    pub fn new() -> Self {
        Self::default()
    }

    /// The provider handle handed to the code under test.
    pub fn provider(&self) -> Arc<dyn CallControlProvider> {
        Arc::new(self.clone())
    }

    /// All commands issued so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.inner.commands.lock().unwrap().clone()
    }

    /// How many times a call's legs were listed.
    pub fn poll_count(&self, call_id: &str) -> u32 {
        self.inner
            .poll_counts
            .lock()
            .unwrap()
            .get(call_id)
            .copied()
            .unwrap_or(0)
    }

    /// Id of the most recently created (not inbound) call.
    pub fn last_created_call(&self) -> Option<String> {
        self.inner
            .commands
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|c| match c {
                Command::CreateCall { call } => Some(call.clone()),
                _ => None,
            })
    }

    /// Dialed legs reach connected once their call has been listed this many
    /// times. Unset means the destination never joins.
    pub fn set_join_after_polls(&self, polls: u32) {
        *self.inner.join_after_polls.lock().unwrap() = Some(polls);
    }

    pub fn fail_merge(&self) {
        self.inner.fail_merge.store(true, Ordering::Relaxed);
    }

    pub fn fail_terminals_query(&self) {
        self.inner.fail_terminals_query.store(true, Ordering::Relaxed);
    }

    pub fn fail_addresses_query(&self) {
        self.inner.fail_addresses_query.store(true, Ordering::Relaxed);
    }

    pub fn fail_register_for(&self, terminal: &str) {
        self.inner
            .fail_register
            .lock()
            .unwrap()
            .insert(terminal.to_string());
    }

    pub fn fail_observe_address(&self, address: &str) {
        self.inner
            .fail_observe_address
            .lock()
            .unwrap()
            .insert(address.to_string());
    }

    pub fn fail_connect_for_terminal(&self, terminal: &str) {
        self.inner
            .fail_connect
            .lock()
            .unwrap()
            .insert(terminal.to_string());
    }

    pub fn add_terminal(&self, name: &str, route_point: bool) {
        self.inner
            .terminals
            .lock()
            .unwrap()
            .push((name.to_string(), route_point));
    }

    pub fn add_address(&self, dn: &str) {
        self.inner.addresses.lock().unwrap().push(dn.to_string());
    }

    /// An inbound call carrying one offered leg on `dn`.
    pub fn offered_call(&self, dn: &str) -> Arc<dyn CtiCall> {
        let call_id = format!("inbound-{}", self.inner.next_id());
        let leg = Leg {
            id: format!("leg-{}", self.inner.next_id()),
            call_id: call_id.clone(),
            address: dn.to_string(),
            state: ConnectionState::Offered,
        };
        self.inner
            .calls
            .lock()
            .unwrap()
            .insert(call_id.clone(), vec![leg]);
        Arc::new(FakeCall {
            inner: self.inner.clone(),
            id: call_id,
        })
    }

    /// The offer event the provider would deliver for an inbound call on `dn`.
    pub fn offered_event(&self, dn: &str) -> CtiEvent {
        let call = self.offered_call(dn);
        let leg = self.inner.calls.lock().unwrap()[call.id()][0].clone();
        CtiEvent::ConnectionOffered {
            call,
            connection: Arc::new(FakeConnection {
                inner: self.inner.clone(),
                leg,
            }),
        }
    }

    /// An established call involving `dn`, visible from that address's leg
    /// list. Returns the call id.
    pub fn add_existing_call(&self, dn: &str) -> String {
        let call_id = format!("existing-{}", self.inner.next_id());
        let leg = Leg {
            id: format!("leg-{}", self.inner.next_id()),
            call_id: call_id.clone(),
            address: dn.to_string(),
            state: ConnectionState::Connected,
        };
        self.inner
            .calls
            .lock()
            .unwrap()
            .insert(call_id.clone(), vec![leg.clone()]);
        self.inner
            .address_legs
            .lock()
            .unwrap()
            .entry(dn.to_string())
            .or_default()
            .push(leg);
        call_id
    }
}

#[async_trait]
impl CallControlProvider for FakeCti {
    async fn terminals(&self) -> Result<Vec<Arc<dyn CtiTerminal>>, CtiError> {
        if self.inner.fail_terminals_query.load(Ordering::Relaxed) {
            return Err(CtiError::ResourceUnavailable(
                "terminal inventory unavailable".to_string(),
            ));
        }
        Ok(self
            .inner
            .terminals
            .lock()
            .unwrap()
            .iter()
            .map(|(name, route_point)| {
                Arc::new(FakeTerminal {
                    inner: self.inner.clone(),
                    name: name.clone(),
                    route_point: *route_point,
                }) as Arc<dyn CtiTerminal>
            })
            .collect())
    }

    async fn addresses(&self) -> Result<Vec<Arc<dyn CtiAddress>>, CtiError> {
        if self.inner.fail_addresses_query.load(Ordering::Relaxed) {
            return Err(CtiError::ResourceUnavailable(
                "address inventory unavailable".to_string(),
            ));
        }
        Ok(self
            .inner
            .addresses
            .lock()
            .unwrap()
            .iter()
            .map(|name| {
                Arc::new(FakeAddress {
                    inner: self.inner.clone(),
                    name: name.clone(),
                }) as Arc<dyn CtiAddress>
            })
            .collect())
    }

    async fn terminal(&self, name: &str) -> Result<Arc<dyn CtiTerminal>, CtiError> {
        let terminals = self.inner.terminals.lock().unwrap();
        terminals
            .iter()
            .find(|(n, _)| n == name)
            .map(|(name, route_point)| {
                Arc::new(FakeTerminal {
                    inner: self.inner.clone(),
                    name: name.clone(),
                    route_point: *route_point,
                }) as Arc<dyn CtiTerminal>
            })
            .ok_or_else(|| CtiError::InvalidParty(format!("unknown terminal {name}")))
    }

    async fn address(&self, dn: &str) -> Result<Arc<dyn CtiAddress>, CtiError> {
        Ok(Arc::new(FakeAddress {
            inner: self.inner.clone(),
            name: dn.to_string(),
        }))
    }

    async fn create_call(&self) -> Result<Arc<dyn CtiCall>, CtiError> {
        let call_id = format!("call-{}", self.inner.next_id());
        self.inner
            .calls
            .lock()
            .unwrap()
            .insert(call_id.clone(), Vec::new());
        self.inner.record(Command::CreateCall {
            call: call_id.clone(),
        });
        Ok(Arc::new(FakeCall {
            inner: self.inner.clone(),
            id: call_id,
        }))
    }
}

struct FakeTerminal {
    inner: Arc<FakeInner>,
    name: String,
    route_point: bool,
}

#[async_trait]
impl CtiTerminal for FakeTerminal {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_route_point(&self) -> bool {
        self.route_point
    }

    async fn register_media_less(&self) -> Result<(), CtiError> {
        self.inner.record(Command::RegisterMediaLess {
            terminal: self.name.clone(),
        });
        if self.inner.fail_register.lock().unwrap().contains(&self.name) {
            return Err(CtiError::CommandFailed(format!(
                "registration refused for {}",
                self.name
            )));
        }
        Ok(())
    }

    async fn observe_calls(&self) -> Result<(), CtiError> {
        self.inner.record(Command::ObserveTerminal {
            terminal: self.name.clone(),
        });
        Ok(())
    }
}

struct FakeAddress {
    inner: Arc<FakeInner>,
    name: String,
}

#[async_trait]
impl CtiAddress for FakeAddress {
    fn name(&self) -> &str {
        &self.name
    }

    async fn observe_calls(&self) -> Result<(), CtiError> {
        self.inner.record(Command::ObserveAddress {
            address: self.name.clone(),
        });
        if self
            .inner
            .fail_observe_address
            .lock()
            .unwrap()
            .contains(&self.name)
        {
            return Err(CtiError::CommandFailed(format!(
                "observer refused for {}",
                self.name
            )));
        }
        Ok(())
    }

    async fn connections(&self) -> Result<Vec<Arc<dyn CtiConnection>>, CtiError> {
        let legs = self.inner.address_legs.lock().unwrap();
        Ok(legs
            .get(&self.name)
            .into_iter()
            .flatten()
            .map(|leg| {
                Arc::new(FakeConnection {
                    inner: self.inner.clone(),
                    leg: leg.clone(),
                }) as Arc<dyn CtiConnection>
            })
            .collect())
    }
}

struct FakeCall {
    inner: Arc<FakeInner>,
    id: String,
}

#[async_trait]
impl CtiCall for FakeCall {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connections(&self) -> Result<Vec<Arc<dyn CtiConnection>>, CtiError> {
        let count = {
            let mut counts = self.inner.poll_counts.lock().unwrap();
            let count = counts.entry(self.id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let join_after = *self.inner.join_after_polls.lock().unwrap();
        let mut calls = self.inner.calls.lock().unwrap();
        let legs = calls
            .get_mut(&self.id)
            .ok_or_else(|| CtiError::InvalidState(format!("unknown call {}", self.id)))?;

        if let Some(join_after) = join_after {
            if count >= join_after {
                for leg in legs.iter_mut() {
                    if leg.state == ConnectionState::Alerting {
                        leg.state = ConnectionState::Connected;
                    }
                }
            }
        }

        Ok(legs
            .iter()
            .map(|leg| {
                Arc::new(FakeConnection {
                    inner: self.inner.clone(),
                    leg: leg.clone(),
                }) as Arc<dyn CtiConnection>
            })
            .collect())
    }

    async fn set_conference_enabled(&self, enabled: bool) -> Result<(), CtiError> {
        self.inner.record(Command::SetConferenceEnabled {
            call: self.id.clone(),
            enabled,
        });
        Ok(())
    }

    async fn connect(&self, terminal: &str, address: &str, dialed: &str) -> Result<(), CtiError> {
        self.inner.record(Command::Connect {
            call: self.id.clone(),
            terminal: terminal.to_string(),
            address: address.to_string(),
            dialed: dialed.to_string(),
        });
        if self.inner.fail_connect.lock().unwrap().contains(terminal) {
            return Err(CtiError::CommandFailed(format!(
                "connect refused for {terminal}"
            )));
        }
        self.inner
            .calls
            .lock()
            .unwrap()
            .get_mut(&self.id)
            .ok_or_else(|| CtiError::InvalidState(format!("unknown call {}", self.id)))?
            .push(Leg {
                id: format!("leg-{}", self.inner.next_id()),
                call_id: self.id.clone(),
                address: dialed.to_string(),
                state: ConnectionState::Alerting,
            });
        Ok(())
    }

    async fn conference(&self, other: &dyn CtiCall) -> Result<(), CtiError> {
        self.inner.record(Command::Conference {
            call: self.id.clone(),
            other: other.id().to_string(),
        });
        if self.inner.fail_merge.load(Ordering::Relaxed) {
            return Err(CtiError::CommandFailed("conference refused".to_string()));
        }
        let mut calls = self.inner.calls.lock().unwrap();
        if let Some(mut moved) = calls.remove(other.id()) {
            for leg in moved.iter_mut() {
                leg.call_id = self.id.clone();
            }
            if let Some(legs) = calls.get_mut(&self.id) {
                legs.extend(moved);
            }
        }
        Ok(())
    }
}

struct FakeConnection {
    inner: Arc<FakeInner>,
    leg: Leg,
}

#[async_trait]
impl CtiConnection for FakeConnection {
    fn id(&self) -> &str {
        &self.leg.id
    }

    fn address_name(&self) -> &str {
        &self.leg.address
    }

    fn state(&self) -> ConnectionState {
        self.leg.state
    }

    async fn disconnect(&self) -> Result<(), CtiError> {
        self.inner.record(Command::Disconnect {
            address: self.leg.address.clone(),
        });
        if let Some(legs) = self.inner.calls.lock().unwrap().get_mut(&self.leg.call_id) {
            legs.retain(|leg| leg.id != self.leg.id);
        }
        Ok(())
    }

    async fn call(&self) -> Result<Arc<dyn CtiCall>, CtiError> {
        Ok(Arc::new(FakeCall {
            inner: self.inner.clone(),
            id: self.leg.call_id.clone(),
        }))
    }
}
