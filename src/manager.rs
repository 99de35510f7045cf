//! Lifecycle scheduler for all configured sessions.
//!
//! [`SessionManager::tick`] is the control tick: it applies queued transport
//! events, enforces the liveness window, starts at most one connection per
//! tick and schedules scans. Notifications reach sessions only through the
//! event queue, so a lifecycle reset never races reassembly. Every pause of a
//! connection cycle keeps applying queued events, so other sessions keep
//! decoding while one of them connects.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::protocol::{
    encode_command, DeviceInfo, Register, SetSwitch, Settings, CHARACTERISTIC_UUID, SERVICE_UUID,
};
use crate::registry::{MacAddress, SessionRegistry};
use crate::session::{NotificationOutcome, Session, SessionState};
use crate::transport::{self, NotificationSink, Transport, TransportError, TransportEvent};
use crate::Error;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Ready,
    /// Too soon after the previous connection attempt.
    Spacing,
    /// All connection slots are taken.
    AtCapacity,
}

#[derive(Debug)]
struct GateState {
    last_attempt: Option<Instant>,
    established: usize,
    max_connections: usize,
    spacing: Duration,
}

/// Spacing between connection attempts and the cap on established
/// connections, shared by every session.
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    inner: Arc<Mutex<GateState>>,
}

impl ConnectionGate {
    pub fn new(max_connections: usize, spacing: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GateState {
                last_attempt: None,
                established: 0,
                max_connections,
                spacing,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check(&self, now: Instant) -> GateDecision {
        let state = self.lock();
        if state.established >= state.max_connections {
            return GateDecision::AtCapacity;
        }
        match state.last_attempt {
            Some(last) if now.saturating_duration_since(last) < state.spacing => {
                GateDecision::Spacing
            }
            _ => GateDecision::Ready,
        }
    }

    pub fn record_attempt(&self, now: Instant) {
        self.lock().last_attempt = Some(now);
    }

    /// Takes a connection slot if one is free.
    pub fn acquire(&self) -> bool {
        let mut state = self.lock();
        if state.established >= state.max_connections {
            return false;
        }
        state.established += 1;
        true
    }

    pub fn release(&self) {
        let mut state = self.lock();
        state.established = state.established.saturating_sub(1);
    }

    pub fn established(&self) -> usize {
        self.lock().established
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.lock().last_attempt
    }
}

enum Attempt {
    Connected,
    Deferred,
    Failed,
}

enum Step {
    Shutdown,
    Tick,
    Event(Option<TransportEvent>),
}

async fn bounded<R>(
    limit: Duration,
    operation: impl Future<Output = transport::Result<R>>,
) -> transport::Result<R> {
    tokio::time::timeout(limit, operation)
        .await
        .unwrap_or(Err(TransportError::Timeout))
}

/// Owns the session registry and drives every session through its
/// lifecycle over a [`Transport`].
pub struct SessionManager<T: Transport, C: Clock> {
    config: EngineConfig,
    transport: T,
    clock: Arc<C>,
    registry: SessionRegistry,
    links: HashMap<MacAddress, T::Link>,
    gate: ConnectionGate,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: mpsc::Receiver<TransportEvent>,
    last_scan: Option<Instant>,
}

impl<T: Transport, C: Clock> SessionManager<T, C> {
    /// Builds the registry from `config`.
    ///
    /// Fails only on configuration errors such as a malformed target address.
    pub fn new(config: EngineConfig, transport: T, clock: C) -> std::result::Result<Self, Error> {
        config.validate()?;
        let targets = config.targets()?;
        let registry = SessionRegistry::new(&targets, config.echo_suppression_count);
        let gate = ConnectionGate::new(config.max_connections, config.connect_spacing);
        let (events_tx, events_rx) = mpsc::channel(config.notification_queue);
        log::info!("Managing {} device(s)", registry.len());
        Ok(Self {
            config,
            transport,
            clock: Arc::new(clock),
            registry,
            links: HashMap::new(),
            gate,
            events_tx,
            events_rx,
            last_scan: None,
        })
    }

    /// Replaces the connection gate, e.g. to share one across managers.
    pub fn with_gate(mut self, gate: ConnectionGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn session(&self, address: &MacAddress) -> Option<&Session> {
        self.registry.get(address)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.registry.iter()
    }

    pub fn gate(&self) -> &ConnectionGate {
        &self.gate
    }

    /// Applies one transport event.
    ///
    /// Returns the notification outcome, or `None` if the event was not a
    /// notification for a linked session.
    pub fn handle_event(&mut self, event: TransportEvent) -> Option<NotificationOutcome> {
        let now = self.clock.now();
        match event {
            TransportEvent::Notification { address, data } => {
                let Some(session) = self.registry.get_mut(&address) else {
                    log::trace!("Notification from unknown device {address}");
                    return None;
                };
                if !session.state().is_linked() {
                    log::trace!("{address}: ignoring notification in state {}", session.state());
                    return None;
                }
                Some(session.handle_notification(&data, now))
            }
            TransportEvent::Disconnected { address } => {
                if self.links.contains_key(&address) {
                    log::info!("{address}: disconnected");
                    self.release_link(address);
                }
                None
            }
        }
    }

    /// Applies every queued event. Returns how many were applied.
    pub fn drain_events(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            applied += 1;
        }
        applied
    }

    /// Waits for the next transport event.
    ///
    /// For callers running their own loop around [`tick`](Self::tick); pass
    /// the result to [`handle_event`](Self::handle_event).
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    /// One control tick.
    pub async fn tick(&mut self) {
        self.drain_events();
        self.check_liveness().await;
        self.connect_next().await;
        self.maybe_scan().await;
    }

    /// Runs ticks at `tick_interval` and applies events as they arrive until
    /// `shutdown` resolves, then disconnects everything.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let step = tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                _ = ticker.tick() => Step::Tick,
                event = self.events_rx.recv() => Step::Event(event),
            };
            match step {
                Step::Shutdown => break,
                Step::Tick => self.tick().await,
                Step::Event(Some(event)) => {
                    self.handle_event(event);
                }
                Step::Event(None) => {}
            }
        }
        self.shutdown().await;
    }

    /// Disconnects every open link.
    pub async fn shutdown(&mut self) {
        let addresses: Vec<MacAddress> = self.links.keys().copied().collect();
        for address in addresses {
            self.teardown(address).await;
        }
    }

    /// Writes a register on a connected device.
    pub async fn write_register(
        &self,
        address: MacAddress,
        register: u8,
        value: u32,
        length: u8,
    ) -> transport::Result<()> {
        let session = self
            .registry
            .get(&address)
            .ok_or(TransportError::DeviceNotFound)?;
        if session.state() != SessionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let link = self
            .links
            .get(&address)
            .ok_or(TransportError::NotConnected)?;
        let command = encode_command(register, value, length);
        log::debug!("{address}: write {command:02X?}");
        bounded(
            self.config.connection.connect_timeout,
            self.transport.write(link, CHARACTERISTIC_UUID, &command),
        )
        .await
    }

    async fn check_liveness(&mut self) {
        let now = self.clock.now();
        let window = self.config.liveness_timeout;
        let stale: Vec<MacAddress> = self
            .registry
            .iter()
            .filter(|session| session.state() == SessionState::Connected)
            .filter(|session| session.is_stale(now, window))
            .map(Session::address)
            .collect();
        for address in stale {
            log::warn!("{address}: no notification for {window:?}, disconnecting");
            if let Some(session) = self.registry.get_mut(&address) {
                session.counters_mut().timeouts += 1;
            }
            self.teardown(address).await;
        }
    }

    async fn connect_next(&mut self) {
        let Some(address) = self
            .registry
            .iter()
            .find(|session| session.state() == SessionState::Armed)
            .map(Session::address)
        else {
            return;
        };
        match self.gate.check(self.clock.now()) {
            GateDecision::Ready => self.connect(address).await,
            GateDecision::AtCapacity => {
                log::debug!("{address}: connection cap reached, deferring");
            }
            GateDecision::Spacing => {}
        }
    }

    async fn connect(&mut self, address: MacAddress) {
        self.registry.set_state(&address, SessionState::Connecting);
        log::info!("{address}: connecting");
        self.pause(self.config.settle_delay).await;
        let attempt = self.establish(address).await;
        self.gate.record_attempt(self.clock.now());
        match attempt {
            Attempt::Connected => log::info!("{address}: connected"),
            Attempt::Deferred => self.registry.set_state(&address, SessionState::Armed),
            Attempt::Failed => {}
        }
    }

    async fn establish(&mut self, address: MacAddress) -> Attempt {
        let Some(link) = self.open_link(address).await else {
            log::warn!(
                "{address}: giving up after {} attempts",
                self.config.connect_attempts
            );
            self.registry.set_state(&address, SessionState::Unarmed);
            return Attempt::Failed;
        };

        if !self.gate.acquire() {
            log::debug!("{address}: connection cap reached after connect, deferring");
            let limit = self.config.connection.connect_timeout;
            if let Err(err) = bounded(limit, self.transport.disconnect(&link)).await {
                log::warn!("{address}: disconnect failed: {err}");
            }
            return Attempt::Deferred;
        }
        if let Some(session) = self.registry.get_mut(&address) {
            session.set_holds_connection(true);
        }
        self.links.insert(address, link);

        if let Err(err) = self.bind(address).await {
            log::warn!("{address}: {err}");
            self.teardown(address).await;
            return Attempt::Failed;
        }
        self.initialize(address).await;
        if !self.links.contains_key(&address) {
            log::warn!("{address}: link lost during initialization");
            return Attempt::Failed;
        }

        let now = self.clock.now();
        if let Some(session) = self.registry.get_mut(&address) {
            session.mark_connected(now);
        }
        Attempt::Connected
    }

    async fn open_link(&mut self, address: MacAddress) -> Option<T::Link> {
        let backoff = self.config.backoff();
        let params = self.config.connection;
        let mut failed = 0;
        loop {
            match bounded(
                params.connect_timeout,
                self.transport.connect(address, &params),
            )
            .await
            {
                Ok(link) => return Some(link),
                Err(err) => {
                    failed += 1;
                    log::warn!("{address}: connect attempt {failed} failed: {err}");
                    let delay = backoff.delay_after(failed)?;
                    self.pause(delay).await;
                }
            }
        }
    }

    /// Sleeps on the clock while applying transport events as they arrive.
    ///
    /// A `Disconnected` for the session being connected releases its link, so
    /// callers look the link up again after every pause.
    async fn pause(&mut self, duration: Duration) {
        let clock = Arc::clone(&self.clock);
        let mut sleep = clock.sleep(duration);
        loop {
            let event = tokio::select! {
                _ = &mut sleep => None,
                event = self.events_rx.recv() => event,
            };
            match event {
                Some(event) => {
                    self.handle_event(event);
                }
                None => break,
            }
        }
        self.drain_events();
    }

    fn link(&self, address: &MacAddress) -> transport::Result<&T::Link> {
        self.links.get(address).ok_or(TransportError::NotConnected)
    }

    async fn bind(&mut self, address: MacAddress) -> transport::Result<()> {
        let limit = self.config.connection.connect_timeout;
        self.link(&address)?;
        self.registry
            .set_state(&address, SessionState::ServiceBinding);

        let mut found = false;
        for attempt in 1..=self.config.service_attempts {
            self.pause(self.config.service_retry_delay).await;
            let link = self.link(&address)?;
            match bounded(limit, self.transport.find_service(link, SERVICE_UUID)).await {
                Ok(true) => {
                    found = true;
                    break;
                }
                Ok(false) => log::debug!("{address}: service missing, attempt {attempt}"),
                Err(err) => log::debug!("{address}: service discovery failed: {err}"),
            }
        }
        if !found {
            return Err(TransportError::ServiceNotFound);
        }
        let link = self.link(&address)?;
        let has_characteristic = bounded(
            limit,
            self.transport
                .find_characteristic(link, SERVICE_UUID, CHARACTERISTIC_UUID),
        )
        .await?;
        if !has_characteristic {
            return Err(TransportError::CharacteristicNotFound);
        }

        self.registry.set_state(&address, SessionState::Subscribing);
        let link = self.link(&address)?;
        let sink = NotificationSink::new(address, self.events_tx.clone());
        bounded(
            limit,
            self.transport.subscribe(link, CHARACTERISTIC_UUID, sink),
        )
        .await
    }

    async fn initialize(&mut self, address: MacAddress) {
        self.registry.set_state(&address, SessionState::Initializing);
        let limit = self.config.connection.connect_timeout;
        let timing = self.config.init;
        let commands = [
            (DeviceInfo::request(), timing.request_gap),
            (Settings::request(), timing.request_gap),
            (SetSwitch::request(Register::ChargeSwitch, true), timing.enable_gap),
            (SetSwitch::request(Register::DischargeSwitch, true), timing.enable_gap),
            (SetSwitch::request(Register::BalancerSwitch, true), timing.enable_gap),
        ];

        self.pause(timing.initial_delay).await;
        for (command, gap) in commands {
            let Ok(link) = self.link(&address) else {
                return;
            };
            log::debug!("{address}: init write {command:02X?}");
            if let Err(err) = bounded(
                limit,
                self.transport.write(link, CHARACTERISTIC_UUID, &command),
            )
            .await
            {
                log::warn!("{address}: init write failed: {err}");
            }
            self.pause(gap).await;
        }
    }

    async fn maybe_scan(&mut self) {
        if self.registry.all_connected() {
            return;
        }
        let now = self.clock.now();
        if let Some(last) = self.last_scan {
            if now.saturating_duration_since(last) < self.config.scan_interval {
                return;
            }
        }
        if let Some(last) = self.gate.last_attempt() {
            if now.saturating_duration_since(last) < self.config.scan_holdoff {
                return;
            }
        }
        self.last_scan = Some(now);

        let duration = self.config.scan_duration;
        let limit = duration.saturating_add(self.config.connection.connect_timeout);
        log::debug!("Scanning for {duration:?}");
        match bounded(limit, self.transport.scan(duration)).await {
            Ok(found) => {
                let armed = self.registry.arm_discovered(&found);
                log::debug!("Scan found {} device(s), armed {armed}", found.len());
            }
            Err(err) => log::warn!("Scan failed: {err}"),
        }
    }

    /// Disconnects the link and returns the session to `Unarmed`.
    async fn teardown(&mut self, address: MacAddress) {
        if let Some(link) = self.links.get(&address) {
            let limit = self.config.connection.connect_timeout;
            if let Err(err) = bounded(limit, self.transport.disconnect(link)).await {
                log::warn!("{address}: disconnect failed: {err}");
            }
        }
        self.release_link(address);
    }

    fn release_link(&mut self, address: MacAddress) {
        self.links.remove(&address);
        if let Some(session) = self.registry.get_mut(&address) {
            if session.holds_connection() {
                self.gate.release();
            }
            session.reset_link();
            session.set_state(SessionState::Unarmed);
        }
    }
}
