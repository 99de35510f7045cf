//! Per-device session state: lifecycle, reassembly, echo suppression and
//! the most recent decoded snapshots.

use crate::protocol::{decode_frame, DecodedFrame, DeviceInfo, FrameType, Settings, Telemetry};
use crate::reassembly::{Feed, FrameAssembler, ReassemblyState};
use crate::registry::MacAddress;
use crate::Error;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle of one session.
///
/// A dropped or stalled link goes straight back to `Unarmed`; the reason is
/// recorded in [`SessionCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Unarmed,
    /// Seen by a scan, waiting for a connection slot.
    Armed,
    Connecting,
    ServiceBinding,
    Subscribing,
    Initializing,
    Connected,
}

impl SessionState {
    /// Whether notifications are expected in this state.
    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            SessionState::Subscribing | SessionState::Initializing | SessionState::Connected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Drops a fixed number of notifications after it is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoGate {
    count: u32,
    remaining: u32,
}

impl EchoGate {
    pub fn new(count: u32) -> Self {
        Self {
            count,
            remaining: 0,
        }
    }

    pub fn arm(&mut self) {
        self.remaining = self.count;
    }

    /// Returns `false` while the notification has to be dropped.
    pub fn admit(&mut self) -> bool {
        if self.remaining > 0 {
            self.remaining -= 1;
            return false;
        }
        true
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn reset(&mut self) {
        self.remaining = 0;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub frames_completed: u64,
    pub frames_decoded: u64,
    pub decode_errors: u64,
    pub unknown_frame_types: u64,
    pub out_of_sync_chunks: u64,
    pub short_chunks: u64,
    pub suppressed_notifications: u64,
    pub reconnects: u64,
    pub timeouts: u64,
}

/// What happened to one notification.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationOutcome {
    /// Dropped by the echo gate.
    Suppressed,
    TooShort,
    OutOfSync,
    /// Accepted, frame still incomplete.
    Pending,
    Decoded(FrameType),
    UnknownFrameType(u8),
    DecodeFailed(Error),
}

#[derive(Debug)]
pub struct Session {
    address: MacAddress,
    state: SessionState,
    assembler: FrameAssembler,
    echo_gate: EchoGate,
    last_notification: Option<Instant>,
    holds_connection: bool,
    ever_connected: bool,
    settings: Option<Settings>,
    telemetry: Option<Telemetry>,
    device_info: Option<DeviceInfo>,
    counters: SessionCounters,
}

impl Session {
    pub fn new(address: MacAddress, echo_suppression_count: u32) -> Self {
        Self {
            address,
            state: SessionState::Unarmed,
            assembler: FrameAssembler::new(),
            echo_gate: EchoGate::new(echo_suppression_count),
            last_notification: None,
            holds_connection: false,
            ever_connected: false,
            settings: None,
            telemetry: None,
            device_info: None,
            counters: SessionCounters::default(),
        }
    }

    pub fn address(&self) -> MacAddress {
        self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn reassembly_state(&self) -> ReassemblyState {
        self.assembler.state()
    }

    pub fn settings(&self) -> Option<&Settings> {
        self.settings.as_ref()
    }

    pub fn telemetry(&self) -> Option<&Telemetry> {
        self.telemetry.as_ref()
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    pub fn last_notification(&self) -> Option<Instant> {
        self.last_notification
    }

    pub fn echo_gate(&self) -> &EchoGate {
        &self.echo_gate
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("{}: {} -> {}", self.address, self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn holds_connection(&self) -> bool {
        self.holds_connection
    }

    pub(crate) fn set_holds_connection(&mut self, holds: bool) {
        self.holds_connection = holds;
    }

    pub(crate) fn counters_mut(&mut self) -> &mut SessionCounters {
        &mut self.counters
    }

    /// Restarts the liveness window.
    pub(crate) fn mark_live(&mut self, now: Instant) {
        self.last_notification = Some(now);
    }

    /// Enters `Connected` and starts a fresh liveness window.
    pub(crate) fn mark_connected(&mut self, now: Instant) {
        if self.ever_connected {
            self.counters.reconnects += 1;
        }
        self.ever_connected = true;
        self.set_state(SessionState::Connected);
        self.mark_live(now);
    }

    /// Clears link scoped state. Snapshots and counters survive.
    pub(crate) fn reset_link(&mut self) {
        self.assembler.reset();
        self.echo_gate.reset();
        self.last_notification = None;
        self.holds_connection = false;
    }

    /// True when no notification arrived within `window` of `now`.
    pub fn is_stale(&self, now: Instant, window: Duration) -> bool {
        match self.last_notification {
            Some(last) => now.saturating_duration_since(last) >= window,
            None => true,
        }
    }

    /// Runs one notification through echo suppression, reassembly and
    /// dispatch.
    ///
    /// A failed decode leaves the previous snapshot of that type in place.
    pub fn handle_notification(&mut self, chunk: &[u8], now: Instant) -> NotificationOutcome {
        self.last_notification = Some(now);

        if !self.echo_gate.admit() {
            self.counters.suppressed_notifications += 1;
            log::trace!(
                "{}: suppressed {} byte notification, {} left",
                self.address,
                chunk.len(),
                self.echo_gate.remaining()
            );
            return NotificationOutcome::Suppressed;
        }

        let frame = match self.assembler.feed(chunk) {
            Feed::TooShort => {
                self.counters.short_chunks += 1;
                return NotificationOutcome::TooShort;
            }
            Feed::OutOfSync => {
                self.counters.out_of_sync_chunks += 1;
                log::debug!("{}: out of sync chunk of {} bytes", self.address, chunk.len());
                return NotificationOutcome::OutOfSync;
            }
            Feed::Started { .. } | Feed::Appended => return NotificationOutcome::Pending,
            Feed::Complete(frame) => frame,
        };
        self.counters.frames_completed += 1;

        match decode_frame(frame.as_bytes()) {
            Ok(decoded) => {
                let frame_type = decoded.frame_type();
                self.counters.frames_decoded += 1;
                self.store(decoded);
                NotificationOutcome::Decoded(frame_type)
            }
            Err(Error::UnknownFrameType(frame_type)) => {
                self.counters.unknown_frame_types += 1;
                log::debug!("{}: unknown frame type 0x{frame_type:02X}", self.address);
                NotificationOutcome::UnknownFrameType(frame_type)
            }
            Err(err) => {
                self.counters.decode_errors += 1;
                log::warn!("{}: decode failed: {err}", self.address);
                NotificationOutcome::DecodeFailed(err)
            }
        }
    }

    fn store(&mut self, decoded: DecodedFrame) {
        match decoded {
            DecodedFrame::Settings(settings) => {
                log::debug!("{}: settings {settings:?}", self.address);
                self.settings = Some(settings);
            }
            DecodedFrame::Telemetry(telemetry) => {
                log::debug!(
                    "{}: {:.3}V {:.3}A {}%",
                    self.address,
                    telemetry.battery_voltage,
                    telemetry.battery_current,
                    telemetry.remaining_percent
                );
                self.telemetry = Some(*telemetry);
                // The device echoes the previous write inside the next burst.
                self.echo_gate.arm();
            }
            DecodedFrame::DeviceInfo(device_info) => {
                log::info!(
                    "{}: {} hw={} sw={}",
                    self.address,
                    device_info.device_name,
                    device_info.hardware_version,
                    device_info.software_version
                );
                self.device_info = Some(device_info);
            }
        }
    }
}
