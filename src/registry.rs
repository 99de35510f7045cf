use crate::session::{Session, SessionState};
use crate::transport::Discovered;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Link-layer device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || Error::InvalidAddress(s.to_string());
        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(|c: char| c == ':' || c == '-');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = Error;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(address: MacAddress) -> Self {
        address.to_string()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// The configured sessions, one per target device.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Vec<Session>,
}

impl SessionRegistry {
    pub fn new(targets: &[MacAddress], echo_suppression_count: u32) -> Self {
        let mut sessions: Vec<Session> = Vec::with_capacity(targets.len());
        for target in targets {
            if sessions.iter().any(|session| session.address() == *target) {
                log::warn!("Ignoring duplicate target {target}");
                continue;
            }
            sessions.push(Session::new(*target, echo_suppression_count));
        }
        Self { sessions }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, address: &MacAddress) -> Option<&Session> {
        self.sessions.iter().find(|session| session.address() == *address)
    }

    pub fn get_mut(&mut self, address: &MacAddress) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|session| session.address() == *address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub(crate) fn set_state(&mut self, address: &MacAddress, state: SessionState) {
        if let Some(session) = self.get_mut(address) {
            session.set_state(state);
        }
    }

    pub fn all_connected(&self) -> bool {
        self.sessions
            .iter()
            .all(|session| session.state() == SessionState::Connected)
    }

    /// Arms every unarmed session whose target was discovered.
    ///
    /// Sessions already armed or past arming are left alone. Returns the
    /// number of sessions armed by this call.
    pub fn arm_discovered(&mut self, discovered: &[Discovered]) -> usize {
        let mut armed = 0;
        for peripheral in discovered {
            log::trace!(
                "Discovered {} name={:?} rssi={:?}",
                peripheral.address,
                peripheral.name,
                peripheral.rssi
            );
            if let Some(session) = self.get_mut(&peripheral.address) {
                if session.state() == SessionState::Unarmed {
                    log::info!("Found target device {}", peripheral.address);
                    session.set_state(SessionState::Armed);
                    armed += 1;
                }
            }
        }
        armed
    }
}
