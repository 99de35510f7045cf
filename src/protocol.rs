use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// GATT service carrying the BMS serial channel.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
/// Characteristic used for both notifications and command writes.
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Length of every inbound frame.
pub const FRAME_LENGTH: usize = 300;
/// Synchronisation pattern opening every inbound frame.
pub const FRAME_MARKER: [u8; 4] = [0x55, 0xAA, 0xEB, 0x90];
pub const FRAME_TYPE_OFFSET: usize = 4;

/// Length of every outbound command frame.
pub const COMMAND_LENGTH: usize = 20;
const COMMAND_MARKER: [u8; 4] = [0xAA, 0x55, 0x90, 0xEB];
const COMMAND_ADDRESS_OFFSET: usize = 4;
const COMMAND_LENGTH_OFFSET: usize = 5;
const COMMAND_VALUE_OFFSET: usize = 6;

/// Number of cell slots reported by a telemetry frame.
pub const CELL_SLOTS: usize = 16;

/// Additive 8-bit checksum over `buffer`.
pub fn checksum(buffer: &[u8]) -> u8 {
    let mut checksum: u8 = 0;
    for b in buffer {
        checksum = checksum.wrapping_add(*b);
    }
    checksum
}

fn validate_len(buffer: &[u8], required: usize) -> std::result::Result<(), Error> {
    if buffer.len() < required {
        log::warn!(
            "Invalid frame size - required={} received={}",
            required,
            buffer.len()
        );
        return Err(Error::FrameTooShort {
            required,
            received: buffer.len(),
        });
    }
    Ok(())
}

/// Register addresses used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    ChargeSwitch = 0x1D,
    DischargeSwitch = 0x1E,
    BalancerSwitch = 0x1F,
    /// Asks the device to stream settings and cell telemetry frames.
    CellInfo = 0x96,
    /// Asks the device for its device-info frame.
    DeviceInfo = 0x97,
}

/// Builds the 20-byte command frame writing `value` to register `address`.
///
/// Layout: marker, address, length, little-endian value, zero padding and
/// the additive checksum of bytes 0..19 in the last byte.
pub fn encode_command(address: u8, value: u32, length: u8) -> [u8; COMMAND_LENGTH] {
    let mut tx_buffer = [0u8; COMMAND_LENGTH];
    tx_buffer[..COMMAND_MARKER.len()].copy_from_slice(&COMMAND_MARKER);
    tx_buffer[COMMAND_ADDRESS_OFFSET] = address;
    tx_buffer[COMMAND_LENGTH_OFFSET] = length;
    tx_buffer[COMMAND_VALUE_OFFSET..COMMAND_VALUE_OFFSET + 4].copy_from_slice(&value.to_le_bytes());
    tx_buffer[COMMAND_LENGTH - 1] = checksum(&tx_buffer[..COMMAND_LENGTH - 1]);
    log::trace!("command frame: {tx_buffer:02X?}");
    tx_buffer
}

/// Switch commands toggling charge, discharge or balancing.
pub struct SetSwitch;

impl SetSwitch {
    pub fn request(register: Register, enable: bool) -> [u8; COMMAND_LENGTH] {
        encode_command(register as u8, u32::from(enable), 0x04)
    }
}

/// Type byte found at [`FRAME_TYPE_OFFSET`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    Settings,
    Telemetry,
    DeviceInfo,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Settings),
            0x02 => Ok(FrameType::Telemetry),
            0x03 => Ok(FrameType::DeviceInfo),
            other => Err(Error::UnknownFrameType(other)),
        }
    }
}

fn read_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buffer[offset], buffer[offset + 1]])
}

fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ])
}

fn read_i32(buffer: &[u8], offset: usize) -> i32 {
    read_u32(buffer, offset) as i32
}

fn read_scaled(buffer: &[u8], offset: usize, scale: f32) -> f32 {
    read_i32(buffer, offset) as f32 * scale
}

fn read_flag(buffer: &[u8], offset: usize) -> bool {
    buffer[offset] != 0
}

// A high byte of 0xFF marks a negative reading; anything else is unsigned.
fn read_temperature(buffer: &[u8], offset: usize) -> f32 {
    let raw = if buffer[offset + 1] == 0xFF {
        i32::from(i16::from_le_bytes([buffer[offset], buffer[offset + 1]]))
    } else {
        i32::from(read_u16(buffer, offset))
    };
    raw as f32 * 0.1
}

// 12-bit magnitude, sign in the top nibble: 0x0 positive, 0xF negative.
fn read_balance_current(buffer: &[u8], offset: usize) -> Option<f32> {
    let high = buffer[offset + 1];
    let magnitude = u16::from_le_bytes([buffer[offset], high & 0x0F]) as f32 * 0.001;
    match high & 0xF0 {
        0x00 => Some(magnitude),
        0xF0 => Some(-magnitude),
        nibble => {
            log::debug!("Undefined balance current sign nibble 0x{nibble:02X}");
            None
        }
    }
}

fn read_text(buffer: &[u8], offset: usize, len: usize) -> String {
    String::from_utf8_lossy(&buffer[offset..offset + len])
        .trim_end_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}

/// Protection thresholds and configuration reported by a settings frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub cell_undervoltage_protection: f32,
    pub cell_undervoltage_recovery: f32,
    pub cell_overvoltage_protection: f32,
    pub cell_overvoltage_recovery: f32,
    pub balance_trigger_voltage: f32,
    pub power_off_voltage: f32,
    pub max_charge_current: f32,
    pub charge_overcurrent_protection_delay: f32,
    pub charge_overcurrent_protection_recovery_time: f32,
    pub max_discharge_current: f32,
    pub discharge_overcurrent_protection_delay: f32,
    pub discharge_overcurrent_protection_recovery_time: f32,
    pub short_circuit_protection_recovery_time: f32,
    pub max_balance_current: f32,
    pub charge_overtemperature_protection: f32,
    pub charge_overtemperature_protection_recovery: f32,
    pub discharge_overtemperature_protection: f32,
    pub discharge_overtemperature_protection_recovery: f32,
    pub charge_undertemperature_protection: f32,
    pub charge_undertemperature_protection_recovery: f32,
    pub mos_overtemperature_protection: f32,
    pub mos_overtemperature_protection_recovery: f32,
    pub cell_count: u32,
    pub charge_switch: bool,
    pub discharge_switch: bool,
    pub balancer_switch: bool,
    pub total_battery_capacity: f32,
    /// Microseconds.
    pub short_circuit_protection_delay: f32,
    pub balance_starting_voltage: f32,
}

impl Settings {
    /// Requests the settings frame, followed by a stream of telemetry frames.
    pub fn request() -> [u8; COMMAND_LENGTH] {
        encode_command(Register::CellInfo as u8, 0, 0)
    }

    pub fn min_len() -> usize {
        142
    }

    pub fn decode(rx_buffer: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(rx_buffer, Self::min_len())?;
        Ok(Self {
            cell_undervoltage_protection: read_scaled(rx_buffer, 10, 0.001),
            cell_undervoltage_recovery: read_scaled(rx_buffer, 14, 0.001),
            cell_overvoltage_protection: read_scaled(rx_buffer, 18, 0.001),
            cell_overvoltage_recovery: read_scaled(rx_buffer, 22, 0.001),
            balance_trigger_voltage: read_scaled(rx_buffer, 26, 0.001),
            power_off_voltage: read_scaled(rx_buffer, 46, 0.001),
            max_charge_current: read_scaled(rx_buffer, 50, 0.001),
            charge_overcurrent_protection_delay: read_scaled(rx_buffer, 54, 1.0),
            charge_overcurrent_protection_recovery_time: read_scaled(rx_buffer, 58, 1.0),
            max_discharge_current: read_scaled(rx_buffer, 62, 0.001),
            discharge_overcurrent_protection_delay: read_scaled(rx_buffer, 66, 1.0),
            discharge_overcurrent_protection_recovery_time: read_scaled(rx_buffer, 70, 1.0),
            short_circuit_protection_recovery_time: read_scaled(rx_buffer, 74, 1.0),
            max_balance_current: read_scaled(rx_buffer, 78, 0.001),
            charge_overtemperature_protection: read_scaled(rx_buffer, 82, 0.1),
            charge_overtemperature_protection_recovery: read_scaled(rx_buffer, 86, 0.1),
            discharge_overtemperature_protection: read_scaled(rx_buffer, 90, 0.1),
            discharge_overtemperature_protection_recovery: read_scaled(rx_buffer, 94, 0.1),
            charge_undertemperature_protection: read_scaled(rx_buffer, 98, 0.1),
            charge_undertemperature_protection_recovery: read_scaled(rx_buffer, 102, 0.1),
            mos_overtemperature_protection: read_scaled(rx_buffer, 106, 0.1),
            mos_overtemperature_protection_recovery: read_scaled(rx_buffer, 110, 0.1),
            cell_count: read_u32(rx_buffer, 114),
            charge_switch: read_flag(rx_buffer, 118),
            discharge_switch: read_flag(rx_buffer, 122),
            balancer_switch: read_flag(rx_buffer, 126),
            total_battery_capacity: read_scaled(rx_buffer, 130, 0.001),
            short_circuit_protection_delay: read_scaled(rx_buffer, 134, 1.0),
            balance_starting_voltage: read_scaled(rx_buffer, 138, 0.001),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uptime {
    pub total_seconds: u32,
    pub days: u32,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

impl From<u32> for Uptime {
    fn from(total_seconds: u32) -> Self {
        let mut rest = total_seconds;
        let seconds = (rest % 60) as u8;
        rest /= 60;
        let minutes = (rest % 60) as u8;
        rest /= 60;
        let hours = (rest % 24) as u8;
        Self {
            total_seconds,
            days: rest / 24,
            hours,
            minutes,
            seconds,
        }
    }
}

impl fmt::Display for Uptime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}d {}h {}m {}s",
            self.days, self.hours, self.minutes, self.seconds
        )
    }
}

/// Live pack readings reported by a telemetry frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub cell_voltages: [f32; CELL_SLOTS],
    pub wire_resistances: [f32; CELL_SLOTS],
    pub average_cell_voltage: f32,
    pub delta_cell_voltage: f32,
    pub mos_temperature: f32,
    pub battery_voltage: f32,
    pub battery_current: f32, // negative=discharging, positive=charging
    pub battery_power: f32,
    pub temperature_1: f32,
    pub temperature_2: f32,
    /// `None` when the sign nibble is neither 0x0 nor 0xF.
    pub balance_current: Option<f32>,
    pub balancing_action: u8,
    pub remaining_percent: u8,
    pub remaining_capacity: f32,
    pub nominal_capacity: f32,
    pub cycle_count: u32,
    pub cycle_capacity: f32,
    pub uptime: Uptime,
    pub charge_enabled: bool,
    pub discharge_enabled: bool,
    pub balancing_active: bool,
}

impl Telemetry {
    pub fn min_len() -> usize {
        202
    }

    pub fn decode(rx_buffer: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(rx_buffer, Self::min_len())?;
        let mut cell_voltages = [0.0; CELL_SLOTS];
        let mut wire_resistances = [0.0; CELL_SLOTS];
        for cell in 0..CELL_SLOTS {
            cell_voltages[cell] = read_u16(rx_buffer, 6 + 2 * cell) as f32 * 0.001;
            wire_resistances[cell] = read_u16(rx_buffer, 80 + 2 * cell) as f32 * 0.001;
            log::trace!(
                "cell #{} volt={} resistance={}",
                cell + 1,
                cell_voltages[cell],
                wire_resistances[cell]
            );
        }
        let battery_voltage = read_scaled(rx_buffer, 150, 0.001);
        let battery_current = read_scaled(rx_buffer, 158, 0.001);
        let uptime = u32::from_le_bytes([rx_buffer[194], rx_buffer[195], rx_buffer[196], 0]);
        Ok(Self {
            cell_voltages,
            wire_resistances,
            average_cell_voltage: read_u16(rx_buffer, 74) as f32 * 0.001,
            delta_cell_voltage: read_u16(rx_buffer, 76) as f32 * 0.001,
            mos_temperature: read_temperature(rx_buffer, 144),
            battery_voltage,
            battery_current,
            battery_power: battery_voltage * battery_current,
            temperature_1: read_temperature(rx_buffer, 162),
            temperature_2: read_temperature(rx_buffer, 164),
            balance_current: read_balance_current(rx_buffer, 170),
            balancing_action: rx_buffer[172],
            remaining_percent: rx_buffer[173],
            remaining_capacity: read_scaled(rx_buffer, 174, 0.001),
            nominal_capacity: read_scaled(rx_buffer, 178, 0.001),
            cycle_count: read_u32(rx_buffer, 182),
            cycle_capacity: read_scaled(rx_buffer, 186, 0.001),
            uptime: Uptime::from(uptime),
            charge_enabled: read_flag(rx_buffer, 198),
            discharge_enabled: read_flag(rx_buffer, 199),
            balancing_active: read_flag(rx_buffer, 201),
        })
    }
}

/// Identification data reported by a device-info frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub vendor_id: String,
    pub hardware_version: String,
    pub software_version: String,
    pub uptime_seconds: u32,
    pub power_on_count: u32,
    pub device_name: String,
    pub device_passcode: String,
    pub manufacturing_date: String,
    pub serial_number: String,
    pub passcode: String,
    pub user_data: String,
    pub setup_passcode: String,
}

impl DeviceInfo {
    pub fn request() -> [u8; COMMAND_LENGTH] {
        encode_command(Register::DeviceInfo as u8, 0, 0)
    }

    pub fn min_len() -> usize {
        134
    }

    pub fn decode(rx_buffer: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(rx_buffer, Self::min_len())?;
        Ok(Self {
            vendor_id: read_text(rx_buffer, 6, 16),
            hardware_version: read_text(rx_buffer, 22, 8),
            software_version: read_text(rx_buffer, 30, 8),
            uptime_seconds: read_u32(rx_buffer, 38),
            power_on_count: read_u32(rx_buffer, 42),
            device_name: read_text(rx_buffer, 46, 16),
            device_passcode: read_text(rx_buffer, 62, 16),
            manufacturing_date: read_text(rx_buffer, 78, 8),
            serial_number: read_text(rx_buffer, 86, 11),
            passcode: read_text(rx_buffer, 97, 5),
            user_data: read_text(rx_buffer, 102, 16),
            setup_passcode: read_text(rx_buffer, 118, 16),
        })
    }
}

/// A completed frame routed to its decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecodedFrame {
    Settings(Settings),
    Telemetry(Box<Telemetry>),
    DeviceInfo(DeviceInfo),
}

impl DecodedFrame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            DecodedFrame::Settings(_) => FrameType::Settings,
            DecodedFrame::Telemetry(_) => FrameType::Telemetry,
            DecodedFrame::DeviceInfo(_) => FrameType::DeviceInfo,
        }
    }
}

/// Selects the decoder by the type byte and decodes `rx_buffer`.
pub fn decode_frame(rx_buffer: &[u8]) -> std::result::Result<DecodedFrame, Error> {
    validate_len(rx_buffer, FRAME_TYPE_OFFSET + 1)?;
    match FrameType::try_from(rx_buffer[FRAME_TYPE_OFFSET])? {
        FrameType::Settings => Settings::decode(rx_buffer).map(DecodedFrame::Settings),
        FrameType::Telemetry => Telemetry::decode(rx_buffer)
            .map(Box::new)
            .map(DecodedFrame::Telemetry),
        FrameType::DeviceInfo => DeviceInfo::decode(rx_buffer).map(DecodedFrame::DeviceInfo),
    }
}
