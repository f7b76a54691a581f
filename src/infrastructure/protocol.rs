//! Arm Wire Protocol
//!
//! Text commands understood by the arm firmware over every transport, plus
//! the transport identifiers the firmware exposes.
//!
//! ```text
//! #{axis}P{pwm}T{time}!   move one axis to a PWM target over `time` ms
//! ARM\n                   enable the servos
//! DISARM\n                disable the servos (emergency stop)
//! ```
//!
//! There is no checksum and no acknowledgement; sends are fire-and-forget.

use crate::domain::action::{clamp_pwm, ActionFrame, PWM_MAX, PWM_MIN};
use std::fmt;
use uuid::Uuid;

/// Nordic UART service exposed by the arm's BLE module.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Write characteristic (host -> arm).
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Notify characteristic (arm -> host).
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Serial Port Profile service class used by HC-05/HC-06 style modules.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

/// Path of the WebSocket endpoint served by the WiFi firmware.
pub const WS_PATH: &str = "/ws";

pub const DEFAULT_WIFI_PORT: u16 = 81;

/// Move time used for interactive jogging.
pub const JOG_TIME_MS: u32 = 50;

pub const ARM: &str = "ARM\n";
pub const DISARM: &str = "DISARM\n";

/// A command for the arm firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmCommand {
    /// Move one axis (1-6) to `pwm` over `time_ms`.
    Move { axis: u8, pwm: u16, time_ms: u32 },
    /// Enable servo output.
    Arm,
    /// Cut servo output.
    Disarm,
}

impl ArmCommand {
    /// Interactive jog of a single axis.
    pub fn jog(axis: u8, pwm: u16) -> Self {
        Self::Move {
            axis,
            pwm,
            time_ms: JOG_TIME_MS,
        }
    }

    /// Render to the wire text format.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ArmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Move { axis, pwm, time_ms } => write!(f, "#{}P{}T{}!", axis, pwm, time_ms),
            Self::Arm => f.write_str(ARM),
            Self::Disarm => f.write_str(DISARM),
        }
    }
}

/// Encode a single-axis move.
pub fn servo_command(axis: u8, pwm: u16, time_ms: u32) -> String {
    ArmCommand::Move { axis, pwm, time_ms }.encode()
}

/// The six per-axis commands that play one keyframe, in axis order. Each
/// move takes the frame's full duration.
pub fn frame_commands(frame: &ActionFrame) -> Vec<String> {
    frame
        .axes()
        .map(|(axis, pwm)| servo_command(axis, pwm, frame.duration_ms()))
        .collect()
}

/// PWM microseconds to degrees: 500 -> 0, 2500 -> 180.
pub fn pwm_to_degree(pwm: i32) -> i32 {
    let span = (PWM_MAX - PWM_MIN) as i32;
    ((pwm - PWM_MIN as i32) * 180 / span).clamp(0, 180)
}

/// Degrees to PWM microseconds: 0 -> 500, 180 -> 2500.
pub fn degree_to_pwm(degree: i32) -> u16 {
    let span = (PWM_MAX - PWM_MIN) as i64;
    clamp_pwm(PWM_MIN as i64 + degree as i64 * span / 180)
}
