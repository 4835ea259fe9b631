use serde::{Deserialize, Serialize};

use crate::brain::{Emotion, ServoGesture};
use crate::dispatch::Mode;

/// Servo angle lower bound in degrees.
pub const SERVO_MIN: i32 = 0;
/// Servo angle upper bound in degrees.
pub const SERVO_MAX: i32 = 180;
/// Center position the servo starts at.
pub const SERVO_CENTER: i32 = 90;

/// LED directive carried by an `EMOTION` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedCommand {
    pub pattern: String,
    pub speed: String,
    pub color: LedColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Closed set of commands the server can emit to the device.
///
/// Encoded as the UTF-8 JSON payload of a `CMD` packet, e.g.
/// `{"action":"SERVO_SET","servo":0,"angle":90,"sid":1,...}`.
/// `SWITCH_MODE` is internal: the dispatcher consumes it and never
/// forwards it to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ActionCommand {
    #[serde(rename = "NOOP")]
    Noop {
        sid: u64,
        meaningful: bool,
        recognized: bool,
    },
    #[serde(rename = "WIGGLE")]
    Wiggle { sid: u64 },
    #[serde(rename = "STOP")]
    Stop { servo: u8 },
    #[serde(rename = "SERVO_SET")]
    ServoSet {
        servo: u8,
        angle: i32,
        sid: u64,
        meaningful: bool,
        recognized: bool,
    },
    #[serde(rename = "EMOTION")]
    Emotion {
        emotion: Emotion,
        led: LedCommand,
        servo_action: ServoGesture,
    },
    #[serde(rename = "SWITCH_MODE")]
    SwitchMode { mode: Mode },
}

impl ActionCommand {
    /// The unsure-policy reply for an utterance that was too short or
    /// too quiet to act on.
    pub fn unsure(sid: u64) -> Self {
        ActionCommand::Noop {
            sid,
            meaningful: false,
            recognized: false,
        }
    }

    /// Serialize to the CMD wire payload.
    pub fn to_wire(&self) -> Vec<u8> {
        // A closed enum of plain fields cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_servo_set_wire_shape() {
        let cmd = ActionCommand::ServoSet {
            servo: 0,
            angle: 90,
            sid: 1,
            meaningful: true,
            recognized: true,
        };
        let json: serde_json::Value = serde_json::from_slice(&cmd.to_wire()).unwrap();
        assert_eq!(json["action"], "SERVO_SET");
        assert_eq!(json["servo"], 0);
        assert_eq!(json["angle"], 90);
        assert_eq!(json["sid"], 1);
        assert_eq!(json["meaningful"], true);
        assert_eq!(json["recognized"], true);
    }

    #[test]
    fn test_unsure_is_noop_unrecognized() {
        let json: serde_json::Value =
            serde_json::from_slice(&ActionCommand::unsure(7).to_wire()).unwrap();
        assert_eq!(json["action"], "NOOP");
        assert_eq!(json["sid"], 7);
        assert_eq!(json["meaningful"], false);
        assert_eq!(json["recognized"], false);
    }

    #[test]
    fn test_switch_mode_roundtrip() {
        let cmd = ActionCommand::SwitchMode { mode: Mode::Robot };
        let back: ActionCommand = serde_json::from_slice(&cmd.to_wire()).unwrap();
        assert_eq!(back, cmd);
    }
}
