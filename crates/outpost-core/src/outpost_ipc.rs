use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

pub const ARG_UUID: &str = "uuid";
pub const ARG_VERSION: &str = "version";
pub const ARG_BUILD_HASH: &str = "buildHash";

/// Instruction carried by every envelope exchanged with an outpost.
///
/// Codes outside the known set decode into [`Instruction::Unknown`] so a newer
/// agent never breaks an older controller; the session ignores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instruction {
    /// Acknowledges receipt; sent by either side.
    Ack,
    /// Liveness and identity report from an outpost instance.
    Hello,
    /// Asks the instance to re-pull its configuration.
    TriggerUpdate,
    Unknown(i64),
}

impl Instruction {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Instruction::Ack,
            1 => Instruction::Hello,
            2 => Instruction::TriggerUpdate,
            other => Instruction::Unknown(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Instruction::Ack => 0,
            Instruction::Hello => 1,
            Instruction::TriggerUpdate => 2,
            Instruction::Unknown(code) => *code,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Instruction::Ack => "ack",
            Instruction::Hello => "hello",
            Instruction::TriggerUpdate => "trigger_update",
            Instruction::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Unknown(code) => write!(f, "unknown({code})"),
            known => f.write_str(known.as_str()),
        }
    }
}

impl Serialize for Instruction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for Instruction {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct InstructionVisitor;

        impl<'de> Visitor<'de> for InstructionVisitor {
            type Value = Instruction;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an instruction code as integer or numeric string")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let code = i64::try_from(value)
                    .map_err(|_| E::custom(format!("instruction out of range: {value}")))?;
                Ok(Instruction::from_code(code))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Instruction::from_code(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let code = value
                    .trim()
                    .parse::<i64>()
                    .map_err(|err| E::custom(format!("invalid instruction '{value}': {err}")))?;
                Ok(Instruction::from_code(code))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_str(&value)
            }
        }

        deserializer.deserialize_any(InstructionVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEnvelope {
    pub instruction: Instruction,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl MessageEnvelope {
    pub fn new(instruction: Instruction) -> Self {
        Self {
            instruction,
            args: Map::new(),
        }
    }

    pub fn ack() -> Self {
        Self::new(Instruction::Ack)
    }

    pub fn trigger_update() -> Self {
        Self::new(Instruction::TriggerUpdate)
    }

    pub fn hello(uuid: &str, version: &str, build_hash: &str) -> Self {
        Self::new(Instruction::Hello)
            .with_arg(ARG_UUID, uuid)
            .with_arg(ARG_VERSION, version)
            .with_arg(ARG_BUILD_HASH, build_hash)
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    /// Instance identity claimed by the sender, if any.
    pub fn instance_uid(&self) -> Option<&str> {
        self.arg_str(ARG_UUID).filter(|uid| !uid.trim().is_empty())
    }

    pub fn reported_version(&self) -> Option<String> {
        self.arg_str(ARG_VERSION).map(str::to_string)
    }

    pub fn reported_build_hash(&self) -> String {
        self.arg_str(ARG_BUILD_HASH).unwrap_or_default().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_encodes_with_empty_args() {
        let frame = encode_frame(&MessageEnvelope::ack(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert_eq!(frame, r#"{"instruction":0,"args":{}}"#);

        let trigger =
            encode_frame(&MessageEnvelope::trigger_update(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert_eq!(trigger, r#"{"instruction":2,"args":{}}"#);
    }

    #[test]
    fn hello_args_are_exposed_by_convention() {
        let raw = br#"{"instruction":1,"args":{"uuid":"A","version":"1.0","buildHash":"abc","extra":7}}"#;
        let msg: MessageEnvelope = decode_frame(raw, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(msg.instruction, Instruction::Hello);
        assert_eq!(msg.instance_uid(), Some("A"));
        assert_eq!(msg.reported_version().as_deref(), Some("1.0"));
        assert_eq!(msg.reported_build_hash(), "abc");
    }

    #[test]
    fn missing_args_fall_back_to_defaults() {
        let msg: MessageEnvelope =
            decode_frame(br#"{"instruction":1}"#, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert!(msg.args.is_empty());
        assert_eq!(msg.instance_uid(), None);
        assert_eq!(msg.reported_version(), None);
        assert_eq!(msg.reported_build_hash(), "");
    }

    #[test]
    fn blank_or_non_string_uuid_is_ignored() {
        let blank = MessageEnvelope::new(Instruction::Hello).with_arg(ARG_UUID, "  ");
        assert_eq!(blank.instance_uid(), None);

        let numeric = MessageEnvelope::new(Instruction::Hello).with_arg(ARG_UUID, 42);
        assert_eq!(numeric.instance_uid(), None);
    }

    #[test]
    fn unknown_instruction_decodes_without_error() {
        let msg: MessageEnvelope =
            decode_frame(br#"{"instruction":9,"args":{}}"#, DEFAULT_MAX_FRAME_BYTES)
                .expect("decode");
        assert_eq!(msg.instruction, Instruction::Unknown(9));
        assert_eq!(msg.instruction.code(), 9);
        assert_eq!(msg.instruction.to_string(), "unknown(9)");
    }

    #[test]
    fn instruction_accepts_numeric_strings() {
        let msg: MessageEnvelope =
            decode_frame(br#"{"instruction":"1","args":{}}"#, DEFAULT_MAX_FRAME_BYTES)
                .expect("decode");
        assert_eq!(msg.instruction, Instruction::Hello);
    }

    #[test]
    fn malformed_payloads_are_decode_errors() {
        for raw in [
            &b"not json"[..],
            br#"{"args":{}}"#,
            br#"{"instruction":"hello"}"#,
            br#"{"instruction":1,"args":[1,2]}"#,
        ] {
            let result = decode_frame::<MessageEnvelope>(raw, DEFAULT_MAX_FRAME_BYTES);
            assert!(
                matches!(result, Err(FrameError::Decode(_))),
                "expected decode error for {}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn size_limit_counts_the_whole_message() {
        let raw = br#"{"instruction":0}"#;
        assert!(decode_frame::<MessageEnvelope>(raw, raw.len()).is_ok());
        assert_eq!(
            decode_frame::<MessageEnvelope>(raw, raw.len() - 1),
            Err(FrameError::OversizedFrame {
                size: raw.len(),
                max: raw.len() - 1,
            })
        );
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let huge = MessageEnvelope::hello("A", &"x".repeat(128), "abc");
        assert!(matches!(
            encode_frame(&huge, 64),
            Err(FrameError::OversizedFrame { .. })
        ));

        let raw = format!(r#"{{"instruction":1,"args":{{"blob":"{}"}}}}"#, "x".repeat(2_000));
        assert!(matches!(
            decode_frame::<MessageEnvelope>(raw.as_bytes(), 1_024),
            Err(FrameError::OversizedFrame { .. })
        ));
    }
}
