//! Command Encoding
//!
//! Wire constants and command encoding for peripherals driven through
//! AT-style text directives written to a GATT characteristic.

use crate::domain::error::{SessionError, SessionResult};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default control service (16-bit 0x1843 on the Bluetooth base UUID)
pub const DEFAULT_SERVICE_UUID: &str = "00001843-0000-1000-8000-00805f9b34fb";

/// Characteristic that accepts volume directives
pub const VOLUME_CHAR_UUID: &str = "00002b7e-0000-1000-8000-00805f9b34fb";

/// Characteristic that accepts raw data payloads
pub const RAW_DATA_CHAR_UUID: &str = "00002b7b-0000-1000-8000-00805f9b34fb";

/// Lower 96 bits of the Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`
const BASE_UUID_LOW: u128 = 0x0000_1000_8000_0080_5f9b_34fb;

/// Prefix of the speaker volume directive
pub const VOLUME_DIRECTIVE_PREFIX: &str = "AT+SPKVOL=";

/// Directive line terminator
pub const DIRECTIVE_TERMINATOR: &str = "\r\n";

/// Volume step direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeDirection {
    Up,
    Down,
}

impl VolumeDirection {
    /// Operand used in the directive
    pub fn operand(&self) -> char {
        match self {
            Self::Up => '+',
            Self::Down => '-',
        }
    }
}

impl fmt::Display for VolumeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operand())
    }
}

impl FromStr for VolumeDirection {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "+" | "up" | "increase" => Ok(Self::Up),
            "-" | "down" | "decrease" => Ok(Self::Down),
            other => Err(SessionError::EncodingError(format!(
                "unknown volume direction {:?}",
                other
            ))),
        }
    }
}

/// Peripheral-side actions expressed as text directives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Volume(VolumeDirection),
}

impl Directive {
    /// The literal ASCII command line
    pub fn command_line(&self) -> String {
        match self {
            Self::Volume(direction) => format!(
                "{}{}{}",
                VOLUME_DIRECTIVE_PREFIX,
                direction.operand(),
                DIRECTIVE_TERMINATOR
            ),
        }
    }
}

/// A payload in transport encoding (standard base64), together with the
/// bytes that end up on the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    text: String,
    bytes: Vec<u8>,
}

impl EncodedPayload {
    /// Accept an already encoded payload, rejecting malformed base64
    pub fn from_base64(text: &str) -> SessionResult<Self> {
        let bytes = BASE64_STANDARD
            .decode(text)
            .map_err(|e| SessionError::EncodingError(format!("invalid base64 payload: {}", e)))?;
        Ok(Self {
            text: text.to_string(),
            bytes,
        })
    }

    pub fn as_base64(&self) -> &str {
        &self.text
    }

    /// Decoded bytes written to the characteristic
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Builds transport-encoded payloads. Encoding is pure and deterministic.
pub struct CommandEncoder;

impl CommandEncoder {
    pub fn encode_directive(directive: &Directive) -> EncodedPayload {
        Self::encode_text(&directive.command_line())
    }

    /// Raw mode: the text is encoded as-is, without a template
    pub fn encode_text(text: &str) -> EncodedPayload {
        let bytes = text.as_bytes().to_vec();
        EncodedPayload {
            text: BASE64_STANDARD.encode(&bytes),
            bytes,
        }
    }

    /// Raw mode for byte input; only UTF-8 text is accepted
    pub fn encode_bytes(bytes: &[u8]) -> SessionResult<EncodedPayload> {
        let text = std::str::from_utf8(bytes).map_err(|e| {
            SessionError::EncodingError(format!("payload is not UTF-8 text: {}", e))
        })?;
        Ok(Self::encode_text(text))
    }
}

/// Parse a GATT UUID.
///
/// Accepts the canonical 128-bit form in any case, and the SIG-assigned
/// 16/32-bit short forms (`"1843"`, `"0x2B7E"`, `"00001843"`), which are
/// expanded onto the Bluetooth base UUID.
pub fn parse_uuid(uuid_str: &str) -> SessionResult<Uuid> {
    let trimmed = uuid_str.trim();
    let short = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if matches!(short.len(), 4 | 8) && short.bytes().all(|b| b.is_ascii_hexdigit()) {
        let value = u32::from_str_radix(short, 16)
            .map_err(|_| SessionError::InvalidTarget(format!("invalid UUID {:?}", uuid_str)))?;
        return Ok(from_short(value));
    }

    Uuid::parse_str(trimmed)
        .map_err(|e| SessionError::InvalidTarget(format!("invalid UUID {:?}: {}", uuid_str, e)))
}

/// Expand a 16/32-bit assigned number onto the Bluetooth base UUID
pub fn from_short(value: u32) -> Uuid {
    Uuid::from_u128(((value as u128) << 96) | BASE_UUID_LOW)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_directive_encoding() {
        let up = CommandEncoder::encode_directive(&Directive::Volume(VolumeDirection::Up));
        assert_eq!(up.as_base64(), "QVQrU1BLVk9MPSsNCg==");
        assert_eq!(up.as_bytes(), b"AT+SPKVOL=+\r\n");

        let down = CommandEncoder::encode_directive(&Directive::Volume(VolumeDirection::Down));
        assert_eq!(down.as_base64(), "QVQrU1BLVk9MPS0NCg==");
        assert_eq!(down.as_bytes(), b"AT+SPKVOL=-\r\n");
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let directive = Directive::Volume(VolumeDirection::Up);
        assert_eq!(
            CommandEncoder::encode_directive(&directive),
            CommandEncoder::encode_directive(&directive)
        );
        assert_eq!(
            CommandEncoder::encode_text("AT+SPKVOL=+\r\n"),
            CommandEncoder::encode_directive(&directive)
        );
    }

    #[test]
    fn test_raw_text_has_no_template() {
        let payload = CommandEncoder::encode_text("hello");
        assert_eq!(payload.as_base64(), "aGVsbG8=");
        assert_eq!(payload.as_bytes(), b"hello");
        assert!(CommandEncoder::encode_text("").is_empty());
    }

    #[test]
    fn test_non_text_bytes_are_rejected() {
        let err = CommandEncoder::encode_bytes(&[0xff, 0xfe, 0x00]).unwrap_err();
        assert_eq!(err.kind(), crate::domain::error::ErrorKind::EncodingError);

        let ok = CommandEncoder::encode_bytes("héllo".as_bytes()).unwrap();
        assert_eq!(ok.as_bytes(), "héllo".as_bytes());
    }

    #[test]
    fn test_from_base64() {
        let payload = EncodedPayload::from_base64("QVQrU1BLVk9MPSsNCg==").unwrap();
        assert_eq!(payload.as_bytes(), b"AT+SPKVOL=+\r\n");
        assert!(EncodedPayload::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_volume_direction_parsing() {
        assert_eq!("+".parse::<VolumeDirection>().unwrap(), VolumeDirection::Up);
        assert_eq!("Decrease".parse::<VolumeDirection>().unwrap(), VolumeDirection::Down);
        assert!("louder".parse::<VolumeDirection>().is_err());
    }

    #[test]
    fn test_parse_uuid() {
        let full = parse_uuid(DEFAULT_SERVICE_UUID).unwrap();
        assert_eq!(parse_uuid("1843").unwrap(), full);
        assert_eq!(parse_uuid("0x1843").unwrap(), full);
        assert_eq!(parse_uuid("00001843").unwrap(), full);
        assert_eq!(
            parse_uuid("00001843-0000-1000-8000-00805F9B34FB").unwrap(),
            full
        );
        assert_eq!(
            parse_uuid("2B7E").unwrap().to_string(),
            VOLUME_CHAR_UUID
        );
    }

    #[test]
    fn test_parse_uuid_rejects_garbage() {
        for input in ["", "zz43", "1234-5678", "00002b7j-0000-1000-8000-00805f9b34fb"] {
            let err = parse_uuid(input).unwrap_err();
            assert_eq!(err.kind(), crate::domain::error::ErrorKind::InvalidTarget);
        }
    }
}
