//! Single-byte text encodings for relayed data.
//!
//! Each byte maps to exactly one character. `Ascii` rejects bytes above
//! 0x7f; `Latin1` maps every byte to the code point of the same value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// The fixed text encoding of both relay directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    /// 7-bit US-ASCII.
    #[default]
    Ascii,
    /// ISO-8859-1.
    Latin1,
}

impl TextEncoding {
    fn max_char(self) -> u32 {
        match self {
            TextEncoding::Ascii => 0x7f,
            TextEncoding::Latin1 => 0xff,
        }
    }

    /// Decodes bytes received from the stream.
    pub fn decode(self, bytes: &[u8]) -> Result<String, RelayError> {
        let max = self.max_char();
        bytes
            .iter()
            .enumerate()
            .map(|(offset, &byte)| {
                if u32::from(byte) <= max {
                    Ok(char::from(byte))
                } else {
                    Err(RelayError::Decode { byte, offset })
                }
            })
            .collect()
    }

    /// Encodes text to send on the stream.
    pub fn encode(self, text: &str) -> Result<Vec<u8>, RelayError> {
        let max = self.max_char();
        text.chars()
            .map(|ch| {
                if u32::from(ch) <= max {
                    Ok(ch as u8)
                } else {
                    Err(RelayError::Encode { ch })
                }
            })
            .collect()
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextEncoding::Ascii => f.write_str("ascii"),
            TextEncoding::Latin1 => f.write_str("latin1"),
        }
    }
}

impl FromStr for TextEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ascii" | "us-ascii" => Ok(TextEncoding::Ascii),
            "latin1" | "iso-8859-1" => Ok(TextEncoding::Latin1),
            other => Err(format!("unknown encoding {:?}, expected ascii or latin1", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_decodes_shell_output() {
        let text = TextEncoding::Ascii.decode(b"hi\r\n$ ").unwrap();
        assert_eq!(text, "hi\r\n$ ");
    }

    #[test]
    fn test_ascii_rejects_high_bytes() {
        let err = TextEncoding::Ascii.decode(b"ok\xe9").unwrap_err();
        assert!(matches!(err, RelayError::Decode { byte: 0xe9, offset: 2 }));
    }

    #[test]
    fn test_latin1_decodes_every_byte() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let text = TextEncoding::Latin1.decode(&bytes).unwrap();
        assert_eq!(text.chars().count(), 256);
        assert_eq!(text.chars().nth(0xe9), Some('é'));
    }

    #[test]
    fn test_ascii_encode_rejects_non_ascii() {
        let err = TextEncoding::Ascii.encode("café\n").unwrap_err();
        assert!(matches!(err, RelayError::Encode { ch: 'é' }));
    }

    #[test]
    fn test_latin1_encodes_to_single_bytes() {
        assert_eq!(TextEncoding::Latin1.encode("café").unwrap(), b"caf\xe9");
        assert!(TextEncoding::Latin1.encode("€").is_err());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("ASCII".parse::<TextEncoding>(), Ok(TextEncoding::Ascii));
        assert_eq!("iso-8859-1".parse::<TextEncoding>(), Ok(TextEncoding::Latin1));
        assert!("utf-8".parse::<TextEncoding>().is_err());
        assert_eq!(TextEncoding::Latin1.to_string(), "latin1");
    }
}
