//! Author/committer identity lines.
//!
//! A signature line reads `<marker> <name> <<email>> <unix-time> <offset>`,
//! e.g. `author Ada <ada@example.com> 1503543845 -0700`. The marker is kept so
//! serialization is the exact inverse of parsing.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use chrono::{DateTime, FixedOffset, TimeZone};
use serde::{Deserialize, Serialize};

use crate::errors::GitError;

#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy, Serialize, Deserialize)]
pub enum SignatureType {
    Author,
    Committer,
}

impl Display for SignatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SignatureType::Author => write!(f, "author"),
            SignatureType::Committer => write!(f, "committer"),
        }
    }
}

impl FromStr for SignatureType {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "author" => Ok(SignatureType::Author),
            "committer" => Ok(SignatureType::Committer),
            _ => Err(GitError::InvalidCommitObject),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Hash, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub signature_kind: SignatureType,
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// Zone offset as written, e.g. `+0800`.
    pub timezone: String,
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} {} <{}> {} {}",
            self.signature_kind, self.name, self.email, self.timestamp, self.timezone
        )
    }
}

impl Signature {
    pub fn new(
        signature_kind: SignatureType,
        name: String,
        email: String,
        timestamp: i64,
        timezone: String,
    ) -> Signature {
        Signature {
            signature_kind,
            name,
            email,
            timestamp,
            timezone,
        }
    }

    /// Parse one signature line (without trailing newline).
    pub fn from_data(data: Vec<u8>) -> Result<Signature, GitError> {
        let kind_end = data
            .find_byte(0x20)
            .ok_or(GitError::InvalidCommitObject)?;
        let signature_kind = String::from_utf8_lossy(&data[..kind_end])
            .parse::<SignatureType>()?;

        let email_open = data.find_byte(b'<').ok_or(GitError::InvalidCommitObject)?;
        let email_close = data.find_byte(b'>').ok_or(GitError::InvalidCommitObject)?;
        if email_open < kind_end + 2 || email_close <= email_open {
            return Err(GitError::InvalidCommitObject);
        }

        let name = String::from_utf8_lossy(&data[kind_end + 1..email_open - 1])
            .trim()
            .to_string();
        let email = String::from_utf8_lossy(&data[email_open + 1..email_close]).to_string();

        let rest = String::from_utf8_lossy(&data[email_close + 1..]);
        let mut fields = rest.split_ascii_whitespace();
        let timestamp = fields
            .next()
            .and_then(|t| t.parse::<i64>().ok())
            .ok_or(GitError::InvalidCommitObject)?;
        let timezone = fields.next().unwrap_or("+0000").to_string();

        Ok(Signature {
            signature_kind,
            name,
            email,
            timestamp,
            timezone,
        })
    }

    pub fn to_data(&self) -> Result<Vec<u8>, GitError> {
        Ok(self.to_string().into_bytes())
    }

    /// Timestamp with the signature's own zone offset applied.
    pub fn when(&self) -> DateTime<FixedOffset> {
        let offset = parse_zone(&self.timezone).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
        offset
            .timestamp_opt(self.timestamp, 0)
            .single()
            .unwrap_or_else(|| offset.timestamp_opt(0, 0).unwrap())
    }

    /// RFC 1123-Z rendering used by the browse JSON surface.
    pub fn time_rfc1123z(&self) -> String {
        self.when().format("%a, %d %b %Y %H:%M:%S %z").to_string()
    }
}

fn parse_zone(tz: &str) -> Option<FixedOffset> {
    let bytes = tz.as_bytes();
    if bytes.len() != 5 {
        return None;
    }
    let sign: i32 = match bytes[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let hours: i32 = tz[1..3].parse().ok()?;
    let minutes: i32 = tz[3..5].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_serialize_round_trip() {
        let line = b"author Ada Lovelace <ada@example.com> 1503543845 -0700".to_vec();
        let sig = Signature::from_data(line.clone()).unwrap();
        assert_eq!(sig.signature_kind, SignatureType::Author);
        assert_eq!(sig.name, "Ada Lovelace");
        assert_eq!(sig.email, "ada@example.com");
        assert_eq!(sig.timestamp, 1503543845);
        assert_eq!(sig.timezone, "-0700");
        assert_eq!(sig.to_data().unwrap(), line);
    }

    #[test]
    fn test_rfc1123z_rendering() {
        let sig = Signature::new(
            SignatureType::Committer,
            "Ada".to_string(),
            "ada@example.com".to_string(),
            1503543845,
            "-0700".to_string(),
        );
        assert_eq!(sig.time_rfc1123z(), "Wed, 23 Aug 2017 19:24:05 -0700");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Signature::from_data(b"nonsense".to_vec()).is_err());
        assert!(Signature::from_data(b"tagger A <a@b> x +0000".to_vec()).is_err());
    }
}
