use std::fmt;

use russh::keys::HashAlg;
use tracing::warn;

use crate::error::Error;
use crate::observability;

/// An SSH public key compared by algorithm and wire-encoded key material.
///
/// Comments and the source encoding do not take part in equality, so a key
/// parsed from an `authorized_keys` line equals the same key presented during
/// an SSH handshake or decoded from the credential store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey {
    algorithm: String,
    blob: Vec<u8>,
    fingerprint: String,
}

impl PublicKey {
    pub fn from_ssh_key(key: &russh::keys::PublicKey) -> Result<PublicKey, Error> {
        let blob = key
            .to_bytes()
            .map_err(|error| Error::MalformedRequest(error.to_string()))?;

        Ok(PublicKey {
            algorithm: key.algorithm().as_str().to_string(),
            blob,
            fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
        })
    }

    /// Decodes a key from its SSH wire encoding.
    pub fn from_bytes(blob: &[u8]) -> Result<PublicKey, Error> {
        let key = russh::keys::PublicKey::from_bytes(blob)
            .map_err(|error| Error::MalformedRequest(error.to_string()))?;

        PublicKey::from_ssh_key(&key)
    }

    /// Parses a single `authorized_keys` style line: `[algorithm] base64 [comment]`.
    pub fn from_authorized_key(line: &str) -> Result<PublicKey, Error> {
        let mut pieces = line.split_whitespace();

        let encoded = match (pieces.next(), pieces.next()) {
            (Some(_), Some(key)) => key,
            (Some(key), None) => key,
            _ => return Err(Error::MalformedRequest("empty public key".to_string())),
        };

        let key = russh::keys::parse_public_key_base64(encoded)
            .map_err(|error| Error::MalformedRequest(error.to_string()))?;

        PublicKey::from_ssh_key(&key)
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Parses newline separated keys, skipping blank lines and keys that fail to parse.
pub fn parse_authorized_keys<'a, I>(authorized_keys: I, source: &'static str) -> Vec<PublicKey>
where
    I: IntoIterator<Item = &'a str>,
{
    authorized_keys
        .into_iter()
        .flat_map(str::lines)
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match PublicKey::from_authorized_key(line) {
            Ok(key) => Some(key),
            Err(error) => {
                warn!(source, %error, "Skipping unparseable public key");
                observability::record_skipped_public_key(source);
                None
            }
        })
        .collect()
}


#[cfg(test)]
mod test {
    use super::fixtures::{ALICE_KEY, BOB_KEY};
    use super::*;

    #[test]
    fn test_parse_authorized_keys_str() {
        let authorized_keys = format!("{}\n{}\n", ALICE_KEY, BOB_KEY);

        let authorized_keys = parse_authorized_keys([authorized_keys.as_str()], "test");

        assert_eq!(2, authorized_keys.len());
        assert_eq!("ssh-ed25519", authorized_keys[0].algorithm());
    }

    #[test]
    fn test_parse_authorized_keys_str_with_whitespace() {
        let authorized_keys = parse_authorized_keys(["    \n \n     \n  \n"], "test");

        assert_eq!(0, authorized_keys.len());
    }

    #[test]
    fn test_parse_authorized_keys_str_with_missing_piece() {
        let authorized_keys = parse_authorized_keys(["ssh-ed25519"], "test");

        assert_eq!(0, authorized_keys.len());
    }

    #[test]
    fn test_parse_authorized_keys_skips_invalid_key() {
        let authorized_keys = parse_authorized_keys(["ssh-rsa invalid", ALICE_KEY], "test");

        assert_eq!(1, authorized_keys.len());
    }

    #[test]
    fn test_equality_ignores_comment() {
        let with_comment = PublicKey::from_authorized_key(ALICE_KEY).unwrap();
        let without_comment = PublicKey::from_authorized_key(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJi7hXMtYK3MXcaKJ5yrssEYm2KBGXYXAnjhfiP0EEd3",
        )
        .unwrap();

        assert_eq!(with_comment, without_comment);
    }

    #[test]
    fn test_equality_across_decode_paths() {
        let parsed = PublicKey::from_authorized_key(ALICE_KEY).unwrap();
        let decoded = PublicKey::from_bytes(parsed.as_bytes()).unwrap();

        assert_eq!(parsed, decoded);
    }

    #[test]
    fn test_different_keys_are_not_equal() {
        assert_ne!(
            PublicKey::from_authorized_key(ALICE_KEY).unwrap(),
            PublicKey::from_authorized_key(BOB_KEY).unwrap()
        );
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(PublicKey::from_bytes(&[0x00, 0x01, 0x02]).is_err());
    }
}
