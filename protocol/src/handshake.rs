use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Greeting sent by the server as `+HI {json}` right after accept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hi {
    pub v: u32,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
}

/// Client reply to `HI`. Producers leave `wid` empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Hello {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub wid: String,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwdhash: Option<String>,
    #[serde(default)]
    pub v: u32,
}

impl Hello {
    pub fn is_consumer(&self) -> bool {
        !self.wid.is_empty()
    }
}

/// `sha256^iterations(password ++ salt)`, hex encoded.
///
/// The first round hashes the concatenation, every later round rehashes the
/// previous 32-byte digest. An iteration count of zero is treated as one.
pub fn hash_password(password: &str, salt: &str, iterations: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    let mut digest = hasher.finalize();
    for _ in 1..iterations.max(1) {
        digest = Sha256::digest(digest);
    }
    hex::encode(digest)
}

/// Constant-time comparison of a client hash against the expected one.
pub fn verify_password(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_iteration_is_plain_sha256() {
        assert_eq!(
            hash_password("secret", "abcd0123", 1),
            hex::encode(Sha256::digest(b"secretabcd0123"))
        );
        assert_eq!(
            hash_password("secret", "abcd0123", 0),
            hash_password("secret", "abcd0123", 1)
        );
    }

    #[test]
    fn iterations_rehash_the_raw_digest() {
        let first = Sha256::digest(b"secretabcd0123");
        let second = Sha256::digest(first);
        let third = Sha256::digest(second);
        assert_eq!(hash_password("secret", "abcd0123", 3), hex::encode(third));
    }

    #[test]
    fn verify_password_requires_exact_match() {
        let hash = hash_password("secret", "abcd0123", 4000);
        assert!(verify_password(&hash, &hash));
        assert!(!verify_password(&hash, &hash_password("secret", "abcd0123", 3999)));
        assert!(!verify_password(&hash, ""));
    }

    #[test]
    fn hi_omits_salt_without_password() {
        let open = Hi {
            v: 2,
            salt: None,
            iterations: None,
        };
        assert_eq!(serde_json::to_string(&open).unwrap(), r#"{"v":2}"#);

        let locked = Hi {
            v: 2,
            salt: Some("abcd0123".to_string()),
            iterations: Some(4000),
        };
        assert_eq!(
            serde_json::to_string(&locked).unwrap(),
            r#"{"v":2,"s":"abcd0123","i":4000}"#
        );
    }

    #[test]
    fn hello_defaults_missing_fields() {
        let hello: Hello = serde_json::from_str(r#"{"hostname":"h","v":2}"#).unwrap();
        assert!(!hello.is_consumer());
        assert!(hello.labels.is_empty());
        assert_eq!(hello.pwdhash, None);
    }
}
