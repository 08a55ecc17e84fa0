use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use system::{SessionError, UserInfo};

/// Identity resolved from a bearer credential at websocket handshake.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user: UserInfo,
    pub is_active: bool,
}

/// Invoked once per connection attempt, before the websocket upgrade.
/// Inactive identities are refused by the handshake handler.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, SessionError>;
}

/// Token table loaded once at startup. Credential issuance and expiry
/// belong to the REST layer; the session layer only resolves bearer
/// tokens to users.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

#[derive(Debug, Deserialize)]
struct TokenRecord {
    token: String,
    user: UserInfo,
    #[serde(default = "default_active")]
    is_active: bool,
}

fn default_active() -> bool {
    true
}

impl StaticTokenVerifier {
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        let records: Vec<TokenRecord> = serde_json::from_slice(&raw)
            .map_err(|error| std::io::Error::new(ErrorKind::InvalidData, error))?;
        Ok(Self::from_records(records))
    }

    fn from_records(records: Vec<TokenRecord>) -> Self {
        let tokens = records
            .into_iter()
            .map(|record| {
                (
                    record.token,
                    Identity {
                        user: record.user,
                        is_active: record.is_active,
                    },
                )
            })
            .collect();
        Self { tokens }
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, SessionError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or_else(|| SessionError::Auth("unknown credential".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn it_resolves_known_tokens_and_rejects_the_rest() {
        let verifier = StaticTokenVerifier::from_records(vec![TokenRecord {
            token: "t-ann".into(),
            user: UserInfo {
                id: "u1".into(),
                username: "ann".into(),
                avatar: None,
            },
            is_active: true,
        }]);

        let identity = verifier.verify("t-ann").await.expect("known token");
        assert_eq!(identity.user.id, "u1");
        assert!(identity.is_active);

        assert!(matches!(
            verifier.verify("t-bogus").await,
            Err(SessionError::Auth(_))
        ));
    }
}
