use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const AUDIENCE_CLAIM: &str = "aud";
pub const APP_ID_CLAIM: &str = "appid";
pub const AUTHORIZED_PARTY_CLAIM: &str = "azp";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Authenticated caller identity attached to an inbound request.
pub struct ClaimsIdentity {
    pub authenticated: bool,
    #[serde(default)]
    pub claims: BTreeMap<String, String>,
}

impl ClaimsIdentity {
    pub fn authenticated(claims: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            authenticated: true,
            claims: claims.into_iter().collect(),
        }
    }

    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).map(String::as_str)
    }

    pub fn audience(&self) -> Option<&str> {
        self.claim(AUDIENCE_CLAIM)
    }

    /// Calling app id, preferring `appid` over `azp`.
    pub fn app_id(&self) -> Option<&str> {
        self.claim(APP_ID_CLAIM)
            .or_else(|| self.claim(AUTHORIZED_PARTY_CLAIM))
    }
}
