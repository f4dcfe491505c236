// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;

/// Credentials handed to the [`Connector`](crate::connection::Connector) when opening a
/// connection.
///
/// The pool treats the token as opaque.
/// Its entries follow the DBMS's conventions (`scheme`, `principal`, `credentials`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub(crate) data: HashMap<String, String>,
}

impl AuthToken {
    pub fn new_none_auth() -> Self {
        Self::from_pairs([("scheme", String::from("none"))])
    }

    pub fn new_basic_auth(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::from_pairs([
            ("scheme", String::from("basic")),
            ("principal", username.into()),
            ("credentials", password.into()),
        ])
    }

    pub fn new_basic_auth_with_realm(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        let mut token = Self::new_basic_auth(username, password);
        token.data.insert(String::from("realm"), realm.into());
        token
    }

    pub fn new_kerberos_auth(base64_encoded_ticket: impl Into<String>) -> Self {
        Self::from_pairs([
            ("scheme", String::from("kerberos")),
            ("principal", String::new()),
            ("credentials", base64_encoded_ticket.into()),
        ])
    }

    pub fn new_bearer_auth(base64_encoded_token: impl Into<String>) -> Self {
        Self::from_pairs([
            ("scheme", String::from("bearer")),
            ("credentials", base64_encoded_token.into()),
        ])
    }

    /// Entries that are `None` are left out.
    pub fn new_custom_auth(
        principal: Option<String>,
        credentials: Option<String>,
        realm: Option<String>,
        scheme: String,
    ) -> Self {
        let mut data = HashMap::with_capacity(4);
        data.insert(String::from("scheme"), scheme);
        [
            ("principal", principal),
            ("credentials", credentials),
            ("realm", realm),
        ]
        .into_iter()
        .for_each(|(key, value)| {
            if let Some(value) = value {
                data.insert(String::from(key), value);
            }
        });
        Self { data }
    }

    fn from_pairs<const N: usize>(pairs: [(&str, String); N]) -> Self {
        Self {
            data: pairs
                .into_iter()
                .map(|(key, value)| (String::from(key), value))
                .collect(),
        }
    }

    pub fn data(&self) -> &HashMap<String, String> {
        &self.data
    }

    pub fn scheme(&self) -> &str {
        self.data.get("scheme").map(String::as_str).unwrap_or("none")
    }
}

impl Default for AuthToken {
    fn default() -> Self {
        Self::new_none_auth()
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    #[rstest]
    fn test_basic_auth() {
        let token = AuthToken::new_basic_auth_with_realm("neo4j", "pass", "native");
        assert_eq!(token.scheme(), "basic");
        assert_eq!(token.data()["principal"], "neo4j");
        assert_eq!(token.data()["credentials"], "pass");
        assert_eq!(token.data()["realm"], "native");
    }

    #[rstest]
    fn test_custom_auth_skips_missing_entries() {
        let token = AuthToken::new_custom_auth(
            Some(String::from("me")),
            None,
            None,
            String::from("magic"),
        );
        assert_eq!(token.data().len(), 2);
        assert_eq!(token.scheme(), "magic");
    }

    #[rstest]
    fn test_default_is_none_auth() {
        assert_eq!(AuthToken::default(), AuthToken::new_none_auth());
        assert_eq!(AuthToken::default().scheme(), "none");
    }
}
