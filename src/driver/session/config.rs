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

use std::sync::Arc;

use super::bookmarks::Bookmarks;

/// Configuration of a [`Session`](super::Session).
///
/// # Example
/// ```
/// use neo4j_routing::bookmarks::Bookmarks;
/// use neo4j_routing::session::SessionConfig;
///
/// let config = SessionConfig::new()
///     .with_database(String::from("movies"))
///     .with_bookmarks(Bookmarks::from_raw(vec![String::from("bm:1")]));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub(crate) database: Option<Arc<String>>,
    pub(crate) bookmarks: Option<Arc<Bookmarks>>,
    pub(crate) impersonated_user: Option<Arc<String>>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route work to the given database.
    ///
    /// When not set, the user's home database is used.
    #[inline]
    pub fn with_database(mut self, database: String) -> Self {
        self.database = Some(Arc::new(database));
        self
    }

    #[inline]
    pub fn with_default_database(mut self) -> Self {
        self.database = None;
        self
    }

    /// Bookmarks the first unit of work of the session must be causally consistent with.
    #[inline]
    pub fn with_bookmarks(mut self, bookmarks: Bookmarks) -> Self {
        self.bookmarks = Some(Arc::new(bookmarks));
        self
    }

    #[inline]
    pub fn without_bookmarks(mut self) -> Self {
        self.bookmarks = None;
        self
    }

    #[inline]
    pub fn with_impersonated_user(mut self, user: String) -> Self {
        self.impersonated_user = Some(Arc::new(user));
        self
    }

    #[inline]
    pub fn without_impersonated_user(mut self) -> Self {
        self.impersonated_user = None;
        self
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_ref().map(|db| db.as_str())
    }
}

impl AsRef<SessionConfig> for SessionConfig {
    #[inline]
    fn as_ref(&self) -> &SessionConfig {
        self
    }
}
