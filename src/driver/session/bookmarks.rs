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

use std::collections::HashSet;
use std::ops::{Add, AddAssign};
use std::sync::Arc;

/// Causal consistency tokens.
///
/// Sent along with routing table requests so that a router lagging behind can catch up
/// before answering.
/// Inside [`Session::run_with_retry()`](crate::session::Session::run_with_retry) the
/// bookmarks of the latest successful attempt are carried forward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bookmarks {
    bookmarks: HashSet<Arc<String>>,
}

impl Bookmarks {
    pub fn from_raw(raw: impl IntoIterator<Item = String>) -> Self {
        raw.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.bookmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
    }

    pub fn contains(&self, bookmark: &str) -> bool {
        self.bookmarks.iter().any(|bm| bm.as_str() == bookmark)
    }

    pub fn into_raw(self) -> impl Iterator<Item = String> {
        self.bookmarks
            .into_iter()
            .map(|bm| Arc::try_unwrap(bm).unwrap_or_else(|bm| String::clone(&bm)))
    }

    pub fn raw(&self) -> impl Iterator<Item = &str> {
        self.bookmarks.iter().map(|bm| bm.as_str())
    }
}

impl FromIterator<String> for Bookmarks {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self {
            bookmarks: iter.into_iter().map(Arc::new).collect(),
        }
    }
}

impl Add for Bookmarks {
    type Output = Bookmarks;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl Add<&Bookmarks> for Bookmarks {
    type Output = Bookmarks;

    fn add(mut self, rhs: &Bookmarks) -> Self::Output {
        self += rhs;
        self
    }
}

impl AddAssign<Bookmarks> for Bookmarks {
    fn add_assign(&mut self, mut rhs: Bookmarks) {
        if self.bookmarks.len() < rhs.bookmarks.len() {
            std::mem::swap(&mut self.bookmarks, &mut rhs.bookmarks)
        }
        self.bookmarks.extend(rhs.bookmarks);
    }
}

impl AddAssign<&Bookmarks> for Bookmarks {
    fn add_assign(&mut self, rhs: &Bookmarks) {
        self.bookmarks.extend(rhs.bookmarks.iter().map(Arc::clone));
    }
}
