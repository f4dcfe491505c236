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

/// Routing context from `key => value` pairs of string slices.
#[cfg(test)]
macro_rules! routing_context {
    () => {
        std::collections::HashMap::<String, String>::new()
    };
    ( $($key:expr => $value:expr),+ $(,)? ) => {
        [$(($key, $value)),+]
            .into_iter()
            .map(|(key, value): (&str, &str)| (key.to_owned(), value.to_owned()))
            .collect::<std::collections::HashMap<String, String>>()
    };
}

#[cfg(test)]
pub(crate) use routing_context;
