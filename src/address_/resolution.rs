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

use std::error::Error as StdError;
use std::fmt::Debug;
use std::result::Result as StdResult;
use std::sync::Arc;

use log::debug;
#[cfg(test)]
use mockall::automock;

use super::Address;
use crate::error_::{Neo4jError, Result, UserCallbackError};

// imports for docs
#[allow(unused)]
use crate::driver::DriverConfig;

type BoxError = Box<dyn StdError + Send + Sync>;
/// See [`AddressResolver::resolve()`].
pub type AddressResolverReturn = StdResult<Vec<Address>, BoxError>;

/// A trait for custom address resolution of the seed router.
///
/// Addresses learned from routing tables are never passed through the resolver.
/// Host name resolution (DNS) is left to the [`Connector`](crate::connection::Connector).
///
/// See [`DriverConfig::with_resolver()`].
#[cfg_attr(test, automock)]
pub trait AddressResolver: Debug + Send + Sync {
    /// must not return an empty vector
    fn resolve(&self, address: &Address) -> AddressResolverReturn;
}

#[derive(Debug)]
pub(super) enum CustomResolution {
    NoResolver(Option<Arc<Address>>),
    Resolver(Vec<Arc<Address>>),
}

impl CustomResolution {
    pub(super) fn new(
        address: Arc<Address>,
        resolver: Option<&dyn AddressResolver>,
    ) -> Result<Self> {
        match resolver {
            None => Ok(Self::NoResolver(Some(address))),
            Some(_) if address.is_custom_resolved => Ok(Self::NoResolver(Some(address))),
            Some(resolver) => {
                debug!("custom resolver in: {address}");
                match resolver.resolve(&address) {
                    Ok(mut addrs) => {
                        addrs.iter_mut().for_each(|a| a.is_custom_resolved = true);
                        // reversed so that `pop` yields them in resolver order
                        let addrs = addrs.into_iter().rev().map(Arc::new).collect::<Vec<_>>();
                        debug!(
                            "custom resolver out: {:?}",
                            addrs.iter().rev().map(|a| format!("{a}")).collect::<Vec<_>>()
                        );
                        if addrs.is_empty() {
                            return Err(Neo4jError::InvalidConfig {
                                message: String::from(
                                    "DriverConfig::resolver returned no addresses.",
                                ),
                            });
                        }
                        Ok(Self::Resolver(addrs))
                    }
                    Err(err) => {
                        debug!("custom resolver failed: {err:?}");
                        Err(Neo4jError::UserCallback {
                            error: UserCallbackError::Resolver(err),
                        })
                    }
                }
            }
        }
    }
}

impl Iterator for CustomResolution {
    type Item = Arc<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            CustomResolution::NoResolver(address) => address.take(),
            CustomResolution::Resolver(addresses) => addresses.pop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;
    use crate::error_::ErrorKind;

    #[rstest]
    fn test_no_resolver_yields_address() {
        let address = Arc::new(Address::from("seed:7687"));
        let resolved = Arc::clone(&address)
            .custom_resolve(None)
            .unwrap()
            .collect::<Vec<_>>();
        assert_eq!(resolved, vec![address]);
    }

    #[rstest]
    fn test_resolver_order_is_kept() {
        let mut resolver = MockAddressResolver::new();
        resolver
            .expect_resolve()
            .withf(|address| address == &Address::from("seed:7687"))
            .times(1)
            .returning(|_| Ok(vec![Address::from("a:1"), Address::from("b:2")]));
        let resolved = Arc::new(Address::from("seed"))
            .custom_resolve(Some(&resolver))
            .unwrap()
            .collect::<Vec<_>>();
        assert_eq!(
            resolved.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
            vec!["a:1", "b:2"]
        );
        assert!(resolved.iter().all(|a| a.is_custom_resolved));
    }

    #[rstest]
    fn test_resolver_returning_nothing_is_invalid_config() {
        let mut resolver = MockAddressResolver::new();
        resolver.expect_resolve().returning(|_| Ok(vec![]));
        let err = Arc::new(Address::from("seed"))
            .custom_resolve(Some(&resolver))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[rstest]
    fn test_resolver_failure_is_user_callback_error() {
        let mut resolver = MockAddressResolver::new();
        resolver
            .expect_resolve()
            .returning(|_| Err("resolver on strike".into()));
        let err = Arc::new(Address::from("seed"))
            .custom_resolve(Some(&resolver))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::UserCallback);
        assert!(err.to_string().contains("resolver on strike"));
    }
}
