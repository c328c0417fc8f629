//! Local network side of the bridge: tunnel addresses and loopback aliases

mod address;
mod alias;

pub use address::{Address, ADDRESS_PREFIX};
pub use alias::{AddressAliaser, SystemAliaser};

#[cfg(test)]
pub use alias::MockAddressAliaser;
