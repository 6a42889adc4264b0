pub mod config;
pub mod error;
pub mod packages;
pub mod uplink;

#[cfg(test)]
pub mod test_utils;
