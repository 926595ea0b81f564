pub mod bridge;
pub mod completion;
pub mod config;
pub mod envelope;
pub mod error;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod provider;
pub mod provider_factory;
pub mod providers;
pub mod stream;
pub mod telemetry;
#[cfg(test)]
pub mod test_util;
