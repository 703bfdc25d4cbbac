#![doc = r#"
Unipi Control library crate.

This crate exposes the daemon's subsystems for use by the binary and tests.

Modules:
- config: typed `control.yaml` records with explicit per-record validators
- error: crate error taxonomy (configuration, hardware, fatal runtime)
- hardware: EEPROM identification and YAML board/extension definitions
- registers: register cache with bit/word/float accessors and change flags
- features: DI/DO/RO/LED/METER handles over the cache; the feature map
- modbus: bus clients, per-bus block scanners, probes, coil write queue
- covers: position-tracked cover state machines over relay pairs
- mqtt: connection lifecycle, publish loops, command dispatch, discovery
- logging: sink selection (stdout / sd-daemon framing) and prefixes

In tests, shared YAML and fixture builders are available under
`crate::test_utils`.
"#]

pub mod config;
pub mod covers;
pub mod error;
pub mod features;
pub mod hardware;
pub mod logging;
pub mod modbus;
pub mod mqtt;
pub mod registers;

// Re-export commonly used types at the crate root for convenience.
pub use config::Config;
pub use error::Error;
pub use features::{Feature, FeatureMap};
pub use registers::RegisterCache;

// Shared test utilities (only compiled for tests)
#[cfg(test)]
pub mod test_utils;
