//! Crate-wide error taxonomy.
//!
//! Startup problems (configuration, hardware identification) and fatal
//! runtime conditions (MQTT retry exhaustion) surface as [`Error`]; everything
//! transient on the buses is logged at the call site and never propagated.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A configuration problem. Fatal at startup; the message names the
/// offending key and value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("[CONFIG] Can't read YAML file '{path}': {reason}")]
    Yaml { path: PathBuf, reason: String },

    #[error("[CONFIG] Invalid value '{value}' in '{key}'. The following characters are prohibited: a-z 0-9 -_")]
    InvalidSlug { key: String, value: String },

    #[error("[CONFIG] Invalid log level '{0}'. The following log levels are allowed: error warning info debug.")]
    InvalidLogLevel(String),

    #[error("[CONFIG] [COVER] Invalid value '{value}' in 'device_class'. The following values are allowed: {allowed}.")]
    InvalidCoverDeviceClass { value: String, allowed: String },

    #[error("[CONFIG] [COVER] Required key '{key}' is missing or empty in cover '{object_id}'!")]
    MissingCoverKey { object_id: String, key: String },

    #[error("[CONFIG] [COVER] Invalid value '{value}' in 'cover_run_time' of cover '{object_id}'. Must be greater than zero.")]
    InvalidCoverRunTime { object_id: String, value: String },

    #[error("[CONFIG] [COVER] Duplicate circuits found in 'covers'. Driving both signals up and down at the same time can damage the motor!")]
    DuplicateCoverCircuit,

    #[error("[CONFIG] Duplicate object id '{0}' found in features and covers!")]
    DuplicateObjectId(String),

    #[error("[CONFIG] Invalid value '{value}' in 'baud_rate'. The following baud rates are allowed: 2400 4800 9600 19200 38400 57600 115200.")]
    InvalidBaudRate { value: u32 },

    #[error("[CONFIG] Invalid value '{value}' in 'parity'. The following values are allowed: N E O.")]
    InvalidParity { value: String },

    #[error("[CONFIG] Cover '{object_id}' references unknown output circuit '{circuit}'")]
    UnknownCoverCircuit { object_id: String, circuit: String },

    #[error("[CONFIG] Can't create temporary directory '{path}': {source}")]
    TempDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Hardware identification failed; the daemon cannot pick a definition file.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("[CONFIG] Hardware is not supported! No EEPROM found under '{0}'")]
    NoEeprom(PathBuf),

    #[error("[CONFIG] Can't read EEPROM '{path}': {source}")]
    Eeprom {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("[CONFIG] No valid YAML definition for active Neuron device! Device model is {0}")]
    MissingDefinition(String),

    #[error("[CONFIG] No valid YAML definition for extension '{0}'")]
    MissingExtensionDefinition(String),

    #[error("[CONFIG] Can't parse hardware definition '{path}': {reason}")]
    Definition { path: PathBuf, reason: String },
}

/// Top-level daemon error. Rendered once by `main` right before exit.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("Shutdown, due to too many MQTT connection attempts.")]
    MqttRetryLimit,

    #[error("Shutdown, due to Modbus connection error: {0}")]
    ModbusConnect(#[source] io::Error),
}
