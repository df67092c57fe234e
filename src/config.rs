//! Server configuration, loadable from TOML.
//!
//! Every field has a default, so an empty file is a valid configuration:
//!
//! ```toml
//! listen = "127.0.0.1:7070"
//! workers = 2
//! max_backlog = 1024
//!
//! [slots]
//! run_step = 100
//!
//! [writer]
//! backpressure_timeout_ms = 5000
//!
//! [engine]
//! step_delay_ms = 0
//!
//! [[engine.devices]]
//! name = "/job:localhost/replica:0/task:0/device:CPU:0"
//! device_type = "CPU"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};
use crate::messages::DeviceAttributes;
use crate::method::Method;
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::transport::Endpoint;
use crate::writer::{
    WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_PENDING_FRAMES,
};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7070";

/// Default per-method backlog bound.
pub const DEFAULT_MAX_BACKLOG: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: Endpoint,
    /// Event-loop workers draining the completion queue.
    pub workers: usize,
    /// Calls per method that may wait for a slot before being refused.
    pub max_backlog: usize,
    pub max_payload_size: u32,
    pub slots: SlotConfig,
    pub writer: WriterSettings,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Endpoint::Tcp(([127, 0, 0, 1], 7070).into()),
            workers: 1,
            max_backlog: DEFAULT_MAX_BACKLOG,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            slots: SlotConfig::default(),
            writer: WriterSettings::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CoordinatorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(CoordinatorError::Config("workers must be at least 1".into()));
        }
        if self.max_payload_size == 0 {
            return Err(CoordinatorError::Config(
                "max_payload_size must be positive".into(),
            ));
        }
        for method in Method::ALL {
            if self.slots.standing(method) == 0 {
                return Err(CoordinatorError::Config(format!(
                    "slots.{} must be at least 1",
                    slot_key(method)
                )));
            }
        }
        self.writer.validate()?;
        self.engine.validate()
    }
}

/// Standing Awaiting slots per method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlotConfig {
    pub create_session: usize,
    pub extend_session: usize,
    pub run_step: usize,
    pub close_session: usize,
    pub list_devices: usize,
    pub reset: usize,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            create_session: Method::CreateSession.default_standing(),
            extend_session: Method::ExtendSession.default_standing(),
            run_step: Method::RunStep.default_standing(),
            close_session: Method::CloseSession.default_standing(),
            list_devices: Method::ListDevices.default_standing(),
            reset: Method::Reset.default_standing(),
        }
    }
}

impl SlotConfig {
    pub fn standing(&self, method: Method) -> usize {
        match method {
            Method::CreateSession => self.create_session,
            Method::ExtendSession => self.extend_session,
            Method::RunStep => self.run_step,
            Method::CloseSession => self.close_session,
            Method::ListDevices => self.list_devices,
            Method::Reset => self.reset,
        }
    }

    pub fn set(&mut self, method: Method, standing: usize) {
        let field = match method {
            Method::CreateSession => &mut self.create_session,
            Method::ExtendSession => &mut self.extend_session,
            Method::RunStep => &mut self.run_step,
            Method::CloseSession => &mut self.close_session,
            Method::ListDevices => &mut self.list_devices,
            Method::Reset => &mut self.reset,
        };
        *field = standing;
    }
}

fn slot_key(method: Method) -> &'static str {
    match method {
        Method::CreateSession => "create_session",
        Method::ExtendSession => "extend_session",
        Method::RunStep => "run_step",
        Method::CloseSession => "close_session",
        Method::ListDevices => "list_devices",
        Method::Reset => "reset",
    }
}

/// Per-connection writer limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterSettings {
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
    pub backpressure_timeout_ms: u64,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl WriterSettings {
    fn validate(&self) -> Result<()> {
        if self.max_pending_frames == 0 || self.channel_capacity == 0 {
            return Err(CoordinatorError::Config(
                "writer limits must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn to_writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: Duration::from_millis(self.backpressure_timeout_ms),
        }
    }
}

/// Settings of the built-in [`LocalCoordinator`](crate::engine::LocalCoordinator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub devices: Vec<DeviceAttributes>,
    /// Simulated execution time of every RunStep.
    pub step_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            devices: vec![default_device()],
            step_delay_ms: 0,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(CoordinatorError::Config(
                "engine needs at least one device".into(),
            ));
        }
        Ok(())
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

pub fn default_device() -> DeviceAttributes {
    DeviceAttributes {
        name: "/job:localhost/replica:0/task:0/device:CPU:0".to_string(),
        device_type: "CPU".to_string(),
        memory_limit: 256 << 20,
        incarnation: 1,
    }
}
