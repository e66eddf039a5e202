//! Switchboard Core Library
//!
//! Configuration model and loading for the Switchboard server.

pub mod config;
pub mod error;

pub use config::{
    AuthConfig, Config, CorsConfig, FrameErrorAction, HeartbeatConfig, LogConfig, QueueConfig,
    QueueDriver, RedisConfig, RoomsConfig, ServerConfig, TlsConfig,
};
pub use error::{Error, Result};
