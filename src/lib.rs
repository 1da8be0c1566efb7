// src/lib.rs

pub mod config;
pub mod messaging;
pub mod rabbitmq;

pub use config::MessagingConfig;
pub use messaging::MessagingService;
pub use rabbitmq::{RabbitMQError, Result};
