//! # MQTT Integration Module
//!
//! Connects the bridge to the broker: subscribes to the command topics, hands every
//! inbound publish to the dispatcher and publishes device events.
//!
//! ## Why This Module Exists
//!
//! The bus is the only way the outside world talks to the bridge. Everything here is
//! about keeping that conversation reliable across broker restarts:
//! - A retained `"0"` last will on `P/sys/status` tells subscribers when the bridge dies
//! - Every (re)connect publishes a retained `"1"` and re-issues each subscription
//! - Inbound messages are handled one at a time, in arrival order
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - [mqtt] settings and topic naming
//! ├── topic.rs            - Wildcard patterns and the first-match router
//! ├── message_manager.rs  - Inbound message representation
//! └── mqtt_handler.rs     - Event loop, publisher and connection status
//! ```
//!
//! ## Topic Namespace
//!
//! ```text
//! P/<device or empty>/action/<action>   inbound commands
//! P/<device>/event/<kind>               outbound JSON events, retained
//! P/sys/status                          "1" while connected, "0" as last will
//! ```

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod topic;

pub use config::MqttConfig;
pub use message_manager::InboundMessage;
pub use mqtt_handler::{
    BusPublisher, ConnectionState, MQTTStatus, MessageSink, MqttError, MqttHandler,
    MqttPublisher, SharedStatus,
};
pub use topic::{TopicError, TopicPattern, TopicRouter};
