//! Typed appliance model and entity runtime for the Home Connect local
//! protocol.
//!
//! The XML profile parser (an external collaborator) turns the vendor's
//! feature-mapping and device-description documents into a
//! [`DeviceDescription`]. This crate turns that description into live,
//! typed entities over a [`Transport`]:
//!
//! - [`Entity`] — one appliance feature (status, setting, event, command,
//!   option), with value coercion, enum label mapping, and the split
//!   between the last value written and the last value the appliance
//!   acknowledged (the shadow value).
//! - [`Program`] — select/start with option merging from sibling
//!   entities' shadow values.
//! - [`Appliance`] — the registry: entities keyed by uid and by name,
//!   programs, role classification for integration layers, NOTIFY
//!   dispatch back into entity state, and a broadcast stream of entity
//!   updates.
//! - [`ApplianceConnection`] — a supervisor that keeps the appliance
//!   reachable across session drops, with exponential backoff.
//!
//! [`Transport`]: homeconnect_api::Transport

pub mod appliance;
pub mod connection;
pub mod describe;
pub mod entity;
pub mod error;
pub mod program;
pub mod value;

pub use appliance::{infer_keepalive_uid, on_off_codes, Appliance, EntityRole, EntityUpdate};
pub use connection::{ApplianceConnection, ConnectionState, ReconnectConfig, SessionHandle};
pub use describe::{
    Access, DeviceDescription, DeviceInfo, EntityDescription, EntityKind, Execution, ProtocolType,
};
pub use entity::Entity;
pub use error::{CoreError, Result};
pub use program::Program;
