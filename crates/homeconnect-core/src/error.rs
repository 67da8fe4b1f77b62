use thiserror::Error;

/// Error type for the entity runtime.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The underlying session failed or the appliance rejected the
    /// request.
    #[error(transparent)]
    Session(#[from] homeconnect_api::Error),

    /// A high-level operation was handed a missing or malformed argument.
    #[error("invalid payload for {operation}: {reason}")]
    InvalidPayload {
        operation: &'static str,
        reason: String,
    },

    /// Dispatch to an entity that does not exist on this appliance.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// Dispatch to a service namespace this appliance does not expose.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// Write to an entity whose access is neither ReadWrite nor WriteOnly.
    #[error("entity {name} is not writable")]
    NotWritable { name: String },

    /// Write to an entity the appliance reports as unavailable.
    #[error("entity {name} is currently unavailable")]
    Unavailable { name: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
