use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("NetBird API Error: {0}")]
    MeshError(#[source] mesh::MeshError),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Missing Annotation: {0}")]
    MissingAnnotation(String),

    #[error("Validation Error: {0}")]
    ValidationError(String),

    /// NB: this is a catch-all for any other errors
    #[error("Other Error: {0}")]
    OtherError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod admission;
pub mod conditions;
pub mod config;
mod events_helper;
pub mod group_controller;
pub mod macros;
pub mod mesh;
pub mod policy_controller;
pub mod resource_controller;
pub mod routingpeer_controller;
pub mod service_controller;
pub mod setupkey_controller;
pub mod util;
pub use events_helper::*;

/// Log and trace integrations
pub mod telemetry;
