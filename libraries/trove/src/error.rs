use crate::identity::ResourceIdentifier;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced synchronously to the caller.
///
/// Everything except [`Error::Network`] and [`Error::Json`] indicates a bug in the
/// calling code or in a schema: the store never swallows these.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no field named `{field}` on type `{type_name}`")]
    UnknownField { field: String, type_name: String },

    #[error("no schema registered for type `{0}`")]
    UnknownSchema(String),

    #[error("schema for type `{0}` is already registered")]
    SchemaAlreadyRegistered(String),

    #[error("invalid schema for `{type_name}`: {reason}")]
    InvalidSchema { type_name: String, reason: String },

    #[error(
        "field `{field}` on type `{type_name}` uses transform `{transform}`, \
         which is not registered"
    )]
    MissingTransform {
        field: String,
        type_name: String,
        transform: String,
    },

    #[error(
        "field `{field}` on type `{type_name}` uses derivation `{derivation}`, \
         which is not registered"
    )]
    MissingDerivation {
        field: String,
        type_name: String,
        derivation: String,
    },

    #[error("hash function `{0}` is not registered")]
    MissingHashFunction(String),

    #[error("transform `{transform}` failed: {message}")]
    Transform { transform: String, message: String },

    #[error("cannot set `{field}` on type `{type_name}`: the record is not editable")]
    NotEditable { field: String, type_name: String },

    #[error("field `{field}` on type `{type_name}` is read-only")]
    ReadOnlyField { field: String, type_name: String },

    #[error("invalid value for `{field}` on type `{type_name}`: {reason}")]
    InvalidValue {
        field: String,
        type_name: String,
        reason: String,
    },

    #[error("hash function `{function}` returned a malformed identity: {output}")]
    MalformedIdentity {
        function: String,
        output: serde_json::Value,
    },

    #[error("embedded array `{field}` contains identity `{identity}` more than once")]
    DuplicateEmbeddedIdentity { field: String, identity: String },

    #[error("identity conflict for {identifier:?}: {reason}")]
    IdentityConflict {
        identifier: ResourceIdentifier,
        reason: String,
    },

    #[error("unknown resource identity")]
    UnknownIdentity,

    #[error("derivation cycle detected while computing `{field}` on type `{type_name}`")]
    DerivationCycle { field: String, type_name: String },

    #[error("record for {0:?} has been destroyed")]
    RecordDestroyed(ResourceIdentifier),

    #[error("embedded value for `{0}` is no longer attached to its record")]
    DetachedEmbedded(String),

    #[error("relationship `{field}` on type `{type_name}` has no related link to reload")]
    NotLinksMode { field: String, type_name: String },

    #[error("loading failed: {0}")]
    LoadFailed(String),

    #[error("network error")]
    Network(#[source] Box<dyn std::error::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid_value(
        field: impl Into<String>,
        type_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidValue {
            field: field.into(),
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }
}
