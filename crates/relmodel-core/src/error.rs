//! Error types for relmodel operations.
//!
//! Every error here is a programmer or schema error surfaced synchronously,
//! except [`QueryError`] and [`TransactionError`], which carry whatever the
//! external executor reported.

use std::fmt;

/// The primary error type for all relmodel operations.
#[derive(Debug)]
pub enum Error {
    /// Schema definition errors, raised while building the registry
    Definition(DefinitionError),
    /// Association resolution, compilation and access errors
    Association(AssociationError),
    /// Record lifecycle errors
    Persistence(PersistenceError),
    /// Errors reported by the executor while running a statement
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// A hook rejected the record
    Validation(ValidationError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message (hooks use this to abort an operation)
    Custom(String),
}

#[derive(Debug)]
pub struct DefinitionError {
    pub kind: DefinitionErrorKind,
    pub model: String,
    pub association: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionErrorKind {
    /// A declared foreign key does not exist on the table it must live on
    ExplicitForeignKeyInvalid,
    /// The conventional foreign key does not exist; declare one explicitly
    InvalidComputedForeignKey,
    /// `dependent: Destroy` combined with a required or passthrough filter
    DependentDestroyWithParameterizedWhere,
    /// A model was defined without a global name
    MissingGlobalName,
    /// Two models share a global name
    DuplicateModel,
    /// Two associations share a name on one model
    DuplicateAssociation,
    /// An association or STI parent references an unregistered model
    UnknownModel,
    /// A column referenced by a definition does not exist
    UnknownColumn,
    /// A plan selected a scope the model does not declare
    UnknownScope,
    /// An STI child whose parent is missing or not on the same table
    InvalidStiParent,
}

#[derive(Debug)]
pub struct AssociationError {
    pub kind: AssociationErrorKind,
    pub model: String,
    pub association: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationErrorKind {
    /// The association name is not declared on the model
    MissingAssociation,
    /// The `through` association is not declared on the owner
    MissingThroughAssociation,
    /// The `source` association is not declared on the intermediate model
    MissingThroughAssociationSource,
    /// A through chain attempted to cross a polymorphic edge
    CannotAssociateThroughPolymorphic,
    /// A single primary key was requested from a polymorphic target set
    CannotDerivePrimaryKeyFromPolymorphic,
    /// A polymorphic BelongsTo was joined without narrowing its discriminator
    CannotJoinPolymorphicBelongsTo,
    /// A `Required` association filter was never supplied by the caller
    MissingRequiredAssociationWhereClause,
    /// A `Passthrough` association filter has no passthrough value
    MissingPassthroughData,
    /// An association slot was read before it was loaded
    NotLoadedAssociation,
    /// A hydrated collection was mutated after it was frozen
    FrozenCollection,
    /// A non-optional BelongsTo was given no target
    RequiredBelongsTo,
}

#[derive(Debug)]
pub struct PersistenceError {
    pub kind: PersistenceErrorKind,
    pub model: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceErrorKind {
    /// No row matched the lookup
    RecordNotFound,
    /// `undestroy` on a model without a soft-delete column
    UndestroyNonSoftDelete,
    /// `reload` on a record that was never saved
    ReloadUnpersisted,
    /// An operation that needs a primary key was given an unsaved record
    Unpersisted,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Already committed or rolled back
    Finalized,
    /// The executor refused to open a transaction
    Begin,
}

/// A record rejected by a lifecycle hook.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub model: String,
    /// The offending attribute, or `None` for record-level failures
    pub field: Option<String>,
    pub message: String,
}

impl Error {
    /// Build a definition error.
    pub fn definition(
        kind: DefinitionErrorKind,
        model: impl Into<String>,
        association: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Definition(DefinitionError {
            kind,
            model: model.into(),
            association: association.map(str::to_string),
            message: message.into(),
        })
    }

    /// Build an association error.
    pub fn association(
        kind: AssociationErrorKind,
        model: impl Into<String>,
        association: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Association(AssociationError {
            kind,
            model: model.into(),
            association: association.into(),
            message: message.into(),
        })
    }

    /// Build a persistence error.
    pub fn persistence(
        kind: PersistenceErrorKind,
        model: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Persistence(PersistenceError {
            kind,
            model: model.into(),
            message: message.into(),
        })
    }

    /// The definition error kind, if this is a definition error.
    pub fn definition_kind(&self) -> Option<DefinitionErrorKind> {
        match self {
            Error::Definition(e) => Some(e.kind),
            _ => None,
        }
    }

    /// The association error kind, if this is an association error.
    pub fn association_kind(&self) -> Option<AssociationErrorKind> {
        match self {
            Error::Association(e) => Some(e.kind),
            _ => None,
        }
    }

    /// The persistence error kind, if this is a persistence error.
    pub fn persistence_kind(&self) -> Option<PersistenceErrorKind> {
        match self {
            Error::Persistence(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Is this a unique constraint violation reported by the executor?
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Query(q) => q.is_unique_violation(),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Definition(e) => write!(f, "Definition error: {}", e),
            Error::Association(e) => write!(f, "Association error: {}", e),
            Error::Persistence(e) => write!(f, "Persistence error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.association {
            Some(assoc) => write!(f, "{}.{}: {}", self.model, assoc, self.message),
            None => write!(f, "{}: {}", self.model, self.message),
        }
    }
}

impl fmt::Display for AssociationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.model, self.association, self.message)
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.model, self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{}: {}", self.model, field, self.message),
            None => write!(f, "{}: {}", self.model, self.message),
        }
    }
}

impl From<DefinitionError> for Error {
    fn from(err: DefinitionError) -> Self {
        Error::Definition(err)
    }
}

impl From<AssociationError> for Error {
    fn from(err: AssociationError) -> Self {
        Error::Association(err)
    }
}

impl From<PersistenceError> for Error {
    fn from(err: PersistenceError) -> Self {
        Error::Persistence(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for relmodel operations.
pub type Result<T> = std::result::Result<T, Error>;
