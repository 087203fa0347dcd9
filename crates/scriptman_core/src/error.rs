//! Operation-level error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OperationError {
    /// The operation expected a matching reference on the target document
    /// and found none.
    #[error("no installed reference matches {name} on {target}")]
    NotFound { name: String, target: String },

    /// A move whose destination equals the source would install nothing
    /// and then remove the only copy.
    #[error("{name} is already on {target}; nothing to move")]
    SameTarget { name: String, target: String },

    /// A move installed the script on the new page but failed to remove
    /// it from the old one, leaving copies on both.
    #[error(
        "moved to {new_target} but removal from {old_target} failed; \
         the script is now on both pages, re-run uninstall for {old_target}"
    )]
    MovePartial {
        old_target: String,
        new_target: String,
        #[source]
        source: Box<OperationError>,
    },

    /// The wiki edit service rejected a fetch or an edit. Propagated
    /// unchanged from the transport.
    #[error("transport failure")]
    Transport(#[source] anyhow::Error),
}

impl OperationError {
    pub fn not_found(name: &str, target: &str) -> Self {
        Self::NotFound {
            name: name.to_string(),
            target: target.to_string(),
        }
    }

    pub fn same_target(name: &str, target: &str) -> Self {
        Self::SameTarget {
            name: name.to_string(),
            target: target.to_string(),
        }
    }
}

pub type OperationResult<T> = Result<T, OperationError>;
