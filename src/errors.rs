use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

// -------------------------------------------------------------------------------------------------
// Error
// -------------------------------------------------------------------------------------------------
/// The failure taxonomy of the engine.
///
/// Configuration problems (bad option values, impossible item graphs, requests
/// for disabled items) are distinguished from runtime failures so the
/// command-line driver can exit with the conventional status for each class.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad option values, unknown analysis flags, requests for disabled items.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An item requires a bag key that no selected item provides.
    #[error("item `{item}` requires `{key}`, which nothing selected provides")]
    UnsatisfiedDependency { item: String, key: String },

    /// The selected items form a dependency cycle.
    #[error("cyclic dependency between analysis items, involving `{0}`")]
    CyclicDependency(String),

    /// The VCS layer failed to open or read the repository.
    #[error("repository error: {0}")]
    Repository(#[from] git2::Error),

    /// A blob referenced by a tree change could not be materialised.
    #[error("cannot materialise blob {blob} at `{path}`: {reason}")]
    Blob {
        blob: String,
        path: String,
        reason: String,
    },

    /// An item's consume step returned an error; this aborts the run.
    #[error("item `{item}` failed on commit {commit}: {reason}")]
    ItemFailure {
        item: String,
        commit: String,
        reason: String,
    },

    /// Spilling or restoring branch state failed.
    #[error("hibernation failed on branch {branch}: {reason}")]
    Hibernation { branch: u32, reason: String },

    /// The external cancellation token was tripped.
    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit status for this failure: 2 for configuration errors,
    /// 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidConfig(_)
            | Error::UnsatisfiedDependency { .. }
            | Error::CyclicDependency(_) => 2,
            _ => 1,
        }
    }

    /// Shorthand for an `InvalidConfig` with a formatted message.
    pub fn config<S: Into<String>>(msg: S) -> Error {
        Error::InvalidConfig(msg.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exit_codes() {
        assert_eq!(Error::config("nope").exit_code(), 2);
        assert_eq!(
            Error::UnsatisfiedDependency {
                item: "burndown".into(),
                key: "line_changes".into(),
            }
            .exit_code(),
            2
        );
        assert_eq!(Error::CyclicDependency("a".into()).exit_code(), 2);
        assert_eq!(Error::Cancelled.exit_code(), 1);
        assert_eq!(
            Error::Hibernation {
                branch: 3,
                reason: "short read".into()
            }
            .exit_code(),
            1
        );
    }
}
