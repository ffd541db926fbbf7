use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("'{}' not found", name))]
    NotFound { name: String },

    #[snafu(display(
        "Version conflict for '{}': expected version {}, got {}",
        name,
        expected,
        got
    ))]
    Conflict {
        name: String,
        expected: u64,
        got: u64,
    },

    #[snafu(display("Upstream refresh timed out after {:?}", timeout))]
    Timeout { timeout: std::time::Duration },

    #[snafu(display("Session '{}' already has an in-flight transaction", id))]
    SessionBusy { id: String },

    #[snafu(display("No active session '{}'", id))]
    NoSuchSession { id: String },

    #[snafu(display("I/O error on '{}': {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{}", source))]
    Codec { source: repo_mirror_schema::Error },

    #[snafu(display("{}", source))]
    Signing { source: repo_mirror_signer::Error },

    #[snafu(display("Upstream client failed: {}", message))]
    Upstream { message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// `read`/`stat` fall through to the live mirror; a missing file there is `NotFound`,
/// anything else is `Io`.
pub(crate) fn not_found_or_io(name: &str, path: &std::path::Path, source: std::io::Error) -> Error {
    if source.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound {
            name: name.to_string(),
        }
    } else {
        Error::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
