use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to encode/derive key ID: {}", source))]
    Encode { source: repo_mirror_schema::Error },

    #[snafu(display("Unsupported signing scheme: {}", scheme))]
    UnsupportedScheme { scheme: String },

    #[snafu(display("Key has no 'private' entry in its value map"))]
    MissingPrivate,

    #[snafu(display("Key has no 'public' entry in its value map"))]
    MissingPublic,

    #[snafu(display("Key material is not valid PKCS#8 for its declared scheme"))]
    MalformedKey,

    #[snafu(display("Public key material is malformed for its declared scheme"))]
    MalformedPublicKey,

    #[snafu(display("Signing operation failed"))]
    Sign,

    #[snafu(display("Signature does not verify against the declared key"))]
    Verify,

    #[snafu(display("Failed to open key file '{}': {}", path.display(), source))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse key file '{}': {}", path.display(), source))]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Key file '{}' has no private key material", path.display()))]
    NotAPrivateKey { path: PathBuf },
}
