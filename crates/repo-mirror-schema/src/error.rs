use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to canonical-JSON encode manifest: {}", source))]
    Encode { source: serde_json::Error },

    #[snafu(display("Failed to decode canonical-JSON manifest: {}", source))]
    Decode { source: serde_json::Error },

    #[snafu(display("Key has no 'public' entry in its value map"))]
    MissingPublicValue,
}
