use tenex_domain::error::Error;

/// Convert a [`reqwest::Error`] into the domain [`Error`] type. The
/// runtime enforces its own call timeouts; transport-level timeouts
/// surface as HTTP errors here.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    Error::Http(e.to_string())
}
