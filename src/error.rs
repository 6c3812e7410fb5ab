use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("not authorized")]
    NotAuthorized,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("not found")]
    NotFound,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::ProviderUnavailable(a), Error::ProviderUnavailable(b)) => a == b,
            (Error::StoreUnavailable(a), Error::StoreUnavailable(b)) => a == b,
            (Error::NotAuthorized, Error::NotAuthorized) => true,
            (Error::MalformedRequest(a), Error::MalformedRequest(b)) => a == b,
            (Error::Backend(a), Error::Backend(b)) => a == b,
            (Error::NotFound, Error::NotFound) => true,
            (Error::Config(a), Error::Config(b)) => a == b,
            (Error::Io(a), Error::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl From<redb::Error> for Error {
    fn from(error: redb::Error) -> Self {
        Error::StoreUnavailable(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::ProviderUnavailable(error.to_string())
    }
}

impl From<aws_sdk_s3::Error> for Error {
    fn from(error: aws_sdk_s3::Error) -> Self {
        Error::Backend(error.to_string())
    }
}

impl From<envy::Error> for Error {
    fn from(error: envy::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::Config(error.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_display_includes_detail() {
        assert_eq!(
            "identity provider unavailable: rate limited",
            Error::ProviderUnavailable("rate limited".to_string()).to_string()
        );
    }

    #[test]
    fn test_io_errors_compare_by_kind() {
        assert_eq!(
            Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)),
            Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "other"))
        );
    }
}
