use thiserror::Error;
use tonic::Status;

/// Ways a relayed call can fail.
///
/// Every variant converts into the [`Status`] the inbound caller observes.
/// Variants that wrap a status produced by the director, the backend or the
/// transport hand it through untouched; only failures that originate in the
/// relay itself are reworded.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The inbound call carries no method name.
    #[error("unable to determine the method of the inbound call")]
    MissingMethod,
    /// The director refused the call.
    #[error("routing failed: {}", .0.message())]
    Routing(Status),
    /// The director accepted the call but supplied no backend connection.
    #[error("target connection is nil")]
    NoBackend,
    /// The outbound call could not be opened on the backend.
    #[error("failed to open outbound stream: {}", .0.message())]
    Open(Status),
    /// Reading from the caller or writing to the backend failed.
    #[error("failed proxying inbound to outbound: {}", .0.message())]
    Inbound(Status),
    /// The backend ended the call with an error, or writing to the caller failed.
    #[error("outbound stream failed: {}", .0.message())]
    Outbound(Status),
    /// The backend's response header could not be read or delivered.
    #[error("failed to propagate response header: {}", .0.message())]
    Header(Status),
    /// The relay reached a state its control flow should never reach.
    #[error("{0}")]
    Invariant(&'static str),
}

impl RelayError {
    /// Short label used for the `outcome` metric dimension.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::MissingMethod => "missing_method",
            Self::Routing(_) => "routing",
            Self::NoBackend => "no_backend",
            Self::Open(_) => "open",
            Self::Inbound(_) => "inbound",
            Self::Outbound(_) => "outbound",
            Self::Header(_) => "header",
            Self::Invariant(_) => "invariant",
        }
    }
}

impl From<RelayError> for Status {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Routing(status)
            | RelayError::Open(status)
            | RelayError::Outbound(status)
            | RelayError::Header(status) => status,
            RelayError::NoBackend => Status::unavailable(err.to_string()),
            RelayError::MissingMethod | RelayError::Inbound(_) | RelayError::Invariant(_) => {
                Status::internal(err.to_string())
            }
        }
    }
}

/// Errors raised while assembling or running the proxy server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A backend endpoint could not be parsed or configured.
    #[error("invalid backend endpoint: {0}")]
    Endpoint(#[from] tonic::transport::Error),
    /// A service or method name cannot be registered as a route.
    #[error("invalid route name {0:?}")]
    InvalidName(String),
    /// Configuration rejected during startup.
    #[error("configuration error: {0}")]
    Config(String),
}
