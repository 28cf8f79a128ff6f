use crate::k8s::cache::CacheError;
use derive_more::From;
use k8s_openapi::serde_json;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Kubeconfig(kube::config::KubeconfigError),

    #[from]
    HttpHeader(hyper::http::Error),

    #[from]
    Io(std::io::Error),

    #[from]
    Cache(CacheError),

    /// Custom error message
    Custom(String),
}

impl Error {
    /// HTTP status code reported by the API server, if this error carries one
    #[must_use]
    pub fn api_status(&self) -> Option<u16> {
        match self {
            Self::Kube(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Kube(kube::Error::Api(response)) => write!(
                fmt,
                "api server returned {} {}: {}",
                response.code, response.reason, response.message
            ),
            Self::Cache(e) => write!(fmt, "{e}"),
            Self::Custom(message) => fmt.write_str(message),
            _ => write!(fmt, "{self:?}"),
        }
    }
}

impl std::error::Error for Error {}
