use crate::crd::Reason;

/// Unifies every origin of failure the reconcilers can hit. Never crosses the
/// wire directly — `status.reason` carries a [`Reason`] instead, set by
/// whichever call site maps one of these into the status.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("invalid defaults document: {0}")]
    Defaults(String),

    #[error("pod synthesis failed: {0}")]
    Build(String),

    #[error("worker rpc failed: {source}")]
    Grpc {
        #[from]
        source: tonic::Status,
    },

    #[error("worker rpc transport error: {source}")]
    Transport {
        #[from]
        source: tonic::transport::Error,
    },

    #[error("failed to parse YAML: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },
}

impl Error {
    /// Best-effort mapping onto a `status.reason` tag for errors that
    /// terminate a `LoadTest` outright (§7). Transient Kubernetes errors are
    /// handled by the caller via requeue, not this mapping.
    pub fn as_reason(&self) -> Reason {
        match self {
            Error::Kube { .. } => Reason::KubernetesError,
            Error::Defaults(_) => Reason::FailedSettingDefaults,
            Error::Build(_) => Reason::PoolError,
            Error::Grpc { .. } | Error::Transport { .. } => Reason::KubernetesError,
            Error::Yaml { .. } => Reason::FailedSettingDefaults,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
