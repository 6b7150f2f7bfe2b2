use nodepool_ingress_templates::RenderError;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_already_exists(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_already_exists(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists" => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AddonError {
    /// A referenced object could not be found.
    #[error("{0}")]
    LookupFailure(String),
    /// Create of an object which is already present, only raised if existing
    /// objects are not adopted.
    #[error("{0}")]
    AlreadyExists(String),
    /// Manifest could not be rendered from its template.
    #[error("{0}")]
    Render(#[from] RenderError),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Deleted objects did not disappear in time, so they were not recreated.
    #[error("{0}")]
    RecreateTimeout(String),
    /// A step of a multi-step operation failed, `completed` steps before it succeeded.
    #[error("step {completed} ({step}) failed: {source}")]
    Sequence {
        completed: usize,
        step: String,
        #[source]
        source: Box<AddonError>,
    },
}

impl AddonError {
    /// The error of the failing step, unwrapping [`AddonError::Sequence`].
    pub(crate) fn root(&self) -> &AddonError {
        match self {
            AddonError::Sequence { source, .. } => source.root(),
            e => e,
        }
    }

    /// Number of steps which completed before the failure, `None` if the error was
    /// not raised by a multi-step operation.
    pub(crate) fn completed_steps(&self) -> Option<usize> {
        match self {
            AddonError::Sequence { completed, .. } => Some(*completed),
            _ => None,
        }
    }

    pub(crate) fn is_not_found(&self) -> bool {
        match self.root() {
            AddonError::LookupFailure(_) => true,
            AddonError::KubeApi(e) => e.is_not_found(),
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}
