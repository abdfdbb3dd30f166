#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("pattern already exists")]
    PatternAlreadyExists,
    #[error("connection already exists")]
    ConnectionAlreadyExists,
    #[error("connection does not exist")]
    ConnectionNotFound,
    #[error("binding not allowed")]
    BindingNotAllowed,
    #[error("binding already exists")]
    BindingAlreadyExists,
    #[error("binding does not exist")]
    BindingNotFound,
    #[error("upstream is closed")]
    UpstreamClosed,
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
