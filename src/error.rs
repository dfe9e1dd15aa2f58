use std::{error, fmt, io, sync::Arc};

/**
An error writing events to a file.

Errors are cheap to clone: when a group of events addressed to the same file fails, each event's callback receives the same error.
*/
#[derive(Clone)]
pub struct Error(Arc<Inner>);

struct Inner {
    kind: ErrorKind,
    path: Option<String>,
    source: Box<dyn error::Error + Send + Sync>,
}

/**
The operation that produced an [`Error`].
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /**
    A file couldn't be opened or created.

    This includes paths that denote an existing directory.
    */
    Open,
    /**
    Writing or flushing an open file failed.
    */
    Write,
    /**
    Moving a full file into its archive failed.

    The file that should have been archived is left in place.
    */
    Rotate,
    /**
    The event couldn't be rendered into bytes.
    */
    Render,
    /**
    The event was rejected by a full background queue.
    */
    Discarded,
    /**
    The target was closed before the event could be written.
    */
    Closed,
    /**
    The target is misconfigured.
    */
    Config,
}

impl Error {
    pub(crate) fn new(
        kind: ErrorKind,
        path: Option<&str>,
        e: impl Into<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error(Arc::new(Inner {
            kind,
            path: path.map(String::from),
            source: e.into(),
        }))
    }

    pub(crate) fn open(path: &str, e: io::Error) -> Self {
        Error::new(ErrorKind::Open, Some(path), e)
    }

    pub(crate) fn write(path: &str, e: io::Error) -> Self {
        Error::new(ErrorKind::Write, Some(path), e)
    }

    pub(crate) fn rotate(path: &str, e: io::Error) -> Self {
        Error::new(ErrorKind::Rotate, Some(path), e)
    }

    pub(crate) fn config(e: impl Into<Box<dyn error::Error + Send + Sync>>) -> Self {
        Error::new(ErrorKind::Config, None, e)
    }

    /**
    The kind of operation that failed.
    */
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /**
    The resolved path of the file the error applies to, if there is one.
    */
    pub fn path(&self) -> Option<&str> {
        self.0.path.as_deref()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.0.kind)
            .field("path", &self.0.path)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.0.kind {
            ErrorKind::Open => "failed to open",
            ErrorKind::Write => "failed to write",
            ErrorKind::Rotate => "failed to archive",
            ErrorKind::Render => "failed to render event",
            ErrorKind::Discarded => "event discarded",
            ErrorKind::Closed => "target closed",
            ErrorKind::Config => "invalid configuration",
        };

        match self.0.path {
            Some(ref path) => write!(f, "{op} {path:?}: {}", self.0.source),
            None => write!(f, "{op}: {}", self.0.source),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&*self.0.source)
    }
}
