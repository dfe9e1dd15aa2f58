use std::fmt;

use crate::LogEvent;

/**
Resolves each [`LogEvent`] to the path of the file it should be written to.

A router may return a different path for each event, so one target can fan out to many live files. Resolution must be deterministic: the same event always resolves to the same path. Paths are compared as exact strings, so `logs/a.txt` and `./logs/a.txt` are different files as far as the target is concerned.
*/
pub struct PathRouter(Box<dyn Fn(&LogEvent) -> String + Send + Sync>);

impl PathRouter {
    /**
    Route every event to the same file.
    */
    pub fn fixed(path: impl Into<String>) -> Self {
        let path = path.into();

        PathRouter(Box::new(move |_| path.clone()))
    }

    /**
    Route events with a function.
    */
    pub fn from_fn(f: impl Fn(&LogEvent) -> String + Send + Sync + 'static) -> Self {
        PathRouter(Box::new(f))
    }

    /**
    Get the path `evt` should be written to.
    */
    pub fn resolve(&self, evt: &LogEvent) -> String {
        (self.0)(evt)
    }
}

impl<'a> From<&'a str> for PathRouter {
    fn from(path: &'a str) -> Self {
        PathRouter::fixed(path)
    }
}

impl From<String> for PathRouter {
    fn from(path: String) -> Self {
        PathRouter::fixed(path)
    }
}

impl fmt::Debug for PathRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathRouter").finish_non_exhaustive()
    }
}
