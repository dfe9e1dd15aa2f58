use std::{
    fmt, io,
    panic::{self, AssertUnwindSafe},
    thread,
};

use emit::{platform::system_clock::SystemClock, Clock as _};

use crate::Error;

/**
The severity of a [`LogEvent`].
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /**
    Very detailed tracing.
    */
    Trace,
    /**
    Information useful while debugging.
    */
    Debug,
    /**
    Normal operation.
    */
    Info,
    /**
    Something unexpected that the application recovered from.
    */
    Warn,
    /**
    An operation failed.
    */
    Error,
    /**
    The application can't continue.
    */
    Fatal,
}

impl Level {
    /**
    The name of the level, like `Info`.
    */
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "Trace",
            Level::Debug => "Debug",
            Level::Info => "Info",
            Level::Warn => "Warn",
            Level::Error => "Error",
            Level::Fatal => "Fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/**
A log event to write to a file.

Events are immutable once submitted. Anything that depends on the submitting thread, like [`LogEvent::thread`], is captured when the event is handed to a target, so a background writer renders the producer's values rather than its own.
*/
#[derive(Debug, Clone)]
pub struct LogEvent {
    level: Level,
    logger: String,
    message: String,
    timestamp: Option<emit::Timestamp>,
    thread: Option<ThreadInfo>,
}

impl LogEvent {
    /**
    Create a new event.

    The timestamp and thread aren't captured until the event is submitted to a target.
    */
    pub fn new(level: Level, logger: impl Into<String>, message: impl Into<String>) -> Self {
        LogEvent {
            level,
            logger: logger.into(),
            message: message.into(),
            timestamp: None,
            thread: None,
        }
    }

    /**
    Use a specific timestamp instead of the time the event is submitted.
    */
    pub fn with_timestamp(mut self, timestamp: emit::Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /**
    The severity of the event.
    */
    pub fn level(&self) -> Level {
        self.level
    }

    /**
    The name of the logger that produced the event.
    */
    pub fn logger(&self) -> &str {
        &self.logger
    }

    /**
    The rendered message.
    */
    pub fn message(&self) -> &str {
        &self.message
    }

    /**
    When the event was produced.
    */
    pub fn timestamp(&self) -> Option<emit::Timestamp> {
        self.timestamp
    }

    /**
    The thread that submitted the event.
    */
    pub fn thread(&self) -> Option<&ThreadInfo> {
        self.thread.as_ref()
    }

    /**
    Capture the timestamp and thread of the caller.

    Values that have already been captured are left alone, so wrapping targets can call this on the way through without overwriting the original producer's values.
    */
    pub fn capture(&mut self) {
        if self.thread.is_none() {
            self.thread = Some(ThreadInfo::current());
        }

        if self.timestamp.is_none() {
            self.timestamp = SystemClock::new().now();
        }
    }
}

/**
The thread an event was submitted on.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    id: String,
    name: Option<String>,
}

impl ThreadInfo {
    fn current() -> Self {
        let current = thread::current();

        // `ThreadId` only exposes its value through `Debug`
        let id = format!("{:?}", current.id());
        let id = id
            .trim_start_matches("ThreadId(")
            .trim_end_matches(')')
            .to_owned();

        ThreadInfo {
            id,
            name: current.name().map(String::from),
        }
    }

    /**
    An identifier for the thread that's unique within the process.
    */
    pub fn id(&self) -> &str {
        &self.id
    }

    /**
    The name of the thread, if it has one.
    */
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/**
A function invoked exactly once with the outcome of writing a [`LogEvent`].
*/
pub type Callback = Box<dyn FnOnce(Result<(), Error>) + Send>;

/**
Create a [`Callback`] from a closure.
*/
pub fn callback(f: impl FnOnce(Result<(), Error>) + Send + 'static) -> Callback {
    Box::new(f)
}

/**
A [`Callback`] that ignores the outcome.
*/
pub fn ignore() -> Callback {
    Box::new(|_| {})
}

/**
Invoke each callback with its outcome, in order.

A callback that panics doesn't stop the ones after it from being invoked. Returns the number of callbacks that panicked.
*/
pub(crate) fn complete(
    callbacks: impl IntoIterator<Item = Callback>,
    outcomes: impl IntoIterator<Item = Result<(), Error>>,
) -> usize {
    let mut panicked = 0;

    for (callback, outcome) in callbacks.into_iter().zip(outcomes) {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
            panicked += 1;

            emit::warn!(
                rt: emit::runtime::internal(),
                "an event callback panicked; remaining callbacks will still be invoked",
            );
        }
    }

    panicked
}

/**
A buffer to render [`LogEvent`]s into before writing them to a file.
*/
pub struct FileBuf(Vec<u8>);

impl FileBuf {
    pub(crate) fn new() -> Self {
        FileBuf(Vec::new())
    }

    /**
    Push a byte onto the end of the buffer.
    */
    pub fn push(&mut self, byte: u8) {
        self.0.push(byte)
    }

    /**
    Push a slice of bytes onto the end of the buffer.
    */
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes)
    }

    pub(crate) fn ends_with(&self, bytes: &[u8]) -> bool {
        self.0.ends_with(bytes)
    }

    pub(crate) fn into_boxed_slice(self) -> Box<[u8]> {
        self.0.into_boxed_slice()
    }
}

impl io::Write for FileBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/**
A function that renders a [`LogEvent`] into its on-disk format.
*/
pub(crate) type Writer = Box<dyn Fn(&mut FileBuf, &LogEvent) -> io::Result<()> + Send + Sync>;

#[cfg(feature = "default_writer")]
pub(crate) fn default_writer(buf: &mut FileBuf, evt: &LogEvent) -> io::Result<()> {
    struct EventValue<'a>(&'a LogEvent);

    impl<'a> sval::Value for EventValue<'a> {
        fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(
            &'sval self,
            stream: &mut S,
        ) -> sval::Result {
            stream.record_begin(None, None, None, None)?;

            if let Some(ts) = self.0.timestamp {
                stream.record_value_begin(None, &sval::Label::new("ts"))?;
                sval::stream_display(&mut *stream, ts)?;
                stream.record_value_end(None, &sval::Label::new("ts"))?;
            }

            stream.record_value_begin(None, &sval::Label::new("lvl"))?;
            stream.value(self.0.level.as_str())?;
            stream.record_value_end(None, &sval::Label::new("lvl"))?;

            stream.record_value_begin(None, &sval::Label::new("logger"))?;
            stream.value(self.0.logger.as_str())?;
            stream.record_value_end(None, &sval::Label::new("logger"))?;

            stream.record_value_begin(None, &sval::Label::new("msg"))?;
            stream.value(self.0.message.as_str())?;
            stream.record_value_end(None, &sval::Label::new("msg"))?;

            if let Some(ref thread) = self.0.thread {
                stream.record_value_begin(None, &sval::Label::new("thread"))?;
                stream.value(thread.id.as_str())?;
                stream.record_value_end(None, &sval::Label::new("thread"))?;
            }

            stream.record_end(None, None, None)
        }
    }

    sval_json::stream_to_io_write(buf, EventValue(evt))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    Ok(())
}
