use std::{
    io::{self, Write as _},
    path::Path,
};

use crate::fs::{File, Filesystem};

/**
A single open file that events are appended to.

An appender is either open, holding a handle to its file, or closed. Writing to or flushing a closed appender does nothing. Closing is idempotent, and dropping an appender always closes it.
*/
pub struct Appender {
    path: String,
    handle: Handle,
    open_time: emit::Timestamp,
    last_write_time: emit::Timestamp,
    len: u64,
}

enum Handle {
    Closed,
    Open(Box<dyn File + Send + Sync>),
}

/**
A snapshot of an [`Appender`]'s state, used to decide whether it's gone stale.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppenderInfo {
    /**
    Whether the appender still holds an open file.
    */
    pub open: bool,
    /**
    When the appender was last written to or flushed.

    This is `None` for closed appenders.
    */
    pub last_write_time: Option<emit::Timestamp>,
    /**
    The length of the file in bytes.

    This is `None` for closed appenders.
    */
    pub len: Option<u64>,
}

impl Appender {
    /**
    Open the file at `path` for appending, creating it and its parent directories if needed.
    */
    pub(crate) fn open(
        fs: impl Filesystem,
        path: &str,
        now: emit::Timestamp,
    ) -> io::Result<Appender> {
        let file_path = Path::new(path);

        if fs.is_dir(file_path) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "the path is an existing directory",
            ));
        }

        if let Some(parent) = file_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            if !fs.is_dir(parent) {
                fs.create_dir_all(parent)?;
            }
        }

        let file = fs.open_append(file_path)?;
        let len = file.len()?;

        // Sync the existence of this file to the parent directory
        // This is only important on some platforms and filesystems
        fs.sync_parent(file_path)?;

        Ok(Appender {
            path: path.to_owned(),
            handle: Handle::Open(file),
            open_time: now,
            last_write_time: now,
            len,
        })
    }

    /**
    The number of bytes in the file.

    This includes any content the file had when it was opened.
    */
    pub fn len(&self) -> u64 {
        self.len
    }

    /**
    Append `bytes` to the file.

    Writing to a closed appender does nothing.
    */
    pub fn write(&mut self, bytes: &[u8], now: emit::Timestamp) -> io::Result<()> {
        let Handle::Open(ref mut file) = self.handle else {
            return Ok(());
        };

        file.write_all(bytes)?;

        self.len += bytes.len() as u64;
        self.touch(now);

        Ok(())
    }

    /**
    Flush written bytes through to durable storage.

    Flushing a closed appender does nothing.
    */
    pub fn flush(&mut self, now: emit::Timestamp) -> io::Result<()> {
        let Handle::Open(ref mut file) = self.handle else {
            return Ok(());
        };

        file.flush()?;
        file.sync_all()?;

        self.touch(now);

        Ok(())
    }

    /**
    Release the file.

    The handle is released even if flushing it fails. Closing an already closed appender does nothing.
    */
    pub fn close(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.handle, Handle::Closed) {
            Handle::Open(mut file) => {
                emit::debug!(
                    rt: emit::runtime::internal(),
                    "closing {path}",
                    #[emit::as_debug]
                    path: self.path,
                    #[emit::as_display]
                    opened: self.open_time,
                );

                file.flush()
            }
            Handle::Closed => Ok(()),
        }
    }

    /**
    Get a snapshot of the appender's state.
    */
    pub fn info(&self) -> AppenderInfo {
        match self.handle {
            Handle::Open(_) => AppenderInfo {
                open: true,
                last_write_time: Some(self.last_write_time),
                len: Some(self.len),
            },
            Handle::Closed => AppenderInfo {
                open: false,
                last_write_time: None,
                len: None,
            },
        }
    }

    pub(crate) fn last_write_time(&self) -> emit::Timestamp {
        self.last_write_time
    }

    fn touch(&mut self, now: emit::Timestamp) {
        // The clock may jitter backwards; never let that make the file look older
        if now > self.last_write_time {
            self.last_write_time = now;
        }
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
