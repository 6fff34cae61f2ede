use std::{io, result, string::FromUtf8Error};

use crossbeam::channel::RecvError;
use thiserror::Error;

use crate::env;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error")]
    Io {
        #[from]
        source: env::IoError,
    },

    #[error("format error")]
    Format {
        #[from]
        source: io::Error,
    },

    #[error("incomplete: {0}")]
    Incomplete(String),

    #[error("merge in progress: {0}")]
    MergeInProgress(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("operation timed out: {0}")]
    TimedOut(String),

    #[error("shutdown in progress: {0}")]
    ShutdownInProgress(String),

    #[error("operation aborted: {0}")]
    Aborted(String),

    #[error("error receiving from channel")]
    Recv {
        #[from]
        source: RecvError,
    },

    #[error("utf8 error")]
    FromUtf8 {
        #[from]
        source: FromUtf8Error,
    },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Background errors are latched by the DB; a clone of the latched value
    /// is handed to every subsequent writer.
    pub fn clone_shallow(&self) -> Error {
        match self {
            Error::NotFound(s) => Error::NotFound(s.clone()),
            Error::Corruption(s) => Error::Corruption(s.clone()),
            Error::NotSupported(s) => Error::NotSupported(s.clone()),
            Error::InvalidArgument(s) => Error::InvalidArgument(s.clone()),
            Error::Io { source } => Error::Corruption(format!("io error: {}", source)),
            Error::Format { source } => Error::Corruption(format!("format error: {}", source)),
            Error::Incomplete(s) => Error::Incomplete(s.clone()),
            Error::MergeInProgress(s) => Error::MergeInProgress(s.clone()),
            Error::Busy(s) => Error::Busy(s.clone()),
            Error::TimedOut(s) => Error::TimedOut(s.clone()),
            Error::ShutdownInProgress(s) => Error::ShutdownInProgress(s.clone()),
            Error::Aborted(s) => Error::Aborted(s.clone()),
            Error::Recv { .. } => Error::Aborted("channel closed".into()),
            Error::FromUtf8 { .. } => Error::Corruption("invalid utf8".into()),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
