use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, covering every failure this library can return.
///
/// A managed PE image is either accepted whole or rejected whole: a format
/// violation anywhere aborts the entire read or write, and the caller never
/// sees a partially populated result. Format violations carry the path of
/// the offending field (e.g. `invalid CoffHeader.Machine`) together with the
/// source location that detected them.
#[derive(Error, Debug)]
pub enum Error {
    /// The file deviates from the managed PE binary format.
    ///
    /// This is the single error kind for every strict-equality, range or
    /// structural check in the format layer, including addresses that
    /// resolve outside every section.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the file.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// The write pipeline was driven out of order.
    ///
    /// Raised when a structure asks for an aggregate-derived value before
    /// the pass that produces it has run, or when serialization does not
    /// land on the layout the Alloc pass reserved.
    #[error("Write layout failed - {message}")]
    WriteLayoutFailed {
        /// What was inconsistent about the requested layout
        message: String,
    },
}
