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

/// The error type covering everything this library can return.
///
/// Failures in this crate are deliberately rare at the API boundary: the detector is loaded
/// into arbitrary host processes, so almost every internal problem is converted into a report
/// line and a degraded mode rather than an error. The variants below cover the cases where a
/// caller can meaningfully react — unparsable images, missing instrumentation patterns, and
/// plain I/O failures while writing the report.
///
/// # Error Categories
///
/// ## Image Parsing Errors
/// - [`Error::Malformed`] - Corrupted or invalid image structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the mapped image
/// - [`Error::NotSupported`] - Unsupported image format or architecture
///
/// ## Instrumentation Errors
/// - [`Error::PatternNotFound`] - Loader-hook instruction signature not present
/// - [`Error::NotInstalled`] - Restore requested for a patch that was never applied
///
/// ## I/O and External Errors
/// - [`Error::FileError`] - Filesystem I/O errors from the report sink
#[derive(Error, Debug)]
pub enum Error {
    /// A module's mapped image does not conform to the expected PE layout.
    ///
    /// Carries the detector source location where the malformation was
    /// noticed, since these reports usually arrive second-hand from a log.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// What was malformed
        message: String,
        /// Detector source file that rejected the image
        file: &'static str,
        /// Detector source line that rejected the image
        line: u32,
    },

    /// An out of bound access was attempted while walking a mapped image.
    ///
    /// This error occurs when an RVA or directory entry points outside the
    /// module's address range. It's a safety check to prevent reads beyond the
    /// mapped region while walking import tables.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This image type is not supported.
    ///
    /// Indicates that a module is not a PE image of a supported architecture,
    /// or uses features the patch engine does not handle.
    #[error("This image type is not supported")]
    NotSupported,

    /// The expected instruction pattern could not be located.
    ///
    /// The loader hook scans a short window of machine code for the parameter
    /// load and call-site signatures. When the window does not match (a new OS
    /// build, an unexpected binary layout), the hook is skipped and detection
    /// degrades gracefully; this error reports which pattern was missing.
    #[error("Instruction pattern not found: {0}")]
    PatternNotFound(&'static str),

    /// Restore was requested for a patch that never completed.
    ///
    /// Detour and import-table restoration only succeed after a matching,
    /// successful installation.
    #[error("No patch is installed")]
    NotInstalled,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur while opening or writing the
    /// report file.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    ///
    /// Used for errors that don't fit into other categories or for wrapping
    /// external failures with additional context.
    #[error("{0}")]
    Error(String),
}
