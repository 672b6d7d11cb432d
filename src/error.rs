use thiserror::Error;

/// Builds an [`Error::Malformed`] tagged with the caller's file and line.
macro_rules! malformed_error {
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// Every error the pipeline can return.
///
/// Errors at this layer are always internal: the front end has already rejected
/// malformed user programs, so anything surfacing here means the IR handed to
/// the pipeline (or produced by a pass) is corrupt. A function that produces an
/// error is abandoned; optimization non-applicability is never an error.
///
/// # Error Categories
///
/// ## IR Errors
/// - [`Error::Malformed`] - Structurally invalid IR found while walking a function
/// - [`Error::InvalidSsa`] - The SSA validator rejected a function
/// - [`Error::BlockNotFound`] - A block index does not exist in the block table
/// - [`Error::UnknownVariable`] - A variable has no type in the function's type table
///
/// ## Pipeline Errors
/// - [`Error::UnknownFunction`] - A builtin could not be resolved for the given arguments
/// - [`Error::NonTerminating`] - A removal pass rewrote an instruction without removing it
/// - [`Error::FunctionNotFound`] - The compiler context has no function of that name
///
/// # Examples
///
/// ```rust
/// use matopt::Error;
///
/// fn report(result: matopt::Result<usize>) {
///     match result {
///         Ok(changes) => println!("{} changes", changes),
///         Err(Error::InvalidSsa { function, message }) => {
///             eprintln!("{} is not valid SSA: {}", function, message);
///         }
///         Err(e) => eprintln!("pipeline failed: {}", e),
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The IR is structurally damaged.
    ///
    /// Raised from deep inside an analysis or a rewrite when an invariant the
    /// code relies on does not hold (for example a phi inside a loop header
    /// that does not reference the loop's outer block).
    ///
    /// # Fields
    ///
    /// * `message` - Description of the broken invariant
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The broken invariant
        message: String,
        /// Source file that detected it
        file: &'static str,
        /// Source line that detected it
        line: u32,
    },

    /// The SSA validator found a violated invariant.
    #[error("Invalid SSA in '{function}': {message}")]
    InvalidSsa {
        /// Name of the function that failed validation
        function: String,
        /// The violated invariant
        message: String,
    },

    /// A block index that does not exist in the function was referenced.
    #[error("Block #{0} does not exist")]
    BlockNotFound(usize),

    /// A variable was referenced that the type table does not know about.
    #[error("Variable '{0}' has no known type")]
    UnknownVariable(String),

    /// A builtin could not be resolved for the requested argument types.
    #[error("Could not resolve builtin '{0}'")]
    UnknownFunction(String),

    /// A removal pass rewrote a matched instruction but left it in place.
    ///
    /// The restart-after-change driver relies on every rewrite shrinking the
    /// set of matching instructions; this is raised instead of looping forever.
    #[error("Pass '{0}' did not remove the instruction it matched")]
    NonTerminating(&'static str),

    /// The compiler context does not contain the requested function.
    #[error("Function '{0}' not found")]
    FunctionNotFound(String),
}
