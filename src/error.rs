//! Library-wide error and result types, plus the error-context stack.

use std::cell::RefCell;
use std::fmt;
use std::io;

/// Result alias used throughout racpak.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the library can produce.
///
/// Error messages are kept intentionally terse; callers that need richer
/// context should consult [`Error::with_context`], which prepends the
/// scoped asset-path breadcrumbs active when the error was raised.
#[derive(Debug)]
pub enum Error {
    /// An asset attribute has the wrong type, or a required attribute is
    /// missing.
    SchemaViolation(String),
    /// A binary blob has bad magic, inconsistent sizes, or a field outside
    /// its declared range.
    FileFormatError(String),
    /// A buffer read or write exceeded its window.
    OutOfBounds,
    /// `lookup(link)` found nothing.
    NotFound(String),
    /// An asset tree was asked to create a child whose tag already exists.
    DuplicateChild(String),
    /// A file open/read/write failed.
    IOFailure(io::Error),
    /// A code path the current target game does not support.
    Unimplemented(&'static str),
    /// A magic/signature field did not match the expected value.
    BadMagic,
    /// The stream ended before all expected bytes could be read.
    UnexpectedEof,
    /// A null-terminated string had no null terminator within the buffer.
    UnterminatedName,
    /// A structural constraint was violated (message describes which one).
    Parse(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SchemaViolation(s) => write!(f, "schema violation: {s}"),
            Error::FileFormatError(s) => write!(f, "file format error: {s}"),
            Error::OutOfBounds => write!(f, "out of bounds"),
            Error::NotFound(link) => write!(f, "not found: {link}"),
            Error::DuplicateChild(tag) => write!(f, "duplicate child: {tag}"),
            Error::IOFailure(e) => write!(f, "I/O error: {e}"),
            Error::Unimplemented(s) => write!(f, "unimplemented: {s}"),
            Error::BadMagic => write!(f, "bad magic value"),
            Error::UnexpectedEof => write!(f, "unexpected end of file"),
            Error::UnterminatedName => write!(f, "unterminated string"),
            Error::Parse(s) => write!(f, "parse error: {s}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Error::IOFailure(e) = self {
            Some(e)
        } else {
            None
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IOFailure(e)
    }
}

impl Error {
    /// Render this error together with the current context stack, in the
    /// order the CLI surface prints it: outermost context first, message
    /// last.
    pub fn with_context(&self) -> String {
        let stack = context::snapshot();
        let mut out = String::new();
        for frame in &stack {
            out.push_str(frame);
            out.push('\n');
        }
        out.push_str(&self.to_string());
        out
    }
}

/// The error-context stack: a single-worker, thread-local breadcrumb trail
/// pushed by [`context::push`] and popped automatically when the returned
/// guard drops.
///
/// This is the only shared mutable state in the crate besides the dry-run
/// counters (see [`crate::level::core::CountingSink`]); both are confined
/// to the single cooperative worker the crate assumes.
pub mod context {
    use super::*;

    thread_local! {
        static STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    /// Push a context frame (e.g. `"unpacking moby class 42"`). Popped when
    /// the returned guard is dropped, including on an error unwind.
    #[must_use]
    pub fn push(frame: impl Into<String>) -> ContextGuard {
        STACK.with(|s| s.borrow_mut().push(frame.into()));
        ContextGuard { _private: () }
    }

    /// A snapshot of the current context stack, outermost frame first.
    pub fn snapshot() -> Vec<String> {
        STACK.with(|s| s.borrow().clone())
    }

    /// RAII guard returned by [`push`]; pops its frame on drop.
    pub struct ContextGuard {
        _private: (),
    }

    impl Drop for ContextGuard {
        fn drop(&mut self) {
            STACK.with(|s| {
                s.borrow_mut().pop();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_stack_unwinds_with_guards() {
        assert!(context::snapshot().is_empty());
        {
            let _a = context::push("unpacking moby class 42");
            assert_eq!(context::snapshot(), vec!["unpacking moby class 42"]);
            {
                let _b = context::push("reading packet 3");
                assert_eq!(
                    context::snapshot(),
                    vec!["unpacking moby class 42", "reading packet 3"]
                );
            }
            assert_eq!(context::snapshot(), vec!["unpacking moby class 42"]);
        }
        assert!(context::snapshot().is_empty());
    }

    #[test]
    fn with_context_renders_stack_then_message() {
        let _a = context::push("tfrag 7");
        let err = Error::FileFormatError("common_size exceeds file".into());
        let rendered = err.with_context();
        assert_eq!(
            rendered,
            "tfrag 7\nfile format error: common_size exceeds file"
        );
    }
}
