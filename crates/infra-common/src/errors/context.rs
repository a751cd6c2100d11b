use crate::errors::types::Error;
use std::fmt;

/// Where an error happened: the component and the operation it was running
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: String,
    pub operation: String,
    pub details: Option<String>,
}

impl ErrorContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        ErrorContext {
            component: component.into(),
            operation: operation.into(),
            details: None,
        }
    }

    /// Add details to the context
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in component '{}' during operation '{}'", self.component, self.operation)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Extension trait for attaching an [`ErrorContext`] to an error or a failed result
pub trait ErrorExt<T> {
    fn context(self, ctx: ErrorContext) -> std::result::Result<T, Error>;

    fn with_context(
        self,
        component: impl Into<String>,
        operation: impl Into<String>,
    ) -> std::result::Result<T, Error>
    where
        Self: Sized,
    {
        self.context(ErrorContext::new(component, operation))
    }
}

impl<T> ErrorExt<T> for std::result::Result<T, Error> {
    fn context(self, ctx: ErrorContext) -> std::result::Result<T, Error> {
        self.map_err(|e| match e {
            // Keep the variant for I/O so callers can still match on it
            Error::Io(io) => Error::Io(std::io::Error::new(io.kind(), format!("{} [{}]", io, ctx))),
            other => Error::Contextual(format!("{} [{}]", other, ctx)),
        })
    }
}
