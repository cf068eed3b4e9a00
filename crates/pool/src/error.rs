//! Pool error types.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was killed; it accepts no further items.
    #[error("pool has been killed")]
    Killed,
}
