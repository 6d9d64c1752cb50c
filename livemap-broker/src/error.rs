use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The dispatch task has exited (shutdown or dropped).
    #[error("broker is closed")]
    Closed,
}
