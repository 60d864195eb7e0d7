//! Error taxonomy for the monitor.
//!
//! Every failure is sorted into one of four classes at each fan-in point:
//! a clean shutdown, a quiet end of one controller's monitoring, a transient
//! controller fault that is retried, or a fatal fault that brings the fleet
//! supervisor down.

use thiserror::Error;

use crate::api::ApiError;
use crate::store::StoreError;

#[derive(Debug, Clone, Error)]
pub enum MonitorError {
    /// The controller record no longer exists.
    #[error("controller removed")]
    ControllerRemoved,
    /// Another agent holds the monitor lease.
    #[error("{0}")]
    LeaseUnavailable(String),
    /// The controller could not be reached.
    #[error("cannot connect to API: {0}")]
    ApiConnection(String),
    /// Shutdown was requested.
    #[error("monitor is shutting down")]
    Dying,
    /// A worker task ended without reporting a result.
    #[error("worker {0} exited unexpectedly")]
    WorkerLost(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Api(ApiError),
    #[error("{note}: {source}")]
    Noted {
        note: String,
        #[source]
        source: Box<MonitorError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Dying,
    MonitoringStopped,
    Transient,
    Fatal,
}

impl MonitorError {
    /// Wraps the error with context, keeping its class.
    pub fn note(self, note: impl Into<String>) -> Self {
        MonitorError::Noted {
            note: note.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all notes stripped.
    pub fn cause(&self) -> &MonitorError {
        match self {
            MonitorError::Noted { source, .. } => source.cause(),
            other => other,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.cause() {
            MonitorError::Dying => ErrorClass::Dying,
            MonitorError::ControllerRemoved | MonitorError::LeaseUnavailable(_) => {
                ErrorClass::MonitoringStopped
            }
            MonitorError::ApiConnection(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    /// True for lost leases and removed controllers.
    pub fn is_monitoring_stopped(&self) -> bool {
        self.class() == ErrorClass::MonitoringStopped
    }

    pub fn is_dying(&self) -> bool {
        self.class() == ErrorClass::Dying
    }
}

impl From<StoreError> for MonitorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LeaseUnavailable { .. } => MonitorError::LeaseUnavailable(err.to_string()),
            other => MonitorError::Store(other),
        }
    }
}

impl From<ApiError> for MonitorError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::ConnectionFailed(msg) => MonitorError::ApiConnection(msg),
            other => MonitorError::Api(other),
        }
    }
}

/// Translates a worker's exit into the status its parent acts on: clean
/// shutdown and stopped monitoring both become `Ok`.
pub fn quiet_exit(result: Result<(), MonitorError>) -> Result<(), MonitorError> {
    match result {
        Err(e) if e.is_dying() || e.is_monitoring_stopped() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_keep_the_class_of_the_cause() {
        let err = MonitorError::ControllerRemoved
            .note("cannot renew lease on bob/ctl")
            .note("lease updater");
        assert_eq!(err.class(), ErrorClass::MonitoringStopped);
        assert!(matches!(err.cause(), MonitorError::ControllerRemoved));
        assert_eq!(
            err.to_string(),
            "lease updater: cannot renew lease on bob/ctl: controller removed"
        );
    }

    #[test]
    fn store_and_api_errors_are_classified() {
        let lease: MonitorError = StoreError::LeaseUnavailable {
            owner: "a2".into(),
            expiry: None,
        }
        .into();
        assert!(lease.is_monitoring_stopped());

        let backend: MonitorError = StoreError::Backend("gone".into()).into();
        assert_eq!(backend.class(), ErrorClass::Fatal);

        let conn: MonitorError = ApiError::ConnectionFailed("refused".into()).into();
        assert_eq!(conn.class(), ErrorClass::Transient);

        let other: MonitorError = ApiError::Other("bad".into()).into();
        assert_eq!(other.class(), ErrorClass::Fatal);
    }

    #[test]
    fn quiet_exit_hides_expected_endings_only() {
        assert!(quiet_exit(Err(MonitorError::Dying)).is_ok());
        assert!(quiet_exit(Err(MonitorError::LeaseUnavailable("x".into()))).is_ok());
        assert!(quiet_exit(Err(MonitorError::ApiConnection("x".into()))).is_err());
        assert!(quiet_exit(Err(StoreError::NotFound.into())).is_err());
    }
}
