//! Monitor lease acquisition and renewal.
//!
//! The lease lives in two fields of the controller record. Every change is a
//! compare-and-swap against the `(expiry, owner)` pair the caller last saw,
//! so the lease stays exclusive across independent agent processes without
//! any in-process locking.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::clock::{Clock, SharedClock, add_duration};
use crate::error::MonitorError;
use crate::record::EntityPath;
use crate::settings::MonitorParams;
use crate::shutdown::Shutdown;
use crate::store::{SharedStore, Store, StoreError};

/// Maps a store error on a controller-level operation, turning a missing
/// controller into [`MonitorError::ControllerRemoved`].
pub(crate) fn controller_error(err: StoreError) -> MonitorError {
    match err {
        StoreError::NotFound => MonitorError::ControllerRemoved,
        other => other.into(),
    }
}

/// Swaps the lease from `(old_expiry, old_owner)` to `(new_expiry, new_owner)`.
/// An empty `new_owner` releases it.
///
/// Fails with `LeaseUnavailable` when the stored lease is not the expected
/// one and with `ControllerRemoved` when the controller is gone.
pub async fn acquire_or_renew(
    store: &dyn Store,
    path: &EntityPath,
    old_expiry: Option<DateTime<Utc>>,
    old_owner: &str,
    new_expiry: DateTime<Utc>,
    new_owner: &str,
) -> Result<Option<DateTime<Utc>>, MonitorError> {
    store
        .acquire_monitor_lease(path, old_expiry, old_owner, Some(new_expiry), new_owner)
        .await
        .map_err(controller_error)
}

/// Like [`acquire_or_renew`] but always asks for a lease lasting
/// `lease_expiry` from now.
pub async fn acquire_lease(
    store: &dyn Store,
    clock: &dyn Clock,
    lease_expiry: Duration,
    path: &EntityPath,
    old_expiry: Option<DateTime<Utc>>,
    old_owner: &str,
    new_owner: &str,
) -> Result<Option<DateTime<Utc>>, MonitorError> {
    let new_expiry = add_duration(clock.now(), lease_expiry);
    acquire_or_renew(store, path, old_expiry, old_owner, new_expiry, new_owner).await
}

/// Keeps a held lease alive until shutdown, then drops it.
pub struct LeaseUpdater {
    store: SharedStore,
    clock: SharedClock,
    path: EntityPath,
    owner: String,
    expiry: Option<DateTime<Utc>>,
    params: MonitorParams,
}

impl LeaseUpdater {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        path: EntityPath,
        owner: String,
        expiry: Option<DateTime<Utc>>,
        params: MonitorParams,
    ) -> Self {
        Self {
            store,
            clock,
            path,
            owner,
            expiry,
            params,
        }
    }

    /// Expiry of the lease as last written.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }

    /// Renews the lease a quarter of the lease duration before it expires.
    ///
    /// Returns `Dying` after releasing the lease on shutdown. Losing the
    /// lease or the controller ends the loop with a monitoring-stopped error.
    pub async fn run(mut self, shutdown: Shutdown) -> Result<(), MonitorError> {
        loop {
            let renew_at = match self.expiry {
                Some(expiry) => expiry - self.params.renew_margin(),
                None => self.clock.now(),
            };
            tokio::select! {
                _ = self.clock.sleep_until(renew_at) => {}
                _ = shutdown.wait() => {
                    // Drop the lease so another agent can take over without
                    // waiting for it to expire.
                    self.renew(false)
                        .await
                        .map_err(|e| e.note("cannot drop lease"))?;
                    return Err(MonitorError::Dying);
                }
            }
            self.renew(true)
                .await
                .map_err(|e| e.note(format!("cannot renew lease on {}", self.path)))?;
        }
    }

    async fn renew(&mut self, hold: bool) -> Result<(), MonitorError> {
        let new_owner = if hold { self.owner.as_str() } else { "" };
        match acquire_lease(
            self.store.as_ref(),
            self.clock.as_ref(),
            self.params.lease_expiry,
            &self.path,
            self.expiry,
            &self.owner,
            new_owner,
        )
        .await
        {
            Ok(expiry) => {
                debug!(controller = %self.path, new_expiry = ?expiry, "lease updated");
                self.expiry = expiry;
                Ok(())
            }
            Err(e) => {
                info!(controller = %self.path, error = %e, "acquire lease failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::record::Controller;
    use crate::store::MemoryStore;
    use chrono::TimeDelta;

    fn path() -> EntityPath {
        EntityPath::new("bob", "ctl")
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_600_000_000, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_maps_missing_controller_to_removed() {
        let store = MemoryStore::new();
        let clock = VirtualClock::new(epoch());
        let err = acquire_lease(
            &store,
            &clock,
            Duration::from_secs(60),
            &path(),
            None,
            "",
            "a1",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MonitorError::ControllerRemoved));
        assert!(err.is_monitoring_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_acquire_does_not_touch_the_lease() {
        let store = MemoryStore::new();
        store
            .insert_controller(Controller::new(path(), "uuid"))
            .await;
        let clock = VirtualClock::new(epoch());
        let got = acquire_lease(&store, &clock, Duration::from_secs(60), &path(), None, "", "a1")
            .await
            .unwrap();
        assert_eq!(got, Some(epoch() + TimeDelta::seconds(60)));

        let err = acquire_lease(&store, &clock, Duration::from_secs(60), &path(), None, "", "a2")
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::LeaseUnavailable(_)));
        let ctl = store.get_controller(&path()).await.unwrap();
        assert_eq!(ctl.lease_owner, "a1");
        assert_eq!(ctl.lease_expiry, got);
    }

    #[tokio::test(start_paused = true)]
    async fn updater_renews_at_three_quarters_and_releases_on_shutdown() {
        let store = MemoryStore::new_arc();
        store
            .insert_controller(Controller::new(path(), "uuid"))
            .await;
        let clock = VirtualClock::new_arc(epoch());
        let params = MonitorParams::default();
        let expiry = acquire_lease(
            store.as_ref(),
            clock.as_ref(),
            params.lease_expiry,
            &path(),
            None,
            "",
            "a1",
        )
        .await
        .unwrap();

        let updater = LeaseUpdater::new(
            store.clone(),
            clock.clone(),
            path(),
            "a1".into(),
            expiry,
            params,
        );
        let shutdown = Shutdown::new();
        let task = tokio::spawn(updater.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(44)).await;
        let ctl = store.get_controller(&path()).await.unwrap();
        assert_eq!(ctl.lease_expiry, expiry, "renewed too early");

        tokio::time::sleep(Duration::from_secs(2)).await;
        let ctl = store.get_controller(&path()).await.unwrap();
        assert_eq!(ctl.lease_owner, "a1");
        assert_eq!(
            ctl.lease_expiry,
            Some(epoch() + TimeDelta::seconds(45 + 60)),
            "renewed at 45s"
        );

        shutdown.trigger();
        let res = task.await.unwrap();
        assert!(matches!(res, Err(MonitorError::Dying)));
        let ctl = store.get_controller(&path()).await.unwrap();
        assert_eq!(ctl.lease_owner, "");
        assert_eq!(ctl.lease_expiry, None);
    }

    #[tokio::test(start_paused = true)]
    async fn updater_stops_quietly_when_lease_is_stolen() {
        let store = MemoryStore::new_arc();
        store
            .insert_controller(Controller::new(path(), "uuid"))
            .await;
        let clock = VirtualClock::new_arc(epoch());
        let params = MonitorParams::default();
        let expiry = acquire_lease(
            store.as_ref(),
            clock.as_ref(),
            params.lease_expiry,
            &path(),
            None,
            "",
            "a1",
        )
        .await
        .unwrap();
        // Someone else takes the lease behind our back.
        store
            .acquire_monitor_lease(&path(), expiry, "a1", expiry, "a2")
            .await
            .unwrap();

        let updater = LeaseUpdater::new(store.clone(), clock, path(), "a1".into(), expiry, params);
        let err = updater.run(Shutdown::new()).await.unwrap_err();
        assert!(err.is_monitoring_stopped(), "got {err}");
        assert!(err.to_string().starts_with("cannot renew lease on bob/ctl"));
        assert_eq!(store.get_controller(&path()).await.unwrap().lease_owner, "a2");
    }

    #[tokio::test(start_paused = true)]
    async fn updater_reports_removed_controller() {
        let store = MemoryStore::new_arc();
        store
            .insert_controller(Controller::new(path(), "uuid"))
            .await;
        let clock = VirtualClock::new_arc(epoch());
        let params = MonitorParams::default();
        let expiry = acquire_lease(
            store.as_ref(),
            clock.as_ref(),
            params.lease_expiry,
            &path(),
            None,
            "",
            "a1",
        )
        .await
        .unwrap();
        store.remove_controller(&path()).await;

        let updater = LeaseUpdater::new(
            store.clone(),
            clock,
            path(),
            "a1".into(),
            expiry,
            params,
        );
        let err = updater.run(Shutdown::new()).await.unwrap_err();
        assert!(matches!(err.cause(), MonitorError::ControllerRemoved));
    }
}
