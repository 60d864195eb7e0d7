mod test_helpers;

use std::time::Duration;

use fleetmon::error::MonitorError;
use fleetmon::fleet::FleetSupervisor;
use fleetmon::lease::acquire_or_renew;
use fleetmon::metrics;
use fleetmon::record::Controller;
use fleetmon::store::Store;
use test_helpers::*;

#[fleetmon::test(start_paused = true)]
async fn supervisor_renews_lease_and_releases_on_stop() {
    let fx = Fixture::new();
    let (path, sim) = fx.add_controller("ctl").await;

    let sup = FleetSupervisor::start(fx.env("a1"));
    let ctl = fx
        .wait_controller(&path, "leased by a1", |c| c.lease_owner == "a1")
        .await;
    assert_eq!(ctl.lease_expiry, Some(epoch() + secs(60)));

    // Renewed a quarter of the lease before it runs out.
    tokio::time::sleep(Duration::from_secs(50)).await;
    let ctl = fx.controller(&path).await;
    assert_eq!(ctl.lease_owner, "a1");
    let renewed_at = ctl.lease_expiry.expect("lease expiry") - secs(60);
    assert!(renewed_at >= epoch() + secs(45), "renewed too early: {renewed_at}");
    assert!(renewed_at < epoch() + secs(46), "renewed too late: {renewed_at}");
    assert_eq!(sim.dials(), 1, "renewal does not disturb the watcher");

    sup.kill();
    with_timeout!(5000, { sup.wait().await.expect("clean exit") });
    let ctl = fx.controller(&path).await;
    assert_eq!(ctl.lease_owner, "");
    assert_eq!(ctl.lease_expiry, None);
    assert_eq!(sim.live_connections(), 0);
    eventually("sessions closed", || fx.store.open_sessions() == 1).await;
}

#[fleetmon::test(start_paused = true)]
async fn stale_compare_and_swap_never_mutates() {
    let fx = Fixture::new();
    let (path, _sim) = fx.add_controller("ctl").await;
    let held = acquire_or_renew(fx.store.as_ref(), &path, None, "", epoch() + secs(60), "a1")
        .await
        .expect("first acquire");
    assert_eq!(held, Some(epoch() + secs(60)));

    // Wrong old owner, wrong old expiry, and a release by someone else.
    for (old_expiry, old_owner, new_owner) in [
        (held, "a2", "a2"),
        (None, "a1", "a2"),
        (Some(epoch() + secs(61)), "a1", "a1"),
        (held, "", ""),
    ] {
        let err = acquire_or_renew(
            fx.store.as_ref(),
            &path,
            old_expiry,
            old_owner,
            epoch() + secs(120),
            new_owner,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MonitorError::LeaseUnavailable(_)), "got {err:?}");
        let ctl = fx.controller(&path).await;
        assert_eq!(ctl.lease_owner, "a1");
        assert_eq!(ctl.lease_expiry, held);
    }
}

#[fleetmon::test(start_paused = true)]
async fn sub_millisecond_expiry_still_matches() {
    let fx = Fixture::new();
    let (path, _sim) = fx.add_controller("ctl").await;
    let precise = epoch() + chrono::TimeDelta::microseconds(60_000_123);
    let held = acquire_or_renew(fx.store.as_ref(), &path, None, "", precise, "a1")
        .await
        .unwrap();
    assert_eq!(held, Some(epoch() + chrono::TimeDelta::milliseconds(60_000)));

    // Callers pass the untruncated value back; it must still match.
    let renewed = acquire_or_renew(fx.store.as_ref(), &path, Some(precise), "a1", precise, "a1")
        .await
        .unwrap();
    assert_eq!(renewed, held);
}

#[fleetmon::test(start_paused = true)]
async fn unexpired_foreign_lease_is_left_until_it_expires() {
    let fx = Fixture::new();
    let path = ctl_path("ctl");
    let mut ctl = Controller::new(path.clone(), "ctl-uuid");
    ctl.lease_owner = "ghost".into();
    ctl.lease_expiry = Some(epoch() + secs(20));
    fx.store.insert_controller(ctl).await;
    let sim = fleetmon::api::SimController::new(None);
    fx.dialer.add(path.clone(), sim.clone()).await;

    let sup = FleetSupervisor::start(fx.env("a1"));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(fx.controller(&path).await.lease_owner, "ghost");
    assert_eq!(sim.dials(), 0);

    // The next acquisition pass at 30s finds the lease expired.
    tokio::time::sleep(Duration::from_secs(25)).await;
    let ctl = fx.controller(&path).await;
    assert_eq!(ctl.lease_owner, "a1");
    assert_expiry_near(ctl.lease_expiry, epoch() + secs(90));
    assert_eq!(sim.live_connections(), 1);

    sup.kill();
    sup.wait().await.unwrap();
}

#[fleetmon::test(start_paused = true)]
async fn renewal_keeps_a_second_agent_out() {
    let fx = Fixture::new();
    let (path, sim) = fx.add_controller("ctl").await;

    let first = FleetSupervisor::start(fx.env("a1"));
    fx.wait_controller(&path, "leased by a1", |c| c.lease_owner == "a1")
        .await;
    let second = FleetSupervisor::start(fx.env("a2"));

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fx.controller(&path).await.lease_owner, "a1");
    }
    assert_eq!(sim.peak_connections(), 1);
    assert_eq!(sim.dials(), 1);

    first.kill();
    first.wait().await.unwrap();
    // With the lease released, the second agent takes over on its next pass.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(fx.controller(&path).await.lease_owner, "a2");
    eventually("a2 watching", || sim.live_connections() == 1).await;
    assert_eq!(sim.peak_connections(), 1);

    second.kill();
    second.wait().await.unwrap();
}

#[fleetmon::test(start_paused = true)]
async fn stolen_lease_stops_the_monitor_quietly() {
    let fx = Fixture::new();
    let (path, sim) = fx.add_controller("ctl").await;
    let m = metrics::init().unwrap();
    let mut env = fx.env("a1");
    env.metrics = Some(m.clone());

    let sup = FleetSupervisor::start(env);
    let ctl = fx
        .wait_controller(&path, "leased by a1", |c| c.lease_owner == "a1")
        .await;
    eventually("watching", || sim.live_connections() == 1).await;
    assert_eq!(m.monitor_leases(&path.to_string()), 1.0);

    fx.store
        .acquire_monitor_lease(
            &path,
            ctl.lease_expiry,
            "a1",
            Some(epoch() + secs(3600)),
            "thief",
        )
        .await
        .unwrap();

    // The renewal at 45s notices.
    tokio::time::sleep(Duration::from_secs(50)).await;
    assert!(!sup.is_dead(), "losing one lease is not fatal");
    assert_eq!(sim.live_connections(), 0);
    assert_eq!(m.monitor_leases(&path.to_string()), 0.0);
    assert_eq!(fx.controller(&path).await.lease_owner, "thief");

    sup.kill();
    sup.wait().await.unwrap();
}
