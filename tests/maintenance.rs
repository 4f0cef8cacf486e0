mod common;

use std::time::Duration;

use common::{gateway, gateway_with, FakeNode, FakePlatform};
use fleet_upgrade::config::Config;
use fleet_upgrade::drain::set_maintenance;
use fleet_upgrade::error::Step;
use fleet_upgrade::prober::MaintenanceFlag;
use fleet_upgrade::verify;
use tokio::time::Instant;

const STOPPED: &str = "Error: IC0508: Canister a-cai is stopped";

#[tokio::test(start_paused = true)]
async fn gate_polls_once_per_configured_attempt() {
    let fake = FakePlatform::new();
    fake.add("a-cai", FakeNode::running("0xaa0"));
    fake.fail_always("a-cai", "getMaintenanceFlag", STOPPED);
    let gw = gateway_with(&fake, &Config::default(), false);

    let started = Instant::now();
    let err = verify::maintenance_gate(&gw, "a-cai").await.unwrap_err();

    assert_eq!(err.step, Step::MaintenanceGate);
    // 10 polls, 500ms throttle after each, 6s between them
    assert_eq!(fake.count("a-cai", "getMaintenanceFlag"), 10);
    assert_eq!(started.elapsed(), Duration::from_secs(59));
}

#[tokio::test(start_paused = true)]
async fn flag_confirmation_polls_once_per_configured_attempt() {
    let fake = FakePlatform::new();
    let mut node = FakeNode::running("0xaa0");
    node.toggle_breaks_flag_read = true;
    fake.add("a-cai", node);
    let gw = gateway_with(&fake, &Config::default(), false);

    let started = Instant::now();
    let result = set_maintenance(&gw, "a-cai", true).await;

    assert!(result.unwrap_err().contains("did not turn on"));
    // one read before the toggle, then 5 confirmation polls 3s apart
    assert_eq!(fake.count("a-cai", "getMaintenanceFlag"), 6);
    assert_eq!(fake.count("a-cai", "toggleMaintenanceFlagAdmin"), 1);
    assert_eq!(started.elapsed(), Duration::from_millis(18_500));
}

#[tokio::test(start_paused = true)]
async fn dry_run_reads_the_flag_before_simulating_a_toggle() {
    let fake = FakePlatform::new();
    fake.add("a-cai", FakeNode::running("0xaa0"));
    let gw = gateway(&fake, true);

    let flag = set_maintenance(&gw, "a-cai", true).await.unwrap();

    assert_eq!(flag, MaintenanceFlag::On);
    assert_eq!(fake.count("a-cai", "getMaintenanceFlag"), 1);
    assert!(fake.mutating_calls("a-cai").is_empty());
    assert_eq!(fake.node("a-cai").flag, Some(false));
}

#[tokio::test(start_paused = true)]
async fn dry_run_with_flag_already_in_place_needs_no_toggle() {
    let fake = FakePlatform::new();
    fake.add("a-cai", FakeNode::running("0xaa0"));
    let gw = gateway(&fake, true);

    let flag = set_maintenance(&gw, "a-cai", false).await.unwrap();

    assert_eq!(flag, MaintenanceFlag::Off);
    assert_eq!(fake.count("a-cai", "getMaintenanceFlag"), 1);
}

#[tokio::test(start_paused = true)]
async fn dry_run_tolerates_an_unreadable_flag() {
    let fake = FakePlatform::new();
    let mut node = FakeNode::running("0xaa0");
    node.running = false;
    fake.add("a-cai", node);
    let gw = gateway(&fake, true);

    let flag = set_maintenance(&gw, "a-cai", false).await.unwrap();

    assert_eq!(flag, MaintenanceFlag::Off);
    assert!(fake.count("a-cai", "getMaintenanceFlag") >= 1);
    assert!(fake.mutating_calls("a-cai").is_empty());
}
