//! Trigger handling scenarios
//!
//! Instance state changes and security findings turned into interface
//! records and provisioned.

use pretty_assertions::assert_eq;
use tmirror_engine::control_plane::InstanceRecord;
use tmirror_engine::{
    parse_trigger, EventAdapter, EventError, InterfaceOutcome, SessionOutcome, Tag,
};
use tmirror_test::event_fixtures::{instance_finding, state_change};
use tmirror_test::{
    policy_fixtures, running_instance, target, FleetBuilder, FleetVerifier, TestHarness,
};

fn harness() -> TestHarness {
    let tagged = InstanceRecord {
        tags: vec![Tag::new("server_type", "web")],
        ..running_instance("i-1", "subnet-1", "vpc-1")
    };
    let fleet = FleetBuilder::new()
        .subnet("subnet-1", "vpc-1", "use1-az2")
        .instance(tagged)
        .target(target("tmt-fixed"))
        .build();
    TestHarness::new(fleet, policy_fixtures::CLASSIFIED_NETWORK, Default::default()).unwrap()
}

#[tokio::test]
async fn test_running_instance_is_provisioned() {
    let harness = harness();
    let adapter = EventAdapter::new(harness.engine.control_plane(), harness.engine.settings());

    let trigger = parse_trigger(&state_change("i-1", "running")).unwrap();
    let iface = adapter.observe(&trigger).await.unwrap().unwrap();
    assert_eq!(iface.interface_id(), "eni-i-1");
    assert_eq!(iface.availability_zone_key(), "use1-az2");

    let outcome = harness.engine.handle_interface(&iface).await.unwrap();
    assert!(matches!(
        outcome,
        InterfaceOutcome::Session(SessionOutcome::Created { .. })
    ));
    FleetVerifier::new(&harness.control_plane, "TargetSubnetId")
        .assert_session("eni-i-1", "tmt-fixed", "tmf-web")
        .unwrap();
}

#[tokio::test]
async fn test_stopping_instance_is_ignored() {
    let harness = harness();
    let adapter = EventAdapter::new(harness.engine.control_plane(), harness.engine.settings());

    let trigger = parse_trigger(&state_change("i-1", "stopping")).unwrap();
    assert_eq!(adapter.observe(&trigger).await.unwrap(), None);
    assert!(harness.control_plane.journal().is_empty());
}

#[tokio::test]
async fn test_finding_uses_reported_interface_and_tags() {
    let harness = harness();
    let adapter = EventAdapter::new(harness.engine.control_plane(), harness.engine.settings());

    let payload = instance_finding("i-9", "eni-9", "subnet-1", "vpc-1", &[("server_type", "db")]);
    let iface = adapter.observe(&parse_trigger(&payload).unwrap()).await.unwrap().unwrap();
    assert_eq!(iface.tag_value("server_type"), Some("db"));
    assert_eq!(iface.zone_suffix(), "az2");

    harness.engine.handle_interface(&iface).await.unwrap();
    FleetVerifier::new(&harness.control_plane, "TargetSubnetId")
        .assert_session("eni-9", "tmt-fixed", "tmf-db")
        .unwrap();
}

#[test]
fn test_unsupported_payloads() {
    let mut bucket = instance_finding("i-9", "eni-9", "subnet-1", "vpc-1", &[]);
    bucket["detail"]["resource"]["resourceType"] = "S3Bucket".into();
    assert!(matches!(parse_trigger(&bucket), Err(EventError::Unsupported(_))));

    let scheduled = serde_json::json!({"detail-type": "Scheduled Event", "detail": {}});
    assert!(parse_trigger(&scheduled).unwrap_err().is_unsupported());
}
