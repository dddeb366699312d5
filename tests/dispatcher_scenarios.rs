//! Command batches against emulated instruments.

mod common;

use common::{brooks_bus, dispatcher, flaky_brooks, sierra};
use labctl::adapters::{MockEvent, MockTransport};
use labctl::{CommandRequest, Status};

const GAS_LINE: &str = r#"
    [[channels]]
    id = "rs232"
    transport = { kind = "mock" }

    [[channels]]
    id = "rs485"
    transport = { kind = "mock" }

    [[channels]]
    id = "u6"
    transport = { kind = "mock" }

    [[devices]]
    name = "mfc-n2-1"
    channel = "rs232"
    driver = "sierra"
    fs_range = 50.0

    [[devices]]
    name = "mfc-ch4-1"
    channel = "rs485"
    driver = "brooks"
    mac_id = 32
    fs_range = 92.0

    [[devices]]
    name = "sw-ventline"
    channel = "u6"
    driver = "switch"
    line = 9
"#;

fn args(values: &[&str]) -> Option<Vec<String>> {
    Some(values.iter().map(|v| v.to_string()).collect())
}

#[tokio::test]
async fn test_sierra_setpoint_then_flow() {
    let rs232 = sierra("rs232", "0.0");
    let dispatcher = dispatcher(GAS_LINE, &[("rs232", &rs232)]);

    let responses = dispatcher
        .execute(vec![
            CommandRequest::new("mfc-n2-1", "set_flow", args(&["25.0"])),
        ])
        .await;

    assert_eq!(responses[0].status, Status::Ok);
    assert_eq!(responses[0].value, vec!["25.0"]);
    assert_eq!(
        serde_json::to_string(&responses[0]).unwrap(),
        r#"{"dev":"mfc-n2-1","cmd":"set_flow","status":"OK","value":["25.0"]}"#
    );

    let responses = dispatcher
        .execute(vec![CommandRequest::new("mfc-n2-1", "get_flow", None)])
        .await;
    let flow: f64 = responses[0].value[0].parse().unwrap();
    assert!((flow - 25.0).abs() < 0.05, "flow settled at {flow}");
}

#[tokio::test]
async fn test_out_of_range_setpoint_never_reaches_the_bus() {
    let rs232 = sierra("rs232", "0.0");
    let dispatcher = dispatcher(GAS_LINE, &[("rs232", &rs232)]);

    let responses = dispatcher
        .execute(vec![CommandRequest::new("mfc-n2-1", "set_flow", args(&["60.0"]))])
        .await;

    assert_eq!(responses[0].status, Status::Error);
    assert_eq!(
        responses[0].value,
        vec!["Invalid flow '60.0', allowed: range(0.0, 50.0)"]
    );
    assert!(rs232.writes().is_empty());
}

#[tokio::test]
async fn test_invalid_switch_token_is_local() {
    let u6 = MockTransport::new("u6");
    let dispatcher = dispatcher(GAS_LINE, &[("u6", &u6)]);

    let responses = dispatcher
        .execute(vec![CommandRequest::new("sw-ventline", "set_state", args(&["open"]))])
        .await;

    assert_eq!(responses[0].status, Status::Error);
    assert_eq!(
        responses[0].value,
        vec!["Invalid requested state 'open', allowed: noflow|flow"]
    );
    assert!(u6.events().is_empty());
}

#[tokio::test]
async fn test_brooks_recovers_from_naks_within_budget() {
    let rs485 = flaky_brooks("rs485", 2);
    let dispatcher = dispatcher(GAS_LINE, &[("rs485", &rs485)]);

    let responses = dispatcher
        .execute(vec![
            CommandRequest::new("mfc-ch4-1", "set_flow", args(&["46.0"])),
            CommandRequest::new("mfc-ch4-1", "get_curr_setp", None),
        ])
        .await;

    assert_eq!(responses[0].status, Status::Ok, "{:?}", responses[0]);
    assert_eq!(responses[0].value, vec!["46.0"]);
    // Opening ACK and frame for each of the three attempts, closing ACK once
    let frames = rs485.writes().iter().filter(|w| w.len() > 1).count();
    assert_eq!(frames, 3);
}

#[tokio::test]
async fn test_brooks_budget_exhaustion_is_reported() {
    let rs485 = flaky_brooks("rs485", u32::MAX);
    let dispatcher = dispatcher(GAS_LINE, &[("rs485", &rs485)]);

    let responses = dispatcher
        .execute(vec![CommandRequest::new("mfc-ch4-1", "set_flow", args(&["10.0"]))])
        .await;

    assert_eq!(responses[0].status, Status::Error);
    assert_eq!(responses[0].value, vec!["No response after 5 attempts"]);
}

#[tokio::test]
async fn test_brooks_flow_readback() {
    let rs485 = brooks_bus("rs485", 0x8000);
    let dispatcher = dispatcher(GAS_LINE, &[("rs485", &rs485)]);

    let responses = dispatcher
        .execute(vec![
            CommandRequest::new("mfc-ch4-1", "get_flow", None),
            CommandRequest::new("mfc-ch4-1", "get_fs_range", None),
        ])
        .await;

    assert_eq!(responses[0].value, vec!["46.000"]);
    assert_eq!(responses[1].value, vec!["92.0"]);
}

#[tokio::test]
async fn test_transport_fault_reopens_channel() {
    let rs232 = sierra("rs232", "12.5");
    rs232.fail_next(1);
    let dispatcher = dispatcher(GAS_LINE, &[("rs232", &rs232)]);

    let responses = dispatcher
        .execute(vec![CommandRequest::new("mfc-n2-1", "get_flow", None)])
        .await;

    assert!(responses[0].is_ok(), "{:?}", responses[0]);
    assert_eq!(responses[0].value, vec!["12.500"]);
    assert_eq!(rs232.reopen_count(), 1);
    assert_eq!(rs232.events()[0], MockEvent::Reopen);
}

#[tokio::test]
async fn test_batch_preserves_order_and_length() {
    let rs232 = sierra("rs232", "1.0");
    let rs485 = brooks_bus("rs485", 0x4000);
    let u6 = MockTransport::new("u6");
    let dispatcher = dispatcher(
        GAS_LINE,
        &[("rs232", &rs232), ("rs485", &rs485), ("u6", &u6)],
    );

    let batch = vec![
        CommandRequest::new("mfc-ch4-1", "get_flow", None),
        CommandRequest::new("nope", "get_flow", None),
        CommandRequest::new("controller", "stoplog", None),
        CommandRequest::new("mfc-n2-1", "get_flow", None),
        CommandRequest::new("sw-ventline", "set_flow", args(&["1.0"])),
    ];
    let responses = dispatcher.execute(batch.clone()).await;

    assert_eq!(responses.len(), batch.len());
    for (request, response) in batch.iter().zip(&responses) {
        assert_eq!(request.dev, response.dev);
        assert_eq!(request.cmd, response.cmd);
    }
    let statuses: Vec<Status> = responses.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![Status::Ok, Status::Error, Status::Ok, Status::Ok, Status::Error]
    );
    assert_eq!(responses[0].value, vec!["0.000"]);
}
