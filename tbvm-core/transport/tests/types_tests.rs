//! 传输层类型测试

use tbvm_transport::*;

#[test]
fn test_hypervisor_error_display() {
    let err = HypervisorError::AgentUnresponsive("Guest agent is not responding".to_string());
    let err_str = format!("{}", err);
    assert!(err_str.contains("Guest Agent 无响应"));
    assert!(err_str.contains("Guest agent is not responding"));

    let err = HypervisorError::NotFound("TestVM".to_string());
    assert!(format!("{}", err).contains("TestVM"));
}

#[test]
fn test_snapshot_modes_are_distinct() {
    assert_ne!(SnapshotCreateMode::Capture, SnapshotCreateMode::Redefine);
    assert_ne!(SnapshotOrder::Any, SnapshotOrder::Topological);
}

#[test]
fn test_network_interface_serde() {
    let iface = NetworkInterface {
        name: "eth0".to_string(),
        hwaddr: Some("52:54:00:12:34:56".to_string()),
        addrs: vec!["192.168.122.10".to_string(), "fe80::1".to_string()],
    };

    let json = serde_json::to_string(&iface).unwrap();
    let back: NetworkInterface = serde_json::from_str(&json).unwrap();
    assert_eq!(back, iface);
}
