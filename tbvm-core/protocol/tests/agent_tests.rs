//! Guest Agent 客户端测试：进程执行、ping、命令构建

use mockall::mock;
use mockall::predicate::*;
use tbvm_protocol::*;
use tbvm_transport::fake::{FakeGuest, FakeProgram};
use tbvm_transport::{GuestChannel, HypervisorError};

mock! {
    pub Channel {}

    impl GuestChannel for Channel {
        fn agent_command(&self, command: &str) -> tbvm_transport::Result<String>;
    }
}

fn fast_config() -> AgentConfig {
    AgentConfig {
        poll: PollPolicy::immediate(50),
        ..Default::default()
    }
}

// ============================================================================
// 命令构建：必需参数缺失时不产生任何通道调用
// ============================================================================

#[test]
fn test_missing_required_property_never_reaches_channel() {
    let mut channel = MockChannel::new();
    channel.expect_agent_command().never();

    let agent = GuestAgent::new(&channel);
    let result = agent.exec(&GuestExecCommand::default());

    assert!(matches!(result, Err(AgentError::MissingProperty { .. })));
}

#[test]
fn test_empty_command_line_never_reaches_channel() {
    let mut channel = MockChannel::new();
    channel.expect_agent_command().never();

    let agent = GuestAgent::new(&channel);
    assert!(agent.execute_command_async("   ", true).is_err());
}

#[test]
fn test_empty_arguments_not_serialized() {
    let mut channel = MockChannel::new();
    channel
        .expect_agent_command()
        .withf(|request| !request.contains("\"arg\"") && !request.contains("\"env\""))
        .times(1)
        .returning(|_| Ok(r#"{"return":{"pid":7}}"#.to_string()));

    let agent = GuestAgent::new(&channel);
    let no_args: [&str; 0] = [];
    assert_eq!(agent.execute_async("/usr/bin/uptime", &no_args, false).unwrap(), 7);
}

// ============================================================================
// ping
// ============================================================================

#[test]
fn test_ping_success() {
    let mut channel = MockChannel::new();
    channel
        .expect_agent_command()
        .with(eq(r#"{"execute":"guest-ping","arguments":{}}"#))
        .times(1)
        .returning(|_| Ok(r#"{"return":{}}"#.to_string()));

    assert!(GuestAgent::new(&channel).ping().unwrap());
}

#[test]
fn test_ping_unresponsive_agent_is_false() {
    let mut channel = MockChannel::new();
    channel
        .expect_agent_command()
        .returning(|_| Err(HypervisorError::AgentUnresponsive("not connected".to_string())));

    assert!(!GuestAgent::new(&channel).ping().unwrap());
}

#[test]
fn test_ping_operation_invalid_is_false() {
    let mut channel = MockChannel::new();
    channel
        .expect_agent_command()
        .returning(|_| Err(HypervisorError::OperationInvalid("domain is not running".to_string())));

    assert!(!GuestAgent::new(&channel).ping().unwrap());
}

#[test]
fn test_ping_other_failure_propagates() {
    let mut channel = MockChannel::new();
    channel
        .expect_agent_command()
        .returning(|_| Err(HypervisorError::Libvirt("connection reset".to_string())));

    let err = GuestAgent::new(&channel).ping().unwrap_err();
    assert!(matches!(err, AgentError::Transport(HypervisorError::Libvirt(_))));
}

#[test]
fn test_ping_against_fake_guest() {
    let guest = FakeGuest::new();
    let agent = GuestAgent::new(&guest);
    assert!(agent.ping().unwrap());

    guest.set_unreachable(true);
    assert!(!agent.ping().unwrap());
}

// ============================================================================
// 进程执行
// ============================================================================

#[test]
fn test_wait_for_process_finish_captures_output() {
    let guest = FakeGuest::new();
    guest.set_polls_before_exit(3);

    let agent = GuestAgent::with_config(&guest, fast_config()).unwrap();
    let pid = agent
        .execute_command_async("echo test command return", true)
        .unwrap();
    let status = agent.wait_for_process_finish(pid).unwrap();

    assert!(status.exited);
    assert_eq!(status.exit_code, Some(0));
    assert_eq!(status.stdout.as_deref(), Some("test command return\n"));
    assert_eq!(guest.count("guest-exec-status"), 4);
}

#[test]
fn test_output_not_captured_by_default() {
    let guest = FakeGuest::new();
    let agent = GuestAgent::new(&guest);

    let pid = agent.execute_command_async("echo hello", false).unwrap();
    let status = agent.wait_for_process_finish(pid).unwrap();

    assert!(status.exited);
    assert!(status.stdout.is_none());
}

#[test]
fn test_wait_for_process_finish_is_bounded() {
    let guest = FakeGuest::new();
    guest.set_polls_before_exit(100);

    let config = AgentConfig {
        poll: PollPolicy::immediate(5),
        ..Default::default()
    };
    let agent = GuestAgent::with_config(&guest, config).unwrap();
    let pid = agent.execute_command_async("echo slow", true).unwrap();

    let err = agent.wait_for_process_finish(pid).unwrap_err();
    assert!(matches!(err, AgentError::Timeout { attempts: 5, .. }));
    assert_eq!(guest.count("guest-exec-status"), 5);
}

#[test]
fn test_execute_reports_exit_code() {
    let guest = FakeGuest::new();
    guest.add_program(
        "/root/vmFiles/installPackages.sh",
        FakeProgram {
            stdout: String::new(),
            stderr: "apt failed\n".to_string(),
            exit_code: 100,
        },
    );

    let agent = GuestAgent::new(&guest);
    let no_args: [&str; 0] = [];
    let status = agent.execute("/root/vmFiles/installPackages.sh", &no_args).unwrap();

    assert!(!status.success());
    assert_eq!(status.exit_code, Some(100));
    assert_eq!(status.stderr.as_deref(), Some("apt failed\n"));
}

#[test]
fn test_agent_error_object_propagates() {
    let mut channel = MockChannel::new();
    channel.expect_agent_command().returning(|_| {
        Ok(r#"{"error":{"class":"GenericError","desc":"Guest agent command failed"}}"#.to_string())
    });

    let err = GuestAgent::new(&channel)
        .execute_command_async("ls /", false)
        .unwrap_err();
    assert!(matches!(err, AgentError::CommandFailed { .. }));
}

#[test]
fn test_invalid_config_rejected() {
    let guest = FakeGuest::new();
    let config = AgentConfig {
        write_chunk_chars: 10,
        ..Default::default()
    };
    assert!(matches!(
        GuestAgent::with_config(&guest, config),
        Err(AgentError::Config(_))
    ));
}
