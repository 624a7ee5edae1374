use vmbridge::{
    transport::SuspendPolicy, BreakpointPurpose, BridgeError, DebuggeeState, VmController,
};
use vmbridge_config::ServerConfig;

use crate::harness::{
    attach,
    mock::{MockDebuggee, MAIN, REFERENCE_HANDLER, WORKER},
    start, Note,
};

#[test]
fn startup_reaches_idle_with_both_server_threads_parked() {
    let session = start(MockDebuggee::new());

    assert_eq!(session.controller.state(), DebuggeeState::Idle);
    assert_eq!(
        session.owner.states(),
        vec![(DebuggeeState::NotReady, DebuggeeState::Idle)]
    );
    // Each parked thread holds exactly the suspension of its rendezvous event.
    assert_eq!(session.mock.suspend_count(MAIN), 1);
    assert_eq!(session.mock.suspend_count(WORKER), 1);
    assert_eq!(session.mock.suspend_count(REFERENCE_HANDLER), 0);
}

#[test]
fn markers_are_installed_with_their_suspend_policies() {
    let session = start(MockDebuggee::new());

    let mut purposes: Vec<(BreakpointPurpose, SuspendPolicy)> = session
        .controller
        .breakpoints()
        .into_iter()
        .map(|record| {
            let policy = session
                .mock
                .breakpoint_requests()
                .into_iter()
                .find(|request| request.request == record.request)
                .map(|request| request.policy)
                .unwrap();
            (record.purpose, policy)
        })
        .collect();
    purposes.sort_by_key(|(purpose, _)| format!("{purpose:?}"));

    assert_eq!(
        purposes,
        vec![
            (BreakpointPurpose::ExitMarker, SuspendPolicy::None),
            (BreakpointPurpose::Started, SuspendPolicy::All),
            (BreakpointPurpose::Suspend, SuspendPolicy::EventThread),
        ]
    );
    assert!(session.controller.user_breakpoints().is_empty());
}

#[test]
fn uncaught_exceptions_suspend_only_the_throwing_thread() {
    let session = start(MockDebuggee::new());
    assert_eq!(
        session.mock.exception_policy(),
        Some(SuspendPolicy::EventThread)
    );
}

#[test]
fn list_threads_reports_names_and_suspension() {
    let session = start(MockDebuggee::new());

    let threads = session.controller.list_threads().unwrap();
    let summary: Vec<(&str, bool)> = threads
        .iter()
        .map(|info| (info.name.as_str(), info.suspended))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("main", true),
            ("vmbridge-worker", true),
            ("Reference Handler", false),
        ]
    );
    session.controller.dump_threads().unwrap();
}

#[test]
fn thread_lifecycle_is_forwarded_to_the_owner() {
    let session = start(MockDebuggee::new());

    let thread = session.mock.start_thread("Timer-0");
    session.mock.end_thread(thread);
    session
        .owner
        .wait_for(1, |note| matches!(note, Note::ThreadDied(_)));

    let lifecycle: Vec<Note> = session
        .owner
        .notes()
        .into_iter()
        .filter(|note| matches!(note, Note::ThreadStarted(_) | Note::ThreadDied(_)))
        .collect();
    assert_eq!(
        lifecycle,
        vec![Note::ThreadStarted(thread), Note::ThreadDied(thread)]
    );
}

#[test]
fn missing_worker_thread_fails_startup() {
    let server = ServerConfig {
        worker_thread: "no-such-worker".to_string(),
        ..ServerConfig::default()
    };
    let session = attach(MockDebuggee::new(), &server).unwrap();

    let err = session.controller.wait_for_startup().unwrap_err();
    assert!(
        matches!(&err, BridgeError::MissingServerMember(member) if member.contains("no-such-worker")),
        "{err:?}"
    );
    assert_eq!(session.controller.state(), DebuggeeState::NotReady);
    assert!(matches!(
        session.controller.run_shell_class("__SHELL1"),
        Err(BridgeError::NotReady)
    ));
}

#[test]
fn attaching_to_a_dead_debuggee_fails() {
    let mock = std::sync::Arc::new(MockDebuggee::new());
    mock.disconnect();

    let result = VmController::with_transport(
        mock,
        &ServerConfig::default(),
        &crate::harness::rendezvous(),
        std::sync::Arc::new(vmbridge::NoopOwner),
    );
    assert!(matches!(result, Err(BridgeError::Disconnected)));
}

#[test]
fn thread_listing_tolerates_dead_threads_but_not_a_lost_connection() {
    let session = start(MockDebuggee::new());

    session.mock.break_thread_name(REFERENCE_HANDLER, false);
    let threads = session.controller.list_threads().unwrap();
    assert_eq!(threads.len(), 3);
    let handler = threads
        .iter()
        .find(|info| info.thread == REFERENCE_HANDLER)
        .unwrap();
    assert_eq!(handler.name, "<exited>");

    session.mock.break_thread_name(REFERENCE_HANDLER, true);
    assert!(matches!(
        session.controller.list_threads(),
        Err(BridgeError::Disconnected)
    ));
}
