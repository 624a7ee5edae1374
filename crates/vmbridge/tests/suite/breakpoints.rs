use std::{sync::Arc, thread};

use vmbridge::{
    transport::StepDepth, BreakpointError, BreakpointPurpose, BridgeError, DebuggeeState,
    ExitStatus,
};
use vmbridge_jdwp::wire::{types::TAG_ARRAY, JdwpValue};

use crate::harness::{
    eventually,
    mock::{MockDebuggee, ShellBehavior, MAIN, WORKER},
    start_with_loader, wait_for_state, Note,
};

const FOO: &str = "com.example.Foo";

fn stop_at(line: u32) -> ShellBehavior {
    ShellBehavior::StopAt {
        class: FOO.to_string(),
        line,
    }
}

#[test]
fn breakpoints_need_a_loadable_class_and_code_at_the_line() {
    let mock = MockDebuggee::new();
    mock.define_user_class(FOO, &[3, 4, 5]);
    let session = start_with_loader(mock);

    assert!(matches!(
        session.controller.set_breakpoint("com.example.Missing", 3),
        Err(BridgeError::Breakpoint(BreakpointError::ClassNotFound(name))) if name == "com.example.Missing"
    ));
    assert!(matches!(
        session.controller.set_breakpoint(FOO, 9),
        Err(BridgeError::Breakpoint(BreakpointError::NoCodeAtLine { line: 9, .. }))
    ));
    assert!(matches!(
        session.controller.clear_breakpoint(FOO, 3),
        Err(BridgeError::Breakpoint(BreakpointError::NoSuchBreakpoint { line: 3, .. }))
    ));
}

#[test]
fn set_and_clear_track_debuggee_requests() {
    let mock = MockDebuggee::new();
    mock.define_user_class(FOO, &[3, 4, 5]);
    let session = start_with_loader(mock);
    let markers = session.mock.breakpoint_requests().len();

    session.controller.set_breakpoint(FOO, 4).unwrap();
    session.controller.set_breakpoint(FOO, 5).unwrap();
    assert_eq!(session.mock.breakpoint_requests().len(), markers + 2);
    assert_eq!(
        session.controller.user_breakpoints(),
        vec![(FOO.to_string(), 4), (FOO.to_string(), 5)]
    );

    session.controller.clear_breakpoint(FOO, 4).unwrap();
    assert_eq!(session.mock.breakpoint_requests().len(), markers + 1);
    assert_eq!(session.controller.user_breakpoints(), vec![(FOO.to_string(), 5)]);
    session.controller.dump_breakpoints();
}

#[test]
fn new_loader_moves_breakpoints_and_drops_vanished_lines() {
    let mock = MockDebuggee::new();
    mock.define_user_class(FOO, &[3, 5, 7]);
    let session = start_with_loader(mock);
    session.controller.set_breakpoint(FOO, 5).unwrap();
    session.controller.set_breakpoint(FOO, 7).unwrap();

    // The class was edited: line 7 no longer has code.
    session.mock.set_class_lines(FOO, &[3, 5]);
    let loader = session.controller.new_class_loader(&[]).unwrap();

    assert_eq!(session.controller.user_breakpoints(), vec![(FOO.to_string(), 5)]);
    // Once for the first loader, once for this one.
    assert_eq!(session.mock.counters().clear_all_breakpoints, 2);

    let current = session
        .mock
        .loaded(FOO)
        .into_iter()
        .find(|class| class.loader == loader)
        .unwrap();
    let user: Vec<_> = session
        .controller
        .breakpoints()
        .into_iter()
        .filter(|record| record.purpose.is_user())
        .collect();
    assert_eq!(user.len(), 1);
    assert_eq!(user[0].location.class_id, current.id);

    let markers = session
        .controller
        .breakpoints()
        .into_iter()
        .filter(|record| !record.purpose.is_user())
        .count();
    assert_eq!(markers, 3);
    assert_eq!(session.mock.breakpoint_requests().len(), 4);
    // Suspended for the reinstall, resumed afterwards.
    let counters = session.mock.counters();
    assert!(counters.suspend_all >= 1);
    assert!(counters.resume_all > counters.suspend_all);
}

#[test]
fn stopping_in_user_code_suspends_until_resumed() {
    let mock = MockDebuggee::new();
    mock.define_user_class(FOO, &[3, 4]);
    mock.define_shell("__SHELL1", stop_at(3));
    let session = start_with_loader(mock);
    session.controller.set_breakpoint(FOO, 3).unwrap();

    let controller = Arc::clone(&session.controller);
    let run = thread::spawn(move || controller.run_shell_class("__SHELL1"));
    session.owner.wait_for_hits(1);
    assert_eq!(session.controller.state(), DebuggeeState::Suspended);

    let stack = session.controller.thread_stack(MAIN).unwrap();
    assert_eq!(stack[0].class_name, FOO);
    assert_eq!(stack[0].line, Some(3));
    assert_eq!(stack[1].class_name, "__SHELL1");

    session.controller.resume_thread(MAIN).unwrap();
    let outcome = run.join().unwrap().unwrap();
    assert_eq!(outcome.status, ExitStatus::NormalExit);
    wait_for_state(&session.controller, DebuggeeState::Idle);

    let states = session.owner.states();
    for expected in [
        (DebuggeeState::Running, DebuggeeState::Suspended),
        (DebuggeeState::Suspended, DebuggeeState::Running),
    ] {
        assert!(states.contains(&expected), "{states:?}");
    }
}

#[test]
fn stepping_stops_again_at_the_next_line() {
    let mock = MockDebuggee::new();
    mock.define_user_class(FOO, &[3, 4]);
    mock.define_shell("__SHELL1", stop_at(3));
    let session = start_with_loader(mock);
    session.controller.set_breakpoint(FOO, 3).unwrap();

    let controller = Arc::clone(&session.controller);
    let run = thread::spawn(move || controller.run_shell_class("__SHELL1"));
    session.owner.wait_for_hits(1);

    session.controller.step(MAIN, StepDepth::Over).unwrap();
    session.owner.wait_for_hits(2);
    assert_eq!(session.controller.state(), DebuggeeState::Suspended);
    let stack = session.controller.thread_stack(MAIN).unwrap();
    assert_eq!(stack[0].line, Some(4));

    session.controller.resume_thread(MAIN).unwrap();
    assert_eq!(run.join().unwrap().unwrap().status, ExitStatus::NormalExit);
    assert_eq!(session.owner.hits(), vec![MAIN, MAIN]);
}

#[test]
fn breakpoints_in_shell_classes_never_stop() {
    let mock = MockDebuggee::new();
    mock.define_shell(
        "__SHELL1",
        ShellBehavior::StopAt {
            class: "__SHELL1".to_string(),
            line: 1,
        },
    );
    let session = start_with_loader(mock);
    session.controller.set_breakpoint("__SHELL1", 1).unwrap();

    let outcome = session.controller.run_shell_class("__SHELL1").unwrap();
    assert_eq!(outcome.status, ExitStatus::NormalExit);
    assert!(session.owner.hits().is_empty());
    assert!(!session
        .owner
        .notes()
        .contains(&Note::State(DebuggeeState::Running, DebuggeeState::Suspended)));
}

#[test]
fn marker_purposes_are_distinguished_from_user_breakpoints() {
    assert!(BreakpointPurpose::User {
        class: FOO.to_string(),
        line: 1
    }
    .is_user());
    assert!(!BreakpointPurpose::Suspend.is_user());
}

#[test]
fn worker_stopped_in_a_test_method_settles_back_to_idle() {
    let mock = MockDebuggee::new();
    mock.define_user_class("com.example.FooTest", &[5, 6]);
    mock.run_line_in_op("runTestMethod", "com.example.FooTest", 5);
    let session = start_with_loader(mock);
    session
        .controller
        .set_breakpoint("com.example.FooTest", 5)
        .unwrap();

    let controller = Arc::clone(&session.controller);
    let test =
        thread::spawn(move || controller.run_test_method("com.example.FooTest", "testAdd"));
    session.owner.wait_for_hits(1);
    assert_eq!(session.owner.hits(), vec![WORKER]);
    assert_eq!(session.controller.state(), DebuggeeState::Suspended);
    let stack = session.controller.thread_stack(WORKER).unwrap();
    assert_eq!(stack[0].class_name, "com.example.FooTest");
    assert_eq!(stack[0].line, Some(5));
    assert_eq!(stack[1].method_name, "runTestMethod");

    session.controller.resume_thread(WORKER).unwrap();
    let result = test.join().unwrap().unwrap();
    assert!(matches!(result, JdwpValue::Object { tag: TAG_ARRAY, .. }));
    wait_for_state(&session.controller, DebuggeeState::Idle);
    assert!(session.owner.states().ends_with(&[
        (DebuggeeState::Idle, DebuggeeState::Suspended),
        (DebuggeeState::Suspended, DebuggeeState::Running),
        (DebuggeeState::Running, DebuggeeState::Idle),
    ]));
    eventually("worker to park", || session.mock.suspend_count(WORKER) == 1);

    // Nothing is left in flight: the next call runs normally.
    session.controller.suppress_output().unwrap();
    assert_eq!(session.controller.state(), DebuggeeState::Idle);
}

#[test]
fn failed_clear_keeps_the_breakpoint_tracked() {
    let mock = MockDebuggee::new();
    mock.define_user_class(FOO, &[3, 4]);
    let session = start_with_loader(mock);
    session.controller.set_breakpoint(FOO, 3).unwrap();
    let requests = session.mock.breakpoint_requests().len();

    session.mock.reject_breakpoint_clears(true);
    let err = session.controller.clear_breakpoint(FOO, 3).unwrap_err();
    assert!(matches!(err, BridgeError::Transport(_)), "{err:?}");
    assert_eq!(
        session.controller.user_breakpoints(),
        vec![(FOO.to_string(), 3)]
    );
    assert_eq!(session.mock.breakpoint_requests().len(), requests);

    session.mock.reject_breakpoint_clears(false);
    session.controller.clear_breakpoint(FOO, 3).unwrap();
    assert!(session.controller.user_breakpoints().is_empty());
    assert_eq!(session.mock.breakpoint_requests().len(), requests - 1);
}
