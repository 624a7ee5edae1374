use std::{sync::Arc, thread, time::Duration};

use vmbridge::{BridgeError, DebuggeeState, ExitStatus};

use crate::harness::{
    mock::{MockDebuggee, ShellBehavior},
    start, start_with_loader, wait_for_state, Note,
};

#[test]
fn debuggee_death_during_a_run_terminates_it() {
    let mock = MockDebuggee::new();
    mock.define_shell("__SHELL1", ShellBehavior::Hang);
    let session = start_with_loader(mock);

    let controller = Arc::clone(&session.controller);
    let run = thread::spawn(move || controller.run_shell_class("__SHELL1"));
    wait_for_state(&session.controller, DebuggeeState::Running);
    session.mock.disconnect();

    let outcome = run.join().unwrap().unwrap();
    assert_eq!(outcome.status, ExitStatus::Terminated);
    assert_eq!(outcome.exception, None);
    wait_for_state(&session.controller, DebuggeeState::Terminated);
    session
        .owner
        .wait_for(1, |note| matches!(note, Note::State(_, DebuggeeState::Terminated)));
}

#[test]
fn waiting_worker_call_is_released_by_a_disconnect() {
    let session = start(MockDebuggee::new());
    // The worker runs the call but never returns to its rendezvous.
    session.mock.hold_markers(true);

    let controller = Arc::clone(&session.controller);
    let call = thread::spawn(move || controller.set_libraries(&[]));
    thread::sleep(Duration::from_millis(50));
    session.mock.disconnect();

    assert!(matches!(call.join().unwrap(), Err(BridgeError::Disconnected)));
}

#[test]
fn close_disposes_once_the_session_is_gone() {
    let session = start(MockDebuggee::new());

    session.controller.close();
    assert_eq!(session.controller.state(), DebuggeeState::Terminated);
    assert!(session.mock.counters().dispose >= 1);

    // Closing again is harmless.
    session.controller.close();
    assert_eq!(session.controller.state(), DebuggeeState::Terminated);
    assert_eq!(
        session
            .owner
            .states()
            .iter()
            .filter(|(_, new)| *new == DebuggeeState::Terminated)
            .count(),
        1
    );
}

#[test]
fn calls_after_disconnect_fail_fast() {
    let session = start_with_loader(MockDebuggee::new());
    session.mock.disconnect();
    wait_for_state(&session.controller, DebuggeeState::Terminated);

    assert!(matches!(
        session.controller.set_libraries(&[]),
        Err(BridgeError::Disconnected)
    ));
    assert!(matches!(
        session.controller.run_shell_class("__SHELL1"),
        Err(BridgeError::Disconnected)
    ));
    assert!(session.controller.list_threads().is_err());
    // Nothing leaves the terminal state.
    assert!(session.controller.resume_thread(crate::harness::mock::MAIN).is_err());
    assert_eq!(session.controller.state(), DebuggeeState::Terminated);
}
