use std::{sync::Arc, thread};

use vmbridge::{
    transport::InvokePolicy, BridgeError, DebuggeeState, ExitStatus, RunOutcome,
};

use crate::harness::{
    eventually,
    mock::{MockDebuggee, ShellBehavior, EXIT_EXCEPTION, MAIN},
    start_with_loader, Note, Session,
};

fn with_shell(behavior: ShellBehavior) -> Session {
    let mock = MockDebuggee::new();
    mock.define_shell("__SHELL1", behavior);
    start_with_loader(mock)
}

fn throw(class: &str, message: Option<&str>) -> ShellBehavior {
    ShellBehavior::Throw {
        class: class.to_string(),
        message: message.map(str::to_string),
    }
}

#[test]
fn normal_run_returns_to_idle() {
    let session = with_shell(ShellBehavior::Finish);

    let outcome = session.controller.run_shell_class("__SHELL1").unwrap();
    assert_eq!(
        outcome,
        RunOutcome {
            status: ExitStatus::NormalExit,
            exception: None
        }
    );
    assert_eq!(session.controller.state(), DebuggeeState::Idle);
    assert_eq!(session.controller.exit_status(), Some(ExitStatus::NormalExit));

    let run = &session.mock.calls_to("run")[0];
    assert_eq!(run.thread, MAIN);
    assert_eq!(run.policy, InvokePolicy::ResumeAll);
    session.owner.wait_for(1, |note| {
        *note == Note::State(DebuggeeState::Running, DebuggeeState::Idle)
    });
    assert!(session
        .owner
        .states()
        .ends_with(&[
            (DebuggeeState::Idle, DebuggeeState::Running),
            (DebuggeeState::Running, DebuggeeState::Idle),
        ]));
    assert_eq!(session.mock.suspend_count(MAIN), 1);
}

#[test]
fn uncaught_exception_is_captured_with_message_and_stack() {
    let session = with_shell(throw("java.lang.IllegalStateException", Some("boom")));

    let outcome = session.controller.run_shell_class("__SHELL1").unwrap();
    assert_eq!(outcome.status, ExitStatus::Exception);
    let exception = outcome.exception.unwrap();
    assert_eq!(exception.class_name, "java.lang.IllegalStateException");
    assert_eq!(exception.message.as_deref(), Some("boom"));
    assert_eq!(exception.stack.len(), 1);
    assert_eq!(exception.stack[0].class_name, "__SHELL1");
    assert_eq!(exception.stack[0].method_name, "run");
    assert_eq!(session.controller.last_exception(), Some(exception));
    assert_eq!(session.controller.state(), DebuggeeState::Idle);
}

#[test]
fn exception_without_message_has_none() {
    let session = with_shell(throw("java.lang.NullPointerException", None));

    let outcome = session.controller.run_shell_class("__SHELL1").unwrap();
    let exception = outcome.exception.unwrap();
    assert_eq!(exception.class_name, "java.lang.NullPointerException");
    assert_eq!(exception.message, None);
}

#[test]
fn exit_request_unwinds_main_with_the_exit_exception() {
    let session = with_shell(ShellBehavior::Exit);

    let outcome = session.controller.run_shell_class("__SHELL1").unwrap();
    assert_eq!(
        outcome,
        RunOutcome {
            status: ExitStatus::ForcedExit,
            exception: None
        }
    );
    assert_eq!(session.mock.stopped_threads(), vec![(MAIN, EXIT_EXCEPTION)]);
    assert_eq!(session.controller.state(), DebuggeeState::Idle);
}

#[test]
fn forced_exit_is_not_overridden_by_a_later_exception() {
    let session = with_shell(ShellBehavior::ExitThenThrow {
        class: "java.lang.RuntimeException".to_string(),
        message: Some("from finally".to_string()),
    });

    let outcome = session.controller.run_shell_class("__SHELL1").unwrap();
    assert_eq!(outcome.status, ExitStatus::ForcedExit);
    assert_eq!(outcome.exception, None);
}

#[test]
fn rejected_invocation_reports_an_internal_error_and_recovers() {
    let mock = MockDebuggee::new();
    mock.define_shell("__SHELL1", ShellBehavior::Reject);
    mock.define_shell("__SHELL2", ShellBehavior::Finish);
    let session = start_with_loader(mock);

    let outcome = session.controller.run_shell_class("__SHELL1").unwrap();
    assert_eq!(outcome.status, ExitStatus::Exception);
    let exception = outcome.exception.unwrap();
    assert_eq!(exception.class_name, "internal error");
    assert!(exception
        .message
        .as_deref()
        .is_some_and(|message| message.contains("invocation refused")));
    assert_eq!(session.controller.state(), DebuggeeState::Idle);

    let next = session.controller.run_shell_class("__SHELL2").unwrap();
    assert_eq!(next.status, ExitStatus::NormalExit);
}

#[test]
fn unknown_shell_class_is_not_found() {
    let session = with_shell(ShellBehavior::Finish);

    let err = session.controller.run_shell_class("__SHELL99").unwrap_err();
    assert!(matches!(&err, BridgeError::ClassNotFound(name) if name == "__SHELL99"), "{err:?}");
    assert!(session.mock.calls_to("run").is_empty());
    assert_eq!(session.controller.state(), DebuggeeState::Idle);
}

#[test]
fn runs_on_main_queue_behind_each_other() {
    let mock = MockDebuggee::new();
    for (name, behavior) in [
        ("__SHELL1", ShellBehavior::Finish),
        ("__SHELL2", throw("java.lang.ArithmeticException", Some("/ by zero"))),
        ("__SHELL3", ShellBehavior::Exit),
    ] {
        mock.define_shell(name, behavior);
    }
    let session = start_with_loader(mock);
    // Load up front so every run goes straight to the main thread.
    for name in ["__SHELL1", "__SHELL2", "__SHELL3"] {
        session.controller.load_class(name).unwrap();
    }

    let handles: Vec<_> = ["__SHELL1", "__SHELL2", "__SHELL3"]
        .into_iter()
        .map(|name| {
            let controller = Arc::clone(&session.controller);
            thread::spawn(move || (name, controller.run_shell_class(name).unwrap().status))
        })
        .collect();
    let mut statuses: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    statuses.sort_by_key(|(name, _)| *name);

    assert_eq!(
        statuses,
        vec![
            ("__SHELL1", ExitStatus::NormalExit),
            ("__SHELL2", ExitStatus::Exception),
            ("__SHELL3", ExitStatus::ForcedExit),
        ]
    );
    assert_eq!(session.mock.calls_to("run").len(), 3);
    eventually("main to park", || session.mock.suspend_count(MAIN) == 1);
}

#[test]
fn outcomes_serialize_in_snake_case() {
    let session = with_shell(throw("java.lang.Error", Some("bad")));

    let outcome = session.controller.run_shell_class("__SHELL1").unwrap();
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["status"], "exception");
    assert_eq!(json["exception"]["class_name"], "java.lang.Error");
    assert_eq!(json["exception"]["message"], "bad");
    assert_eq!(json["exception"]["stack"][0]["method_name"], "run");

    let normal = serde_json::to_value(RunOutcome {
        status: ExitStatus::NormalExit,
        exception: None,
    })
    .unwrap();
    assert_eq!(normal, serde_json::json!({ "status": "normal_exit" }));
}

#[test]
fn worker_failures_during_a_run_do_not_change_its_outcome() {
    let mock = MockDebuggee::new();
    mock.define_user_class("com.example.Foo", &[3, 4]);
    mock.define_shell(
        "__SHELL1",
        ShellBehavior::StopAt {
            class: "com.example.Foo".to_string(),
            line: 3,
        },
    );
    let session = start_with_loader(mock);
    session.controller.set_breakpoint("com.example.Foo", 3).unwrap();

    let controller = Arc::clone(&session.controller);
    let run = thread::spawn(move || controller.run_shell_class("__SHELL1"));
    session.owner.wait_for_hits(1);

    let err = session
        .controller
        .load_class("com.example.Missing")
        .unwrap_err();
    assert!(
        matches!(&err, BridgeError::ClassNotFound(name) if name == "com.example.Missing"),
        "{err:?}"
    );
    // The uncaught-exception event on the worker was seen before the call returned.
    let seen = session.controller.last_exception().unwrap();
    assert_eq!(seen.class_name, "java.lang.ClassNotFoundException");
    assert_eq!(seen.message.as_deref(), Some("com.example.Missing"));
    assert_eq!(seen.stack[0].method_name, "loadClass");

    session.controller.resume_thread(MAIN).unwrap();
    let outcome = run.join().unwrap().unwrap();
    assert_eq!(
        outcome,
        RunOutcome {
            status: ExitStatus::NormalExit,
            exception: None
        }
    );
    assert_eq!(session.controller.exit_status(), Some(ExitStatus::NormalExit));
}
