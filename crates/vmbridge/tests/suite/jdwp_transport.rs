use std::{
    net::{SocketAddr, TcpListener},
    time::Duration,
};

use tokio::runtime::Runtime;

use vmbridge::transport::{
    ClassRef, CodeLocation, DebugTransport, InvokeOutcome, InvokePolicy, JdwpTransport, ObjectRef,
    StackFrameDescriptor, StepDepth, SuspendPolicy, ThreadRef, TransportError, TransportEvent,
};
use vmbridge_config::JdwpConfig;
use vmbridge_jdwp::wire::{
    mock::{
        MockClass, MockEvent, MockEventRequestModifier, MockField, MockInvoke, MockJdwpServer,
        MockJdwpServerConfig, MockMethod, MockObject,
    },
    types::*,
    JdwpValue, Location,
};

const MAIN: u64 = 0x1001;
const WORKER: u64 = 0x1002;
const SERVER: u64 = 0x10;
const VM_SUSPEND: u64 = 0x21;
const LOAD_CLASS: u64 = 0x22;
const FAIL: u64 = 0x23;
const THROWABLE: u64 = 0x40;
const ILLEGAL_STATE: u64 = 0x42;
const DETAIL_MESSAGE: u64 = 0x41;
const THROWN: u64 = 0x500;
const EXIT_EXCEPTION: u64 = 0x600;
const MESSAGE: u64 = 0x700;

fn method(method_id: u64, name: &str, signature: &str, lines: Vec<(u64, i32)>, invoke: MockInvoke) -> MockMethod {
    MockMethod {
        method_id,
        name: name.to_string(),
        signature: signature.to_string(),
        lines,
        invoke,
    }
}

fn suspend_location() -> Location {
    Location {
        type_tag: TYPE_TAG_CLASS,
        class_id: SERVER,
        method_id: VM_SUSPEND,
        index: 4,
    }
}

fn world() -> MockJdwpServerConfig {
    MockJdwpServerConfig {
        threads: vec![
            (MAIN, "main".to_string()),
            (WORKER, "vmbridge-worker".to_string()),
        ],
        classes: vec![
            MockClass {
                type_id: SERVER,
                signature: "Lvmbridge/runtime/ExecServer;".to_string(),
                source_file: "ExecServer.java".to_string(),
                class_loader: 0,
                superclass: 0,
                methods: vec![
                    method(
                        VM_SUSPEND,
                        "vmSuspend",
                        "()V",
                        vec![(0, 20), (4, 21)],
                        MockInvoke::Return(JdwpValue::Void),
                    ),
                    method(
                        LOAD_CLASS,
                        "loadClass",
                        "(Ljava/lang/String;)Ljava/lang/Class;",
                        vec![(0, 40)],
                        MockInvoke::Return(JdwpValue::Object {
                            tag: TAG_CLASS_OBJECT,
                            id: 0x30,
                        }),
                    ),
                    method(FAIL, "fail", "()V", vec![(0, 50)], MockInvoke::Throw(THROWN)),
                ],
                fields: vec![MockField {
                    field_id: 0x31,
                    name: "exitException".to_string(),
                    signature: "Lvmbridge/runtime/ExitException;".to_string(),
                    static_value: JdwpValue::Object {
                        tag: TAG_OBJECT,
                        id: EXIT_EXCEPTION,
                    },
                }],
            },
            MockClass {
                type_id: THROWABLE,
                signature: "Ljava/lang/Throwable;".to_string(),
                source_file: "Throwable.java".to_string(),
                class_loader: 0,
                superclass: 0,
                methods: Vec::new(),
                fields: vec![MockField {
                    field_id: DETAIL_MESSAGE,
                    name: "detailMessage".to_string(),
                    signature: "Ljava/lang/String;".to_string(),
                    static_value: JdwpValue::Object {
                        tag: TAG_STRING,
                        id: 0,
                    },
                }],
            },
            MockClass {
                type_id: ILLEGAL_STATE,
                signature: "Ljava/lang/IllegalStateException;".to_string(),
                source_file: "IllegalStateException.java".to_string(),
                class_loader: 0,
                superclass: THROWABLE,
                methods: Vec::new(),
                fields: Vec::new(),
            },
        ],
        objects: vec![MockObject {
            object_id: THROWN,
            class_id: ILLEGAL_STATE,
            fields: vec![(
                DETAIL_MESSAGE,
                JdwpValue::Object {
                    tag: TAG_STRING,
                    id: MESSAGE,
                },
            )],
        }],
        strings: vec![(MESSAGE, "boom".to_string())],
        frames: vec![(MAIN, vec![suspend_location()])],
        ..MockJdwpServerConfig::default()
    }
}

/// The mock server lives on its own runtime; the transport blocks on another.
struct Wire {
    runtime: Runtime,
    server: MockJdwpServer,
    transport: JdwpTransport,
}

fn connect() -> Wire {
    let runtime = Runtime::new().unwrap();
    let server = runtime
        .block_on(MockJdwpServer::spawn_with_config(world()))
        .unwrap();
    let transport = JdwpTransport::connect(server.addr(), &JdwpConfig::default()).unwrap();
    Wire {
        runtime,
        server,
        transport,
    }
}

fn server_class(wire: &Wire) -> ClassRef {
    wire.transport
        .classes_by_name("vmbridge.runtime.ExecServer")
        .unwrap()
        .remove(0)
}

#[test]
fn threads_and_classes_are_resolved_by_name() {
    let wire = connect();
    let transport = &wire.transport;

    assert_eq!(
        transport.all_threads().unwrap(),
        vec![ThreadRef(MAIN), ThreadRef(WORKER)]
    );
    assert_eq!(transport.thread_name(ThreadRef(WORKER)).unwrap(), "vmbridge-worker");

    let class = server_class(&wire);
    assert_eq!(
        class,
        ClassRef {
            id: SERVER,
            name: "vmbridge.runtime.ExecServer".to_string(),
            loader: ObjectRef::NULL,
        }
    );
    assert!(transport.classes_by_name("com.example.Missing").unwrap().is_empty());

    let names: Vec<String> = transport
        .methods(&class)
        .unwrap()
        .into_iter()
        .map(|method| method.name)
        .collect();
    assert_eq!(names, vec!["vmSuspend", "loadClass", "fail"]);
}

#[test]
fn locations_and_frames_come_from_line_tables() {
    let wire = connect();
    let transport = &wire.transport;
    let class = server_class(&wire);
    let suspend = transport
        .methods(&class)
        .unwrap()
        .into_iter()
        .find(|method| method.name == "vmSuspend")
        .unwrap();

    assert_eq!(
        transport.method_entry(&suspend).unwrap(),
        CodeLocation {
            class_id: SERVER,
            method_id: VM_SUSPEND,
            index: 0
        }
    );
    assert_eq!(
        transport.line_locations(&class, 21).unwrap(),
        vec![CodeLocation {
            class_id: SERVER,
            method_id: VM_SUSPEND,
            index: 4
        }]
    );
    assert!(transport.line_locations(&class, 99).unwrap().is_empty());

    assert_eq!(
        transport.stack_frames(ThreadRef(MAIN)).unwrap(),
        vec![StackFrameDescriptor {
            class_name: "vmbridge.runtime.ExecServer".to_string(),
            method_name: "vmSuspend".to_string(),
            source_file: Some("ExecServer.java".to_string()),
            line: Some(21),
        }]
    );
}

#[test]
fn fields_and_exception_details_are_readable() {
    let wire = connect();
    let transport = &wire.transport;
    let class = server_class(&wire);

    assert_eq!(
        transport.static_field(&class, "exitException").unwrap(),
        Some(JdwpValue::Object {
            tag: TAG_OBJECT,
            id: EXIT_EXCEPTION
        })
    );
    assert_eq!(transport.static_field(&class, "missing").unwrap(), None);

    let thrown = ObjectRef(THROWN);
    let exception_class = transport.class_of(thrown).unwrap();
    assert_eq!(exception_class.name, "java.lang.IllegalStateException");
    assert_eq!(
        transport.object_field(thrown, &exception_class, "detailMessage").unwrap(),
        None
    );
    let throwable = transport.superclass(&exception_class).unwrap().unwrap();
    assert_eq!(throwable.name, "java.lang.Throwable");
    assert_eq!(transport.superclass(&throwable).unwrap(), None);

    let message = transport
        .object_field(thrown, &throwable, "detailMessage")
        .unwrap()
        .and_then(|value| value.object_id())
        .unwrap();
    assert_eq!(transport.string_value(ObjectRef(message)).unwrap(), "boom");

    let created = transport.create_string("hello").unwrap();
    assert_eq!(transport.string_value(created).unwrap(), "hello");
}

#[test]
fn event_requests_carry_the_right_modifiers() {
    let wire = connect();
    let transport = &wire.transport;
    let location = CodeLocation {
        class_id: SERVER,
        method_id: VM_SUSPEND,
        index: 4,
    };

    let breakpoint = transport
        .set_breakpoint(&location, SuspendPolicy::EventThread)
        .unwrap();
    transport
        .request_uncaught_exceptions(SuspendPolicy::EventThread)
        .unwrap();
    transport
        .request_class_prepare("vmbridge.runtime.ExecServer", SuspendPolicy::All)
        .unwrap();
    transport.request_step(ThreadRef(MAIN), StepDepth::Over).unwrap();
    transport.request_thread_lifecycle().unwrap();

    let requests = wire.runtime.block_on(wire.server.event_requests());
    let summary: Vec<(u8, u8, Vec<MockEventRequestModifier>)> = requests
        .iter()
        .map(|r| (r.event_kind, r.suspend_policy, r.modifiers.clone()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (
                EVENT_KIND_BREAKPOINT,
                SUSPEND_POLICY_EVENT_THREAD,
                vec![MockEventRequestModifier::LocationOnly {
                    location: suspend_location()
                }]
            ),
            (
                EVENT_KIND_EXCEPTION,
                SUSPEND_POLICY_EVENT_THREAD,
                vec![MockEventRequestModifier::ExceptionOnly {
                    exception_or_null: 0,
                    caught: false,
                    uncaught: true
                }]
            ),
            (
                EVENT_KIND_CLASS_PREPARE,
                SUSPEND_POLICY_ALL,
                vec![MockEventRequestModifier::ClassMatch {
                    pattern: "vmbridge.runtime.ExecServer".to_string()
                }]
            ),
            (
                EVENT_KIND_SINGLE_STEP,
                SUSPEND_POLICY_EVENT_THREAD,
                vec![
                    MockEventRequestModifier::Step {
                        thread: MAIN,
                        size: STEP_SIZE_LINE,
                        depth: STEP_DEPTH_OVER
                    },
                    MockEventRequestModifier::Count { count: 1 }
                ]
            ),
            (EVENT_KIND_THREAD_START, SUSPEND_POLICY_NONE, Vec::new()),
            (EVENT_KIND_THREAD_DEATH, SUSPEND_POLICY_NONE, Vec::new()),
        ]
    );

    transport.clear_breakpoint(breakpoint).unwrap();
    transport
        .set_breakpoint(&location, SuspendPolicy::None)
        .unwrap();
    transport.clear_all_breakpoints().unwrap();
    let requests = wire.runtime.block_on(wire.server.event_requests());
    assert!(requests.iter().all(|r| r.event_kind != EVENT_KIND_BREAKPOINT));
    assert_eq!(wire.server.clear_all_breakpoints_calls(), 1);
}

#[test]
fn invocations_map_policies_and_outcomes() {
    let wire = connect();
    let transport = &wire.transport;
    let class = server_class(&wire);
    let methods = transport.methods(&class).unwrap();
    let load = methods.iter().find(|m| m.name == "loadClass").unwrap();
    let fail = methods.iter().find(|m| m.name == "fail").unwrap();

    let name = transport.create_string("com.example.Foo").unwrap();
    let arg = JdwpValue::Object {
        tag: TAG_STRING,
        id: name.0,
    };
    let returned = transport
        .invoke_static(
            &class,
            ThreadRef(WORKER),
            load,
            std::slice::from_ref(&arg),
            InvokePolicy::SingleThreaded,
        )
        .unwrap();
    assert_eq!(
        returned,
        InvokeOutcome::Returned(JdwpValue::Object {
            tag: TAG_CLASS_OBJECT,
            id: 0x30
        })
    );

    let threw = transport
        .invoke_static(&class, ThreadRef(MAIN), fail, &[], InvokePolicy::ResumeAll)
        .unwrap();
    assert_eq!(threw, InvokeOutcome::Threw(ObjectRef(THROWN)));

    let invocations = wire.runtime.block_on(wire.server.invocations());
    assert_eq!(invocations.len(), 2);
    assert_eq!(invocations[0].thread, WORKER);
    assert_eq!(invocations[0].args, vec![arg]);
    assert_eq!(invocations[0].options, INVOKE_SINGLE_THREADED);
    assert_eq!(invocations[1].options, 0);
}

#[test]
fn thread_control_reaches_the_debuggee() {
    let wire = connect();
    let transport = &wire.transport;

    transport.suspend_all().unwrap();
    assert!(transport.is_suspended(ThreadRef(MAIN)).unwrap());
    transport.resume_thread(ThreadRef(MAIN)).unwrap();
    assert!(!transport.is_suspended(ThreadRef(MAIN)).unwrap());
    assert!(transport.is_suspended(ThreadRef(WORKER)).unwrap());
    transport.resume_all().unwrap();
    assert!(!transport.is_suspended(ThreadRef(WORKER)).unwrap());
    assert_eq!(wire.server.vm_suspend_calls(), 1);
    assert_eq!(wire.server.vm_resume_calls(), 1);

    transport
        .stop_thread(ThreadRef(MAIN), ObjectRef(EXIT_EXCEPTION))
        .unwrap();
    assert_eq!(
        wire.runtime.block_on(wire.server.stopped_threads()),
        vec![(MAIN, EXIT_EXCEPTION)]
    );

    wire.server
        .set_reply_error(11, 3, ERROR_THREAD_NOT_SUSPENDED);
    assert_eq!(
        transport.resume_thread(ThreadRef(MAIN)),
        Err(TransportError::ThreadNotSuspended(MAIN))
    );
}

#[test]
fn events_are_translated_until_the_debuggee_goes_away() {
    let wire = connect();
    let transport = &wire.transport;
    let request = transport
        .set_breakpoint(
            &CodeLocation {
                class_id: SERVER,
                method_id: VM_SUSPEND,
                index: 4,
            },
            SuspendPolicy::EventThread,
        )
        .unwrap();
    transport
        .request_class_prepare("vmbridge.runtime.ExecServer", SuspendPolicy::All)
        .unwrap();

    wire.runtime.block_on(wire.server.emit_event(MockEvent::Breakpoint {
        request_id: request.0,
        thread: WORKER,
        location: suspend_location(),
    }));
    assert_eq!(
        transport.next_event().unwrap(),
        Some(TransportEvent::Breakpoint {
            request,
            thread: ThreadRef(WORKER),
            location: CodeLocation {
                class_id: SERVER,
                method_id: VM_SUSPEND,
                index: 4,
            },
        })
    );

    wire.runtime.block_on(wire.server.emit_event(MockEvent::ClassPrepare {
        thread: MAIN,
        type_id: SERVER,
    }));
    match transport.next_event().unwrap() {
        Some(TransportEvent::ClassPrepare { thread, class, .. }) => {
            assert_eq!(thread, ThreadRef(MAIN));
            assert_eq!(class.name, "vmbridge.runtime.ExecServer");
        }
        other => panic!("expected class prepare, got {other:?}"),
    }

    wire.runtime
        .block_on(wire.server.emit_event(MockEvent::ThreadStart { thread: WORKER }));
    assert_eq!(
        transport.next_event().unwrap(),
        Some(TransportEvent::ThreadStart {
            thread: ThreadRef(WORKER)
        })
    );

    wire.server.disconnect();
    assert!(matches!(
        transport.next_event(),
        Ok(None) | Err(TransportError::Disconnected)
    ));
    assert!(transport.all_threads().is_err());
}

#[test]
fn dispose_is_idempotent() {
    let wire = connect();

    wire.transport.dispose();
    wire.transport.dispose();
    assert_eq!(wire.server.dispose_calls(), 1);
    assert!(wire.transport.all_threads().is_err());
}

#[test]
fn attach_gives_up_once_the_child_is_gone() {
    let addr: SocketAddr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let mut checks = 0;
    let result = JdwpTransport::attach_with_retry(
        addr,
        &JdwpConfig::default(),
        5,
        Duration::from_millis(10),
        || {
            checks += 1;
            false
        },
    );
    let err = result.err().unwrap();
    assert!(err.is_connection_refused(), "{err:?}");
    assert_eq!(checks, 1);
}

#[test]
fn attach_retries_until_attempts_run_out() {
    let addr: SocketAddr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let mut checks = 0;
    let result = JdwpTransport::attach_with_retry(
        addr,
        &JdwpConfig::default(),
        3,
        Duration::from_millis(5),
        || {
            checks += 1;
            true
        },
    );
    assert!(result.is_err());
    assert_eq!(checks, 2);
}
