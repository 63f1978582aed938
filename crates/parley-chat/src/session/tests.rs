use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};

use super::*;
use crate::error::{ChatError, FETCH_FAILED_MESSAGE};
use crate::message::{Message, Part, Role, ToolCall, ToolInvocation, ToolInvocationState};
use crate::orchestrator::{tool_handler_fn, trailing_assistant_count, ToolHandlerError};
use crate::protocol::{FinishReason, StreamMode};
use crate::test_support::{sequential_ids, ScriptedResponse, ScriptedTransport};
use crate::transport::Method;
use crate::ExchangeOutcome;
use parley_config::DeferredResubmit;

const FINISH_STOP: &str = r#"d:{"finishReason":"stop"}"#;
const FINISH_TOOLS: &str = r#"d:{"finishReason":"tool-calls"}"#;

fn options() -> SessionOptions {
    SessionOptions::new("http://test.local/api/chat").with_id("chat-1")
}

fn session_with(
    transport: Arc<ScriptedTransport>,
    options: SessionOptions,
    handlers: Handlers,
) -> ChatSession {
    ChatSession::builder(options)
        .transport(transport)
        .handlers(handlers)
        .id_generator(sequential_ids())
        .build()
}

fn tool_call_line(id: &str) -> String {
    format!(r#"9:{{"toolCallId":"{id}","toolName":"weather","args":{{"city":"Oslo"}}}}"#)
}

fn pending_call(id: &str) -> Part {
    Part::ToolInvocation {
        tool_invocation: ToolInvocation::call(
            ToolCall {
                tool_call_id: id.into(),
                tool_name: "weather".into(),
                args: json!({"city": "Oslo"}),
            },
            0,
        ),
    }
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    predicate: impl Fn(&SessionEvent) -> bool,
) {
    loop {
        match rx.recv().await {
            Ok(event) if predicate(&event) => return,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("session event channel closed"),
        }
    }
}

fn has_call_in_state(event: &SessionEvent, id: &str, state: ToolInvocationState) -> bool {
    matches!(
        event,
        SessionEvent::MessageUpserted { message, .. }
            if message.tool_invocation(id).is_some_and(|call| call.state() == state)
    )
}

#[tokio::test]
async fn text_deltas_become_one_assistant_message() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"0:"Hello""#,
        r#"0:",""#,
        r#"0:" world""#,
        r#"0:".""#,
        FINISH_STOP,
    ])]);
    let mut session = session_with(transport.clone(), options(), Handlers::default());
    let mut rx = session.subscribe();

    let outcome = session
        .append(Message::user("Say hello"), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, ExchangeOutcome::Finished);
    assert_eq!(session.status(), SessionStatus::Ready);
    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, "id-0");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content(), "Hello, world.");
    assert_eq!(messages[1].parts.len(), 1);

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::Post);
    assert_eq!(requests[0].url, "http://test.local/api/chat");
    let body = &transport.bodies()[0];
    assert_eq!(body["id"], json!("chat-1"));
    assert_eq!(body["messages"][0]["content"], json!("Say hello"));

    let statuses: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::StatusChanged(status) => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            SessionStatus::Submitted,
            SessionStatus::Streaming,
            SessionStatus::Ready
        ]
    );
}

#[tokio::test]
async fn text_is_independent_of_chunk_boundaries() {
    let lines = [r#"0:"Grüß ""#, r#"0:"dich""#, FINISH_STOP];
    for size in [1, 2, 3, 7] {
        let transport =
            ScriptedTransport::new(vec![ScriptedResponse::stream(&lines).rechunk(size)]);
        let mut session = session_with(transport, options(), Handlers::default());
        session
            .append(Message::user("hi"), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(session.messages()[1].content(), "Grüß dich", "chunk size {size}");
    }
}

#[tokio::test]
async fn non_success_status_surfaces_the_body_text() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::status(404, "Not found")]);
    let mut session = session_with(transport, options(), Handlers::default());

    let err = session
        .append(Message::user("hi"), RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Not found");
    assert_eq!(err.status(), Some(404));
    assert_eq!(session.status(), SessionStatus::Error);
    assert_eq!(session.error().unwrap().to_string(), "Not found");
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test]
async fn non_success_status_without_body_uses_generic_message() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::status(500, "")]);
    let mut session = session_with(transport, options(), Handlers::default());
    let err = session
        .append(Message::user("hi"), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), FETCH_FAILED_MESSAGE);
}

#[tokio::test]
async fn network_failure_is_a_transport_error() {
    let transport = ScriptedTransport::failing(ChatError::network("connection refused"));
    let mut session = session_with(transport, options(), Handlers::default());
    let err = session
        .append(Message::user("hi"), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Transport { status: None, .. }));
    assert_eq!(session.status(), SessionStatus::Error);
}

#[tokio::test]
async fn empty_body_is_an_empty_stream_error() {
    for response in [ScriptedResponse::stream(&[]), ScriptedResponse::without_body()] {
        let transport = ScriptedTransport::new(vec![response]);
        let mut session = session_with(transport, options(), Handlers::default());
        let err = session
            .append(Message::user("hi"), RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::EmptyStream);
        assert_eq!(session.status(), SessionStatus::Error);
    }
}

#[tokio::test]
async fn error_handler_receives_failures_instead_of_the_caller() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handlers = Handlers::new().on_error(move |err| sink.lock().unwrap().push(err.clone()));
    let transport = ScriptedTransport::new(vec![ScriptedResponse::status(401, "Unauthorized")]);
    let mut session = session_with(transport, options(), handlers);

    let outcome = session
        .append(Message::user("hi"), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, ExchangeOutcome::Failed);
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(session.status(), SessionStatus::Error);
}

#[tokio::test]
async fn stream_error_record_fails_the_exchange_but_keeps_partial_text() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"0:"Partial""#,
        r#"3:"model overloaded""#,
    ])]);
    let mut session = session_with(transport, options(), Handlers::default());
    let err = session
        .append(Message::user("hi"), RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err, ChatError::Stream("model overloaded".into()));
    assert_eq!(session.messages().len(), 2);
    assert_eq!(session.messages()[1].content(), "Partial");
}

#[tokio::test]
async fn drop_last_message_on_error_rolls_back_the_stream() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"0:"Partial""#,
        r#"3:"model overloaded""#,
    ])]);
    let mut session = session_with(
        transport,
        options().with_drop_last_message_on_error(true),
        Handlers::default(),
    );
    let _ = session
        .append(Message::user("hi"), RequestOptions::default())
        .await;

    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].role, Role::User);
}

#[tokio::test]
async fn decode_warnings_do_not_stop_the_stream() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"0:"a""#,
        "not a record",
        r#"z:"future tag""#,
        r#"0:"b""#,
        FINISH_STOP,
    ])]);
    let mut session = session_with(transport, options(), Handlers::default());
    session
        .append(Message::user("hi"), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(session.messages()[1].content(), "ab");
}

#[tokio::test]
async fn tool_call_then_cancel_leaves_the_call_unresolved() {
    let call = tool_call_line("c1");
    let transport =
        ScriptedTransport::new(vec![ScriptedResponse::stream(&[call.as_str()]).stalled()]);
    let mut session = session_with(transport, options(), Handlers::default());
    let handle = session.handle();
    let mut rx = session.subscribe();

    let stopper = tokio::spawn(async move {
        wait_for(&mut rx, |event| {
            has_call_in_state(event, "c1", ToolInvocationState::Call)
        })
        .await;
        handle.stop().unwrap();
    });

    let outcome = session
        .append(Message::user("weather?"), RequestOptions::default())
        .await
        .unwrap();
    stopper.await.unwrap();

    assert_eq!(outcome, ExchangeOutcome::Aborted);
    assert_eq!(session.status(), SessionStatus::Ready);
    assert!(session.error().is_none());
    let invocation = session.messages()[1].tool_invocation("c1").unwrap();
    assert_eq!(invocation.state(), ToolInvocationState::Call);
}

#[tokio::test]
async fn stop_before_the_response_returns_to_ready() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::hang()]);
    let mut session = session_with(transport, options(), Handlers::default());
    let handle = session.handle();
    let mut rx = session.subscribe();

    let stopper = tokio::spawn(async move {
        wait_for(&mut rx, |event| {
            matches!(event, SessionEvent::StatusChanged(SessionStatus::Submitted))
        })
        .await;
        handle.stop().unwrap();
    });

    let outcome = session
        .append(Message::user("hi"), RequestOptions::default())
        .await
        .unwrap();
    stopper.await.unwrap();
    assert_eq!(outcome, ExchangeOutcome::Aborted);
    assert_eq!(session.status(), SessionStatus::Ready);
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test]
async fn stop_while_reading_an_error_body_returns_to_ready() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::status(500, "").stalled()]);
    let mut session = session_with(transport, options(), Handlers::default());
    let handle = session.handle();
    let mut rx = session.subscribe();

    let stopper = tokio::spawn(async move {
        wait_for(&mut rx, |event| {
            matches!(event, SessionEvent::StatusChanged(SessionStatus::Submitted))
        })
        .await;
        handle.stop().unwrap();
    });

    let outcome = session
        .append(Message::user("hi"), RequestOptions::default())
        .await
        .unwrap();
    stopper.await.unwrap();

    assert_eq!(outcome, ExchangeOutcome::Aborted);
    assert_eq!(session.status(), SessionStatus::Ready);
    assert!(session.error().is_none());
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test]
async fn repeated_tool_call_record_runs_the_handler_once() {
    let call = tool_call_line("c1");
    let transport = ScriptedTransport::new(vec![
        ScriptedResponse::stream(&[call.as_str(), call.as_str(), FINISH_TOOLS]),
        ScriptedResponse::stream(&[r#"0:"It is sunny.""#, FINISH_STOP]),
    ]);
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&runs);
    let handlers = Handlers::new().on_tool_call(tool_handler_fn(move |_call: ToolCall| {
        let counted = Arc::clone(&counted);
        async move {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ToolHandlerError>(Some(json!("sunny")))
        }
    }));
    let mut session = session_with(transport.clone(), options().with_max_steps(3), handlers);

    let outcome = session
        .append(Message::user("weather?"), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, ExchangeOutcome::Finished);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(session.messages()[1].tool_invocations().count(), 1);
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test]
async fn client_tool_results_trigger_a_continuation() {
    let call = tool_call_line("c1");
    let transport = ScriptedTransport::new(vec![
        ScriptedResponse::stream(&[call.as_str(), FINISH_TOOLS]),
        ScriptedResponse::stream(&[r#"0:"It is sunny.""#, FINISH_STOP]),
    ]);
    let handlers = Handlers::new().on_tool_call(tool_handler_fn(|call: ToolCall| async move {
        assert_eq!(call.args["city"], json!("Oslo"));
        Ok::<_, ToolHandlerError>(Some(json!("sunny")))
    }));
    let mut session = session_with(transport.clone(), options().with_max_steps(3), handlers);

    let outcome = session
        .append(Message::user("weather?"), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, ExchangeOutcome::Finished);
    let messages = session.messages();
    assert_eq!(messages.len(), 3);
    let invocation = messages[1].tool_invocation("c1").unwrap();
    assert_eq!(invocation.result(), Some(&json!("sunny")));
    assert_eq!(messages[2].content(), "It is sunny.");

    let bodies = transport.bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(
        bodies[1]["messages"][1]["toolInvocations"][0]["state"],
        json!("result")
    );
}

#[tokio::test]
async fn continuation_is_bounded_by_max_steps() {
    let lines: Vec<String> = (0..5).map(|n| tool_call_line(&format!("c{n}"))).collect();
    let responses = lines
        .iter()
        .map(|line| ScriptedResponse::stream(&[line.as_str(), FINISH_TOOLS]))
        .collect();
    let transport = ScriptedTransport::new(responses);
    let handlers = Handlers::new().on_tool_call(tool_handler_fn(|_call: ToolCall| async move {
        Ok::<_, ToolHandlerError>(Some(json!("done")))
    }));
    let mut session = session_with(transport.clone(), options().with_max_steps(3), handlers);

    session
        .append(Message::user("loop"), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(transport.requests().len(), 3);
    assert_eq!(trailing_assistant_count(session.messages()), 3);
}

#[tokio::test]
async fn single_step_sessions_do_not_continue() {
    let call = tool_call_line("c1");
    let transport = ScriptedTransport::new(vec![
        ScriptedResponse::stream(&[call.as_str(), FINISH_TOOLS]),
        ScriptedResponse::stream(&[r#"0:"unused""#, FINISH_STOP]),
    ]);
    let handlers = Handlers::new().on_tool_call(tool_handler_fn(|_call: ToolCall| async move {
        Ok::<_, ToolHandlerError>(Some(json!("done")))
    }));
    let mut session = session_with(transport.clone(), options(), handlers);

    session
        .append(Message::user("once"), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(transport.requests().len(), 1);
    assert!(session.messages()[1].tool_calls_resolved());
}

#[tokio::test]
async fn failing_tool_handler_is_a_tool_execution_error() {
    let call = tool_call_line("c1");
    let transport =
        ScriptedTransport::new(vec![ScriptedResponse::stream(&[call.as_str(), FINISH_TOOLS])]);
    let handlers = Handlers::new().on_tool_call(tool_handler_fn(|_call: ToolCall| async move {
        Err::<Option<serde_json::Value>, ToolHandlerError>("disk full".into())
    }));
    let mut session = session_with(transport, options().with_max_steps(3), handlers);

    let err = session
        .append(Message::user("save"), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ChatError::ToolExecution {
            tool_call_id: "c1".into(),
            message: "disk full".into(),
        }
    );
    assert_eq!(session.status(), SessionStatus::Error);
}

#[tokio::test]
async fn add_tool_result_is_idempotent_and_continues_once() {
    let initial = vec![
        Message::user("weather?").with_id("u1"),
        Message::new(Role::Assistant)
            .with_id("a1")
            .with_part(pending_call("c1")),
    ];
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"0:"Thanks""#,
        FINISH_STOP,
    ])]);
    let mut session = session_with(
        transport.clone(),
        options().with_initial_messages(initial),
        Handlers::default(),
    );

    let first = session.add_tool_result("c1", json!(42)).await.unwrap();
    assert_eq!(first, ExchangeOutcome::Finished);
    let after_first = session.messages().to_vec();
    assert_eq!(after_first.len(), 3);

    let second = session.add_tool_result("c1", json!(42)).await.unwrap();
    assert_eq!(second, ExchangeOutcome::Idle);
    assert_eq!(session.messages(), after_first.as_slice());
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn add_tool_result_waits_for_every_call() {
    let initial = vec![
        Message::user("two things").with_id("u1"),
        Message::new(Role::Assistant)
            .with_id("a1")
            .with_part(pending_call("c1"))
            .with_part(pending_call("c2")),
    ];
    let transport = ScriptedTransport::new(vec![]);
    let mut session = session_with(
        transport.clone(),
        options().with_initial_messages(initial),
        Handlers::default(),
    );

    assert_eq!(
        session.add_tool_result("c1", json!(1)).await.unwrap(),
        ExchangeOutcome::Idle
    );
    assert_eq!(
        session.add_tool_result("missing", json!(1)).await.unwrap(),
        ExchangeOutcome::Idle
    );
    assert!(transport.requests().is_empty());
    assert_eq!(
        session.messages()[1].tool_invocation("c1").unwrap().state(),
        ToolInvocationState::Result
    );
}

async fn run_deferred(policy: DeferredResubmit) -> (ChatSession, Arc<ScriptedTransport>) {
    let (gate_tx, gate_rx) = oneshot::channel();
    let call = tool_call_line("c1");
    let transport = ScriptedTransport::new(vec![
        ScriptedResponse::stream(&[call.as_str()])
            .then_after(gate_rx, &[r#"0:"Checking.""#, FINISH_TOOLS]),
        ScriptedResponse::stream(&[r#"0:"It is sunny.""#, FINISH_STOP]),
    ]);
    let mut session = session_with(
        transport.clone(),
        options().with_deferred_resubmit(policy),
        Handlers::default(),
    );
    let handle = session.handle();
    let mut rx = session.subscribe();

    let responder = tokio::spawn(async move {
        wait_for(&mut rx, |event| {
            has_call_in_state(event, "c1", ToolInvocationState::Call)
        })
        .await;
        handle.add_tool_result("c1", json!("sunny")).unwrap();
        gate_tx.send(()).unwrap();
    });

    let outcome = session
        .append(Message::user("weather?"), RequestOptions::default())
        .await
        .unwrap();
    responder.await.unwrap();
    assert_eq!(outcome, ExchangeOutcome::Finished);
    (session, transport)
}

#[tokio::test]
async fn mid_stream_tool_result_resubmits_after_completion() {
    let (session, transport) = run_deferred(DeferredResubmit::PostCompletion).await;

    let messages = session.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].content(), "Checking.");
    assert!(messages[1].tool_calls_resolved());
    assert_eq!(messages[2].content(), "It is sunny.");

    let bodies = transport.bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[1]["messages"][1]["content"], json!("Checking."));
}

#[tokio::test]
async fn origin_snapshot_policy_sends_the_transcript_seen_at_submission() {
    let (session, transport) = run_deferred(DeferredResubmit::OriginSnapshot).await;

    assert_eq!(session.messages()[1].content(), "Checking.");
    let bodies = transport.bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[1]["messages"][1]["content"], json!(""));
    assert_eq!(
        bodies[1]["messages"][1]["toolInvocations"][0]["state"],
        json!("result")
    );
}

#[tokio::test]
async fn reload_replaces_the_last_assistant_answer() {
    let initial = vec![
        Message::user("q").with_id("u1"),
        Message::assistant("old answer").with_id("a1"),
    ];
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"0:"new answer""#,
        FINISH_STOP,
    ])]);
    let mut session = session_with(
        transport.clone(),
        options().with_initial_messages(initial),
        Handlers::default(),
    );

    session.reload(RequestOptions::default()).await.unwrap();

    let bodies = transport.bodies();
    assert_eq!(bodies[0]["messages"].as_array().unwrap().len(), 1);
    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content(), "new answer");
    assert_ne!(messages[1].id, "a1");
}

#[tokio::test]
async fn reload_after_a_user_turn_resubmits_as_is() {
    let initial = vec![Message::user("q").with_id("u1")];
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"0:"answer""#,
        FINISH_STOP,
    ])]);
    let mut session = session_with(
        transport.clone(),
        options().with_initial_messages(initial),
        Handlers::default(),
    );

    session.reload(RequestOptions::default()).await.unwrap();
    assert_eq!(transport.bodies()[0]["messages"].as_array().unwrap().len(), 1);
    assert_eq!(session.messages().len(), 2);
}

#[tokio::test]
async fn resume_replaces_the_streamed_placeholder() {
    let placeholder = Message::assistant("half an ans").with_id("a1");
    let initial = vec![Message::user("q").with_id("u1"), placeholder];
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"f:{"messageId":"server-id"}"#,
        r#"0:"half an answer, finished""#,
        FINISH_STOP,
    ])]);
    let mut session = session_with(
        transport.clone(),
        options().with_initial_messages(initial),
        Handlers::default(),
    );

    let outcome = session.resume(RequestOptions::default()).await.unwrap();

    assert_eq!(outcome, ExchangeOutcome::Finished);
    let request = &transport.requests()[0];
    assert_eq!(request.method, Method::Get);
    assert_eq!(request.url, "http://test.local/api/chat?chatId=chat-1");
    assert!(request.body.is_none());

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].id, "a1");
    assert_eq!(messages[1].content(), "half an answer, finished");
}

#[tokio::test]
async fn tool_result_added_during_resume_survives_the_replay() {
    let initial = vec![
        Message::user("weather?").with_id("u1"),
        Message::assistant("").with_id("a1").with_part(pending_call("c1")),
    ];
    let (gate_tx, gate_rx) = oneshot::channel();
    let call = tool_call_line("c1");
    let transport = ScriptedTransport::new(vec![
        ScriptedResponse::stream(&[]).then_after(gate_rx, &[call.as_str(), FINISH_TOOLS]),
        ScriptedResponse::stream(&[r#"0:"It is sunny.""#, FINISH_STOP]),
    ]);
    let mut session = session_with(
        transport.clone(),
        options().with_initial_messages(initial),
        Handlers::default(),
    );
    let handle = session.handle();
    let mut rx = session.subscribe();

    let responder = tokio::spawn(async move {
        wait_for(&mut rx, |event| {
            matches!(event, SessionEvent::StatusChanged(SessionStatus::Submitted))
        })
        .await;
        handle.add_tool_result("c1", json!("sunny")).unwrap();
        wait_for(&mut rx, |event| {
            has_call_in_state(event, "c1", ToolInvocationState::Result)
        })
        .await;
        gate_tx.send(()).unwrap();
    });

    let outcome = session.resume(RequestOptions::default()).await.unwrap();
    responder.await.unwrap();

    assert_eq!(outcome, ExchangeOutcome::Finished);
    let messages = session.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].id, "a1");
    let invocation = messages[1].tool_invocation("c1").unwrap();
    assert_eq!(invocation.state(), ToolInvocationState::Result);
    assert_eq!(invocation.result(), Some(&json!("sunny")));
    assert_eq!(messages[2].content(), "It is sunny.");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, Method::Get);
    assert_eq!(requests[1].method, Method::Post);
}

#[tokio::test]
async fn resume_with_nothing_to_resume_is_an_empty_stream() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[])]);
    let mut session = session_with(transport, options(), Handlers::default());
    let err = session.resume(RequestOptions::default()).await.unwrap_err();
    assert_eq!(err, ChatError::EmptyStream);
}

#[tokio::test]
async fn finish_handler_and_usage_see_the_final_message() {
    let finished = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&finished);
    let handlers = Handlers::new().on_finish(move |message, info| {
        sink.lock()
            .unwrap()
            .push((message.content(), info.finish_reason));
    });
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"0:"Done.""#,
        r#"d:{"finishReason":"stop","usage":{"promptTokens":3,"completionTokens":5}}"#,
    ])]);
    let mut session = session_with(transport, options(), handlers);
    let mut rx = session.subscribe();

    session
        .append(Message::user("hi"), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(
        finished.lock().unwrap().as_slice(),
        &[("Done.".to_string(), FinishReason::Stop)]
    );
    assert_eq!(session.usage().total_tokens(), 8);
    assert_eq!(session.usage().finish_count(), 1);
    assert!(drain(&mut rx)
        .iter()
        .any(|event| matches!(event, SessionEvent::Finished { .. })));
}

#[tokio::test]
async fn data_records_go_to_streaming_data() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"2:[{"progress":0.5}]"#,
        r#"0:"ok""#,
        r#"2:[{"progress":1}]"#,
        FINISH_STOP,
    ])]);
    let mut session = session_with(transport, options(), Handlers::default());
    let mut rx = session.subscribe();

    session
        .append(Message::user("hi"), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(
        session.streaming_data(),
        &[json!({"progress": 0.5}), json!({"progress": 1})]
    );
    let appended = drain(&mut rx)
        .into_iter()
        .filter(|event| matches!(event, SessionEvent::DataAppended { .. }))
        .count();
    assert_eq!(appended, 2);
}

#[tokio::test]
async fn request_merges_session_and_call_options() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"0:"ok""#,
        FINISH_STOP,
    ])]);
    let options = options()
        .with_header("Authorization", "Bearer session")
        .with_header("x-client", "parley")
        .with_body_field("model", json!("small"));
    let mut session = session_with(transport.clone(), options, Handlers::default());

    let call = RequestOptions::new()
        .with_header("authorization", "Bearer call")
        .with_body_field("model", json!("large"))
        .with_data(json!({"locale": "nb"}))
        .with_attachment(crate::message::Attachment::new("https://example.com/cat.png"));
    session.append(Message::user("look"), call).await.unwrap();

    let request = &transport.requests()[0];
    assert_eq!(request.headers.len(), 2);
    assert_eq!(
        request.headers.get("authorization").map(String::as_str),
        Some("Bearer call")
    );
    let body = &transport.bodies()[0];
    assert_eq!(body["model"], json!("large"));
    assert_eq!(body["data"], json!({"locale": "nb"}));
    assert_eq!(
        body["messages"][0]["attachments"][0]["url"],
        json!("https://example.com/cat.png")
    );
    assert_eq!(session.messages()[0].attachments.len(), 1);
}

#[tokio::test]
async fn plain_mode_streams_raw_text() {
    let finished = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&finished);
    let handlers = Handlers::new().on_finish(move |_, info| {
        *sink.lock().unwrap() = Some(info.finish_reason);
    });
    let transport = ScriptedTransport::new(vec![ScriptedResponse::plain(&["Hel", "lo"])]);
    let mut session = session_with(
        transport,
        options().with_stream_mode(StreamMode::Plain),
        handlers,
    );

    session
        .append(Message::user("hi"), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(session.messages()[1].content(), "Hello");
    assert_eq!(*finished.lock().unwrap(), Some(FinishReason::Unknown));
}

#[tokio::test]
async fn data_stream_header_overrides_plain_mode() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"0:"structured""#,
        FINISH_STOP,
    ])]);
    let mut session = session_with(
        transport,
        options().with_stream_mode(StreamMode::Plain),
        Handlers::default(),
    );
    session
        .append(Message::user("hi"), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(session.messages()[1].content(), "structured");
}

#[tokio::test]
async fn missing_ids_are_assigned_before_sending() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"0:"ok""#,
        FINISH_STOP,
    ])]);
    let mut session = session_with(
        transport.clone(),
        options().with_extra_message_fields(true),
        Handlers::default(),
    );
    session.set_messages(vec![Message::user("no id yet")]);

    session.reload(RequestOptions::default()).await.unwrap();

    let body = &transport.bodies()[0];
    assert_eq!(body["messages"][0]["id"], json!("id-0"));
    assert!(body["messages"][0]["createdAt"].is_string());
    assert_eq!(session.messages()[0].id, "id-0");
}

#[tokio::test]
async fn reset_and_clear_error_restore_a_clean_session() {
    let initial = vec![Message::system("be brief").with_id("s1")];
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"2:[1]"#,
        r#"3:"boom""#,
    ])]);
    let mut session = session_with(
        transport,
        options().with_initial_messages(initial.clone()),
        Handlers::default(),
    );
    let mut rx = session.subscribe();

    let _ = session
        .append(Message::user("hi"), RequestOptions::default())
        .await;
    assert_eq!(session.status(), SessionStatus::Error);
    assert_eq!(session.streaming_data(), &[json!(1)]);

    session.clear_error();
    assert_eq!(session.status(), SessionStatus::Ready);
    assert!(session.error().is_none());

    session.reset();
    assert_eq!(session.messages(), initial.as_slice());
    assert!(session.streaming_data().is_empty());
    assert!(drain(&mut rx)
        .iter()
        .any(|event| matches!(event, SessionEvent::TranscriptReplaced { .. })));
}

#[tokio::test]
async fn updated_handlers_win_and_unset_restores_the_configured_one() {
    let configured = Arc::new(AtomicUsize::new(0));
    let replacement = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&configured);
    let handlers = Handlers::new().on_finish(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let transport = ScriptedTransport::new(vec![
        ScriptedResponse::stream(&[r#"0:"one""#, FINISH_STOP]),
        ScriptedResponse::stream(&[r#"0:"two""#, FINISH_STOP]),
    ]);
    let mut session = session_with(transport, options(), handlers);

    let counter = Arc::clone(&replacement);
    session.update_handlers(HandlerUpdate {
        on_finish: HandlerChange::Set(Arc::new(move |_: &Message, _: &crate::protocol::FinishInfo| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        ..HandlerUpdate::default()
    });
    session
        .append(Message::user("1"), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(configured.load(Ordering::SeqCst), 0);
    assert_eq!(replacement.load(Ordering::SeqCst), 1);

    session.update_handlers(HandlerUpdate {
        on_finish: HandlerChange::Unset,
        ..HandlerUpdate::default()
    });
    session
        .append(Message::user("2"), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(configured.load(Ordering::SeqCst), 1);
    assert_eq!(replacement.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn run_pending_drains_queued_commands() {
    let transport = ScriptedTransport::new(vec![ScriptedResponse::stream(&[
        r#"0:"queued""#,
        FINISH_STOP,
    ])]);
    let mut session = session_with(transport, options(), Handlers::default());
    let handle = session.handle();
    handle
        .append(Message::user("from another task"), RequestOptions::default())
        .unwrap();

    let outcome = session.run_pending().await.unwrap();
    assert_eq!(outcome, ExchangeOutcome::Finished);
    assert_eq!(session.messages()[1].content(), "queued");
    assert_eq!(session.run_pending().await.unwrap(), ExchangeOutcome::Idle);
}

#[tokio::test]
async fn a_new_append_preempts_the_in_flight_exchange() {
    let transport = ScriptedTransport::new(vec![
        ScriptedResponse::stream(&[r#"0:"partial""#]).stalled(),
        ScriptedResponse::stream(&[r#"0:"second answer""#, FINISH_STOP]),
    ]);
    let session = session_with(transport.clone(), options(), Handlers::default());
    let handle = session.handle();
    let mut rx = session.subscribe();
    let server = tokio::spawn(session.serve());

    handle
        .append(Message::user("first"), RequestOptions::default())
        .unwrap();
    wait_for(&mut rx, |event| {
        matches!(event, SessionEvent::MessageUpserted { message, .. } if message.content() == "partial")
    })
    .await;
    handle
        .append(Message::user("second"), RequestOptions::default())
        .unwrap();
    wait_for(&mut rx, |event| matches!(event, SessionEvent::Finished { .. })).await;
    drop(handle);

    let session = server.await.unwrap();
    assert_eq!(transport.requests().len(), 2);
    let contents: Vec<_> = session.messages().iter().map(Message::content).collect();
    assert_eq!(contents, vec!["first", "partial", "second", "second answer"]);
    assert_eq!(session.status(), SessionStatus::Ready);
}

#[tokio::test]
async fn handles_report_a_closed_session() {
    let transport = ScriptedTransport::new(vec![]);
    let session = session_with(transport, options(), Handlers::default());
    let handle = session.handle();
    drop(session);
    assert!(handle.is_closed());
    assert_eq!(handle.stop(), Err(SessionClosed));
}
