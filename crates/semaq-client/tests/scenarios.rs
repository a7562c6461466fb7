//! End-to-end protocol scenarios against a scripted loopback server.
//!
//! Each test binds a real WebSocket server on an ephemeral port, replays a
//! scripted frame sequence and asserts the reconstructed client state:
//! transcript, authoritative stage board and terminal behavior.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use semaq_client::pipeline::StagePhase;
use semaq_client::transcript::Role;
use semaq_client::{ClientConfig, ClientEvent, ConsoleClient, SessionState, TaskOutcome};
use semaq_protocol::RunRequest;

type ServerSocket = WebSocketStream<TcpStream>;

async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let endpoint = format!("ws://{}", listener.local_addr().expect("local addr"));
    (listener, endpoint)
}

async fn accept_client(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.expect("accept");
    accept_async(stream).await.expect("handshake")
}

async fn send_frames(socket: &mut ServerSocket, frames: &[&str]) {
    for frame in frames {
        socket
            .send(Message::Text((*frame).into()))
            .await
            .expect("server send");
    }
}

async fn next_text(socket: &mut ServerSocket) -> String {
    loop {
        match socket.next().await.expect("client frame").expect("read") {
            Message::Text(text) => return text.to_string(),
            _ => continue,
        }
    }
}

async fn wait_for_finish(events: &mut broadcast::Receiver<ClientEvent>) -> TaskOutcome {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event stream closed") {
                ClientEvent::TaskFinished { outcome } => return outcome,
                _ => continue,
            }
        }
    })
    .await
    .expect("no terminal state within 5s")
}

async fn wait_for_status(events: &mut broadcast::Receiver<ClientEvent>, step: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event stream closed") {
                ClientEvent::StatusUpdated { step: Some(updated) } if updated == step => return,
                _ => continue,
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no status update for {step} within 5s"));
}

async fn wait_for_session_closed(events: &mut broadcast::Receiver<ClientEvent>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event stream closed") {
                ClientEvent::SessionChanged {
                    state: SessionState::Closed,
                } => return,
                _ => continue,
            }
        }
    })
    .await
    .expect("session never closed");
}

#[tokio::test]
async fn full_pipeline_run_reconstructs_transcript_and_board() {
    let (listener, endpoint) = bind_server().await;

    tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let request = next_text(&mut socket).await;
        assert!(request.contains("show revenue"));

        send_frames(
            &mut socket,
            &[
                r#"{"type":"prompt","step":"classifyJoy","content":"classify the question"}"#,
                r#"{"type":"thought","step":"classifyJoy","content":"question_type=metric"}"#,
                r#"{"type":"complete","content":"done","smq":{"metrics":["orders.count"]}}"#,
            ],
        )
        .await;
        // Hold the socket so nothing racing the assertions tears it down.
        let _ = socket.next().await;
    });

    let client = ConsoleClient::new(ClientConfig::for_endpoint(endpoint));
    let mut events = client.subscribe();
    client
        .submit(RunRequest::new("show revenue by region"))
        .await
        .expect("submit");

    assert_eq!(wait_for_finish(&mut events).await, TaskOutcome::Completed);

    let transcript = client.transcript();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    let turn = &transcript[1];
    assert!(turn.is_closed());
    assert_eq!(turn.role, Role::Assistant);
    assert_eq!(turn.content, "done");
    assert_eq!(
        turn.results.smq,
        Some(serde_json::json!({"metrics": ["orders.count"]}))
    );

    let statuses = client.stage_statuses();
    assert_eq!(statuses["classifyJoy"].phase, StagePhase::Complete);
    assert_eq!(
        statuses["classifyJoy"].result.as_deref(),
        Some("question_type=metric")
    );
    assert_eq!(statuses["complete"].phase, StagePhase::Complete);

    client.close().await;
}

#[tokio::test]
async fn trailing_deltas_after_success_are_suppressed() {
    let (listener, endpoint) = bind_server().await;

    tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let _ = next_text(&mut socket).await;
        send_frames(
            &mut socket,
            &[
                r#"{"type":"success","step":"respondent","content":"partial"}"#,
                r#"{"type":"delta","content":"ignored"}"#,
                r#"{"type":"delta","content":"ignored too"}"#,
                r#"{"type":"complete","content":"partial"}"#,
                r#"{"type":"delta","content":"after terminal"}"#,
            ],
        )
        .await;
        let _ = socket.next().await;
    });

    let client = ConsoleClient::new(ClientConfig::for_endpoint(endpoint));
    let mut events = client.subscribe();
    client.submit(RunRequest::new("q")).await.expect("submit");

    assert_eq!(wait_for_finish(&mut events).await, TaskOutcome::Completed);
    // Give the post-terminal delta a chance to arrive; it must be discarded.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let transcript = client.transcript();
    let turn = transcript.last().expect("assistant turn");
    assert_eq!(turn.content, "partial");

    client.close().await;
}

#[tokio::test]
async fn cancel_stops_routing_and_closes_the_turn() {
    let (listener, endpoint) = bind_server().await;

    tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let _ = next_text(&mut socket).await;
        send_frames(
            &mut socket,
            &[r#"{"type":"prompt","step":"manipulation","content":"build the SMQ"}"#],
        )
        .await;

        // Expect the cancel signal, then emit frames that must be dropped.
        let cancel = next_text(&mut socket).await;
        assert!(cancel.contains("cancel"));
        send_frames(
            &mut socket,
            &[
                r#"{"type":"cancelled","content":"task cancelled"}"#,
                r#"{"type":"thought","step":"manipulation","content":"late"}"#,
            ],
        )
        .await;
        let _ = socket.next().await;
    });

    let client = ConsoleClient::new(ClientConfig::for_endpoint(endpoint));
    let mut events = client.subscribe();
    client.submit(RunRequest::new("q")).await.expect("submit");
    wait_for_status(&mut events, "manipulation").await;

    // A second submission while the task runs is rejected.
    let busy = client.submit(RunRequest::new("another")).await;
    assert!(matches!(busy, Err(semaq_client::ClientError::Busy)));

    assert!(client.cancel().await);
    assert!(!client.is_running());

    let transcript = client.transcript();
    let turn = transcript.last().expect("turn");
    assert!(turn.is_closed());
    assert_eq!(turn.content, "Task was cancelled.");

    // Late frames for the cancelled task must not mutate state.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let statuses = client.stage_statuses();
    assert_eq!(statuses["manipulation"].phase, StagePhase::Running);
    assert_eq!(statuses["manipulation"].result, None);
    assert_eq!(client.transcript().len(), transcript.len());

    client.close().await;
}

#[tokio::test]
async fn silent_backend_hits_the_task_deadline() {
    let (listener, endpoint) = bind_server().await;

    tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let _ = next_text(&mut socket).await;
        send_frames(
            &mut socket,
            &[r#"{"type":"prompt","step":"executeQuery","content":"run it"}"#],
        )
        .await;
        // Then nothing: the client must synthesize the timeout.
        let _ = socket.next().await;
    });

    let mut config = ClientConfig::for_endpoint(endpoint);
    config.task_deadline = Duration::from_millis(300);
    let client = ConsoleClient::new(config);
    let mut events = client.subscribe();
    client.submit(RunRequest::new("q")).await.expect("submit");

    assert_eq!(wait_for_finish(&mut events).await, TaskOutcome::TimedOut);
    assert!(!client.is_running());

    let transcript = client.transcript();
    let turn = transcript.last().expect("turn");
    assert_eq!(turn.role, Role::Error);
    assert!(turn.content.contains("timed out"));

    let statuses = client.stage_statuses();
    assert_eq!(statuses["executeQuery"].phase, StagePhase::Error);

    client.close().await;
}

#[tokio::test]
async fn stage_error_fails_the_task_but_keeps_earlier_stages() {
    let (listener, endpoint) = bind_server().await;

    tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let _ = next_text(&mut socket).await;
        send_frames(
            &mut socket,
            &[
                r#"{"type":"prompt","step":"classifyJoy","content":"classify"}"#,
                r#"{"type":"thought","step":"classifyJoy","content":"metric"}"#,
                r#"{"type":"prompt","step":"smq2sql","content":"convert"}"#,
                r#"{"type":"error","step":"smq2sql","content":"unknown metric"}"#,
            ],
        )
        .await;
        let _ = socket.next().await;
    });

    let client = ConsoleClient::new(ClientConfig::for_endpoint(endpoint));
    let mut events = client.subscribe();
    client.submit(RunRequest::new("q")).await.expect("submit");

    assert_eq!(wait_for_finish(&mut events).await, TaskOutcome::Failed);

    let transcript = client.transcript();
    let turn = transcript.last().expect("turn");
    assert_eq!(turn.role, Role::Error);
    assert_eq!(turn.content, "Error: unknown metric");

    let statuses = client.stage_statuses();
    assert_eq!(statuses["classifyJoy"].phase, StagePhase::Complete);
    assert_eq!(statuses["smq2sql"].phase, StagePhase::Error);

    // The terminal failure must leave the client accepting new input.
    assert!(!client.is_running());

    client.close().await;
}

#[tokio::test]
async fn re_question_blocks_until_answered() {
    let (listener, endpoint) = bind_server().await;

    tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let _ = next_text(&mut socket).await;
        send_frames(
            &mut socket,
            &[
                r#"{"type":"prompt","step":"manipulation","content":"build"}"#,
                r#"{"type":"tool_call","step":"manipulation","tool":"HumanInTheLoop.reQuestion","args":{"reQuestionMessage":"which year?"}}"#,
            ],
        )
        .await;

        // The answer arrives as a normal message on the same session.
        let answer = next_text(&mut socket).await;
        assert!(answer.contains("2025"));
        send_frames(&mut socket, &[r#"{"type":"complete","content":"done"}"#]).await;
        let _ = socket.next().await;
    });

    let client = ConsoleClient::new(ClientConfig::for_endpoint(endpoint));
    let mut events = client.subscribe();
    client.submit(RunRequest::new("revenue")).await.expect("submit");
    wait_for_status(&mut events, "manipulation").await;

    // Poll until the re-question lands; tool calls track without emitting
    // a dedicated stage transition of their own step ordering.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !client.is_waiting_for_answer() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("re-question never arrived");

    // The answer is allowed through while waiting.
    client
        .submit(RunRequest::new("for 2025"))
        .await
        .expect("answer");
    assert!(!client.is_waiting_for_answer());

    assert_eq!(wait_for_finish(&mut events).await, TaskOutcome::Completed);
    let transcript = client.transcript();
    assert_eq!(transcript.last().expect("turn").content, "done");

    client.close().await;
}

#[tokio::test]
async fn a_fresh_session_is_opened_lazily_after_close() {
    let (listener, endpoint) = bind_server().await;

    tokio::spawn(async move {
        // First connection: serve one task, then drop the socket.
        let mut socket = accept_client(&listener).await;
        let _ = next_text(&mut socket).await;
        send_frames(&mut socket, &[r#"{"type":"complete","content":"first"}"#]).await;
        drop(socket);

        // Second connection: serve the retry.
        let mut socket = accept_client(&listener).await;
        let _ = next_text(&mut socket).await;
        send_frames(&mut socket, &[r#"{"type":"complete","content":"second"}"#]).await;
        let _ = socket.next().await;
    });

    let client = ConsoleClient::new(ClientConfig::for_endpoint(endpoint));
    let mut events = client.subscribe();

    client.submit(RunRequest::new("one")).await.expect("submit");
    assert_eq!(wait_for_finish(&mut events).await, TaskOutcome::Completed);
    wait_for_session_closed(&mut events).await;

    // No automatic reconnect happened; the next submit reopens on demand.
    client.submit(RunRequest::new("two")).await.expect("resubmit");
    assert_eq!(wait_for_finish(&mut events).await, TaskOutcome::Completed);

    let contents: Vec<String> = client
        .transcript()
        .iter()
        .filter(|turn| turn.role == Role::Assistant)
        .map(|turn| turn.content.clone())
        .collect();
    assert_eq!(contents, ["first", "second"]);

    client.close().await;
}
