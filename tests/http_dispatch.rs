use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use parley::{
    ColdStartConfig, DispatchConfig, HttpTransport, Reply, RequestDispatcher, SessionController,
    SessionEvent, SessionOptions, SessionState, StreamEvent, Submission,
};

fn ndjson_response(records: &[&str]) -> ResponseTemplate {
    let body: String = records
        .iter()
        .map(|answer| format!("{}\n", json!({ "answer": answer })))
        .collect();
    ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson")
}

fn dispatcher_for(server: &MockServer) -> RequestDispatcher {
    let config = DispatchConfig::new(Url::parse(&server.uri()).unwrap());
    RequestDispatcher::new(Arc::new(HttpTransport::new().unwrap()), config)
}

#[tokio::test]
async fn streams_ndjson_answer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({ "question": "What is net pay?" })))
        .respond_with(ndjson_response(&["Net", " pay", " is..."]))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&server);
    let Reply::Stream(mut stream) = dispatcher.send("What is net pay?").await.unwrap() else {
        panic!("expected a streamed answer");
    };
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        if let StreamEvent::Delta(delta) = event.unwrap() {
            text.push_str(&delta);
        }
    }
    assert_eq!(text, "Net pay is...");
    assert!(!dispatcher.is_busy());
}

#[tokio::test]
async fn buffers_json_answer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(
                json!({
                    "answer": "Net pay is gross pay minus deductions.",
                    "context_used": ["Net pay is the amount an employee takes home."]
                })
                .to_string(),
                "application/json",
            ),
        )
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&server);
    let Reply::Full(answer) = dispatcher.send("What is net pay?").await.unwrap() else {
        panic!("expected a buffered answer");
    };
    assert_eq!(answer.answer, "Net pay is gross pay minus deductions.");
    assert_eq!(answer.context_used.len(), 1);
}

#[tokio::test]
async fn base_url_path_prefix_is_kept() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ndjson_response(&["ok"]))
        .expect(1)
        .mount(&server)
        .await;

    let config = DispatchConfig::new(Url::parse(&format!("{}/api", server.uri())).unwrap());
    let dispatcher = RequestDispatcher::new(Arc::new(HttpTransport::new().unwrap()), config);
    assert!(matches!(
        dispatcher.send("hello").await.unwrap(),
        Reply::Stream(_)
    ));
}

#[tokio::test]
async fn service_unavailable_is_cold_start() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(
            ResponseTemplate::new(503)
                .insert_header("retry-after", "30")
                .set_body_string("Service Unavailable"),
        )
        .mount(&server)
        .await;

    let err = dispatcher_for(&server).send("hello").await.unwrap_err();
    assert!(err.is_cold_start());
    assert_eq!(err.status_code(), Some(503));
    assert_eq!(err.retry_after(), Some(30));
}

#[tokio::test]
async fn server_error_reports_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({ "detail": "Vector store missing" })),
        )
        .mount(&server)
        .await;

    let err = dispatcher_for(&server).send("hello").await.unwrap_err();
    assert!(!err.is_cold_start());
    assert_eq!(err.status_code(), Some(500));
    assert!(err.to_string().contains("Vector store missing"));
}

#[tokio::test]
async fn refused_connection() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = DispatchConfig::new(Url::parse(&format!("http://{addr}")).unwrap());
    let dispatcher = RequestDispatcher::new(Arc::new(HttpTransport::new().unwrap()), config);
    let err = dispatcher.send("hello").await.unwrap_err();
    assert!(err.is_connection());
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ndjson_response(&["too late"]).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let config = DispatchConfig::new(Url::parse(&server.uri()).unwrap())
        .with_timeout(Duration::from_millis(200));
    let dispatcher = RequestDispatcher::new(Arc::new(HttpTransport::new().unwrap()), config);
    let err = dispatcher.send("hello").await.unwrap_err();
    assert!(err.is_timeout());
    assert!(!dispatcher.is_busy());
}

#[tokio::test]
async fn session_retries_after_cold_start() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ndjson_response(&["Net pay", " is..."]))
        .mount(&server)
        .await;

    let options = SessionOptions::default().with_cold_start(ColdStartConfig {
        countdown_secs: 0,
        ..ColdStartConfig::default()
    });
    let mut session = SessionController::new(
        Arc::new(HttpTransport::new().unwrap()),
        DispatchConfig::new(Url::parse(&server.uri()).unwrap()),
        options,
    );
    assert_eq!(session.submit("What is net pay?"), Submission::Accepted);
    let mut events = Vec::new();
    while let Some(event) = session.step().await {
        events.push(event);
    }
    assert!(matches!(events[0], SessionEvent::Countdown(0)));
    assert!(matches!(events[1], SessionEvent::Retrying));
    assert_eq!(session.log().len(), 2);
    assert_eq!(session.log().last().unwrap().text, "Net pay is...");
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
