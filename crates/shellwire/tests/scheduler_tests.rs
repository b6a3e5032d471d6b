mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Harness, cancelled, data, done, end, error, next_request, started};
use serde_json::{Value, json};
use shellwire::bus::{self, signals};
use shellwire::protocol::catalog::{BackendInformationResult, GetBackendInformation};
use shellwire::protocol::PromptReply;
use shellwire::{ConnectionPhase, RequestDetails, ResponsePayload, SchedulerError};

#[tokio::test]
async fn test_end_to_end_single_result() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move {
        scheduler
            .send_request(RequestDetails::execute("X").with_request_id("r1"))
            .await
    });

    let (id, frame) = next_request(&mut peer).await;
    assert_eq!(id, "r1");
    assert_eq!(frame["request"], "execute");
    assert_eq!(frame["command"], "X");

    peer.send_json(&started("r1"));
    peer.send_json(&done("r1", Some(json!({"value": 42}))));

    let result = call.await.unwrap().unwrap();
    assert_eq!(result, ResponsePayload::Single(json!({"value": 42})));
    assert!(!h.scheduler.has_pending("r1"));

    // A late duplicate is dropped and the socket keeps working.
    peer.send_json(&done("r1", Some(json!({"value": 43}))));
    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move { scheduler.send_request(RequestDetails::execute("Y")).await });
    let (id, _) = next_request(&mut peer).await;
    peer.send_json(&done(&id, Some(json!("ok"))));
    assert_eq!(call.await.unwrap().unwrap(), ResponsePayload::Single(json!("ok")));
    assert_eq!(h.scheduler.pending_count(), 0);
}

#[tokio::test]
async fn test_end_to_end_multi_result() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move {
        scheduler
            .send_request(RequestDetails::execute("X").with_request_id("r1").multi_result(true))
            .await
    });

    next_request(&mut peer).await;
    peer.send_json(&started("r1"));
    peer.send_json(&done("r1", Some(json!({"value": 42}))));

    let result = call.await.unwrap().unwrap();
    assert_eq!(result, ResponsePayload::List(vec![json!({"value": 42})]));
    assert_eq!(h.scheduler.pending_count(), 0);
}

#[tokio::test]
async fn test_generated_ids_are_distinct() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let calls: Vec<_> = (0..16)
        .map(|_| {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move { scheduler.send_request(RequestDetails::execute("X")).await })
        })
        .collect();

    let mut ids = HashSet::new();
    for _ in 0..calls.len() {
        let (id, _) = next_request(&mut peer).await;
        assert!(ids.insert(id));
    }
    assert_eq!(h.scheduler.pending_count(), 16);

    for id in &ids {
        peer.send_json(&done(id, Some(json!(id))));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_interleaved_responses_reach_their_own_request() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let a = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .send_request(RequestDetails::execute("A").with_request_id("a").multi_result(true))
                .await
        })
    };
    next_request(&mut peer).await;
    let b = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .send_request(RequestDetails::execute("B").with_request_id("b").multi_result(true))
                .await
        })
    };
    next_request(&mut peer).await;

    peer.send_json(&data("b", json!("b1")));
    peer.send_json(&data("a", json!("a1")));
    peer.send_json(&data("b", json!("b2")));
    peer.send_json(&error("a", "boom"));
    peer.send_json(&done("b", None));

    match a.await.unwrap() {
        Err(SchedulerError::Response(err)) => {
            assert_eq!(err.request_id, "a");
            assert_eq!(err.message, "boom");
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(
        b.await.unwrap().unwrap(),
        ResponsePayload::List(vec![json!("b1"), json!("b2")])
    );
}

#[tokio::test]
async fn test_multi_result_accumulates_in_order() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move {
        scheduler
            .send_request(RequestDetails::execute("gui.core.list_files"))
            .await
    });
    let (id, _) = next_request(&mut peer).await;

    peer.send_json(&started(&id));
    for i in 1..=3 {
        peer.send_json(&data(&id, json!({"name": format!("file{i}")})));
    }
    peer.send_json(&done(&id, None));

    assert_eq!(
        call.await.unwrap().unwrap(),
        ResponsePayload::List(vec![
            json!({"name": "file1"}),
            json!({"name": "file2"}),
            json!({"name": "file3"}),
        ])
    );
}

#[tokio::test]
async fn test_single_result_takes_first_accumulated() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move { scheduler.send_request(RequestDetails::execute("X")).await });
    let (id, _) = next_request(&mut peer).await;

    peer.send_json(&data(&id, json!("first")));
    peer.send_json(&data(&id, json!("second")));
    peer.send_json(&done(&id, None));

    assert_eq!(call.await.unwrap().unwrap(), ResponsePayload::Single(json!("first")));
}

#[tokio::test]
async fn test_single_result_end_resolves_immediately() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move { scheduler.send_request(RequestDetails::execute("X")).await });
    let (id, _) = next_request(&mut peer).await;

    peer.send_json(&end(&id, json!({"info": 1})));
    assert_eq!(call.await.unwrap().unwrap(), ResponsePayload::Single(json!({"info": 1})));

    // The record lives until the final frame.
    assert!(h.scheduler.has_pending(&id));
    peer.send_json(&done(&id, None));
    tokio::task::yield_now().await;
}

#[tokio::test]
async fn test_multi_result_spans_end_frames() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move {
        scheduler
            .send_request(RequestDetails::execute("X").multi_result(true))
            .await
    });
    let (id, _) = next_request(&mut peer).await;

    peer.send_json(&end(&id, json!(1)));
    peer.send_json(&end(&id, json!(2)));
    peer.send_json(&done(&id, Some(json!(3))));

    assert_eq!(
        call.await.unwrap().unwrap(),
        ResponsePayload::List(vec![json!(1), json!(2), json!(3)])
    );
}

#[tokio::test]
async fn test_data_callback_receives_intermediate_results() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move {
        scheduler
            .send_request(
                RequestDetails::execute("gui.sqleditor.execute")
                    .on_data(move |payload, id| sink.lock().unwrap().push((payload, id.to_string()))),
            )
            .await
    });
    let (id, _) = next_request(&mut peer).await;

    peer.send_json(&data(&id, json!({"total_row_count": 1})));
    peer.send_json(&data(&id, json!({"total_row_count": 2})));
    peer.send_json(&done(&id, None));

    assert_eq!(call.await.unwrap().unwrap(), ResponsePayload::List(Vec::new()));
    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            (json!({"totalRowCount": 1}), id.clone()),
            (json!({"totalRowCount": 2}), id.clone()),
        ]
    );
}

#[tokio::test]
async fn test_casing_round_trip_keeps_exceptions_verbatim() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let params = json!({
        "dbConnectionId": 7,
        "sqlOptions": {"maxRows": 10},
        "rows": [{"someColumn": 1}],
    });
    let scheduler = h.scheduler.clone();
    let details = RequestDetails::execute("X").with_parameters(params.clone());
    let call = tokio::spawn(async move { scheduler.send_request(details).await });

    let (id, frame) = next_request(&mut peer).await;
    assert_eq!(frame["db_connection_id"], 7);
    assert_eq!(frame["sql_options"], json!({"max_rows": 10}));
    assert_eq!(frame["rows"], json!([{"someColumn": 1}]));

    // Echo the parameters back as the result.
    let mut echoed = frame.clone();
    for key in ["request", "command", "request_id"] {
        echoed.as_object_mut().unwrap().remove(key);
    }
    peer.send_json(&done(&id, Some(echoed)));

    assert_eq!(call.await.unwrap().unwrap(), ResponsePayload::Single(params));
}

#[tokio::test]
async fn test_parameters_must_be_an_object() {
    let h = Harness::new();
    let err = h
        .scheduler
        .send_request(RequestDetails::execute("X").with_parameters(json!([1, 2])))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_error_response_carries_message_and_code() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move { scheduler.send_request(RequestDetails::execute("X")).await });
    let (id, _) = next_request(&mut peer).await;

    peer.send_json(&json!({
        "request_id": id,
        "request_state": {"type": "ERROR", "msg": "Access denied", "code": 1045},
        "error_details": {"sql_state": "28000"},
    }));

    let Err(SchedulerError::Response(err)) = call.await.unwrap() else {
        panic!("expected a response error");
    };
    assert_eq!(err.message, "Access denied");
    assert_eq!(err.code, Some(1045));
    assert_eq!(err.data["errorDetails"]["sqlState"], "28000");
    assert_eq!(h.scheduler.pending_count(), 0);
}

#[tokio::test]
async fn test_cancel_request_resolves_with_empty_list() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move {
        scheduler
            .send_request(RequestDetails::execute("gui.sqleditor.execute"))
            .await
    });
    let (id, _) = next_request(&mut peer).await;
    peer.send_json(&data(&id, json!({"rows": [[1]]})));

    h.scheduler.cancel_request(&id).await.unwrap();
    let (cancel_id, frame) = next_request(&mut peer).await;
    assert_eq!(cancel_id, id);
    assert_eq!(frame["request"], "cancel");

    peer.send_json(&cancelled(&id));
    assert_eq!(call.await.unwrap().unwrap(), ResponsePayload::List(Vec::new()));
}

#[tokio::test]
async fn test_prompt_reply_reuses_request_id() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let reply = PromptReply {
        reply_type: "OK".to_string(),
        reply: "secret".to_string(),
        module_session_id: Some("m1".to_string()),
    };
    h.scheduler.prompt_reply("p1", &reply).await.unwrap();

    let (id, frame) = next_request(&mut peer).await;
    assert_eq!(id, "p1");
    assert_eq!(frame["request"], "prompt_reply");
    assert_eq!(frame["type"], "OK");
    assert_eq!(frame["reply"], "secret");
    assert_eq!(frame["module_session_id"], "m1");
}

#[tokio::test]
async fn test_typed_request_uses_declared_shapes() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move { scheduler.send::<GetBackendInformation>(Default::default()).await });
    let (id, frame) = next_request(&mut peer).await;
    assert_eq!(frame["command"], "gui.core.get_backend_information");

    peer.send_json(&done(
        &id,
        Some(json!({"info": {"architecture": "x86_64", "major": "1", "minor": "19", "patch": "2", "platform": "Linux", "server_distribution": "mysqlsh"}})),
    ));
    let result: BackendInformationResult = call.await.unwrap().unwrap();
    assert_eq!(result.info.major, "1");
    assert_eq!(result.info.platform, "Linux");
}

#[tokio::test]
async fn test_duplicate_request_id_is_rejected() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;

    let scheduler = h.scheduler.clone();
    let first = tokio::spawn(async move {
        scheduler
            .send_request(RequestDetails::execute("X").with_request_id("dup"))
            .await
    });
    next_request(&mut peer).await;

    let err = h
        .scheduler
        .send_request(RequestDetails::execute("X").with_request_id("dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::DuplicateRequestId(id) if id == "dup"));

    peer.send_json(&done("dup", None));
    assert_eq!(first.await.unwrap().unwrap(), ResponsePayload::Single(Value::Null));
}

#[tokio::test]
async fn test_orphan_frames_are_ignored() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;
    let mut errors = h.record(signals::SHOW_ERROR);

    for frame in [
        done("nobody", Some(json!(1))),
        data("nobody", json!(2)),
        error("nobody", "late"),
        cancelled("nobody"),
        json!({"request_id": "nobody", "request_state": {"type": "WEIRD", "msg": ""}}),
    ] {
        peer.send_json(&frame);
    }

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move { scheduler.send_request(RequestDetails::execute("X")).await });
    let (id, _) = next_request(&mut peer).await;
    peer.send_json(&done(&id, Some(json!("fine"))));
    assert_eq!(call.await.unwrap().unwrap(), ResponsePayload::Single(json!("fine")));

    assert_eq!(h.scheduler.pending_count(), 0);
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_malformed_frame_reports_error_and_keeps_going() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;
    let mut errors = h.record(signals::SHOW_ERROR);

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move { scheduler.send_request(RequestDetails::execute("X")).await });
    let (id, _) = next_request(&mut peer).await;

    peer.send("{not json");
    let payload = errors.recv().await.unwrap();
    assert!(payload[1].as_str().unwrap().contains("Could not parse JSON"));

    peer.send_json(&done(&id, Some(json!(1))));
    assert_eq!(call.await.unwrap().unwrap(), ResponsePayload::Single(json!(1)));
}

#[tokio::test]
async fn test_session_start_is_published() {
    let mut h = Harness::new();
    let mut sessions = h.record(signals::WEB_SESSION_STARTED);
    let peer = h.connect().await;

    peer.send_json(&json!({
        "request_state": {"type": "OK", "msg": "A new session has been created"},
        "request_id": "s1",
        "session_uuid": "abc-123",
        "local_user_mode": true,
        "active_profile": {"id": 1, "name": "Default", "rows": {"keep_me": 1}},
    }));

    let payload = sessions.recv().await.unwrap();
    assert_eq!(payload["sessionUuid"], "abc-123");
    assert_eq!(payload["localUserMode"], true);
    assert_eq!(payload["activeProfile"]["rows"], json!({"keep_me": 1}));

    let session = h.scheduler.web_session().await.unwrap();
    assert_eq!(session.session_uuid, "abc-123");
    assert!(session.local_user_mode);
}

#[tokio::test]
async fn test_socket_state_is_announced() {
    let mut h = Harness::new();
    let mut states = h.record(signals::SOCKET_STATE_CHANGED);

    let mut peer = h.connect().await;
    // Connect resolves after the announcement.
    assert_eq!(states.try_recv().unwrap(), json!(true));
    assert!(h.scheduler.is_connected().await);

    h.scheduler.set_debugging(true);
    peer.close();
    assert_eq!(states.recv().await.unwrap(), json!(false));
    assert_eq!(h.scheduler.phase().await, ConnectionPhase::Disconnected);
    assert!(!h.scheduler.reconnect_pending().await);
    assert!(h.scheduler.web_session().await.is_none());
}

#[tokio::test]
async fn test_state_subscribers_see_an_open_socket() {
    let mut h = Harness::new();
    let (tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
    let scheduler = h.scheduler.clone();
    h.hub.register(
        signals::SOCKET_STATE_CHANGED,
        bus::callback(move |payload| {
            let scheduler = scheduler.clone();
            let tx = tx.clone();
            async move {
                if payload == json!(true) {
                    let connected = scheduler.is_connected().await;
                    let again = scheduler.connect(&Harness::target()).await;
                    let _ = tx.send((connected, again.is_ok()));
                }
                Ok(true)
            }
        }),
    );

    let outcome = tokio::time::timeout(Duration::from_secs(2), h.scheduler.connect(&Harness::target())).await;
    assert!(matches!(outcome, Ok(Ok(()))));
    assert_eq!(seen.try_recv().unwrap(), (true, true));
    assert_eq!(h.transport.attempt_count(), 1);
    h.server.accept().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_connects_share_one_socket() {
    let mut h = Harness::new();
    let target = Harness::target();

    let (a, b) = tokio::join!(h.scheduler.connect(&target), h.scheduler.connect(&target));
    a.unwrap();
    b.unwrap();
    assert_eq!(h.transport.attempt_count(), 1);

    h.scheduler.connect(&target).await.unwrap();
    assert_eq!(h.transport.attempt_count(), 1);

    let peer = h.server.accept().await.unwrap();
    assert_eq!(peer.url.as_str(), "ws://localhost:8000/ws1.ws");
}

#[tokio::test]
async fn test_failed_connect_rejects() {
    let h = Harness::new();
    h.transport.reject_next(1);
    let err = h.scheduler.connect(&Harness::target()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Transport(_)));
    assert_eq!(h.scheduler.phase().await, ConnectionPhase::Disconnected);
    // A first connect is not retried automatically.
    assert!(!h.scheduler.reconnect_pending().await);
}

#[tokio::test(start_paused = true)]
async fn test_send_after_disconnect_is_silent() {
    let mut h = Harness::new();
    let mut states = h.record(signals::SOCKET_STATE_CHANGED);
    let mut peer = h.connect().await;
    assert_eq!(states.recv().await.unwrap(), json!(true));

    h.scheduler.disconnect().await;
    assert_eq!(states.recv().await.unwrap(), json!(false));
    assert!(peer.recv().await.is_none());
    assert!(!h.scheduler.reconnect_pending().await);

    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        h.scheduler.send_request(RequestDetails::execute("X").with_request_id("lost")),
    )
    .await;
    assert!(outcome.is_err());
    assert!(h.scheduler.has_pending("lost"));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_and_resets() {
    let mut h = Harness::new();
    let mut infos = h.record(signals::SHOW_INFO);
    let mut peer = h.connect().await;

    h.transport.reject_next(3);
    peer.close();

    // One scheduled attempt at the base interval, then three doublings.
    h.transport.wait_for_attempts(5).await;
    let mut peer = h.server.accept().await.unwrap();
    let attempts = h.transport.attempts();
    let gaps: Vec<_> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
        ]
    );

    let info = infos.recv().await.unwrap();
    assert_eq!(info[0], "Connection Recovering");
    assert_eq!(h.scheduler.reconnect_delay().await, Duration::from_secs(1));
    assert!(h.scheduler.is_connected().await);

    // After recovery the next failure waits base * 2 again.
    h.transport.reject_next(1);
    peer.close();
    h.transport.wait_for_attempts(7).await;
    let attempts = h.transport.attempts();
    assert_eq!(attempts[5] - attempts[4], Duration::from_secs(1));
    assert_eq!(attempts[6] - attempts[5], Duration::from_secs(2));
    h.server.accept().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_capped() {
    let config = shellwire::SchedulerConfig {
        reconnect_max: Duration::from_secs(3),
        ..Default::default()
    };
    let mut h = Harness::with_config(config);
    let mut peer = h.connect().await;

    h.transport.reject_next(3);
    peer.close();
    h.transport.wait_for_attempts(5).await;
    h.server.accept().await.unwrap();

    let attempts = h.transport.attempts();
    let gaps: Vec<_> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_secs(3),
        ]
    );
}

#[tokio::test]
async fn test_trace_mirrors_traffic() {
    let mut h = Harness::new();
    let mut traces = h.record(signals::DEBUGGER);
    let mut peer = h.connect().await;
    h.scheduler.set_trace_enabled(true);

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move { scheduler.send_request(RequestDetails::execute("X")).await });
    let (id, frame) = next_request(&mut peer).await;
    assert_eq!(traces.recv().await.unwrap(), json!({"request": frame}));

    let response = done(&id, None);
    peer.send_json(&response);
    call.await.unwrap().unwrap();
    assert_eq!(traces.recv().await.unwrap(), json!({"response": response}));
}

#[tokio::test]
async fn test_raw_request_skips_case_conversion() {
    let mut h = Harness::new();
    let mut peer = h.connect().await;
    let mut events = h.dispatcher.subscribe(shellwire::Subscription::all().persistent());

    let scheduler = h.scheduler.clone();
    let call = tokio::spawn(async move {
        scheduler
            .send_raw_request(json!({"request": "execute", "command": "X", "someKey": 1}), None)
            .await
    });
    let (id, frame) = next_request(&mut peer).await;
    assert_eq!(frame["someKey"], 1);

    let request_event = events.next_event().await.unwrap();
    assert_eq!(request_event.event_type, shellwire::EventType::Request);
    assert_eq!(request_event.id.as_deref(), Some(id.as_str()));

    peer.send_json(&done(&id, Some(json!({"row_count": 1}))));
    assert_eq!(
        call.await.unwrap().unwrap(),
        ResponsePayload::Single(json!({"row_count": 1}))
    );

    let response_event = events.next_event().await.unwrap();
    assert_eq!(response_event.event_type, shellwire::EventType::FinalResponse);
    assert_eq!(response_event.data["result"], json!({"rowCount": 1}));
}
