// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge
//
// Session behaviour against an in-memory controller: tag correlation,
// connection loss, keepalive and subscription routing.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use common::{FakeController, Reply, answer, button_push, fast_options, ok};
use leap_bridge::protocol::{ProjectDefinition, Response};
use leap_bridge::{LeapError, LinkState, Session, SessionEvent, SessionOptions};

fn session_on(controller: &Arc<FakeController>, options: SessionOptions) -> Session {
    Session::new(
        "0b1c2d3e",
        controller.connection(options.request_timeout),
        options,
    )
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_answers() {
    // Answers arrive in the reverse order of the requests.
    let controller = FakeController::new("ctrl", |req| {
        let url = req["Header"]["Url"].as_str().unwrap().to_string();
        let delay = match url.as_str() {
            "/area/1" => 60,
            "/area/2" => 30,
            _ => 0,
        };
        Reply::After(
            Duration::from_millis(delay),
            ok(req, "OneAreaDefinition", json!({ "Area": { "href": url } })),
        )
    });
    let session = session_on(&controller, fast_options());
    session.connect().await.unwrap();

    let (a, b, c) = tokio::join!(
        session.read("/area/1"),
        session.read("/area/2"),
        session.read("/area/3"),
    );
    for (resp, url) in [(a, "/area/1"), (b, "/area/2"), (c, "/area/3")] {
        let resp = resp.unwrap();
        assert_eq!(resp.url(), Some(url));
        assert_eq!(resp.body.as_ref().unwrap()["Area"]["href"], url);
    }
}

#[tokio::test]
async fn test_many_interleaved_requests() {
    let controller = FakeController::new("ctrl", |req| {
        let url = req["Header"]["Url"].as_str().unwrap().to_string();
        let n: u64 = url.trim_start_matches("/device/").parse().unwrap();
        Reply::After(
            Duration::from_millis((n * 7) % 23),
            ok(req, "OneDeviceDefinition", json!({ "Device": { "href": url } })),
        )
    });
    let session = session_on(&controller, fast_options());
    session.connect().await.unwrap();

    let mut tasks = Vec::new();
    for n in 0..20 {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            let href = format!("/device/{n}");
            let resp = session.read(&href).await.unwrap();
            assert_eq!(resp.body.unwrap()["Device"]["href"], href);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_typed_read() {
    let controller = FakeController::new("ctrl", |req| {
        Reply::Respond(ok(
            req,
            "OneProjectDefinition",
            json!({ "Project": { "Name": "Home", "ProductType": "Lutron HWQS Project" } }),
        ))
    });
    let session = session_on(&controller, fast_options());
    session.connect().await.unwrap();

    let project = session.project().await.unwrap();
    assert_eq!(
        project,
        ProjectDefinition {
            name: "Home".into(),
            product_type: "Lutron HWQS Project".into(),
        }
    );
}

#[tokio::test]
async fn test_exception_response_is_an_error() {
    let controller = FakeController::new("ctrl", |req| {
        Reply::Respond(answer(
            req,
            "404 Not Found",
            Some(("ExceptionDetail", json!({ "Message": "no such area" }))),
        ))
    });
    let session = session_on(&controller, fast_options());
    session.connect().await.unwrap();

    match session.read("/area/99").await {
        Err(LeapError::Exception { status, message }) => {
            assert_eq!(status.code, 404);
            assert_eq!(message, "no such area");
        }
        other => panic!("expected exception, got {other:?}"),
    }
}

#[tokio::test]
async fn test_garbled_status_fails_the_request_at_once() {
    let controller = FakeController::new("ctrl", |req| Reply::Respond(answer(req, "OK-ish", None)));
    let options = SessionOptions::builder()
        .request_timeout(Duration::from_secs(60))
        .build();
    let session = session_on(&controller, options);
    session.connect().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), session.read("/project"))
        .await
        .expect("request should not wait for its timeout")
        .unwrap_err();
    match err {
        LeapError::Exception { status, .. } => {
            assert_eq!(status.code, 0);
            assert_eq!(status.message, "OK-ish");
        }
        other => panic!("expected exception, got {other:?}"),
    }
}

#[tokio::test]
async fn test_hangup_fails_every_outstanding_request() {
    let controller = FakeController::new("ctrl", |req| {
        if req["Header"]["Url"] == "/hangup" {
            Reply::Hangup
        } else {
            Reply::Ignore
        }
    });
    let session = session_on(&controller, fast_options());
    session.connect().await.unwrap();
    let mut events = session.events();

    let waiting = {
        let session = session.clone();
        tokio::spawn(async move { session.read("/area").await })
    };
    controller
        .wait_until(|log| log.iter().any(|r| r["Header"]["Url"] == "/area"))
        .await;

    let hung = session.read("/hangup").await.unwrap_err();
    assert!(matches!(hung, LeapError::ConnectionLost), "{hung:?}");
    let waited = waiting.await.unwrap().unwrap_err();
    assert!(matches!(waited, LeapError::ConnectionLost), "{waited:?}");

    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::Disconnected
    ));
}

#[tokio::test]
async fn test_next_request_reopens_after_hangup() {
    let controller = FakeController::new("ctrl", |req| Reply::Respond(answer(req, "200 OK", None)));
    let session = session_on(&controller, fast_options());
    session.connect().await.unwrap();
    let mut events = session.events();

    controller.hangup();
    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::Disconnected
    ));

    session.ping().await.unwrap();
    assert_eq!(controller.connect_count(), 2);
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let controller = FakeController::new("ctrl", |_| Reply::Ignore);
    let options = SessionOptions::builder()
        .request_timeout(Duration::from_millis(50))
        .build();
    let session = session_on(&controller, options);
    session.connect().await.unwrap();

    let err = session.read("/project").await.unwrap_err();
    assert!(matches!(err, LeapError::RequestTimeout { .. }), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_pings_and_swallows_failures() {
    let pings = Arc::new(AtomicUsize::new(0));
    let seen = pings.clone();
    let controller = FakeController::new("ctrl", move |req| {
        if req["Header"]["Url"] == "/server/1/status/ping" {
            // The first ping is never answered.
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return Reply::Ignore;
            }
        }
        Reply::Respond(answer(req, "200 OK", None))
    });
    let session = session_on(&controller, SessionOptions::default());
    session.connect().await.unwrap();

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(pings.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(pings.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), LinkState::Ready);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(pings.load(Ordering::SeqCst), 2);
    assert_eq!(session.state(), LinkState::Ready);
    session.read("/project").await.unwrap();
}

#[tokio::test]
async fn test_subscription_receives_pushes_by_tag_and_url() {
    let controller = FakeController::new("ctrl", |req| Reply::Respond(answer(req, "200 OK", None)));
    let session = session_on(&controller, fast_options());
    session.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
    session
        .subscribe("/button/101/status/event", move |resp: &Response| {
            let _ = tx.send(resp.clone());
        })
        .await
        .unwrap();
    assert_eq!(session.subscription_count(), 1);

    // Tagged push, sent to a different url on purpose.
    let tag = controller
        .subscription_tag("/button/101/status/event")
        .unwrap();
    let mut tagged = button_push("/button/101", "Press");
    tagged["Header"]["ClientTag"] = json!(tag);
    tagged["Header"]["Url"] = json!("/button/101");
    controller.push(tagged);
    let first = rx.recv().await.unwrap();
    assert_eq!(first.tag(), Some(tag.as_str()));

    // Untagged push on the subscribed url.
    controller.push(button_push("/button/101", "Release"));
    let second = rx.recv().await.unwrap();
    assert_eq!(second.url(), Some("/button/101/status/event"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unclaimed_push_is_unsolicited() {
    let controller = FakeController::new("ctrl", |req| Reply::Respond(answer(req, "200 OK", None)));
    let session = session_on(&controller, fast_options());
    session.connect().await.unwrap();
    let mut events = session.events();

    controller.push(json!({
        "CommuniqueType": "UpdateResponse",
        "Header": {
            "Url": "/device/status/deviceheard",
            "MessageBodyType": "OneDeviceStatus",
        },
        "Body": { "DeviceStatus": { "DeviceHeard": { "SerialNumber": 1234, "DeviceType": "Pico2Button" } } }
    }));

    match events.recv().await.unwrap() {
        SessionEvent::Unsolicited(resp) => {
            assert_eq!(resp.url(), Some("/device/status/deviceheard"));
            assert_eq!(resp.message_body_type(), Some("OneDeviceStatus"));
        }
        other => panic!("expected unsolicited, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_subscribe_keeps_registration() {
    let controller = FakeController::new("ctrl", |req| {
        Reply::Respond(answer(req, "503 Service Unavailable", None))
    });
    let session = session_on(&controller, fast_options());
    session.connect().await.unwrap();

    let err = session
        .subscribe("/button/5/status/event", |_: &Response| {})
        .await
        .unwrap_err();
    assert!(matches!(err, LeapError::Exception { .. }));
    assert_eq!(session.subscription_count(), 1);
}

#[tokio::test]
async fn test_close_stops_the_session() {
    let controller = FakeController::new("ctrl", |req| Reply::Respond(answer(req, "200 OK", None)));
    let session = session_on(&controller, fast_options());
    session.connect().await.unwrap();
    assert_eq!(session.state(), LinkState::Ready);

    session.close().await;
    assert_eq!(session.state(), LinkState::Idle);
}
