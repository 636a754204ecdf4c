mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use tower::ServiceExt;

use common::{at, Harness};
use site_publisher::db;
use site_publisher::flags::{EMAILS_FOR_PUBLISHES, EMAILS_FOR_SCHEDULED_PUBLISHES};
use site_publisher::model::{BuildStatus, ReportedStatus, ResourceType};
use site_publisher::publish;
use site_publisher::scheduler;
use site_publisher::webhook::{self, WebhookState, SECRET_HEADER};

const T0: &str = "2024-06-01T09:00:00Z";

/// Schedule `resource_id` for `user_id` at T0 and run the tick that builds it.
async fn scheduled_build(h: &Harness, resource_id: i64, user_id: i64) {
    db::schedule_resource(h.pool(), resource_id, at(T0), user_id)
        .await
        .unwrap();
    scheduler::run_tick(&h.ctx, at(T0)).await.unwrap();
}

#[tokio::test]
async fn succeeded_build_sends_one_success_email() {
    let h = Harness::new().await;
    let alice = h.user(Some("alice@example.com")).await;
    let site = h.site("alpha").await;
    let r1 = h.page(site, "Home").await;
    scheduled_build(&h, r1, alice).await;

    let summary = webhook::reconcile_build_status(&h.ctx, "build-1", BuildStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.notified, 1);
    assert_eq!(summary.failed, 0);

    let successes = h.notifier.successes().await;
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].recipient_email, "alice@example.com");
    assert!(successes[0].is_scheduled);
    assert_eq!(successes[0].resource.id, r1);
    assert_eq!(successes[0].resource.title, "Home");

    let builds = db::fetch_builds_for_site(h.pool(), site).await.unwrap();
    assert_eq!(builds[0].status, BuildStatus::Succeeded);
    assert!(builds[0].email_sent);

    // redelivery updates the status again but sends nothing
    let summary = webhook::reconcile_build_status(&h.ctx, "build-1", BuildStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.notified, 0);
    assert_eq!(h.notifier.successes().await.len(), 1);
}

#[tokio::test]
async fn failed_build_sends_failure_email() {
    let h = Harness::new().await;
    let alice = h.user(Some("alice@example.com")).await;
    let site = h.site("alpha").await;
    let r1 = h.page(site, "Home").await;
    scheduled_build(&h, r1, alice).await;

    webhook::reconcile_build_status(&h.ctx, "build-1", BuildStatus::Failed)
        .await
        .unwrap();

    assert!(h.notifier.successes().await.is_empty());
    let failures = h.notifier.failures().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].resource.id, r1);
}

#[tokio::test]
async fn intermediate_and_abnormal_statuses_are_stored_silently() {
    let h = Harness::new().await;
    let alice = h.user(Some("alice@example.com")).await;
    let site = h.site("alpha").await;
    let r1 = h.page(site, "Home").await;
    scheduled_build(&h, r1, alice).await;

    for status in [
        BuildStatus::InProgress,
        BuildStatus::Fault,
        BuildStatus::TimedOut,
        BuildStatus::Stopped,
    ] {
        let summary = webhook::reconcile_build_status(&h.ctx, "build-1", status)
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.notified, 0);
        let builds = db::fetch_builds_for_site(h.pool(), site).await.unwrap();
        assert_eq!(builds[0].status, status);
        assert!(!builds[0].email_sent);
    }
    assert!(h.notifier.successes().await.is_empty());
    assert!(h.notifier.failures().await.is_empty());

    // a later terminal status still notifies
    webhook::reconcile_build_status(&h.ctx, "build-1", BuildStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(h.notifier.successes().await.len(), 1);
}

#[tokio::test]
async fn superseded_rows_settle_with_their_successor() {
    let h = Harness::new().await;
    let alice = h.user(Some("alice@example.com")).await;
    let bob = h.user(Some("bob@example.com")).await;
    let site = h.site("alpha").await;
    let r1 = h.page(site, "One").await;
    let r2 = h.page(site, "Two").await;

    publish::publish_now(&h.ctx, r1, alice).await.unwrap();
    publish::publish_now(&h.ctx, r2, bob).await.unwrap();

    let summary = webhook::reconcile_build_status(&h.ctx, "build-2", BuildStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(summary.updated, 2);
    assert_eq!(summary.notified, 2);

    let builds = db::fetch_builds_for_site(h.pool(), site).await.unwrap();
    assert!(builds
        .iter()
        .all(|b| b.status == BuildStatus::Succeeded && b.email_sent));

    let mut recipients: Vec<String> = h
        .notifier
        .successes()
        .await
        .into_iter()
        .map(|n| {
            assert!(!n.is_scheduled);
            n.recipient_email
        })
        .collect();
    recipients.sort();
    assert_eq!(recipients, vec!["alice@example.com", "bob@example.com"]);

    // the superseded build's own late callback touches only its own row
    let summary = webhook::reconcile_build_status(&h.ctx, "build-1", BuildStatus::Stopped)
        .await
        .unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.notified, 0);
}

#[tokio::test]
async fn rejected_notification_is_retried_on_redelivery() {
    let h = Harness::new().await;
    let alice = h.user(Some("alice@example.com")).await;
    let site = h.site("alpha").await;
    let r1 = h.page(site, "One").await;
    let r2 = h.page(site, "Two").await;
    db::schedule_resource(h.pool(), r1, at(T0), alice).await.unwrap();
    db::schedule_resource(h.pool(), r2, at(T0), alice).await.unwrap();
    scheduler::run_tick(&h.ctx, at(T0)).await.unwrap();
    h.notifier.reject(r1).await;

    let summary = webhook::reconcile_build_status(&h.ctx, "build-1", BuildStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(summary.notified, 1);
    assert_eq!(summary.failed, 1);

    let builds = db::fetch_builds_for_site(h.pool(), site).await.unwrap();
    let sent: Vec<(i64, bool)> = builds.iter().map(|b| (b.resource_id, b.email_sent)).collect();
    assert_eq!(sent, vec![(r1, false), (r2, true)]);

    h.notifier.accept(r1).await;
    let summary = webhook::reconcile_build_status(&h.ctx, "build-1", BuildStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(summary.notified, 1);
    assert_eq!(summary.failed, 0);

    let ids: Vec<i64> = h
        .notifier
        .successes()
        .await
        .iter()
        .map(|n| n.resource.id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&r1) && ids.contains(&r2));
}

#[tokio::test]
async fn only_pages_with_reachable_users_are_notified() {
    let h = Harness::new().await;
    let alice = h.user(Some("alice@example.com")).await;
    let silent = h.user(None).await;
    let site = h.site("alpha").await;
    let page = h.page(site, "Page").await;
    let folder = h.resource(site, "Folder", ResourceType::Folder).await;
    let root = h.resource(site, "Root", ResourceType::RootPage).await;
    let quiet = h.page(site, "Quiet").await;
    for id in [page, folder, root] {
        db::schedule_resource(h.pool(), id, at(T0), alice).await.unwrap();
    }
    db::schedule_resource(h.pool(), quiet, at(T0), silent)
        .await
        .unwrap();
    scheduler::run_tick(&h.ctx, at(T0)).await.unwrap();

    let summary = webhook::reconcile_build_status(&h.ctx, "build-1", BuildStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(summary.updated, 4);
    assert_eq!(summary.notified, 1);

    let successes = h.notifier.successes().await;
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].resource.id, page);
}

#[tokio::test]
async fn flags_gate_scheduled_and_direct_publishes_independently() {
    let h = Harness::new().await;
    h.flags.set(EMAILS_FOR_PUBLISHES, false);
    let alice = h.user(Some("alice@example.com")).await;
    let site = h.site("alpha").await;
    let scheduled = h.page(site, "Scheduled").await;
    let direct = h.page(site, "Direct").await;

    publish::publish_now(&h.ctx, direct, alice).await.unwrap();
    scheduled_build(&h, scheduled, alice).await;

    // build-2 superseded build-1, so one callback covers both rows
    webhook::reconcile_build_status(&h.ctx, "build-2", BuildStatus::Succeeded)
        .await
        .unwrap();

    let successes = h.notifier.successes().await;
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].resource.id, scheduled);

    // the gated row stays unsent and goes out once the flag is on
    let builds = db::fetch_builds_for_site(h.pool(), site).await.unwrap();
    let direct_row = builds.iter().find(|b| b.resource_id == direct).unwrap();
    assert!(!direct_row.email_sent);

    h.flags.set(EMAILS_FOR_PUBLISHES, true);
    h.flags.set(EMAILS_FOR_SCHEDULED_PUBLISHES, false);
    webhook::reconcile_build_status(&h.ctx, "build-2", BuildStatus::Succeeded)
        .await
        .unwrap();
    let ids: Vec<i64> = h
        .notifier
        .successes()
        .await
        .iter()
        .map(|n| n.resource.id)
        .collect();
    assert_eq!(ids, vec![scheduled, direct]);
}

#[tokio::test]
async fn unrecognised_status_is_stored_without_email() {
    let h = Harness::new().await;
    let alice = h.user(Some("alice@example.com")).await;
    let site = h.site("alpha").await;
    let r1 = h.page(site, "Home").await;
    scheduled_build(&h, r1, alice).await;
    let app = webhook::router(WebhookState {
        ctx: h.ctx.clone(),
        secret: None,
    });

    let res = app
        .clone()
        .oneshot(post_status(
            r#"{"buildId":"build-1","status":"QUEUED_FOR_REVIEW"}"#,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let builds = db::fetch_builds_for_site(h.pool(), site).await.unwrap();
    assert_eq!(
        builds[0].status,
        ReportedStatus::Other("QUEUED_FOR_REVIEW".into())
    );
    assert!(!builds[0].email_sent);
    assert!(h.notifier.successes().await.is_empty());
    assert!(h.notifier.failures().await.is_empty());

    // a later terminal status still settles the row
    webhook::reconcile_build_status(&h.ctx, "build-1", BuildStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(h.notifier.successes().await.len(), 1);
}

#[tokio::test]
async fn unknown_build_id_is_a_no_op() {
    let h = Harness::new().await;
    let summary = webhook::reconcile_build_status(&h.ctx, "never-started", BuildStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(summary, webhook::ReconcileSummary::default());
}

#[tokio::test]
async fn status_write_failure_is_an_error() {
    let h = Harness::new().await;
    sqlx::query("DROP TABLE code_build_jobs")
        .execute(h.pool())
        .await
        .unwrap();

    let result = webhook::reconcile_build_status(&h.ctx, "build-1", BuildStatus::Succeeded).await;
    assert!(result.is_err());
}

fn post_status(body: &str, secret: Option<&str>) -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri("/webhooks/builds")
        .header("content-type", "application/json");
    if let Some(secret) = secret {
        req = req.header(SECRET_HEADER, secret);
    }
    req.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn router_checks_secret_and_reconciles() {
    let h = Harness::new().await;
    let alice = h.user(Some("alice@example.com")).await;
    let site = h.site("alpha").await;
    let r1 = h.page(site, "Home").await;
    scheduled_build(&h, r1, alice).await;

    let app = webhook::router(WebhookState {
        ctx: h.ctx.clone(),
        secret: Some(Arc::from("s3cret")),
    });
    let body = r#"{"buildId":"build-1","status":"SUCCEEDED","projectName":"alpha-build"}"#;

    let res = app
        .clone()
        .oneshot(post_status(body, None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .clone()
        .oneshot(post_status(body, Some("wrong")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(h.notifier.successes().await.is_empty());

    // the secret is checked before the body is parsed
    let res = app
        .clone()
        .oneshot(post_status("not json", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(post_status(body, Some("s3cret")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    let summary: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(summary["updated"], 1);
    assert_eq!(summary["notified"], 1);
    assert_eq!(h.notifier.successes().await.len(), 1);
}

#[tokio::test]
async fn router_rejects_malformed_payload_and_serves_health() {
    let h = Harness::new().await;
    let app = webhook::router(WebhookState {
        ctx: h.ctx.clone(),
        secret: None,
    });

    let res = app
        .clone()
        .oneshot(post_status(r#"{"status":"SUCCEEDED"}"#, None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn router_reports_status_write_failure_as_500() {
    let h = Harness::new().await;
    sqlx::query("DROP TABLE code_build_jobs")
        .execute(h.pool())
        .await
        .unwrap();
    let app = webhook::router(WebhookState {
        ctx: h.ctx.clone(),
        secret: None,
    });

    let res = app
        .oneshot(post_status(
            r#"{"buildId":"build-1","status":"SUCCEEDED"}"#,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
