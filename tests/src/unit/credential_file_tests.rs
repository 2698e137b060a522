use crate::support::{session_with, test_runtime, user_json};
use parley_core::{Credential, CredentialFile, CredentialStore, SessionUpdate};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_partial_json(json!({ "username": "ada", "password": "hunter2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "issued",
            "refresh_token": "issued-refresh",
            "token_type": "bearer"
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .and(header("authorization", "Bearer issued"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_json("ada")))
        .mount(server)
        .await;
}

#[test]
fn sign_in_survives_restart() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let location = temp_dir.path().join("parley").join("credentials.json");

    runtime.block_on(async {
        let server = MockServer::start().await;
        mount_login(&server).await;

        let store = CredentialStore::persistent(CredentialFile::new(&location)).expect("store");
        let (session, mut updates) = session_with(&server, store);
        let user = session.sign_in("ada", "hunter2").await.expect("sign in");
        assert_eq!(user.username, "ada");
        assert!(matches!(updates.try_recv(), Ok(SessionUpdate::SignedIn)));

        let reopened = CredentialStore::persistent(CredentialFile::new(&location)).expect("reopen");
        let (restarted, _updates) = session_with(&server, reopened);
        assert!(restarted.is_signed_in());
        assert_eq!(restarted.current_user().await.expect("me").username, "ada");
    });
}

#[test]
fn sign_out_removes_stored_tokens() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let location = temp_dir.path().join("credentials.json");

    runtime.block_on(async {
        let server = MockServer::start().await;
        mount_login(&server).await;

        let store = CredentialStore::persistent(CredentialFile::new(&location)).expect("store");
        let (session, _updates) = session_with(&server, store);
        session.sign_in("ada", "hunter2").await.expect("sign in");
        assert!(location.exists());

        session.sign_out();
        assert!(!location.exists());
        let reopened = CredentialStore::persistent(CredentialFile::new(&location)).expect("reopen");
        assert!(!reopened.is_signed_in());
    });
}

#[test]
fn rejected_login_leaves_no_credentials() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let location = temp_dir.path().join("credentials.json");

    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({ "detail": "Incorrect username or password" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = CredentialStore::persistent(CredentialFile::new(&location)).expect("store");
        let (session, _updates) = session_with(&server, store);
        let err = session.sign_in("ada", "wrong").await.unwrap_err();
        assert_eq!(err.user_message(), "Incorrect username or password");
        assert!(!session.is_signed_in());
        assert!(!location.exists());
    });
}

#[test]
fn rejected_login_keeps_stored_session() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let location = temp_dir.path().join("credentials.json");
    CredentialFile::new(&location)
        .save(&Credential::new("stored", "stored-refresh"))
        .expect("seed credentials");

    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({ "detail": "Incorrect username or password" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = CredentialStore::persistent(CredentialFile::new(&location)).expect("store");
        let (session, _updates) = session_with(&server, store);
        session.sign_in("ada", "typo").await.unwrap_err();

        assert!(session.is_signed_in());
        let reopened = CredentialStore::persistent(CredentialFile::new(&location)).expect("reopen");
        assert_eq!(reopened.access_token().as_deref(), Some("stored"));

        let requests = server.received_requests().await.expect("recorded requests");
        assert!(requests
            .iter()
            .all(|request| request.headers.get("authorization").is_none()));
    });
}
