// tests/updater_flow.rs

//! Upload, list, install and follow an installer through the updater service.

mod common;

use armnas::updater::{build_router, UpdaterState};
use axum::http::StatusCode;
use common::{eventually, get_request, json_body, json_request, multipart_request, Appliance};
use std::sync::Arc;
use tower::ServiceExt;

#[tokio::test]
async fn test_upload_list_install_and_follow_log() {
    let appliance = Appliance::new();
    let app = build_router(Arc::new(UpdaterState::new(appliance.store(), appliance.backups())));
    let script = common::installer_script(&appliance.path("armnas/VERSION"), "0.2.1");

    let response = app
        .clone()
        .oneshot(multipart_request("/upload", "armnas_0.2.1.run", script.as_bytes()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let package = json_body(response).await;
    assert_eq!(package["filename"], "armnas_0.2.1.run");
    assert_eq!(package["sha256"], armnas::hash::sha256(script.as_bytes()));
    assert_eq!(package["executable"], true);

    let listed = json_body(app.clone().oneshot(get_request("/downloads")).await.unwrap()).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/install",
            serde_json::json!({"filename": "armnas_0.2.1.run", "backup": "backup_pre_update_0.2.0_20240601_120000.tar.gz"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let receipt = json_body(response).await;
    assert_eq!(receipt["success"], true);

    let progress = eventually(50, || {
        let app = app.clone();
        async move {
            let progress = json_body(
                app.oneshot(get_request("/installs/armnas_0.2.1.run"))
                    .await
                    .unwrap(),
            )
            .await;
            (progress["state"] != "running").then_some(progress)
        }
    })
    .await
    .expect("installer did not finish");

    assert_eq!(progress["state"], "succeeded");
    assert_eq!(progress["exit_code"], 0);
    let tail: Vec<String> = serde_json::from_value(progress["log_tail"].clone()).unwrap();
    assert!(tail.iter().any(|l| l == "installer args: --auto"));
    assert!(tail
        .iter()
        .any(|l| l == "backup: backup_pre_update_0.2.0_20240601_120000.tar.gz"));
    assert_eq!(
        std::fs::read_to_string(appliance.path("armnas/VERSION")).unwrap().trim(),
        "0.2.1"
    );
}

#[tokio::test]
async fn test_partial_uploads_never_listed() {
    let appliance = Appliance::new();
    std::fs::create_dir_all(appliance.staging()).unwrap();
    std::fs::write(appliance.staging().join(".armnas_0.2.1.run.0123abcd.part"), b"half").unwrap();
    std::fs::write(appliance.staging().join("notes.txt"), b"not a package").unwrap();

    let app = build_router(Arc::new(UpdaterState::new(appliance.store(), appliance.backups())));
    let listed = json_body(app.oneshot(get_request("/downloads")).await.unwrap()).await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_upload_rejects_bad_names() {
    let appliance = Appliance::new();
    let app = build_router(Arc::new(UpdaterState::new(appliance.store(), appliance.backups())));

    for name in ["install.sh", "../armnas.run", ".hidden.run"] {
        let response = app
            .clone()
            .oneshot(multipart_request("/upload", name, b"#!/bin/sh\n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", name);
    }
    assert!(!appliance.staging().join("install.sh").exists());
}
