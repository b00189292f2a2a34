//! FlagSync Rust SDK Lab
//!
//! Verification script for the synchronization engine, driven entirely by
//! `TestData` so it runs without a server.
//! Run with: cargo run --example sdk-lab

use flagsync::{
    ClientComponents, ConnectionState, FlagSyncClient, FlagSyncOptions, Identity,
    InMemoryStorage, TestData,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const PASS: &str = "\x1b[32m[PASS]\x1b[0m";
const FAIL: &str = "\x1b[31m[FAIL]\x1b[0m";
const TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() {
    println!("=== FlagSync Rust SDK Lab ===\n");

    let mut passed = 0;
    let mut failed = 0;

    macro_rules! pass {
        ($test:expr) => {{
            println!("{} {}", PASS, $test);
            passed += 1;
        }};
    }

    macro_rules! fail {
        ($test:expr) => {{
            println!("{} {}", FAIL, $test);
            failed += 1;
        }};
    }

    macro_rules! check {
        ($cond:expr, $test:expr) => {{
            if $cond {
                pass!($test);
            } else {
                fail!($test);
            }
        }};
    }

    let test_data = TestData::new();
    test_data.update(test_data.flag("lab-bool").value(true));
    test_data.update(
        test_data
            .flag("lab-theme")
            .value("dark")
            .value_for("lab-user-2", "light"),
    );
    test_data.set_value("lab-json", json!({"nested": true, "count": 100}));

    let storage = Arc::new(InMemoryStorage::new());
    let components = ClientComponents::default()
        .data_source_factory(Arc::new(test_data.clone()))
        .storage(storage.clone());

    // Test 1: Start
    println!("Testing start...");
    let client = match FlagSyncClient::with_components(
        FlagSyncOptions::new("mob-lab-test-key"),
        Identity::new("lab-user-1"),
        components,
    ) {
        Ok(c) => c,
        Err(e) => {
            fail!(format!("Client creation - {}", e));
            print_summary(passed, failed);
            std::process::exit(1);
        }
    };

    check!(client.start_with_timeout(TIMEOUT).await, "start()");
    check!(
        client.status().state == ConnectionState::Valid,
        "status is VALID after start"
    );

    // Test 2: Reads
    println!("\nTesting reads...");
    check!(
        client.current_value("lab-bool").and_then(|i| i.bool_value()) == Some(true),
        "Boolean flag"
    );
    check!(
        client.current_value("lab-theme").map(|i| i.value) == Some(json!("dark")),
        "String flag"
    );
    check!(
        client
            .current_value("lab-json")
            .map(|i| i.value["count"] == json!(100))
            .unwrap_or(false),
        "JSON flag"
    );
    check!(client.current_value("non-existent").is_none(), "Missing flag");
    check!(client.all_values().len() == 3, "all_values()");

    // Test 3: Live updates
    println!("\nTesting live updates...");
    let mut changes = client.change_events();
    test_data.set_value("lab-bool", false);
    match tokio::time::timeout(TIMEOUT, changes.recv()).await {
        Ok(Ok(change)) if change.key == "lab-bool" && change.new_value == json!(false) => {
            pass!("Change event");
        }
        other => fail!(format!("Change event - got {:?}", other)),
    }

    test_data.delete("lab-json");
    check!(client.current_value("lab-json").is_none(), "Delete");

    // Test 4: Offline mode
    println!("\nTesting offline mode...");
    check!(client.set_offline(true, TIMEOUT).await, "set_offline(true)");
    check!(
        client.status().state == ConnectionState::SetOffline,
        "status is SET_OFFLINE"
    );
    check!(test_data.source_count() == 0, "no data source while offline");
    check!(client.set_offline(false, TIMEOUT).await, "set_offline(false)");

    // Test 5: Identity switch
    println!("\nTesting identity switch...");
    check!(
        client
            .switch_identity(Identity::new("lab-user-2"), TIMEOUT)
            .await,
        "switch_identity()"
    );
    check!(
        client.current_value("lab-theme").map(|i| i.value) == Some(json!("light")),
        "per-identity value"
    );

    // Test 6: Cleanup
    println!("\nTesting cleanup...");
    client.close().await;
    check!(
        client.status().state == ConnectionState::Shutdown,
        "close()"
    );
    check!(!storage.is_empty(), "flags persisted");

    print_summary(passed, failed);

    if failed > 0 {
        println!("\n\x1b[31mSome verifications failed!\x1b[0m");
        std::process::exit(1);
    } else {
        println!("\n\x1b[32mAll verifications passed!\x1b[0m");
        std::process::exit(0);
    }
}

fn print_summary(passed: i32, failed: i32) {
    println!("\n{}", "=".repeat(40));
    println!("Results: {} passed, {} failed", passed, failed);
    println!("{}", "=".repeat(40));
}
