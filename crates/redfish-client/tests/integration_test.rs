//! Integration tests for the Redfish client
//!
//! These tests require a reachable BMC (or a Redfish emulator such as
//! sushy-tools). Set REDFISH_ADDRESS, REDFISH_USERNAME and REDFISH_PASSWORD.

use redfish_client::{RedfishClient, RedfishClientTrait};

fn client_from_env() -> RedfishClient {
    let address = std::env::var("REDFISH_ADDRESS")
        .unwrap_or_else(|_| "http://localhost:8000".to_string());
    let username = std::env::var("REDFISH_USERNAME").unwrap_or_else(|_| "admin".to_string());
    let password = std::env::var("REDFISH_PASSWORD")
        .expect("REDFISH_PASSWORD environment variable must be set");

    RedfishClient::new(&address, username, password, true).expect("Failed to create client")
}

#[tokio::test]
#[ignore] // Requires a Redfish endpoint
async fn test_get_system_info() {
    let client = client_from_env();
    let info = client.get_system_info().await.expect("Failed to read system");
    println!("System {} power={} cpus={:?}", info.id, info.power_state, info.cpu_count);
}

#[tokio::test]
#[ignore]
async fn test_power_state_matches_system_info() {
    let client = client_from_env();
    let state = client.get_power_state().await.expect("Failed to read power state");
    let info = client.get_system_info().await.expect("Failed to read system");
    assert_eq!(state, info.power_state);
}
