//! OpenSSH interoperability tests.
//!
//! These tests need a real OpenSSH server and are `#[ignore]`d by default.
//!
//! ```bash
//! export KEEL_TEST_ADDR="127.0.0.1:22"
//! export KEEL_TEST_USER="testuser"
//! export KEEL_TEST_PASS="testpass"        # for the password test
//! export KEEL_TEST_KEY="$HOME/.ssh/id_ed25519"  # for the key test
//! cargo test --test openssh_interop -- --ignored --nocapture
//! ```

use keel_proto::ssh::{
    ClientConfig, Config, DisconnectReason, KeyAuth, PublicKey, SshClient,
};
use tokio::time::{timeout, Duration};

fn address() -> String {
    std::env::var("KEEL_TEST_ADDR").unwrap_or_else(|_| "127.0.0.1:22".to_string())
}

fn config() -> Config {
    Config::new(ClientConfig::default()).with_server_key_verifier(|key: &PublicKey| {
        println!("  Host key: {} {}", key.name(), key.fingerprint());
        true
    })
}

/// Version exchange and key exchange against a local sshd.
#[tokio::test]
#[ignore]
async fn test_connect_to_openssh() -> Result<(), Box<dyn std::error::Error>> {
    let address = address();
    println!("Connecting to {}...", address);

    let client = timeout(Duration::from_secs(10), SshClient::connect(&address, config())).await??;
    println!("  Negotiated: {:?}", client.negotiated());
    assert!(client.server_host_key().is_some());
    assert!(!client.session_id().is_empty());

    client
        .disconnect(DisconnectReason::ByApplication, "", "")
        .await?;
    Ok(())
}

/// Password authentication and a command round trip.
#[tokio::test]
#[ignore]
async fn test_password_auth_with_openssh() -> Result<(), Box<dyn std::error::Error>> {
    let (Ok(user), Ok(password)) = (std::env::var("KEEL_TEST_USER"), std::env::var("KEEL_TEST_PASS"))
    else {
        println!("Skipping: KEEL_TEST_USER / KEEL_TEST_PASS not set");
        return Ok(());
    };

    let client = SshClient::connect(&address(), config()).await?;
    assert!(client.authenticate_password(&user, &password).await?);

    let output = client.exec("echo hi").await?;
    assert_eq!(output.status, 0);
    assert_eq!(output.output, b"hi\n");

    let failing = client.exec("exit 3").await?;
    assert_eq!(failing.status, 3);

    client
        .disconnect(DisconnectReason::ByApplication, "bye", "en")
        .await?;
    Ok(())
}

/// Public key authentication with a key file.
#[tokio::test]
#[ignore]
async fn test_key_auth_with_openssh() -> Result<(), Box<dyn std::error::Error>> {
    let (Ok(user), Ok(key)) = (std::env::var("KEEL_TEST_USER"), std::env::var("KEEL_TEST_KEY"))
    else {
        println!("Skipping: KEEL_TEST_USER / KEEL_TEST_KEY not set");
        return Ok(());
    };

    let client = SshClient::connect(&address(), config()).await?;
    assert!(client.authenticate_key_pair(&user, KeyAuth::Path(key.into())).await?);

    let output = client.exec("head -c 300000 /dev/zero").await?;
    assert_eq!(output.output.len(), 300_000);

    client
        .disconnect(DisconnectReason::ByApplication, "", "")
        .await?;
    Ok(())
}
