use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};

use tradepost_auth::{DirectoryFixture, InMemoryDirectory, InMemorySessionStore};
use tradepost_identity::{IdentityConfig, IdentityResolver, MemoryStorage};

/// Resolve one account from a fixture file and print the published identity.
///
/// Usage: `tradepost-identity <fixture.json> <email> <password>`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tradepost_observability::init();

    let mut args = std::env::args().skip(1);
    let (Some(fixture_path), Some(email), Some(password)) = (args.next(), args.next(), args.next())
    else {
        bail!("usage: tradepost-identity <fixture.json> <email> <password>");
    };

    let config = IdentityConfig::load().context("failed to load configuration")?;
    let fixture_path = PathBuf::from(fixture_path);
    let raw = std::fs::read_to_string(&fixture_path)
        .with_context(|| format!("failed to read {}", fixture_path.display()))?;
    let fixture: DirectoryFixture = serde_json::from_str(&raw)
        .with_context(|| format!("invalid fixture {}", fixture_path.display()))?;

    let resolver = IdentityResolver::new(
        Arc::new(InMemorySessionStore::from_fixture(&fixture)),
        Arc::new(InMemoryDirectory::from_fixture(&fixture)),
        Arc::new(MemoryStorage::new()),
        config,
    );

    let cold_start = resolver.initialize().await;
    tracing::info!(?cold_start, "cold start settled");
    let worker = resolver.start();

    resolver
        .sign_in(&email, &password)
        .await
        .context("sign-in failed")?;

    let snapshot = serde_json::to_string_pretty(&resolver.snapshot())?;
    println!("{snapshot}");

    resolver.sign_out().await;
    resolver.shutdown();
    worker.await.context("session worker panicked")?;
    Ok(())
}
