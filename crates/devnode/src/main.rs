//! Local development node: runs one snapshot round trip against in-memory
//! collaborators and logs every step.

use std::time::Duration;

use anyhow::{Context, bail};

use snapvault_core::JobStatus;
use snapvault_infra::backend::InMemoryBackend;
use snapvault_infra::log_store::{
    InMemoryLogConnector, InMemoryLogStore, LogStore, ReplicationNetwork,
};
use snapvault_infra::{Orchestrator, OrchestratorConfig};

const ENV_ENTRIES: &str = "SNAPVAULT_DEVNODE_ENTRIES";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    snapvault_observability::init();

    let config = OrchestratorConfig::from_env().context("reading configuration")?;
    let entries: usize = match std::env::var(ENV_ENTRIES) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{ENV_ENTRIES} must be a number, got '{v}'"))?,
        Err(_) => 10,
    };

    let backend = InMemoryBackend::new().with_funding_after(2, 4_000_000);
    let network = ReplicationNetwork::new();
    let connector = InMemoryLogConnector::new("devnode", network.clone());
    let app = InMemoryLogStore::new("app", network);

    let orchestrator = Orchestrator::create(config, &backend, &connector)
        .await
        .context("starting orchestrator")?;
    let wallet = orchestrator.wallet_ready().await.context("funding wallet")?;
    tracing::info!(address = %wallet.addr, balance = wallet.balance, "wallet ready");

    let db = app.create("devnode-events").await?;
    for i in 0..entries {
        db.append(serde_json::json!(format!("entry{i}"))).await?;
    }
    let address = db.address().clone();

    let record = orchestrator
        .store_snapshot(&address)
        .await
        .context("storing snapshot")?;
    tracing::info!(job_id = %record.id, cid = %record.cid, status = %record.status, "snapshot stored");
    db.drop_local().await?;

    backend.set_job_status(&record.id, JobStatus::Success)?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    let status = orchestrator.get_job_status(&record.id).await?;
    tracing::info!(job_id = %record.id, records = ?status, "job status after reconciliation");

    let restored = app.open(&address).await?;
    let snapshots = orchestrator
        .retrieve_snapshot(&address)
        .await
        .context("retrieving snapshot")?;
    let Some(snapshot) = snapshots.first() else {
        bail!("no snapshot stored for {address}");
    };
    let joined = restored.join(&snapshot.log).await?;
    tracing::info!(db_address = %address, entries = joined, "database restored from snapshot");

    orchestrator.stop().await?;
    Ok(())
}
