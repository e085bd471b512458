use dotenv::dotenv;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tx_pipeline::config::env_vars;
use tx_pipeline::rpc::{BlockPoller, EthersProvider};
use tx_pipeline::wallet::{LocalWalletSigner, TxSigner};
use tx_pipeline::{PipelineConfig, TxPipeline};

const CHAIN_EVENT_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    let config = PipelineConfig::from_env()?;

    let rpc_url = std::env::var(env_vars::RPC_URL).map_err(|_| format!("{} not set", env_vars::RPC_URL))?;
    let provider = EthersProvider::new(&rpc_url)?;
    match provider.chain_id().await {
        Ok(chain_id) if chain_id != config.default_chain_id => log::warn!(
            "[Node] RPC reports chain {} but {} is {}",
            chain_id,
            env_vars::CHAIN_ID,
            config.default_chain_id
        ),
        Ok(chain_id) => log::info!("[Node] Connected to chain {}", chain_id),
        Err(e) => log::warn!("[Node] Could not query chain id: {}", e),
    }

    let signer = LocalWalletSigner::from_env()?;
    log::info!(
        "[Node] Signer initialized ({} mode): {:?}",
        signer.mode_name(),
        signer.address()
    );

    let pipeline = TxPipeline::new(config.clone(), Arc::new(provider.clone()), Arc::new(signer));

    let cancel = CancellationToken::new();
    let (chain_tx, chain_rx) = mpsc::channel(CHAIN_EVENT_BUFFER);

    let poller = BlockPoller::new(provider, config.poll_interval, config.sync_interval);
    let poll_task = tokio::spawn(poller.run(chain_tx, cancel.clone()));

    let monitor = pipeline.monitor.clone();
    let monitor_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor.run(chain_rx, cancel).await })
    };

    let (client_id, mut state_events) = pipeline.store.subscribe();
    let event_task = tokio::spawn(async move {
        while let Some(event) = state_events.recv().await {
            match event.tx_id() {
                Some(id) => log::info!("[Node] {} {}", event.name(), id),
                None => log::debug!("[Node] {}", event.name()),
            }
        }
    });

    log::info!("[Node] Running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    log::info!("[Node] Shutting down");

    cancel.cancel();
    let (poll_result, monitor_result) = tokio::join!(poll_task, monitor_task);
    if let Err(e) = poll_result {
        log::warn!("[Node] Block poller task failed: {}", e);
    }
    if let Err(e) = monitor_result {
        log::warn!("[Node] Monitor task failed: {}", e);
    }

    pipeline.store.unsubscribe(&client_id);
    event_task.abort();

    log::info!(
        "[Node] Stopped with {} transactions in the ledger",
        pipeline.store.len()
    );
    Ok(())
}
