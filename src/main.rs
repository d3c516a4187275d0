//! # NSB Broker - Main Entry Point
//!
//! The broker daemon sits between applications and a discrete-event
//! network simulator: applications SEND payloads addressed to logical
//! node identifiers, the simulator FETCHes them, models their transit,
//! POSTs them back, and applications RECEIVE the delivered results.
//!
//! ## Startup Sequence
//!
//! 1. **Parse arguments**: configuration file path plus logging and
//!    endpoint overrides
//! 2. **Initialize logging**: structured logging with tracing (rolling
//!    file plus optional colorized stdout)
//! 3. **Load configuration**: system mode, simulator topology, payload
//!    store parameters
//! 4. **Bind and run**: accept client channels and dispatch verbs until
//!    an EXIT arrives
//!
//! ## Exit Status
//!
//! The process exits 0 after an EXIT-driven shutdown. A missing or
//! unparsable configuration file and a failed listen bind are fatal
//! bootstrap errors reported with a non-zero status.

use anyhow::Result;
use clap::Parser;
use nsb_broker::{Args, Broker, BrokerConfig, MemoryStore, StoreHandle};
use std::sync::Arc;
use tracing::info;

mod logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse first: the arguments control logging behavior.
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.quiet, args.log_file.as_deref())?;

    info!("Starting NSB broker {}", nsb_broker::VERSION);

    let mut config = BrokerConfig::load(&args.config)?;
    args.apply_overrides(&mut config);
    info!(
        "configuration: {} delivery, {} simulator, store {}",
        config.system_mode,
        config.simulator_mode,
        if config.use_store() { "enabled" } else { "disabled" }
    );

    // The store trait is the seam for an external key/value service; the
    // in-process backend serves deployments that colocate the store with
    // the broker.
    let store = if let Some(params) = &config.store {
        info!(
            "payload store indirection enabled ({}:{} db {})",
            params.address, params.port, params.number
        );
        Some(StoreHandle::new(Arc::new(MemoryStore::new())))
    } else {
        None
    };

    let broker = Broker::bind(config, store).await?;
    broker.run().await?;

    info!("NSB broker exited cleanly");
    Ok(())
}
