//! Vaultmesh rebalancing service
//!
//! Runs the controller, one vault per configured chain and the HTTP API.

use vaultmesh_rails::main_entry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    main_entry::run_server().await
}
