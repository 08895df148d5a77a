pub mod audio_sink;
pub mod config;
pub mod demod_runtime;
pub mod modetable;
pub mod net;
pub mod receiver;

use std::sync::Arc;

use config::Config;
use proto::rtp::PacketQueue;
use receiver::Receiver;

/// Builds the receiver from `config` and runs its network edges until
/// shutdown. Split out of `main` so integration tests can drive the same
/// entry point the binary uses.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<()> {
    let queue = Arc::new(PacketQueue::new());
    let receiver = Arc::new(Receiver::new(config.clone(), queue.clone())?);
    net::run(config, receiver, queue).await
}
