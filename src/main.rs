use clap::Parser;

use pairing_relay::config::Config;
use pairing_relay::server;
use pairing_relay::util::init_log;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_log();

    server::main(config).await
}
