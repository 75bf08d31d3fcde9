use std::net::TcpListener;
use std::process;
use std::sync::Arc;

use clap::Parser;

use chord::cli::Cli;
use chord::identifier::Md5HashSource;
use chord::node::{server, LocalNode};

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.to_config();

    let listener = match TcpListener::bind(config.listener_bind) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("cannot bind local listener on {}: {}", config.listener_bind, err);
            process::exit(1);
        }
    };

    let tasks = server::spawn_worker_pool(cli.worker_threads);
    let local = Arc::new(LocalNode::new(cli.public_addr(), Arc::new(Md5HashSource), config, tasks.clone()));

    log::info!("node {} listening on {}", local.identifier(), local.listener_addr());

    if let Some(remote_addr) = cli.remote_addr() {
        if let Err(err) = local.join(remote_addr) {
            eprintln!("failed to join the ring through {}: {}", remote_addr, err);
            process::exit(1);
        }
        log::info!("joined the ring through {}", remote_addr);
    }

    server::spawn_tickers(Arc::clone(&local));
    server::run_accept_loop(local, listener, tasks);
}
