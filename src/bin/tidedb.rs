/*
 * tidedb is the tidedb server node. It takes configuration via a
 * configuration file and environment variables, then runs the durability
 * core: the write-ahead log manager and the consensus driver.
 */

#![warn(clippy::all)]

use tidedb::error::Result;
use tidedb::raft;
use tidedb::wal;
use tidedb::Config;

use std::sync::Arc;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/tidedb.yaml"),
        )
        .get_matches();
    let cfg = Config::load(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("tidedb");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let wal = wal::WalManager::new(cfg.wal_options()?);
    wal.start()?;

    let node = cfg.node()?;
    let state = raft::RaftState::new(
        node.clone(),
        cfg.members()?,
        Arc::new(raft::MemoryLog::new()),
        Arc::new(raft::SystemClock::new()),
    );
    let transport = Arc::new(raft::Channel::new());
    transport.register(&node, Arc::clone(&state))?;
    let driver = raft::Driver::spawn(state, transport, cfg.raft_options()?)?;

    // Run until killed; the driver thread never exits on its own.
    driver.join();
    wal.stop();
    Ok(())
}
