use std::process::ExitCode;
use std::sync::Arc;

use neutrond_chainstate::flatfiles::BlockFileStore;
use neutrond_chainstate::state::ChainState;
use neutrond_consensus::params::chain_params;
use neutrond_node::config::{self, NodeOptions};
use neutrond_node::process::{load_external_block_file, NodeState};
use neutrond_storage::fjall::FjallStore;

fn main() -> ExitCode {
    let options = match config::parse_args(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    neutrond_log::init(neutrond_log::LogConfig {
        level: options.log_level,
        format: options.log_format,
        timestamps: true,
    });

    match run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            neutrond_log::log_error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: NodeOptions) -> Result<(), String> {
    let params = chain_params(options.network);

    let db_path = options.data_dir.join("db");
    let blocks_path = options.data_dir.join("blocks");
    let store =
        Arc::new(FjallStore::open(&db_path).map_err(|err| format!("open store: {err}"))?);
    let blocks = BlockFileStore::new(&blocks_path, params.message_start)
        .map_err(|err| format!("open block files: {err}"))?;

    let mut chain = ChainState::new(store, blocks, params);
    chain
        .load_block_index()
        .map_err(|err| format!("load block index: {err}"))?;

    let import = options.import_file.clone();
    let state = NodeState::new(chain, options);

    if let Some(path) = import {
        let loaded = load_external_block_file(&state, &path)
            .map_err(|err| format!("import {}: {err}", path.display()))?;
        neutrond_log::log_info!("import finished: {loaded} new blocks");
    }

    let chain = state.chain.lock().expect("chain lock");
    match chain.tree().best_node() {
        Some(best) => neutrond_log::log_info!(
            "best block {} at height {}",
            neutrond_consensus::hash256_to_hex(&best.hash),
            best.height,
        ),
        None => neutrond_log::log_info!("no best block; index is empty"),
    }

    Ok(())
}
