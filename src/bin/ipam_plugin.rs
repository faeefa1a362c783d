//! CNI IPAM plugin: forwards ADD/DEL to the ipamd daemon.
//!
//! Reads the network configuration from stdin and the container identity from
//! `CNI_*` variables. Prints the CNI result (ADD) or version info (VERSION) on
//! stdout; on failure prints a CNI error object and exits with status 1.

use color_eyre::Result;
use env_logger::{Env, Target};
use ipamd::plugin::{self, PluginEnv};
use log::error;
use std::io::{self, Read};

fn main() -> Result<()> {
    color_eyre::install()?;

    // stdout belongs to the runtime
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .target(Target::Stderr)
        .init();

    let env = PluginEnv::from_env();
    let mut stdin = String::new();
    let outcome = match io::stdin().read_to_string(&mut stdin) {
        Ok(_) => plugin::run(&env, &stdin),
        Err(e) => Err(e.into()),
    };

    match outcome {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            Ok(())
        }
        Err(e) => {
            error!("{} failed: {}", env.command, e);
            let cni_error = e.to_cni_error(&plugin::error_version(&stdin));
            println!("{}", serde_json::to_string(&cni_error)?);
            std::process::exit(1);
        }
    }
}
