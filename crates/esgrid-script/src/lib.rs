//! esgrid-script — boot scripts for master and worker nodes.
//!
//! The generated text is the contract with a provisioned node, so any
//! change to it is a compatibility change for running clusters.
//!
//! # Layout
//!
//! ```text
//! #!/bin/bash
//! {
//! set -x
//!   1. take hyperthread sibling CPUs offline
//!   2. patch the redis config (no snapshots, unix socket, worker: port 0)
//!   3. restart redis
//!   4. as the runtime user: git pull, activate env, run the role process
//! } >> <log file> 2>&1
//! ```
//!
//! The block has no `set -e`: a failing step does not stop the steps after
//! it, and the block's exit status is that of the last command.

mod template;

pub use esgrid_core::Role;
pub use template::{BootstrapProfile, ScriptParams, master_script, render, worker_script};
