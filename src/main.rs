mod agent;
mod cli;
mod cmd;
mod config;
mod git;
mod logger;
mod naming;
mod pr;
mod prompt;
mod server;
mod task;
mod workflow;

use std::process::ExitCode;

use tracing::{error, info};

fn main() -> ExitCode {
    match cli::run() {
        Ok(code) => {
            info!(code, "ralphy finished");
            ExitCode::from(code.clamp(0, u8::MAX as i32) as u8)
        }
        Err(err) => {
            error!(error = ?err, "ralphy failed");
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
