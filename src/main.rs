use std::process::ExitCode;

use clap::Parser;
use log::error;

use dnsoverride::config::{Args, Settings};
use dnsoverride::proxy;

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .format_timestamp_millis()
        .init();

    let settings = match Settings::from_args(&args) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(proxy::run(settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("DNS proxy stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}
