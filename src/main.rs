//! Pi-cam-stream binary: capture frames and wait for one downstream client.

use std::error::Error;

use pi_cam_stream::app::{self, SETUP_FAILURE};
use pi_cam_stream::config::DEFAULT_LOG_DIRECTIVE;
use pi_cam_stream::{
    CaptureSession, Config, ConnectionGate, ShutdownSignals, SystemMapper, V4l2Manager,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("Error: {err}");
            std::process::exit(SETUP_FAILURE);
        }
    }
}

fn init_logging() {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = DEFAULT_LOG_DIRECTIVE.parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32, Box<dyn Error>> {
    let config = Config::default();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let _guard = runtime.enter();

    let mut signals = ShutdownSignals::register()?;
    let mut session = CaptureSession::new(V4l2Manager::new(), SystemMapper);
    let gate = ConnectionGate::new(config.port);

    Ok(runtime.block_on(app::run(
        &mut session,
        config.size,
        gate,
        signals.recv(),
    )))
}
