mod cli;
mod config;
mod error;
mod gestures;
mod ipc;
mod landmarks;
mod logging;
mod orchestrator;
mod replay;
mod scroll;
mod source;
mod stabilizer;
mod velocity;

fn main() -> anyhow::Result<()> {
    logging::init();
    cli::run()
}
