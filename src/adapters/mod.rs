use std::sync::Arc;

use tracing::warn;

use crate::config::AppConfig;

pub mod encrypt;
pub mod process;
pub mod simulated;

pub use encrypt::{CommandEncryptor, Encryptor, NoopEncryptor};
pub use process::{DisabledProbe, ProcessProbe};
pub use simulated::{SimulatedEncryptor, SimulatedProbe, SimulatedProbeController};

pub fn build_encryptor(config: &AppConfig) -> Arc<dyn Encryptor> {
    if config.simulation {
        return Arc::new(SimulatedEncryptor::new());
    }
    match &config.encrypt_command {
        Some(program) => Arc::new(CommandEncryptor::new(program.clone())),
        None => Arc::new(NoopEncryptor),
    }
}

pub fn build_probe(config: &AppConfig) -> Arc<dyn ProcessProbe> {
    if config.simulation {
        let (probe, controller) = SimulatedProbe::new(config.business_processes.clone());

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines().map_while(Result::ok) {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some("start"), Some(name)) => controller.start_process(name),
                    (Some("stop"), _) => controller.stop_process(),
                    _ => println!("(Simulator) Use: 'start <process>' or 'stop'"),
                }
            }
        });

        return Arc::new(probe);
    }

    if !config.business_processes.is_empty() {
        warn!(
            processes = ?config.business_processes,
            "business process watching is only available in simulation mode"
        );
    }
    Arc::new(DisabledProbe)
}
