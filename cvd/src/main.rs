//! Entry point for the `cvd` command-line driver.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cvd::config::CvdConfig;
use cvd::driver::{init_logging, parse_invocation, render_error, run};
use cvd::handlers::request_handlers;
use cvd::registry::HandlerRegistry;
use cvd::sequencer::CommandSequencer;
use cvd_instances::{HostToolLauncher, InstanceManager};
use tracing::warn;

/// Set `cancel` on the first SIGINT; exit on the second.
fn watch_interrupts(cancel: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new().name("cvd-signals".to_owned()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "interrupts will not be handled");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; finishing the current step");
                cancel.store(true, Ordering::SeqCst);
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to start the interrupt watcher");
    }
}

fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let env: BTreeMap<String, String> = std::env::vars().collect();

    let (options, request) = match parse_invocation(&argv, env.clone()) {
        Ok(parsed) => parsed,
        Err(e) => {
            init_logging(None);
            eprint!("{}", render_error(&e, None));
            std::process::exit(e.exit_code());
        }
    };
    init_logging(options.log_level);

    let config = CvdConfig::from_env();
    let launcher = HostToolLauncher::new(config.launcher_timeout);
    let manager = Arc::new(InstanceManager::from_layout(config.layout.clone(), config.lock_timeout, Box::new(launcher)));

    let cancel = Arc::new(AtomicBool::new(false));
    watch_interrupts(Arc::clone(&cancel));

    let sequencer = CommandSequencer::new(HandlerRegistry::new(request_handlers(&manager)), env).with_cancel_flag(cancel);
    let code = run(&sequencer, &request, &mut std::io::stdout().lock(), &mut std::io::stderr().lock());

    // Release instance locks before exiting.
    drop(sequencer);
    drop(manager);
    std::process::exit(code);
}
